//! Time-integration schemes over the multi-system state.
//!
//! Every stepper exposes a single `try_step` advancing `(q, v, a, t)` in
//! place and writing its recommended next step size into `dt` (infinite for
//! fixed-step schemes). The dynamics is an engine callable evaluated as
//! `a = f(t, q, v)`; the acceleration passed in is assumed to be the valid
//! derivative at the current time, which is what makes the first-same-as-last
//! optimization of the embedded scheme possible — and what forces the outer
//! loop to re-evaluate it after a dynamics discontinuity.
//!
//! The manifold structure of the configuration (free-flyer SE(3), spherical
//! SO(3)) is delegated to the kernel `integrate` operator; steppers never
//! touch raw position components.

pub mod dopri5;
pub mod euler;
pub mod runge_kutta4;

pub use dopri5::Dopri5Stepper;
pub use euler::EulerExplicitStepper;
pub use runge_kutta4::RungeKutta4Stepper;

use nalgebra::DVector;

use crate::model::{algorithms, Model};

/// Engine dynamics callable: fills `a` from `(t, q, v)`.
pub type DynamicsFn<'a> = &'a mut dyn FnMut(f64, &[DVector<f64>], &[DVector<f64>], &mut Vec<DVector<f64>>);

/// A time-integration scheme.
pub trait Stepper {
    /// Attempt one integration step of size `dt`.
    ///
    /// On success `q`, `v` and `a` hold the state and derivative at `t + dt`,
    /// `t` is advanced, and `dt` receives the recommended next step size.
    /// On failure the state is left untouched and `dt` receives the reduced
    /// step to retry with.
    fn try_step(
        &mut self,
        f: DynamicsFn<'_>,
        q: &mut Vec<DVector<f64>>,
        v: &mut Vec<DVector<f64>>,
        a: &mut Vec<DVector<f64>>,
        t: &mut f64,
        dt: &mut f64,
    ) -> bool;
}

/// Integrate every system configuration along its velocity for `dt`.
pub(crate) fn integrate_states(
    models: &[Model],
    q: &[DVector<f64>],
    v: &[DVector<f64>],
    dt: f64,
) -> Vec<DVector<f64>> {
    models
        .iter()
        .zip(q.iter().zip(v))
        .map(|(model, (q_i, v_i))| algorithms::integrate(model, q_i, &(v_i * dt)))
        .collect()
}

/// `x + y·scale` over per-system vectors.
pub(crate) fn axpy(x: &[DVector<f64>], y: &[DVector<f64>], scale: f64) -> Vec<DVector<f64>> {
    x.iter()
        .zip(y)
        .map(|(x_i, y_i)| x_i + y_i * scale)
        .collect()
}
