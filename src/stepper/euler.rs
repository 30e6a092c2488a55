//! Explicit Euler scheme.

use nalgebra::DVector;

use crate::model::Model;
use crate::stepper::{axpy, integrate_states, DynamicsFn, Stepper};

/// First-order explicit Euler: `x(t + dt) = x(t) + dt·f(t, x)`.
pub struct EulerExplicitStepper {
    models: Vec<Model>,
}

impl EulerExplicitStepper {
    /// Build for the given system models.
    #[must_use]
    pub fn new(models: Vec<Model>) -> Self {
        Self { models }
    }
}

impl Stepper for EulerExplicitStepper {
    fn try_step(
        &mut self,
        f: DynamicsFn<'_>,
        q: &mut Vec<DVector<f64>>,
        v: &mut Vec<DVector<f64>>,
        a: &mut Vec<DVector<f64>>,
        t: &mut f64,
        dt: &mut f64,
    ) -> bool {
        *q = integrate_states(&self.models, q, v, *dt);
        *v = axpy(v, a, *dt);
        *t += *dt;

        // Next state derivative.
        f(*t, q, v, a);

        // Fixed time step: let the engine clamp to the next breakpoint.
        *dt = f64::INFINITY;

        // The scheme never considers failure.
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::factories;
    use approx::assert_relative_eq;

    #[test]
    fn test_euler_constant_acceleration() {
        let model = factories::free_sphere("ball", 1.0, 0.1);
        let mut stepper = EulerExplicitStepper::new(vec![model.clone()]);
        let mut q = vec![model.neutral_configuration()];
        let mut v = vec![DVector::zeros(6)];
        let mut a = vec![DVector::zeros(6)];
        a[0][2] = -9.81;
        let mut t = 0.0;
        let mut dt = 1e-3;

        let mut dynamics = |_t: f64,
                            _q: &[DVector<f64>],
                            _v: &[DVector<f64>],
                            a: &mut Vec<DVector<f64>>| {
            a[0].fill(0.0);
            a[0][2] = -9.81;
        };
        assert!(stepper.try_step(&mut dynamics, &mut q, &mut v, &mut a, &mut t, &mut dt));
        assert_relative_eq!(t, 1e-3);
        assert!(dt.is_infinite());
        // Position unchanged to first order (zero initial velocity), velocity
        // picked up one gravity increment.
        assert_relative_eq!(q[0][2], 0.0, epsilon = 1e-12);
        assert_relative_eq!(v[0][2], -9.81e-3, epsilon = 1e-12);
    }
}
