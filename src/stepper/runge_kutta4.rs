//! Classical fourth-order Runge-Kutta scheme.

use nalgebra::DVector;

use crate::model::Model;
use crate::stepper::{axpy, integrate_states, DynamicsFn, Stepper};

/// Fixed-step 4-stage Runge-Kutta.
pub struct RungeKutta4Stepper {
    models: Vec<Model>,
}

impl RungeKutta4Stepper {
    /// Build for the given system models.
    #[must_use]
    pub fn new(models: Vec<Model>) -> Self {
        Self { models }
    }
}

impl Stepper for RungeKutta4Stepper {
    fn try_step(
        &mut self,
        f: DynamicsFn<'_>,
        q: &mut Vec<DVector<f64>>,
        v: &mut Vec<DVector<f64>>,
        a: &mut Vec<DVector<f64>>,
        t: &mut f64,
        dt: &mut f64,
    ) -> bool {
        let h = *dt;
        let half = 0.5 * h;

        // Stage derivatives: k1 is the derivative passed in.
        let (v1, a1) = (v.clone(), a.clone());

        let q2 = integrate_states(&self.models, q, &v1, half);
        let v2 = axpy(v, &a1, half);
        let mut a2 = a.clone();
        f(*t + half, &q2, &v2, &mut a2);

        let q3 = integrate_states(&self.models, q, &v2, half);
        let v3 = axpy(v, &a2, half);
        let mut a3 = a.clone();
        f(*t + half, &q3, &v3, &mut a3);

        let q4 = integrate_states(&self.models, q, &v3, h);
        let v4 = axpy(v, &a3, h);
        let mut a4 = a.clone();
        f(*t + h, &q4, &v4, &mut a4);

        // Weighted tangent increments.
        let v_mean: Vec<DVector<f64>> = v1
            .iter()
            .zip(&v2)
            .zip(v3.iter().zip(&v4))
            .map(|((k1, k2), (k3, k4))| (k1 + k2 * 2.0 + k3 * 2.0 + k4) / 6.0)
            .collect();
        let a_mean: Vec<DVector<f64>> = a1
            .iter()
            .zip(&a2)
            .zip(a3.iter().zip(&a4))
            .map(|((k1, k2), (k3, k4))| (k1 + k2 * 2.0 + k3 * 2.0 + k4) / 6.0)
            .collect();

        *q = integrate_states(&self.models, q, &v_mean, h);
        *v = axpy(v, &a_mean, h);
        *t += h;

        // Next state derivative.
        f(*t, q, v, a);

        *dt = f64::INFINITY;
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
    fn test_rk4_quadratic_exactness() {
        // Constant acceleration is integrated exactly by RK4.
        let model = factories::free_sphere("ball", 1.0, 0.1);
        let mut stepper = RungeKutta4Stepper::new(vec![model.clone()]);
        let mut q = vec![model.neutral_configuration()];
        let mut v = vec![DVector::zeros(6)];
        let mut a = vec![DVector::zeros(6)];
        a[0][2] = -9.81;
        let mut t = 0.0;
        let mut dt: f64 = 0.01;

        let mut dynamics = |_t: f64,
                            _q: &[DVector<f64>],
                            _v: &[DVector<f64>],
                            a: &mut Vec<DVector<f64>>| {
            a[0].fill(0.0);
            a[0][2] = -9.81;
        };
        for _ in 0..100 {
            let mut step = dt.min(0.01);
            assert!(stepper.try_step(
                &mut dynamics,
                &mut q,
                &mut v,
                &mut a,
                &mut t,
                &mut step
            ));
            dt = 0.01;
        }
        assert_relative_eq!(t, 1.0, epsilon = 1e-12);
        assert_relative_eq!(v[0][2], -9.81, epsilon = 1e-9);
        assert_relative_eq!(q[0][2], -0.5 * 9.81, epsilon = 1e-6);
    }
}
