//! Embedded Dormand-Prince 5(4) scheme with step-size control.

use nalgebra::DVector;

use crate::model::Model;
use crate::stepper::{integrate_states, DynamicsFn, Stepper};

// Dormand-Prince tableau.
const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const A: [[f64; 6]; 6] = [
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
        0.0,
    ],
    [
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
];
// Fifth-order solution weights (row 7 of the extended tableau).
const B5: [f64; 7] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
    0.0,
];
// Embedded fourth-order weights.
const B4: [f64; 7] = [
    5179.0 / 57600.0,
    0.0,
    7571.0 / 16695.0,
    393.0 / 640.0,
    -92097.0 / 339200.0,
    187.0 / 2100.0,
    1.0 / 40.0,
];

const SAFETY: f64 = 0.9;
const FACTOR_MIN: f64 = 0.2;
const FACTOR_MAX: f64 = 5.0;

/// Dormand-Prince 5(4) adaptive stepper with the first-same-as-last
/// property: the derivative of the accepted state doubles as the first stage
/// of the following attempt.
pub struct Dopri5Stepper {
    models: Vec<Model>,
    tol_abs: f64,
    tol_rel: f64,
}

impl Dopri5Stepper {
    /// Build for the given system models and tolerances.
    #[must_use]
    pub fn new(models: Vec<Model>, tol_abs: f64, tol_rel: f64) -> Self {
        Self {
            models,
            tol_abs,
            tol_rel,
        }
    }

    /// Scaled sup-norm of the truncation error estimate.
    fn error_norm(
        &self,
        err_q: &[DVector<f64>],
        err_v: &[DVector<f64>],
        dq: &[DVector<f64>],
        v_new: &[DVector<f64>],
    ) -> f64 {
        let mut norm: f64 = 0.0;
        for sys in 0..err_q.len() {
            for i in 0..err_q[sys].len() {
                let scale = self.tol_abs + self.tol_rel * dq[sys][i].abs();
                norm = norm.max(err_q[sys][i].abs() / scale);
            }
            for i in 0..err_v[sys].len() {
                let scale = self.tol_abs + self.tol_rel * v_new[sys][i].abs();
                norm = norm.max(err_v[sys][i].abs() / scale);
            }
        }
        norm
    }
}

impl Stepper for Dopri5Stepper {
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
        let n_sys = q.len();

        // Stage derivatives; the first one is the caller-provided (v, a).
        let mut k_v: Vec<Vec<DVector<f64>>> = Vec::with_capacity(7);
        let mut k_a: Vec<Vec<DVector<f64>>> = Vec::with_capacity(7);
        k_v.push(v.clone());
        k_a.push(a.clone());

        for stage in 1..7 {
            // Tangent combination of the previous stages.
            let mut dq: Vec<DVector<f64>> =
                v.iter().map(|v_i| DVector::zeros(v_i.len())).collect();
            let mut dv: Vec<DVector<f64>> =
                v.iter().map(|v_i| DVector::zeros(v_i.len())).collect();
            let coeffs: &[f64] = if stage < 6 { &A[stage - 1] } else { &A[5] };
            for (j, coeff) in coeffs.iter().enumerate().take(stage) {
                if *coeff == 0.0 {
                    continue;
                }
                for sys in 0..n_sys {
                    dq[sys] += &k_v[j][sys] * *coeff;
                    dv[sys] += &k_a[j][sys] * *coeff;
                }
            }
            let q_stage = integrate_states(&self.models, q, &dq, h);
            let v_stage: Vec<DVector<f64>> = (0..n_sys)
                .map(|sys| &v[sys] + &dv[sys] * h)
                .collect();
            let mut a_stage = a.clone();
            f(*t + C[stage] * h, &q_stage, &v_stage, &mut a_stage);
            k_v.push(v_stage);
            k_a.push(a_stage);
        }

        // Fifth-order tangent increment and embedded error estimate.
        let mut dq5: Vec<DVector<f64>> = v.iter().map(|v_i| DVector::zeros(v_i.len())).collect();
        let mut dv5: Vec<DVector<f64>> = v.iter().map(|v_i| DVector::zeros(v_i.len())).collect();
        let mut err_q: Vec<DVector<f64>> = v.iter().map(|v_i| DVector::zeros(v_i.len())).collect();
        let mut err_v: Vec<DVector<f64>> = v.iter().map(|v_i| DVector::zeros(v_i.len())).collect();
        for stage in 0..7 {
            let db = B5[stage] - B4[stage];
            for sys in 0..n_sys {
                if B5[stage] != 0.0 {
                    dq5[sys] += &k_v[stage][sys] * B5[stage];
                    dv5[sys] += &k_a[stage][sys] * B5[stage];
                }
                if db != 0.0 {
                    err_q[sys] += &k_v[stage][sys] * (db * h);
                    err_v[sys] += &k_a[stage][sys] * (db * h);
                }
            }
        }

        let v_new: Vec<DVector<f64>> = (0..n_sys).map(|sys| &v[sys] + &dv5[sys] * h).collect();
        let dq_scaled: Vec<DVector<f64>> = dq5.iter().map(|d| d * h).collect();
        let error = self.error_norm(&err_q, &err_v, &dq_scaled, &v_new);

        if !error.is_finite() {
            *dt = f64::NAN;
            return false;
        }

        if error > 1.0 {
            // Reject: shrink and let the caller retry.
            let factor = (SAFETY * error.powf(-0.2)).clamp(FACTOR_MIN, 1.0);
            *dt = h * factor;
            return false;
        }

        // Accept. Stage 7 sits exactly at the accepted state, so its
        // derivative becomes both the returned acceleration and the first
        // stage of the next attempt.
        *q = integrate_states(&self.models, q, &dq5, h);
        *v = v_new;
        *a = k_a[6].clone();
        *t += h;

        let factor = if error <= f64::EPSILON {
            FACTOR_MAX
        } else {
            (SAFETY * error.powf(-0.2)).clamp(FACTOR_MIN, FACTOR_MAX)
        };
        *dt = h * factor;
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
    fn test_dopri_free_fall_accuracy() {
        let model = factories::free_sphere("ball", 1.0, 0.1);
        let mut stepper = Dopri5Stepper::new(vec![model.clone()], 1e-10, 1e-10);
        let mut q = vec![model.neutral_configuration()];
        let mut v = vec![DVector::zeros(6)];
        let mut a = vec![DVector::zeros(6)];
        a[0][2] = -9.81;
        let mut t = 0.0;

        let mut dynamics = |_t: f64,
                            _q: &[DVector<f64>],
                            _v: &[DVector<f64>],
                            a: &mut Vec<DVector<f64>>| {
            a[0].fill(0.0);
            a[0][2] = -9.81;
        };

        let mut dt: f64 = 1e-3;
        while t < 1.0 - 1e-12 {
            let mut step = dt.min(1.0 - t);
            let success =
                stepper.try_step(&mut dynamics, &mut q, &mut v, &mut a, &mut t, &mut step);
            assert!(success);
            dt = step.min(0.05);
        }
        assert_relative_eq!(v[0][2], -9.81, epsilon = 1e-8);
        assert_relative_eq!(q[0][2], -0.5 * 9.81, epsilon = 1e-7);
    }

    #[test]
    fn test_dopri_rejects_on_tight_tolerance() {
        // A stiff oscillator forced through a huge step must be rejected.
        let model = factories::n_link_pendulum(1, 1.0, 1.0);
        let mut stepper = Dopri5Stepper::new(vec![model.clone()], 1e-12, 1e-12);
        let mut q = vec![DVector::zeros(1)];
        q[0][0] = 1.0;
        let mut v = vec![DVector::zeros(1)];
        let mut a = vec![DVector::zeros(1)];
        a[0][0] = -9.81;
        let mut t = 0.0;
        let mut dt = 0.5;

        let mut dynamics = |_t: f64,
                            q: &[DVector<f64>],
                            _v: &[DVector<f64>],
                            a: &mut Vec<DVector<f64>>| {
            a[0][0] = -9.81 * q[0][0].sin();
        };
        let success = stepper.try_step(&mut dynamics, &mut q, &mut v, &mut a, &mut t, &mut dt);
        assert!(!success);
        assert!(dt < 0.5);
        assert_relative_eq!(t, 0.0);
        assert_relative_eq!(q[0][0], 1.0);
    }
}
