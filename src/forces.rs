//! External force registries: pairwise frame couplings (including the
//! viscoelastic builders), windowed impulse forces and sampled profile
//! forces.

use nalgebra::{DVector, Matrix3, Vector3, Vector6};

use crate::spatial::{exp3, jexp3, jlog3, log3, Force, Motion, Placement};

/// Kinematics of the two coupled frames, resolved by the engine right before
/// invoking a coupling functor: world placements and local-world-aligned
/// velocities.
#[derive(Debug, Clone, Copy)]
pub struct FramePair {
    /// World placement of the first frame.
    pub placement1: Placement,
    /// World placement of the second frame.
    pub placement2: Placement,
    /// Velocity of the first frame, world axes at the frame origin.
    pub velocity1: Motion,
    /// Velocity of the second frame, world axes at the frame origin.
    pub velocity2: Motion,
}

/// Coupling force law: `(t, q1, v1, q2, v2, frames) -> wrench` acting on the
/// first frame in world axes; the opposite wrench is transported onto the
/// second frame by the engine.
pub type CouplingForceFn =
    Box<dyn FnMut(f64, &DVector<f64>, &DVector<f64>, &DVector<f64>, &DVector<f64>, &FramePair) -> Force>;

/// Profile force law: `(t, q, v) -> wrench` in world axes at the frame.
pub type ProfileForceFn = Box<dyn FnMut(f64, &DVector<f64>, &DVector<f64>) -> Force>;

/// Pairwise frame-to-frame coupling force entry.
pub struct ForceCoupling {
    /// First system name.
    pub system_name1: String,
    /// First system index, renumbered on system removal.
    pub system_idx1: usize,
    /// Second system name.
    pub system_name2: String,
    /// Second system index, renumbered on system removal.
    pub system_idx2: usize,
    /// First frame name.
    pub frame_name1: String,
    /// First frame index, re-resolved at simulation start.
    pub frame_idx1: usize,
    /// Second frame name.
    pub frame_name2: String,
    /// Second frame index, re-resolved at simulation start.
    pub frame_idx2: usize,
    /// Coupling law.
    pub force_fn: CouplingForceFn,
}

/// Transient external force applied over the window `[t, t + dt)`.
pub struct ForceImpulse {
    /// Target frame name.
    pub frame_name: String,
    /// Target frame index, re-resolved at simulation start.
    pub frame_idx: usize,
    /// Window start time.
    pub t: f64,
    /// Window duration.
    pub dt: f64,
    /// Applied wrench, world axes at the frame.
    pub force: Force,
}

/// Time-sampled external force profile.
pub struct ForceProfile {
    /// Target frame name.
    pub frame_name: String,
    /// Target frame index, re-resolved at simulation start.
    pub frame_idx: usize,
    /// Sampling period; zero means continuous evaluation.
    pub update_period: f64,
    /// Force law.
    pub force_fn: ProfileForceFn,
    /// Last sampled wrench.
    pub force_prev: Force,
}

/// 6-D viscoelastic coupling between two frames.
///
/// The spring acts on the SE(3) error between the frames and the damper on
/// their relative velocity, the wrench application point being interpolated
/// between the two frame origins with ratio `alpha`. Returns the wrench
/// acting on the first frame.
#[must_use]
pub fn viscoelastic_coupling(
    stiffness: Vector6<f64>,
    damping: Vector6<f64>,
    alpha: f64,
) -> CouplingForceFn {
    let k_lin = Vector3::new(stiffness[0], stiffness[1], stiffness[2]);
    let k_ang = Vector3::new(stiffness[3], stiffness[4], stiffness[5]);
    let d_lin = Vector3::new(damping[0], damping[1], damping[2]);
    let d_ang = Vector3::new(damping[3], damping[4], damping[5]);
    Box::new(move |_t, _q1, _v1, _q2, _v2, frames| {
        let rot1 = frames.placement1.rotation;
        let rot2 = frames.placement2.rotation;

        let rot12 = rot1.inverse() * rot2;
        let (mut rot_log12, angle) = log3(&rot12);
        debug_assert!(
            angle < 0.95 * std::f64::consts::PI,
            "relative angle of viscoelastic coupling frames too large"
        );
        let rot_jlog12 = jlog3(angle, &rot_log12);
        let f_ang = k_ang.component_mul(&rot_log12);
        rot_log12 *= alpha;
        let rot_jexp12 = jexp3(&rot_log12);
        let rot_ref12 = rot1 * exp3(&rot_log12);

        let pos12 = frames.placement2.translation.vector - frames.placement1.translation.vector;
        let pos_local12 = rot_ref12.inverse() * pos12;
        let f_lin = k_lin.component_mul(&pos_local12);
        let omega: Matrix3<f64> = alpha * rot_jexp12 * rot_jlog12;

        // Relative velocity at the interpolated application point.
        let vel_lin_local = rot_ref12.inverse()
            * (frames.velocity2.linear - frames.velocity1.linear
                + pos12.cross(
                    &(alpha * frames.velocity1.angular
                        + (1.0 - alpha) * frames.velocity2.angular),
                ));
        let vel_ang_local =
            rot_ref12.inverse() * (frames.velocity2.angular - frames.velocity1.angular);

        // Wrench acting on the second frame.
        let mut lin = d_lin.component_mul(&vel_lin_local);
        let mut ang = (1.0 - alpha) * lin.cross(&pos_local12);
        ang += d_ang.component_mul(&vel_ang_local);
        lin += f_lin;
        lin = rot_ref12 * lin;
        ang = rot_ref12 * ang;

        // Moment corrections from the rotating application point and the
        // angular spring.
        let mut correction = Matrix3::zeros();
        for col in 0..3 {
            let omega_col = Vector3::new(omega[(0, col)], omega[(1, col)], omega[(2, col)]);
            let crossed = omega_col.cross(&pos_local12);
            for row in 0..3 {
                correction[(row, col)] = crossed[row];
            }
        }
        ang -= rot2 * (correction.transpose() * f_lin);
        ang += rot1 * (rot_jlog12 * f_ang);

        // Wrench acting on the first frame from action-reaction.
        ang += pos12.cross(&lin);

        Force::new(lin, ang)
    })
}

/// Scalar spring-damper along the line between two frames.
///
/// Falls back to a pure damper along the relative velocity when the frames
/// coincide and the direction is ill-defined.
#[must_use]
pub fn viscoelastic_directional_coupling(
    stiffness: f64,
    damping: f64,
    rest_length: f64,
) -> CouplingForceFn {
    Box::new(move |_t, _q1, _v1, _q2, _v2, frames| {
        let mut dir12 =
            frames.placement2.translation.vector - frames.placement1.translation.vector;
        let length = dir12.norm();
        let vel12 = frames.velocity2.linear - frames.velocity1.linear;
        if length > crate::constants::EPS {
            dir12 /= length;
            let vel12_proj = vel12.dot(&dir12);
            Force::new(
                (stiffness * (length - rest_length) + damping * vel12_proj) * dir12,
                Vector3::zeros(),
            )
        } else {
            Force::new(damping * vel12, Vector3::zeros())
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Translation3;

    fn static_pair(p1: Vector3<f64>, p2: Vector3<f64>) -> FramePair {
        let identity = nalgebra::UnitQuaternion::identity();
        FramePair {
            placement1: Placement::from_parts(Translation3::from(p1), identity),
            placement2: Placement::from_parts(Translation3::from(p2), identity),
            velocity1: Motion::zero(),
            velocity2: Motion::zero(),
        }
    }

    #[test]
    fn test_directional_coupling_pulls_towards_rest_length() {
        let mut law = viscoelastic_directional_coupling(100.0, 0.0, 1.0);
        let frames = static_pair(Vector3::zeros(), Vector3::new(2.0, 0.0, 0.0));
        let q = DVector::zeros(0);
        let f = law(0.0, &q, &q, &q, &q, &frames);
        // Stretched by 1 m: the force on frame 1 points towards frame 2.
        assert_relative_eq!(f.linear, Vector3::new(100.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_directional_coupling_damps_at_singularity() {
        let mut law = viscoelastic_directional_coupling(100.0, 10.0, 1.0);
        let mut frames = static_pair(Vector3::zeros(), Vector3::zeros());
        frames.velocity2 = Motion::new(Vector3::new(0.0, 1.0, 0.0), Vector3::zeros());
        let q = DVector::zeros(0);
        let f = law(0.0, &q, &q, &q, &q, &frames);
        assert_relative_eq!(f.linear, Vector3::new(0.0, 10.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_viscoelastic_coupling_restoring_translation() {
        let mut law = viscoelastic_coupling(
            Vector6::new(50.0, 50.0, 50.0, 5.0, 5.0, 5.0),
            Vector6::zeros(),
            0.5,
        );
        let frames = static_pair(Vector3::zeros(), Vector3::new(0.0, 0.0, 0.4));
        let q = DVector::zeros(0);
        let f = law(0.0, &q, &q, &q, &q, &frames);
        // Identical orientations: pure linear spring along the offset.
        assert_relative_eq!(f.linear, Vector3::new(0.0, 0.0, 20.0), epsilon = 1e-10);
    }
}
