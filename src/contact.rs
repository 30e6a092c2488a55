//! Ground model and compliant contact law.
//!
//! Two contact models exist engine-wide: a spring-damper ground reaction
//! with tangent-friction blending computed here, and a rigid constraint
//! model routed through the boxed forward-dynamics solver. Contact state
//! transitions live with the engine; this module holds the pure laws.

use nalgebra::Vector3;
use std::rc::Rc;

use crate::constants::EPS;
use crate::engine::options::ContactOptions;
use crate::error::{EngineError, Result};
use crate::spatial::Force;

/// Ground profile: maps a world position to the ground height under it and
/// the surface normal there. The normal is normalized by the engine.
pub type GroundProfile = Rc<dyn Fn(&Vector3<f64>) -> (f64, Vector3<f64>)>;

/// Flat ground at `z = 0` with vertical normal.
#[must_use]
pub fn flat_ground() -> GroundProfile {
    Rc::new(|_| (0.0, Vector3::z()))
}

/// Contact model selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContactModel {
    /// Compliant spring-damper ground reaction.
    #[default]
    SpringDamper,
    /// Rigid contact through kinematic constraints.
    Constraint,
}

impl ContactModel {
    /// Parse the option key.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` on an unknown model name.
    pub fn from_option(name: &str) -> Result<Self> {
        match name {
            "spring_damper" => Ok(Self::SpringDamper),
            "constraint" => Ok(Self::Constraint),
            other => Err(EngineError::bad_input(format!(
                "unknown contact model '{other}'"
            ))),
        }
    }
}

/// Spring-damper ground reaction at a penetrating contact point.
///
/// `n_ground` is the normalized ground normal, `depth` the signed
/// penetration (negative inside the ground) and `v_contact` the world
/// velocity of the contact point. Returns the wrench in world axes applied
/// at the contact point; zero when not penetrating.
#[must_use]
pub fn spring_damper_force(
    options: &ContactOptions,
    n_ground: &Vector3<f64>,
    depth: f64,
    v_contact: &Vector3<f64>,
) -> Force {
    if depth >= 0.0 {
        return Force::zero();
    }

    // Penetration speed and normal reaction.
    let v_depth = v_contact.dot(n_ground);
    let f_normal = -(options.stiffness * depth + options.damping * v_depth).min(0.0);
    let mut f_world = n_ground * f_normal;

    // Regularized Coulomb friction along the unit slip direction, so the
    // tangential magnitude is capped at µ·f_n once saturated.
    let v_tangential = v_contact - n_ground * v_depth;
    let v_slip = v_tangential.norm();
    let v_ratio = (v_slip / options.transition_velocity).min(1.0);
    let f_tangential = options.friction * v_ratio * f_normal;
    let v_tangential_dir = if v_slip > EPS {
        v_tangential / v_slip
    } else {
        Vector3::zeros()
    };
    f_world -= v_tangential_dir * f_tangential;

    // Blend the force in over the transition depth for continuity.
    if options.transition_eps > EPS {
        let blending = (-2.0 * depth / options.transition_eps).tanh();
        f_world *= blending;
    }

    Force::new(f_world, Vector3::zeros())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn options() -> ContactOptions {
        ContactOptions {
            stiffness: 1e5,
            damping: 1e3,
            friction: 0.5,
            torsion: 0.0,
            transition_eps: 0.0,
            transition_velocity: 1e-2,
            ..ContactOptions::default()
        }
    }

    #[test]
    fn test_no_force_above_ground() {
        let f = spring_damper_force(&options(), &Vector3::z(), 0.01, &Vector3::zeros());
        assert_eq!(f, Force::zero());
    }

    #[test]
    fn test_normal_force_static_penetration() {
        let f = spring_damper_force(&options(), &Vector3::z(), -1e-3, &Vector3::zeros());
        assert_relative_eq!(f.linear.z, 1e5 * 1e-3, epsilon = 1e-9);
        assert_relative_eq!(f.linear.x, 0.0);
    }

    #[test]
    fn test_normal_force_never_pulls() {
        // Separating fast enough that the damper would pull: clamped to zero.
        let f = spring_damper_force(
            &options(),
            &Vector3::z(),
            -1e-4,
            &Vector3::new(0.0, 0.0, 1.0),
        );
        assert_relative_eq!(f.linear.z, 0.0);
    }

    #[test]
    fn test_friction_saturates_at_coulomb_cone() {
        let opts = options();
        // Non-unit slip far above the transition velocity: the friction
        // magnitude must pin at µ·f_n independently of the slip speed.
        let slip = Vector3::new(3.0, 0.0, 0.0);
        let f = spring_damper_force(&opts, &Vector3::z(), -1e-3, &slip);
        let normal = f.linear.z;
        assert_relative_eq!(-f.linear.x, opts.friction * normal, epsilon = 1e-9);
        let tangential = (f.linear.x * f.linear.x + f.linear.y * f.linear.y).sqrt();
        assert!(tangential <= opts.friction * normal + 1e-9);
    }

    #[test]
    fn test_friction_magnitude_independent_of_slip_speed() {
        // Two saturated slip speeds along different directions give the
        // same tangential magnitude, only the direction changes.
        let opts = options();
        let f_slow = spring_damper_force(
            &opts,
            &Vector3::z(),
            -1e-3,
            &Vector3::new(0.5, 0.0, 0.0),
        );
        let f_fast = spring_damper_force(
            &opts,
            &Vector3::z(),
            -1e-3,
            &Vector3::new(0.0, 8.0, 0.0),
        );
        assert_relative_eq!(-f_slow.linear.x, -f_fast.linear.y, epsilon = 1e-9);
        assert_relative_eq!(f_fast.linear.x, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_tanh_blending_reduces_shallow_contact() {
        let mut opts = options();
        opts.transition_eps = 1e-2;
        let shallow = spring_damper_force(&opts, &Vector3::z(), -1e-4, &Vector3::zeros());
        let unblended = 1e5 * 1e-4;
        assert!(shallow.linear.z < unblended);
        assert!(shallow.linear.z > 0.0);
    }
}
