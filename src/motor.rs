//! Joint actuators mapping controller commands to joint efforts.

use nalgebra::DVector;

use crate::error::{EngineError, Result};
use crate::model::{JointType, Model};

/// Effort-limited motor driving one 1-DOF joint.
#[derive(Debug, Clone)]
pub struct Motor {
    name: String,
    joint_name: String,
    joint_idx: usize,
    joint_velocity_idx: usize,
    effort_limit: f64,
    initialized: bool,
}

impl Motor {
    /// Declare a motor on the named joint. `effort_limit` bounds the output
    /// symmetrically; pass `f64::INFINITY` for an ideal motor.
    #[must_use]
    pub fn new(name: impl Into<String>, joint_name: impl Into<String>, effort_limit: f64) -> Self {
        Self {
            name: name.into(),
            joint_name: joint_name.into(),
            joint_idx: 0,
            joint_velocity_idx: 0,
            effort_limit,
            initialized: false,
        }
    }

    /// Resolve joint indices against the model.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` when the joint does not exist or is not 1-DOF.
    pub fn initialize(&mut self, model: &Model) -> Result<()> {
        let idx = model.joint_index(&self.joint_name)?;
        let joint = &model.joints[idx];
        if !matches!(
            joint.joint_type,
            JointType::Revolute(_) | JointType::RevoluteUnbounded(_) | JointType::Prismatic(_)
        ) {
            return Err(EngineError::bad_input(format!(
                "motor '{}' requires a 1-DOF joint, '{}' is not one",
                self.name, self.joint_name
            )));
        }
        self.joint_idx = idx;
        self.joint_velocity_idx = joint.idx_v;
        self.initialized = true;
        Ok(())
    }

    /// Motor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Driven joint name.
    #[must_use]
    pub fn joint_name(&self) -> &str {
        &self.joint_name
    }

    /// Velocity DOF the effort applies to.
    #[must_use]
    pub fn joint_velocity_idx(&self) -> usize {
        self.joint_velocity_idx
    }

    /// Whether `initialize` succeeded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Effort produced for the given command slot value.
    #[must_use]
    pub fn compute_effort(&self, command: f64) -> f64 {
        command.clamp(-self.effort_limit, self.effort_limit)
    }
}

/// Evaluate all motor efforts for a command vector (one slot per motor).
pub fn compute_motors_efforts(motors: &[Motor], command: &DVector<f64>, out: &mut DVector<f64>) {
    for (k, motor) in motors.iter().enumerate() {
        out[k] = motor.compute_effort(command[k]);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::factories;

    #[test]
    fn test_motor_initialize_and_clamp() {
        let model = factories::n_link_pendulum(1, 1.0, 1.0);
        let mut motor = Motor::new("drive", "pivot_0", 5.0);
        motor.initialize(&model).unwrap();
        assert!(motor.is_initialized());
        assert_eq!(motor.joint_velocity_idx(), 0);
        assert_eq!(motor.compute_effort(12.0), 5.0);
        assert_eq!(motor.compute_effort(-12.0), -5.0);
        assert_eq!(motor.compute_effort(3.0), 3.0);
    }

    #[test]
    fn test_motor_rejects_free_joint() {
        let model = factories::free_sphere("ball", 1.0, 0.1);
        let mut motor = Motor::new("drive", "root", 1.0);
        assert!(motor.initialize(&model).is_err());
    }
}
