//! Control laws driving the simulated robots.
//!
//! A controller is bound to one robot through a weak handle: controllers
//! that outlive their robot fail initialization instead of dereferencing a
//! dangling target.

use nalgebra::DVector;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::{EngineError, Result};
use crate::robot::Robot;
use crate::telemetry::TelemetrySender;

/// User-supplied control law.
pub trait Controller {
    /// Whether the controller was bound to a robot.
    fn is_initialized(&self) -> bool;

    /// The robot this controller drives, if still alive.
    fn robot(&self) -> Option<Rc<RefCell<Robot>>>;

    /// Clear any internal controller state.
    fn reset(&mut self);

    /// Compute the motor command (one slot per motor).
    fn compute_command(&mut self, t: f64, q: &DVector<f64>, v: &DVector<f64>, command: &mut DVector<f64>);

    /// Additional joint-space efforts applied on top of motor efforts.
    fn internal_dynamics(&mut self, t: f64, q: &DVector<f64>, v: &DVector<f64>, u_custom: &mut DVector<f64>);

    /// Hook to register controller-specific telemetry variables.
    ///
    /// # Errors
    ///
    /// Propagates telemetry registration failures.
    fn register_telemetry(&mut self, _sender: &mut TelemetrySender, _system: &str) -> Result<()> {
        Ok(())
    }

    /// Hook to refresh controller-specific telemetry values.
    fn update_telemetry(&mut self, _sender: &mut TelemetrySender) {}
}

/// Command closure signature: `(t, q, v, command_out)`.
pub type CommandFn = dyn FnMut(f64, &DVector<f64>, &DVector<f64>, &mut DVector<f64>);

/// Controller built from two closures, one for the command and one for the
/// internal dynamics.
pub struct FunctionController {
    robot: Weak<RefCell<Robot>>,
    command_fn: Box<CommandFn>,
    internal_fn: Box<CommandFn>,
    initialized: bool,
}

impl FunctionController {
    /// Build from a command closure and an internal-dynamics closure.
    #[must_use]
    pub fn new(
        command_fn: impl FnMut(f64, &DVector<f64>, &DVector<f64>, &mut DVector<f64>) + 'static,
        internal_fn: impl FnMut(f64, &DVector<f64>, &DVector<f64>, &mut DVector<f64>) + 'static,
    ) -> Self {
        Self {
            robot: Weak::new(),
            command_fn: Box::new(command_fn),
            internal_fn: Box::new(internal_fn),
            initialized: false,
        }
    }

    /// A controller that outputs nothing.
    #[must_use]
    pub fn bypass() -> Self {
        Self::new(|_, _, _, _| {}, |_, _, _, _| {})
    }

    /// Bind the controller to a robot.
    ///
    /// # Errors
    ///
    /// Fails with `InitFailed` when the robot itself is not initialized.
    pub fn initialize(&mut self, robot: &Rc<RefCell<Robot>>) -> Result<()> {
        if !robot.borrow().is_initialized() {
            return Err(EngineError::init_failed(
                "cannot bind a controller to an uninitialized robot",
            ));
        }
        self.robot = Rc::downgrade(robot);
        self.initialized = true;
        Ok(())
    }
}

impl Controller for FunctionController {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn robot(&self) -> Option<Rc<RefCell<Robot>>> {
        self.robot.upgrade()
    }

    fn reset(&mut self) {}

    fn compute_command(
        &mut self,
        t: f64,
        q: &DVector<f64>,
        v: &DVector<f64>,
        command: &mut DVector<f64>,
    ) {
        (self.command_fn)(t, q, v, command);
    }

    fn internal_dynamics(
        &mut self,
        t: f64,
        q: &DVector<f64>,
        v: &DVector<f64>,
        u_custom: &mut DVector<f64>,
    ) {
        (self.internal_fn)(t, q, v, u_custom);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::factories;

    #[test]
    fn test_function_controller_binding() {
        let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
            1, 1.0, 1.0,
        ))));
        let mut controller = FunctionController::new(
            |_t, _q, _v, command| command[0] = 2.0,
            |_, _, _, _| {},
        );
        assert!(!controller.is_initialized());
        controller.initialize(&robot).unwrap();
        assert!(controller.is_initialized());
        assert!(controller.robot().is_some());

        let q = DVector::zeros(1);
        let v = DVector::zeros(1);
        let mut command = DVector::zeros(1);
        controller.compute_command(0.0, &q, &v, &mut command);
        assert_eq!(command[0], 2.0);
    }

    #[test]
    fn test_controller_detects_dropped_robot() {
        let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
            1, 1.0, 1.0,
        ))));
        let mut controller = FunctionController::bypass();
        controller.initialize(&robot).unwrap();
        drop(robot);
        assert!(controller.robot().is_none());
    }
}
