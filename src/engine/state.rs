//! Per-simulation and per-system mutable state holders.

use nalgebra::DVector;
use std::cell::RefCell;
use std::rc::Rc;

use crate::constraint::solver::PgsSolver;
use crate::constraint::ConstraintsHolder;
use crate::control::Controller;
use crate::forces::{ForceImpulse, ForceProfile};
use crate::robot::{Robot, RobotLock};
use crate::spatial::Force;
use crate::telemetry::FieldId;

/// Simulation callback: `(t, q, v) -> keep_running`.
pub type SystemCallback = Box<dyn FnMut(f64, &DVector<f64>, &DVector<f64>) -> bool>;

/// One registered system: a robot, its controller and its stop callback.
pub struct SystemHolder {
    /// System name, unique within the engine.
    pub name: String,
    /// Shared robot handle.
    pub robot: Rc<RefCell<Robot>>,
    /// Shared controller handle.
    pub controller: Rc<RefCell<dyn Controller>>,
    /// Cooperative stop callback, polled every outer iteration.
    pub callback: SystemCallback,
}

/// Dense per-system simulation state.
#[derive(Debug, Clone)]
pub struct SystemState {
    /// Configuration.
    pub q: DVector<f64>,
    /// Velocity.
    pub v: DVector<f64>,
    /// Acceleration.
    pub a: DVector<f64>,
    /// Total joint effort.
    pub u: DVector<f64>,
    /// Controller command, one slot per motor.
    pub command: DVector<f64>,
    /// Motor efforts.
    pub u_motor: DVector<f64>,
    /// Internal joint efforts (bounds, flexibility, constraint reactions).
    pub u_internal: DVector<f64>,
    /// User-supplied internal dynamics efforts.
    pub u_custom: DVector<f64>,
    /// External force per joint, local joint frames, entry 0 unused.
    pub f_external: Vec<Force>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            q: DVector::zeros(0),
            v: DVector::zeros(0),
            a: DVector::zeros(0),
            u: DVector::zeros(0),
            command: DVector::zeros(0),
            u_motor: DVector::zeros(0),
            u_internal: DVector::zeros(0),
            u_custom: DVector::zeros(0),
            f_external: Vec::new(),
        }
    }
}

impl SystemState {
    /// Size every buffer for the robot.
    pub fn initialize(&mut self, robot: &Robot) {
        let nq = robot.nq();
        let nv = robot.nv();
        self.q = DVector::zeros(nq);
        self.v = DVector::zeros(nv);
        self.a = DVector::zeros(nv);
        self.u = DVector::zeros(nv);
        self.command = DVector::zeros(robot.n_motors());
        self.u_motor = DVector::zeros(robot.n_motors());
        self.u_internal = DVector::zeros(nv);
        self.u_custom = DVector::zeros(nv);
        self.f_external = vec![Force::zero(); robot.model().njoints()];
    }

    /// Drop every buffer.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Telemetry variable handles of one system.
#[derive(Debug, Clone, Default)]
pub struct SystemLogIds {
    /// Configuration coordinates.
    pub position: Vec<FieldId>,
    /// Velocity coordinates.
    pub velocity: Vec<FieldId>,
    /// Acceleration coordinates.
    pub acceleration: Vec<FieldId>,
    /// External force coordinates, joints 1.. by 6.
    pub force_external: Vec<FieldId>,
    /// Command slots.
    pub command: Vec<FieldId>,
    /// Motor efforts.
    pub motor_effort: Vec<FieldId>,
    /// Sensor coordinates.
    pub sensors: Vec<FieldId>,
    /// Mechanical energy.
    pub energy: Option<FieldId>,
}

/// Engine-private per-system scratch, parallel to the system registry.
#[derive(Default)]
pub struct SystemData {
    /// Current state.
    pub state: SystemState,
    /// State at the last successful step.
    pub state_prev: SystemState,
    /// Contact force per contact frame, local joint frames.
    pub contact_frames_forces: Vec<Force>,
    /// Contact force per collision body and pair, local joint frames.
    pub collision_bodies_forces: Vec<Vec<Force>>,
    /// Registered impulse forces.
    pub forces_impulse: Vec<ForceImpulse>,
    /// Active-set flags of the impulse forces.
    pub forces_impulse_active: Vec<bool>,
    /// Sorted unique impulse window edges.
    pub forces_impulse_breaks: Vec<f64>,
    /// Cursor into `forces_impulse_breaks`.
    pub impulse_break_next_idx: usize,
    /// Registered profile forces.
    pub forces_profile: Vec<ForceProfile>,
    /// Snapshot of the robot constraint registry taken at start.
    pub constraints_holder: ConstraintsHolder,
    /// Boxed forward-dynamics solver instance.
    pub constraint_solver: Option<PgsSolver>,
    /// Robot topology lock held while simulating.
    pub robot_lock: Option<RobotLock>,
    /// Telemetry handles.
    pub log_ids: SystemLogIds,
}

impl SystemData {
    /// Insert an impulse window edge keeping the set sorted and unique.
    pub fn insert_impulse_break(&mut self, t: f64) {
        match self
            .forces_impulse_breaks
            .binary_search_by(|probe| probe.partial_cmp(&t).unwrap_or(std::cmp::Ordering::Less))
        {
            Ok(_) => {}
            Err(pos) => self.forces_impulse_breaks.insert(pos, t),
        }
    }
}

/// Global integration state shared by all systems.
#[derive(Debug, Clone, Default)]
pub struct StepperState {
    /// Current time.
    pub t: f64,
    /// Time at the last successful step.
    pub t_prev: f64,
    /// Kahan compensation of the accumulated time.
    pub t_error: f64,
    /// Step size to attempt next.
    pub dt: f64,
    /// Stepper-recommended largest step size.
    pub dt_largest: f64,
    /// Recommendation at the previous successful step.
    pub dt_largest_prev: f64,
    /// Successful iteration counter.
    pub iter: u64,
    /// Failed iteration counter.
    pub iter_failed: u64,
    /// Per-system configuration vectors.
    pub q_split: Vec<DVector<f64>>,
    /// Per-system velocity vectors.
    pub v_split: Vec<DVector<f64>>,
    /// Per-system acceleration vectors.
    pub a_split: Vec<DVector<f64>>,
}

impl StepperState {
    /// Reinitialize for a new simulation.
    pub fn reset(
        &mut self,
        dt_init: f64,
        q_split: Vec<DVector<f64>>,
        v_split: Vec<DVector<f64>>,
        a_split: Vec<DVector<f64>>,
    ) {
        self.t = 0.0;
        self.t_prev = 0.0;
        self.t_error = 0.0;
        self.dt = dt_init;
        self.dt_largest = dt_init;
        self.dt_largest_prev = dt_init;
        self.iter = 0;
        self.iter_failed = 0;
        self.q_split = q_split;
        self.v_split = v_split;
        self.a_split = a_split;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::factories;

    #[test]
    fn test_system_state_initialize() {
        let robot = Robot::new(factories::free_sphere("ball", 1.0, 0.2));
        let mut state = SystemState::default();
        state.initialize(&robot);
        assert_eq!(state.q.len(), 7);
        assert_eq!(state.v.len(), 6);
        assert_eq!(state.f_external.len(), 2);
        state.clear();
        assert_eq!(state.q.len(), 0);
    }

    #[test]
    fn test_impulse_breaks_sorted_unique() {
        let mut data = SystemData::default();
        data.insert_impulse_break(0.5);
        data.insert_impulse_break(0.1);
        data.insert_impulse_break(0.5);
        data.insert_impulse_break(0.51);
        assert_eq!(data.forces_impulse_breaks, vec![0.1, 0.5, 0.51]);
    }
}
