//! Validated engine configuration.
//!
//! Options are plain data with serde round trip; validation happens in
//! `Engine::set_options` so a failed update leaves the previous options in
//! place. The full options snapshot is serialized to JSON and logged as a
//! telemetry constant at simulation start.

use nalgebra::Vector6;
use serde::{Deserialize, Serialize};

use crate::constants::{EPS, SIMULATION_MAX_TIMESTEP, SIMULATION_MIN_TIMESTEP};
use crate::error::{EngineError, Result};

/// Integration scheme selector.
pub const ODE_SOLVERS: [&str; 3] = ["runge_kutta_dopri5", "runge_kutta_4", "euler_explicit"];
/// Constraint solver selector.
pub const CONSTRAINT_SOLVERS: [&str; 2] = ["PGS", "NONE"];
/// Contact model selector.
pub const CONTACT_MODELS: [&str; 2] = ["spring_damper", "constraint"];

/// Stepper and scheduling options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepperOptions {
    /// Integration scheme: one of [`ODE_SOLVERS`].
    pub ode_solver: String,
    /// Absolute tolerance of the adaptive stepper and the constraint solver.
    pub tol_abs: f64,
    /// Relative tolerance of the adaptive stepper and the constraint solver.
    pub tol_rel: f64,
    /// Largest admissible step size.
    pub dt_max: f64,
    /// Threshold ratio for restoring the step size after a breakpoint.
    pub dt_restore_threshold_rel: f64,
    /// Maximum number of successful iterations per simulation; 0 disables.
    pub iter_max: u64,
    /// Maximum number of successive failed inner iterations.
    pub successive_iter_failed_max: u64,
    /// Wall-clock timeout per `step` call, seconds; 0 disables.
    pub timeout: f64,
    /// Sensor sampling period; 0 for continuous sampling.
    pub sensors_update_period: f64,
    /// Controller sampling period; 0 for continuous sampling.
    pub controller_update_period: f64,
    /// Emit telemetry at every internal stepper step in continuous mode.
    pub log_internal_stepper_steps: bool,
    /// Seed of the process-scoped random generator.
    pub random_seed: u32,
    /// Print simulation-progress messages.
    pub verbose: bool,
}

impl Default for StepperOptions {
    fn default() -> Self {
        Self {
            ode_solver: "runge_kutta_dopri5".to_string(),
            tol_abs: 1e-5,
            tol_rel: 1e-4,
            dt_max: SIMULATION_MAX_TIMESTEP,
            dt_restore_threshold_rel: 0.2,
            iter_max: 0,
            successive_iter_failed_max: 1000,
            timeout: 0.0,
            sensors_update_period: 0.0,
            controller_update_period: 0.0,
            log_internal_stepper_steps: false,
            random_seed: 0,
            verbose: false,
        }
    }
}

/// Constraint solver options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintOptions {
    /// Solver: one of [`CONSTRAINT_SOLVERS`].
    pub solver: String,
    /// Relative regularization of the Delassus diagonal.
    pub regularization: f64,
}

impl Default for ConstraintOptions {
    fn default() -> Self {
        Self {
            solver: "PGS".to_string(),
            regularization: 0.0,
        }
    }
}

/// Contact model options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactOptions {
    /// Contact model: one of [`CONTACT_MODELS`].
    pub model: String,
    /// Spring-damper normal stiffness.
    pub stiffness: f64,
    /// Spring-damper normal damping.
    pub damping: f64,
    /// Tangential friction coefficient.
    pub friction: f64,
    /// Torsional friction coefficient.
    pub torsion: f64,
    /// Contact transition depth: force blending for the spring-damper
    /// model, takeoff hysteresis for the constraint model.
    pub transition_eps: f64,
    /// Slip velocity scale of the regularized friction law.
    pub transition_velocity: f64,
    /// Baumgarte stabilization natural frequency of contact constraints.
    pub stabilization_freq: f64,
}

impl Default for ContactOptions {
    fn default() -> Self {
        Self {
            model: "spring_damper".to_string(),
            stiffness: 1e6,
            damping: 2e3,
            friction: 1.0,
            torsion: 0.0,
            transition_eps: 1e-3,
            transition_velocity: 1e-2,
            stabilization_freq: 20.0,
        }
    }
}

/// Joint bound enforcement options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointOptions {
    /// Position-bound restoring stiffness (spring-damper contact model).
    pub bound_stiffness: f64,
    /// Position/velocity-bound damping.
    pub bound_damping: f64,
}

impl Default for JointOptions {
    fn default() -> Self {
        Self {
            bound_stiffness: 1e7,
            bound_damping: 1e4,
        }
    }
}

/// World options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldOptions {
    /// Gravity field as a length-6 wrench applied as model gravity.
    pub gravity: Vector6<f64>,
}

impl Default for WorldOptions {
    fn default() -> Self {
        Self {
            gravity: Vector6::new(0.0, 0.0, -9.81, 0.0, 0.0, 0.0),
        }
    }
}

/// Telemetry selection flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryOptions {
    /// Log the configuration vectors.
    pub enable_configuration: bool,
    /// Log the velocity vectors.
    pub enable_velocity: bool,
    /// Log the acceleration vectors.
    pub enable_acceleration: bool,
    /// Log the external force vectors.
    pub enable_force_external: bool,
    /// Log the command vectors.
    pub enable_command: bool,
    /// Log the motor efforts.
    pub enable_motor_effort: bool,
    /// Log the mechanical energy.
    pub enable_energy: bool,
    /// Persist the collision/visual model snapshots with the log.
    pub is_persistent: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            enable_configuration: true,
            enable_velocity: true,
            enable_acceleration: true,
            enable_force_external: true,
            enable_command: true,
            enable_motor_effort: true,
            enable_energy: true,
            is_persistent: false,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineOptions {
    /// Stepper and scheduling options.
    pub stepper: StepperOptions,
    /// Constraint solver options.
    pub constraints: ConstraintOptions,
    /// Contact model options.
    pub contacts: ContactOptions,
    /// Joint bound options.
    pub joints: JointOptions,
    /// World options.
    pub world: WorldOptions,
    /// Telemetry flags.
    pub telemetry: TelemetryOptions,
}

impl EngineOptions {
    /// Validate every recognized key, leaving the caller's options intact on
    /// failure.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` on any out-of-range or unknown value.
    pub fn validate(&self) -> Result<()> {
        let stepper = &self.stepper;
        if stepper.dt_max > SIMULATION_MAX_TIMESTEP + EPS || stepper.dt_max < SIMULATION_MIN_TIMESTEP
        {
            return Err(EngineError::bad_input("'dt_max' option is out of range"));
        }
        if stepper.successive_iter_failed_max < 1 {
            return Err(EngineError::bad_input(
                "'successive_iter_failed_max' must be strictly positive",
            ));
        }
        if !ODE_SOLVERS.contains(&stepper.ode_solver.as_str()) {
            return Err(EngineError::bad_input(
                "the requested ODE solver is not available",
            ));
        }
        if (EPS < stepper.sensors_update_period
            && stepper.sensors_update_period < SIMULATION_MIN_TIMESTEP)
            || (EPS < stepper.controller_update_period
                && stepper.controller_update_period < SIMULATION_MIN_TIMESTEP)
        {
            return Err(EngineError::bad_input(format!(
                "cannot simulate a discrete system with update period smaller than \
                 {SIMULATION_MIN_TIMESTEP}s, adjust the period or switch to continuous \
                 mode by setting it to zero"
            )));
        }
        if !CONSTRAINT_SOLVERS.contains(&self.constraints.solver.as_str()) {
            return Err(EngineError::bad_input(
                "the requested constraint solver is not available",
            ));
        }
        if self.constraints.regularization < 0.0 {
            return Err(EngineError::bad_input(
                "the constraints option 'regularization' must be positive",
            ));
        }
        if !CONTACT_MODELS.contains(&self.contacts.model.as_str()) {
            return Err(EngineError::bad_input(
                "the requested contact model is not available",
            ));
        }
        if self.contacts.transition_eps < 0.0 {
            return Err(EngineError::bad_input(
                "the contacts option 'transition_eps' must be positive",
            ));
        }
        if self.contacts.transition_velocity < EPS {
            return Err(EngineError::bad_input(
                "the contacts option 'transition_velocity' must be strictly positive",
            ));
        }
        if self.contacts.stabilization_freq < 0.0 {
            return Err(EngineError::bad_input(
                "the contacts option 'stabilization_freq' must be positive",
            ));
        }
        if self.contacts.stiffness < 0.0
            || self.contacts.damping < 0.0
            || self.contacts.friction < 0.0
            || self.contacts.torsion < 0.0
        {
            return Err(EngineError::bad_input(
                "the contacts gains and friction coefficients must be positive",
            ));
        }
        if self.joints.bound_stiffness < 0.0 || self.joints.bound_damping < 0.0 {
            return Err(EngineError::bad_input(
                "the joints bound gains must be positive",
            ));
        }
        Ok(())
    }
}
