//! Simulation engine: lifecycle, force registration surface, breakpoint
//! scheduler and integration loop.
//!
//! The engine advances one or more systems (robot + controller + callback)
//! through time while honoring periodic controller and sensor sampling,
//! impulse-force windows, contact state transitions and projected constraint
//! forces. Time accumulation is Kahan-compensated so long simulations do not
//! drift; every user-visible breakpoint lands on a microsecond multiple.

pub mod options;
pub mod state;

mod dynamics;

use nalgebra::{DVector, Vector6};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use tracing::info;

use crate::constants::{
    EPS, GLOBAL_TIME, INIT_ITERATIONS, PGS_MAX_ITERATIONS, SIMULATION_MIN_DURATION,
    SIMULATION_MIN_TIMESTEP, STEPPER_MIN_TIMESTEP, TELEMETRY_DELIMITER,
};
use crate::constraint::solver::PgsSolver;
use crate::constraint::ConstraintGroup;
use crate::contact::{flat_ground, ContactModel, GroundProfile};
use crate::control::{Controller, FunctionController};
use crate::error::{EngineError, Result};
use crate::forces::{
    viscoelastic_coupling, viscoelastic_directional_coupling, CouplingForceFn, ForceCoupling,
    ForceImpulse, ForceProfile, ProfileForceFn,
};
use crate::log::LogFormat;
use crate::model::algorithms;
use crate::random::RandomGenerator;
use crate::robot::Robot;
use crate::spatial::{Force, Motion};
use crate::stepper::{Dopri5Stepper, EulerExplicitStepper, RungeKutta4Stepper, Stepper};
use crate::telemetry::{LogData, TelemetryRecorder, TelemetrySender};

use options::EngineOptions;
use state::{StepperState, SystemCallback, SystemData, SystemHolder, SystemState};

/// Check that every finite period is a multiple of the smallest one, and
/// return that smallest period (infinite when all periods are zero).
fn min_period_included(periods: impl IntoIterator<Item = f64>) -> (bool, f64) {
    let finite: Vec<f64> = periods.into_iter().filter(|p| *p > EPS).collect();
    let mut min_value = f64::INFINITY;
    for p in &finite {
        min_value = min_value.min(*p);
    }
    if !min_value.is_finite() {
        return (true, f64::INFINITY);
    }
    let included = finite.iter().all(|p| {
        let ratio = p / min_value;
        (ratio - ratio.round()).abs() < 1e-8
    });
    (included, min_value)
}

/// Multi-system simulation engine.
pub struct Engine {
    options: EngineOptions,
    contact_model: ContactModel,
    ground_profile: GroundProfile,
    systems: Vec<SystemHolder>,
    systems_data: Vec<SystemData>,
    forces_coupling: Vec<ForceCoupling>,
    stepper: Option<Box<dyn Stepper>>,
    stepper_update_period: f64,
    stepper_state: StepperState,
    telemetry_sender: TelemetrySender,
    telemetry_recorder: TelemetryRecorder,
    iteration_field: Option<crate::telemetry::FieldId>,
    is_telemetry_configured: bool,
    is_simulation_running: bool,
    contact_forces_prev: Vec<Vec<Force>>,
    f_prev: Vec<Vec<Force>>,
    a_prev: Vec<Vec<Motion>>,
    log_data: Option<Rc<LogData>>,
    rng: RandomGenerator,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create an engine with default options.
    #[must_use]
    pub fn new() -> Self {
        let options = EngineOptions::default();
        let seed = options.stepper.random_seed;
        Self {
            contact_model: ContactModel::SpringDamper,
            ground_profile: flat_ground(),
            systems: Vec::new(),
            systems_data: Vec::new(),
            forces_coupling: Vec::new(),
            stepper: None,
            stepper_update_period: f64::INFINITY,
            stepper_state: StepperState::default(),
            telemetry_sender: TelemetrySender::new(),
            telemetry_recorder: TelemetryRecorder::new(),
            iteration_field: None,
            is_telemetry_configured: false,
            is_simulation_running: false,
            contact_forces_prev: Vec::new(),
            f_prev: Vec::new(),
            a_prev: Vec::new(),
            log_data: None,
            rng: RandomGenerator::new(seed),
            options,
        }
    }

    fn check_not_running(&self, action: &str) -> Result<()> {
        if self.is_simulation_running {
            return Err(EngineError::generic(format!(
                "a simulation is already running, stop it before {action}"
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // System registry
    // ------------------------------------------------------------------

    /// Register a system driven by a do-nothing controller.
    ///
    /// # Errors
    ///
    /// Fails while running, on a duplicated name or robot, or on an
    /// uninitialized robot.
    pub fn add_system(
        &mut self,
        name: &str,
        robot: Rc<RefCell<Robot>>,
        callback: SystemCallback,
    ) -> Result<()> {
        let mut controller = FunctionController::bypass();
        controller.initialize(&robot)?;
        self.add_system_with_controller(name, robot, Rc::new(RefCell::new(controller)), callback)
    }

    /// Register a system with its controller.
    ///
    /// # Errors
    ///
    /// Fails while running, on a duplicated name or robot, on an
    /// uninitialized robot or controller, or when the controller is bound to
    /// another robot.
    pub fn add_system_with_controller(
        &mut self,
        name: &str,
        robot: Rc<RefCell<Robot>>,
        controller: Rc<RefCell<dyn Controller>>,
        callback: SystemCallback,
    ) -> Result<()> {
        self.check_not_running("adding a new system")?;
        if !robot.borrow().is_initialized() {
            return Err(EngineError::init_failed("robot not initialized"));
        }
        /* With several robots the system names circumfix the log variables,
        so for consistency all systems but the first must carry one. */
        if !self.systems.is_empty() && name.is_empty() {
            return Err(EngineError::generic(
                "all systems but the first one must have a name",
            ));
        }
        if self.systems.iter().any(|s| s.name == name) {
            return Err(EngineError::bad_input(format!(
                "a system named '{name}' has already been added"
            )));
        }
        if self.systems.iter().any(|s| Rc::ptr_eq(&s.robot, &robot)) {
            return Err(EngineError::bad_input(
                "another system is already referring to this robot",
            ));
        }
        {
            let controller_ref = controller.borrow();
            if !controller_ref.is_initialized() {
                return Err(EngineError::init_failed("controller not initialized"));
            }
            match controller_ref.robot() {
                Some(bound) if Rc::ptr_eq(&bound, &robot) => {}
                Some(_) => {
                    return Err(EngineError::init_failed(
                        "controller not initialized for the robot of this system",
                    ))
                }
                None => {
                    return Err(EngineError::init_failed(
                        "controller's robot expired or unset",
                    ))
                }
            }
        }
        self.systems.push(SystemHolder {
            name: name.to_string(),
            robot,
            controller,
            callback,
        });
        self.systems_data.push(SystemData::default());
        Ok(())
    }

    /// Remove a system and every coupling force involving it.
    ///
    /// # Errors
    ///
    /// Fails while running or on an unknown name.
    pub fn remove_system(&mut self, name: &str) -> Result<()> {
        self.check_not_running("removing a system")?;
        let idx = self.system_index(name)?;
        self.forces_coupling
            .retain(|f| f.system_idx1 != idx && f.system_idx2 != idx);
        for coupling in &mut self.forces_coupling {
            if coupling.system_idx1 > idx {
                coupling.system_idx1 -= 1;
            }
            if coupling.system_idx2 > idx {
                coupling.system_idx2 -= 1;
            }
        }
        self.systems.remove(idx);
        self.systems_data.remove(idx);
        Ok(())
    }

    /// Replace the controller of a system.
    ///
    /// # Errors
    ///
    /// Fails while running, on an unknown system, or when the controller is
    /// not bound to the system's robot.
    pub fn set_controller(
        &mut self,
        name: &str,
        controller: Rc<RefCell<dyn Controller>>,
    ) -> Result<()> {
        self.check_not_running("setting a new controller")?;
        let idx = self.system_index(name)?;
        {
            let controller_ref = controller.borrow();
            if !controller_ref.is_initialized() {
                return Err(EngineError::init_failed("controller not initialized"));
            }
            let Some(bound) = controller_ref.robot() else {
                return Err(EngineError::init_failed(
                    "controller's robot expired or unset",
                ));
            };
            if !Rc::ptr_eq(&bound, &self.systems[idx].robot) {
                return Err(EngineError::init_failed(
                    "controller not initialized for the robot of this system",
                ));
            }
        }
        self.systems[idx].controller = controller;
        Ok(())
    }

    /// Index of a system by name.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` on an unknown name.
    pub fn system_index(&self, name: &str) -> Result<usize> {
        self.systems
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| {
                EngineError::bad_input(format!(
                    "no system named '{name}' has been added to the engine"
                ))
            })
    }

    /// Names of the registered systems, in insertion order.
    #[must_use]
    pub fn systems_names(&self) -> Vec<String> {
        self.systems.iter().map(|s| s.name.clone()).collect()
    }

    /// Current state of a system.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` on an unknown name.
    pub fn system_state(&self, name: &str) -> Result<&SystemState> {
        let idx = self.system_index(name)?;
        Ok(&self.systems_data[idx].state)
    }

    /// Global integration state.
    #[must_use]
    pub fn stepper_state(&self) -> &StepperState {
        &self.stepper_state
    }

    /// Whether a simulation is running.
    #[must_use]
    pub fn is_simulation_running(&self) -> bool {
        self.is_simulation_running
    }

    /// Process-scoped random generator.
    pub fn random_mut(&mut self) -> &mut RandomGenerator {
        &mut self.rng
    }

    // ------------------------------------------------------------------
    // Force registration
    // ------------------------------------------------------------------

    /// Register a pairwise coupling force between two frames.
    ///
    /// # Errors
    ///
    /// Fails while running, on unknown names, or when coupling a frame to
    /// itself.
    pub fn register_force_coupling(
        &mut self,
        system_name1: &str,
        system_name2: &str,
        frame_name1: &str,
        frame_name2: &str,
        force_fn: CouplingForceFn,
    ) -> Result<()> {
        self.check_not_running("adding coupling forces")?;
        let system_idx1 = self.system_index(system_name1)?;
        let system_idx2 = self.system_index(system_name2)?;
        let frame_idx1 = self.systems[system_idx1]
            .robot
            .borrow()
            .model()
            .frame_index(frame_name1)?;
        let frame_idx2 = self.systems[system_idx2]
            .robot
            .borrow()
            .model()
            .frame_index(frame_name2)?;
        if system_idx1 == system_idx2 && frame_idx1 == frame_idx2 {
            return Err(EngineError::generic(
                "a coupling force requires different frames",
            ));
        }
        self.forces_coupling.push(ForceCoupling {
            system_name1: system_name1.to_string(),
            system_idx1,
            system_name2: system_name2.to_string(),
            system_idx2,
            frame_name1: frame_name1.to_string(),
            frame_idx1,
            frame_name2: frame_name2.to_string(),
            frame_idx2,
            force_fn,
        });
        Ok(())
    }

    /// Register a 6-D viscoelastic coupling between two frames.
    ///
    /// # Errors
    ///
    /// Fails on negative gains or like [`Engine::register_force_coupling`].
    pub fn register_viscoelastic_force_coupling(
        &mut self,
        system_name1: &str,
        system_name2: &str,
        frame_name1: &str,
        frame_name2: &str,
        stiffness: Vector6<f64>,
        damping: Vector6<f64>,
        alpha: f64,
    ) -> Result<()> {
        if stiffness.iter().any(|k| *k < 0.0) || damping.iter().any(|d| *d < 0.0) {
            return Err(EngineError::generic(
                "the stiffness and damping parameters must be positive",
            ));
        }
        self.register_force_coupling(
            system_name1,
            system_name2,
            frame_name1,
            frame_name2,
            viscoelastic_coupling(stiffness, damping, alpha),
        )
    }

    /// Register a directional (scalar) viscoelastic coupling between two
    /// frames.
    ///
    /// # Errors
    ///
    /// Fails on negative gains or like [`Engine::register_force_coupling`].
    pub fn register_viscoelastic_directional_force_coupling(
        &mut self,
        system_name1: &str,
        system_name2: &str,
        frame_name1: &str,
        frame_name2: &str,
        stiffness: f64,
        damping: f64,
        rest_length: f64,
    ) -> Result<()> {
        if stiffness < 0.0 || damping < 0.0 {
            return Err(EngineError::generic(
                "the stiffness and damping parameters must be positive",
            ));
        }
        self.register_force_coupling(
            system_name1,
            system_name2,
            frame_name1,
            frame_name2,
            viscoelastic_directional_coupling(stiffness, damping, rest_length),
        )
    }

    /// Remove every coupling force between two systems.
    ///
    /// # Errors
    ///
    /// Fails while running or on unknown names.
    pub fn remove_forces_coupling_between(&mut self, name1: &str, name2: &str) -> Result<()> {
        self.check_not_running("removing coupling forces")?;
        self.system_index(name1)?;
        self.system_index(name2)?;
        self.forces_coupling.retain(|f| {
            !(f.system_name1 == name1 && f.system_name2 == name2)
                && !(f.system_name1 == name2 && f.system_name2 == name1)
        });
        Ok(())
    }

    /// Remove every coupling force involving a system.
    ///
    /// # Errors
    ///
    /// Fails while running or on an unknown name.
    pub fn remove_forces_coupling(&mut self, name: &str) -> Result<()> {
        self.check_not_running("removing coupling forces")?;
        self.system_index(name)?;
        self.forces_coupling
            .retain(|f| f.system_name1 != name && f.system_name2 != name);
        Ok(())
    }

    /// Remove every coupling force.
    ///
    /// # Errors
    ///
    /// Fails while running.
    pub fn remove_all_forces_coupling(&mut self) -> Result<()> {
        self.check_not_running("removing coupling forces")?;
        self.forces_coupling.clear();
        Ok(())
    }

    /// Registered coupling forces.
    #[must_use]
    pub fn forces_coupling(&self) -> &[ForceCoupling] {
        &self.forces_coupling
    }

    /// Register an impulse force on a frame over `[t, t + dt)`.
    ///
    /// Both window edges are pre-inserted into the system break-time set so
    /// the integrator lands exactly on them.
    ///
    /// # Errors
    ///
    /// Fails while running, on an unknown system or frame, on the universe
    /// frame, on `dt` below the stepper resolution or on negative `t`.
    pub fn register_force_impulse(
        &mut self,
        system_name: &str,
        frame_name: &str,
        t: f64,
        dt: f64,
        force: Force,
    ) -> Result<()> {
        self.check_not_running("registering new forces")?;
        if dt < STEPPER_MIN_TIMESTEP {
            return Err(EngineError::bad_input(format!(
                "the force duration cannot be smaller than {STEPPER_MIN_TIMESTEP}"
            )));
        }
        if t < 0.0 {
            return Err(EngineError::bad_input(
                "the force application time must be positive",
            ));
        }
        if frame_name == "universe" {
            return Err(EngineError::generic(
                "impossible to apply external forces to the universe itself",
            ));
        }
        let system_idx = self.system_index(system_name)?;
        let frame_idx = self.systems[system_idx]
            .robot
            .borrow()
            .model()
            .frame_index(frame_name)?;

        let data = &mut self.systems_data[system_idx];
        data.forces_impulse.push(ForceImpulse {
            frame_name: frame_name.to_string(),
            frame_idx,
            t,
            dt,
            force,
        });
        data.insert_impulse_break(t);
        data.insert_impulse_break(t + dt);
        data.forces_impulse_active.push(false);
        Ok(())
    }

    /// Register a profile force on a frame, sampled every `update_period`
    /// (zero for continuous evaluation).
    ///
    /// # Errors
    ///
    /// Fails while running, on an unknown system or frame, on the universe
    /// frame, or when the period is incompatible with the other sampling
    /// periods.
    pub fn register_force_profile(
        &mut self,
        system_name: &str,
        frame_name: &str,
        force_fn: ProfileForceFn,
        update_period: f64,
    ) -> Result<()> {
        self.check_not_running("registering new forces")?;
        if frame_name == "universe" {
            return Err(EngineError::generic(
                "impossible to apply external forces to the universe itself",
            ));
        }
        let system_idx = self.system_index(system_name)?;
        let frame_idx = self.systems[system_idx]
            .robot
            .borrow()
            .model()
            .frame_index(frame_name)?;
        if EPS < update_period && update_period < SIMULATION_MIN_TIMESTEP {
            return Err(EngineError::bad_input(format!(
                "cannot register an external force profile with update period smaller than \
                 {SIMULATION_MIN_TIMESTEP}s, adjust the period or switch to continuous mode \
                 by setting it to zero"
            )));
        }
        let (included, min_period) = min_period_included(
            self.registered_periods()
                .into_iter()
                .chain([update_period]),
        );
        if !included {
            return Err(EngineError::bad_input(
                "in discrete mode, the update period of force profiles and the stepper \
                 update period must be multiple of each other",
            ));
        }
        self.stepper_update_period = min_period;
        self.systems_data[system_idx].forces_profile.push(ForceProfile {
            frame_name: frame_name.to_string(),
            frame_idx,
            update_period,
            force_fn,
            force_prev: Force::zero(),
        });
        Ok(())
    }

    /// Clear the impulse forces of a system.
    ///
    /// # Errors
    ///
    /// Fails while running or on an unknown name.
    pub fn remove_forces_impulse(&mut self, system_name: &str) -> Result<()> {
        self.check_not_running("removing impulse forces")?;
        let idx = self.system_index(system_name)?;
        let data = &mut self.systems_data[idx];
        data.forces_impulse.clear();
        data.forces_impulse_active.clear();
        data.forces_impulse_breaks.clear();
        data.impulse_break_next_idx = 0;
        Ok(())
    }

    /// Clear the impulse forces of every system.
    ///
    /// # Errors
    ///
    /// Fails while running.
    pub fn remove_all_forces_impulse(&mut self) -> Result<()> {
        self.check_not_running("removing impulse forces")?;
        for data in &mut self.systems_data {
            data.forces_impulse.clear();
            data.forces_impulse_active.clear();
            data.forces_impulse_breaks.clear();
            data.impulse_break_next_idx = 0;
        }
        Ok(())
    }

    /// Clear the profile forces of a system.
    ///
    /// # Errors
    ///
    /// Fails while running or on an unknown name.
    pub fn remove_forces_profile(&mut self, system_name: &str) -> Result<()> {
        self.check_not_running("removing profile forces")?;
        let idx = self.system_index(system_name)?;
        self.systems_data[idx].forces_profile.clear();
        let (_, min_period) = min_period_included(self.registered_periods());
        self.stepper_update_period = min_period;
        Ok(())
    }

    /// Clear the profile forces of every system.
    ///
    /// # Errors
    ///
    /// Fails while running.
    pub fn remove_all_forces_profile(&mut self) -> Result<()> {
        self.check_not_running("removing profile forces")?;
        for data in &mut self.systems_data {
            data.forces_profile.clear();
        }
        let (_, min_period) = min_period_included(self.registered_periods());
        self.stepper_update_period = min_period;
        Ok(())
    }

    /// Clear every registered force.
    ///
    /// # Errors
    ///
    /// Fails while running.
    pub fn remove_all_forces(&mut self) -> Result<()> {
        self.remove_all_forces_coupling()?;
        self.remove_all_forces_impulse()?;
        self.remove_all_forces_profile()?;
        Ok(())
    }

    /// Registered impulse forces of a system.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` on an unknown name.
    pub fn forces_impulse(&self, system_name: &str) -> Result<&[ForceImpulse]> {
        let idx = self.system_index(system_name)?;
        Ok(&self.systems_data[idx].forces_impulse)
    }

    /// Registered profile forces of a system.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` on an unknown name.
    pub fn forces_profile(&self, system_name: &str) -> Result<&[ForceProfile]> {
        let idx = self.system_index(system_name)?;
        Ok(&self.systems_data[idx].forces_profile)
    }

    /// All sampling periods currently registered (controller, sensors,
    /// profile forces).
    fn registered_periods(&self) -> Vec<f64> {
        let mut periods = vec![
            self.options.stepper.sensors_update_period,
            self.options.stepper.controller_update_period,
        ];
        for data in &self.systems_data {
            for profile in &data.forces_profile {
                periods.push(profile.update_period);
            }
        }
        periods
    }

    // ------------------------------------------------------------------
    // Options and environment
    // ------------------------------------------------------------------

    /// Active options.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Validate and install new options. On failure the previous options are
    /// left in place.
    ///
    /// # Errors
    ///
    /// Fails while running or on any invalid value.
    pub fn set_options(&mut self, options: EngineOptions) -> Result<()> {
        self.check_not_running("updating the options")?;
        options.validate()?;

        let (included, min_period) = min_period_included(
            self.systems_data
                .iter()
                .flat_map(|d| d.forces_profile.iter().map(|p| p.update_period))
                .chain([
                    options.stepper.sensors_update_period,
                    options.stepper.controller_update_period,
                ]),
        );
        if !included {
            return Err(EngineError::bad_input(
                "in discrete mode, the controller and sensor update periods must be \
                 multiple of each other",
            ));
        }

        /* Reseed the random generator whenever the configured seed changes,
        so reproducibility is tied to the options snapshot. */
        if options.stepper.random_seed != self.options.stepper.random_seed {
            self.rng.reset(options.stepper.random_seed);
        }

        self.contact_model = ContactModel::from_option(&options.contacts.model)?;
        self.stepper_update_period = min_period;
        self.options = options;
        Ok(())
    }

    /// Install a ground profile.
    ///
    /// # Errors
    ///
    /// Fails while running.
    pub fn set_ground_profile(&mut self, profile: GroundProfile) -> Result<()> {
        self.check_not_running("changing the ground profile")?;
        self.ground_profile = profile;
        Ok(())
    }

    /// Telemetry timestamp resolution, seconds per tick.
    #[must_use]
    pub fn telemetry_time_unit(&self) -> f64 {
        STEPPER_MIN_TIMESTEP
    }

    /// Largest simulation time loggable at the current resolution.
    #[must_use]
    pub fn max_simulation_duration(&self) -> f64 {
        self.telemetry_recorder.maximum_log_time()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Reset the engine between simulations.
    ///
    /// Optionally reseeds the random generator and clears the dynamic force
    /// registries. Robots and controllers are reset; telemetry is
    /// unconfigured so the next `start` re-registers everything.
    pub fn reset(&mut self, reset_random_numbers: bool, remove_all_forces: bool) {
        if self.is_simulation_running {
            self.stop();
        }
        self.log_data = None;

        if remove_all_forces {
            for data in &mut self.systems_data {
                data.forces_impulse.clear();
                data.forces_impulse_active.clear();
                data.forces_impulse_breaks.clear();
                data.impulse_break_next_idx = 0;
                data.forces_profile.clear();
            }
            let (_, min_period) = min_period_included([
                self.options.stepper.sensors_update_period,
                self.options.stepper.controller_update_period,
            ]);
            self.stepper_update_period = min_period;
        }

        if reset_random_numbers {
            self.rng.reset(self.options.stepper.random_seed);
        }

        for system in &self.systems {
            system.robot.borrow_mut().reset();
            system.controller.borrow_mut().reset();
        }
        for data in &mut self.systems_data {
            data.state.clear();
            data.state_prev.clear();
        }

        self.telemetry_sender.reset();
        self.telemetry_recorder.reset();
        self.iteration_field = None;
        self.is_telemetry_configured = false;
    }

    /// Validate the initial state, arm the stepper and solvers, seed the
    /// first step and transition to `Running`.
    ///
    /// # Errors
    ///
    /// `Generic` while running, `InitFailed` without systems or with
    /// uninitialized hardware, `BadInput` on dimension or bound violations.
    pub fn start(
        &mut self,
        q_init: &HashMap<String, DVector<f64>>,
        v_init: &HashMap<String, DVector<f64>>,
        a_init: Option<&HashMap<String, DVector<f64>>>,
    ) -> Result<()> {
        self.check_not_running("starting again")?;
        if self.systems.is_empty() {
            return Err(EngineError::init_failed(
                "no system to simulate, add one before starting",
            ));
        }
        if q_init.len() != self.systems.len() || v_init.len() != self.systems.len() {
            return Err(EngineError::bad_input(
                "the number of initial configurations and velocities must match the number \
                 of systems",
            ));
        }

        // Validate and order the initial state of every system.
        let mut q_split: Vec<DVector<f64>> = Vec::with_capacity(self.systems.len());
        let mut v_split: Vec<DVector<f64>> = Vec::with_capacity(self.systems.len());
        for system in &self.systems {
            let (Some(q), Some(v)) = (q_init.get(&system.name), v_init.get(&system.name)) else {
                return Err(EngineError::bad_input(format!(
                    "system '{}' does not have an initial configuration or velocity",
                    system.name
                )));
            };
            let robot = system.robot.borrow();
            if q.len() != robot.nq() || v.len() != robot.nv() {
                return Err(EngineError::bad_input(format!(
                    "the dimension of the initial configuration or velocity is inconsistent \
                     with the model size for system '{}'",
                    system.name
                )));
            }
            if !algorithms::is_normalized(robot.model(), q, f64::from(f32::EPSILON)) {
                return Err(EngineError::bad_input(format!(
                    "the initial configuration is not consistent with the joint types of \
                     the model for system '{}'",
                    system.name
                )));
            }
            let (lo, hi) = robot.model().position_limit_vectors();
            let v_lim = robot.model().velocity_limit_vector();
            let out_of_bounds = (0..robot.nq())
                .any(|i| q[i] - hi[i] > EPS || lo[i] - q[i] > EPS)
                || (0..robot.nv()).any(|i| v[i].abs() - v_lim[i] > EPS);
            if out_of_bounds {
                return Err(EngineError::bad_input(format!(
                    "the initial configuration or velocity is out-of-bounds for system '{}'",
                    system.name
                )));
            }
            let mut q_normalized = q.clone();
            algorithms::normalize(robot.model(), &mut q_normalized);
            q_split.push(q_normalized);
            v_split.push(v.clone());
        }

        let mut a_split: Vec<DVector<f64>> = Vec::with_capacity(self.systems.len());
        if let Some(a_init) = a_init {
            if a_init.len() != self.systems.len() {
                return Err(EngineError::bad_input(
                    "if specified, the number of initial accelerations must match the \
                     number of systems",
                ));
            }
            for system in &self.systems {
                let Some(a) = a_init.get(&system.name) else {
                    return Err(EngineError::bad_input(format!(
                        "system '{}' does not have an initial acceleration",
                        system.name
                    )));
                };
                if a.len() != system.robot.borrow().nv() {
                    return Err(EngineError::bad_input(format!(
                        "the dimension of the initial acceleration is inconsistent with \
                         the model size for system '{}'",
                        system.name
                    )));
                }
                a_split.push(a.clone());
            }
        } else {
            a_split.extend(v_split.iter().map(|v| DVector::zeros(v.len())));
        }

        // Hardware sanity.
        for system in &self.systems {
            let robot = system.robot.borrow();
            if robot.sensors().iter().any(|s| !s.is_initialized()) {
                return Err(EngineError::init_failed(
                    "at least one sensor of a robot is not initialized",
                ));
            }
            if robot.motors().iter().any(|m| !m.is_initialized()) {
                return Err(EngineError::init_failed(
                    "at least one motor of a robot is not initialized",
                ));
            }
        }

        /* Reset if the internal state of the engine is not clean. Not doing
        it systematically gives the opportunity to alter the robots between
        simulations. */
        if self.is_telemetry_configured {
            self.reset(false, false);
        }

        // Reinitialize per-system state buffers and propagate gravity.
        for (system, data) in self.systems.iter().zip(&mut self.systems_data) {
            let mut robot = system.robot.borrow_mut();
            robot.set_gravity(self.options.world.gravity);
            data.state.initialize(&robot);
            data.state_prev.initialize(&robot);
        }

        // Instantiate the ODE stepper.
        let models: Vec<crate::model::Model> = self
            .systems
            .iter()
            .map(|s| s.robot.borrow().model().clone())
            .collect();
        self.stepper = Some(match self.options.stepper.ode_solver.as_str() {
            "runge_kutta_dopri5" => Box::new(Dopri5Stepper::new(
                models,
                self.options.stepper.tol_abs,
                self.options.stepper.tol_rel,
            )),
            "runge_kutta_4" => Box::new(RungeKutta4Stepper::new(models)),
            _ => Box::new(EulerExplicitStepper::new(models)) as Box<dyn Stepper>,
        });

        self.stepper_state.reset(
            SIMULATION_MIN_TIMESTEP,
            q_split.clone(),
            v_split.clone(),
            a_split,
        );

        // Previous forces and accelerations buffers.
        self.contact_forces_prev.clear();
        self.f_prev.clear();
        self.a_prev.clear();
        for system in &self.systems {
            let robot = system.robot.borrow();
            self.contact_forces_prev.push(robot.contact_forces.clone());
            self.f_prev.push(robot.data().force.clone());
            self.a_prev.push(robot.data().a_world.clone());
        }

        self.sync_systems_state_with_stepper(false);

        // Frame indices may have changed between simulations: re-resolve
        // every registered force binding.
        for coupling in &mut self.forces_coupling {
            coupling.frame_idx1 = self.systems[coupling.system_idx1]
                .robot
                .borrow()
                .model()
                .frame_index(&coupling.frame_name1)?;
            coupling.frame_idx2 = self.systems[coupling.system_idx2]
                .robot
                .borrow()
                .model()
                .frame_index(&coupling.frame_name2)?;
        }

        for (system, data) in self.systems.iter().zip(&mut self.systems_data) {
            let robot = system.robot.borrow();
            for profile in &mut data.forces_profile {
                profile.frame_idx = robot.model().frame_index(&profile.frame_name)?;
            }
            for impulse in &mut data.forces_impulse {
                impulse.frame_idx = robot.model().frame_index(&impulse.frame_name)?;
            }
            data.impulse_break_next_idx = 0;
            for active in &mut data.forces_impulse_active {
                *active = false;
            }
            // Activate every impulse window containing the time origin.
            for (active, impulse) in data
                .forces_impulse_active
                .iter_mut()
                .zip(&data.forces_impulse)
            {
                if impulse.t < STEPPER_MIN_TIMESTEP {
                    *active = true;
                }
            }
        }

        // Initial kinematics, constraint snapshot and contact buffers.
        for (i, (system, data)) in self.systems.iter().zip(&mut self.systems_data).enumerate() {
            dynamics::compute_forward_kinematics(
                system,
                &q_split[i],
                &v_split[i],
                &self.stepper_state.a_split[i],
            );

            {
                let robot = system.robot.borrow();
                data.constraints_holder = robot.constraints().share();
                data.contact_frames_forces =
                    vec![Force::zero(); robot.contact_frame_indices().len()];
                data.collision_bodies_forces = robot
                    .collision_bodies()
                    .iter()
                    .map(|_| vec![Force::zero()])
                    .collect();
            }

            system
                .robot
                .borrow_mut()
                .reset_constraints(&q_split[i], &v_split[i])?;

            /* Baumgarte stabilization for all internal constraints, and
            default-enabled contact constraints: starting in the
            post-hysteresis state avoids discontinuities at init. */
            let contact_model = self.contact_model;
            let freq = self.options.contacts.stabilization_freq;
            data.constraints_holder.foreach(|constraint, group| {
                let mut handle = constraint.borrow_mut();
                if group != ConstraintGroup::User {
                    handle.set_baumgarte_freq(freq);
                }
                if contact_model == ContactModel::Constraint && group != ConstraintGroup::User {
                    handle.enable();
                }
            });
        }

        // Initial contact force sanity for the compliant model.
        if self.contact_model == ContactModel::SpringDamper {
            let mut force_max: f64 = 0.0;
            for (system, data) in self.systems.iter().zip(&mut self.systems_data) {
                let frames: Vec<usize> =
                    system.robot.borrow().contact_frame_indices().to_vec();
                for (i, frame_idx) in frames.iter().enumerate() {
                    let constraint = data.constraints_holder.contact_frames[i].1.clone();
                    let mut f_local = Force::zero();
                    dynamics::compute_contact_dynamics_at_frame(
                        system,
                        &self.options,
                        self.contact_model,
                        &self.ground_profile,
                        *frame_idx,
                        &constraint,
                        &mut f_local,
                    );
                    force_max = force_max.max(f_local.linear.norm());
                }
                let bodies = system.robot.borrow().collision_bodies().to_vec();
                for (i, body) in bodies.iter().enumerate() {
                    let constraint = data.constraints_holder.collision_bodies[i][0].1.clone();
                    let mut f_local = Force::zero();
                    dynamics::compute_contact_dynamics_at_body(
                        system,
                        &self.options,
                        self.contact_model,
                        &self.ground_profile,
                        body,
                        &constraint,
                        &mut f_local,
                    );
                    force_max = force_max.max(f_local.linear.norm());
                }
            }
            if force_max > 1e5 {
                return Err(EngineError::bad_input(
                    "the initial force exceeds 1e5 for at least one contact point, \
                     update the initial state for the sake of numerical stability",
                ));
            }
        }

        // Lock the robots: no topology change can happen anymore.
        for (system, data) in self.systems.iter().zip(&mut self.systems_data) {
            data.robot_lock = Some(Robot::lock(&system.robot)?);
        }

        // Instantiate the constraint solvers.
        for (system, data) in self.systems.iter().zip(&mut self.systems_data) {
            data.constraint_solver = match self.options.constraints.solver.as_str() {
                "PGS" => Some(PgsSolver::new(
                    system.robot.borrow().nv(),
                    &data.constraints_holder,
                    self.options.contacts.friction,
                    self.options.contacts.torsion,
                    self.options.stepper.tol_abs,
                    self.options.stepper.tol_rel,
                    PGS_MAX_ITERATIONS,
                )),
                _ => None,
            };
        }

        // All efforts and external forces, excluding user internal dynamics.
        dynamics::compute_all_terms(
            &self.systems,
            &mut self.systems_data,
            &mut self.forces_coupling,
            &self.options,
            self.contact_model,
            &self.ground_profile,
            0.0,
            &q_split,
            &v_split,
        );

        // Backup forces and efforts excluding constraint reactions.
        let fext_no_const: Vec<Vec<Force>> = self
            .systems_data
            .iter()
            .map(|d| d.state.f_external.clone())
            .collect();
        let u_internal_const: Vec<DVector<f64>> = self
            .systems_data
            .iter()
            .map(|d| d.state.u_internal.clone())
            .collect();

        /* Solve the algebraic coupling between accelerations, sensors and
        controllers by fixed-point iteration. */
        for iteration in 0..INIT_ITERATIONS {
            for (i, (system, data)) in
                self.systems.iter_mut().zip(&mut self.systems_data).enumerate()
            {
                data.state.f_external = fext_no_const[i].clone();
                data.state.u_internal = u_internal_const[i].clone();

                let a = dynamics::compute_acceleration(
                    system,
                    data,
                    &self.options,
                    &q_split[i],
                    &v_split[i],
                    iteration == 0,
                );
                if a.iter().any(|x| x.is_nan()) {
                    return Err(EngineError::generic(
                        "impossible to compute the acceleration, probably a subtree has \
                         zero inertia along an articulated axis",
                    ));
                }
                data.state.a = a;

                {
                    let mut robot = system.robot.borrow_mut();
                    robot.set_sensors_data(
                        0.0,
                        &q_split[i],
                        &v_split[i],
                        &data.state.a,
                        &data.state.u_motor,
                        &data.state.f_external,
                    );
                }

                let mut command = std::mem::replace(&mut data.state.command, DVector::zeros(0));
                dynamics::compute_command(system, 0.0, &q_split[i], &v_split[i], &mut command);
                data.state.command = command;

                {
                    let mut robot = system.robot.borrow_mut();
                    robot.compute_motors_efforts(
                        0.0,
                        &q_split[i],
                        &v_split[i],
                        &data.state.a,
                        &data.state.command,
                    );
                    data.state.u_motor = robot.motors_efforts().clone();
                }

                data.state.u_custom.fill(0.0);
                system.controller.borrow_mut().internal_dynamics(
                    0.0,
                    &q_split[i],
                    &v_split[i],
                    &mut data.state.u_custom,
                );

                data.state.u = &data.state.u_internal + &data.state.u_custom;
                let robot = system.robot.borrow();
                for (k, motor) in robot.motors().iter().enumerate() {
                    data.state.u[motor.joint_velocity_idx()] += data.state.u_motor[k];
                }
            }
        }

        // One last sensor refresh with the converged acceleration.
        for (i, (system, data)) in self.systems.iter().zip(&self.systems_data).enumerate() {
            system.robot.borrow_mut().set_sensors_data(
                0.0,
                &q_split[i],
                &v_split[i],
                &data.state.a,
                &data.state.u_motor,
                &data.state.f_external,
            );
        }

        dynamics::compute_all_extra_terms(&self.systems);
        dynamics::sync_all_accelerations_and_forces(
            &self.systems,
            &mut self.contact_forces_prev,
            &mut self.f_prev,
            &mut self.a_prev,
        );
        self.sync_stepper_state_with_systems();

        for data in &mut self.systems_data {
            data.state_prev = data.state.clone();
        }

        // Lock telemetry registration and log the immutable constants.
        self.configure_telemetry()?;
        self.register_telemetry_constants()?;
        self.telemetry_recorder
            .initialize(&mut self.telemetry_sender, STEPPER_MIN_TIMESTEP);

        self.is_simulation_running = true;
        Ok(())
    }

    /// Run a full simulation: reset, start, loop until `t_end`, stop.
    ///
    /// # Errors
    ///
    /// Propagates `start`/`step` failures; partial telemetry through the
    /// last successful snapshot stays retrievable via [`Engine::get_log`].
    pub fn simulate(
        &mut self,
        t_end: f64,
        q_init: &HashMap<String, DVector<f64>>,
        v_init: &HashMap<String, DVector<f64>>,
        a_init: Option<&HashMap<String, DVector<f64>>>,
    ) -> Result<()> {
        if self.systems.is_empty() {
            return Err(EngineError::init_failed(
                "no system to simulate, add one before starting",
            ));
        }
        if t_end < SIMULATION_MIN_DURATION {
            return Err(EngineError::bad_input(
                "the duration of the simulation cannot be shorter than 5ms",
            ));
        }

        self.reset(true, false);
        let result = self.start(q_init, v_init, a_init);
        if let Err(err) = result {
            self.stop();
            return Err(err);
        }

        if t_end > self.telemetry_recorder.maximum_log_time() {
            self.stop();
            return Err(EngineError::bad_input(
                "time overflow: the maximum loggable time is exceeded at the current \
                 logger precision",
            ));
        }

        let mut failure: Option<EngineError> = None;
        loop {
            if t_end - self.stepper_state.t < SIMULATION_MIN_TIMESTEP {
                if self.options.stepper.verbose {
                    info!("simulation done: desired final time reached");
                }
                break;
            }

            // Cooperative stop through the system callbacks.
            let mut callback_false = false;
            for (system, data) in self.systems.iter_mut().zip(&self.systems_data) {
                if !(system.callback)(self.stepper_state.t, &data.state.q, &data.state.v) {
                    callback_false = true;
                    break;
                }
            }
            if callback_false {
                if self.options.stepper.verbose {
                    info!("simulation done: callback returned false");
                }
                break;
            }

            if self.options.stepper.iter_max > 0
                && self.stepper_state.iter >= self.options.stepper.iter_max
            {
                if self.options.stepper.verbose {
                    info!("simulation done: maximum number of integration steps exceeded");
                }
                break;
            }

            // One integration step up to the next telemetry breakpoint.
            let step_size = if self.stepper_update_period.is_finite() {
                self.stepper_update_period
                    .min(t_end - self.stepper_state.t)
            } else {
                self.options.stepper.dt_max.min(t_end - self.stepper_state.t)
            };
            if let Err(err) = self.step(step_size) {
                failure = Some(err);
                break;
            }
        }

        self.stop();
        failure.map_or(Ok(()), Err)
    }

    /// Stop the simulation: flush the final telemetry snapshot and release
    /// the robot locks. Idempotent.
    pub fn stop(&mut self) {
        for data in &mut self.systems_data {
            data.robot_lock = None;
        }
        if !self.is_simulation_running {
            return;
        }

        // Final point of the log data.
        self.update_telemetry();
        self.log_data = None;

        /* Disarm the recorder without clearing its buffers: the recorded
        trajectory remains accessible until the next start. */
        self.telemetry_recorder.reset();
        self.is_simulation_running = false;
    }

    /// Advance the simulation by `step_size` (or one default period when
    /// non-positive).
    ///
    /// # Errors
    ///
    /// `Generic` when no simulation is running or on integration failure
    /// (NaN, dt underflow, repeated rejections, timeout), `BadInput` on an
    /// out-of-range step size.
    pub fn step(&mut self, step_size: f64) -> Result<()> {
        if !self.is_simulation_running {
            return Err(EngineError::generic(
                "no simulation running, start one before stepping",
            ));
        }
        let Some(mut stepper) = self.stepper.take() else {
            return Err(EngineError::generic("stepper not initialized"));
        };
        let result = self.step_core(stepper.as_mut(), step_size);
        self.stepper = Some(stepper);
        result
    }

    #[allow(clippy::too_many_lines)]
    fn step_core(&mut self, stepper: &mut dyn Stepper, mut step_size: f64) -> Result<()> {
        // Previous log snapshots are invalidated by new data.
        self.log_data = None;

        // Sanity check on the integration state.
        let state_nan = self
            .stepper_state
            .q_split
            .iter()
            .chain(&self.stepper_state.v_split)
            .chain(&self.stepper_state.a_split)
            .any(|x| x.iter().any(|v| v.is_nan()));
        if state_nan {
            return Err(EngineError::generic(
                "the low-level ode solver failed, consider increasing the stepper accuracy",
            ));
        }

        if step_size > EPS && step_size < SIMULATION_MIN_TIMESTEP {
            return Err(EngineError::bad_input(
                "the requested step size is out of bounds",
            ));
        }

        /* Default step size: controller period if discrete-time, else sensor
        period if discrete-time, else the user-defined maximum. */
        if step_size < EPS {
            step_size = if self.options.stepper.controller_update_period > EPS {
                self.options.stepper.controller_update_period
            } else if self.options.stepper.sensors_update_period > EPS {
                self.options.stepper.sensors_update_period
            } else {
                self.options.stepper.dt_max
            };
        }

        if self.stepper_state.t + step_size > self.telemetry_recorder.maximum_log_time() {
            return Err(EngineError::generic(
                "time overflow: the maximum loggable time is exceeded at the current \
                 logger precision",
            ));
        }

        /* Kahan-compensated time target: track the accumulated rounding
        error so the sum does not drift unboundedly. */
        let step_size_true = step_size - self.stepper_state.t_error;
        let t_end = self.stepper_state.t + step_size_true;
        self.stepper_state.t_error = (t_end - self.stepper_state.t) - step_size_true;

        let mut successive_iter_failed: u64 = 0;
        let mut is_nan = false;
        let mut has_dynamics_changed = false;
        let timer = Instant::now();
        let timeout = self.options.stepper.timeout;
        let mut failure: Option<EngineError> = None;

        while t_end - self.stepper_state.t >= STEPPER_MIN_TIMESTEP && failure.is_none() {
            let t = self.stepper_state.t;

            // Update the impulse active set and find the next window edge.
            let mut t_force_impulse_next = f64::INFINITY;
            for data in &mut self.systems_data {
                /* Activate an impulse as soon as the current time gets close
                enough to the application time, and deactivate it following
                the same reasoning. Both edges are already breakpoints so
                the switching cannot happen late. */
                for (active, impulse) in data
                    .forces_impulse_active
                    .iter_mut()
                    .zip(&data.forces_impulse)
                {
                    if t > impulse.t - STEPPER_MIN_TIMESTEP {
                        *active = true;
                        has_dynamics_changed = true;
                    }
                    if t >= impulse.t + impulse.dt - STEPPER_MIN_TIMESTEP {
                        *active = false;
                        has_dynamics_changed = true;
                    }
                }

                if data.impulse_break_next_idx < data.forces_impulse_breaks.len()
                    && t >= data.forces_impulse_breaks[data.impulse_break_next_idx]
                        - STEPPER_MIN_TIMESTEP
                {
                    // The current breakpoint is behind in time, move on.
                    data.impulse_break_next_idx += 1;
                }
                if data.impulse_break_next_idx < data.forces_impulse_breaks.len() {
                    t_force_impulse_next = t_force_impulse_next
                        .min(data.forces_impulse_breaks[data.impulse_break_next_idx]);
                }
            }

            // Sample the discrete-time profile forces on their breakpoints.
            if self.stepper_update_period.is_finite() {
                for data in &mut self.systems_data {
                    for profile in &mut data.forces_profile {
                        if profile.update_period > EPS {
                            let period = profile.update_period;
                            let dt_next = period - t % period;
                            if dt_next < SIMULATION_MIN_TIMESTEP
                                || period - dt_next < STEPPER_MIN_TIMESTEP
                            {
                                profile.force_prev =
                                    (profile.force_fn)(t, &data.state.q, &data.state.v);
                                has_dynamics_changed = true;
                            }
                        }
                    }
                }
            }

            // Sample the discrete-time controllers on their breakpoints.
            if self.stepper_update_period.is_finite()
                && self.options.stepper.controller_update_period > EPS
            {
                let period = self.options.stepper.controller_update_period;
                let dt_next = period - t % period;
                if dt_next < SIMULATION_MIN_TIMESTEP || period - dt_next < STEPPER_MIN_TIMESTEP {
                    for i in 0..self.systems.len() {
                        let mut command =
                            std::mem::replace(&mut self.systems_data[i].state.command, DVector::zeros(0));
                        dynamics::compute_command(
                            &self.systems[i],
                            t,
                            &self.systems_data[i].state.q,
                            &self.systems_data[i].state.v,
                            &mut command,
                        );
                        self.systems_data[i].state.command = command;
                    }
                    has_dynamics_changed = true;
                }
            }

            /* Telemetry snapshot. The acceleration is logged BEFORE updating
            the dynamics when the command just changed: the acceleration is
            discontinuous there and logging the previous value preserves
            consistency between the sensor data and the robot state. */
            if !self.stepper_update_period.is_finite()
                || !self.options.stepper.log_internal_stepper_steps
            {
                let must_update = if self.stepper_update_period.is_finite() {
                    let period = self.stepper_update_period;
                    let dt_next = period - t % period;
                    dt_next < SIMULATION_MIN_TIMESTEP || period - dt_next < STEPPER_MIN_TIMESTEP
                } else {
                    true
                };
                if must_update {
                    self.update_telemetry();
                }
            }

            // Fix the first-same-as-last assumption after a discontinuity.
            if !self.stepper_update_period.is_finite() && has_dynamics_changed {
                self.refresh_dynamics();
                has_dynamics_changed = false;
            }

            if self.stepper_update_period.is_finite() {
                /* Next breakpoint for the ODE solver: end of step, next
                impulse window edge, or next sampling time. */
                let period = self.stepper_update_period;
                let dt_next_update = period - t % period;
                let mut dt_next_global = if dt_next_update < SIMULATION_MIN_TIMESTEP {
                    /* The next sampling breakpoint is too close: skip one
                    whole period (the sensors were refreshed in
                    anticipation). */
                    (dt_next_update + period).min(t_force_impulse_next - t)
                } else {
                    dt_next_update.min(t_force_impulse_next - t)
                };
                if t_end - t - STEPPER_MIN_TIMESTEP < dt_next_global {
                    dt_next_global = t_end - t;
                }
                let t_next = t + dt_next_global;

                // Integrate the interior of the breakpoint window.
                while t_next - self.stepper_state.t > STEPPER_MIN_TIMESTEP {
                    if successive_iter_failed == 0
                        && self.options.stepper.log_internal_stepper_steps
                    {
                        self.update_telemetry();
                    }

                    if has_dynamics_changed {
                        self.refresh_dynamics();
                        has_dynamics_changed = false;
                    }

                    // Land exactly on the breakpoint.
                    let t_now = self.stepper_state.t;
                    self.stepper_state.dt = self.stepper_state.dt.min(t_next - t_now);
                    if self.stepper_state.dt_largest > SIMULATION_MIN_TIMESTEP {
                        if t_next - (t_now + self.stepper_state.dt) < SIMULATION_MIN_TIMESTEP {
                            self.stepper_state.dt = t_next - t_now;
                        }
                    } else if t_next - (t_now + self.stepper_state.dt) < STEPPER_MIN_TIMESTEP {
                        self.stepper_state.dt = t_next - t_now;
                    }

                    /* Snap to microsecond multiples whenever possible so
                    breakpoints and logged times stay on the grid. */
                    if self.stepper_state.dt > SIMULATION_MIN_TIMESTEP {
                        let residual = self.stepper_state.dt % SIMULATION_MIN_TIMESTEP;
                        if residual > STEPPER_MIN_TIMESTEP
                            && residual < SIMULATION_MIN_TIMESTEP - STEPPER_MIN_TIMESTEP
                            && self.stepper_state.dt - residual > STEPPER_MIN_TIMESTEP
                        {
                            self.stepper_state.dt -= residual;
                        }
                    }

                    // Abort conditions surface after the current iteration.
                    if self.stepper_state.dt < STEPPER_MIN_TIMESTEP {
                        break;
                    }
                    if EPS < timeout && timeout < timer.elapsed().as_secs_f64() {
                        break;
                    }
                    if successive_iter_failed
                        > self.options.stepper.successive_iter_failed_max
                    {
                        break;
                    }

                    let is_breakpoint_reached =
                        self.stepper_state.dt_largest > self.stepper_state.dt;
                    self.stepper_state.dt_largest = self.stepper_state.dt;

                    let is_step_successful = self.try_one_step(stepper);

                    is_nan = self.stepper_state.dt_largest.is_nan();
                    if is_nan {
                        break;
                    }

                    if is_step_successful {
                        successive_iter_failed = 0;
                        self.on_step_success(is_breakpoint_reached);
                    } else {
                        successive_iter_failed += 1;
                        self.stepper_state.iter_failed += 1;
                    }

                    self.stepper_state.dt = self
                        .stepper_state
                        .dt_largest
                        .min(self.options.stepper.dt_max);
                }
            } else {
                /* Continuous mode: step freely, stopping at the end of step
                and at impulse window edges. */
                let t_now = self.stepper_state.t;
                self.stepper_state.dt = self
                    .stepper_state
                    .dt
                    .min(t_end - t_now)
                    .min(t_force_impulse_next - t_now);

                let is_breakpoint_reached =
                    self.stepper_state.dt_largest > self.stepper_state.dt;

                let mut is_step_successful = false;
                while !is_step_successful {
                    self.stepper_state.dt_largest = self.stepper_state.dt;

                    if successive_iter_failed
                        > self.options.stepper.successive_iter_failed_max
                    {
                        break;
                    }

                    is_step_successful = self.try_one_step(stepper);

                    is_nan = self.stepper_state.dt_largest.is_nan();
                    if is_nan {
                        break;
                    }

                    if is_step_successful {
                        successive_iter_failed = 0;
                        self.on_step_success(is_breakpoint_reached);
                    } else {
                        successive_iter_failed += 1;
                        self.stepper_state.iter_failed += 1;
                    }

                    self.stepper_state.dt = self
                        .stepper_state
                        .dt_largest
                        .min(self.options.stepper.dt_max);
                }
            }

            // Fatal condition ladder.
            if is_nan {
                failure = Some(EngineError::generic(
                    "something is wrong with the physics, aborting integration",
                ));
            } else if successive_iter_failed > self.options.stepper.successive_iter_failed_max
            {
                failure = Some(EngineError::generic(
                    "too many successive iteration failures, probably something is wrong \
                     with the physics, aborting integration",
                ));
            } else if self.stepper_state.dt < STEPPER_MIN_TIMESTEP {
                failure = Some(EngineError::generic(
                    "the internal time step is getting too small, impossible to integrate \
                     physics further in time",
                ));
            } else if EPS < timeout && timeout < timer.elapsed().as_secs_f64() {
                failure = Some(EngineError::generic("step computation timeout"));
            }

            // Refresh the sensors, either continuously or on a breakpoint.
            if failure.is_none() {
                let period = self.options.stepper.sensors_update_period;
                let t_now = self.stepper_state.t;
                let must_update_sensors = if period < EPS {
                    true
                } else {
                    let dt_next = period - t_now % period;
                    dt_next < SIMULATION_MIN_TIMESTEP || period - dt_next < STEPPER_MIN_TIMESTEP
                };
                if must_update_sensors {
                    for (system, data) in self.systems.iter().zip(&self.systems_data) {
                        system.robot.borrow_mut().set_sensors_data(
                            t_now,
                            &data.state.q,
                            &data.state.v,
                            &data.state.a,
                            &data.state.u_motor,
                            &data.state.f_external,
                        );
                    }
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }

        /* Force the final time to the requested target: the caller asked for
        a step of exactly `step_size` and expects it to be reached. */
        self.stepper_state.t = t_end;
        Ok(())
    }

    /// One `try_step` invocation with the dynamics callable wired in.
    fn try_one_step(&mut self, stepper: &mut dyn Stepper) -> bool {
        stepper.try_step(
            &mut |t, q, v, a| {
                dynamics::compute_systems_dynamics(
                    &mut self.systems,
                    &mut self.systems_data,
                    &mut self.forces_coupling,
                    &self.options,
                    self.contact_model,
                    &self.ground_profile,
                    &mut self.contact_forces_prev,
                    &mut self.f_prev,
                    &mut self.a_prev,
                    t,
                    q,
                    v,
                    a,
                );
            },
            &mut self.stepper_state.q_split,
            &mut self.stepper_state.v_split,
            &mut self.stepper_state.a_split,
            &mut self.stepper_state.t,
            &mut self.stepper_state.dt_largest,
        )
    }

    /// Re-evaluate the dynamics at the current state after a discontinuity,
    /// so the derivative handed to the stepper is valid again.
    fn refresh_dynamics(&mut self) {
        let t = self.stepper_state.t;
        let q = std::mem::take(&mut self.stepper_state.q_split);
        let v = std::mem::take(&mut self.stepper_state.v_split);
        let mut a = std::mem::take(&mut self.stepper_state.a_split);
        dynamics::compute_systems_dynamics(
            &mut self.systems,
            &mut self.systems_data,
            &mut self.forces_coupling,
            &self.options,
            self.contact_model,
            &self.ground_profile,
            &mut self.contact_forces_prev,
            &mut self.f_prev,
            &mut self.a_prev,
            t,
            &q,
            &v,
            &mut a,
        );
        self.stepper_state.q_split = q;
        self.stepper_state.v_split = v;
        self.stepper_state.a_split = a;

        dynamics::compute_all_extra_terms(&self.systems);
        dynamics::sync_all_accelerations_and_forces(
            &self.systems,
            &mut self.contact_forces_prev,
            &mut self.f_prev,
            &mut self.a_prev,
        );
        self.sync_systems_state_with_stepper(true);
    }

    /// Bookkeeping after a successful integration step.
    fn on_step_success(&mut self, is_breakpoint_reached: bool) {
        // Actual joint accelerations and forces from up-to-date kinematics.
        dynamics::compute_all_extra_terms(&self.systems);
        dynamics::sync_all_accelerations_and_forces(
            &self.systems,
            &mut self.contact_forces_prev,
            &mut self.f_prev,
            &mut self.a_prev,
        );
        self.sync_systems_state_with_stepper(false);

        self.stepper_state.iter += 1;

        /* Restore the step size when it was significantly shortened to land
        on a breakpoint, to avoid re-converging the estimate. */
        if is_breakpoint_reached {
            let threshold = self.stepper_state.dt_largest_prev
                * self.options.stepper.dt_restore_threshold_rel;
            if self.stepper_state.dt < self.stepper_state.dt_largest
                && self.stepper_state.dt_largest < threshold
            {
                self.stepper_state.dt_largest = self.stepper_state.dt_largest_prev;
            }
        }

        self.stepper_state.t_prev = self.stepper_state.t;
        self.stepper_state.dt_largest_prev = self.stepper_state.dt_largest;
        for data in &mut self.systems_data {
            data.state_prev = data.state.clone();
        }
    }

    fn sync_stepper_state_with_systems(&mut self) {
        self.stepper_state.q_split.clear();
        self.stepper_state.v_split.clear();
        self.stepper_state.a_split.clear();
        for data in &self.systems_data {
            self.stepper_state.q_split.push(data.state.q.clone());
            self.stepper_state.v_split.push(data.state.v.clone());
            self.stepper_state.a_split.push(data.state.a.clone());
        }
    }

    fn sync_systems_state_with_stepper(&mut self, acceleration_only: bool) {
        if acceleration_only {
            for (data, a) in self.systems_data.iter_mut().zip(&self.stepper_state.a_split) {
                data.state.a = a.clone();
            }
        } else {
            for (i, data) in self.systems_data.iter_mut().enumerate() {
                data.state.q = self.stepper_state.q_split[i].clone();
                data.state.v = self.stepper_state.v_split[i].clone();
                data.state.a = self.stepper_state.a_split[i].clone();
            }
        }
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    fn prefixed(system_name: &str, field: &str) -> String {
        if system_name.is_empty() {
            field.to_string()
        } else {
            format!("{system_name}{TELEMETRY_DELIMITER}{field}")
        }
    }

    fn configure_telemetry(&mut self) -> Result<()> {
        if self.systems.is_empty() {
            return Err(EngineError::init_failed("no system added to the engine"));
        }
        if self.is_telemetry_configured {
            return Ok(());
        }

        self.iteration_field = Some(
            self.telemetry_sender
                .register_int("Global.iteration", 0)?,
        );

        for (system, data) in self.systems.iter().zip(&mut self.systems_data) {
            let robot = system.robot.borrow();
            let telemetry = &self.options.telemetry;
            let ids = &mut data.log_ids;
            *ids = state::SystemLogIds::default();

            if telemetry.enable_configuration {
                for name in robot.log_fieldnames_position() {
                    ids.position.push(
                        self.telemetry_sender
                            .register_float(Self::prefixed(&system.name, &name), 0.0)?,
                    );
                }
            }
            if telemetry.enable_velocity {
                for name in robot.log_fieldnames_velocity() {
                    ids.velocity.push(
                        self.telemetry_sender
                            .register_float(Self::prefixed(&system.name, &name), 0.0)?,
                    );
                }
            }
            if telemetry.enable_acceleration {
                for name in robot.log_fieldnames_acceleration() {
                    ids.acceleration.push(
                        self.telemetry_sender
                            .register_float(Self::prefixed(&system.name, &name), 0.0)?,
                    );
                }
            }
            if telemetry.enable_force_external {
                for name in robot.log_fieldnames_force_external() {
                    ids.force_external.push(
                        self.telemetry_sender
                            .register_float(Self::prefixed(&system.name, &name), 0.0)?,
                    );
                }
            }
            if telemetry.enable_command {
                for name in robot.log_fieldnames_command() {
                    ids.command.push(
                        self.telemetry_sender
                            .register_float(Self::prefixed(&system.name, &name), 0.0)?,
                    );
                }
            }
            if telemetry.enable_motor_effort {
                for name in robot.log_fieldnames_motor_effort() {
                    ids.motor_effort.push(
                        self.telemetry_sender
                            .register_float(Self::prefixed(&system.name, &name), 0.0)?,
                    );
                }
            }
            if telemetry.enable_energy {
                ids.energy = Some(
                    self.telemetry_sender
                        .register_float(Self::prefixed(&system.name, "energy"), 0.0)?,
                );
            }

            // Sensors register their own measurement coordinates.
            for sensor in robot.sensors() {
                for name in sensor.fieldnames() {
                    ids.sensors.push(
                        self.telemetry_sender
                            .register_float(Self::prefixed(&system.name, &name), 0.0)?,
                    );
                }
            }
            drop(robot);

            system
                .controller
                .borrow_mut()
                .register_telemetry(&mut self.telemetry_sender, &system.name)?;
        }

        self.is_telemetry_configured = true;
        Ok(())
    }

    fn register_telemetry_constants(&mut self) -> Result<()> {
        for system in &self.systems {
            let robot = system.robot.borrow();
            self.telemetry_sender.register_constant(
                Self::prefixed(&system.name, "urdf_file"),
                robot.urdf().unwrap_or_default(),
            )?;
            self.telemetry_sender.register_constant(
                Self::prefixed(&system.name, "has_freeflyer"),
                if robot.model().has_free_flyer() {
                    "1"
                } else {
                    "0"
                },
            )?;
            self.telemetry_sender.register_constant(
                Self::prefixed(&system.name, "mesh_package_dirs"),
                robot.mesh_package_dirs().join(";"),
            )?;
            // Compact model description, enough to rebuild frame bindings.
            let model = robot.model();
            let summary = format!(
                "{}:nq={}:nv={}:joints={}",
                model.name,
                model.nq,
                model.nv,
                model
                    .joints
                    .iter()
                    .skip(1)
                    .map(|j| j.name.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            );
            self.telemetry_sender
                .register_constant(Self::prefixed(&system.name, "model"), summary)?;

            if self.options.telemetry.is_persistent {
                let collision = robot
                    .collision_bodies()
                    .iter()
                    .map(|b| format!("{}:{}", b.frame_name, b.radius))
                    .collect::<Vec<_>>()
                    .join(";");
                self.telemetry_sender.register_constant(
                    Self::prefixed(&system.name, "collision_model"),
                    collision,
                )?;
            }
        }

        let options_json = serde_json::to_string(&self.options)
            .map_err(|e| EngineError::generic(format!("cannot serialize options: {e}")))?;
        self.telemetry_sender
            .register_constant("options", options_json)?;
        Ok(())
    }

    fn update_telemetry(&mut self) {
        for (system, data) in self.systems.iter().zip(&mut self.systems_data) {
            // Total mechanical energy at the current state.
            let energy = {
                let mut robot = system.robot.borrow_mut();
                let (model, robot_data) = robot.model_and_data_mut();
                algorithms::compute_energies(model, robot_data, &data.state.q, &data.state.v);
                robot_data.total_energy()
            };

            let ids = &data.log_ids;
            for (id, value) in ids.position.iter().zip(data.state.q.iter()) {
                self.telemetry_sender.update_float(*id, *value);
            }
            for (id, value) in ids.velocity.iter().zip(data.state.v.iter()) {
                self.telemetry_sender.update_float(*id, *value);
            }
            for (id, value) in ids.acceleration.iter().zip(data.state.a.iter()) {
                self.telemetry_sender.update_float(*id, *value);
            }
            if !ids.force_external.is_empty() {
                let mut k = 0;
                for force in data.state.f_external.iter().skip(1) {
                    let vec = force.to_vector();
                    for c in 0..6 {
                        self.telemetry_sender.update_float(ids.force_external[k], vec[c]);
                        k += 1;
                    }
                }
            }
            for (id, value) in ids.command.iter().zip(data.state.command.iter()) {
                self.telemetry_sender.update_float(*id, *value);
            }
            for (id, value) in ids.motor_effort.iter().zip(data.state.u_motor.iter()) {
                self.telemetry_sender.update_float(*id, *value);
            }
            if let Some(id) = ids.energy {
                self.telemetry_sender.update_float(id, energy);
            }

            let robot = system.robot.borrow();
            let mut k = 0;
            for sensor in robot.sensors() {
                for value in sensor.value().iter() {
                    if k < ids.sensors.len() {
                        self.telemetry_sender.update_float(ids.sensors[k], *value);
                    }
                    k += 1;
                }
            }
            drop(robot);

            system
                .controller
                .borrow_mut()
                .update_telemetry(&mut self.telemetry_sender);
        }

        if let Some(id) = self.iteration_field {
            #[allow(clippy::cast_possible_wrap)]
            self.telemetry_sender
                .update_int(id, self.stepper_state.iter as i64);
        }

        self.telemetry_recorder
            .flush_snapshot(&self.telemetry_sender, self.stepper_state.t);
    }

    // ------------------------------------------------------------------
    // Log access
    // ------------------------------------------------------------------

    /// Lazily snapshot the recorded log.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` when telemetry was never configured.
    pub fn get_log(&mut self) -> Result<Rc<LogData>> {
        if self.telemetry_recorder.log_data().fieldnames.is_empty() {
            return Err(EngineError::bad_input(
                "telemetry not configured, run a simulation before requesting the log",
            ));
        }
        if self.log_data.is_none() {
            self.log_data = Some(Rc::new(self.telemetry_recorder.log_data()));
        }
        self.log_data
            .clone()
            .ok_or_else(|| EngineError::generic("log data unavailable"))
    }

    /// Write the recorded log to disk.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` without recorded data or on I/O errors.
    pub fn write_log(&mut self, path: &Path, format: LogFormat) -> Result<()> {
        let log = self.get_log()?;
        crate::log::write_log(path, &log, format)
    }

    /// Read a log file from disk.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` on I/O or decoding errors.
    pub fn read_log(path: &Path, format: LogFormat) -> Result<LogData> {
        crate::log::read_log(path, format)
    }

    /// Fieldname of the global time column.
    #[must_use]
    pub fn global_time_fieldname() -> &'static str {
        GLOBAL_TIME
    }
}
