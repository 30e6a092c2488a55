//! Deterministic multi-robot rigid-body simulation engine.
//!
//! This crate simulates articulated mechanical systems — trees of joints
//! with an optional free-flyer root, motors, sensors and a user control law
//! — under contact, kinematic constraints and user-registered external
//! forces. The engine advances the global state with a fixed- or
//! adaptive-step integrator while honoring periodic controller and sensor
//! sampling, impulse-force windows and contact state transitions, and logs
//! aligned telemetry snapshots along the way.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           Engine                              │
//! │  breakpoint scheduler · integration loop · telemetry          │
//! └───────┬───────────────┬───────────────────┬───────────────────┘
//!         │               │                   │
//!         ▼               ▼                   ▼
//!   Robot (model,    Steppers (Euler,   Constraint solver
//!   data, hardware,  RK4, DOPRI5)       (projected Gauss-Seidel,
//!   constraints)                         friction cones, bounds)
//! ```
//!
//! [`Model`] is immutable after construction; [`model::Data`] holds every
//! derived quantity. The state vectors `q`/`v` are the source of truth and
//! body poses always come from forward kinematics.
//!
//! # Quick start
//!
//! ```
//! use std::cell::RefCell;
//! use std::collections::HashMap;
//! use std::rc::Rc;
//! use sim_engine::{model::factories, Engine, Robot};
//!
//! // A single pendulum released from the horizontal.
//! let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
//!     1, 1.0, 1.0,
//! ))));
//! let mut engine = Engine::new();
//! engine
//!     .add_system("pendulum", robot, Box::new(|_, _, _| true))
//!     .expect("fresh engine");
//!
//! let mut q0 = HashMap::new();
//! q0.insert("pendulum".to_string(), nalgebra::DVector::from_vec(vec![1.0]));
//! let mut v0 = HashMap::new();
//! v0.insert("pendulum".to_string(), nalgebra::DVector::zeros(1));
//! engine.simulate(0.1, &q0, &v0, None).expect("short swing");
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,      // Many methods can't be const due to nalgebra
    clippy::suboptimal_flops,          // mul_add style changes aren't always clearer
    clippy::neg_cmp_op_on_partial_ord, // !(x >= 0.0) is intentional for NaN rejection
    clippy::option_if_let_else,        // if-let is often more readable than map_or_else
    clippy::too_many_lines,            // Physics functions naturally have many steps
    clippy::doc_markdown,              // Not all technical terms need backticks
    clippy::module_name_repetitions
)]

pub mod constants;
pub mod constraint;
pub mod contact;
pub mod control;
pub mod engine;
pub mod error;
pub mod forces;
pub mod log;
pub mod model;
pub mod motor;
pub mod random;
pub mod robot;
pub mod sensor;
pub mod spatial;
pub mod stepper;
pub mod telemetry;

pub use constants::{SIMULATION_MAX_TIMESTEP, SIMULATION_MIN_TIMESTEP, STEPPER_MIN_TIMESTEP};
pub use contact::{flat_ground, ContactModel, GroundProfile};
pub use control::{Controller, FunctionController};
pub use engine::options::{
    ContactOptions, EngineOptions, JointOptions, StepperOptions, TelemetryOptions, WorldOptions,
};
pub use engine::state::{StepperState, SystemState};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use forces::{ForceCoupling, ForceImpulse, ForceProfile, FramePair};
pub use log::LogFormat;
pub use model::{JointType, Model};
pub use motor::Motor;
pub use robot::Robot;
pub use sensor::{EffortSensor, EncoderSensor, ForceSensor, ImuSensor, Sensor};
pub use spatial::{Force, Motion, Placement, SpatialInertia};
pub use telemetry::LogData;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::factories;
    use approx::assert_relative_eq;
    use nalgebra::DVector;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[test]
    fn test_engine_basic_pendulum_swing() {
        let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
            1, 1.0, 1.0,
        ))));
        let mut engine = Engine::new();
        engine
            .add_system("pendulum", robot, Box::new(|_, _, _| true))
            .expect("add system");

        let mut q0 = HashMap::new();
        q0.insert("pendulum".to_string(), DVector::from_vec(vec![0.5]));
        let mut v0 = HashMap::new();
        v0.insert("pendulum".to_string(), DVector::zeros(1));

        engine.simulate(0.5, &q0, &v0, None).expect("simulate");
        assert!(!engine.is_simulation_running());

        // The pendulum must have swung towards equilibrium.
        let log = engine.get_log().expect("log");
        assert!(!log.timestamps.is_empty());
        let t_final = *log.timestamps.last().expect("samples") as f64 * log.time_unit;
        assert_relative_eq!(t_final, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_engine_rejects_mutation_while_running() {
        let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
            1, 1.0, 1.0,
        ))));
        let mut engine = Engine::new();
        engine
            .add_system("pendulum", robot.clone(), Box::new(|_, _, _| true))
            .expect("add system");

        let mut q0 = HashMap::new();
        q0.insert("pendulum".to_string(), DVector::zeros(1));
        let mut v0 = HashMap::new();
        v0.insert("pendulum".to_string(), DVector::zeros(1));
        engine.start(&q0, &v0, None).expect("start");
        assert!(engine.is_simulation_running());

        let other = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
            2, 1.0, 1.0,
        ))));
        assert!(engine
            .add_system("other", other, Box::new(|_, _, _| true))
            .is_err());
        assert!(engine.set_options(EngineOptions::default()).is_err());
        assert!(engine.remove_all_forces().is_err());

        engine.stop();
        assert!(!engine.is_simulation_running());
    }

    #[test]
    fn test_engine_duplicate_system_rejected() {
        let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
            1, 1.0, 1.0,
        ))));
        let mut engine = Engine::new();
        engine
            .add_system("a", robot.clone(), Box::new(|_, _, _| true))
            .expect("add system");
        let err = engine.add_system("a", robot.clone(), Box::new(|_, _, _| true));
        assert!(err.is_err());
        // Same robot under a different name is rejected too.
        let err = engine.add_system("b", robot, Box::new(|_, _, _| true));
        assert!(err.is_err());
    }

    #[test]
    fn test_engine_bad_initial_state_dimension() {
        let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
            2, 1.0, 1.0,
        ))));
        let mut engine = Engine::new();
        engine
            .add_system("chain", robot, Box::new(|_, _, _| true))
            .expect("add system");

        let mut q0 = HashMap::new();
        q0.insert("chain".to_string(), DVector::zeros(1));
        let mut v0 = HashMap::new();
        v0.insert("chain".to_string(), DVector::zeros(2));
        let err = engine.start(&q0, &v0, None);
        assert!(err.is_err());
        assert!(err.unwrap_err().is_bad_input());
    }
}
