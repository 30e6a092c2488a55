//! Engine-wide timing and solver constants.

/// Absolute floor below which a time step cannot shrink. Also the telemetry
/// time unit: logged timestamps are integer multiples of this value.
pub const STEPPER_MIN_TIMESTEP: f64 = 1e-10;

/// Granularity of user-visible breakpoints (1 µs). Update periods, telemetry
/// sampling and step-size snapping are aligned on multiples of this value.
pub const SIMULATION_MIN_TIMESTEP: f64 = 1e-6;

/// Largest admissible integration time step.
pub const SIMULATION_MAX_TIMESTEP: f64 = 0.02;

/// Maximum number of projected Gauss-Seidel sweeps per solve.
pub const PGS_MAX_ITERATIONS: u32 = 100;

/// Floor of the Delassus diagonal regularization term.
pub const PGS_MIN_REGULARIZER: f64 = 1e-11;

/// Fixed-point iterations solving the algebraic coupling between
/// acceleration, sensors and controller at simulation start.
pub const INIT_ITERATIONS: u32 = 4;

/// Tolerance below which a floating-point quantity is considered zero.
pub const EPS: f64 = f64::EPSILON;

/// Shortest duration accepted by `Engine::simulate`.
pub const SIMULATION_MIN_DURATION: f64 = 5e-3;

/// Delimiter between the system name and the variable name in telemetry
/// fieldnames.
pub const TELEMETRY_DELIMITER: &str = ".";

/// Fieldname of the global time column, always first in the log.
pub const GLOBAL_TIME: &str = "Global.Time";
