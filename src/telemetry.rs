//! Telemetry surface: structured registration of time-series variables and
//! scalar constants, with periodic snapshot recording.
//!
//! Registration is open until the recorder is initialized (at simulation
//! start); afterwards the variable set is locked and only value updates are
//! accepted. Timestamps are stored as integer multiples of the recorder time
//! unit so logged times never drift.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::constants::GLOBAL_TIME;
use crate::error::{EngineError, Result};

/// Handle of a registered telemetry variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldId {
    kind: FieldKind,
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Int,
    Float,
}

/// Registry of telemetry constants and variables with their current values.
#[derive(Debug, Default)]
pub struct TelemetrySender {
    locked: bool,
    constants: Vec<(String, String)>,
    int_fields: Vec<String>,
    int_values: Vec<i64>,
    float_fields: Vec<String>,
    float_values: Vec<f64>,
    index: HashMap<String, FieldId>,
}

impl TelemetrySender {
    /// Create an empty, unlocked registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every registration and unlock.
    pub fn reset(&mut self) {
        self.locked = false;
        self.constants.clear();
        self.int_fields.clear();
        self.int_values.clear();
        self.float_fields.clear();
        self.float_values.clear();
        self.index.clear();
    }

    /// Whether registration is locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Register a scalar constant. Order of registration is preserved.
    ///
    /// # Errors
    ///
    /// Fails with `Generic` once registration is locked.
    pub fn register_constant(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        if self.locked {
            return Err(EngineError::generic(
                "telemetry registration is locked, cannot register new constants",
            ));
        }
        self.constants.push((key.into(), value.into()));
        Ok(())
    }

    /// Register a float time-series variable with its initial value.
    ///
    /// # Errors
    ///
    /// Fails with `Generic` once registration is locked or when the name is
    /// taken.
    pub fn register_float(&mut self, name: impl Into<String>, initial: f64) -> Result<FieldId> {
        let name = name.into();
        self.check_registrable(&name)?;
        let id = FieldId {
            kind: FieldKind::Float,
            index: self.float_fields.len(),
        };
        self.float_fields.push(name.clone());
        self.float_values.push(initial);
        self.index.insert(name, id);
        Ok(id)
    }

    /// Register an integer time-series variable with its initial value.
    ///
    /// # Errors
    ///
    /// Fails with `Generic` once registration is locked or when the name is
    /// taken.
    pub fn register_int(&mut self, name: impl Into<String>, initial: i64) -> Result<FieldId> {
        let name = name.into();
        self.check_registrable(&name)?;
        let id = FieldId {
            kind: FieldKind::Int,
            index: self.int_fields.len(),
        };
        self.int_fields.push(name.clone());
        self.int_values.push(initial);
        self.index.insert(name, id);
        Ok(id)
    }

    fn check_registrable(&self, name: &str) -> Result<()> {
        if self.locked {
            return Err(EngineError::generic(
                "telemetry registration is locked, cannot register new variables",
            ));
        }
        if name == GLOBAL_TIME || self.index.contains_key(name) {
            return Err(EngineError::bad_input(format!(
                "telemetry variable '{name}' already registered"
            )));
        }
        Ok(())
    }

    /// Update the value of a registered float variable.
    pub fn update_float(&mut self, id: FieldId, value: f64) {
        debug_assert!(matches!(id.kind, FieldKind::Float));
        self.float_values[id.index] = value;
    }

    /// Update the value of a registered integer variable.
    pub fn update_int(&mut self, id: FieldId, value: i64) {
        debug_assert!(matches!(id.kind, FieldKind::Int));
        self.int_values[id.index] = value;
    }

    /// Look up a registered variable by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<FieldId> {
        self.index.get(name).copied()
    }
}

/// Complete log content: timestamps, per-field data matrices, field names in
/// log order (time first, then integer fields, then float fields), and the
/// ordered constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogData {
    /// Format version.
    pub version: i32,
    /// Seconds per timestamp tick.
    pub time_unit: f64,
    /// Timestamps in ticks.
    pub timestamps: Vec<i64>,
    /// Integer variables, `[field][sample]`.
    pub int_data: Vec<Vec<i64>>,
    /// Float variables, `[field][sample]`.
    pub float_data: Vec<Vec<f64>>,
    /// Field names: `Global.Time`, then integer fields, then float fields.
    pub fieldnames: Vec<String>,
    /// Ordered `(key, value)` constants.
    pub constants: Vec<(String, String)>,
}

/// Current log format version.
pub const LOG_VERSION: i32 = 1;

/// Snapshot recorder accumulating telemetry rows.
#[derive(Debug, Default)]
pub struct TelemetryRecorder {
    initialized: bool,
    time_unit: f64,
    timestamps: Vec<i64>,
    int_data: Vec<Vec<i64>>,
    float_data: Vec<Vec<f64>>,
    fieldnames: Vec<String>,
    constants: Vec<(String, String)>,
}

impl TelemetryRecorder {
    /// Create an idle recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock registration on the sender and arm the recorder. Clears any data
    /// from a previous run.
    pub fn initialize(&mut self, sender: &mut TelemetrySender, time_unit: f64) {
        sender.locked = true;
        self.initialized = true;
        self.time_unit = time_unit;
        self.timestamps.clear();
        self.int_data = vec![Vec::new(); sender.int_fields.len()];
        self.float_data = vec![Vec::new(); sender.float_fields.len()];
        self.fieldnames = std::iter::once(GLOBAL_TIME.to_string())
            .chain(sender.int_fields.iter().cloned())
            .chain(sender.float_fields.iter().cloned())
            .collect();
        self.constants = sender.constants.clone();
    }

    /// Whether `initialize` ran since the last `reset`.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Largest time value representable with the current time unit.
    #[must_use]
    pub fn maximum_log_time(&self) -> f64 {
        // Stay within the exactly-representable integer range of f64.
        9.0e15 * self.time_unit
    }

    /// Append one aligned row across all registered variables.
    pub fn flush_snapshot(&mut self, sender: &TelemetrySender, t: f64) {
        if !self.initialized {
            return;
        }
        #[allow(clippy::cast_possible_truncation)]
        self.timestamps.push((t / self.time_unit).round() as i64);
        for (column, value) in self.int_data.iter_mut().zip(&sender.int_values) {
            column.push(*value);
        }
        for (column, value) in self.float_data.iter_mut().zip(&sender.float_values) {
            column.push(*value);
        }
    }

    /// Disarm the recorder. Recorded data stays readable until the next
    /// `initialize`.
    pub fn reset(&mut self) {
        self.initialized = false;
    }

    /// Produce a snapshot of the recorded log.
    #[must_use]
    pub fn log_data(&self) -> LogData {
        LogData {
            version: LOG_VERSION,
            time_unit: self.time_unit,
            timestamps: self.timestamps.clone(),
            int_data: self.int_data.clone(),
            float_data: self.float_data.clone(),
            fieldnames: self.fieldnames.clone(),
            constants: self.constants.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_lock() {
        let mut sender = TelemetrySender::new();
        let x = sender.register_float("x", 0.0).unwrap();
        sender.register_constant("release", "1.0").unwrap();

        let mut recorder = TelemetryRecorder::new();
        recorder.initialize(&mut sender, 1e-10);
        assert!(sender.register_float("y", 0.0).is_err());
        assert!(sender.register_constant("late", "nope").is_err());

        sender.update_float(x, 4.2);
        recorder.flush_snapshot(&sender, 1e-3);
        let log = recorder.log_data();
        assert_eq!(log.timestamps, vec![10_000_000]);
        assert_eq!(log.float_data[0], vec![4.2]);
        assert_eq!(log.fieldnames, vec![GLOBAL_TIME.to_string(), "x".to_string()]);
        assert_eq!(log.constants, vec![("release".to_string(), "1.0".to_string())]);
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let mut sender = TelemetrySender::new();
        sender.register_float("x", 0.0).unwrap();
        assert!(sender.register_float("x", 1.0).is_err());
        assert!(sender.register_int(GLOBAL_TIME, 0).is_err());
    }

    #[test]
    fn test_field_order_ints_before_floats() {
        let mut sender = TelemetrySender::new();
        sender.register_float("f", 0.0).unwrap();
        sender.register_int("i", 7).unwrap();
        let mut recorder = TelemetryRecorder::new();
        recorder.initialize(&mut sender, 1e-10);
        recorder.flush_snapshot(&sender, 0.0);
        let log = recorder.log_data();
        assert_eq!(log.fieldnames, vec![GLOBAL_TIME, "i", "f"]);
        assert_eq!(log.int_data[0], vec![7]);
    }
}
