//! Proprioceptive sensors refreshed from the simulation state.
//!
//! Sensors are polled by the engine either continuously (every dynamics
//! evaluation) or on their sampling breakpoints; they read the robot
//! kinematic scratch and the current efforts/forces and cache a measurement
//! vector.

use nalgebra::DVector;

use crate::error::Result;
use crate::model::{algorithms, Data, Model};
use crate::spatial::Force;

/// Inputs made available to sensors at refresh time.
pub struct SensorContext<'a> {
    /// Current time.
    pub t: f64,
    /// Model of the owning robot.
    pub model: &'a Model,
    /// Kinematic scratch of the owning robot.
    pub data: &'a Data,
    /// Configuration.
    pub q: &'a DVector<f64>,
    /// Velocity.
    pub v: &'a DVector<f64>,
    /// Acceleration.
    pub a: &'a DVector<f64>,
    /// Motor efforts.
    pub u_motor: &'a DVector<f64>,
    /// External force per joint, local joint frames.
    pub f_external: &'a [Force],
}

/// A sensor owned by a robot.
pub trait Sensor {
    /// Sensor name, unique within a robot.
    fn name(&self) -> &str;

    /// Whether the sensor was bound to a model.
    fn is_initialized(&self) -> bool;

    /// Resolve model indices.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` when the referenced joint/frame/motor does not
    /// exist.
    fn initialize(&mut self, model: &Model) -> Result<()>;

    /// Clear any internal state.
    fn reset(&mut self);

    /// Refresh the cached measurement.
    fn update(&mut self, ctx: &SensorContext<'_>);

    /// Latest measurement.
    fn value(&self) -> &DVector<f64>;

    /// One name per measurement coordinate.
    fn fieldnames(&self) -> Vec<String>;
}

/// Joint position/velocity encoder.
#[derive(Debug)]
pub struct EncoderSensor {
    name: String,
    joint_name: String,
    idx_q: usize,
    idx_v: usize,
    initialized: bool,
    value: DVector<f64>,
}

impl EncoderSensor {
    /// Encoder on the named 1-DOF joint.
    #[must_use]
    pub fn new(name: impl Into<String>, joint_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            joint_name: joint_name.into(),
            idx_q: 0,
            idx_v: 0,
            initialized: false,
            value: DVector::zeros(2),
        }
    }
}

impl Sensor for EncoderSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize(&mut self, model: &Model) -> Result<()> {
        let idx = model.joint_index(&self.joint_name)?;
        self.idx_q = model.joints[idx].idx_q;
        self.idx_v = model.joints[idx].idx_v;
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.value.fill(0.0);
    }

    fn update(&mut self, ctx: &SensorContext<'_>) {
        self.value[0] = ctx.q[self.idx_q];
        self.value[1] = ctx.v[self.idx_v];
    }

    fn value(&self) -> &DVector<f64> {
        &self.value
    }

    fn fieldnames(&self) -> Vec<String> {
        vec![format!("{}_position", self.name), format!("{}_velocity", self.name)]
    }
}

/// Motor effort sensor.
#[derive(Debug)]
pub struct EffortSensor {
    name: String,
    motor_idx: usize,
    initialized: bool,
    value: DVector<f64>,
}

impl EffortSensor {
    /// Effort sensor reading the motor at `motor_idx`.
    #[must_use]
    pub fn new(name: impl Into<String>, motor_idx: usize) -> Self {
        Self {
            name: name.into(),
            motor_idx,
            initialized: false,
            value: DVector::zeros(1),
        }
    }
}

impl Sensor for EffortSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize(&mut self, _model: &Model) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.value.fill(0.0);
    }

    fn update(&mut self, ctx: &SensorContext<'_>) {
        self.value[0] = if self.motor_idx < ctx.u_motor.len() {
            ctx.u_motor[self.motor_idx]
        } else {
            0.0
        };
    }

    fn value(&self) -> &DVector<f64> {
        &self.value
    }

    fn fieldnames(&self) -> Vec<String> {
        vec![format!("{}_effort", self.name)]
    }
}

/// Inertial measurement unit attached to a frame: orientation quaternion,
/// body-frame angular velocity and body-frame specific force.
#[derive(Debug)]
pub struct ImuSensor {
    name: String,
    frame_name: String,
    frame_idx: usize,
    initialized: bool,
    value: DVector<f64>,
}

impl ImuSensor {
    /// IMU rigidly attached to the named frame.
    #[must_use]
    pub fn new(name: impl Into<String>, frame_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frame_name: frame_name.into(),
            frame_idx: 0,
            initialized: false,
            value: DVector::zeros(10),
        }
    }
}

impl Sensor for ImuSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize(&mut self, model: &Model) -> Result<()> {
        self.frame_idx = model.frame_index(&self.frame_name)?;
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.value.fill(0.0);
    }

    fn update(&mut self, ctx: &SensorContext<'_>) {
        let placement = ctx.data.frame_placement[self.frame_idx];
        let quat = placement.rotation;
        self.value[0] = quat.i;
        self.value[1] = quat.j;
        self.value[2] = quat.k;
        self.value[3] = quat.w;

        let rot_inv = quat.inverse();
        let vel = algorithms::frame_velocity_world_aligned(ctx.model, ctx.data, self.frame_idx);
        let gyro = rot_inv * vel.angular;
        self.value[4] = gyro.x;
        self.value[5] = gyro.y;
        self.value[6] = gyro.z;

        // Specific force: classical acceleration minus the gravity field.
        let parent = ctx.model.frames[self.frame_idx].parent_joint;
        let p = placement.translation.vector;
        let acc = ctx.data.a_world[parent];
        let classical =
            acc.linear + acc.angular.cross(&p) + vel.angular.cross(&vel.linear);
        let specific = rot_inv * (classical - ctx.model.gravity_linear());
        self.value[7] = specific.x;
        self.value[8] = specific.y;
        self.value[9] = specific.z;
    }

    fn value(&self) -> &DVector<f64> {
        &self.value
    }

    fn fieldnames(&self) -> Vec<String> {
        ["quat_x", "quat_y", "quat_z", "quat_w", "gyro_x", "gyro_y", "gyro_z", "accel_x",
            "accel_y", "accel_z"]
            .iter()
            .map(|suffix| format!("{}_{suffix}", self.name))
            .collect()
    }
}

/// Contact force sensor reading the external wrench accumulated on the
/// parent joint of a frame.
#[derive(Debug)]
pub struct ForceSensor {
    name: String,
    frame_name: String,
    parent_joint: usize,
    initialized: bool,
    value: DVector<f64>,
}

impl ForceSensor {
    /// Force sensor on the named frame.
    #[must_use]
    pub fn new(name: impl Into<String>, frame_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frame_name: frame_name.into(),
            parent_joint: 0,
            initialized: false,
            value: DVector::zeros(6),
        }
    }
}

impl Sensor for ForceSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize(&mut self, model: &Model) -> Result<()> {
        let frame_idx = model.frame_index(&self.frame_name)?;
        self.parent_joint = model.frames[frame_idx].parent_joint;
        self.initialized = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.value.fill(0.0);
    }

    fn update(&mut self, ctx: &SensorContext<'_>) {
        let f = ctx.f_external[self.parent_joint];
        for k in 0..3 {
            self.value[k] = f.linear[k];
            self.value[k + 3] = f.angular[k];
        }
    }

    fn value(&self) -> &DVector<f64> {
        &self.value
    }

    fn fieldnames(&self) -> Vec<String> {
        ["fx", "fy", "fz", "tx", "ty", "tz"]
            .iter()
            .map(|suffix| format!("{}_{suffix}", self.name))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::factories;
    use approx::assert_relative_eq;

    #[test]
    fn test_encoder_reads_joint_state() {
        let model = factories::n_link_pendulum(1, 1.0, 1.0);
        let mut data = model.make_data();
        let mut q = DVector::zeros(1);
        q[0] = 0.5;
        let mut v = DVector::zeros(1);
        v[0] = -1.5;
        let a = DVector::zeros(1);
        algorithms::forward_kinematics(&model, &mut data, &q, &v, &a);
        algorithms::update_frame_placements(&model, &mut data);

        let mut sensor = EncoderSensor::new("knee", "pivot_0");
        sensor.initialize(&model).unwrap();
        let u_motor = DVector::zeros(0);
        let fext = vec![Force::zero(); model.njoints()];
        sensor.update(&SensorContext {
            t: 0.0,
            model: &model,
            data: &data,
            q: &q,
            v: &v,
            a: &a,
            u_motor: &u_motor,
            f_external: &fext,
        });
        assert_relative_eq!(sensor.value()[0], 0.5);
        assert_relative_eq!(sensor.value()[1], -1.5);
    }
}
