//! Robot aggregate: model, kinematic scratch, hardware and constraint
//! registry.
//!
//! A robot is shared between the caller and the engine through an
//! `Rc<RefCell<_>>` handle. While a simulation runs the engine holds a
//! [`RobotLock`], freezing the topology: contact frames, collision bodies,
//! motors and sensors cannot change until the lock is released.

use nalgebra::DVector;
use std::cell::RefCell;
use std::rc::Rc;

use crate::constraint::{
    ConstraintHandle, ConstraintKind, ConstraintsHolder, FixedFrameConstraint,
    JointBoundConstraint, SharedConstraint,
};
use crate::error::{EngineError, Result};
use crate::model::{algorithms, Data, Model};
use crate::motor::{compute_motors_efforts, Motor};
use crate::sensor::{Sensor, SensorContext};
use crate::spatial::Force;

/// Sphere geometry attached to a frame, tested against the ground.
#[derive(Debug, Clone)]
pub struct CollisionBody {
    /// Supporting frame name.
    pub frame_name: String,
    /// Supporting frame index.
    pub frame_idx: usize,
    /// Sphere radius.
    pub radius: f64,
}

/// Rotational spring-damper acting in the tangent space of a spherical
/// joint, modeling structural flexibility.
#[derive(Debug, Clone)]
pub struct FlexibilityConfig {
    /// Flexible (spherical) joint index.
    pub joint_idx: usize,
    /// Per-axis rotational stiffness.
    pub stiffness: nalgebra::Vector3<f64>,
    /// Per-axis rotational damping.
    pub damping: nalgebra::Vector3<f64>,
}

/// Guard freezing a robot topology for the duration of a simulation.
pub struct RobotLock {
    robot: Rc<RefCell<Robot>>,
}

impl Drop for RobotLock {
    fn drop(&mut self) {
        if let Ok(mut robot) = self.robot.try_borrow_mut() {
            robot.locked = false;
        }
    }
}

/// A simulated articulated mechanism.
pub struct Robot {
    model: Model,
    data: Data,
    motors: Vec<Motor>,
    sensors: Vec<Box<dyn Sensor>>,
    contact_frame_names: Vec<String>,
    contact_frame_indices: Vec<usize>,
    collision_bodies: Vec<CollisionBody>,
    flexibility: Vec<FlexibilityConfig>,
    constraints: ConstraintsHolder,
    /// Contact force at each contact frame, local frame coordinates.
    pub contact_forces: Vec<Force>,
    motors_efforts: DVector<f64>,
    urdf: Option<String>,
    mesh_package_dirs: Vec<String>,
    locked: bool,
    initialized: bool,
}

impl Robot {
    /// Wrap a model into a simulatable robot.
    #[must_use]
    pub fn new(model: Model) -> Self {
        let data = model.make_data();
        let mut robot = Self {
            model,
            data,
            motors: Vec::new(),
            sensors: Vec::new(),
            contact_frame_names: Vec::new(),
            contact_frame_indices: Vec::new(),
            collision_bodies: Vec::new(),
            flexibility: Vec::new(),
            constraints: ConstraintsHolder::default(),
            contact_forces: Vec::new(),
            motors_efforts: DVector::zeros(0),
            urdf: None,
            mesh_package_dirs: Vec::new(),
            locked: false,
            initialized: true,
        };
        robot.rebuild_bound_constraints();
        robot
    }

    /// Attach the source description string, logged as a telemetry constant.
    pub fn set_urdf(&mut self, urdf: impl Into<String>) {
        self.urdf = Some(urdf.into());
    }

    /// Source description string, if any.
    #[must_use]
    pub fn urdf(&self) -> Option<&str> {
        self.urdf.as_deref()
    }

    /// Mesh package lookup directories, logged as a telemetry constant.
    pub fn set_mesh_package_dirs(&mut self, dirs: Vec<String>) {
        self.mesh_package_dirs = dirs;
    }

    /// Mesh package lookup directories.
    #[must_use]
    pub fn mesh_package_dirs(&self) -> &[String] {
        &self.mesh_package_dirs
    }

    /// Whether the robot is usable.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The kinematic model.
    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Mutable model access, rejected while locked.
    ///
    /// # Errors
    ///
    /// Fails with `Generic` while a simulation holds the lock.
    pub fn model_mut(&mut self) -> Result<&mut Model> {
        self.check_unlocked()?;
        Ok(&mut self.model)
    }

    /// Force-set the gravity field (engine-internal, works under lock).
    pub(crate) fn set_gravity(&mut self, gravity: nalgebra::Vector6<f64>) {
        self.model.gravity = gravity;
    }

    /// The kinematic scratch.
    #[must_use]
    pub fn data(&self) -> &Data {
        &self.data
    }

    /// Mutable kinematic scratch.
    pub fn data_mut(&mut self) -> &mut Data {
        &mut self.data
    }

    /// Model and mutable scratch together (for algorithm calls).
    pub fn model_and_data_mut(&mut self) -> (&Model, &mut Data) {
        (&self.model, &mut self.data)
    }

    /// Configuration vector width.
    #[must_use]
    pub fn nq(&self) -> usize {
        self.model.nq
    }

    /// Velocity vector width.
    #[must_use]
    pub fn nv(&self) -> usize {
        self.model.nv
    }

    fn check_unlocked(&self) -> Result<()> {
        if self.locked {
            return Err(EngineError::generic(
                "robot is locked by a running simulation",
            ));
        }
        Ok(())
    }

    /// Acquire the topology lock.
    ///
    /// # Errors
    ///
    /// Fails with `Generic` when the robot is already locked.
    pub fn lock(robot: &Rc<RefCell<Robot>>) -> Result<RobotLock> {
        {
            let mut inner = robot.borrow_mut();
            inner.check_unlocked()?;
            inner.locked = true;
        }
        Ok(RobotLock {
            robot: robot.clone(),
        })
    }

    // -- hardware -----------------------------------------------------------

    /// Attach a motor.
    ///
    /// # Errors
    ///
    /// Fails while locked or when the driven joint is invalid.
    pub fn attach_motor(&mut self, mut motor: Motor) -> Result<()> {
        self.check_unlocked()?;
        motor.initialize(&self.model)?;
        self.motors.push(motor);
        self.motors_efforts = DVector::zeros(self.motors.len());
        Ok(())
    }

    /// Attach a sensor.
    ///
    /// # Errors
    ///
    /// Fails while locked or when the sensor target is invalid.
    pub fn attach_sensor(&mut self, mut sensor: Box<dyn Sensor>) -> Result<()> {
        self.check_unlocked()?;
        sensor.initialize(&self.model)?;
        self.sensors.push(sensor);
        Ok(())
    }

    /// Attached motors.
    #[must_use]
    pub fn motors(&self) -> &[Motor] {
        &self.motors
    }

    /// Attached sensors.
    #[must_use]
    pub fn sensors(&self) -> &[Box<dyn Sensor>] {
        &self.sensors
    }

    /// Number of motors, which is also the command vector width.
    #[must_use]
    pub fn n_motors(&self) -> usize {
        self.motors.len()
    }

    /// Latest motor efforts.
    #[must_use]
    pub fn motors_efforts(&self) -> &DVector<f64> {
        &self.motors_efforts
    }

    /// Evaluate motor efforts for a command vector.
    pub fn compute_motors_efforts(
        &mut self,
        _t: f64,
        _q: &DVector<f64>,
        _v: &DVector<f64>,
        _a_prev: &DVector<f64>,
        command: &DVector<f64>,
    ) {
        compute_motors_efforts(&self.motors, command, &mut self.motors_efforts);
    }

    /// Refresh every sensor from the given state.
    pub fn set_sensors_data(
        &mut self,
        t: f64,
        q: &DVector<f64>,
        v: &DVector<f64>,
        a: &DVector<f64>,
        u_motor: &DVector<f64>,
        f_external: &[Force],
    ) {
        let ctx = SensorContext {
            t,
            model: &self.model,
            data: &self.data,
            q,
            v,
            a,
            u_motor,
            f_external,
        };
        for sensor in &mut self.sensors {
            sensor.update(&ctx);
        }
    }

    // -- contact geometry ---------------------------------------------------

    /// Declare point-contact frames by name.
    ///
    /// # Errors
    ///
    /// Fails while locked or on an unknown frame.
    pub fn add_contact_frames(&mut self, names: &[&str]) -> Result<()> {
        self.check_unlocked()?;
        for name in names {
            let idx = self.model.frame_index(name)?;
            if self.contact_frame_indices.contains(&idx) {
                return Err(EngineError::bad_input(format!(
                    "frame '{name}' is already a contact frame"
                )));
            }
            self.contact_frame_names.push((*name).to_string());
            self.contact_frame_indices.push(idx);
        }
        self.contact_forces = vec![Force::zero(); self.contact_frame_indices.len()];
        self.rebuild_contact_constraints();
        Ok(())
    }

    /// Declare a sphere collision body on a frame.
    ///
    /// # Errors
    ///
    /// Fails while locked or on an unknown frame.
    pub fn add_collision_body(&mut self, frame_name: &str, radius: f64) -> Result<()> {
        self.check_unlocked()?;
        let frame_idx = self.model.frame_index(frame_name)?;
        self.collision_bodies.push(CollisionBody {
            frame_name: frame_name.to_string(),
            frame_idx,
            radius,
        });
        self.rebuild_collision_constraints();
        Ok(())
    }

    /// Contact frame indices.
    #[must_use]
    pub fn contact_frame_indices(&self) -> &[usize] {
        &self.contact_frame_indices
    }

    /// Contact frame names.
    #[must_use]
    pub fn contact_frame_names(&self) -> &[String] {
        &self.contact_frame_names
    }

    /// Collision bodies.
    #[must_use]
    pub fn collision_bodies(&self) -> &[CollisionBody] {
        &self.collision_bodies
    }

    /// Declare rotational flexibility on a spherical joint.
    ///
    /// # Errors
    ///
    /// Fails while locked or when the joint is not spherical.
    pub fn add_flexibility(
        &mut self,
        joint_name: &str,
        stiffness: nalgebra::Vector3<f64>,
        damping: nalgebra::Vector3<f64>,
    ) -> Result<()> {
        self.check_unlocked()?;
        let joint_idx = self.model.joint_index(joint_name)?;
        if !matches!(
            self.model.joints[joint_idx].joint_type,
            crate::model::JointType::Spherical
        ) {
            return Err(EngineError::bad_input(format!(
                "flexibility requires a spherical joint, '{joint_name}' is not one"
            )));
        }
        self.flexibility.push(FlexibilityConfig {
            joint_idx,
            stiffness,
            damping,
        });
        Ok(())
    }

    /// Declared flexibility joints.
    #[must_use]
    pub fn flexibility(&self) -> &[FlexibilityConfig] {
        &self.flexibility
    }

    // -- constraints --------------------------------------------------------

    fn rebuild_bound_constraints(&mut self) {
        self.constraints.bound_joints.clear();
        for (idx, joint) in self.model.joints.iter().enumerate().skip(1) {
            if joint.position_limits.is_some() {
                let handle = Rc::new(RefCell::new(ConstraintHandle::new(
                    ConstraintKind::JointBound(JointBoundConstraint {
                        joint_idx: idx,
                        reference: 0.0,
                        above_upper: false,
                    }),
                )));
                self.constraints
                    .bound_joints
                    .push((joint.name.clone(), handle));
            }
        }
    }

    fn rebuild_contact_constraints(&mut self) {
        self.constraints.contact_frames.clear();
        for (name, idx) in self
            .contact_frame_names
            .iter()
            .zip(&self.contact_frame_indices)
        {
            let handle = Rc::new(RefCell::new(ConstraintHandle::new(
                ConstraintKind::FixedFrame(FixedFrameConstraint::contact(*idx)),
            )));
            self.constraints.contact_frames.push((name.clone(), handle));
        }
    }

    fn rebuild_collision_constraints(&mut self) {
        self.constraints.collision_bodies.clear();
        for body in &self.collision_bodies {
            let handle = Rc::new(RefCell::new(ConstraintHandle::new(
                ConstraintKind::FixedFrame(FixedFrameConstraint::contact(body.frame_idx)),
            )));
            self.constraints
                .collision_bodies
                .push(vec![(body.frame_name.clone(), handle)]);
        }
    }

    /// Refresh joint-bound constraints after model limit changes.
    ///
    /// # Errors
    ///
    /// Fails while locked.
    pub fn refresh_bound_constraints(&mut self) -> Result<()> {
        self.check_unlocked()?;
        self.rebuild_bound_constraints();
        Ok(())
    }

    /// Register a user constraint.
    ///
    /// # Errors
    ///
    /// Fails while locked or on a duplicated name.
    pub fn add_constraint(&mut self, name: &str, constraint: ConstraintHandle) -> Result<()> {
        self.check_unlocked()?;
        if self.constraints.registered.iter().any(|(n, _)| n == name) {
            return Err(EngineError::bad_input(format!(
                "a constraint named '{name}' is already registered"
            )));
        }
        self.constraints
            .registered
            .push((name.to_string(), Rc::new(RefCell::new(constraint))));
        Ok(())
    }

    /// Remove a user constraint.
    ///
    /// # Errors
    ///
    /// Fails while locked or on an unknown name.
    pub fn remove_constraint(&mut self, name: &str) -> Result<()> {
        self.check_unlocked()?;
        let before = self.constraints.registered.len();
        self.constraints.registered.retain(|(n, _)| n != name);
        if self.constraints.registered.len() == before {
            return Err(EngineError::bad_input(format!(
                "no constraint named '{name}'"
            )));
        }
        Ok(())
    }

    /// The constraint registry.
    #[must_use]
    pub fn constraints(&self) -> &ConstraintsHolder {
        &self.constraints
    }

    /// Whether any constraint is registered.
    #[must_use]
    pub fn has_constraints(&self) -> bool {
        !self.constraints.is_empty()
    }

    /// Reset every constraint against the current state. Engine-managed
    /// groups start disabled (contact transitions re-enable them); user
    /// constraints keep their enabled state.
    ///
    /// # Errors
    ///
    /// Propagates constraint reset failures.
    pub fn reset_constraints(&mut self, q: &DVector<f64>, v: &DVector<f64>) -> Result<()> {
        algorithms::kinematics_pass(&self.model, &mut self.data, q, v);
        algorithms::update_frame_placements(&self.model, &mut self.data);
        algorithms::compute_bias_accelerations(&self.model, &mut self.data, v);
        let mut result = Ok(());
        let (model, data) = (&self.model, &self.data);
        self.constraints
            .foreach(|cell: &SharedConstraint, group| {
                let mut constraint = cell.borrow_mut();
                if let Err(err) = constraint.reset(model, data, q, v) {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                if group != crate::constraint::ConstraintGroup::User {
                    constraint.disable();
                }
            });
        result
    }

    /// Recompute the Jacobian and drift of every enabled constraint.
    ///
    /// # Errors
    ///
    /// Propagates constraint evaluation failures.
    pub fn compute_constraints(&mut self, q: &DVector<f64>, v: &DVector<f64>) -> Result<()> {
        algorithms::compute_bias_accelerations(&self.model, &mut self.data, v);
        let mut result = Ok(());
        let (model, data) = (&self.model, &self.data);
        self.constraints.foreach(|cell: &SharedConstraint, _| {
            let mut constraint = cell.borrow_mut();
            if !constraint.is_enabled() {
                return;
            }
            if let Err(err) = constraint.compute(model, data, q, v) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        });
        result
    }

    /// Reset the mutable scratch and sensors between simulations.
    pub fn reset(&mut self) {
        self.data = self.model.make_data();
        self.motors_efforts.fill(0.0);
        for force in &mut self.contact_forces {
            force.set_zero();
        }
        for sensor in &mut self.sensors {
            sensor.reset();
        }
    }

    // -- telemetry fieldnames ----------------------------------------------

    fn per_coordinate_names(&self, prefix: &str, per_velocity: bool) -> Vec<String> {
        let mut names = Vec::new();
        for joint in &self.model.joints[1..] {
            let width = if per_velocity {
                joint.joint_type.nv()
            } else {
                joint.joint_type.nq()
            };
            if width == 1 {
                names.push(format!("{prefix}_{}", joint.name));
            } else {
                for k in 0..width {
                    names.push(format!("{prefix}_{}_{k}", joint.name));
                }
            }
        }
        names
    }

    /// Log fieldnames of the configuration coordinates.
    #[must_use]
    pub fn log_fieldnames_position(&self) -> Vec<String> {
        self.per_coordinate_names("position", false)
    }

    /// Log fieldnames of the velocity coordinates.
    #[must_use]
    pub fn log_fieldnames_velocity(&self) -> Vec<String> {
        self.per_coordinate_names("velocity", true)
    }

    /// Log fieldnames of the acceleration coordinates.
    #[must_use]
    pub fn log_fieldnames_acceleration(&self) -> Vec<String> {
        self.per_coordinate_names("acceleration", true)
    }

    /// Log fieldnames of the external force coordinates (joints 1..).
    #[must_use]
    pub fn log_fieldnames_force_external(&self) -> Vec<String> {
        let comps = ["fx", "fy", "fz", "tx", "ty", "tz"];
        let mut names = Vec::new();
        for joint in &self.model.joints[1..] {
            for comp in comps {
                names.push(format!("force_external_{}_{comp}", joint.name));
            }
        }
        names
    }

    /// Log fieldnames of the command slots.
    #[must_use]
    pub fn log_fieldnames_command(&self) -> Vec<String> {
        self.motors
            .iter()
            .map(|m| format!("command_{}", m.name()))
            .collect()
    }

    /// Log fieldnames of the motor efforts.
    #[must_use]
    pub fn log_fieldnames_motor_effort(&self) -> Vec<String> {
        self.motors
            .iter()
            .map(|m| format!("effort_{}", m.name()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::factories;

    #[test]
    fn test_lock_freezes_topology() {
        let robot = Rc::new(RefCell::new(Robot::new(factories::free_sphere(
            "ball", 1.0, 0.5,
        ))));
        let lock = Robot::lock(&robot).unwrap();
        assert!(Robot::lock(&robot).is_err());
        assert!(robot.borrow_mut().add_contact_frames(&["bottom"]).is_err());
        drop(lock);
        assert!(robot.borrow_mut().add_contact_frames(&["bottom"]).is_ok());
    }

    #[test]
    fn test_contact_frames_build_constraints() {
        let mut robot = Robot::new(factories::free_box("box", 1.0, 1.0, 1.0, 1.0));
        robot
            .add_contact_frames(&["corner_0", "corner_1", "corner_2", "corner_3"])
            .unwrap();
        assert_eq!(robot.constraints().contact_frames.len(), 4);
        assert_eq!(robot.contact_forces.len(), 4);
        assert!(robot.has_constraints());
    }

    #[test]
    fn test_bounded_joint_gets_constraint() {
        let mut model = factories::n_link_pendulum(1, 1.0, 1.0);
        let joint = model.joint_index("pivot_0").unwrap();
        model.set_position_limits(joint, -1.0, 1.0).unwrap();
        let mut robot = Robot::new(model);
        robot.refresh_bound_constraints().unwrap();
        assert_eq!(robot.constraints().bound_joints.len(), 1);
    }
}
