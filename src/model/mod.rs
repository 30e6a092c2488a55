//! Kinematic-tree model description.
//!
//! Follows the static/dynamic split of the simulation architecture: [`Model`]
//! is immutable after construction (tree topology, joint definitions, frames,
//! inertias), while [`Data`] holds every quantity recomputed along the
//! simulation (placements, velocities, mass matrix, energies). State vectors
//! `q`/`v` are the source of truth; body poses always come from forward
//! kinematics.

pub mod algorithms;
pub mod data;
pub mod factories;

pub use data::Data;

use nalgebra::{UnitQuaternion, Vector3, Vector6};

use crate::error::{EngineError, Result};
use crate::spatial::{Motion, Placement, SpatialInertia};

/// Joint index of the universe (world anchor).
pub const UNIVERSE: usize = 0;

/// Supported joint types.
///
/// Only revolute and prismatic joints support position/velocity bounds;
/// unbounded, mimic and composite joints skip bound enforcement.
#[derive(Debug, Clone, PartialEq)]
pub enum JointType {
    /// 6-DOF unconstrained root joint on SE(3); `q = [p, quat(x,y,z,w)]`.
    Free,
    /// Ball joint on SO(3); `q = quat(x,y,z,w)`.
    Spherical,
    /// Ball joint parameterized by intrinsic Z-Y-X Euler angles.
    SphericalZyx,
    /// 3-DOF translation.
    Translation,
    /// Planar joint; `q = [x, y, cos, sin]`.
    Planar,
    /// Prismatic joint along a unit axis.
    Prismatic(Vector3<f64>),
    /// Revolute joint about a unit axis.
    Revolute(Vector3<f64>),
    /// Revolute joint without configuration bounds; `q = [cos, sin]`.
    RevoluteUnbounded(Vector3<f64>),
    /// Mimic joint mirroring another joint; carries no own state.
    Mimic,
    /// Composite joint with opaque state widths.
    Composite {
        /// Width of the position slice.
        nq: usize,
        /// Width of the velocity slice.
        nv: usize,
    },
}

impl JointType {
    /// Width of the position slice.
    #[must_use]
    pub fn nq(&self) -> usize {
        match self {
            Self::Free => 7,
            Self::Spherical | Self::Planar => 4,
            Self::SphericalZyx | Self::Translation => 3,
            Self::RevoluteUnbounded(_) => 2,
            Self::Prismatic(_) | Self::Revolute(_) => 1,
            Self::Mimic => 0,
            Self::Composite { nq, .. } => *nq,
        }
    }

    /// Width of the velocity slice.
    #[must_use]
    pub fn nv(&self) -> usize {
        match self {
            Self::Free => 6,
            Self::Spherical | Self::SphericalZyx | Self::Translation | Self::Planar => 3,
            Self::Prismatic(_) | Self::Revolute(_) | Self::RevoluteUnbounded(_) => 1,
            Self::Mimic => 0,
            Self::Composite { nv, .. } => *nv,
        }
    }

    /// Whether position/velocity bounds apply to this joint type.
    #[must_use]
    pub fn supports_bounds(&self) -> bool {
        matches!(self, Self::Prismatic(_) | Self::Revolute(_))
    }
}

/// One joint of the kinematic tree, together with the body rigidly attached
/// to it.
#[derive(Debug, Clone)]
pub struct Joint {
    /// Joint name, unique within the model.
    pub name: String,
    /// Joint type.
    pub joint_type: JointType,
    /// Parent joint index (0 is the universe).
    pub parent: usize,
    /// Placement of the joint frame in the parent joint frame at `q = 0`.
    pub placement: Placement,
    /// Inertia of the attached body, in the joint frame.
    pub inertia: SpatialInertia,
    /// First index of the position slice.
    pub idx_q: usize,
    /// First index of the velocity slice.
    pub idx_v: usize,
    /// Position limits `(min, max)` for bounded 1-DOF joints.
    pub position_limits: Option<(f64, f64)>,
    /// Symmetric velocity limit for bounded 1-DOF joints.
    pub velocity_limit: Option<f64>,
}

/// Operational frame rigidly attached to a joint.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame name, unique within the model.
    pub name: String,
    /// Supporting joint index.
    pub parent_joint: usize,
    /// Placement in the parent joint frame.
    pub placement: Placement,
}

/// Immutable kinematic-tree model.
#[derive(Debug, Clone)]
pub struct Model {
    /// Model name.
    pub name: String,
    /// Joints, index 0 being the universe sentinel.
    pub joints: Vec<Joint>,
    /// Frames, index 0 being the universe frame.
    pub frames: Vec<Frame>,
    /// Total width of the configuration vector.
    pub nq: usize,
    /// Total width of the velocity vector.
    pub nv: usize,
    /// Gravity field as a spatial motion `[linear, angular]`.
    pub gravity: Vector6<f64>,
    /// Ancestor DOF indices (root to leaf order) per joint.
    ancestor_dofs: Vec<Vec<usize>>,
    /// Owning joint of each DOF.
    dof_joint: Vec<usize>,
}

impl Model {
    /// Create an empty model with the standard gravity field.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let universe = Joint {
            name: "universe".to_string(),
            joint_type: JointType::Mimic,
            parent: 0,
            placement: Placement::identity(),
            inertia: SpatialInertia::zero(),
            idx_q: 0,
            idx_v: 0,
            position_limits: None,
            velocity_limit: None,
        };
        let universe_frame = Frame {
            name: "universe".to_string(),
            parent_joint: 0,
            placement: Placement::identity(),
        };
        Self {
            name: name.into(),
            joints: vec![universe],
            frames: vec![universe_frame],
            nq: 0,
            nv: 0,
            gravity: Vector6::new(0.0, 0.0, -9.81, 0.0, 0.0, 0.0),
            ancestor_dofs: vec![Vec::new()],
            dof_joint: Vec::new(),
        }
    }

    /// Append a joint (and its body) to the tree. Returns the joint index.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` on an unknown parent or a duplicated name.
    pub fn add_joint(
        &mut self,
        name: impl Into<String>,
        joint_type: JointType,
        parent: usize,
        placement: Placement,
        inertia: SpatialInertia,
    ) -> Result<usize> {
        let name = name.into();
        if parent >= self.joints.len() {
            return Err(EngineError::bad_input(format!(
                "parent joint index {parent} out of range"
            )));
        }
        if self.joints.iter().any(|j| j.name == name) {
            return Err(EngineError::bad_input(format!(
                "a joint named '{name}' already exists"
            )));
        }
        let idx = self.joints.len();
        let idx_q = self.nq;
        let idx_v = self.nv;
        self.nq += joint_type.nq();
        self.nv += joint_type.nv();

        let mut dofs = self.ancestor_dofs[parent].clone();
        for k in 0..joint_type.nv() {
            dofs.push(idx_v + k);
            self.dof_joint.push(idx);
        }
        self.ancestor_dofs.push(dofs);

        self.joints.push(Joint {
            name: name.clone(),
            joint_type,
            parent,
            placement,
            inertia,
            idx_q,
            idx_v,
            position_limits: None,
            velocity_limit: None,
        });

        // A joint implicitly defines a frame of the same name.
        self.frames.push(Frame {
            name,
            parent_joint: idx,
            placement: Placement::identity(),
        });
        Ok(idx)
    }

    /// Attach an operational frame to a joint. Returns the frame index.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` on an unknown joint or a duplicated name.
    pub fn add_frame(
        &mut self,
        name: impl Into<String>,
        parent_joint: usize,
        placement: Placement,
    ) -> Result<usize> {
        let name = name.into();
        if parent_joint >= self.joints.len() {
            return Err(EngineError::bad_input(format!(
                "parent joint index {parent_joint} out of range"
            )));
        }
        if self.frames.iter().any(|f| f.name == name) {
            return Err(EngineError::bad_input(format!(
                "a frame named '{name}' already exists"
            )));
        }
        self.frames.push(Frame {
            name,
            parent_joint,
            placement,
        });
        Ok(self.frames.len() - 1)
    }

    /// Set position limits on a bounded 1-DOF joint.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` when the joint does not support bounds.
    pub fn set_position_limits(&mut self, joint: usize, min: f64, max: f64) -> Result<()> {
        let j = self
            .joints
            .get_mut(joint)
            .ok_or_else(|| EngineError::bad_input("joint index out of range"))?;
        if !j.joint_type.supports_bounds() {
            return Err(EngineError::bad_input(format!(
                "joint '{}' does not support position limits",
                j.name
            )));
        }
        j.position_limits = Some((min, max));
        Ok(())
    }

    /// Set the symmetric velocity limit on a bounded 1-DOF joint.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` when the joint does not support bounds.
    pub fn set_velocity_limit(&mut self, joint: usize, limit: f64) -> Result<()> {
        let j = self
            .joints
            .get_mut(joint)
            .ok_or_else(|| EngineError::bad_input("joint index out of range"))?;
        if !j.joint_type.supports_bounds() {
            return Err(EngineError::bad_input(format!(
                "joint '{}' does not support velocity limits",
                j.name
            )));
        }
        j.velocity_limit = Some(limit);
        Ok(())
    }

    /// Number of joints including the universe.
    #[must_use]
    pub fn njoints(&self) -> usize {
        self.joints.len()
    }

    /// Number of frames including the universe frame.
    #[must_use]
    pub fn nframes(&self) -> usize {
        self.frames.len()
    }

    /// Look up a frame index by name.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` when no frame has this name.
    pub fn frame_index(&self, name: &str) -> Result<usize> {
        self.frames
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| EngineError::bad_input(format!("no frame named '{name}'")))
    }

    /// Look up a joint index by name.
    ///
    /// # Errors
    ///
    /// Fails with `BadInput` when no joint has this name.
    pub fn joint_index(&self, name: &str) -> Result<usize> {
        self.joints
            .iter()
            .position(|j| j.name == name)
            .ok_or_else(|| EngineError::bad_input(format!("no joint named '{name}'")))
    }

    /// Whether the root joint is a free flyer.
    #[must_use]
    pub fn has_free_flyer(&self) -> bool {
        self.joints
            .get(1)
            .is_some_and(|j| matches!(j.joint_type, JointType::Free))
    }

    /// Gravity linear part.
    #[must_use]
    pub fn gravity_linear(&self) -> Vector3<f64> {
        Vector3::new(self.gravity[0], self.gravity[1], self.gravity[2])
    }

    /// Gravity as a spatial motion field.
    #[must_use]
    pub fn gravity_motion(&self) -> Motion {
        Motion::new(
            self.gravity_linear(),
            Vector3::new(self.gravity[3], self.gravity[4], self.gravity[5]),
        )
    }

    /// Ancestor DOF indices of a joint, root first, own DOFs last.
    #[must_use]
    pub fn ancestor_dofs(&self, joint: usize) -> &[usize] {
        &self.ancestor_dofs[joint]
    }

    /// Owning joint of each velocity DOF.
    #[must_use]
    pub fn dof_joint(&self) -> &[usize] {
        &self.dof_joint
    }

    /// Allocate the mutable scratch matching this model.
    #[must_use]
    pub fn make_data(&self) -> Data {
        Data::new(self)
    }

    /// Neutral configuration (identity placements, zero elsewhere).
    #[must_use]
    pub fn neutral_configuration(&self) -> nalgebra::DVector<f64> {
        let mut q = nalgebra::DVector::zeros(self.nq);
        for joint in &self.joints[1..] {
            match joint.joint_type {
                JointType::Free => {
                    // Identity quaternion (x, y, z, w).
                    q[joint.idx_q + 6] = 1.0;
                }
                JointType::Spherical => {
                    q[joint.idx_q + 3] = 1.0;
                }
                JointType::Planar | JointType::RevoluteUnbounded(_) => {
                    // cos = 1, sin = 0.
                    let cos_idx = joint.idx_q + joint.joint_type.nq() - 2;
                    q[cos_idx] = 1.0;
                }
                _ => {}
            }
        }
        q
    }

    /// Position lower/upper bound vectors, `±INFINITY` where unbounded.
    #[must_use]
    pub fn position_limit_vectors(&self) -> (nalgebra::DVector<f64>, nalgebra::DVector<f64>) {
        let mut lo = nalgebra::DVector::from_element(self.nq, f64::NEG_INFINITY);
        let mut hi = nalgebra::DVector::from_element(self.nq, f64::INFINITY);
        for joint in &self.joints[1..] {
            if let Some((min, max)) = joint.position_limits {
                lo[joint.idx_q] = min;
                hi[joint.idx_q] = max;
            }
        }
        (lo, hi)
    }

    /// Velocity limit vector, `INFINITY` where unbounded.
    #[must_use]
    pub fn velocity_limit_vector(&self) -> nalgebra::DVector<f64> {
        let mut lim = nalgebra::DVector::from_element(self.nv, f64::INFINITY);
        for joint in &self.joints[1..] {
            if let Some(l) = joint.velocity_limit {
                lim[joint.idx_v] = l;
            }
        }
        lim
    }
}

/// Joint configuration transform: placement of the child joint frame in the
/// joint's zero-configuration frame.
#[must_use]
pub(crate) fn joint_transform(joint: &Joint, q: &[f64]) -> Placement {
    match &joint.joint_type {
        JointType::Free => {
            let translation = Vector3::new(q[0], q[1], q[2]);
            let quat = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                q[6], q[3], q[4], q[5],
            ));
            Placement::from_parts(translation.into(), quat)
        }
        JointType::Spherical => {
            let quat = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                q[3], q[0], q[1], q[2],
            ));
            Placement::from_parts(Vector3::zeros().into(), quat)
        }
        JointType::SphericalZyx => {
            let rot = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), q[0])
                * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), q[1])
                * UnitQuaternion::from_axis_angle(&Vector3::x_axis(), q[2]);
            Placement::from_parts(Vector3::zeros().into(), rot)
        }
        JointType::Translation => {
            Placement::from_parts(Vector3::new(q[0], q[1], q[2]).into(), UnitQuaternion::identity())
        }
        JointType::Planar => {
            let angle = q[3].atan2(q[2]);
            Placement::from_parts(
                Vector3::new(q[0], q[1], 0.0).into(),
                UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle),
            )
        }
        JointType::Prismatic(axis) => {
            Placement::from_parts((axis * q[0]).into(), UnitQuaternion::identity())
        }
        JointType::Revolute(axis) => Placement::from_parts(
            Vector3::zeros().into(),
            UnitQuaternion::from_scaled_axis(axis * q[0]),
        ),
        JointType::RevoluteUnbounded(axis) => {
            let angle = q[1].atan2(q[0]);
            Placement::from_parts(
                Vector3::zeros().into(),
                UnitQuaternion::from_scaled_axis(axis * angle),
            )
        }
        JointType::Mimic | JointType::Composite { .. } => Placement::identity(),
    }
}

/// Columns of the joint motion subspace, expressed in the child joint frame.
pub(crate) fn joint_subspace(joint: &Joint, q: &[f64], out: &mut Vec<Motion>) {
    out.clear();
    match &joint.joint_type {
        JointType::Free => {
            for k in 0..3 {
                let mut lin = Vector3::zeros();
                lin[k] = 1.0;
                out.push(Motion::new(lin, Vector3::zeros()));
            }
            for k in 0..3 {
                let mut ang = Vector3::zeros();
                ang[k] = 1.0;
                out.push(Motion::new(Vector3::zeros(), ang));
            }
        }
        JointType::Spherical => {
            for k in 0..3 {
                let mut ang = Vector3::zeros();
                ang[k] = 1.0;
                out.push(Motion::new(Vector3::zeros(), ang));
            }
        }
        JointType::SphericalZyx => {
            // Body-frame angular velocity of intrinsic Z-Y-X Euler rates.
            let ry = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), q[1]);
            let rx = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), q[2]);
            let col0 = (rx.inverse() * ry.inverse()) * Vector3::z();
            let col1 = rx.inverse() * Vector3::y();
            out.push(Motion::new(Vector3::zeros(), col0));
            out.push(Motion::new(Vector3::zeros(), col1));
            out.push(Motion::new(Vector3::zeros(), Vector3::x()));
        }
        JointType::Translation => {
            for k in 0..3 {
                let mut lin = Vector3::zeros();
                lin[k] = 1.0;
                out.push(Motion::new(lin, Vector3::zeros()));
            }
        }
        JointType::Planar => {
            out.push(Motion::new(Vector3::x(), Vector3::zeros()));
            out.push(Motion::new(Vector3::y(), Vector3::zeros()));
            out.push(Motion::new(Vector3::zeros(), Vector3::z()));
        }
        JointType::Prismatic(axis) => {
            out.push(Motion::new(*axis, Vector3::zeros()));
        }
        JointType::Revolute(axis) | JointType::RevoluteUnbounded(axis) => {
            out.push(Motion::new(Vector3::zeros(), *axis));
        }
        JointType::Mimic | JointType::Composite { .. } => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_model_indices() {
        let mut model = Model::new("chain");
        let j1 = model
            .add_joint(
                "shoulder",
                JointType::Revolute(Vector3::y()),
                UNIVERSE,
                Placement::identity(),
                SpatialInertia::sphere(1.0, 0.1, Vector3::new(0.0, 0.0, -0.5)),
            )
            .unwrap();
        let j2 = model
            .add_joint(
                "elbow",
                JointType::Revolute(Vector3::y()),
                j1,
                Placement::translation(0.0, 0.0, -1.0),
                SpatialInertia::sphere(1.0, 0.1, Vector3::new(0.0, 0.0, -0.5)),
            )
            .unwrap();
        assert_eq!(model.nq, 2);
        assert_eq!(model.nv, 2);
        assert_eq!(model.joints[j2].idx_q, 1);
        assert_eq!(model.ancestor_dofs(j2), &[0, 1]);
        assert_eq!(model.joint_index("elbow").unwrap(), j2);
        assert!(model.frame_index("nonexistent").is_err());
    }

    #[test]
    fn test_neutral_configuration_free_flyer() {
        let mut model = Model::new("ball");
        model
            .add_joint(
                "root",
                JointType::Free,
                UNIVERSE,
                Placement::identity(),
                SpatialInertia::sphere(1.0, 0.5, Vector3::zeros()),
            )
            .unwrap();
        let q = model.neutral_configuration();
        assert_eq!(q.len(), 7);
        assert_eq!(q[6], 1.0);
        assert!(model.has_free_flyer());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut model = Model::new("dup");
        model
            .add_joint(
                "j",
                JointType::Revolute(Vector3::z()),
                UNIVERSE,
                Placement::identity(),
                SpatialInertia::point_mass(1.0, Vector3::zeros()),
            )
            .unwrap();
        let err = model.add_joint(
            "j",
            JointType::Revolute(Vector3::z()),
            UNIVERSE,
            Placement::identity(),
            SpatialInertia::point_mass(1.0, Vector3::zeros()),
        );
        assert!(err.is_err());
    }
}
