//! Kinematic constraints and their registry.
//!
//! A constraint exposes a Jacobian block over the robot velocity space, a
//! drift vector (velocity-product terms plus Baumgarte stabilization), an
//! enabled flag and a Lagrange-multiplier slot written in place by the
//! solver. Concrete kinds are a closed enum; user-supplied constraints plug
//! in through [`UserConstraint`].

pub mod solver;

use nalgebra::{DMatrix, DVector, Matrix3, UnitQuaternion, Vector3};
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::model::{algorithms, Data, Model};
use crate::spatial::{log3, skew, Placement};

/// Shared constraint handle: the robot registry and the engine snapshot
/// alias the same cell, so multipliers written by the solver are visible to
/// both.
pub type SharedConstraint = Rc<RefCell<ConstraintHandle>>;

/// Registry group a constraint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintGroup {
    /// Joint position-bound constraints.
    BoundJoints,
    /// Contact-frame constraints.
    ContactFrames,
    /// Collision-body (per collision pair) constraints.
    CollisionBodies,
    /// User-registered constraints.
    User,
}

/// Capability interface for externally supplied constraints.
pub trait UserConstraint {
    /// Row count.
    fn dim(&self) -> usize;

    /// Reinitialize internal references from the current state.
    ///
    /// # Errors
    ///
    /// Propagates model lookup failures.
    fn reset(&mut self, model: &Model, data: &Data, q: &DVector<f64>, v: &DVector<f64>)
        -> Result<()>;

    /// Fill the Jacobian and drift for the current state.
    ///
    /// # Errors
    ///
    /// Propagates model lookup failures.
    fn compute(
        &mut self,
        model: &Model,
        data: &Data,
        q: &DVector<f64>,
        v: &DVector<f64>,
        jacobian: &mut DMatrix<f64>,
        drift: &mut DVector<f64>,
        baumgarte_freq: f64,
    ) -> Result<()>;
}

/// Unilateral bound on a 1-DOF joint configuration.
#[derive(Debug, Clone)]
pub struct JointBoundConstraint {
    /// Constrained joint index.
    pub joint_idx: usize,
    /// Configuration the joint is pushed back towards.
    pub reference: f64,
    /// True when the upper bound is violated (push downward).
    pub above_upper: bool,
}

/// Frame held at a reference pose, with a selectable DOF mask
/// `[lin x, y, z, ang x, y, z]`.
#[derive(Debug, Clone)]
pub struct FixedFrameConstraint {
    /// Constrained frame index.
    pub frame_idx: usize,
    /// Fixed degrees of freedom.
    pub mask: [bool; 6],
    /// Reference pose of the frame in the world.
    pub reference: Placement,
    /// Current contact normal.
    pub normal: Vector3<f64>,
}

impl FixedFrameConstraint {
    /// Contact constraint layout used for ground contacts: translation plus
    /// torsion about the normal (4 rows).
    #[must_use]
    pub fn contact(frame_idx: usize) -> Self {
        Self {
            frame_idx,
            mask: [true, true, true, false, false, true],
            reference: Placement::identity(),
            normal: Vector3::z(),
        }
    }

    /// Rotation of the contact-aligned local frame (Z column along the
    /// normal).
    #[must_use]
    pub fn local_frame(&self) -> Matrix3<f64> {
        let z = self.normal;
        let rot = UnitQuaternion::rotation_between(&Vector3::z(), &z)
            .unwrap_or_else(|| UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI));
        *rot.to_rotation_matrix().matrix()
    }
}

/// Fixed distance between two frames.
#[derive(Debug, Clone)]
pub struct DistanceConstraint {
    /// First frame index.
    pub frame1_idx: usize,
    /// Second frame index.
    pub frame2_idx: usize,
    /// Reference distance.
    pub reference: f64,
}

/// Sphere rolling without slipping on flat ground.
#[derive(Debug, Clone)]
pub struct SphereConstraint {
    /// Center frame index.
    pub frame_idx: usize,
    /// Sphere radius.
    pub radius: f64,
    /// Reference position of the contact point.
    pub reference: Vector3<f64>,
}

/// Wheel rolling without slipping on flat ground.
#[derive(Debug, Clone)]
pub struct WheelConstraint {
    /// Hub frame index.
    pub frame_idx: usize,
    /// Wheel radius.
    pub radius: f64,
    /// Ground normal.
    pub ground_normal: Vector3<f64>,
    /// Wheel axis in the hub frame.
    pub axis: Vector3<f64>,
    /// Reference position of the contact point.
    pub reference: Vector3<f64>,
}

/// Concrete constraint kinds.
pub enum ConstraintKind {
    /// Joint bound.
    JointBound(JointBoundConstraint),
    /// Fixed frame.
    FixedFrame(FixedFrameConstraint),
    /// Distance between frames.
    Distance(DistanceConstraint),
    /// Rolling sphere.
    Sphere(SphereConstraint),
    /// Rolling wheel.
    Wheel(WheelConstraint),
    /// User supplied.
    User(Box<dyn UserConstraint>),
}

/// A constraint together with its shared mutable state.
pub struct ConstraintHandle {
    /// Concrete kind.
    pub kind: ConstraintKind,
    enabled: bool,
    baumgarte_freq: f64,
    /// Lagrange multipliers of the last solve.
    pub lambda: DVector<f64>,
    jacobian: DMatrix<f64>,
    drift: DVector<f64>,
    frame_jac: DMatrix<f64>,
}

impl ConstraintHandle {
    /// Wrap a constraint kind, initially enabled. Engine-managed contact
    /// and bound constraints are toggled by the contact transitions; user
    /// constraints stay enabled unless disabled explicitly.
    #[must_use]
    pub fn new(kind: ConstraintKind) -> Self {
        let dim = kind_dim(&kind);
        Self {
            kind,
            enabled: true,
            baumgarte_freq: 0.0,
            lambda: DVector::zeros(dim),
            jacobian: DMatrix::zeros(dim, 0),
            drift: DVector::zeros(dim),
            frame_jac: DMatrix::zeros(6, 0),
        }
    }

    /// Row count.
    #[must_use]
    pub fn dim(&self) -> usize {
        kind_dim(&self.kind)
    }

    /// Whether the constraint participates in the next solve.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Activate the constraint.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Deactivate the constraint and clear its multipliers.
    pub fn disable(&mut self) {
        if self.enabled {
            self.lambda.fill(0.0);
        }
        self.enabled = false;
    }

    /// Baumgarte stabilization natural frequency (Hz); zero disables
    /// stabilization.
    #[must_use]
    pub fn baumgarte_freq(&self) -> f64 {
        self.baumgarte_freq
    }

    /// Set the Baumgarte stabilization frequency.
    pub fn set_baumgarte_freq(&mut self, freq: f64) {
        self.baumgarte_freq = freq;
    }

    /// Jacobian of the last [`ConstraintHandle::compute`].
    #[must_use]
    pub fn jacobian(&self) -> &DMatrix<f64> {
        &self.jacobian
    }

    /// Drift of the last [`ConstraintHandle::compute`].
    #[must_use]
    pub fn drift(&self) -> &DVector<f64> {
        &self.drift
    }

    /// Resize buffers for the model and reinitialize references from the
    /// current state.
    ///
    /// # Errors
    ///
    /// Propagates user-constraint failures.
    pub fn reset(
        &mut self,
        model: &Model,
        data: &Data,
        q: &DVector<f64>,
        v: &DVector<f64>,
    ) -> Result<()> {
        let dim = self.dim();
        self.lambda = DVector::zeros(dim);
        self.jacobian = DMatrix::zeros(dim, model.nv);
        self.drift = DVector::zeros(dim);
        self.frame_jac = DMatrix::zeros(6, model.nv);
        match &mut self.kind {
            ConstraintKind::FixedFrame(c) => {
                c.reference = data.frame_placement[c.frame_idx];
            }
            ConstraintKind::Distance(c) => {
                let p1 = data.frame_placement[c.frame1_idx].translation.vector;
                let p2 = data.frame_placement[c.frame2_idx].translation.vector;
                if c.reference <= 0.0 {
                    c.reference = (p2 - p1).norm();
                }
            }
            ConstraintKind::Sphere(c) => {
                let p = data.frame_placement[c.frame_idx].translation.vector;
                c.reference = p - Vector3::z() * c.radius;
            }
            ConstraintKind::Wheel(c) => {
                let p = data.frame_placement[c.frame_idx].translation.vector;
                c.reference = p + contact_offset_wheel(data, c);
            }
            ConstraintKind::User(c) => c.reset(model, data, q, v)?,
            ConstraintKind::JointBound(_) => {}
        }
        Ok(())
    }

    /// Compute the Jacobian and drift for the current state. Requires fresh
    /// kinematics, frame placements and bias accelerations in `data`.
    ///
    /// # Errors
    ///
    /// Propagates user-constraint failures.
    pub fn compute(
        &mut self,
        model: &Model,
        data: &Data,
        q: &DVector<f64>,
        v: &DVector<f64>,
    ) -> Result<()> {
        let omega = 2.0 * std::f64::consts::PI * self.baumgarte_freq;
        let kp = omega * omega;
        let kd = 2.0 * omega;
        match &mut self.kind {
            ConstraintKind::JointBound(c) => {
                let joint = &model.joints[c.joint_idx];
                let sign = if c.above_upper { -1.0 } else { 1.0 };
                self.jacobian.fill(0.0);
                self.jacobian[(0, joint.idx_v)] = sign;
                let err = sign * (q[joint.idx_q] - c.reference);
                let derr = sign * v[joint.idx_v];
                self.drift[0] = kd * derr + kp * err;
            }
            ConstraintKind::FixedFrame(c) => {
                algorithms::frame_jacobian_world_aligned(model, data, c.frame_idx, &mut self.frame_jac);
                let placement = data.frame_placement[c.frame_idx];
                let vel = algorithms::frame_velocity_world_aligned(model, data, c.frame_idx);
                let bias =
                    algorithms::frame_bias_classical_acceleration(model, data, c.frame_idx);
                let err_lin = placement.translation.vector - c.reference.translation.vector;
                let (err_ang, _) = log3(&(placement.rotation * c.reference.rotation.inverse()));

                let local = c.local_frame();
                let local_t = local.transpose();
                let drift_lin = local_t * (bias.linear + kd * vel.linear + kp * err_lin);
                let drift_ang = local_t * (bias.angular + kd * vel.angular + kp * err_ang);

                self.jacobian.fill(0.0);
                let mut row = 0;
                for dof_kind in 0..2 {
                    for axis in 0..3 {
                        let mask_idx = 3 * dof_kind + axis;
                        if !c.mask[mask_idx] {
                            continue;
                        }
                        for col in 0..model.nv {
                            let mut value = 0.0;
                            for k in 0..3 {
                                value += local_t[(axis, k)] * self.frame_jac[(3 * dof_kind + k, col)];
                            }
                            self.jacobian[(row, col)] = value;
                        }
                        self.drift[row] = if dof_kind == 0 {
                            drift_lin[axis]
                        } else {
                            drift_ang[axis]
                        };
                        row += 1;
                    }
                }
            }
            ConstraintKind::Distance(c) => {
                let p1 = data.frame_placement[c.frame1_idx].translation.vector;
                let p2 = data.frame_placement[c.frame2_idx].translation.vector;
                let delta = p2 - p1;
                let dist = delta.norm().max(1e-12);
                let dir = delta / dist;

                let v1 = algorithms::frame_velocity_world_aligned(model, data, c.frame1_idx);
                let v2 = algorithms::frame_velocity_world_aligned(model, data, c.frame2_idx);
                let b1 = algorithms::frame_bias_classical_acceleration(model, data, c.frame1_idx);
                let b2 = algorithms::frame_bias_classical_acceleration(model, data, c.frame2_idx);
                let v_rel = v2.linear - v1.linear;

                self.jacobian.fill(0.0);
                algorithms::frame_jacobian_world_aligned(model, data, c.frame2_idx, &mut self.frame_jac);
                for col in 0..model.nv {
                    for k in 0..3 {
                        self.jacobian[(0, col)] += dir[k] * self.frame_jac[(k, col)];
                    }
                }
                algorithms::frame_jacobian_world_aligned(model, data, c.frame1_idx, &mut self.frame_jac);
                for col in 0..model.nv {
                    for k in 0..3 {
                        self.jacobian[(0, col)] -= dir[k] * self.frame_jac[(k, col)];
                    }
                }

                let ddot = dir.dot(&v_rel);
                let centripetal = (v_rel.dot(&v_rel) - ddot * ddot) / dist;
                self.drift[0] = dir.dot(&(b2.linear - b1.linear))
                    + centripetal
                    + kd * ddot
                    + kp * (dist - c.reference);
            }
            ConstraintKind::Sphere(c) => {
                let offset = -Vector3::z() * c.radius;
                compute_rolling_point(
                    model,
                    data,
                    c.frame_idx,
                    offset,
                    c.reference,
                    kp,
                    kd,
                    &mut self.frame_jac,
                    &mut self.jacobian,
                    &mut self.drift,
                );
            }
            ConstraintKind::Wheel(c) => {
                let offset = contact_offset_wheel(data, c);
                compute_rolling_point(
                    model,
                    data,
                    c.frame_idx,
                    offset,
                    c.reference,
                    kp,
                    kd,
                    &mut self.frame_jac,
                    &mut self.jacobian,
                    &mut self.drift,
                );
            }
            ConstraintKind::User(c) => {
                c.compute(
                    model,
                    data,
                    q,
                    v,
                    &mut self.jacobian,
                    &mut self.drift,
                    self.baumgarte_freq,
                )?;
            }
        }
        Ok(())
    }
}

fn kind_dim(kind: &ConstraintKind) -> usize {
    match kind {
        ConstraintKind::JointBound(_) | ConstraintKind::Distance(_) => 1,
        ConstraintKind::FixedFrame(c) => c.mask.iter().filter(|m| **m).count(),
        ConstraintKind::Sphere(_) | ConstraintKind::Wheel(_) => 3,
        ConstraintKind::User(c) => c.dim(),
    }
}

/// World offset from the wheel hub to the lowest rim point.
fn contact_offset_wheel(data: &Data, c: &WheelConstraint) -> Vector3<f64> {
    let axis_world = data.frame_placement[c.frame_idx].rotation * c.axis;
    let radial = c.ground_normal - axis_world * axis_world.dot(&c.ground_normal);
    let norm = radial.norm();
    if norm < 1e-9 {
        // Wheel lying flat: the rim direction is ill-defined.
        -c.ground_normal * c.radius
    } else {
        -radial / norm * c.radius
    }
}

/// Jacobian and drift constraining the world velocity of a material point at
/// `offset` from a frame origin.
#[allow(clippy::too_many_arguments)]
fn compute_rolling_point(
    model: &Model,
    data: &Data,
    frame_idx: usize,
    offset: Vector3<f64>,
    reference: Vector3<f64>,
    kp: f64,
    kd: f64,
    frame_jac: &mut DMatrix<f64>,
    jacobian: &mut DMatrix<f64>,
    drift: &mut DVector<f64>,
) {
    algorithms::frame_jacobian_world_aligned(model, data, frame_idx, frame_jac);
    let cross = skew(&offset);
    jacobian.fill(0.0);
    for col in 0..model.nv {
        for r in 0..3 {
            let mut value = frame_jac[(r, col)];
            for k in 0..3 {
                value -= cross[(r, k)] * frame_jac[(3 + k, col)];
            }
            jacobian[(r, col)] = value;
        }
    }

    let placement = data.frame_placement[frame_idx];
    let vel = algorithms::frame_velocity_world_aligned(model, data, frame_idx);
    let bias = algorithms::frame_bias_classical_acceleration(model, data, frame_idx);
    let point = placement.translation.vector + offset;
    let v_point = vel.linear + vel.angular.cross(&offset);
    let a_point = bias.linear
        + bias.angular.cross(&offset)
        + vel.angular.cross(&vel.angular.cross(&offset));
    let err = point - reference;
    for r in 0..3 {
        drift[r] = a_point[r] + kd * v_point[r] + kp * err[r];
    }
}

/// Categorized holder of the constraints attached to one robot.
#[derive(Default)]
pub struct ConstraintsHolder {
    /// Joint-bound constraints, one per bounded rigid joint.
    pub bound_joints: Vec<(String, SharedConstraint)>,
    /// Contact-frame constraints, aligned with the robot contact frames.
    pub contact_frames: Vec<(String, SharedConstraint)>,
    /// Collision-body constraints, one row per body, one entry per pair.
    pub collision_bodies: Vec<Vec<(String, SharedConstraint)>>,
    /// User-registered constraints.
    pub registered: Vec<(String, SharedConstraint)>,
}

impl ConstraintsHolder {
    /// Visit every constraint in deterministic registry order.
    pub fn foreach(&self, mut f: impl FnMut(&SharedConstraint, ConstraintGroup)) {
        for (_, c) in &self.bound_joints {
            f(c, ConstraintGroup::BoundJoints);
        }
        for (_, c) in &self.contact_frames {
            f(c, ConstraintGroup::ContactFrames);
        }
        for row in &self.collision_bodies {
            for (_, c) in row {
                f(c, ConstraintGroup::CollisionBodies);
            }
        }
        for (_, c) in &self.registered {
            f(c, ConstraintGroup::User);
        }
    }

    /// Whether any constraint is registered, enabled or not.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bound_joints.is_empty()
            && self.contact_frames.is_empty()
            && self.collision_bodies.iter().all(Vec::is_empty)
            && self.registered.is_empty()
    }

    /// Shallow copy sharing every constraint cell.
    #[must_use]
    pub fn share(&self) -> Self {
        Self {
            bound_joints: self.bound_joints.clone(),
            contact_frames: self.contact_frames.clone(),
            collision_bodies: self.collision_bodies.clone(),
            registered: self.registered.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::factories;
    use approx::assert_relative_eq;

    #[test]
    fn test_joint_bound_jacobian_sign() {
        let model = factories::n_link_pendulum(1, 1.0, 1.0);
        let mut data = model.make_data();
        let mut q = DVector::zeros(1);
        q[0] = 1.2;
        let v = DVector::zeros(1);
        algorithms::kinematics_pass(&model, &mut data, &q, &v);
        algorithms::update_frame_placements(&model, &mut data);
        algorithms::compute_bias_accelerations(&model, &mut data, &v);

        let mut handle = ConstraintHandle::new(ConstraintKind::JointBound(JointBoundConstraint {
            joint_idx: 1,
            reference: 1.0,
            above_upper: true,
        }));
        handle.reset(&model, &data, &q, &v).unwrap();
        handle.set_baumgarte_freq(10.0);
        handle.compute(&model, &data, &q, &v).unwrap();
        assert_relative_eq!(handle.jacobian()[(0, 0)], -1.0);
        // Position error is negative through the sign flip, so the drift
        // pushes the multiplier positive.
        assert!(handle.drift()[0] < 0.0);
    }

    #[test]
    fn test_fixed_frame_contact_dim() {
        let mut handle = ConstraintHandle::new(ConstraintKind::FixedFrame(
            FixedFrameConstraint::contact(1),
        ));
        assert_eq!(handle.dim(), 4);
        assert!(handle.is_enabled());
        handle.disable();
        assert!(!handle.is_enabled());
    }

    #[test]
    fn test_fixed_frame_jacobian_identity_for_free_flyer() {
        let model = factories::free_sphere("ball", 1.0, 0.5);
        let mut data = model.make_data();
        let q = model.neutral_configuration();
        let v = DVector::zeros(6);
        algorithms::kinematics_pass(&model, &mut data, &q, &v);
        algorithms::update_frame_placements(&model, &mut data);
        algorithms::compute_bias_accelerations(&model, &mut data, &v);

        let frame = model.frame_index("root").unwrap();
        let mut fixed = FixedFrameConstraint::contact(frame);
        fixed.frame_idx = frame;
        let mut handle = ConstraintHandle::new(ConstraintKind::FixedFrame(fixed));
        handle.reset(&model, &data, &q, &v).unwrap();
        handle.compute(&model, &data, &q, &v).unwrap();
        // Translation rows select the linear free-flyer DOFs.
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert_relative_eq!(handle.jacobian()[(r, c)], expected, epsilon = 1e-12);
            }
        }
        // Torsion row selects the angular Z DOF.
        assert_relative_eq!(handle.jacobian()[(3, 5)], 1.0, epsilon = 1e-12);
        // At the reference pose with zero velocity the drift vanishes.
        for r in 0..4 {
            assert_relative_eq!(handle.drift()[r], 0.0, epsilon = 1e-12);
        }
    }
}
