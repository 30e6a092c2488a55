//! Kinematic and dynamic algorithms over [`Model`]/[`Data`].
//!
//! All recursions run in world coordinates referenced at the world origin:
//! motion subspace columns are transported there once per kinematic pass,
//! after which velocity/acceleration propagation, the joint-space inertia and
//! the nonlinear effects reduce to plain spatial-vector arithmetic.

use nalgebra::{Cholesky, DMatrix, DVector, Matrix3, UnitQuaternion, Vector3};

use crate::error::{EngineError, Result};
use crate::model::{joint_subspace, joint_transform, Data, JointType, Model};
use crate::spatial::{exp3, log3, skew, Force, Motion, Placement};

/// Refresh joint placements, world motion-subspace columns and joint
/// velocities (local and world) for the given `(q, v)`.
pub fn kinematics_pass(model: &Model, data: &mut Data, q: &DVector<f64>, v: &DVector<f64>) {
    let mut subspace = Vec::with_capacity(6);
    for i in 1..model.njoints() {
        let joint = &model.joints[i];
        let q_slice = &q.as_slice()[joint.idx_q..joint.idx_q + joint.joint_type.nq()];
        let local = joint.placement * joint_transform(joint, q_slice);
        data.joint_placement[i] = data.joint_placement[joint.parent] * local;

        joint_subspace(joint, q_slice, &mut subspace);
        let mut v_joint = Motion::zero();
        for (k, col) in subspace.iter().enumerate() {
            let col_world = col.transform(&data.joint_placement[i]);
            data.dof_subspace_world[joint.idx_v + k] = col_world;
            v_joint = v_joint + col_world * v[joint.idx_v + k];
        }
        data.v_world[i] = data.v_world[joint.parent] + v_joint;
        data.v_local[i] = data.v_world[i].transform_inv(&data.joint_placement[i]);
    }
}

/// Forward kinematics: placements, velocities and spatial accelerations for
/// the given `(q, v, a)`.
pub fn forward_kinematics(
    model: &Model,
    data: &mut Data,
    q: &DVector<f64>,
    v: &DVector<f64>,
    a: &DVector<f64>,
) {
    kinematics_pass(model, data, q, v);
    for i in 1..model.njoints() {
        let joint = &model.joints[i];
        let mut a_joint = Motion::zero();
        let mut v_joint = Motion::zero();
        for k in 0..joint.joint_type.nv() {
            let col = data.dof_subspace_world[joint.idx_v + k];
            a_joint = a_joint + col * a[joint.idx_v + k];
            v_joint = v_joint + col * v[joint.idx_v + k];
        }
        data.a_world[i] =
            data.a_world[joint.parent] + a_joint + data.v_world[i].cross_motion(&v_joint);
        data.a_local[i] = data.a_world[i].transform_inv(&data.joint_placement[i]);
    }
}

/// Refresh operational frame placements from the joint placements.
pub fn update_frame_placements(model: &Model, data: &mut Data) {
    for (k, frame) in model.frames.iter().enumerate().skip(1) {
        data.frame_placement[k] = data.joint_placement[frame.parent_joint] * frame.placement;
    }
}

/// Velocity-product (bias) accelerations: joint spatial accelerations under
/// zero joint acceleration, world frame. Requires a prior kinematic pass.
pub fn compute_bias_accelerations(model: &Model, data: &mut Data, v: &DVector<f64>) {
    data.bias_acc_world[0] = Motion::zero();
    for i in 1..model.njoints() {
        let joint = &model.joints[i];
        let mut v_joint = Motion::zero();
        for k in 0..joint.joint_type.nv() {
            v_joint = v_joint + data.dof_subspace_world[joint.idx_v + k] * v[joint.idx_v + k];
        }
        data.bias_acc_world[i] =
            data.bias_acc_world[joint.parent] + data.v_world[i].cross_motion(&v_joint);
    }
}

/// Joint-space inertia matrix and its Cholesky factorization.
///
/// Assembled as `Σ_i Jᵢᵀ·Iᵢ·Jᵢ` over world origin-referenced subspaces,
/// which coincides with the composite-rigid-body result. Requires a prior
/// kinematic pass for the same `q` (placements and subspaces are reused,
/// the velocity scratch is left untouched).
///
/// # Errors
///
/// Fails with `Generic` when the inertia matrix is not positive definite.
pub fn crba(model: &Model, data: &mut Data, _q: &DVector<f64>) -> Result<()> {
    data.mass_matrix.fill(0.0);
    for i in 1..model.njoints() {
        let inertia_world = model.joints[i].inertia.transform(&data.joint_placement[i]);
        let dofs = model.ancestor_dofs(i);
        for &a in dofs {
            let f = inertia_world.mul_motion(&data.dof_subspace_world[a]);
            for &b in dofs {
                data.mass_matrix[(a, b)] += data.dof_subspace_world[b].dot(&f);
            }
        }
    }

    data.mass_chol = Cholesky::new(data.mass_matrix.clone());
    if data.mass_chol.is_none() {
        return Err(EngineError::generic(
            "joint-space inertia matrix is not positive definite",
        ));
    }
    Ok(())
}

/// Nonlinear effects vector: Coriolis, centrifugal and gravity torques for
/// the given `(q, v)`.
pub fn nonlinear_effects(
    model: &Model,
    data: &mut Data,
    q: &DVector<f64>,
    v: &DVector<f64>,
) -> DVector<f64> {
    kinematics_pass(model, data, q, v);

    // Recursive Newton-Euler with zero joint accelerations; the gravity
    // field enters as a fictitious base acceleration.
    let nj = model.njoints();
    let mut acc = vec![Motion::zero(); nj];
    acc[0] = Motion::zero() - model.gravity_motion();
    let mut force = vec![Force::zero(); nj];
    for i in 1..nj {
        let joint = &model.joints[i];
        let mut v_joint = Motion::zero();
        for k in 0..joint.joint_type.nv() {
            v_joint = v_joint + data.dof_subspace_world[joint.idx_v + k] * v[joint.idx_v + k];
        }
        acc[i] = acc[joint.parent] + data.v_world[i].cross_motion(&v_joint);
        let inertia_world = joint.inertia.transform(&data.joint_placement[i]);
        let momentum = inertia_world.mul_motion(&data.v_world[i]);
        force[i] = inertia_world.mul_motion(&acc[i]) + data.v_world[i].cross_force(&momentum);
    }
    for i in (1..nj).rev() {
        let parent = model.joints[i].parent;
        let f = force[i];
        force[parent] += f;
    }
    for i in 1..nj {
        let joint = &model.joints[i];
        for k in 0..joint.joint_type.nv() {
            data.nle[joint.idx_v + k] = data.dof_subspace_world[joint.idx_v + k].dot(&force[i]);
        }
    }
    data.nle.clone()
}

/// Generalized torques produced by per-joint external forces expressed in
/// the local joint frames.
#[must_use]
pub fn joint_torques_from_external(model: &Model, data: &Data, fext: &[Force]) -> DVector<f64> {
    let mut tau = DVector::zeros(model.nv);
    for i in 1..model.njoints() {
        let f_world = fext[i].transform(&data.joint_placement[i]);
        for &dof in model.ancestor_dofs(i) {
            tau[dof] += data.dof_subspace_world[dof].dot(&f_world);
        }
    }
    tau
}

/// Unconstrained forward dynamics: `M·a = u + τ_ext(fext) − nle`.
///
/// # Errors
///
/// Fails with `Generic` when the inertia matrix is not positive definite.
pub fn unconstrained_dynamics(
    model: &Model,
    data: &mut Data,
    q: &DVector<f64>,
    v: &DVector<f64>,
    u: &DVector<f64>,
    fext: &[Force],
) -> Result<DVector<f64>> {
    nonlinear_effects(model, data, q, v);
    crba(model, data, q)?;
    let tau_ext = joint_torques_from_external(model, data, fext);
    let rhs = u + tau_ext - &data.nle;
    let chol = data
        .mass_chol
        .as_ref()
        .ok_or_else(|| EngineError::generic("inertia factorization unavailable"))?;
    data.ddq = chol.solve(&rhs);
    Ok(data.ddq.clone())
}

/// Delassus matrix `A = J·M⁻¹·Jᵀ`, stored in `data.jminv_jt`.
///
/// # Errors
///
/// Fails with `Generic` when the inertia factorization is unavailable.
pub fn compute_jminv_jt(data: &mut Data, jac: &DMatrix<f64>) -> Result<()> {
    let chol = data
        .mass_chol
        .as_ref()
        .ok_or_else(|| EngineError::generic("inertia factorization unavailable"))?;
    let minv_jt = chol.solve(&jac.transpose());
    data.jminv_jt = jac * minv_jt;
    Ok(())
}

/// Solve `(J·M⁻¹·Jᵀ)·λ = b` using a fresh Cholesky of the Delassus matrix.
///
/// # Errors
///
/// Fails with `Generic` when the Delassus matrix is not positive definite.
pub fn solve_jminv_jt_v(data: &Data, b: &DVector<f64>) -> Result<DVector<f64>> {
    let chol = Cholesky::new(data.jminv_jt.clone())
        .ok_or_else(|| EngineError::generic("Delassus matrix is not positive definite"))?;
    Ok(chol.solve(b))
}

/// World placement of an operational frame. Requires fresh frame placements.
#[must_use]
pub fn frame_placement(data: &Data, frame: usize) -> Placement {
    data.frame_placement[frame]
}

/// Frame spatial velocity in the local-world-aligned convention (world axes,
/// referenced at the frame origin).
#[must_use]
pub fn frame_velocity_world_aligned(model: &Model, data: &Data, frame: usize) -> Motion {
    let parent = model.frames[frame].parent_joint;
    let p = data.frame_placement[frame].translation.vector;
    let v = data.v_world[parent];
    Motion::new(v.velocity_at(&p), v.angular)
}

/// Classical acceleration of the frame origin point under the bias
/// accelerations, local-world-aligned. Requires
/// [`compute_bias_accelerations`].
#[must_use]
pub fn frame_bias_classical_acceleration(model: &Model, data: &Data, frame: usize) -> Motion {
    let parent = model.frames[frame].parent_joint;
    let p = data.frame_placement[frame].translation.vector;
    let acc = data.bias_acc_world[parent];
    let vel = data.v_world[parent];
    let lin = acc.linear + acc.angular.cross(&p) + vel.angular.cross(&vel.velocity_at(&p));
    Motion::new(lin, acc.angular)
}

/// Frame Jacobian in the local-world-aligned convention: 6×nv, linear rows
/// first.
pub fn frame_jacobian_world_aligned(
    model: &Model,
    data: &Data,
    frame: usize,
    out: &mut DMatrix<f64>,
) {
    out.fill(0.0);
    let parent = model.frames[frame].parent_joint;
    let p = data.frame_placement[frame].translation.vector;
    for &dof in model.ancestor_dofs(parent) {
        let col = data.dof_subspace_world[dof];
        let lin = col.velocity_at(&p);
        for r in 0..3 {
            out[(r, dof)] = lin[r];
            out[(r + 3, dof)] = col.angular[r];
        }
    }
}

/// Transport a world-axes wrench applied at a frame origin onto the frame's
/// parent joint, expressed in the local joint frame.
#[must_use]
pub fn force_world_frame_to_joint(model: &Model, data: &Data, frame: usize, f: &Force) -> Force {
    let parent = model.frames[frame].parent_joint;
    let joint_from_world = Placement::from_parts(
        model.frames[frame].placement.translation,
        data.joint_placement[parent].rotation.inverse(),
    );
    f.transform(&joint_from_world)
}

/// Transport a world-axes wrench applied at an arbitrary world point onto a
/// joint, expressed in the local joint frame.
#[must_use]
pub fn force_at_world_point_to_joint(
    data: &Data,
    joint: usize,
    point: &Vector3<f64>,
    f: &Force,
) -> Force {
    let about_origin = Force::new(f.linear, f.angular + point.cross(&f.linear));
    about_origin.transform_inv(&data.joint_placement[joint])
}

/// Kinetic and potential energy for the given `(q, v)`, stored in `data`.
pub fn compute_energies(model: &Model, data: &mut Data, q: &DVector<f64>, v: &DVector<f64>) {
    kinematics_pass(model, data, q, v);
    let g = model.gravity_linear();
    let mut kinetic = 0.0;
    let mut potential = 0.0;
    for i in 1..model.njoints() {
        let inertia_world = model.joints[i].inertia.transform(&data.joint_placement[i]);
        kinetic += 0.5 * data.v_world[i].dot(&inertia_world.mul_motion(&data.v_world[i]));
        potential -= inertia_world.mass * g.dot(&inertia_world.lever);
    }
    data.kinetic_energy = kinetic;
    data.potential_energy = potential;
}

/// Recompute joint accelerations from `data.ddq`, then subtree momenta,
/// forces, composite inertias, centers of mass and centroidal dynamics.
///
/// Mirrors the bookkeeping performed after every successful integration
/// step: these quantities feed sensors, telemetry and the joint-bound
/// inertia projections.
pub fn compute_extra_terms(model: &Model, data: &mut Data) {
    let nj = model.njoints();

    // Accelerations from the freshly solved ddq (kinematic, gravity-free).
    // The per-joint velocity contribution is recovered from the propagated
    // world velocities of the last kinematic pass.
    data.a_world[0] = Motion::zero();
    for i in 1..nj {
        let joint = &model.joints[i];
        let mut a_joint = Motion::zero();
        for k in 0..joint.joint_type.nv() {
            let col = data.dof_subspace_world[joint.idx_v + k];
            a_joint = a_joint + col * data.ddq[joint.idx_v + k];
        }
        let v_joint = data.v_world[i] - data.v_world[joint.parent];
        data.a_world[i] =
            data.a_world[joint.parent] + a_joint + data.v_world[i].cross_motion(&v_joint);
        data.a_local[i] = data.a_world[i].transform_inv(&data.joint_placement[i]);
    }

    // Subtree momenta, net forces and composite inertias.
    data.momentum[0] = Force::zero();
    data.force[0] = Force::zero();
    data.subtree_inertia[0] = crate::spatial::SpatialInertia::zero();
    for i in 1..nj {
        let inertia_world = model.joints[i].inertia.transform(&data.joint_placement[i]);
        data.subtree_inertia[i] = inertia_world;
        data.momentum[i] = inertia_world.mul_motion(&data.v_world[i]);
        data.force[i] = inertia_world.mul_motion(&data.a_world[i])
            + data.v_world[i].cross_force(&data.momentum[i]);
    }
    for i in (1..nj).rev() {
        let parent = model.joints[i].parent;
        let h = data.momentum[i];
        let f = data.force[i];
        let y = data.subtree_inertia[i];
        data.momentum[parent] += h;
        data.force[parent] += f;
        data.subtree_inertia[parent] += y;
    }

    // Per-subtree centers of mass and their velocities.
    for i in 0..nj {
        let subtree = &data.subtree_inertia[i];
        data.com[i] = subtree.lever;
        data.vcom[i] = if subtree.mass > 0.0 {
            data.momentum[i].linear / subtree.mass
        } else {
            Vector3::zeros()
        };
    }

    // Centroidal momentum and its derivative (about the total COM).
    let com = data.com[0];
    let h = data.momentum[0];
    let f = data.force[0];
    data.centroidal_momentum = Force::new(h.linear, h.angular + h.linear.cross(&com));
    data.centroidal_momentum_dot = Force::new(f.linear, f.angular + f.linear.cross(&com));
}

/// Apparent inertia of the subtree rooted at a 1-DOF joint, projected on the
/// joint axis. Requires a fresh [`compute_extra_terms`].
#[must_use]
pub fn subtree_inertia_projection(model: &Model, data: &Data, joint: usize) -> f64 {
    let dof = model.joints[joint].idx_v;
    let col = data.dof_subspace_world[dof];
    col.dot(&data.subtree_inertia[joint].mul_motion(&col))
}

// ---------------------------------------------------------------------------
// Configuration-space (Lie group) operations
// ---------------------------------------------------------------------------

/// SE(3) exponential of the body-frame tangent `(v, ω)`.
fn se3_exp(v: &Vector3<f64>, omega: &Vector3<f64>) -> Placement {
    let angle = omega.norm();
    let w = skew(omega);
    let v_mat = if angle < 1e-8 {
        Matrix3::identity() + 0.5 * w + w * w / 6.0
    } else {
        let t2 = angle * angle;
        Matrix3::identity() + (1.0 - angle.cos()) / t2 * w + (angle - angle.sin()) / (t2 * angle) * (w * w)
    };
    Placement::from_parts((v_mat * v).into(), exp3(omega))
}

/// SE(3) logarithm, returning the body-frame tangent `(v, ω)`.
fn se3_log(m: &Placement) -> (Vector3<f64>, Vector3<f64>) {
    let (omega, angle) = log3(&m.rotation);
    let w = skew(&omega);
    let v_inv = if angle < 1e-8 {
        Matrix3::identity() - 0.5 * w + w * w / 12.0
    } else {
        let t2 = angle * angle;
        let coeff = 1.0 / t2 - (1.0 + angle.cos()) / (2.0 * angle * angle.sin());
        Matrix3::identity() - 0.5 * w + coeff * (w * w)
    };
    (v_inv * m.translation.vector, omega)
}

/// Integrate a configuration along the tangent `dv` (typically `v·dt`),
/// respecting the manifold structure of every joint.
#[must_use]
pub fn integrate(model: &Model, q: &DVector<f64>, dv: &DVector<f64>) -> DVector<f64> {
    let mut out = q.clone();
    for joint in &model.joints[1..] {
        let iq = joint.idx_q;
        let iv = joint.idx_v;
        match &joint.joint_type {
            JointType::Free => {
                let placement = joint_transform(joint, &q.as_slice()[iq..iq + 7]);
                let step = se3_exp(
                    &Vector3::new(dv[iv], dv[iv + 1], dv[iv + 2]),
                    &Vector3::new(dv[iv + 3], dv[iv + 4], dv[iv + 5]),
                );
                let new = placement * step;
                out[iq] = new.translation.x;
                out[iq + 1] = new.translation.y;
                out[iq + 2] = new.translation.z;
                let quat = new.rotation;
                out[iq + 3] = quat.i;
                out[iq + 4] = quat.j;
                out[iq + 5] = quat.k;
                out[iq + 6] = quat.w;
            }
            JointType::Spherical => {
                let quat = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                    q[iq + 3],
                    q[iq],
                    q[iq + 1],
                    q[iq + 2],
                ));
                let new = quat * exp3(&Vector3::new(dv[iv], dv[iv + 1], dv[iv + 2]));
                out[iq] = new.i;
                out[iq + 1] = new.j;
                out[iq + 2] = new.k;
                out[iq + 3] = new.w;
            }
            JointType::Planar => {
                let angle = q[iq + 3].atan2(q[iq + 2]);
                let rot = nalgebra::Rotation2::new(angle);
                let step = rot * nalgebra::Vector2::new(dv[iv], dv[iv + 1]);
                out[iq] += step.x;
                out[iq + 1] += step.y;
                let new_angle = angle + dv[iv + 2];
                out[iq + 2] = new_angle.cos();
                out[iq + 3] = new_angle.sin();
            }
            JointType::RevoluteUnbounded(_) => {
                let angle = q[iq + 1].atan2(q[iq]) + dv[iv];
                out[iq] = angle.cos();
                out[iq + 1] = angle.sin();
            }
            JointType::SphericalZyx
            | JointType::Translation
            | JointType::Prismatic(_)
            | JointType::Revolute(_) => {
                for k in 0..joint.joint_type.nv() {
                    out[iq + k] += dv[iv + k];
                }
            }
            JointType::Mimic | JointType::Composite { .. } => {
                for k in 0..joint.joint_type.nq().min(joint.joint_type.nv()) {
                    out[iq + k] += dv[iv + k];
                }
            }
        }
    }
    out
}

/// Tangent-space difference between two configurations,
/// `difference(q0, q1) ≈ v` such that `integrate(q0, v) = q1`.
#[must_use]
pub fn difference(model: &Model, q0: &DVector<f64>, q1: &DVector<f64>) -> DVector<f64> {
    let mut out = DVector::zeros(model.nv);
    for joint in &model.joints[1..] {
        let iq = joint.idx_q;
        let iv = joint.idx_v;
        match &joint.joint_type {
            JointType::Free => {
                let m0 = joint_transform(joint, &q0.as_slice()[iq..iq + 7]);
                let m1 = joint_transform(joint, &q1.as_slice()[iq..iq + 7]);
                let (v, w) = se3_log(&(m0.inverse() * m1));
                for k in 0..3 {
                    out[iv + k] = v[k];
                    out[iv + 3 + k] = w[k];
                }
            }
            JointType::Spherical => {
                let quat = |q: &DVector<f64>| {
                    UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                        q[iq + 3],
                        q[iq],
                        q[iq + 1],
                        q[iq + 2],
                    ))
                };
                let (w, _) = log3(&(quat(q0).inverse() * quat(q1)));
                for k in 0..3 {
                    out[iv + k] = w[k];
                }
            }
            JointType::Planar => {
                let a0 = q0[iq + 3].atan2(q0[iq + 2]);
                let a1 = q1[iq + 3].atan2(q1[iq + 2]);
                let rot = nalgebra::Rotation2::new(-a0);
                let d = rot * nalgebra::Vector2::new(q1[iq] - q0[iq], q1[iq + 1] - q0[iq + 1]);
                out[iv] = d.x;
                out[iv + 1] = d.y;
                out[iv + 2] = wrap_angle(a1 - a0);
            }
            JointType::RevoluteUnbounded(_) => {
                let a0 = q0[iq + 1].atan2(q0[iq]);
                let a1 = q1[iq + 1].atan2(q1[iq]);
                out[iv] = wrap_angle(a1 - a0);
            }
            JointType::SphericalZyx
            | JointType::Translation
            | JointType::Prismatic(_)
            | JointType::Revolute(_) => {
                for k in 0..joint.joint_type.nv() {
                    out[iv + k] = q1[iq + k] - q0[iq + k];
                }
            }
            JointType::Mimic | JointType::Composite { .. } => {
                for k in 0..joint.joint_type.nq().min(joint.joint_type.nv()) {
                    out[iv + k] = q1[iq + k] - q0[iq + k];
                }
            }
        }
    }
    out
}

/// Interpolate between two configurations on the manifold.
#[must_use]
pub fn interpolate(model: &Model, q0: &DVector<f64>, q1: &DVector<f64>, alpha: f64) -> DVector<f64> {
    let dv = difference(model, q0, q1);
    integrate(model, q0, &(dv * alpha))
}

/// Normalize the unit-norm components of a configuration in place.
pub fn normalize(model: &Model, q: &mut DVector<f64>) {
    for joint in &model.joints[1..] {
        let iq = joint.idx_q;
        match &joint.joint_type {
            JointType::Free => normalize_quat_slice(q, iq + 3),
            JointType::Spherical => normalize_quat_slice(q, iq),
            JointType::Planar => normalize_cos_sin(q, iq + 2),
            JointType::RevoluteUnbounded(_) => normalize_cos_sin(q, iq),
            _ => {}
        }
    }
}

/// Check that every unit-norm component of the configuration is normalized
/// within `tol`.
#[must_use]
pub fn is_normalized(model: &Model, q: &DVector<f64>, tol: f64) -> bool {
    for joint in &model.joints[1..] {
        let iq = joint.idx_q;
        let norm2 = match &joint.joint_type {
            JointType::Free => quat_norm2(q, iq + 3),
            JointType::Spherical => quat_norm2(q, iq),
            JointType::Planar => q[iq + 2] * q[iq + 2] + q[iq + 3] * q[iq + 3],
            JointType::RevoluteUnbounded(_) => q[iq] * q[iq] + q[iq + 1] * q[iq + 1],
            _ => continue,
        };
        if (norm2.sqrt() - 1.0).abs() > tol {
            return false;
        }
    }
    true
}

fn quat_norm2(q: &DVector<f64>, i: usize) -> f64 {
    q[i] * q[i] + q[i + 1] * q[i + 1] + q[i + 2] * q[i + 2] + q[i + 3] * q[i + 3]
}

fn normalize_quat_slice(q: &mut DVector<f64>, i: usize) {
    let norm = quat_norm2(q, i).sqrt();
    if norm > 0.0 {
        for k in 0..4 {
            q[i + k] /= norm;
        }
    } else {
        q[i] = 0.0;
        q[i + 1] = 0.0;
        q[i + 2] = 0.0;
        q[i + 3] = 1.0;
    }
}

fn normalize_cos_sin(q: &mut DVector<f64>, i: usize) {
    let norm = (q[i] * q[i] + q[i + 1] * q[i + 1]).sqrt();
    if norm > 0.0 {
        q[i] /= norm;
        q[i + 1] /= norm;
    } else {
        q[i] = 1.0;
        q[i + 1] = 0.0;
    }
}

fn wrap_angle(a: f64) -> f64 {
    let mut a = a % std::f64::consts::TAU;
    if a > std::f64::consts::PI {
        a -= std::f64::consts::TAU;
    } else if a < -std::f64::consts::PI {
        a += std::f64::consts::TAU;
    }
    a
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::factories;
    use approx::assert_relative_eq;

    #[test]
    fn test_pendulum_mass_matrix_and_gravity() {
        // Point mass m at distance l from a revolute-Y joint:
        // M = m·l², nle(θ) = m·g·l·sin(θ).
        let model = factories::n_link_pendulum(1, 1.0, 1.0);
        let mut data = model.make_data();
        let mut q = DVector::zeros(1);
        q[0] = 0.3;
        let v = DVector::zeros(1);
        kinematics_pass(&model, &mut data, &q, &v);
        crba(&model, &mut data, &q).unwrap();
        assert_relative_eq!(data.mass_matrix[(0, 0)], 1.0, epsilon = 1e-10);
        let nle = nonlinear_effects(&model, &mut data, &q, &v);
        assert_relative_eq!(nle[0], 9.81 * 0.3_f64.sin(), epsilon = 1e-10);
    }

    #[test]
    fn test_pendulum_centrifugal_term() {
        // With θ = 0 and θ̇ = w, the centrifugal force is radial and does not
        // torque a 1-DOF pendulum.
        let model = factories::n_link_pendulum(1, 2.0, 0.7);
        let mut data = model.make_data();
        let q = DVector::zeros(1);
        let mut v = DVector::zeros(1);
        v[0] = 3.0;
        let nle = nonlinear_effects(&model, &mut data, &q, &v);
        assert_relative_eq!(nle[0], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_free_flyer_dynamics_is_gravity() {
        let model = factories::free_sphere("ball", 2.0, 0.3);
        let mut data = model.make_data();
        let q = model.neutral_configuration();
        let v = DVector::zeros(6);
        let u = DVector::zeros(6);
        let fext = vec![Force::zero(); model.njoints()];
        let a = unconstrained_dynamics(&model, &mut data, &q, &v, &u, &fext).unwrap();
        assert_relative_eq!(a[2], -9.81, epsilon = 1e-10);
        assert_relative_eq!(a[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(a[5], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_integrate_difference_roundtrip() {
        let model = factories::free_sphere("ball", 1.0, 0.2);
        let q0 = model.neutral_configuration();
        let mut dv = DVector::zeros(6);
        dv[0] = 0.3;
        dv[2] = -0.8;
        dv[3] = 0.2;
        dv[5] = -0.4;
        let q1 = integrate(&model, &q0, &dv);
        let back = difference(&model, &q0, &q1);
        assert_relative_eq!(back, dv, epsilon = 1e-9);
        assert!(is_normalized(&model, &q1, 1e-10));
    }

    #[test]
    fn test_energy_of_lifted_mass() {
        let model = factories::free_sphere("ball", 3.0, 0.2);
        let mut data = model.make_data();
        let mut q = model.neutral_configuration();
        q[2] = 2.0;
        let mut v = DVector::zeros(6);
        v[0] = 1.0;
        compute_energies(&model, &mut data, &q, &v);
        assert_relative_eq!(data.potential_energy, 3.0 * 9.81 * 2.0, epsilon = 1e-9);
        assert_relative_eq!(data.kinetic_energy, 0.5 * 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_frame_velocity_of_pendulum_tip() {
        let model = factories::n_link_pendulum(1, 1.0, 1.0);
        let mut data = model.make_data();
        let q = DVector::zeros(1);
        let mut v = DVector::zeros(1);
        v[0] = 2.0;
        kinematics_pass(&model, &mut data, &q, &v);
        update_frame_placements(&model, &mut data);
        let tip = model.frame_index("tip").unwrap();
        let vel = frame_velocity_world_aligned(&model, &data, tip);
        // Rotation about +Y at the origin, tip at (0, 0, -1): v = ω × r.
        assert_relative_eq!(vel.linear, Vector3::new(-2.0, 0.0, 0.0), epsilon = 1e-10);
        assert_relative_eq!(vel.angular, Vector3::new(0.0, 2.0, 0.0), epsilon = 1e-10);
    }
}
