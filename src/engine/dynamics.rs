//! Dynamics composition over all registered systems.
//!
//! Free functions operating on disjoint engine fields so the integration
//! loop can hand the stepper a dynamics callable borrowing only what it
//! needs. Accumulation order is fixed by registry iteration order, which
//! makes trajectories reproducible.

use nalgebra::DVector;

use crate::constants::EPS;
use crate::constraint::{ConstraintKind, SharedConstraint};
use crate::contact::{spring_damper_force, ContactModel, GroundProfile};
use crate::engine::options::EngineOptions;
use crate::engine::state::{SystemData, SystemHolder};
use crate::forces::FramePair;
use crate::model::algorithms;
use crate::robot::CollisionBody;
use crate::spatial::{jlog3, log3, Force, Motion, Placement};

/// Forward kinematics of one system, including frame placements.
pub(crate) fn compute_forward_kinematics(
    system: &SystemHolder,
    q: &DVector<f64>,
    v: &DVector<f64>,
    a: &DVector<f64>,
) {
    let mut robot = system.robot.borrow_mut();
    let (model, data) = robot.model_and_data_mut();
    algorithms::forward_kinematics(model, data, q, v, a);
    algorithms::update_frame_placements(model, data);
}

/// Contact handling at a declared contact frame: spring-damper reaction or
/// constraint transition, plus reference-transform refresh.
pub(crate) fn compute_contact_dynamics_at_frame(
    system: &SystemHolder,
    options: &EngineOptions,
    contact_model: ContactModel,
    ground: &GroundProfile,
    frame_idx: usize,
    constraint: &SharedConstraint,
    f_local: &mut Force,
) {
    let robot = system.robot.borrow();
    let model = robot.model();
    let data = robot.data();

    // Ground height and normal under the frame origin.
    let transform = data.frame_placement[frame_idx];
    let pos = transform.translation.vector;
    let (z_ground, mut n_ground) = ground(&pos);
    let norm = n_ground.norm();
    if norm > EPS {
        n_ground /= norm;
    }
    // First-order depth projection, exact in the absence of curvature.
    let depth = (pos.z - z_ground) * n_ground.z;

    let mut handle = constraint.borrow_mut();
    if depth < 0.0 {
        if contact_model == ContactModel::SpringDamper {
            let v_contact =
                algorithms::frame_velocity_world_aligned(model, data, frame_idx).linear;
            let f_world = spring_damper_force(&options.contacts, &n_ground, depth, &v_contact);
            *f_local = algorithms::force_world_frame_to_joint(model, data, frame_idx, &f_world);
        } else {
            handle.enable();
        }
    } else if contact_model == ContactModel::SpringDamper {
        // Not in contact with the ground, no force applied.
        f_local.set_zero();
    } else if depth > options.contacts.transition_eps {
        // Hysteresis against sporadic contact detection.
        handle.disable();
    }

    /* The reference position tracks the ground surface as long as the
    constraint is enabled: in case of slippage the contact point has
    actually moved. */
    if contact_model == ContactModel::Constraint && handle.is_enabled() {
        if let ConstraintKind::FixedFrame(fixed) = &mut handle.kind {
            fixed.reference = Placement::from_parts(
                (pos - depth * n_ground).into(),
                transform.rotation,
            );
            fixed.normal = n_ground;
        }
    }
}

/// Contact handling at a sphere collision body.
pub(crate) fn compute_contact_dynamics_at_body(
    system: &SystemHolder,
    options: &EngineOptions,
    contact_model: ContactModel,
    ground: &GroundProfile,
    body: &CollisionBody,
    constraint: &SharedConstraint,
    f_local: &mut Force,
) {
    let robot = system.robot.borrow();
    let model = robot.model();
    let data = robot.data();
    let parent_joint = model.frames[body.frame_idx].parent_joint;

    f_local.set_zero();

    let mut handle = constraint.borrow_mut();
    if contact_model == ContactModel::Constraint {
        // Re-enabled below only while an actual contact persists.
        handle.disable();
    }

    let center = data.frame_placement[body.frame_idx].translation.vector;
    let (z_ground, mut n_ground) = ground(&center);
    let norm = n_ground.norm();
    if norm < 1.0 - EPS.sqrt() {
        // A degenerate normal means the ground query failed; assume no
        // collision at all rather than applying a bogus reaction.
        tracing::warn!(
            frame = body.frame_name.as_str(),
            "ground profile returned a degenerate normal"
        );
        return;
    }
    n_ground /= norm;
    if n_ground.z < 0.0 {
        n_ground = -n_ground;
    }
    let depth = (center.z - z_ground) * n_ground.z - body.radius;
    if depth >= 0.0 {
        return;
    }
    let contact_point = center - n_ground * body.radius;

    if contact_model == ContactModel::SpringDamper {
        let v_contact = data.v_world[parent_joint].velocity_at(&contact_point);
        let f_world = spring_damper_force(&options.contacts, &n_ground, depth, &v_contact);
        *f_local = *f_local
            + algorithms::force_at_world_point_to_joint(data, parent_joint, &contact_point, &f_world);
    } else {
        // Single enabled constraint per collision body.
        handle.enable();
        if let ConstraintKind::FixedFrame(fixed) = &mut handle.kind {
            fixed.reference = Placement::from_parts(
                (center - depth * n_ground).into(),
                data.frame_placement[body.frame_idx].rotation,
            );
            fixed.normal = n_ground;
        }
    }
}

/// Refresh the controller command of one system.
pub(crate) fn compute_command(
    system: &SystemHolder,
    t: f64,
    q: &DVector<f64>,
    v: &DVector<f64>,
    command: &mut DVector<f64>,
) {
    command.fill(0.0);
    system.controller.borrow_mut().compute_command(t, q, v, command);
}

/// Internal dynamics: position/velocity bound enforcement and flexibility
/// springs.
pub(crate) fn compute_internal_dynamics(
    system: &SystemHolder,
    data_holder: &SystemData,
    options: &EngineOptions,
    contact_model: ContactModel,
    q: &DVector<f64>,
    v: &DVector<f64>,
    u_internal: &mut DVector<f64>,
) {
    let robot = system.robot.borrow();
    let model = robot.model();
    let data = robot.data();
    let stiffness = options.joints.bound_stiffness;
    let damping = options.joints.bound_damping;
    let transition_eps = options.contacts.transition_eps;

    // Position bounds of the rigid 1-DOF joints.
    for (_, constraint) in &data_holder.constraints_holder.bound_joints {
        let mut handle = constraint.borrow_mut();
        let ConstraintKind::JointBound(bound) = &mut handle.kind else {
            continue;
        };
        let joint = &model.joints[bound.joint_idx];
        let Some((q_min, q_max)) = joint.position_limits else {
            continue;
        };
        let q_joint = q[joint.idx_q];
        let v_joint = v[joint.idx_v];

        if contact_model == ContactModel::SpringDamper {
            // Restoring acceleration scaled by the apparent subtree inertia.
            let inertia = algorithms::subtree_inertia_projection(model, data, bound.joint_idx);
            let mut accel = 0.0;
            if q_joint > q_max {
                accel = -(stiffness * (q_joint - q_max) + damping * v_joint).max(0.0);
            } else if q_joint < q_min {
                accel = -(stiffness * (q_joint - q_min) + damping * v_joint).min(0.0);
            }
            u_internal[joint.idx_v] += inertia * accel;
        } else if q_joint > q_max || q_joint < q_min {
            bound.reference = q_joint.clamp(q_min, q_max);
            bound.above_upper = q_joint > q_max;
            handle.enable();
        } else if q_min + transition_eps < q_joint && q_joint < q_max - transition_eps {
            handle.disable();
        }
    }

    // Velocity bounds (spring-damper model only).
    if contact_model == ContactModel::SpringDamper {
        for (joint_idx, joint) in model.joints.iter().enumerate().skip(1) {
            let Some(v_max) = joint.velocity_limit else {
                continue;
            };
            let v_joint = v[joint.idx_v];
            let v_error = if v_joint > v_max {
                v_joint - v_max
            } else if v_joint < -v_max {
                v_joint + v_max
            } else {
                continue;
            };
            let inertia = algorithms::subtree_inertia_projection(model, data, joint_idx);
            u_internal[joint.idx_v] += inertia * (-2.0 * damping * v_error);
        }
    }

    // Structural flexibility: rotational spring-damper in the tangent space
    // of spherical joints.
    for flex in robot.flexibility() {
        let joint = &model.joints[flex.joint_idx];
        let iq = joint.idx_q;
        let iv = joint.idx_v;
        let quat = nalgebra::UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            q[iq + 3],
            q[iq],
            q[iq + 1],
            q[iq + 2],
        ));
        let (angle_axis, angle) = log3(&quat);
        debug_assert!(angle < 0.95 * std::f64::consts::PI);
        let rot_jlog3 = jlog3(angle, &angle_axis);
        let spring = rot_jlog3 * flex.stiffness.component_mul(&angle_axis);
        for k in 0..3 {
            u_internal[iv + k] -= spring[k] + flex.damping[k] * v[iv + k];
        }
    }
}

/// Contact forces at every contact frame and collision pair of one system.
pub(crate) fn compute_collision_forces(
    system: &SystemHolder,
    data_holder: &mut SystemData,
    options: &EngineOptions,
    contact_model: ContactModel,
    ground: &GroundProfile,
    fext: &mut [Force],
) {
    // Forces at the declared contact frames.
    let contact_frames: Vec<(usize, usize)> = {
        let robot = system.robot.borrow();
        robot
            .contact_frame_indices()
            .iter()
            .map(|&frame_idx| {
                (
                    frame_idx,
                    robot.model().frames[frame_idx].parent_joint,
                )
            })
            .collect()
    };
    for (i, (frame_idx, parent_joint)) in contact_frames.iter().enumerate() {
        let constraint = data_holder.constraints_holder.contact_frames[i].1.clone();
        let mut f_local = data_holder.contact_frames_forces[i];
        compute_contact_dynamics_at_frame(
            system,
            options,
            contact_model,
            ground,
            *frame_idx,
            &constraint,
            &mut f_local,
        );
        data_holder.contact_frames_forces[i] = f_local;
        fext[*parent_joint] += f_local;

        // Store the contact force in the frame-local convention.
        let mut robot = system.robot.borrow_mut();
        let placement = robot.model().frames[*frame_idx].placement;
        robot.contact_forces[i] = f_local.transform_inv(&placement);
    }

    // Forces at the collision bodies.
    let bodies: Vec<CollisionBody> = system.robot.borrow().collision_bodies().to_vec();
    for (i, body) in bodies.iter().enumerate() {
        let parent_joint = system.robot.borrow().model().frames[body.frame_idx].parent_joint;
        for j in 0..data_holder.collision_bodies_forces[i].len() {
            let constraint = data_holder.constraints_holder.collision_bodies[i][j].1.clone();
            let mut f_local = data_holder.collision_bodies_forces[i][j];
            compute_contact_dynamics_at_body(
                system,
                options,
                contact_model,
                ground,
                body,
                &constraint,
                &mut f_local,
            );
            data_holder.collision_bodies_forces[i][j] = f_local;
            fext[parent_joint] += f_local;
        }
    }
}

/// User-registered external forces: active impulses and profile forces.
pub(crate) fn compute_external_forces(
    system: &SystemHolder,
    data_holder: &mut SystemData,
    t: f64,
    q: &DVector<f64>,
    v: &DVector<f64>,
    fext: &mut [Force],
) {
    let robot = system.robot.borrow();
    let model = robot.model();
    let data = robot.data();

    /* The active set is managed at scheduling time to get around the
    ambiguous t- versus t+ at the window edges; it is not re-derived here. */
    for (active, impulse) in data_holder
        .forces_impulse_active
        .iter()
        .zip(&data_holder.forces_impulse)
    {
        if *active {
            let parent = model.frames[impulse.frame_idx].parent_joint;
            fext[parent] += algorithms::force_world_frame_to_joint(
                model,
                data,
                impulse.frame_idx,
                &impulse.force,
            );
        }
    }

    for profile in &mut data_holder.forces_profile {
        let parent = model.frames[profile.frame_idx].parent_joint;
        if profile.update_period < EPS {
            profile.force_prev = (profile.force_fn)(t, q, v);
        }
        fext[parent] += algorithms::force_world_frame_to_joint(
            model,
            data,
            profile.frame_idx,
            &profile.force_prev,
        );
    }
}

/// Pairwise coupling forces with action/reaction transport.
pub(crate) fn compute_forces_coupling(
    systems: &[SystemHolder],
    systems_data: &mut [SystemData],
    forces_coupling: &mut [crate::forces::ForceCoupling],
    t: f64,
    q_split: &[DVector<f64>],
    v_split: &[DVector<f64>],
) {
    for coupling in forces_coupling.iter_mut() {
        let idx1 = coupling.system_idx1;
        let idx2 = coupling.system_idx2;

        // Resolve both frame kinematics before invoking the functor.
        let frames = {
            let robot1 = systems[idx1].robot.borrow();
            let robot2 = systems[idx2].robot.borrow();
            FramePair {
                placement1: robot1.data().frame_placement[coupling.frame_idx1],
                placement2: robot2.data().frame_placement[coupling.frame_idx2],
                velocity1: algorithms::frame_velocity_world_aligned(
                    robot1.model(),
                    robot1.data(),
                    coupling.frame_idx1,
                ),
                velocity2: algorithms::frame_velocity_world_aligned(
                    robot2.model(),
                    robot2.data(),
                    coupling.frame_idx2,
                ),
            }
        };

        let mut force = (coupling.force_fn)(
            t,
            &q_split[idx1],
            &v_split[idx1],
            &q_split[idx2],
            &v_split[idx2],
            &frames,
        );

        {
            let robot1 = systems[idx1].robot.borrow();
            let parent1 = robot1.model().frames[coupling.frame_idx1].parent_joint;
            let f_joint1 = algorithms::force_world_frame_to_joint(
                robot1.model(),
                robot1.data(),
                coupling.frame_idx1,
                &force,
            );
            drop(robot1);
            systems_data[idx1].state.f_external[parent1] += f_joint1;
        }

        // Move the reaction from frame 1 to frame 2 with the offset moment.
        force = -force;
        let offset = frames.placement2.translation.vector - frames.placement1.translation.vector;
        force.angular -= offset.cross(&force.linear);
        {
            let robot2 = systems[idx2].robot.borrow();
            let parent2 = robot2.model().frames[coupling.frame_idx2].parent_joint;
            let f_joint2 = algorithms::force_world_frame_to_joint(
                robot2.model(),
                robot2.data(),
                coupling.frame_idx2,
                &force,
            );
            drop(robot2);
            systems_data[idx2].state.f_external[parent2] += f_joint2;
        }
    }
}

/// All internal and external forces of every system, excluding the
/// user-specified internal dynamics.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_all_terms(
    systems: &[SystemHolder],
    systems_data: &mut [SystemData],
    forces_coupling: &mut [crate::forces::ForceCoupling],
    options: &EngineOptions,
    contact_model: ContactModel,
    ground: &GroundProfile,
    t: f64,
    q_split: &[DVector<f64>],
    v_split: &[DVector<f64>],
) {
    for data_holder in systems_data.iter_mut() {
        for f in &mut data_holder.state.f_external {
            f.set_zero();
        }
        data_holder.state.u_internal.fill(0.0);
    }

    compute_forces_coupling(systems, systems_data, forces_coupling, t, q_split, v_split);

    for (i, (system, data_holder)) in systems.iter().zip(systems_data.iter_mut()).enumerate() {
        let mut u_internal = std::mem::replace(&mut data_holder.state.u_internal, DVector::zeros(0));
        compute_internal_dynamics(
            system,
            data_holder,
            options,
            contact_model,
            &q_split[i],
            &v_split[i],
            &mut u_internal,
        );
        data_holder.state.u_internal = u_internal;

        let mut fext = std::mem::take(&mut data_holder.state.f_external);
        compute_collision_forces(system, data_holder, options, contact_model, ground, &mut fext);
        compute_external_forces(system, data_holder, t, &q_split[i], &v_split[i], &mut fext);
        data_holder.state.f_external = fext;
    }
}

/// Forward dynamics of one system under the current total effort and
/// external forces, with constraint projection when any constraint is
/// registered.
pub(crate) fn compute_acceleration(
    system: &SystemHolder,
    data_holder: &mut SystemData,
    options: &EngineOptions,
    q: &DVector<f64>,
    v: &DVector<f64>,
    ignore_bounds: bool,
) -> DVector<f64> {
    let mut robot = system.robot.borrow_mut();
    let nv = robot.nv();
    let has_constraints = robot.has_constraints();

    if has_constraints && data_holder.constraint_solver.is_some() {
        if robot.compute_constraints(q, v).is_err() {
            return DVector::from_element(nv, f64::NAN);
        }

        // Project external forces from Cartesian space to joint space.
        let (model, data) = robot.model_and_data_mut();
        let tau_ext =
            algorithms::joint_torques_from_external(model, data, &data_holder.state.f_external);
        let tau = &data_holder.state.u + tau_ext;

        algorithms::nonlinear_effects(model, data, q, v);
        if algorithms::crba(model, data, q).is_err() {
            return DVector::from_element(nv, f64::NAN);
        }

        let Some(solver) = data_holder.constraint_solver.as_mut() else {
            return DVector::from_element(nv, f64::NAN);
        };
        let converged = solver.solve_boxed_forward_dynamics(
            data,
            &tau,
            options.constraints.regularization,
            ignore_bounds,
        );
        if !converged {
            // Non-fatal: integration proceeds with the current multipliers
            // and the stepper NaN check catches actual failures.
            tracing::debug!("constraint solver did not converge");
        }
        let ddq = data.ddq.clone();
        drop(robot);

        // Restore bound-joint reaction efforts and contact frame forces
        // from the Lagrange multipliers.
        apply_constraint_reactions(system, data_holder);
        ddq
    } else {
        let (model, data) = robot.model_and_data_mut();
        match algorithms::unconstrained_dynamics(
            model,
            data,
            q,
            v,
            &data_holder.state.u,
            &data_holder.state.f_external,
        ) {
            Ok(ddq) => ddq,
            Err(_) => DVector::from_element(nv, f64::NAN),
        }
    }
}

/// Propagate solved multipliers back into efforts and contact forces.
fn apply_constraint_reactions(system: &SystemHolder, data_holder: &mut SystemData) {
    let mut robot = system.robot.borrow_mut();

    // Bound joints: the multiplier is a joint-space reaction effort.
    for (_, constraint) in &data_holder.constraints_holder.bound_joints {
        let handle = constraint.borrow();
        if !handle.is_enabled() {
            continue;
        }
        if let ConstraintKind::JointBound(bound) = &handle.kind {
            let idx_v = robot.model().joints[bound.joint_idx].idx_v;
            let sign = if bound.above_upper { -1.0 } else { 1.0 };
            let reaction = sign * handle.lambda[0];
            data_holder.state.u_internal[idx_v] += reaction;
            data_holder.state.u[idx_v] += reaction;
        }
    }

    // Contact frames: decompose the multiplier into linear force and spin
    // about the contact normal, then transport onto the parent joint.
    for (i, (_, constraint)) in data_holder
        .constraints_holder
        .contact_frames
        .iter()
        .enumerate()
    {
        let handle = constraint.borrow();
        if !handle.is_enabled() {
            if i < robot.contact_forces.len() {
                robot.contact_forces[i].set_zero();
            }
            continue;
        }
        let ConstraintKind::FixedFrame(fixed) = &handle.kind else {
            continue;
        };
        let local = fixed.local_frame();
        let f_in_local = Force::new(
            nalgebra::Vector3::new(handle.lambda[0], handle.lambda[1], handle.lambda[2]),
            nalgebra::Vector3::new(0.0, 0.0, handle.lambda[3]),
        );
        let f_world = Force::new(local * f_in_local.linear, local * f_in_local.angular);

        let frame_idx = fixed.frame_idx;
        {
            let (model, data) = robot.model_and_data_mut();
            let f_joint =
                algorithms::force_world_frame_to_joint(model, data, frame_idx, &f_world);
            let parent = model.frames[frame_idx].parent_joint;
            data_holder.state.f_external[parent] += f_joint;
        }
        // Back into the contact-frame-local convention for the per-frame
        // force buffer.
        let rotation_world_in_frame = robot.data().frame_placement[frame_idx]
            .rotation
            .inverse();
        if i < robot.contact_forces.len() {
            robot.contact_forces[i] = Force::new(
                rotation_world_in_frame * f_world.linear,
                rotation_world_in_frame * f_world.angular,
            );
        }
    }

    // Collision bodies: transport only, no per-frame buffer.
    let collision: Vec<SharedConstraint> = data_holder
        .constraints_holder
        .collision_bodies
        .iter()
        .flat_map(|row| row.iter().map(|(_, c)| c.clone()))
        .collect();
    for constraint in collision {
        let handle = constraint.borrow();
        if !handle.is_enabled() {
            continue;
        }
        let ConstraintKind::FixedFrame(fixed) = &handle.kind else {
            continue;
        };
        let local = fixed.local_frame();
        let f_world = Force::new(
            local * nalgebra::Vector3::new(handle.lambda[0], handle.lambda[1], handle.lambda[2]),
            local * nalgebra::Vector3::new(0.0, 0.0, handle.lambda[3]),
        );
        let (model, data) = robot.model_and_data_mut();
        let f_joint =
            algorithms::force_world_frame_to_joint(model, data, fixed.frame_idx, &f_world);
        let parent = model.frames[fixed.frame_idx].parent_joint;
        data_holder.state.f_external[parent] += f_joint;
    }
}

/// Full dynamics composition: from `(t, q, v)` to the joint accelerations
/// of every system.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_systems_dynamics(
    systems: &mut [SystemHolder],
    systems_data: &mut [SystemData],
    forces_coupling: &mut [crate::forces::ForceCoupling],
    options: &EngineOptions,
    contact_model: ContactModel,
    ground: &GroundProfile,
    contact_forces_prev: &mut [Vec<Force>],
    f_prev: &mut [Vec<Force>],
    a_prev: &mut [Vec<Motion>],
    t: f64,
    q_split: &[DVector<f64>],
    v_split: &[DVector<f64>],
    a_split: &mut Vec<DVector<f64>>,
) {
    a_split.resize(v_split.len(), DVector::zeros(0));

    // Kinematics with the previous acceleration, needed by frame-velocity
    // and acceleration queries.
    for (i, (system, data_holder)) in systems.iter().zip(systems_data.iter()).enumerate() {
        compute_forward_kinematics(system, &q_split[i], &v_split[i], &data_holder.state_prev.a);
    }

    compute_all_terms(
        systems,
        systems_data,
        forces_coupling,
        options,
        contact_model,
        ground,
        t,
        q_split,
        v_split,
    );

    let sensors_continuous = options.stepper.sensors_update_period < EPS;
    let controller_continuous = options.stepper.controller_update_period < EPS;

    for (i, (system, data_holder)) in systems.iter_mut().zip(systems_data.iter_mut()).enumerate()
    {
        let q = &q_split[i];
        let v = &v_split[i];

        /* Continuous sensing runs against the previous-iteration forces and
        accelerations: the current ones depend on the sensor values
        themselves. */
        if sensors_continuous {
            {
                let mut robot = system.robot.borrow_mut();
                std::mem::swap(&mut robot.contact_forces, &mut contact_forces_prev[i]);
                let data = robot.data_mut();
                std::mem::swap(&mut data.force, &mut f_prev[i]);
                std::mem::swap(&mut data.a_world, &mut a_prev[i]);
            }
            system.robot.borrow_mut().set_sensors_data(
                t,
                q,
                v,
                &data_holder.state_prev.a,
                &data_holder.state_prev.u_motor,
                &data_holder.state_prev.f_external,
            );
            {
                let mut robot = system.robot.borrow_mut();
                std::mem::swap(&mut robot.contact_forces, &mut contact_forces_prev[i]);
                let data = robot.data_mut();
                std::mem::swap(&mut data.force, &mut f_prev[i]);
                std::mem::swap(&mut data.a_world, &mut a_prev[i]);
            }
        }

        if controller_continuous {
            let mut command = std::mem::replace(&mut data_holder.state.command, DVector::zeros(0));
            compute_command(system, t, q, v, &mut command);
            data_holder.state.command = command;
        }

        // Motor efforts from the previous acceleration: the current one is
        // what is about to be solved for.
        {
            let mut robot = system.robot.borrow_mut();
            robot.compute_motors_efforts(
                t,
                q,
                v,
                &data_holder.state_prev.a,
                &data_holder.state.command,
            );
            data_holder.state.u_motor = robot.motors_efforts().clone();
        }

        // User-supplied internal dynamics.
        data_holder.state.u_custom.fill(0.0);
        system
            .controller
            .borrow_mut()
            .internal_dynamics(t, q, v, &mut data_holder.state.u_custom);

        // Total joint effort.
        data_holder.state.u = &data_holder.state.u_internal + &data_holder.state.u_custom;
        {
            let robot = system.robot.borrow();
            for (k, motor) in robot.motors().iter().enumerate() {
                data_holder.state.u[motor.joint_velocity_idx()] += data_holder.state.u_motor[k];
            }
        }

        a_split[i] = compute_acceleration(system, data_holder, options, q, v, false);
    }
}

/// Recompute joint accelerations, forces, subtree inertias and centroidal
/// quantities of every system from up-to-date kinematics.
pub(crate) fn compute_all_extra_terms(systems: &[SystemHolder]) {
    for system in systems {
        let mut robot = system.robot.borrow_mut();
        let (model, data) = robot.model_and_data_mut();
        algorithms::compute_extra_terms(model, data);
    }
}

/// Synchronize the previous-iteration force and acceleration buffers from
/// the robot scratch.
pub(crate) fn sync_all_accelerations_and_forces(
    systems: &[SystemHolder],
    contact_forces_prev: &mut [Vec<Force>],
    f_prev: &mut [Vec<Force>],
    a_prev: &mut [Vec<Motion>],
) {
    for (i, system) in systems.iter().enumerate() {
        let robot = system.robot.borrow();
        contact_forces_prev[i].clone_from(&robot.contact_forces);
        f_prev[i].clone_from(&robot.data().force);
        a_prev[i].clone_from(&robot.data().a_world);
    }
}
