//! Contact scenarios: compliant ground reaction, friction threshold and
//! rigid constraint contact transitions.

use approx::assert_relative_eq;
use nalgebra::{DVector, Vector3};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use sim_engine::model::factories;
use sim_engine::{Engine, EngineOptions, Force, Robot};

fn single_state(name: &str, q: DVector<f64>, v: DVector<f64>) -> (
    HashMap<String, DVector<f64>>,
    HashMap<String, DVector<f64>>,
) {
    let mut q0 = HashMap::new();
    q0.insert(name.to_string(), q);
    let mut v0 = HashMap::new();
    v0.insert(name.to_string(), v);
    (q0, v0)
}

fn field_column(log: &sim_engine::LogData, name: &str) -> Vec<f64> {
    let idx = log
        .fieldnames
        .iter()
        .position(|f| f == name)
        .unwrap_or_else(|| panic!("field '{name}' not found"));
    let float_idx = idx - 1 - log.int_data.len();
    log.float_data[float_idx].clone()
}

#[test]
fn test_spring_damper_resting_equilibrium() {
    // A sphere started at the static spring-damper equilibrium stays there,
    // carried by an upward normal force equal to its weight.
    let mass = 1.0;
    let radius = 0.5;
    let stiffness = 1e5;
    let penetration = mass * 9.81 / stiffness;

    let robot = Rc::new(RefCell::new(Robot::new(factories::free_sphere(
        "ball", mass, radius,
    ))));
    robot.borrow_mut().add_contact_frames(&["bottom"]).unwrap();

    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    options.contacts.stiffness = stiffness;
    options.contacts.damping = 1e3;
    options.contacts.transition_eps = 0.0;
    engine.set_options(options).unwrap();
    engine
        .add_system("ball", robot, Box::new(|_, _, _| true))
        .unwrap();

    let mut q = factories::free_sphere("tmp", mass, radius).neutral_configuration();
    q[2] = radius - penetration;
    let (q0, v0) = single_state("ball", q, DVector::zeros(6));
    engine.simulate(0.5, &q0, &v0, None).unwrap();

    let log = engine.get_log().unwrap();
    let z = field_column(&log, "ball.position_root_2");
    assert_relative_eq!(*z.last().unwrap(), radius - penetration, epsilon = 1e-4);

    // Unilaterality: the vertical ground reaction never pulls down.
    let fz = field_column(&log, "ball.force_external_root_fz");
    for value in &fz {
        assert!(*value >= -1e-9, "ground reaction pulls down: {value}");
    }
    assert_relative_eq!(*fz.last().unwrap(), mass * 9.81, epsilon = 1e-2);
}

#[test]
fn test_friction_threshold_before_sliding() {
    // A cube resting on four corner contacts is pushed horizontally with a
    // ramp profile force: it must hold still (up to friction creep) below
    // the Coulomb threshold and slide beyond it.
    let mass = 1.0;
    let side = 0.4;
    let friction = 0.5;
    let stiffness = 1e5;
    // Four corners share the weight.
    let penetration = mass * 9.81 / (4.0 * stiffness);

    let robot = Rc::new(RefCell::new(Robot::new(factories::free_box(
        "cube", mass, side, side, side,
    ))));
    robot
        .borrow_mut()
        .add_contact_frames(&["corner_0", "corner_1", "corner_2", "corner_3"])
        .unwrap();

    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    options.contacts.stiffness = stiffness;
    options.contacts.damping = 2e2;
    options.contacts.friction = friction;
    options.contacts.transition_eps = 0.0;
    options.contacts.transition_velocity = 1e-2;
    options.stepper.ode_solver = "runge_kutta_4".to_string();
    options.stepper.dt_max = 2e-4;
    engine.set_options(options).unwrap();
    engine
        .add_system("cube", robot, Box::new(|_, _, _| true))
        .unwrap();

    // Horizontal force ramping from 0 to 20 N over 2 s.
    engine
        .register_force_profile(
            "cube",
            "root",
            Box::new(|t, _q, _v| Force::new(Vector3::new(10.0 * t, 0.0, 0.0), Vector3::zeros())),
            0.0,
        )
        .unwrap();

    let mut q = factories::free_box("tmp", mass, side, side, side).neutral_configuration();
    q[2] = 0.5 * side - penetration;
    let (q0, v0) = single_state("cube", q, DVector::zeros(6));
    engine.simulate(2.0, &q0, &v0, None).unwrap();

    let log = engine.get_log().unwrap();
    let vx = field_column(&log, "cube.velocity_root_0");
    let time: Vec<f64> = log
        .timestamps
        .iter()
        .map(|&t| t as f64 * log.time_unit)
        .collect();

    // Threshold crossing: F_x = µ·m·g at t ≈ 0.49 s.
    let t_threshold = friction * mass * 9.81 / 10.0;
    let mut v_before: f64 = 0.0;
    let mut v_after: f64 = 0.0;
    for (t, v) in time.iter().zip(&vx) {
        if *t < 0.5 * t_threshold {
            v_before = v_before.max(v.abs());
        }
        if (*t - 2.0).abs() < 1e-3 {
            v_after = *v;
        }
    }
    // Below threshold only the regularized-friction creep remains.
    assert!(
        v_before < 2e-2,
        "sphere slid below the friction threshold: {v_before}"
    );
    // Far above threshold the sphere is sliding for good.
    assert!(v_after > 0.5, "sphere did not slide: {v_after}");

    // Friction cone: |f_t| <= µ·max(0, f_z) at every sample.
    let fx = field_column(&log, "cube.force_external_root_fx");
    let fy = field_column(&log, "cube.force_external_root_fy");
    let fz = field_column(&log, "cube.force_external_root_fz");
    for ((x, y), z) in fx.iter().zip(&fy).zip(&fz) {
        let tangential = (x * x + y * y).sqrt();
        // The ramp profile force also lands on the root joint: subtract the
        // largest possible applied share before testing the reaction cone.
        let bound = friction * z.max(0.0) + 20.0 + 1e-6;
        assert!(tangential <= bound, "friction cone violated: {tangential} > {bound}");
    }
}

#[test]
fn test_constraint_contact_enable_disable_hysteresis() {
    // A ball dropped on rigid constraint contact: the contact constraint is
    // enabled while penetrating and only released after lifting beyond the
    // transition depth.
    let radius = 0.5;
    let transition_eps = 1e-4;

    let robot = Rc::new(RefCell::new(Robot::new(factories::free_sphere(
        "ball", 1.0, radius,
    ))));
    robot.borrow_mut().add_contact_frames(&["bottom"]).unwrap();

    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    options.contacts.model = "constraint".to_string();
    options.contacts.transition_eps = transition_eps;
    options.contacts.stabilization_freq = 20.0;
    options.stepper.ode_solver = "runge_kutta_4".to_string();
    options.stepper.dt_max = 1e-3;
    engine.set_options(options).unwrap();
    engine
        .add_system("ball", robot.clone(), Box::new(|_, _, _| true))
        .unwrap();

    let mut q = factories::free_sphere("tmp", 1.0, radius).neutral_configuration();
    q[2] = radius + 0.05;
    let (q0, v0) = single_state("ball", q.clone(), DVector::zeros(6));

    engine.start(&q0, &v0, None).unwrap();
    let mut touched = false;
    for _ in 0..600 {
        engine.step(1e-3).unwrap();
        let state = engine.system_state("ball").unwrap();
        let bottom_z = state.q[2] - radius;
        let enabled = robot.borrow().constraints().contact_frames[0]
            .1
            .borrow()
            .is_enabled();
        if enabled {
            touched = true;
            // An enabled contact cannot be floating above the hysteresis
            // band.
            assert!(
                bottom_z < 10.0 * transition_eps,
                "constraint enabled while airborne at height {bottom_z}"
            );
        } else if touched {
            // Once released after a touch, the frame has really lifted.
            assert!(
                bottom_z > -5.0 * transition_eps,
                "constraint disabled while penetrating at depth {bottom_z}"
            );
        }
    }
    assert!(touched, "the ball never touched the ground");

    // Steady state: resting on the surface within the transition depth.
    let state = engine.system_state("ball").unwrap();
    let bottom_z = state.q[2] - radius;
    assert!(
        bottom_z.abs() < 5e-3,
        "ball did not settle on the ground: {bottom_z}"
    );
    engine.stop();
}

#[test]
fn test_constraint_contact_unilateral_reaction() {
    // Under the rigid contact model the vertical ground reaction stays
    // non-negative at every telemetry sample.
    let radius = 0.5;
    let robot = Rc::new(RefCell::new(Robot::new(factories::free_sphere(
        "ball", 2.0, radius,
    ))));
    robot.borrow_mut().add_contact_frames(&["bottom"]).unwrap();

    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    options.contacts.model = "constraint".to_string();
    options.contacts.transition_eps = 1e-4;
    options.stepper.ode_solver = "runge_kutta_4".to_string();
    options.stepper.dt_max = 1e-3;
    engine.set_options(options).unwrap();
    engine
        .add_system("ball", robot, Box::new(|_, _, _| true))
        .unwrap();

    let mut q = factories::free_sphere("tmp", 2.0, radius).neutral_configuration();
    q[2] = radius + 0.02;
    let (q0, v0) = single_state("ball", q, DVector::zeros(6));
    engine.simulate(1.0, &q0, &v0, None).unwrap();

    let log = engine.get_log().unwrap();
    let fz = field_column(&log, "ball.force_external_root_fz");
    for value in &fz {
        assert!(*value >= -1e-6, "unilateral contact violated: {value}");
    }
    // At rest the reaction carries the weight.
    assert_relative_eq!(*fz.last().unwrap(), 2.0 * 9.81, epsilon = 0.5);
}

#[test]
fn test_collision_body_sphere_on_ground() {
    // The collision-body path: a sphere geometry (no contact frame) under
    // the compliant model settles at the penetration equilibrium.
    let mass = 1.0;
    let radius = 0.3;
    let stiffness = 1e5;
    let penetration = mass * 9.81 / stiffness;

    let robot = Rc::new(RefCell::new(Robot::new(factories::free_sphere(
        "ball", mass, radius,
    ))));
    robot.borrow_mut().add_collision_body("root", radius).unwrap();

    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    options.contacts.stiffness = stiffness;
    options.contacts.damping = 1e3;
    options.contacts.transition_eps = 0.0;
    engine.set_options(options).unwrap();
    engine
        .add_system("ball", robot, Box::new(|_, _, _| true))
        .unwrap();

    let mut q = factories::free_sphere("tmp", mass, radius).neutral_configuration();
    q[2] = radius - penetration;
    let (q0, v0) = single_state("ball", q, DVector::zeros(6));
    engine.simulate(0.5, &q0, &v0, None).unwrap();

    let log = engine.get_log().unwrap();
    let z = field_column(&log, "ball.position_root_2");
    assert_relative_eq!(*z.last().unwrap(), radius - penetration, epsilon = 1e-4);
}

#[test]
fn test_joint_bound_enforcement_spring_damper() {
    // A driven pendulum with position limits: the bound reaction keeps the
    // joint close to its limit under a constant overdriving torque.
    let mut model = factories::n_link_pendulum(1, 1.0, 1.0);
    let pivot = model.joint_index("pivot_0").unwrap();
    model.set_position_limits(pivot, -0.5, 0.5).unwrap();
    let robot = Rc::new(RefCell::new(Robot::new(model)));
    robot
        .borrow_mut()
        .attach_motor(sim_engine::Motor::new("drive", "pivot_0", 100.0))
        .unwrap();

    let controller = {
        let mut c = sim_engine::FunctionController::new(
            |_t, _q, _v, command: &mut DVector<f64>| command[0] = 15.0,
            |_, _, _, _| {},
        );
        c.initialize(&robot).unwrap();
        Rc::new(RefCell::new(c))
    };

    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    options.stepper.ode_solver = "runge_kutta_4".to_string();
    options.stepper.dt_max = 1e-4;
    engine.set_options(options).unwrap();
    engine
        .add_system_with_controller("pendulum", robot, controller, Box::new(|_, _, _| true))
        .unwrap();

    let (q0, v0) = single_state("pendulum", DVector::zeros(1), DVector::zeros(1));
    engine.simulate(0.5, &q0, &v0, None).unwrap();

    let log = engine.get_log().unwrap();
    let theta = field_column(&log, "pendulum.position_pivot_0");
    let theta_final = *theta.last().unwrap();
    // Pushed against the upper bound but held near it by the bound spring.
    assert!(theta_final > 0.4, "pendulum never reached its bound");
    assert!(
        theta_final < 0.55,
        "position limit overshoot too large: {theta_final}"
    );
}
