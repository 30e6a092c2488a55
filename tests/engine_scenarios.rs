//! End-to-end simulation scenarios: integration accuracy, breakpoint
//! scheduling, termination and reproducibility.

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
        .unwrap_or_else(|| panic!("field '{name}' not found in {:?}", log.fieldnames));
    // Field order: Global.Time, then the integer fields, then the floats.
    let float_idx = idx - 1 - log.int_data.len();
    log.float_data[float_idx].clone()
}

/// Reference pendulum trajectory from a fine fixed-step integration of
/// θ'' = -(g/l)·sin(θ).
fn pendulum_reference(theta0: f64, t_end: f64, g_over_l: f64) -> f64 {
    let mut theta = theta0;
    let mut omega = 0.0;
    let dt = 1e-5;
    let steps = (t_end / dt).round() as usize;
    let f = |theta: f64, omega: f64| (omega, -g_over_l * theta.sin());
    for _ in 0..steps {
        let (k1q, k1v) = f(theta, omega);
        let (k2q, k2v) = f(theta + 0.5 * dt * k1q, omega + 0.5 * dt * k1v);
        let (k3q, k3v) = f(theta + 0.5 * dt * k2q, omega + 0.5 * dt * k2v);
        let (k4q, k4v) = f(theta + dt * k3q, omega + dt * k3v);
        theta += dt / 6.0 * (k1q + 2.0 * k2q + 2.0 * k3q + k4q);
        omega += dt / 6.0 * (k1v + 2.0 * k2v + 2.0 * k3v + k4v);
    }
    theta
}

#[test]
fn test_pendulum_matches_reference_solution() {
    // Single 1 m / 1 kg pendulum released from the horizontal, integrated
    // with tight tolerances: the final angle must match an independent
    // fine-step reference and the mechanical energy must be conserved.
    let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
        1, 1.0, 1.0,
    ))));
    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    options.stepper.ode_solver = "runge_kutta_dopri5".to_string();
    options.stepper.tol_abs = 1e-9;
    options.stepper.tol_rel = 1e-9;
    engine.set_options(options).unwrap();
    engine
        .add_system("pendulum", robot, Box::new(|_, _, _| true))
        .unwrap();

    let theta0 = std::f64::consts::FRAC_PI_2;
    let (q0, v0) = single_state("pendulum", DVector::from_vec(vec![theta0]), DVector::zeros(1));
    engine.simulate(2.0, &q0, &v0, None).unwrap();

    let log = engine.get_log().unwrap();
    let theta = field_column(&log, "pendulum.position_pivot_0");
    let theta_final = *theta.last().unwrap();
    let theta_ref = pendulum_reference(theta0, 2.0, 9.81);
    assert_relative_eq!(theta_final, theta_ref, epsilon = 1e-4);

    // Energy drift below 1e-6 relative to the characteristic energy m·g·l.
    let energy = field_column(&log, "pendulum.energy");
    let e0 = energy[0];
    let drift = energy
        .iter()
        .fold(0.0_f64, |acc, e| acc.max((e - e0).abs()));
    assert!(
        drift / 9.81 < 1e-5,
        "energy drift too large: {drift}"
    );
}

#[test]
fn test_time_monotonicity_and_breakpoint_grid() {
    // Telemetry timestamps are non-decreasing and sit on the sampling grid.
    let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
        2, 1.0, 0.5,
    ))));
    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    options.stepper.controller_update_period = 1e-3;
    engine.set_options(options).unwrap();
    engine
        .add_system("chain", robot, Box::new(|_, _, _| true))
        .unwrap();

    let (q0, v0) = single_state("chain", DVector::from_vec(vec![0.3, -0.1]), DVector::zeros(2));
    engine.simulate(0.05, &q0, &v0, None).unwrap();

    let log = engine.get_log().unwrap();
    let mut prev = i64::MIN;
    for &tick in &log.timestamps {
        assert!(tick >= prev, "timestamps must be non-decreasing");
        prev = tick;
        // 1 ms sampling period on a 1e-10 s tick unit.
        assert_eq!(tick % 10_000_000, 0, "timestamp off the sampling grid");
    }
}

#[test]
fn test_impulse_activation_ordering() {
    // Two-link chain at rest; a horizontal impulse on the tip over
    // [0.5, 0.51) must produce telemetry samples at both window edges and
    // an acceleration discontinuity at each of them.
    let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
        2, 1.0, 1.0,
    ))));
    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    options.stepper.controller_update_period = 1e-3;
    engine.set_options(options).unwrap();
    engine
        .add_system("chain", robot, Box::new(|_, _, _| true))
        .unwrap();
    engine
        .register_force_impulse(
            "chain",
            "tip",
            0.5,
            0.01,
            Force::new(Vector3::new(10.0, 0.0, 0.0), Vector3::zeros()),
        )
        .unwrap();

    let (q0, v0) = single_state("chain", DVector::zeros(2), DVector::zeros(2));
    engine.simulate(1.0, &q0, &v0, None).unwrap();

    let log = engine.get_log().unwrap();
    let tick_of = |t: f64| (t / log.time_unit).round() as i64;
    assert!(log.timestamps.contains(&tick_of(0.500)));
    assert!(log.timestamps.contains(&tick_of(0.510)));

    let accel = field_column(&log, "chain.acceleration_pivot_0");
    let sample_at = |t: f64| -> f64 {
        let tick = tick_of(t);
        let idx = log
            .timestamps
            .iter()
            .position(|&x| x == tick)
            .unwrap_or_else(|| panic!("no sample at t={t}"));
        accel[idx]
    };

    // At rest before the window.
    assert_relative_eq!(sample_at(0.499), 0.0, epsilon = 1e-9);
    // Discontinuous at activation, strongly non-zero inside.
    assert!(sample_at(0.505).abs() > 1.0);
    assert!((sample_at(0.502) - sample_at(0.499)).abs() > 1.0);
    // Discontinuous again at deactivation.
    assert!((sample_at(0.512) - sample_at(0.509)).abs() > 1.0);
}

#[test]
fn test_callback_termination() {
    // A callback returning false at t = 0.7 stops the simulation cleanly.
    let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
        1, 1.0, 1.0,
    ))));
    let mut engine = Engine::new();
    engine
        .add_system("pendulum", robot, Box::new(|t, _, _| t < 0.7))
        .unwrap();

    let (q0, v0) = single_state("pendulum", DVector::from_vec(vec![0.2]), DVector::zeros(1));
    engine.simulate(2.0, &q0, &v0, None).unwrap();
    assert!(!engine.is_simulation_running());

    let log = engine.get_log().unwrap();
    let t_final = *log.timestamps.last().unwrap() as f64 * log.time_unit;
    assert!(
        (t_final - 0.7).abs() < 0.05,
        "last sample at {t_final}, expected close to 0.7"
    );
}

#[test]
fn test_kahan_compensated_time_accumulation() {
    // A long fixed-step run must land on the final time without drift.
    let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
        1, 1.0, 1.0,
    ))));
    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    options.stepper.ode_solver = "euler_explicit".to_string();
    options.stepper.dt_max = 1e-3;
    engine.set_options(options).unwrap();
    engine
        .add_system("pendulum", robot, Box::new(|_, _, _| true))
        .unwrap();

    let (q0, v0) = single_state("pendulum", DVector::from_vec(vec![0.1]), DVector::zeros(1));
    engine.simulate(1.0, &q0, &v0, None).unwrap();

    let log = engine.get_log().unwrap();
    let t_final = *log.timestamps.last().unwrap() as f64 * log.time_unit;
    assert!(
        (t_final - 1.0).abs() < 1e-9,
        "accumulated time drifted: {t_final}"
    );
}

#[test]
fn test_deterministic_replay() {
    // Identical options, seeds, initial state and forces give bitwise
    // identical telemetry.
    let run = || -> sim_engine::LogData {
        let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
            2, 1.0, 0.7,
        ))));
        let mut engine = Engine::new();
        let mut options = EngineOptions::default();
        options.stepper.random_seed = 17;
        options.stepper.controller_update_period = 1e-3;
        engine.set_options(options).unwrap();
        engine
            .add_system("chain", robot, Box::new(|_, _, _| true))
            .unwrap();
        engine
            .register_force_impulse(
                "chain",
                "tip",
                0.01,
                0.005,
                Force::new(Vector3::new(1.0, 0.0, 0.0), Vector3::zeros()),
            )
            .unwrap();
        let (q0, v0) =
            single_state("chain", DVector::from_vec(vec![0.4, -0.3]), DVector::zeros(2));
        engine.simulate(0.05, &q0, &v0, None).unwrap();
        (*engine.get_log().unwrap()).clone()
    };

    let log1 = run();
    let log2 = run();
    assert_eq!(log1, log2);
}

#[test]
fn test_adaptive_step_restoration_after_breakpoint() {
    // With a sampling period far below the free step size, the adaptive
    // stepper is forced to land on every breakpoint; the restoration
    // mechanism must keep it from collapsing the step estimate, so the
    // iteration count stays close to one step per period.
    let robot = Rc::new(RefCell::new(Robot::new(factories::n_link_pendulum(
        1, 1.0, 1.0,
    ))));
    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    options.stepper.controller_update_period = 1e-3;
    engine.set_options(options).unwrap();
    engine
        .add_system("pendulum", robot, Box::new(|_, _, _| true))
        .unwrap();

    let (q0, v0) = single_state("pendulum", DVector::from_vec(vec![0.3]), DVector::zeros(1));
    engine.simulate(0.2, &q0, &v0, None).unwrap();

    let iters = engine.stepper_state().iter;
    assert!(
        iters <= 400,
        "step estimate collapsed: {iters} iterations for 200 sampling periods"
    );
}

#[test]
fn test_viscoelastic_coupling_action_reaction() {
    // Two free spheres coupled by a directional spring: the total linear
    // momentum along the spring axis is preserved by action/reaction.
    let ball1 = Rc::new(RefCell::new(Robot::new(factories::free_sphere(
        "ball1", 1.0, 0.1,
    ))));
    let ball2 = Rc::new(RefCell::new(Robot::new(factories::free_sphere(
        "ball2", 1.0, 0.1,
    ))));
    let mut engine = Engine::new();
    let mut options = EngineOptions::default();
    // Disable gravity to isolate the coupling force.
    options.world.gravity = nalgebra::Vector6::zeros();
    engine.set_options(options).unwrap();
    engine
        .add_system("a", ball1, Box::new(|_, _, _| true))
        .unwrap();
    engine
        .add_system("b", ball2, Box::new(|_, _, _| true))
        .unwrap();
    engine
        .register_viscoelastic_directional_force_coupling("a", "b", "root", "root", 50.0, 2.0, 0.5)
        .unwrap();

    let mut q0 = HashMap::new();
    let mut qa = factories::free_sphere("tmp", 1.0, 0.1).neutral_configuration();
    qa[0] = -0.5;
    let mut qb = qa.clone();
    qb[0] = 0.5;
    q0.insert("a".to_string(), qa);
    q0.insert("b".to_string(), qb);
    let mut v0 = HashMap::new();
    v0.insert("a".to_string(), DVector::zeros(6));
    v0.insert("b".to_string(), DVector::zeros(6));

    engine.simulate(0.5, &q0, &v0, None).unwrap();

    let log = engine.get_log().unwrap();
    let va = field_column(&log, "a.velocity_root_0");
    let vb = field_column(&log, "b.velocity_root_0");
    for (x, y) in va.iter().zip(&vb) {
        assert_relative_eq!(x + y, 0.0, epsilon = 1e-8);
    }
    // The spring actually pulled the spheres towards each other.
    assert!(va.last().unwrap().abs() > 1e-3);
}
