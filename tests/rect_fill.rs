mod common;

use common::*;
use infuse::{
    InfuseError, KrylovMethod, PreconditionerKind, PressureMode, SolverOptions, SolverType,
    StepEnd,
};
use tempfile::tempdir;

fn assert_close(actual: f64, expected: f64, rel: f64) {
    assert!(
        ((actual - expected) / expected).abs() <= rel,
        "{actual} differs from {expected} by more than {rel}"
    );
}

#[test]
fn fill_time_matches_rectilinear_solution() {
    for pressure in [1e5, 1e4] {
        let dir = tempdir().unwrap();
        let mut model = initialised_rectangle(dir.path(), pressure, SolverOptions::default());
        model.solve().unwrap();

        assert_eq!(model.n_empty_cvs().unwrap(), 0);
        let expected = analytic_fill_time(LENGTH, pressure);
        assert_close(model.current_time().unwrap(), expected, 0.01);

        let solution = model.latest_solution().unwrap();
        assert_eq!(solution.steps[0].time, 0.0);
        assert_eq!(solution.last().unwrap().time, model.current_time().unwrap());
    }
}

#[test]
fn fill_is_monotone_and_bounded() {
    let dir = tempdir().unwrap();
    let mut model = initialised_rectangle(dir.path(), 1e5, SolverOptions::default());
    model.solve().unwrap();
    let solution = model.latest_solution().unwrap();

    for pair in solution.steps.windows(2) {
        assert!(pair[1].time > pair[0].time);
        for (before, after) in pair[0].fill_factor.iter().zip(&pair[1].fill_factor) {
            assert!(after >= before, "fill factor decreased");
            assert!((0.0..=1.0).contains(after));
        }
    }
    assert!(solution
        .last()
        .unwrap()
        .fill_factor
        .iter()
        .all(|f| *f == 1.0));
    // flow enters through the inlet on every step after the first
    assert!(solution.steps[1..].iter().all(|s| s.inlet_flow_rate > 0.0));
}

#[test]
fn new_solution_reproduces_the_first_bitwise() {
    let dir = tempdir().unwrap();
    let mut model = initialised_rectangle(dir.path(), 1e5, SolverOptions::default());
    model.solve().unwrap();
    let first = model.latest_solution().unwrap().clone();

    model.initialise_new_solution().unwrap();
    assert_eq!(model.current_time().unwrap(), 0.0);
    assert!(model.latest_solution().is_none());
    model.solve().unwrap();
    let second = model.latest_solution().unwrap();

    assert_eq!(&first, second);
}

#[test]
fn periodic_write_out_lands_on_interval_boundaries() {
    let dir = tempdir().unwrap();
    let mut model = rectangle_model(dir.path(), 1e5);
    model
        .assign_simulation_parameter("wo_delta_time", 500.0)
        .unwrap();
    model.initialise_solver(SolverOptions::default()).unwrap();
    model.solve().unwrap();

    let times = model.latest_solution().unwrap().time();
    for k in 1..=4 {
        let t = 500.0 * k as f64;
        assert!(times.contains(&t), "no write-out at {t} in {times:?}");
    }
    assert_eq!(times[0], 0.0);
    assert_eq!(*times.last().unwrap(), model.current_time().unwrap());
    // one step per column, most of them not written out
    assert!(times.len() < NX);
    assert_close(
        model.current_time().unwrap(),
        analytic_fill_time(LENGTH, 1e5),
        0.01,
    );
}

#[test]
fn interval_solves_stop_on_the_interval_end() {
    let dir = tempdir().unwrap();
    let mut reference = initialised_rectangle(dir.path(), 1e5, SolverOptions::default());
    reference.solve().unwrap();
    let fill_time = reference.current_time().unwrap();

    let mut model = initialised_rectangle(dir.path(), 1e5, SolverOptions::default());
    assert_eq!(
        model.solve_time_interval(1000.0).unwrap(),
        StepEnd::IntervalElapsed
    );
    assert_eq!(model.current_time().unwrap(), 1000.0);
    assert!(model.n_empty_cvs().unwrap() > 0);
    assert_eq!(
        model.solve_time_interval(1000.0).unwrap(),
        StepEnd::IntervalElapsed
    );
    assert_eq!(model.current_time().unwrap(), 2000.0);
    assert_eq!(
        model.solve_time_interval(1000.0).unwrap(),
        StepEnd::Filled
    );
    assert_close(model.current_time().unwrap(), fill_time, 1e-6);

    assert!(matches!(
        model.solve_time_interval(0.0),
        Err(InfuseError::Config(_))
    ));
}

#[test]
fn pressure_change_applies_from_the_next_step() {
    let dir = tempdir().unwrap();
    let mut model = initialised_rectangle(dir.path(), 1e5, SolverOptions::default());
    model.solve_time_interval(1000.0).unwrap();
    model
        .change_inlet_pressure("inlet", 1e5, PressureMode::Delta)
        .unwrap();
    assert_eq!(model.fetch_inlet("inlet").unwrap().pressure(), 2e5);
    model.solve().unwrap();

    // the remaining fill runs twice as fast
    let full_rate = analytic_fill_time(LENGTH, 1e5);
    assert_close(
        model.current_time().unwrap(),
        1000.0 + (full_rate - 1000.0) / 2.0,
        0.01,
    );

    model.initialise_new_solution().unwrap();
    assert_eq!(model.fetch_inlet("inlet").unwrap().pressure(), 1e5);
}

#[test]
fn closing_every_inlet_stalls_without_changing_state() {
    let dir = tempdir().unwrap();
    let mut model = initialised_rectangle(dir.path(), 1e5, SolverOptions::default());
    model.solve_time_interval(1000.0).unwrap();
    let fill_before = model.fill_factor().unwrap().to_vec();
    let empty_before = model.n_empty_cvs().unwrap();

    model.close_inlet("inlet").unwrap();
    assert!(!model.fetch_inlet("inlet").unwrap().is_open());
    match model.solve_time_interval(1000.0) {
        Err(InfuseError::Stalled { time, empty_cvs }) => {
            assert_eq!(time, 1000.0);
            assert_eq!(empty_cvs, empty_before);
        }
        other => panic!("expected a stall, got {other:?}"),
    }
    assert_eq!(model.current_time().unwrap(), 1000.0);
    assert_eq!(model.fill_factor().unwrap(), &fill_before[..]);

    model.open_inlet("inlet").unwrap();
    assert_eq!(
        model.solve_time_interval(1e6).unwrap(),
        StepEnd::Filled
    );
}

#[test]
fn sensor_trigger_ends_the_interval() {
    let dir = tempdir().unwrap();
    let mut model = rectangle_model(dir.path(), 1e5);
    model
        .assign_simulation_parameter("end_step_when_sensor_triggered", true)
        .unwrap();
    let inlet_sensor = model.create_sensor(0.0, 0.1, 0.0);
    let mid_sensor = model.create_sensor(0.5, 0.1, 0.0);
    model.initialise_solver(SolverOptions::default()).unwrap();

    // the sensor on the inlet is already wet and does not end the interval
    assert_eq!(model.sensor_trigger_states(), vec![true, false]);
    assert_eq!(
        model.solve_time_interval(1e6).unwrap(),
        StepEnd::SensorTriggered
    );
    let t = model.current_time().unwrap();
    assert!(t > analytic_fill_time(0.45, 1e5) && t < analytic_fill_time(0.55, 1e5));
    assert_eq!(model.sensor_trigger_states(), vec![true, true]);

    let mid = model.sensor(mid_sensor).unwrap();
    assert_eq!(mid.latest_time(), Some(t));
    assert!(mid.latest_fill_factor().unwrap() >= 0.5);
    assert_eq!(
        model.sensor(inlet_sensor).unwrap().latest_fill_factor(),
        Some(1.0)
    );

    assert_eq!(
        model.solve_time_interval(1e6).unwrap(),
        StepEnd::Filled
    );
    model.print_sensor_readings();

    model.initialise_new_solution().unwrap();
    assert_eq!(model.sensor(mid_sensor).unwrap().time, vec![0.0]);
}

#[test]
fn reduced_and_full_systems_agree() {
    let dir = tempdir().unwrap();
    let mut masked = initialised_rectangle(dir.path(), 1e5, SolverOptions::default());
    let mut full = initialised_rectangle(
        dir.path(),
        1e5,
        SolverOptions {
            masked: false,
            ..SolverOptions::default()
        },
    );
    masked.solve().unwrap();
    full.solve().unwrap();

    assert_close(
        full.current_time().unwrap(),
        masked.current_time().unwrap(),
        1e-9,
    );
    let a = masked.latest_solution().unwrap();
    let b = full.latest_solution().unwrap();
    assert_eq!(a.len(), b.len());
    for (sa, sb) in a.steps.iter().zip(&b.steps) {
        for (pa, pb) in sa.pressure.iter().zip(&sb.pressure) {
            assert!((pa - pb).abs() <= 1e-6 * 1e5);
        }
    }
}

#[test]
fn backends_agree_on_fill_time() {
    let dir = tempdir().unwrap();
    let mut direct = initialised_rectangle(dir.path(), 1e5, SolverOptions::default());
    direct.solve().unwrap();
    let expected = direct.current_time().unwrap();

    let backends = [
        (SolverType::DirectDense, KrylovMethod::ConjugateGradient, PreconditionerKind::None),
        (SolverType::Iterative, KrylovMethod::ConjugateGradient, PreconditionerKind::Jacobi),
        (SolverType::Iterative, KrylovMethod::ConjugateGradient, PreconditionerKind::None),
        (SolverType::Iterative, KrylovMethod::Gmres, PreconditionerKind::Ilu0),
        (SolverType::Iterative, KrylovMethod::BiCgStab, PreconditionerKind::Jacobi),
    ];
    for (solver_type, method, preconditioner) in backends {
        let options = SolverOptions {
            solver_type,
            method,
            preconditioner,
            tol: 1e-10,
            ..SolverOptions::default()
        };
        let mut model = initialised_rectangle(dir.path(), 1e5, options);
        model.solve().unwrap();
        assert_close(model.current_time().unwrap(), expected, 1e-4);
    }
}

#[test]
fn lightweight_models_pack_on_request() {
    let dir = tempdir().unwrap();
    let mut model = initialised_rectangle(dir.path(), 1e5, SolverOptions::default());
    model.set_lightweight(true);
    assert!(model.is_lightweight());
    model.solve().unwrap();
    assert!(model.latest_solution().is_none());

    let solution = model.pack_solution().unwrap();
    assert_eq!(solution.steps[0].time, 0.0);
    assert!(solution.len() > NX / 2);
}

#[test]
fn solving_requires_an_initialised_solver() {
    let dir = tempdir().unwrap();
    let mut model = rectangle_model(dir.path(), 1e5);
    assert!(matches!(model.solve(), Err(InfuseError::State(_))));
    assert!(matches!(model.current_time(), Err(InfuseError::State(_))));

    let mut empty = infuse::Model::new();
    assert!(matches!(
        empty.initialise_solver(SolverOptions::default()),
        Err(InfuseError::State(_))
    ));
}

#[test]
fn unknown_tags_are_rejected() {
    let dir = tempdir().unwrap();
    let mut model = rectangle_model(dir.path(), 1e5);
    assert!(matches!(
        model.assign_material("glass", "flange", None),
        Err(InfuseError::Config(_))
    ));
    let inlet = model.create_inlet(1e5, None).unwrap();
    assert!(matches!(
        model.assign_inlet(inlet, "top_edge"),
        Err(InfuseError::Config(_))
    ));
    assert!(matches!(
        model.fetch_inlet("outlet"),
        Err(InfuseError::Lookup(_))
    ));
}

#[test]
fn invalid_parameters_are_rejected_and_leave_the_run_intact() {
    let dir = tempdir().unwrap();
    let mut model = initialised_rectangle(dir.path(), 1e5, SolverOptions::default());
    assert!(matches!(
        model.assign_simulation_parameter("fill_tolerance", 5.0),
        Err(InfuseError::Config(_))
    ));
    assert!(matches!(
        model.assign_simulation_parameter("mu", -1.0),
        Err(InfuseError::Config(_))
    ));
    assert_eq!(model.simulation_parameters().fill_tolerance, 0.0);
    assert_eq!(model.simulation_parameters().mu, MU);

    model.solve().unwrap();
    assert_close(
        model.current_time().unwrap(),
        analytic_fill_time(LENGTH, 1e5),
        0.01,
    );
}

#[test]
fn write_out_interval_change_takes_effect_mid_run() {
    let dir = tempdir().unwrap();
    let mut model = initialised_rectangle(dir.path(), 1e5, SolverOptions::default());
    model.solve_time_interval(1000.0).unwrap();
    model
        .assign_simulation_parameter("wo_delta_time", 300.0)
        .unwrap();
    model.solve().unwrap();

    let times = model.latest_solution().unwrap().time();
    for k in 1..=4 {
        let t = 1000.0 + 300.0 * k as f64;
        assert!(times.contains(&t), "no write-out at {t} in {times:?}");
    }
}

#[test]
fn enabling_sensor_stops_ignores_earlier_arrivals() {
    let dir = tempdir().unwrap();
    let mut model = rectangle_model(dir.path(), 1e5);
    model.create_sensor(0.5, 0.1, 0.0);
    model.initialise_solver(SolverOptions::default()).unwrap();

    // resin passes the sensor near 625 s while stops are disabled
    assert_eq!(
        model.solve_time_interval(1000.0).unwrap(),
        StepEnd::IntervalElapsed
    );
    assert_eq!(model.sensor_trigger_states(), vec![true]);

    model
        .assign_simulation_parameter("end_step_when_sensor_triggered", true)
        .unwrap();
    assert_eq!(
        model.solve_time_interval(500.0).unwrap(),
        StepEnd::IntervalElapsed
    );
    assert_eq!(model.current_time().unwrap(), 1500.0);
}
