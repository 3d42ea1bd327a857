//! Shared case builder for the backend integration tests.

use gridsim_backend::{Backend, BackendConfig, GridState};

/// Five-bus meshed case used across the integration tests.
///
/// Equipment layout:
/// - bus 0: slack generator (gen 0)
/// - bus 1: generator 1
/// - bus 2: load 0
/// - bus 3: load 1 and generator 2 on the same bus
/// - bus 4: storage 0, connected through lines 5 and 6
///
/// The mesh survives losing any single line, so tests can disconnect one
/// without islanding the grid.
pub fn five_bus_case() -> GridState {
    let mut grid = GridState::new(100.0);
    let b0 = grid.add_bus(138.0);
    let b1 = grid.add_bus(138.0);
    let b2 = grid.add_bus(138.0);
    let b3 = grid.add_bus(138.0);
    let b4 = grid.add_bus(138.0);

    grid.add_slack_gen(b0, 0.0, 1.04);
    grid.add_gen(b1, 40.0, 1.02);
    grid.add_gen(b3, 30.0, 1.01);

    grid.add_load(b2, 30.0, 10.0);
    grid.add_load(b3, 40.0, 15.0);

    grid.add_storage(b4, 5.0, 1.0);

    grid.add_line(b0, b1, 0.010, 0.060); // line 0
    grid.add_line(b0, b2, 0.008, 0.050); // line 1
    grid.add_line(b1, b2, 0.010, 0.060); // line 2
    grid.add_line(b1, b3, 0.012, 0.070); // line 3
    grid.add_line(b2, b3, 0.010, 0.060); // line 4
    grid.add_line(b1, b4, 0.010, 0.080); // line 5
    grid.add_line(b3, b4, 0.010, 0.080); // line 6

    grid
}

pub fn five_bus_backend() -> Backend {
    Backend::from_grid(five_bus_case(), BackendConfig::default()).expect("valid case")
}

/// Snapshot of every float output array, for bit-identity comparisons.
pub fn snapshot(backend: &Backend) -> Vec<Vec<f64>> {
    vec![
        backend.prod_p.clone(),
        backend.prod_q.clone(),
        backend.prod_v.clone(),
        backend.gen_theta.clone(),
        backend.load_p.clone(),
        backend.load_q.clone(),
        backend.load_v.clone(),
        backend.load_theta.clone(),
        backend.p_or.clone(),
        backend.q_or.clone(),
        backend.v_or.clone(),
        backend.a_or.clone(),
        backend.theta_or.clone(),
        backend.p_ex.clone(),
        backend.q_ex.clone(),
        backend.v_ex.clone(),
        backend.a_ex.clone(),
        backend.theta_ex.clone(),
        backend.storage_p.clone(),
        backend.storage_q.clone(),
        backend.storage_v.clone(),
        backend.storage_theta.clone(),
    ]
}

pub fn all_nan(backend: &Backend) -> bool {
    snapshot(backend)
        .iter()
        .all(|arr| arr.iter().all(|v| v.is_nan()))
}
