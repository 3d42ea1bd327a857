use crate::admittance::{make_bdc, make_ybus};
use crate::config::BackendConfig;
use crate::dc::dc_pf;
use crate::grid::GridState;
use crate::newton::newtonpf;
use crate::soln::{apply_ac, apply_dc};
use clap::ValueEnum;
use num_complex::Complex64;
use std::time::{Duration, Instant};

/// Power flow formulation.
#[derive(Debug, PartialEq, Eq, Copy, Clone, ValueEnum)]
pub enum SolveMode {
    /// Full AC power flow.
    Ac,
    /// Linearized DC power flow that assumes lossless branches,
    /// 1 pu voltages and small voltage angle differences.
    Dc,
}

/// Per-call solve options, resolved from [`BackendConfig`] by the backend.
#[derive(Debug, Clone)]
pub struct SolveOpt {
    /// Termination tolerance on per unit P & Q mismatch.
    pub tolerance: f64,
    /// Iteration cap for the Newton loop.
    pub max_iterations: usize,
    /// Fail outright when an in-service bus is unreachable from the slack.
    /// When false, unreachable buses silently solve to NaN and the caller
    /// is expected to notice.
    pub check_connectivity: bool,
    /// Demote solver progress chatter to trace level. Used by the warm-up
    /// solves, where non-convergence is an expected transient.
    pub quiet: bool,
    /// Whether an accelerated factorization backend is available.
    /// Advisory only: dense LU is the sole factorization compiled in, so
    /// the solvers merely report the fallback instead of switching path.
    pub acceleration_available: bool,
}

impl SolveOpt {
    pub fn from_config(cfg: &BackendConfig) -> Self {
        Self {
            tolerance: cfg.tolerance,
            max_iterations: cfg.max_iterations,
            check_connectivity: false,
            quiet: false,
            acceleration_available: cfg.acceleration_available,
        }
    }
}

/// Timing and iteration metadata for a convergent solve.
#[derive(Debug, Clone, Copy)]
pub struct SolveReport {
    pub iterations: usize,
    pub elapsed: Duration,
}

/// Explicit solve result. Divergence is data, not an error type: every
/// power-system failure mode collapses into `Diverged` with a reason, and
/// the backend turns that into its own contract.
#[derive(Debug, Clone)]
pub enum SolveOutcome {
    Converged(SolveReport),
    Diverged(String),
}

/// The capability the backend needs from a solver: run against the grid
/// state, populate the result tables and convergence flags, report the
/// outcome. Implementations must leave NaN markers wherever they diverge.
pub trait PowerFlowSolver {
    fn solve(&self, grid: &mut GridState, opt: &SolveOpt) -> SolveOutcome;
}

/// Plain power flow: Newton-Raphson in AC mode, a linear angle solve in
/// DC mode. Never runs an optimal power flow stage, so `opf_converged`
/// stays false.
#[derive(Debug, Clone)]
pub struct StandardSolver {
    pub mode: SolveMode,
}

impl StandardSolver {
    pub fn new(mode: SolveMode) -> Self {
        Self { mode }
    }
}

impl PowerFlowSolver for StandardSolver {
    fn solve(&self, grid: &mut GridState, opt: &SolveOpt) -> SolveOutcome {
        match self.mode {
            SolveMode::Dc => run_dc(grid, opt),
            SolveMode::Ac => run_ac(grid, opt),
        }
    }
}

/// AC power flow followed by a dispatch-feasibility stage standing in for
/// the external optimal power flow engine: the slack pickup is folded back
/// into the headroom of the remaining units, and a residual imbalance is
/// an OPF non-convergence.
#[derive(Debug, Clone)]
pub struct OptimalPowerFlowSolver {
    inner: StandardSolver,
}

impl OptimalPowerFlowSolver {
    pub fn new() -> Self {
        Self {
            inner: StandardSolver::new(SolveMode::Ac),
        }
    }
}

impl Default for OptimalPowerFlowSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerFlowSolver for OptimalPowerFlowSolver {
    fn solve(&self, grid: &mut GridState, opt: &SolveOpt) -> SolveOutcome {
        let outcome = self.inner.solve(grid, opt);
        let SolveOutcome::Converged(report) = outcome else {
            return outcome;
        };
        match opf_stage(grid) {
            Ok(()) => {
                grid.opf_converged = true;
                SolveOutcome::Converged(report)
            }
            Err(reason) => {
                grid.opf_converged = false;
                grid.nan_results();
                SolveOutcome::Diverged(format!(
                    "optimal power flow stage did not converge: {reason}"
                ))
            }
        }
    }
}

/// Buses that take part in the solve, with their reduced-space positions.
struct ActiveSet {
    act: Vec<usize>,
    /// bus index -> reduced position, `usize::MAX` when de-energized
    pos: Vec<usize>,
    slack_gen: usize,
    slack_bus: usize,
}

fn active_set(grid: &GridState, opt: &SolveOpt) -> Result<ActiveSet, String> {
    if grid.bus.is_empty() {
        log::error!("power flow not valid: case contains no buses");
        return Err("case contains no buses".to_string());
    }
    let slack_gen = grid
        .slack_gen()
        .ok_or_else(|| "no in-service slack generator".to_string())?;
    let slack_bus = grid.gen[slack_gen].bus;
    if !grid.bus[slack_bus].in_service {
        return Err(format!(
            "slack generator {slack_gen} sits on out-of-service bus {slack_bus}"
        ));
    }
    let energized = grid.energized_buses(slack_bus);
    if opt.check_connectivity {
        let isolated: Vec<usize> = (0..grid.bus.len())
            .filter(|&b| grid.bus[b].in_service && !energized[b])
            .collect();
        if !isolated.is_empty() {
            return Err(format!(
                "grid is not fully connected, isolated buses {isolated:?}"
            ));
        }
    }
    let act: Vec<usize> = (0..grid.bus.len())
        .filter(|&b| grid.bus[b].in_service && energized[b])
        .collect();
    let mut pos = vec![usize::MAX; grid.bus.len()];
    for (k, &b) in act.iter().enumerate() {
        pos[b] = k;
    }
    Ok(ActiveSet {
        act,
        pos,
        slack_gen,
        slack_bus,
    })
}

/// Net complex bus injections (generation minus demand) per unit, in the
/// reduced bus space. Generator reactive power is left out: generator
/// buses hold their magnitude setpoint instead.
fn make_sbus(grid: &GridState, pos: &[usize], n_act: usize) -> Vec<Complex64> {
    let mut s_bus = vec![Complex64::new(0.0, 0.0); n_act];
    for g in grid.gen.iter().filter(|g| g.in_service) {
        if pos[g.bus] != usize::MAX {
            s_bus[pos[g.bus]] += Complex64::new(g.p_mw, 0.0);
        }
    }
    for l in grid.load.iter().filter(|l| l.in_service) {
        if pos[l.bus] != usize::MAX {
            s_bus[pos[l.bus]] -= Complex64::new(l.p_mw, l.q_mvar);
        }
    }
    for s in grid.storage.iter().filter(|s| s.in_service) {
        if pos[s.bus] != usize::MAX {
            s_bus[pos[s.bus]] -= Complex64::new(s.p_mw, s.q_mvar);
        }
    }
    for s in s_bus.iter_mut() {
        *s /= grid.base_mva;
    }
    s_bus
}

fn run_ac(grid: &mut GridState, opt: &SolveOpt) -> SolveOutcome {
    let t0 = Instant::now();
    grid.converged = false;
    grid.opf_converged = false;
    grid.nan_results();

    let aset = match active_set(grid, opt) {
        Ok(a) => a,
        Err(reason) => return SolveOutcome::Diverged(reason),
    };
    if opt.quiet {
        log::trace!("AC power flow, {} active buses", aset.act.len());
    } else {
        log::info!("AC power flow, {} active buses", aset.act.len());
    }
    if !opt.acceleration_available {
        log::trace!("accelerated factorization unavailable, using dense LU");
    }

    let (y_bus, lines) = make_ybus(grid, &aset.act, &aset.pos);
    let s_bus = make_sbus(grid, &aset.pos, aset.act.len());

    // flat start, generator buses pinned to their setpoint
    let mut v0 = vec![Complex64::new(1.0, 0.0); aset.act.len()];
    for g in grid.gen.iter().filter(|g| g.in_service) {
        if aset.pos[g.bus] != usize::MAX {
            v0[aset.pos[g.bus]] = Complex64::new(g.vm_pu, 0.0);
        }
    }

    let slack_pos = aset.pos[aset.slack_bus];
    let mut is_pv = vec![false; aset.act.len()];
    for g in grid.gen.iter().filter(|g| g.in_service) {
        let k = aset.pos[g.bus];
        if k != usize::MAX && k != slack_pos {
            is_pv[k] = true;
        }
    }
    let pv: Vec<usize> = (0..aset.act.len())
        .filter(|&k| is_pv[k] && k != slack_pos)
        .collect();
    let pq: Vec<usize> = (0..aset.act.len())
        .filter(|&k| !is_pv[k] && k != slack_pos)
        .collect();

    let sol = newtonpf(
        &y_bus,
        &s_bus,
        &v0,
        &pv,
        &pq,
        opt.tolerance,
        opt.max_iterations,
        opt.quiet,
    );
    if !sol.converged {
        return SolveOutcome::Diverged(format!(
            "Newton-Raphson did not converge in {} iterations",
            sol.iterations
        ));
    }

    apply_ac(
        grid,
        &aset.act,
        &aset.pos,
        &sol.v,
        &y_bus,
        &lines,
        aset.slack_gen,
    );
    grid.converged = true;
    SolveOutcome::Converged(SolveReport {
        iterations: sol.iterations,
        elapsed: t0.elapsed(),
    })
}

fn run_dc(grid: &mut GridState, opt: &SolveOpt) -> SolveOutcome {
    let t0 = Instant::now();
    grid.converged = false;
    grid.opf_converged = false;
    grid.nan_results();

    let aset = match active_set(grid, opt) {
        Ok(a) => a,
        Err(reason) => return SolveOutcome::Diverged(reason),
    };
    if opt.quiet {
        log::trace!("DC power flow, {} active buses", aset.act.len());
    } else {
        log::info!("DC power flow, {} active buses", aset.act.len());
    }

    let b_mat = make_bdc(grid, &aset.act, &aset.pos);
    let p_bus: Vec<f64> = make_sbus(grid, &aset.pos, aset.act.len())
        .iter()
        .map(|s| s.re)
        .collect();

    let slack_pos = aset.pos[aset.slack_bus];
    let va = match dc_pf(&b_mat, &p_bus, slack_pos) {
        Ok(va) => va,
        Err(reason) => return SolveOutcome::Diverged(reason),
    };

    apply_dc(
        grid,
        &aset.act,
        &aset.pos,
        &va,
        &b_mat,
        &p_bus,
        aset.slack_gen,
    );
    grid.converged = true;
    SolveOutcome::Converged(SolveReport {
        iterations: 1,
        elapsed: t0.elapsed(),
    })
}

/// Folds the slack active-power pickup back into generator limits. The
/// slack is clamped to its own band and the excess is pushed into the
/// headroom of the other in-service units, in index order. Whatever cannot
/// be absorbed is an OPF non-convergence.
fn opf_stage(grid: &mut GridState) -> Result<(), String> {
    let slack_gen = grid
        .slack_gen()
        .ok_or_else(|| "no in-service slack generator".to_string())?;
    let (lo, hi) = (grid.gen[slack_gen].min_p_mw, grid.gen[slack_gen].max_p_mw);
    let p = grid.res_gen[slack_gen].p_mw;
    let clamped = p.clamp(lo, hi);
    let mut excess = p - clamped;
    if excess == 0.0 {
        return Ok(());
    }
    grid.res_gen[slack_gen].p_mw = clamped;

    for i in 0..grid.gen.len() {
        if excess == 0.0 {
            break;
        }
        if i == slack_gen || !grid.gen[i].in_service || grid.res_gen[i].p_mw.is_nan() {
            continue;
        }
        let room = if excess > 0.0 {
            grid.gen[i].max_p_mw - grid.res_gen[i].p_mw
        } else {
            grid.gen[i].min_p_mw - grid.res_gen[i].p_mw
        };
        // room has the sign of the excess it can absorb
        let take = if excess > 0.0 {
            excess.min(room.max(0.0))
        } else {
            excess.max(room.min(0.0))
        };
        grid.res_gen[i].p_mw += take;
        excess -= take;
    }
    if excess.abs() > 1e-6 {
        return Err(format!(
            "dispatch imbalance of {excess:.3} MW exceeds generator limits"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_bus_grid() -> GridState {
        let mut grid = GridState::new(100.0);
        let b0 = grid.add_bus(110.0);
        let b1 = grid.add_bus(110.0);
        let b2 = grid.add_bus(110.0);
        grid.add_slack_gen(b0, 0.0, 1.02);
        grid.add_gen(b1, 30.0, 1.01);
        grid.add_load(b2, 50.0, 15.0);
        grid.add_line(b0, b1, 0.01, 0.06);
        grid.add_line(b1, b2, 0.01, 0.06);
        grid.add_line(b0, b2, 0.01, 0.06);
        grid
    }

    #[test]
    fn standard_ac_solve_populates_results() {
        let mut grid = three_bus_grid();
        let opt = SolveOpt::from_config(&BackendConfig::default());
        let outcome = StandardSolver::new(SolveMode::Ac).solve(&mut grid, &opt);
        assert!(matches!(outcome, SolveOutcome::Converged(_)));
        assert!(grid.converged);
        assert!(!grid.opf_converged);
        assert!(grid.res_bus.iter().all(|r| r.vm_pu.is_finite()));
        // active power balances: generation covers load plus losses
        let gen: f64 = grid.res_gen.iter().map(|r| r.p_mw).sum();
        assert!(gen > 50.0 && gen < 52.0, "total generation {gen}");
    }

    #[test]
    fn dc_solve_leaves_magnitudes_undefined() {
        let mut grid = three_bus_grid();
        let mut opt = SolveOpt::from_config(&BackendConfig::default());
        opt.check_connectivity = true;
        let outcome = StandardSolver::new(SolveMode::Dc).solve(&mut grid, &opt);
        assert!(matches!(outcome, SolveOutcome::Converged(_)));
        assert!(grid.res_bus.iter().all(|r| r.vm_pu.is_nan()));
        assert!(grid.res_bus.iter().all(|r| r.va_degree.is_finite()));
        // lossless: slack picks up exactly the missing 20 MW
        let slack_p = grid.res_gen[0].p_mw;
        assert!((slack_p - 20.0).abs() < 1e-9, "slack {slack_p}");
    }

    #[test]
    fn dc_connectivity_check_reports_isolated_buses() {
        let mut grid = three_bus_grid();
        let b3 = grid.add_bus(110.0);
        grid.add_load(b3, 5.0, 0.0);
        let mut opt = SolveOpt::from_config(&BackendConfig::default());
        opt.check_connectivity = true;
        let outcome = StandardSolver::new(SolveMode::Dc).solve(&mut grid, &opt);
        let SolveOutcome::Diverged(reason) = outcome else {
            panic!("expected divergence");
        };
        assert!(reason.contains("[3]"), "{reason}");
    }

    #[test]
    fn opf_redistributes_slack_pickup() {
        let mut grid = three_bus_grid();
        // slack band too tight: most of the pickup must move to gen 1
        grid.gen[0].max_p_mw = 5.0;
        grid.gen[1].max_p_mw = 100.0;
        let opt = SolveOpt::from_config(&BackendConfig::default());
        let outcome = OptimalPowerFlowSolver::new().solve(&mut grid, &opt);
        assert!(matches!(outcome, SolveOutcome::Converged(_)));
        assert!(grid.opf_converged);
        assert!(grid.res_gen[0].p_mw <= 5.0 + 1e-9);
        assert!(grid.res_gen[1].p_mw > 30.0);
    }

    #[test]
    fn opf_failure_is_a_divergence_with_nan_results() {
        let mut grid = three_bus_grid();
        grid.gen[0].max_p_mw = 5.0;
        grid.gen[1].max_p_mw = 31.0; // not enough headroom
        let opt = SolveOpt::from_config(&BackendConfig::default());
        let outcome = OptimalPowerFlowSolver::new().solve(&mut grid, &opt);
        let SolveOutcome::Diverged(reason) = outcome else {
            panic!("expected divergence");
        };
        assert!(reason.contains("optimal power flow stage"), "{reason}");
        assert!(grid.converged);
        assert!(!grid.opf_converged);
        assert!(grid.res_gen.iter().all(|r| r.p_mw.is_nan()));
    }
}
