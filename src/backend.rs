use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::grid::GridState;
use crate::solver::{
    OptimalPowerFlowSolver, PowerFlowSolver, SolveMode, SolveOpt, SolveOutcome, StandardSolver,
};
use itertools::Itertools;
use std::time::Duration;

/// Static maps from equipment positions to buses, built once at load time.
///
/// The topology vector is laid out `[loads | gens | line origins |
/// line extremities | storages]`; the `*_pos` fields are offsets into it
/// and the `*_to_subid` fields give each element's bus. The `pu_to_kv`
/// arrays convert per-unit voltage results to kV per equipment unit.
#[derive(Debug, Clone)]
pub struct Topology {
    pub load_to_subid: Vec<usize>,
    pub gen_to_subid: Vec<usize>,
    pub line_or_to_subid: Vec<usize>,
    pub line_ex_to_subid: Vec<usize>,
    pub storage_to_subid: Vec<usize>,

    pub load_pos: Vec<usize>,
    pub gen_pos: Vec<usize>,
    pub line_or_pos: Vec<usize>,
    pub line_ex_pos: Vec<usize>,
    pub storage_pos: Vec<usize>,

    pub load_pu_to_kv: Vec<f64>,
    pub gen_pu_to_kv: Vec<f64>,
    pub lines_or_pu_to_kv: Vec<f64>,
    pub lines_ex_pu_to_kv: Vec<f64>,
    pub storage_pu_to_kv: Vec<f64>,

    /// Total number of connection points.
    pub dim: usize,
}

impl Topology {
    fn build(grid: &GridState) -> Self {
        let kv = |b: usize| grid.bus[b].vn_kv;
        let (nl, ng, nln, ns) = (
            grid.load.len(),
            grid.gen.len(),
            grid.line.len(),
            grid.storage.len(),
        );
        Self {
            load_to_subid: grid.load.iter().map(|l| l.bus).collect(),
            gen_to_subid: grid.gen.iter().map(|g| g.bus).collect(),
            line_or_to_subid: grid.line.iter().map(|l| l.from_bus).collect(),
            line_ex_to_subid: grid.line.iter().map(|l| l.to_bus).collect(),
            storage_to_subid: grid.storage.iter().map(|s| s.bus).collect(),

            load_pos: (0..nl).collect(),
            gen_pos: (nl..nl + ng).collect(),
            line_or_pos: (nl + ng..nl + ng + nln).collect(),
            line_ex_pos: (nl + ng + nln..nl + ng + 2 * nln).collect(),
            storage_pos: (nl + ng + 2 * nln..nl + ng + 2 * nln + ns).collect(),

            load_pu_to_kv: grid.load.iter().map(|l| kv(l.bus)).collect(),
            gen_pu_to_kv: grid.gen.iter().map(|g| kv(g.bus)).collect(),
            lines_or_pu_to_kv: grid.line.iter().map(|l| kv(l.from_bus)).collect(),
            lines_ex_pu_to_kv: grid.line.iter().map(|l| kv(l.to_bus)).collect(),
            storage_pu_to_kv: grid.storage.iter().map(|s| kv(s.bus)).collect(),

            dim: nl + ng + 2 * nln + ns,
        }
    }
}

/// The backend adapter. Owns the grid state and the fixed-size output
/// arrays the simulation reads after each step; index `i` of each array
/// refers to the same equipment unit across calls. Arrays are overwritten
/// in place on every solve and wiped to NaN on divergence, so callers must
/// never assume values survive past the next call.
///
/// Single-threaded and non-reentrant by contract: one `runpf` call runs to
/// completion before the arrays are valid.
pub struct Backend {
    grid: GridState,
    topo: Topology,
    cfg: BackendConfig,
    dc_solver: Box<dyn PowerFlowSolver>,
    ac_solver: Box<dyn PowerFlowSolver>,

    pub prod_p: Vec<f64>,
    pub prod_q: Vec<f64>,
    pub prod_v: Vec<f64>,
    pub gen_theta: Vec<f64>,

    pub load_p: Vec<f64>,
    pub load_q: Vec<f64>,
    pub load_v: Vec<f64>,
    pub load_theta: Vec<f64>,

    pub p_or: Vec<f64>,
    pub q_or: Vec<f64>,
    pub v_or: Vec<f64>,
    pub a_or: Vec<f64>,
    pub theta_or: Vec<f64>,
    pub p_ex: Vec<f64>,
    pub q_ex: Vec<f64>,
    pub v_ex: Vec<f64>,
    pub a_ex: Vec<f64>,
    pub theta_ex: Vec<f64>,
    pub line_status: Vec<bool>,

    pub storage_p: Vec<f64>,
    pub storage_q: Vec<f64>,
    pub storage_v: Vec<f64>,
    pub storage_theta: Vec<f64>,

    /// Electrical assignment of every connection point: `1` connected,
    /// `-1` disconnected. Recomputed after every successful solve.
    pub topo_vect: Vec<i32>,

    comp_time: Duration,
    divergence: Option<BackendError>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

impl Backend {
    /// Builds the backend around a grid and performs the warm-up solve,
    /// using the default solver pair: a [`StandardSolver`] for DC and an
    /// [`OptimalPowerFlowSolver`] for AC.
    pub fn from_grid(grid: GridState, cfg: BackendConfig) -> Result<Self, BackendError> {
        Self::from_grid_with_solvers(
            grid,
            cfg,
            Box::new(StandardSolver::new(SolveMode::Dc)),
            Box::new(OptimalPowerFlowSolver::new()),
        )
    }

    /// Same as [`Backend::from_grid`] with caller-provided solvers.
    pub fn from_grid_with_solvers(
        grid: GridState,
        cfg: BackendConfig,
        dc_solver: Box<dyn PowerFlowSolver>,
        ac_solver: Box<dyn PowerFlowSolver>,
    ) -> Result<Self, BackendError> {
        grid.validate().map_err(BackendError::InvalidGrid)?;
        let topo = Topology::build(&grid);
        let (nl, ng, nln, ns) = (
            grid.load.len(),
            grid.gen.len(),
            grid.line.len(),
            grid.storage.len(),
        );
        let dim = topo.dim;
        let mut backend = Self {
            grid,
            topo,
            cfg,
            dc_solver,
            ac_solver,
            prod_p: vec![f64::NAN; ng],
            prod_q: vec![f64::NAN; ng],
            prod_v: vec![f64::NAN; ng],
            gen_theta: vec![f64::NAN; ng],
            load_p: vec![f64::NAN; nl],
            load_q: vec![f64::NAN; nl],
            load_v: vec![f64::NAN; nl],
            load_theta: vec![f64::NAN; nl],
            p_or: vec![f64::NAN; nln],
            q_or: vec![f64::NAN; nln],
            v_or: vec![f64::NAN; nln],
            a_or: vec![f64::NAN; nln],
            theta_or: vec![f64::NAN; nln],
            p_ex: vec![f64::NAN; nln],
            q_ex: vec![f64::NAN; nln],
            v_ex: vec![f64::NAN; nln],
            a_ex: vec![f64::NAN; nln],
            theta_ex: vec![f64::NAN; nln],
            line_status: vec![false; nln],
            storage_p: vec![f64::NAN; ns],
            storage_q: vec![f64::NAN; ns],
            storage_v: vec![f64::NAN; ns],
            storage_theta: vec![f64::NAN; ns],
            topo_vect: vec![-1; dim],
            comp_time: Duration::ZERO,
            divergence: None,
        };
        backend.run_pf_init();
        backend.topo_vect = backend.compute_topo_vect();
        Ok(backend)
    }

    pub fn grid(&self) -> &GridState {
        &self.grid
    }

    pub fn grid_mut(&mut self) -> &mut GridState {
        &mut self.grid
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// Accumulated solver time over the backend's lifetime.
    pub fn comp_time(&self) -> Duration {
        self.comp_time
    }

    /// The divergence recorded by the last failed call, for diagnostics.
    /// Replaced on every solve attempt.
    pub fn divergence(&self) -> Option<&BackendError> {
        self.divergence.as_ref()
    }

    /// Warm-up solve run while the grid is being loaded. Tries AC first;
    /// a diverged attempt, or a converged power flow whose OPF stage did
    /// not converge, falls back to DC. Solver chatter is demoted to trace
    /// level here since non-convergence is an expected transient.
    pub fn run_pf_init(&mut self) {
        if self.invoke_solver(false, true).is_err()
            || (self.grid.converged && !self.grid.opf_converged)
        {
            let _ = self.invoke_solver(true, true);
        }
    }

    /// Runs a power flow and refreshes every output array.
    ///
    /// Divergence is resolved locally: the arrays are wiped to NaN, the
    /// reason is recorded, and `(false, Some(err))` is returned. It is
    /// never propagated as a panic or a `Result` past this method.
    pub fn runpf(&mut self, is_dc: bool) -> (bool, Option<BackendError>) {
        match self.run_pf_inner(is_dc) {
            Ok(()) => {
                self.divergence = None;
                (true, None)
            }
            Err(reason) => {
                self.reset_all_nan();
                let err = BackendError::Diverged(reason);
                self.divergence = Some(err.clone());
                (false, Some(err))
            }
        }
    }

    fn run_pf_inner(&mut self, is_dc: bool) -> Result<(), String> {
        self.invoke_solver(is_dc, false)?;

        // a connected bus without a voltage angle means the grid was not
        // fully connected even though the solver did not flag it
        let buses_ko = self.grid.isolated_buses();
        if !buses_ko.is_empty() {
            return Err(format!("Isolated bus, check buses {buses_ko:?}"));
        }

        self.extract_gens();
        self.extract_loads();

        if !is_dc {
            let loads_ko = self
                .load_v
                .iter()
                .positions(|v| !v.is_finite())
                .collect_vec();
            if !loads_ko.is_empty() {
                // an isolated load is a terminal condition for the caller
                return Err(format!("Isolated load: check loads {loads_ko:?}"));
            }
        } else {
            // voltage magnitudes are undefined in DC; substitute the
            // nominal conversion constant, then borrow the generator
            // voltage wherever one shares the load's electrical node
            for l_id in 0..self.load_v.len() {
                self.load_v[l_id] = self.topo.load_pu_to_kv[l_id];
            }
            for l_id in 0..self.load_v.len() {
                for g_id in 0..self.prod_v.len() {
                    if self.topo.gen_to_subid[g_id] == self.topo.load_to_subid[l_id]
                        && self.topo_vect[self.topo.load_pos[l_id]]
                            == self.topo_vect[self.topo.gen_pos[g_id]]
                    {
                        self.load_v[l_id] = self.prod_v[g_id];
                        break; // first match wins
                    }
                }
            }
        }

        let status = self.compute_line_status();
        self.line_status.copy_from_slice(&status);
        self.extract_lines();

        self.handle_storages()?;

        self.topo_vect = self.compute_topo_vect();

        if !self.grid.converged && !self.grid.opf_converged {
            return Err(
                "Divergence without specific reason (neither the power flow nor the OPF stage converged)"
                    .to_string(),
            );
        }
        Ok(())
    }

    /// Runs the solver variant for the requested mode after rejecting grid
    /// states the adapter cannot represent, and screens the generator
    /// results for silent divergence.
    fn invoke_solver(&mut self, is_dc: bool, quiet: bool) -> Result<(), String> {
        let loads_ko = self
            .grid
            .load
            .iter()
            .positions(|l| !l.in_service)
            .collect_vec();
        if !loads_ko.is_empty() {
            return Err(format!(
                "Disconnected load: a disconnected load must be modelled as zero \
                 consumption instead. Check loads: {loads_ko:?}"
            ));
        }
        let gens_ko = self
            .grid
            .gen
            .iter()
            .positions(|g| !g.in_service)
            .collect_vec();
        if !gens_ko.is_empty() {
            return Err(format!(
                "Disconnected gen: a disconnected generator must be modelled as zero \
                 production instead. Check generators: {gens_ko:?}"
            ));
        }

        let mut opt = SolveOpt::from_config(&self.cfg);
        opt.check_connectivity = is_dc;
        opt.quiet = quiet;

        let solver = if is_dc {
            &self.dc_solver
        } else {
            &self.ac_solver
        };
        match solver.solve(&mut self.grid, &opt) {
            SolveOutcome::Converged(report) => {
                self.comp_time += report.elapsed;
            }
            SolveOutcome::Diverged(reason) => return Err(reason),
        }

        // the solver sometimes fails to detect divergence on a
        // disconnected network and leaves NaN instead
        let nan_gen = self
            .grid
            .res_gen
            .iter()
            .any(|r| r.p_mw.is_nan() || r.q_mvar.is_nan() || r.va_degree.is_nan());
        if nan_gen {
            return Err(
                "Divergence due to NaN values in the generator results (most likely a non \
                 connected grid)"
                    .to_string(),
            );
        }
        Ok(())
    }

    fn extract_gens(&mut self) {
        for i in 0..self.grid.gen.len() {
            let r = self.grid.res_gen[i];
            self.prod_p[i] = r.p_mw;
            self.prod_q[i] = r.q_mvar;
            self.prod_v[i] = r.vm_pu * self.topo.gen_pu_to_kv[i];
            self.gen_theta[i] = r.va_degree;
        }
    }

    fn extract_loads(&mut self) {
        for i in 0..self.grid.load.len() {
            let r = self.grid.res_load[i];
            let bus = self.grid.res_bus[self.topo.load_to_subid[i]];
            self.load_p[i] = r.p_mw;
            self.load_q[i] = r.q_mvar;
            self.load_v[i] = bus.vm_pu * self.topo.load_pu_to_kv[i];
            self.load_theta[i] = bus.va_degree;
        }
    }

    fn extract_lines(&mut self) {
        let n = self.grid.line.len();
        for i in 0..n {
            let r = self.grid.res_line[i];
            self.p_or[i] = r.p_from_mw;
            self.q_or[i] = r.q_from_mvar;
            self.v_or[i] = r.vm_from_pu;
            self.a_or[i] = r.i_from_ka * 1000.0;
            self.theta_or[i] = r.va_from_degree;
            self.p_ex[i] = r.p_to_mw;
            self.q_ex[i] = r.q_to_mvar;
            self.v_ex[i] = r.vm_to_pu;
            self.a_ex[i] = r.i_to_ka * 1000.0;
            self.theta_ex[i] = r.va_to_degree;
        }
        for i in 0..n {
            if !self.a_or[i].is_finite() {
                self.a_or[i] = 0.0;
            }
            if !self.v_or[i].is_finite() {
                self.v_or[i] = 0.0;
            }
            if !self.a_ex[i].is_finite() {
                self.a_ex[i] = 0.0;
            }
            if !self.v_ex[i].is_finite() {
                self.v_ex[i] = 0.0;
            }
        }
        // disconnected lines do not hold a voltage
        for i in 0..n {
            if !self.line_status[i] {
                self.v_or[i] = 0.0;
                self.v_ex[i] = 0.0;
            }
        }
        for i in 0..n {
            self.v_or[i] *= self.topo.lines_or_pu_to_kv[i];
            self.v_ex[i] *= self.topo.lines_ex_pu_to_kv[i];
        }
        for i in 0..n {
            if !self.theta_or[i].is_finite() {
                self.theta_or[i] = 0.0;
            }
            if !self.theta_ex[i].is_finite() {
                self.theta_ex[i] = 0.0;
            }
        }
    }

    /// Storage units must be looked after by hand: the solver leaves an
    /// isolated one with an undefined voltage, and whether that is fatal
    /// depends on the power it was scheduled for.
    fn handle_storages(&mut self) -> Result<(), String> {
        for i in 0..self.grid.storage.len() {
            let r = self.grid.res_storage[i];
            let bus = self.grid.res_bus[self.topo.storage_to_subid[i]];
            self.storage_p[i] = r.p_mw;
            self.storage_q[i] = r.q_mvar;
            self.storage_v[i] = bus.vm_pu * self.topo.storage_pu_to_kv[i];
            self.storage_theta[i] = bus.va_degree;
        }
        let deact = (0..self.grid.storage.len())
            .filter(|&i| !self.storage_v[i].is_finite())
            .collect_vec();
        if deact
            .iter()
            .any(|&i| self.storage_p[i].abs() > self.cfg.storage_tol_mw)
        {
            return Err("Isolated storage set to absorb / produce something".to_string());
        }
        for &i in &deact {
            self.storage_p[i] = 0.0;
            self.storage_q[i] = 0.0;
            self.storage_v[i] = 0.0;
            self.grid.storage[i].in_service = false;
        }
        Ok(())
    }

    /// A line carries flow only when it is in service and both of its
    /// buses are.
    fn compute_line_status(&self) -> Vec<bool> {
        self.grid
            .line
            .iter()
            .map(|l| {
                l.in_service
                    && self.grid.bus[l.from_bus].in_service
                    && self.grid.bus[l.to_bus].in_service
            })
            .collect()
    }

    fn compute_topo_vect(&self) -> Vec<i32> {
        let mut tv = vec![-1; self.topo.dim];
        for (i, l) in self.grid.load.iter().enumerate() {
            tv[self.topo.load_pos[i]] = if l.in_service { 1 } else { -1 };
        }
        for (i, g) in self.grid.gen.iter().enumerate() {
            tv[self.topo.gen_pos[i]] = if g.in_service { 1 } else { -1 };
        }
        let status = self.compute_line_status();
        for (i, &on) in status.iter().enumerate() {
            tv[self.topo.line_or_pos[i]] = if on { 1 } else { -1 };
            tv[self.topo.line_ex_pos[i]] = if on { 1 } else { -1 };
        }
        for (i, s) in self.grid.storage.iter().enumerate() {
            tv[self.topo.storage_pos[i]] = if s.in_service { 1 } else { -1 };
        }
        tv
    }

    /// Wipes every output array so no stale or partial value survives a
    /// divergence.
    fn reset_all_nan(&mut self) {
        for arr in [
            &mut self.prod_p,
            &mut self.prod_q,
            &mut self.prod_v,
            &mut self.gen_theta,
            &mut self.load_p,
            &mut self.load_q,
            &mut self.load_v,
            &mut self.load_theta,
            &mut self.p_or,
            &mut self.q_or,
            &mut self.v_or,
            &mut self.a_or,
            &mut self.theta_or,
            &mut self.p_ex,
            &mut self.q_ex,
            &mut self.v_ex,
            &mut self.a_ex,
            &mut self.theta_ex,
            &mut self.storage_p,
            &mut self.storage_q,
            &mut self.storage_v,
            &mut self.storage_theta,
        ] {
            arr.fill(f64::NAN);
        }
        self.line_status.fill(false);
        self.topo_vect.fill(-1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_grid() -> GridState {
        let mut grid = GridState::new(100.0);
        let b0 = grid.add_bus(110.0);
        let b1 = grid.add_bus(110.0);
        grid.add_slack_gen(b0, 0.0, 1.02);
        grid.add_load(b1, 20.0, 5.0);
        grid.add_line(b0, b1, 0.01, 0.06);
        grid.add_storage(b1, 1.0, 0.0);
        grid
    }

    #[test]
    fn topology_layout_is_contiguous() {
        let grid = small_grid();
        let topo = Topology::build(&grid);
        assert_eq!(topo.dim, 1 + 1 + 2 + 1);
        assert_eq!(topo.load_pos, vec![0]);
        assert_eq!(topo.gen_pos, vec![1]);
        assert_eq!(topo.line_or_pos, vec![2]);
        assert_eq!(topo.line_ex_pos, vec![3]);
        assert_eq!(topo.storage_pos, vec![4]);
        assert_eq!(topo.load_pu_to_kv, vec![110.0]);
    }

    #[test]
    fn load_time_warmup_populates_topo_vect() {
        let backend = Backend::from_grid(small_grid(), BackendConfig::default()).unwrap();
        assert_eq!(backend.topo_vect, vec![1; 5]);
    }

    #[test]
    fn malformed_grid_is_rejected_at_load() {
        let mut grid = small_grid();
        grid.add_gen(9, 1.0, 1.0);
        let err = Backend::from_grid(grid, BackendConfig::default()).unwrap_err();
        assert!(matches!(err, BackendError::InvalidGrid(_)));
    }

    #[test]
    fn comp_time_accumulates_across_calls() {
        let mut backend = Backend::from_grid(small_grid(), BackendConfig::default()).unwrap();
        let after_load = backend.comp_time();
        let (ok, _) = backend.runpf(false);
        assert!(ok);
        assert!(backend.comp_time() >= after_load);
    }
}
