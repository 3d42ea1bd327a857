use itertools::Itertools;

/// An electrical node. `vn_kv` is the nominal voltage used to convert
/// per-unit results back to physical units.
#[derive(Debug, Clone)]
pub struct Bus {
    pub vn_kv: f64,
    pub in_service: bool,
}

#[derive(Debug, Clone)]
pub struct Load {
    pub bus: usize,
    /// Consumption, positive.
    pub p_mw: f64,
    pub q_mvar: f64,
    pub in_service: bool,
}

#[derive(Debug, Clone)]
pub struct Gen {
    pub bus: usize,
    /// Scheduled production, positive.
    pub p_mw: f64,
    /// Voltage magnitude setpoint.
    pub vm_pu: f64,
    pub min_p_mw: f64,
    pub max_p_mw: f64,
    /// The slack generator balances the system; the first in-service one
    /// defines the reference bus.
    pub slack: bool,
    pub in_service: bool,
}

/// A branch with series impedance and total charging susceptance, per unit
/// on the system base.
#[derive(Debug, Clone)]
pub struct Line {
    pub from_bus: usize,
    pub to_bus: usize,
    pub r_pu: f64,
    pub x_pu: f64,
    pub b_pu: f64,
    pub in_service: bool,
}

#[derive(Debug, Clone)]
pub struct Storage {
    pub bus: usize,
    /// Positive when charging (consuming).
    pub p_mw: f64,
    pub q_mvar: f64,
    pub in_service: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ResBus {
    pub vm_pu: f64,
    pub va_degree: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ResGen {
    pub p_mw: f64,
    pub q_mvar: f64,
    pub vm_pu: f64,
    pub va_degree: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ResLoad {
    pub p_mw: f64,
    pub q_mvar: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ResLine {
    pub p_from_mw: f64,
    pub q_from_mvar: f64,
    pub vm_from_pu: f64,
    pub va_from_degree: f64,
    pub i_from_ka: f64,
    pub p_to_mw: f64,
    pub q_to_mvar: f64,
    pub vm_to_pu: f64,
    pub va_to_degree: f64,
    pub i_to_ka: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ResStorage {
    pub p_mw: f64,
    pub q_mvar: f64,
}

macro_rules! nan_row {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl $ty {
            pub const NAN: Self = Self { $($field: f64::NAN),+ };
        }
        impl Default for $ty {
            fn default() -> Self {
                Self::NAN
            }
        }
    };
}

nan_row!(ResBus { vm_pu, va_degree });
nan_row!(ResGen { p_mw, q_mvar, vm_pu, va_degree });
nan_row!(ResLoad { p_mw, q_mvar });
nan_row!(ResLine {
    p_from_mw,
    q_from_mvar,
    vm_from_pu,
    va_from_degree,
    i_from_ka,
    p_to_mw,
    q_to_mvar,
    vm_to_pu,
    va_to_degree,
    i_to_ka,
});
nan_row!(ResStorage { p_mw, q_mvar });

/// The grid case plus the result tables a solve writes back into it.
///
/// Result tables are either fully populated (the solve converged) or
/// NaN-marked, never partially valid. `converged` reflects the power flow
/// itself, `opf_converged` the optimal power flow stage; a DC solve leaves
/// the latter false by construction.
#[derive(Debug, Clone, Default)]
pub struct GridState {
    pub base_mva: f64,
    pub bus: Vec<Bus>,
    pub load: Vec<Load>,
    pub gen: Vec<Gen>,
    pub line: Vec<Line>,
    pub storage: Vec<Storage>,

    pub res_bus: Vec<ResBus>,
    pub res_gen: Vec<ResGen>,
    pub res_load: Vec<ResLoad>,
    pub res_line: Vec<ResLine>,
    pub res_storage: Vec<ResStorage>,

    pub converged: bool,
    pub opf_converged: bool,
}

impl GridState {
    pub fn new(base_mva: f64) -> Self {
        Self {
            base_mva,
            ..Default::default()
        }
    }

    pub fn add_bus(&mut self, vn_kv: f64) -> usize {
        self.bus.push(Bus {
            vn_kv,
            in_service: true,
        });
        self.res_bus.push(ResBus::NAN);
        self.bus.len() - 1
    }

    pub fn add_load(&mut self, bus: usize, p_mw: f64, q_mvar: f64) -> usize {
        self.load.push(Load {
            bus,
            p_mw,
            q_mvar,
            in_service: true,
        });
        self.res_load.push(ResLoad::NAN);
        self.load.len() - 1
    }

    pub fn add_gen(&mut self, bus: usize, p_mw: f64, vm_pu: f64) -> usize {
        self.gen.push(Gen {
            bus,
            p_mw,
            vm_pu,
            min_p_mw: 0.0,
            max_p_mw: f64::INFINITY,
            slack: false,
            in_service: true,
        });
        self.res_gen.push(ResGen::NAN);
        self.gen.len() - 1
    }

    pub fn add_slack_gen(&mut self, bus: usize, p_mw: f64, vm_pu: f64) -> usize {
        let g = self.add_gen(bus, p_mw, vm_pu);
        self.gen[g].slack = true;
        g
    }

    pub fn add_line(&mut self, from_bus: usize, to_bus: usize, r_pu: f64, x_pu: f64) -> usize {
        self.line.push(Line {
            from_bus,
            to_bus,
            r_pu,
            x_pu,
            b_pu: 0.0,
            in_service: true,
        });
        self.res_line.push(ResLine::NAN);
        self.line.len() - 1
    }

    pub fn add_storage(&mut self, bus: usize, p_mw: f64, q_mvar: f64) -> usize {
        self.storage.push(Storage {
            bus,
            p_mw,
            q_mvar,
            in_service: true,
        });
        self.res_storage.push(ResStorage::NAN);
        self.storage.len() - 1
    }

    /// Checks that every piece of equipment references an existing bus.
    /// A violation here is a contract breach, not a divergence.
    pub fn validate(&self) -> Result<(), String> {
        let nb = self.bus.len();
        for (i, l) in self.load.iter().enumerate() {
            if l.bus >= nb {
                return Err(format!("load {i} references bus {} of {nb}", l.bus));
            }
        }
        for (i, g) in self.gen.iter().enumerate() {
            if g.bus >= nb {
                return Err(format!("gen {i} references bus {} of {nb}", g.bus));
            }
        }
        for (i, ln) in self.line.iter().enumerate() {
            if ln.from_bus >= nb || ln.to_bus >= nb {
                return Err(format!(
                    "line {i} references buses {}-{} of {nb}",
                    ln.from_bus, ln.to_bus
                ));
            }
        }
        for (i, s) in self.storage.iter().enumerate() {
            if s.bus >= nb {
                return Err(format!("storage {i} references bus {} of {nb}", s.bus));
            }
        }
        Ok(())
    }

    /// Index of the first in-service slack generator, if any.
    pub fn slack_gen(&self) -> Option<usize> {
        self.gen.iter().position(|g| g.slack && g.in_service)
    }

    /// Marks every bus reachable from `root` over in-service lines whose
    /// endpoints are both in service. Everything else stays de-energized
    /// and solves to NaN.
    pub fn energized_buses(&self, root: usize) -> Vec<bool> {
        let mut seen = vec![false; self.bus.len()];
        if !self.bus[root].in_service {
            return seen;
        }
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); self.bus.len()];
        for ln in &self.line {
            if ln.in_service
                && self.bus[ln.from_bus].in_service
                && self.bus[ln.to_bus].in_service
            {
                adj[ln.from_bus].push(ln.to_bus);
                adj[ln.to_bus].push(ln.from_bus);
            }
        }
        let mut stack = vec![root];
        seen[root] = true;
        while let Some(b) = stack.pop() {
            for &n in &adj[b] {
                if !seen[n] {
                    seen[n] = true;
                    stack.push(n);
                }
            }
        }
        seen
    }

    /// Wipes every result table to NaN markers. The convergence flags are
    /// managed by the solvers, not here.
    pub fn nan_results(&mut self) {
        self.res_bus.fill(ResBus::NAN);
        self.res_gen.fill(ResGen::NAN);
        self.res_load.fill(ResLoad::NAN);
        self.res_line.fill(ResLine::NAN);
        self.res_storage.fill(ResStorage::NAN);
    }

    /// Indices of in-service buses whose solved voltage angle is undefined.
    /// A non-empty answer after a "successful" solve means the grid was not
    /// fully connected even though the solver did not flag it.
    pub fn isolated_buses(&self) -> Vec<usize> {
        self.bus
            .iter()
            .zip(&self.res_bus)
            .positions(|(b, r)| b.in_service && r.va_degree.is_nan())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_island_grid() -> GridState {
        let mut grid = GridState::new(100.0);
        for _ in 0..4 {
            grid.add_bus(110.0);
        }
        grid.add_line(0, 1, 0.01, 0.05);
        grid.add_line(2, 3, 0.01, 0.05);
        grid
    }

    #[test]
    fn energized_stops_at_island_boundary() {
        let grid = two_island_grid();
        assert_eq!(grid.energized_buses(0), vec![true, true, false, false]);
        assert_eq!(grid.energized_buses(3), vec![false, false, true, true]);
    }

    #[test]
    fn out_of_service_line_breaks_energization() {
        let mut grid = two_island_grid();
        grid.line[0].in_service = false;
        assert_eq!(grid.energized_buses(0), vec![true, false, false, false]);
    }

    #[test]
    fn validate_rejects_dangling_bus_reference() {
        let mut grid = two_island_grid();
        grid.add_load(17, 1.0, 0.0);
        let msg = grid.validate().unwrap_err();
        assert!(msg.contains("load 0"), "{msg}");
    }

    #[test]
    fn isolated_buses_reads_nan_angles() {
        let mut grid = two_island_grid();
        grid.res_bus[0] = ResBus {
            vm_pu: 1.0,
            va_degree: 0.0,
        };
        grid.res_bus[1] = ResBus {
            vm_pu: 1.0,
            va_degree: -1.2,
        };
        grid.bus[3].in_service = false;
        // buses 2 and 3 never solved; only the in-service one is reported
        assert_eq!(grid.isolated_buses(), vec![2]);
    }
}
