use crate::grid::GridState;
use nalgebra::DMatrix;
use num_complex::Complex64;

/// Two-port admittance of one line, in the reduced (energized) bus space.
/// `active` is false for lines that are out of service or touch a
/// de-energized bus; such lines contribute nothing to the bus matrix.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LineAdm {
    pub yff: Complex64,
    pub yft: Complex64,
    pub ytf: Complex64,
    pub ytt: Complex64,
    pub active: bool,
}

/// Builds the dense bus admittance matrix over the energized buses listed
/// in `act`, together with the per-line admittances used for branch flows.
/// `pos` maps a bus index to its row in the reduced system, `usize::MAX`
/// for de-energized buses.
pub(crate) fn make_ybus(
    grid: &GridState,
    act: &[usize],
    pos: &[usize],
) -> (DMatrix<Complex64>, Vec<LineAdm>) {
    let n = act.len();
    let mut y_bus = DMatrix::<Complex64>::zeros(n, n);
    let mut adm = Vec::with_capacity(grid.line.len());

    for ln in &grid.line {
        let (f, t) = (pos[ln.from_bus], pos[ln.to_bus]);
        let active = ln.in_service && f != usize::MAX && t != usize::MAX;
        if !active {
            adm.push(LineAdm {
                yff: Complex64::new(0.0, 0.0),
                yft: Complex64::new(0.0, 0.0),
                ytf: Complex64::new(0.0, 0.0),
                ytt: Complex64::new(0.0, 0.0),
                active,
            });
            continue;
        }
        let ys = Complex64::new(1.0, 0.0) / Complex64::new(ln.r_pu, ln.x_pu);
        let bc = Complex64::new(0.0, ln.b_pu / 2.0);
        let la = LineAdm {
            yff: ys + bc,
            yft: -ys,
            ytf: -ys,
            ytt: ys + bc,
            active,
        };
        y_bus[(f, f)] += la.yff;
        y_bus[(f, t)] += la.yft;
        y_bus[(t, f)] += la.ytf;
        y_bus[(t, t)] += la.ytt;
        adm.push(la);
    }
    (y_bus, adm)
}

/// Builds the DC susceptance matrix over the energized buses. Series
/// resistance and line charging are ignored by construction.
pub(crate) fn make_bdc(grid: &GridState, act: &[usize], pos: &[usize]) -> DMatrix<f64> {
    let n = act.len();
    let mut b_mat = DMatrix::<f64>::zeros(n, n);
    for ln in &grid.line {
        let (f, t) = (pos[ln.from_bus], pos[ln.to_bus]);
        if !ln.in_service || f == usize::MAX || t == usize::MAX {
            continue;
        }
        let b = 1.0 / ln.x_pu;
        b_mat[(f, f)] += b;
        b_mat[(t, t)] += b;
        b_mat[(f, t)] -= b;
        b_mat[(t, f)] -= b;
    }
    b_mat
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reduced(grid: &GridState) -> (Vec<usize>, Vec<usize>) {
        let act: Vec<usize> = (0..grid.bus.len()).collect();
        let pos = act.clone();
        (act, pos)
    }

    #[test]
    fn ybus_rows_sum_to_charging_only() {
        let mut grid = GridState::new(100.0);
        let a = grid.add_bus(110.0);
        let b = grid.add_bus(110.0);
        grid.add_line(a, b, 0.02, 0.1);
        let (act, pos) = reduced(&grid);
        let (y, adm) = make_ybus(&grid, &act, &pos);
        // without charging, each row of Ybus sums to zero
        let row_sum = y[(0, 0)] + y[(0, 1)];
        assert!(row_sum.norm() < 1e-12);
        assert!(adm[0].active);
        assert!((adm[0].yff + adm[0].yft).norm() < 1e-12);
    }

    #[test]
    fn dead_line_contributes_nothing() {
        let mut grid = GridState::new(100.0);
        let a = grid.add_bus(110.0);
        let b = grid.add_bus(110.0);
        let l = grid.add_line(a, b, 0.02, 0.1);
        grid.line[l].in_service = false;
        let (act, pos) = reduced(&grid);
        let (y, adm) = make_ybus(&grid, &act, &pos);
        assert!(!adm[0].active);
        assert_eq!(y[(0, 0)], Complex64::new(0.0, 0.0));

        let b_mat = make_bdc(&grid, &act, &pos);
        assert_eq!(b_mat[(0, 0)], 0.0);
    }

    #[test]
    fn bdc_uses_series_reactance_only() {
        let mut grid = GridState::new(100.0);
        let a = grid.add_bus(110.0);
        let b = grid.add_bus(110.0);
        grid.add_line(a, b, 0.02, 0.25);
        let (act, pos) = reduced(&grid);
        let b_mat = make_bdc(&grid, &act, &pos);
        assert!((b_mat[(0, 0)] - 4.0).abs() < 1e-12);
        assert!((b_mat[(0, 1)] + 4.0).abs() < 1e-12);
    }
}
