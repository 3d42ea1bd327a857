use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;

pub(crate) struct NewtonSolution {
    pub v: Vec<Complex64>,
    pub converged: bool,
    pub iterations: usize,
}

/// Solves the power flow using a full Newton-Raphson method with nodal
/// power balance equations and polar voltage coordinates.
///
/// Operates on the reduced (energized) bus system: `v0` holds the voltage
/// setpoints for generator buses and a flat start elsewhere, `pv`/`pq` are
/// positions in that reduced space. The slack bus is whichever position is
/// in neither list. A singular Jacobian is reported as non-convergence;
/// the caller decides what that means for the grid.
pub(crate) fn newtonpf(
    y_bus: &DMatrix<Complex64>,
    s_bus: &[Complex64],
    v0: &[Complex64],
    pv: &[usize],
    pq: &[usize],
    tol: f64,
    max_it: usize,
    quiet: bool,
) -> NewtonSolution {
    let pv_pq = [pv, pq].concat();
    let npvpq = pv_pq.len();
    let npq = pq.len();

    let mut v: DVector<Complex64> = DVector::from_column_slice(v0);
    let mut va: Vec<f64> = v.iter().map(|c| c.arg()).collect();
    let mut vm: Vec<f64> = v.iter().map(|c| c.norm()).collect();

    let mut f = mismatch(y_bus, &v, s_bus, &pv_pq, pq);
    let mut converged = norm_inf(&f) < tol;
    let mut iterations = 0;

    while !converged && iterations < max_it {
        iterations += 1;

        let diag_v = DMatrix::from_diagonal(&v);
        let diag_vnorm = DMatrix::from_diagonal(&v.map(|c| c / c.norm()));
        let i_bus = y_bus * &v;
        let diag_ibus = DMatrix::from_diagonal(&i_bus);

        // partial derivatives of the bus injections w.r.t. angle/magnitude
        let ds_dva =
            (&diag_v * (&diag_ibus - y_bus * &diag_v).map(|c| c.conj())).map(|c| c * Complex64::i());
        let ds_dvm = &diag_v * (y_bus * &diag_vnorm).map(|c| c.conj())
            + diag_ibus.map(|c| c.conj()) * &diag_vnorm;

        let ndim = npvpq + npq;
        let mut jac = DMatrix::<f64>::zeros(ndim, ndim);
        for (r, &i) in pv_pq.iter().enumerate() {
            for (c, &j) in pv_pq.iter().enumerate() {
                jac[(r, c)] = ds_dva[(i, j)].re;
            }
            for (c, &j) in pq.iter().enumerate() {
                jac[(r, npvpq + c)] = ds_dvm[(i, j)].re;
            }
        }
        for (r, &i) in pq.iter().enumerate() {
            for (c, &j) in pv_pq.iter().enumerate() {
                jac[(npvpq + r, c)] = ds_dva[(i, j)].im;
            }
            for (c, &j) in pq.iter().enumerate() {
                jac[(npvpq + r, npvpq + c)] = ds_dvm[(i, j)].im;
            }
        }

        let Some(dx) = jac.lu().solve(&f) else {
            log::debug!("newton: singular Jacobian at iteration {iterations}");
            return NewtonSolution {
                v: v.iter().copied().collect(),
                converged: false,
                iterations,
            };
        };

        for (k, &i) in pv_pq.iter().enumerate() {
            va[i] -= dx[k];
        }
        for (k, &i) in pq.iter().enumerate() {
            vm[i] -= dx[npvpq + k];
        }
        for i in 0..v.len() {
            v[i] = Complex64::from_polar(vm[i], va[i]);
        }
        // keep vm in sync for the next Jacobian (vm of pv buses is fixed)
        for i in 0..v.len() {
            vm[i] = v[i].norm();
        }

        f = mismatch(y_bus, &v, s_bus, &pv_pq, pq);
        let norm = norm_inf(&f);
        if quiet {
            log::trace!("newton: it {iterations}, max mismatch {norm:.3e}");
        } else {
            log::debug!("newton: it {iterations}, max mismatch {norm:.3e}");
        }
        converged = norm < tol;
    }

    NewtonSolution {
        v: v.iter().copied().collect(),
        converged,
        iterations,
    }
}

fn mismatch(
    y_bus: &DMatrix<Complex64>,
    v: &DVector<Complex64>,
    s_bus: &[Complex64],
    pv_pq: &[usize],
    pq: &[usize],
) -> DVector<f64> {
    let i_bus = y_bus * v;
    let mis: Vec<Complex64> = (0..v.len())
        .map(|i| v[i] * i_bus[i].conj() - s_bus[i])
        .collect();
    DVector::from_iterator(
        pv_pq.len() + pq.len(),
        pv_pq
            .iter()
            .map(|&i| mis[i].re)
            .chain(pq.iter().map(|&i| mis[i].im)),
    )
}

fn norm_inf(f: &DVector<f64>) -> f64 {
    f.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two buses, one line (x = 0.1 pu), slack at 0, a 0.5 + j0.1 pu load
    /// at bus 1. Compared against a hand-checked solution.
    #[test]
    fn two_bus_load_converges() {
        let ys = Complex64::new(1.0, 0.0) / Complex64::new(0.01, 0.1);
        let y = DMatrix::from_row_slice(2, 2, &[ys, -ys, -ys, ys]);
        let s = [Complex64::new(0.0, 0.0), Complex64::new(-0.5, -0.1)];
        let v0 = [Complex64::new(1.0, 0.0), Complex64::new(1.0, 0.0)];

        let sol = newtonpf(&y, &s, &v0, &[], &[1], 1e-8, 10, false);
        assert!(sol.converged, "did not converge in {}", sol.iterations);
        assert!(sol.iterations <= 6);

        // the solved injection at bus 1 must match the specified load
        let i1 = y[(1, 0)] * sol.v[0] + y[(1, 1)] * sol.v[1];
        let s1 = sol.v[1] * i1.conj();
        assert!((s1 - s[1]).norm() < 1e-7, "s1 = {s1}");
        assert!(sol.v[1].norm() < 1.0); // load depresses the voltage
    }

    #[test]
    fn infeasible_case_does_not_converge() {
        // a 50 pu load across a 0.1 pu reactance cannot be served
        let ys = Complex64::new(1.0, 0.0) / Complex64::new(0.01, 0.1);
        let y = DMatrix::from_row_slice(2, 2, &[ys, -ys, -ys, ys]);
        let s = [Complex64::new(0.0, 0.0), Complex64::new(-50.0, 0.0)];
        let v0 = [Complex64::new(1.0, 0.0), Complex64::new(1.0, 0.0)];

        let sol = newtonpf(&y, &s, &v0, &[], &[1], 1e-8, 10, true);
        assert!(!sol.converged);
    }
}
