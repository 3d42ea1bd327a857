use crate::admittance::LineAdm;
use crate::grid::{GridState, ResBus, ResGen, ResLine, ResLoad, ResStorage};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;

const SQRT_3: f64 = 1.732_050_807_568_877_2;

/// Writes an AC solution back into the result tables: bus voltages,
/// per-generator reactive dispatch (split equally among co-located units),
/// slack active-power pickup, branch flows, and the load/storage rows.
///
/// Equipment on de-energized buses keeps NaN rows; out-of-service lines
/// get zero flows so downstream consumers never see stale numbers.
pub(crate) fn apply_ac(
    grid: &mut GridState,
    act: &[usize],
    pos: &[usize],
    v: &[Complex64],
    y_bus: &DMatrix<Complex64>,
    lines: &[LineAdm],
    slack_gen: usize,
) {
    let base_mva = grid.base_mva;
    let vd = DVector::from_column_slice(v);
    let i_bus = y_bus * &vd;

    for (k, &b) in act.iter().enumerate() {
        grid.res_bus[b] = ResBus {
            vm_pu: v[k].norm(),
            va_degree: v[k].arg().to_degrees(),
        };
    }

    // local fixed load per bus, needed to turn net bus injections into
    // generator dispatch
    let nb = grid.bus.len();
    let mut pd = vec![0.0; nb];
    let mut qd = vec![0.0; nb];
    for l in grid.load.iter().filter(|l| l.in_service) {
        pd[l.bus] += l.p_mw;
        qd[l.bus] += l.q_mvar;
    }
    for s in grid.storage.iter().filter(|s| s.in_service) {
        pd[s.bus] += s.p_mw;
        qd[s.bus] += s.q_mvar;
    }

    let mut ngb = vec![0usize; nb];
    for g in grid.gen.iter().filter(|g| g.in_service) {
        ngb[g.bus] += 1;
    }

    let slack_bus = grid.gen[slack_gen].bus;
    let other_slack_p: f64 = grid
        .gen
        .iter()
        .enumerate()
        .filter(|(i, g)| *i != slack_gen && g.in_service && g.bus == slack_bus)
        .map(|(_, g)| g.p_mw)
        .sum();

    for (i, g) in grid.gen.iter().enumerate() {
        let k = pos[g.bus];
        if !g.in_service || k == usize::MAX {
            grid.res_gen[i] = ResGen::NAN;
            continue;
        }
        let s_inj = v[k] * i_bus[k].conj();
        // injected Q plus local demand, split among units at this bus
        let q_mvar = (s_inj.im * base_mva + qd[g.bus]) / ngb[g.bus] as f64;
        let p_mw = if i == slack_gen {
            s_inj.re * base_mva + pd[g.bus] - other_slack_p
        } else {
            g.p_mw
        };
        grid.res_gen[i] = ResGen {
            p_mw,
            q_mvar,
            vm_pu: v[k].norm(),
            va_degree: v[k].arg().to_degrees(),
        };
    }

    for (i, l) in grid.load.iter().enumerate() {
        grid.res_load[i] = if l.in_service {
            ResLoad {
                p_mw: l.p_mw,
                q_mvar: l.q_mvar,
            }
        } else {
            ResLoad::NAN
        };
    }

    // storages keep their scheduled power even on a de-energized bus; the
    // backend decides from the bus voltage whether that is a divergence
    for (i, s) in grid.storage.iter().enumerate() {
        grid.res_storage[i] = if s.in_service {
            ResStorage {
                p_mw: s.p_mw,
                q_mvar: s.q_mvar,
            }
        } else {
            ResStorage::NAN
        };
    }

    for (i, (ln, la)) in grid.line.iter().zip(lines).enumerate() {
        if !la.active {
            grid.res_line[i] = dead_line();
            continue;
        }
        let (f, t) = (pos[ln.from_bus], pos[ln.to_bus]);
        let i_f = la.yff * v[f] + la.yft * v[t];
        let i_t = la.ytf * v[f] + la.ytt * v[t];
        let s_f = v[f] * i_f.conj() * base_mva;
        let s_t = v[t] * i_t.conj() * base_mva;
        grid.res_line[i] = ResLine {
            p_from_mw: s_f.re,
            q_from_mvar: s_f.im,
            vm_from_pu: v[f].norm(),
            va_from_degree: v[f].arg().to_degrees(),
            i_from_ka: i_f.norm() * base_mva / (SQRT_3 * grid.bus[ln.from_bus].vn_kv),
            p_to_mw: s_t.re,
            q_to_mvar: s_t.im,
            vm_to_pu: v[t].norm(),
            va_to_degree: v[t].arg().to_degrees(),
            i_to_ka: i_t.norm() * base_mva / (SQRT_3 * grid.bus[ln.to_bus].vn_kv),
        };
    }
}

/// Writes a DC solution back into the result tables. Voltage magnitudes
/// are undefined in DC and stay NaN in `res_bus`; generator rows carry the
/// setpoint magnitude so co-location fixups downstream have a finite value
/// to copy. Reactive flows are zero by construction.
pub(crate) fn apply_dc(
    grid: &mut GridState,
    act: &[usize],
    pos: &[usize],
    va: &[f64],
    b_mat: &DMatrix<f64>,
    p_bus: &[f64],
    slack_gen: usize,
) {
    let base_mva = grid.base_mva;

    for (k, &b) in act.iter().enumerate() {
        grid.res_bus[b] = ResBus {
            vm_pu: f64::NAN,
            va_degree: va[k].to_degrees(),
        };
    }

    // slack picks up the injection mismatch at its bus
    let slack_bus = grid.gen[slack_gen].bus;
    let s = pos[slack_bus];
    let computed_inj: f64 = (0..act.len()).map(|j| b_mat[(s, j)] * va[j]).sum();

    for (i, g) in grid.gen.iter().enumerate() {
        let k = pos[g.bus];
        if !g.in_service || k == usize::MAX {
            grid.res_gen[i] = ResGen::NAN;
            continue;
        }
        let p_mw = if i == slack_gen {
            g.p_mw + (computed_inj - p_bus[s]) * base_mva
        } else {
            g.p_mw
        };
        grid.res_gen[i] = ResGen {
            p_mw,
            q_mvar: 0.0,
            vm_pu: g.vm_pu,
            va_degree: va[k].to_degrees(),
        };
    }

    for (i, l) in grid.load.iter().enumerate() {
        grid.res_load[i] = if l.in_service {
            ResLoad {
                p_mw: l.p_mw,
                q_mvar: l.q_mvar,
            }
        } else {
            ResLoad::NAN
        };
    }
    for (i, s) in grid.storage.iter().enumerate() {
        grid.res_storage[i] = if s.in_service {
            ResStorage {
                p_mw: s.p_mw,
                q_mvar: s.q_mvar,
            }
        } else {
            ResStorage::NAN
        };
    }

    for (i, ln) in grid.line.iter().enumerate() {
        let (f, t) = (pos[ln.from_bus], pos[ln.to_bus]);
        if !ln.in_service || f == usize::MAX || t == usize::MAX {
            grid.res_line[i] = dead_line();
            continue;
        }
        let p_mw = (va[f] - va[t]) / ln.x_pu * base_mva;
        // unit magnitude assumed for the current estimate
        let i_from = p_mw.abs() / (SQRT_3 * grid.bus[ln.from_bus].vn_kv);
        let i_to = p_mw.abs() / (SQRT_3 * grid.bus[ln.to_bus].vn_kv);
        grid.res_line[i] = ResLine {
            p_from_mw: p_mw,
            q_from_mvar: 0.0,
            vm_from_pu: f64::NAN,
            va_from_degree: va[f].to_degrees(),
            i_from_ka: i_from,
            p_to_mw: -p_mw,
            q_to_mvar: 0.0,
            vm_to_pu: f64::NAN,
            va_to_degree: va[t].to_degrees(),
            i_to_ka: i_to,
        };
    }
}

/// Out-of-service and de-energized lines carry no flow; their voltages are
/// undefined and left for the backend to zero out.
fn dead_line() -> ResLine {
    ResLine {
        p_from_mw: 0.0,
        q_from_mvar: 0.0,
        vm_from_pu: f64::NAN,
        va_from_degree: f64::NAN,
        i_from_ka: 0.0,
        p_to_mw: 0.0,
        q_to_mvar: 0.0,
        vm_to_pu: f64::NAN,
        va_to_degree: f64::NAN,
        i_to_ka: 0.0,
    }
}
