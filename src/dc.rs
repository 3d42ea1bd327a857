use nalgebra::{DMatrix, DVector};

/// Solves a DC power flow on the reduced (energized) bus system.
///
/// Solves for the bus voltage angles at all but the slack bus, given the
/// full susceptance matrix and the vector of per-unit real power
/// injections. The slack angle is pinned to zero. Returns the angle vector
/// in radians, or the divergence reason when the reduced system is
/// singular or the solution is not physically plausible.
pub(crate) fn dc_pf(
    b_mat: &DMatrix<f64>,
    p_bus: &[f64],
    slack_pos: usize,
) -> Result<Vec<f64>, String> {
    // arbitrary threshold on |Va| for declaring failure
    let va_threshold = 1e5;

    let n = b_mat.nrows();
    let keep: Vec<usize> = (0..n).filter(|&i| i != slack_pos).collect();

    let mut b_red = DMatrix::<f64>::zeros(keep.len(), keep.len());
    for (r, &i) in keep.iter().enumerate() {
        for (c, &j) in keep.iter().enumerate() {
            b_red[(r, c)] = b_mat[(i, j)];
        }
    }
    let rhs = DVector::from_iterator(keep.len(), keep.iter().map(|&i| p_bus[i]));

    let va_red = b_red
        .lu()
        .solve(&rhs)
        .ok_or_else(|| "DC susceptance matrix is singular".to_string())?;

    let mut va = vec![0.0; n];
    for (r, &i) in keep.iter().enumerate() {
        va[i] = va_red[r];
    }
    if va.iter().any(|v| v.abs() > va_threshold) {
        return Err("DC angle solution out of range".to_string());
    }
    Ok(va)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_bus_transfer() {
        // single line, x = 0.1 pu, 0.5 pu flowing 0 -> 1
        let b_mat = DMatrix::from_row_slice(2, 2, &[10.0, -10.0, -10.0, 10.0]);
        let p_bus = [0.5, -0.5];
        let va = dc_pf(&b_mat, &p_bus, 0).unwrap();
        assert_eq!(va[0], 0.0);
        assert!((va[1] + 0.05).abs() < 1e-12, "va1 = {}", va[1]);
    }

    #[test]
    fn singular_system_is_reported() {
        // bus 1 is connected to nothing; the reduced system is the zero matrix
        let b_mat = DMatrix::from_row_slice(2, 2, &[10.0, 0.0, 0.0, 0.0]);
        let p_bus = [0.0, 0.3];
        let err = dc_pf(&b_mat, &p_bus, 0).unwrap_err();
        assert!(err.contains("singular"), "{err}");
    }
}
