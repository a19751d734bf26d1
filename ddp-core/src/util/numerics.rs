//! Numerical helpers shared across the solver.

use nalgebra::{DMatrix, DVector};

/// Tolerance used when a quantity is compared against "effectively zero".
pub const LIMIT_EPSILON: f64 = 1e-9;

/// Tolerance used when seeking a time inside an existing trajectory.
pub const WEAK_EPSILON: f64 = 1e-7;

/// Greater-or-equal with a relative slack, so that values that differ only by
/// accumulated round-off compare as equal.
pub fn almost_ge(a: f64, b: f64) -> bool {
    a >= b - 8.0 * f64::EPSILON * a.abs().max(b.abs()).max(1.0)
}

/// True when every component of the vector is finite.
pub fn vector_is_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

/// True when every component of the matrix is finite.
pub fn matrix_is_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|x| x.is_finite())
}

/// Projects a symmetric matrix onto the nearest positive semidefinite matrix
/// by clipping negative eigenvalues at zero.
pub fn make_psd(m: &mut DMatrix<f64>) {
    let n = m.nrows();
    if n == 0 {
        return;
    }
    // symmetrize first; eigen decomposition assumes it
    let sym = (&*m + m.transpose()) * 0.5;
    let eigen = sym.clone().symmetric_eigen();
    let mut clipped = false;
    let mut values = eigen.eigenvalues.clone();
    for v in values.iter_mut() {
        if *v < 0.0 {
            *v = 0.0;
            clipped = true;
        }
    }
    if clipped {
        *m = &eigen.eigenvectors * DMatrix::from_diagonal(&values) * eigen.eigenvectors.transpose();
    } else {
        *m = sym;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    #[test]
    fn make_psd_clips_negative_eigenvalues() {
        let mut m = dmatrix![1.0, 0.0; 0.0, -2.0];
        make_psd(&mut m);
        let eigen = m.clone().symmetric_eigen();
        for v in eigen.eigenvalues.iter() {
            assert!(*v >= -1e-12, "eigenvalue {} is negative", v);
        }
        // the PSD part of the original matrix is preserved
        assert!((m[(0, 0)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn make_psd_keeps_psd_matrix() {
        let mut m = dmatrix![2.0, 0.5; 0.5, 1.0];
        let orig = m.clone();
        make_psd(&mut m);
        assert!((m - orig).norm() < 1e-12);
    }

    #[test]
    fn almost_ge_tolerates_roundoff() {
        assert!(almost_ge(1.0, 1.0 + 1e-16));
        assert!(almost_ge(2.0, 1.0));
        assert!(!almost_ge(1.0, 1.0 + 1e-9));
    }
}
