//! Dense linear algebra on small symmetric systems.
//!
//! Everything here works on `Array2<f64>` and is written for the matrix
//! sizes the machines produce (feature dimension or GMM supervector size).

use crate::machine::MachineError;
use ndarray::{Array1, Array2};

const MAX_JACOBI_SWEEPS: usize = 100;
const JACOBI_TOLERANCE: f64 = 1e-12;
const PIVOT_TOLERANCE: f64 = 1e-13;

fn square(a: &Array2<f64>) -> Result<usize, MachineError> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(MachineError::NotSquare { rows, cols });
    }
    Ok(rows)
}

/// Inverse by Gauss-Jordan elimination with partial pivoting.
pub fn inverse(a: &Array2<f64>) -> Result<Array2<f64>, MachineError> {
    let n = square(a)?;
    let scale = a.iter().fold(0.0f64, |acc, x| acc.max(x.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return Err(MachineError::Singular);
    }
    let tolerance = scale * PIVOT_TOLERANCE;

    let mut m = a.to_owned();
    let mut inv = Array2::<f64>::eye(n);

    for col in 0..n {
        let mut pivot_row = col;
        for row in (col + 1)..n {
            if m[[row, col]].abs() > m[[pivot_row, col]].abs() {
                pivot_row = row;
            }
        }
        if m[[pivot_row, col]].abs() <= tolerance {
            return Err(MachineError::Singular);
        }
        if pivot_row != col {
            for k in 0..n {
                m.swap([col, k], [pivot_row, k]);
                inv.swap([col, k], [pivot_row, k]);
            }
        }

        let pivot = m[[col, col]];
        for k in 0..n {
            m[[col, k]] /= pivot;
            inv[[col, k]] /= pivot;
        }

        for row in 0..n {
            let factor = m[[row, col]];
            if row == col || factor == 0.0 {
                continue;
            }
            for k in 0..n {
                m[[row, k]] -= factor * m[[col, k]];
                inv[[row, k]] -= factor * inv[[col, k]];
            }
        }
    }

    Ok(inv)
}

/// Lower Cholesky factor `L` with `a = L Lᵀ`.
pub fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>, MachineError> {
    let n = square(a)?;
    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut d = a[[j, j]];
        for k in 0..j {
            d -= l[[j, k]] * l[[j, k]];
        }
        if d <= 0.0 || !d.is_finite() {
            return Err(MachineError::NotPositiveDefinite);
        }
        let ljj = d.sqrt();
        l[[j, j]] = ljj;
        for i in (j + 1)..n {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / ljj;
        }
    }
    Ok(l)
}

/// Inverse of a lower triangular matrix by forward substitution.
pub fn inverse_lower_triangular(l: &Array2<f64>) -> Result<Array2<f64>, MachineError> {
    let n = square(l)?;
    let mut x = Array2::<f64>::zeros((n, n));
    for col in 0..n {
        for i in col..n {
            let mut s = if i == col { 1.0 } else { 0.0 };
            for k in col..i {
                s -= l[[i, k]] * x[[k, col]];
            }
            if l[[i, i]] == 0.0 {
                return Err(MachineError::Singular);
            }
            x[[i, col]] = s / l[[i, i]];
        }
    }
    Ok(x)
}

/// Inverse of a symmetric positive definite matrix via its Cholesky factor.
pub fn spd_inverse(a: &Array2<f64>) -> Result<Array2<f64>, MachineError> {
    let l_inv = inverse_lower_triangular(&cholesky(a)?)?;
    Ok(l_inv.t().dot(&l_inv))
}

/// `ln det(a)` for a symmetric positive definite matrix.
pub fn log_det_spd(a: &Array2<f64>) -> Result<f64, MachineError> {
    let l = cholesky(a)?;
    Ok(2.0 * l.diag().iter().map(|v| v.ln()).sum::<f64>())
}

/// `(a + aᵀ) / 2`.
pub fn symmetrize(a: &Array2<f64>) -> Array2<f64> {
    (a + &a.t()) * 0.5
}

pub fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

/// Eigen-decomposition of a symmetric matrix with cyclic Jacobi rotations.
///
/// Returns eigenvalues in descending order and the matching unit eigenvectors
/// as columns. Each eigenvector is signed so that its largest-magnitude
/// component is positive, which makes the result reproducible.
pub fn symmetric_eigen(a: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>), MachineError> {
    let n = square(a)?;
    let mut m = symmetrize(a);
    let mut v = Array2::<f64>::eye(n);

    let scale = m.iter().map(|x| x * x).sum::<f64>().sqrt();
    if !scale.is_finite() {
        return Err(MachineError::InvalidParameter(
            "matrix contains non-finite values".to_string(),
        ));
    }
    let tolerance = JACOBI_TOLERANCE * scale;

    let mut converged = false;
    for _sweep in 0..MAX_JACOBI_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += 2.0 * m[[p, q]] * m[[p, q]];
            }
        }
        if off.sqrt() <= tolerance {
            converged = true;
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = m[[p, q]];
                if apq == 0.0 {
                    continue;
                }
                let theta = (m[[q, q]] - m[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let (mkp, mkq) = (m[[k, p]], m[[k, q]]);
                    m[[k, p]] = c * mkp - s * mkq;
                    m[[k, q]] = s * mkp + c * mkq;
                }
                for k in 0..n {
                    let (mpk, mqk) = (m[[p, k]], m[[q, k]]);
                    m[[p, k]] = c * mpk - s * mqk;
                    m[[q, k]] = s * mpk + c * mqk;
                }
                for k in 0..n {
                    let (vkp, vkq) = (v[[k, p]], v[[k, q]]);
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }
    if !converged {
        return Err(MachineError::NoConvergence(MAX_JACOBI_SWEEPS));
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| m[[j, j]].total_cmp(&m[[i, i]]));

    let values = Array1::from_iter(order.iter().map(|&i| m[[i, i]]));
    let mut vectors = Array2::<f64>::zeros((n, n));
    for (dst, &src) in order.iter().enumerate() {
        vectors.column_mut(dst).assign(&v.column(src));
    }
    normalize_signs(&mut vectors);
    Ok((values, vectors))
}

/// Solve `a v = λ b v` for symmetric `a` and symmetric positive definite `b`.
///
/// Eigenvalues are descending; eigenvectors (columns) are `b`-orthonormal.
pub fn generalized_symmetric_eigen(
    a: &Array2<f64>,
    b: &Array2<f64>,
) -> Result<(Array1<f64>, Array2<f64>), MachineError> {
    let n = square(a)?;
    if square(b)? != n {
        return Err(MachineError::DimensionMismatch {
            expected: n,
            got: b.nrows(),
        });
    }
    let l_inv = inverse_lower_triangular(&cholesky(b)?)?;
    let c = l_inv.dot(a).dot(&l_inv.t());
    let (values, y) = symmetric_eigen(&c)?;
    let mut vectors = l_inv.t().dot(&y);
    normalize_signs(&mut vectors);
    Ok((values, vectors))
}

/// Sign each column so its largest-magnitude component is positive.
pub(crate) fn normalize_signs(vectors: &mut Array2<f64>) {
    for mut column in vectors.columns_mut() {
        let mut largest = 0.0f64;
        for &x in column.iter() {
            if x.abs() > largest.abs() {
                largest = x;
            }
        }
        if largest < 0.0 {
            column.mapv_inplace(|x| -x);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn assert_close(a: &Array2<f64>, b: &Array2<f64>, tol: f64) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{x} vs {y}");
        }
    }

    #[test]
    fn test_inverse_roundtrip() {
        let a = array![[4.0, 7.0, 2.0], [3.0, 6.0, 1.0], [2.0, 5.0, 3.0]];
        let inv = inverse(&a).unwrap();
        assert_close(&a.dot(&inv), &Array2::eye(3), 1e-12);
    }

    #[test]
    fn test_inverse_singular() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert_eq!(inverse(&a), Err(MachineError::Singular));
        assert!(matches!(
            inverse(&array![[1.0, 2.0, 3.0]]),
            Err(MachineError::NotSquare { rows: 1, cols: 3 })
        ));
    }

    #[test]
    fn test_cholesky_and_log_det() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let l = cholesky(&a).unwrap();
        assert_close(&l.dot(&l.t()), &a, 1e-12);
        assert!((log_det_spd(&a).unwrap() - 8.0f64.ln()).abs() < 1e-12);
        assert_close(&spd_inverse(&a).unwrap(), &inverse(&a).unwrap(), 1e-12);
        assert_eq!(
            cholesky(&array![[1.0, 2.0], [2.0, 1.0]]),
            Err(MachineError::NotPositiveDefinite)
        );
    }

    #[test]
    fn test_symmetric_eigen_diagonalizes() {
        let a = array![[2.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 4.0]];
        let (values, vectors) = symmetric_eigen(&a).unwrap();
        assert!(values[0] >= values[1] && values[1] >= values[2]);
        let reconstructed = vectors.dot(&Array2::from_diag(&values)).dot(&vectors.t());
        assert_close(&reconstructed, &a, 1e-10);
        assert_close(&vectors.t().dot(&vectors), &Array2::eye(3), 1e-10);
        for column in vectors.columns() {
            let largest = column.iter().fold(0.0f64, |m, &x| if x.abs() > m.abs() { x } else { m });
            assert!(largest > 0.0);
        }
    }

    #[test]
    fn test_generalized_eigen() {
        let a = array![[2.0, 1.0], [1.0, 2.0]];
        let b = array![[2.0, 0.0], [0.0, 1.0]];
        let (values, vectors) = generalized_symmetric_eigen(&a, &b).unwrap();
        for k in 0..2 {
            let v = vectors.column(k).to_owned();
            let lhs = a.dot(&v);
            let rhs = b.dot(&v) * values[k];
            for (x, y) in lhs.iter().zip(rhs.iter()) {
                assert!((x - y).abs() < 1e-10);
            }
        }
        assert_close(&vectors.t().dot(&b).dot(&vectors), &Array2::eye(2), 1e-10);
    }
}
