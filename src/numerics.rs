//! Shared numerical routines: log-domain accumulation, dense Cholesky/LU
//! solves, a Jacobi eigensolver for covariance repair, and a banded SPD
//! solver for the MLPG normal equations.
//!
//! Everything here works on `ndarray` containers. The factorizations are
//! written out by hand rather than pulled from a LAPACK binding because the
//! matrices involved are either small (covariances, D ≲ 40) or banded with
//! half-bandwidth 2 (MLPG), and both cases are simple enough that carrying a
//! BLAS build dependency buys nothing.

use crate::error::{ModelError, Result};
use ndarray::{Array1, Array2};

/// Diagonal regularization added to linear systems before solving.
pub const DEFAULT_REGULARIZATION: f64 = 1e-6;

/// Variance floor used across the crate when repairing covariances.
pub const MIN_VARIANCE: f64 = 1e-6;

/// Numerically stable `log(Σ exp(vᵢ))`.
///
/// Returns `-inf` for an empty slice or when every entry is `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Lower-triangular Cholesky factor of a symmetric matrix, or `None` when
/// the matrix is not positive definite.
pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if n != a.ncols() {
        return None;
    }
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Solves `L Lᵀ x = b` given a lower Cholesky factor.
pub fn cholesky_solve(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * y[k];
        }
        y[i] = sum / l[[i, i]];
    }
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in i + 1..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Solves `A x = b` by LU decomposition with partial pivoting.
pub fn lu_solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return Err(ModelError::InvalidDimension {
            expected: n,
            actual: b.len(),
        });
    }
    let mut lu = a.clone();
    let mut x = b.clone();
    let mut perm: Vec<usize> = (0..n).collect();

    for col in 0..n {
        // Partial pivot on the largest remaining magnitude.
        let mut pivot_row = col;
        let mut pivot_val = lu[[col, col]].abs();
        for row in col + 1..n {
            if lu[[row, col]].abs() > pivot_val {
                pivot_val = lu[[row, col]].abs();
                pivot_row = row;
            }
        }
        if pivot_val < 1e-300 || !pivot_val.is_finite() {
            return Err(ModelError::NumericalFailure(format!(
                "singular matrix in LU solve (pivot {} at column {})",
                pivot_val, col
            )));
        }
        if pivot_row != col {
            for k in 0..n {
                let tmp = lu[[col, k]];
                lu[[col, k]] = lu[[pivot_row, k]];
                lu[[pivot_row, k]] = tmp;
            }
            perm.swap(col, pivot_row);
            x.swap(col, pivot_row);
        }
        for row in col + 1..n {
            let factor = lu[[row, col]] / lu[[col, col]];
            lu[[row, col]] = factor;
            for k in col + 1..n {
                lu[[row, k]] -= factor * lu[[col, k]];
            }
        }
    }

    // Forward substitution with the unit-lower factor.
    for i in 1..n {
        for k in 0..i {
            let delta = lu[[i, k]] * x[k];
            x[i] -= delta;
        }
    }
    // Back substitution with the upper factor.
    for i in (0..n).rev() {
        for k in i + 1..n {
            let delta = lu[[i, k]] * x[k];
            x[i] -= delta;
        }
        x[i] /= lu[[i, i]];
    }
    Ok(x)
}

/// Solves a symmetric positive-definite system, trying Cholesky first and
/// falling back to pivoted LU. Callers are expected to have added their
/// regularization to the diagonal already.
pub fn solve_spd(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    if let Some(l) = cholesky(a) {
        return Ok(cholesky_solve(&l, b));
    }
    lu_solve(a, b)
}

/// Inverse and log-determinant of a symmetric positive-definite matrix.
///
/// Attempts Cholesky directly; on failure the matrix is PSD-repaired, and as
/// a last resort escalating multiples of the identity are added. Surfaces
/// [`ModelError::NumericalFailure`] only once every repair path is spent.
pub fn spd_inverse(a: &Array2<f64>) -> Result<(Array2<f64>, f64)> {
    let n = a.nrows();
    let mut work = a.clone();
    let mut epsilon = MIN_VARIANCE;
    for attempt in 0..6 {
        if let Some(l) = cholesky(&work) {
            let log_det = 2.0 * (0..n).map(|i| l[[i, i]].ln()).sum::<f64>();
            let mut inv = Array2::<f64>::zeros((n, n));
            let mut unit = Array1::<f64>::zeros(n);
            for col in 0..n {
                unit.fill(0.0);
                unit[col] = 1.0;
                let x = cholesky_solve(&l, &unit);
                for row in 0..n {
                    inv[[row, col]] = x[row];
                }
            }
            return Ok((inv, log_det));
        }
        if attempt == 0 {
            repair_psd(&mut work, MIN_VARIANCE);
        } else {
            for i in 0..n {
                work[[i, i]] += epsilon;
            }
            epsilon *= 10.0;
        }
    }
    Err(ModelError::NumericalFailure(
        "covariance inversion failed after PSD repair and regularization".into(),
    ))
}

/// Eigenvalues and eigenvectors of a symmetric matrix via cyclic Jacobi
/// rotations. Returns `(eigenvalues, eigenvectors)` with eigenvectors in
/// columns. Intended for covariance-sized matrices.
pub fn symmetric_eigen(a: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = a.nrows();
    let mut m = a.clone();
    // Work on the symmetrized matrix so tiny asymmetries don't stall rotations.
    for i in 0..n {
        for j in 0..i {
            let avg = 0.5 * (m[[i, j]] + m[[j, i]]);
            m[[i, j]] = avg;
            m[[j, i]] = avg;
        }
    }
    let mut v = Array2::<f64>::eye(n);

    for _sweep in 0..100 {
        let mut off = 0.0;
        for i in 0..n {
            for j in i + 1..n {
                off += m[[i, j]] * m[[i, j]];
            }
        }
        if off < 1e-24 {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                if m[[p, q]].abs() < 1e-300 {
                    continue;
                }
                let theta = (m[[q, q]] - m[[p, p]]) / (2.0 * m[[p, q]]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let mkp = m[[k, p]];
                    let mkq = m[[k, q]];
                    m[[k, p]] = c * mkp - s * mkq;
                    m[[k, q]] = s * mkp + c * mkq;
                }
                for k in 0..n {
                    let mpk = m[[p, k]];
                    let mqk = m[[q, k]];
                    m[[p, k]] = c * mpk - s * mqk;
                    m[[q, k]] = s * mpk + c * mqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let eigenvalues = Array1::from_iter((0..n).map(|i| m[[i, i]]));
    (eigenvalues, v)
}

/// Projects a symmetric matrix onto the positive-definite cone by clamping
/// its eigenvalues to at least `min_eigenvalue`, reconstructing in place.
/// Falls back to adding `min_eigenvalue·I` when the eigensolver produced
/// non-finite output.
pub fn repair_psd(a: &mut Array2<f64>, min_eigenvalue: f64) {
    let n = a.nrows();
    let (mut eigenvalues, vectors) = symmetric_eigen(a);
    if eigenvalues.iter().any(|e| !e.is_finite()) || vectors.iter().any(|e| !e.is_finite()) {
        for i in 0..n {
            a[[i, i]] += min_eigenvalue;
        }
        return;
    }
    let mut clamped = false;
    for e in eigenvalues.iter_mut() {
        if *e < min_eigenvalue {
            *e = min_eigenvalue;
            clamped = true;
        }
    }
    if !clamped {
        return;
    }
    // A = V diag(λ) Vᵀ
    for i in 0..n {
        for j in 0..n {
            let mut sum = 0.0;
            for k in 0..n {
                sum += vectors[[i, k]] * eigenvalues[k] * vectors[[j, k]];
            }
            a[[i, j]] = sum;
        }
    }
}

/// Symmetric positive-definite banded matrix in lower-band storage:
/// `band[[i, k]]` holds `A[i, i - k]` for `k ≤ half_bandwidth`.
///
/// The MLPG normal equations have half-bandwidth 2 (the ΔΔ stencil spans
/// two frames each side), so a banded factorization keeps the solve linear
/// in trajectory length.
#[derive(Debug, Clone)]
pub struct BandedSpd {
    dim: usize,
    half_bandwidth: usize,
    band: Array2<f64>,
}

impl BandedSpd {
    pub fn new(dim: usize, half_bandwidth: usize) -> Self {
        Self {
            dim,
            half_bandwidth,
            band: Array2::zeros((dim, half_bandwidth + 1)),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Adds `value` to `A[i, j]` (and implicitly to `A[j, i]`). Entries
    /// outside the band are a caller bug.
    pub fn add(&mut self, i: usize, j: usize, value: f64) {
        let (row, col) = if i >= j { (i, j) } else { (j, i) };
        debug_assert!(row - col <= self.half_bandwidth);
        self.band[[row, row - col]] += value;
    }

    pub fn add_diagonal(&mut self, value: f64) {
        for i in 0..self.dim {
            self.band[[i, 0]] += value;
        }
    }

    fn get(&self, i: usize, j: usize) -> f64 {
        let (row, col) = if i >= j { (i, j) } else { (j, i) };
        if row - col > self.half_bandwidth {
            0.0
        } else {
            self.band[[row, row - col]]
        }
    }

    /// Solves `A x = b`, trying the banded Cholesky factorization first and
    /// falling back to a banded no-pivot LU. Both failing means the system
    /// stayed indefinite after regularization.
    pub fn solve(&self, b: &Array1<f64>) -> Result<(Array1<f64>, SolverKind)> {
        if b.len() != self.dim {
            return Err(ModelError::InvalidDimension {
                expected: self.dim,
                actual: b.len(),
            });
        }
        if let Some(x) = self.solve_cholesky(b) {
            return Ok((x, SolverKind::Cholesky));
        }
        let x = self.solve_lu(b)?;
        Ok((x, SolverKind::Lu))
    }

    fn solve_cholesky(&self, b: &Array1<f64>) -> Option<Array1<f64>> {
        let n = self.dim;
        let hb = self.half_bandwidth;
        let mut l = Array2::<f64>::zeros((n, hb + 1));
        for i in 0..n {
            let lo = i.saturating_sub(hb);
            for j in lo..=i {
                let mut sum = self.get(i, j);
                let klo = lo.max(j.saturating_sub(hb));
                for k in klo..j {
                    sum -= l[[i, i - k]] * l[[j, j - k]];
                }
                if i == j {
                    if sum <= 0.0 || !sum.is_finite() {
                        return None;
                    }
                    l[[i, 0]] = sum.sqrt();
                } else {
                    l[[i, i - j]] = sum / l[[j, 0]];
                }
            }
        }
        // L y = b
        let mut y = Array1::<f64>::zeros(n);
        for i in 0..n {
            let mut sum = b[i];
            for k in i.saturating_sub(hb)..i {
                sum -= l[[i, i - k]] * y[k];
            }
            y[i] = sum / l[[i, 0]];
        }
        // Lᵀ x = y
        let mut x = Array1::<f64>::zeros(n);
        for i in (0..n).rev() {
            let mut sum = y[i];
            for k in i + 1..(i + hb + 1).min(n) {
                sum -= l[[k, k - i]] * x[k];
            }
            x[i] = sum / l[[i, 0]];
        }
        Some(x)
    }

    /// Doolittle LU without pivoting; the band structure is preserved, and a
    /// vanishing pivot reports the system as singular.
    fn solve_lu(&self, b: &Array1<f64>) -> Result<Array1<f64>> {
        let n = self.dim;
        let hb = self.half_bandwidth;
        // Dense within the band: row i holds columns i-hb ..= i+hb.
        let width = 2 * hb + 1;
        let mut m = Array2::<f64>::zeros((n, width));
        for i in 0..n {
            for j in i.saturating_sub(hb)..(i + hb + 1).min(n) {
                m[[i, j + hb - i]] = self.get(i, j);
            }
        }
        let mut x = b.clone();
        for col in 0..n {
            let pivot = m[[col, hb]];
            if pivot.abs() < 1e-300 || !pivot.is_finite() {
                return Err(ModelError::NumericalFailure(format!(
                    "singular banded system (pivot {} at row {})",
                    pivot, col
                )));
            }
            for row in col + 1..(col + hb + 1).min(n) {
                let factor = m[[row, col + hb - row]] / pivot;
                if factor == 0.0 {
                    continue;
                }
                for j in col..(col + hb + 1).min(n) {
                    let val = m[[col, j + hb - col]];
                    m[[row, j + hb - row]] -= factor * val;
                }
                x[row] -= factor * x[col];
            }
        }
        for i in (0..n).rev() {
            let mut sum = x[i];
            for j in i + 1..(i + hb + 1).min(n) {
                sum -= m[[i, j + hb - i]] * x[j];
            }
            x[i] = sum / m[[i, hb]];
        }
        Ok(x)
    }
}

/// Which factorization produced a solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    Cholesky,
    Lu,
}
