//! Absorption-probability solver for an absorbing Markov chain.
//!
//! The matrix is partitioned into transient states T and absorbing states A,
//! with Q (T×T) and R (T×A) extracted from the row-stochastic transition
//! matrix. Absorption probabilities satisfy (I - Q)·B = R, the
//! fundamental-matrix identity B = (I - Q)⁻¹·R solved without forming the
//! inverse explicitly. A singular or ill-conditioned system is an error;
//! the caller owns the fallback policy.

use crate::config::Config;
use crate::errors::AttributionError;
use crate::matrix::TransitionMatrix;
use crate::states::StateSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveMethod {
    /// Gaussian elimination with partial pivoting on (I - Q).
    Direct,
    /// Neumann-series iteration B ← Q·B + R under an iteration budget.
    Iterative,
}

/// Numerical levers for one solve, read once from `Config`.
#[derive(Debug, Clone, Copy)]
pub struct SolverOptions {
    pub method: SolveMethod,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl SolverOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            method: cfg.solve_method,
            tolerance: cfg.tolerance,
            max_iterations: cfg.max_iterations,
        }
    }
}

/// Transient/absorbing split of the state indices, in index order.
#[derive(Debug, Clone)]
pub struct Partition {
    pub transient: Vec<usize>,
    pub absorbing: Vec<usize>,
}

/// Absorbing states are the Conversion/Null sentinels plus any state whose
/// row is a self-loop of probability 1 (a state with no exit).
pub fn partition(matrix: &TransitionMatrix, space: &StateSpace) -> Partition {
    let conversion = space.conversion_index();
    let null = space.null_index();
    let mut transient = Vec::new();
    let mut absorbing = Vec::new();
    for i in 0..matrix.n() {
        if i == conversion || i == null || matrix.is_identity_row(i) {
            absorbing.push(i);
        } else {
            transient.push(i);
        }
    }
    Partition {
        transient,
        absorbing,
    }
}

/// Absorption probabilities B (transient × absorbing), row-major.
#[derive(Debug, Clone)]
pub struct AbsorptionProbs {
    transient: Vec<usize>,
    absorbing: Vec<usize>,
    b: Vec<f64>,
}

impl AbsorptionProbs {
    /// Probability of eventual absorption into `into` starting from `from`.
    /// None when `from` is not transient or `into` is not absorbing.
    pub fn prob(&self, from: usize, into: usize) -> Option<f64> {
        let row = self.transient.iter().position(|&s| s == from)?;
        let col = self.absorbing.iter().position(|&s| s == into)?;
        Some(self.b[row * self.absorbing.len() + col])
    }

    pub fn transient(&self) -> &[usize] {
        &self.transient
    }

    pub fn absorbing(&self) -> &[usize] {
        &self.absorbing
    }
}

/// Solve for all absorption probabilities of `matrix`.
pub fn solve(
    matrix: &TransitionMatrix,
    space: &StateSpace,
    opts: &SolverOptions,
) -> Result<AbsorptionProbs, AttributionError> {
    let part = partition(matrix, space);
    let t = part.transient.len();
    let a = part.absorbing.len();
    if t == 0 {
        return Ok(AbsorptionProbs {
            transient: part.transient,
            absorbing: part.absorbing,
            b: Vec::new(),
        });
    }

    // Local position of each global index within the transient block.
    let mut local = vec![usize::MAX; matrix.n()];
    for (pos, &s) in part.transient.iter().enumerate() {
        local[s] = pos;
    }
    let mut absorbing_local = vec![usize::MAX; matrix.n()];
    for (pos, &s) in part.absorbing.iter().enumerate() {
        absorbing_local[s] = pos;
    }

    // Extract Q (t×t) and R (t×a) as dense blocks; t is small (stages ×
    // categories), so dense scratch is fine for either backend.
    let mut q = vec![0.0; t * t];
    let mut r = vec![0.0; t * a];
    for (row, &s) in part.transient.iter().enumerate() {
        for (col, p) in matrix.row(s) {
            if local[col] != usize::MAX {
                q[row * t + local[col]] = p;
            } else {
                r[row * a + absorbing_local[col]] = p;
            }
        }
    }

    let b = match opts.method {
        SolveMethod::Direct => solve_direct(&q, &r, t, a, opts.tolerance, space, &part)?,
        SolveMethod::Iterative => {
            solve_iterative(&q, &r, t, a, opts.tolerance, opts.max_iterations)?
        }
    };

    Ok(AbsorptionProbs {
        transient: part.transient,
        absorbing: part.absorbing,
        b,
    })
}

/// Gaussian elimination with partial pivoting on the augmented [(I-Q) | R].
fn solve_direct(
    q: &[f64],
    r: &[f64],
    t: usize,
    a: usize,
    tolerance: f64,
    space: &StateSpace,
    part: &Partition,
) -> Result<Vec<f64>, AttributionError> {
    let mut m = vec![0.0; t * t];
    for i in 0..t {
        for j in 0..t {
            m[i * t + j] = if i == j { 1.0 - q[i * t + j] } else { -q[i * t + j] };
        }
    }
    let mut b = r.to_vec();

    for k in 0..t {
        // Partial pivot: largest magnitude in column k at or below the diagonal.
        let mut pivot_row = k;
        let mut pivot_abs = m[k * t + k].abs();
        for i in (k + 1)..t {
            let v = m[i * t + k].abs();
            if v > pivot_abs {
                pivot_abs = v;
                pivot_row = i;
            }
        }
        if pivot_abs <= tolerance {
            let state = space.state(part.transient[k]).label();
            return Err(AttributionError::SingularSystem(format!(
                "(I - Q) pivot {:.3e} at column {} ({}) is below tolerance {:.1e}",
                pivot_abs, k, state, tolerance
            )));
        }
        if pivot_row != k {
            for j in 0..t {
                m.swap(k * t + j, pivot_row * t + j);
            }
            for j in 0..a {
                b.swap(k * a + j, pivot_row * a + j);
            }
        }

        for i in (k + 1)..t {
            let factor = m[i * t + k] / m[k * t + k];
            if factor == 0.0 {
                continue;
            }
            for j in k..t {
                m[i * t + j] -= factor * m[k * t + j];
            }
            for j in 0..a {
                b[i * a + j] -= factor * b[k * a + j];
            }
        }
    }

    // Back substitution, one RHS column at a time.
    for col in 0..a {
        for i in (0..t).rev() {
            let mut acc = b[i * a + col];
            for j in (i + 1)..t {
                acc -= m[i * t + j] * b[j * a + col];
            }
            b[i * a + col] = acc / m[i * t + i];
        }
    }

    Ok(b)
}

/// Row-sum tolerance for a completed absorption distribution.
pub const ABSORPTION_ROW_SUM_TOL: f64 = 1e-6;

/// Neumann-series iteration. For a substochastic Q the partial sums are
/// bounded, so a closed transient cycle does not diverge; it converges to a
/// limit whose rows sum below 1. Trapped mass is therefore checked after
/// convergence and reported as a singular system.
fn solve_iterative(
    q: &[f64],
    r: &[f64],
    t: usize,
    a: usize,
    tolerance: f64,
    max_iterations: usize,
) -> Result<Vec<f64>, AttributionError> {
    let mut b = r.to_vec();
    let mut next = vec![0.0; t * a];

    for _ in 0..max_iterations {
        // next = Q·B + R
        for i in 0..t {
            for col in 0..a {
                let mut acc = r[i * a + col];
                for j in 0..t {
                    let qij = q[i * t + j];
                    if qij != 0.0 {
                        acc += qij * b[j * a + col];
                    }
                }
                next[i * a + col] = acc;
            }
        }
        let delta = b
            .iter()
            .zip(next.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f64, f64::max);
        std::mem::swap(&mut b, &mut next);
        if delta <= tolerance {
            for i in 0..t {
                let row_sum: f64 = b[i * a..(i + 1) * a].iter().sum();
                if (row_sum - 1.0).abs() > ABSORPTION_ROW_SUM_TOL {
                    return Err(AttributionError::SingularSystem(format!(
                        "absorption row sums to {:.6}; probability mass is trapped in a transient cycle",
                        row_sum
                    )));
                }
            }
            return Ok(b);
        }
    }

    Err(AttributionError::SingularSystem(format!(
        "Neumann iteration did not converge within {} iterations",
        max_iterations
    )))
}

/// Overall baseline: probability of absorption into Conversion starting at
/// Start. An absorbing Start never reaches Conversion, so that case is a
/// legitimate zero rather than a solver failure.
pub fn start_conversion_probability(
    matrix: &TransitionMatrix,
    space: &StateSpace,
    opts: &SolverOptions,
) -> Result<f64, AttributionError> {
    let probs = solve(matrix, space, opts)?;
    Ok(probs
        .prob(space.start_index(), space.conversion_index())
        .unwrap_or(0.0))
}
