//! Transition-matrix estimation and counterfactual perturbation.
//!
//! Counts are accumulated as integers and normalized row-major, so identical
//! input yields bit-identical probabilities. Dense and sparse storage sit
//! behind one type; the backend is chosen once by configuration, never
//! inferred mid-run from data size.

use crate::errors::AttributionError;
use crate::logging::{log, obj, v_u64, Domain, Level};
use crate::paths::Path;
use crate::states::StateSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixBackend {
    Dense,
    Sparse,
}

/// Square row-stochastic matrix over the state-space indexing.
#[derive(Debug, Clone)]
pub enum TransitionMatrix {
    Dense {
        n: usize,
        /// Row-major n*n probabilities.
        data: Vec<f64>,
    },
    Sparse {
        n: usize,
        /// Per-row (column, probability) entries, sorted by column.
        rows: Vec<Vec<(usize, f64)>>,
    },
}

impl TransitionMatrix {
    pub fn n(&self) -> usize {
        match self {
            TransitionMatrix::Dense { n, .. } => *n,
            TransitionMatrix::Sparse { n, .. } => *n,
        }
    }

    pub fn backend(&self) -> MatrixBackend {
        match self {
            TransitionMatrix::Dense { .. } => MatrixBackend::Dense,
            TransitionMatrix::Sparse { .. } => MatrixBackend::Sparse,
        }
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        match self {
            TransitionMatrix::Dense { n, data } => data[i * n + j],
            TransitionMatrix::Sparse { rows, .. } => rows[i]
                .binary_search_by_key(&j, |&(col, _)| col)
                .map(|pos| rows[i][pos].1)
                .unwrap_or(0.0),
        }
    }

    /// Non-zero entries of row `i` as (column, probability), column order.
    pub fn row(&self, i: usize) -> Vec<(usize, f64)> {
        match self {
            TransitionMatrix::Dense { n, data } => data[i * n..(i + 1) * n]
                .iter()
                .enumerate()
                .filter(|(_, &p)| p != 0.0)
                .map(|(j, &p)| (j, p))
                .collect(),
            TransitionMatrix::Sparse { rows, .. } => rows[i].clone(),
        }
    }

    pub fn row_sum(&self, i: usize) -> f64 {
        self.row(i).iter().map(|&(_, p)| p).sum()
    }

    /// True when row `i` is exactly a self-loop of probability 1.
    pub fn is_identity_row(&self, i: usize) -> bool {
        let row = self.row(i);
        row.len() == 1 && row[0] == (i, 1.0)
    }

    /// Every row sums to 1 within `tol`.
    pub fn is_row_stochastic(&self, tol: f64) -> bool {
        (0..self.n()).all(|i| (self.row_sum(i) - 1.0).abs() <= tol)
    }

    fn from_counts(counts: Vec<Vec<(usize, u64)>>, n: usize, backend: MatrixBackend) -> Self {
        match backend {
            MatrixBackend::Dense => {
                let mut data = vec![0.0; n * n];
                for (i, row) in counts.iter().enumerate() {
                    let total: u64 = row.iter().map(|&(_, c)| c).sum();
                    if total == 0 {
                        // Never observed as a source: force an absorbing self-loop.
                        data[i * n + i] = 1.0;
                    } else {
                        for &(j, c) in row {
                            data[i * n + j] = c as f64 / total as f64;
                        }
                    }
                }
                TransitionMatrix::Dense { n, data }
            }
            MatrixBackend::Sparse => {
                let mut rows = Vec::with_capacity(n);
                for (i, row) in counts.into_iter().enumerate() {
                    let total: u64 = row.iter().map(|&(_, c)| c).sum();
                    if total == 0 {
                        rows.push(vec![(i, 1.0)]);
                    } else {
                        rows.push(
                            row.into_iter()
                                .map(|(j, c)| (j, c as f64 / total as f64))
                                .collect(),
                        );
                    }
                }
                TransitionMatrix::Sparse { n, rows }
            }
        }
    }
}

/// Aggregate all path transitions into the empirical transition matrix.
pub fn estimate(
    paths: &[Path],
    space: &StateSpace,
    backend: MatrixBackend,
) -> Result<TransitionMatrix, AttributionError> {
    if paths.is_empty() {
        return Err(AttributionError::EmptyStateSpace);
    }

    let n = space.len();
    // Sorted (column, count) per row keeps normalization order fixed.
    let mut counts: Vec<Vec<(usize, u64)>> = vec![Vec::new(); n];
    let mut transitions = 0u64;

    for path in paths {
        check_path_shape(path)?;
        for pair in path.states.windows(2) {
            let a = lookup(space, &pair[0], path)?;
            let b = lookup(space, &pair[1], path)?;
            match counts[a].binary_search_by_key(&b, |&(col, _)| col) {
                Ok(pos) => counts[a][pos].1 += 1,
                Err(pos) => counts[a].insert(pos, (b, 1)),
            }
            transitions += 1;
        }
    }

    log(
        Level::Debug,
        Domain::Matrix,
        "matrix.estimated",
        obj(&[
            ("states", v_u64(n as u64)),
            ("paths", v_u64(paths.len() as u64)),
            ("transitions", v_u64(transitions)),
        ]),
    );

    Ok(TransitionMatrix::from_counts(counts, n, backend))
}

fn check_path_shape(path: &Path) -> Result<(), AttributionError> {
    let states = &path.states;
    if states.first() != Some(&crate::states::State::Start) {
        return Err(AttributionError::Configuration(format!(
            "path for order {} does not begin with Start",
            path.order_id
        )));
    }
    match states.last() {
        Some(s) if s.is_absorbing() => {}
        _ => {
            return Err(AttributionError::Configuration(format!(
                "path for order {} does not end in an absorbing state",
                path.order_id
            )))
        }
    }
    if states[..states.len() - 1].iter().any(|s| s.is_absorbing()) {
        return Err(AttributionError::Configuration(format!(
            "path for order {} has an interior absorbing state",
            path.order_id
        )));
    }
    Ok(())
}

fn lookup(
    space: &StateSpace,
    state: &crate::states::State,
    path: &Path,
) -> Result<usize, AttributionError> {
    space.index_of(state).ok_or_else(|| {
        AttributionError::Configuration(format!(
            "path for order {} references state {} outside the state space",
            path.order_id,
            state.label()
        ))
    })
}

/// Counterfactual perturbation for a set of target states: every target's
/// outgoing edges are removed and all probability mass flowing into a target
/// is rerouted to Null. The base matrix is left untouched; rows stay
/// stochastic without renormalization.
pub fn perturb(base: &TransitionMatrix, targets: &[usize], null_idx: usize) -> TransitionMatrix {
    let n = base.n();
    let mut is_target = vec![false; n];
    for &t in targets {
        is_target[t] = true;
    }

    match base {
        TransitionMatrix::Dense { data, .. } => {
            let mut out = data.clone();
            for i in 0..n {
                let row = &mut out[i * n..(i + 1) * n];
                if is_target[i] {
                    row.fill(0.0);
                    row[null_idx] = 1.0;
                    continue;
                }
                let mut diverted = 0.0;
                for (j, p) in row.iter_mut().enumerate() {
                    if is_target[j] && *p != 0.0 {
                        diverted += *p;
                        *p = 0.0;
                    }
                }
                if diverted != 0.0 {
                    row[null_idx] += diverted;
                }
            }
            TransitionMatrix::Dense { n, data: out }
        }
        TransitionMatrix::Sparse { rows, .. } => {
            let mut out = Vec::with_capacity(n);
            for (i, row) in rows.iter().enumerate() {
                if is_target[i] {
                    out.push(vec![(null_idx, 1.0)]);
                    continue;
                }
                let mut diverted = 0.0;
                let mut kept: Vec<(usize, f64)> = Vec::with_capacity(row.len());
                for &(j, p) in row {
                    if is_target[j] {
                        diverted += p;
                    } else {
                        kept.push((j, p));
                    }
                }
                if diverted != 0.0 {
                    match kept.binary_search_by_key(&null_idx, |&(col, _)| col) {
                        Ok(pos) => kept[pos].1 += diverted,
                        Err(pos) => kept.insert(pos, (null_idx, diverted)),
                    }
                }
                out.push(kept);
            }
            TransitionMatrix::Sparse { n, rows: out }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::states::State;

    fn two_path_space() -> (Vec<Path>, StateSpace) {
        let paths = vec![
            Path {
                order_id: "a".to_string(),
                states: vec![State::Start, State::touch("A", "X"), State::Conversion],
            },
            Path {
                order_id: "b".to_string(),
                states: vec![State::Start, State::touch("A", "Y"), State::Null],
            },
        ];
        let space = StateSpace::from_paths(&paths, &Config::default()).unwrap();
        (paths, space)
    }

    #[test]
    fn estimation_splits_start_mass() {
        for backend in [MatrixBackend::Dense, MatrixBackend::Sparse] {
            let (paths, space) = two_path_space();
            let m = estimate(&paths, &space, backend).unwrap();
            let x = space.index_of(&State::touch("A", "X")).unwrap();
            let y = space.index_of(&State::touch("A", "Y")).unwrap();
            assert_eq!(m.get(space.start_index(), x), 0.5);
            assert_eq!(m.get(space.start_index(), y), 0.5);
            assert_eq!(m.get(x, space.conversion_index()), 1.0);
            assert_eq!(m.get(y, space.null_index()), 1.0);
        }
    }

    #[test]
    fn rows_are_stochastic_and_absorbing_rows_identity() {
        for backend in [MatrixBackend::Dense, MatrixBackend::Sparse] {
            let (paths, space) = two_path_space();
            let m = estimate(&paths, &space, backend).unwrap();
            assert!(m.is_row_stochastic(1e-6));
            assert!(m.is_identity_row(space.conversion_index()));
            assert!(m.is_identity_row(space.null_index()));
        }
    }

    #[test]
    fn start_has_no_inbound_probability() {
        let (paths, space) = two_path_space();
        let m = estimate(&paths, &space, MatrixBackend::Dense).unwrap();
        for i in 0..m.n() {
            assert_eq!(m.get(i, space.start_index()), 0.0);
        }
    }

    #[test]
    fn estimation_is_bit_identical_across_runs() {
        let (paths, space) = two_path_space();
        let a = estimate(&paths, &space, MatrixBackend::Dense).unwrap();
        let b = estimate(&paths, &space, MatrixBackend::Dense).unwrap();
        for i in 0..a.n() {
            for j in 0..a.n() {
                assert_eq!(a.get(i, j).to_bits(), b.get(i, j).to_bits());
            }
        }
    }

    #[test]
    fn dense_and_sparse_agree() {
        let (paths, space) = two_path_space();
        let d = estimate(&paths, &space, MatrixBackend::Dense).unwrap();
        let s = estimate(&paths, &space, MatrixBackend::Sparse).unwrap();
        for i in 0..d.n() {
            for j in 0..d.n() {
                assert_eq!(d.get(i, j), s.get(i, j));
            }
        }
    }

    #[test]
    fn malformed_path_is_rejected() {
        let (paths, space) = two_path_space();
        let bad = Path {
            order_id: "bad".to_string(),
            states: vec![State::touch("A", "X"), State::Conversion],
        };
        let mut all = paths;
        all.push(bad);
        assert!(matches!(
            estimate(&all, &space, MatrixBackend::Dense),
            Err(AttributionError::Configuration(_))
        ));
    }

    #[test]
    fn perturbation_reroutes_inbound_mass_to_null() {
        for backend in [MatrixBackend::Dense, MatrixBackend::Sparse] {
            let (paths, space) = two_path_space();
            let m = estimate(&paths, &space, backend).unwrap();
            let x = space.index_of(&State::touch("A", "X")).unwrap();
            let p = perturb(&m, &[x], space.null_index());

            // Start's 0.5 toward X now flows to Null instead.
            assert_eq!(p.get(space.start_index(), x), 0.0);
            assert_eq!(p.get(space.start_index(), space.null_index()), 0.5);
            // X's own transitions are gone; its row drains to Null.
            assert_eq!(p.get(x, space.conversion_index()), 0.0);
            assert_eq!(p.get(x, space.null_index()), 1.0);
            assert!(p.is_row_stochastic(1e-12));
            // Base is untouched.
            assert_eq!(m.get(space.start_index(), x), 0.5);
        }
    }
}
