//! Run configuration, passed explicitly into each entry point.
//!
//! No component reads ambient global state; the same process can run several
//! analyses with different configurations.

use std::collections::HashMap;

use crate::errors::AttributionError;
use crate::matrix::MatrixBackend;
use crate::removal::SingularPolicy;
use crate::solver::SolveMethod;

#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum encoded path length, Start and terminal included.
    pub min_path_length: usize,
    /// Maximum encoded path length.
    pub max_path_length: usize,
    /// Token substituted for missing or unparseable categories. Never empty.
    pub unknown_category: String,
    /// Raw label to dimension value mapping. Empty means identity; when
    /// non-empty, an unmapped label becomes `unknown_category`.
    pub category_mapping: HashMap<String, String>,
    /// Dense or sparse transition-matrix storage, fixed at construction.
    pub matrix_backend: MatrixBackend,
    /// Direct LU solve or Neumann-series iteration.
    pub solve_method: SolveMethod,
    /// Pivot / convergence tolerance for the absorption solver.
    pub tolerance: f64,
    /// Iteration budget when `solve_method` is iterative.
    pub max_iterations: usize,
    /// What to record for a target whose solve fails.
    pub singular_policy: SingularPolicy,
    /// Worker threads for per-target solves. 0 means one per CPU.
    pub workers: usize,
    /// Optional wall-clock budget for one dimension's target batch.
    pub batch_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_path_length: 2,
            max_path_length: 10,
            unknown_category: "UNKNOWN".to_string(),
            category_mapping: HashMap::new(),
            matrix_backend: MatrixBackend::Dense,
            solve_method: SolveMethod::Direct,
            tolerance: 1e-9,
            max_iterations: 10_000,
            singular_policy: SingularPolicy::Skip,
            workers: 0,
            batch_timeout_secs: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_path_length: env_parse("MIN_PATH_LEN", defaults.min_path_length),
            max_path_length: env_parse("MAX_PATH_LEN", defaults.max_path_length),
            unknown_category: std::env::var("UNKNOWN_CATEGORY")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.unknown_category),
            category_mapping: std::env::var("CATEGORY_MAPPING")
                .map(|v| parse_mapping(&v))
                .unwrap_or(defaults.category_mapping),
            matrix_backend: match std::env::var("MATRIX_BACKEND").as_deref() {
                Ok("sparse") => MatrixBackend::Sparse,
                Ok("dense") => MatrixBackend::Dense,
                _ => defaults.matrix_backend,
            },
            solve_method: match std::env::var("SOLVE_METHOD").as_deref() {
                Ok("iterative") => SolveMethod::Iterative,
                Ok("direct") => SolveMethod::Direct,
                _ => defaults.solve_method,
            },
            tolerance: env_parse("SOLVE_TOL", defaults.tolerance),
            max_iterations: env_parse("SOLVE_MAX_ITERS", defaults.max_iterations),
            singular_policy: match std::env::var("SINGULAR_POLICY").as_deref() {
                Ok("zero") => SingularPolicy::ZeroContribution,
                Ok("skip") => SingularPolicy::Skip,
                _ => defaults.singular_policy,
            },
            workers: env_parse("WORKERS", defaults.workers),
            batch_timeout_secs: std::env::var("BATCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    /// Worker count with the 0 = per-CPU default resolved.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn validate(&self) -> Result<(), AttributionError> {
        if self.min_path_length < 2 {
            return Err(AttributionError::Configuration(format!(
                "min_path_length {} < 2; a path needs at least Start and a terminal state",
                self.min_path_length
            )));
        }
        if self.min_path_length > self.max_path_length {
            return Err(AttributionError::Configuration(format!(
                "min_path_length {} > max_path_length {}",
                self.min_path_length, self.max_path_length
            )));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(AttributionError::Configuration(format!(
                "tolerance must be finite and positive, got {}",
                self.tolerance
            )));
        }
        if self.solve_method == SolveMethod::Iterative && self.max_iterations == 0 {
            return Err(AttributionError::Configuration(
                "iterative solve requires max_iterations >= 1".to_string(),
            ));
        }
        if self.unknown_category.trim().is_empty() {
            return Err(AttributionError::Configuration(
                "unknown_category token must be non-empty".to_string(),
            ));
        }
        if self
            .category_mapping
            .iter()
            .any(|(raw, mapped)| raw.trim().is_empty() || mapped.trim().is_empty())
        {
            return Err(AttributionError::Configuration(
                "category_mapping entries must have non-empty labels on both sides".to_string(),
            ));
        }
        Ok(())
    }
}

/// `raw=mapped` pairs separated by commas, e.g. "门店=STORE,总部=HQ".
/// Malformed pairs are skipped.
fn parse_mapping(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (from, to) = pair.split_once('=')?;
            let (from, to) = (from.trim(), to.trim());
            if from.is_empty() || to.is_empty() {
                return None;
            }
            Some((from.to_string(), to.to_string()))
        })
        .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
