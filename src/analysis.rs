//! Full attribution run: encode, estimate, solve the baseline, then fan the
//! removal-effect computation out per dimension.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::errors::AttributionError;
use crate::logging::{log, obj, v_num, v_u64, Domain, Level};
use crate::matrix::estimate;
use crate::parallel::run_targets;
use crate::paths::{encode_orders, DroppedOrder, Order, Path};
use crate::removal::{finalize_report, AttributionReport, Target};
use crate::solver::{start_conversion_probability, SolverOptions};
use crate::states::{State, StateSpace};

/// One categorical axis to attribute over. Dimensions are analyzed
/// independently over the same path data.
#[derive(Debug, Clone)]
pub struct DimensionSpec {
    pub name: String,
    pub targets: Vec<Target>,
}

impl DimensionSpec {
    /// Dimension with one whole-category target per value.
    pub fn categories(name: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            targets: values
                .iter()
                .map(|v| Target::Category(v.to_string()))
                .collect(),
        }
    }
}

/// Event volume for one funnel stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageVolume {
    pub stage: String,
    pub events: u64,
    /// Volume relative to the first stage. Can exceed 1.0 when a stage has
    /// repeated events per order; reported as observed, never "fixed".
    pub rate_vs_first: f64,
}

/// Stage-volume summary over the encoded paths.
#[derive(Debug, Clone, Serialize)]
pub struct FunnelSummary {
    pub orders: usize,
    pub converted: u64,
    pub conversion_rate: f64,
    pub stages: Vec<StageVolume>,
}

pub fn funnel_summary(paths: &[Path], space: &StateSpace) -> FunnelSummary {
    let mut counts: Vec<u64> = vec![0; space.stage_order().len()];
    let mut converted = 0u64;
    for path in paths {
        if path.converted() {
            converted += 1;
        }
        for state in &path.states {
            if let State::Touch { stage, .. } = state {
                if let Some(pos) = space.stage_order().iter().position(|s| s == stage) {
                    counts[pos] += 1;
                }
            }
        }
    }
    let first = counts.first().copied().unwrap_or(0);
    let stages = space
        .stage_order()
        .iter()
        .zip(&counts)
        .map(|(stage, &events)| StageVolume {
            stage: stage.clone(),
            events,
            rate_vs_first: if first > 0 {
                events as f64 / first as f64
            } else {
                0.0
            },
        })
        .collect();
    FunnelSummary {
        orders: paths.len(),
        converted,
        conversion_rate: if paths.is_empty() {
            0.0
        } else {
            converted as f64 / paths.len() as f64
        },
        stages,
    }
}

/// Complete output of one analysis run.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRun {
    pub baseline: f64,
    pub funnel: FunnelSummary,
    pub reports: Vec<AttributionReport>,
    pub dropped: Vec<DroppedOrder>,
}

impl AnalysisRun {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Run the whole pipeline over cleaned orders.
///
/// Setup failures (configuration, empty state space, a singular base
/// matrix) abort the run; per-order and per-target failures are absorbed
/// and reported in `dropped` and each report's `skipped`/status fields.
pub fn analyze(
    orders: &[Order],
    dimensions: &[DimensionSpec],
    cfg: &Config,
) -> Result<AnalysisRun, AttributionError> {
    cfg.validate()?;

    log(
        Level::Info,
        Domain::System,
        "run.start",
        obj(&[
            ("orders", v_u64(orders.len() as u64)),
            ("dimensions", v_u64(dimensions.len() as u64)),
        ]),
    );

    let (paths, dropped) = encode_orders(orders, cfg);
    if paths.is_empty() {
        return Err(AttributionError::EmptyStateSpace);
    }

    let space = StateSpace::from_paths(&paths, cfg)?;
    let base = estimate(&paths, &space, cfg.matrix_backend)?;
    let opts = SolverOptions::from_config(cfg);
    // A singular base matrix is a global failure, not a per-target one.
    let baseline = start_conversion_probability(&base, &space, &opts)?;
    let funnel = funnel_summary(&paths, &space);

    let base = Arc::new(base);
    let space = Arc::new(space);
    let workers = cfg.effective_workers();
    let timeout = cfg.batch_timeout_secs.map(Duration::from_secs);

    let mut reports = Vec::with_capacity(dimensions.len());
    for dim in dimensions {
        let targets = Arc::new(dim.targets.clone());
        let outcomes = run_targets(
            Arc::clone(&base),
            Arc::clone(&space),
            targets,
            baseline,
            opts,
            workers,
            timeout,
        );
        reports.push(finalize_report(
            &dim.name,
            baseline,
            outcomes,
            cfg.singular_policy,
        ));
    }

    log(
        Level::Info,
        Domain::System,
        "run.finished",
        obj(&[
            ("baseline", v_num(baseline)),
            ("paths", v_u64(funnel.orders as u64)),
            ("reports", v_u64(reports.len() as u64)),
            ("dropped", v_u64(dropped.len() as u64)),
        ]),
    );

    Ok(AnalysisRun {
        baseline,
        funnel,
        reports,
        dropped,
    })
}
