//! Removal-effect computation and attribution normalization.
//!
//! For each target the base matrix is perturbed (traffic diverted to Null),
//! the perturbed conversion probability re-solved, and the drop against the
//! baseline recorded. One target's numerical failure never aborts the batch;
//! it is zeroed or skipped per the configured policy, and skipped targets
//! stay distinguishable from genuinely zero-effect ones.

use serde::Serialize;

use crate::errors::AttributionError;
use crate::logging::{log, obj, v_num, v_str, v_u64, Domain, Level};
use crate::matrix::{perturb, TransitionMatrix};
use crate::solver::{start_conversion_probability, SolverOptions};
use crate::states::StateSpace;

/// What to record for a target whose absorption solve fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingularPolicy {
    /// Omit the target from the rows; it appears in the skipped list.
    Skip,
    /// Keep the target with an explicit zero effect.
    ZeroContribution,
}

/// One attribution target: a whole category (all of its states across
/// stages) or a single (stage, category) node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Category(String),
    Node { stage: String, category: String },
}

impl Target {
    /// Report label. Node targets render as `category@stage` so they stay
    /// distinguishable from a raw category label containing the state
    /// separator.
    pub fn label(&self) -> String {
        match self {
            Target::Category(cat) => cat.clone(),
            Target::Node { stage, category } => format!("{}@{}", category, stage),
        }
    }

    /// State indices this target removes.
    pub fn state_indices(&self, space: &StateSpace) -> Vec<usize> {
        match self {
            Target::Category(cat) => space.category_states(cat).to_vec(),
            Target::Node { stage, category } => space
                .index_of(&crate::states::State::touch(stage, category))
                .into_iter()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Solved,
    /// Solve failed; effect recorded as zero under `ZeroContribution`.
    ZeroedSingular,
}

/// Raw per-target result before normalization.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub target: Target,
    pub perturbed: f64,
    pub effect: f64,
}

/// Perturb the base matrix for one target and re-solve.
///
/// A target with no states in the space has zero path traffic; its removal
/// changes nothing and the effect is exactly zero.
pub fn removal_effect(
    base: &TransitionMatrix,
    space: &StateSpace,
    target: &Target,
    baseline: f64,
    opts: &SolverOptions,
) -> Result<TargetOutcome, AttributionError> {
    let indices = target.state_indices(space);
    if indices.is_empty() {
        return Ok(TargetOutcome {
            target: target.clone(),
            perturbed: baseline,
            effect: 0.0,
        });
    }
    let perturbed_matrix = perturb(base, &indices, space.null_index());
    let perturbed = start_conversion_probability(&perturbed_matrix, space, opts)?;
    Ok(TargetOutcome {
        target: target.clone(),
        perturbed,
        effect: baseline - perturbed,
    })
}

/// One row of the final attribution table.
#[derive(Debug, Clone, Serialize)]
pub struct AttributionRow {
    pub target: String,
    pub baseline: f64,
    pub perturbed: f64,
    /// baseline - perturbed; negative means the target suppresses conversion.
    pub effect: f64,
    /// Effect over the sum of positive effects, in percent. Zero when no
    /// positive effects exist.
    pub share_pct: f64,
    pub status: TargetStatus,
}

/// Target omitted from the rows under the skip policy.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedTarget {
    pub target: String,
    pub reason: String,
}

/// Attribution table for one dimension, sorted by effect descending.
#[derive(Debug, Clone, Serialize)]
pub struct AttributionReport {
    pub dimension: String,
    pub baseline: f64,
    pub rows: Vec<AttributionRow>,
    pub skipped: Vec<SkippedTarget>,
}

impl AttributionReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Simple tabular rendering matching the report columns.
    pub fn to_csv_string(&self) -> String {
        let mut out = String::from("target,baseline,perturbed,effect,share_pct,status\n");
        for row in &self.rows {
            let status = match row.status {
                TargetStatus::Solved => "solved",
                TargetStatus::ZeroedSingular => "zeroed_singular",
            };
            out.push_str(&format!(
                "{},{:.6},{:.6},{:.6},{:.4},{}\n",
                row.target, row.baseline, row.perturbed, row.effect, row.share_pct, status
            ));
        }
        out
    }
}

/// Fold per-target outcomes into the final report: apply the singular
/// policy, normalize shares over positive effects, and order rows by effect
/// descending (label ascending on ties, for reproducible output).
pub fn finalize_report(
    dimension: &str,
    baseline: f64,
    outcomes: Vec<(Target, Result<TargetOutcome, AttributionError>)>,
    policy: SingularPolicy,
) -> AttributionReport {
    let mut rows = Vec::with_capacity(outcomes.len());
    let mut skipped = Vec::new();

    for (target, result) in outcomes {
        match result {
            Ok(outcome) => rows.push(AttributionRow {
                target: outcome.target.label(),
                baseline,
                perturbed: outcome.perturbed,
                effect: outcome.effect,
                share_pct: 0.0,
                status: TargetStatus::Solved,
            }),
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Attribution,
                    "target.failed",
                    obj(&[
                        ("dimension", v_str(dimension)),
                        ("target", v_str(&target.label())),
                        ("reason", v_str(&err.to_string())),
                    ]),
                );
                match policy {
                    SingularPolicy::Skip => skipped.push(SkippedTarget {
                        target: target.label(),
                        reason: err.to_string(),
                    }),
                    SingularPolicy::ZeroContribution => rows.push(AttributionRow {
                        target: target.label(),
                        baseline,
                        perturbed: baseline,
                        effect: 0.0,
                        share_pct: 0.0,
                        status: TargetStatus::ZeroedSingular,
                    }),
                }
            }
        }
    }

    let positive_sum: f64 = rows.iter().map(|r| r.effect.max(0.0)).sum();
    if positive_sum > 0.0 {
        for row in rows.iter_mut() {
            row.share_pct = row.effect / positive_sum * 100.0;
        }
    }

    rows.sort_by(|a, b| {
        b.effect
            .partial_cmp(&a.effect)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.target.cmp(&b.target))
    });

    log(
        Level::Info,
        Domain::Attribution,
        "dimension.finalized",
        obj(&[
            ("dimension", v_str(dimension)),
            ("baseline", v_num(baseline)),
            ("rows", v_u64(rows.len() as u64)),
            ("skipped", v_u64(skipped.len() as u64)),
        ]),
    );

    AttributionReport {
        dimension: dimension.to_string(),
        baseline,
        rows,
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::matrix::{estimate, MatrixBackend};
    use crate::paths::Path;
    use crate::solver::{SolveMethod, SolverOptions};
    use crate::states::State;

    fn opts() -> SolverOptions {
        SolverOptions {
            method: SolveMethod::Direct,
            tolerance: 1e-9,
            max_iterations: 10_000,
        }
    }

    fn split_fixture() -> (StateSpace, TransitionMatrix) {
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
        let m = estimate(&paths, &space, MatrixBackend::Dense).unwrap();
        (space, m)
    }

    #[test]
    fn full_traffic_target_claims_entire_baseline() {
        // Every converting path passes through X; baseline is 1.0.
        let paths = vec![Path {
            order_id: "a".to_string(),
            states: vec![State::Start, State::touch("A", "X"), State::Conversion],
        }];
        let space = StateSpace::from_paths(&paths, &Config::default()).unwrap();
        let m = estimate(&paths, &space, MatrixBackend::Dense).unwrap();
        let baseline = start_conversion_probability(&m, &space, &opts()).unwrap();
        assert!((baseline - 1.0).abs() < 1e-12);

        let outcome = removal_effect(
            &m,
            &space,
            &Target::Category("X".to_string()),
            baseline,
            &opts(),
        )
        .unwrap();
        assert!((outcome.perturbed - 0.0).abs() < 1e-12);
        assert!((outcome.effect - 1.0).abs() < 1e-12);
    }

    #[test]
    fn split_paths_attribute_only_the_converting_branch() {
        let (space, m) = split_fixture();
        let baseline = start_conversion_probability(&m, &space, &opts()).unwrap();
        assert!((baseline - 0.5).abs() < 1e-12);

        let x = removal_effect(&m, &space, &Target::Category("X".to_string()), baseline, &opts())
            .unwrap();
        assert!((x.perturbed - 0.0).abs() < 1e-12);
        assert!((x.effect - 0.5).abs() < 1e-12);

        let y = removal_effect(&m, &space, &Target::Category("Y".to_string()), baseline, &opts())
            .unwrap();
        assert!((y.perturbed - 0.5).abs() < 1e-12);
        assert!(y.effect.abs() < 1e-12);
    }

    #[test]
    fn absent_target_has_zero_effect() {
        let (space, m) = split_fixture();
        let baseline = start_conversion_probability(&m, &space, &opts()).unwrap();
        let outcome = removal_effect(
            &m,
            &space,
            &Target::Category("NOWHERE".to_string()),
            baseline,
            &opts(),
        )
        .unwrap();
        assert_eq!(outcome.effect, 0.0);
        assert_eq!(outcome.perturbed, baseline);
    }

    #[test]
    fn node_labels_do_not_collide_with_state_like_category_labels() {
        let node = Target::Node {
            stage: "Wish".to_string(),
            category: "HQ".to_string(),
        };
        let lookalike = Target::Category("Wish::HQ".to_string());
        assert_eq!(node.label(), "HQ@Wish");
        assert_ne!(node.label(), lookalike.label());
    }

    #[test]
    fn node_target_removes_a_single_state() {
        let (space, m) = split_fixture();
        let baseline = start_conversion_probability(&m, &space, &opts()).unwrap();
        let outcome = removal_effect(
            &m,
            &space,
            &Target::Node {
                stage: "A".to_string(),
                category: "X".to_string(),
            },
            baseline,
            &opts(),
        )
        .unwrap();
        assert!((outcome.effect - 0.5).abs() < 1e-12);
    }

    #[test]
    fn shares_sum_to_hundred_for_positive_effects() {
        let outcomes = vec![
            (
                Target::Category("X".to_string()),
                Ok(TargetOutcome {
                    target: Target::Category("X".to_string()),
                    perturbed: 0.2,
                    effect: 0.3,
                }),
            ),
            (
                Target::Category("Y".to_string()),
                Ok(TargetOutcome {
                    target: Target::Category("Y".to_string()),
                    perturbed: 0.4,
                    effect: 0.1,
                }),
            ),
        ];
        let report = finalize_report("channel", 0.5, outcomes, SingularPolicy::Skip);
        let total: f64 = report.rows.iter().map(|r| r.share_pct).sum();
        assert!((total - 100.0).abs() < 1e-9);
        assert!((report.rows[0].share_pct - 75.0).abs() < 1e-9);
        // Sorted by effect descending.
        assert_eq!(report.rows[0].target, "X");
    }

    #[test]
    fn no_positive_effects_means_zero_shares() {
        let outcomes = vec![(
            Target::Category("X".to_string()),
            Ok(TargetOutcome {
                target: Target::Category("X".to_string()),
                perturbed: 0.6,
                effect: -0.1,
            }),
        )];
        let report = finalize_report("channel", 0.5, outcomes, SingularPolicy::Skip);
        assert_eq!(report.rows[0].share_pct, 0.0);
    }

    #[test]
    fn skip_policy_keeps_failures_out_of_rows_but_visible() {
        let outcomes = vec![(
            Target::Category("BAD".to_string()),
            Err(AttributionError::SingularSystem("test".to_string())),
        )];
        let report = finalize_report("channel", 0.5, outcomes, SingularPolicy::Skip);
        assert!(report.rows.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].target, "BAD");
    }

    #[test]
    fn zero_policy_flags_failures_distinct_from_real_zeros() {
        let outcomes = vec![
            (
                Target::Category("BAD".to_string()),
                Err(AttributionError::SingularSystem("test".to_string())),
            ),
            (
                Target::Category("QUIET".to_string()),
                Ok(TargetOutcome {
                    target: Target::Category("QUIET".to_string()),
                    perturbed: 0.5,
                    effect: 0.0,
                }),
            ),
        ];
        let report = finalize_report("channel", 0.5, outcomes, SingularPolicy::ZeroContribution);
        assert_eq!(report.rows.len(), 2);
        let bad = report.rows.iter().find(|r| r.target == "BAD").unwrap();
        let quiet = report.rows.iter().find(|r| r.target == "QUIET").unwrap();
        assert_eq!(bad.status, TargetStatus::ZeroedSingular);
        assert_eq!(quiet.status, TargetStatus::Solved);
        assert_eq!(bad.effect, 0.0);
    }

    #[test]
    fn csv_rendering_has_header_and_rows() {
        let outcomes = vec![(
            Target::Category("X".to_string()),
            Ok(TargetOutcome {
                target: Target::Category("X".to_string()),
                perturbed: 0.2,
                effect: 0.3,
            }),
        )];
        let report = finalize_report("channel", 0.5, outcomes, SingularPolicy::Skip);
        let csv = report.to_csv_string();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "target,baseline,perturbed,effect,share_pct,status"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("X,0.500000,0.200000,0.300000,100.0000,solved"));
    }
}
