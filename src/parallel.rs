//! Worker pool for per-target removal-effect solves.
//!
//! Targets are independent given the read-only base matrix, so workers pull
//! indices from a shared cursor with no locking on the data itself. Results
//! arrive over a channel in arbitrary order and are re-keyed by target
//! index before aggregation; presentation order is applied later.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::AttributionError;
use crate::matrix::TransitionMatrix;
use crate::removal::{removal_effect, Target, TargetOutcome};
use crate::solver::SolverOptions;
use crate::states::StateSpace;

/// Run every target's removal effect, `workers` at a time.
///
/// With a timeout, targets unresolved at the deadline are recorded as
/// singular-system failures and the workers still computing them are left
/// to finish detached; their late results are discarded. Without one, all
/// workers are joined before returning. Either way every target appears in
/// the output exactly once.
pub fn run_targets(
    base: Arc<TransitionMatrix>,
    space: Arc<StateSpace>,
    targets: Arc<Vec<Target>>,
    baseline: f64,
    opts: SolverOptions,
    workers: usize,
    timeout: Option<Duration>,
) -> Vec<(Target, Result<TargetOutcome, AttributionError>)> {
    let n = targets.len();
    if n == 0 {
        return Vec::new();
    }
    let pool = workers.clamp(1, n);

    let cursor = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel::<(usize, Result<TargetOutcome, AttributionError>)>();

    let mut handles = Vec::with_capacity(pool);
    for _ in 0..pool {
        let base = Arc::clone(&base);
        let space = Arc::clone(&space);
        let targets = Arc::clone(&targets);
        let cursor = Arc::clone(&cursor);
        let tx = tx.clone();
        handles.push(thread::spawn(move || loop {
            let idx = cursor.fetch_add(1, Ordering::SeqCst);
            if idx >= targets.len() {
                break;
            }
            let result = removal_effect(&base, &space, &targets[idx], baseline, &opts);
            // Receiver may be gone after a timeout; a late result is dropped.
            if tx.send((idx, result)).is_err() {
                break;
            }
        }));
    }
    drop(tx);

    let mut slots: Vec<Option<Result<TargetOutcome, AttributionError>>> =
        (0..n).map(|_| None).collect();
    let mut received = 0usize;

    match timeout {
        None => {
            while let Ok((idx, result)) = rx.recv() {
                slots[idx] = Some(result);
                received += 1;
            }
            for handle in handles {
                let _ = handle.join();
            }
        }
        Some(budget) => {
            let deadline = Instant::now() + budget;
            while received < n {
                let remaining = match deadline.checked_duration_since(Instant::now()) {
                    Some(d) if !d.is_zero() => d,
                    _ => break,
                };
                match rx.recv_timeout(remaining) {
                    Ok((idx, result)) => {
                        slots[idx] = Some(result);
                        received += 1;
                    }
                    Err(_) => break,
                }
            }
            // Unfinished workers stay detached; dropping the receiver makes
            // their sends fail and they wind down on their own.
        }
    }

    targets
        .iter()
        .zip(slots)
        .map(|(target, slot)| {
            let result = slot.unwrap_or_else(|| {
                Err(AttributionError::SingularSystem(format!(
                    "target {} timed out",
                    target.label()
                )))
            });
            (target.clone(), result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::matrix::{estimate, MatrixBackend};
    use crate::paths::Path;
    use crate::solver::{start_conversion_probability, SolveMethod};
    use crate::states::State;

    fn opts() -> SolverOptions {
        SolverOptions {
            method: SolveMethod::Direct,
            tolerance: 1e-9,
            max_iterations: 10_000,
        }
    }

    fn fixture() -> (Arc<StateSpace>, Arc<TransitionMatrix>, f64) {
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
        let baseline = start_conversion_probability(&m, &space, &opts()).unwrap();
        (Arc::new(space), Arc::new(m), baseline)
    }

    #[test]
    fn every_target_appears_exactly_once() {
        let (space, base, baseline) = fixture();
        let targets = Arc::new(vec![
            Target::Category("X".to_string()),
            Target::Category("Y".to_string()),
            Target::Category("absent".to_string()),
        ]);
        let results = run_targets(base, space, Arc::clone(&targets), baseline, opts(), 4, None);
        assert_eq!(results.len(), 3);
        for (i, (target, result)) in results.iter().enumerate() {
            assert_eq!(target, &targets[i]);
            assert!(result.is_ok());
        }
    }

    #[test]
    fn parallel_matches_serial() {
        let (space, base, baseline) = fixture();
        let targets = Arc::new(vec![
            Target::Category("X".to_string()),
            Target::Category("Y".to_string()),
        ]);
        let parallel = run_targets(
            Arc::clone(&base),
            Arc::clone(&space),
            Arc::clone(&targets),
            baseline,
            opts(),
            2,
            None,
        );
        for (target, result) in parallel {
            let serial = removal_effect(&base, &space, &target, baseline, &opts()).unwrap();
            let got = result.unwrap();
            assert_eq!(got.effect.to_bits(), serial.effect.to_bits());
            assert_eq!(got.perturbed.to_bits(), serial.perturbed.to_bits());
        }
    }

    #[test]
    fn zero_budget_times_every_target_out() {
        let (space, base, baseline) = fixture();
        let targets = Arc::new(vec![Target::Category("X".to_string())]);
        let results = run_targets(
            base,
            space,
            targets,
            baseline,
            opts(),
            1,
            Some(Duration::from_secs(0)),
        );
        assert_eq!(results.len(), 1);
        match &results[0].1 {
            Err(AttributionError::SingularSystem(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout as singular system, got {:?}", other),
        }
    }

    #[test]
    fn generous_budget_resolves_all_targets() {
        let (space, base, baseline) = fixture();
        let targets = Arc::new(vec![
            Target::Category("X".to_string()),
            Target::Category("Y".to_string()),
        ]);
        let results = run_targets(
            base,
            space,
            targets,
            baseline,
            opts(),
            2,
            Some(Duration::from_secs(30)),
        );
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }
}
