//! Markov removal-effect attribution over a multi-stage purchase funnel.
//!
//! Each order's stage events become a path through a finite state space; an
//! absorbing-chain transition model is fit over all paths; and for every
//! attribution target the model is counterfactually perturbed (the target's
//! traffic diverted to the Null state) to measure the drop in overall
//! conversion probability. Ingestion, cleaning and report rendering live
//! outside this crate; it takes cleaned orders and returns attribution
//! tables.

pub mod analysis;
pub mod config;
pub mod errors;
pub mod logging;
pub mod matrix;
pub mod parallel;
pub mod paths;
pub mod removal;
pub mod solver;
pub mod states;

pub use analysis::{analyze, AnalysisRun, DimensionSpec, FunnelSummary};
pub use config::Config;
pub use errors::AttributionError;
pub use matrix::{MatrixBackend, TransitionMatrix};
pub use paths::{Order, Outcome, Path, StageEvent};
pub use removal::{AttributionReport, SingularPolicy, Target, TargetStatus};
pub use solver::{SolveMethod, SolverOptions};
pub use states::{State, StateSpace};
