//! Error types for the attribution core.
//!
//! Failures local to one order or one attribution target are absorbed by the
//! caller under a configured policy; failures in global setup abort the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttributionError {
    /// Inconsistent state-space or bounds setup. Fatal, raised before any
    /// computation is attempted.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// One order's encoded path violates the configured length bounds.
    /// Local: the order is excluded, the batch continues.
    #[error("path for order {order_id} has {len} states, outside bounds [{min}, {max}]")]
    PathLength {
        order_id: String,
        len: usize,
        min: usize,
        max: usize,
    },

    /// (I - Q) is singular or ill-conditioned beyond tolerance, or an
    /// iterative solve exhausted its budget. Local to one target.
    #[error("singular system: {0}")]
    SingularSystem(String),

    /// No valid paths at all; nothing to attribute. Fatal.
    #[error("empty state space: no valid paths")]
    EmptyStateSpace,
}

impl AttributionError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AttributionError::Configuration(_) | AttributionError::EmptyStateSpace
        )
    }
}
