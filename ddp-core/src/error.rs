//! Error types for the DDP solver.

use thiserror::Error;

/// Errors that can occur while setting up or running the optimizer.
#[derive(Error, Debug)]
pub enum DdpError {
    /// Invalid solve inputs (times, partitioning, initial state, settings)
    #[error("Invalid input: {0}")]
    BadInput(String),

    /// Caller-supplied controller is malformed or mismatched with partitions
    #[error("Invalid controller: {0}")]
    BadController(String),

    /// A forward rollout produced a non-finite state (or was cancelled)
    #[error("Rollout diverged: {0}")]
    RolloutDiverged(String),

    /// A constraint reported more active rows than the input dimension
    #[error("Constraint dimension overflow: {0}")]
    ConstraintDimOverflow(String),

    /// Debug-mode cache splice disagrees with the nominal trajectory
    #[error("Cache inconsistent: {0}")]
    CacheInconsistent(String),

    /// An LQ or Riccati sub-step produced non-finite output
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),
}

/// Result type for solver operations.
pub type DdpResult<T> = Result<T, DdpError>;
