use crate::operation::SolverStatus;
use thiserror::Error;

/// The error kinds produced by the investment engine.
#[derive(Debug, Error)]
pub enum Error {
    /// An invalid pool name or variable index was given.
    #[error("invalid name or index: {0}")]
    OutOfRange(String),

    /// A linear combination of linearizations violated the multiplier
    /// rules of the global pool.
    #[error("invalid combination of linearizations: {0}")]
    InvalidCombination(String),

    /// The operational models of two consecutive stages do not have the
    /// same block tree structure.
    #[error(
        "operational models at stages {previous_stage} and {stage} do not \
         have the same structure: {details}"
    )]
    StructureMismatch {
        previous_stage: usize,
        stage: usize,
        details: String,
    },

    /// An asset references a unit or network kind for which no
    /// linearization or investment rule is known.
    #[error("unsupported asset kind: {0}")]
    UnsupportedAssetKind(String),

    /// An unknown tuning parameter key was given.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// An inner solver returned without producing a primal solution.
    #[error("solver returned {status:?} without a primal solution at stage {stage}")]
    SolverFailure { stage: usize, status: SolverStatus },

    /// A required dual solution is missing during linearization.
    #[error("dual solution not available at stage {0}")]
    DualUnavailable(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
