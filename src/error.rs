use thiserror::Error;

/// Why a single function was rejected. Recorded on the function, never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, serde::Serialize)]
pub enum FunctionError {
    #[error("invalid instruction could not be repaired")]
    InvalidInstruction,
    #[error("unrecognized interrupt")]
    UnknownInterrupt,
    #[error("ran past the end of the region without a truncation point")]
    FunctionSizeThresholdReached,
    #[error("region contained no instructions")]
    EmptyChunk,
}

/// Conditions that abort the whole analysis.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("function at 0x{address:x} exceeded the limit of {limit} regions")]
    RegionLimitExceeded { address: u64, limit: usize },
    #[error("import address 0x{address:x} was registered as a function candidate")]
    ImportIsFunctionCandidate { address: u64 },
    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T, E = AnalysisError> = std::result::Result<T, E>;
