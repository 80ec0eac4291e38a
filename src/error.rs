use thiserror::Error;

/// Errors returned by the fallible (shape-checked) APIs of this crate.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// A caller passed an inconsistent combination of arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The labels cannot be split into the requested number of stratified folds.
    #[error("stratification failed: {0}")]
    Stratification(String),

    /// Training produced a non-finite loss.
    #[error("training diverged: {0}")]
    Diverged(String),
}

pub type Result<T> = std::result::Result<T, Error>;
