use thiserror::Error;

/// Errors produced by hashing, sampling and trial configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A width, capacity, trial count or distribution parameter is invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A key has bits set at or above the configured input width.
    #[error("key does not fit in {bits} bits")]
    Domain { bits: usize },

    /// A textual key could not be parsed.
    #[error("invalid key literal: '{0}'")]
    InvalidKey(String),

    /// The distribution name is not one of the known samplers.
    #[error("unknown distribution: '{0}'")]
    UnknownDistribution(String),

    /// The rayon worker pool could not be built.
    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}

impl Error {
    pub(crate) fn config(detail: impl Into<String>) -> Self {
        Self::Configuration(detail.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
