use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid delta suffix: {0:?}")]
    InvalidDeltaSuffix(String),

    #[error("invalid association state code: {0}")]
    InvalidStateCode(i32),

    #[error("invalid delta status: {0:?}")]
    InvalidStatus(char),

    #[error("client identity must not be empty")]
    EmptyIdentity,
}
