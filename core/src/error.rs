use crate::{dispatch::Category, types::Timestamp};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CohortError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Lookup parse error at line {line}: {reason}")]
    LookupParse { line: usize, reason: String },

    #[error("Timestamp {0} is outside the representable calendar range")]
    DateOutOfRange(Timestamp),

    #[error("Invalid distribution: {0}")]
    InvalidDistribution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Output queue '{category}' closed before generation finished")]
    DispatchClosed { category: Category },

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Lost records in '{category}': emitted {emitted}, written {written}")]
    DeliveryMismatch {
        category: Category,
        emitted: u64,
        written: u64,
    },
}

impl CohortError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn lookup(line: usize, reason: impl Into<String>) -> Self {
        Self::LookupParse {
            line,
            reason: reason.into(),
        }
    }
}

pub type CohortResult<T> = Result<T, CohortError>;
