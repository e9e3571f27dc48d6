use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::RangeError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Range(#[from] RangeError),
    /// Overlap detected at booking time. Nothing was written.
    #[error("dates not available on unit {unit_id}")]
    Conflict { unit_id: Ulid },
    /// No rate plan and no override for a night.
    #[error("price undetermined for unit {unit_id} on {date}")]
    PriceUndetermined { unit_id: Ulid, date: NaiveDate },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }
}
