//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures of domain values: bad payloads, bad ids, impossible
/// periods. Storage and network failures are modelled in the sync crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// A payload lacks a field its table requires.
    #[error("{entity}: missing field '{field}'")]
    MissingField { entity: String, field: String },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A period boundary falls outside the supported calendar.
    #[error("date out of range: {0}")]
    OutOfRange(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn missing_field(entity: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            entity: entity.into(),
            field: field.into(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn out_of_range(what: impl std::fmt::Display) -> Self {
        Self::OutOfRange(what.to_string())
    }
}
