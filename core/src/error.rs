//! Typed errors for every lifecycle operation.
//!
//! Callers branch on the variant, never on the message. Every business-rule
//! violation is deterministic and must not be retried; only
//! [`DomainError::Contention`] is transient.

use thiserror::Error;

/// Errors surfaced by the lot lifecycle engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A required field is missing or malformed for the target state.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation is not legal given the current state.
    ///
    /// Bad transitions, a lot already controlled by another entity, answering
    /// out of turn and ineligible soft-deletes all land here.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A referenced entity does not exist.
    #[error("{entity} with id {id} not found")]
    NotFound {
        /// Entity kind (`lot`, `sale`, ...)
        entity: &'static str,
        /// Requested id
        id: String,
    },

    /// Two requests raced for the same lot row and the store aborted one.
    ///
    /// Safe to retry once at the caller layer.
    #[error("Lock contention: {0}")]
    Contention(String),

    /// The store failed for a reason unrelated to business rules.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DomainError>;

impl DomainError {
    /// Shorthand for a [`DomainError::NotFound`].
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// HTTP-equivalent status code.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Conflict(_) | Self::Contention(_) => 409,
            Self::NotFound { .. } => 404,
            Self::Storage(_) => 500,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Contention(_) => "CONTENTION",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether retrying the whole operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Contention(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(DomainError::Validation("x".into()).status_code(), 400);
        assert_eq!(DomainError::Conflict("x".into()).status_code(), 409);
        assert_eq!(DomainError::not_found("lot", 7).status_code(), 404);
        assert_eq!(DomainError::Storage("x".into()).status_code(), 500);
    }

    #[test]
    fn only_contention_is_transient() {
        assert!(DomainError::Contention("lot row".into()).is_transient());
        assert!(!DomainError::Conflict("not your turn".into()).is_transient());
        assert!(!DomainError::Storage("disk".into()).is_transient());
    }

    #[test]
    fn not_found_display() {
        let display = DomainError::not_found("sale", "abc").to_string();
        assert!(display.contains("sale with id abc"));
    }
}
