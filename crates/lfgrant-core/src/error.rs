//! Error taxonomy for planning and applying grant declarations

use crate::operation::LogicalId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for lfgrant operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while declaring, planning or applying operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed entity or violated cross-entity invariant.
    #[error("validation error: {message}")]
    Validation {
        /// Description of every violation found.
        message: String,
    },

    /// The same logical identifier was declared with different parameters.
    #[error("conflicting declaration for `{id}`: {message}")]
    Conflict {
        /// Identifier declared twice.
        id: LogicalId,
        /// What differs between the two declarations.
        message: String,
    },

    /// The dependency graph is not acyclic.
    #[error("dependency cycle: {}", format_cycle(.ids))]
    Cycle {
        /// Identifiers on the cycle, in dependency order.
        ids: Vec<LogicalId>,
    },

    /// The external catalog service rejected or failed a call.
    #[error("external service error ({}): {message}", transience(.transient))]
    ExternalService {
        /// Whether the failure was considered retryable.
        transient: bool,
        /// Message reported by the service.
        message: String,
    },

    /// A node was not attempted because an ancestor did not succeed.
    #[error("skipped because dependency `{failed}` did not succeed")]
    DependencyFailure {
        /// The ancestor that failed.
        failed: LogicalId,
    },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn conflict(id: &LogicalId, message: impl Into<String>) -> Self {
        Self::Conflict {
            id: id.clone(),
            message: message.into(),
        }
    }

    /// Coarse category used in run reports and exit code selection
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Cycle { .. } => ErrorKind::Cycle,
            Error::ExternalService { .. } => ErrorKind::ExternalService,
            Error::DependencyFailure { .. } => ErrorKind::DependencyFailure,
        }
    }
}

/// Category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    Cycle,
    ExternalService,
    DependencyFailure,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Conflict => "ConflictError",
            ErrorKind::Cycle => "CycleError",
            ErrorKind::ExternalService => "ExternalServiceError",
            ErrorKind::DependencyFailure => "DependencyFailure",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

fn transience(transient: &bool) -> &'static str {
    if *transient {
        "transient"
    } else {
        "terminal"
    }
}

fn format_cycle(ids: &[LogicalId]) -> String {
    let mut parts: Vec<&str> = ids.iter().map(LogicalId::as_str).collect();
    if let Some(first) = ids.first() {
        parts.push(first.as_str());
    }
    parts.join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_closes_the_loop() {
        let err = Error::Cycle {
            ids: vec![LogicalId::from("a"), LogicalId::from("b")],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
        assert_eq!(err.kind(), ErrorKind::Cycle);
    }

    #[test]
    fn test_external_error_mentions_transience() {
        let err = Error::ExternalService {
            transient: false,
            message: "EntityNotFound".into(),
        };
        assert!(err.to_string().contains("terminal"));
        assert_eq!(err.kind().to_string(), "ExternalServiceError");
    }
}
