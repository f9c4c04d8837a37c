use crate::intent::OperationClass;
use crate::transaction::{TransactionId, TransactionStatus};
use serde::Serialize;
use sheetgate_common::A1ParseError;
use std::time::Duration;
use thiserror::Error;

/// Why an address could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionErrorKind {
    NotFound,
    SheetNotFound,
    HeaderNotFound,
    AmbiguousHeader,
    InvalidAddress,
    OutOfBounds,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("named range `{name}` does not exist")]
    NamedRangeNotFound { name: String },
    #[error("sheet `{sheet}` does not exist in {object_id}")]
    SheetNotFound { object_id: String, sheet: String },
    #[error("no header matching `{header}` on sheet `{sheet}`")]
    HeaderNotFound { sheet: String, header: String },
    #[error("header `{header}` appears {count} times on sheet `{sheet}`")]
    AmbiguousHeader {
        sheet: String,
        header: String,
        count: usize,
    },
    #[error("invalid address `{input}`: {source}")]
    InvalidAddress {
        input: String,
        #[source]
        source: A1ParseError,
    },
    #[error("{range} lies outside sheet `{sheet}` ({rows} rows x {cols} cols)")]
    OutOfBounds {
        sheet: String,
        range: String,
        rows: u32,
        cols: u32,
    },
}

impl ResolutionError {
    pub fn kind(&self) -> ResolutionErrorKind {
        match self {
            ResolutionError::NamedRangeNotFound { .. } => ResolutionErrorKind::NotFound,
            ResolutionError::SheetNotFound { .. } => ResolutionErrorKind::SheetNotFound,
            ResolutionError::HeaderNotFound { .. } => ResolutionErrorKind::HeaderNotFound,
            ResolutionError::AmbiguousHeader { .. } => ResolutionErrorKind::AmbiguousHeader,
            ResolutionError::InvalidAddress { .. } => ResolutionErrorKind::InvalidAddress,
            ResolutionError::OutOfBounds { .. } => ResolutionErrorKind::OutOfBounds,
        }
    }
}

/// A safety check that blocked an intent before it reached the network.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum PolicyViolation {
    #[error("expected {field} `{expected}` but found `{actual}`; caller view is stale")]
    ExpectedStateMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },
    #[error("intent would affect {estimated} cells, above the limit of {limit}")]
    BlastRadiusExceeded { estimated: u64, limit: u64 },
    #[error("range `{range}` targets the entire sheet and an explicit range is required")]
    ExplicitRangeRequired { range: String },
    #[error("FULL diff of {cells} cells exceeds the ceiling of {ceiling} without override")]
    FullDiffTooLarge { cells: u64, ceiling: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error("no {class} token available after {waited:?}")]
    RateLimitTimeout {
        class: OperationClass,
        waited: Duration,
    },

    #[error("backend quota exceeded; gave up after {attempts} attempts")]
    BackendThrottled {
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error("backend rejected credentials: {0}")]
    Auth(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("snapshot service error: {0}")]
    Snapshot(String),

    #[error(
        "transaction {transaction_id} failed ({original}) and restoring its snapshot also failed: {rollback}"
    )]
    TransactionRollbackFailure {
        transaction_id: TransactionId,
        original: Box<GateError>,
        rollback: String,
    },

    #[error("transaction {id} is {status}; cannot {action}")]
    TransactionState {
        id: TransactionId,
        status: TransactionStatus,
        action: &'static str,
    },

    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),

    #[error("intent targets `{found}` but transaction {id} is bound to `{expected}`")]
    ObjectMismatch {
        id: TransactionId,
        expected: String,
        found: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("pipeline is shut down")]
    Closed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GateError {
    /// Whether a caller may retry the same request unchanged after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GateError::RateLimitTimeout { .. }
                | GateError::BackendThrottled { .. }
                | GateError::Backend(_)
        )
    }

    /// The original commit failure for a rollback failure, otherwise `self`.
    pub fn root_cause(&self) -> &GateError {
        match self {
            GateError::TransactionRollbackFailure { original, .. } => original.root_cause(),
            other => other,
        }
    }
}

pub type Result<T, E = GateError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(!GateError::from(ResolutionError::NamedRangeNotFound { name: "x".into() })
            .is_retryable());
        assert!(!GateError::from(PolicyViolation::BlastRadiusExceeded {
            estimated: 10,
            limit: 1
        })
        .is_retryable());
        assert!(GateError::RateLimitTimeout {
            class: OperationClass::Write,
            waited: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!GateError::Auth("expired".into()).is_retryable());
    }

    #[test]
    fn rollback_failure_keeps_both_causes() {
        let err = GateError::TransactionRollbackFailure {
            transaction_id: TransactionId(7),
            original: Box::new(GateError::Backend("500".into())),
            rollback: "snapshot missing".into(),
        };
        let text = err.to_string();
        assert!(text.contains("500"));
        assert!(text.contains("snapshot missing"));
        assert_eq!(err.root_cause(), &GateError::Backend("500".into()));
    }

    #[test]
    fn resolution_kinds() {
        let err = ResolutionError::NamedRangeNotFound { name: "Q".into() };
        assert_eq!(err.kind(), ResolutionErrorKind::NotFound);
    }
}
