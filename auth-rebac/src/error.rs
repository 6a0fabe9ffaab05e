use thiserror::Error;

/// Stable diagnostic codes, one per error kind.
pub mod codes {
    pub const ZONE_MISMATCH: &str = "REBAC_1001";
    pub const CROSS_ZONE_DENIED: &str = "REBAC_1002";
    pub const DUPLICATE_TUPLE: &str = "REBAC_2001";
    pub const NOT_FOUND: &str = "REBAC_2002";
    pub const CYCLE_DETECTED: &str = "REBAC_2003";
    pub const INVALID_TUPLE: &str = "REBAC_2004";
    pub const PERMISSION_DENIED: &str = "REBAC_3001";
    pub const DEPTH_EXCEEDED: &str = "REBAC_3002";
    pub const TIMEOUT: &str = "REBAC_3003";
    pub const TRANSIENT_STORE: &str = "REBAC_4001";
    pub const STORAGE: &str = "REBAC_4002";
    pub const INVALID_SCHEMA: &str = "REBAC_5001";
    pub const CONFIGURATION: &str = "REBAC_5002";
    pub const INTERNAL: &str = "REBAC_9001";
}

#[derive(Error, Debug)]
pub enum RebacError {
    #[error("Zone mismatch: {0}")]
    ZoneMismatch(String),

    #[error("Cross-zone access denied: {subject} may not reach {resource}")]
    CrossZoneDenied { subject: String, resource: String },

    #[error("Duplicate tuple: {0}")]
    DuplicateTuple(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("member_of tuple would create a cycle: {0}")]
    CycleDetected(String),

    #[error("Maximum {kind} depth of {limit} exceeded")]
    DepthExceeded { kind: DepthKind, limit: usize },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Check deadline exceeded")]
    Timeout,

    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Which traversal bound was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthKind {
    Ancestor,
    Group,
}

impl std::fmt::Display for DepthKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DepthKind::Ancestor => write!(f, "ancestor"),
            DepthKind::Group => write!(f, "group"),
        }
    }
}

impl RebacError {
    /// Diagnostic code surfaced alongside an access-denied outcome.
    pub fn code(&self) -> &'static str {
        match self {
            RebacError::ZoneMismatch(_) => codes::ZONE_MISMATCH,
            RebacError::CrossZoneDenied { .. } => codes::CROSS_ZONE_DENIED,
            RebacError::DuplicateTuple(_) => codes::DUPLICATE_TUPLE,
            RebacError::NotFound(_) => codes::NOT_FOUND,
            RebacError::CycleDetected(_) => codes::CYCLE_DETECTED,
            RebacError::DepthExceeded { .. } => codes::DEPTH_EXCEEDED,
            RebacError::PermissionDenied(_) => codes::PERMISSION_DENIED,
            RebacError::TransientStore(_) => codes::TRANSIENT_STORE,
            RebacError::Storage(_) => codes::STORAGE,
            RebacError::Timeout => codes::TIMEOUT,
            RebacError::InvalidTuple(_) => codes::INVALID_TUPLE,
            RebacError::InvalidSchema(_) => codes::INVALID_SCHEMA,
            RebacError::Configuration(_) => codes::CONFIGURATION,
            RebacError::Internal(_) => codes::INTERNAL,
        }
    }

    /// Only transient store faults are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RebacError::TransientStore(_))
    }
}

impl From<sqlx::Error> for RebacError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                RebacError::TransientStore(err.to_string())
            }
            sqlx::Error::RowNotFound => RebacError::NotFound(err.to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some("23505") => RebacError::DuplicateTuple(db.message().to_string()),
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => RebacError::TransientStore(db.message().to_string()),
                _ => RebacError::Storage(err.to_string()),
            },
            _ => RebacError::Storage(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_per_kind() {
        let errors = [
            RebacError::ZoneMismatch("z".into()),
            RebacError::CrossZoneDenied { subject: "s".into(), resource: "r".into() },
            RebacError::DuplicateTuple("t".into()),
            RebacError::NotFound("t".into()),
            RebacError::CycleDetected("c".into()),
            RebacError::DepthExceeded { kind: DepthKind::Group, limit: 32 },
            RebacError::PermissionDenied("p".into()),
            RebacError::TransientStore("x".into()),
            RebacError::Storage("x".into()),
            RebacError::Timeout,
        ];
        let mut codes: Vec<_> = errors.iter().map(RebacError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(RebacError::TransientStore("blip".into()).is_retryable());
        assert!(!RebacError::Storage("broken".into()).is_retryable());
        assert!(!RebacError::DepthExceeded { kind: DepthKind::Ancestor, limit: 1 }.is_retryable());
    }

    #[test]
    fn test_pool_timeout_maps_to_transient() {
        let err: RebacError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retryable());
    }
}
