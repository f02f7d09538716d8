use crate::migration::phase::MigrationPhase;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Database,
    Collection,
    Shard,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Database => write!(f, "database"),
            ResourceType::Collection => write!(f, "collection"),
            ResourceType::Shard => write!(f, "shard"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    IntegrityError,
    DatabaseAlreadyExists,
    NamespaceExists,
    ShardAlreadyExists,
    DatabaseNotFound,
    NamespaceNotFound,
    InvalidShard,
    ChunkNotFound,
    AlreadyMigrating,
    IllegalTransition,
    MigrationAborted,
    StaleConfig,
    CriticalSectionTimeout,
    TransactionTooOld,
    DuplicateKey,
    ShardKeyNotFound,
    CommandNotSupported,
    QueryRejectedBySettings,
    ConnectionPoolExhausted,
    ConflictingOperationInProgress,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Io => "io",
            ErrorCode::Encode => "encode",
            ErrorCode::Decode => "decode",
            ErrorCode::Validation => "validation",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::IntegrityError => "integrity_error",
            ErrorCode::DatabaseAlreadyExists => "database_already_exists",
            ErrorCode::NamespaceExists => "namespace_exists",
            ErrorCode::ShardAlreadyExists => "shard_already_exists",
            ErrorCode::DatabaseNotFound => "database_not_found",
            ErrorCode::NamespaceNotFound => "namespace_not_found",
            ErrorCode::InvalidShard => "invalid_shard",
            ErrorCode::ChunkNotFound => "chunk_not_found",
            ErrorCode::AlreadyMigrating => "already_migrating",
            ErrorCode::IllegalTransition => "illegal_transition",
            ErrorCode::MigrationAborted => "migration_aborted",
            ErrorCode::StaleConfig => "stale_config",
            ErrorCode::CriticalSectionTimeout => "critical_section_timeout",
            ErrorCode::TransactionTooOld => "transaction_too_old",
            ErrorCode::DuplicateKey => "duplicate_key",
            ErrorCode::ShardKeyNotFound => "shard_key_not_found",
            ErrorCode::CommandNotSupported => "command_not_supported",
            ErrorCode::QueryRejectedBySettings => "query_rejected_by_settings",
            ErrorCode::ConnectionPoolExhausted => "connection_pool_exhausted",
            ErrorCode::ConflictingOperationInProgress => "conflicting_operation_in_progress",
            ErrorCode::Timeout => "timeout",
        }
    }

    /// Codes a client may resolve by retrying the same command, possibly
    /// after refreshing its routing information.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::StaleConfig | ErrorCode::CriticalSectionTimeout
        )
    }
}

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("integrity error: {message}")]
    IntegrityError { message: String },
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("no chunk of '{ns}' contains {key}")]
    ChunkNotFound { ns: String, key: String },
    #[error("chunk {range} of '{ns}' already has a migration in flight")]
    AlreadyMigrating { ns: String, range: String },
    #[error("illegal migration transition {from} -> {to}")]
    IllegalTransition {
        from: MigrationPhase,
        to: MigrationPhase,
    },
    #[error("migration aborted: {reason}")]
    MigrationAborted { reason: String },
    #[error("stale config for '{ns}': received {received}, wanted {wanted}")]
    StaleConfig {
        ns: String,
        received: String,
        wanted: String,
    },
    #[error("timed out waiting for the critical section on '{ns}' to be released")]
    CriticalSectionTimeout { ns: String },
    #[error("txnNumber {txn_number} for session {session} is older than active {active}")]
    TransactionTooOld {
        session: String,
        txn_number: i64,
        active: i64,
    },
    #[error("duplicate key in '{ns}': {key}")]
    DuplicateKey { ns: String, key: String },
    #[error("shard key not found for write on '{ns}'")]
    ShardKeyNotFound { ns: String },
    #[error("command not supported: {0}")]
    CommandNotSupported(String),
    #[error("query rejected by settings: {shape}")]
    QueryRejectedBySettings { shape: String },
    #[error("connection pool exhausted for host '{host}' pool '{pool}'")]
    ConnectionPoolExhausted { host: String, pool: String },
    #[error("conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),
    #[error("timeout: {0}")]
    Timeout(String),
}

impl ShardError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ShardError::Io(_) => ErrorCode::Io,
            ShardError::Encode(_) => ErrorCode::Encode,
            ShardError::Decode(_) => ErrorCode::Decode,
            ShardError::Validation(_) => ErrorCode::Validation,
            ShardError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            ShardError::IntegrityError { .. } => ErrorCode::IntegrityError,
            ShardError::AlreadyExists { resource_type, .. } => match resource_type {
                ResourceType::Database => ErrorCode::DatabaseAlreadyExists,
                ResourceType::Collection => ErrorCode::NamespaceExists,
                ResourceType::Shard => ErrorCode::ShardAlreadyExists,
            },
            ShardError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Database => ErrorCode::DatabaseNotFound,
                ResourceType::Collection => ErrorCode::NamespaceNotFound,
                ResourceType::Shard => ErrorCode::InvalidShard,
            },
            ShardError::ChunkNotFound { .. } => ErrorCode::ChunkNotFound,
            ShardError::AlreadyMigrating { .. } => ErrorCode::AlreadyMigrating,
            ShardError::IllegalTransition { .. } => ErrorCode::IllegalTransition,
            ShardError::MigrationAborted { .. } => ErrorCode::MigrationAborted,
            ShardError::StaleConfig { .. } => ErrorCode::StaleConfig,
            ShardError::CriticalSectionTimeout { .. } => ErrorCode::CriticalSectionTimeout,
            ShardError::TransactionTooOld { .. } => ErrorCode::TransactionTooOld,
            ShardError::DuplicateKey { .. } => ErrorCode::DuplicateKey,
            ShardError::ShardKeyNotFound { .. } => ErrorCode::ShardKeyNotFound,
            ShardError::CommandNotSupported(_) => ErrorCode::CommandNotSupported,
            ShardError::QueryRejectedBySettings { .. } => ErrorCode::QueryRejectedBySettings,
            ShardError::ConnectionPoolExhausted { .. } => ErrorCode::ConnectionPoolExhausted,
            ShardError::ConflictingOperationInProgress(_) => {
                ErrorCode::ConflictingOperationInProgress
            }
            ShardError::Timeout(_) => ErrorCode::Timeout,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    pub(crate) fn encode(err: impl std::fmt::Display) -> Self {
        ShardError::Encode(err.to_string())
    }

    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        ShardError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, ResourceType, ShardError};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ErrorCode::ChunkNotFound.as_str(), "chunk_not_found");
        assert_eq!(ErrorCode::AlreadyMigrating.as_str(), "already_migrating");
        assert_eq!(
            ErrorCode::QueryRejectedBySettings.as_str(),
            "query_rejected_by_settings"
        );
    }

    #[test]
    fn unknown_shard_maps_to_invalid_shard() {
        let err = ShardError::NotFound {
            resource_type: ResourceType::Shard,
            resource_id: "shard9".into(),
        };
        assert_eq!(err.code(), ErrorCode::InvalidShard);
        assert_eq!(err.code_str(), "invalid_shard");
        assert!(!err.is_retryable());
    }

    #[test]
    fn stale_ownership_is_retryable() {
        let err = ShardError::StaleConfig {
            ns: "db.coll".into(),
            received: "2|0".into(),
            wanted: "3|0".into(),
        };
        assert!(err.is_retryable());
        assert!(
            ShardError::CriticalSectionTimeout {
                ns: "db.coll".into()
            }
            .is_retryable()
        );
        assert!(!ShardError::Timeout("fetch".into()).is_retryable());
    }
}
