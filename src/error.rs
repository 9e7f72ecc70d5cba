//! Error types for the sync engine
//!
//! Defines a unified error type shared by the engine, the wire protocol,
//! and the backup importer/exporter. Each variant carries a stable string
//! code so the wire layer (see `protocol::rpc`) can surface machine-readable
//! errors without a separate mapping table.

use std::fmt;
use std::io;

/// Unified error type for sync engine operations
#[derive(Debug)]
pub enum SyncError {
    /// No authenticated identity, or identity has no membership in the workspace
    Unauthorized(String),
    /// Identity is a member but lacks the role required for this operation
    Forbidden(String),
    /// `table_name` is not one of the replicated tables
    UnknownTable(String),
    /// Payload failed sanitization or type-shape validation
    InvalidPayload(String),
    /// Push batch exceeded `MAX_PUSH_OPS`
    BatchTooLarge { submitted: usize, max: usize },
    /// HLC logical counter exceeded its bound within one millisecond
    ClockDrift(String),
    /// Same `op_id` maps to two different operations
    OpIdCollision(String),
    /// Backup import hit a key collision under add-only conflict policy
    BulkConflict { table: String, key: String },
    /// Backup header format/version/name mismatch
    UnsupportedBackupFormat(String),
    /// I/O error, presumed retryable by the caller
    StorageTransient(String),
    /// I/O or (de)serialization error, not expected to succeed on retry
    StorageFatal(String),
    /// JSON (de)serialization error
    Json(String),
}

impl SyncError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        SyncError::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        SyncError::Forbidden(msg.into())
    }

    pub fn unknown_table(table_name: &str) -> Self {
        SyncError::UnknownTable(format!("unknown table '{}'", table_name))
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        SyncError::InvalidPayload(msg.into())
    }

    pub fn batch_too_large(submitted: usize, max: usize) -> Self {
        SyncError::BatchTooLarge { submitted, max }
    }

    pub fn bulk_conflict(table: &str, key: &str) -> Self {
        SyncError::BulkConflict {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    /// Stable machine-readable code for the wire `error.code` field
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Unauthorized(_) => "UNAUTHORIZED",
            SyncError::Forbidden(_) => "FORBIDDEN",
            SyncError::UnknownTable(_) => "UNKNOWN_TABLE",
            SyncError::InvalidPayload(_) => "INVALID_PAYLOAD",
            SyncError::BatchTooLarge { .. } => "BATCH_TOO_LARGE",
            SyncError::ClockDrift(_) => "CLOCK_DRIFT",
            SyncError::OpIdCollision(_) => "OP_ID_COLLISION",
            SyncError::BulkConflict { .. } => "BULK_CONFLICT",
            SyncError::UnsupportedBackupFormat(_) => "UNSUPPORTED_BACKUP_FORMAT",
            SyncError::StorageTransient(_) => "STORAGE_TRANSIENT",
            SyncError::StorageFatal(_) => "STORAGE_FATAL",
            SyncError::Json(_) => "JSON",
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Unauthorized(msg) => write!(f, "{}", msg),
            SyncError::Forbidden(msg) => write!(f, "{}", msg),
            SyncError::UnknownTable(msg) => write!(f, "{}", msg),
            SyncError::InvalidPayload(msg) => write!(f, "{}", msg),
            SyncError::BatchTooLarge { submitted, max } => write!(
                f,
                "push batch has {} ops, exceeds max of {}",
                submitted, max
            ),
            SyncError::ClockDrift(msg) => write!(f, "{}", msg),
            SyncError::OpIdCollision(msg) => write!(f, "{}", msg),
            SyncError::BulkConflict { table, key } => write!(
                f,
                "import conflict on table '{}': key '{}' already exists",
                table, key
            ),
            SyncError::UnsupportedBackupFormat(msg) => write!(f, "{}", msg),
            SyncError::StorageTransient(msg) => write!(f, "{}", msg),
            SyncError::StorageFatal(msg) => write!(f, "{}", msg),
            SyncError::Json(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> Self {
        SyncError::StorageFatal(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Json(e.to_string())
    }
}

/// Result type alias for sync engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(SyncError::unauthorized("x").code(), "UNAUTHORIZED");
        assert_eq!(
            SyncError::batch_too_large(101, 100).code(),
            "BATCH_TOO_LARGE"
        );
        assert_eq!(
            SyncError::bulk_conflict("threads", "t1").code(),
            "BULK_CONFLICT"
        );
    }

    #[test]
    fn display_messages_are_human_readable() {
        let e = SyncError::batch_too_large(150, 100);
        assert_eq!(e.to_string(), "push batch has 150 ops, exceeds max of 100");
    }
}
