//! Core domain types for the sync engine
//!
//! Defines the replicated table catalog, row/tombstone/change-log shapes,
//! and the client-facing op/result wire types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Result, SyncError};
use crate::hlc::HlcStamp;

pub type WorkspaceId = String;
pub type DeviceId = String;
pub type UserId = String;

/// Membership role within a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn can_administer(&self) -> bool {
        matches!(self, Role::Owner)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Owner => write!(f, "owner"),
            Role::Editor => write!(f, "editor"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

/// The fixed set of replicated tables. Sealed: no stringly-typed dynamic
/// table dispatch — every table this engine knows about appears here, and
/// callers validate against this enum rather than a free-form string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TableName {
    Threads,
    Messages,
    Projects,
    Posts,
    Kv,
    FileMeta,
}

impl TableName {
    pub const ALL: [TableName; 6] = [
        TableName::Threads,
        TableName::Messages,
        TableName::Projects,
        TableName::Posts,
        TableName::Kv,
        TableName::FileMeta,
    ];

    /// Parse from the wire string name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "threads" => Some(TableName::Threads),
            "messages" => Some(TableName::Messages),
            "projects" => Some(TableName::Projects),
            "posts" => Some(TableName::Posts),
            "kv" => Some(TableName::Kv),
            "file_meta" => Some(TableName::FileMeta),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Threads => "threads",
            TableName::Messages => "messages",
            TableName::Projects => "projects",
            TableName::Posts => "posts",
            TableName::Kv => "kv",
            TableName::FileMeta => "file_meta",
        }
    }

    /// The payload field that carries this table's primary key.
    pub fn pk_field(&self) -> &'static str {
        match self {
            TableName::FileMeta => "hash",
            _ => "id",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single row in a replicated table, as held by the engine. `payload`
/// holds the sanitized, table-specific fields (never `workspace_id` or an
/// internal row id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatedRow {
    pub pk: String,
    pub payload: Map<String, JsonValue>,
    pub deleted: bool,
    pub deleted_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
    pub clock: u64,
}

/// A per-`(workspace, table, pk)` deletion marker, kept even after the row
/// itself is purged so late `put`s cannot resurrect a stale value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub table: TableName,
    pub pk: String,
    pub deleted_at: u64,
    pub clock: u64,
    pub server_version: u64,
}

/// Per-device replication progress within one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCursor {
    pub device_id: DeviceId,
    pub last_seen_version: u64,
    pub updated_at: u64,
}

/// Which mutation a change-log entry and client op represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Put,
    Delete,
}

/// One client-submitted mutation, as received by `push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOp {
    pub op_id: String,
    pub table_name: String,
    pub operation: OpKind,
    pub pk: String,
    pub payload: Option<Map<String, JsonValue>>,
    pub clock: u64,
    pub hlc: String,
    pub device_id: DeviceId,
}

/// Per-op result returned from `push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpResult {
    pub op_id: String,
    pub success: bool,
    pub server_version: Option<u64>,
    pub error: Option<String>,
}

impl OpResult {
    pub fn ok(op_id: impl Into<String>, server_version: u64) -> Self {
        Self {
            op_id: op_id.into(),
            success: true,
            server_version: Some(server_version),
            error: None,
        }
    }

    pub fn err(op_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            op_id: op_id.into(),
            success: false,
            server_version: None,
            error: Some(error.into()),
        }
    }
}

/// An applied change, as stored in the append-only change log and returned
/// by `pull`/`watch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub server_version: u64,
    pub table_name: TableName,
    pub pk: String,
    pub op: OpKind,
    pub payload: Option<Map<String, JsonValue>>,
    pub clock: u64,
    pub hlc: String,
    pub device_id: DeviceId,
    pub op_id: String,
    pub created_at: u64,
}

/// Result of one `pull` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResult {
    pub changes: Vec<ChangeLogEntry>,
    pub next_cursor: u64,
    pub has_more: bool,
}

/// Strip the fields a client must never be able to set directly, and
/// validate the remaining shape. Internal identifiers like `workspace_id`
/// are injected by the caller, not the client, and must not leak into or
/// out of stored payloads.
pub fn sanitize_payload(
    mut payload: Map<String, JsonValue>,
) -> Result<Map<String, JsonValue>> {
    payload.remove("workspace_id");
    payload.remove("_id");

    if let Some(deleted) = payload.get("deleted") {
        if !deleted.is_boolean() {
            return Err(SyncError::invalid_payload(
                "field 'deleted' must be a boolean",
            ));
        }
    }

    Ok(payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FileKind {
    Image,
    Pdf,
}

impl FileKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "image" => Some(FileKind::Image),
            "pdf" => Some(FileKind::Pdf),
            _ => None,
        }
    }
}
