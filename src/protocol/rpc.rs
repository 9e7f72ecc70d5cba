//! RPC envelope and dispatch
//!
//! One envelope in, one envelope out, correlated by `requestId` so a client
//! can pipeline multiple in-flight calls on a single connection (`watch` in
//! particular is long-lived and shouldn't block `push`/`pull` on the same
//! socket).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::types::{ChangeLogEntry, ClientOp, FileKind, OpKind, TableName};

/// A request frame as it arrives on the wire: `{"rpc": "...", "requestId": "...", "params": {...}}`.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub rpc: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(default)]
    pub params: JsonValue,
}

#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl Response {
    pub fn ok(request_id: impl Into<String>, result: JsonValue) -> Self {
        Self {
            request_id: request_id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(request_id: impl Into<String>, e: &SyncError) -> Self {
        Self {
            request_id: request_id.into(),
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: e.code(),
                message: e.to_string(),
            }),
        }
    }
}

/// Identity established by the `hello` frame. Required before any other
/// request on a connection is serviced.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HelloParams {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
struct PushParams {
    #[serde(rename = "workspaceId")]
    workspace_id: String,
    ops: Vec<ClientOp>,
}

#[derive(Debug, Deserialize)]
struct PullParams {
    #[serde(rename = "workspaceId")]
    workspace_id: String,
    cursor: u64,
    limit: usize,
    tables: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WatchParams {
    #[serde(rename = "workspaceId")]
    workspace_id: String,
    #[serde(default)]
    cursor: u64,
    #[serde(default = "default_watch_limit")]
    limit: usize,
    #[serde(rename = "idleTimeoutMs", default = "default_idle_timeout_ms")]
    idle_timeout_ms: u64,
}

fn default_watch_limit() -> usize {
    200
}

fn default_idle_timeout_ms() -> u64 {
    25_000
}

#[derive(Debug, Deserialize)]
struct UpdateDeviceCursorParams {
    #[serde(rename = "workspaceId")]
    workspace_id: String,
    #[serde(rename = "lastSeenVersion")]
    last_seen_version: u64,
}

#[derive(Debug, Deserialize)]
struct GetServerVersionParams {
    #[serde(rename = "workspaceId")]
    workspace_id: String,
}

#[derive(Debug, Deserialize)]
struct GenerateUploadUrlParams {
    #[serde(rename = "workspaceId")]
    workspace_id: String,
    hash: String,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "sizeBytes")]
    size_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CommitUploadParams {
    #[serde(rename = "workspaceId")]
    workspace_id: String,
    hash: String,
    #[serde(rename = "storageId")]
    storage_id: String,
    #[serde(rename = "providerId")]
    provider_id: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    #[serde(rename = "sizeBytes")]
    size_bytes: u64,
    name: String,
    kind: Option<FileKind>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(rename = "pageCount")]
    page_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GetFileUrlParams {
    #[serde(rename = "workspaceId")]
    workspace_id: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct GcDeletedFilesParams {
    #[serde(rename = "workspaceId")]
    workspace_id: String,
    #[serde(rename = "retentionSeconds")]
    retention_seconds: u64,
    #[serde(default = "default_file_gc_limit")]
    limit: usize,
}

fn default_file_gc_limit() -> usize {
    crate::engine::blob::DEFAULT_FILE_GC_LIMIT
}

#[derive(Debug, Deserialize)]
struct RateLimitParams {
    key: String,
    #[serde(rename = "windowMs")]
    window_ms: u64,
    #[serde(rename = "maxRequests")]
    max_requests: u32,
}

fn parse_tables(tables: Option<Vec<String>>) -> Result<Option<Vec<TableName>>, SyncError> {
    match tables {
        None => Ok(None),
        Some(names) => {
            let parsed: Result<Vec<TableName>, SyncError> = names
                .iter()
                .map(|n| TableName::from_name(n).ok_or_else(|| SyncError::unknown_table(n)))
                .collect();
            parsed.map(Some)
        }
    }
}

fn params<T: serde::de::DeserializeOwned>(value: JsonValue) -> Result<T, SyncError> {
    serde_json::from_value(value)
        .map_err(|e| SyncError::invalid_payload(format!("invalid params: {}", e)))
}

#[derive(Serialize)]
struct WireStamp {
    clock: u64,
    hlc: String,
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "opId")]
    op_id: String,
}

/// The wire shape for a change-log entry nests the HLC/device/op-id fields
/// under `stamp`, separate from the replication metadata (`serverVersion`,
/// `tableName`, `pk`, `op`, `payload`) that callers act on directly.
#[derive(Serialize)]
struct WireChange {
    #[serde(rename = "serverVersion")]
    server_version: u64,
    #[serde(rename = "tableName")]
    table_name: &'static str,
    pk: String,
    op: &'static str,
    payload: Option<JsonValue>,
    stamp: WireStamp,
}

fn to_wire_change(e: ChangeLogEntry) -> WireChange {
    WireChange {
        server_version: e.server_version,
        table_name: e.table_name.as_str(),
        pk: e.pk,
        op: match e.op {
            OpKind::Put => "put",
            OpKind::Delete => "delete",
        },
        payload: e.payload.map(JsonValue::Object),
        stamp: WireStamp {
            clock: e.clock,
            hlc: e.hlc,
            device_id: e.device_id,
            op_id: e.op_id,
        },
    }
}

/// Dispatch one already-authenticated request against the engine.
pub async fn dispatch(engine: &SyncEngine, identity: &Identity, envelope: Envelope) -> Response {
    let request_id = envelope.request_id.clone();
    match handle(engine, identity, envelope).await {
        Ok(value) => Response::ok(request_id, value),
        Err(e) => Response::err(request_id, &e),
    }
}

async fn handle(
    engine: &SyncEngine,
    identity: &Identity,
    envelope: Envelope,
) -> Result<JsonValue, SyncError> {
    match envelope.rpc.as_str() {
        "hello" => Err(SyncError::invalid_payload(
            "hello already completed for this connection",
        )),
        "push" => {
            let p: PushParams = params(envelope.params)?;
            let (results, server_version) =
                engine.push(&p.workspace_id, &identity.user_id, p.ops)?;
            Ok(serde_json::json!({ "results": results, "serverVersion": server_version }))
        }
        "pull" => {
            let p: PullParams = params(envelope.params)?;
            let tables = parse_tables(p.tables)?;
            let result = engine.pull(
                &p.workspace_id,
                &identity.user_id,
                p.cursor,
                p.limit,
                tables.as_deref(),
            )?;
            let changes: Vec<WireChange> = result.changes.into_iter().map(to_wire_change).collect();
            Ok(serde_json::json!({
                "changes": changes,
                "nextCursor": result.next_cursor,
                "hasMore": result.has_more,
            }))
        }
        "watch" => {
            let p: WatchParams = params(envelope.params)?;
            let result = engine
                .watch_once(
                    &p.workspace_id,
                    &identity.user_id,
                    p.cursor,
                    p.limit,
                    std::time::Duration::from_millis(p.idle_timeout_ms),
                )
                .await?;
            let latest_version = result.next_cursor;
            let changes: Vec<WireChange> = result.changes.into_iter().map(to_wire_change).collect();
            Ok(serde_json::json!({
                "changes": changes,
                "latestVersion": latest_version,
            }))
        }
        "updateDeviceCursor" => {
            let p: UpdateDeviceCursorParams = params(envelope.params)?;
            engine.update_device_cursor(
                &p.workspace_id,
                &identity.user_id,
                identity.device_id.clone(),
                p.last_seen_version,
            )?;
            Ok(serde_json::json!({}))
        }
        "getServerVersion" => {
            let p: GetServerVersionParams = params(envelope.params)?;
            let version = engine.get_server_version(&p.workspace_id, &identity.user_id)?;
            Ok(serde_json::json!({ "serverVersion": version }))
        }
        "generateUploadUrl" => {
            let p: GenerateUploadUrlParams = params(envelope.params)?;
            let url = engine.generate_upload_url(
                &p.workspace_id,
                &identity.user_id,
                &p.hash,
                p.mime_type.as_deref(),
                p.size_bytes,
            )?;
            Ok(serde_json::json!({ "url": url }))
        }
        "commitUpload" => {
            let p: CommitUploadParams = params(envelope.params)?;
            engine.commit_upload(
                &p.workspace_id,
                &identity.user_id,
                p.hash,
                p.storage_id,
                p.provider_id,
                p.mime_type,
                p.size_bytes,
                p.name,
                p.kind,
                p.width,
                p.height,
                p.page_count,
            )?;
            Ok(serde_json::json!({}))
        }
        "getFileUrl" => {
            let p: GetFileUrlParams = params(envelope.params)?;
            let url = engine.get_file_url(&p.workspace_id, &identity.user_id, &p.hash)?;
            Ok(serde_json::json!({ "url": url }))
        }
        "gcDeletedFiles" => {
            let p: GcDeletedFilesParams = params(envelope.params)?;
            let purged = engine.gc_deleted_files(
                &p.workspace_id,
                &identity.user_id,
                p.retention_seconds,
                p.limit,
            )?;
            Ok(serde_json::json!({ "purged": purged }))
        }
        "checkAndRecord" => {
            let p: RateLimitParams = params(envelope.params)?;
            let result = engine.check_rate_limit(&p.key, p.window_ms, p.max_requests);
            Ok(serde_json::json!({
                "allowed": result.allowed,
                "remaining": result.remaining,
                "retryAfterMs": result.retry_after_ms,
            }))
        }
        "getStats" => {
            let p: RateLimitParams = params(envelope.params)?;
            let stats = engine.rate_limit_stats(&p.key, p.window_ms, p.max_requests);
            Ok(serde_json::json!({
                "limit": stats.limit,
                "remaining": stats.remaining,
                "resetMs": stats.reset_ms,
            }))
        }
        other => Err(SyncError::invalid_payload(format!("unknown rpc '{}'", other))),
    }
}
