//! Backup stream: JSONL export/import
//!
//! Line-delimited JSON sharing the shape of the on-disk snapshot format
//! (see `persistence`): a versioned header, interleaved table sections, and
//! an end marker. Export streams rows in batches to bound memory; import
//! validates the header before touching any table.

use std::io::{BufRead, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::engine::blob::BlobGateway;
use crate::engine::store::WorkspaceState;
use crate::error::{Result, SyncError};
use crate::types::{ReplicatedRow, TableName, Tombstone};

/// The backup stream's binary blob section isn't one of the replicated
/// tables in `TableName` — it carries raw content-addressed bytes, not
/// rows — so it's matched by name rather than parsed as a `TableName`.
const FILE_BLOBS_TABLE: &str = "file_blobs";

pub const BACKUP_FORMAT: &str = "or3-backup-stream";
pub const BACKUP_VERSION: u32 = 1;

/// Row batches are capped so one JSONL line stays well under the ~256 KiB
/// informal line-length budget for the backup stream.
const ROWS_PER_BATCH: usize = 20;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackupLine {
    Meta {
        format: String,
        version: u32,
        database_name: String,
        database_version: u32,
        created_at: String,
        tables: Vec<TableSummary>,
    },
    TableStart {
        table: String,
    },
    Rows {
        table: String,
        rows: Vec<JsonValue>,
    },
    TableEnd {
        table: String,
    },
    End,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub row_count: usize,
    pub inbound: bool,
}

/// How a bulk import resolves key collisions in the target workspace.
#[derive(Debug, Clone, Copy)]
pub struct ImportOptions {
    pub clear_tables: bool,
    pub overwrite_values: bool,
}

/// Stream a full workspace export as JSONL lines, one `write!` per line.
/// `blobs` is the workspace's blob gateway, if this deployment has one; its
/// live content-addressed objects are exported as a `file_blobs` section
/// alongside the replicated tables.
pub fn export_workspace(
    state: &WorkspaceState,
    database_name: &str,
    database_version: u32,
    created_at: &str,
    workspace_id: &str,
    blobs: Option<&BlobGateway>,
    writer: &mut impl Write,
) -> Result<()> {
    let tables = TableName::ALL;
    let blob_rows = blobs.map(|b| b.export_blobs(workspace_id)).transpose()?;

    let mut summaries: Vec<TableSummary> = tables
        .iter()
        .map(|t| {
            let row_count = state.rows.get(t).map(|r| r.len()).unwrap_or(0);
            let tomb_only_count = state
                .tombstones
                .get(t)
                .map(|tm| {
                    tm.keys()
                        .filter(|pk| !state.rows.get(t).map(|r| r.contains_key(*pk)).unwrap_or(false))
                        .count()
                })
                .unwrap_or(0);
            TableSummary {
                name: t.as_str().to_string(),
                row_count: row_count + tomb_only_count,
                inbound: true,
            }
        })
        .collect();
    if let Some(rows) = &blob_rows {
        summaries.push(TableSummary {
            name: FILE_BLOBS_TABLE.to_string(),
            row_count: rows.len(),
            inbound: true,
        });
    }

    write_line(
        writer,
        &BackupLine::Meta {
            format: BACKUP_FORMAT.to_string(),
            version: BACKUP_VERSION,
            database_name: database_name.to_string(),
            database_version,
            created_at: created_at.to_string(),
            tables: summaries,
        },
    )?;

    for table in tables {
        write_line(
            writer,
            &BackupLine::TableStart {
                table: table.as_str().to_string(),
            },
        )?;

        if let Some(rows) = state.rows.get(&table) {
            let mut pks: Vec<&String> = rows.keys().collect();
            pks.sort();

            for chunk in pks.chunks(ROWS_PER_BATCH) {
                let batch: Vec<JsonValue> = chunk
                    .iter()
                    .map(|pk| row_to_json(table, &rows[*pk]))
                    .collect();
                write_line(
                    writer,
                    &BackupLine::Rows {
                        table: table.as_str().to_string(),
                        rows: batch,
                    },
                )?;
            }
        }

        // A delete of a pk the engine never held a row for leaves only a
        // tombstone (see `conflict::apply_delete`); export it as a deleted
        // row with no payload so the tombstone itself survives a round trip
        // instead of silently vanishing.
        if let Some(tombstones) = state.tombstones.get(&table) {
            let empty_rows = std::collections::HashMap::new();
            let rows = state.rows.get(&table).unwrap_or(&empty_rows);
            let mut tomb_only_pks: Vec<&String> = tombstones
                .keys()
                .filter(|pk| !rows.contains_key(*pk))
                .collect();
            tomb_only_pks.sort();

            for chunk in tomb_only_pks.chunks(ROWS_PER_BATCH) {
                let batch: Vec<JsonValue> = chunk
                    .iter()
                    .map(|pk| tombstone_to_json(table, &tombstones[*pk]))
                    .collect();
                write_line(
                    writer,
                    &BackupLine::Rows {
                        table: table.as_str().to_string(),
                        rows: batch,
                    },
                )?;
            }
        }

        write_line(
            writer,
            &BackupLine::TableEnd {
                table: table.as_str().to_string(),
            },
        )?;
    }

    if let Some(rows) = blob_rows {
        write_line(
            writer,
            &BackupLine::TableStart {
                table: FILE_BLOBS_TABLE.to_string(),
            },
        )?;
        for chunk in rows.chunks(ROWS_PER_BATCH) {
            let batch: Vec<JsonValue> = chunk
                .iter()
                .map(|(hash, mime_type, data)| encode_blob_row(hash, mime_type, data))
                .collect();
            write_line(
                writer,
                &BackupLine::Rows {
                    table: FILE_BLOBS_TABLE.to_string(),
                    rows: batch,
                },
            )?;
        }
        write_line(
            writer,
            &BackupLine::TableEnd {
                table: FILE_BLOBS_TABLE.to_string(),
            },
        )?;
    }

    write_line(writer, &BackupLine::End)?;
    Ok(())
}

fn row_to_json(table: TableName, row: &ReplicatedRow) -> JsonValue {
    let mut obj = row.payload.clone();
    obj.insert(table.pk_field().to_string(), JsonValue::String(row.pk.clone()));
    obj.insert("deleted".to_string(), JsonValue::Bool(row.deleted));
    if let Some(deleted_at) = row.deleted_at {
        obj.insert("deletedAt".to_string(), JsonValue::from(deleted_at));
    }
    obj.insert("createdAt".to_string(), JsonValue::from(row.created_at));
    obj.insert("updatedAt".to_string(), JsonValue::from(row.updated_at));
    obj.insert("clock".to_string(), JsonValue::from(row.clock));
    JsonValue::Object(obj)
}

/// A tombstone with no backing row exports as a deleted row with an empty
/// payload, so `import_row` re-creates both the row and the tombstone.
fn tombstone_to_json(table: TableName, tombstone: &Tombstone) -> JsonValue {
    let mut obj = Map::new();
    obj.insert(table.pk_field().to_string(), JsonValue::String(tombstone.pk.clone()));
    obj.insert("deleted".to_string(), JsonValue::Bool(true));
    obj.insert("deletedAt".to_string(), JsonValue::from(tombstone.deleted_at));
    obj.insert("createdAt".to_string(), JsonValue::from(tombstone.deleted_at));
    obj.insert("updatedAt".to_string(), JsonValue::from(tombstone.deleted_at));
    obj.insert("clock".to_string(), JsonValue::from(tombstone.clock));
    JsonValue::Object(obj)
}

/// Encode a raw blob as the `file_blobs` row shape: `{hash, blob: {data, type}}`.
pub fn encode_blob_row(hash: &str, mime_type: &str, data: &[u8]) -> JsonValue {
    serde_json::json!({
        "hash": hash,
        "blob": {
            "data": BASE64.encode(data),
            "type": mime_type,
        }
    })
}

pub fn decode_blob_row(row: &JsonValue) -> Result<(String, String, Vec<u8>)> {
    let hash = row
        .get("hash")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SyncError::invalid_payload("blob row missing 'hash'"))?
        .to_string();
    let blob = row
        .get("blob")
        .ok_or_else(|| SyncError::invalid_payload("blob row missing 'blob'"))?;
    let mime_type = blob
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SyncError::invalid_payload("blob row missing 'blob.type'"))?
        .to_string();
    let data_b64 = blob
        .get("data")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SyncError::invalid_payload("blob row missing 'blob.data'"))?;
    let data = BASE64
        .decode(data_b64)
        .map_err(|e| SyncError::invalid_payload(format!("invalid base64 blob data: {}", e)))?;
    Ok((hash, mime_type, data))
}

fn write_line(writer: &mut impl Write, line: &BackupLine) -> Result<()> {
    let json = serde_json::to_string(line)?;
    writeln!(writer, "{}", json)?;
    Ok(())
}

/// Parse and apply an import stream into `state`. Validates the header
/// before any table is touched; a format/version/name mismatch leaves the
/// workspace untouched.
pub fn import_workspace(
    state: &mut WorkspaceState,
    database_name: &str,
    current_database_version: u32,
    reader: impl BufRead,
    options: ImportOptions,
    blobs: Option<&BlobGateway>,
) -> Result<usize> {
    let mut lines = reader.lines();
    let mut imported = 0usize;
    let mut saw_header = false;

    for line in &mut lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: BackupLine = serde_json::from_str(&line)?;

        match parsed {
            BackupLine::Meta {
                format,
                version,
                database_name: name,
                database_version,
                ..
            } => {
                if format != BACKUP_FORMAT || version != BACKUP_VERSION {
                    return Err(SyncError::UnsupportedBackupFormat(format!(
                        "unrecognized backup format '{}' v{}",
                        format, version
                    )));
                }
                if name != database_name {
                    return Err(SyncError::UnsupportedBackupFormat(format!(
                        "backup is for database '{}', not '{}'",
                        name, database_name
                    )));
                }
                if database_version > current_database_version {
                    return Err(SyncError::UnsupportedBackupFormat(format!(
                        "backup database version {} is newer than current {}",
                        database_version, current_database_version
                    )));
                }
                saw_header = true;

                if options.clear_tables {
                    state.rows.clear();
                    state.tombstones.clear();
                }
            }
            BackupLine::TableStart { .. } | BackupLine::TableEnd { .. } => {}
            BackupLine::Rows { table, rows } => {
                if !saw_header {
                    return Err(SyncError::UnsupportedBackupFormat(
                        "rows encountered before meta header".to_string(),
                    ));
                }
                if table == FILE_BLOBS_TABLE {
                    let gateway = blobs.ok_or_else(|| {
                        SyncError::UnsupportedBackupFormat(
                            "backup contains file_blobs but no blob gateway was provided"
                                .to_string(),
                        )
                    })?;
                    for row_json in rows {
                        let (hash, _mime_type, data) = decode_blob_row(&row_json)?;
                        gateway.import_blob(&hash, &data)?;
                        imported += 1;
                    }
                    continue;
                }

                let table_name = TableName::from_name(&table)
                    .ok_or_else(|| SyncError::unknown_table(&table))?;
                for row_json in rows {
                    import_row(state, table_name, row_json, options)?;
                    imported += 1;
                }
            }
            BackupLine::End => break,
        }
    }

    if !saw_header {
        return Err(SyncError::UnsupportedBackupFormat(
            "backup stream had no meta header".to_string(),
        ));
    }

    Ok(imported)
}

fn import_row(
    state: &mut WorkspaceState,
    table: TableName,
    row_json: JsonValue,
    options: ImportOptions,
) -> Result<()> {
    let mut obj: Map<String, JsonValue> = row_json
        .as_object()
        .cloned()
        .ok_or_else(|| SyncError::invalid_payload("backup row is not an object"))?;

    let pk_field = table.pk_field();
    let pk = obj
        .remove(pk_field)
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .ok_or_else(|| SyncError::invalid_payload(format!("backup row missing '{}'", pk_field)))?;

    let deleted = obj
        .remove("deleted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let deleted_at = obj.remove("deletedAt").and_then(|v| v.as_u64());
    let created_at = obj.remove("createdAt").and_then(|v| v.as_u64()).unwrap_or(0);
    let updated_at = obj.remove("updatedAt").and_then(|v| v.as_u64()).unwrap_or(created_at);
    let clock = obj.remove("clock").and_then(|v| v.as_u64()).unwrap_or(0);

    let rows = state.rows.entry(table).or_default();

    if !options.overwrite_values && rows.contains_key(&pk) {
        return Err(SyncError::bulk_conflict(table.as_str(), &pk));
    }

    if deleted {
        if let Some(deleted_at) = deleted_at {
            state.tombstones.entry(table).or_default().insert(
                pk.clone(),
                Tombstone {
                    table,
                    pk: pk.clone(),
                    deleted_at,
                    clock,
                    server_version: 0,
                },
            );
        }
    }

    rows.insert(
        pk.clone(),
        ReplicatedRow {
            pk,
            payload: obj,
            deleted,
            deleted_at,
            created_at,
            updated_at,
            clock,
        },
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::changelog::append;
    use crate::types::OpKind;
    use std::io::Cursor;

    fn sample_state() -> WorkspaceState {
        let mut state = WorkspaceState::default();
        state.rows.entry(TableName::Threads).or_default().insert(
            "t1".to_string(),
            ReplicatedRow {
                pk: "t1".to_string(),
                payload: serde_json::json!({"title": "hello"}).as_object().unwrap().clone(),
                deleted: false,
                deleted_at: None,
                created_at: 1,
                updated_at: 1,
                clock: 1,
            },
        );
        append(
            &mut state,
            crate::types::ChangeLogEntry {
                server_version: 1,
                table_name: TableName::Threads,
                pk: "t1".to_string(),
                op: OpKind::Put,
                payload: None,
                clock: 1,
                hlc: "0000000000001.000000.dev".to_string(),
                device_id: "dev".to_string(),
                op_id: "op1".to_string(),
                created_at: 1,
            },
        );
        state
    }

    #[test]
    fn export_then_import_round_trips_row_contents() {
        let state = sample_state();
        let mut buf = Vec::new();
        export_workspace(&state, "mydb", 1, "2026-01-01T00:00:00Z", "ws1", None, &mut buf).unwrap();

        let mut imported_state = WorkspaceState::default();
        let options = ImportOptions {
            clear_tables: true,
            overwrite_values: true,
        };
        let count =
            import_workspace(&mut imported_state, "mydb", 1, Cursor::new(buf), options, None).unwrap();
        assert_eq!(count, 1);

        let row = &imported_state.rows[&TableName::Threads]["t1"];
        assert_eq!(row.payload.get("title").unwrap(), "hello");
    }

    #[test]
    fn import_rejects_mismatched_database_name() {
        let state = sample_state();
        let mut buf = Vec::new();
        export_workspace(&state, "mydb", 1, "2026-01-01T00:00:00Z", "ws1", None, &mut buf).unwrap();

        let mut imported_state = WorkspaceState::default();
        let options = ImportOptions {
            clear_tables: true,
            overwrite_values: true,
        };
        let err =
            import_workspace(&mut imported_state, "otherdb", 1, Cursor::new(buf), options, None)
                .unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedBackupFormat(_)));
    }

    #[test]
    fn import_rejects_newer_database_version() {
        let state = sample_state();
        let mut buf = Vec::new();
        export_workspace(&state, "mydb", 5, "2026-01-01T00:00:00Z", "ws1", None, &mut buf).unwrap();

        let mut imported_state = WorkspaceState::default();
        let options = ImportOptions {
            clear_tables: true,
            overwrite_values: true,
        };
        let err = import_workspace(&mut imported_state, "mydb", 1, Cursor::new(buf), options, None)
            .unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedBackupFormat(_)));
    }

    #[test]
    fn import_without_overwrite_reports_bulk_conflict_on_existing_key() {
        let state = sample_state();
        let mut buf = Vec::new();
        export_workspace(&state, "mydb", 1, "2026-01-01T00:00:00Z", "ws1", None, &mut buf).unwrap();

        let mut target = sample_state(); // already has t1
        let options = ImportOptions {
            clear_tables: false,
            overwrite_values: false,
        };
        let err = import_workspace(&mut target, "mydb", 1, Cursor::new(buf), options, None).unwrap_err();
        assert!(matches!(err, SyncError::BulkConflict { .. }));
    }

    #[test]
    fn blob_row_encode_decode_round_trips() {
        let row = encode_blob_row("hash1", "image/png", b"some bytes");
        let (hash, mime, data) = decode_blob_row(&row).unwrap();
        assert_eq!(hash, "hash1");
        assert_eq!(mime, "image/png");
        assert_eq!(data, b"some bytes");
    }
}
