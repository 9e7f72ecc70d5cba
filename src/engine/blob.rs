//! Blob gateway: content-addressed file storage
//!
//! Presigned upload/download tokens bound to `(workspace, hash, ...)` via
//! HMAC-SHA256, plus a `file_meta` record keyed by content hash and a
//! ref-counted GC pass. The backing object store is a small trait so a
//! production deployment can swap in an S3-compatible implementation
//! without touching gateway logic; this crate ships a filesystem-backed
//! reference implementation under the data directory.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Result, SyncError};
use crate::types::FileKind;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_PRESIGN_TTL_SECS: u64 = 60;
pub const DEFAULT_FILE_GC_LIMIT: usize = 25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub hash: String,
    pub storage_id: String,
    pub provider_id: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub name: String,
    pub kind: Option<FileKind>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub page_count: Option<u32>,
    pub ref_count: u32,
    pub deleted: bool,
    pub deleted_at: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PresignPayload {
    workspace_id: String,
    hash: String,
    mime_type: Option<String>,
    size_bytes: Option<u64>,
    exp: u64,
}

pub trait BlobStore: Send + Sync {
    fn put(&self, storage_id: &str, data: &[u8]) -> Result<()>;
    fn get(&self, storage_id: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, storage_id: &str) -> Result<()>;
}

/// Filesystem-backed reference `BlobStore` implementation.
pub struct FsBlobStore {
    base_dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn path_for(&self, storage_id: &str) -> PathBuf {
        self.base_dir.join(storage_id)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, storage_id: &str, data: &[u8]) -> Result<()> {
        fs::write(self.path_for(storage_id), data)?;
        Ok(())
    }

    fn get(&self, storage_id: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(storage_id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, storage_id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(storage_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct BlobGateway {
    secret: Vec<u8>,
    store: Box<dyn BlobStore>,
    files: RwLock<HashMap<(String, String), FileMeta>>,
}

impl BlobGateway {
    pub fn new(secret: Vec<u8>, store: Box<dyn BlobStore>) -> Self {
        Self {
            secret,
            store,
            files: RwLock::new(HashMap::new()),
        }
    }

    fn sign(&self, payload_json: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(payload_json.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn generate_upload_url(
        &self,
        workspace_id: &str,
        hash: &str,
        mime_type: Option<&str>,
        size_bytes: Option<u64>,
        now_secs: u64,
    ) -> Result<String> {
        let payload = PresignPayload {
            workspace_id: workspace_id.to_string(),
            hash: hash.to_string(),
            mime_type: mime_type.map(|s| s.to_string()),
            size_bytes,
            exp: now_secs + DEFAULT_PRESIGN_TTL_SECS,
        };
        Ok(self.make_token(&payload)?)
    }

    fn make_token(&self, payload: &PresignPayload) -> Result<String> {
        let json = serde_json::to_string(payload)?;
        let sig = self.sign(&json);
        let encoded = URL_SAFE_NO_PAD.encode(json.as_bytes());
        Ok(format!("{}.{}", encoded, sig))
    }

    fn verify_token(&self, token: &str, now_secs: u64) -> Result<PresignPayload> {
        let (encoded, sig) = token
            .split_once('.')
            .ok_or_else(|| SyncError::invalid_payload("malformed presign token"))?;
        let json_bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| SyncError::invalid_payload("malformed presign token"))?;
        let json = String::from_utf8(json_bytes)
            .map_err(|_| SyncError::invalid_payload("malformed presign token"))?;

        let expected_sig = self.sign(&json);
        if !constant_time_eq(expected_sig.as_bytes(), sig.as_bytes()) {
            return Err(SyncError::unauthorized("presign token signature mismatch"));
        }

        let payload: PresignPayload = serde_json::from_str(&json)?;
        if now_secs > payload.exp {
            return Err(SyncError::unauthorized("presign token expired"));
        }
        Ok(payload)
    }

    pub fn commit_upload(
        &self,
        workspace_id: &str,
        hash: String,
        storage_id: String,
        provider_id: String,
        mime_type: String,
        size_bytes: u64,
        name: String,
        kind: Option<FileKind>,
        width: Option<u32>,
        height: Option<u32>,
        page_count: Option<u32>,
    ) -> Result<()> {
        // The client uploads bytes to `storage_id` directly via the presigned
        // URL before calling this; if they've landed, check the claimed
        // content hash against what's actually sitting there.
        if let Some(data) = self.store.get(&storage_id)? {
            let digest = hex::encode(Md5::digest(&data));
            if digest != hash {
                return Err(SyncError::invalid_payload(format!(
                    "content hash mismatch: claimed {} but uploaded bytes hash to {}",
                    hash, digest
                )));
            }
        }

        let key = (workspace_id.to_string(), hash.clone());
        let mut files = self.files.write().unwrap();
        files
            .entry(key)
            .and_modify(|existing| {
                existing.storage_id = storage_id.clone();
                existing.provider_id = provider_id.clone();
                existing.mime_type = mime_type.clone();
                existing.size_bytes = size_bytes;
                existing.deleted = false;
                existing.deleted_at = None;
            })
            .or_insert_with(|| FileMeta {
                hash,
                storage_id,
                provider_id,
                mime_type,
                size_bytes,
                name,
                kind,
                width,
                height,
                page_count,
                ref_count: 1,
                deleted: false,
                deleted_at: None,
            });
        Ok(())
    }

    pub fn get_file_url(
        &self,
        workspace_id: &str,
        hash: &str,
        now_secs: u64,
    ) -> Result<Option<String>> {
        let files = self.files.read().unwrap();
        let meta = match files.get(&(workspace_id.to_string(), hash.to_string())) {
            Some(m) if !m.deleted => m,
            _ => return Ok(None),
        };
        let payload = PresignPayload {
            workspace_id: workspace_id.to_string(),
            hash: meta.storage_id.clone(),
            mime_type: Some(meta.mime_type.clone()),
            size_bytes: Some(meta.size_bytes),
            exp: now_secs + DEFAULT_PRESIGN_TTL_SECS,
        };
        Ok(Some(self.make_token(&payload)?))
    }

    /// Read back the object for a verified presign token. Exposed mainly
    /// for tests and local tooling; a real deployment serves this over an
    /// HTTP GET handler keyed by the same token.
    pub fn fetch_blob(&self, token: &str, now_secs: u64) -> Result<Vec<u8>> {
        let payload = self.verify_token(token, now_secs)?;
        self.store
            .get(&payload.hash)?
            .ok_or_else(|| SyncError::StorageFatal("blob object missing".to_string()))
    }

    pub fn store_blob(&self, storage_id: &str, data: &[u8]) -> Result<()> {
        self.store.put(storage_id, data)
    }

    /// Enumerate every live blob in `workspace_id` with backing bytes still
    /// present, for the backup stream's `file_blobs` section. Deleted or
    /// data-less entries are skipped; a subsequent `gc_deleted_files` pass
    /// would have removed them anyway.
    pub fn export_blobs(&self, workspace_id: &str) -> Result<Vec<(String, String, Vec<u8>)>> {
        let files = self.files.read().unwrap();
        let mut out = Vec::new();
        for ((ws, hash), meta) in files.iter() {
            if ws != workspace_id || meta.deleted {
                continue;
            }
            if let Some(data) = self.store.get(&meta.storage_id)? {
                out.push((hash.clone(), meta.mime_type.clone(), data));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Restore a blob's bytes under its content hash as the storage key.
    /// Callers importing a `file_meta` row alongside this blob should use
    /// the hash itself as `storage_id` so `get_file_url`/`fetch_blob`
    /// resolve against the restored object.
    pub fn import_blob(&self, hash: &str, data: &[u8]) -> Result<()> {
        self.store.put(hash, data)
    }

    /// Delete `file_meta` rows that are soft-deleted, unreferenced, and
    /// past retention. Bounded by `limit` per invocation.
    pub fn gc_deleted_files(
        &self,
        workspace_id: &str,
        retention_secs: u64,
        now_secs: u64,
        limit: usize,
    ) -> Result<usize> {
        let cutoff = now_secs.saturating_sub(retention_secs);
        let mut files = self.files.write().unwrap();

        let eligible: Vec<(String, String)> = files
            .iter()
            .filter(|((ws, _), meta)| {
                ws == workspace_id
                    && meta.deleted
                    && meta.ref_count == 0
                    && meta.deleted_at.map(|d| d < cutoff).unwrap_or(false)
            })
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &eligible {
            if let Some(meta) = files.get(key) {
                self.store.delete(&meta.storage_id)?;
            }
            files.remove(key);
        }

        Ok(eligible.len())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
