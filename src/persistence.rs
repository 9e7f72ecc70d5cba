//! On-disk persistence
//!
//! Directory layout:
//! ```text
//! data/
//! ├── catalog.json             # known workspace ids, database name/version
//! └── workspaces/
//!     ├── <workspace_id>.jsonl # full snapshot, same shape as a backup stream
//!     └── ...
//! ```
//!
//! Snapshots are whole-workspace rewrites, written to a `.tmp` sibling and
//! renamed into place so a crash mid-write never corrupts the previous
//! snapshot. The on-disk shape is exactly the backup stream format (see
//! `backup`), so `or3-syncd --export` and a crash-recovery snapshot load go
//! through the same reader.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use log::error;
use serde::{Deserialize, Serialize};

use crate::backup::{self, ImportOptions};
use crate::engine::blob::BlobGateway;
use crate::engine::store::{SyncStore, WorkspaceState};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Catalog {
    database_name: String,
    database_version: u32,
    workspaces: Vec<String>,
}

impl Catalog {
    fn new(database_name: &str, database_version: u32) -> Self {
        Self {
            database_name: database_name.to_string(),
            database_version,
            workspaces: Vec::new(),
        }
    }
}

pub struct PersistenceStore {
    data_dir: PathBuf,
    database_name: String,
    database_version: u32,
}

impl PersistenceStore {
    pub fn open(data_dir: impl Into<PathBuf>, database_name: &str, database_version: u32) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(data_dir.join("workspaces"))?;

        Ok(Self {
            data_dir,
            database_name: database_name.to_string(),
            database_version,
        })
    }

    fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    fn workspace_path(&self, workspace_id: &str) -> PathBuf {
        self.data_dir
            .join("workspaces")
            .join(format!("{}.jsonl", sanitize_path_segment(workspace_id)))
    }

    fn load_catalog(&self) -> Result<Catalog> {
        let path = self.catalog_path();
        if !path.exists() {
            return Ok(Catalog::new(&self.database_name, self.database_version));
        }
        let file = File::open(&path)?;
        let catalog: Catalog = serde_json::from_reader(BufReader::new(file))?;
        Ok(catalog)
    }

    fn save_catalog(&self, catalog: &Catalog) -> Result<()> {
        let path = self.catalog_path();
        let tmp = path.with_extension("json.tmp");
        let file = File::create(&tmp)?;
        serde_json::to_writer_pretty(BufWriter::new(file), catalog)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    /// Load every known workspace's snapshot into `store`. Workspaces with
    /// no snapshot file (new since last catalog write) are skipped.
    pub fn load_all(&self, store: &SyncStore, blobs: Option<&BlobGateway>) -> Result<usize> {
        let catalog = self.load_catalog()?;
        let mut loaded = 0;
        for workspace_id in &catalog.workspaces {
            let path = self.workspace_path(workspace_id);
            if !path.exists() {
                continue;
            }
            let file = File::open(&path)?;
            let slot = store.slot(workspace_id);
            let mut state = slot.state.write().unwrap();
            backup::import_workspace(
                &mut state,
                &self.database_name,
                self.database_version,
                BufReader::new(file),
                ImportOptions {
                    clear_tables: true,
                    overwrite_values: true,
                },
                blobs,
            )?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Write one workspace's full snapshot, then register it in the catalog
    /// if this is its first save.
    pub fn save_workspace(
        &self,
        workspace_id: &str,
        state: &WorkspaceState,
        created_at: &str,
        blobs: Option<&BlobGateway>,
    ) -> Result<()> {
        let path = self.workspace_path(workspace_id);
        let tmp = path.with_extension("jsonl.tmp");

        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        backup::export_workspace(
            state,
            &self.database_name,
            self.database_version,
            created_at,
            workspace_id,
            blobs,
            &mut writer,
        )?;
        drop(writer);
        fs::rename(tmp, path)?;

        let mut catalog = self.load_catalog()?;
        if !catalog.workspaces.iter().any(|w| w == workspace_id) {
            catalog.workspaces.push(workspace_id.to_string());
            self.save_catalog(&catalog)?;
        }

        Ok(())
    }

    /// Save a workspace on a blocking thread pool, for foreground callers
    /// that don't want disk I/O on the hot path. Errors are logged, not
    /// propagated — the in-memory state remains authoritative until the
    /// next successful flush. `blobs` is not `Send` across the blocking
    /// thread boundary by reference, so the gateway itself must be `Arc`-held
    /// by the caller and passed in owned.
    pub async fn save_workspace_async(
        self: Arc<Self>,
        workspace_id: String,
        snapshot: WorkspaceState,
        created_at: String,
        blobs: Option<Arc<BlobGateway>>,
    ) {
        let result = tokio::task::spawn_blocking(move || {
            self.save_workspace(&workspace_id, &snapshot, &created_at, blobs.as_deref())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("persistence snapshot write failed: {}", e),
            Err(e) => error!("persistence snapshot task panicked: {}", e),
        }
    }
}

fn sanitize_path_segment(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
