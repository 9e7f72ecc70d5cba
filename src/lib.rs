use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::time::sleep;

pub mod backup;
pub mod engine;
pub mod error;
pub mod hlc;
pub mod persistence;
pub mod protocol;
pub mod types;

use crate::engine::auth::{Authorizer, InMemoryAuthorizer};
use crate::engine::blob::{BlobGateway, FsBlobStore};
use crate::engine::gc::{discover_and_schedule, DEFAULT_RETENTION_SECS};
use crate::engine::store::SyncStore;
use crate::engine::SyncEngine;
use crate::persistence::PersistenceStore;
use crate::protocol::ConnectionHandler;

/// Server configuration
#[derive(Clone)]
pub struct Config {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Directory for on-disk snapshots
    pub data_dir: PathBuf,
    /// Database name embedded in snapshot/backup headers
    pub database_name: String,
    /// Database schema version embedded in snapshot/backup headers
    pub database_version: u32,
    /// How long a change-log row or tombstone survives before GC collects it
    pub retention_secs: u64,
    /// HMAC secret for signing blob presign tokens. Rotate to invalidate all
    /// outstanding tokens at once.
    pub blob_secret: Vec<u8>,
    /// How often the background flush task snapshots every known workspace
    /// to disk.
    pub snapshot_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7420".parse().expect("invalid default bind address"),
            data_dir: PathBuf::from("./data"),
            database_name: "or3".to_string(),
            database_version: 1,
            retention_secs: DEFAULT_RETENTION_SECS,
            blob_secret: b"change-me-in-production".to_vec(),
            snapshot_interval_secs: 300,
        }
    }
}

/// The sync server: accepts device connections and periodically
/// garbage-collects workspace history.
pub struct Server {
    config: Config,
    engine: Arc<SyncEngine>,
    persistence: Arc<PersistenceStore>,
    authorizer: Arc<InMemoryAuthorizer>,
}

impl Server {
    /// Create a new server, loading any existing on-disk snapshots.
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        std::fs::create_dir_all(&config.data_dir)?;

        let persistence = Arc::new(PersistenceStore::open(
            config.data_dir.clone(),
            &config.database_name,
            config.database_version,
        )?);

        let authorizer = Arc::new(InMemoryAuthorizer::new());
        let blob_store = FsBlobStore::new(config.data_dir.join("blobs"))?;
        let blob = BlobGateway::new(config.blob_secret.clone(), Box::new(blob_store));
        let engine = Arc::new(SyncEngine::new(
            Arc::new(SyncStore::new()),
            Arc::clone(&authorizer) as Arc<dyn Authorizer>,
            blob,
        ));

        let blob_handle = engine.blob();
        let loaded = persistence.load_all(engine.store(), Some(blob_handle.as_ref()))?;
        info!("loaded {} workspace snapshot(s) from {:?}", loaded, config.data_dir);

        Ok(Self {
            config,
            engine,
            persistence,
            authorizer,
        })
    }

    /// Grant `user_id` membership in `workspace_id` at the given role.
    /// Convenience for embedding callers and tests; the wire protocol has
    /// no membership-management RPC of its own.
    pub fn grant_membership(&self, workspace_id: &str, user_id: &str, role: crate::types::Role) {
        self.authorizer.set_role(workspace_id, user_id, role);
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Run the server: accept connections and run the background crons,
    /// until ctrl-c is received. Checkpoints every workspace to disk before
    /// returning.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("sync server listening on {}", self.config.bind_addr);
        info!("data directory: {:?}", self.config.data_dir);

        let gc_store = Arc::clone(self.engine.store());
        let retention_secs = self.config.retention_secs;
        tokio::spawn(async move {
            loop {
                discover_and_schedule(Arc::clone(&gc_store), retention_secs, now_ms).await;
                sleep(Duration::from_secs(3600)).await;
            }
        });

        let flush_engine = Arc::clone(&self.engine);
        let flush_persistence = Arc::clone(&self.persistence);
        let snapshot_interval = Duration::from_secs(self.config.snapshot_interval_secs);
        tokio::spawn(async move {
            loop {
                sleep(snapshot_interval).await;
                flush_all_workspaces(&flush_engine, &flush_persistence).await;
            }
        });

        let rate_limit_engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(24 * 3600)).await;
                let purged = rate_limit_engine.cleanup_stale_rate_limits();
                if purged > 0 {
                    info!("rate limiter cleanup purged {} stale bucket(s)", purged);
                }
            }
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            info!("new connection from {}", addr);
                            if let Err(e) = stream.set_nodelay(true) {
                                error!("failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let engine = Arc::clone(&self.engine);
                            tokio::spawn(async move {
                                let handler = ConnectionHandler::new(stream, engine);
                                if let Err(e) = handler.run().await {
                                    error!("connection error from {}: {}", addr, e);
                                }
                                info!("connection closed: {}", addr);
                            });
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received, checkpointing workspaces before exit");
                    break;
                }
            }
        }

        self.checkpoint().await?;
        Ok(())
    }

    /// Flush every known workspace's in-memory state to disk. Called on
    /// graceful shutdown; the periodic flush task covers the running case.
    pub async fn checkpoint(&self) -> Result<(), Box<dyn std::error::Error>> {
        flush_all_workspaces(&self.engine, &self.persistence).await;
        Ok(())
    }
}

/// Snapshot every known workspace to disk. Errors are logged per-workspace
/// rather than aborting the rest of the flush.
async fn flush_all_workspaces(engine: &Arc<SyncEngine>, persistence: &Arc<PersistenceStore>) {
    let created_at = chrono_like_timestamp();
    let blob = engine.blob();
    for workspace_id in engine.store().known_workspaces() {
        let slot = engine.store().slot(&workspace_id);
        let snapshot = slot.state.read().unwrap().clone();
        persistence
            .clone()
            .save_workspace_async(workspace_id, snapshot, created_at.clone(), Some(Arc::clone(&blob)))
            .await;
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A minimal RFC3339-ish timestamp for backup/snapshot headers, without
/// pulling in a dedicated time-formatting crate for one field.
fn chrono_like_timestamp() -> String {
    let secs = now_ms() / 1000;
    format!("unix:{}", secs)
}
