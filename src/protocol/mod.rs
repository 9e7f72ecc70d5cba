//! Wire protocol for device connections
//!
//! ## Protocol overview
//!
//! 1. **Hello**: first frame on a connection must be `{"rpc":"hello", ...}`,
//!    establishing the caller's `userId`/`deviceId` for the lifetime of the
//!    socket.
//! 2. **Request/response phase**: any number of RPC envelopes, each echoing
//!    its `requestId` back in the matching response.
//!
//! ## Framing
//! One newline-terminated JSON object per frame (see `framing`).
//!
//! ## Architecture
//! - `framing`: line-delimited JSON I/O over the split TCP stream
//! - `rpc`: envelope types and dispatch against `SyncEngine`

mod framing;
mod rpc;

use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::TcpStream;

use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};

pub use rpc::{Envelope, HelloParams, Identity, Response};

/// Handles a single device connection for its whole lifetime.
pub struct ConnectionHandler {
    engine: Arc<SyncEngine>,
    stream: TcpStream,
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, engine: Arc<SyncEngine>) -> Self {
        Self { engine, stream }
    }

    pub async fn run(self) -> Result<()> {
        let (mut reader, mut writer) = framing::split(self.stream);

        let identity = match reader.read_frame::<Envelope>().await? {
            Some(envelope) if envelope.rpc == "hello" => {
                let hello: HelloParams = serde_json::from_value(envelope.params.clone())
                    .map_err(|e| SyncError::invalid_payload(format!("invalid hello params: {}", e)))?;
                let identity = Identity {
                    user_id: hello.user_id,
                    device_id: hello.device_id,
                };
                writer
                    .write_frame(&Response::ok(envelope.request_id, serde_json::json!({})))
                    .await?;
                identity
            }
            Some(envelope) => {
                let err = SyncError::invalid_payload("first frame on a connection must be hello");
                writer
                    .write_frame(&Response::err(envelope.request_id, &err))
                    .await?;
                return Err(err);
            }
            None => return Ok(()),
        };

        info!(
            "device connected: user={} device={}",
            identity.user_id, identity.device_id
        );

        loop {
            let envelope = match reader.read_frame::<Envelope>().await {
                Ok(Some(e)) => e,
                Ok(None) => break,
                Err(e) => {
                    warn!("malformed frame from {}: {}", identity.device_id, e);
                    break;
                }
            };

            let response = rpc::dispatch(&self.engine, &identity, envelope).await;
            if let Err(e) = writer.write_frame(&response).await {
                error!("failed to write response to {}: {}", identity.device_id, e);
                break;
            }
        }

        info!("device disconnected: device={}", identity.device_id);
        Ok(())
    }
}
