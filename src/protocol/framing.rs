//! Line-delimited JSON framing over a TCP stream
//!
//! Each frame is exactly one JSON value terminated by `\n`. No length
//! prefix: JSON values are self-delimiting and `serde_json` will not
//! consume the trailing newline, so `BufReader::read_line` is a correct and
//! simple boundary.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SyncError};

pub struct FrameReader {
    reader: BufReader<OwnedReadHalf>,
    line_buf: String,
}

pub struct FrameWriter {
    writer: OwnedWriteHalf,
}

pub fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FrameReader {
            reader: BufReader::new(read_half),
            line_buf: String::new(),
        },
        FrameWriter { writer: write_half },
    )
}

impl FrameReader {
    /// Read one frame. Returns `Ok(None)` on clean EOF (connection closed
    /// between frames).
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        self.line_buf.clear();
        let bytes_read = self.reader.read_line(&mut self.line_buf).await?;
        if bytes_read == 0 {
            return Ok(None);
        }
        let trimmed = self.line_buf.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(trimmed)
            .map_err(|e| SyncError::invalid_payload(format!("malformed frame: {}", e)))?;
        Ok(Some(value))
    }
}

impl FrameWriter {
    pub async fn write_frame<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut json = serde_json::to_string(value)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
