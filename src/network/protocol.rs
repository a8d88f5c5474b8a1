//! Wire protocol framing and message model.
//!
//! Every message is a 4-byte big-endian length prefix followed by one
//! JSON document. Requests carry the caller identity in the `client_id`
//! metadata field and select an operation with the `op` tag; opaque
//! value bytes travel base64-encoded. Responses echo the request id;
//! streaming operations reuse the same frame shape, one frame per event.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Upper bound for a single frame. A value is at most MAX_VALUE_SIZE,
/// so this leaves generous headroom for encoding overhead.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024; // 64 MB

/// One request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    /// Caller identity metadata; required on every call
    #[serde(default)]
    pub client_id: String,
    #[serde(flatten)]
    pub body: RequestBody,
}

/// Operation selector and parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RequestBody {
    Set {
        key: String,
        #[serde(with = "crate::store::b64", default)]
        value: Vec<u8>,
        #[serde(default)]
        content_type: Option<String>,
        /// Duration string, e.g. "10s"
        #[serde(default)]
        lock_duration: Option<String>,
        #[serde(default)]
        lifespan: Option<String>,
    },
    Get {
        key: String,
    },
    GetRevision {
        key: String,
        /// 0 selects the current value, 1 the oldest retained revision
        #[serde(default)]
        version: u64,
    },
    Inspect {
        key: String,
        #[serde(default)]
        include_value: bool,
        #[serde(default)]
        include_metrics: bool,
    },
    Delete {
        key: String,
    },
    Exists {
        key: String,
    },
    Pop {
        key: String,
    },
    Clear {
        #[serde(default)]
        force: bool,
    },
    ListKeys {
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        limit: usize,
        #[serde(default)]
        include_reserved: bool,
    },
    Stats,
    ClearHistory,
    Lock {
        key: String,
        duration: String,
        #[serde(default)]
        create_if_missing: bool,
    },
    Unlock {
        key: String,
    },
    Register,
    SetReadOnly {
        enable: bool,
    },
    GetKeyMetric {
        key: String,
    },
    WatchStream {
        #[serde(default)]
        keys: Vec<String>,
        #[serde(default)]
        kinds: Vec<String>,
        #[serde(default)]
        client_ids: Vec<String>,
    },
    WatchKeyValue {
        key: String,
    },
    Prune {
        prune_to: u64,
        #[serde(default)]
        ignore_keys: Vec<String>,
    },
    Shutdown,
}

/// Error payload mirrored from the kernel taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

/// One response or stream frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: &Error) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(WireError {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
        }
    }
}

/// Read one framed message. Returns Ok(None) on a clean close at a
/// frame boundary.
pub async fn read_message<S, M>(stream: &mut S) -> Result<Option<M>>
where
    S: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let len = match stream.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(anyhow!("frame length {} out of bounds", len));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    let message = serde_json::from_slice(&buf)?;
    Ok(Some(message))
}

/// Write one framed message.
pub async fn write_message<S, M>(stream: &mut S, message: &M) -> Result<()>
where
    S: AsyncWrite + Unpin,
    M: Serialize,
{
    let buf = serde_json::to_vec(message)?;
    if buf.len() as u64 > MAX_MESSAGE_SIZE as u64 {
        return Err(anyhow!("frame length {} out of bounds", buf.len()));
    }
    stream.write_u32(buf.len() as u32).await?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}
