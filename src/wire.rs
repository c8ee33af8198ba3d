//! Length-prefixed JSON frames for the receiver control stream.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON object.
//! The receiver sends a single [`ClientRequest`] and gets a single
//! [`ClientResponse`] back; nothing else ever crosses the control stream.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Anything larger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Opening request on the control stream.
///
/// `auth_token` is reserved for a future pre-shared credential and may be
/// empty. `intention` is advisory ("get" is the only mode in use); neither
/// field affects routing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub intention: String,
}

/// The minted token, sent back on the control stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub token: String,
}

pub async fn send_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message).context("Failed to serialize frame")?;
    if payload.len() > MAX_FRAME_LEN {
        bail!("Frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit", payload.len());
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .context("Failed to write frame length")?;
    writer
        .write_all(&payload)
        .await
        .context("Failed to write frame payload")?;
    writer.flush().await.context("Failed to flush frame")?;
    Ok(())
}

pub async fn recv_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .context("Failed to read frame length")?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        bail!("Frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit");
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;
    serde_json::from_slice(&payload).context("Failed to parse frame as JSON")
}
