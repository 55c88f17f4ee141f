//! Length-prefixed JSON framing.
//!
//! A frame is a header of exactly [`HEADER_LEN`] ASCII decimal digits giving
//! the body length in bytes, zero-padded, followed by that many bytes of a
//! single JSON object. Both sides of the link use the same framing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GridError, Result};

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 10;

/// Read one framed message, consuming exactly the declared body length.
///
/// Returns [`GridError::ConnectionClosed`] on a clean EOF at a frame
/// boundary and [`GridError::OversizedFrame`] when the declared length
/// exceeds `max_frame_bytes`.
pub async fn read_message<T, R>(reader: &mut R, max_frame_bytes: usize) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => GridError::ConnectionClosed,
            _ => GridError::Io(e),
        });
    }

    let header = std::str::from_utf8(&header)
        .map_err(|_| GridError::Protocol("frame header is not ASCII".to_string()))?;
    if !header.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GridError::Protocol(format!(
            "frame header is not decimal: {header:?}"
        )));
    }
    let len: usize = header
        .parse()
        .map_err(|_| GridError::Protocol(format!("bad frame length: {header:?}")))?;
    if len == 0 {
        return Err(GridError::Protocol("zero-length frame".to_string()));
    }
    if len > max_frame_bytes {
        return Err(GridError::OversizedFrame {
            got: len,
            max: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => GridError::ConnectionClosed,
        _ => GridError::Io(e),
    })?;

    serde_json::from_slice(&body)
        .map_err(|e| GridError::Protocol(format!("invalid frame body: {e}")))
}

/// Write one framed message. Header and body go out in a single write.
pub async fn write_message<T, W>(writer: &mut W, msg: &T, max_frame_bytes: usize) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > max_frame_bytes {
        return Err(GridError::OversizedFrame {
            got: body.len(),
            max: max_frame_bytes,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(format!("{:010}", body.len()).as_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
