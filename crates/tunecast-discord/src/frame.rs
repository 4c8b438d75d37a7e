// # IPC Framing
//
// Every message on the Discord IPC socket is a frame:
//
// ```text
// ┌──────────────┬──────────────┬─────────────────────┐
// │ opcode u32le │ length u32le │ JSON payload (len)  │
// └──────────────┴──────────────┴─────────────────────┘
// ```

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::IpcError;

/// Upper bound on an inbound payload
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

const HEADER_LEN: usize = 8;

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Handshake = 0,
    Frame = 1,
    Close = 2,
    Ping = 3,
    Pong = 4,
}

impl TryFrom<u32> for Opcode {
    type Error = IpcError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::Frame),
            2 => Ok(Self::Close),
            3 => Ok(Self::Ping),
            4 => Ok(Self::Pong),
            other => Err(IpcError::Protocol(format!("unknown opcode {}", other))),
        }
    }
}

/// Serialize one frame
pub fn encode(op: Opcode, payload: &Value) -> Result<Vec<u8>, IpcError> {
    let body = serde_json::to_vec(payload)?;
    let len = u32::try_from(body.len())
        .map_err(|_| IpcError::Protocol("payload too large".to_string()))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(op as u32).to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_frame<W>(writer: &mut W, op: Opcode, payload: &Value) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(op, payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<(Opcode, Value), IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let op = Opcode::try_from(u32::from_le_bytes([header[0], header[1], header[2], header[3]]))?;
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(IpcError::Protocol(format!("frame of {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)?
    };
    Ok((op, payload))
}
