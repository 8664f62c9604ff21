//! Multiplexing frame codec.
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//! +------------+--------+-------------+-----------------+
//! | channel u32| kind u8| length u32  | payload[length] |
//! +------------+--------+-------------+-----------------+
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::DecodeError;

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 9;

/// Largest payload a single frame may carry (1 MiB).
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Open a channel; payload is the channel kind label.
    Open = 1,
    /// Channel data.
    Data = 2,
    /// Close a channel.
    Close = 3,
    /// Grant the peer more send window; payload is a u32 increment.
    Window = 4,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(FrameKind::Open),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::Close),
            4 => Ok(FrameKind::Window),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

/// A single multiplexing frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u32,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn open(channel: u32, label: &str) -> Self {
        Self {
            channel,
            kind: FrameKind::Open,
            payload: label.as_bytes().to_vec(),
        }
    }

    pub fn data(channel: u32, payload: Vec<u8>) -> Self {
        Self {
            channel,
            kind: FrameKind::Data,
            payload,
        }
    }

    pub fn close(channel: u32) -> Self {
        Self {
            channel,
            kind: FrameKind::Close,
            payload: Vec::new(),
        }
    }

    pub fn window(channel: u32, increment: u32) -> Self {
        Self {
            channel,
            kind: FrameKind::Window,
            payload: increment.to_be_bytes().to_vec(),
        }
    }

    /// The window increment carried by a `Window` frame.
    pub fn window_increment(&self) -> Option<u32> {
        if self.kind != FrameKind::Window || self.payload.len() != 4 {
            return None;
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.payload);
        Some(u32::from_be_bytes(raw))
    }

    /// The label carried by an `Open` frame.
    pub fn label(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Serialize the frame to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` holds an incomplete frame.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, DecodeError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let (channel, kind, len) = parse_header(&buf[..FRAME_HEADER_LEN])?;
        let total = FRAME_HEADER_LEN + len;
        if buf.len() < total {
            return Ok(None);
        }

        let frame = Frame {
            channel,
            kind,
            payload: buf[FRAME_HEADER_LEN..total].to_vec(),
        };
        Ok(Some((frame, total)))
    }
}

fn parse_header(header: &[u8]) -> Result<(u32, FrameKind, usize), DecodeError> {
    let channel = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let kind = FrameKind::from_u8(header[4])?;
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(DecodeError::PayloadTooLarge(len));
    }
    Ok((channel, kind, len))
}

/// Read one frame from an async stream.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, DecodeError> {
    let mut header = [0u8; FRAME_HEADER_LEN];

    let first = reader.read(&mut header[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut header[1..])
        .await
        .map_err(truncated)?;

    let (channel, kind, len) = parse_header(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(truncated)?;

    Ok(Some(Frame {
        channel,
        kind,
        payload,
    }))
}

/// Write one frame to an async stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await
}

fn truncated(e: std::io::Error) -> DecodeError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        DecodeError::Truncated
    } else {
        DecodeError::Io(e)
    }
}
