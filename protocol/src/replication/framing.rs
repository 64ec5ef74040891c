//! Length-prefixed frames over any async byte stream.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────┐
//! │   Length     │               Payload                │
//! │ (4 bytes BE) │  bincode(Frame { channel, message }) │
//! └──────────────┴──────────────────────────────────────┘
//! ```
//!
//! A length above [`MAX_FRAME_SIZE`] is rejected before any allocation.
//! A clean EOF on a frame boundary reads as `Ok(None)`.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::messages::Message;
use crate::config::MAX_FRAME_SIZE;
use crate::crypto::Hash;

/// Errors raised while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("empty frame")]
    EmptyFrame,

    #[error("stream closed mid-frame")]
    Truncated,

    #[error("connection closed")]
    Closed,

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),
}

impl WireError {
    /// Whether the connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WireError::Encode(_))
    }
}

/// One message on one log's channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Discovery key of the log this message is about.
    pub channel: Hash,
    pub message: Message,
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let payload = bincode::serialize(frame).map_err(|e| WireError::Encode(e.to_string()))?;
    let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if size > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), WireError> {
    let buf = encode_frame(frame)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let size = u32::from_be_bytes(header);
    if size == 0 {
        return Err(WireError::EmptyFrame);
    }
    if size > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WireError::Truncated
        } else {
            WireError::Io(e)
        }
    })?;
    let frame = bincode::deserialize(&payload).map_err(|e| WireError::Decode(e.to_string()))?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(message: Message) -> Frame {
        Frame {
            channel: [7u8; 32],
            message,
        }
    }

    #[tokio::test]
    async fn frames_cross_a_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = frame(Message::Announce {
            length: 3,
            byte_length: 12,
            fork: 1,
        });
        write_frame(&mut a, &sent).await.unwrap();
        write_frame(&mut a, &frame(Message::Close)).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(sent));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(frame(Message::Close)));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_length_is_fatal() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn garbage_payload_fails_to_decode() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await.unwrap_err(),
            WireError::Decode(_)
        ));
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_truncation() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(&[1, 2]).await.unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await.unwrap_err(),
            WireError::Truncated
        ));
    }
}
