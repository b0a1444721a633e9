//! Transport layer for dispatcher ↔ worker communication.
//!
//! Provides length-prefixed framing over any byte stream, the wire record
//! types, and the authenticated, encrypted [`SecureChannel`] built on top.

pub mod noise;
pub mod protocol;

pub use noise::{ChannelError, PeerPolicy, SecureChannel};
pub use protocol::CommandRecord;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum message size (64 MB). Safety valve against malformed messages.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("peer closed the connection")]
    Closed,

    #[error("message exceeds max size: {0} > {MAX_MESSAGE_SIZE}")]
    TooLarge(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or(FrameError::TooLarge(payload.len()))?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns the raw payload bytes. Enforces `MAX_MESSAGE_SIZE`. A stream that
/// ends cleanly before the length prefix is reported as [`FrameError::Closed`].
pub async fn recv_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(len as usize));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_framing() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        send_message(&mut buf, payload).await.unwrap();
        assert_eq!(&buf[..4], &11u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn empty_payload() {
        let mut buf = Vec::new();
        send_message(&mut buf, b"").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn eof_before_prefix_is_closed() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            recv_message(&mut cursor).await,
            Err(FrameError::Closed)
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_io_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            recv_message(&mut cursor).await,
            Err(FrameError::Io(_))
        ));
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected() {
        let buf = (MAX_MESSAGE_SIZE + 1).to_be_bytes().to_vec();
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            recv_message(&mut cursor).await,
            Err(FrameError::TooLarge(_))
        ));
    }
}
