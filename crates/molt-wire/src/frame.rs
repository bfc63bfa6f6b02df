//! Length-prefixed binary framing over stdio or a Unix domain socket.
//!
//! Wire format: a 4-byte little-endian unsigned length followed by exactly
//! that many payload bytes. Both a blocking (`std::io`) and an async
//! (`tokio::io`) implementation share the same format and size limit so the
//! worker's synchronous and cooperative runtimes speak identically to the
//! offload client.

use std::io::{self, Read, Write};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default max frame size: 16 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Errors surfaced while reading or writing a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds max frame size {max} bytes")]
    OversizedFrame { size: u32, max: u32 },
    #[error("connection closed mid-frame")]
    TruncatedFrame,
    #[error("i/o error while framing: {0}")]
    Io(#[from] io::Error),
}

/// Reads one frame from a blocking reader. Returns `Ok(None)` on a clean EOF
/// before any bytes of the next frame's length prefix have been read.
pub fn read_frame<R: Read>(reader: &mut R, max_frame_bytes: u32) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; LENGTH_PREFIX_BYTES];
    match read_exact_or_eof(reader, &mut header)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Partial => return Err(FrameError::TruncatedFrame),
        ReadOutcome::Full => {}
    }

    let size = u32::from_le_bytes(header);
    if size == 0 || size > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size,
            max: max_frame_bytes,
        });
    }

    let mut buf = vec![0u8; size as usize];
    reader.read_exact(&mut buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::TruncatedFrame
        } else {
            FrameError::Io(err)
        }
    })?;
    Ok(Some(buf))
}

/// Writes one frame to a blocking writer. Callers must serialize access to
/// `writer` across threads — a length prefix and its payload must never
/// interleave with another writer's.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let size = u32::try_from(payload.len()).map_err(|_| FrameError::OversizedFrame {
        size: u32::MAX,
        max: u32::MAX,
    })?;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                });
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(ReadOutcome::Full)
}

/// Reads one frame from an async reader. Returns `Ok(None)` on clean EOF.
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; LENGTH_PREFIX_BYTES];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FrameError::TruncatedFrame)
            };
        }
        filled += n;
    }

    let size = u32::from_le_bytes(header);
    if size == 0 || size > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size,
            max: max_frame_bytes,
        });
    }

    let mut buf = vec![0u8; size as usize];
    reader.read_exact(&mut buf).await.map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::TruncatedFrame
        } else {
            FrameError::Io(err)
        }
    })?;
    Ok(Some(buf))
}

/// Writes one frame to an async writer. Callers must serialize access to
/// `writer` (e.g. behind a `tokio::sync::Mutex`) across tasks.
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let size = u32::try_from(payload.len()).map_err(|_| FrameError::OversizedFrame {
        size: u32::MAX,
        max: u32::MAX,
    })?;
    writer.write_all(&size.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        let mut cursor = Cursor::new(buf);
        let framed = read_frame(&mut cursor, DEFAULT_MAX_FRAME_BYTES).unwrap().unwrap();
        assert_eq!(framed, b"hello");
    }

    #[test]
    fn empty_stream_is_clean_eof() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor, DEFAULT_MAX_FRAME_BYTES).unwrap().is_none());
    }

    #[test]
    fn truncated_length_prefix_errors() {
        let mut cursor = Cursor::new(vec![0u8, 1]);
        let err = read_frame(&mut cursor, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(err, FrameError::TruncatedFrame));
    }

    #[test]
    fn truncated_body_errors() {
        let mut buf = 10u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"short");
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(err, FrameError::TruncatedFrame));
    }

    #[test]
    fn oversized_frame_rejected_before_reading_body() {
        let mut buf = (DEFAULT_MAX_FRAME_BYTES + 1).to_le_bytes().to_vec();
        let mut cursor = Cursor::new(buf.clone());
        let err = read_frame(&mut cursor, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(err, FrameError::OversizedFrame { .. }));
        buf.truncate(4);
        assert_eq!(buf.len(), 4);
    }

    #[tokio::test]
    async fn async_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame_async(&mut buf, b"world").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let framed = read_frame_async(&mut cursor, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(framed, b"world");
    }

    #[tokio::test]
    async fn async_empty_stream_is_clean_eof() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_frame_async(&mut cursor, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap()
            .is_none());
    }
}
