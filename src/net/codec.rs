// Wire framing
//
// Frames are a 4-byte big-endian length prefix followed by the serialized
// payload. The payload cap is enforced on both the encode and decode paths;
// an oversize frame closes the channel rather than allocating.

use crate::error::{ClusterError, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes of length prefix preceding every payload.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Assemble one frame into a fresh buffer.
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<BytesMut> {
    if payload.len() > max_frame_size {
        return Err(ClusterError::FrameTooLarge(payload.len(), max_frame_size));
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf)
}

/// Read one frame. `Ok(None)` means the peer closed the stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(prefix) as usize;
    if length > max_frame_size {
        return Err(ClusterError::FrameTooLarge(length, max_frame_size));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_frame_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_frame_size {
        return Err(ClusterError::FrameTooLarge(payload.len(), max_frame_size));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
