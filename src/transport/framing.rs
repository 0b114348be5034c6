use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Upper bounds so a broken peer can't make us allocate unbounded buffers.
const MAX_FRAMES: u32 = 16;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// One wire message is a `u32` frame count followed by `u32`-length-prefixed
/// frames, all big-endian. Request/reply traffic uses one frame; pub/sub
/// traffic uses two (`[topic, payload]`).
pub(crate) async fn write_frames<W>(writer: &mut W, frames: &[Bytes]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload_len: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut out = BytesMut::with_capacity(4 + payload_len);
    out.put_u32(frames.len() as u32);
    for frame in frames {
        out.put_u32(frame.len() as u32);
        out.put_slice(frame);
    }

    writer.write_all(&out).await?;
    writer.flush().await
}

/// Read one message. Returns `Ok(None)` on a clean EOF at a message
/// boundary; EOF mid-message is an error.
pub(crate) async fn read_frames<R>(reader: &mut R) -> io::Result<Option<Vec<Bytes>>>
where
    R: AsyncRead + Unpin,
{
    let mut count_buf = [0u8; 4];
    match reader.read_exact(&mut count_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let count = u32::from_be_bytes(count_buf);
    if count == 0 || count > MAX_FRAMES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame count {} out of range", count),
        ));
    }

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }

        let mut frame = vec![0u8; len as usize];
        reader.read_exact(&mut frame).await?;
        frames.push(Bytes::from(frame));
    }

    Ok(Some(frames))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multipart_round_trip() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);

        let message = vec![Bytes::from_static(b"geral"), Bytes::from_static(b"payload")];
        write_frames(&mut writer, &message).await.expect("write");
        write_frames(&mut writer, &[Bytes::from_static(b"solo")])
            .await
            .expect("write second");
        drop(writer);

        let first = read_frames(&mut reader).await.expect("read").expect("message");
        assert_eq!(first, message);
        let second = read_frames(&mut reader).await.expect("read").expect("message");
        assert_eq!(second, vec![Bytes::from_static(b"solo")]);
        assert!(read_frames(&mut reader).await.expect("clean eof").is_none());
    }

    #[tokio::test]
    async fn eof_mid_message_is_an_error() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        // Announce two frames, deliver none.
        writer.write_all(&2u32.to_be_bytes()).await.expect("write count");
        drop(writer);

        read_frames(&mut reader).await.expect_err("truncated message");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        writer.write_all(&1u32.to_be_bytes()).await.expect("count");
        writer
            .write_all(&(MAX_FRAME_LEN + 1).to_be_bytes())
            .await
            .expect("len");
        drop(writer);

        read_frames(&mut reader).await.expect_err("oversized frame");
    }
}
