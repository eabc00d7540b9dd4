//! Length-prefixed frames: a big-endian `u32` length, then a bincode body.

use herd_proto::MAX_FRAME_LEN;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ChannelError;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ChannelError> {
    let body = bincode::serialize(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, ChannelError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_proto::{Envelope, Request, SubmitMode};

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let bogus = ((MAX_FRAME_LEN as u32) + 1).to_be_bytes();
        let mut reader = &bogus[..];
        let result: Result<Option<Envelope<Request>>, _> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(ChannelError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn empty_stream_is_clean_eof() {
        let mut reader: &[u8] = &[];
        let result: Option<Envelope<Request>> = read_frame(&mut reader).await.expect("eof");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn frames_keep_their_order() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        for id in 0..3u64 {
            let envelope = Envelope {
                id,
                mode: SubmitMode::Await,
                body: Request::Ping,
            };
            write_frame(&mut client, &envelope).await.expect("write");
        }
        for id in 0..3u64 {
            let envelope: Envelope<Request> =
                read_frame(&mut server).await.expect("read").expect("frame");
            assert_eq!(envelope.id, id);
        }
    }
}
