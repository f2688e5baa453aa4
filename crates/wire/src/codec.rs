//! Length-prefixed CBOR framing.
//!
//! A frame is a u32 big-endian length followed by the CBOR encoding of a
//! [`Message`]. The length guard is local and non-negotiated so a bad peer
//! can't make us allocate arbitrary buffers.

use crate::{Message, WireError};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Preprocessed units dominate frame sizes; 64 MiB leaves headroom for even
/// pathological boost-style translation units.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub type FramedIo<T> = Framed<T, LengthDelimitedCodec>;

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> FramedIo<T> {
  LengthDelimitedCodec::builder()
    .max_frame_length(MAX_FRAME_LEN)
    .length_field_type::<u32>()
    .new_framed(io)
}

pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
  let bytes = serde_cbor::to_vec(message)?;
  if bytes.len() > MAX_FRAME_LEN {
    return Err(WireError::FrameTooLarge(bytes.len(), MAX_FRAME_LEN));
  }
  Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
  if bytes.len() > MAX_FRAME_LEN {
    return Err(WireError::FrameTooLarge(bytes.len(), MAX_FRAME_LEN));
  }
  Ok(serde_cbor::from_slice(bytes)?)
}

pub async fn send<T: AsyncRead + AsyncWrite + Unpin>(
  io: &mut FramedIo<T>,
  message: &Message,
) -> Result<(), WireError> {
  let bytes = encode(message)?;
  io.send(Bytes::from(bytes)).await?;
  Ok(())
}

/// Read the next frame. `Ok(None)` is a clean close.
pub async fn recv<T: AsyncRead + AsyncWrite + Unpin>(
  io: &mut FramedIo<T>,
) -> Result<Option<Message>, WireError> {
  match io.next().await {
    Some(Ok(bytes)) => Ok(Some(decode(&bytes)?)),
    Some(Err(err)) => Err(WireError::Io(err)),
    None => Ok(None),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::{UnixListener, UnixStream};

  #[tokio::test]
  async fn test_framed_round_trip_over_unix_socket() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("wire.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let mut io = framed(stream);
      let msg = recv(&mut io).await.unwrap().unwrap();
      send(&mut io, &msg).await.unwrap();
    });

    let stream = UnixStream::connect(&path).await.unwrap();
    let mut io = framed(stream);
    send(&mut io, &Message::JobRequest { num_jobs: 4 }).await.unwrap();
    let echoed = recv(&mut io).await.unwrap().unwrap();
    assert!(matches!(echoed, Message::JobRequest { num_jobs: 4 }));
    server.await.unwrap();
  }
}
