use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Encoding error: {0}")]
  Cbor(#[from] serde_cbor::Error),
  #[error("Frame too large: {0} bytes (max {1})")]
  FrameTooLarge(usize, usize),
  #[error("Connection closed")]
  Closed,
}
