//! The translation-unit work item.

use crate::source::Source;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UnitError {
  #[error("compression error: {0}")]
  Compression(#[from] std::io::Error),
  #[error("preprocessed payload is not valid UTF-8")]
  Encoding,
}

/// CBOR byte-string serialization so `preprocessed` travels as a single
/// binary blob instead of an integer array.
mod preprocessed_bytes {
  use serde::de::{Error, SeqAccess, Visitor};
  use serde::{Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_bytes(bytes)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
      type Value = Vec<u8>;

      fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("a byte string (or a sequence of u8)")
      }

      fn visit_bytes<E: Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(v.to_vec())
      }

      fn visit_byte_buf<E: Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
        Ok(v)
      }

      fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut out = Vec::new();
        while let Some(byte) = seq.next_element::<u8>()? {
          out.push(byte);
        }
        Ok(out)
      }
    }

    deserializer.deserialize_any(BytesVisitor)
  }
}

/// A translation unit queued for indexing. Created when a compile command is
/// accepted; `preprocessed` is filled in by the preprocess pool when the
/// daemon is networked (or `force_preprocessing` is set) and stays empty for
/// raw local-only indexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
  pub source: Source,
  pub source_file: PathBuf,
  /// Creation time, epoch milliseconds
  pub time: i64,
  #[serde(with = "preprocessed_bytes")]
  pub preprocessed: Vec<u8>,
  /// `preprocessed` holds zstd-compressed bytes
  pub compressed: bool,
  pub preprocess_duration_ms: u64,
}

impl Unit {
  pub fn new(source: Source) -> Unit {
    let source_file = source.source_file.clone();
    Unit {
      source,
      source_file,
      time: chrono::Utc::now().timestamp_millis(),
      preprocessed: Vec::new(),
      compressed: false,
      preprocess_duration_ms: 0,
    }
  }

  /// Compress the preprocessed payload in place. No-op when already
  /// compressed or empty.
  pub fn compress(&mut self) -> Result<(), UnitError> {
    if self.compressed || self.preprocessed.is_empty() {
      return Ok(());
    }
    self.preprocessed = zstd::encode_all(&self.preprocessed[..], 0)?;
    self.compressed = true;
    Ok(())
  }

  /// The preprocessed payload as text, decompressing if needed.
  pub fn preprocessed_text(&self) -> Result<String, UnitError> {
    let bytes = if self.compressed {
      zstd::decode_all(&self.preprocessed[..])?
    } else {
      self.preprocessed.clone()
    };
    String::from_utf8(bytes).map_err(|_| UnitError::Encoding)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::Source;
  use std::path::Path;

  fn unit_with(text: &str) -> Unit {
    let source = Source::parse("gcc -c main.c", Path::new("/tmp")).remove(0);
    let mut unit = Unit::new(source);
    unit.preprocessed = text.as_bytes().to_vec();
    unit
  }

  #[test]
  fn test_compress_round_trip() {
    let mut unit = unit_with("int main(void) { return 0; }\n");
    let original = unit.preprocessed_text().unwrap();
    unit.compress().unwrap();
    assert!(unit.compressed);
    assert_eq!(unit.preprocessed_text().unwrap(), original);
    // compressing twice is a no-op
    let compressed = unit.preprocessed.clone();
    unit.compress().unwrap();
    assert_eq!(unit.preprocessed, compressed);
  }

  #[test]
  fn test_cbor_bytes_round_trip() {
    let mut unit = unit_with("static int x;\n");
    unit.compress().unwrap();
    let bytes = serde_cbor::to_vec(&unit).unwrap();
    let decoded: Unit = serde_cbor::from_slice(&bytes).unwrap();
    assert_eq!(decoded, unit);
  }
}
