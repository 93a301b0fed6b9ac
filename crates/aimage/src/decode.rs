//! Decoder seam: raw cached bytes to an in-memory payload

use crate::error::{FetchError, Result};
use bytes::Bytes;

/// Turns the bytes of a disk entry into the payload kept in memory
pub trait Decoder: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    fn decode(&self, data: Vec<u8>) -> Result<Self::Output>;

    /// Resident size of a decoded payload, used for memory-tier accounting
    fn byte_size(&self, output: &Self::Output) -> usize;
}

/// Keeps the encoded bytes as they are
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Output = Bytes;

    fn decode(&self, data: Vec<u8>) -> Result<Bytes> {
        if data.is_empty() {
            return Err(FetchError::Decode("empty payload".to_string()));
        }
        Ok(Bytes::from(data))
    }

    fn byte_size(&self, output: &Bytes) -> usize {
        output.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_decoder_keeps_bytes() {
        let decoded = RawDecoder.decode(b"\x89PNG".to_vec()).unwrap();
        assert_eq!(&decoded[..], b"\x89PNG");
        assert_eq!(RawDecoder.byte_size(&decoded), 4);
    }

    #[test]
    fn test_raw_decoder_rejects_empty() {
        let err = RawDecoder.decode(Vec::new()).unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }
}
