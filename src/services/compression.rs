use crate::config::TransformMode;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Compression failed: {0}")]
    Compress(#[source] std::io::Error),

    #[error("Decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Gzip-compress a complete buffer.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, TransformError> {
    let buffer = Vec::with_capacity(data.len() / 2 + 32);
    let mut encoder = GzEncoder::new(buffer, Compression::default());
    encoder.write_all(data).map_err(TransformError::Compress)?;
    encoder.finish().map_err(TransformError::Compress)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, TransformError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(TransformError::Decompress)?;
    Ok(out)
}

/// Produce the payload that gets uploaded for a downloaded file.
///
/// `RoundTrip` compresses and immediately inflates the result again, so the
/// uploaded bytes are identical to the input. `Gzip` uploads the compressed
/// form. The two modes produce different objects in the destination bucket.
pub fn transform(data: &[u8], mode: TransformMode) -> Result<Vec<u8>, TransformError> {
    let compressed = compress(data)?;
    tracing::debug!(
        "Compressed {} bytes to {} bytes",
        data.len(),
        compressed.len()
    );

    match mode {
        TransformMode::Gzip => Ok(compressed),
        TransformMode::RoundTrip => decompress(&compressed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_mode_returns_input() {
        let input = b"The quick brown fox jumps over the lazy dog".repeat(100);
        assert_eq!(transform(&input, TransformMode::RoundTrip).unwrap(), input);
    }

    #[test]
    fn test_gzip_mode_is_smaller_and_decodable() {
        let input = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(200);
        let out = transform(&input, TransformMode::Gzip).unwrap();

        assert!(out.len() < input.len());
        // gzip magic
        assert_eq!(&out[..2], &[0x1f, 0x8b]);
        assert_eq!(decompress(&out).unwrap(), input);
    }

    #[test]
    fn test_empty_input() {
        assert!(transform(b"", TransformMode::RoundTrip).unwrap().is_empty());
        let gz = transform(b"", TransformMode::Gzip).unwrap();
        assert!(!gz.is_empty());
        assert!(decompress(&gz).unwrap().is_empty());
    }

    #[test]
    fn test_decompress_garbage_fails() {
        assert!(matches!(
            decompress(b"definitely not gzip"),
            Err(TransformError::Decompress(_))
        ));
    }
}
