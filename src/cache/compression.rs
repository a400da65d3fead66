//! Gzip compression for stored bodies.

use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 4);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Compress bodies larger than `threshold`. Falls back to the raw bytes
/// when compression fails or does not shrink the body.
pub fn maybe_compress(body: &Bytes, threshold: usize) -> (Bytes, bool) {
    if body.len() <= threshold {
        return (body.clone(), false);
    }
    match compress(body) {
        Ok(compressed) if compressed.len() < body.len() => (Bytes::from(compressed), true),
        Ok(_) => (body.clone(), false),
        Err(e) => {
            tracing::warn!(error = %e, size = body.len(), "Compression failed, storing raw body");
            (body.clone(), false)
        }
    }
}
