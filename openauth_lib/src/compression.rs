//! DEFLATE compression for small opaque payloads.
//!
//! Decompression is bounded so a tiny crafted input cannot expand without limit.

use flate2::{bufread, write, Compression};
use std::io::{Read, Write};

/// Largest output `decompress_deflate` will produce.
pub const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024;

/// Compresses data using DEFLATE encoding
///
/// # Example
/// ```
/// # use openauth_lib::compression::{compress_deflate, decompress_deflate};
/// let compressed = compress_deflate(b"Hello world!").unwrap();
/// assert_eq!(decompress_deflate(&compressed).unwrap(), b"Hello world!");
/// ```
pub fn compress_deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = write::DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompresses DEFLATE-encoded data
///
/// Fails with `InvalidData` when the output would exceed [`MAX_DECOMPRESSED_SIZE`].
pub fn decompress_deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = bufread::DeflateDecoder::new(data).take(MAX_DECOMPRESSED_SIZE + 1);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    if decompressed.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "decompressed payload exceeds limit",
        ));
    }
    Ok(decompressed)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn oversized_output_is_rejected() {
        let big = vec![b'a'; (MAX_DECOMPRESSED_SIZE + 10) as usize];
        let compressed = compress_deflate(&big).unwrap();
        assert!(decompress_deflate(&compressed).is_err());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decompress_deflate(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
