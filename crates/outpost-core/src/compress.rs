//! zlib compression helpers for the envelope payload.
//!
//! The session compares the raw serialisation against its deflated form and
//! ships whichever is smaller; inflation is bounded to keep a hostile
//! envelope from ballooning in memory.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Upper bound on an inflated payload.
const MAX_INFLATED_BYTES: u64 = 64 * 1024 * 1024;

/// Deflates `data` in zlib format.
///
/// # Errors
///
/// Returns an error if the encoder fails (it does not for in-memory sinks).
pub fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflates a zlib stream, bounded to 64 MiB.
///
/// # Errors
///
/// Returns an error if the stream is corrupt or exceeds the bound.
pub fn inflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data).take(MAX_INFLATED_BYTES + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    if out.len() as u64 > MAX_INFLATED_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "inflated payload exceeds bound",
        ));
    }
    Ok(out)
}
