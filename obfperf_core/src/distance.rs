use bzip2::Compression;
use bzip2::write::BzEncoder;
use std::io::{self, Write};

/// Length of `data` after bzip2 compression at the highest level.
pub fn compressed_len(data: &[u8]) -> io::Result<usize> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?.len())
}

/// Normalized compression distance between two byte strings, clamped to
/// `[0, 1]`.
///
/// `(C(a ++ b) - min(C(a), C(b))) / max(C(a), C(b))`. Close to 1 when the
/// inputs share nothing. bzip2 does not fully exploit a repeated block, so
/// identical sources land well above 0; compare distances, not absolutes.
pub fn normalized_compression_distance(original: &[u8], obfuscated: &[u8]) -> io::Result<f64> {
    let original_len = compressed_len(original)?;
    let obfuscated_len = compressed_len(obfuscated)?;
    let mut combined = Vec::with_capacity(original.len() + obfuscated.len());
    combined.extend_from_slice(original);
    combined.extend_from_slice(obfuscated);
    let combined_len = compressed_len(&combined)?;

    let smaller = original_len.min(obfuscated_len) as f64;
    let larger = original_len.max(obfuscated_len) as f64;
    if larger == 0.0 {
        return Ok(0.0);
    }
    Ok(((combined_len as f64 - smaller) / larger).clamp(0.0, 1.0))
}
