//! Best-effort content-encoding reversal shared by the dispatcher's event
//! transformer and the proxy's response-metadata extractor: both need to
//! read JSON out of a captured upstream body that may be gzip- or
//! brotli-compressed before it gets here.

use std::io::Read;

/// Upper bound on the decompressed text produced. Guards against a
/// malicious or buggy upstream claiming a tiny `Content-Length` while
/// compressing a much larger body.
const MAX_DECODED_TEXT_BYTES: usize = 256 * 1024;

/// Reverse whatever content-encoding `bytes` appears to carry (gzip magic
/// bytes, brotli has none so it's attempted as a fallback), then decode
/// as UTF-8 lossily.
pub fn decode_response_text(bytes: &[u8]) -> String {
    if let Some(text) = try_gunzip(bytes) {
        return text;
    }
    if let Some(text) = try_brotli(bytes) {
        return text;
    }
    String::from_utf8_lossy(bytes).into_owned()
}

fn try_gunzip(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 2 || bytes[0] != 0x1f || bytes[1] != 0x8b {
        return None;
    }
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = String::new();
    let mut limited = decoder.by_ref().take(MAX_DECODED_TEXT_BYTES as u64);
    limited.read_to_string(&mut out).ok()?;
    Some(out)
}

fn try_brotli(bytes: &[u8]) -> Option<String> {
    let mut out = Vec::new();
    let mut decoder = brotli::Decompressor::new(bytes, 4096);
    let mut limited = (&mut decoder).take(MAX_DECODED_TEXT_BYTES as u64);
    limited.read_to_end(&mut out).ok()?;
    if out.is_empty() {
        return None;
    }
    String::from_utf8(out).ok()
}
