//! Wire format shared by every process using the same remote tier.
//!
//! A stored payload is the serialized value prefixed with `raw:`, or, when the
//! value is larger than the compression threshold, its zlib stream prefixed with
//! `zlib:`. Keys longer than [`MAX_KEY_LEN`] bytes are replaced by the lowercase
//! hex SHA-256 of the key.
use std::{
    borrow::Cow,
    io::{Read, Write},
};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const RAW_PREFIX: &[u8] = b"raw:";
pub const ZLIB_PREFIX: &[u8] = b"zlib:";
pub const MAX_KEY_LEN: usize = 250;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload has no recognised format prefix")]
    UnknownFormat,

    #[error("Failed to compress payload: {0}")]
    Compress(std::io::Error),

    #[error("Failed to decompress payload: {0}")]
    Decompress(std::io::Error),
}

/// Encode `value` for storage, compressing when it exceeds `threshold` bytes.
pub fn encode(value: &[u8], threshold: usize) -> Result<Vec<u8>, CodecError> {
    if value.len() <= threshold {
        let mut payload = Vec::with_capacity(RAW_PREFIX.len() + value.len());
        payload.extend_from_slice(RAW_PREFIX);
        payload.extend_from_slice(value);
        return Ok(payload);
    }

    // the encoder appends its stream after the prefix already in the buffer
    let mut encoder = ZlibEncoder::new(ZLIB_PREFIX.to_vec(), Compression::default());
    encoder.write_all(value).map_err(CodecError::Compress)?;
    encoder.finish().map_err(CodecError::Compress)
}

/// Decode a stored payload back into the original value bytes.
pub fn decode(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if let Some(raw) = payload.strip_prefix(RAW_PREFIX) {
        return Ok(raw.to_vec());
    }
    if let Some(compressed) = payload.strip_prefix(ZLIB_PREFIX) {
        let mut value = Vec::new();
        ZlibDecoder::new(compressed)
            .read_to_end(&mut value)
            .map_err(CodecError::Decompress)?;
        return Ok(value);
    }
    Err(CodecError::UnknownFormat)
}

pub fn is_compressed(payload: &[u8]) -> bool {
    payload.starts_with(ZLIB_PREFIX)
}

/// The key actually stored in either tier.
pub fn storage_key(key: &str) -> Cow<'_, str> {
    if key.len() > MAX_KEY_LEN {
        Cow::Owned(hex::encode(Sha256::digest(key.as_bytes())))
    } else {
        Cow::Borrowed(key)
    }
}
