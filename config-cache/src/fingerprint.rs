//! Content fingerprints. Older clients compare against a digest of the
//! GBK-encoded content, newer ones against the UTF-8 digest, so both are kept.
use crate::types::NULL_FINGERPRINT;
use encoding_rs::EncoderResult;
use md5::{Digest, Md5};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Fingerprints {
    pub legacy: String,
    pub utf8: String,
}

impl Fingerprints {
    pub fn of(content: &str) -> Self {
        Fingerprints {
            legacy: md5_legacy(content),
            utf8: md5_utf8(content),
        }
    }

    pub fn null() -> Self {
        Fingerprints {
            legacy: NULL_FINGERPRINT.to_string(),
            utf8: NULL_FINGERPRINT.to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.utf8 == NULL_FINGERPRINT
    }
}

pub fn md5_utf8(content: &str) -> String {
    hex::encode(Md5::digest(content.as_bytes()))
}

/// Characters GBK cannot represent are written as a single `?`.
pub fn md5_legacy(content: &str) -> String {
    let mut encoder = encoding_rs::GBK.new_encoder();
    let mut bytes = Vec::new();
    let mut rest = content;
    loop {
        let needed = encoder
            .max_buffer_length_from_utf8_without_replacement(rest.len())
            .unwrap_or(rest.len() * 4 + 16);
        bytes.reserve(needed);
        let (result, read) =
            encoder.encode_from_utf8_to_vec_without_replacement(rest, &mut bytes, true);
        rest = &rest[read..];
        match result {
            EncoderResult::InputEmpty => break,
            EncoderResult::Unmappable(_) => bytes.push(b'?'),
            EncoderResult::OutputFull => {}
        }
    }
    hex::encode(Md5::digest(&bytes))
}
