//! Text ↔ token conversion.
//!
//! The harness works on raw bytes, so the default [`Utf8Codec`] maps each
//! UTF-8 byte to a token id in `0..256`.  Encoding is lossless for any text;
//! decoding replaces invalid UTF-8 (which a sampling model may well produce)
//! with U+FFFD instead of failing.

/// Converts between the caller's text and the model's token ids.
pub trait Codec {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;
}

/// One token per UTF-8 byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Utf8Codec;

impl Codec for Utf8Codec {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    /// Token ids above 255 have no byte representation and are skipped.
    fn decode(&self, tokens: &[u32]) -> String {
        let bytes: Vec<u8> = tokens.iter().filter_map(|&t| u8::try_from(t).ok()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
