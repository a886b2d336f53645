//! Input sanitization.
//!
//! Control characters (other than newline and tab) are stripped, the text
//! is NFC-normalized so homoglyph variants cannot dodge later
//! string-contains checks, and oversized input is rejected outright.

use unicode_normalization::UnicodeNormalization;

use crate::error::{Error, Result};

/// Default input bound: 1 MB.
pub const MAX_INPUT_BYTES: usize = 1 << 20;

/// Sanitize raw user input.
pub fn sanitize_input(input: &str, max_bytes: usize) -> Result<String> {
    let stripped: String = input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    if stripped.len() > max_bytes {
        return Err(Error::InputTooLarge {
            size: stripped.len(),
            limit: max_bytes,
        });
    }
    Ok(stripped.nfc().collect())
}
