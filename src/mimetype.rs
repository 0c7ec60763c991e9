//! MIME classification of object keys.

/// Fallback for keys without a recognised extension.
pub const DEFAULT_MIMETYPE: &str = "application/octet-stream";

/// Guess a MIME type from the trailing extension of `key`.
pub fn guess(key: &str) -> String {
    mime_guess::from_path(key)
        .first_raw()
        .unwrap_or(DEFAULT_MIMETYPE)
        .to_string()
}
