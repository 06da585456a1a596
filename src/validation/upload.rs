use std::collections::BTreeSet;

use crate::error::{AppError, Result};

/// Maximum length, in characters, of a stored display filename.
const MAX_FILENAME_CHARS: usize = 255;

/// Validates an uploaded filename and returns `(display_name, extension)`.
///
/// Any directory part sent by the client is dropped. The extension must be on
/// the allow-list; the comparison is case-insensitive.
///
/// # Arguments
///
/// * `raw` - The filename from the multipart part.
/// * `allowed` - Lowercase extensions without the leading dot.
pub fn validate_filename(raw: &str, allowed: &BTreeSet<String>) -> Result<(String, String)> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if name.is_empty() {
        return Err(AppError::Validation("File name is missing".to_string()));
    }

    let name: String = name
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_FILENAME_CHARS)
        .collect();

    let extension = name
        .rsplit_once('.')
        .map(|(stem, ext)| (stem, ext.to_ascii_lowercase()))
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
        .map(|(_, ext)| ext);

    match extension {
        Some(ext) if allowed.contains(&ext) => Ok((name, ext)),
        _ => Err(AppError::UnsupportedMediaType(format!(
            "Only {} files are allowed",
            allowed
                .iter()
                .map(|ext| format!(".{}", ext))
                .collect::<Vec<_>>()
                .join(" ")
        ))),
    }
}

/// Replaces anything outside printable ASCII, plus quotes and backslashes.
fn ascii_fallback(filename: &str) -> String {
    let mut out = String::with_capacity(filename.len());
    let mut in_run = false;
    for c in filename.chars() {
        let safe = (' '..='~').contains(&c) && c != '"' && c != '\\';
        if safe {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Percent-encodes everything except RFC 5987 `attr-char`.
fn rfc5987_encode(filename: &str) -> String {
    let mut out = String::with_capacity(filename.len() * 3);
    for byte in filename.bytes() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(
                byte,
                b'!' | b'#' | b'$' | b'&' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
            );
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Builds a `Content-Disposition` value that round-trips non-ASCII names.
pub fn content_disposition(filename: &str) -> String {
    format!(
        r#"attachment; filename="{}"; filename*=UTF-8''{}"#,
        ascii_fallback(filename),
        rfc5987_encode(filename)
    )
}
