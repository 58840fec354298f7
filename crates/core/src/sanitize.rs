use std::borrow::Cow;

/// Substitute for NUL bytes that are not at the end of a string.
pub const NUL_REPLACEMENT: &str = "•";

/// Makes scanner output safe to store: invalid UTF-8 becomes U+FFFD, trailing
/// NULs are dropped and inner NULs become [`NUL_REPLACEMENT`].
pub fn sanitize_bytes(raw: &[u8]) -> String {
    sanitize(&String::from_utf8_lossy(raw)).into_owned()
}

pub fn sanitize(s: &str) -> Cow<'_, str> {
    if !s.contains('\0') {
        return Cow::Borrowed(s);
    }
    let trimmed = s.trim_end_matches('\0');
    Cow::Owned(trimmed.replace('\0', NUL_REPLACEMENT))
}

/// Sanitizes every element and joins with `sep`.
pub fn join(items: &[String], sep: &str) -> String {
    items
        .iter()
        .map(|s| sanitize(s))
        .collect::<Vec<_>>()
        .join(sep)
}
