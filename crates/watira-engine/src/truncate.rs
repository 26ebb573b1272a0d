/// Email bodies returned to the model by `read_email`.
pub const EMAIL_BODY_MAX: usize = 8 * 1024;
/// Text extracted from one search hit.
pub const SEARCH_CONTENT_MAX: usize = 4 * 1024;

/// Largest char boundary at or below `index`.
fn floor_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Cut `text` to at most `max_bytes` on a char boundary and append a marker
/// with the original and kept sizes.
pub fn truncate_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let boundary = floor_boundary(text, max_bytes);
    format!(
        "{}\n\n[truncated: {} bytes -> {} bytes]",
        &text[..boundary],
        text.len(),
        boundary
    )
}
