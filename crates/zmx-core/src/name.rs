//! Session-name encoding for filesystem use.
//!
//! Session names are arbitrary UTF-8; socket files are named by a
//! percent-encoding that escapes only the bytes a path cannot carry:
//! `/`, `\`, `%`, and NUL. Everything else passes through unchanged, so
//! encoded names stay readable in `ls` output.

/// Bytes that must not appear in a socket file name.
fn must_escape(b: u8) -> bool {
    matches!(b, b'/' | b'\\' | b'%' | 0)
}

/// Encode a session name for use as a single path component.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        // Every escaped byte is ASCII, so multi-byte sequences pass
        // through intact and the output stays valid UTF-8.
        if ch.is_ascii() && must_escape(ch as u8) {
            out.push('%');
            out.push_str(&format!("{:02X}", ch as u8));
        } else {
            out.push(ch);
        }
    }
    out
}

/// Invert [`encode_name`]. Escapes that do not parse pass through
/// verbatim, so foreign files in the socket directory still get a name.
pub fn decode_name(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Group names scope the socket directory and must be safe as a single
/// path component: non-empty, no `/`, no `..`.
pub fn valid_group(group: &str) -> bool {
    !group.is_empty() && !group.contains('/') && !group.contains("..")
}
