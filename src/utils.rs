use std::fmt::Write;

/// Keep printable ASCII plus CR/LF/TAB, render every other code point as `[0xXX]`.
///
/// Invalid UTF-8 sequences decode to U+FFFD first and are rendered as `[0xFFFD]`.
pub fn sanitize_raw_text(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            ' '..='~' | '\r' | '\n' | '\t' => out.push(c),
            other => {
                let _ = write!(out, "[0x{:X}]", other as u32);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_raw_text_keeps_sip_framing() {
        let raw = b"INVITE sip:bob@biloxi.com SIP/2.0\r\nVia: SIP/2.0/UDP pc33\r\n\tcont\r\n\r\n";
        assert_eq!(sanitize_raw_text(raw), String::from_utf8_lossy(raw));
    }

    #[test]
    fn test_sanitize_raw_text_escapes() {
        assert_eq!(sanitize_raw_text(b"a\x00b\x7f"), "a[0x0]b[0x7F]");
        assert_eq!(sanitize_raw_text("From: 张三".as_bytes()), "From: [0x5F20][0x4E09]");
        assert_eq!(sanitize_raw_text(b"x\xffy"), "x[0xFFFD]y");
        assert_eq!(sanitize_raw_text(b""), "");
    }
}
