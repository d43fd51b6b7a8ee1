//! Byte-level JSON string escaping and a minimal object writer.
//!
//! Escaping walks raw bytes rather than decoded code points: only ASCII
//! control bytes, `"` and `\` are rewritten, every other byte (including each
//! byte of a multi-byte UTF-8 sequence) is copied through untouched.

/// Escape `raw` for use inside a JSON string literal (without the quotes).
pub fn escape(raw: &str) -> String {
    let mut out = Vec::with_capacity(raw.len() + 2);
    for &byte in raw.as_bytes() {
        match byte {
            b'"' => out.extend_from_slice(br#"\""#),
            b'\\' => out.extend_from_slice(br"\\"),
            0x08 => out.extend_from_slice(br"\b"),
            0x0c => out.extend_from_slice(br"\f"),
            b'\n' => out.extend_from_slice(br"\n"),
            b'\r' => out.extend_from_slice(br"\r"),
            b'\t' => out.extend_from_slice(br"\t"),
            0x00..=0x1f | 0x7f => out.extend_from_slice(format!("\\u{byte:04x}").as_bytes()),
            _ => out.push(byte),
        }
    }
    // Only ASCII bytes were replaced, so the input's UTF-8 validity carries over.
    String::from_utf8(out)
        .unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}

/// Render `raw` as a quoted JSON string literal.
pub fn quoted(raw: &str) -> String {
    format!("\"{}\"", escape(raw))
}

/// Incrementally builds a JSON object from pre-rendered member values.
///
/// Members are emitted in insertion order.
#[derive(Debug)]
pub struct ObjectWriter {
    buf: String,
    empty: bool,
}

impl ObjectWriter {
    pub fn new() -> Self {
        Self {
            buf: String::from("{"),
            empty: true,
        }
    }

    /// Append `"name":<rendered>`. `rendered` must already be valid JSON.
    pub fn member(&mut self, name: &str, rendered: &str) -> &mut Self {
        if !self.empty {
            self.buf.push(',');
        }
        self.buf.push_str(&quoted(name));
        self.buf.push(':');
        self.buf.push_str(rendered);
        self.empty = false;
        self
    }

    pub fn finish(mut self) -> String {
        self.buf.push('}');
        self.buf
    }
}

impl Default for ObjectWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multibyte_utf8_passes_through() {
        assert_eq!(escape("O’Reilly"), "O’Reilly");
        assert_eq!(escape("Grüße 👋"), "Grüße 👋");
    }

    #[test]
    fn newline_uses_short_escape() {
        assert_eq!(escape("line\nfeed"), "line\\nfeed");
    }

    #[test]
    fn control_bytes_use_unicode_escape() {
        assert_eq!(escape("a\u{1}b"), "a\\u0001b");
        assert_eq!(escape("\u{1f}"), "\\u001f");
        assert_eq!(escape("\u{7f}"), "\\u007f");
    }

    #[test]
    fn standard_escapes() {
        assert_eq!(
            escape("\"\\\u{8}\u{c}\r\t"),
            "\\\"\\\\\\b\\f\\r\\t"
        );
    }

    #[test]
    fn escaped_output_parses_back_to_input() {
        let raw = "tab\there \"quoted\" back\\slash O’Reilly \u{1}";
        let parsed: String = serde_json::from_str(&quoted(raw)).expect("valid json");
        assert_eq!(parsed, raw);
    }

    #[test]
    fn object_writer_joins_members() {
        let mut writer = ObjectWriter::new();
        writer.member("a", "1").member("b\"", "\"x\"");
        assert_eq!(writer.finish(), r#"{"a":1,"b\"":"x"}"#);
        assert_eq!(ObjectWriter::new().finish(), "{}");
    }
}
