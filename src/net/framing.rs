// Stream framing helpers shared by all provider adapters.
//
// Network fragments arrive at arbitrary boundaries - a fragment may end in
// the middle of a line or even in the middle of a UTF-8 sequence. LineBuffer
// re-frames fragments into complete lines, keeping the trailing partial line
// for the next fragment; Utf8Carry does the same one level down for bytes.

/// Accumulates raw text fragments and yields complete lines.
///
/// The trailing partial line is retained across `push` calls; `finish`
/// surfaces whatever is left so a payload split right at the end of the
/// stream still gets one parse attempt.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every complete line it closed.
    /// Lines are returned without the terminating newline; a trailing `\r`
    /// is trimmed so CRLF framing parses the same as LF.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buf.push_str(fragment);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let mut line: String = self.buf.drain(..=pos).collect();
            line.pop(); // the '\n'
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Consume the buffer, returning the unterminated remainder if any.
    pub fn finish(self) -> Option<String> {
        let rest = self.buf.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

/// Strip SSE `data:` framing from a line, tolerating the optional space
/// after the colon. Returns `None` for non-data lines (`event:`, comments,
/// blanks).
pub fn sse_data(line: &str) -> Option<&str> {
    line.trim().strip_prefix("data:").map(str::trim_start)
}

/// Reassembles valid UTF-8 from byte fragments that may split multi-byte
/// sequences. Incomplete trailing bytes are carried to the next call;
/// genuinely invalid bytes are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or(""));
                    match e.error_len() {
                        // Invalid sequence: replace it and keep going.
                        Some(bad) => {
                            out.push('\u{FFFD}');
                            self.pending.drain(..valid + bad);
                        }
                        // Incomplete sequence: carry it to the next fragment.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }
}
