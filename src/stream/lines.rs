/// Reassembles complete lines from arbitrarily split byte chunks.
///
/// Incomplete UTF-8 sequences and the trailing partial line are carried over
/// to the next call, so chunk boundaries never need to line up with events.
#[derive(Debug, Default)]
pub struct LineBuffer {
    byte_buf: Vec<u8>,
    buffer: String,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.byte_buf.extend_from_slice(chunk);
        self.decode_available();

        let mut lines = Vec::new();
        while let Some(end) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=end).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Flush whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if !self.byte_buf.is_empty() {
            let rest = String::from_utf8_lossy(&self.byte_buf).into_owned();
            self.byte_buf.clear();
            self.buffer.push_str(&rest);
        }
        let mut line = std::mem::take(&mut self.buffer);
        if line.ends_with('\r') {
            line.pop();
        }
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }

    // Decode as much valid UTF-8 as possible, keeping an incomplete tail.
    fn decode_available(&mut self) {
        match std::str::from_utf8(&self.byte_buf) {
            Ok(s) => {
                self.buffer.push_str(s);
                self.byte_buf.clear();
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if let Ok(s) = std::str::from_utf8(&self.byte_buf[..valid_up_to]) {
                    self.buffer.push_str(s);
                }
                match e.error_len() {
                    // Genuinely invalid bytes: replace and move on.
                    Some(bad) => {
                        self.buffer.push(char::REPLACEMENT_CHARACTER);
                        self.byte_buf.drain(..valid_up_to + bad);
                        self.decode_available();
                    }
                    None => {
                        self.byte_buf.drain(..valid_up_to);
                    }
                }
            }
        }
    }
}

/// Payload of a `data:` line, or `None` for any other line.
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
