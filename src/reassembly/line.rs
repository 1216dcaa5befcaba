//! Line-oriented payload parser
//!
//! Splits a reassembled byte stream into lines for text protocols. Payload
//! chunks accumulate until a newline shows up; lines come back without the
//! terminator and without a trailing carriage return. A line growing past
//! the cap is reported once and its buffered bytes discarded, so a hostile
//! peer cannot pin memory by never sending a newline.

use crate::error::{CoreError, Result};

/// Splits buffered payload into `\n`-terminated lines
pub struct LineParser {
    max_line: usize,
    buf: Vec<u8>,
}

impl LineParser {
    pub fn new(max_line: usize) -> Self {
        Self {
            max_line,
            buf: Vec::new(),
        }
    }

    /// Append one payload chunk
    pub fn add_payload(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete line, without `\n` or a trailing `\r`.
    ///
    /// `Ok(None)` means more payload is needed. An over-long line, complete
    /// or not, fails once with the offending length and is discarded.
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if pos > self.max_line {
                    self.buf.drain(..=pos);
                    return Err(CoreError::LineTooLong(pos));
                }
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            None if self.buf.len() > self.max_line => {
                let len = self.buf.len();
                self.buf.clear();
                Err(CoreError::LineTooLong(len))
            }
            None => Ok(None),
        }
    }

    /// Bytes buffered past the last complete line
    pub fn remaining(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_across_chunks() {
        let mut parser = LineParser::new(128);
        parser.add_payload(b"HELO exam");
        assert_eq!(parser.next_line().unwrap(), None);

        parser.add_payload(b"ple.org\r\nMAIL FROM");
        assert_eq!(parser.next_line().unwrap(), Some(b"HELO example.org".to_vec()));
        assert_eq!(parser.next_line().unwrap(), None);
        assert_eq!(parser.remaining(), b"MAIL FROM");
    }

    #[test]
    fn test_multiple_lines_one_chunk() {
        let mut parser = LineParser::new(128);
        parser.add_payload(b"a\nb\r\n\nc");
        assert_eq!(parser.next_line().unwrap(), Some(b"a".to_vec()));
        assert_eq!(parser.next_line().unwrap(), Some(b"b".to_vec()));
        // Empty line is a valid line
        assert_eq!(parser.next_line().unwrap(), Some(b"".to_vec()));
        assert_eq!(parser.next_line().unwrap(), None);
    }

    #[test]
    fn test_bare_newline_kept_bare() {
        let mut parser = LineParser::new(16);
        parser.add_payload(b"no-cr\n");
        assert_eq!(parser.next_line().unwrap(), Some(b"no-cr".to_vec()));
    }

    #[test]
    fn test_over_long_line_fails_once() {
        let mut parser = LineParser::new(8);
        parser.add_payload(&[b'x'; 20]);

        assert!(matches!(parser.next_line(), Err(CoreError::LineTooLong(20))));
        // Buffer was discarded; the parser is usable again
        assert_eq!(parser.next_line().unwrap(), None);
        parser.add_payload(b"ok\n");
        assert_eq!(parser.next_line().unwrap(), Some(b"ok".to_vec()));
    }

    #[test]
    fn test_over_long_terminated_line_fails() {
        let mut parser = LineParser::new(4);
        parser.add_payload(b"toolong\nhi\n");
        assert!(parser.next_line().is_err());
        // The line after the oversized one is intact
        assert_eq!(parser.next_line().unwrap(), Some(b"hi".to_vec()));
    }
}
