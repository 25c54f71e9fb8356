//! CRLF line framing over a TCP byte stream
//!
//! TCP delivers arbitrary fragments: a single `recv` may carry half a line or
//! several lines glued together. [`LineFramer`] accumulates whatever arrives
//! and hands back complete logical lines, so the layers above only ever see
//! whole requests.

use bytes::{Buf, BytesMut};

use crate::error::FrameError;

/// Maximum bytes a single protocol line may occupy, terminator excluded.
pub const MAX_LINE: usize = 64 * 1024;

/// Accumulates raw bytes and yields `\r\n`-terminated lines.
///
/// Feed network reads in with [`push_bytes`](Self::push_bytes), then drain
/// with [`pop_line`](Self::pop_line) until it returns `Ok(None)`. The
/// terminator is consumed and never part of a returned line.
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    max_line: usize,
}

impl LineFramer {
    /// Framer with the protocol default line cap of [`MAX_LINE`].
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE)
    }

    /// Framer with a custom line cap (used by tests to exercise the limit).
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            max_line,
        }
    }

    /// Append a chunk read from the stream.
    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes currently buffered without a terminator.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete line, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Fails with
    /// [`FrameError::LineTooLong`] once the accumulation (or a single line)
    /// exceeds the cap — the connection must be dropped at that point, since
    /// resynchronizing inside an oversized line is not possible.
    pub fn pop_line(&mut self) -> Result<Option<String>, FrameError> {
        match find_crlf(&self.buf) {
            Some(at) => {
                if at > self.max_line {
                    return Err(FrameError::LineTooLong { max: self.max_line });
                }
                let line = self.buf.split_to(at);
                self.buf.advance(2);
                let text = std::str::from_utf8(&line)
                    .map_err(|_| FrameError::Encoding)?
                    .to_owned();
                Ok(Some(text))
            }
            None if self.buf.len() > self.max_line => {
                Err(FrameError::LineTooLong { max: self.max_line })
            }
            None => Ok(None),
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut fr = LineFramer::new();
        fr.push_bytes(b"PING 1\r\n");
        assert_eq!(fr.pop_line().unwrap(), Some("PING 1".to_string()));
        assert_eq!(fr.pop_line().unwrap(), None);
        assert_eq!(fr.buffered(), 0);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut fr = LineFramer::new();
        for b in b"LOGIN 7 username=a\r\n" {
            assert_eq!(fr.pop_line().unwrap(), None);
            fr.push_bytes(&[*b]);
        }
        assert_eq!(fr.pop_line().unwrap(), Some("LOGIN 7 username=a".to_string()));
    }

    #[test]
    fn test_coalesced_lines() {
        let mut fr = LineFramer::new();
        fr.push_bytes(b"PING 1\r\nPING 2\r\nPING 3\r\npartial");
        assert_eq!(fr.pop_line().unwrap(), Some("PING 1".to_string()));
        assert_eq!(fr.pop_line().unwrap(), Some("PING 2".to_string()));
        assert_eq!(fr.pop_line().unwrap(), Some("PING 3".to_string()));
        assert_eq!(fr.pop_line().unwrap(), None);
        fr.push_bytes(b" done\r\n");
        assert_eq!(fr.pop_line().unwrap(), Some("partial done".to_string()));
    }

    #[test]
    fn test_split_terminator() {
        let mut fr = LineFramer::new();
        fr.push_bytes(b"PING 1\r");
        assert_eq!(fr.pop_line().unwrap(), None);
        fr.push_bytes(b"\n");
        assert_eq!(fr.pop_line().unwrap(), Some("PING 1".to_string()));
    }

    #[test]
    fn test_bare_newline_is_not_a_terminator() {
        let mut fr = LineFramer::new();
        fr.push_bytes(b"PING 1\nPING 2\r\n");
        assert_eq!(fr.pop_line().unwrap(), Some("PING 1\nPING 2".to_string()));
    }

    #[test]
    fn test_empty_line() {
        let mut fr = LineFramer::new();
        fr.push_bytes(b"\r\nPING 1\r\n");
        assert_eq!(fr.pop_line().unwrap(), Some(String::new()));
        assert_eq!(fr.pop_line().unwrap(), Some("PING 1".to_string()));
    }

    #[test]
    fn test_oversize_accumulation() {
        let mut fr = LineFramer::with_max_line(16);
        fr.push_bytes(&[b'x'; 17]);
        assert_eq!(fr.pop_line(), Err(FrameError::LineTooLong { max: 16 }));
    }

    #[test]
    fn test_oversize_terminated_line() {
        let mut fr = LineFramer::with_max_line(16);
        fr.push_bytes(&[b'x'; 20]);
        fr.push_bytes(b"\r\n");
        assert_eq!(fr.pop_line(), Err(FrameError::LineTooLong { max: 16 }));
    }

    #[test]
    fn test_line_at_exact_cap() {
        let mut fr = LineFramer::with_max_line(8);
        fr.push_bytes(&[b'y'; 8]);
        assert_eq!(fr.pop_line().unwrap(), None);
        fr.push_bytes(b"\r\n");
        assert_eq!(fr.pop_line().unwrap(), Some("yyyyyyyy".to_string()));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut fr = LineFramer::new();
        fr.push_bytes(&[0xff, 0xfe, b'\r', b'\n']);
        assert_eq!(fr.pop_line(), Err(FrameError::Encoding));
    }
}
