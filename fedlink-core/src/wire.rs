//! Framing: `header:payload\n` text lines reassembled from arbitrarily chunked bytes.

use crate::protocol::{Message, HEADER_DELIMITER, LINE_DELIMITER};

/// Default cap on a single line, delimiter excluded.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024 * 1024; // 1 MiB

/// Encode one message as a protocol line: `header:payload\n`.
pub fn encode_line(header: &str, payload: &str) -> Result<Vec<u8>, FrameEncodeError> {
    if header.is_empty() {
        return Err(FrameEncodeError::EmptyHeader);
    }
    if header.contains(HEADER_DELIMITER) || header.contains('\n') {
        return Err(FrameEncodeError::InvalidHeader);
    }
    if payload.contains('\n') {
        return Err(FrameEncodeError::InvalidPayload);
    }
    let mut out = Vec::with_capacity(header.len() + payload.len() + 2);
    out.extend_from_slice(header.as_bytes());
    out.push(HEADER_DELIMITER as u8);
    out.extend_from_slice(payload.as_bytes());
    out.push(LINE_DELIMITER);
    Ok(out)
}

/// Error encoding a message into a line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("header is empty")]
    EmptyHeader,
    #[error("header contains a delimiter")]
    InvalidHeader,
    #[error("payload contains a line break")]
    InvalidPayload,
}

/// Decode one complete line (delimiter already stripped).
pub fn decode_line(line: &[u8]) -> Result<Message, FramingError> {
    let text = std::str::from_utf8(line).map_err(|_| FramingError::InvalidUtf8)?;
    match text.split_once(HEADER_DELIMITER) {
        Some((header, payload)) => Ok(Message::new(header, payload)),
        None => Err(FramingError::MissingDelimiter),
    }
}

/// Error extracting a message from the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("line has no header delimiter")]
    MissingDelimiter,
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },
}

impl FramingError {
    /// Fatal errors leave the stream unusable; the rest only drop their own line.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FramingError::LineTooLong { .. })
    }
}

/// Reassembles lines from a byte stream.
///
/// The buffer only ever holds the unconsumed tail of the stream. Complete lines are
/// removed by position and length, so identical lines are each emitted exactly once.
pub struct FrameReader {
    buf: Vec<u8>,
    /// Bytes at the front of `buf` already known to contain no delimiter.
    scanned: usize,
    max_line_len: usize,
    poisoned: bool,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line_len,
            poisoned: false,
        }
    }

    /// Append a chunk and return one result per complete non-empty line, in stream order.
    ///
    /// After a `LineTooLong` error the reader is poisoned: its buffer is dropped and
    /// every later chunk is ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Message, FramingError>> {
        let mut out = Vec::new();
        if self.poisoned {
            return out;
        }
        self.buf.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(pos) = self.buf[self.scanned..]
            .iter()
            .position(|&b| b == LINE_DELIMITER)
        {
            let end = self.scanned + pos;
            self.scanned = end + 1;
            let line = &self.buf[consumed..end];
            consumed = end + 1;
            if line.len() > self.max_line_len {
                self.poison();
                out.push(Err(FramingError::LineTooLong {
                    max: self.max_line_len,
                }));
                return out;
            }
            if line.is_empty() {
                continue;
            }
            out.push(decode_line(line));
        }

        self.buf.drain(..consumed);
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line_len {
            self.poison();
            out.push(Err(FramingError::LineTooLong {
                max: self.max_line_len,
            }));
        }
        out
    }

    /// Bytes of an incomplete trailing line currently held.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn poison(&mut self) {
        self.poisoned = true;
        self.buf = Vec::new();
        self.scanned = 0;
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
