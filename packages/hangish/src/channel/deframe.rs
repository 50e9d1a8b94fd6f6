//! Length-prefixed framing of the long-poll body.
//!
//! Wire format: `<decimal length>\n<frame>` repeated, with chunk boundaries
//! falling anywhere. Lengths count bytes.

use serde::{Deserialize, Serialize};

use crate::error::DeframeError;

/// Default cap on a single frame (8 MiB).
pub const DEFAULT_MAX_FRAME: usize = 8 * 1024 * 1024;

/// A length line longer than this without a newline is garbage.
const MAX_LENGTH_LINE: usize = 16;

/// What the decimal length on the header line counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameLength {
    /// The header line, its newline, and the payload.
    #[default]
    IncludingHeader,
    /// The payload only.
    PayloadOnly,
}

/// Incremental deframer. Bytes go in through [`push`](Self::push); complete
/// frames come out in order.
#[derive(Debug)]
pub struct Deframer {
    buf: Vec<u8>,
    expected: Option<usize>,
    max_frame: usize,
    mode: FrameLength,
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new(FrameLength::default(), DEFAULT_MAX_FRAME)
    }
}

impl Deframer {
    pub fn new(mode: FrameLength, max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            expected: None,
            max_frame,
            mode,
        }
    }

    /// Bytes held that do not yet form a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = None;
    }

    /// Append `chunk` and return every frame it completes.
    ///
    /// A framing error discards the buffered bytes and is returned in place;
    /// frames completed before it are still returned.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, DeframeError>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            match self.expected {
                None => match self.read_length() {
                    Ok(Some(len)) => self.expected = Some(len),
                    Ok(None) => break,
                    Err(e) => {
                        self.reset();
                        out.push(Err(e));
                        break;
                    }
                },
                Some(len) => {
                    if self.buf.len() < len {
                        break;
                    }
                    let frame: Vec<u8> = self.buf.drain(..len).collect();
                    self.expected = None;
                    out.push(String::from_utf8(frame).map_err(|_| DeframeError::InvalidUtf8));
                }
            }
        }
        out
    }

    /// Consume one length line. `Ok(None)` when the line is not complete yet.
    fn read_length(&mut self) -> Result<Option<usize>, DeframeError> {
        let start = self
            .buf
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.buf.len());
        self.buf.drain(..start);

        let Some(newline) = self.buf.iter().position(|b| *b == b'\n') else {
            if self.buf.len() > MAX_LENGTH_LINE {
                return Err(DeframeError::InvalidLength(
                    String::from_utf8_lossy(&self.buf[..MAX_LENGTH_LINE]).into_owned(),
                ));
            }
            return Ok(None);
        };

        let line = String::from_utf8_lossy(&self.buf[..newline]).into_owned();
        let declared: usize = line
            .trim()
            .parse()
            .map_err(|_| DeframeError::InvalidLength(line.clone()))?;
        let header_len = newline + 1;
        let payload = match self.mode {
            FrameLength::PayloadOnly => declared,
            FrameLength::IncludingHeader => declared
                .checked_sub(header_len)
                .ok_or_else(|| DeframeError::InvalidLength(line.clone()))?,
        };
        if payload > self.max_frame {
            return Err(DeframeError::FrameTooLarge {
                len: payload,
                max: self.max_frame,
            });
        }
        self.buf.drain(..header_len);
        Ok(Some(payload))
    }
}
