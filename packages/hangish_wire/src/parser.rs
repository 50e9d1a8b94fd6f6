//! Restricted array-literal parser.
//!
//! Grammar (whitespace allowed between tokens):
//!
//! ```text
//! value   := array | string | number | "true" | "false" | "null"
//! array   := "[" ( element ( "," element )* ","? )? "]"
//! element := value | <empty>            (elision, read as null)
//! string  := '"' ( char | escape )* '"'
//! ```
//!
//! This is a data parser, not an evaluator: nothing outside the grammar is
//! accepted, and nothing is executed.

use crate::error::DecodeError;
use crate::value::{WireNumber, WireValue};

/// Maximum array nesting accepted before giving up.
pub const MAX_DEPTH: usize = 128;

/// Parse one array-literal document.
///
/// Trailing whitespace is allowed; any other trailing input is rejected.
pub fn parse_array_literal(text: &str) -> Result<WireValue, DecodeError> {
    let mut parser = Parser {
        src: text,
        pos: 0,
        depth: 0,
    };
    parser.skip_ws();
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != text.len() {
        return Err(DecodeError::malformed(parser.pos, "trailing input"));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn value(&mut self) -> Result<WireValue, DecodeError> {
        match self.peek() {
            Some(b'[') => self.array(),
            Some(b'"') => self.string().map(WireValue::String),
            Some(b'-' | b'0'..=b'9') => self.number(),
            Some(b't') => self.keyword("true", WireValue::Bool(true)),
            Some(b'f') => self.keyword("false", WireValue::Bool(false)),
            Some(b'n') => self.keyword("null", WireValue::Null),
            Some(b']') => Err(DecodeError::malformed(self.pos, "unexpected `]`")),
            Some(_) => Err(DecodeError::malformed(self.pos, "unexpected character")),
            None => Err(DecodeError::malformed(self.pos, "unexpected end of input")),
        }
    }

    fn array(&mut self) -> Result<WireValue, DecodeError> {
        if self.depth >= MAX_DEPTH {
            return Err(DecodeError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        self.pos += 1; // '['

        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Err(DecodeError::malformed(self.pos, "unterminated array")),
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                Some(b',') => {
                    // elided element
                    items.push(WireValue::Null);
                    self.pos += 1;
                }
                Some(_) => {
                    items.push(self.value()?);
                    self.skip_ws();
                    match self.peek() {
                        Some(b',') => self.pos += 1,
                        Some(b']') => {
                            self.pos += 1;
                            break;
                        }
                        None => {
                            return Err(DecodeError::malformed(self.pos, "unterminated array"));
                        }
                        Some(_) => {
                            return Err(DecodeError::malformed(self.pos, "expected `,` or `]`"));
                        }
                    }
                }
            }
        }

        self.depth -= 1;
        Ok(WireValue::Array(items))
    }

    fn keyword(&mut self, word: &'static str, value: WireValue) -> Result<WireValue, DecodeError> {
        if self.src[self.pos..].starts_with(word) {
            self.pos += word.len();
            Ok(value)
        } else {
            Err(DecodeError::malformed(self.pos, "unknown keyword"))
        }
    }

    fn number(&mut self) -> Result<WireValue, DecodeError> {
        let start = self.pos;
        let mut integral = true;

        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(DecodeError::malformed(start, "expected digits"));
        }
        if self.peek() == Some(b'.') {
            integral = false;
            self.pos += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            integral = false;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            let exp_start = self.pos;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
            if self.pos == exp_start {
                return Err(DecodeError::malformed(self.pos, "expected exponent digits"));
            }
        }

        let text = &self.src[start..self.pos];

        if integral {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(WireValue::Number(WireNumber::Int(i)));
            }
            if let Ok(u) = text.parse::<u64>() {
                return Ok(WireValue::Number(WireNumber::UInt(u)));
            }
        }
        text.parse::<f64>()
            .map(|f| WireValue::Number(WireNumber::Float(f)))
            .map_err(|_| DecodeError::malformed(start, "invalid number"))
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let open = self.pos;
        self.pos += 1; // opening quote
        let mut out = String::new();

        loop {
            // Copy the run up to the next quote or backslash in one go. Both are
            // ASCII so the slice boundaries are always char boundaries.
            let rest = &self.src[self.pos..];
            let Some(stop) = rest.find(['"', '\\']) else {
                return Err(DecodeError::malformed(open, "unterminated string"));
            };
            out.push_str(&rest[..stop]);
            self.pos += stop;

            if self.peek() == Some(b'"') {
                self.pos += 1;
                return Ok(out);
            }

            // backslash
            self.pos += 1;
            let Some(esc) = self.peek() else {
                return Err(DecodeError::malformed(open, "unterminated string"));
            };
            self.pos += 1;
            match esc {
                b'"' => out.push('"'),
                b'\\' => out.push('\\'),
                b'/' => out.push('/'),
                b'\'' => out.push('\''),
                b'b' => out.push('\u{8}'),
                b'f' => out.push('\u{c}'),
                b'n' => out.push('\n'),
                b'r' => out.push('\r'),
                b't' => out.push('\t'),
                b'x' => {
                    let code = self.hex(2)?;
                    out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
                b'u' => {
                    let c = self.unicode_escape()?;
                    out.push(c);
                }
                _ => {
                    // Unknown escapes stand for the escaped character itself.
                    let c = self.src[self.pos - 1..]
                        .chars()
                        .next()
                        .unwrap_or(char::REPLACEMENT_CHARACTER);
                    self.pos += c.len_utf8() - 1;
                    out.push(c);
                }
            }
        }
    }

    fn hex(&mut self, len: usize) -> Result<u32, DecodeError> {
        let end = self.pos + len;
        let digits = self
            .src
            .get(self.pos..end)
            .ok_or_else(|| DecodeError::malformed(self.pos, "truncated escape"))?;
        let code = u32::from_str_radix(digits, 16)
            .map_err(|_| DecodeError::malformed(self.pos, "invalid hex escape"))?;
        self.pos = end;
        Ok(code)
    }

    fn unicode_escape(&mut self) -> Result<char, DecodeError> {
        let first = self.hex(4)?;
        if (0xD800..0xDC00).contains(&first) && self.src[self.pos..].starts_with("\\u") {
            let save = self.pos;
            self.pos += 2;
            let second = self.hex(4)?;
            if (0xDC00..0xE000).contains(&second) {
                let code = 0x10000 + ((first - 0xD800) << 10) + (second - 0xDC00);
                return Ok(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            self.pos = save;
        }
        Ok(char::from_u32(first).unwrap_or(char::REPLACEMENT_CHARACTER))
    }
}
