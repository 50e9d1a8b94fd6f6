//! Generic wire values.
//!
//! A closed tagged variant over everything the array-literal grammar can
//! express. Integers and floats are kept apart so that 64-bit timestamps
//! survive a parse/render cycle without passing through `f64`.

use std::fmt;

/// A numeric literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireNumber {
    Int(i64),
    /// Only used for values above `i64::MAX`.
    UInt(u64),
    Float(f64),
}

impl WireNumber {
    pub fn from_u64(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(i) => Self::Int(i),
            Err(_) => Self::UInt(n),
        }
    }

    /// Integral value as `i64`, accepting floats with no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Int(i) => Some(i),
            Self::UInt(u) => i64::try_from(u).ok(),
            Self::Float(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                Some(f as i64)
            }
            Self::Float(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::Int(i) => u64::try_from(i).ok(),
            Self::UInt(u) => Some(u),
            Self::Float(f) if f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 => {
                Some(f as u64)
            }
            Self::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Int(i) => i as f64,
            Self::UInt(u) => u as f64,
            Self::Float(f) => f,
        }
    }
}

impl fmt::Display for WireNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::UInt(u) => write!(f, "{u}"),
            // Debug keeps the ".0" on integral floats so they parse back as floats.
            Self::Float(x) if x.is_finite() => write!(f, "{x:?}"),
            Self::Float(_) => f.write_str("null"),
        }
    }
}

/// One node of an array-literal document.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum WireValue {
    #[default]
    Null,
    Bool(bool),
    Number(WireNumber),
    String(String),
    Array(Vec<WireValue>),
}

impl WireValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_array(&self) -> Option<&[WireValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<WireValue>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<WireNumber> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_number().and_then(|n| n.as_i64())
    }

    /// Element `index` of an array value. `None` for non-arrays and out of range.
    pub fn get(&self, index: usize) -> Option<&WireValue> {
        self.as_array().and_then(|items| items.get(index))
    }

    /// Short name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
        }
    }
}

impl From<bool> for WireValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for WireValue {
    fn from(n: i64) -> Self {
        Self::Number(WireNumber::Int(n))
    }
}

impl From<u64> for WireValue {
    fn from(n: u64) -> Self {
        Self::Number(WireNumber::from_u64(n))
    }
}

impl From<f64> for WireValue {
    fn from(n: f64) -> Self {
        Self::Number(WireNumber::Float(n))
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<WireValue>> for WireValue {
    fn from(items: Vec<WireValue>) -> Self {
        Self::Array(items)
    }
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(true) => f.write_str("true"),
            Self::Bool(false) => f.write_str("false"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write_quoted(f, s),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if (c as u32) < 0x20 => write!(f, "\\u{:04x}", c as u32)?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_nested_arrays() {
        let v = WireValue::Array(vec![
            1i64.into(),
            WireValue::Null,
            "a\"b".into(),
            WireValue::Array(vec![true.into(), 2.5f64.into()]),
        ]);
        assert_eq!(v.to_string(), r#"[1,null,"a\"b",[true,2.5]]"#);
    }

    #[test]
    fn integral_float_keeps_decimal_point() {
        assert_eq!(WireValue::from(3.0f64).to_string(), "3.0");
    }

    #[test]
    fn large_unsigned_stays_unsigned() {
        assert_eq!(WireNumber::from_u64(u64::MAX), WireNumber::UInt(u64::MAX));
        assert_eq!(WireNumber::from_u64(42), WireNumber::Int(42));
    }

    #[test]
    fn float_to_integer_only_when_integral() {
        assert_eq!(WireNumber::Float(12.0).as_i64(), Some(12));
        assert_eq!(WireNumber::Float(12.5).as_i64(), None);
        assert_eq!(WireNumber::Int(-1).as_u64(), None);
    }

    #[test]
    fn control_characters_are_escaped() {
        assert_eq!(WireValue::from("a\u{1}").to_string(), "\"a\\u0001\"");
    }
}
