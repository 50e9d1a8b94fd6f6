//! Decode and schema errors.

/// Failure to turn wire text or a wire value into a structured message.
///
/// A `DecodeError` is always scoped to a single frame or response: callers
/// drop the offending payload and carry on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed array literal at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },

    #[error("array literal nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("field `{field}` expected {expected}")]
    Shape {
        field: &'static str,
        expected: &'static str,
    },

    #[error("expected response tag `{expected}`, found {found}")]
    UnexpectedTag { expected: String, found: String },
}

impl DecodeError {
    pub(crate) fn malformed(offset: usize, reason: &'static str) -> Self {
        Self::Malformed { offset, reason }
    }

    pub(crate) fn shape(field: &'static str, expected: &'static str) -> Self {
        Self::Shape { field, expected }
    }
}

/// Misuse of a [`StructuredMessage`](crate::StructuredMessage) accessor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("message `{message}` has no field `{field}`")]
    UnknownField {
        message: &'static str,
        field: String,
    },

    #[error("field `{field}` cannot hold {found}")]
    KindMismatch {
        field: &'static str,
        found: &'static str,
    },

    #[error("field `{0}` is repeated")]
    Repeated(&'static str),

    #[error("field `{0}` is not repeated")]
    NotRepeated(&'static str),
}
