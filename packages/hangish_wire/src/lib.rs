//! Wire format for the hangish chat transport.
//!
//! Messages travel as nested array literals where a field is identified by its
//! position, not its name:
//!
//! ```text
//! [["cbu",[[[0,null,"4"],null,null,[["Ugx..."],...]]]]]
//! ```
//!
//! This crate has three layers:
//!
//! - [`WireValue`] and [`parse_array_literal`]: a closed value type and a
//!   restricted parser for the literal grammar (arrays, numbers, strings,
//!   booleans, `null`).
//! - [`schema`]: static per-message field tables.
//! - [`encode`] / [`decode`]: one interpreter that maps any schema'd
//!   [`StructuredMessage`] to and from its positional array.
//!
//! Nothing here performs I/O.

pub mod codec;
pub mod error;
pub mod message;
pub mod parser;
pub mod schema;
pub mod value;

pub use codec::{decode, decode_str, decode_tagged, encode, encode_to_string};
pub use error::{DecodeError, FieldError};
pub use message::{FieldValue, Scalar, StructuredMessage};
pub use parser::{MAX_DEPTH, parse_array_literal};
pub use schema::{Cardinality, EnumSchema, Field, FieldKind, MessageSchema, ScalarKind};
pub use value::{WireNumber, WireValue};
