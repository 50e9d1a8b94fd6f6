//! Schema-driven mapping between [`StructuredMessage`] and [`WireValue`].
//!
//! Field `f` of a schema reads and writes array element `f.index`. On decode,
//! a missing element or `null` leaves the field unset; on encode, unset
//! fields become `null` placeholders, and nothing is written past the last
//! set field.

use tracing::debug;

use crate::error::DecodeError;
use crate::message::{FieldValue, Scalar, Slot, StructuredMessage};
use crate::parser::parse_array_literal;
use crate::schema::{Cardinality, Field, FieldKind, MessageSchema, ScalarKind};
use crate::value::{WireNumber, WireValue};

/// Decode an array value into a message of type `schema`.
pub fn decode(
    value: &WireValue,
    schema: &'static MessageSchema,
) -> Result<StructuredMessage, DecodeError> {
    let items = value
        .as_array()
        .ok_or_else(|| DecodeError::shape(schema.name, "an array"))?;
    decode_items(items, schema)
}

/// Parse array-literal text and decode it.
pub fn decode_str(
    text: &str,
    schema: &'static MessageSchema,
) -> Result<StructuredMessage, DecodeError> {
    decode(&parse_array_literal(text)?, schema)
}

/// Decode a response of the form `[tag, field0, field1, ...]`, checking the
/// leading tag and decoding the remaining elements as `schema`.
pub fn decode_tagged(
    value: &WireValue,
    tag: &str,
    schema: &'static MessageSchema,
) -> Result<StructuredMessage, DecodeError> {
    let items = value
        .as_array()
        .ok_or_else(|| DecodeError::shape(schema.name, "a tagged array"))?;
    match items.first() {
        Some(WireValue::String(found)) if found == tag => decode_items(&items[1..], schema),
        other => Err(DecodeError::UnexpectedTag {
            expected: tag.to_string(),
            found: other.map_or_else(|| "nothing".to_string(), ToString::to_string),
        }),
    }
}

/// Encode a message into its positional array form.
pub fn encode(message: &StructuredMessage) -> WireValue {
    let schema = message.schema();
    let mut out: Vec<WireValue> = Vec::new();
    for (slot, field) in schema.fields.iter().enumerate() {
        let Some(value) = message.slot(slot) else {
            continue;
        };
        let wire = match value {
            Slot::Single(v) => encode_value(v),
            Slot::Repeated(items) => WireValue::Array(items.iter().map(encode_value).collect()),
        };
        if out.len() <= field.index {
            out.resize(field.index + 1, WireValue::Null);
        }
        out[field.index] = wire;
    }
    WireValue::Array(out)
}

/// Encode a message straight to array-literal text.
pub fn encode_to_string(message: &StructuredMessage) -> String {
    encode(message).to_string()
}

fn decode_items(
    items: &[WireValue],
    schema: &'static MessageSchema,
) -> Result<StructuredMessage, DecodeError> {
    let mut message = StructuredMessage::new(schema);
    for (slot, field) in schema.fields.iter().enumerate() {
        let Some(element) = items.get(field.index) else {
            continue;
        };
        if element.is_null() {
            continue;
        }
        match field.cardinality {
            Cardinality::Single => {
                if let Some(v) = decode_element(element, field)? {
                    message.put_slot(slot, Slot::Single(v));
                }
            }
            Cardinality::Repeated => {
                let list = element
                    .as_array()
                    .ok_or_else(|| DecodeError::shape(field.name, "an array"))?;
                let mut values = Vec::with_capacity(list.len());
                for item in list.iter().filter(|item| !item.is_null()) {
                    if let Some(v) = decode_element(item, field)? {
                        values.push(v);
                    }
                }
                message.put_slot(slot, Slot::Repeated(values));
            }
        }
    }
    Ok(message)
}

/// `Ok(None)` means the element is well-formed but carries nothing this
/// schema can represent (an enum number it does not know).
fn decode_element(element: &WireValue, field: &Field) -> Result<Option<FieldValue>, DecodeError> {
    match field.kind {
        FieldKind::Scalar(kind) => decode_scalar(element, kind)
            .map(|s| Some(FieldValue::Scalar(s)))
            .ok_or_else(|| DecodeError::shape(field.name, kind.describe())),
        FieldKind::Enum(schema) => {
            let number = integer(element)
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| DecodeError::shape(field.name, "an enum number"))?;
            if schema.contains(number) {
                Ok(Some(FieldValue::Enum(number)))
            } else {
                debug!(field = field.name, number, "unknown enum value left unset");
                Ok(None)
            }
        }
        FieldKind::Message(schema) => decode(element, schema).map(|m| Some(FieldValue::Message(m))),
    }
}

fn decode_scalar(element: &WireValue, kind: ScalarKind) -> Option<Scalar> {
    match kind {
        ScalarKind::Int32 => integer(element)
            .filter(|i| i32::try_from(*i).is_ok())
            .map(Scalar::Int),
        ScalarKind::Int64 => integer(element).map(Scalar::Int),
        ScalarKind::UInt64 => match element {
            WireValue::Number(n) => n.as_u64(),
            WireValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .map(Scalar::UInt),
        ScalarKind::Double => match element {
            WireValue::Number(n) => Some(n.as_f64()),
            WireValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .map(Scalar::Double),
        ScalarKind::Bool => match element {
            WireValue::Bool(b) => Some(*b),
            WireValue::Number(n) => match n.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            _ => None,
        }
        .map(Scalar::Bool),
        ScalarKind::String => match element {
            WireValue::String(s) => Some(s.clone()),
            // The service is loose about quoting identifiers that look numeric.
            WireValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
        .map(Scalar::String),
    }
}

/// Integers arrive as integer literals, integral floats, or quoted decimals.
fn integer(element: &WireValue) -> Option<i64> {
    match element {
        WireValue::Number(n) => n.as_i64(),
        WireValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn encode_value(value: &FieldValue) -> WireValue {
    match value {
        FieldValue::Scalar(Scalar::Int(i)) => WireValue::Number(WireNumber::Int(*i)),
        FieldValue::Scalar(Scalar::UInt(u)) => WireValue::Number(WireNumber::from_u64(*u)),
        FieldValue::Scalar(Scalar::Double(d)) => WireValue::Number(WireNumber::Float(*d)),
        FieldValue::Scalar(Scalar::Bool(b)) => WireValue::Number(WireNumber::Int(i64::from(*b))),
        FieldValue::Scalar(Scalar::String(s)) => WireValue::String(s.clone()),
        FieldValue::Enum(n) => WireValue::Number(WireNumber::Int(i64::from(*n))),
        FieldValue::Message(m) => encode(m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EnumSchema;

    static LEVEL: EnumSchema = EnumSchema::new("Level", &[(10, "QUIET"), (30, "RING")]);

    static ID: MessageSchema = MessageSchema::new(
        "Id",
        &[
            Field::scalar("gaia_id", 0, ScalarKind::String),
            Field::scalar("chat_id", 1, ScalarKind::String),
        ],
    );

    static EVENT: MessageSchema = MessageSchema::new(
        "Event",
        &[
            Field::message("sender", 0, &ID),
            Field::scalar("timestamp", 1, ScalarKind::UInt64),
            Field::enumeration("level", 2, &LEVEL),
            Field::scalar("seen", 3, ScalarKind::Bool),
            Field::scalar("text", 5, ScalarKind::String),
            Field::message("watchers", 6, &ID).repeated(),
            Field::scalar("score", 7, ScalarKind::Double),
        ],
    );

    fn id(gaia: &str) -> StructuredMessage {
        StructuredMessage::new(&ID)
            .with("gaia_id", gaia)
            .unwrap()
            .with("chat_id", gaia)
            .unwrap()
    }

    #[test]
    fn decodes_positional_fields() {
        let text = r#"[["1","1"],"1432813484467000",30,1,null,"hi",[["2","2"],["3","3"]]]"#;
        let m = decode_str(text, &EVENT).unwrap();
        assert_eq!(m.get_message("sender"), Some(&id("1")));
        assert_eq!(m.get_u64("timestamp"), Some(1432813484467000));
        assert_eq!(m.get_enum("level"), Some(30));
        assert_eq!(m.get_bool("seen"), Some(true));
        assert_eq!(m.get_str("text"), Some("hi"));
        assert_eq!(m.messages("watchers").count(), 2);
        assert!(!m.is_set("score"));
    }

    #[test]
    fn null_and_missing_elements_stay_unset() {
        let m = decode_str("[null,5]", &EVENT).unwrap();
        assert!(!m.is_set("sender"));
        assert_eq!(m.get_u64("timestamp"), Some(5));
        assert!(!m.is_set("level"));
        assert!(!m.is_set("watchers"));
    }

    #[test]
    fn unknown_enum_number_is_not_an_error() {
        let m = decode_str("[null,null,99]", &EVENT).unwrap();
        assert!(!m.is_set("level"));
    }

    #[test]
    fn empty_repeated_is_distinct_from_unset() {
        let m = decode_str("[null,null,null,null,null,null,[]]", &EVENT).unwrap();
        assert!(m.is_set("watchers"));
        assert_eq!(m.messages("watchers").count(), 0);
        assert_eq!(encode_to_string(&m), "[null,null,null,null,null,null,[]]");
    }

    #[test]
    fn encode_keeps_interior_placeholders_and_trims_tail() {
        let m = StructuredMessage::new(&EVENT)
            .with("level", FieldValue::Enum(10))
            .unwrap()
            .with("seen", false)
            .unwrap()
            .with("text", "x")
            .unwrap();
        assert_eq!(encode_to_string(&m), r#"[null,null,10,0,null,"x"]"#);
    }

    #[test]
    fn round_trip_with_every_kind() {
        let mut m = StructuredMessage::new(&EVENT);
        m.set("sender", id("7"))
            .unwrap()
            .set("timestamp", u64::MAX)
            .unwrap()
            .set("seen", true)
            .unwrap()
            .set("score", 0.5)
            .unwrap()
            .push("watchers", id("8"))
            .unwrap()
            .push("watchers", id("8"))
            .unwrap();
        let decoded = decode(&encode(&m), &EVENT).unwrap();
        assert_eq!(decoded, m);
        let reparsed = decode_str(&encode_to_string(&m), &EVENT).unwrap();
        assert_eq!(reparsed, m);
    }

    #[test]
    fn structural_mismatch_is_a_shape_error() {
        assert_eq!(
            decode_str(r#"["not an array"]"#, &EVENT).unwrap_err(),
            DecodeError::shape("Id", "an array")
        );
        assert_eq!(
            decode_str("[null,null,null,2]", &EVENT).unwrap_err(),
            DecodeError::shape("seen", "a boolean")
        );
        assert!(decode(&WireValue::from("x"), &EVENT).is_err());
    }

    #[test]
    fn tagged_responses() {
        let value = parse_array_literal(r#"["cgcrp","5","6"]"#).unwrap();
        let m = decode_tagged(&value, "cgcrp", &ID).unwrap();
        assert_eq!(m.get_str("gaia_id"), Some("5"));

        let err = decode_tagged(&value, "csanerp", &ID).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnexpectedTag {
                expected: "csanerp".into(),
                found: "\"cgcrp\"".into()
            }
        );
    }

    #[test]
    fn numbers_where_strings_expected_are_accepted() {
        let m = decode_str("[[12345, 12345]]", &EVENT).unwrap();
        assert_eq!(m.get_message("sender"), Some(&id("12345")));
    }
}
