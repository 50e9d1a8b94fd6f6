//! Structured messages: typed field values laid out by a [`MessageSchema`].

use std::fmt;

use crate::error::FieldError;
use crate::schema::{Cardinality, Field, FieldKind, MessageSchema, ScalarKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    UInt(u64),
    Double(f64),
    Bool(bool),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar(Scalar),
    Enum(i32),
    Message(StructuredMessage),
}

impl FieldValue {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Scalar(Scalar::Int(_)) => "an integer",
            Self::Scalar(Scalar::UInt(_)) => "an unsigned integer",
            Self::Scalar(Scalar::Double(_)) => "a number",
            Self::Scalar(Scalar::Bool(_)) => "a boolean",
            Self::Scalar(Scalar::String(_)) => "a string",
            Self::Enum(_) => "an enum value",
            Self::Message(_) => "a message",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Scalar(Scalar::Int(i)) => Some(*i),
            Self::Scalar(Scalar::UInt(u)) => i64::try_from(*u).ok(),
            Self::Enum(n) => Some(i64::from(*n)),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&StructuredMessage> {
        match self {
            Self::Message(m) => Some(m),
            _ => None,
        }
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Scalar(Scalar::Int(i64::from(v)))
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Scalar(Scalar::Int(v))
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::Scalar(Scalar::UInt(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Scalar(Scalar::Double(v))
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Scalar(Scalar::Bool(v))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Scalar(Scalar::String(v.to_string()))
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Scalar(Scalar::String(v))
    }
}

impl From<StructuredMessage> for FieldValue {
    fn from(v: StructuredMessage) -> Self {
        Self::Message(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot {
    Single(FieldValue),
    Repeated(Vec<FieldValue>),
}

/// A message instance. Every field is either unset or holds a value of the
/// kind its schema declares; an empty repeated field is set, not unset.
#[derive(Clone)]
pub struct StructuredMessage {
    schema: &'static MessageSchema,
    slots: Vec<Option<Slot>>,
}

impl StructuredMessage {
    pub fn new(schema: &'static MessageSchema) -> Self {
        Self {
            schema,
            slots: vec![None; schema.fields.len()],
        }
    }

    pub fn schema(&self) -> &'static MessageSchema {
        self.schema
    }

    /// Set a single-valued field.
    pub fn set(
        &mut self,
        name: &str,
        value: impl Into<FieldValue>,
    ) -> Result<&mut Self, FieldError> {
        let (slot, field) = self.lookup(name)?;
        if field.is_repeated() {
            return Err(FieldError::Repeated(field.name));
        }
        let value = coerce(field, value.into())?;
        self.slots[slot] = Some(Slot::Single(value));
        Ok(self)
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Result<Self, FieldError> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Append to a repeated field, marking it set.
    pub fn push(
        &mut self,
        name: &str,
        value: impl Into<FieldValue>,
    ) -> Result<&mut Self, FieldError> {
        let (slot, field) = self.lookup(name)?;
        if !field.is_repeated() {
            return Err(FieldError::NotRepeated(field.name));
        }
        let value = coerce(field, value.into())?;
        match &mut self.slots[slot] {
            Some(Slot::Repeated(items)) => items.push(value),
            other => *other = Some(Slot::Repeated(vec![value])),
        }
        Ok(self)
    }

    /// Replace a repeated field wholesale. An empty vector leaves the field
    /// set with zero elements.
    pub fn set_repeated(
        &mut self,
        name: &str,
        values: Vec<FieldValue>,
    ) -> Result<&mut Self, FieldError> {
        let (slot, field) = self.lookup(name)?;
        if !field.is_repeated() {
            return Err(FieldError::NotRepeated(field.name));
        }
        let values = values
            .into_iter()
            .map(|v| coerce(field, v))
            .collect::<Result<Vec<_>, _>>()?;
        self.slots[slot] = Some(Slot::Repeated(values));
        Ok(self)
    }

    pub fn clear(&mut self, name: &str) -> Result<&mut Self, FieldError> {
        let (slot, _) = self.lookup(name)?;
        self.slots[slot] = None;
        Ok(self)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.schema
            .field_slot(name)
            .is_some_and(|slot| self.slots[slot].is_some())
    }

    /// Value of a single-valued field. `None` when unset, repeated, or unknown.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        let slot = self.schema.field_slot(name)?;
        match &self.slots[slot] {
            Some(Slot::Single(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            FieldValue::Scalar(Scalar::Int(i)) => Some(*i),
            FieldValue::Scalar(Scalar::UInt(u)) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            FieldValue::Scalar(Scalar::UInt(u)) => Some(*u),
            FieldValue::Scalar(Scalar::Int(i)) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            FieldValue::Scalar(Scalar::Double(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            FieldValue::Scalar(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_enum(&self, name: &str) -> Option<i32> {
        match self.get(name)? {
            FieldValue::Enum(n) => Some(*n),
            _ => None,
        }
    }

    pub fn get_message(&self, name: &str) -> Option<&StructuredMessage> {
        self.get(name).and_then(FieldValue::as_message)
    }

    /// Elements of a repeated field; empty when unset.
    pub fn get_repeated(&self, name: &str) -> &[FieldValue] {
        let Some(slot) = self.schema.field_slot(name) else {
            return &[];
        };
        match &self.slots[slot] {
            Some(Slot::Repeated(items)) => items,
            _ => &[],
        }
    }

    /// Message elements of a repeated message field.
    pub fn messages<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a StructuredMessage> + 'a {
        self.get_repeated(name)
            .iter()
            .filter_map(FieldValue::as_message)
    }

    pub(crate) fn slot(&self, slot: usize) -> Option<&Slot> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub(crate) fn put_slot(&mut self, slot: usize, value: Slot) {
        self.slots[slot] = Some(value);
    }

    fn lookup(&self, name: &str) -> Result<(usize, &'static Field), FieldError> {
        let slot = self
            .schema
            .field_slot(name)
            .ok_or_else(|| FieldError::UnknownField {
                message: self.schema.name,
                field: name.to_string(),
            })?;
        Ok((slot, &self.schema.fields[slot]))
    }
}

/// Check `value` against the field's kind, widening where the conversion is
/// lossless.
fn coerce(field: &Field, value: FieldValue) -> Result<FieldValue, FieldError> {
    let mismatch = |value: &FieldValue| FieldError::KindMismatch {
        field: field.name,
        found: value.kind_name(),
    };

    let ok = match (&field.kind, value) {
        (FieldKind::Scalar(ScalarKind::Int32), FieldValue::Scalar(Scalar::Int(i))) => {
            if i32::try_from(i).is_err() {
                return Err(FieldError::KindMismatch {
                    field: field.name,
                    found: "an out-of-range integer",
                });
            }
            FieldValue::Scalar(Scalar::Int(i))
        }
        (FieldKind::Scalar(ScalarKind::Int64), FieldValue::Scalar(Scalar::Int(i))) => {
            FieldValue::Scalar(Scalar::Int(i))
        }
        (FieldKind::Scalar(ScalarKind::Int64), FieldValue::Scalar(Scalar::UInt(u))) => {
            let i = i64::try_from(u).map_err(|_| FieldError::KindMismatch {
                field: field.name,
                found: "an out-of-range integer",
            })?;
            FieldValue::Scalar(Scalar::Int(i))
        }
        (FieldKind::Scalar(ScalarKind::UInt64), FieldValue::Scalar(Scalar::UInt(u))) => {
            FieldValue::Scalar(Scalar::UInt(u))
        }
        (FieldKind::Scalar(ScalarKind::UInt64), FieldValue::Scalar(Scalar::Int(i))) => {
            let u = u64::try_from(i).map_err(|_| FieldError::KindMismatch {
                field: field.name,
                found: "a negative integer",
            })?;
            FieldValue::Scalar(Scalar::UInt(u))
        }
        (FieldKind::Scalar(ScalarKind::Double), FieldValue::Scalar(Scalar::Double(d))) => {
            FieldValue::Scalar(Scalar::Double(d))
        }
        (FieldKind::Scalar(ScalarKind::Double), FieldValue::Scalar(Scalar::Int(i))) => {
            FieldValue::Scalar(Scalar::Double(i as f64))
        }
        (FieldKind::Scalar(ScalarKind::Bool), v @ FieldValue::Scalar(Scalar::Bool(_))) => v,
        (FieldKind::Scalar(ScalarKind::String), v @ FieldValue::Scalar(Scalar::String(_))) => v,
        (FieldKind::Enum(schema), FieldValue::Enum(n)) => {
            if !schema.contains(n) {
                return Err(FieldError::KindMismatch {
                    field: field.name,
                    found: "an unknown enum value",
                });
            }
            FieldValue::Enum(n)
        }
        (FieldKind::Message(schema), FieldValue::Message(m)) if std::ptr::eq(*schema, m.schema) => {
            FieldValue::Message(m)
        }
        (_, other) => return Err(mismatch(&other)),
    };
    Ok(ok)
}

impl PartialEq for StructuredMessage {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.schema, other.schema) && self.slots == other.slots
    }
}

impl fmt::Debug for StructuredMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct(self.schema.name);
        for (field, slot) in self.schema.fields.iter().zip(&self.slots) {
            match slot {
                Some(Slot::Single(v)) => out.field(field.name, v),
                Some(Slot::Repeated(items)) => out.field(field.name, items),
                None => continue,
            };
        }
        out.finish()
    }
}
