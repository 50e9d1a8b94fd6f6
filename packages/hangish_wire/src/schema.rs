//! Static field schemas.
//!
//! A schema is a table built once per message type: which array position each
//! field lives at, what kind of value it holds, and whether it repeats. The
//! codec interprets these tables; there is no per-message marshalling code.
//!
//! ```
//! use hangish_wire::schema::{Field, MessageSchema, ScalarKind};
//!
//! static CONVERSATION_ID: MessageSchema = MessageSchema::new(
//!     "ConversationId",
//!     &[Field::scalar("id", 0, ScalarKind::String)],
//! );
//! assert_eq!(CONVERSATION_ID.field_slot("id"), Some(0));
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Int32,
    Int64,
    UInt64,
    Double,
    Bool,
    String,
}

impl ScalarKind {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Int32 => "a 32-bit integer",
            Self::Int64 => "a 64-bit integer",
            Self::UInt64 => "an unsigned 64-bit integer",
            Self::Double => "a number",
            Self::Bool => "a boolean",
            Self::String => "a string",
        }
    }
}

#[derive(Clone, Copy)]
pub enum FieldKind {
    Scalar(ScalarKind),
    Enum(&'static EnumSchema),
    Message(&'static MessageSchema),
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Nested schemas may refer back to their parent, so only names are printed.
        match self {
            Self::Scalar(kind) => write!(f, "Scalar({kind:?})"),
            Self::Enum(schema) => write!(f, "Enum({})", schema.name),
            Self::Message(schema) => write!(f, "Message({})", schema.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Single,
    Repeated,
}

/// One field of a message: a name, the array position it occupies on the
/// wire, and its kind.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub index: usize,
    pub kind: FieldKind,
    pub cardinality: Cardinality,
}

impl Field {
    pub const fn scalar(name: &'static str, index: usize, kind: ScalarKind) -> Self {
        Self {
            name,
            index,
            kind: FieldKind::Scalar(kind),
            cardinality: Cardinality::Single,
        }
    }

    pub const fn enumeration(name: &'static str, index: usize, schema: &'static EnumSchema) -> Self {
        Self {
            name,
            index,
            kind: FieldKind::Enum(schema),
            cardinality: Cardinality::Single,
        }
    }

    pub const fn message(name: &'static str, index: usize, schema: &'static MessageSchema) -> Self {
        Self {
            name,
            index,
            kind: FieldKind::Message(schema),
            cardinality: Cardinality::Single,
        }
    }

    /// Same field, holding a list of its kind.
    pub const fn repeated(mut self) -> Self {
        self.cardinality = Cardinality::Repeated;
        self
    }

    pub fn is_repeated(&self) -> bool {
        self.cardinality == Cardinality::Repeated
    }
}

/// Field table for one message type.
///
/// Fields are listed in ascending `index` order. Indices need not be dense:
/// positions no field claims are skipped on decode and written as `null` on
/// encode.
pub struct MessageSchema {
    pub name: &'static str,
    pub fields: &'static [Field],
}

impl MessageSchema {
    pub const fn new(name: &'static str, fields: &'static [Field]) -> Self {
        Self { name, fields }
    }

    /// Position of the named field within `fields`.
    pub fn field_slot(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&'static Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

impl fmt::Debug for MessageSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSchema")
            .field("name", &self.name)
            .field(
                "fields",
                &self.fields.iter().map(|field| field.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Number-to-name table for an enum field.
#[derive(Debug)]
pub struct EnumSchema {
    pub name: &'static str,
    pub values: &'static [(i32, &'static str)],
}

impl EnumSchema {
    pub const fn new(name: &'static str, values: &'static [(i32, &'static str)]) -> Self {
        Self { name, values }
    }

    pub fn contains(&self, number: i32) -> bool {
        self.values.iter().any(|(n, _)| *n == number)
    }

    pub fn name_of(&self, number: i32) -> Option<&'static str> {
        self.values
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, name)| *name)
    }

    pub fn number_of(&self, name: &str) -> Option<i32> {
        self.values
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(number, _)| *number)
    }
}
