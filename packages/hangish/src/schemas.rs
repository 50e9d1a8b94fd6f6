//! Field tables for the protocol messages this crate reads and writes.
//!
//! Indices are array positions on the wire, not protobuf field numbers.

use hangish_wire::{EnumSchema, Field, MessageSchema, ScalarKind};

// ── Startup blocks ──────────────────────────────────────────────────

/// `cin:cac`: the API key for RPC calls.
pub static CHAT_API_CONFIGURATION: MessageSchema = MessageSchema::new(
    "ChatApiConfiguration",
    &[Field::scalar("key", 1, ScalarKind::String)],
);

/// `cin:bcsc`: push channel parameters.
pub static EC_CONFIGURATION: MessageSchema = MessageSchema::new(
    "EcConfiguration",
    &[
        Field::scalar("channel_path", 1, ScalarKind::String),
        Field::scalar("ec_param", 3, ScalarKind::String),
        Field::scalar("prop_param", 4, ScalarKind::String),
        Field::scalar("header_id", 6, ScalarKind::String),
    ],
);

/// `cin:acc`: values echoed back in every request header.
pub static CHAT_INIT_PARAMETERS: MessageSchema = MessageSchema::new(
    "ChatInitParameters",
    &[
        Field::scalar("header_date", 3, ScalarKind::String),
        Field::scalar("header_version", 5, ScalarKind::String),
    ],
);

pub static PVT_TOKEN: MessageSchema = MessageSchema::new(
    "PvtToken",
    &[Field::scalar("token", 0, ScalarKind::String)],
);

// ── Request header ──────────────────────────────────────────────────

pub static CLIENT_ID: EnumSchema = EnumSchema::new(
    "ClientId",
    &[
        (0, "UNKNOWN"),
        (1, "ANDROID"),
        (2, "IOS"),
        (3, "QUASAR"),
        (4, "WEB_GPLUS"),
        (5, "WEB_GMAIL"),
        (44, "WEB_HANGOUTS"),
    ],
);

pub static BUILD_TYPE: EnumSchema = EnumSchema::new(
    "BuildType",
    &[(0, "UNKNOWN"), (1, "PRODUCTION_WEB"), (3, "PRODUCTION")],
);

pub static CLIENT_VERSION: MessageSchema = MessageSchema::new(
    "ClientVersion",
    &[
        Field::enumeration("client_id", 0, &CLIENT_ID),
        Field::enumeration("build_type", 1, &BUILD_TYPE),
        Field::scalar("major_version", 2, ScalarKind::String),
        Field::scalar("version", 3, ScalarKind::Int64),
    ],
);

pub static CLIENT_IDENTIFIER: MessageSchema = MessageSchema::new(
    "ClientIdentifier",
    &[
        Field::scalar("resource", 0, ScalarKind::String),
        Field::scalar("header_id", 1, ScalarKind::String),
    ],
);

pub static REQUEST_HEADER: MessageSchema = MessageSchema::new(
    "RequestHeader",
    &[
        Field::message("client_version", 0, &CLIENT_VERSION),
        Field::message("client_identifier", 1, &CLIENT_IDENTIFIER),
        Field::scalar("language_code", 3, ScalarKind::String),
    ],
);

// ── Push updates ────────────────────────────────────────────────────

pub static ACTIVE_CLIENT_STATE: EnumSchema = EnumSchema::new(
    "ActiveClientState",
    &[(0, "NO_ACTIVE"), (1, "IS_ACTIVE"), (2, "OTHER_ACTIVE")],
);

pub static EVENT_TYPE: EnumSchema = EnumSchema::new(
    "EventType",
    &[
        (0, "UNKNOWN"),
        (1, "REGULAR_CHAT_MESSAGE"),
        (2, "SMS"),
        (3, "VOICEMAIL"),
        (4, "ADD_USER"),
        (5, "REMOVE_USER"),
        (6, "CONVERSATION_RENAME"),
        (7, "HANGOUT"),
        (8, "PHONE_CALL"),
        (9, "OTR_MODIFICATION"),
        (10, "PLAN_MUTATION"),
        (11, "MMS"),
        (13, "OBSERVED_EVENT"),
        (14, "GROUP_LINK_SHARING_MODIFICATION"),
    ],
);

pub static SEGMENT_TYPE: EnumSchema =
    EnumSchema::new("SegmentType", &[(0, "TEXT"), (1, "LINE_BREAK"), (2, "LINK")]);

pub static TYPING_TYPE: EnumSchema = EnumSchema::new(
    "TypingType",
    &[(0, "UNKNOWN"), (1, "STARTED"), (2, "PAUSED"), (3, "STOPPED")],
);

pub static CONVERSATION_ID: MessageSchema = MessageSchema::new(
    "ConversationId",
    &[Field::scalar("id", 0, ScalarKind::String)],
);

pub static PARTICIPANT_ID: MessageSchema = MessageSchema::new(
    "ParticipantId",
    &[
        Field::scalar("gaia_id", 0, ScalarKind::String),
        Field::scalar("chat_id", 1, ScalarKind::String),
    ],
);

pub static FORMATTING: MessageSchema = MessageSchema::new(
    "Formatting",
    &[
        Field::scalar("bold", 0, ScalarKind::Bool),
        Field::scalar("italic", 1, ScalarKind::Bool),
        Field::scalar("strikethrough", 2, ScalarKind::Bool),
        Field::scalar("underline", 3, ScalarKind::Bool),
    ],
);

pub static LINK_DATA: MessageSchema = MessageSchema::new(
    "LinkData",
    &[Field::scalar("link_target", 0, ScalarKind::String)],
);

pub static SEGMENT: MessageSchema = MessageSchema::new(
    "Segment",
    &[
        Field::enumeration("type", 0, &SEGMENT_TYPE),
        Field::scalar("text", 1, ScalarKind::String),
        Field::message("formatting", 2, &FORMATTING),
        Field::message("link_data", 3, &LINK_DATA),
    ],
);

pub static MESSAGE_CONTENT: MessageSchema = MessageSchema::new(
    "MessageContent",
    &[Field::message("segment", 0, &SEGMENT).repeated()],
);

pub static CHAT_MESSAGE: MessageSchema = MessageSchema::new(
    "ChatMessage",
    &[Field::message("message_content", 2, &MESSAGE_CONTENT)],
);

pub static EVENT: MessageSchema = MessageSchema::new(
    "Event",
    &[
        Field::message("conversation_id", 0, &CONVERSATION_ID),
        Field::message("sender_id", 1, &PARTICIPANT_ID),
        Field::scalar("timestamp", 2, ScalarKind::UInt64),
        Field::message("chat_message", 6, &CHAT_MESSAGE),
        Field::scalar("event_id", 11, ScalarKind::String),
        Field::scalar("advances_sort_timestamp", 14, ScalarKind::Bool),
        Field::enumeration("event_type", 22, &EVENT_TYPE),
    ],
);

pub static EVENT_NOTIFICATION: MessageSchema = MessageSchema::new(
    "EventNotification",
    &[Field::message("event", 0, &EVENT)],
);

pub static TYPING_NOTIFICATION: MessageSchema = MessageSchema::new(
    "TypingNotification",
    &[
        Field::message("conversation_id", 0, &CONVERSATION_ID),
        Field::message("sender_id", 1, &PARTICIPANT_ID),
        Field::scalar("timestamp", 2, ScalarKind::UInt64),
        Field::enumeration("type", 3, &TYPING_TYPE),
    ],
);

pub static WATERMARK_NOTIFICATION: MessageSchema = MessageSchema::new(
    "WatermarkNotification",
    &[
        Field::message("sender_id", 0, &PARTICIPANT_ID),
        Field::message("conversation_id", 1, &CONVERSATION_ID),
        Field::scalar("latest_read_timestamp", 2, ScalarKind::UInt64),
    ],
);

pub static STATE_UPDATE_HEADER: MessageSchema = MessageSchema::new(
    "StateUpdateHeader",
    &[
        Field::enumeration("active_client_state", 0, &ACTIVE_CLIENT_STATE),
        Field::scalar("request_trace_id", 2, ScalarKind::String),
        Field::scalar("current_server_time", 4, ScalarKind::UInt64),
    ],
);

pub static STATE_UPDATE: MessageSchema = MessageSchema::new(
    "StateUpdate",
    &[
        Field::message("state_update_header", 0, &STATE_UPDATE_HEADER),
        Field::message("event_notification", 2, &EVENT_NOTIFICATION),
        Field::message("typing_notification", 4, &TYPING_NOTIFICATION),
        Field::message("watermark_notification", 7, &WATERMARK_NOTIFICATION),
    ],
);

/// `cbu`: one push of state updates.
pub static BATCH_UPDATE: MessageSchema = MessageSchema::new(
    "BatchUpdate",
    &[Field::message("state_update", 0, &STATE_UPDATE).repeated()],
);
