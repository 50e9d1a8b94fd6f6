//! The long-poll push channel.
//!
//! - [`deframe`]: splits the streamed body into frames.
//! - [`submission`]: pulls batch updates out of a frame.
//! - [`negotiate`]: parses the session negotiation reply.
//! - [`machine`]: the sans-IO state machine deciding what happens next.
//! - [`driver`]: runs the machine on tokio, owning requests and timers.

pub mod deframe;
pub mod driver;
pub mod machine;
pub mod negotiate;
pub mod submission;

use std::fmt;

use chrono::{DateTime, Utc};
use hangish_wire::StructuredMessage;

use crate::error::ChannelFailure;

pub use deframe::{Deframer, FrameLength};
pub use driver::PushChannel;
pub use machine::ChannelMachine;
pub use negotiate::NegotiatedSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Inactive,
    Connecting,
    Active,
    /// Terminal. A fresh login and a new channel are needed.
    PermanentError(ChannelFailure),
}

impl ChannelStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PermanentError(_))
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::PermanentError(failure) => write!(f, "failed: {failure}"),
        }
    }
}

/// Everything a channel reports to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StatusChanged(ChannelStatus),
    BatchUpdate(StructuredMessage),
    /// Server replaced the values of these cookies.
    CookiesRotated(Vec<String>),
    /// Negotiation handed out a new client id for RPC headers.
    ClientIdUpdated(String),
    /// Data is flowing again after a reconnect. Events pushed after
    /// `last_push` may have been missed.
    Restored { last_push: Option<DateTime<Utc>> },
    FrameDropped { reason: String },
}

/// Per-startup channel parameters, scraped from the chat page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelParams {
    /// Path under the origin, ending in `/`.
    pub path: String,
    pub ec_param: String,
    pub prop_param: String,
    /// Sent as `clid`.
    pub header_client_id: String,
}

/// Everything a long-poll request needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSession {
    pub sid: String,
    pub gsession_id: Option<String>,
    pub client_id: Option<String>,
    pub header_client_id: String,
    pub path: String,
    pub ec_param: String,
    pub prop_param: String,
}

impl ChannelSession {
    pub fn new(params: &ChannelParams, negotiated: NegotiatedSession) -> Self {
        Self {
            sid: negotiated.sid,
            gsession_id: negotiated.gsession_id,
            client_id: negotiated.client_id,
            header_client_id: params.header_client_id.clone(),
            path: params.path.clone(),
            ec_param: params.ec_param.clone(),
            prop_param: params.prop_param.clone(),
        }
    }
}
