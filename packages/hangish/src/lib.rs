//! Client plumbing for the chat service.
//!
//! - [`auth`]: the login handshake and the persisted cookie file.
//! - [`startup`]: post-login page scraping for the API key and channel
//!   parameters.
//! - [`channel`]: the long-poll push channel.
//! - [`client`]: ties the above together and submits RPC calls.
//!
//! Everything that talks HTTP goes through one [`SessionContext`], which owns
//! the transport and the shared cookie store.

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod context;
pub mod cookies;
pub mod error;
pub mod http;
pub mod schemas;
pub mod startup;

#[cfg(test)]
mod testing;

pub use auth::{AuthEvent, AuthOutcome, AuthSession, AuthState};
pub use channel::{ChannelEvent, ChannelStatus, PushChannel};
pub use client::{Client, ClientConfig, RequestHandle, RpcEvent};
pub use config::{FileConfig, HangishPaths};
pub use context::SessionContext;
pub use cookies::{CookieFile, CookieStore, SessionCookieSet};
pub use error::{AuthError, ChannelFailure, RpcError, StartupError};
pub use http::{HttpTransport, ReqwestTransport};
