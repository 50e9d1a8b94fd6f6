//! Error types and stable error codes.

use std::path::PathBuf;

use hangish_wire::DecodeError;

/// Failure of the HTTP primitive itself, before a status code is known or
/// while reading the body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("reading response body failed: {0}")]
    Body(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CookieFileError {
    #[error("cannot read cookie file {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("cannot write cookie file {path:?}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("cookie file {path:?} is not a JSON object of strings: {reason}")]
    Parse { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("wrong credentials")]
    WrongCredentials,

    #[error("wrong second-factor pin")]
    WrongSecondFactorPin,

    #[error("could not obtain the login token: {0}")]
    TokenFetchFailed(String),

    #[error("authentication failed: {0}")]
    Unknown(String),

    #[error("cannot {action} while {actual}")]
    InvalidState {
        action: &'static str,
        actual: &'static str,
    },

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    CookieFile(#[from] CookieFileError),
}

impl AuthError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::WrongCredentials => "wrong_credentials",
            Self::WrongSecondFactorPin => "wrong_second_factor_pin",
            Self::TokenFetchFailed(_) => "token_fetch_failed",
            Self::Unknown(_) => "unknown",
            Self::InvalidState { .. } => "invalid_state",
            Self::Http(_) => "http",
            Self::CookieFile(_) => "cookie_file",
        }
    }

    /// Whether the caller may simply try the same step again.
    ///
    /// Credential and PIN failures are never retryable: the user has to
    /// supply something different.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TokenFetchFailed(_) | Self::Http(_))
    }
}

/// Why a push channel entered its terminal error state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelFailure {
    #[error("unauthorized; sign in again")]
    Unauthorized,

    #[error("transport failure{}: {reason}", http_suffix(.status))]
    Transport { status: Option<u16>, reason: String },
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl ChannelFailure {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Transport { .. } => "transport",
        }
    }
}

/// Framing violation in the long-poll byte stream. The buffered bytes are
/// discarded; the stream itself carries on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeframeError {
    #[error("invalid frame length line: {0:?}")]
    InvalidLength(String),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("server answered HTTP {status}")]
    Status { status: u16, body: String },

    #[error("undecodable reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("no SAPISID cookie; not signed in")]
    NotSignedIn,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("startup request answered HTTP {0}")]
    Status(u16),

    #[error("too many redirects while loading {0}")]
    TooManyRedirects(String),

    #[error("no `{0}` block in the chat page")]
    MissingBlock(&'static str),

    #[error("`{block}` block has no `{field}`")]
    MissingField {
        block: &'static str,
        field: &'static str,
    },

    #[error("`{block}` block is malformed: {source}")]
    Decode {
        block: &'static str,
        #[source]
        source: DecodeError,
    },

    #[error("no pvt token in the extension-start response")]
    MissingPvtToken,
}

impl StartupError {
    /// The stored cookies no longer grant a session; a fresh login is needed.
    pub fn is_session_stale(&self) -> bool {
        matches!(
            self,
            Self::MissingPvtToken | Self::MissingBlock("cin:cac") | Self::Status(401)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Figment(#[from] figment::Error),

    #[error("cannot render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("cannot create data directory {path:?}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no home directory; pass a data directory explicitly")]
    NoHomeDir,
}
