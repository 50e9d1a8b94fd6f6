use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::FrameLength;
use crate::channel::deframe::DEFAULT_MAX_FRAME;
use crate::error::ConfigError;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [channel]
//                    watchdog_secs = 45
//
//   env var:         HANGISH_CHANNEL__WATCHDOG_SECS=45   (double underscore = nesting)

/// Browser identity presented to the login and chat servers.
pub const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/34.0.1847.132 Safari/537.36";

const CHAT_ORIGIN: &str = "https://talkgadget.google.com";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub channel: ChannelFileConfig,
    #[serde(default)]
    pub startup: StartupFileConfig,
    #[serde(default)]
    pub rpc: RpcFileConfig,
}

/// Login endpoints (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthFileConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_login_auth_url")]
    pub login_auth_url: String,
    #[serde(default = "default_second_factor_url")]
    pub second_factor_url: String,
    /// Where the login flow lands once signed in.
    #[serde(default = "default_continue_url")]
    pub continue_url: String,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            login_url: default_login_url(),
            login_auth_url: default_login_auth_url(),
            second_factor_url: default_second_factor_url(),
            continue_url: default_continue_url(),
        }
    }
}

/// Push channel tunables (lives under `[channel]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelFileConfig {
    #[serde(default = "default_chat_origin")]
    pub origin: String,
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub frame_length: FrameLength,
}

impl Default for ChannelFileConfig {
    fn default() -> Self {
        Self {
            origin: default_chat_origin(),
            watchdog_secs: default_watchdog_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            frame_length: FrameLength::default(),
        }
    }
}

/// Pages fetched once after login (lives under `[startup]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartupFileConfig {
    #[serde(default = "default_pvt_url")]
    pub pvt_url: String,
    #[serde(default = "default_chat_url")]
    pub chat_url: String,
}

impl Default for StartupFileConfig {
    fn default() -> Self {
        Self {
            pvt_url: default_pvt_url(),
            chat_url: default_chat_url(),
        }
    }
}

/// RPC tunables (lives under `[rpc]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcFileConfig {
    #[serde(default = "default_rpc_endpoint")]
    pub endpoint_url: String,
    /// Origin hashed into the authorization header.
    #[serde(default = "default_chat_origin")]
    pub origin: String,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for RpcFileConfig {
    fn default() -> Self {
        Self {
            endpoint_url: default_rpc_endpoint(),
            origin: default_chat_origin(),
            language: default_language(),
        }
    }
}

fn default_user_agent() -> String {
    USER_AGENT.to_string()
}
fn default_login_url() -> String {
    "https://accounts.google.com/ServiceLogin".to_string()
}
fn default_login_auth_url() -> String {
    "https://accounts.google.com/ServiceLoginAuth".to_string()
}
fn default_second_factor_url() -> String {
    "https://accounts.google.com/SecondFactor".to_string()
}
fn default_continue_url() -> String {
    format!("{CHAT_ORIGIN}/talkgadget/gauth?verify=true")
}
fn default_chat_origin() -> String {
    CHAT_ORIGIN.to_string()
}
fn default_watchdog_secs() -> u64 {
    30
}
fn default_reconnect_delay_ms() -> u64 {
    500
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME
}
fn default_pvt_url() -> String {
    format!("{CHAT_ORIGIN}/talkgadget/_/extension-start")
}
fn default_chat_url() -> String {
    format!("{CHAT_ORIGIN}/u/0/talkgadget/_/chat")
}
fn default_rpc_endpoint() -> String {
    "https://clients6.google.com/chat/v1/".to_string()
}
fn default_language() -> String {
    "en".to_string()
}

/// Build a figment that layers: defaults → config.toml → HANGISH_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `HANGISH_CHANNEL__WATCHDOG_SECS=45`  →  `channel.watchdog_secs = 45`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("HANGISH_").split("__"))
}

impl FileConfig {
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        Ok(load_config(data_dir).extract()?)
    }

    /// The effective configuration as config.toml text.
    pub fn render(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthConfig {
    pub user_agent: String,
    pub login_url: String,
    pub login_auth_url: String,
    pub second_factor_url: String,
    pub continue_url: String,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            user_agent: fc.user_agent.clone(),
            login_url: fc.login_url.clone(),
            login_auth_url: fc.login_auth_url.clone(),
            second_factor_url: fc.second_factor_url.clone(),
            continue_url: fc.continue_url.clone(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::from_file(&AuthFileConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub origin: String,
    /// Silence on an open long-poll longer than this forces a reconnect.
    pub watchdog: Duration,
    /// Pause before reopening a finished long-poll.
    pub reconnect_delay: Duration,
    pub max_frame_bytes: usize,
    pub frame_length: FrameLength,
}

impl ChannelConfig {
    pub fn from_file(fc: &ChannelFileConfig) -> Self {
        Self {
            origin: fc.origin.trim_end_matches('/').to_string(),
            watchdog: Duration::from_secs(fc.watchdog_secs),
            reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
            max_frame_bytes: fc.max_frame_bytes,
            frame_length: fc.frame_length,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from_file(&ChannelFileConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartupConfigUrls {
    pub pvt_url: String,
    pub chat_url: String,
}

impl StartupConfigUrls {
    pub fn from_file(fc: &StartupFileConfig) -> Self {
        Self {
            pvt_url: fc.pvt_url.clone(),
            chat_url: fc.chat_url.clone(),
        }
    }
}

impl Default for StartupConfigUrls {
    fn default() -> Self {
        Self::from_file(&StartupFileConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcConfig {
    /// Ends in `/`; the endpoint name is appended.
    pub endpoint_url: String,
    pub origin: String,
    pub language: String,
}

impl RpcConfig {
    pub fn from_file(fc: &RpcFileConfig) -> Self {
        let mut endpoint_url = fc.endpoint_url.clone();
        if !endpoint_url.ends_with('/') {
            endpoint_url.push('/');
        }
        Self {
            endpoint_url,
            origin: fc.origin.trim_end_matches('/').to_string(),
            language: fc.language.clone(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self::from_file(&RpcFileConfig::default())
    }
}

// =============================================================================
// Directory layout (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HangishPaths {
    pub data_dir: PathBuf,
}

impl HangishPaths {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir().ok_or(ConfigError::NoHomeDir)?.join(".hangish"),
        };
        std::fs::create_dir_all(&data_dir).map_err(|source| ConfigError::DataDir {
            path: data_dir.clone(),
            source,
        })?;
        Ok(Self { data_dir })
    }

    pub fn cookie_path(&self) -> PathBuf {
        self.data_dir.join("cookies.json")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
