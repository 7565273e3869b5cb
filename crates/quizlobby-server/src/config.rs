use std::time::Duration;

use serde::Deserialize;

use quizlobby_core::session::DEFAULT_TOTAL_QUESTIONS;

const CONFIG_FILE: &str = "quizlobby.toml";

/// Top-level server configuration, loaded from `quizlobby.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub limits: LimitsConfig,
    pub store: StoreConfig,
    pub presence: PresenceConfig,
    pub lobby: LobbyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            limits: LimitsConfig::default(),
            store: StoreConfig::default(),
            presence: PresenceConfig::default(),
            lobby: LobbyConfig::default(),
        }
    }
}

/// Infrastructure limits (connection caps, buffer sizes).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    /// Outbound frames queued per connection before sends start dropping.
    pub player_message_buffer: usize,
    pub max_message_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 500,
            player_message_buffer: 256,
            max_message_size: quizlobby_core::net::protocol::MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Deadline for any single roster store call.
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How a member coming back from an absence is restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceRecovery {
    /// Always come back as `joined`.
    #[default]
    Reset,
    /// Come back with the status held before the absence.
    Restore,
}

impl std::str::FromStr for PresenceRecovery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reset" => Ok(Self::Reset),
            "restore" => Ok(Self::Restore),
            other => Err(format!("unknown presence recovery policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub recovery: PresenceRecovery,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LobbyConfig {
    /// Written into new lobby settings that do not name a question count.
    pub default_total_questions: u32,
    pub max_name_len: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            default_total_questions: DEFAULT_TOTAL_QUESTIONS,
            max_name_len: 64,
        }
    }
}

impl ServerConfig {
    /// Check invariants the server relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "listen_addr is not a valid socket address: {}",
                self.listen_addr
            ));
        }
        if self.limits.max_ws_connections == 0 {
            return Err("limits.max_ws_connections must be > 0".into());
        }
        if self.limits.player_message_buffer == 0 {
            return Err("limits.player_message_buffer must be > 0".into());
        }
        if self.limits.max_message_size == 0 {
            return Err("limits.max_message_size must be > 0".into());
        }
        if self.store.timeout_ms == 0 {
            return Err("store.timeout_ms must be > 0".into());
        }
        if self.lobby.default_total_questions == 0 {
            return Err("lobby.default_total_questions must be > 0".into());
        }
        if self.lobby.max_name_len == 0 {
            return Err("lobby.max_name_len must be > 0".into());
        }
        Ok(())
    }

    /// Load config from `quizlobby.toml` if it exists, then apply env var
    /// overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string(CONFIG_FILE) {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from {CONFIG_FILE}");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse {CONFIG_FILE}: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No {CONFIG_FILE} found, using defaults");
                ServerConfig::default()
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from `lookup`, normally the process environment.
    /// Empty or unparsable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("QUIZLOBBY_LISTEN_ADDR")
            && !addr.is_empty()
        {
            self.listen_addr = addr;
        }
        if let Some(val) = lookup("QUIZLOBBY_STORE_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            self.store.timeout_ms = ms;
        }
        if let Some(val) = lookup("QUIZLOBBY_PRESENCE_RECOVERY") {
            match val.parse::<PresenceRecovery>() {
                Ok(policy) => self.presence.recovery = policy,
                Err(e) => tracing::warn!("Ignoring QUIZLOBBY_PRESENCE_RECOVERY: {e}"),
            }
        }
        if let Some(val) = lookup("QUIZLOBBY_PLAYER_BUFFER")
            && let Ok(n) = val.parse::<usize>()
        {
            self.limits.player_message_buffer = n;
        }
    }
}
