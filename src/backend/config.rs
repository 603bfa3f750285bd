use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::twitch::{Result, TwitchError};

/// User tokens live about four hours; a larger margin would refresh nonstop
const MAX_REFRESH_MARGIN_SECS: u64 = 3600;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    pub broadcaster_login: String,
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Login of the account the bot chats as. Without it the owner of the
    /// user token is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_login: Option<String>,
    /// Seed for the credentials slot, rewritten every time tokens rotate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub keepalive_tolerance: f64,
    pub refresh_margin_secs: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_tolerance: 1.5,
            refresh_margin_secs: 300,
            max_reconnect_attempts: 5,
        }
    }
}

fn default_scopes() -> Vec<String> {
    vec!["user:read:chat".to_string(), "user:write:chat".to_string()]
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            TwitchError::ConfigMissing(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            TwitchError::ConfigMissing(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| TwitchError::ConfigMissing(format!("cannot serialize config: {}", e)))?;
        fs::write(path, content).map_err(|e| {
            TwitchError::ConfigMissing(format!("cannot write {}: {}", path.display(), e))
        })
    }

    /// Every required field must be non-empty
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("broadcaster_login", &self.broadcaster_login),
            ("redirect_uri", &self.redirect_uri),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(TwitchError::ConfigMissing(format!("{} is empty", name)));
            }
        }
        self.session.validate()
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        let tolerance = self.keepalive_tolerance;
        if !(tolerance.is_finite() && tolerance > 1.0) {
            return Err(TwitchError::ConfigMissing(format!(
                "session.keepalive_tolerance must be a finite number greater than 1, got {}",
                tolerance
            )));
        }
        if self.refresh_margin_secs > MAX_REFRESH_MARGIN_SECS {
            return Err(TwitchError::ConfigMissing(format!(
                "session.refresh_margin_secs must be at most {}, got {}",
                MAX_REFRESH_MARGIN_SECS, self.refresh_margin_secs
            )));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(TwitchError::ConfigMissing(
                "session.max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// `config.toml` at the project root, or in the working directory when no
/// project root can be found
pub fn config_path() -> PathBuf {
    project_root::get_project_root()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("config.toml")
}

/// Persist a rotated refresh token, leaving the rest of the file untouched
pub fn save_refresh_token<P: AsRef<Path>>(path: P, refresh_token: &str) -> Result<()> {
    let path = path.as_ref();
    let mut config = Config::from_file(path)?;
    config.refresh_token = Some(refresh_token.to_string());
    config.to_file(path)
}

/// Where the cache gets its configuration from
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<Config>;
}

pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileConfigSource {
    fn default() -> Self {
        Self::new(config_path())
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<Config> {
        Config::from_file(&self.path)
    }
}

/// Fixed in-memory configuration
impl ConfigSource for Config {
    fn load(&self) -> Result<Config> {
        self.validate()?;
        Ok(self.clone())
    }
}
