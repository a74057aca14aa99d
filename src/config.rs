use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::{ConversationIdStrategy, ConvoflowError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// snapshot repository config
    pub repository: RepositoryConfig,
    /// conversation manager config
    pub conversation: ConversationConfig,
    /// flow execution config
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// snapshots kept per conversation, 0 keeps all, defaults to 30
    pub max_snapshots: usize,
    /// mint a new snapshot id on every put, defaults to true
    pub always_generate_new_next_key: bool,
    /// gzip snapshot payloads, defaults to false
    pub compress_snapshots: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// live conversations kept in memory, defaults to 5000
    pub max_conversations: u64,
    /// seconds a conversation may stay untouched, 0 disables expiry, defaults to 1800
    pub idle_timeout_secs: u64,
    /// milliseconds to wait for a conversation lock, defaults to 30000
    pub lock_timeout_ms: u64,
    /// conversation id format
    pub id_strategy: ConversationIdStrategy,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// redirect to the paused execution before every render, defaults to false
    pub always_redirect_on_pause: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 30,
            always_generate_new_next_key: true,
            compress_snapshots: false,
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_conversations: 5000,
            idle_timeout_secs: 1800,
            lock_timeout_ms: 30_000,
            id_strategy: ConversationIdStrategy::Uuid,
        }
    }
}

impl ConversationConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Config {
    pub fn create<T: AsRef<Path>>(path: T) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref()).map_err(|e| ConvoflowError::Config(format!("failed to load config file {:?}: {}", path.as_ref(), e)))?;

        Self::load_from_str(data.as_str())
    }

    pub fn load_from_str(toml_str: &str) -> Result<Self> {
        let config = toml::from_str::<Config>(toml_str).map_err(|e| ConvoflowError::Config(format!("failed to parse the toml str: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.conversation.max_conversations == 0 {
            return Err(ConvoflowError::Config("conversation.max_conversations must be greater than 0".to_string()));
        }
        if self.conversation.lock_timeout_ms == 0 {
            return Err(ConvoflowError::Config("conversation.lock_timeout_ms must be greater than 0".to_string()));
        }
        Ok(())
    }
}
