//! Process settings, read from an optional TOML file and `HORNBEAM_*`
//! environment variables (`__` separates nested keys, e.g.
//! `HORNBEAM_QUEUE__CAPACITY=8`).

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    controller::{DEFAULT_QUEUE_CAPACITY, QueuePolicy},
    entity::{GuildId, IdValidationError, UserId},
    stats::{ClipKey, KeyFormat},
    worker::PlaybackTiming,
};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid shard {0:?}, expected a single digit")]
    InvalidShard(String),

    #[error("invalid guild id {id:?} in queue overrides: {source}")]
    InvalidGuild {
        id: String,
        source: IdValidationError,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub catalog_path: PathBuf,
    pub audio_dir: PathBuf,
    pub queue: QueueSettings,
    pub playback: PlaybackSettings,
    /// Guild partition served by this process, empty for all guilds.
    pub shards: Vec<String>,
    /// The operator allowed to issue control commands.
    pub owner: Option<UserId>,
    pub stats: StatsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("assets/catalog.toml"),
            audio_dir: PathBuf::from("audio"),
            queue: QueueSettings::default(),
            playback: PlaybackSettings::default(),
            shards: Vec::new(),
            owner: None,
            stats: StatsSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub capacity: usize,
    pub overrides: HashMap<String, usize>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    pub switch_settle_ms: u64,
    pub speak_settle_ms: u64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        let timing = PlaybackTiming::default();
        Self {
            switch_settle_ms: timing.switch_settle.as_millis() as u64,
            speak_settle_ms: timing.speak_settle.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    pub enabled: bool,
    pub key_prefix: String,
    /// `qualified` or `name`.
    pub clip_key: ClipKey,
    pub mailbox: usize,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "airhorn".to_string(),
            clip_key: ClipKey::default(),
            mailbox: 2048,
        }
    }
}

impl Settings {
    /// Reads settings and validates everything that would otherwise fail later.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("HORNBEAM")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("shards")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.shard_filter()?;
        settings.queue_policy()?;
        Ok(settings)
    }

    pub fn shard_filter(&self) -> Result<ShardFilter, ConfigError> {
        ShardFilter::parse(&self.shards)
    }

    pub fn queue_policy(&self) -> Result<QueuePolicy, ConfigError> {
        let mut policy = QueuePolicy::new(self.queue.capacity);
        for (id, capacity) in &self.queue.overrides {
            let guild_id = GuildId::new(id).map_err(|source| ConfigError::InvalidGuild {
                id: id.clone(),
                source,
            })?;
            policy = policy.with_override(guild_id, *capacity);
        }
        Ok(policy)
    }

    pub fn timing(&self) -> PlaybackTiming {
        PlaybackTiming {
            switch_settle: Duration::from_millis(self.playback.switch_settle_ms),
            speak_settle: Duration::from_millis(self.playback.speak_settle_ms),
        }
    }

    pub fn key_format(&self) -> KeyFormat {
        KeyFormat::new(self.stats.key_prefix.as_str()).with_clip_key(self.stats.clip_key)
    }
}

/// Splits guilds between processes by one digit of their id: the fifth
/// character from the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardFilter {
    digits: BTreeSet<char>,
}

impl ShardFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn parse<S: AsRef<str>>(shards: &[S]) -> Result<Self, ConfigError> {
        let mut digits = BTreeSet::new();
        for shard in shards {
            let shard = shard.as_ref().trim();
            let mut chars = shard.chars();
            match (chars.next(), chars.next()) {
                (Some(digit), None) if digit.is_ascii_digit() => {
                    digits.insert(digit);
                }
                _ => return Err(ConfigError::InvalidShard(shard.to_string())),
            }
        }
        Ok(Self { digits })
    }

    pub fn contains(&self, guild_id: &GuildId) -> bool {
        if self.digits.is_empty() {
            return true;
        }

        let id = guild_id.as_str().as_bytes();
        id.len() >= 5 && self.digits.contains(&char::from(id[id.len() - 5]))
    }

    pub fn digits(&self) -> impl Iterator<Item = char> + '_ {
        self.digits.iter().copied()
    }
}
