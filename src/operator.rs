//! Owner-only control commands: play totals and shard coverage.

use std::fmt;

use crate::{
    config::{ConfigError, Settings, ShardFilter},
    entity::{GuildId, UserId},
    stats::{KeyFormat, StatsQuery},
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum OperatorError {
    #[error("user {0} may not issue operator commands")]
    NotOwner(UserId),

    #[error("guild {0} is served by another process")]
    OtherShard(GuildId),

    #[error("no stats store is configured")]
    NoStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Every play requested by a user, ambient and forced.
    UserPlays(UserId),
    /// Every play in a guild.
    GuildPlays(GuildId),
    /// How many of the `known` guilds this process serves.
    Shards { known: Vec<GuildId> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Plays(u64),
    Shards { digits: String, served: usize },
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Plays(total) => write!(f, "total plays: {total}"),
            Reply::Shards { digits, served } if digits.is_empty() => {
                write!(f, "unsharded, serving {served} guilds")
            }
            Reply::Shards { digits, served } => {
                write!(f, "shards {digits} serve {served} guilds")
            }
        }
    }
}

pub struct Operator<Q> {
    owner: Option<UserId>,
    shards: ShardFilter,
    keys: KeyFormat,
    stats: Option<Q>,
}

impl<Q: StatsQuery> Operator<Q> {
    pub fn new(settings: &Settings, stats: Option<Q>) -> Result<Self, ConfigError> {
        Ok(Self {
            owner: settings.owner.clone(),
            shards: settings.shard_filter()?,
            keys: settings.key_format(),
            stats,
        })
    }

    /// Runs `command`, issued by `requester` from `origin`. Stats commands
    /// are answered only by the process serving `origin`; the shard count is
    /// answered by every process.
    #[tracing::instrument(
        skip(self, requester, origin, command),
        fields(requester = %requester, origin = %origin)
    )]
    pub fn handle(
        &self,
        requester: &UserId,
        origin: &GuildId,
        command: Command,
    ) -> Result<Reply, OperatorError> {
        if self.owner.as_ref() != Some(requester) {
            tracing::debug!("ignoring operator command from a non-owner");
            return Err(OperatorError::NotOwner(requester.clone()));
        }

        let prefixes = match command {
            Command::Shards { known } => {
                let digits: Vec<String> = self.shards.digits().map(String::from).collect();
                let served = known.iter().filter(|g| self.shards.contains(g)).count();
                return Ok(Reply::Shards {
                    digits: digits.join(","),
                    served,
                });
            }
            _ if !self.shards.contains(origin) => {
                return Err(OperatorError::OtherShard(origin.clone()));
            }
            Command::UserPlays(user_id) => self.keys.user_counters(&user_id),
            Command::GuildPlays(guild_id) => self.keys.guild_counters(&guild_id),
        };

        let stats = self.stats.as_ref().ok_or(OperatorError::NoStats)?;
        Ok(Reply::Plays(stats.sum_counters(&prefixes)))
    }
}
