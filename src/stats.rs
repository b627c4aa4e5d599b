//! Best-effort usage statistics.
//!
//! Workers hand a [`PlayRecord`] to a [`StatsHandle`] without waiting. A single
//! [`StatsActor`] drains the mailbox and writes everything it picked up as one
//! batch to a [`StatsStore`]. Nothing here can slow down or fail playback.

use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    actor::{Actor, ActorError},
    entity::{ChannelId, GuildId, UserId},
    play::PlayRequest,
};

const BATCH_SIZE: usize = 256;

/// Ambient and forced plays, in key order.
const MODES: [&str; 2] = ["a", "f"];

#[derive(thiserror::Error, Debug)]
pub enum StatsError {
    #[error("stats store is unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct PlayRecord {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub collection: Arc<str>,
    pub clip: String,
    pub forced: bool,
}

impl From<&PlayRequest> for PlayRecord {
    fn from(play: &PlayRequest) -> Self {
        Self {
            guild_id: play.guild_id.clone(),
            channel_id: play.channel_id.clone(),
            user_id: play.user_id.clone(),
            collection: play.clip.collection.clone(),
            clip: play.clip.name.clone(),
            forced: play.forced,
        }
    }
}

/// How a clip is named inside stat keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipKey {
    /// `<collection>_<clip>`, unique across the catalog.
    #[default]
    Qualified,
    /// The bare clip name. Clips sharing a name across collections share
    /// counters.
    Name,
}

/// Layout of the keys a play is counted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFormat {
    prefix: Arc<str>,
    clip: ClipKey,
}

impl KeyFormat {
    pub fn new(prefix: impl Into<Arc<str>>) -> Self {
        Self {
            prefix: prefix.into(),
            clip: ClipKey::default(),
        }
    }

    pub fn with_clip_key(mut self, clip: ClipKey) -> Self {
        self.clip = clip;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn clip_name<'a>(&self, play: &'a PlayRecord) -> Cow<'a, str> {
        match self.clip {
            ClipKey::Qualified => Cow::Owned(format!("{}_{}", play.collection, play.clip)),
            ClipKey::Name => Cow::Borrowed(play.clip.as_str()),
        }
    }

    /// Prefixes of the per-clip counters of one user, in both modes.
    pub fn user_counters(&self, user_id: &UserId) -> Vec<String> {
        MODES
            .iter()
            .map(|mode| format!("{}:{mode}:user:{user_id}:sound:", self.prefix))
            .collect()
    }

    /// Prefixes of the per-clip counters of one guild, in both modes.
    pub fn guild_counters(&self, guild_id: &GuildId) -> Vec<String> {
        MODES
            .iter()
            .map(|mode| format!("{}:{mode}:guild:{guild_id}:sound:", self.prefix))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsOp {
    Increment(String),
    AddToSet(String, String),
}

#[derive(Debug, Default)]
pub struct StatsBatch {
    ops: Vec<StatsOp>,
}

impl StatsBatch {
    /// Expands one play into its counter and set updates.
    pub fn push_play(&mut self, keys: &KeyFormat, play: &PlayRecord) {
        let prefix = keys.prefix();
        let mode = MODES[usize::from(play.forced)];
        let base = format!("{prefix}:{mode}");
        let clip = keys.clip_name(play);
        let (guild, channel, user) = (
            play.guild_id.as_str(),
            play.channel_id.as_str(),
            play.user_id.as_str(),
        );

        self.ops.extend([
            StatsOp::Increment(format!("{prefix}:total")),
            StatsOp::Increment(format!("{base}:total")),
            StatsOp::Increment(format!("{base}:sound:{clip}")),
            StatsOp::Increment(format!("{base}:user:{user}:sound:{clip}")),
            StatsOp::Increment(format!("{base}:guild:{guild}:sound:{clip}")),
            StatsOp::Increment(format!("{base}:guild:{guild}:chan:{channel}:sound:{clip}")),
            StatsOp::AddToSet(format!("{base}:users"), user.to_string()),
            StatsOp::AddToSet(format!("{base}:guilds"), guild.to_string()),
            StatsOp::AddToSet(format!("{base}:channels"), channel.to_string()),
        ]);
    }

    pub fn ops(&self) -> &[StatsOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A backing store for counters and sets. A batch is applied as one write.
pub trait StatsStore: Send + 'static {
    fn apply(&mut self, batch: &StatsBatch) -> impl Future<Output = Result<(), StatsError>> + Send;
}

/// Read access to stored counters, for operator totals.
pub trait StatsQuery: Send + Sync + 'static {
    /// Sum of every counter whose key starts with one of `prefixes`.
    fn sum_counters(&self, prefixes: &[String]) -> u64;
}

#[derive(Default, Debug)]
struct MemoryStats {
    counters: HashMap<String, u64>,
    sets: HashMap<String, HashSet<String>>,
}

/// In-process store. Clones share the same counters.
#[derive(Clone, Default, Debug)]
pub struct MemoryStatsStore {
    inner: Arc<Mutex<MemoryStats>>,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.inner.lock().counters.get(key).copied().unwrap_or(0)
    }

    pub fn set_len(&self, key: &str) -> usize {
        self.inner.lock().sets.get(key).map_or(0, HashSet::len)
    }

    pub fn contains(&self, key: &str, member: &str) -> bool {
        self.inner
            .lock()
            .sets
            .get(key)
            .is_some_and(|set| set.contains(member))
    }

    /// All counters, sorted by key.
    pub fn counters(&self) -> Vec<(String, u64)> {
        let mut counters: Vec<_> = self
            .inner
            .lock()
            .counters
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        counters.sort();
        counters
    }
}

impl StatsQuery for MemoryStatsStore {
    fn sum_counters(&self, prefixes: &[String]) -> u64 {
        self.inner
            .lock()
            .counters
            .iter()
            .filter(|(key, _)| prefixes.iter().any(|prefix| key.starts_with(prefix.as_str())))
            .map(|(_, count)| *count)
            .sum()
    }
}

impl StatsStore for MemoryStatsStore {
    async fn apply(&mut self, batch: &StatsBatch) -> Result<(), StatsError> {
        let mut stats = self.inner.lock();
        for op in batch.ops() {
            match op {
                StatsOp::Increment(key) => *stats.counters.entry(key.clone()).or_default() += 1,
                StatsOp::AddToSet(key, member) => {
                    stats
                        .sets
                        .entry(key.clone())
                        .or_default()
                        .insert(member.clone());
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct StatsHandle {
    sender: Option<mpsc::Sender<PlayRecord>>,
}

impl StatsHandle {
    pub fn new<S: StatsStore>(store: S, keys: KeyFormat, mailbox: usize) -> (Self, StatsActor<S>) {
        let (sender, receiver) = mpsc::channel(mailbox.max(1));
        let handle = Self {
            sender: Some(sender),
        };
        let actor = StatsActor {
            store,
            receiver,
            keys,
        };
        (handle, actor)
    }

    /// A handle that records nothing, for deployments without a store.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn record(&self, play: PlayRecord) {
        let Some(sender) = &self.sender else {
            return;
        };

        match sender.try_send(play) {
            Ok(()) => {}
            Err(TrySendError::Full(play)) => {
                metrics::counter!("stats_records_dropped_total", "reason" => "full").increment(1);
                tracing::warn!(
                    guild = %play.guild_id,
                    collection = %play.collection,
                    clip = %play.clip,
                    "stats mailbox is full, dropping record"
                );
            }
            Err(TrySendError::Closed(_)) => {
                metrics::counter!("stats_records_dropped_total", "reason" => "closed").increment(1);
                tracing::debug!("stats recorder is gone, dropping record");
            }
        }
    }
}

pub struct StatsActor<S> {
    store: S,
    receiver: mpsc::Receiver<PlayRecord>,
    keys: KeyFormat,
}

impl<S: StatsStore> Actor for StatsActor<S> {
    type ID = &'static str;

    fn kind(&self) -> &'static str {
        "stats"
    }

    fn id(&self) -> Self::ID {
        "recorder"
    }

    async fn run(&mut self) -> Result<(), ActorError> {
        let mut buf = Vec::with_capacity(BATCH_SIZE);
        loop {
            let size = self.receiver.recv_many(&mut buf, BATCH_SIZE).await;
            if size == 0 {
                break;
            }

            let mut batch = StatsBatch::default();
            for play in buf.drain(..) {
                batch.push_play(&self.keys, &play);
            }

            if let Err(err) = self.store.apply(&batch).await {
                tracing::warn!(
                    error = %err,
                    plays = size,
                    "failed to write stats, discarding batch"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor;

    fn record(user: &str, forced: bool) -> PlayRecord {
        PlayRecord {
            guild_id: GuildId::new("g1").unwrap(),
            channel_id: ChannelId::new("c1").unwrap(),
            user_id: UserId::new(user).unwrap(),
            collection: Arc::from("airhorn"),
            clip: "default".to_string(),
            forced,
        }
    }

    #[test]
    fn test_play_expands_to_counter_families() {
        let mut batch = StatsBatch::default();
        batch.push_play(&KeyFormat::new("airhorn"), &record("u1", true));
        let ops = batch.ops();
        assert_eq!(ops.len(), 9);
        assert_eq!(ops[0], StatsOp::Increment("airhorn:total".into()));
        assert_eq!(ops[1], StatsOp::Increment("airhorn:f:total".into()));
        assert_eq!(
            ops[5],
            StatsOp::Increment("airhorn:f:guild:g1:chan:c1:sound:airhorn_default".into())
        );
        assert_eq!(
            ops[6],
            StatsOp::AddToSet("airhorn:f:users".into(), "u1".into())
        );
    }

    #[tokio::test]
    async fn test_actor_batches_into_store() {
        let store = MemoryStatsStore::new();
        let (handle, actor) = StatsHandle::new(store.clone(), KeyFormat::new("airhorn"), 16);

        handle.record(record("u1", false));
        handle.record(record("u2", false));
        handle.record(record("u1", true));
        drop(handle);
        actor::run(actor).await;

        assert_eq!(store.counter("airhorn:total"), 3);
        assert_eq!(store.counter("airhorn:a:total"), 2);
        assert_eq!(store.counter("airhorn:f:total"), 1);
        assert_eq!(store.counter("airhorn:a:user:u1:sound:airhorn_default"), 1);
        assert_eq!(store.set_len("airhorn:a:users"), 2);
        assert!(store.contains("airhorn:f:users", "u1"));
    }

    #[test]
    fn test_bare_clip_names_share_counters_across_collections() {
        let keys = KeyFormat::new("airhorn").with_clip_key(ClipKey::Name);
        let mut other = record("u1", false);
        other.collection = Arc::from("classic");

        let mut batch = StatsBatch::default();
        batch.push_play(&keys, &record("u1", false));
        batch.push_play(&keys, &other);
        let sound = StatsOp::Increment("airhorn:a:sound:default".into());
        assert_eq!(batch.ops().iter().filter(|op| **op == sound).count(), 2);
        assert!(
            batch
                .ops()
                .contains(&StatsOp::Increment("airhorn:a:user:u1:sound:default".into()))
        );
    }

    #[tokio::test]
    async fn test_totals_sum_both_modes_for_one_user_or_guild() {
        let store = MemoryStatsStore::new();
        let keys = KeyFormat::new("airhorn");
        let mut batch = StatsBatch::default();
        batch.push_play(&keys, &record("1", false));
        batch.push_play(&keys, &record("1", true));
        batch.push_play(&keys, &record("10", false));
        let mut elsewhere = record("1", false);
        elsewhere.guild_id = GuildId::new("g2").unwrap();
        batch.push_play(&keys, &elsewhere);
        store.clone().apply(&batch).await.unwrap();

        let user = UserId::new("1").unwrap();
        assert_eq!(store.sum_counters(&keys.user_counters(&user)), 3);
        let guild = GuildId::new("g1").unwrap();
        assert_eq!(store.sum_counters(&keys.guild_counters(&guild)), 3);
        let other_prefix = KeyFormat::new("other");
        assert_eq!(store.sum_counters(&other_prefix.user_counters(&user)), 0);
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_without_blocking() {
        let store = MemoryStatsStore::new();
        let (handle, actor) = StatsHandle::new(store.clone(), KeyFormat::new("airhorn"), 1);

        for _ in 0..5 {
            handle.record(record("u1", false));
        }
        drop(handle);
        actor::run(actor).await;

        assert_eq!(store.counter("airhorn:total"), 1);
    }

    struct Broken;

    impl StatsStore for Broken {
        async fn apply(&mut self, _batch: &StatsBatch) -> Result<(), StatsError> {
            Err(StatsError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failures_are_contained() {
        let (handle, actor) = StatsHandle::new(Broken, KeyFormat::new("airhorn"), 4);
        handle.record(record("u1", false));
        drop(handle);
        assert_eq!(actor::run(actor).await, actor::ActorStatus::ShutDown);
    }

    #[test]
    fn test_disabled_handle_is_a_no_op() {
        StatsHandle::disabled().record(record("u1", false));
    }
}
