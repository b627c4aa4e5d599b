#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use hornbeam::{
    catalog::{Catalog, CatalogDefinition},
    config::Settings,
    entity::{ChannelId, GuildId, UserId},
    node::Node,
    sim::{LoggedEvent, LoopbackTransport, TransportEvent},
    stats::MemoryStatsStore,
    voice::VoiceStateCache,
};

pub const FRAMES_PER_CLIP: usize = 3;

/// `seq` has one clip per letter so play order is easy to read back. `intro`
/// chains into `seq`, `lead` into the zero-teardown `fast`.
pub const CATALOG: &str = r#"
[[collection]]
id = "seq"
clips = [
    { name = "a", weight = 1 },
    { name = "b", weight = 1 },
    { name = "c", weight = 1 },
    { name = "d", weight = 1 },
    { name = "e", weight = 1 },
    { name = "f", weight = 1 },
    { name = "g2", weight = 1 },
    { name = "h", weight = 1 },
    { name = "quick", weight = 1, teardown_ms = 0 },
]

[[collection]]
id = "intro"
chain_with = "seq"
clips = [{ name = "and", weight = 1 }]

[[collection]]
id = "lead"
chain_with = "fast"
clips = [{ name = "in", weight = 1 }]

[[collection]]
id = "fast"
clips = [{ name = "out", weight = 1, teardown_ms = 0 }]
"#;

/// Every clip gets frames `<key>#0`, `<key>#1`, ...
pub fn catalog() -> Catalog {
    let definition = CatalogDefinition::from_toml(CATALOG).unwrap();
    Catalog::build(definition, |clip| {
        (0..FRAMES_PER_CLIP)
            .map(|i| Bytes::from(format!("{}#{i}", clip.key())))
            .collect()
    })
    .unwrap()
}

pub struct Harness {
    pub node: Node<VoiceStateCache>,
    pub transport: LoopbackTransport,
    pub states: Arc<VoiceStateCache>,
    pub store: MemoryStatsStore,
    pub guild: GuildId,
    pub user: UserId,
    pub channel: ChannelId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(LoopbackTransport::new(), catalog())
    }

    pub fn with(transport: LoopbackTransport, catalog: Catalog) -> Self {
        let guild = GuildId::new("81384788765712384").unwrap();
        let user = UserId::new("104").unwrap();
        let channel = ChannelId::new("c1").unwrap();

        let states = Arc::new(VoiceStateCache::new());
        states.join(guild.clone(), user.clone(), channel.clone());

        let store = MemoryStatsStore::new();
        let node = Node::spawn(
            &Settings::default(),
            Arc::new(catalog),
            states.clone(),
            transport.clone(),
            Some(store.clone()),
        )
        .unwrap();

        Self {
            node,
            transport,
            states,
            store,
            guild,
            user,
            channel,
        }
    }

    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(600), self.node.wait_until_idle(&self.guild))
            .await
            .expect("guild never went idle")
            .unwrap();
    }

    pub fn events(&self) -> Vec<LoggedEvent> {
        self.transport.events_for(&self.guild)
    }
}

/// Clip keys in the order they were played, read from the frames sent
/// between speaking updates.
pub fn played(events: &[LoggedEvent]) -> Vec<String> {
    let mut played = Vec::new();
    let mut in_clip = false;
    for logged in events {
        match &logged.event {
            TransportEvent::Speaking { speaking: true, .. } => in_clip = true,
            TransportEvent::Frame { frame, .. } if in_clip => {
                let text = std::str::from_utf8(frame).unwrap();
                let (key, _) = text.split_once('#').unwrap();
                played.push(key.to_string());
                in_clip = false;
            }
            _ => {}
        }
    }
    played
}

/// Payloads of every frame the transport accepted.
pub fn frames(events: &[LoggedEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|logged| match &logged.event {
            TransportEvent::Frame { frame, .. } => {
                Some(String::from_utf8_lossy(frame).into_owned())
            }
            _ => None,
        })
        .collect()
}

pub fn count(events: &[LoggedEvent], pred: impl Fn(&TransportEvent) -> bool) -> usize {
    events.iter().filter(|logged| pred(&logged.event)).count()
}

/// Opens and disconnects strictly alternate, starting with an open.
pub fn assert_connections_alternate(events: &[LoggedEvent]) {
    let mut open = false;
    for logged in events {
        match &logged.event {
            TransportEvent::Open { .. } => {
                assert!(!open, "second connection opened while one was live");
                open = true;
            }
            TransportEvent::Disconnect { .. } => {
                assert!(open, "disconnect without an open connection");
                open = false;
            }
            other => assert!(open, "{other:?} sent without a connection"),
        }
    }
}
