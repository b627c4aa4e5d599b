//! In-process voice transport that records every call it receives.
//!
//! Used by the operator binary to dry-run a catalog and by tests to observe
//! what a guild worker actually did, and when.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{self, Instant};

use crate::{
    entity::{ChannelId, GuildId},
    voice::{TransportError, VoiceConnection, VoiceTransport},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open { guild: GuildId, channel: ChannelId },
    Switch { guild: GuildId, channel: ChannelId },
    Speaking { guild: GuildId, speaking: bool },
    Frame { guild: GuildId, frame: Bytes },
    Disconnect { guild: GuildId },
}

impl TransportEvent {
    pub fn guild(&self) -> &GuildId {
        match self {
            TransportEvent::Open { guild, .. }
            | TransportEvent::Switch { guild, .. }
            | TransportEvent::Speaking { guild, .. }
            | TransportEvent::Frame { guild, .. }
            | TransportEvent::Disconnect { guild } => guild,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub at: Instant,
    pub event: TransportEvent,
}

/// What a connection does when asked to send a particular frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameFault {
    Fail,
    Panic,
}

#[derive(Default)]
struct LoopbackState {
    log: Vec<LoggedEvent>,
    open: HashMap<GuildId, usize>,
    max_open: HashMap<GuildId, usize>,
    failing: HashSet<GuildId>,
    frame_faults: HashMap<(GuildId, Bytes), FrameFault>,
}

impl LoopbackState {
    fn push(&mut self, event: TransportEvent) {
        self.log.push(LoggedEvent {
            at: Instant::now(),
            event,
        });
    }
}

#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
    frame_interval: Duration,
    open_latency: Duration,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paces frames like a real connection would, one per `interval`.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Delays every `open`, whether it succeeds or not.
    pub fn with_open_latency(mut self, latency: Duration) -> Self {
        self.open_latency = latency;
        self
    }

    /// Makes every later `open` for this guild fail.
    pub fn fail_opens(&self, guild_id: GuildId) {
        self.state.lock().failing.insert(guild_id);
    }

    /// Sending `frame` in this guild returns an error and logs nothing.
    pub fn fail_frame(&self, guild_id: GuildId, frame: impl Into<Bytes>) {
        self.set_frame_fault(guild_id, frame.into(), FrameFault::Fail);
    }

    /// Sending `frame` in this guild panics the sending task.
    pub fn panic_on_frame(&self, guild_id: GuildId, frame: impl Into<Bytes>) {
        self.set_frame_fault(guild_id, frame.into(), FrameFault::Panic);
    }

    fn set_frame_fault(&self, guild_id: GuildId, frame: Bytes, fault: FrameFault) {
        self.state.lock().frame_faults.insert((guild_id, frame), fault);
    }

    pub fn events(&self) -> Vec<LoggedEvent> {
        self.state.lock().log.clone()
    }

    pub fn events_for(&self, guild_id: &GuildId) -> Vec<LoggedEvent> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|logged| logged.event.guild() == guild_id)
            .cloned()
            .collect()
    }

    /// Highest number of connections that were open at once for the guild.
    pub fn max_concurrent(&self, guild_id: &GuildId) -> usize {
        self.state
            .lock()
            .max_open
            .get(guild_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn open_connections(&self, guild_id: &GuildId) -> usize {
        self.state.lock().open.get(guild_id).copied().unwrap_or(0)
    }
}

impl VoiceTransport for LoopbackTransport {
    type Connection = LoopbackConnection;

    async fn open(
        &self,
        guild_id: &GuildId,
        channel_id: &ChannelId,
    ) -> Result<LoopbackConnection, TransportError> {
        if !self.open_latency.is_zero() {
            time::sleep(self.open_latency).await;
        }

        let mut state = self.state.lock();
        if state.failing.contains(guild_id) {
            return Err(TransportError::Join {
                guild: guild_id.clone(),
                channel: channel_id.clone(),
                reason: "rejected by loopback".to_string(),
            });
        }

        let open = state.open.entry(guild_id.clone()).or_default();
        *open += 1;
        let open = *open;
        let max = state.max_open.entry(guild_id.clone()).or_default();
        *max = (*max).max(open);
        state.push(TransportEvent::Open {
            guild: guild_id.clone(),
            channel: channel_id.clone(),
        });
        drop(state);

        Ok(LoopbackConnection {
            guild_id: guild_id.clone(),
            channel_id: channel_id.clone(),
            state: self.state.clone(),
            frame_interval: self.frame_interval,
        })
    }
}

pub struct LoopbackConnection {
    guild_id: GuildId,
    channel_id: ChannelId,
    state: Arc<Mutex<LoopbackState>>,
    frame_interval: Duration,
}

impl VoiceConnection for LoopbackConnection {
    fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    async fn switch_channel(&mut self, channel_id: &ChannelId) -> Result<(), TransportError> {
        self.channel_id = channel_id.clone();
        self.state.lock().push(TransportEvent::Switch {
            guild: self.guild_id.clone(),
            channel: channel_id.clone(),
        });
        Ok(())
    }

    async fn set_speaking(&mut self, speaking: bool) -> Result<(), TransportError> {
        self.state.lock().push(TransportEvent::Speaking {
            guild: self.guild_id.clone(),
            speaking,
        });
        Ok(())
    }

    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if !self.frame_interval.is_zero() {
            time::sleep(self.frame_interval).await;
        }

        let mut state = self.state.lock();
        let fault = state
            .frame_faults
            .get(&(self.guild_id.clone(), frame.clone()))
            .copied();
        match fault {
            Some(FrameFault::Fail) => {
                Err(TransportError::Other("frame rejected by loopback".into()))
            }
            Some(FrameFault::Panic) => {
                drop(state);
                panic!("loopback connection for guild {} crashed", self.guild_id);
            }
            None => {
                state.push(TransportEvent::Frame {
                    guild: self.guild_id.clone(),
                    frame,
                });
                Ok(())
            }
        }
    }

    async fn disconnect(self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(open) = state.open.get_mut(&self.guild_id) {
            *open = open.saturating_sub(1);
        }
        state.push(TransportEvent::Disconnect {
            guild: self.guild_id.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_loopback_records_calls_in_order() {
        let transport = LoopbackTransport::new().with_frame_interval(Duration::from_millis(20));
        let guild = GuildId::new("g").unwrap();
        let c1 = ChannelId::new("c1").unwrap();
        let c2 = ChannelId::new("c2").unwrap();

        let start = Instant::now();
        let mut conn = transport.open(&guild, &c1).await.unwrap();
        assert_eq!(transport.open_connections(&guild), 1);
        conn.switch_channel(&c2).await.unwrap();
        assert_eq!(conn.channel_id(), &c2);
        conn.set_speaking(true).await.unwrap();
        conn.send_frame(Bytes::from_static(b"f0")).await.unwrap();
        conn.disconnect().await.unwrap();

        let events: Vec<_> = transport.events().into_iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![
                TransportEvent::Open {
                    guild: guild.clone(),
                    channel: c1
                },
                TransportEvent::Switch {
                    guild: guild.clone(),
                    channel: c2
                },
                TransportEvent::Speaking {
                    guild: guild.clone(),
                    speaking: true
                },
                TransportEvent::Frame {
                    guild: guild.clone(),
                    frame: Bytes::from_static(b"f0")
                },
                TransportEvent::Disconnect {
                    guild: guild.clone()
                },
            ]
        );
        assert_eq!(transport.open_connections(&guild), 0);
        assert_eq!(transport.max_concurrent(&guild), 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_faults_only_hit_the_named_frame() {
        let transport = LoopbackTransport::new();
        let guild = GuildId::new("g").unwrap();
        transport.fail_frame(guild.clone(), Bytes::from_static(b"bad"));
        transport.panic_on_frame(guild.clone(), Bytes::from_static(b"boom"));

        let mut conn = transport.open(&guild, &ChannelId::new("c").unwrap()).await.unwrap();
        conn.send_frame(Bytes::from_static(b"ok")).await.unwrap();
        assert!(matches!(
            conn.send_frame(Bytes::from_static(b"bad")).await,
            Err(TransportError::Other(_))
        ));
        let frames = transport
            .events_for(&guild)
            .into_iter()
            .filter(|e| matches!(e.event, TransportEvent::Frame { .. }))
            .count();
        assert_eq!(frames, 1);

        let crashed = tokio::spawn(async move {
            conn.send_frame(Bytes::from_static(b"boom")).await
        })
        .await;
        assert!(crashed.is_err_and(|err| err.is_panic()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_latency_applies_to_failures_too() {
        let transport = LoopbackTransport::new().with_open_latency(Duration::from_millis(500));
        let guild = GuildId::new("g").unwrap();
        transport.fail_opens(guild.clone());

        let start = Instant::now();
        let result = transport.open(&guild, &ChannelId::new("c").unwrap()).await;
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_failing_guild_rejects_open() {
        let transport = LoopbackTransport::new();
        let guild = GuildId::new("g").unwrap();
        transport.fail_opens(guild.clone());
        let result = transport.open(&guild, &ChannelId::new("c").unwrap()).await;
        assert!(matches!(result, Err(TransportError::Join { .. })));
        assert!(transport.events_for(&guild).is_empty());
    }
}
