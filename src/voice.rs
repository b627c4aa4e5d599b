//! Seams to the chat platform's voice side.
//!
//! The transport (connection setup, frame transmission, channel switching) and
//! the voice-state lookup are provided by the embedding application.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::entity::{ChannelId, GuildId, UserId};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("failed to join voice channel {channel} in guild {guild}: {reason}")]
    Join {
        guild: GuildId,
        channel: ChannelId,
        reason: String,
    },

    #[error("voice connection is closed")]
    Closed,

    #[error("transport error: {0}")]
    Other(String),
}

/// Opens voice connections, one per guild.
pub trait VoiceTransport: Clone + Send + Sync + 'static {
    type Connection: VoiceConnection;

    fn open(
        &self,
        guild_id: &GuildId,
        channel_id: &ChannelId,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// An open voice connection. Frames are pre-encoded Opus packets.
pub trait VoiceConnection: Send + Sync + 'static {
    fn channel_id(&self) -> &ChannelId;

    fn switch_channel(
        &mut self,
        channel_id: &ChannelId,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn set_speaking(
        &mut self,
        speaking: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Resolves once the transport accepted the frame, which is how playback
    /// is paced.
    fn send_frame(&mut self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Answers "which voice channel is this user in right now".
pub trait VoiceStates: Send + Sync + 'static {
    fn current_channel(&self, guild_id: &GuildId, user_id: &UserId) -> Option<ChannelId>;
}

/// Voice states kept up to date from gateway events.
#[derive(Default)]
pub struct VoiceStateCache {
    states: RwLock<HashMap<(GuildId, UserId), ChannelId>>,
}

impl VoiceStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, guild_id: GuildId, user_id: UserId, channel_id: ChannelId) {
        self.states.write().insert((guild_id, user_id), channel_id);
    }

    pub fn leave(&self, guild_id: &GuildId, user_id: &UserId) {
        self.states
            .write()
            .remove(&(guild_id.clone(), user_id.clone()));
    }
}

impl VoiceStates for VoiceStateCache {
    fn current_channel(&self, guild_id: &GuildId, user_id: &UserId) -> Option<ChannelId> {
        self.states
            .read()
            .get(&(guild_id.clone(), user_id.clone()))
            .cloned()
    }
}
