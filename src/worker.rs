use std::{sync::Arc, time::Duration};

use tokio::time;

use crate::{
    actor::{Actor, ActorError},
    catalog::Clip,
    controller::ControllerHandle,
    entity::GuildId,
    play::PlayRequest,
    stats::{PlayRecord, StatsHandle},
    voice::{VoiceConnection, VoiceTransport},
};

/// Pauses around voice state changes. Sending audio too early after a channel
/// switch or a speaking update corrupts the start of the clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackTiming {
    pub switch_settle: Duration,
    pub speak_settle: Duration,
}

impl Default for PlaybackTiming {
    fn default() -> Self {
        Self {
            switch_settle: Duration::from_millis(125),
            speak_settle: Duration::from_millis(32),
        }
    }
}

/// Plays everything queued for one guild over a single voice connection,
/// then lets the connection linger for the last clip's teardown delay and
/// hands the guild back to the registry.
pub struct GuildWorker<T: VoiceTransport> {
    guild_id: GuildId,
    session: u64,
    first: Option<PlayRequest>,
    transport: T,
    connection: Option<T::Connection>,
    controller: ControllerHandle,
    stats: StatsHandle,
    timing: PlaybackTiming,
}

impl<T: VoiceTransport> Actor for GuildWorker<T> {
    type ID = GuildId;

    fn kind(&self) -> &'static str {
        "guild_worker"
    }

    fn id(&self) -> Self::ID {
        self.guild_id.clone()
    }

    async fn run(&mut self) -> Result<(), ActorError> {
        let mut current = self.first.take();
        while let Some(request) = current {
            let last_clip = self.play_request(request).await?;
            current = match self.controller.next(&self.guild_id, self.session).await? {
                Some(next) => Some(next),
                None => self.wind_down(&last_clip).await?,
            };
        }
        Ok(())
    }

    async fn post_stop(&mut self) {
        // Only reached with a live connection when `run` bailed out early.
        if let Some(connection) = self.connection.take() {
            if let Err(err) = connection.disconnect().await {
                tracing::warn!(error = %err, "failed to disconnect after an aborted session");
            }
        }
    }
}

impl<T: VoiceTransport> GuildWorker<T> {
    pub fn new(
        guild_id: GuildId,
        session: u64,
        first: PlayRequest,
        transport: T,
        controller: ControllerHandle,
        stats: StatsHandle,
        timing: PlaybackTiming,
    ) -> Self {
        Self {
            guild_id,
            session,
            first: Some(first),
            transport,
            connection: None,
            controller,
            stats,
            timing,
        }
    }

    /// Plays a request and its chained follow-up. Returns the clip played last.
    async fn play_request(&mut self, mut request: PlayRequest) -> Result<Arc<Clip>, ActorError> {
        if self.connection.is_none() {
            let connection = self
                .transport
                .open(&self.guild_id, &request.channel_id)
                .await
                .inspect_err(|err| {
                    tracing::error!(
                        channel = %request.channel_id,
                        error = %err,
                        "failed to open voice connection, aborting session"
                    );
                })?;
            self.connection = Some(connection);
        }

        let chained = request.next.take();
        self.play_clip(&request).await;
        let mut last = request.clip;

        if let Some(chained) = chained {
            self.play_clip(&chained).await;
            last = chained.clip;
        }

        Ok(last)
    }

    async fn play_clip(&mut self, play: &PlayRequest) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        tracing::info!(
            channel = %play.channel_id,
            user = %play.user_id,
            clip = %play.clip.key(),
            forced = play.forced,
            "playing clip"
        );

        if connection.channel_id() != &play.channel_id {
            if let Err(err) = connection.switch_channel(&play.channel_id).await {
                tracing::warn!(channel = %play.channel_id, error = %err, "failed to switch channel");
            }
            time::sleep(self.timing.switch_settle).await;
        }

        if let Err(err) = connection.set_speaking(true).await {
            tracing::warn!(error = %err, "failed to start speaking");
        }
        time::sleep(self.timing.speak_settle).await;

        for (index, frame) in play.clip.frames.iter().enumerate() {
            if let Err(err) = connection.send_frame(frame.clone()).await {
                tracing::warn!(
                    clip = %play.clip.key(),
                    frame = index,
                    error = %err,
                    "failed to send frame, skipping rest of clip"
                );
                break;
            }
        }

        if let Err(err) = connection.set_speaking(false).await {
            tracing::warn!(error = %err, "failed to stop speaking");
        }

        metrics::counter!("clips_played_total").increment(1);
        self.stats.record(PlayRecord::from(play));
    }

    /// Keeps the connection open for the clip's teardown delay, then closes
    /// it and asks the registry to retire the guild. Returns work that
    /// showed up in the meantime.
    async fn wind_down(&mut self, last_clip: &Clip) -> Result<Option<PlayRequest>, ActorError> {
        time::sleep(last_clip.teardown).await;
        if let Some(next) = self.controller.next(&self.guild_id, self.session).await? {
            return Ok(Some(next));
        }

        if let Some(connection) = self.connection.take() {
            if let Err(err) = connection.disconnect().await {
                tracing::warn!(error = %err, "failed to disconnect");
            }
        }

        let next = self.controller.retire(&self.guild_id, self.session).await?;
        if next.is_some() {
            tracing::debug!("play arrived while disconnecting, reconnecting");
        }
        Ok(next)
    }
}
