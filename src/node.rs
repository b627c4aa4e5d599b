use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::{
    actor::{self, ActorStatus},
    catalog::Catalog,
    config::{ConfigError, Settings, ShardFilter},
    controller::{Admission, ControllerError, ControllerHandle},
    entity::{GuildId, UserId},
    play::{self, BuildError},
    stats::{StatsHandle, StatsStore},
    voice::{VoiceStates, VoiceTransport},
};

#[derive(thiserror::Error, Debug)]
pub enum PlayError {
    #[error("guild {0} is served by another process")]
    OtherShard(GuildId),

    #[error("unknown collection {0:?}")]
    UnknownCollection(String),

    #[error("collection {collection} has no clip named {clip:?}")]
    UnknownClip { collection: String, clip: String },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

impl PlayError {
    fn outcome(&self) -> &'static str {
        match self {
            PlayError::OtherShard(_) => "other_shard",
            PlayError::UnknownCollection(_) | PlayError::UnknownClip { .. } => "unknown",
            PlayError::Build(BuildError::NoVoiceChannel { .. }) => "no_voice_channel",
            PlayError::Build(BuildError::NothingToPick(_)) => "empty",
            PlayError::Controller(_) => "unavailable",
        }
    }
}

/// Entry point for play requests coming from the chat side.
pub struct Dispatcher<V> {
    catalog: Arc<Catalog>,
    voice_states: Arc<V>,
    controller: ControllerHandle,
    shards: ShardFilter,
}

impl<V> Clone for Dispatcher<V> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
            voice_states: self.voice_states.clone(),
            controller: self.controller.clone(),
            shards: self.shards.clone(),
        }
    }
}

impl<V: VoiceStates> Dispatcher<V> {
    pub fn new(
        catalog: Arc<Catalog>,
        voice_states: Arc<V>,
        controller: ControllerHandle,
        shards: ShardFilter,
    ) -> Self {
        Self {
            catalog,
            voice_states,
            controller,
            shards,
        }
    }

    /// Plays a clip from `collection` for `user_id`, in whatever voice channel
    /// they are in. `clip` names a specific clip, otherwise one is picked by
    /// weight.
    #[tracing::instrument(skip(self, user_id, guild_id), fields(guild = %guild_id, user = %user_id))]
    pub async fn request_play(
        &self,
        user_id: &UserId,
        guild_id: &GuildId,
        collection: &str,
        clip: Option<&str>,
    ) -> Result<Admission, PlayError> {
        let result = self.admit(user_id, guild_id, collection, clip).await;
        let outcome = match &result {
            Ok(admission) => admission.as_str(),
            Err(err) => err.outcome(),
        };
        metrics::counter!("play_requests_total", "outcome" => outcome).increment(1);
        result
    }

    /// Fire-and-forget variant of [`Dispatcher::request_play`].
    pub fn submit(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        collection: impl Into<String>,
        clip: Option<String>,
    ) -> JoinHandle<Result<Admission, PlayError>> {
        let this = self.clone();
        let collection = collection.into();
        tokio::spawn(
            async move {
                this.request_play(&user_id, &guild_id, &collection, clip.as_deref())
                    .await
            }
            .in_current_span(),
        )
    }

    async fn admit(
        &self,
        user_id: &UserId,
        guild_id: &GuildId,
        collection: &str,
        clip: Option<&str>,
    ) -> Result<Admission, PlayError> {
        if !self.shards.contains(guild_id) {
            tracing::trace!("guild belongs to another shard, ignoring");
            return Err(PlayError::OtherShard(guild_id.clone()));
        }

        let collection_ref = self
            .catalog
            .get(collection)
            .ok_or_else(|| PlayError::UnknownCollection(collection.to_string()))?;

        let explicit = match clip {
            Some(name) => Some(collection_ref.clip(name).cloned().ok_or_else(|| {
                PlayError::UnknownClip {
                    collection: collection.to_string(),
                    clip: name.to_string(),
                }
            })?),
            None => None,
        };

        let request = {
            let mut rng = rand::rng();
            play::build_play(
                &self.catalog,
                self.voice_states.as_ref(),
                &mut rng,
                user_id,
                guild_id,
                collection_ref,
                explicit,
            )
            .inspect_err(|err| tracing::warn!(error = %err, "cannot build play"))?
        };

        let admission = self.controller.enqueue(request).await?;
        tracing::debug!(admission = admission.as_str(), collection, "play admitted");
        Ok(admission)
    }
}

/// The running dispatcher: controller and stats actors plus the handles to
/// reach them.
pub struct Node<V> {
    dispatcher: Dispatcher<V>,
    controller: ControllerHandle,
    tasks: JoinSet<ActorStatus>,
}

impl<V: VoiceStates> Node<V> {
    /// Starts the actors on the current runtime. `store` is ignored when stats
    /// are disabled in `settings`.
    pub fn spawn<T, S>(
        settings: &Settings,
        catalog: Arc<Catalog>,
        voice_states: Arc<V>,
        transport: T,
        store: Option<S>,
    ) -> Result<Self, ConfigError>
    where
        T: VoiceTransport,
        S: StatsStore,
    {
        let shards = settings.shard_filter()?;
        let policy = settings.queue_policy()?;
        let mut tasks = JoinSet::new();

        let stats = match store {
            Some(store) if settings.stats.enabled => {
                let (handle, actor) =
                    StatsHandle::new(store, settings.key_format(), settings.stats.mailbox);
                tasks.spawn(actor::run(actor));
                handle
            }
            _ => StatsHandle::disabled(),
        };

        let (controller, controller_actor) =
            ControllerHandle::new(transport, stats, settings.timing(), policy);
        tasks.spawn(actor::run(controller_actor));

        tracing::info!(
            collections = catalog.len(),
            shards = ?shards.digits().collect::<String>(),
            "node started"
        );

        let dispatcher = Dispatcher::new(catalog, voice_states, controller.clone(), shards);
        Ok(Self {
            dispatcher,
            controller,
            tasks,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher<V> {
        &self.dispatcher
    }

    pub fn controller(&self) -> &ControllerHandle {
        &self.controller
    }

    /// Resolves once the guild has no active session.
    pub async fn wait_until_idle(&self, guild_id: &GuildId) -> Result<(), ControllerError> {
        self.controller.wait_until_idle(guild_id).await
    }

    /// Stops accepting work and waits for the actors to finish. Sessions in
    /// flight play out first and pending stats are flushed. Dispatcher clones
    /// held elsewhere keep the controller alive.
    pub async fn shutdown(self) {
        let Self {
            dispatcher,
            controller,
            mut tasks,
        } = self;
        drop(dispatcher);
        drop(controller);

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(status) => tracing::debug!(%status, "actor stopped"),
                Err(err) => tracing::error!(error = %err, "actor task failed"),
            }
        }
        tracing::info!("node stopped");
    }
}
