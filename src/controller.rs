use std::collections::{HashMap, HashSet, VecDeque};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{self, JoinError, JoinSet},
};
use tracing::Instrument;

use crate::{
    actor::{self, Actor, ActorError},
    entity::GuildId,
    play::PlayRequest,
    stats::StatsHandle,
    voice::VoiceTransport,
    worker::{GuildWorker, PlaybackTiming},
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 6;

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("controller is not running, please try again later.")]
    ServiceUnavailable,
}

/// What happened to a request handed to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The guild was idle; a worker was started and plays this request first.
    Started,
    /// Waiting behind `position - 1` other requests.
    Queued { position: usize },
    /// The guild's queue was full.
    Dropped,
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Started => "started",
            Admission::Queued { .. } => "queued",
            Admission::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePolicy {
    default_capacity: usize,
    overrides: HashMap<GuildId, usize>,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl QueuePolicy {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            default_capacity,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, guild_id: GuildId, capacity: usize) -> Self {
        self.overrides.insert(guild_id, capacity);
        self
    }

    pub fn capacity_for(&self, guild_id: &GuildId) -> usize {
        self.overrides
            .get(guild_id)
            .copied()
            .unwrap_or(self.default_capacity)
    }
}

#[derive(Debug)]
struct GuildQueue {
    session: u64,
    capacity: usize,
    pending: VecDeque<PlayRequest>,
}

impl GuildQueue {
    fn new(session: u64, capacity: usize) -> Self {
        Self {
            session,
            capacity,
            pending: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, request: PlayRequest) -> Result<usize, PlayRequest> {
        if self.pending.len() >= self.capacity {
            return Err(request);
        }
        self.pending.push_back(request);
        Ok(self.pending.len())
    }

    fn pop(&mut self) -> Option<PlayRequest> {
        self.pending.pop_front()
    }
}

#[derive(Debug)]
pub enum ControllerMessage {
    Enqueue(PlayRequest, oneshot::Sender<Admission>),
    Next {
        guild_id: GuildId,
        session: u64,
        reply: oneshot::Sender<Option<PlayRequest>>,
    },
    Retire {
        guild_id: GuildId,
        session: u64,
        reply: oneshot::Sender<Option<PlayRequest>>,
    },
}

/// Owns the guild registry.
///
/// A guild is active exactly while it has an entry here, and every entry has
/// exactly one worker. All reads and writes of the registry happen on this
/// actor's task, so "create or push" and "pop or remove" are atomic per guild.
pub struct ControllerActor<T: VoiceTransport> {
    receiver: mpsc::Receiver<ControllerMessage>,
    // Weak so the actor can stop once every handle and worker is gone.
    sender: mpsc::WeakSender<ControllerMessage>,
    transport: T,
    stats: StatsHandle,
    timing: PlaybackTiming,
    policy: QueuePolicy,

    guilds: HashMap<GuildId, GuildQueue>,
    // Republished after every insert and remove of `guilds`.
    active: watch::Sender<HashSet<GuildId>>,
    worker_tasks: JoinSet<()>,
    worker_sessions: HashMap<task::Id, (GuildId, u64)>,
    next_session: u64,
}

impl<T: VoiceTransport> Actor for ControllerActor<T> {
    type ID = &'static str;

    fn kind(&self) -> &'static str {
        "controller"
    }

    fn id(&self) -> Self::ID {
        "registry"
    }

    async fn run(&mut self) -> Result<(), ActorError> {
        loop {
            tokio::select! {
                msg = self.receiver.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg),
                        None => break,
                    }
                }

                Some(joined) = self.worker_tasks.join_next_with_id() => {
                    self.on_worker_exit(joined);
                }
            }
        }
        Ok(())
    }
}

impl<T: VoiceTransport> ControllerActor<T> {
    fn handle_message(&mut self, msg: ControllerMessage) {
        match msg {
            ControllerMessage::Enqueue(request, reply) => {
                let _ = reply.send(self.enqueue(request));
            }
            ControllerMessage::Next {
                guild_id,
                session,
                reply,
            } => {
                let next = self
                    .session_queue(&guild_id, session)
                    .and_then(GuildQueue::pop);
                let _ = reply.send(next);
            }
            ControllerMessage::Retire {
                guild_id,
                session,
                reply,
            } => {
                let _ = reply.send(self.retire(guild_id, session));
            }
        }
    }

    fn enqueue(&mut self, request: PlayRequest) -> Admission {
        if let Some(queue) = self.guilds.get_mut(&request.guild_id) {
            return match queue.push(request) {
                Ok(position) => Admission::Queued { position },
                Err(dropped) => {
                    tracing::debug!(
                        guild = %dropped.guild_id,
                        user = %dropped.user_id,
                        clip = %dropped.clip.key(),
                        "guild queue is full, dropping play"
                    );
                    Admission::Dropped
                }
            };
        }

        self.start_session(request)
    }

    fn start_session(&mut self, request: PlayRequest) -> Admission {
        let Some(sender) = self.sender.upgrade() else {
            return Admission::Dropped;
        };

        let guild_id = request.guild_id.clone();
        let session = self.next_session;
        self.next_session += 1;

        self.register(guild_id.clone(), session);

        let worker = GuildWorker::new(
            guild_id.clone(),
            session,
            request,
            self.transport.clone(),
            ControllerHandle {
                sender,
                active: self.active.subscribe(),
            },
            self.stats.clone(),
            self.timing,
        );
        self.track_worker(guild_id, session, async move {
            actor::run(worker).await;
        });

        Admission::Started
    }

    fn register(&mut self, guild_id: GuildId, session: u64) {
        let capacity = self.policy.capacity_for(&guild_id);
        self.guilds.insert(guild_id, GuildQueue::new(session, capacity));
        self.publish_active();
    }

    fn track_worker(
        &mut self,
        guild_id: GuildId,
        session: u64,
        task: impl Future<Output = ()> + Send + 'static,
    ) {
        let handle = self.worker_tasks.spawn(task.in_current_span());
        self.worker_sessions.insert(handle.id(), (guild_id, session));
    }

    /// Reaps the session of a finished worker task, including one that was
    /// cancelled or panicked outside the actor.
    fn on_worker_exit(&mut self, joined: Result<(task::Id, ()), JoinError>) {
        let id = match joined {
            Ok((id, ())) => id,
            Err(err) => {
                tracing::error!(error = %err, "guild worker task failed");
                err.id()
            }
        };
        if let Some((guild_id, session)) = self.worker_sessions.remove(&id) {
            self.reap(guild_id, session);
        }
    }

    fn publish_active(&self) {
        metrics::gauge!("active_guilds").set(self.guilds.len() as f64);
        self.active.send_replace(self.guilds.keys().cloned().collect());
    }

    /// Removes the guild's entry if nothing is waiting, otherwise hands out
    /// the next request and keeps the session alive.
    fn retire(&mut self, guild_id: GuildId, session: u64) -> Option<PlayRequest> {
        let queue = self.session_queue(&guild_id, session)?;
        if let Some(next) = queue.pop() {
            return Some(next);
        }

        self.guilds.remove(&guild_id);
        self.publish_active();
        tracing::debug!(guild = %guild_id, session, "guild is idle");
        None
    }

    /// Clears the entry of a worker that stopped without retiring.
    fn reap(&mut self, guild_id: GuildId, session: u64) {
        if self.session_queue(&guild_id, session).is_none() {
            return;
        }

        if let Some(queue) = self.guilds.remove(&guild_id) {
            self.publish_active();
            tracing::warn!(
                guild = %guild_id,
                session,
                discarded = queue.pending.len(),
                "guild session aborted, discarding queued plays"
            );
        }
    }

    fn session_queue(&mut self, guild_id: &GuildId, session: u64) -> Option<&mut GuildQueue> {
        self.guilds
            .get_mut(guild_id)
            .filter(|queue| queue.session == session)
    }
}

#[derive(Clone, Debug)]
pub struct ControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    active: watch::Receiver<HashSet<GuildId>>,
}

impl ControllerHandle {
    pub fn new<T: VoiceTransport>(
        transport: T,
        stats: StatsHandle,
        timing: PlaybackTiming,
        policy: QueuePolicy,
    ) -> (Self, ControllerActor<T>) {
        let (sender, receiver) = mpsc::channel(64);
        let (active, active_rx) = watch::channel(HashSet::new());
        let actor = ControllerActor {
            receiver,
            sender: sender.downgrade(),
            transport,
            stats,
            timing,
            policy,
            guilds: HashMap::new(),
            active,
            worker_tasks: JoinSet::new(),
            worker_sessions: HashMap::new(),
            next_session: 0,
        };
        let handle = Self {
            sender,
            active: active_rx,
        };
        (handle, actor)
    }

    /// Starts a session for an idle guild or queues behind the active one.
    pub async fn enqueue(&self, request: PlayRequest) -> Result<Admission, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Enqueue(request, tx))
            .await
            .map_err(|_| ControllerError::ServiceUnavailable)?;
        rx.await.map_err(|_| ControllerError::ServiceUnavailable)
    }

    /// Guilds with a session, as of the last registry change.
    pub fn active_guilds(&self) -> Vec<GuildId> {
        self.active.borrow().iter().cloned().collect()
    }

    pub fn is_active(&self, guild_id: &GuildId) -> bool {
        self.active.borrow().contains(guild_id)
    }

    /// Resolves once the guild has no session. Fails if the controller stops
    /// while the guild is still active.
    pub async fn wait_until_idle(&self, guild_id: &GuildId) -> Result<(), ControllerError> {
        let mut active = self.active.clone();
        active
            .wait_for(|guilds| !guilds.contains(guild_id))
            .await
            .map(|_| ())
            .map_err(|_| ControllerError::ServiceUnavailable)
    }

    pub(crate) async fn next(
        &self,
        guild_id: &GuildId,
        session: u64,
    ) -> Result<Option<PlayRequest>, ActorError> {
        self.call(|reply| ControllerMessage::Next {
            guild_id: guild_id.clone(),
            session,
            reply,
        })
        .await
    }

    pub(crate) async fn retire(
        &self,
        guild_id: &GuildId,
        session: u64,
    ) -> Result<Option<PlayRequest>, ActorError> {
        self.call(|reply| ControllerMessage::Retire {
            guild_id: guild_id.clone(),
            session,
            reply,
        })
        .await
    }

    async fn call(
        &self,
        msg: impl FnOnce(oneshot::Sender<Option<PlayRequest>>) -> ControllerMessage,
    ) -> Result<Option<PlayRequest>, ActorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(msg(tx))
            .await
            .map_err(|_| ActorError::ControllerUnavailable)?;
        rx.await.map_err(|_| ActorError::ControllerUnavailable)
    }
}
