use futures::FutureExt;
use std::any::Any;
use std::fmt::{self, Debug, Display, Formatter};
use std::panic::{AssertUnwindSafe, RefUnwindSafe, UnwindSafe};
use thiserror::Error;

use crate::voice::TransportError;

#[derive(Error, Debug)]
pub enum ActorError {
    #[error("voice transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("controller is no longer running")]
    ControllerUnavailable,
    #[error("custom actor error: {0}")]
    Custom(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorStatus {
    Starting,
    PreStartFailed,
    Running,
    ExitedGracefully,
    ExitedWithError,
    Panicked,
    ShutDown,
}

impl Display for ActorStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActorStatus::Starting => "starting",
            ActorStatus::PreStartFailed => "pre_start_failed",
            ActorStatus::Running => "running",
            ActorStatus::ExitedGracefully => "exited_gracefully",
            ActorStatus::ExitedWithError => "exited_with_error",
            ActorStatus::Panicked => "panicked",
            ActorStatus::ShutDown => "shut_down",
        })
    }
}

/// A long-lived task with a start hook, a main loop and a cleanup hook.
///
/// `post_stop` runs after `run` returns for any reason, including a panic,
/// so it must not assume the actor's state is consistent.
pub trait Actor: Send + Sized {
    fn kind(&self) -> &'static str;

    type ID: Display + Debug + Clone + Send + Sync + UnwindSafe + RefUnwindSafe + 'static;
    fn id(&self) -> Self::ID;

    fn pre_start(&mut self) -> impl Future<Output = Result<(), ActorError>> + Send {
        async { Ok(()) }
    }

    fn run(&mut self) -> impl Future<Output = Result<(), ActorError>> + Send;

    fn post_stop(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Drives an actor through its lifecycle and reports the final status.
pub async fn run<A>(actor: A) -> ActorStatus
where
    A: Actor + 'static,
{
    let actor_kind = actor.kind();
    let actor_id = actor.id();

    run_instrumented(actor, actor_kind, actor_id).await
}

#[tracing::instrument(
    name = "actor_run",
    skip_all,
    fields(
        actor.kind = %actor_kind,
        actor.id = %actor_id,
        status = tracing::field::Empty,
    )
)]
async fn run_instrumented<A>(mut actor: A, actor_kind: &'static str, actor_id: A::ID) -> ActorStatus
where
    A: Actor + 'static,
{
    let span = tracing::Span::current();
    tracing::debug!("starting actor");

    let mut status = ActorStatus::Starting;
    span.record("status", tracing::field::display(status));

    match actor.pre_start().await {
        Ok(()) => status = ActorStatus::Running,
        Err(err) => {
            tracing::error!(error = %err, "pre_start failed");
            status = ActorStatus::PreStartFailed;
        }
    }
    span.record("status", tracing::field::display(status));

    if status == ActorStatus::Running {
        status = match AssertUnwindSafe(actor.run()).catch_unwind().await {
            Ok(Ok(())) => ActorStatus::ExitedGracefully,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "exited with an error");
                ActorStatus::ExitedWithError
            }
            Err(payload) => {
                tracing::error!(panic.message = %panic_message(&payload), "PANICKED!");
                ActorStatus::Panicked
            }
        };
        span.record("status", tracing::field::display(status));
    }

    // A panicking cleanup hook must not take the supervisor down with it.
    if let Err(payload) = AssertUnwindSafe(actor.post_stop()).catch_unwind().await {
        tracing::error!(panic.message = %panic_message(&payload), "post_stop panicked");
    }

    if status == ActorStatus::ExitedGracefully {
        status = ActorStatus::ShutDown;
    }
    span.record("status", tracing::field::display(status));
    tracing::debug!("fully shut down with final status: {}", status);
    status
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{:?}", payload)
    }
}
