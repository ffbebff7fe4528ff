//! Message-passing front end for the decision engine.
//!
//! Every caller (workers, sync loop, embedder) talks to one actor task over a
//! bounded channel. Requests are handled strictly in arrival order and each
//! reply travels back on its own oneshot channel.

use std::sync::Arc;

use async_trait::async_trait;
use lockguard_engine::{Decision, DecisionSink, EngineError, LockDecisionEngine, Trigger, UnlockOutcome};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

type EngineResult<T> = lockguard_engine::Result<T>;

enum Command {
    Submit {
        trigger: Trigger,
        reply: oneshot::Sender<EngineResult<Decision>>,
    },
    Unlock {
        password: String,
        reply: oneshot::Sender<EngineResult<UnlockOutcome>>,
    },
}

/// Cloneable sender side of the decision actor
#[derive(Clone)]
pub struct DecisionHandle {
    tx: mpsc::Sender<Command>,
}

fn stopped() -> EngineError {
    EngineError::Unavailable("decision actor stopped".to_string())
}

impl DecisionHandle {
    /// Submit a trigger and wait for the resulting decision
    pub async fn submit(&self, trigger: Trigger) -> EngineResult<Decision> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit { trigger, reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Try an unlock password against the stored secret
    pub async fn unlock_with_password(&self, password: impl Into<String>) -> EngineResult<UnlockOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Unlock {
                password: password.into(),
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl DecisionSink for DecisionHandle {
    async fn submit(&self, trigger: Trigger) -> EngineResult<Decision> {
        DecisionHandle::submit(self, trigger).await
    }
}

/// Start the actor task.
///
/// The task ends when shutdown is signalled or every handle is dropped.
/// Requests still queued at shutdown are answered with
/// [`EngineError::Unavailable`] when their reply channel drops.
pub fn spawn_decision_actor(
    engine: Arc<LockDecisionEngine>,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> (DecisionHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));

    let task = tokio::spawn(async move {
        info!("Decision actor started");
        loop {
            tokio::select! {
                biased;
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    handle(&engine, command).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Decision actor stopped");
    });

    (DecisionHandle { tx }, task)
}

async fn handle(engine: &LockDecisionEngine, command: Command) {
    match command {
        Command::Submit { trigger, reply } => {
            let result = engine.submit(trigger).await;
            if reply.send(result).is_err() {
                debug!("Decision requester went away before the reply");
            }
        }
        Command::Unlock { password, reply } => {
            let result = engine.unlock_with_password(&password).await;
            if reply.send(result).is_err() {
                debug!("Unlock requester went away before the reply");
            }
        }
    }
}
