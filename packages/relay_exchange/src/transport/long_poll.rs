//! Long-poll transport.
//!
//! Each session holds a queue of envelopes and at most one parked poll. A
//! call arriving while a poll is parked completes that poll immediately;
//! otherwise it waits in the queue for the next poll.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Transport, outbound_envelope};
use crate::config::ExchangeConfig;
use crate::envelope::{Envelope, TransportKind};
use crate::error::RelayError;
use crate::groups::GroupRegistry;
use crate::relay::RelayHandle;

/// Where a session is in its poll/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    AwaitingMessage,
    Delivered,
}

type Delivery = oneshot::Sender<Vec<Envelope>>;

enum PollCommand {
    Open {
        connection_id: String,
    },
    Enqueue {
        connection_id: String,
        envelope: Envelope,
    },
    Wait {
        connection_id: String,
        respond_to: oneshot::Sender<Option<oneshot::Receiver<Vec<Envelope>>>>,
    },
    Close {
        connection_id: String,
    },
    Inspect {
        respond_to: oneshot::Sender<Vec<(String, PollState, usize)>>,
    },
}

struct Session {
    queue: VecDeque<Envelope>,
    parked: Option<Delivery>,
    last_poll: Instant,
    state: PollState,
}

impl Session {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            parked: None,
            last_poll: Instant::now(),
            state: PollState::Idle,
        }
    }

    /// Whether a poll is parked and its requester is still waiting.
    fn has_live_poll(&self) -> bool {
        self.parked.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[derive(Clone)]
pub struct LongPollTransport {
    commands: mpsc::UnboundedSender<PollCommand>,
    poll_timeout: Duration,
}

impl LongPollTransport {
    /// Start the session actor. Must be called from within a tokio runtime.
    pub fn spawn(groups: Arc<GroupRegistry>, config: &ExchangeConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SessionActor {
            sessions: HashMap::new(),
            groups,
            queue_capacity: config.outbound_queue_capacity,
            session_timeout: config.session_timeout,
        };
        tokio::spawn(actor.run(rx, config.sweep_interval()));
        Self {
            commands: tx,
            poll_timeout: config.long_poll_timeout,
        }
    }

    pub fn open(&self, connection_id: &str) {
        let _ = self.commands.send(PollCommand::Open {
            connection_id: connection_id.to_string(),
        });
    }

    /// Wait up to the poll timeout for envelopes addressed to
    /// `connection_id`. Returns an empty batch on timeout.
    pub async fn wait(&self, connection_id: &str) -> Result<Vec<Envelope>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(PollCommand::Wait {
                connection_id: connection_id.to_string(),
                respond_to: tx,
            })
            .map_err(|_| RelayError::ConnectionLost("long-poll transport stopped".into()))?;

        let mut delivery = rx
            .await
            .map_err(|_| RelayError::ConnectionLost("long-poll transport stopped".into()))?
            .ok_or_else(|| RelayError::UnknownClient(connection_id.to_string()))?;

        match tokio::time::timeout(self.poll_timeout, &mut delivery).await {
            Ok(Ok(envelopes)) => Ok(envelopes),
            // Session closed while parked.
            Ok(Err(_)) => Ok(Vec::new()),
            Err(_) => Ok(reclaim(delivery)),
        }
    }

    /// End a session and report it as disconnected.
    pub fn close(&self, connection_id: &str) {
        let _ = self.commands.send(PollCommand::Close {
            connection_id: connection_id.to_string(),
        });
    }

    /// Current sessions with their state and queue depth, sorted by id.
    pub async fn sessions(&self) -> Vec<(String, PollState, usize)> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(PollCommand::Inspect { respond_to: tx })
            .is_err()
        {
            return Vec::new();
        }
        let mut sessions = rx.await.unwrap_or_default();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }
}

impl Transport for LongPollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPoll
    }

    fn call_client_function(&self, handle: &RelayHandle, method: &str, args: &[Value]) {
        let Some((connection_id, envelope)) = outbound_envelope(handle, method, args) else {
            return;
        };
        let _ = self.commands.send(PollCommand::Enqueue {
            connection_id,
            envelope,
        });
    }
}

/// Close a timed-out delivery channel, keeping a batch that was sent just
/// before the close. Anything sent afterwards fails and is requeued.
fn reclaim(mut delivery: oneshot::Receiver<Vec<Envelope>>) -> Vec<Envelope> {
    delivery.close();
    delivery.try_recv().unwrap_or_default()
}

struct SessionActor {
    sessions: HashMap<String, Session>,
    groups: Arc<GroupRegistry>,
    queue_capacity: usize,
    session_timeout: Duration,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PollCommand>, sweep_every: Duration) {
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command).await;
                }
                _ = sweep.tick() => self.sweep().await,
            }
        }

        debug!("long-poll actor stopped");
    }

    async fn handle(&mut self, command: PollCommand) {
        match command {
            PollCommand::Open { connection_id } => {
                self.sessions.insert(connection_id.clone(), Session::new());
                info!(connection_id = %connection_id, total = self.sessions.len(), "long-poll session opened");
            }
            PollCommand::Enqueue {
                connection_id,
                envelope,
            } => self.enqueue(&connection_id, envelope),
            PollCommand::Wait {
                connection_id,
                respond_to,
            } => {
                let Some(session) = self.sessions.get_mut(&connection_id) else {
                    let _ = respond_to.send(None);
                    return;
                };
                session.last_poll = Instant::now();

                let (tx, rx) = oneshot::channel();
                if session.queue.is_empty() {
                    // A newer poll supersedes any parked one.
                    session.parked = Some(tx);
                    session.state = PollState::AwaitingMessage;
                } else {
                    let batch: Vec<Envelope> = session.queue.drain(..).collect();
                    debug!(connection_id = %connection_id, count = batch.len(), "delivering queued calls");
                    let _ = tx.send(batch);
                    session.parked = None;
                    session.state = PollState::Delivered;
                }
                let _ = respond_to.send(Some(rx));
            }
            PollCommand::Close { connection_id } => {
                if self.sessions.remove(&connection_id).is_some() {
                    self.groups.remove_from_all_groups(&connection_id).await;
                    info!(connection_id = %connection_id, "long-poll session closed");
                }
            }
            PollCommand::Inspect { respond_to } => {
                let snapshot = self
                    .sessions
                    .iter()
                    .map(|(id, s)| (id.clone(), s.state, s.queue.len()))
                    .collect();
                let _ = respond_to.send(snapshot);
            }
        }
    }

    fn enqueue(&mut self, connection_id: &str, envelope: Envelope) {
        let Some(session) = self.sessions.get_mut(connection_id) else {
            debug!("{}", RelayError::DeliveryMiss(connection_id.to_string()));
            return;
        };

        let envelope = match session.parked.take() {
            Some(tx) => match tx.send(vec![envelope]) {
                Ok(()) => {
                    session.state = PollState::Delivered;
                    return;
                }
                // The parked request already timed out.
                Err(mut batch) => {
                    let Some(envelope) = batch.pop() else { return };
                    envelope
                }
            },
            None => envelope,
        };

        if session.queue.len() >= self.queue_capacity {
            warn!(connection_id, "long-poll queue full, dropping message");
            return;
        }
        session.queue.push_back(envelope);
        session.state = PollState::Idle;
    }

    async fn sweep(&mut self) {
        let timeout = self.session_timeout;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.has_live_poll() && s.last_poll.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for connection_id in expired {
            self.sessions.remove(&connection_id);
            self.groups.remove_from_all_groups(&connection_id).await;
            info!(connection_id = %connection_id, "long-poll session expired");
        }
    }
}
