//! WebSocket transport.
//!
//! The connection table is owned by one event loop task. Connection tasks
//! register on open and report on close; outbound deliveries are commands to
//! the loop, which forwards them to the connection's bounded writer queue.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Transport, outbound_envelope};
use crate::config::ExchangeConfig;
use crate::envelope::TransportKind;
use crate::error::RelayError;
use crate::groups::GroupRegistry;
use crate::relay::RelayHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

enum SocketCommand {
    Connected {
        connection_id: String,
        generation: u64,
        outbound: mpsc::Sender<String>,
    },
    Disconnected {
        connection_id: String,
        generation: u64,
    },
    Deliver {
        connection_id: String,
        payload: String,
    },
    Close {
        connection_id: String,
    },
    /// Drop a negotiated client that never opened a socket.
    Reap {
        connection_id: String,
    },
    Inspect {
        respond_to: oneshot::Sender<Vec<(String, SocketState)>>,
    },
}

struct SocketConnection {
    generation: u64,
    /// Dropped when the server closes the connection, which ends its writer.
    outbound: Option<mpsc::Sender<String>>,
    state: SocketState,
}

#[derive(Clone)]
pub struct SocketTransport {
    commands: mpsc::UnboundedSender<SocketCommand>,
    next_generation: Arc<AtomicU64>,
    outbound_capacity: usize,
    keepalive_timeout: Duration,
    keepalive_interval: Duration,
}

impl SocketTransport {
    /// Start the event loop. Must be called from within a tokio runtime.
    pub fn spawn(groups: Arc<GroupRegistry>, config: &ExchangeConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_event_loop(rx, groups));
        Self {
            commands: tx,
            next_generation: Arc::new(AtomicU64::new(1)),
            outbound_capacity: config.outbound_queue_capacity,
            keepalive_timeout: config.keepalive_timeout,
            keepalive_interval: config.keepalive_interval(),
        }
    }

    /// Drive one upgraded socket until either side closes it.
    ///
    /// Text frames are handed to `on_text`; the connection is registered for
    /// the duration of the call and reported as disconnected afterwards.
    pub async fn serve<F>(&self, socket: WebSocket, connection_id: String, on_text: F)
    where
        F: Fn(&str) + Send + Sync,
    {
        debug!(connection_id = %connection_id, state = ?SocketState::Connecting, "socket upgraded");
        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(self.outbound_capacity);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let _ = self.commands.send(SocketCommand::Connected {
            connection_id: connection_id.clone(),
            generation,
            outbound: outbound_tx,
        });

        let (pong_tx, pong_rx) = watch::channel(Instant::now());
        let keepalive_timeout = self.keepalive_timeout;
        let mut probe = tokio::time::interval(self.keepalive_interval);

        let writer = async {
            loop {
                tokio::select! {
                    payload = outbound_rx.recv() => {
                        let Some(payload) = payload else {
                            debug!(connection_id = %connection_id, "outbound queue released");
                            break;
                        };
                        if let Err(e) = sink.send(Message::Text(payload.into())).await {
                            debug!(connection_id = %connection_id, "socket write failed: {}", e);
                            break;
                        }
                    }
                    _ = probe.tick() => {
                        let last_pong = *pong_rx.borrow();
                        if last_pong.elapsed() > keepalive_timeout {
                            warn!(connection_id = %connection_id, "keepalive timed out");
                            break;
                        }
                        if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        };

        let reader = async {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => on_text(text.as_str()),
                    Ok(Message::Pong(_)) => {
                        let _ = pong_tx.send(Instant::now());
                    }
                    Ok(Message::Close(_)) => {
                        debug!(connection_id = %connection_id, "close frame received");
                        break;
                    }
                    Ok(Message::Binary(_)) => {
                        debug!("binary frames not supported");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(connection_id = %connection_id, "socket read failed: {}", e);
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = writer => {}
            _ = reader => {}
        }

        let _ = self.commands.send(SocketCommand::Disconnected {
            connection_id,
            generation,
        });
    }

    /// Close a connection from the server side.
    pub fn close(&self, connection_id: &str) {
        let _ = self.commands.send(SocketCommand::Close {
            connection_id: connection_id.to_string(),
        });
    }

    /// Remove `connection_id` from every group unless a socket is open for
    /// it. Ordered with connection registration, so a socket registering
    /// after this runs is refused.
    pub fn reap_unconnected(&self, connection_id: &str) {
        let _ = self.commands.send(SocketCommand::Reap {
            connection_id: connection_id.to_string(),
        });
    }

    /// Current connection table, sorted by id.
    pub async fn connections(&self) -> Vec<(String, SocketState)> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(SocketCommand::Inspect { respond_to: tx })
            .is_err()
        {
            return Vec::new();
        }
        let mut connections = rx.await.unwrap_or_default();
        connections.sort_by(|a, b| a.0.cmp(&b.0));
        connections
    }
}

impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn call_client_function(&self, handle: &RelayHandle, method: &str, args: &[Value]) {
        let Some((connection_id, envelope)) = outbound_envelope(handle, method, args) else {
            return;
        };
        match envelope.encode() {
            Ok(payload) => {
                let _ = self.commands.send(SocketCommand::Deliver {
                    connection_id,
                    payload,
                });
            }
            Err(e) => error!("failed to encode outbound call: {}", e),
        }
    }
}

async fn run_event_loop(mut rx: mpsc::UnboundedReceiver<SocketCommand>, groups: Arc<GroupRegistry>) {
    let mut connections: HashMap<String, SocketConnection> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            SocketCommand::Connected {
                connection_id,
                generation,
                outbound,
            } => {
                if groups.lookup_client(&connection_id).await.is_none() {
                    // Dropping `outbound` ends the connection's writer.
                    warn!(connection_id = %connection_id, "socket for unknown client refused");
                    continue;
                }
                let connection = SocketConnection {
                    generation,
                    outbound: Some(outbound),
                    state: SocketState::Open,
                };
                if connections.insert(connection_id.clone(), connection).is_some() {
                    debug!(connection_id = %connection_id, "replaced existing socket");
                }
                info!(connection_id = %connection_id, total = connections.len(), "socket connected");
            }
            SocketCommand::Disconnected {
                connection_id,
                generation,
            } => {
                let current = connections
                    .get(&connection_id)
                    .is_some_and(|c| c.generation == generation);
                if !current {
                    debug!(connection_id = %connection_id, generation, "stale disconnect ignored");
                    continue;
                }
                groups.remove_from_all_groups(&connection_id).await;
                if let Some(mut connection) = connections.remove(&connection_id) {
                    connection.state = SocketState::Closed;
                    debug!(connection_id = %connection_id, state = ?connection.state, "socket state");
                }
                info!(connection_id = %connection_id, total = connections.len(), "socket disconnected");
            }
            SocketCommand::Deliver {
                connection_id,
                payload,
            } => {
                let Some(outbound) = connections
                    .get(&connection_id)
                    .and_then(|c| c.outbound.as_ref())
                else {
                    debug!("{}", RelayError::DeliveryMiss(connection_id));
                    continue;
                };
                match outbound.try_send(payload) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(connection_id = %connection_id, "outbound queue full, dropping message");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(connection_id = %connection_id, "writer already gone");
                    }
                }
            }
            SocketCommand::Close { connection_id } => {
                if let Some(connection) = connections.get_mut(&connection_id) {
                    connection.state = SocketState::Closing;
                    connection.outbound = None;
                    info!(connection_id = %connection_id, "closing socket");
                }
            }
            SocketCommand::Reap { connection_id } => {
                if connections.contains_key(&connection_id) {
                    continue;
                }
                if groups.remove_from_all_groups(&connection_id).await > 0 {
                    info!(connection_id = %connection_id, "negotiated socket never connected");
                }
            }
            SocketCommand::Inspect { respond_to } => {
                let snapshot = connections
                    .iter()
                    .map(|(id, c)| (id.clone(), c.state))
                    .collect();
                let _ = respond_to.send(snapshot);
            }
        }
    }

    debug!("socket event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> (Arc<GroupRegistry>, SocketTransport) {
        let groups = Arc::new(GroupRegistry::new());
        let transport = SocketTransport::spawn(groups.clone(), &ExchangeConfig::default());
        (groups, transport)
    }

    fn register(transport: &SocketTransport, connection_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(4);
        let sent = transport.commands.send(SocketCommand::Connected {
            connection_id: connection_id.to_string(),
            generation: transport.next_generation.fetch_add(1, Ordering::Relaxed),
            outbound: tx,
        });
        assert!(sent.is_ok());
        rx
    }

    #[tokio::test]
    async fn test_reap_removes_unconnected_client() {
        let (groups, transport) = transport();
        groups.add_client("a", TransportKind::WebSocket).await;
        groups.add_to_group("room1", "a").await.unwrap();

        transport.reap_unconnected("a");
        transport.connections().await;

        assert!(groups.lookup_client("a").await.is_none());
        assert!(groups.groups_of("a").await.is_empty());
    }

    #[tokio::test]
    async fn test_reap_keeps_open_socket() {
        let (groups, transport) = transport();
        groups.add_client("a", TransportKind::WebSocket).await;
        let _outbound = register(&transport, "a");

        transport.reap_unconnected("a");
        assert_eq!(
            transport.connections().await,
            vec![("a".to_string(), SocketState::Open)]
        );
        assert!(groups.lookup_client("a").await.is_some());
    }

    #[tokio::test]
    async fn test_socket_after_reap_is_refused() {
        let (groups, transport) = transport();
        groups.add_client("a", TransportKind::WebSocket).await;

        transport.reap_unconnected("a");
        let mut outbound = register(&transport, "a");

        assert!(transport.connections().await.is_empty());
        assert!(outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_releases_writer_queue() {
        let (groups, transport) = transport();
        groups.add_client("a", TransportKind::WebSocket).await;
        let mut outbound = register(&transport, "a");

        transport.close("a");
        assert_eq!(
            transport.connections().await,
            vec![("a".to_string(), SocketState::Closing)]
        );
        assert!(outbound.recv().await.is_none());
    }
}
