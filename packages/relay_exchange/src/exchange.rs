//! The exchange: relay registry, group registry and both transports behind
//! one cheaply cloneable handle.

use axum::extract::ws::WebSocket;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::envelope::{Envelope, TransportKind};
use crate::error::RelayError;
use crate::groups::{Client, GroupRegistry};
use crate::relay::{Relay, RelayDefinition, RelayHandle, RelayRegistry};
use crate::script::{ScriptCache, ScriptTransform};
use crate::transport::{LongPollTransport, SocketTransport, Transport};

/// Collects relays before the exchange starts.
pub struct ExchangeBuilder {
    config: ExchangeConfig,
    relays: RelayRegistry,
    script_transform: Option<ScriptTransform>,
}

impl ExchangeBuilder {
    /// Register relay `R`. Relay names are unique per exchange.
    pub fn relay<R: Relay>(self) -> Result<Self, RelayError> {
        self.definition(RelayDefinition::of::<R>()?)
    }

    /// Register a pre-built definition.
    pub fn definition(mut self, definition: RelayDefinition) -> Result<Self, RelayError> {
        self.relays.register(definition)?;
        Ok(self)
    }

    /// Post-process the generated client script.
    pub fn script_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(String) -> String + Send + Sync + 'static,
    {
        self.script_transform = Some(Arc::new(transform));
        self
    }

    /// Start the transport event loops. Must be called from within a tokio
    /// runtime.
    pub fn build(self) -> Exchange {
        let groups = Arc::new(GroupRegistry::new());
        let sockets = SocketTransport::spawn(groups.clone(), &self.config);
        let long_poll = LongPollTransport::spawn(groups.clone(), &self.config);
        let scripts = ScriptCache::new(self.config.script_cache_enabled, self.script_transform);
        info!(relays = self.relays.len(), "exchange started");

        Exchange {
            inner: Arc::new(ExchangeInner {
                config: self.config,
                relays: self.relays,
                groups,
                sockets,
                long_poll,
                scripts,
            }),
        }
    }
}

struct ExchangeInner {
    config: ExchangeConfig,
    relays: RelayRegistry,
    groups: Arc<GroupRegistry>,
    sockets: SocketTransport,
    long_poll: LongPollTransport,
    scripts: ScriptCache,
}

#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

impl Exchange {
    pub fn builder(config: ExchangeConfig) -> ExchangeBuilder {
        ExchangeBuilder {
            config,
            relays: RelayRegistry::new(),
            script_transform: None,
        }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.inner.config
    }

    pub fn relays(&self) -> &RelayRegistry {
        &self.inner.relays
    }

    pub fn sockets(&self) -> &SocketTransport {
        &self.inner.sockets
    }

    pub fn long_poll(&self) -> &LongPollTransport {
        &self.inner.long_poll
    }

    fn transport(&self, kind: TransportKind) -> &dyn Transport {
        match kind {
            TransportKind::WebSocket => &self.inner.sockets,
            TransportKind::LongPoll => &self.inner.long_poll,
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Register a new client for `transport` and return its connection id.
    pub async fn negotiate(&self, transport: TransportKind) -> String {
        let connection_id = uuid::Uuid::new_v4().to_string();
        self.inner.groups.add_client(&connection_id, transport).await;
        match transport {
            TransportKind::LongPoll => self.inner.long_poll.open(&connection_id),
            TransportKind::WebSocket => self.reap_if_never_connected(connection_id.clone()),
        }
        info!(connection_id = %connection_id, transport = %transport, "client negotiated");
        connection_id
    }

    /// A websocket client that never upgrades would otherwise stay in the
    /// Global group forever.
    fn reap_if_never_connected(&self, connection_id: String) {
        let sockets = self.inner.sockets.clone();
        let grace = self.inner.config.keepalive_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            sockets.reap_unconnected(&connection_id);
        });
    }

    /// Check that `connection_id` was negotiated for `expected`.
    pub async fn require_client(
        &self,
        connection_id: &str,
        expected: TransportKind,
    ) -> Result<Client, RelayError> {
        let client = self
            .lookup_client(connection_id)
            .await
            .ok_or_else(|| RelayError::UnknownClient(connection_id.to_string()))?;
        if client.transport != expected {
            return Err(RelayError::TransportMismatch {
                connection_id: connection_id.to_string(),
                expected: client.transport.to_string(),
            });
        }
        Ok(client)
    }

    /// Serve an upgraded websocket for a negotiated client until it closes.
    pub async fn connect(&self, connection_id: String, socket: WebSocket) {
        let exchange = self.clone();
        let id = connection_id.clone();
        self.inner
            .sockets
            .serve(socket, connection_id, move |text| exchange.handle_socket_frame(&id, text))
            .await;
    }

    /// Long-poll for calls addressed to `connection_id`.
    pub async fn await_long_poll(&self, connection_id: &str) -> Result<Vec<Envelope>, RelayError> {
        self.require_client(connection_id, TransportKind::LongPoll).await?;
        self.inner.long_poll.wait(connection_id).await
    }

    /// Close a client from the server side, whatever its transport.
    pub async fn disconnect(&self, connection_id: &str) {
        match self.lookup_client(connection_id).await {
            Some(client) => match client.transport {
                TransportKind::WebSocket => self.inner.sockets.close(connection_id),
                TransportKind::LongPoll => self.inner.long_poll.close(connection_id),
            },
            None => debug!(connection_id, "disconnect for unknown client"),
        }
    }

    // =========================================================================
    // Inbound calls
    // =========================================================================

    /// One text frame from a websocket client.
    fn handle_socket_frame(&self, connection_id: &str, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection_id, "dropping frame: {}", e);
                return;
            }
        };

        if envelope.is_server_call {
            if let Err(e) = self.spawn_server_call(connection_id, envelope) {
                warn!(connection_id, "server call rejected: {}", e);
            }
            return;
        }

        // Client-to-client call, forwarded to the addressed connection.
        let exchange = self.clone();
        tokio::spawn(async move {
            let Envelope {
                relay,
                method,
                arguments,
                connection_id: target,
                ..
            } = envelope;
            if exchange.relays().get(&relay).is_none() {
                warn!(relay = %relay, "forward for unknown relay dropped");
                return;
            }
            exchange.call_client(&relay, &target, &method, arguments).await;
        });
    }

    /// A server call submitted over HTTP. Runs in the background; only
    /// validation errors are reported.
    pub async fn accept_server_call(
        &self,
        connection_id: &str,
        envelope: Envelope,
    ) -> Result<(), RelayError> {
        self.lookup_client(connection_id)
            .await
            .ok_or_else(|| RelayError::UnknownClient(connection_id.to_string()))?;
        self.spawn_server_call(connection_id, envelope)
    }

    fn spawn_server_call(&self, connection_id: &str, envelope: Envelope) -> Result<(), RelayError> {
        let handle = self.resolve(&envelope.relay, Some(connection_id))?;
        let invocation = self
            .inner
            .relays
            .require(&envelope.relay)?
            .invocation(handle, &envelope.method, envelope.arguments)?;
        debug!(connection_id, relay = %envelope.relay, method = %envelope.method, "dispatching");
        tokio::spawn(invocation);
        Ok(())
    }

    // =========================================================================
    // Relays
    // =========================================================================

    /// A server-initiated handle for relay `R`.
    pub fn relay<R: Relay>(&self) -> Result<RelayHandle, RelayError> {
        self.resolve(R::NAME, None)
    }

    /// A fresh handle for `name`, bound to `connection_id` if given.
    pub fn resolve(&self, name: &str, connection_id: Option<&str>) -> Result<RelayHandle, RelayError> {
        let definition = self.inner.relays.require(name)?;
        Ok(RelayHandle::new(
            definition.name(),
            connection_id.map(str::to_string),
            self.clone(),
        ))
    }

    /// Invoke `method` on the relay the handle names and wait for it to finish.
    pub async fn dispatch_server_call(
        &self,
        handle: RelayHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), RelayError> {
        self.inner.relays.dispatch(handle, method, args).await
    }

    // =========================================================================
    // Outbound calls
    // =========================================================================

    pub(crate) async fn call_client(
        &self,
        relay: &str,
        connection_id: &str,
        method: &str,
        args: Vec<Value>,
    ) {
        let Some(client) = self.lookup_client(connection_id).await else {
            debug!(connection_id, method, "call for unknown client skipped");
            return;
        };
        self.deliver(relay, &client, method, &args);
    }

    pub(crate) async fn call_group(
        &self,
        relay: &str,
        group: &str,
        except: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) {
        self.inner
            .groups
            .for_each_in_group(group, |client| {
                if Some(client.connection_id.as_str()) != except {
                    self.deliver(relay, client, method, &args);
                }
            })
            .await;
    }

    fn deliver(&self, relay: &str, client: &Client, method: &str, args: &[Value]) {
        let handle = RelayHandle::new(relay, Some(client.connection_id.clone()), self.clone());
        let transport = self.transport(client.transport);
        debug!(
            connection_id = %client.connection_id,
            transport = %transport.kind(),
            relay,
            method,
            "delivering client call"
        );
        transport.call_client_function(&handle, method, args);
    }

    // =========================================================================
    // Groups
    // =========================================================================

    pub async fn lookup_client(&self, connection_id: &str) -> Option<Client> {
        self.inner.groups.lookup_client(connection_id).await
    }

    pub async fn add_to_group(&self, group: &str, connection_id: &str) -> Result<bool, RelayError> {
        self.inner.groups.add_to_group(group, connection_id).await
    }

    pub async fn remove_from_group(&self, group: &str, connection_id: &str) -> bool {
        self.inner.groups.remove_from_group(group, connection_id).await
    }

    /// Connection ids in `group`, in join order.
    pub async fn group_members(&self, group: &str) -> Vec<String> {
        self.inner
            .groups
            .snapshot(group)
            .await
            .into_iter()
            .map(|client| client.connection_id)
            .collect()
    }

    pub async fn groups_of(&self, connection_id: &str) -> Vec<String> {
        self.inner.groups.groups_of(connection_id).await
    }

    // =========================================================================
    // Client script
    // =========================================================================

    /// The client script for `route`, prefixed by the public url if one is
    /// configured.
    pub async fn client_script(&self, route: &str) -> Arc<str> {
        let route = match &self.inner.config.public_url {
            Some(public) => format!("{public}{route}"),
            None => route.to_string(),
        };
        self.inner
            .scripts
            .get_or_generate(&route, &self.inner.relays)
            .await
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("relays", &self.inner.relays)
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::GLOBAL_GROUP;
    use crate::relay::RelayBuilder;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Chat;

    impl Relay for Chat {
        const NAME: &'static str = "Chat";

        fn define(methods: crate::relay::RelayBuilder<Self>) -> crate::relay::RelayBuilder<Self> {
            methods
                .method("Broadcast", |_: Chat, handle: RelayHandle, (text,): (String,)| async move {
                    handle.clients().all("receive", vec![json!(text)]).await;
                })
                .method("Join", |_: Chat, handle: RelayHandle, (room,): (String,)| async move {
                    let _ = handle.join(&room).await;
                })
                .method("Leave", |_: Chat, handle: RelayHandle, (room,): (String,)| async move {
                    handle.leave(&room).await;
                })
                .method("Shout", |_: Chat, handle: RelayHandle, (room, text): (String, String)| async move {
                    handle.clients().group_except(&room, "receive", vec![json!(text)]).await;
                })
                .method("Echo", |_: Chat, handle: RelayHandle, args: Vec<Value>| async move {
                    handle.clients().call("echo", args).await;
                })
                .method("Nudge", |_: Chat, handle: RelayHandle, (to,): (String,)| async move {
                    handle.clients().client(&to, "nudge", vec![]).await;
                })
                .method("Gossip", |_: Chat, handle: RelayHandle, (text,): (String,)| async move {
                    handle.clients().others("receive", vec![json!(text)]).await;
                })
        }
    }

    fn config() -> ExchangeConfig {
        ExchangeConfig {
            long_poll_timeout: Duration::from_millis(200),
            ..ExchangeConfig::default()
        }
    }

    fn exchange() -> Exchange {
        Exchange::builder(config()).relay::<Chat>().unwrap().build()
    }

    async fn poll_methods(exchange: &Exchange, id: &str) -> Vec<(String, Vec<Value>)> {
        exchange
            .await_long_poll(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.method, e.arguments))
            .collect()
    }

    #[tokio::test]
    async fn test_negotiate_assigns_fresh_ids() {
        let exchange = exchange();
        let a = exchange.negotiate(TransportKind::LongPoll).await;
        let b = exchange.negotiate(TransportKind::LongPoll).await;
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
        assert_eq!(exchange.group_members(GLOBAL_GROUP).await, vec![a, b]);
    }

    #[tokio::test]
    async fn test_duplicate_relay_registration_rejected() {
        let err = Exchange::builder(config())
            .relay::<Chat>()
            .unwrap()
            .relay::<Chat>()
            .err()
            .unwrap();
        assert_eq!(err, RelayError::DuplicateRelay("Chat".into()));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let exchange = exchange();
        let a = exchange.negotiate(TransportKind::LongPoll).await;
        let b = exchange.negotiate(TransportKind::LongPoll).await;

        let handle = exchange.resolve("Chat", Some(&a)).unwrap();
        exchange
            .dispatch_server_call(handle, "Broadcast", vec![json!("hi")])
            .await
            .unwrap();

        for id in [&a, &b] {
            assert_eq!(
                poll_methods(&exchange, id).await,
                vec![("receive".to_string(), vec![json!("hi")])]
            );
        }
    }

    #[tokio::test]
    async fn test_group_except_skips_caller() {
        let exchange = exchange();
        let a = exchange.negotiate(TransportKind::LongPoll).await;
        let b = exchange.negotiate(TransportKind::LongPoll).await;
        let c = exchange.negotiate(TransportKind::LongPoll).await;

        for id in [&a, &b] {
            let handle = exchange.resolve("Chat", Some(id)).unwrap();
            exchange
                .dispatch_server_call(handle, "Join", vec![json!("room1")])
                .await
                .unwrap();
        }
        assert_eq!(exchange.group_members("room1").await, vec![a.clone(), b.clone()]);

        let handle = exchange.resolve("Chat", Some(&a)).unwrap();
        exchange
            .dispatch_server_call(handle, "Shout", vec![json!("room1"), json!("hey")])
            .await
            .unwrap();

        assert_eq!(poll_methods(&exchange, &b).await.len(), 1);
        assert!(poll_methods(&exchange, &a).await.is_empty());
        assert!(poll_methods(&exchange, &c).await.is_empty());
    }

    #[tokio::test]
    async fn test_leave_then_group_deleted() {
        let exchange = exchange();
        let a = exchange.negotiate(TransportKind::LongPoll).await;
        let join = exchange.resolve("Chat", Some(&a)).unwrap();
        exchange
            .dispatch_server_call(join, "Join", vec![json!("room1")])
            .await
            .unwrap();
        let leave = exchange.resolve("Chat", Some(&a)).unwrap();
        exchange
            .dispatch_server_call(leave, "Leave", vec![json!("room1")])
            .await
            .unwrap();
        assert!(exchange.group_members("room1").await.is_empty());
        assert_eq!(exchange.groups_of(&a).await, vec![GLOBAL_GROUP.to_string()]);
    }

    #[tokio::test]
    async fn test_leaving_global_keeps_client_reachable() {
        let exchange = exchange();
        let a = exchange.negotiate(TransportKind::LongPoll).await;
        exchange.add_to_group("room1", &a).await.unwrap();

        let leave = exchange.resolve("Chat", Some(&a)).unwrap();
        exchange
            .dispatch_server_call(leave, "Leave", vec![json!(GLOBAL_GROUP)])
            .await
            .unwrap();

        assert!(exchange.lookup_client(&a).await.is_some());
        assert_eq!(exchange.groups_of(&a).await, vec![GLOBAL_GROUP.to_string(), "room1".to_string()]);

        let handle = exchange.resolve("Chat", Some(&a)).unwrap();
        exchange
            .dispatch_server_call(handle, "Broadcast", vec![json!("still here")])
            .await
            .unwrap();
        assert_eq!(
            poll_methods(&exchange, &a).await,
            vec![("receive".to_string(), vec![json!("still here")])]
        );
    }

    #[tokio::test]
    async fn test_unconnected_socket_client_is_reaped() {
        let exchange = Exchange::builder(ExchangeConfig {
            keepalive_timeout: Duration::from_millis(100),
            ..config()
        })
        .relay::<Chat>()
        .unwrap()
        .build();
        let ws = exchange.negotiate(TransportKind::WebSocket).await;
        let lp = exchange.negotiate(TransportKind::LongPoll).await;
        exchange.add_to_group("room1", &ws).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        // Inspect is answered after the queued reap.
        exchange.sockets().connections().await;

        assert!(exchange.lookup_client(&ws).await.is_none());
        assert!(exchange.group_members("room1").await.is_empty());
        assert_eq!(exchange.group_members(GLOBAL_GROUP).await, vec![lp]);
    }

    #[tokio::test]
    async fn test_call_others_and_client() {
        let exchange = exchange();
        let a = exchange.negotiate(TransportKind::LongPoll).await;
        let b = exchange.negotiate(TransportKind::LongPoll).await;

        let handle = exchange.resolve("Chat", Some(&a)).unwrap();
        exchange
            .dispatch_server_call(handle.clone(), "Echo", vec![json!(1), json!("two")])
            .await
            .unwrap();
        exchange
            .dispatch_server_call(handle.clone(), "Nudge", vec![json!(b.clone())])
            .await
            .unwrap();
        exchange
            .dispatch_server_call(handle, "Gossip", vec![json!("psst")])
            .await
            .unwrap();

        assert_eq!(
            poll_methods(&exchange, &a).await,
            vec![("echo".to_string(), vec![json!(1), json!("two")])]
        );
        let b_methods: Vec<String> = poll_methods(&exchange, &b)
            .await
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(b_methods, vec!["nudge", "receive"]);
    }

    #[tokio::test]
    async fn test_server_initiated_handle_reaches_everyone() {
        let exchange = exchange();
        let a = exchange.negotiate(TransportKind::LongPoll).await;
        let handle = exchange.relay::<Chat>().unwrap();
        assert!(handle.connection_id().is_none());
        assert!(!handle.join("room1").await.unwrap());

        handle.clients().call("announce", vec![json!("up")]).await;
        handle.clients().others("announce", vec![json!("again")]).await;

        assert_eq!(poll_methods(&exchange, &a).await.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_relay_and_method() {
        let exchange = exchange();
        let a = exchange.negotiate(TransportKind::LongPoll).await;

        assert_eq!(
            exchange.resolve("Nope", Some(&a)).unwrap_err(),
            RelayError::UnknownRelay("Nope".into())
        );
        let handle = exchange.resolve("Chat", Some(&a)).unwrap();
        assert_eq!(
            exchange
                .dispatch_server_call(handle.clone(), "Explode", vec![])
                .await,
            Err(RelayError::UnknownMethod {
                relay: "Chat".into(),
                method: "Explode".into()
            })
        );
        assert!(matches!(
            exchange.dispatch_server_call(handle, "Broadcast", vec![]).await,
            Err(RelayError::ArgumentMismatch { expected: 1, got: 0, .. })
        ));
        assert!(poll_methods(&exchange, &a).await.is_empty());
    }

    #[tokio::test]
    async fn test_accept_server_call_runs_in_background() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let definition = RelayBuilder::<Chat>::new("Probe")
            .method("Hit", move |_: Chat, handle: RelayHandle, (): ()| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(handle.connection_id().unwrap_or_default().to_string());
                }
            })
            .finish()
            .unwrap();
        let exchange = Exchange::builder(config())
            .definition(definition)
            .unwrap()
            .build();
        let a = exchange.negotiate(TransportKind::LongPoll).await;

        exchange
            .accept_server_call(&a, Envelope::server_call("Probe", "Hit", vec![], &a))
            .await
            .unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, a);

        assert_eq!(
            exchange
                .accept_server_call("ghost", Envelope::server_call("Probe", "Hit", vec![], "ghost"))
                .await,
            Err(RelayError::UnknownClient("ghost".into()))
        );
    }

    #[tokio::test]
    async fn test_long_poll_requires_long_poll_client() {
        let exchange = exchange();
        let ws = exchange.negotiate(TransportKind::WebSocket).await;
        assert!(matches!(
            exchange.await_long_poll(&ws).await,
            Err(RelayError::TransportMismatch { .. })
        ));
        assert_eq!(
            exchange.await_long_poll("ghost").await,
            Err(RelayError::UnknownClient("ghost".into()))
        );
    }

    #[tokio::test]
    async fn test_disconnect_clears_memberships() {
        let exchange = exchange();
        let a = exchange.negotiate(TransportKind::LongPoll).await;
        let b = exchange.negotiate(TransportKind::LongPoll).await;
        exchange.add_to_group("room1", &a).await.unwrap();
        exchange.add_to_group("room1", &b).await.unwrap();

        exchange.disconnect(&a).await;
        // The long-poll actor handles Close before answering Inspect.
        exchange.long_poll().sessions().await;

        assert!(exchange.lookup_client(&a).await.is_none());
        assert_eq!(exchange.group_members("room1").await, vec![b.clone()]);

        let handle = exchange.resolve("Chat", Some(&b)).unwrap();
        exchange
            .dispatch_server_call(handle, "Broadcast", vec![json!("still here")])
            .await
            .unwrap();
        assert_eq!(poll_methods(&exchange, &b).await.len(), 1);
    }

    #[tokio::test]
    async fn test_client_script_uses_public_url() {
        let exchange = Exchange::builder(ExchangeConfig {
            public_url: Some("https://relay.example.com".into()),
            ..config()
        })
        .relay::<Chat>()
        .unwrap()
        .build();
        let script = exchange.client_script("/relayr").await;
        assert!(script.contains(r#""https://relay.example.com/relayr""#));
        assert!(script.contains(r#""broadcast":"Broadcast""#));
    }
}
