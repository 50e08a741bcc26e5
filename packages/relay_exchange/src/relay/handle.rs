//! Relay handles: a relay name bound to the connection that caused the call.

use serde_json::Value;
use tracing::debug;

use crate::error::RelayError;
use crate::exchange::Exchange;
use crate::groups::GLOBAL_GROUP;

/// Passed to every relay method invocation.
///
/// `connection_id` is `None` for handles created by server code via
/// [`Exchange::relay`]; such a handle has no "self" to exclude or address.
#[derive(Clone)]
pub struct RelayHandle {
    name: String,
    connection_id: Option<String>,
    clients: ClientOperations,
}

impl RelayHandle {
    pub(crate) fn new(name: impl Into<String>, connection_id: Option<String>, exchange: Exchange) -> Self {
        let name = name.into();
        Self {
            clients: ClientOperations {
                exchange,
                relay: name.clone(),
                connection_id: connection_id.clone(),
            },
            name,
            connection_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Addressing operations for calling client-side proxies.
    pub fn clients(&self) -> &ClientOperations {
        &self.clients
    }

    /// Add the calling connection to `group`.
    pub async fn join(&self, group: &str) -> Result<bool, RelayError> {
        match &self.connection_id {
            Some(id) => self.clients.exchange.add_to_group(group, id).await,
            None => {
                debug!(relay = %self.name, group, "join ignored for server-initiated handle");
                Ok(false)
            }
        }
    }

    /// Remove the calling connection from `group`. Always `false` for the
    /// Global group.
    pub async fn leave(&self, group: &str) -> bool {
        match &self.connection_id {
            Some(id) => self.clients.exchange.remove_from_group(group, id).await,
            None => false,
        }
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("name", &self.name)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

/// Targets for outbound client calls, each resolving to a set of connections
/// and delivering through whichever transport each connection uses.
///
/// Delivery is fire-and-forget: an absent target is skipped, never an error.
#[derive(Clone)]
pub struct ClientOperations {
    exchange: Exchange,
    relay: String,
    connection_id: Option<String>,
}

impl ClientOperations {
    /// The calling connection, or every client for a server-initiated handle.
    pub async fn call(&self, method: &str, args: Vec<Value>) {
        match &self.connection_id {
            Some(id) => {
                self.exchange
                    .call_client(&self.relay, id, method, args)
                    .await
            }
            None => self.all(method, args).await,
        }
    }

    /// Every client in the Global group.
    pub async fn all(&self, method: &str, args: Vec<Value>) {
        self.exchange
            .call_group(&self.relay, GLOBAL_GROUP, None, method, args)
            .await;
    }

    /// Exactly one client, if it exists.
    pub async fn client(&self, connection_id: &str, method: &str, args: Vec<Value>) {
        self.exchange
            .call_client(&self.relay, connection_id, method, args)
            .await;
    }

    /// Every member of `group`.
    pub async fn group(&self, group: &str, method: &str, args: Vec<Value>) {
        self.exchange
            .call_group(&self.relay, group, None, method, args)
            .await;
    }

    /// Every member of `group` except the caller.
    pub async fn group_except(&self, group: &str, method: &str, args: Vec<Value>) {
        self.exchange
            .call_group(&self.relay, group, self.connection_id.as_deref(), method, args)
            .await;
    }

    /// Every client except the caller.
    pub async fn others(&self, method: &str, args: Vec<Value>) {
        self.group_except(GLOBAL_GROUP, method, args).await;
    }
}
