//! Client-side JavaScript proxy generation.
//!
//! The script exposes `RelayR.<Relay>.server.<method>(...)` for every
//! registered relay and dispatches inbound calls to
//! `RelayR.<Relay>.client.<method>`. Connections try a websocket first and
//! fall back to long-polling.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::relay::RelayRegistry;

/// Post-processing applied to a generated script, e.g. minification.
pub type ScriptTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

const ROUTE_PLACEHOLDER: &str = "__RELAY_ROUTE__";
const TABLE_PLACEHOLDER: &str = "__RELAY_TABLE__";

const CLIENT_TEMPLATE: &str = r#"(function (global) {
  "use strict";

  var route = __RELAY_ROUTE__;
  var relayTable = __RELAY_TABLE__;

  function lowerFirst(name) {
    return name.charAt(0).toLowerCase() + name.slice(1);
  }

  function socketUrl(connectionId) {
    var base;
    if (/^https?:/.test(route)) {
      base = route.replace(/^http/, "ws");
    } else {
      var scheme = global.location.protocol === "https:" ? "wss://" : "ws://";
      base = scheme + global.location.host + route;
    }
    return base + "/ws?connectionId=" + encodeURIComponent(connectionId);
  }

  function postJson(path, body) {
    return fetch(route + path, {
      method: "POST",
      headers: { "Content-Type": "application/json" },
      body: JSON.stringify(body)
    });
  }

  function RelayConnection() {
    this.connectionId = null;
    this.transport = null;
    this.socket = null;
    this.relays = {};
    this.ready = this.start();
  }

  RelayConnection.prototype.start = function () {
    var self = this;
    return self.negotiate("websocket")
      .then(function () { return self.openSocket(); })
      .catch(function () {
        return self.negotiate("longpoll").then(function () { self.poll(); });
      });
  };

  RelayConnection.prototype.negotiate = function (transport) {
    var self = this;
    return postJson("/negotiate", { T: transport })
      .then(function (response) {
        if (!response.ok) { throw new Error("negotiate failed: " + response.status); }
        return response.json();
      })
      .then(function (body) {
        self.connectionId = body.ConnectionID;
        self.transport = transport;
      });
  };

  RelayConnection.prototype.openSocket = function () {
    var self = this;
    return new Promise(function (resolve, reject) {
      if (typeof global.WebSocket === "undefined") {
        reject(new Error("websocket unavailable"));
        return;
      }
      var opened = false;
      var socket = new global.WebSocket(socketUrl(self.connectionId));
      socket.onopen = function () {
        opened = true;
        self.socket = socket;
        resolve();
      };
      socket.onerror = function (err) {
        if (!opened) { reject(err); }
      };
      socket.onmessage = function (event) {
        self.receive(JSON.parse(event.data));
      };
      socket.onclose = function () {
        self.socket = null;
      };
    });
  };

  RelayConnection.prototype.poll = function () {
    var self = this;
    fetch(route + "/longpoll?connectionId=" + encodeURIComponent(self.connectionId))
      .then(function (response) {
        if (!response.ok) { throw new Error("poll failed: " + response.status); }
        return response.json();
      })
      .then(function (batch) {
        batch.forEach(function (message) { self.receive(message); });
        self.poll();
      })
      .catch(function () {
        setTimeout(function () { self.poll(); }, 1000);
      });
  };

  RelayConnection.prototype.receive = function (message) {
    var relay = this.relays[message.R];
    if (!relay) { return; }
    var fn = relay.client[message.M] || relay.client[lowerFirst(message.M)];
    if (typeof fn === "function") {
      fn.apply(relay.client, message.A || []);
    }
  };

  RelayConnection.prototype.call = function (relay, method, args) {
    var self = this;
    return self.ready.then(function () {
      var message = { S: true, R: relay, M: method, A: args, C: self.connectionId };
      if (self.socket) {
        self.socket.send(JSON.stringify(message));
        return;
      }
      return postJson("/call?connectionId=" + encodeURIComponent(self.connectionId), message);
    });
  };

  RelayConnection.prototype.define = function (name, methods) {
    var self = this;
    var relay = { client: {}, server: {} };
    Object.keys(methods).forEach(function (key) {
      relay.server[key] = function () {
        return self.call(name, methods[key], Array.prototype.slice.call(arguments));
      };
    });
    self.relays[name] = relay;
    return relay;
  };

  var connection = new RelayConnection();
  var RelayR = { connection: connection };
  Object.keys(relayTable).forEach(function (name) {
    RelayR[name] = connection.define(name, relayTable[name]);
  });
  global.RelayR = RelayR;
})(this);
"#;

/// `Broadcast` -> `broadcast`.
pub fn lower_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Render the client script for `route`.
pub fn render(route: &str, relays: &RelayRegistry) -> String {
    let mut table = Map::new();
    for (relay, methods) in relays.describe() {
        let methods: Map<String, Value> = methods
            .into_iter()
            .map(|method| (lower_first(&method), Value::String(method)))
            .collect();
        table.insert(relay, Value::Object(methods));
    }

    CLIENT_TEMPLATE
        .replace(ROUTE_PLACEHOLDER, &Value::String(route.to_string()).to_string())
        .replace(TABLE_PLACEHOLDER, &Value::Object(table).to_string())
}

/// Generated scripts, keyed by the route they were generated for.
pub struct ScriptCache {
    enabled: bool,
    transform: Option<ScriptTransform>,
    scripts: Mutex<HashMap<String, Arc<str>>>,
}

impl ScriptCache {
    pub fn new(enabled: bool, transform: Option<ScriptTransform>) -> Self {
        Self {
            enabled,
            transform,
            scripts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_generate(&self, route: &str, relays: &RelayRegistry) -> Arc<str> {
        if self.enabled
            && let Some(script) = self.scripts.lock().await.get(route)
        {
            return script.clone();
        }

        let mut script = render(route, relays);
        if let Some(transform) = &self.transform {
            script = transform(script);
        }
        let script: Arc<str> = script.into();
        debug!(route, bytes = script.len(), "generated client script");

        if self.enabled {
            self.scripts
                .lock()
                .await
                .insert(route.to_string(), script.clone());
        }
        script
    }
}

impl std::fmt::Debug for ScriptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCache")
            .field("enabled", &self.enabled)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayBuilder, RelayHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Chat;

    fn registry() -> RelayRegistry {
        let mut registry = RelayRegistry::new();
        registry
            .register(
                RelayBuilder::<Chat>::new("Chat")
                    .method("Broadcast", |_: Chat, _: RelayHandle, (_t,): (String,)| async {})
                    .method("SendToRoom", |_: Chat, _: RelayHandle, (_r, _t): (String, String)| async {})
                    .finish()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_lower_first() {
        assert_eq!(lower_first("Broadcast"), "broadcast");
        assert_eq!(lower_first("SendToRoom"), "sendToRoom");
        assert_eq!(lower_first("x"), "x");
        assert_eq!(lower_first(""), "");
    }

    #[test]
    fn test_render_lists_relays_and_route() {
        let script = render("/relayr", &registry());
        assert!(script.contains(r#"var route = "/relayr";"#));
        assert!(script.contains(r#""Chat":{"broadcast":"Broadcast","sendToRoom":"SendToRoom"}"#));
        assert!(!script.contains(ROUTE_PLACEHOLDER));
        assert!(!script.contains(TABLE_PLACEHOLDER));
    }

    #[test]
    fn test_render_escapes_route() {
        let script = render(r#"/a"b"#, &RelayRegistry::new());
        assert!(script.contains(r#"var route = "/a\"b";"#));
    }

    #[tokio::test]
    async fn test_cache_reuses_script_per_route() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transform: ScriptTransform = Arc::new(move |script| {
            counter.fetch_add(1, Ordering::SeqCst);
            script.to_uppercase()
        });
        let cache = ScriptCache::new(true, Some(transform));
        let relays = registry();

        let first = cache.get_or_generate("/relayr", &relays).await;
        let second = cache.get_or_generate("/relayr", &relays).await;
        assert!(first.contains("RELAYCONNECTION"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let other = cache.get_or_generate("/elsewhere", &relays).await;
        assert!(other.contains(r#""/ELSEWHERE""#));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_regenerates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transform: ScriptTransform = Arc::new(move |script| {
            counter.fetch_add(1, Ordering::SeqCst);
            script
        });
        let cache = ScriptCache::new(false, Some(transform));
        let relays = registry();
        cache.get_or_generate("/relayr", &relays).await;
        cache.get_or_generate("/relayr", &relays).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
