//! Real-time relay exchange.
//!
//! Server code registers *relays*, named groups of methods. Browser clients
//! negotiate a connection (websocket, or long-poll as a fallback), call relay
//! methods by name, and receive calls back on their client-side proxies.
//! Clients are addressed individually, all together, or through named groups.
//!
//! ```no_run
//! use relay_exchange::{Exchange, ExchangeConfig, Relay, RelayBuilder, RelayHandle};
//!
//! #[derive(Default)]
//! struct Chat;
//!
//! impl Relay for Chat {
//!     const NAME: &'static str = "Chat";
//!
//!     fn define(methods: RelayBuilder<Self>) -> RelayBuilder<Self> {
//!         methods.method("Broadcast", |_: Chat, handle: RelayHandle, (text,): (String,)| async move {
//!             handle.clients().all("receive", vec![text.into()]).await;
//!         })
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let exchange = Exchange::builder(ExchangeConfig::default())
//!     .relay::<Chat>()?
//!     .build();
//! let app = axum::Router::new().nest("/relayr", relay_exchange::routes(exchange));
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod exchange;
pub mod groups;
pub mod handlers;
pub mod relay;
pub mod script;
pub mod transport;

pub use config::{ExchangeConfig, FileConfig, load_config};
pub use envelope::{Envelope, Negotiation, NegotiationResponse, TransportKind};
pub use error::RelayError;
pub use exchange::{Exchange, ExchangeBuilder};
pub use groups::{Client, GLOBAL_GROUP, GroupRegistry};
pub use handlers::routes;
pub use relay::{
    ClientOperations, FromArguments, Relay, RelayBuilder, RelayDefinition, RelayHandle,
    RelayRegistry,
};
pub use transport::{LongPollTransport, SocketTransport, Transport};
