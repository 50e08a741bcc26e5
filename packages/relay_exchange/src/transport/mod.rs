//! Delivery of client-bound calls.
//!
//! Each transport owns its connection table behind a single event loop; the
//! exchange talks to it only through commands, so no connection map is ever
//! shared between tasks.

pub mod long_poll;
pub mod socket;

use serde_json::Value;

use crate::envelope::{Envelope, TransportKind};
use crate::relay::RelayHandle;

pub use long_poll::{LongPollTransport, PollState};
pub use socket::{SocketState, SocketTransport};

/// A transport capable of invoking a method on a client-side proxy.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Deliver `method(args)` to the connection the handle is bound to.
    ///
    /// Fire-and-forget: an unknown or already closed connection is a silent
    /// miss.
    fn call_client_function(&self, handle: &RelayHandle, method: &str, args: &[Value]);
}

/// The outbound envelope for `handle.method(args)`, or `None` when the handle
/// is not bound to a connection.
fn outbound_envelope(handle: &RelayHandle, method: &str, args: &[Value]) -> Option<(String, Envelope)> {
    let connection_id = handle.connection_id()?.to_string();
    let envelope = Envelope::client_call(handle.name(), method, args.to_vec(), connection_id.clone());
    Some((connection_id, envelope))
}
