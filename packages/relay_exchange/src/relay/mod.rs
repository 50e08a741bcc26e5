//! Server-side relays and the handles their methods receive.

pub mod definition;
pub mod handle;
pub mod registry;

pub use definition::{FromArguments, Relay, RelayBuilder, RelayDefinition};
pub use handle::{ClientOperations, RelayHandle};
pub use registry::RelayRegistry;
