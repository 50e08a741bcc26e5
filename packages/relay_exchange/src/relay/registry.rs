use serde_json::Value;
use tracing::info;

use super::definition::RelayDefinition;
use super::handle::RelayHandle;
use crate::error::RelayError;

/// All registered relays, in registration order.
#[derive(Debug, Default, Clone)]
pub struct RelayRegistry {
    relays: Vec<RelayDefinition>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a relay. Names are unique.
    pub fn register(&mut self, definition: RelayDefinition) -> Result<(), RelayError> {
        if self.get(definition.name()).is_some() {
            return Err(RelayError::DuplicateRelay(definition.name().to_string()));
        }
        info!(
            relay = definition.name(),
            methods = ?definition.method_names(),
            "relay registered"
        );
        self.relays.push(definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RelayDefinition> {
        self.relays.iter().find(|def| def.name() == name)
    }

    pub fn require(&self, name: &str) -> Result<&RelayDefinition, RelayError> {
        self.get(name)
            .ok_or_else(|| RelayError::UnknownRelay(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelayDefinition> {
        self.relays.iter()
    }

    /// `(relay name, method names)` in registration order.
    pub fn describe(&self) -> Vec<(String, Vec<String>)> {
        self.relays
            .iter()
            .map(|def| (def.name().to_string(), def.method_names()))
            .collect()
    }

    /// Invoke `method` on a fresh instance of the relay the handle names,
    /// with the handle first and `args` following in order.
    ///
    /// Only names declared at registration are invokable.
    pub async fn dispatch(
        &self,
        handle: RelayHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), RelayError> {
        let invocation = self
            .require(handle.name())?
            .invocation(handle, method, args)?;
        invocation.await;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}
