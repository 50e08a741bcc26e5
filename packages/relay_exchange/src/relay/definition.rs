//! Relay definitions: the per-relay method table built once at registration.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use super::handle::RelayHandle;
use crate::error::RelayError;

/// A server-side relay implementation.
///
/// A fresh `Default` instance is constructed for every invocation, so relay
/// types carry no state between calls. Anything that must outlive a call is
/// reached through the [`RelayHandle`] passed to each method.
///
/// ```
/// use relay_exchange::{Relay, RelayBuilder, RelayHandle};
///
/// #[derive(Default)]
/// struct Chat;
///
/// impl Relay for Chat {
///     const NAME: &'static str = "Chat";
///
///     fn define(methods: RelayBuilder<Self>) -> RelayBuilder<Self> {
///         methods.method("Broadcast", |_chat: Chat, handle: RelayHandle, (text,): (String,)| async move {
///             handle.clients().all("receive", vec![text.into()]).await;
///         })
///     }
/// }
/// ```
pub trait Relay: Default + Send + 'static {
    const NAME: &'static str;

    fn define(methods: RelayBuilder<Self>) -> RelayBuilder<Self>;
}

/// Positional arguments decoded from the envelope's `A` array.
pub trait FromArguments: Sized + Send + 'static {
    /// Exact number of arguments expected, `None` for variadic methods.
    const ARITY: Option<usize>;

    fn from_arguments(args: Vec<Value>) -> Result<Self, serde_json::Error>;
}

impl FromArguments for Vec<Value> {
    const ARITY: Option<usize> = None;

    fn from_arguments(args: Vec<Value>) -> Result<Self, serde_json::Error> {
        Ok(args)
    }
}

macro_rules! impl_from_arguments {
    ($len:expr; $($ty:ident),*) => {
        impl<$($ty),*> FromArguments for ($($ty,)*)
        where
            $($ty: DeserializeOwned + Send + 'static,)*
        {
            const ARITY: Option<usize> = Some($len);

            #[allow(unused_mut, unused_variables)]
            fn from_arguments(args: Vec<Value>) -> Result<Self, serde_json::Error> {
                let mut args = args.into_iter();
                Ok(($(serde_json::from_value::<$ty>(args.next().unwrap_or(Value::Null))?,)*))
            }
        }
    };
}

impl_from_arguments!(0;);
impl_from_arguments!(1; A1);
impl_from_arguments!(2; A1, A2);
impl_from_arguments!(3; A1, A2, A3);
impl_from_arguments!(4; A1, A2, A3, A4);
impl_from_arguments!(5; A1, A2, A3, A4, A5);
impl_from_arguments!(6; A1, A2, A3, A4, A5, A6);

type Invoker = Arc<
    dyn Fn(RelayHandle, Vec<Value>) -> Result<BoxFuture<'static, ()>, serde_json::Error>
        + Send
        + Sync,
>;

/// One invokable method: its expected arity and a type-erased invoker.
#[derive(Clone)]
pub(crate) struct MethodEntry {
    arity: Option<usize>,
    invoke: Invoker,
}

/// Collects the methods of relay `R` before it is registered.
pub struct RelayBuilder<R> {
    name: String,
    methods: BTreeMap<String, MethodEntry>,
    duplicates: Vec<String>,
    _relay: PhantomData<fn() -> R>,
}

impl<R: Default + 'static> RelayBuilder<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
            duplicates: Vec::new(),
            _relay: PhantomData,
        }
    }

    /// Expose `name` as an invokable method.
    ///
    /// The handler receives a fresh relay instance, the handle of the call and
    /// the decoded arguments.
    pub fn method<A, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: FromArguments,
        F: Fn(R, RelayHandle, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let invoke: Invoker = Arc::new(move |handle, args| {
            let args = A::from_arguments(args)?;
            Ok(handler(R::default(), handle, args).boxed())
        });
        let entry = MethodEntry {
            arity: A::ARITY,
            invoke,
        };
        if self.methods.insert(name.to_string(), entry).is_some() {
            self.duplicates.push(name.to_string());
        }
        self
    }

    pub fn finish(self) -> Result<RelayDefinition, RelayError> {
        if let Some(method) = self.duplicates.into_iter().next() {
            return Err(RelayError::DuplicateMethod {
                relay: self.name,
                method,
            });
        }
        Ok(RelayDefinition {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// Immutable record of a registered relay.
#[derive(Clone)]
pub struct RelayDefinition {
    name: String,
    methods: BTreeMap<String, MethodEntry>,
}

impl RelayDefinition {
    /// Build the definition of `R` from its [`Relay::define`] table.
    pub fn of<R: Relay>() -> Result<Self, RelayError> {
        R::define(RelayBuilder::new(R::NAME)).finish()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokable method names, sorted.
    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    /// Validate a call against the method table and bind it to a fresh
    /// relay instance. Nothing runs until the returned future is polled.
    pub(crate) fn invocation(
        &self,
        handle: RelayHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<BoxFuture<'static, ()>, RelayError> {
        let entry = self
            .methods
            .get(method)
            .ok_or_else(|| RelayError::UnknownMethod {
                relay: self.name.clone(),
                method: method.to_string(),
            })?;

        if let Some(expected) = entry.arity
            && expected != args.len()
        {
            return Err(RelayError::ArgumentMismatch {
                relay: self.name.clone(),
                method: method.to_string(),
                expected,
                got: args.len(),
            });
        }

        Ok((entry.invoke)(handle, args)?)
    }
}

impl std::fmt::Debug for RelayDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayDefinition")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .finish()
    }
}
