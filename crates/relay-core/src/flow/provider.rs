//! Provider - where a pipeline stage instance comes from.

use std::sync::Arc;

/// A pipeline stage is either one instance shared by every worker, or a
/// factory called once per message.
///
/// Shared instances are invoked concurrently and must not rely on interior
/// state being private to one message. Factory-made instances are only ever
/// seen by the message they were made for.
pub enum Provider<T: ?Sized> {
    Shared(Arc<T>),
    Factory(Arc<dyn Fn() -> Box<T> + Send + Sync>),
}

impl<T: ?Sized> Provider<T> {
    pub fn shared(instance: Arc<T>) -> Self {
        Provider::Shared(instance)
    }

    pub fn factory(factory: impl Fn() -> Box<T> + Send + Sync + 'static) -> Self {
        Provider::Factory(Arc::new(factory))
    }

    /// The instance to use for the next message.
    pub fn get(&self) -> Arc<T> {
        match self {
            Provider::Shared(instance) => Arc::clone(instance),
            Provider::Factory(factory) => Arc::from(factory()),
        }
    }

    pub fn is_factory(&self) -> bool {
        matches!(self, Provider::Factory(_))
    }
}

impl<T: ?Sized> Clone for Provider<T> {
    fn clone(&self) -> Self {
        match self {
            Provider::Shared(instance) => Provider::Shared(Arc::clone(instance)),
            Provider::Factory(factory) => Provider::Factory(Arc::clone(factory)),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for Provider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Shared(_) => f.write_str("Provider::Shared"),
            Provider::Factory(_) => f.write_str("Provider::Factory"),
        }
    }
}
