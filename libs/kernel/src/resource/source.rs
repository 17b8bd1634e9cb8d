//! Resource sources.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::ThreadId;

use tracing::error;

use super::{Consumer, Lease, Resource};
use crate::descriptor::Value;
use crate::error::ResourceError;

/// Produces resource instances.
pub trait ResourceSource: Send + Sync {
    /// Source name for logging and errors.
    fn name(&self) -> &str;

    /// Produces one instance, delivering it to `consumer` now or later.
    fn produce(&self, consumer: Consumer<Resource>);

    /// The value functions see for a sourced instance. Recycling always
    /// observes the sourced instance, never this one.
    fn adapt(&self, sourced: &Resource) -> Value {
        sourced.object().clone()
    }

    /// Listeners told when a worker thread that used this source exits.
    fn thread_completion_listeners(&self) -> Vec<Arc<dyn ThreadCompletionListener>> {
        Vec::new()
    }
}

/// Pairs a sourced instance with its adapted value. A panicking `adapt`
/// hands the instance back as the error.
pub(crate) fn present(source: &dyn ResourceSource, sourced: Resource) -> Result<Lease, (Resource, ResourceError)> {
    match panic::catch_unwind(AssertUnwindSafe(|| source.adapt(&sourced))) {
        Ok(presented) => Ok(Lease { sourced, presented }),
        Err(_) => {
            error!(source = %source.name(), resource = %sourced.id(), "Resource adaptation panicked");
            Err((sourced, ResourceError::Adaptation(source.name().to_string())))
        }
    }
}

/// Notified once per worker thread that touched a pool, as it terminates.
pub trait ThreadCompletionListener: Send + Sync {
    fn on_thread_complete(&self, thread: ThreadId);
}

impl<F> ThreadCompletionListener for F
where
    F: Fn(ThreadId) + Send + Sync,
{
    fn on_thread_complete(&self, thread: ThreadId) {
        self(thread)
    }
}

/// A source that produces synchronously from a closure.
pub struct FnSource<F> {
    name: String,
    produce: F,
    listeners: Vec<Arc<dyn ThreadCompletionListener>>,
}

impl<F, T> FnSource<F>
where
    F: Fn() -> anyhow::Result<T> + Send + Sync,
    T: Any + Send + Sync,
{
    pub fn new(name: impl Into<String>, produce: F) -> Self {
        Self {
            name: name.into(),
            produce,
            listeners: Vec::new(),
        }
    }

    /// Adds a thread-completion listener.
    pub fn with_listener(mut self, listener: Arc<dyn ThreadCompletionListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl<F, T> ResourceSource for FnSource<F>
where
    F: Fn() -> anyhow::Result<T> + Send + Sync,
    T: Any + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&self, consumer: Consumer<Resource>) {
        match (self.produce)() {
            Ok(object) => consumer.deliver(Resource::new(object)),
            Err(e) => consumer.fail(ResourceError::production(&self.name, format!("{e:#}"))),
        }
    }

    fn thread_completion_listeners(&self) -> Vec<Arc<dyn ThreadCompletionListener>> {
        self.listeners.clone()
    }
}
