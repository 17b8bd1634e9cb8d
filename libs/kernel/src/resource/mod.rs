//! Managed resources: sources, pools and the values they hand out.
//!
//! A [`ResourceSource`] produces instances; a [`ResourcePool`] lends them
//! out and takes them back. Both answer through a single-fire [`Consumer`]
//! so production can complete on any thread, at any time.

mod pool;
mod source;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use ferrule_id::ResourceId;

use crate::descriptor::Value;
use crate::error::{Failure, ResourceError};

pub use pool::{BoundedPool, PoolConfig, PoolStats};
pub use source::{FnSource, ResourceSource, ThreadCompletionListener};
pub(crate) use source::present;

/// A sourced resource instance and its identity.
///
/// Cloning shares the instance; the id stays the same for its whole life,
/// which is what pools account leases by.
#[derive(Clone)]
pub struct Resource {
    id: ResourceId,
    object: Value,
}

impl Resource {
    /// Wraps a freshly produced instance under a new id.
    pub fn new<T: Any + Send + Sync>(object: T) -> Self {
        Self::from_value(Arc::new(object))
    }

    /// Wraps an already shared instance under a new id.
    pub fn from_value(object: Value) -> Self {
        Self {
            id: ResourceId::new(),
            object,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn object(&self) -> &Value {
        &self.object
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.object.downcast_ref::<T>()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource").field("id", &self.id).finish()
    }
}

/// What a borrower receives from a pool: the sourced instance, which is
/// what must be handed back, and the value presented to functions.
#[derive(Clone)]
pub struct Lease {
    pub sourced: Resource,
    pub presented: Value,
}

impl Lease {
    /// A lease presenting the sourced instance itself.
    pub fn plain(sourced: Resource) -> Self {
        let presented = sourced.object().clone();
        Self { sourced, presented }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("sourced", &self.sourced)
            .finish_non_exhaustive()
    }
}

type Delivery<T> = Box<dyn FnOnce(Result<T, ResourceError>) + Send>;

/// Receives the result of a production or borrow exactly once.
///
/// Dropping a consumer without delivering reports
/// [`ResourceError::Abandoned`] to whoever is waiting on it.
pub struct Consumer<T: Send + 'static> {
    target: Option<Delivery<T>>,
}

impl<T: Send + 'static> Consumer<T> {
    pub fn new<F>(target: F) -> Self
    where
        F: FnOnce(Result<T, ResourceError>) + Send + 'static,
    {
        Self {
            target: Some(Box::new(target)),
        }
    }

    pub fn deliver(mut self, value: T) {
        if let Some(target) = self.target.take() {
            target(Ok(value));
        }
    }

    pub fn fail(mut self, error: ResourceError) {
        if let Some(target) = self.target.take() {
            target(Err(error));
        }
    }

    pub fn settle(self, result: Result<T, ResourceError>) {
        match result {
            Ok(value) => self.deliver(value),
            Err(error) => self.fail(error),
        }
    }

    /// Maps delivered values before they reach this consumer.
    pub fn map<U, F>(self, f: F) -> Consumer<U>
    where
        U: Send + 'static,
        F: FnOnce(U) -> T + Send + 'static,
    {
        Consumer::new(move |result: Result<U, ResourceError>| self.settle(result.map(f)))
    }
}

impl<T: Send + 'static> Drop for Consumer<T> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            target(Err(ResourceError::Abandoned));
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("pending", &self.target.is_some())
            .finish()
    }
}

/// A shared pool of managed resources.
///
/// Every operation may be called from any thread. `release` and `discard`
/// never fail towards the caller; pool-internal errors are logged and
/// absorbed.
pub trait ResourcePool: Send + Sync {
    /// Pool name for logging.
    fn name(&self) -> &str;

    /// Lends a resource to `consumer`, now or later.
    fn borrow(&self, consumer: Consumer<Lease>);

    /// Takes back a resource for reuse.
    fn release(&self, resource: Resource);

    /// Takes back a resource that must not be reused. `cause` is `None`
    /// when the borrower simply chose not to reuse it.
    fn discard(&self, resource: Resource, cause: Option<Failure>);

    /// Shuts the pool down; later borrows fail.
    fn drain(&self);

    /// Called once per worker thread as it terminates.
    fn on_worker_thread_exit(&self, _thread: ThreadId) {}
}
