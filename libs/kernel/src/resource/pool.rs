//! Bounded resource pool with idle reuse and per-lease accounting.
//!
//! The pool keeps at most `max_size` instances alive. Borrowers beyond that
//! wait in arrival order and are handed instances as they are released.
//! Every lent instance is tracked until exactly one terminal call (`release`
//! or `discard`); a second terminal call for the same lease is rejected and
//! counted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use ferrule_id::ResourceId;
use tracing::{debug, error, info, warn};

use super::{present, Consumer, Lease, Resource, ResourcePool, ResourceSource};
use crate::config::KernelConfig;
use crate::error::{Failure, ResourceError};

/// Configuration for a bounded pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum live instances (lent, idle or in production).
    pub max_size: usize,
    /// Maximum idle instances kept for reuse.
    pub max_idle: usize,
    /// Keep released instances on the releasing thread and prefer them for
    /// that thread's next borrow.
    pub thread_affinity: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 16,
            max_idle: 16,
            thread_affinity: false,
        }
    }
}

impl From<&KernelConfig> for PoolConfig {
    fn from(config: &KernelConfig) -> Self {
        Self {
            max_size: config.pool_max_size,
            max_idle: config.pool_max_size,
            thread_affinity: false,
        }
    }
}

/// Pool statistics.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub produced: AtomicU64,
    pub lent: AtomicU64,
    pub reused: AtomicU64,
    pub released: AtomicU64,
    pub discarded: AtomicU64,
    /// Terminal calls for leases the pool no longer tracks.
    pub rejected: AtomicU64,
    pub thread_exits: AtomicU64,
}

/// The stock [`ResourcePool`].
#[derive(Clone)]
pub struct BoundedPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    source: Arc<dyn ResourceSource>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    stats: PoolStats,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Resource>,
    pinned: HashMap<ThreadId, Vec<Resource>>,
    on_loan: HashSet<ResourceId>,
    /// Live instances, including those still in production.
    size: usize,
    waiting: VecDeque<Consumer<Lease>>,
    /// Threads that borrowed and have not been reported as exited.
    touched: HashSet<ThreadId>,
    drained: bool,
    faulted: bool,
}

impl PoolState {
    fn idle_len(&self) -> usize {
        self.idle.len() + self.pinned.values().map(Vec::len).sum::<usize>()
    }

    fn take_idle(&mut self, thread: ThreadId) -> Option<Resource> {
        if let Some(resource) = self.pinned.get_mut(&thread).and_then(Vec::pop) {
            return Some(resource);
        }
        self.idle.pop()
    }
}

enum Action {
    Lend(Consumer<Lease>, Resource),
    Produce(Consumer<Lease>),
    Fail(Consumer<Lease>, ResourceError),
}

impl BoundedPool {
    /// Create a pool over a source.
    pub fn new(source: Arc<dyn ResourceSource>, config: PoolConfig) -> Self {
        let name = source.name().to_string();
        Self {
            inner: Arc::new(PoolInner {
                name,
                source,
                config,
                state: Mutex::new(PoolState::default()),
                stats: PoolStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Live instances (lent, idle or in production).
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Idle instances available for reuse.
    pub fn idle(&self) -> usize {
        self.inner.lock().idle_len()
    }

    /// Instances currently lent out.
    pub fn on_loan(&self) -> usize {
        self.inner.lock().on_loan.len()
    }

    pub fn is_faulted(&self) -> bool {
        self.inner.lock().faulted
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!(pool = %self.name, "Pool state poisoned, marking pool faulted");
                self.state.clear_poison();
                let mut guard = poisoned.into_inner();
                guard.faulted = true;
                guard
            }
        }
    }

    fn borrow(self: &Arc<Self>, consumer: Consumer<Lease>) {
        let thread = thread::current().id();
        let action = {
            let mut state = self.lock();
            if state.drained {
                Action::Fail(consumer, ResourceError::Drained(self.name.clone()))
            } else if state.faulted {
                Action::Fail(consumer, ResourceError::Faulted(self.name.clone()))
            } else {
                state.touched.insert(thread);
                if let Some(resource) = state.take_idle(thread) {
                    state.on_loan.insert(resource.id());
                    self.stats.reused.fetch_add(1, Ordering::Relaxed);
                    Action::Lend(consumer, resource)
                } else if state.size < self.config.max_size {
                    state.size += 1;
                    Action::Produce(consumer)
                } else {
                    debug!(pool = %self.name, waiting = state.waiting.len() + 1, "Borrower queued");
                    state.waiting.push_back(consumer);
                    return;
                }
            }
        };
        self.perform(vec![action]);
    }

    fn perform(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Lend(consumer, resource) => match present(self.source.as_ref(), resource) {
                    Ok(lease) => {
                        self.stats.lent.fetch_add(1, Ordering::Relaxed);
                        consumer.deliver(lease);
                    }
                    Err((resource, error)) => {
                        let next = self.forget(&resource);
                        consumer.fail(error);
                        self.perform(next);
                    }
                },
                Action::Produce(consumer) => self.produce(consumer),
                Action::Fail(consumer, error) => consumer.fail(error),
            }
        }
    }

    /// Drops an instance that could not be lent, freeing its capacity.
    fn forget(&self, resource: &Resource) -> Vec<Action> {
        let mut state = self.lock();
        state.on_loan.remove(&resource.id());
        state.size = state.size.saturating_sub(1);
        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        if state.drained || state.faulted || state.size >= self.config.max_size {
            return Vec::new();
        }
        match state.waiting.pop_front() {
            Some(waiter) => {
                state.size += 1;
                vec![Action::Produce(waiter)]
            }
            None => Vec::new(),
        }
    }

    fn produce(self: &Arc<Self>, consumer: Consumer<Lease>) {
        let inner = self.clone();
        let delivery = Consumer::new(move |result| inner.on_produced(result, consumer));
        let source = self.source.clone();
        // A panicking source drops the delivery consumer, which reports the
        // borrow as abandoned and frees the capacity.
        if panic::catch_unwind(AssertUnwindSafe(|| source.produce(delivery))).is_err() {
            error!(pool = %self.name, "Resource source panicked during production");
        }
    }

    fn on_produced(self: &Arc<Self>, result: Result<Resource, ResourceError>, consumer: Consumer<Lease>) {
        let actions = {
            let mut state = self.lock();
            match result {
                Ok(resource) if state.drained => {
                    state.size = state.size.saturating_sub(1);
                    drop(resource);
                    vec![Action::Fail(consumer, ResourceError::Drained(self.name.clone()))]
                }
                Ok(resource) => {
                    self.stats.produced.fetch_add(1, Ordering::Relaxed);
                    state.on_loan.insert(resource.id());
                    vec![Action::Lend(consumer, resource)]
                }
                Err(error) => {
                    warn!(pool = %self.name, error = %error, "Resource production failed");
                    state.size = state.size.saturating_sub(1);
                    let mut actions = vec![Action::Fail(consumer, error)];
                    if !state.drained && state.size < self.config.max_size {
                        if let Some(waiter) = state.waiting.pop_front() {
                            state.size += 1;
                            actions.push(Action::Produce(waiter));
                        }
                    }
                    actions
                }
            }
        };
        self.perform(actions);
    }

    fn release(self: &Arc<Self>, resource: Resource) {
        let actions = {
            let mut state = self.lock();
            if !state.on_loan.remove(&resource.id()) {
                self.reject(&resource, "release");
                return;
            }
            self.stats.released.fetch_add(1, Ordering::Relaxed);

            if state.drained || state.faulted {
                state.size = state.size.saturating_sub(1);
                Vec::new()
            } else if let Some(waiter) = state.waiting.pop_front() {
                state.on_loan.insert(resource.id());
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                vec![Action::Lend(waiter, resource)]
            } else if state.idle_len() >= self.config.max_idle {
                state.size = state.size.saturating_sub(1);
                Vec::new()
            } else {
                if self.config.thread_affinity {
                    state
                        .pinned
                        .entry(thread::current().id())
                        .or_default()
                        .push(resource);
                } else {
                    state.idle.push(resource);
                }
                Vec::new()
            }
        };
        self.perform(actions);
    }

    fn discard(self: &Arc<Self>, resource: Resource, cause: Option<Failure>) {
        let actions = {
            let mut state = self.lock();
            if !state.on_loan.remove(&resource.id()) {
                self.reject(&resource, "discard");
                return;
            }
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            state.size = state.size.saturating_sub(1);

            match &cause {
                Some(failure) => {
                    warn!(pool = %self.name, resource = %resource.id(), error = %failure, "Discarded resource after failure")
                }
                None => debug!(pool = %self.name, resource = %resource.id(), "Discarded resource"),
            }

            let mut actions = Vec::new();
            if !state.drained && !state.faulted && state.size < self.config.max_size {
                if let Some(waiter) = state.waiting.pop_front() {
                    state.size += 1;
                    actions.push(Action::Produce(waiter));
                }
            }
            actions
        };
        self.perform(actions);
    }

    fn reject(&self, resource: &Resource, call: &'static str) {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(
            pool = %self.name,
            resource = %resource.id(),
            call,
            "Rejected terminal call for a resource not on loan"
        );
    }

    fn drain(self: &Arc<Self>) {
        let actions = {
            let mut state = self.lock();
            if state.drained {
                debug!(pool = %self.name, "Pool already drained");
                return;
            }
            state.drained = true;

            let idle = state.idle_len();
            state.idle.clear();
            state.pinned.clear();
            state.size = state.size.saturating_sub(idle);

            info!(pool = %self.name, idle, on_loan = state.on_loan.len(), "Draining pool");
            state
                .waiting
                .drain(..)
                .map(|waiter| Action::Fail(waiter, ResourceError::Drained(self.name.clone())))
                .collect()
        };
        self.perform(actions);
    }

    fn on_worker_thread_exit(&self, thread: ThreadId) {
        let notify = {
            let mut state = self.lock();
            if let Some(pinned) = state.pinned.remove(&thread) {
                state.size = state.size.saturating_sub(pinned.len());
            }
            state.touched.remove(&thread)
        };
        if !notify {
            return;
        }

        self.stats.thread_exits.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.name, thread = ?thread, "Worker thread exited");
        for listener in self.source.thread_completion_listeners() {
            if panic::catch_unwind(AssertUnwindSafe(|| listener.on_thread_complete(thread))).is_err() {
                error!(pool = %self.name, "Thread completion listener panicked");
            }
        }
    }
}

impl ResourcePool for BoundedPool {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn borrow(&self, consumer: Consumer<Lease>) {
        self.inner.borrow(consumer);
    }

    fn release(&self, resource: Resource) {
        self.inner.release(resource);
    }

    fn discard(&self, resource: Resource, cause: Option<Failure>) {
        self.inner.discard(resource, cause);
    }

    fn drain(&self) {
        self.inner.drain();
    }

    fn on_worker_thread_exit(&self, thread: ThreadId) {
        self.inner.on_worker_thread_exit(thread);
    }
}
