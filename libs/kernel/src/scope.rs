//! Scope containers: per-lifetime tables of bound resource instances.
//!
//! A container holds one slot per resource declared for its scope. Slots are
//! populated on first resolve and released, through the resource's recycle
//! duty and its pool, when the scope ends. The table lock is held only for a
//! single slot lookup or settlement; sourcing happens outside it.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error};

use crate::descriptor::{Dependency, Scope, Value};
use crate::error::{Failure, FailureClass, KernelFailure, ResourceError};
use crate::lock;
use crate::resource::{present, Consumer, Lease, Resource, ResourcePool, ResourceSource};
use crate::slot::{LazySlot, Poll, Settled, SlotState};
use crate::timer::{TimerGuard, TimerHandle};
use crate::wake::{Resume, Wake};

// =============================================================================
// Resource declarations
// =============================================================================

/// Decides, at scope release, whether a pooled instance is reused.
///
/// Always sees the sourced instance, never the adapted one functions saw.
pub trait Recycle: Send + Sync {
    /// `true` releases the instance for reuse, `false` discards it.
    fn recycle(&self, sourced: &Resource) -> bool;
}

struct RecycleFn<F>(F);

impl<F> Recycle for RecycleFn<F>
where
    F: Fn(&Resource) -> bool + Send + Sync,
{
    fn recycle(&self, sourced: &Resource) -> bool {
        (self.0)(sourced)
    }
}

/// Recycle duty from a closure.
pub fn recycle<F>(f: F) -> Arc<dyn Recycle>
where
    F: Fn(&Resource) -> bool + Send + Sync + 'static,
{
    Arc::new(RecycleFn(f))
}

/// Where a resource's instances come from.
#[derive(Clone)]
pub enum Supply {
    Source(Arc<dyn ResourceSource>),
    Pool(Arc<dyn ResourcePool>),
}

/// A managed resource declaration.
#[derive(Clone)]
pub struct ResourceSpec {
    pub(crate) name: String,
    pub(crate) scope: Scope,
    pub(crate) supply: Supply,
    pub(crate) recycle: Option<Arc<dyn Recycle>>,
    pub(crate) timeout: Option<Duration>,
}

impl ResourceSpec {
    /// A resource produced directly by a source.
    pub fn source(name: impl Into<String>, scope: Scope, source: Arc<dyn ResourceSource>) -> Self {
        Self {
            name: name.into(),
            scope,
            supply: Supply::Source(source),
            recycle: None,
            timeout: None,
        }
    }

    /// A resource borrowed from a pool.
    pub fn pooled(name: impl Into<String>, scope: Scope, pool: Arc<dyn ResourcePool>) -> Self {
        Self {
            name: name.into(),
            scope,
            supply: Supply::Pool(pool),
            recycle: None,
            timeout: None,
        }
    }

    pub fn recycle(mut self, recycle: Arc<dyn Recycle>) -> Self {
        self.recycle = Some(recycle);
        self
    }

    /// Fails waiting jobs if the resource is still pending after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    fn resolution_failure(&self, cause: ResourceError) -> Failure {
        Failure::kernel(KernelFailure::Resolution {
            resource: self.name.clone(),
            cause,
        })
    }

    /// Hands back an instance nobody will use.
    fn dispose(&self, lease: Lease) {
        debug!(resource = %self.name, id = %lease.sourced.id(), "Returning unused resource");
        if let Supply::Pool(pool) = &self.supply {
            pool.release(lease.sourced);
        }
    }

    /// End-of-scope administration for a bound instance.
    fn retire(&self, lease: Lease, cause: Option<&Failure>) {
        let keep = match &self.recycle {
            Some(recycle) => {
                let sourced = &lease.sourced;
                panic::catch_unwind(AssertUnwindSafe(|| recycle.recycle(sourced))).unwrap_or_else(|_| {
                    error!(resource = %self.name, "Recycle duty panicked, discarding instance");
                    false
                })
            }
            None => true,
        };

        let Supply::Pool(pool) = &self.supply else {
            return;
        };
        match cause {
            Some(failure) => pool.discard(lease.sourced, Some(failure.clone())),
            None if keep => pool.release(lease.sourced),
            None => pool.discard(lease.sourced, None),
        }
    }
}

impl fmt::Debug for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let supply = match &self.supply {
            Supply::Source(source) => source.name().to_string(),
            Supply::Pool(pool) => format!("pool:{}", pool.name()),
        };
        f.debug_struct("ResourceSpec")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("supply", &supply)
            .field("timeout", &self.timeout)
            .finish()
    }
}

pub(crate) type Layout = Arc<[Arc<ResourceSpec>]>;

// =============================================================================
// Container
// =============================================================================

pub(crate) enum Resolution {
    Ready(Option<Value>),
    /// The wake-up was registered and fires with the value or a failure.
    Pending,
    Failed(Failure),
}

struct Table {
    slots: Vec<LazySlot<Lease>>,
    /// Resource deadline per slot, with the generation it guards.
    timers: HashMap<usize, (u64, TimerGuard)>,
    released: bool,
}

pub(crate) struct ScopeContainer {
    scope: Scope,
    layout: Layout,
    default_timeout: Option<Duration>,
    timer: Option<TimerHandle>,
    table: Mutex<Table>,
}

impl ScopeContainer {
    pub(crate) fn new(
        scope: Scope,
        layout: Layout,
        default_timeout: Option<Duration>,
        timer: Option<TimerHandle>,
    ) -> Arc<Self> {
        let slots = layout.iter().map(|_| LazySlot::default()).collect();
        Arc::new(Self {
            scope,
            layout,
            default_timeout,
            timer,
            table: Mutex::new(Table {
                slots,
                timers: HashMap::new(),
                released: false,
            }),
        })
    }

    pub(crate) fn scope(&self) -> Scope {
        self.scope
    }

    /// Resolves one dependency. The parameter sentinel never touches the
    /// table.
    pub(crate) fn resolve(
        self: &Arc<Self>,
        dependency: Dependency,
        parameter: Option<&Value>,
        make_resume: impl FnOnce() -> Resume,
    ) -> Resolution {
        let slot = match dependency {
            Dependency::Parameter => return Resolution::Ready(parameter.cloned()),
            Dependency::Resource { scope, slot } if scope == self.scope => slot,
            Dependency::Resource { scope, .. } => {
                return Resolution::Failed(Failure::msg(
                    FailureClass::KERNEL,
                    format!("{scope} dependency resolved against the {} scope", self.scope),
                ))
            }
        };
        let Some(spec) = self.layout.get(slot).cloned() else {
            return Resolution::Failed(Failure::msg(
                FailureClass::KERNEL,
                format!("no {} slot {slot}", self.scope),
            ));
        };

        let generation = {
            let mut table = lock(&self.table);
            if table.released {
                return Resolution::Failed(Failure::kernel(KernelFailure::ScopeReleased {
                    resource: spec.name.clone(),
                }));
            }
            match table.slots[slot].poll(make_resume) {
                Poll::Ready(lease) => return Resolution::Ready(Some(lease.presented)),
                Poll::Waiting => return Resolution::Pending,
                Poll::Start(generation) => generation,
            }
        };

        debug!(scope = %self.scope, resource = %spec.name, "Sourcing resource");
        self.start(slot, generation, &spec);
        Resolution::Pending
    }

    fn start(self: &Arc<Self>, slot: usize, generation: u64, spec: &Arc<ResourceSpec>) {
        let container = Arc::downgrade(self);
        let late = spec.clone();
        let deliver = move |result: Result<Lease, ResourceError>| match container.upgrade() {
            Some(container) => container.settle(slot, generation, result.map_err(|e| late.resolution_failure(e))),
            None => {
                if let Ok(lease) = result {
                    late.dispose(lease);
                }
            }
        };

        let sourced = panic::catch_unwind(AssertUnwindSafe(|| match &spec.supply {
            Supply::Source(source) => {
                let adapter = source.clone();
                let consumer = Consumer::new(move |result: Result<Resource, ResourceError>| {
                    deliver(result.and_then(|sourced| present(adapter.as_ref(), sourced).map_err(|(_, e)| e)))
                });
                source.produce(consumer);
            }
            Supply::Pool(pool) => pool.borrow(Consumer::new(deliver)),
        }));
        if sourced.is_err() {
            error!(resource = %spec.name, "Resource supply panicked");
        }

        let Some(timeout) = spec.timeout.or(self.default_timeout) else {
            return;
        };
        let Some(timer) = &self.timer else {
            return;
        };
        let container = Arc::downgrade(self);
        let name = spec.name.clone();
        let guard = timer.schedule(timeout, move || {
            if let Some(container) = container.upgrade() {
                let failure = Failure::kernel(KernelFailure::ResourceTimeout { resource: name, timeout });
                container.settle(slot, generation, Err(failure));
            }
        });

        let mut table = lock(&self.table);
        if !table.released && table.slots[slot].generation() == Some(generation) {
            table.timers.insert(slot, (generation, guard));
        }
    }

    fn settle(&self, slot: usize, generation: u64, result: Result<Lease, Failure>) {
        let spec = &self.layout[slot];
        let (settled, _timer) = {
            let mut table = lock(&self.table);
            let timer = match table.timers.get(&slot) {
                Some((guarded, _)) if *guarded == generation => table.timers.remove(&slot),
                _ => None,
            };
            if table.released {
                (Settled::Stale(result), timer)
            } else {
                (table.slots[slot].settle(generation, result), timer)
            }
        };

        match settled {
            Settled::Accepted { waiters, outcome } => {
                if let Err(failure) = &outcome {
                    debug!(resource = %spec.name, error = %failure, "Resource resolution failed");
                }
                let wake: Wake = outcome.map(|lease| Some(lease.presented));
                for waiter in waiters {
                    waiter.fire(wake.clone());
                }
            }
            Settled::Stale(Ok(lease)) => spec.dispose(lease),
            Settled::Stale(Err(_)) => {}
        }
    }

    /// Ends the scope: pending waiters fail, bound instances are retired.
    /// `cause` is the failure that ended the scope, if any.
    pub(crate) fn release(&self, cause: Option<&Failure>) {
        let (slots, timers) = {
            let mut table = lock(&self.table);
            if table.released {
                return;
            }
            table.released = true;
            (mem::take(&mut table.slots), mem::take(&mut table.timers))
        };
        drop(timers);

        let mut retired = 0usize;
        for (index, mut slot) in slots.into_iter().enumerate() {
            let spec = &self.layout[index];
            match slot.reset() {
                SlotState::Ready(lease) => {
                    spec.retire(lease, cause);
                    retired += 1;
                }
                SlotState::Pending { waiters, .. } => {
                    let failure = Failure::kernel(KernelFailure::ScopeReleased {
                        resource: spec.name.clone(),
                    });
                    for waiter in waiters {
                        waiter.fire(Err(failure.clone()));
                    }
                }
                SlotState::Empty => {}
            }
        }
        if retired > 0 {
            debug!(scope = %self.scope, retired, "Released scope");
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        lock(&self.table).released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{BoundedPool, FnSource, PoolConfig};
    use crate::timer::Timer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    /// A source that holds consumers until told to deliver.
    #[derive(Default)]
    struct ManualSource {
        pending: Mutex<Vec<Consumer<Resource>>>,
        produced: AtomicUsize,
    }

    impl ManualSource {
        fn deliver_all(&self, value: u32) {
            let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
            for consumer in pending {
                consumer.deliver(Resource::new(value));
            }
        }
    }

    impl ManualSource {
        fn take_oldest(&self) -> Consumer<Resource> {
            self.pending.lock().unwrap().remove(0)
        }
    }

    impl ResourceSource for ManualSource {
        fn name(&self) -> &str {
            "manual"
        }

        fn produce(&self, consumer: Consumer<Resource>) {
            self.produced.fetch_add(1, Ordering::SeqCst);
            self.pending.lock().unwrap().push(consumer);
        }
    }

    fn container(specs: Vec<ResourceSpec>, timer: Option<TimerHandle>) -> Arc<ScopeContainer> {
        let layout: Layout = specs.into_iter().map(Arc::new).collect();
        ScopeContainer::new(Scope::Request, layout, None, timer)
    }

    fn slot(index: usize) -> Dependency {
        Dependency::Resource {
            scope: Scope::Request,
            slot: index,
        }
    }

    fn channel_resume(tx: &mpsc::Sender<Wake>) -> impl FnOnce() -> Resume {
        let tx = tx.clone();
        move || {
            Resume::new("test", move |wake| {
                let _ = tx.send(wake);
            })
        }
    }

    #[test]
    fn test_parameter_sentinel_skips_table() {
        let scope = container(Vec::new(), None);
        scope.release(None);

        let parameter: Value = Arc::new("P");
        match scope.resolve(Dependency::Parameter, Some(&parameter), || unreachable!()) {
            Resolution::Ready(Some(value)) => assert!(Arc::ptr_eq(&value, &parameter)),
            _ => panic!("parameter should resolve immediately"),
        }
    }

    #[test]
    fn test_populated_slot_is_not_sourced_again() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = produced.clone();
        let source = FnSource::new("db", move || Ok(counter.fetch_add(1, Ordering::SeqCst)));
        let scope = container(vec![ResourceSpec::source("db", Scope::Request, Arc::new(source))], None);

        let (tx, rx) = mpsc::channel();
        assert!(matches!(scope.resolve(slot(0), None, channel_resume(&tx)), Resolution::Pending));
        let first = rx.try_recv().unwrap().unwrap().unwrap();

        for _ in 0..3 {
            match scope.resolve(slot(0), None, || unreachable!()) {
                Resolution::Ready(Some(value)) => assert!(Arc::ptr_eq(&value, &first)),
                _ => panic!("slot should be populated"),
            }
        }
        assert_eq!(produced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_async_resource_wakes_every_waiter() {
        let source = Arc::new(ManualSource::default());
        let scope = container(vec![ResourceSpec::source("slow", Scope::Request, source.clone())], None);

        let (tx, rx) = mpsc::channel();
        assert!(matches!(scope.resolve(slot(0), None, channel_resume(&tx)), Resolution::Pending));
        assert!(matches!(scope.resolve(slot(0), None, channel_resume(&tx)), Resolution::Pending));
        assert!(rx.try_recv().is_err());

        source.deliver_all(9);
        for _ in 0..2 {
            let value = rx.try_recv().unwrap().unwrap().unwrap();
            assert_eq!(value.downcast_ref::<u32>(), Some(&9));
        }
        assert_eq!(source.produced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_runs_recycle_on_sourced_instance() {
        let source = FnSource::new("conn", || Ok(1u8));
        let pool = Arc::new(BoundedPool::new(Arc::new(source), PoolConfig::default()));
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        let spec = ResourceSpec::pooled("conn", Scope::Request, pool.clone()).recycle(recycle(move |sourced| {
            *sink.lock().unwrap() = Some(sourced.id());
            false
        }));
        let scope = container(vec![spec], None);

        let (tx, rx) = mpsc::channel();
        scope.resolve(slot(0), None, channel_resume(&tx));
        rx.try_recv().unwrap().unwrap();
        scope.release(None);

        assert!(observed.lock().unwrap().is_some());
        assert_eq!(pool.stats().discarded.load(Ordering::Relaxed), 1);
        assert_eq!(pool.stats().released.load(Ordering::Relaxed), 0);
        assert_eq!(pool.on_loan(), 0);
    }

    #[test]
    fn test_release_with_cause_discards() {
        let pool = Arc::new(BoundedPool::new(
            Arc::new(FnSource::new("conn", || Ok(1u8))),
            PoolConfig::default(),
        ));
        let scope = container(vec![ResourceSpec::pooled("conn", Scope::Request, pool.clone())], None);

        let (tx, rx) = mpsc::channel();
        scope.resolve(slot(0), None, channel_resume(&tx));
        rx.try_recv().unwrap().unwrap();
        scope.release(Some(&Failure::msg(FailureClass::APPLICATION, "failed")));
        scope.release(None);

        assert_eq!(pool.stats().discarded.load(Ordering::Relaxed), 1);
        assert_eq!(pool.stats().rejected.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_release_fails_pending_and_returns_late_delivery() {
        let source = Arc::new(ManualSource::default());
        let pool = Arc::new(BoundedPool::new(source.clone(), PoolConfig::default()));
        let scope = container(vec![ResourceSpec::pooled("slow", Scope::Request, pool.clone())], None);

        let (tx, rx) = mpsc::channel();
        scope.resolve(slot(0), None, channel_resume(&tx));
        scope.release(None);

        let failure = rx.try_recv().unwrap().unwrap_err();
        assert!(matches!(
            failure.kernel_failure(),
            Some(KernelFailure::ScopeReleased { .. })
        ));

        source.deliver_all(1);
        assert_eq!(pool.stats().released.load(Ordering::Relaxed), 1);
        assert_eq!(pool.on_loan(), 0);
        assert!(matches!(
            scope.resolve(slot(0), None, || unreachable!()),
            Resolution::Failed(_)
        ));
    }

    #[test]
    fn test_pending_resource_times_out() {
        let timer = Timer::start().unwrap();
        let source = Arc::new(ManualSource::default());
        let spec = ResourceSpec::source("slow", Scope::Request, source.clone()).timeout(Duration::from_millis(20));
        let scope = container(vec![spec], Some(timer.handle()));

        let (tx, rx) = mpsc::channel();
        scope.resolve(slot(0), None, channel_resume(&tx));
        let failure = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_err();
        assert_eq!(failure.class(), FailureClass::RESOLUTION);
        assert!(matches!(
            failure.kernel_failure(),
            Some(KernelFailure::ResourceTimeout { .. })
        ));

        // The late instance is dropped and the next resolve starts over.
        source.deliver_all(1);
        scope.resolve(slot(0), None, channel_resume(&tx));
        assert_eq!(source.produced.load(Ordering::SeqCst), 2);
        timer.stop();
    }

    #[test]
    fn test_late_delivery_keeps_current_deadline() {
        let timer = Timer::start().unwrap();
        let source = Arc::new(ManualSource::default());
        let spec = ResourceSpec::source("slow", Scope::Request, source.clone()).timeout(Duration::from_millis(50));
        let scope = container(vec![spec], Some(timer.handle()));

        let (tx, rx) = mpsc::channel();
        scope.resolve(slot(0), None, channel_resume(&tx));
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap().is_err());
        let stale = source.take_oldest();

        // The second attempt is pending when the first one's instance shows up.
        scope.resolve(slot(0), None, channel_resume(&tx));
        stale.deliver(Resource::new(1u32));

        let failure = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap_err();
        assert!(matches!(
            failure.kernel_failure(),
            Some(KernelFailure::ResourceTimeout { .. })
        ));
        assert_eq!(source.produced.load(Ordering::SeqCst), 2);
        timer.stop();
    }

    /// Wraps every instance; panics instead when `fail` is set.
    struct WrappingSource {
        fail: bool,
    }

    #[derive(Debug)]
    struct Wrapped(u32);

    impl ResourceSource for WrappingSource {
        fn name(&self) -> &str {
            "wrapping"
        }

        fn produce(&self, consumer: Consumer<Resource>) {
            consumer.deliver(Resource::new(7u32));
        }

        fn adapt(&self, sourced: &Resource) -> Value {
            if self.fail {
                panic!("cannot wrap");
            }
            Arc::new(Wrapped(*sourced.downcast_ref::<u32>().unwrap()))
        }
    }

    #[test]
    fn test_source_adaptation_presented_to_resolver() {
        let scope = container(
            vec![ResourceSpec::source("wrapped", Scope::Request, Arc::new(WrappingSource { fail: false }))],
            None,
        );

        let (tx, rx) = mpsc::channel();
        scope.resolve(slot(0), None, channel_resume(&tx));
        let value = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(value.downcast_ref::<Wrapped>().map(|w| w.0), Some(7));
    }

    #[test]
    fn test_panicking_adaptation_fails_resolution() {
        let scope = container(
            vec![ResourceSpec::source("wrapped", Scope::Request, Arc::new(WrappingSource { fail: true }))],
            None,
        );

        let (tx, rx) = mpsc::channel();
        scope.resolve(slot(0), None, channel_resume(&tx));
        let failure = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(failure.class(), FailureClass::RESOLUTION);
        assert!(matches!(
            failure.kernel_failure(),
            Some(KernelFailure::Resolution {
                cause: ResourceError::Adaptation(_),
                ..
            })
        ));
    }
}
