//! Requests: the process boundary.
//!
//! A request owns the request scope and its governance table, and counts
//! its live flows. When the last flow terminates the request ends:
//! deferred governance is deactivated, the request scope is released and
//! the outcome is published to the [`ProcessHandle`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ferrule_id::RequestId;
use tracing::{debug, error};

use crate::descriptor::Scope;
use crate::error::Failure;
use crate::governance::GovernanceTable;
use crate::kernel::KernelShared;
use crate::lock;
use crate::scope::ScopeContainer;

/// How a request ended.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub request: RequestId,
    /// The first failure that reached the process boundary unhandled.
    pub failure: Option<Failure>,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Default)]
struct Latch {
    outcome: Mutex<Option<ProcessOutcome>>,
    ready: Condvar,
}

impl Latch {
    fn set(&self, outcome: ProcessOutcome) {
        *lock(&self.outcome) = Some(outcome);
        self.ready.notify_all();
    }
}

/// Waits for a request to end.
#[derive(Clone)]
pub struct ProcessHandle {
    request: RequestId,
    latch: Arc<Latch>,
}

impl ProcessHandle {
    pub fn request_id(&self) -> RequestId {
        self.request
    }

    /// The outcome if the request already ended.
    pub fn try_outcome(&self) -> Option<ProcessOutcome> {
        lock(&self.latch.outcome).clone()
    }

    /// Blocks the calling thread until the request ends or `timeout`
    /// elapses. Meant for embedders and tests, never for kernel threads.
    pub fn wait(&self, timeout: Duration) -> Option<ProcessOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = lock(&self.latch.outcome);
        loop {
            if let Some(done) = outcome.as_ref() {
                return Some(done.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            outcome = match self.latch.ready.wait_timeout(outcome, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("request", &self.request)
            .field("complete", &self.try_outcome().is_some())
            .finish()
    }
}

pub(crate) struct Request {
    id: RequestId,
    kernel: Arc<KernelShared>,
    scope: Arc<ScopeContainer>,
    governance: Arc<GovernanceTable>,
    active_flows: AtomicUsize,
    completed: AtomicBool,
    failure: Mutex<Option<Failure>>,
    latch: Arc<Latch>,
}

impl Request {
    pub(crate) fn open(kernel: &Arc<KernelShared>) -> Arc<Self> {
        let id = RequestId::new();
        let request = Arc::new(Self {
            id,
            kernel: kernel.clone(),
            scope: kernel.scope_container(Scope::Request),
            governance: GovernanceTable::new(id, kernel.governance_units()),
            active_flows: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
            failure: Mutex::new(None),
            latch: Arc::new(Latch::default()),
        });
        debug!(request_id = %id, "Request opened");
        request
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn kernel(&self) -> &Arc<KernelShared> {
        &self.kernel
    }

    pub(crate) fn scope(&self) -> &Arc<ScopeContainer> {
        &self.scope
    }

    pub(crate) fn governance(&self) -> &Arc<GovernanceTable> {
        &self.governance
    }

    pub(crate) fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            request: self.id,
            latch: self.latch.clone(),
        }
    }

    pub(crate) fn flow_started(&self) {
        self.active_flows.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn flow_finished(&self) {
        if self.active_flows.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete();
        }
    }

    /// A failure reached the process boundary with no handler.
    pub(crate) fn unhandled(&self, failure: Failure) {
        error!(
            request_id = %self.id,
            class = %self.kernel.classes().name(failure.class()),
            error = %failure,
            "Unhandled failure reached the process boundary"
        );
        self.kernel.report_unhandled(self.id, &failure);
        let mut first = lock(&self.failure);
        if first.is_none() {
            *first = Some(failure);
        }
    }

    fn complete(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut failure = lock(&self.failure).clone();
        if let Some(enforcement) = self.governance.finish(failure.is_none()) {
            self.unhandled(enforcement.clone());
            failure = Some(enforcement);
        }
        self.scope.release(failure.as_ref());

        debug!(request_id = %self.id, success = failure.is_none(), "Request completed");
        self.latch.set(ProcessOutcome {
            request: self.id,
            failure,
        });
    }
}
