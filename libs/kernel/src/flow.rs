//! Flows, continuations and joins.
//!
//! A flow is one instigated chain of jobs. It terminates once when its
//! chain (including any escalation handlers) terminates, notifying joiners,
//! then its callback or parent, then the request that counts its flows.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferrule_id::FlowId;
use tracing::{debug, warn};

use crate::descriptor::Value;
use crate::error::{Failure, KernelFailure};
use crate::lock;
use crate::request::Request;
use crate::timer::{TimerGuard, TimerHandle};
use crate::wake::Resume;

/// How a flow terminated.
#[derive(Debug, Clone)]
pub enum FlowOutcome {
    Completed,
    /// The failure no escalation procedure along the flow handled.
    Failed(Failure),
}

impl FlowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Completed => None,
            Self::Failed(failure) => Some(failure),
        }
    }
}

/// Invoked exactly once with an instigated flow's outcome.
pub type FlowCallback = Box<dyn FnOnce(FlowOutcome) + Send>;

type Watcher = Box<dyn FnOnce(&FlowOutcome) + Send>;

/// Who learns about a flow's termination besides its watchers.
pub(crate) enum FlowParent {
    /// Started at the kernel boundary.
    Root,
    /// Started by a job with parallel strategy.
    Parallel,
    /// Runs an escalation handler; its outcome becomes the outcome of the
    /// chain whose failure it handles.
    Escalation(Continuation),
}

struct FlowState {
    outcome: Option<FlowOutcome>,
    callback: Option<FlowCallback>,
    watchers: Vec<Watcher>,
    parent: Option<FlowParent>,
}

pub(crate) struct Flow {
    id: FlowId,
    request: Arc<Request>,
    state: Mutex<FlowState>,
}

impl Flow {
    pub(crate) fn open(request: &Arc<Request>, parent: FlowParent, callback: Option<FlowCallback>) -> Arc<Self> {
        request.flow_started();
        let flow = Arc::new(Self {
            id: FlowId::new(),
            request: request.clone(),
            state: Mutex::new(FlowState {
                outcome: None,
                callback,
                watchers: Vec::new(),
                parent: Some(parent),
            }),
        });
        debug!(flow_id = %flow.id, request_id = %request.id(), "Flow opened");
        flow
    }

    pub(crate) fn id(&self) -> FlowId {
        self.id
    }

    pub(crate) fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub(crate) fn outcome(&self) -> Option<FlowOutcome> {
        lock(&self.state).outcome.clone()
    }

    /// Registers a watcher, or hands back the outcome if already terminated.
    pub(crate) fn watch(&self, watcher: Watcher) -> Result<(), FlowOutcome> {
        let mut state = lock(&self.state);
        match &state.outcome {
            Some(outcome) => Err(outcome.clone()),
            None => {
                state.watchers.push(watcher);
                Ok(())
            }
        }
    }

    pub(crate) fn finish(&self, outcome: FlowOutcome) {
        let (watchers, callback, parent) = {
            let mut state = lock(&self.state);
            if state.outcome.is_some() {
                warn!(flow_id = %self.id, "Flow finished twice, ignoring");
                return;
            }
            state.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut state.watchers),
                state.callback.take(),
                state.parent.take(),
            )
        };
        debug!(flow_id = %self.id, success = outcome.is_success(), "Flow finished");

        for watcher in watchers {
            watcher(&outcome);
        }

        match (parent, callback) {
            (Some(FlowParent::Escalation(continuation)), _) => continuation.finish(outcome),
            (_, Some(callback)) => {
                if panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
                    warn!(flow_id = %self.id, "Flow callback panicked");
                }
            }
            (_, None) => {
                if let FlowOutcome::Failed(failure) = outcome {
                    self.request.unhandled(failure);
                }
            }
        }

        self.request.flow_finished();
    }
}

/// Handle to a parallel flow, used to join it.
#[derive(Clone)]
pub struct FlowHandle {
    flow: Arc<Flow>,
}

impl FlowHandle {
    pub(crate) fn new(flow: Arc<Flow>) -> Self {
        Self { flow }
    }

    pub(crate) fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    pub fn id(&self) -> FlowId {
        self.flow.id
    }

    /// The outcome, once the flow terminated.
    pub fn outcome(&self) -> Option<FlowOutcome> {
        self.flow.outcome()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome().is_some()
    }
}

impl fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowHandle").field("id", &self.flow.id).finish()
    }
}

// =============================================================================
// Continuations
// =============================================================================

/// What a chain of jobs reports to when it terminates. Handed from each job
/// to the next in sequence, so exactly one job holds it at a time.
pub(crate) enum Continuation {
    /// The chain is the body of a flow.
    Flow(Arc<Flow>),
    /// The chain was instigated sequentially by a waiting job.
    Caller(CallerLink),
}

pub(crate) struct CallerLink {
    pub(crate) resume: Resume,
    pub(crate) callback: Option<FlowCallback>,
}

impl Continuation {
    pub(crate) fn finish(self, outcome: FlowOutcome) {
        match self {
            Self::Flow(flow) => flow.finish(outcome),
            Self::Caller(CallerLink { resume, callback }) => match callback {
                // A callback receives the outcome; the caller carries on.
                Some(callback) => match panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))) {
                    Ok(()) => resume.fire(Ok(None)),
                    Err(_) => resume.fire(Err(Failure::kernel(KernelFailure::Panicked {
                        what: "flow callback",
                        message: "callback panicked".to_string(),
                    }))),
                },
                None => match outcome {
                    FlowOutcome::Completed => resume.fire(Ok(None)),
                    FlowOutcome::Failed(failure) => resume.fire(Err(failure)),
                },
            },
        }
    }
}

// =============================================================================
// Joins
// =============================================================================

pub(crate) enum JoinPoll {
    Done,
    TimedOut(Failure),
    Pending,
}

#[derive(Default)]
struct JoinState {
    pending: HashMap<FlowId, Option<TimerGuard>>,
    timed_out: Option<Failure>,
    resume: Option<Resume>,
}

/// The joins a job registered, awaited together once its body is done.
#[derive(Default)]
pub(crate) struct JoinSet {
    state: Mutex<JoinState>,
}

impl JoinSet {
    pub(crate) fn join(
        self: &Arc<Self>,
        flow: &Arc<Flow>,
        timeout: Duration,
        token: Option<Value>,
        timer: &TimerHandle,
    ) -> Result<(), Failure> {
        let id = flow.id();
        {
            let mut state = lock(&self.state);
            if state.pending.contains_key(&id) {
                return Err(Failure::kernel(KernelFailure::DuplicateJoin { flow: id }));
            }
            if state.timed_out.is_some() {
                return Ok(());
            }
            state.pending.insert(id, None);
        }

        let joins = self.clone();
        if flow.watch(Box::new(move |_| joins.resolved(id))).is_err() {
            self.resolved(id);
            return Ok(());
        }

        let joins = self.clone();
        let guard = timer.schedule(timeout, move || joins.expire(id, timeout, token));
        let mut state = lock(&self.state);
        if let Some(slot) = state.pending.get_mut(&id) {
            *slot = Some(guard);
        }
        Ok(())
    }

    fn resolved(&self, flow: FlowId) {
        let resume = {
            let mut state = lock(&self.state);
            if state.pending.remove(&flow).is_none() {
                return;
            }
            if state.pending.is_empty() && state.timed_out.is_none() {
                state.resume.take()
            } else {
                None
            }
        };
        if let Some(resume) = resume {
            resume.fire(Ok(None));
        }
    }

    fn expire(&self, flow: FlowId, timeout: Duration, token: Option<Value>) {
        let (failure, resume, _cancelled) = {
            let mut state = lock(&self.state);
            if state.timed_out.is_some() || state.pending.remove(&flow).is_none() {
                return;
            }
            let failure = Failure::kernel(KernelFailure::JoinTimeout { flow, timeout, token });
            state.timed_out = Some(failure.clone());
            let cancelled: Vec<_> = state.pending.drain().collect();
            (failure, state.resume.take(), cancelled)
        };
        debug!(flow_id = %flow, ?timeout, "Join timed out");
        if let Some(resume) = resume {
            resume.fire(Err(failure));
        }
    }

    /// Checks the joins, registering a wake-up if any is still pending.
    pub(crate) fn await_all(&self, make_resume: impl FnOnce() -> Resume) -> JoinPoll {
        let mut state = lock(&self.state);
        if let Some(failure) = state.timed_out.clone() {
            return JoinPoll::TimedOut(failure);
        }
        if state.pending.is_empty() {
            return JoinPoll::Done;
        }
        state.resume = Some(make_resume());
        JoinPoll::Pending
    }

    /// Drops every outstanding join and its deadline.
    pub(crate) fn clear(&self) {
        let state = std::mem::take(&mut *lock(&self.state));
        drop(state);
    }
}
