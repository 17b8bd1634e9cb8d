//! Governance: cross-cutting activation around function execution.
//!
//! A governance unit (a transaction bracket, a lock, an audit span) is
//! activated at most once per request and deactivated either by the job
//! that activated it, as soon as that job's body and post-duties finish, or
//! when the request ends. Deactivation either enforces the unit (success) or
//! disregards it (the owning job escalated, or the request failed).

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use ferrule_id::{JobId, RequestId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::descriptor::GovernanceIndex;
use crate::error::{Failure, KernelFailure};
use crate::lock;
use crate::slot::{LazySlot, Poll, Settled, SlotState};
use crate::wake::{AsyncCompletion, Resume};

// =============================================================================
// Public traits
// =============================================================================

/// When a governance unit is deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationStrategy {
    /// As soon as the activating job's body and post-duties finish.
    Immediate,
    /// When the enclosing request ends, batching all jobs that shared it.
    OnScopeCompletion,
}

#[derive(Debug, Error)]
#[error("unknown deactivation strategy '{0}' (expected immediate or on_scope_completion)")]
pub struct UnknownStrategy(String);

impl FromStr for DeactivationStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "on_scope_completion" | "on-scope-completion" => Ok(Self::OnScopeCompletion),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for DeactivationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => f.write_str("immediate"),
            Self::OnScopeCompletion => f.write_str("on_scope_completion"),
        }
    }
}

/// A governance unit.
pub trait Governance: Send + Sync {
    fn name(&self) -> &str;

    /// Activates the unit for a request. Activation may finish later through
    /// [`GovernanceContext::defer`]; jobs needing the unit wait until then.
    fn activate(&self, ctx: &mut GovernanceContext<'_>) -> anyhow::Result<Box<dyn ActiveGovernance>>;
}

/// An activated governance unit awaiting deactivation.
pub trait ActiveGovernance: Send {
    /// Deactivate after success. An error escalates on the owning job, or is
    /// reported at the request boundary for deferred deactivation.
    fn enforce(self: Box<Self>) -> anyhow::Result<()>;

    /// Deactivate after failure.
    fn disregard(self: Box<Self>);
}

/// What a governance unit sees while activating.
pub struct GovernanceContext<'a> {
    request: RequestId,
    function: &'a str,
    completion: Option<Resume>,
}

impl GovernanceContext<'_> {
    pub fn request_id(&self) -> RequestId {
        self.request
    }

    /// The function whose job triggered activation.
    pub fn function_name(&self) -> &str {
        self.function
    }

    /// Finishes activation asynchronously. `None` if already deferred.
    pub fn defer(&mut self) -> Option<AsyncCompletion> {
        self.completion.take().map(AsyncCompletion::new)
    }
}

// =============================================================================
// Per-request table
// =============================================================================

/// A linked governance unit and its resolved strategy.
#[derive(Clone)]
pub(crate) struct GovernanceUnit {
    pub(crate) governance: Arc<dyn Governance>,
    pub(crate) strategy: DeactivationStrategy,
}

pub(crate) enum Activation {
    Active,
    /// The wake-up was registered. `owner` is true for the job that started
    /// the activation and is responsible for immediate deactivation.
    Pending { owner: bool },
    Failed(Failure),
}

struct GovernanceState {
    slots: Vec<LazySlot<()>>,
    guards: Vec<Option<Box<dyn ActiveGovernance>>>,
    owners: Vec<Option<JobId>>,
    finished: bool,
}

pub(crate) struct GovernanceTable {
    request: RequestId,
    units: Arc<[GovernanceUnit]>,
    state: Mutex<GovernanceState>,
}

impl GovernanceTable {
    pub(crate) fn new(request: RequestId, units: Arc<[GovernanceUnit]>) -> Arc<Self> {
        let n = units.len();
        Arc::new(Self {
            request,
            units,
            state: Mutex::new(GovernanceState {
                slots: (0..n).map(|_| LazySlot::default()).collect(),
                guards: (0..n).map(|_| None).collect(),
                owners: vec![None; n],
                finished: false,
            }),
        })
    }

    pub(crate) fn strategy(&self, index: GovernanceIndex) -> Option<DeactivationStrategy> {
        self.units.get(index.0).map(|u| u.strategy)
    }

    fn failure(&self, index: usize, action: &'static str, reason: String) -> Failure {
        Failure::kernel(KernelFailure::Governance {
            governance: self.units[index].governance.name().to_string(),
            action,
            reason,
        })
    }

    /// Activates a unit unless it is already active for this request.
    pub(crate) fn activate(
        self: &Arc<Self>,
        index: GovernanceIndex,
        job: JobId,
        function: &str,
        make_resume: impl FnOnce() -> Resume,
    ) -> Activation {
        let index = index.0;
        if index >= self.units.len() {
            return Activation::Failed(Failure::kernel(KernelFailure::Governance {
                governance: format!("#{index}"),
                action: "activate",
                reason: "not linked".to_string(),
            }));
        }

        let generation = {
            let mut state = lock(&self.state);
            if state.finished {
                return Activation::Failed(self.failure(index, "activate", "request already ended".to_string()));
            }
            match state.slots[index].poll(make_resume) {
                Poll::Ready(()) => return Activation::Active,
                Poll::Waiting => return Activation::Pending { owner: false },
                Poll::Start(generation) => {
                    state.owners[index] = Some(job);
                    generation
                }
            }
        };

        let unit = &self.units[index];
        debug!(governance = %unit.governance.name(), request_id = %self.request, "Activating governance");

        let table = self.clone();
        let completion = Resume::new("governance activation", move |wake| {
            table.settle(index, generation, wake.map(|_| ()))
        });
        let mut ctx = GovernanceContext {
            request: self.request,
            function,
            completion: Some(completion),
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| unit.governance.activate(&mut ctx)));
        let pending = ctx.completion.take();
        match result {
            Ok(Ok(guard)) => {
                lock(&self.state).guards[index] = Some(guard);
                if let Some(completion) = pending {
                    completion.fire(Ok(None));
                }
            }
            Ok(Err(e)) => {
                self.settle(index, generation, Err(self.failure(index, "activate", format!("{e:#}"))));
                drop(pending);
            }
            Err(_) => {
                self.settle(index, generation, Err(self.failure(index, "activate", "panicked".to_string())));
                drop(pending);
            }
        }
        Activation::Pending { owner: true }
    }

    fn settle(&self, index: usize, generation: u64, outcome: Result<(), Failure>) {
        let (settled, abandoned) = {
            let mut state = lock(&self.state);
            let settled = state.slots[index].settle(generation, outcome);
            let abandoned = match &settled {
                Settled::Accepted { outcome: Err(_), .. } => {
                    state.owners[index] = None;
                    state.guards[index].take()
                }
                _ => None,
            };
            (settled, abandoned)
        };

        if let Some(guard) = abandoned {
            guard.disregard();
        }
        if let Settled::Accepted { waiters, outcome } = settled {
            if let Err(failure) = &outcome {
                warn!(governance = %self.units[index].governance.name(), error = %failure, "Governance activation failed");
            }
            let wake = outcome.map(|()| None);
            for waiter in waiters {
                waiter.fire(wake.clone());
            }
        }
    }

    /// Takes the active guard of a unit the job owns. `None` when the unit
    /// is not active or belongs to another job.
    fn take_owned(&self, index: usize, job: JobId) -> Option<Box<dyn ActiveGovernance>> {
        let mut state = lock(&self.state);
        let owned = state.owners.get(index).copied().flatten() == Some(job);
        if !owned || !state.slots[index].is_ready() {
            return None;
        }
        state.slots[index].reset();
        state.owners[index] = None;
        state.guards[index].take()
    }

    /// Enforces a unit the job owns after the job completed.
    pub(crate) fn deactivate(&self, index: GovernanceIndex, job: JobId) -> Result<(), Failure> {
        let index = index.0;
        let Some(guard) = self.take_owned(index, job) else {
            return Ok(());
        };
        debug!(governance = %self.units[index].governance.name(), "Enforcing governance");
        match panic::catch_unwind(AssertUnwindSafe(|| guard.enforce())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.failure(index, "deactivate", format!("{e:#}"))),
            Err(_) => Err(self.failure(index, "deactivate", "panicked".to_string())),
        }
    }

    /// Disregards a unit the job owns after the job escalated.
    pub(crate) fn disregard(&self, index: GovernanceIndex, job: JobId) {
        let index = index.0;
        let Some(guard) = self.take_owned(index, job) else {
            return;
        };
        let name = self.units[index].governance.name();
        debug!(governance = %name, "Disregarding governance");
        if panic::catch_unwind(AssertUnwindSafe(|| guard.disregard())).is_err() {
            error!(governance = %name, "Governance disregard panicked");
        }
    }

    /// Deactivates everything still active at request end. Returns the first
    /// enforcement failure.
    pub(crate) fn finish(&self, success: bool) -> Option<Failure> {
        let (active, stranded) = {
            let mut state = lock(&self.state);
            if state.finished {
                return None;
            }
            state.finished = true;
            let mut active = Vec::new();
            let mut stranded = Vec::new();
            for index in 0..self.units.len() {
                match state.slots[index].reset() {
                    SlotState::Ready(()) => {
                        if let Some(guard) = state.guards[index].take() {
                            active.push((index, guard));
                        }
                    }
                    SlotState::Pending { waiters, .. } => stranded.extend(waiters),
                    SlotState::Empty => {}
                }
                state.owners[index] = None;
            }
            (active, stranded)
        };

        // Dropping stranded waiters fails them as abandoned.
        drop(stranded);

        let mut first = None;
        for (index, guard) in active {
            let name = self.units[index].governance.name();
            if !success {
                debug!(governance = %name, request_id = %self.request, "Disregarding governance at request end");
                guard.disregard();
                continue;
            }
            let result = match panic::catch_unwind(AssertUnwindSafe(|| guard.enforce())) {
                Ok(result) => result.map_err(|e| format!("{e:#}")),
                Err(_) => Err("panicked".to_string()),
            };
            if let Err(reason) = result {
                error!(governance = %name, request_id = %self.request, error = %reason, "Governance enforcement failed at request end");
                if first.is_none() {
                    first = Some(self.failure(index, "deactivate", reason));
                }
            }
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wake::Wake;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[derive(Default)]
    struct Counters {
        activated: AtomicUsize,
        enforced: AtomicUsize,
        disregarded: AtomicUsize,
    }

    struct Bracket {
        counters: Arc<Counters>,
        deferred: Mutex<Vec<AsyncCompletion>>,
        defer: bool,
        fail: bool,
    }

    struct Guard(Arc<Counters>);

    impl ActiveGovernance for Guard {
        fn enforce(self: Box<Self>) -> anyhow::Result<()> {
            self.0.enforced.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn disregard(self: Box<Self>) {
            self.0.disregarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Governance for Bracket {
        fn name(&self) -> &str {
            "bracket"
        }

        fn activate(&self, ctx: &mut GovernanceContext<'_>) -> anyhow::Result<Box<dyn ActiveGovernance>> {
            self.counters.activated.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("no connection");
            }
            if self.defer {
                self.deferred.lock().unwrap().extend(ctx.defer());
            }
            Ok(Box::new(Guard(self.counters.clone())))
        }
    }

    fn table(defer: bool, fail: bool) -> (Arc<GovernanceTable>, Arc<Counters>, Arc<Bracket>) {
        let counters = Arc::new(Counters::default());
        let bracket = Arc::new(Bracket {
            counters: counters.clone(),
            deferred: Mutex::new(Vec::new()),
            defer,
            fail,
        });
        let units: Arc<[GovernanceUnit]> = Arc::from(vec![GovernanceUnit {
            governance: bracket.clone(),
            strategy: DeactivationStrategy::Immediate,
        }]);
        (GovernanceTable::new(RequestId::new(), units), counters, bracket)
    }

    fn resume_into(tx: &mpsc::Sender<Wake>) -> impl FnOnce() -> Resume {
        let tx = tx.clone();
        move || Resume::new("test", move |wake| {
            let _ = tx.send(wake);
        })
    }

    const UNIT: GovernanceIndex = GovernanceIndex(0);

    #[test]
    fn test_activation_is_idempotent_per_request() {
        let (table, counters, _) = table(false, false);
        let (tx, rx) = mpsc::channel();
        let job = JobId::new();

        assert!(matches!(
            table.activate(UNIT, job, "f", resume_into(&tx)),
            Activation::Pending { owner: true }
        ));
        assert!(rx.try_recv().unwrap().is_ok());
        assert!(matches!(
            table.activate(UNIT, JobId::new(), "g", || unreachable!()),
            Activation::Active
        ));
        assert_eq!(counters.activated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_activation_wakes_all_waiters() {
        let (table, _, bracket) = table(true, false);
        let (tx, rx) = mpsc::channel();

        table.activate(UNIT, JobId::new(), "f", resume_into(&tx));
        assert!(matches!(
            table.activate(UNIT, JobId::new(), "g", resume_into(&tx)),
            Activation::Pending { owner: false }
        ));
        assert!(rx.try_recv().is_err());

        bracket.deferred.lock().unwrap().pop().unwrap().complete();
        assert!(rx.try_recv().unwrap().is_ok());
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_failed_activation_fails_waiters_and_resets() {
        let (table, counters, _) = table(false, true);
        let (tx, rx) = mpsc::channel();

        table.activate(UNIT, JobId::new(), "f", resume_into(&tx));
        let failure = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(failure.class(), crate::FailureClass::GOVERNANCE);

        table.activate(UNIT, JobId::new(), "f", resume_into(&tx));
        assert_eq!(counters.activated.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_only_owner_deactivates() {
        let (table, counters, _) = table(false, false);
        let (tx, _rx) = mpsc::channel();
        let owner = JobId::new();

        table.activate(UNIT, owner, "f", resume_into(&tx));
        table.deactivate(UNIT, JobId::new()).unwrap();
        assert_eq!(counters.enforced.load(Ordering::SeqCst), 0);

        table.deactivate(UNIT, owner).unwrap();
        table.deactivate(UNIT, owner).unwrap();
        assert_eq!(counters.enforced.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disregard_releases_ownership_once() {
        let (table, counters, _) = table(false, false);
        let (tx, _rx) = mpsc::channel();
        let owner = JobId::new();

        table.activate(UNIT, owner, "f", resume_into(&tx));
        table.disregard(UNIT, JobId::new());
        assert_eq!(counters.disregarded.load(Ordering::SeqCst), 0);

        table.disregard(UNIT, owner);
        table.disregard(UNIT, owner);
        table.deactivate(UNIT, owner).unwrap();
        assert_eq!(counters.disregarded.load(Ordering::SeqCst), 1);
        assert_eq!(counters.enforced.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_finish_disregards_after_failure() {
        let (table, counters, _) = table(false, false);
        let (tx, _rx) = mpsc::channel();

        table.activate(UNIT, JobId::new(), "f", resume_into(&tx));
        assert!(table.finish(false).is_none());
        assert!(table.finish(true).is_none());

        assert_eq!(counters.disregarded.load(Ordering::SeqCst), 1);
        assert_eq!(counters.enforced.load(Ordering::SeqCst), 0);
        assert!(matches!(
            table.activate(UNIT, JobId::new(), "f", || unreachable!()),
            Activation::Failed(_)
        ));
    }

    #[test]
    fn test_strategy_parses() {
        assert_eq!(
            "on_scope_completion".parse::<DeactivationStrategy>().unwrap(),
            DeactivationStrategy::OnScopeCompletion
        );
        assert_eq!(" Immediate ".parse::<DeactivationStrategy>().unwrap(), DeactivationStrategy::Immediate);
        assert!("later".parse::<DeactivationStrategy>().is_err());
    }
}
