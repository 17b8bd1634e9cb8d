//! The job state machine.
//!
//! A job drives one function instance through a fixed lifecycle:
//!
//! 1. `Created`
//! 2. `ResolvingDependencies`
//! 3. `ActivatingGovernance`
//! 4. `RunningPreDuties`
//! 5. `Executing` (body, asynchronous completion, chained flows, joins)
//! 6. `RunningPostDuties`
//! 7. `DeactivatingGovernance`
//! 8. `Completed`, or `Escalated` from any failure in states 2-7
//!
//! Every state may suspend. A suspended job holds no thread: it registers a
//! single-fire wake-up and returns. The wake-up stores its result in the
//! job's inbox and resubmits the job to its team, which re-enters the same
//! state. Cursors advance before a suspension so no committed side effect
//! is repeated.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use ferrule_id::JobId;
use serde::Serialize;
use tracing::{debug, warn};

use crate::context::{Effects, FunctionContext};
use crate::descriptor::{Dependency, DutyBinding, FunctionDescriptor, FunctionIndex, GovernanceIndex, Scope, Value};
use crate::duty::DutyContext;
use crate::error::{Failure, KernelFailure};
use crate::flow::{CallerLink, Continuation, Flow, FlowCallback, FlowOutcome, FlowParent, JoinPoll, JoinSet};
use crate::governance::{Activation, DeactivationStrategy};
use crate::kernel::KernelShared;
use crate::lock;
use crate::request::Request;
use crate::scope::{Resolution, ScopeContainer};
use crate::team::Assignment;
use crate::wake::{Resume, Wake};
use crate::worker;

// =============================================================================
// Observable states
// =============================================================================

/// Lifecycle state of a job, as reported to a [`JobObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    ResolvingDependencies,
    ActivatingGovernance,
    RunningPreDuties,
    Executing,
    RunningPostDuties,
    DeactivatingGovernance,
    Completed,
    Escalated,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Escalated)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::ResolvingDependencies => "resolving_dependencies",
            Self::ActivatingGovernance => "activating_governance",
            Self::RunningPreDuties => "running_pre_duties",
            Self::Executing => "executing",
            Self::RunningPostDuties => "running_post_duties",
            Self::DeactivatingGovernance => "deactivating_governance",
            Self::Completed => "completed",
            Self::Escalated => "escalated",
        };
        f.write_str(name)
    }
}

/// Receives every job state transition.
pub trait JobObserver: Send + Sync {
    fn transition(&self, job: JobId, function: &str, state: JobState);
}

// =============================================================================
// Machine
// =============================================================================

const IDLE: u8 = 0;
const QUEUED: u8 = 1;
const RUNNING: u8 = 2;
/// Running, and woken again since the run started.
const NOTIFIED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Body,
    AwaitBody,
    Chained,
    Joins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Created,
    Resolving(usize),
    Activating(usize),
    PreDuties(usize),
    Executing(Phase),
    PostDuties(usize),
    Deactivating,
    Completed,
    Escalated,
}

impl Stage {
    fn state(&self) -> JobState {
        match self {
            Self::Created => JobState::Created,
            Self::Resolving(_) => JobState::ResolvingDependencies,
            Self::Activating(_) => JobState::ActivatingGovernance,
            Self::PreDuties(_) => JobState::RunningPreDuties,
            Self::Executing(_) => JobState::Executing,
            Self::PostDuties(_) => JobState::RunningPostDuties,
            Self::Deactivating => JobState::DeactivatingGovernance,
            Self::Completed => JobState::Completed,
            Self::Escalated => JobState::Escalated,
        }
    }
}

struct Machine {
    stage: Stage,
    awaiting: bool,
    resolved: Vec<Option<Value>>,
    invocation: Arc<ScopeContainer>,
    effects: Effects,
    /// Governance units this job activated, in activation order.
    owned: Vec<GovernanceIndex>,
    continuation: Option<Continuation>,
}

enum Progress {
    Continue,
    Suspend,
    Done,
}

enum Step {
    Suspend,
    Done,
}

pub(crate) struct JobNode {
    id: JobId,
    kernel: Arc<KernelShared>,
    function: FunctionIndex,
    parameter: Option<Value>,
    request: Arc<Request>,
    flow: Arc<Flow>,
    joins: Arc<JoinSet>,
    schedule: AtomicU8,
    finished: AtomicBool,
    inbox: Mutex<Option<Wake>>,
    machine: Mutex<Machine>,
}

impl JobNode {
    /// Opens a flow and starts its first job.
    pub(crate) fn start_flow(
        kernel: &Arc<KernelShared>,
        request: &Arc<Request>,
        target: FunctionIndex,
        parameter: Option<Value>,
        parent: FlowParent,
        callback: Option<FlowCallback>,
    ) -> Arc<Flow> {
        let flow = Flow::open(request, parent, callback);
        Self::spawn(kernel, request, target, parameter, flow.clone(), Continuation::Flow(flow.clone()));
        flow
    }

    pub(crate) fn spawn(
        kernel: &Arc<KernelShared>,
        request: &Arc<Request>,
        function: FunctionIndex,
        parameter: Option<Value>,
        flow: Arc<Flow>,
        continuation: Continuation,
    ) -> Arc<Self> {
        let dependencies = kernel.descriptor(function).dependencies().len();
        let job = Arc::new(Self {
            id: JobId::new(),
            kernel: kernel.clone(),
            function,
            parameter,
            request: request.clone(),
            flow,
            joins: Arc::default(),
            schedule: AtomicU8::new(IDLE),
            finished: AtomicBool::new(false),
            inbox: Mutex::new(None),
            machine: Mutex::new(Machine {
                stage: Stage::Created,
                awaiting: false,
                resolved: Vec::with_capacity(dependencies),
                invocation: kernel.scope_container(Scope::Invocation),
                effects: Effects::default(),
                owned: Vec::new(),
                continuation: Some(continuation),
            }),
        });
        job.observe(JobState::Created);
        job.notify();
        job
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn kernel(&self) -> &Arc<KernelShared> {
        &self.kernel
    }

    pub(crate) fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub(crate) fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    pub(crate) fn joins(&self) -> &Arc<JoinSet> {
        &self.joins
    }

    fn descriptor(&self) -> &FunctionDescriptor {
        self.kernel.descriptor(self.function)
    }

    pub(crate) fn start_parallel(
        &self,
        target: FunctionIndex,
        parameter: Option<Value>,
        callback: Option<FlowCallback>,
    ) -> Arc<Flow> {
        Self::start_flow(&self.kernel, &self.request, target, parameter, FlowParent::Parallel, callback)
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// A wake-up that resumes this job with its result.
    pub(crate) fn resume(self: &Arc<Self>, what: &'static str) -> Resume {
        let job = self.clone();
        Resume::new(what, move |wake| job.wake(wake))
    }

    fn wake(self: &Arc<Self>, wake: Wake) {
        if self.finished.load(Ordering::Acquire) {
            debug!(job_id = %self.id, "Ignoring wake-up for finished job");
            return;
        }
        {
            let mut inbox = lock(&self.inbox);
            if inbox.is_some() {
                warn!(job_id = %self.id, "Job woken twice, keeping the first wake-up");
                return;
            }
            *inbox = Some(wake);
        }
        self.notify();
    }

    /// Submits the job unless it is already queued or running. A job woken
    /// while running is marked and rerun by the current run.
    fn notify(self: &Arc<Self>) {
        loop {
            match self.schedule.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .schedule
                        .compare_exchange(IDLE, QUEUED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.submit();
                        return;
                    }
                }
                RUNNING => {
                    if self
                        .schedule
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn submit(self: &Arc<Self>) {
        let team = self.kernel.team_for(self.descriptor().team());
        if let Err(refused) = team.assign(Assignment::new(self.clone())) {
            warn!(job_id = %self.id, team = %team.name(), "Team refused job, abandoning it");
            drop(refused);
        }
    }

    /// Runs the job until it suspends or terminates. Called by teams only.
    pub(crate) fn run(self: &Arc<Self>) {
        self.schedule.store(RUNNING, Ordering::Release);
        loop {
            let step = {
                let mut machine = lock(&self.machine);
                self.drive(&mut machine)
            };
            if let Step::Done = step {
                self.schedule.store(IDLE, Ordering::Release);
                return;
            }
            // A wake-up that fired while this run was suspending.
            if lock(&self.inbox).is_some() {
                self.schedule.store(RUNNING, Ordering::Release);
                continue;
            }
            match self
                .schedule
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(_) => self.schedule.store(RUNNING, Ordering::Release),
            }
        }
    }

    /// Terminates a job that can no longer be run.
    pub(crate) fn abandon(&self, failure: Failure) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let continuation = {
            let mut machine = lock(&self.machine);
            machine.invocation.release(Some(&failure));
            machine.continuation.take()
        };
        self.joins.clear();
        if let Some(continuation) = continuation {
            continuation.finish(FlowOutcome::Failed(failure));
        }
    }

    fn observe(&self, state: JobState) {
        let function = self.descriptor().name();
        debug!(job_id = %self.id, function = %function, state = %state, "Job transition");
        if let Some(observer) = self.kernel.observer() {
            observer.transition(self.id, function, state);
        }
    }

    fn enter(&self, machine: &mut Machine, stage: Stage) {
        let previous = machine.stage.state();
        machine.stage = stage;
        if stage.state() != previous {
            self.observe(stage.state());
        }
    }

    // -------------------------------------------------------------------------
    // States
    // -------------------------------------------------------------------------

    fn drive(self: &Arc<Self>, m: &mut Machine) -> Step {
        if matches!(m.stage, Stage::Completed | Stage::Escalated) {
            return Step::Done;
        }
        if m.awaiting {
            let Some(wake) = lock(&self.inbox).take() else {
                return Step::Suspend;
            };
            m.awaiting = false;
            match wake {
                Ok(value) => Self::resumed(m, value),
                Err(failure) => return self.escalate(m, failure),
            }
        }

        loop {
            let progress = match m.stage {
                Stage::Created => {
                    self.enter(m, Stage::Resolving(0));
                    Ok(Progress::Continue)
                }
                Stage::Resolving(next) => self.resolve(m, next),
                Stage::Activating(next) => self.activate(m, next),
                Stage::PreDuties(next) => self.duties(m, next, true),
                Stage::Executing(phase) => self.execute(m, phase),
                Stage::PostDuties(next) => self.duties(m, next, false),
                Stage::Deactivating => self.deactivate(m),
                Stage::Completed | Stage::Escalated => Ok(Progress::Done),
            };
            match progress {
                Ok(Progress::Continue) => {}
                Ok(Progress::Suspend) => {
                    m.awaiting = true;
                    return Step::Suspend;
                }
                Ok(Progress::Done) => return Step::Done,
                Err(failure) => return self.escalate(m, failure),
            }
        }
    }

    /// Applies a successful wake-up to the state that suspended.
    fn resumed(m: &mut Machine, value: Option<Value>) {
        match m.stage {
            Stage::Resolving(next) => {
                m.resolved.push(value);
                m.stage = Stage::Resolving(next + 1);
            }
            Stage::Executing(Phase::AwaitBody) => {
                if value.is_some() {
                    m.effects.result = value;
                }
                m.stage = Stage::Executing(Phase::Chained);
            }
            _ => {}
        }
    }

    fn resolve(self: &Arc<Self>, m: &mut Machine, next: usize) -> Result<Progress, Failure> {
        let Some(dependency) = self.descriptor().dependencies().translate(next) else {
            self.enter(m, Stage::Activating(0));
            return Ok(Progress::Continue);
        };

        let container = match dependency {
            Dependency::Resource {
                scope: Scope::Thread, ..
            } => worker::thread_scope(&self.kernel),
            Dependency::Resource {
                scope: Scope::Request, ..
            } => self.request.scope().clone(),
            _ => m.invocation.clone(),
        };

        match container.resolve(dependency, self.parameter.as_ref(), || self.resume("dependency")) {
            Resolution::Ready(value) => {
                m.resolved.push(value);
                m.stage = Stage::Resolving(next + 1);
                Ok(Progress::Continue)
            }
            Resolution::Pending => Ok(Progress::Suspend),
            Resolution::Failed(failure) => Err(failure),
        }
    }

    fn activate(self: &Arc<Self>, m: &mut Machine, next: usize) -> Result<Progress, Failure> {
        let descriptor = self.descriptor();
        let required = (next..self.kernel.governance_count())
            .map(GovernanceIndex)
            .find(|g| descriptor.requires_governance(*g));
        let Some(unit) = required else {
            self.enter(m, Stage::PreDuties(0));
            return Ok(Progress::Continue);
        };

        m.stage = Stage::Activating(unit.index() + 1);
        let table = self.request.governance();
        match table.activate(unit, self.id, descriptor.name(), || self.resume("governance")) {
            Activation::Active => Ok(Progress::Continue),
            Activation::Pending { owner } => {
                if owner {
                    m.owned.push(unit);
                }
                Ok(Progress::Suspend)
            }
            Activation::Failed(failure) => Err(failure),
        }
    }

    fn duties(self: &Arc<Self>, m: &mut Machine, next: usize, pre: bool) -> Result<Progress, Failure> {
        let descriptor = self.descriptor();
        let duties = if pre {
            descriptor.pre_duties()
        } else {
            descriptor.post_duties()
        };
        let Some(binding) = duties.get(next) else {
            let stage = if pre {
                Stage::Executing(Phase::Body)
            } else {
                Stage::Deactivating
            };
            self.enter(m, stage);
            return Ok(Progress::Continue);
        };

        m.stage = if pre {
            Stage::PreDuties(next + 1)
        } else {
            Stage::PostDuties(next + 1)
        };
        if self.run_duty(binding, &m.resolved)? {
            Ok(Progress::Suspend)
        } else {
            Ok(Progress::Continue)
        }
    }

    /// Runs one duty; `Ok(true)` when it deferred its completion.
    fn run_duty(self: &Arc<Self>, binding: &DutyBinding, resolved: &[Option<Value>]) -> Result<bool, Failure> {
        let mut ctx = DutyContext {
            job: self,
            duty: &binding.name,
            function: self.descriptor().name(),
            parameter: self.parameter.as_ref(),
            resources: binding
                .dependencies
                .iter()
                .map(|&i| resolved.get(i).and_then(Option::as_ref))
                .collect(),
            deferred: false,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| binding.duty.run(&mut ctx))) {
            Ok(Ok(())) => Ok(ctx.deferred),
            Ok(Err(failure)) => Err(failure),
            Err(payload) => Err(panicked("duty", payload)),
        }
    }

    fn execute(self: &Arc<Self>, m: &mut Machine, phase: Phase) -> Result<Progress, Failure> {
        match phase {
            Phase::Body => {
                let descriptor = self.descriptor();
                let Machine {
                    resolved, effects, ..
                } = &mut *m;
                let mut ctx = FunctionContext {
                    job: self,
                    descriptor,
                    parameter: self.parameter.as_ref(),
                    dependencies: resolved,
                    effects,
                };
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut body = descriptor.factory.create();
                    body.execute(&mut ctx)
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(failure)) => return Err(failure),
                    Err(payload) => return Err(panicked("function", payload)),
                }

                if m.effects.incomplete {
                    m.stage = Stage::Executing(Phase::AwaitBody);
                    Ok(Progress::Suspend)
                } else {
                    m.stage = Stage::Executing(Phase::Chained);
                    Ok(Progress::Continue)
                }
            }
            // Only left through a wake-up.
            Phase::AwaitBody => Ok(Progress::Suspend),
            Phase::Chained => {
                let Some(child) = m.effects.sequential.pop_front() else {
                    m.stage = Stage::Executing(Phase::Joins);
                    return Ok(Progress::Continue);
                };
                let link = CallerLink {
                    resume: self.resume("sequential flow"),
                    callback: child.callback,
                };
                Self::spawn(
                    &self.kernel,
                    &self.request,
                    child.target,
                    child.parameter,
                    self.flow.clone(),
                    Continuation::Caller(link),
                );
                Ok(Progress::Suspend)
            }
            Phase::Joins => match self.joins.await_all(|| self.resume("join")) {
                JoinPoll::Done => {
                    self.enter(m, Stage::PostDuties(0));
                    Ok(Progress::Continue)
                }
                JoinPoll::TimedOut(failure) => Err(failure),
                JoinPoll::Pending => Ok(Progress::Suspend),
            },
        }
    }

    fn deactivate(self: &Arc<Self>, m: &mut Machine) -> Result<Progress, Failure> {
        let table = self.request.governance();
        while let Some(unit) = m.owned.pop() {
            if table.strategy(unit) == Some(DeactivationStrategy::Immediate) {
                table.deactivate(unit, self.id)?;
            }
        }

        let descriptor = self.descriptor();
        let parameter = m.effects.result.take().or_else(|| self.parameter.clone());
        if let Some(next) = descriptor.next() {
            let target = self.kernel.descriptor(next);
            if !target.accepts(parameter.as_ref()) {
                return Err(Failure::kernel(KernelFailure::ParameterType {
                    function: target.name().to_string(),
                    expected: target.parameter_type().map(|t| t.name()).unwrap_or("()"),
                }));
            }
        }

        self.finished.store(true, Ordering::Release);
        self.enter(m, Stage::Completed);
        m.invocation.release(None);
        self.joins.clear();

        match (descriptor.next(), m.continuation.take()) {
            (Some(next), Some(continuation)) => {
                Self::spawn(&self.kernel, &self.request, next, parameter, self.flow.clone(), continuation);
            }
            (None, Some(continuation)) => continuation.finish(FlowOutcome::Completed),
            (_, None) => warn!(job_id = %self.id, "Completed job has no continuation"),
        }
        Ok(Progress::Done)
    }

    fn escalate(self: &Arc<Self>, m: &mut Machine, failure: Failure) -> Step {
        self.finished.store(true, Ordering::Release);
        let descriptor = self.descriptor();
        let classes = self.kernel.classes();
        warn!(
            job_id = %self.id,
            function = %descriptor.name(),
            class = %classes.name(failure.class()),
            error = %failure,
            "Job escalated"
        );

        let table = self.request.governance();
        while let Some(unit) = m.owned.pop() {
            if table.strategy(unit) == Some(DeactivationStrategy::Immediate) {
                table.disregard(unit, self.id);
            }
        }
        m.invocation.release(Some(&failure));
        self.joins.clear();
        m.effects = Effects::default();
        self.enter(m, Stage::Escalated);

        let Some(continuation) = m.continuation.take() else {
            return Step::Done;
        };
        match descriptor.escalation().find(classes, &failure) {
            Some(handler) => {
                debug!(
                    job_id = %self.id,
                    handler = %self.kernel.descriptor(handler).name(),
                    "Routing failure to escalation handler"
                );
                let parameter: Value = Arc::new(failure);
                Self::start_flow(
                    &self.kernel,
                    &self.request,
                    handler,
                    Some(parameter),
                    FlowParent::Escalation(continuation),
                    None,
                );
            }
            None => continuation.finish(FlowOutcome::Failed(failure)),
        }
        Step::Done
    }
}

fn panicked(what: &'static str, payload: Box<dyn Any + Send>) -> Failure {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    Failure::kernel(KernelFailure::Panicked { what, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_maps_to_observable_state() {
        assert_eq!(Stage::Resolving(3).state(), JobState::ResolvingDependencies);
        assert_eq!(Stage::Executing(Phase::Joins).state(), JobState::Executing);
        assert!(Stage::Escalated.state().is_terminal());
        assert!(!Stage::Deactivating.state().is_terminal());
    }

    #[test]
    fn test_panic_payload_message() {
        let failure = panicked("function", Box::new("boom"));
        assert!(matches!(
            failure.kernel_failure(),
            Some(KernelFailure::Panicked { what: "function", message }) if message == "boom"
        ));
        let failure = panicked("duty", Box::new(String::from("owned")));
        assert_eq!(failure.to_string(), "duty panicked: owned");
    }
}
