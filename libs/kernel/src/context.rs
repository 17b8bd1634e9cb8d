//! Function bodies and the capability-limited context they execute with.
//!
//! A body can read its dependencies and parameter, instigate flows, join
//! parallel flows, mark itself incomplete, and set a result. Nothing else of
//! the kernel is reachable from application code.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ferrule_id::{JobId, RequestId};

use crate::descriptor::{FunctionDescriptor, FunctionIndex, Strategy, Value};
use crate::error::{Failure, KernelFailure};
use crate::flow::{FlowCallback, FlowHandle};
use crate::job::JobNode;
use crate::wake::AsyncCompletion;

// =============================================================================
// Function bodies
// =============================================================================

/// A function body instance.
pub trait ManagedFunction: Send {
    /// Runs the body. Returning an error escalates on the owning job.
    fn execute(&mut self, ctx: &mut FunctionContext<'_>) -> Result<(), Failure>;
}

/// Produces a fresh body instance per invocation.
pub trait FunctionFactory: Send + Sync {
    fn create(&self) -> Box<dyn ManagedFunction>;
}

struct FnFactory<F>(F);

impl<F, B> FunctionFactory for FnFactory<F>
where
    F: Fn() -> B + Send + Sync,
    B: ManagedFunction + 'static,
{
    fn create(&self) -> Box<dyn ManagedFunction> {
        Box::new((self.0)())
    }
}

/// Factory from a closure building body instances.
pub fn factory<F, B>(f: F) -> Arc<dyn FunctionFactory>
where
    F: Fn() -> B + Send + Sync + 'static,
    B: ManagedFunction + 'static,
{
    Arc::new(FnFactory(f))
}

struct Stateless<F>(Arc<F>);

impl<F> FunctionFactory for Stateless<F>
where
    F: Fn(&mut FunctionContext<'_>) -> Result<(), Failure> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn ManagedFunction> {
        Box::new(Stateless(self.0.clone()))
    }
}

impl<F> ManagedFunction for Stateless<F>
where
    F: Fn(&mut FunctionContext<'_>) -> Result<(), Failure> + Send + Sync,
{
    fn execute(&mut self, ctx: &mut FunctionContext<'_>) -> Result<(), Failure> {
        (self.0)(ctx)
    }
}

/// Factory for a body with no per-invocation state.
pub fn stateless<F>(f: F) -> Arc<dyn FunctionFactory>
where
    F: Fn(&mut FunctionContext<'_>) -> Result<(), Failure> + Send + Sync + 'static,
{
    Arc::new(Stateless(Arc::new(f)))
}

// =============================================================================
// Execution context
// =============================================================================

/// Result of [`FunctionContext::instigate`].
#[derive(Debug)]
pub enum Instigated {
    /// Chained after this job; runs once the body returns.
    Chained,
    /// Running as an independent flow.
    Parallel(FlowHandle),
}

impl Instigated {
    pub fn into_handle(self) -> Option<FlowHandle> {
        match self {
            Self::Chained => None,
            Self::Parallel(handle) => Some(handle),
        }
    }
}

pub(crate) struct SequentialChild {
    pub(crate) target: FunctionIndex,
    pub(crate) parameter: Option<Value>,
    pub(crate) callback: Option<FlowCallback>,
}

/// What a body left behind for the rest of the job's lifecycle.
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) sequential: VecDeque<SequentialChild>,
    pub(crate) incomplete: bool,
    pub(crate) result: Option<Value>,
}

/// The context a function body executes with.
pub struct FunctionContext<'a> {
    pub(crate) job: &'a Arc<JobNode>,
    pub(crate) descriptor: &'a FunctionDescriptor,
    pub(crate) parameter: Option<&'a Value>,
    pub(crate) dependencies: &'a [Option<Value>],
    pub(crate) effects: &'a mut Effects,
}

impl FunctionContext<'_> {
    pub fn job_id(&self) -> JobId {
        self.job.id()
    }

    pub fn request_id(&self) -> RequestId {
        self.job.request().id()
    }

    pub fn function_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn parameter(&self) -> Option<&Value> {
        self.parameter
    }

    pub fn parameter_as<T: Any>(&self) -> Option<&T> {
        self.parameter.and_then(|v| v.downcast_ref::<T>())
    }

    /// Dependency by declaration index.
    pub fn dependency(&self, index: usize) -> Option<&Value> {
        self.dependencies.get(index).and_then(Option::as_ref)
    }

    pub fn dependency_as<T: Any>(&self, index: usize) -> Option<&T> {
        self.dependency(index).and_then(|v| v.downcast_ref::<T>())
    }

    /// Dependency by resource name.
    pub fn dependency_by_key(&self, key: &str) -> Option<&Value> {
        self.descriptor
            .dependencies()
            .position(key)
            .and_then(|i| self.dependency(i))
    }

    /// Instigates the flow at `index` of this function's flow table.
    ///
    /// A sequential flow is chained after this job and runs once the body
    /// returns; this job completes only when the chain terminates. A
    /// parallel flow starts now. `callback` is invoked exactly once with the
    /// instigated flow's outcome; without it, a sequential failure escalates
    /// here and a parallel failure goes to the request boundary.
    pub fn instigate(
        &mut self,
        index: usize,
        parameter: Option<Value>,
        callback: Option<FlowCallback>,
    ) -> Result<Instigated, Failure> {
        let Some(flow) = self.descriptor.flows().get(index).copied() else {
            return Err(Failure::kernel(KernelFailure::UnknownFlow {
                function: self.descriptor.name().to_string(),
                index,
            }));
        };
        self.instigate_target(flow.target, flow.strategy, parameter, callback)
    }

    /// Instigates a function by name.
    pub fn instigate_named(
        &mut self,
        target: &str,
        strategy: Strategy,
        parameter: Option<Value>,
        callback: Option<FlowCallback>,
    ) -> Result<Instigated, Failure> {
        let Some(index) = self.job.kernel().lookup(target) else {
            return Err(Failure::kernel(KernelFailure::UnknownFunction(target.to_string())));
        };
        self.instigate_target(index, strategy, parameter, callback)
    }

    fn instigate_target(
        &mut self,
        target: FunctionIndex,
        strategy: Strategy,
        parameter: Option<Value>,
        callback: Option<FlowCallback>,
    ) -> Result<Instigated, Failure> {
        let descriptor = self.job.kernel().descriptor(target);
        if !descriptor.accepts(parameter.as_ref()) {
            return Err(Failure::kernel(KernelFailure::ParameterType {
                function: descriptor.name().to_string(),
                expected: descriptor.parameter_type().map(|t| t.name()).unwrap_or("()"),
            }));
        }

        match strategy {
            Strategy::Sequential => {
                self.effects.sequential.push_back(SequentialChild {
                    target,
                    parameter,
                    callback,
                });
                Ok(Instigated::Chained)
            }
            Strategy::Parallel => {
                let flow = self.job.start_parallel(target, parameter, callback);
                Ok(Instigated::Parallel(FlowHandle::new(flow)))
            }
        }
    }

    /// Joins a parallel flow. The job waits, after its body and any chained
    /// flows, until every joined flow terminates; if one has not terminated
    /// within `timeout`, the job resumes with a `JOIN_TIMEOUT` failure
    /// carrying `token`.
    pub fn join(&mut self, handle: &FlowHandle, timeout: Duration, token: Option<Value>) -> Result<(), Failure> {
        if handle.id() == self.job.flow().id() {
            return Err(Failure::kernel(KernelFailure::SelfJoin { flow: handle.id() }));
        }
        let timer = self.job.kernel().timer();
        self.job.joins().join(handle.flow(), timeout, token, &timer)
    }

    /// Marks the body asynchronously incomplete: the job waits for the
    /// returned completion before moving on. `None` if already marked.
    pub fn set_incomplete(&mut self) -> Option<AsyncCompletion> {
        if self.effects.incomplete {
            return None;
        }
        self.effects.incomplete = true;
        Some(AsyncCompletion::new(self.job.resume("function body")))
    }

    /// Sets the result passed as parameter to the next function in sequence.
    pub fn set_result(&mut self, value: Value) {
        self.effects.result = Some(value);
    }
}
