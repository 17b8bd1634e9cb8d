//! Administration duties run immediately before and after a function body.

use std::any::Any;
use std::sync::Arc;

use ferrule_id::JobId;

use crate::descriptor::Value;
use crate::error::Failure;
use crate::job::JobNode;
use crate::wake::AsyncCompletion;

/// A pre- or post-duty.
pub trait Duty: Send + Sync {
    /// Runs the duty. Returning an error escalates on the owning job.
    fn run(&self, ctx: &mut DutyContext<'_>) -> Result<(), Failure>;
}

struct DutyFn<F>(F);

impl<F> Duty for DutyFn<F>
where
    F: Fn(&mut DutyContext<'_>) -> Result<(), Failure> + Send + Sync,
{
    fn run(&self, ctx: &mut DutyContext<'_>) -> Result<(), Failure> {
        (self.0)(ctx)
    }
}

/// Duty from a closure.
pub fn duty<F>(f: F) -> Arc<dyn Duty>
where
    F: Fn(&mut DutyContext<'_>) -> Result<(), Failure> + Send + Sync + 'static,
{
    Arc::new(DutyFn(f))
}

/// What a duty sees: the dependencies it declared, the invocation
/// parameter, and the ability to finish asynchronously.
pub struct DutyContext<'a> {
    pub(crate) job: &'a Arc<JobNode>,
    pub(crate) duty: &'a str,
    pub(crate) function: &'a str,
    pub(crate) parameter: Option<&'a Value>,
    pub(crate) resources: Vec<Option<&'a Value>>,
    pub(crate) deferred: bool,
}

impl DutyContext<'_> {
    pub fn job_id(&self) -> JobId {
        self.job.id()
    }

    pub fn duty_name(&self) -> &str {
        self.duty
    }

    pub fn function_name(&self) -> &str {
        self.function
    }

    /// The `i`th dependency the duty declared.
    pub fn resource(&self, i: usize) -> Option<&Value> {
        self.resources.get(i).copied().flatten()
    }

    pub fn resource_as<T: Any>(&self, i: usize) -> Option<&T> {
        self.resource(i).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn parameter(&self) -> Option<&Value> {
        self.parameter
    }

    pub fn parameter_as<T: Any>(&self) -> Option<&T> {
        self.parameter.and_then(|v| v.downcast_ref::<T>())
    }

    /// Suspends the job after this duty returns until the completion fires.
    /// `None` if already deferred.
    pub fn defer(&mut self) -> Option<AsyncCompletion> {
        if self.deferred {
            return None;
        }
        self.deferred = true;
        Some(AsyncCompletion::new(self.job.resume("duty")))
    }
}
