//! Single-fire wake-up tokens.
//!
//! Every suspension registers exactly one [`Resume`]. Firing consumes it, so a
//! second wake-up cannot be expressed, and dropping it unfired delivers an
//! `Abandoned` failure instead of losing the wake-up.

use std::fmt;

use crate::descriptor::Value;
use crate::error::{Failure, KernelFailure};

/// What a suspended job is resumed with: an optional value (a resolved
/// resource, an asynchronous result) or the failure to escalate.
pub(crate) type Wake = Result<Option<Value>, Failure>;

type Target = Box<dyn FnOnce(Wake) + Send>;

pub(crate) struct Resume {
    what: &'static str,
    target: Option<Target>,
}

impl Resume {
    pub(crate) fn new<F>(what: &'static str, target: F) -> Self
    where
        F: FnOnce(Wake) + Send + 'static,
    {
        Self {
            what,
            target: Some(Box::new(target)),
        }
    }

    pub(crate) fn fire(mut self, wake: Wake) {
        if let Some(target) = self.target.take() {
            target(wake);
        }
    }
}

impl Drop for Resume {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            target(Err(Failure::kernel(KernelFailure::Abandoned { what: self.what })));
        }
    }
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resume")
            .field("what", &self.what)
            .field("armed", &self.target.is_some())
            .finish()
    }
}

/// Completes work a function, duty or governance unit left running when it
/// returned.
///
/// Exactly one of [`complete`](Self::complete),
/// [`complete_with`](Self::complete_with) or [`fail`](Self::fail) can be
/// called; dropping the handle without calling any of them fails the waiting
/// job with an `ABANDONED` failure.
#[derive(Debug)]
pub struct AsyncCompletion {
    resume: Resume,
}

impl AsyncCompletion {
    pub(crate) fn new(resume: Resume) -> Self {
        Self { resume }
    }

    /// Marks the work done.
    pub fn complete(self) {
        self.resume.fire(Ok(None));
    }

    /// Marks the work done with a result value.
    ///
    /// For a function body the value becomes the function's result, as if
    /// set through `FunctionContext::set_result`. Elsewhere it is ignored.
    pub fn complete_with(self, value: Value) {
        self.resume.fire(Ok(Some(value)));
    }

    /// Fails the work; the failure is escalated by the waiting job.
    pub fn fail(self, failure: Failure) {
        self.resume.fire(Err(failure));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<Wake>>>, impl Fn(Wake) + Send + Clone + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |wake| sink.lock().unwrap().push(wake))
    }

    #[test]
    fn test_fire_delivers_once() {
        let (seen, sink) = recorder();
        Resume::new("test", sink).fire(Ok(None));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_drop_delivers_abandoned() {
        let (seen, sink) = recorder();
        drop(Resume::new("test", sink));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let failure = seen[0].as_ref().unwrap_err();
        assert!(matches!(
            failure.kernel_failure(),
            Some(KernelFailure::Abandoned { what: "test" })
        ));
    }

    #[test]
    fn test_completion_with_value() {
        let (seen, sink) = recorder();
        AsyncCompletion::new(Resume::new("body", sink)).complete_with(Arc::new(7u32));

        let seen = seen.lock().unwrap();
        let value = seen[0].as_ref().unwrap().as_ref().unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&7));
    }
}
