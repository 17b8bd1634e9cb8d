//! Kernel timer for join and resource timeouts.
//!
//! A dedicated single-worker tokio runtime sleeps on behalf of suspended
//! jobs; no kernel thread ever blocks waiting for a deadline.

use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::lock;

pub(crate) struct Timer {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
}

impl Timer {
    pub(crate) fn start() -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ferrule-timer")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
        })
    }

    pub(crate) fn handle(&self) -> TimerHandle {
        TimerHandle(self.handle.clone())
    }

    /// Stops the timer; pending deadlines never fire.
    pub(crate) fn stop(&self) {
        if let Some(runtime) = lock(&self.runtime).take() {
            debug!("Stopping kernel timer");
            runtime.shutdown_background();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
pub(crate) struct TimerHandle(Handle);

impl TimerHandle {
    /// Runs `f` after `delay` unless the returned guard is dropped first.
    pub(crate) fn schedule<F>(&self, delay: Duration, f: F) -> TimerGuard
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.0.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        TimerGuard(task)
    }
}

/// Cancels its deadline when dropped.
pub(crate) struct TimerGuard(JoinHandle<()>);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
