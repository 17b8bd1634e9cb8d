//! Teams: where jobs run.
//!
//! A [`WorkerTeam`] owns a named set of OS threads backed by a dedicated
//! tokio runtime. A [`PassiveTeam`] runs each job on the thread that
//! submitted it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

use crate::error::{Failure, KernelFailure, LinkError};
use crate::job::JobNode;
use crate::lock;
use crate::worker::{self, Pools};

/// A job handed to a team. Dropping it unrun abandons the job.
pub(crate) struct Assignment(Option<Arc<JobNode>>);

impl Assignment {
    pub(crate) fn new(job: Arc<JobNode>) -> Self {
        Self(Some(job))
    }

    pub(crate) fn run(mut self) {
        if let Some(job) = self.0.take() {
            job.run();
        }
    }
}

impl Drop for Assignment {
    fn drop(&mut self) {
        if let Some(job) = self.0.take() {
            debug!(job_id = %job.id(), "Assignment dropped before running");
            job.abandon(Failure::kernel(KernelFailure::ShutDown));
        }
    }
}

pub(crate) trait Team: Send + Sync {
    fn name(&self) -> &str;

    /// Accepts a job for execution, or hands it back once stopped.
    fn assign(&self, assignment: Assignment) -> Result<(), Assignment>;

    /// Stops accepting jobs and lets the team's threads exit.
    fn stop(&self);
}

// =============================================================================
// Worker team
// =============================================================================

pub(crate) struct WorkerTeam {
    name: String,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    shutdown_timeout: Duration,
    stopped: AtomicBool,
}

impl WorkerTeam {
    /// Starts the team's threads. Each thread, as it stops, releases its
    /// thread scope for `kernel` and notifies every pool.
    pub(crate) fn start(
        name: &str,
        threads: usize,
        shutdown_timeout: Duration,
        kernel: u64,
        pools: Pools,
    ) -> Result<Self, LinkError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name(format!("ferrule-{name}"))
            .on_thread_stop(move || worker::exit_current_thread(kernel, &pools))
            .build()
            .map_err(|e| LinkError::TeamStart {
                team: name.to_string(),
                reason: e.to_string(),
            })?;
        info!(team = %name, threads, "Worker team started");
        Ok(Self {
            name: name.to_string(),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            shutdown_timeout,
            stopped: AtomicBool::new(false),
        })
    }
}

impl Drop for WorkerTeam {
    fn drop(&mut self) {
        if let Some(runtime) = lock(&self.runtime).take() {
            runtime.shutdown_background();
        }
    }
}

impl Team for WorkerTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign(&self, assignment: Assignment) -> Result<(), Assignment> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(assignment);
        }
        self.handle.spawn(async move { assignment.run() });
        Ok(())
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(runtime) = lock(&self.runtime).take() else {
            return;
        };
        info!(team = %self.name, "Stopping worker team");
        // A runtime cannot be waited on from inside a runtime.
        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(self.shutdown_timeout);
        }
    }
}

// =============================================================================
// Passive team
// =============================================================================

thread_local! {
    /// Jobs submitted on this thread while it is already running a passive
    /// job; drained by the outermost submission.
    static TRAMPOLINE: RefCell<Option<VecDeque<Assignment>>> = const { RefCell::new(None) };
}

struct Draining;

impl Drop for Draining {
    fn drop(&mut self) {
        let leftover = TRAMPOLINE.try_with(|queue| queue.borrow_mut().take()).ok().flatten();
        drop(leftover);
    }
}

fn next_queued() -> Option<Assignment> {
    TRAMPOLINE
        .try_with(|queue| queue.borrow_mut().as_mut().and_then(VecDeque::pop_front))
        .ok()
        .flatten()
}

pub(crate) struct PassiveTeam {
    name: String,
    stopped: AtomicBool,
}

impl PassiveTeam {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stopped: AtomicBool::new(false),
        }
    }
}

impl Team for PassiveTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign(&self, assignment: Assignment) -> Result<(), Assignment> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(assignment);
        }

        let mut first = Some(assignment);
        let draining = TRAMPOLINE.try_with(|queue| {
            let mut queue = queue.borrow_mut();
            match queue.as_mut() {
                Some(pending) => {
                    pending.extend(first.take());
                    false
                }
                None => {
                    *queue = Some(VecDeque::new());
                    true
                }
            }
        });

        match (draining, first) {
            (Ok(true), Some(assignment)) => {
                let _draining = Draining;
                let mut next = Some(assignment);
                while let Some(assignment) = next {
                    assignment.run();
                    next = next_queued();
                }
                Ok(())
            }
            (Err(_), Some(assignment)) => Err(assignment),
            _ => Ok(()),
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}
