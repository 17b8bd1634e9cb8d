//! Function execution kernel.
//!
//! The kernel binds units of application logic ("functions") to their
//! declared resource dependencies, schedules them onto teams of worker
//! threads, and carries each invocation ("job") through a fixed lifecycle:
//! dependency resolution, governance activation, pre-duties, the function
//! body, post-duties, governance deactivation, then completion or
//! escalation.
//!
//! # Invariants
//!
//! - A job runs on exactly one thread at a time and never blocks a thread
//!   while waiting; every wait is a suspension with a single-fire wake-up.
//! - A resource is sourced at most once per scope instance and returned to
//!   its pool exactly once, when its scope is released.
//! - Every instigated flow terminates exactly once, and a request ends only
//!   after all of its flows have.
//! - A failure is routed to the first matching escalation entry of the job
//!   that raised it, then outward along the flows that led to it.

mod builder;
mod config;
mod context;
mod descriptor;
mod duty;
mod error;
mod escalation;
mod flow;
mod governance;
mod job;
mod kernel;
mod request;
mod scope;
mod slot;
mod team;
mod timer;
mod wake;
mod worker;

pub mod resource;
pub mod telemetry;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use builder::{FunctionSpec, GovernanceRef, KernelBuilder, ResourceRef};
pub use config::KernelConfig;
pub use context::{factory, stateless, FunctionContext, FunctionFactory, Instigated, ManagedFunction};
pub use descriptor::{
    Dependency, DependencyMap, DutyBinding, FlowDescriptor, FunctionDescriptor, FunctionIndex, GovernanceIndex,
    ParameterType, Scope, Strategy, TeamIndex, Value,
};
pub use duty::{duty, Duty, DutyContext};
pub use error::{Cause, ClassTable, Failure, FailureClass, KernelError, KernelFailure, LinkError, ResourceError};
pub use escalation::{EscalationEntry, EscalationProcedure};
pub use flow::{FlowCallback, FlowHandle, FlowOutcome};
pub use governance::{ActiveGovernance, DeactivationStrategy, Governance, GovernanceContext, UnknownStrategy};
pub use job::{JobObserver, JobState};
pub use kernel::{Kernel, UnhandledHandler};
pub use request::{ProcessHandle, ProcessOutcome};
pub use scope::{recycle, Recycle, ResourceSpec, Supply};
pub use wake::AsyncCompletion;

pub use ferrule_id::{FlowId, JobId, RequestId, ResourceId};

/// Locks a kernel-internal mutex. User code runs under `catch_unwind`, so a
/// poisoned lock still guards consistent state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
