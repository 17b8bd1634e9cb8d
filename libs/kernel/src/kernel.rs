//! The linked kernel and its public entry points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ferrule_id::RequestId;
use tracing::{debug, info};

use crate::builder::KernelBuilder;
use crate::config::KernelConfig;
use crate::descriptor::{FunctionDescriptor, FunctionIndex, GovernanceIndex, Scope, TeamIndex, Value};
use crate::error::{ClassTable, Failure, KernelError};
use crate::flow::{FlowCallback, FlowHandle, FlowParent};
use crate::governance::GovernanceUnit;
use crate::job::{JobNode, JobObserver};
use crate::request::{ProcessHandle, Request};
use crate::scope::{Layout, ScopeContainer};
use crate::team::Team;
use crate::timer::{Timer, TimerHandle};
use crate::worker::{self, Pools};

static NEXT_KERNEL: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_kernel_id() -> u64 {
    NEXT_KERNEL.fetch_add(1, Ordering::Relaxed)
}

/// Office-level observer of failures that reached a process boundary.
pub type UnhandledHandler = Arc<dyn Fn(RequestId, &Failure) + Send + Sync>;

/// Resource layout of each scope.
pub(crate) struct Layouts {
    pub(crate) invocation: Layout,
    pub(crate) thread: Layout,
    pub(crate) request: Layout,
}

/// Everything linked; shared by every request, flow and job.
pub(crate) struct KernelShared {
    pub(crate) id: u64,
    pub(crate) config: KernelConfig,
    pub(crate) classes: ClassTable,
    pub(crate) functions: Vec<FunctionDescriptor>,
    pub(crate) names: HashMap<String, FunctionIndex>,
    pub(crate) layouts: Layouts,
    pub(crate) governance: Arc<[GovernanceUnit]>,
    pub(crate) teams: Vec<Arc<dyn Team>>,
    pub(crate) passive: Arc<dyn Team>,
    pub(crate) pools: Pools,
    pub(crate) timer: Timer,
    pub(crate) observer: Option<Arc<dyn JobObserver>>,
    pub(crate) unhandled: Option<UnhandledHandler>,
    pub(crate) shut_down: AtomicBool,
}

impl KernelShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn descriptor(&self, index: FunctionIndex) -> &FunctionDescriptor {
        &self.functions[index.0]
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<FunctionIndex> {
        self.names.get(name).copied()
    }

    pub(crate) fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub(crate) fn timer(&self) -> TimerHandle {
        self.timer.handle()
    }

    pub(crate) fn pools(&self) -> Pools {
        self.pools.clone()
    }

    pub(crate) fn observer(&self) -> Option<&Arc<dyn JobObserver>> {
        self.observer.as_ref()
    }

    /// A fresh, empty container for `scope`.
    pub(crate) fn scope_container(&self, scope: Scope) -> Arc<ScopeContainer> {
        let layout = match scope {
            Scope::Invocation => &self.layouts.invocation,
            Scope::Thread => &self.layouts.thread,
            Scope::Request => &self.layouts.request,
        };
        ScopeContainer::new(
            scope,
            layout.clone(),
            self.config.resource_timeout(),
            Some(self.timer.handle()),
        )
    }

    pub(crate) fn governance_units(&self) -> Arc<[GovernanceUnit]> {
        self.governance.clone()
    }

    pub(crate) fn governance_count(&self) -> usize {
        self.governance.len()
    }

    pub(crate) fn team_for(&self, team: Option<TeamIndex>) -> &dyn Team {
        match team.and_then(|t| self.teams.get(t.0)) {
            Some(team) => team.as_ref(),
            None => self.passive.as_ref(),
        }
    }

    pub(crate) fn report_unhandled(&self, request: RequestId, failure: &Failure) {
        if let Some(handler) = &self.unhandled {
            handler(request, failure);
        }
    }
}

// =============================================================================
// Public facade
// =============================================================================

/// A linked kernel. Cheap to clone; every clone drives the same teams.
#[derive(Clone)]
pub struct Kernel {
    shared: Arc<KernelShared>,
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    pub(crate) fn from_shared(shared: Arc<KernelShared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.shared.config
    }

    pub fn classes(&self) -> &ClassTable {
        &self.shared.classes
    }

    pub fn descriptor(&self, function: &str) -> Option<&FunctionDescriptor> {
        self.shared.lookup(function).map(|i| self.shared.descriptor(i))
    }

    /// Governance unit position by name, for descriptors built elsewhere.
    pub fn governance_index(&self, name: &str) -> Option<GovernanceIndex> {
        self.shared
            .governance
            .iter()
            .position(|u| u.governance.name() == name)
            .map(GovernanceIndex)
    }

    fn target(&self, function: &str, parameter: Option<&Value>) -> Result<FunctionIndex, KernelError> {
        if self.is_shut_down() {
            return Err(KernelError::ShutDown);
        }
        let index = self
            .shared
            .lookup(function)
            .ok_or_else(|| KernelError::UnknownFunction(function.to_string()))?;
        let descriptor = self.shared.descriptor(index);
        if !descriptor.accepts(parameter) {
            return Err(KernelError::ParameterType {
                function: function.to_string(),
                expected: descriptor.parameter_type().map(|t| t.name()).unwrap_or("()"),
            });
        }
        Ok(index)
    }

    /// Starts a new request running `function`. The handle resolves once
    /// every flow of the request has terminated and its scope is released.
    pub fn invoke(&self, function: &str, parameter: Option<Value>) -> Result<ProcessHandle, KernelError> {
        let target = self.target(function, parameter.as_ref())?;
        let request = Request::open(&self.shared);
        debug!(request_id = %request.id(), function = %function, "Invoking function");
        let handle = request.handle();
        JobNode::start_flow(&self.shared, &request, target, parameter, FlowParent::Root, None);
        Ok(handle)
    }

    /// Starts `function` as a parallel flow in a fresh request, for
    /// transport layers offloading delegated work. `callback` receives the
    /// flow's outcome exactly once.
    pub fn instigate(
        &self,
        function: &str,
        parameter: Option<Value>,
        callback: FlowCallback,
    ) -> Result<FlowHandle, KernelError> {
        let target = self.target(function, parameter.as_ref())?;
        let request = Request::open(&self.shared);
        debug!(request_id = %request.id(), function = %function, "Instigating flow");
        let flow = JobNode::start_flow(&self.shared, &request, target, parameter, FlowParent::Root, Some(callback));
        Ok(FlowHandle::new(flow))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Stops every team, drains every pool once and stops the timer.
    /// Later invocations fail with [`KernelError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(kernel = self.shared.id, "Shutting down kernel");

        for team in &self.shared.teams {
            team.stop();
        }
        self.shared.passive.stop();
        worker::exit_current_thread(self.shared.id, &self.shared.pools);
        for pool in self.shared.pools.iter() {
            info!(pool = %pool.name(), "Draining pool");
            pool.drain();
        }
        self.shared.timer.stop();
        info!(kernel = self.shared.id, "Kernel shut down");
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.shared.id)
            .field("functions", &self.shared.functions.len())
            .field("teams", &self.shared.teams.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
