//! Declaring and linking a kernel.
//!
//! Functions refer to each other by name while being declared. `link`
//! resolves every name to an arena index, validates the graph, starts the
//! teams and the timer, and returns the running [`Kernel`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use ferrule_id::RequestId;
use tracing::info;

use crate::config::KernelConfig;
use crate::context::{self, FunctionContext, FunctionFactory};
use crate::descriptor::{
    Dependency, DependencyMap, DutyBinding, FlowDescriptor, FunctionDescriptor, FunctionIndex, ParameterType,
    Scope, Strategy, TeamIndex,
};
use crate::duty::Duty;
use crate::error::{ClassTable, Failure, FailureClass, LinkError};
use crate::escalation::{EscalationEntry, EscalationProcedure};
use crate::governance::{DeactivationStrategy, Governance, GovernanceUnit};
use crate::job::JobObserver;
use crate::kernel::{self, Kernel, KernelShared, Layouts, UnhandledHandler};
use crate::resource::{BoundedPool, PoolConfig, ResourcePool, ResourceSource};
use crate::scope::{Layout, ResourceSpec, Supply};
use crate::team::{PassiveTeam, Team, WorkerTeam};
use crate::timer::Timer;

/// A declared resource, for use in [`FunctionSpec::depend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRef {
    scope: Scope,
    slot: usize,
}

impl ResourceRef {
    pub fn scope(&self) -> Scope {
        self.scope
    }
}

/// A declared governance unit, for use in [`FunctionSpec::govern`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernanceRef(usize);

enum DependencyDecl {
    Parameter,
    Resource(ResourceRef),
}

struct DutyDecl {
    name: String,
    duty: Arc<dyn Duty>,
    dependencies: Vec<usize>,
}

/// Declaration of one function.
pub struct FunctionSpec {
    module: String,
    name: String,
    factory: Arc<dyn FunctionFactory>,
    parameter: Option<ParameterType>,
    team: Option<String>,
    dependencies: Vec<DependencyDecl>,
    governance: Vec<GovernanceRef>,
    pre_duties: Vec<DutyDecl>,
    post_duties: Vec<DutyDecl>,
    flows: Vec<(String, Strategy)>,
    next: Option<String>,
    escalation: Vec<(FailureClass, String)>,
}

impl FunctionSpec {
    pub fn new(module: impl Into<String>, name: impl Into<String>, factory: Arc<dyn FunctionFactory>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            factory,
            parameter: None,
            team: None,
            dependencies: Vec::new(),
            governance: Vec::new(),
            pre_duties: Vec::new(),
            post_duties: Vec::new(),
            flows: Vec::new(),
            next: None,
            escalation: Vec::new(),
        }
    }

    /// A function whose body is a plain closure.
    pub fn stateless<F>(module: impl Into<String>, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut FunctionContext<'_>) -> Result<(), Failure> + Send + Sync + 'static,
    {
        Self::new(module, name, context::stateless(body))
    }

    /// Declares the parameter type; invocations with another type are
    /// rejected.
    pub fn parameter<T: Any>(mut self) -> Self {
        self.parameter = Some(ParameterType::of::<T>());
        self
    }

    /// Runs the function on the named team instead of the submitting thread.
    pub fn team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// Next dependency is the invocation parameter itself.
    pub fn depend_on_parameter(mut self) -> Self {
        self.dependencies.push(DependencyDecl::Parameter);
        self
    }

    pub fn depend(mut self, resource: ResourceRef) -> Self {
        self.dependencies.push(DependencyDecl::Resource(resource));
        self
    }

    pub fn govern(mut self, governance: GovernanceRef) -> Self {
        self.governance.push(governance);
        self
    }

    /// Adds a pre-duty reading the given dependency indices.
    pub fn pre_duty(mut self, name: impl Into<String>, duty: Arc<dyn Duty>, dependencies: &[usize]) -> Self {
        self.pre_duties.push(DutyDecl {
            name: name.into(),
            duty,
            dependencies: dependencies.to_vec(),
        });
        self
    }

    /// Adds a post-duty reading the given dependency indices.
    pub fn post_duty(mut self, name: impl Into<String>, duty: Arc<dyn Duty>, dependencies: &[usize]) -> Self {
        self.post_duties.push(DutyDecl {
            name: name.into(),
            duty,
            dependencies: dependencies.to_vec(),
        });
        self
    }

    /// Appends a flow to the flow table; its position is the index
    /// [`FunctionContext::instigate`] takes.
    pub fn flow(mut self, target: impl Into<String>, strategy: Strategy) -> Self {
        self.flows.push((target.into(), strategy));
        self
    }

    pub fn next(mut self, target: impl Into<String>) -> Self {
        self.next = Some(target.into());
        self
    }

    /// Routes failures of `class` (or a derived class) to `handler`.
    /// Entries are tried in declaration order.
    pub fn escalate(mut self, class: FailureClass, handler: impl Into<String>) -> Self {
        self.escalation.push((class, handler.into()));
        self
    }

    /// Default handler for any failure; must be declared last.
    pub fn escalate_any(self, handler: impl Into<String>) -> Self {
        self.escalate(FailureClass::ANY, handler)
    }
}

enum TeamDecl {
    Worker { name: String, threads: Option<usize> },
    Passive { name: String },
}

impl TeamDecl {
    fn name(&self) -> &str {
        match self {
            Self::Worker { name, .. } | Self::Passive { name } => name,
        }
    }
}

/// Collects declarations and links them into a [`Kernel`].
pub struct KernelBuilder {
    config: KernelConfig,
    teams: Vec<TeamDecl>,
    invocation: Vec<Arc<ResourceSpec>>,
    thread: Vec<Arc<ResourceSpec>>,
    request: Vec<Arc<ResourceSpec>>,
    governance: Vec<(Arc<dyn Governance>, Option<DeactivationStrategy>)>,
    classes: ClassTable,
    functions: Vec<FunctionSpec>,
    unhandled: Option<UnhandledHandler>,
    observer: Option<Arc<dyn JobObserver>>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            teams: Vec::new(),
            invocation: Vec::new(),
            thread: Vec::new(),
            request: Vec::new(),
            governance: Vec::new(),
            classes: ClassTable::new(),
            functions: Vec::new(),
            unhandled: None,
            observer: None,
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// A worker team sized by `default_team_threads`.
    pub fn worker_team(&mut self, name: impl Into<String>) -> &mut Self {
        self.teams.push(TeamDecl::Worker {
            name: name.into(),
            threads: None,
        });
        self
    }

    pub fn worker_team_sized(&mut self, name: impl Into<String>, threads: usize) -> &mut Self {
        self.teams.push(TeamDecl::Worker {
            name: name.into(),
            threads: Some(threads.max(1)),
        });
        self
    }

    /// A team running its jobs on whichever thread submits them.
    pub fn passive_team(&mut self, name: impl Into<String>) -> &mut Self {
        self.teams.push(TeamDecl::Passive { name: name.into() });
        self
    }

    /// A bounded pool over `source`, sized by `pool_max_size`.
    pub fn pool(&self, source: Arc<dyn ResourceSource>) -> BoundedPool {
        BoundedPool::new(source, PoolConfig::from(&self.config))
    }

    pub fn resource(&mut self, spec: ResourceSpec) -> ResourceRef {
        let scope = spec.scope;
        let layout = match scope {
            Scope::Invocation => &mut self.invocation,
            Scope::Thread => &mut self.thread,
            Scope::Request => &mut self.request,
        };
        layout.push(Arc::new(spec));
        ResourceRef {
            scope,
            slot: layout.len() - 1,
        }
    }

    /// A governance unit deactivated per the configured default strategy.
    pub fn governance(&mut self, governance: Arc<dyn Governance>) -> GovernanceRef {
        self.governance.push((governance, None));
        GovernanceRef(self.governance.len() - 1)
    }

    pub fn governance_with(&mut self, governance: Arc<dyn Governance>, strategy: DeactivationStrategy) -> GovernanceRef {
        self.governance.push((governance, Some(strategy)));
        GovernanceRef(self.governance.len() - 1)
    }

    pub fn failure_class(&mut self, name: &str, parent: FailureClass) -> Result<FailureClass, LinkError> {
        self.classes.declare(name, parent)
    }

    pub fn function(&mut self, spec: FunctionSpec) -> &mut Self {
        self.functions.push(spec);
        self
    }

    /// Observes every failure that reaches a process boundary unhandled.
    pub fn escalation_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(RequestId, &Failure) + Send + Sync + 'static,
    {
        self.unhandled = Some(Arc::new(handler));
        self
    }

    pub fn observer(&mut self, observer: Arc<dyn JobObserver>) -> &mut Self {
        self.observer = Some(observer);
        self
    }

    pub fn link(self) -> Result<Kernel, LinkError> {
        let mut names = HashMap::new();
        for (i, spec) in self.functions.iter().enumerate() {
            if names.insert(spec.name.clone(), FunctionIndex(i)).is_some() {
                return Err(LinkError::DuplicateFunction(spec.name.clone()));
            }
        }
        let team_names: HashMap<&str, TeamIndex> = self
            .teams
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name(), TeamIndex(i)))
            .collect();

        let layouts = Layouts {
            invocation: Layout::from(self.invocation),
            thread: Layout::from(self.thread),
            request: Layout::from(self.request),
        };
        let linker = Linker {
            specs: &self.functions,
            names: &names,
            teams: &team_names,
            layouts: &layouts,
            classes: &self.classes,
            governance: self.governance.len(),
        };
        let functions = self
            .functions
            .iter()
            .map(|spec| linker.descriptor(spec))
            .collect::<Result<Vec<_>, _>>()?;

        let governance: Arc<[GovernanceUnit]> = self
            .governance
            .into_iter()
            .map(|(governance, strategy)| GovernanceUnit {
                governance,
                strategy: strategy.unwrap_or(self.config.governance_deactivation),
            })
            .collect();

        let id = kernel::next_kernel_id();
        let pools = collect_pools(&layouts);
        let mut teams: Vec<Arc<dyn Team>> = Vec::with_capacity(self.teams.len());
        for decl in &self.teams {
            let team: Arc<dyn Team> = match decl {
                TeamDecl::Worker { name, threads } => Arc::new(WorkerTeam::start(
                    name,
                    threads.unwrap_or(self.config.default_team_threads),
                    self.config.team_shutdown_timeout(),
                    id,
                    pools.clone(),
                )?),
                TeamDecl::Passive { name } => Arc::new(PassiveTeam::new(name)),
            };
            teams.push(team);
        }
        let timer = Timer::start().map_err(|e| LinkError::TeamStart {
            team: "timer".to_string(),
            reason: e.to_string(),
        })?;

        info!(
            kernel = id,
            functions = functions.len(),
            teams = teams.len(),
            pools = pools.len(),
            "Kernel linked"
        );

        let shared = KernelShared {
            id,
            config: self.config,
            classes: self.classes,
            functions,
            names,
            layouts,
            governance,
            teams,
            passive: Arc::new(PassiveTeam::new("passive")),
            pools,
            timer,
            observer: self.observer,
            unhandled: self.unhandled,
            shut_down: AtomicBool::new(false),
        };
        Ok(Kernel::from_shared(Arc::new(shared)))
    }
}

/// Every distinct pool the layouts borrow from.
fn collect_pools(layouts: &Layouts) -> Arc<[Arc<dyn ResourcePool>]> {
    let mut pools: Vec<Arc<dyn ResourcePool>> = Vec::new();
    let specs = layouts
        .invocation
        .iter()
        .chain(layouts.thread.iter())
        .chain(layouts.request.iter());
    for spec in specs {
        if let Supply::Pool(pool) = &spec.supply {
            if !pools.iter().any(|p| Arc::ptr_eq(p, pool)) {
                pools.push(pool.clone());
            }
        }
    }
    pools.into()
}

struct Linker<'a> {
    specs: &'a [FunctionSpec],
    names: &'a HashMap<String, FunctionIndex>,
    teams: &'a HashMap<&'a str, TeamIndex>,
    layouts: &'a Layouts,
    classes: &'a ClassTable,
    governance: usize,
}

impl Linker<'_> {
    fn function(&self, from: &str, target: &str) -> Result<FunctionIndex, LinkError> {
        self.names.get(target).copied().ok_or_else(|| LinkError::UnknownTarget {
            function: from.to_string(),
            target: target.to_string(),
        })
    }

    fn layout(&self, scope: Scope) -> &Layout {
        match scope {
            Scope::Invocation => &self.layouts.invocation,
            Scope::Thread => &self.layouts.thread,
            Scope::Request => &self.layouts.request,
        }
    }

    fn descriptor(&self, spec: &FunctionSpec) -> Result<FunctionDescriptor, LinkError> {
        let name = spec.name.as_str();

        let team = match &spec.team {
            Some(team) => Some(self.teams.get(team.as_str()).copied().ok_or_else(|| LinkError::UnknownTeam {
                function: name.to_string(),
                team: team.clone(),
            })?),
            None => None,
        };

        let mut dependencies = DependencyMap::default();
        for decl in &spec.dependencies {
            match decl {
                DependencyDecl::Parameter => dependencies.push(Dependency::Parameter, None),
                DependencyDecl::Resource(r) => {
                    let resource = self.layout(r.scope).get(r.slot).ok_or(LinkError::UnknownReference {
                        function: name.to_string(),
                        what: "resource",
                        index: r.slot,
                    })?;
                    dependencies.push(
                        Dependency::Resource {
                            scope: r.scope,
                            slot: r.slot,
                        },
                        Some(resource.name().to_string()),
                    );
                }
            }
        }

        let mut governance = vec![false; self.governance];
        for g in &spec.governance {
            let flag = governance.get_mut(g.0).ok_or(LinkError::UnknownReference {
                function: name.to_string(),
                what: "governance unit",
                index: g.0,
            })?;
            *flag = true;
        }

        let pre_duties = self.duties(name, &spec.pre_duties, dependencies.len())?;
        let post_duties = self.duties(name, &spec.post_duties, dependencies.len())?;

        let flows = spec
            .flows
            .iter()
            .map(|(target, strategy)| {
                Ok(FlowDescriptor {
                    target: self.function(name, target)?,
                    strategy: *strategy,
                })
            })
            .collect::<Result<Vec<_>, LinkError>>()?;

        let next = spec
            .next
            .as_deref()
            .map(|target| self.function(name, target))
            .transpose()?;

        let mut entries = Vec::with_capacity(spec.escalation.len());
        for (class, handler) in &spec.escalation {
            if class.index() >= self.classes.len() {
                return Err(LinkError::UnknownClass(class.index()));
            }
            let target = self.function(name, handler)?;
            let accepts_failure = self.specs[target.0]
                .parameter
                .is_none_or(|p| p.is::<Failure>());
            if !accepts_failure {
                return Err(LinkError::HandlerParameter {
                    function: name.to_string(),
                    handler: handler.clone(),
                });
            }
            entries.push(EscalationEntry { class: *class, target });
        }
        let escalation = EscalationProcedure::new(name, entries)?;

        Ok(FunctionDescriptor {
            module: spec.module.clone(),
            name: name.to_string(),
            factory: spec.factory.clone(),
            parameter: spec.parameter,
            team,
            dependencies,
            governance,
            pre_duties,
            post_duties,
            flows,
            next,
            escalation,
        })
    }

    fn duties(&self, function: &str, duties: &[DutyDecl], available: usize) -> Result<Vec<DutyBinding>, LinkError> {
        duties
            .iter()
            .map(|decl| {
                if let Some(&index) = decl.dependencies.iter().find(|&&i| i >= available) {
                    return Err(LinkError::DutyDependency {
                        function: function.to_string(),
                        duty: decl.name.clone(),
                        index,
                        available,
                    });
                }
                Ok(DutyBinding {
                    name: decl.name.clone(),
                    duty: decl.duty.clone(),
                    dependencies: decl.dependencies.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::FnSource;

    fn noop(name: &str) -> FunctionSpec {
        FunctionSpec::stateless("tests", name, |_| Ok(()))
    }

    #[test]
    fn test_pool_sized_from_config() {
        let config = KernelConfig {
            pool_max_size: 3,
            ..KernelConfig::default()
        };
        let builder = KernelBuilder::new().with_config(config);
        let pool = builder.pool(Arc::new(FnSource::new("conn", || Ok(0u8))));
        assert_eq!(pool.config().max_size, 3);
        assert_eq!(pool.config().max_idle, 3);
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let mut builder = KernelBuilder::new();
        builder.function(noop("a")).function(noop("a"));
        let err = builder.link().unwrap_err();
        assert!(matches!(err, LinkError::DuplicateFunction(name) if name == "a"));
    }

    #[test]
    fn test_unknown_next_rejected() {
        let mut builder = KernelBuilder::new();
        builder.function(noop("a").next("missing"));
        let err = builder.link().unwrap_err();
        assert!(matches!(err, LinkError::UnknownTarget { target, .. } if target == "missing"));
    }

    #[test]
    fn test_default_escalation_must_be_last() {
        let mut builder = KernelBuilder::new();
        builder
            .function(noop("handler"))
            .function(noop("a").escalate_any("handler").escalate(FailureClass::KERNEL, "handler"));
        assert!(matches!(builder.link(), Err(LinkError::DefaultEscalationNotLast(_))));
    }

    #[test]
    fn test_handler_must_take_failure() {
        let mut builder = KernelBuilder::new();
        builder
            .function(noop("handler").parameter::<u32>())
            .function(noop("a").escalate_any("handler"));
        assert!(matches!(builder.link(), Err(LinkError::HandlerParameter { .. })));
    }

    #[test]
    fn test_duty_dependency_out_of_range() {
        let mut builder = KernelBuilder::new();
        let counter = builder.resource(ResourceSpec::source(
            "counter",
            Scope::Invocation,
            Arc::new(FnSource::new("counter", || Ok(0u64))),
        ));
        builder.function(noop("a").depend(counter).pre_duty(
            "check",
            crate::duty::duty(|_| Ok(())),
            &[0, 1],
        ));
        let err = builder.link().unwrap_err();
        assert!(matches!(err, LinkError::DutyDependency { index: 1, available: 1, .. }));
    }

    #[test]
    fn test_unknown_team_rejected() {
        let mut builder = KernelBuilder::new();
        builder.function(noop("a").team("io"));
        assert!(matches!(builder.link(), Err(LinkError::UnknownTeam { .. })));
    }

    #[test]
    fn test_link_resolves_names() {
        let mut builder = KernelBuilder::new();
        let counter = builder.resource(ResourceSpec::source(
            "counter",
            Scope::Thread,
            Arc::new(FnSource::new("counter", || Ok(0u64))),
        ));
        builder.passive_team("inline");
        builder
            .function(noop("b"))
            .function(
                noop("a")
                    .team("inline")
                    .depend_on_parameter()
                    .depend(counter)
                    .flow("b", Strategy::Parallel)
                    .next("b"),
            );
        let kernel = builder.link().unwrap();

        let a = kernel.descriptor("a").unwrap();
        assert_eq!(a.team(), Some(TeamIndex(0)));
        assert_eq!(a.dependencies().len(), 2);
        assert_eq!(a.dependencies().translate(0), Some(Dependency::Parameter));
        assert_eq!(a.dependencies().position("counter"), Some(1));
        assert_eq!(a.next(), Some(FunctionIndex(0)));
        assert_eq!(a.flows()[0].strategy, Strategy::Parallel);
        kernel.shutdown();
    }
}
