//! Linked function metadata.
//!
//! Descriptors live in a flat arena owned by the kernel and reference each
//! other (flow targets, next-in-sequence, escalation targets) by
//! [`FunctionIndex`], so the graph has no owning cycles. They are built by
//! [`KernelBuilder`](crate::KernelBuilder) and never change after linking.

use std::any::{self, Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::FunctionFactory;
use crate::duty::Duty;
use crate::escalation::EscalationProcedure;

/// A dynamically typed value: parameters, resources, results.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Position of a function in the kernel's descriptor arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionIndex(pub(crate) usize);

/// Position of a team in the kernel's team table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TeamIndex(pub(crate) usize);

/// Position of a governance unit in the kernel's governance table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GovernanceIndex(pub(crate) usize);

impl GovernanceIndex {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Lifetime a resource instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One instance per job.
    Invocation,
    /// One instance per worker thread.
    Thread,
    /// One instance per request (process).
    Request,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invocation => "invocation",
            Self::Thread => "thread",
            Self::Request => "request",
        };
        f.write_str(name)
    }
}

/// Where a function's dependency comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    /// The invocation parameter, passed through verbatim.
    Parameter,
    /// A slot in the table of the given scope.
    Resource { scope: Scope, slot: usize },
}

/// A function's dependencies in declaration order, with the scope slot each
/// local index translates to.
#[derive(Debug, Clone, Default)]
pub struct DependencyMap {
    entries: Vec<Dependency>,
    keys: Vec<Option<String>>,
}

impl DependencyMap {
    pub(crate) fn push(&mut self, dependency: Dependency, key: Option<String>) {
        self.entries.push(dependency);
        self.keys.push(key);
    }

    /// Maps a function-local index to its scope slot.
    pub fn translate(&self, local: usize) -> Option<Dependency> {
        self.entries.get(local).copied()
    }

    /// Local index of the dependency with the given resource name.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k.as_deref() == Some(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Declared type of an invocation parameter.
#[derive(Clone, Copy)]
pub struct ParameterType {
    id: TypeId,
    name: &'static str,
}

impl ParameterType {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn accepts(&self, value: &Value) -> bool {
        // Deref to the trait object; the Arc itself has its own TypeId.
        Any::type_id(value.as_ref()) == self.id
    }

    pub(crate) fn is<T: Any>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for ParameterType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ParameterType {}

impl fmt::Debug for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// How an instigated flow relates to its instigator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Chained after the instigating job, in the same flow. The instigator
    /// completes only once the chain terminates.
    Sequential,
    /// A new flow sharing the request, running independently.
    Parallel,
}

/// A flow reachable from a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowDescriptor {
    pub target: FunctionIndex,
    pub strategy: Strategy,
}

/// A pre- or post-duty bound to a function.
#[derive(Clone)]
pub struct DutyBinding {
    pub name: String,
    pub duty: Arc<dyn Duty>,
    /// Local dependency indices the duty reads, in order.
    pub dependencies: Vec<usize>,
}

impl fmt::Debug for DutyBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DutyBinding")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Immutable metadata for one function.
pub struct FunctionDescriptor {
    pub(crate) module: String,
    pub(crate) name: String,
    pub(crate) factory: Arc<dyn FunctionFactory>,
    pub(crate) parameter: Option<ParameterType>,
    pub(crate) team: Option<TeamIndex>,
    pub(crate) dependencies: DependencyMap,
    /// One flag per kernel governance unit.
    pub(crate) governance: Vec<bool>,
    pub(crate) pre_duties: Vec<DutyBinding>,
    pub(crate) post_duties: Vec<DutyBinding>,
    pub(crate) flows: Vec<FlowDescriptor>,
    pub(crate) next: Option<FunctionIndex>,
    pub(crate) escalation: EscalationProcedure,
}

impl FunctionDescriptor {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter_type(&self) -> Option<ParameterType> {
        self.parameter
    }

    pub fn team(&self) -> Option<TeamIndex> {
        self.team
    }

    pub fn dependencies(&self) -> &DependencyMap {
        &self.dependencies
    }

    pub fn requires_governance(&self, index: GovernanceIndex) -> bool {
        self.governance.get(index.0).copied().unwrap_or(false)
    }

    pub fn pre_duties(&self) -> &[DutyBinding] {
        &self.pre_duties
    }

    pub fn post_duties(&self) -> &[DutyBinding] {
        &self.post_duties
    }

    pub fn flows(&self) -> &[FlowDescriptor] {
        &self.flows
    }

    pub fn next(&self) -> Option<FunctionIndex> {
        self.next
    }

    pub fn escalation(&self) -> &EscalationProcedure {
        &self.escalation
    }

    /// True when `parameter` satisfies the declared parameter type. A
    /// function without a declared type accepts anything, including none.
    pub fn accepts(&self, parameter: Option<&Value>) -> bool {
        match (self.parameter, parameter) {
            (None, _) | (Some(_), None) => true,
            (Some(expected), Some(value)) => expected.accepts(value),
        }
    }
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("parameter", &self.parameter)
            .field("team", &self.team)
            .field("dependencies", &self.dependencies)
            .field("flows", &self.flows)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}
