//! Failure model.
//!
//! A [`Failure`] is what escalation routes: a cause plus a [`FailureClass`].
//! Classes form a single-inheritance tree declared at link time, so an
//! escalation entry for a class also catches every class derived from it.
//!
//! The remaining enums are ordinary `thiserror` errors returned from the
//! public API, the builder, and resource pools.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ferrule_id::FlowId;
use thiserror::Error;

use crate::descriptor::Value;

// =============================================================================
// Failure classes
// =============================================================================

/// Index of a class in the kernel's [`ClassTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FailureClass(pub(crate) usize);

impl FailureClass {
    /// Root of the tree. An escalation entry for `ANY` matches every failure.
    pub const ANY: Self = Self(0);
    /// Failures raised by the kernel itself.
    pub const KERNEL: Self = Self(1);
    /// A dependency could not be sourced.
    pub const RESOLUTION: Self = Self(2);
    /// Governance activation or deactivation failed.
    pub const GOVERNANCE: Self = Self(3);
    /// A join did not resolve before its timeout.
    pub const JOIN_TIMEOUT: Self = Self(4);
    /// The kernel API was used incorrectly from a function.
    pub const USAGE: Self = Self(5);
    /// An asynchronous completion was dropped unfired.
    pub const ABANDONED: Self = Self(6);
    /// Default class for failures raised by application code.
    pub const APPLICATION: Self = Self(7);

    const BUILTIN: [(&'static str, Option<FailureClass>); 8] = [
        ("any", None),
        ("kernel", Some(Self::ANY)),
        ("resolution", Some(Self::KERNEL)),
        ("governance", Some(Self::KERNEL)),
        ("join_timeout", Some(Self::KERNEL)),
        ("usage", Some(Self::KERNEL)),
        ("abandoned", Some(Self::KERNEL)),
        ("application", Some(Self::ANY)),
    ];

    /// Position in the class table.
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
struct ClassEntry {
    name: String,
    parent: Option<FailureClass>,
}

/// The linked failure class tree.
#[derive(Debug, Clone)]
pub struct ClassTable {
    entries: Vec<ClassEntry>,
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassTable {
    /// A table holding only the built-in classes.
    pub fn new() -> Self {
        let entries = FailureClass::BUILTIN
            .iter()
            .map(|(name, parent)| ClassEntry {
                name: (*name).to_string(),
                parent: *parent,
            })
            .collect();
        Self { entries }
    }

    /// Declares a class deriving from `parent`.
    pub fn declare(&mut self, name: &str, parent: FailureClass) -> Result<FailureClass, LinkError> {
        if self.lookup(name).is_some() {
            return Err(LinkError::DuplicateClass(name.to_string()));
        }
        if parent.0 >= self.entries.len() {
            return Err(LinkError::UnknownClass(parent.0));
        }
        self.entries.push(ClassEntry {
            name: name.to_string(),
            parent: Some(parent),
        });
        Ok(FailureClass(self.entries.len() - 1))
    }

    /// Finds a class by name.
    pub fn lookup(&self, name: &str) -> Option<FailureClass> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(FailureClass)
    }

    /// Name of a class; `"?"` for an index outside the table.
    pub fn name(&self, class: FailureClass) -> &str {
        self.entries
            .get(class.0)
            .map(|e| e.name.as_str())
            .unwrap_or("?")
    }

    /// Parent of a class (`None` for the root).
    pub fn parent(&self, class: FailureClass) -> Option<FailureClass> {
        self.entries.get(class.0).and_then(|e| e.parent)
    }

    /// True when `class` is `ancestor` or derives from it.
    pub fn is_a(&self, class: FailureClass, ancestor: FailureClass) -> bool {
        if ancestor == FailureClass::ANY {
            return true;
        }
        let mut current = Some(class);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.parent(c);
        }
        false
    }

    /// Number of declared classes, built-ins included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; the built-ins are present from construction.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Failure
// =============================================================================

/// Shared error type carried by a [`Failure`].
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A failure raised while a job runs, routed through escalation.
#[derive(Clone)]
pub struct Failure {
    class: FailureClass,
    cause: Cause,
}

impl Failure {
    /// Wraps an error under the given class.
    pub fn new<E>(class: FailureClass, cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self {
            class,
            cause: Arc::from(cause.into()),
        }
    }

    /// Failure with a plain message.
    pub fn msg(class: FailureClass, message: impl fmt::Display) -> Self {
        Self::new(class, anyhow::anyhow!("{message}"))
    }

    /// Application failure from any `anyhow`-compatible error.
    pub fn application(cause: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureClass::APPLICATION, cause.into())
    }

    pub(crate) fn kernel(failure: KernelFailure) -> Self {
        Self {
            class: failure.class(),
            cause: Arc::new(failure),
        }
    }

    /// The class escalation matches against.
    pub fn class(&self) -> FailureClass {
        self.class
    }

    /// The underlying error.
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.cause.as_ref()
    }

    /// Downcasts the cause.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.cause.downcast_ref::<E>()
    }

    /// The kernel-originated cause, if this failure came from the kernel.
    pub fn kernel_failure(&self) -> Option<&KernelFailure> {
        self.downcast_ref::<KernelFailure>()
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("class", &self.class)
            .field("cause", &self.cause.to_string())
            .finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.cause, f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

// =============================================================================
// Kernel failures
// =============================================================================

/// Failures the kernel raises on a job's behalf.
#[derive(Debug, Error)]
pub enum KernelFailure {
    /// A dependency's source or pool failed.
    #[error("failed to resolve '{resource}'")]
    Resolution {
        resource: String,
        #[source]
        cause: ResourceError,
    },

    /// An asynchronous resource stayed pending past its timeout.
    #[error("resource '{resource}' not ready after {timeout:?}")]
    ResourceTimeout { resource: String, timeout: Duration },

    /// The scope holding a pending resource ended first.
    #[error("scope released while '{resource}' was pending")]
    ScopeReleased { resource: String },

    /// A governance unit failed.
    #[error("governance '{governance}' failed to {action}: {reason}")]
    Governance {
        governance: String,
        action: &'static str,
        reason: String,
    },

    /// A joined flow did not terminate in time.
    #[error("join on {flow} timed out after {timeout:?}")]
    JoinTimeout {
        flow: FlowId,
        timeout: Duration,
        token: Option<Value>,
    },

    /// A job joined the same flow twice.
    #[error("{flow} already has an outstanding join from this job")]
    DuplicateJoin { flow: FlowId },

    /// A job tried to join the flow it runs in.
    #[error("a job cannot join its own flow {flow}")]
    SelfJoin { flow: FlowId },

    /// Flow index outside the function's flow table.
    #[error("function '{function}' has no flow {index}")]
    UnknownFlow { function: String, index: usize },

    /// No function with that name is linked.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// The parameter does not have the declared type.
    #[error("parameter for '{function}' must be {expected}")]
    ParameterType {
        function: String,
        expected: &'static str,
    },

    /// A function, duty, or governance unit panicked.
    #[error("{what} panicked: {message}")]
    Panicked { what: &'static str, message: String },

    /// An asynchronous completion was dropped unfired.
    #[error("{what} was dropped without completing")]
    Abandoned { what: &'static str },

    /// The kernel is shut down.
    #[error("kernel is shut down")]
    ShutDown,
}

impl KernelFailure {
    /// Class this failure escalates under.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Resolution { .. } | Self::ResourceTimeout { .. } | Self::ScopeReleased { .. } => {
                FailureClass::RESOLUTION
            }
            Self::Governance { .. } => FailureClass::GOVERNANCE,
            Self::JoinTimeout { .. } => FailureClass::JOIN_TIMEOUT,
            Self::DuplicateJoin { .. }
            | Self::SelfJoin { .. }
            | Self::UnknownFlow { .. }
            | Self::UnknownFunction(_)
            | Self::ParameterType { .. } => FailureClass::USAGE,
            Self::Abandoned { .. } => FailureClass::ABANDONED,
            Self::Panicked { .. } | Self::ShutDown => FailureClass::KERNEL,
        }
    }

    /// The join token, for join timeouts.
    pub fn join_token(&self) -> Option<&Value> {
        match self {
            Self::JoinTimeout { token, .. } => token.as_ref(),
            _ => None,
        }
    }
}

// =============================================================================
// Resource errors
// =============================================================================

/// Errors raised by resource sources and pools.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    /// The source could not produce an instance.
    #[error("source '{name}' failed: {reason}")]
    Production { name: String, reason: String },

    /// The pool was drained; no further borrows succeed.
    #[error("pool '{0}' is drained")]
    Drained(String),

    /// The pool hit an internal error and no longer lends.
    #[error("pool '{0}' is faulted")]
    Faulted(String),

    /// Adapting a sourced instance for presentation panicked.
    #[error("source '{0}' failed to adapt an instance")]
    Adaptation(String),

    /// The consumer was dropped without a delivery.
    #[error("resource consumer dropped without a delivery")]
    Abandoned,
}

impl ResourceError {
    /// Production failure with a message.
    pub fn production(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Production {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

// =============================================================================
// Link and API errors
// =============================================================================

/// Errors raised while linking descriptors.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("function '{0}' declared twice")]
    DuplicateFunction(String),

    #[error("failure class '{0}' declared twice")]
    DuplicateClass(String),

    #[error("unknown failure class index {0}")]
    UnknownClass(usize),

    #[error("function '{function}' references unknown function '{target}'")]
    UnknownTarget { function: String, target: String },

    #[error("function '{0}' lists a default escalation before the last entry")]
    DefaultEscalationNotLast(String),

    #[error("function '{function}' references unknown {what} {index}")]
    UnknownReference {
        function: String,
        what: &'static str,
        index: usize,
    },

    #[error("duty '{duty}' on '{function}' reads dependency {index} of {available}")]
    DutyDependency {
        function: String,
        duty: String,
        index: usize,
        available: usize,
    },

    #[error("function '{function}' runs on unknown team '{team}'")]
    UnknownTeam { function: String, team: String },

    #[error("escalation handler '{handler}' of '{function}' must take a Failure parameter")]
    HandlerParameter { function: String, handler: String },

    #[error("failed to start team '{team}': {reason}")]
    TeamStart { team: String, reason: String },
}

/// Errors returned synchronously by [`Kernel`](crate::Kernel) entry points.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("parameter for '{function}' must be {expected}")]
    ParameterType {
        function: String,
        expected: &'static str,
    },

    #[error("kernel is shut down")]
    ShutDown,
}
