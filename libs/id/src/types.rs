//! Identifier types for kernel entities.

use crate::kernel_id;

kernel_id!(
    /// One in-flight execution of a function.
    JobId,
    "job"
);

kernel_id!(
    /// One instigated chain of jobs.
    FlowId,
    "flow"
);

kernel_id!(
    /// One logical request; the request scope and its flow tree.
    RequestId,
    "req"
);

kernel_id!(
    /// One sourced managed resource instance.
    ResourceId,
    "res"
);
