//! # ferrule-id
//!
//! Typed identifiers for the entities the ferrule kernel creates at runtime.
//!
//! Every identifier renders as `{prefix}_{ulid}`:
//!
//! - `job_01HV4Z2WQXKJNM8GPQY6VBKC3D` for one in-flight function execution
//! - `flow_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for an instigated chain of jobs
//! - `req_01HV4Z4NYPLTRS0JTUA8XDME5F` for a logical request (process)
//! - `res_01HV4Z5PZQMVST1KVUB9YENF6G` for a sourced managed resource
//!
//! The prefix keeps log lines unambiguous and the ULID keeps identifiers
//! sortable by creation time, which is what the kernel's tracing output
//! relies on when reconstructing a flow tree.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid so the macro can name it from downstream crates.
pub use ulid::Ulid;
