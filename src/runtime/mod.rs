//! Runtime system
//!
//! Execution domains, their worker pools, structured task groups,
//! synchronization cells and the communication endpoint that links domains.

pub mod comm;
pub mod domain;
pub mod errors;
pub mod group;
pub mod memory;
pub mod report;
pub mod scheduler;
pub mod sync;

pub use comm::{CommEndpoint, CompletionToken, HandlerRegistry, LocalFabric, Transport};
pub use domain::{Cluster, DomainId, ExecutionDomain};
pub use errors::{GroupError, RuntimeError, RuntimeResult, TaskError, TaskFailure, TaskResult};
pub use group::{cobegin, coforall, sync_scope, GroupHandle, GroupKind, TaskGroup};
pub use memory::{DomainMemory, LocalHandle, RemoteAddr};
pub use report::ClusterReport;
pub use scheduler::{TaskBuilder, TaskContext, TaskHandle, TaskId, TaskState, WorkerPool};
pub use sync::{SyncCell, SyncVar};
