//! TaskFleet Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Subprocesses or the filesystem
//! - Runtime specifics
//!
//! All types here are shared by the dispatcher, the worker orchestrator
//! and the compute lifecycle manager.

pub mod chunk;
pub mod error;
pub mod ids;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use chunk::{split_into_chunks, LogChunk, MAX_CHUNK_BYTES};
pub use error::CoreError;
pub use ids::{NodeId, TaskId};
pub use status::{HealthStatus, InstanceState, TaskStatus, WorkerType};
pub use task::{validate_branch_name, IssueRef, Task, MAX_BRANCH_NAME_LEN};
