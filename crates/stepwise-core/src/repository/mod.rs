//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepwise-infra) implements. The core crate never depends on any specific
//! storage technology; `memory` provides the in-process implementation used by
//! tests and embedded hosts.

pub mod execution;
pub mod memory;

pub use execution::ExecutionRepository;
pub use memory::InMemoryRepository;
