//! Analysis workers: registry, invocation adapter, and compute backends.
//!
//! - [`WorkerRegistry`]: ordered, name-unique list of [`WorkerDescriptor`]s
//! - [`InvocationAdapter`]: one timed call per worker per entry
//! - [`WorkerBackend`]: how a call reaches the worker ([`CommandBackend`], [`HttpBackend`])
//!
//! [`WorkerDescriptor`]: moood_shared::WorkerDescriptor

pub mod adapter;
pub mod backends;
pub mod registry;

pub use adapter::InvocationAdapter;
pub use backends::{CommandBackend, HttpBackend, WORKER_NAME_ENV, WorkerBackend, backend_for};
pub use registry::{WorkerRegistry, validate_worker_name};
