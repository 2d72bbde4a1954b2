//! Compute backends a worker can run on.
//!
//! Every backend speaks the same contract: the worker receives the entry as
//! `{ "id", "entry", "createdAt" }` JSON and answers with one JSON value.

mod command;
mod http;

use std::sync::Arc;

use async_trait::async_trait;
use moood_shared::{Entry, Result, WorkerDescriptor, WorkerTarget};
use serde_json::Value;

pub use command::CommandBackend;
pub use http::HttpBackend;

/// Environment variable carrying the worker's own name into command workers.
pub const WORKER_NAME_ENV: &str = "MOOOD_WORKER_NAME";

/// A way of running one worker invocation.
///
/// Implementations report failures as `MooodError::WorkerInvocationFailed`;
/// timeouts are enforced by the caller.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Run the worker on `input` and return its JSON payload.
    async fn call(&self, descriptor: &WorkerDescriptor, input: &Entry) -> Result<Value>;

    /// Short backend label for tracing.
    fn kind(&self) -> &str;
}

/// Build the backend for a configured target.
pub fn backend_for(target: &WorkerTarget) -> Result<Arc<dyn WorkerBackend>> {
    let backend: Arc<dyn WorkerBackend> = match target {
        WorkerTarget::Command {
            program,
            args,
            working_dir,
        } => Arc::new(CommandBackend::new(program, args.clone(), working_dir.clone())),
        WorkerTarget::Http { url } => Arc::new(HttpBackend::new(url.clone())?),
    };
    Ok(backend)
}
