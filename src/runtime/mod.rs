use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::plan::ServicePlan;

pub mod docker;
#[cfg(test)]
pub mod memory;

pub use docker::{DockerRuntime, DockerSettings};

/// Primitives of the process supervisor that runs the managed server.
///
/// Implementations report "nothing to do" conditions as
/// [`RuntimeError::AlreadyInState`] and quick exits as
/// [`RuntimeError::ExitedQuickly`]; classifying those is left to the
/// controller.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// The combined plan of every layer added so far.
    async fn plan(&self) -> Result<ServicePlan, RuntimeError>;

    /// Folds `layer` into the plan.
    async fn add_layer(&self, label: &str, layer: &ServicePlan) -> Result<(), RuntimeError>;

    async fn is_running(&self, service: &str) -> Result<bool, RuntimeError>;

    /// Starts `service` from its current definition.
    async fn start(&self, service: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, service: &str) -> Result<(), RuntimeError>;

    /// Writes a file into the managed process's configuration storage.
    async fn push(&self, path: &str, contents: &str) -> Result<(), RuntimeError>;
}
