//! Idempotent lifecycle driver on top of a [`ServiceRuntime`].
//!
//! Start and stop requests on a service that is already in the target
//! state are absorbed here.  A one-off command that exits with status 0
//! inside the start grace period is a completed command, not a failed
//! start.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::Mutex;

use crate::error::{GlueError, Result, RuntimeError};
use crate::plan::{ServicePlan, ServiceSpec};
use crate::runtime::ServiceRuntime;

/// Label of the layer carrying the managed server's definition.
const PLAN_LAYER: &str = "nats-glued";

/// Lifecycle of one managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRuntimeState {
    NotDeployed,
    Stopped,
    Running,
    Restarting,
}

/// Result of a successful one-off command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneOffOutcome {
    /// The command exited with status 0 right away.
    Completed,
    /// The command was started and is still running.
    Running,
}

pub struct ServiceController {
    runtime: Arc<dyn ServiceRuntime>,
    restarting: Mutex<BTreeSet<String>>,
}

impl ServiceController {
    pub fn new(runtime: Arc<dyn ServiceRuntime>) -> Self {
        Self {
            runtime,
            restarting: Mutex::new(BTreeSet::new()),
        }
    }

    /// The plan presently applied, or `None` if nothing was ever deployed.
    pub async fn current_plan(&self) -> Result<Option<ServicePlan>> {
        let plan = self.runtime.plan().await?;
        Ok(if plan.is_empty() { None } else { Some(plan) })
    }

    /// Applies `plan` unless it is already in effect.
    ///
    /// Returns whether anything changed, i.e. whether a restart is needed.
    pub async fn apply_plan(&self, plan: &ServicePlan) -> Result<bool> {
        if let Some(current) = self.current_plan().await? {
            if current.covers(plan) {
                debug!("Plan unchanged, nothing to apply");
                return Ok(false);
            }
        }
        self.runtime
            .add_layer(PLAN_LAYER, plan)
            .await
            .map_err(|e| GlueError::ServiceApply(e.to_string()))?;
        info!("Applied updated service plan");
        Ok(true)
    }

    /// Writes a configuration document into the managed process's storage.
    pub async fn push_config(&self, path: &str, contents: &str) -> Result<()> {
        self.runtime
            .push(path, contents)
            .await
            .map_err(|e| GlueError::ServiceApply(e.to_string()))
    }

    pub async fn is_running(&self, service: &str) -> Result<bool> {
        Ok(self.runtime.is_running(service).await?)
    }

    pub async fn state(&self, service: &str) -> Result<ServiceRuntimeState> {
        if self.restarting.lock().await.contains(service) {
            return Ok(ServiceRuntimeState::Restarting);
        }
        let deployed = self
            .current_plan()
            .await?
            .map_or(false, |plan| plan.service(service).is_some());
        if !deployed {
            return Ok(ServiceRuntimeState::NotDeployed);
        }
        Ok(if self.runtime.is_running(service).await? {
            ServiceRuntimeState::Running
        } else {
            ServiceRuntimeState::Stopped
        })
    }

    /// Starts `service` unless it is already running.
    pub async fn start(&self, service: &str) -> Result<()> {
        match self.runtime.start(service).await {
            Ok(()) => Ok(()),
            Err(RuntimeError::AlreadyInState) => {
                debug!("Service {} already running", service);
                Ok(())
            }
            Err(e) => Err(GlueError::start(service, e)),
        }
    }

    /// Stops `service` if it is running.
    pub async fn stop(&self, service: &str) -> Result<()> {
        match self.runtime.stop(service).await {
            Ok(()) => Ok(()),
            Err(RuntimeError::AlreadyInState) => {
                debug!("Service {} already stopped", service);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Starts every service whose startup policy is enabled.
    pub async fn autostart(&self) -> Result<()> {
        let Some(plan) = self.current_plan().await? else {
            return Ok(());
        };
        for service in plan.autostart_services() {
            self.start(&service).await?;
        }
        Ok(())
    }

    /// Stop followed by autostart.  A no-op when nothing is deployed.
    pub async fn restart(&self) -> Result<()> {
        let Some(plan) = self.current_plan().await? else {
            debug!("No services defined, nothing to restart");
            return Ok(());
        };
        let services = plan.autostart_services();

        self.restarting
            .lock()
            .await
            .extend(services.iter().cloned());
        let result = self.stop_then_autostart(&services).await;
        self.restarting.lock().await.clear();

        if let Err(e) = &result {
            error!("Restart failed: {}", e);
        }
        result
    }

    async fn stop_then_autostart(&self, services: &[String]) -> Result<()> {
        for service in services {
            self.stop(service).await?;
        }
        self.autostart().await
    }

    /// Submits `command` as a one-shot service named `label` and starts it.
    pub async fn run_one_off(&self, command: &str, label: &str) -> Result<OneOffOutcome> {
        info!("Running one-off command '{}': {}", label, command);
        let layer = ServicePlan::single(label, ServiceSpec::one_off(command));
        self.runtime
            .add_layer(label, &layer)
            .await
            .map_err(|e| GlueError::ServiceApply(e.to_string()))?;

        // A previous run with the same label may still be up.
        self.stop(label).await?;

        match self.runtime.start(label).await {
            Ok(()) => Ok(OneOffOutcome::Running),
            Err(RuntimeError::ExitedQuickly { code: 0 }) => {
                info!("Command '{}' completed", label);
                Ok(OneOffOutcome::Completed)
            }
            Err(e) => {
                error!("Command '{}' failed: {}", label, e);
                Err(GlueError::start(label, e))
            }
        }
    }
}
