//! The discover → render → compare → apply cycle.
//!
//! A pass runs to completion before the next trigger is handled.  The
//! plan is compared against what the supervisor already runs, and an
//! unchanged plan never causes a stop or start of a running server.
//! Failures turn into a status and leave the reconciler ready for the
//! next trigger; there is no internal retry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::controller::ServiceController;
use crate::directory::AddressDirectory;
use crate::error::{GlueError, Result};
use crate::plan::{Override, ServicePlan, ServiceSpec, Startup};
use crate::render::{self, ConfigDocument, ConfigParams, Template, TemplateSource};
use crate::runtime::docker::CONFIG_MOUNT;
use crate::types::{PeerAddress, Status, TriggerKind};

/// Name of the managed server in the service plan.
pub const SERVICE_NAME: &str = "nats";

/// Label of the post-start one-off command.
const POST_START_LABEL: &str = "post-start";

/// How the rendered configuration reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Written to [`config_path`] and referenced from the command line.
    File,
    /// Passed as command-line flags.
    Args,
}

/// Path of the configuration document inside the managed process.
pub fn config_path() -> String {
    format!("{}/nats.conf", CONFIG_MOUNT)
}

/// Everything a pass needs besides membership.
#[derive(Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub params: ConfigParams,
    pub template: TemplateSource,
    pub delivery: Delivery,
    pub nats_version: String,
    /// Image the server runs from.
    pub image: String,
    pub expected_peers: usize,
    pub post_start_command: Option<String>,
}

// Passwords stay hidden through `ConfigParams`'s own impl.
impl fmt::Debug for ReconcileSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileSettings")
            .field("params", &self.params)
            .field("template", &self.template)
            .field("delivery", &self.delivery)
            .field("nats_version", &self.nats_version)
            .field("image", &self.image)
            .field("expected_peers", &self.expected_peers)
            .field("post_start_command", &self.post_start_command)
            .finish()
    }
}

/// Rejects values that cannot be passed as a single command-line argument.
pub fn check_args_values(params: &ConfigParams) -> Result<()> {
    let values = [
        ("cluster_name", &params.cluster_name),
        ("app_user", &params.app_user),
        ("app_password", &params.app_password),
    ];
    for (name, value) in values {
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(GlueError::Render(format!(
                "{} must be non-empty and free of whitespace with args delivery",
                name
            )));
        }
    }
    Ok(())
}

/// What a successful pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The running service already matched.
    Unchanged,
    /// The service was deployed for the first time and started.
    Deployed,
    /// The definition changed and the service was restarted.
    Restarted,
}

pub struct Reconciler {
    directory: AddressDirectory,
    controller: ServiceController,
    settings: ReconcileSettings,
    rendered: watch::Sender<Option<BTreeSet<PeerAddress>>>,
}

impl Reconciler {
    pub fn new(
        directory: AddressDirectory,
        controller: ServiceController,
        settings: ReconcileSettings,
    ) -> Self {
        let (rendered, _) = watch::channel(None);
        Self {
            directory,
            controller,
            settings,
            rendered,
        }
    }

    /// Follows the address set of the last successfully rendered document.
    ///
    /// `None` until a pass gets as far as rendering.
    pub fn subscribe(&self) -> watch::Receiver<Option<BTreeSet<PeerAddress>>> {
        self.rendered.subscribe()
    }

    pub fn controller(&self) -> &ServiceController {
        &self.controller
    }

    pub fn update_settings(&mut self, settings: ReconcileSettings) {
        self.settings = settings;
    }

    /// Runs one full pass and reports its outcome.
    pub async fn reconcile(&self, trigger: TriggerKind) -> Status {
        info!("Reconciling ({})", trigger);

        match self.pass().await {
            Ok((action, peers)) => {
                info!("Pass finished: {:?} with {} known peer(s)", action, peers);
                if peers < self.settings.expected_peers {
                    Status::Waiting(format!(
                        "{} of {} expected peers known",
                        peers, self.settings.expected_peers
                    ))
                } else {
                    Status::Active
                }
            }
            Err(GlueError::DirectoryUnavailable(msg)) => {
                warn!("Peer directory unavailable: {}", msg);
                Status::Waiting(format!("peer directory unavailable: {}", msg))
            }
            Err(e) => {
                error!("Reconciliation failed: {}", e);
                Status::Blocked(e.to_string())
            }
        }
    }

    async fn pass(&self) -> Result<(Action, usize)> {
        self.directory.publish_self_address().await?;
        let addresses = self.directory.list_all_addresses().await?;

        let template = Template::locate(&self.settings.template).await?;
        let document = render::render(&template, &addresses, &self.settings.params)?;
        let desired = self.desired_plan(&document)?;
        debug!("Rendered routes: {}", document.routes);
        self.rendered.send_replace(Some(addresses.clone()));

        let previous = self.controller.current_plan().await?;
        let deployed = previous
            .as_ref()
            .map_or(false, |plan| plan.service(SERVICE_NAME).is_some());

        if previous.as_ref().map_or(false, |plan| plan.covers(&desired)) {
            if !self.controller.is_running(SERVICE_NAME).await? {
                info!("Service definition unchanged but not running, starting it");
                self.controller.autostart().await?;
                self.post_start().await?;
            }
            return Ok((Action::Unchanged, addresses.len()));
        }

        // The document is complete before anything is handed over.
        if self.settings.delivery == Delivery::File {
            self.controller
                .push_config(&config_path(), &document.text)
                .await?;
        }
        self.controller.apply_plan(&desired).await?;

        let action = if deployed {
            self.controller.restart().await?;
            info!("Restarted {} with {} route(s)", SERVICE_NAME, document.route_count);
            Action::Restarted
        } else {
            self.controller.autostart().await?;
            info!("Deployed {} with {} route(s)", SERVICE_NAME, document.route_count);
            Action::Deployed
        };
        self.post_start().await?;

        Ok((action, addresses.len()))
    }

    async fn post_start(&self) -> Result<()> {
        if let Some(command) = &self.settings.post_start_command {
            self.controller.run_one_off(command, POST_START_LABEL).await?;
        }
        Ok(())
    }

    /// The plan that runs the server with `document`.
    pub fn desired_plan(&self, document: &ConfigDocument) -> Result<ServicePlan> {
        let params = &self.settings.params;

        let mut environment = BTreeMap::new();
        environment.insert("NATS_SERVER".to_string(), self.settings.nats_version.clone());
        environment.insert("NATS_CLUSTER_NAME".to_string(), params.cluster_name.clone());

        let command = match self.settings.delivery {
            Delivery::File => {
                // The command line stays the same across config changes; the
                // digest is what makes the plan differ.
                environment.insert("NATS_CONFIG_DIGEST".to_string(), document.digest());
                format!("nats-server --config {}", config_path())
            }
            Delivery::Args => {
                check_args_values(params)?;
                let mut command = String::from("nats-server");
                if params.debug {
                    command.push_str(" -D");
                }
                command.push_str(&format!(
                    " -p={} -m={} --cluster=nats://0.0.0.0:{} --cluster_name={} \
                     --user={} --pass={} --routes={}",
                    params.client_port,
                    params.monitor_port,
                    params.cluster_port,
                    params.cluster_name,
                    params.app_user,
                    params.app_password,
                    document.routes
                ));
                command
            }
        };

        Ok(ServicePlan::single(
            SERVICE_NAME,
            ServiceSpec {
                summary: "NATS server".into(),
                image: Some(self.settings.image.clone()),
                command,
                environment,
                startup: Startup::Enabled,
                override_policy: Override::Replace,
            },
        ))
    }
}
