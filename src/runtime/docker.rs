use super::ServiceRuntime;
use crate::error::RuntimeError;
use crate::plan::{ServicePlan, ServiceSpec};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig};
use bollard::Docker;
use futures_util::stream::TryStreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;

/// Mount point of the configuration directory inside managed containers.
pub const CONFIG_MOUNT: &str = "/etc/nats";

const OWNER_LABEL: &str = "nats-glued.owner";
const SERVICE_LABEL: &str = "nats-glued.service";
const SPEC_LABEL: &str = "nats-glued.spec";

/// Seconds Docker waits for a graceful stop before killing.
const STOP_TIMEOUT_SECS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerSettings {
    /// Prefix of every container name; the peer's unit id.
    pub owner: String,
    /// Image for services whose definition names none.
    pub image: String,
    pub network_name: Option<String>,
    /// Host directory bind-mounted at [`CONFIG_MOUNT`].
    pub config_dir: PathBuf,
    /// How long a started container must stay up to count as started.
    pub start_grace: Duration,
}

impl DockerSettings {
    /// Whether `other` changes anything that only takes effect on reconnect.
    ///
    /// The image is excluded; it travels with each service definition.
    pub fn fixed_fields_differ(&self, other: &DockerSettings) -> bool {
        self.owner != other.owner
            || self.network_name != other.network_name
            || self.config_dir != other.config_dir
            || self.start_grace != other.start_grace
    }
}

/// Runs each service of the plan as a container on the local Docker daemon.
///
/// Containers carry their service definition as a label, so the applied
/// plan survives a restart of this daemon.
pub struct DockerRuntime {
    docker: Docker,
    settings: DockerSettings,
    plan: RwLock<ServicePlan>,
}

impl DockerRuntime {
    pub async fn connect(settings: DockerSettings) -> anyhow::Result<Self> {
        // Unix socket on Linux, named pipe on Windows.
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;

        let plan = Self::recover_plan(&docker, &settings.owner).await?;
        if !plan.is_empty() {
            info!(
                "Recovered {} service definition(s) from existing containers",
                plan.services.len()
            );
        }

        Ok(Self {
            docker,
            settings,
            plan: RwLock::new(plan),
        })
    }

    async fn recover_plan(docker: &Docker, owner: &str) -> anyhow::Result<ServicePlan> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", OWNER_LABEL, owner)],
        );
        let opts = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let mut plan = ServicePlan::default();
        for c in docker.list_containers(Some(opts)).await? {
            let Some(labels) = c.labels else { continue };
            let (Some(service), Some(raw)) = (labels.get(SERVICE_LABEL), labels.get(SPEC_LABEL))
            else {
                continue;
            };
            match serde_json::from_str::<ServiceSpec>(raw) {
                Ok(spec) => {
                    plan.services.insert(service.clone(), spec);
                }
                Err(e) => warn!("Ignoring unreadable definition of {}: {}", service, e),
            }
        }
        Ok(plan)
    }

    fn container_name(&self, service: &str) -> String {
        format!("{}-{}", self.settings.owner, service)
    }

    async fn inspect(&self, service: &str) -> Result<Option<ContainerInspectResponse>, RuntimeError> {
        let name = self.container_name(service);
        match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(detail) => Ok(Some(detail)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(backend(e)),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!("Pulling image {}", image);
        let opts = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(opts), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn create(&self, service: &str, spec: &ServiceSpec) -> Result<(), RuntimeError> {
        let image = container_image(spec, &self.settings.image);
        self.ensure_image(image).await?;

        let mut argv = spec.argv().into_iter();
        let entrypoint = argv
            .next()
            .ok_or_else(|| RuntimeError::Backend(format!("empty command for {}", service)))?;

        let mut labels = HashMap::new();
        labels.insert(OWNER_LABEL.to_string(), self.settings.owner.clone());
        labels.insert(SERVICE_LABEL.to_string(), service.to_string());
        labels.insert(
            SPEC_LABEL.to_string(),
            serde_json::to_string(spec).map_err(backend)?,
        );

        let env = spec
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:ro",
                self.settings.config_dir.display(),
                CONFIG_MOUNT
            )]),
            network_mode: self.settings.network_name.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            entrypoint: Some(vec![entrypoint]),
            cmd: Some(argv.collect()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let opts = CreateContainerOptions {
            name: self.container_name(service),
            ..Default::default()
        };
        self.docker
            .create_container(Some(opts), config)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl ServiceRuntime for DockerRuntime {
    async fn plan(&self) -> Result<ServicePlan, RuntimeError> {
        Ok(self.plan.read().await.clone())
    }

    async fn add_layer(&self, label: &str, layer: &ServicePlan) -> Result<(), RuntimeError> {
        let mut plan = self.plan.write().await;
        plan.combine(layer);
        debug!("Added layer '{}' to plan", label);
        Ok(())
    }

    async fn is_running(&self, service: &str) -> Result<bool, RuntimeError> {
        Ok(self.inspect(service).await?.map_or(false, |d| is_running(&d)))
    }

    async fn start(&self, service: &str) -> Result<(), RuntimeError> {
        let spec = self
            .plan
            .read()
            .await
            .service(service)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownService(service.to_string()))?;
        let name = self.container_name(service);

        if let Some(detail) = self.inspect(service).await? {
            if is_running(&detail) {
                return Err(RuntimeError::AlreadyInState);
            }
            // Always recreate so the container reflects the current definition.
            let opts = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            self.docker
                .remove_container(&name, Some(opts))
                .await
                .map_err(backend)?;
        }

        self.create(service, &spec).await?;
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(backend)?;

        sleep(self.settings.start_grace).await;

        match self.inspect(service).await? {
            Some(detail) if is_running(&detail) => {
                info!("Container {} started", name);
                Ok(())
            }
            Some(detail) => {
                let code = detail.state.and_then(|s| s.exit_code).unwrap_or(-1);
                debug!("Container {} exited with code {}", name, code);
                Err(RuntimeError::ExitedQuickly { code })
            }
            None => Err(RuntimeError::Backend(format!(
                "container {} disappeared after start",
                name
            ))),
        }
    }

    async fn stop(&self, service: &str) -> Result<(), RuntimeError> {
        match self.inspect(service).await? {
            Some(detail) if is_running(&detail) => {}
            _ => return Err(RuntimeError::AlreadyInState),
        }

        let name = self.container_name(service);
        let opts = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.docker.stop_container(&name, Some(opts)).await {
            Ok(()) => {
                info!("Container {} stopped", name);
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Err(RuntimeError::AlreadyInState),
            Err(e) => Err(backend(e)),
        }
    }

    async fn push(&self, path: &str, contents: &str) -> Result<(), RuntimeError> {
        let host_path = host_path(&self.settings.config_dir, path)?;
        if let Some(parent) = host_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(backend)?;
        }
        let tmp = host_path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await.map_err(backend)?;
        tokio::fs::rename(&tmp, &host_path).await.map_err(backend)?;
        debug!("Wrote {} ({} bytes)", host_path.display(), contents.len());
        Ok(())
    }
}

fn is_running(detail: &ContainerInspectResponse) -> bool {
    detail
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false)
}

fn container_image<'a>(spec: &'a ServiceSpec, default: &'a str) -> &'a str {
    spec.image.as_deref().unwrap_or(default)
}

/// Maps a path under [`CONFIG_MOUNT`] to its location on the host.
fn host_path(config_dir: &Path, path: &str) -> Result<PathBuf, RuntimeError> {
    let relative = Path::new(path)
        .strip_prefix(CONFIG_MOUNT)
        .map_err(|_| RuntimeError::Backend(format!("{} is outside {}", path, CONFIG_MOUNT)))?;
    if relative.as_os_str().is_empty() {
        return Err(RuntimeError::Backend(format!("{} is not a file", path)));
    }
    Ok(config_dir.join(relative))
}

fn backend(err: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Backend(err.to_string())
}
