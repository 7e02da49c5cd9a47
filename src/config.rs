use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::reconciler::{check_args_values, Delivery, ReconcileSettings};
use crate::render::{ConfigParams, TemplateSource};
use crate::runtime::DockerSettings;
use crate::types::PeerAddress;

const DEFAULT_PASSWORD: &str = "default_insecure_password";

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    pub unit_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_address: Option<String>,
    /// Shared directory holding every peer's address.  Unset means standalone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_path: Option<PathBuf>,
    pub client_port: u16,
    pub cluster_port: u16,
    pub monitor_port: u16,
    pub cluster_name: String,
    pub app_user: String,
    pub app_password: String,
    pub sys_user: String,
    pub sys_password: String,
    pub nats_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    pub config_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_path: Option<PathBuf>,
    pub delivery: Delivery,
    pub expected_peers: usize,
    pub debug: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_start_command: Option<String>,
    pub poll_interval_secs: u64,
    pub start_grace_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unit_id: std::env::var("HOSTNAME").unwrap_or_else(|_| "nats-0".into()),
            advertise_address: None,
            directory_path: None,
            client_port: 4222,
            cluster_port: 6222,
            monitor_port: 8222,
            cluster_name: "nats".into(),
            app_user: "app".into(),
            app_password: DEFAULT_PASSWORD.into(),
            sys_user: "sys".into(),
            sys_password: DEFAULT_PASSWORD.into(),
            nats_version: "2.10".into(),
            image: None,
            network_name: None,
            config_dir: "/var/lib/nats-glued/config".into(),
            template_path: None,
            delivery: Delivery::File,
            expected_peers: 1,
            debug: false,
            post_start_command: None,
            poll_interval_secs: 10,
            start_grace_ms: 1000,
            status_file: None,
        }
    }
}

// Hand-written so passwords never reach the logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("unit_id", &self.unit_id)
            .field("advertise_address", &self.advertise_address)
            .field("directory_path", &self.directory_path)
            .field("client_port", &self.client_port)
            .field("cluster_port", &self.cluster_port)
            .field("monitor_port", &self.monitor_port)
            .field("cluster_name", &self.cluster_name)
            .field("app_user", &self.app_user)
            .field("sys_user", &self.sys_user)
            .field("image", &self.image())
            .field("network_name", &self.network_name)
            .field("config_dir", &self.config_dir)
            .field("template_path", &self.template_path)
            .field("delivery", &self.delivery)
            .field("expected_peers", &self.expected_peers)
            .field("debug", &self.debug)
            .field("post_start_command", &self.post_start_command)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("nats-glued.toml"))
                .merge(Json::file("nats-glued.json"))
                .merge(Env::prefixed("NATS_GLUED_")),
        )?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("NATS_GLUED_APP_PASSWORD_FILE") {
            config.app_password = std::fs::read_to_string(secret_file)?.trim().to_string();
        }
        if let Ok(secret_file) = std::env::var("NATS_GLUED_SYS_PASSWORD_FILE") {
            config.sys_password = std::fs::read_to_string(secret_file)?.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_id = !self.unit_id.is_empty()
            && self
                .unit_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid_id {
            anyhow::bail!(
                "unit_id must be non-empty and contain only [A-Za-z0-9._-]: {:?}",
                self.unit_id
            );
        }

        let ports = [self.client_port, self.cluster_port, self.monitor_port];
        if ports.contains(&0) {
            anyhow::bail!("ports must be non-zero");
        }
        if ports[0] == ports[1] || ports[0] == ports[2] || ports[1] == ports[2] {
            anyhow::bail!("client, cluster and monitor ports must differ");
        }

        if self.expected_peers == 0 {
            anyhow::bail!("expected_peers must be at least 1");
        }

        if self.delivery == Delivery::Args {
            check_args_values(&self.params())?;
        }
        Ok(())
    }

    /// Valid but risky settings, one message each.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.app_password == DEFAULT_PASSWORD || self.sys_password == DEFAULT_PASSWORD {
            warnings.push(
                "A built-in default password is in use; set app_password and sys_password".into(),
            );
        }
        if self.delivery == Delivery::Args {
            warnings.push(
                "Args delivery puts app_password on the server command line and in the \
                 container's definition label; use file delivery to keep it private"
                    .into(),
            );
            warnings.push(
                "Args delivery configures no system account; sys_user and sys_password are unused"
                    .into(),
            );
        }
        warnings
    }

    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("nats:{}-alpine", self.nats_version))
    }

    pub fn params(&self) -> ConfigParams {
        ConfigParams {
            cluster_name: self.cluster_name.clone(),
            cluster_port: self.cluster_port,
            client_port: self.client_port,
            monitor_port: self.monitor_port,
            app_user: self.app_user.clone(),
            app_password: self.app_password.clone(),
            sys_user: self.sys_user.clone(),
            sys_password: self.sys_password.clone(),
            debug: self.debug,
        }
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            params: self.params(),
            template: match &self.template_path {
                Some(path) => TemplateSource::File(path.clone()),
                None => TemplateSource::Builtin,
            },
            delivery: self.delivery,
            nats_version: self.nats_version.clone(),
            image: self.image(),
            expected_peers: self.expected_peers,
            post_start_command: self.post_start_command.clone(),
        }
    }

    pub fn docker_settings(&self) -> DockerSettings {
        DockerSettings {
            owner: self.unit_id.clone(),
            image: self.image(),
            network_name: self.network_name.clone(),
            config_dir: self.config_dir.clone(),
            start_grace: Duration::from_millis(self.start_grace_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// The configured address, or the one of the interface holding the
    /// default route.
    pub async fn advertise_address(&self) -> anyhow::Result<PeerAddress> {
        if let Some(raw) = &self.advertise_address {
            return PeerAddress::parse(raw)
                .ok_or_else(|| anyhow::anyhow!("Invalid advertise_address: {:?}", raw));
        }

        // Connecting a UDP socket sends nothing; it only selects a route.
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect("192.0.2.1:9").await?;
        let ip: IpAddr = socket.local_addr()?.ip();
        if ip.is_unspecified() {
            anyhow::bail!("Could not detect an advertise address; set advertise_address");
        }
        PeerAddress::parse(&ip.to_string())
            .ok_or_else(|| anyhow::anyhow!("Could not detect an advertise address"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_toml(toml: &str) -> anyhow::Result<Config> {
        Config::from_figment(
            Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml)),
        )
    }

    #[test]
    fn defaults_are_valid() {
        let mut config = Config::default();
        config.unit_id = "nats-0".into();
        config.validate().unwrap();
        assert_eq!(config.image(), "nats:2.10-alpine");
        assert_eq!(config.delivery, Delivery::File);
    }

    #[test]
    fn file_values_override_defaults() {
        let config = with_toml(
            r#"
            unit_id = "nats-2"
            cluster_port = 7222
            delivery = "args"
            directory_path = "/shared/peers"
            expected_peers = 3
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.cluster_port, 7222);
        assert_eq!(config.delivery, Delivery::Args);
        assert_eq!(config.directory_path, Some(PathBuf::from("/shared/peers")));
        assert_eq!(config.reconcile_settings().expected_peers, 3);
    }

    #[test]
    fn clashing_ports_are_rejected() {
        let config = with_toml("unit_id = \"nats-0\"\nmonitor_port = 4222").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unit_ids_must_be_file_and_container_safe() {
        let config = with_toml("unit_id = \"nats/0\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_output_hides_passwords() {
        let mut config = Config::default();
        config.app_password = "hunter2".into();
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn args_delivery_rejects_values_with_whitespace() {
        let config = with_toml(
            "unit_id = \"nats-0\"\ndelivery = \"args\"\ncluster_name = \"east coast\"",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cluster_name"));

        let config = with_toml("unit_id = \"nats-0\"\ncluster_name = \"east coast\"").unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn args_delivery_warns_about_credentials() {
        let mut config = with_toml("unit_id = \"nats-0\"\ndelivery = \"args\"").unwrap();
        config.app_password = "s3cret".into();
        config.sys_password = "s3cret-too".into();

        let warnings = config.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("command line")));
        assert!(warnings.iter().any(|w| w.contains("sys_password")));

        config.delivery = Delivery::File;
        assert!(config.warnings().is_empty());
    }

    #[test]
    fn default_passwords_are_flagged() {
        assert!(Config::default()
            .warnings()
            .iter()
            .any(|w| w.contains("default password")));
    }

    #[test]
    fn nats_version_selects_server_image() {
        let config = with_toml("unit_id = \"nats-0\"\nnats_version = \"2.11\"").unwrap();
        assert_eq!(config.reconcile_settings().image, "nats:2.11-alpine");
        assert_eq!(config.docker_settings().image, "nats:2.11-alpine");
    }

    #[tokio::test]
    async fn explicit_advertise_address_wins() {
        let mut config = Config::default();
        config.advertise_address = Some("10.1.2.3".into());
        assert_eq!(config.advertise_address().await.unwrap().as_str(), "10.1.2.3");
    }
}
