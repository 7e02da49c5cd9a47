//! Declarative service definitions handed to the supervisor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Whether `autostart` brings the service up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Startup {
    Enabled,
    Disabled,
}

/// How a layer's definition combines with an existing one of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Override {
    /// The new definition replaces the old one entirely.
    Replace,
    /// Environment entries are merged; other fields are replaced.
    Merge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub summary: String,
    /// Container image; the supervisor's default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub command: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub startup: Startup,
    #[serde(rename = "override")]
    pub override_policy: Override,
}

impl ServiceSpec {
    /// A definition for a command that is started once and not on autostart.
    pub fn one_off(command: impl Into<String>) -> Self {
        Self {
            summary: "one-off command".into(),
            image: None,
            command: command.into(),
            environment: BTreeMap::new(),
            startup: Startup::Disabled,
            override_policy: Override::Replace,
        }
    }

    /// Splits the command line into program and arguments.
    ///
    /// There is no quoting: an argument can never contain whitespace.
    pub fn argv(&self) -> Vec<String> {
        self.command.split_whitespace().map(str::to_string).collect()
    }
}

/// A set of named service definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub services: BTreeMap<String, ServiceSpec>,
}

impl ServicePlan {
    pub fn single(name: impl Into<String>, spec: ServiceSpec) -> Self {
        let mut services = BTreeMap::new();
        services.insert(name.into(), spec);
        Self { services }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    /// True when every service of `layer` is already defined identically here.
    pub fn covers(&self, layer: &ServicePlan) -> bool {
        layer
            .services
            .iter()
            .all(|(name, spec)| self.services.get(name) == Some(spec))
    }

    /// Folds `layer` into this plan.
    pub fn combine(&mut self, layer: &ServicePlan) {
        for (name, spec) in &layer.services {
            match (spec.override_policy, self.services.get_mut(name)) {
                (Override::Merge, Some(existing)) => {
                    let mut environment = existing.environment.clone();
                    environment.extend(spec.environment.clone());
                    *existing = ServiceSpec {
                        environment,
                        ..spec.clone()
                    };
                }
                _ => {
                    self.services.insert(name.clone(), spec.clone());
                }
            }
        }
    }

    /// Names of services that `autostart` should bring up.
    pub fn autostart_services(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|(_, spec)| spec.startup == Startup::Enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str, env: &[(&str, &str)], policy: Override) -> ServiceSpec {
        ServiceSpec {
            summary: "test".into(),
            image: None,
            command: command.into(),
            environment: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            startup: Startup::Enabled,
            override_policy: policy,
        }
    }

    #[test]
    fn covers_ignores_unrelated_services() {
        let mut current = ServicePlan::single("nats", spec("nats-server", &[], Override::Replace));
        current.combine(&ServicePlan::single("cmd", ServiceSpec::one_off("true")));

        let desired = ServicePlan::single("nats", spec("nats-server", &[], Override::Replace));
        assert!(current.covers(&desired));

        let changed = ServicePlan::single("nats", spec("nats-server -D", &[], Override::Replace));
        assert!(!current.covers(&changed));
    }

    #[test]
    fn merge_keeps_existing_environment() {
        let mut plan = ServicePlan::single("nats", spec("a", &[("A", "1")], Override::Replace));
        plan.combine(&ServicePlan::single(
            "nats",
            spec("b", &[("B", "2")], Override::Merge),
        ));

        let merged = plan.service("nats").unwrap();
        assert_eq!(merged.command, "b");
        assert_eq!(merged.environment.len(), 2);

        plan.combine(&ServicePlan::single("nats", spec("c", &[], Override::Replace)));
        assert!(plan.service("nats").unwrap().environment.is_empty());
    }

    #[test]
    fn image_change_is_a_definition_change() {
        let current = ServicePlan::single("nats", spec("nats-server", &[], Override::Replace));

        let mut upgraded = spec("nats-server", &[], Override::Replace);
        upgraded.image = Some("nats:2.11-alpine".into());
        assert!(!current.covers(&ServicePlan::single("nats", upgraded)));
    }

    #[test]
    fn definitions_without_image_still_parse() {
        let raw = r#"{"summary":"s","command":"true","startup":"disabled","override":"replace"}"#;
        let parsed: ServiceSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed,
            ServiceSpec {
                summary: "s".into(),
                ..ServiceSpec::one_off("true")
            }
        );
        assert!(!serde_json::to_string(&parsed).unwrap().contains("image"));
    }

    #[test]
    fn only_enabled_services_autostart() {
        let mut plan = ServicePlan::single("nats", spec("nats-server", &[], Override::Replace));
        plan.combine(&ServicePlan::single("cmd", ServiceSpec::one_off("true")));
        assert_eq!(plan.autostart_services(), vec!["nats".to_string()]);
    }
}
