//! Rendering of the server configuration document.
//!
//! Rendering is a pure function of the peer address set and the typed
//! [`ConfigParams`].  Addresses are normalised into sorted order before
//! they are joined into the route list, so the same membership always
//! produces byte-identical output no matter how the directory was read.
//! The reconciler's change detection depends on that.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::error::{GlueError, Result};
use crate::types::PeerAddress;

/// Scheme prefix of every cluster route.
pub const ROUTE_SCHEME: &str = "nats";

/// Separator between routes in the routes field.
pub const ROUTE_SEPARATOR: &str = ",";

const BUILTIN_TEMPLATE: &str = include_str!("../templates/nats.conf.tmpl");

/// Everything besides membership that ends up in the document.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigParams {
    pub cluster_name: String,
    pub cluster_port: u16,
    pub client_port: u16,
    pub monitor_port: u16,
    pub app_user: String,
    pub app_password: String,
    pub sys_user: String,
    pub sys_password: String,
    pub debug: bool,
}

impl fmt::Debug for ConfigParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigParams")
            .field("cluster_name", &self.cluster_name)
            .field("cluster_port", &self.cluster_port)
            .field("client_port", &self.client_port)
            .field("monitor_port", &self.monitor_port)
            .field("app_user", &self.app_user)
            .field("app_password", &"<redacted>")
            .field("sys_user", &self.sys_user)
            .field("sys_password", &"<redacted>")
            .field("debug", &self.debug)
            .finish()
    }
}

/// Where the template comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Builtin,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Template {
    source: String,
}

impl Template {
    pub fn builtin() -> Self {
        Self::from_source(BUILTIN_TEMPLATE)
    }

    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Reads the template for one pass.
    pub async fn locate(source: &TemplateSource) -> Result<Self> {
        match source {
            TemplateSource::Builtin => Ok(Self::builtin()),
            TemplateSource::File(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => Ok(Self::from_source(text)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Err(GlueError::TemplateMissing(path.clone()))
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Replaces every `{{ name }}` with its value from `vars`.
    pub fn substitute(&self, vars: &BTreeMap<&str, String>) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        let mut rest = self.source.as_str();

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| GlueError::Render("unterminated substitution".into()))?;
            let name = after[..end].trim();
            let value = vars
                .get(name)
                .ok_or_else(|| GlueError::Render(format!("missing variable `{}`", name)))?;
            out.push_str(value);
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// A rendered configuration document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    /// Full document text.
    pub text: String,
    /// The comma-joined route list embedded in the document.
    pub routes: String,
    /// Number of routes in `routes`.
    pub route_count: usize,
}

impl ConfigDocument {
    /// Hex-encoded SHA-256 of the document text.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.text.as_bytes()))
    }
}

/// Renders `value` as a double-quoted configuration string.
pub fn quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Formats one route URI, bracketing bare IPv6 literals.
pub fn route_uri(address: &PeerAddress, cluster_port: u16) -> String {
    let host = address.as_str();
    if host.contains(':') && !host.starts_with('[') {
        format!("{}://[{}]:{}", ROUTE_SCHEME, host, cluster_port)
    } else {
        format!("{}://{}:{}", ROUTE_SCHEME, host, cluster_port)
    }
}

/// Builds the routes field from an address set in any order.
pub fn routes_field<'a>(
    addresses: impl IntoIterator<Item = &'a PeerAddress>,
    cluster_port: u16,
) -> (String, usize) {
    let sorted: BTreeSet<&PeerAddress> = addresses.into_iter().collect();
    let routes: Vec<String> = sorted
        .into_iter()
        .map(|address| route_uri(address, cluster_port))
        .collect();
    (routes.join(ROUTE_SEPARATOR), routes.len())
}

/// Renders `template` for the given membership.
pub fn render<'a>(
    template: &Template,
    addresses: impl IntoIterator<Item = &'a PeerAddress>,
    params: &ConfigParams,
) -> Result<ConfigDocument> {
    let (routes, route_count) = routes_field(addresses, params.cluster_port);

    let mut vars = BTreeMap::new();
    vars.insert("cluster_name", quoted(&params.cluster_name));
    vars.insert("cluster_port", params.cluster_port.to_string());
    vars.insert("client_port", params.client_port.to_string());
    vars.insert("monitor_port", params.monitor_port.to_string());
    vars.insert("app_user", quoted(&params.app_user));
    vars.insert("app_password", quoted(&params.app_password));
    vars.insert("sys_user", quoted(&params.sys_user));
    vars.insert("sys_password", quoted(&params.sys_password));
    vars.insert("debug", params.debug.to_string());
    vars.insert("routes", routes.clone());

    Ok(ConfigDocument {
        text: template.substitute(&vars)?,
        routes,
        route_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConfigParams {
        ConfigParams {
            cluster_name: "nats".into(),
            cluster_port: 6222,
            client_port: 4222,
            monitor_port: 8222,
            app_user: "app".into(),
            app_password: "app-secret".into(),
            sys_user: "sys".into(),
            sys_password: "sys-secret".into(),
            debug: false,
        }
    }

    fn addrs(list: &[&str]) -> Vec<PeerAddress> {
        list.iter().map(|a| PeerAddress::parse(a).unwrap()).collect()
    }

    #[test]
    fn routes_are_sorted_regardless_of_order() {
        let forward = addrs(&["10.0.0.1", "10.0.0.2"]);
        let backward = addrs(&["10.0.0.2", "10.0.0.1"]);

        let a = render(&Template::builtin(), &forward, &params()).unwrap();
        let b = render(&Template::builtin(), &backward, &params()).unwrap();

        assert_eq!(a.routes, "nats://10.0.0.1:6222,nats://10.0.0.2:6222");
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn builtin_template_embeds_every_field() {
        let doc = render(&Template::builtin(), &addrs(&["10.0.0.1"]), &params()).unwrap();

        assert!(doc.text.contains("port: 4222"));
        assert!(doc.text.contains("http_port: 8222"));
        assert!(doc.text.contains("listen: 0.0.0.0:6222"));
        assert!(doc.text.contains("routes: [nats://10.0.0.1:6222]"));
        assert!(doc.text.contains("\"app-secret\""));
        assert!(doc.text.contains("\"sys\""));
        assert!(!doc.text.contains("{{"));
    }

    #[test]
    fn route_count_grows_with_membership() {
        let mut members = Vec::new();
        let mut last = 0;
        for a in ["10.0.0.3", "10.0.0.1", "10.0.0.2"] {
            members.push(PeerAddress::parse(a).unwrap());
            let doc = render(&Template::builtin(), &members, &params()).unwrap();
            assert!(doc.route_count >= last);
            last = doc.route_count;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let address = PeerAddress::parse("fd00::1").unwrap();
        assert_eq!(route_uri(&address, 6222), "nats://[fd00::1]:6222");
    }

    #[test]
    fn missing_variable_is_a_render_error() {
        let template = Template::from_source("port: {{ client_port }} {{ nope }}");
        let err = render(&template, &addrs(&["10.0.0.1"]), &params()).unwrap_err();
        assert!(matches!(err, GlueError::Render(msg) if msg.contains("nope")));
    }

    #[test]
    fn unterminated_substitution_is_a_render_error() {
        let template = Template::from_source("port: {{ client_port");
        assert!(matches!(
            render(&template, &addrs(&[]), &params()),
            Err(GlueError::Render(_))
        ));
    }

    #[test]
    fn string_values_cannot_break_out_of_their_quotes() {
        let mut params = params();
        params.app_password = "x\" }\n  { user: \"evil\", password: \"y".into();
        let doc = render(&Template::builtin(), &addrs(&["10.0.0.1"]), &params).unwrap();

        assert!(doc
            .text
            .contains(r#"password: "x\" }\n  { user: \"evil\", password: \"y" }"#));
        let user_lines = doc.text.lines().filter(|l| l.contains("user:")).count();
        assert_eq!(user_lines, 2);
    }

    #[test]
    fn cluster_name_with_spaces_is_quoted() {
        let mut params = params();
        params.cluster_name = "east coast".into();
        let doc = render(&Template::builtin(), &addrs(&["10.0.0.1"]), &params).unwrap();
        assert!(doc.text.contains("name: \"east coast\""));
    }

    #[test]
    fn quoting_escapes_control_characters() {
        assert_eq!(quoted(r"a\b"), r#""a\\b""#);
        assert_eq!(quoted("tab\there"), r#""tab\there""#);
        assert_eq!(quoted("plain"), "\"plain\"");
    }

    #[test]
    fn debug_output_hides_passwords() {
        let shown = format!("{:?}", params());
        assert!(shown.contains("app_user: \"app\""));
        assert!(!shown.contains("app-secret"));
        assert!(!shown.contains("sys-secret"));
    }

    #[tokio::test]
    async fn missing_template_file_is_reported() {
        let source = TemplateSource::File("/nonexistent/nats.conf.tmpl".into());
        let err = Template::locate(&source).await.unwrap_err();
        assert!(matches!(err, GlueError::TemplateMissing(_)));
    }
}
