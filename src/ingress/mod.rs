//! Ingress synthesis
//!
//! Routes are given as a trie of URL segments whose leaves name a backend:
//!
//! ```yaml
//! ingress:
//!   https://shop.example.com:
//!     /: web
//!     /api(/|$)(.*): api:8080
//! ```
//!
//! The trie is flattened into full URLs and grouped by `scheme://host`, one
//! rule per host. Backends are resolved to the Service actually produced
//! for the port, so a route can only point at something that exists.
//!
//! All resource types implement `HasApiResource` for consistent API version handling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::context::{resolve_in, AppContext, Backend, ServiceRegistry};
use crate::dialect::scalar_string;
use crate::k8s::{impl_api_defaults, HasApiResource, ObjectMeta};
use crate::service;
use crate::{Error, Result, INGRESS_CLASS, NGINX_ANNOTATION_PREFIX};

// =============================================================================
// Ingress types
// =============================================================================

/// Kubernetes Ingress
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    /// API version (networking.k8s.io/v1)
    #[serde(default = "Ingress::default_api_version")]
    pub api_version: String,
    /// Resource kind (Ingress)
    #[serde(default = "Ingress::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Ingress specification
    pub spec: IngressSpec,
}

impl HasApiResource for Ingress {
    const API_VERSION: &'static str = "networking.k8s.io/v1";
    const KIND: &'static str = "Ingress";
}

impl_api_defaults!(Ingress);

impl Ingress {
    /// Create a new Ingress
    pub fn new(metadata: ObjectMeta, spec: IngressSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// Ingress spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Ingress controller class
    pub ingress_class_name: String,
    /// TLS termination per host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<IngressTls>,
    /// Routing rules, one per host
    pub rules: Vec<IngressRule>,
}

/// TLS entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressTls {
    /// Hosts covered by the certificate
    pub hosts: Vec<String>,
    /// Secret holding the certificate
    pub secret_name: String,
}

/// Rule for one host
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IngressRule {
    /// Host; all hosts when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// HTTP paths
    pub http: HttpIngressRuleValue,
}

/// HTTP paths of a rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HttpIngressRuleValue {
    /// Paths
    pub paths: Vec<HttpIngressPath>,
}

/// One routed path
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressPath {
    /// Path or path regex
    pub path: String,
    /// Prefix or ImplementationSpecific
    pub path_type: String,
    /// Backend
    pub backend: IngressBackend,
}

/// Ingress backend
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IngressBackend {
    /// Target service
    pub service: IngressServiceBackend,
}

/// Service of an ingress backend
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IngressServiceBackend {
    /// Service name
    pub name: String,
    /// Service port
    pub port: ServiceBackendPort,
}

/// Port of an ingress backend
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceBackendPort {
    /// Port number
    pub number: u16,
}

impl From<Backend> for IngressBackend {
    fn from(backend: Backend) -> Self {
        Self {
            service: IngressServiceBackend {
                name: backend.service,
                port: ServiceBackendPort {
                    number: backend.port,
                },
            },
        }
    }
}

// =============================================================================
// Canary
// =============================================================================

/// Traffic split of a canary ingress
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Canary {
    /// Route requests carrying a header (optionally with a given value)
    ByHeader {
        /// Header name
        name: String,
        /// Required header value
        value: Option<String>,
    },
    /// Route requests carrying a cookie set to `always`
    ByCookie {
        /// Cookie name
        name: String,
    },
    /// Route a percentage of requests
    ByWeight(u8),
}

impl Canary {
    /// Header-based canary from directive params `(Name[, value])`
    pub fn by_header(params: &[String]) -> Result<Self> {
        match params {
            [name] if !name.is_empty() => Ok(Self::ByHeader {
                name: name.clone(),
                value: None,
            }),
            [name, value] if !name.is_empty() => Ok(Self::ByHeader {
                name: name.clone(),
                value: Some(value.clone()),
            }),
            _ => Err(Error::invalid_option(
                "ingress_by_header",
                "expected (header[, value])",
            )),
        }
    }

    /// Cookie-based canary from directive params `(Name)`
    pub fn by_cookie(params: &[String]) -> Result<Self> {
        match params {
            [name] if !name.is_empty() => Ok(Self::ByCookie { name: name.clone() }),
            _ => Err(Error::invalid_option("ingress_by_cookie", "expected (cookie)")),
        }
    }

    /// Weight-based canary from directive params `(percent)`
    pub fn by_weight(params: &[String]) -> Result<Self> {
        match params {
            [weight] => match weight.trim().parse::<u8>() {
                Ok(weight) if weight <= 100 => Ok(Self::ByWeight(weight)),
                _ => Err(Error::invalid_option(
                    "ingress_by_weight",
                    format!("weight must be 0 to 100, got '{}'", weight),
                )),
            },
            _ => Err(Error::invalid_option("ingress_by_weight", "expected (percent)")),
        }
    }

    fn annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        let mut put = |key: &str, value: String| {
            annotations.insert(format!("{}/{}", NGINX_ANNOTATION_PREFIX, key), value);
        };
        put("canary", "true".to_string());
        match self {
            Self::ByHeader { name, value } => {
                put("canary-by-header", name.clone());
                if let Some(value) = value {
                    put("canary-by-header-value", value.clone());
                }
            }
            Self::ByCookie { name } => put("canary-by-cookie", name.clone()),
            Self::ByWeight(weight) => put("canary-weight", weight.to_string()),
        }
        annotations
    }
}

// =============================================================================
// Building
// =============================================================================

/// Sanitize a string into a valid K8s DNS label.
///
/// DNS labels: `[a-z0-9]([-a-z0-9]*[a-z0-9])?`, max 63 chars.
fn sanitize_dns_label(s: &str) -> String {
    let sanitized: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.len() > 63 {
        trimmed[..63].trim_end_matches('-').to_string()
    } else {
        trimmed.to_string()
    }
}

/// Name of the TLS secret for a host
pub fn tls_secret_name(host: &str) -> String {
    format!("{}-tls", sanitize_dns_label(host))
}

/// Number of capture groups in a path regex
fn capture_groups(path: &str) -> usize {
    path.match_indices('(')
        .filter(|(idx, _)| !path[idx + 1..].starts_with('?'))
        .count()
}

/// Flatten a route trie into `(url, backend)` leaves in declaration order
pub fn flatten_routes(routes: &Value) -> Result<Vec<(String, Value)>> {
    let map = routes
        .as_object()
        .ok_or_else(|| Error::invalid_option("ingress", "expected a map of url to backend"))?;
    let mut leaves = Vec::new();
    for (key, value) in map {
        flatten_into(key.clone(), value, &mut leaves)?;
    }
    Ok(leaves)
}

fn flatten_into(prefix: String, value: &Value, leaves: &mut Vec<(String, Value)>) -> Result<()> {
    match value {
        Value::Object(children) => {
            for (segment, child) in children {
                flatten_into(join_url(&prefix, segment), child, leaves)?;
            }
            Ok(())
        }
        Value::String(_) | Value::Number(_) => {
            leaves.push((prefix, value.clone()));
            Ok(())
        }
        other => Err(Error::invalid_option(
            "ingress",
            format!("route '{}' has an invalid backend {}", prefix, other),
        )),
    }
}

fn join_url(prefix: &str, segment: &str) -> String {
    match (prefix.ends_with('/'), segment.starts_with('/')) {
        (true, true) => format!("{}{}", prefix, &segment[1..]),
        (false, false) if !segment.is_empty() => format!("{}/{}", prefix, segment),
        _ => format!("{}{}", prefix, segment),
    }
}

/// Split a URL into `(scheme, host, path)`; scheme defaults to http, path to `/`
fn split_url(url: &str) -> (String, String, String) {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("http".to_string(), url),
    };
    let (host, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    (scheme, host.to_string(), path)
}

/// A backend reference as written in a route leaf
#[derive(Clone, Debug, PartialEq, Eq)]
enum BackendRef {
    /// `app` or `app:port`
    App(String, Option<u16>),
    /// Bare port of the current app
    Port(u16),
}

fn parse_backend(leaf: &Value) -> Result<BackendRef> {
    let text = scalar_string(leaf).unwrap_or_default();
    let text = text.trim();
    let bad = || Error::invalid_option("ingress", format!("invalid backend '{}'", text));
    if text.is_empty() {
        return Err(bad());
    }
    if let Ok(port) = text.parse::<u16>() {
        return Ok(BackendRef::Port(port));
    }
    match text.split_once(':') {
        Some((app, port)) if !app.is_empty() => {
            let port = port.trim().parse::<u16>().map_err(|_| bad())?;
            Ok(BackendRef::App(app.to_string(), Some(port)))
        }
        Some(_) => Err(bad()),
        None => Ok(BackendRef::App(text.to_string(), None)),
    }
}

/// Resolves ingress backends and assembles Ingress documents
pub struct IngressBuilder<'a> {
    registry: &'a ServiceRegistry,
    scope: Option<&'a AppContext>,
    namespace: Option<&'a str>,
}

impl<'a> IngressBuilder<'a> {
    /// Create a builder; `scope` is the enclosing app, if any
    pub fn new(registry: &'a ServiceRegistry, scope: Option<&'a AppContext>, namespace: Option<&'a str>) -> Self {
        Self {
            registry,
            scope,
            namespace,
        }
    }

    /// Resolve a backend reference to a service name and port
    ///
    /// The enclosing app resolves against its own planned services, since
    /// they are registered only when the scope closes.
    fn resolve(&self, backend: &BackendRef) -> Result<Backend> {
        let (app, port) = match backend {
            BackendRef::Port(port) => {
                let ctx = self
                    .scope
                    .ok_or_else(|| Error::NoAppScope("ingress backend without app".to_string()))?;
                (ctx.name.as_str(), Some(*port))
            }
            BackendRef::App(app, port) => (app.as_str(), *port),
        };

        match self.scope {
            Some(ctx) if ctx.name == app && !self.registry.is_external(app) => {
                let plan = service::plan(ctx, self.namespace);
                resolve_in(app, &plan.endpoints, port)
            }
            _ => self.registry.resolve(app, port),
        }
    }

    /// Build an Ingress from a route trie
    pub fn build(&self, routes: &Value, canary: Option<&Canary>) -> Result<Ingress> {
        let mut rules: Vec<(String, String, Vec<HttpIngressPath>)> = Vec::new();
        let mut rewrite_groups: Option<usize> = None;

        for (url, leaf) in flatten_routes(routes)? {
            let (scheme, host, path) = split_url(&url);
            if scheme != "http" && scheme != "https" {
                return Err(Error::invalid_option(
                    "ingress",
                    format!("unsupported scheme '{}' in '{}'", scheme, url),
                ));
            }
            let backend = self.resolve(&parse_backend(&leaf)?)?;

            let path_type = if path.contains('(') {
                let groups = capture_groups(&path);
                match rewrite_groups {
                    Some(existing) if existing != groups => {
                        return Err(Error::invalid_option(
                            "ingress",
                            format!(
                                "regex paths disagree on capture groups ({} vs {}) in '{}'",
                                existing, groups, url
                            ),
                        ))
                    }
                    _ => rewrite_groups = Some(groups),
                }
                "ImplementationSpecific"
            } else {
                "Prefix"
            };

            let entry = HttpIngressPath {
                path,
                path_type: path_type.to_string(),
                backend: backend.into(),
            };
            match rules.iter_mut().find(|(s, h, _)| *s == scheme && *h == host) {
                Some((_, _, paths)) => paths.push(entry),
                None => rules.push((scheme, host, vec![entry])),
            }
        }

        if rules.is_empty() {
            return Err(Error::invalid_option("ingress", "no routes"));
        }

        let mut tls = Vec::new();
        for (scheme, host, _) in &rules {
            if scheme != "https" {
                continue;
            }
            if host.is_empty() {
                warn!("https route without host, skipping TLS");
                continue;
            }
            if !tls.iter().any(|t: &IngressTls| t.hosts.contains(host)) {
                tls.push(IngressTls {
                    hosts: vec![host.clone()],
                    secret_name: tls_secret_name(host),
                });
            }
        }

        let mut annotations = BTreeMap::new();
        if let Some(groups) = rewrite_groups {
            annotations.insert(format!("{}/use-regex", NGINX_ANNOTATION_PREFIX), "true".to_string());
            annotations.insert(
                format!("{}/rewrite-target", NGINX_ANNOTATION_PREFIX),
                format!("/${}", groups),
            );
        }
        if let Some(canary) = canary {
            annotations.extend(canary.annotations());
        }

        let base = self.scope.map(|ctx| ctx.name.as_str()).unwrap_or("ingress");
        let name = match canary {
            Some(_) => format!("{}-canary", base),
            None => base.to_string(),
        };
        let mut metadata = ObjectMeta::new(name, self.namespace);
        if let Some(ctx) = self.scope {
            metadata = metadata.with_labels(ctx.labels.clone());
        }
        metadata.annotations = annotations;

        Ok(Ingress::new(
            metadata,
            IngressSpec {
                ingress_class_name: INGRESS_CLASS.to_string(),
                tls,
                rules: rules
                    .into_iter()
                    .map(|(_, host, paths)| IngressRule {
                        host: (!host.is_empty()).then_some(host),
                        http: HttpIngressRuleValue { paths },
                    })
                    .collect(),
            },
        ))
    }
}
