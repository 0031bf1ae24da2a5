//! Application scope state
//!
//! An [`AppContext`] accumulates everything the directives of one `app` block
//! declare: labels, containers, deduplicated volumes, ports and config/secret
//! data. It is created empty when the scope opens and dropped when it closes.
//!
//! The [`ServiceRegistry`] is the only state that outlives a scope. It maps
//! each app's service ports to the Service that exposes them, so an ingress
//! compiled after several apps can name the right backend.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::dialect::{ParsedMount, PortSpec};
use crate::k8s::{Container, Volume};
use crate::{Error, Result, APP_LABEL};

pub use crate::dialect::VolumeSpec;

/// Name of an app's own ConfigMap
pub fn config_map_name(app: &str) -> String {
    format!("{}-config", app)
}

/// Name of an app's own Secret
pub fn secret_name(app: &str) -> String {
    format!("{}-secret", app)
}

// =============================================================================
// Key/value data
// =============================================================================

/// ConfigMap or Secret entries plus the keys whose values came from files
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyValueData {
    /// Entries in key order
    pub data: BTreeMap<String, String>,
    /// Keys loaded from file content
    pub file_keys: BTreeSet<String>,
}

impl KeyValueData {
    /// Insert an entry, remembering whether it came from a file
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>, from_file: bool) {
        let key = key.into();
        if from_file {
            self.file_keys.insert(key.clone());
        } else {
            self.file_keys.remove(&key);
        }
        self.data.insert(key, value.into());
    }

    /// True when no entries were declared
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// =============================================================================
// AppContext
// =============================================================================

/// Mutable state of one `app` scope
#[derive(Clone, Debug, Default)]
pub struct AppContext {
    /// App name, without the trailing `-` of a generated name
    pub name: String,
    /// The app name is a prefix completed by the API server
    pub generate_name: bool,
    /// Use the app name as pod hostname
    pub use_as_hostname: bool,
    /// Labels applied to every document of the scope
    pub labels: BTreeMap<String, String>,
    /// Entries of the app ConfigMap
    pub config: KeyValueData,
    /// Entries of the app Secret
    pub secret: KeyValueData,
    /// Init containers in declaration order
    pub init_containers: Vec<Container>,
    /// Containers in declaration order
    pub containers: Vec<Container>,
    /// Port declarations in declaration order
    pub ports: Vec<PortSpec>,
    /// Set once a StatefulSet is synthesized in this scope
    pub is_stateful: bool,
    volumes: Vec<(String, VolumeSpec)>,
}

impl AppContext {
    /// Open a scope for `name`
    ///
    /// A name ending in `-` requests a server-generated suffix.
    pub fn new(name: &str, use_as_hostname: bool) -> Self {
        let generate_name = name.ends_with('-');
        let name = name.trim_end_matches('-').to_string();
        let mut labels = BTreeMap::new();
        labels.insert(APP_LABEL.to_string(), name.clone());
        Self {
            name,
            generate_name,
            use_as_hostname,
            labels,
            ..Default::default()
        }
    }

    /// Merge labels; the app label always keeps the app name
    pub fn merge_labels(&mut self, labels: BTreeMap<String, String>) {
        self.labels.extend(labels);
        self.labels.insert(APP_LABEL.to_string(), self.name.clone());
    }

    /// Labels identifying the app's pods
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut selector = BTreeMap::new();
        selector.insert(APP_LABEL.to_string(), self.name.clone());
        selector
    }

    /// Name of the app ConfigMap
    pub fn config_map_name(&self) -> String {
        config_map_name(&self.name)
    }

    /// Name of the app Secret
    pub fn secret_name(&self) -> String {
        secret_name(&self.name)
    }

    /// Record the volume behind a mount; the first declaration of a fingerprint wins
    pub fn add_volume(&mut self, mount: &ParsedMount) {
        if self.volumes.iter().any(|(fp, _)| *fp == mount.fingerprint) {
            debug!(app = %self.name, volume = %mount.volume_name(), "volume already declared");
            return;
        }
        self.volumes.push((mount.fingerprint.clone(), mount.volume.clone()));
    }

    /// Record a port declaration
    pub fn add_port(&mut self, port: PortSpec) {
        self.ports.push(port);
    }

    /// Deduplicated volumes in first-declaration order
    pub fn volumes(&self) -> impl Iterator<Item = (&str, &VolumeSpec)> {
        self.volumes.iter().map(|(fp, spec)| (fp.as_str(), spec))
    }

    /// Pod volumes, with whole-map projections defaulting to file keys
    pub fn pod_volumes(&self) -> Vec<Volume> {
        self.volumes()
            .map(|(fp, spec)| Volume {
                name: format!("vol-{}", fp),
                source: spec.to_source(&self.name, &self.config.file_keys, &self.secret.file_keys),
            })
            .collect()
    }
}

// =============================================================================
// ServiceRegistry
// =============================================================================

/// One service port of an app and the Service exposing it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Port the Service listens on
    pub service_port: u16,
    /// Port the container listens on
    pub container_port: u16,
    /// Name of the Service
    pub service_name: String,
    /// Explicit protocol; `None` is TCP
    pub protocol: Option<String>,
}

impl ServiceEndpoint {
    /// Whether an ingress can route to this endpoint
    pub fn is_tcp(&self) -> bool {
        self.protocol.as_deref().map_or(true, |p| p == "TCP")
    }
}

/// Backend an ingress path routes to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    /// Service name
    pub service: String,
    /// Service port
    pub port: u16,
}

/// Cross-app table of service names, owned by the caller of a run
#[derive(Clone, Debug, Default)]
pub struct ServiceRegistry {
    apps: BTreeMap<String, Vec<ServiceEndpoint>>,
    external: BTreeMap<String, Vec<u16>>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an endpoint; each app, service port and protocol is written once
    ///
    /// Returns false when the entry was already registered.
    pub fn register(&mut self, app: &str, endpoint: ServiceEndpoint) -> bool {
        let endpoints = self.apps.entry(app.to_string()).or_default();
        if endpoints
            .iter()
            .any(|e| e.service_port == endpoint.service_port && e.protocol == endpoint.protocol)
        {
            return false;
        }
        endpoints.push(endpoint);
        true
    }

    /// Record an external alias; its service name is the alias itself
    pub fn register_external(&mut self, alias: &str, ports: Vec<u16>) {
        self.external.insert(alias.to_string(), ports);
    }

    /// Whether `app` was registered as an external alias
    pub fn is_external(&self, app: &str) -> bool {
        self.external.contains_key(app)
    }

    /// Endpoints registered for an app
    pub fn endpoints(&self, app: &str) -> &[ServiceEndpoint] {
        self.apps.get(app).map(Vec::as_slice).unwrap_or_default()
    }

    /// Resolve the backend for `app`, optionally on a specific port
    pub fn resolve(&self, app: &str, port: Option<u16>) -> Result<Backend> {
        if let Some(ports) = self.external.get(app) {
            let port = match port {
                Some(port) => Some(port),
                None => ports.first().copied(),
            };
            return port
                .map(|port| Backend {
                    service: app.to_string(),
                    port,
                })
                .ok_or_else(|| Error::UnresolvedBackend {
                    app: app.to_string(),
                    port: 0,
                });
        }
        resolve_in(app, self.endpoints(app), port)
    }
}

/// Resolve a backend among one app's endpoints
///
/// Only TCP endpoints are candidates. Without a port the first declared one
/// is used; a port matches a service port first and a container port second.
pub fn resolve_in(app: &str, endpoints: &[ServiceEndpoint], port: Option<u16>) -> Result<Backend> {
    let mut tcp = endpoints.iter().filter(|e| e.is_tcp());
    let found = match port {
        None => tcp.next(),
        Some(port) => tcp
            .clone()
            .find(|e| e.service_port == port)
            .or_else(|| tcp.find(|e| e.container_port == port)),
    };
    found
        .map(|e| Backend {
            service: e.service_name.clone(),
            port: e.service_port,
        })
        .ok_or_else(|| Error::UnresolvedBackend {
            app: app.to_string(),
            port: port.unwrap_or(0),
        })
}
