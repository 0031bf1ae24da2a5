//! Service synthesis
//!
//! Services are never written by hand: they are derived from the ports the
//! scope's containers declared. Ports are grouped by exposure class and each
//! group becomes one Service:
//! - ClusterIP: `<app>`, headless when the scope is stateful
//! - NodePort: `<app>-np`
//! - LoadBalancer: `<app>-lb`
//!
//! [`plan`] is pure so ingress resolution can consult it before the scope
//! closes; [`register`] promotes the endpoints into the cross-app registry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::context::{AppContext, ServiceEndpoint, ServiceRegistry};
use crate::dialect::{scalar_string, ExposureClass};
use crate::k8s::ObjectMeta;
use crate::{Error, Result};

// =============================================================================
// Service
// =============================================================================

/// Kubernetes Service
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: ServiceSpec,
}

/// Service spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// ClusterIP, NodePort, LoadBalancer or ExternalName
    #[serde(rename = "type")]
    pub type_: String,
    /// `None` for a headless service
    #[serde(rename = "clusterIP", default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    /// Pod selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    /// Ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,
    /// DNS name an ExternalName service aliases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,
}

/// Service port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    /// Port name
    pub name: String,
    /// Service port
    pub port: u16,
    /// Target port (container port)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    /// Node port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<u16>,
    /// Protocol (omitted for TCP)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Application protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
}

/// Port name: `p<port>`, suffixed with the protocol when it is not TCP
fn port_name(port: u16, protocol: Option<&str>) -> String {
    match protocol {
        Some(protocol) => format!("p{}-{}", port, protocol.to_ascii_lowercase()),
        None => format!("p{}", port),
    }
}

// =============================================================================
// Planning
// =============================================================================

/// Services of one scope plus the endpoints they expose
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServicePlan {
    /// One Service per exposure class, ClusterIP first
    pub services: Vec<Service>,
    /// Endpoints in port declaration order
    pub endpoints: Vec<ServiceEndpoint>,
}

impl ServicePlan {
    /// True when the scope declared no ports
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Derive the Services of a scope from its declared ports
pub fn plan(ctx: &AppContext, namespace: Option<&str>) -> ServicePlan {
    let mut groups: BTreeMap<ExposureClass, Vec<ServicePort>> = BTreeMap::new();
    let mut endpoints = Vec::new();

    for port in &ctx.ports {
        let class = port.exposure();
        let protocol = port.explicit_protocol();
        let group = groups.entry(class).or_default();
        if group
            .iter()
            .any(|p| p.port == port.service_port && p.protocol == protocol)
        {
            warn!(app = %ctx.name, port = port.service_port, "port declared twice, keeping the first");
            continue;
        }
        group.push(ServicePort {
            name: port_name(port.service_port, protocol.as_deref()),
            port: port.service_port,
            target_port: Some(port.container_port),
            node_port: port.node_port.filter(|n| *n != 0),
            protocol: protocol.clone(),
            app_protocol: port.app_protocol.clone(),
        });
        endpoints.push(ServiceEndpoint {
            service_port: port.service_port,
            container_port: port.container_port,
            service_name: class.service_name(&ctx.name),
            protocol,
        });
    }

    let services = groups
        .into_iter()
        .map(|(class, ports)| Service {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata: ObjectMeta::new(class.service_name(&ctx.name), namespace)
                .with_labels(ctx.labels.clone()),
            spec: ServiceSpec {
                type_: class.service_type().to_string(),
                cluster_ip: (class == ExposureClass::ClusterIp && ctx.is_stateful)
                    .then(|| "None".to_string()),
                selector: ctx.selector_labels(),
                ports,
                external_name: None,
            },
        })
        .collect();

    ServicePlan {
        services,
        endpoints,
    }
}

/// Record a plan's endpoints for `app`; entries already present are kept
pub fn register(registry: &mut ServiceRegistry, app: &str, plan: &ServicePlan) {
    for endpoint in &plan.endpoints {
        registry.register(app, endpoint.clone());
    }
}

// =============================================================================
// External aliases
// =============================================================================

/// Build an ExternalName Service for `alias`
///
/// The argument is `"dns.name[:port[,port...]]"` or `{host, ports}`.
/// Returns the Service and its declared ports.
pub fn external_service(alias: &str, value: &Value, namespace: Option<&str>) -> Result<(Service, Vec<u16>)> {
    let what = format!("ext_service({})", alias);
    let (host, ports) = match value {
        Value::Object(map) => {
            let host = map
                .get("host")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::invalid_option(what.as_str(), "missing 'host'"))?
                .to_string();
            let ports = match map.get("ports") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| parse_alias_port(&what, scalar_string(item).unwrap_or_default().as_str()))
                    .collect::<Result<_>>()?,
                Some(other) => parse_port_list(&what, &scalar_string(other).unwrap_or_default())?,
            };
            (host, ports)
        }
        Value::String(text) => match text.rsplit_once(':') {
            Some((host, ports)) => (host.to_string(), parse_port_list(&what, ports)?),
            None => (text.clone(), Vec::new()),
        },
        _ => {
            return Err(Error::invalid_option(
                what.as_str(),
                "expected 'host:port[,port]' or {host, ports}",
            ))
        }
    };

    if host.trim().is_empty() {
        return Err(Error::invalid_option(what.as_str(), "empty host"));
    }

    let service = Service {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        metadata: ObjectMeta::new(alias, namespace),
        spec: ServiceSpec {
            type_: "ExternalName".to_string(),
            external_name: Some(host.trim().to_string()),
            ports: ports
                .iter()
                .map(|port| ServicePort {
                    name: port_name(*port, None),
                    port: *port,
                    target_port: None,
                    node_port: None,
                    protocol: None,
                    app_protocol: None,
                })
                .collect(),
            ..Default::default()
        },
    };
    Ok((service, ports))
}

fn parse_port_list(what: &str, text: &str) -> Result<Vec<u16>> {
    text.split(',')
        .filter(|p| !p.trim().is_empty())
        .map(|p| parse_alias_port(what, p))
        .collect()
}

fn parse_alias_port(what: &str, text: &str) -> Result<u16> {
    match text.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::invalid_option(what, format!("invalid port '{}'", text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::parse_port;
    use serde_json::json;

    fn context_with_ports(ports: &[&str]) -> AppContext {
        let mut ctx = AppContext::new("web", false);
        for port in ports {
            ctx.add_port(parse_port(port).unwrap());
        }
        ctx
    }

    // =========================================================================
    // Story: Services Follow Declared Ports
    // =========================================================================

    /// Story: a two-part port gives a ClusterIP service mapping 8080 to 80
    #[test]
    fn story_cluster_ip_service_from_ports() {
        let ctx = context_with_ports(&["8080:80"]);
        let plan = plan(&ctx, Some("prod"));

        assert_eq!(plan.services.len(), 1);
        let svc = &plan.services[0];
        assert_eq!(svc.metadata.name.as_deref(), Some("web"));
        assert_eq!(svc.metadata.namespace.as_deref(), Some("prod"));
        assert_eq!(svc.metadata.labels["app"], "web");
        assert_eq!(svc.spec.type_, "ClusterIP");
        assert_eq!(svc.spec.cluster_ip, None);
        assert_eq!(svc.spec.selector["app"], "web");
        assert_eq!(svc.spec.ports[0].name, "p8080");
        assert_eq!(svc.spec.ports[0].port, 8080);
        assert_eq!(svc.spec.ports[0].target_port, Some(80));
    }

    #[test]
    fn story_no_ports_no_services() {
        let ctx = context_with_ports(&[]);
        assert!(plan(&ctx, None).is_empty());
    }

    /// Story: each exposure class gets its own service
    #[test]
    fn story_exposure_classes_split_services() {
        let ctx = context_with_ports(&["8080", "30080:9090:8080", "0:443:8443", "udp://53"]);
        let plan = plan(&ctx, None);

        let names: Vec<_> = plan
            .services
            .iter()
            .map(|s| s.metadata.name.clone().unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["web", "web-np", "web-lb"]);

        let cluster = &plan.services[0];
        assert_eq!(cluster.spec.ports.len(), 2);
        assert_eq!(cluster.spec.ports[1].name, "p53-udp");
        assert_eq!(cluster.spec.ports[1].protocol.as_deref(), Some("UDP"));

        let node = &plan.services[1].spec.ports[0];
        assert_eq!(plan.services[1].spec.type_, "NodePort");
        assert_eq!((node.node_port, node.port, node.target_port), (Some(30080), 9090, Some(8080)));

        let lb = &plan.services[2];
        assert_eq!(lb.spec.type_, "LoadBalancer");
        assert_eq!(lb.spec.ports[0].node_port, None);

        assert_eq!(plan.endpoints.len(), 4);
        assert_eq!(plan.endpoints[1].service_name, "web-np");
    }

    // =========================================================================
    // Story: Headless Stateful Services
    // =========================================================================

    /// Story: stateful scopes force the literal "None" cluster IP
    #[test]
    fn story_stateful_scope_is_headless() {
        let mut ctx = context_with_ports(&["5432", "30432:5432:5432"]);
        ctx.is_stateful = true;
        let plan = plan(&ctx, None);

        let value = serde_json::to_value(&plan.services[0]).unwrap();
        assert_eq!(value["spec"]["clusterIP"], "None");
        assert!(plan.services[1].spec.cluster_ip.is_none());
    }

    #[test]
    fn story_duplicate_ports_collapse() {
        let ctx = context_with_ports(&["80", "80"]);
        let plan = plan(&ctx, None);
        assert_eq!(plan.services[0].spec.ports.len(), 1);
        assert_eq!(plan.endpoints.len(), 1);
    }

    // =========================================================================
    // Story: Registry Promotion
    // =========================================================================

    #[test]
    fn story_register_promotes_endpoints() {
        let ctx = context_with_ports(&["8080:80"]);
        let mut registry = ServiceRegistry::new();
        register(&mut registry, "web", &plan(&ctx, None));

        let backend = registry.resolve("web", None).unwrap();
        assert_eq!(backend.service, "web");
        assert_eq!(backend.port, 8080);
        assert_eq!(registry.resolve("web", Some(80)).unwrap().port, 8080);
    }

    /// Story: TCP and UDP on the same number are two registry entries
    #[test]
    fn story_register_keeps_both_protocols_of_a_port() {
        let ctx = context_with_ports(&["53", "udp://53"]);
        let plan = plan(&ctx, None);
        assert_eq!(plan.services[0].spec.ports.len(), 2);

        let mut registry = ServiceRegistry::new();
        register(&mut registry, "dns", &plan);
        let endpoints = registry.endpoints("dns");
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].protocol, None);
        assert_eq!(endpoints[1].protocol.as_deref(), Some("UDP"));
    }

    // =========================================================================
    // Story: External Aliases
    // =========================================================================

    #[test]
    fn story_external_service_from_string() {
        let (svc, ports) = external_service("payments", &json!("api.pay.example.com:443,8443"), Some("prod")).unwrap();
        assert_eq!(ports, vec![443, 8443]);
        assert_eq!(svc.spec.type_, "ExternalName");
        assert_eq!(svc.spec.external_name.as_deref(), Some("api.pay.example.com"));
        assert_eq!(svc.metadata.name.as_deref(), Some("payments"));
        assert!(svc.spec.selector.is_empty());
        assert_eq!(svc.spec.ports[1].name, "p8443");
    }

    #[test]
    fn story_external_service_from_map() {
        let (svc, ports) = external_service("db", &json!({"host": "db.internal", "ports": [5432]}), None).unwrap();
        assert_eq!(ports, vec![5432]);
        assert_eq!(svc.spec.ports[0].target_port, None);

        assert!(external_service("db", &json!({"ports": [1]}), None).is_err());
        assert!(external_service("db", &json!("db.internal:http"), None).is_err());
        assert!(external_service("db", &json!(42), None).is_err());
    }
}
