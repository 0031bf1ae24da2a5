//! Port declarations
//!
//! ```text
//! port   := [scheme "://"] int [":" int [":" int]]
//! scheme := tcp | udp | sctp | http | https | http2 | h2c | grpc | ws | wss
//! ```
//!
//! The segments are read positionally as `containerPort`,
//! `servicePort:containerPort` or `nodePort:servicePort:containerPort`.

use std::fmt;

use crate::{Error, Result};

/// Application protocols that ride on TCP and surface as `appProtocol`
const APP_PROTOCOLS: &[&str] = &["http", "https", "http2", "h2c", "grpc", "ws", "wss"];

/// How a declared port is exposed outside the pod
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExposureClass {
    /// Cluster-internal virtual IP (1 or 2 segments)
    ClusterIp,
    /// Fixed port on every node (3 segments)
    NodePort,
    /// External load balancer (3 segments with node port 0)
    LoadBalancer,
}

impl ExposureClass {
    /// Kubernetes Service `type`
    pub fn service_type(self) -> &'static str {
        match self {
            Self::ClusterIp => "ClusterIP",
            Self::NodePort => "NodePort",
            Self::LoadBalancer => "LoadBalancer",
        }
    }

    /// Suffix appended to the app name to form the Service name
    pub fn name_suffix(self) -> &'static str {
        match self {
            Self::ClusterIp => "",
            Self::NodePort => "-np",
            Self::LoadBalancer => "-lb",
        }
    }

    /// Service name for an app
    pub fn service_name(self, app: &str) -> String {
        format!("{}{}", app, self.name_suffix())
    }
}

impl fmt::Display for ExposureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_type())
    }
}

/// A parsed port declaration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSpec {
    /// Transport protocol: TCP, UDP or SCTP
    pub protocol: String,
    /// Application protocol for HTTP-family schemes
    pub app_protocol: Option<String>,
    /// Node port; `Some(0)` asks for a cluster-assigned one behind a load balancer
    pub node_port: Option<u16>,
    /// Port the Service listens on
    pub service_port: u16,
    /// Port the container listens on
    pub container_port: u16,
}

impl PortSpec {
    /// Exposure class derived from the declared segments
    pub fn exposure(&self) -> ExposureClass {
        match self.node_port {
            None => ExposureClass::ClusterIp,
            Some(0) => ExposureClass::LoadBalancer,
            Some(_) => ExposureClass::NodePort,
        }
    }

    /// Protocol to write on container and service ports; TCP is the default and omitted
    pub fn explicit_protocol(&self) -> Option<String> {
        (self.protocol != "TCP").then(|| self.protocol.clone())
    }
}

/// Parse a single port declaration
pub fn parse_port(input: &str) -> Result<PortSpec> {
    let trimmed = input.trim();
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
        None => (None, trimmed),
    };

    let (protocol, app_protocol) = match scheme.as_deref() {
        None | Some("tcp") => ("TCP".to_string(), None),
        Some("udp") => ("UDP".to_string(), None),
        Some("sctp") => ("SCTP".to_string(), None),
        Some(s) if APP_PROTOCOLS.contains(&s) => ("TCP".to_string(), Some(s.to_string())),
        Some(s) => {
            return Err(Error::malformed_port(
                input,
                format!("unknown scheme '{}'", s),
            ))
        }
    };

    let segments = rest
        .split(':')
        .map(|segment| {
            segment.trim().parse::<u16>().map_err(|_| {
                Error::malformed_port(input, format!("segment '{}' is not a port number", segment))
            })
        })
        .collect::<Result<Vec<u16>>>()?;

    let (node_port, service_port, container_port) = match segments.as_slice() {
        [container] => (None, *container, *container),
        [service, container] => (None, *service, *container),
        [node, service, container] => (Some(*node), *service, *container),
        _ => {
            return Err(Error::malformed_port(
                input,
                format!("expected 1 to 3 segments, found {}", segments.len()),
            ))
        }
    };

    if service_port == 0 || container_port == 0 {
        return Err(Error::malformed_port(input, "port 0 is only valid as node port"));
    }

    Ok(PortSpec {
        protocol,
        app_protocol,
        node_port,
        service_port,
        container_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Story: Segment Count Selects Exposure
    // =========================================================================

    /// Story: a single port is used for both sides of a ClusterIP service
    #[test]
    fn story_single_segment_is_cluster_ip() {
        let port = parse_port("8080").unwrap();
        assert_eq!(port.exposure(), ExposureClass::ClusterIp);
        assert_eq!(port.service_port, 8080);
        assert_eq!(port.container_port, 8080);
        assert_eq!(port.node_port, None);
    }

    /// Story: two segments split service and container ports
    #[test]
    fn story_two_segments_map_service_to_container() {
        let port = parse_port("9090:8080").unwrap();
        assert_eq!(port.exposure(), ExposureClass::ClusterIp);
        assert_eq!(port.service_port, 9090);
        assert_eq!(port.container_port, 8080);
    }

    /// Story: three segments add a node port
    #[test]
    fn story_three_segments_are_node_port() {
        let port = parse_port("30080:9090:8080").unwrap();
        assert_eq!(port.exposure(), ExposureClass::NodePort);
        assert_eq!(port.node_port, Some(30080));
        assert_eq!(port.service_port, 9090);
        assert_eq!(port.container_port, 8080);
    }

    /// Story: node port 0 asks for a load balancer
    #[test]
    fn story_zero_node_port_is_load_balancer() {
        let port = parse_port("0:443:8443").unwrap();
        assert_eq!(port.exposure(), ExposureClass::LoadBalancer);
        assert_eq!(ExposureClass::LoadBalancer.service_name("web"), "web-lb");
        assert_eq!(ExposureClass::NodePort.service_name("web"), "web-np");
        assert_eq!(ExposureClass::ClusterIp.service_name("web"), "web");
    }

    // =========================================================================
    // Story: Schemes
    // =========================================================================

    #[test]
    fn story_transport_scheme_sets_protocol() {
        let port = parse_port("udp://53").unwrap();
        assert_eq!(port.protocol, "UDP");
        assert_eq!(port.explicit_protocol(), Some("UDP".to_string()));
        assert_eq!(port.app_protocol, None);
    }

    #[test]
    fn story_http_scheme_sets_app_protocol() {
        let port = parse_port("grpc://9000:50051").unwrap();
        assert_eq!(port.protocol, "TCP");
        assert_eq!(port.explicit_protocol(), None);
        assert_eq!(port.app_protocol.as_deref(), Some("grpc"));
    }

    // =========================================================================
    // Story: Malformed Declarations
    // =========================================================================

    #[test]
    fn story_malformed_ports_rejected() {
        for bad in ["", "80a", "1:2:3:4", "8080:", "ftp://21", "70000", "0"] {
            let err = parse_port(bad).unwrap_err();
            assert!(
                matches!(err, Error::MalformedPort { .. }),
                "expected MalformedPort for {:?}, got {:?}",
                bad,
                err
            );
        }
    }
}
