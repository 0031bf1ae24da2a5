//! Host alias entries
//!
//! ```text
//! aliases := line ("\n" line)* | [line, ...] | { ip: host | [host, ...] }
//! line    := ip host (" " host)*
//! ```

use serde_json::Value;

use super::scalar_string;
use crate::k8s::HostAlias;
use crate::{Error, Result};

/// Parse a `host_aliases` argument
pub fn parse_host_aliases(value: &Value) -> Result<Vec<HostAlias>> {
    if let Value::Object(map) = value {
        return map
            .iter()
            .map(|(ip, hosts)| {
                let hostnames = match hosts {
                    Value::Array(items) => items.iter().filter_map(scalar_string).collect(),
                    other => scalar_string(other)
                        .map(|s| s.split_whitespace().map(str::to_string).collect())
                        .unwrap_or_default(),
                };
                alias(ip, hostnames)
            })
            .collect();
    }

    super::lines(value, "host_aliases")?
        .iter()
        .map(|line| {
            let mut tokens = line.split_whitespace();
            let ip = tokens.next().unwrap_or_default();
            alias(ip, tokens.map(str::to_string).collect())
        })
        .collect()
}

fn alias(ip: &str, hostnames: Vec<String>) -> Result<HostAlias> {
    if hostnames.is_empty() {
        return Err(Error::malformed_expression(ip, "host alias needs at least one hostname"));
    }
    Ok(HostAlias {
        ip: ip.to_string(),
        hostnames,
    })
}
