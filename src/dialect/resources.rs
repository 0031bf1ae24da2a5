//! Resource ranges
//!
//! ```text
//! resources := { cpu|cpus: range, memory|mem: range }
//! range     := quantity ["~" quantity]
//! ```
//!
//! The lower bound becomes the request and the upper bound the limit. A
//! single quantity is a request only.

use serde_json::Value;

use super::scalar_string;
use crate::k8s::{ResourceQuantity, ResourceRequirements};
use crate::{Error, Result};

/// Split `min~max` into its bounds; the upper bound is optional
pub fn split_range(text: &str) -> (String, Option<String>) {
    match text.split_once('~') {
        Some((min, max)) => (min.trim().to_string(), Some(max.trim().to_string())),
        None => (text.trim().to_string(), None),
    }
}

/// Parse a container `resources` argument
pub fn parse_resources(value: &Value) -> Result<Option<ResourceRequirements>> {
    let map = match value {
        Value::Null => return Ok(None),
        Value::Object(map) => map,
        _ => {
            return Err(Error::invalid_option(
                "resources",
                "expected a map of cpu and memory ranges",
            ))
        }
    };

    let mut requests = ResourceQuantity::default();
    let mut limits = ResourceQuantity::default();
    for (name, raw) in map {
        let text = scalar_string(raw)
            .ok_or_else(|| Error::invalid_option("resources", format!("'{}' must be a scalar", name)))?;
        let (min, max) = split_range(&text);
        let (request, limit) = match name.as_str() {
            "cpu" | "cpus" => (&mut requests.cpu, &mut limits.cpu),
            "memory" | "mem" => (&mut requests.memory, &mut limits.memory),
            other => {
                return Err(Error::invalid_option(
                    "resources",
                    format!("unknown resource '{}'", other),
                ))
            }
        };
        if !min.is_empty() {
            *request = Some(min);
        }
        *limit = max.filter(|m| !m.is_empty());
    }

    let requirements = ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
    };
    Ok((requirements.requests.is_some() || requirements.limits.is_some()).then_some(requirements))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn story_range_splits_into_requests_and_limits() {
        let res = parse_resources(&json!({"cpu": "100m~500m", "memory": "128Mi~1Gi"}))
            .unwrap()
            .unwrap();
        let requests = res.requests.unwrap();
        let limits = res.limits.unwrap();
        assert_eq!(requests.cpu.as_deref(), Some("100m"));
        assert_eq!(requests.memory.as_deref(), Some("128Mi"));
        assert_eq!(limits.cpu.as_deref(), Some("500m"));
        assert_eq!(limits.memory.as_deref(), Some("1Gi"));
    }

    #[test]
    fn story_single_quantity_is_request_only() {
        let res = parse_resources(&json!({"cpu": 1})).unwrap().unwrap();
        assert_eq!(res.requests.unwrap().cpu.as_deref(), Some("1"));
        assert!(res.limits.is_none());
    }

    #[test]
    fn story_open_lower_bound_is_limit_only() {
        let res = parse_resources(&json!({"memory": "~2Gi"})).unwrap().unwrap();
        assert!(res.requests.is_none());
        assert_eq!(res.limits.unwrap().memory.as_deref(), Some("2Gi"));
    }

    #[test]
    fn story_short_resource_names() {
        let res = parse_resources(&json!({"cpus": "0.01~0.1", "mem": "64Mi"})).unwrap().unwrap();
        let requests = res.requests.unwrap();
        assert_eq!(requests.cpu.as_deref(), Some("0.01"));
        assert_eq!(requests.memory.as_deref(), Some("64Mi"));
        assert_eq!(res.limits.unwrap().cpu.as_deref(), Some("0.1"));
    }

    #[test]
    fn story_unknown_resource_rejected() {
        assert!(parse_resources(&json!({"gpu": "1"})).is_err());
        assert!(parse_resources(&json!("1~2")).is_err());
        assert!(parse_resources(&Value::Null).unwrap().is_none());
    }

    #[test]
    fn story_split_range() {
        assert_eq!(split_range("2~10"), ("2".to_string(), Some("10".to_string())));
        assert_eq!(split_range("3"), ("3".to_string(), None));
    }
}
