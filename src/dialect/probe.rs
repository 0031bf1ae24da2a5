//! Probe and lifecycle handler shorthands
//!
//! ```text
//! probe   := action | { action: action, seconds: seconds }
//! seconds := { key: int, ... } | key "=" int (" " key "=" int)*
//! key     := i | p | t | s | f | initialDelaySeconds | periodSeconds
//!          | timeoutSeconds | successThreshold | failureThreshold
//! action  := "tcp://" [host] ":" port
//!          | ("http" | "https") "://" [host] [":" port] [path] [" -h " header ("&" header)*]
//!          | command                                    run through `sh -c`
//! header  := name "=" value
//! ```

use serde_json::Value;

use super::scalar_string;
use crate::k8s::{ExecAction, Handler, HttpGetAction, HttpHeader, Probe, TcpSocketAction};
use crate::{Error, Result};

/// Parse a probe argument: an action string or an `{action, seconds}` map
pub fn parse_probe(value: &Value) -> Result<Probe> {
    match value {
        Value::String(action) => Ok(Probe {
            handler: parse_action(action)?,
            ..Default::default()
        }),
        Value::Object(map) => {
            let action = map
                .get("action")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::malformed_probe(value.to_string(), "missing 'action'"))?;
            let mut probe = match map.get("seconds") {
                Some(seconds) => parse_seconds(seconds)?,
                None => Probe::default(),
            };
            probe.handler = parse_action(action)?;
            Ok(probe)
        }
        other => Err(Error::malformed_probe(
            other.to_string(),
            "expected an action string or a map",
        )),
    }
}

/// Parse a seconds block into a probe whose handler is still empty
pub fn parse_seconds(value: &Value) -> Result<Probe> {
    let mut probe = Probe::default();
    let pairs: Vec<(String, Value)> = match value {
        Value::Null => Vec::new(),
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::String(text) => text
            .split_whitespace()
            .map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                    .ok_or_else(|| Error::malformed_probe(text.as_str(), format!("'{}' is not key=value", pair)))
            })
            .collect::<Result<_>>()?,
        other => {
            return Err(Error::malformed_probe(
                other.to_string(),
                "seconds must be a map or a key=value string",
            ))
        }
    };

    for (key, raw) in pairs {
        let number = scalar_string(&raw)
            .and_then(|s| s.trim().parse::<i32>().ok())
            .ok_or_else(|| Error::malformed_probe(raw.to_string(), format!("'{}' needs an integer", key)))?;
        let slot = match key.as_str() {
            "i" | "initialDelaySeconds" => &mut probe.initial_delay_seconds,
            "p" | "periodSeconds" => &mut probe.period_seconds,
            "t" | "timeoutSeconds" => &mut probe.timeout_seconds,
            "s" | "successThreshold" => &mut probe.success_threshold,
            "f" | "failureThreshold" => &mut probe.failure_threshold,
            other => {
                return Err(Error::malformed_probe(
                    value.to_string(),
                    format!("unknown seconds key '{}'", other),
                ))
            }
        };
        *slot = Some(number);
    }
    Ok(probe)
}

/// Parse an action into a probe or lifecycle handler
pub fn parse_action(action: &str) -> Result<Handler> {
    let action = action.trim();
    if action.is_empty() {
        return Err(Error::malformed_probe(action, "empty action"));
    }

    if let Some(rest) = action.strip_prefix("tcp://") {
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => ("", rest),
        };
        return Ok(Handler {
            tcp_socket: Some(TcpSocketAction {
                port: parse_probe_port(action, port)?,
                host: non_empty(host),
            }),
            ..Default::default()
        });
    }

    let http = action
        .strip_prefix("http://")
        .map(|rest| (rest, None, 80))
        .or_else(|| {
            action
                .strip_prefix("https://")
                .map(|rest| (rest, Some("HTTPS"), 443))
        });
    if let Some((rest, scheme, default_port)) = http {
        return parse_http(action, rest, scheme, default_port);
    }

    Ok(Handler {
        exec: Some(ExecAction {
            command: vec!["sh".to_string(), "-c".to_string(), action.to_string()],
        }),
        ..Default::default()
    })
}

fn parse_http(action: &str, rest: &str, scheme: Option<&str>, default_port: u16) -> Result<Handler> {
    let (url, headers) = match rest.split_once(" -h ") {
        Some((url, headers)) => (url.trim(), parse_headers(action, headers.trim())?),
        None => (rest.trim(), Vec::new()),
    };

    let (authority, path) = match url.find('/') {
        Some(idx) => (&url[..idx], url[idx..].to_string()),
        None => (url, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, parse_probe_port(action, port)?),
        None => (authority, default_port),
    };

    Ok(Handler {
        http_get: Some(HttpGetAction {
            path,
            port,
            host: non_empty(host),
            scheme: scheme.map(str::to_string),
            http_headers: headers,
        }),
        ..Default::default()
    })
}

fn parse_headers(action: &str, block: &str) -> Result<Vec<HttpHeader>> {
    block
        .split('&')
        .filter(|h| !h.is_empty())
        .map(|header| {
            let (name, value) = header
                .split_once('=')
                .ok_or_else(|| Error::malformed_probe(action, format!("header '{}' is not name=value", header)))?;
            Ok(HttpHeader {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

fn parse_probe_port(action: &str, port: &str) -> Result<u16> {
    match port.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::malformed_probe(action, format!("invalid port '{}'", port))),
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
