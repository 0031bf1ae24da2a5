//! Shorthand dialect parsers
//!
//! Each submodule owns one micro-grammar and documents its production rules.
//! All parsers are pure functions over `&str` or argument trees; none of them
//! touch the app context.

pub mod host_alias;
pub mod port;
pub mod probe;
pub mod resources;
pub mod selector;
pub mod toleration;
pub mod volume;

use serde_json::Value;

use crate::{Error, Result};

pub use host_alias::parse_host_aliases;
pub use port::{parse_port, ExposureClass, PortSpec};
pub use probe::{parse_action, parse_probe, parse_seconds};
pub use resources::{parse_resources, split_range};
pub use selector::{parse_label_selector, parse_node_selector_terms, parse_requirement};
pub use toleration::parse_tolerations;
pub use volume::{fingerprint, mount_lines, parse_mount, ParsedMount, VolumeSpec};

/// Render a scalar argument as a string
///
/// Numbers and booleans are accepted so `ports: [8080]` and `replicas: 2`
/// behave like their quoted forms.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Split a multi-line argument into trimmed, non-empty lines
///
/// Accepts a string (split on newlines), a scalar, or a list of scalars.
/// Null yields no lines.
pub fn lines(value: &Value, what: &str) -> Result<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                scalar_string(item)
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| Error::invalid_option(what, "list entries must be scalars"))
            })
            .filter(|line| !matches!(line, Ok(l) if l.is_empty()))
            .collect(),
        other => match scalar_string(other) {
            Some(text) => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            None => Err(Error::invalid_option(
                what,
                "expected a string or a list of strings",
            )),
        },
    }
}
