//! Label selector and affinity expressions
//!
//! ```text
//! selector    := { key: value, ... } | entry ("\n" entry)* | [entry, ...]
//! entry       := key "=" value                 folded into matchLabels
//!              | key operator [value ("," value)*]
//! operator    := In | NotIn | Exists | DoesNotExist | Gt | Lt   (any case)
//! ```
//!
//! `In`/`NotIn` need at least one value, `Gt`/`Lt` exactly one integer,
//! `Exists`/`DoesNotExist` none.

use std::collections::BTreeMap;

use serde_json::Value;

use super::scalar_string;
use crate::k8s::{LabelSelector, LabelSelectorRequirement, NodeSelectorTerm};
use crate::{Error, Result};

/// Parse a selector argument, seeding `matchLabels` with `seed`
///
/// Entries from the argument override seed entries of the same key.
pub fn parse_label_selector(value: &Value, seed: &BTreeMap<String, String>) -> Result<LabelSelector> {
    let mut selector = LabelSelector {
        match_labels: seed.clone(),
        ..Default::default()
    };
    for entry in entries(value)? {
        match entry {
            Entry::Equal(key, value) => {
                selector.match_labels.insert(key, value);
            }
            Entry::Expression(requirement) => selector.match_expressions.push(requirement),
        }
    }
    Ok(selector)
}

/// Parse the same argument shapes into node selector terms
///
/// Equality entries become `In [value]` requirements. All requirements land
/// in a single term, so they are ANDed.
pub fn parse_node_selector_terms(value: &Value) -> Result<Vec<NodeSelectorTerm>> {
    let match_expressions: Vec<LabelSelectorRequirement> = entries(value)?
        .into_iter()
        .map(|entry| match entry {
            Entry::Equal(key, value) => LabelSelectorRequirement {
                key,
                operator: "In".to_string(),
                values: vec![value],
            },
            Entry::Expression(requirement) => requirement,
        })
        .collect();

    if match_expressions.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![NodeSelectorTerm { match_expressions }])
}

/// Parse a single `key operator values` expression
pub fn parse_requirement(expr: &str) -> Result<LabelSelectorRequirement> {
    let mut tokens = expr.split_whitespace();
    let (key, op) = match (tokens.next(), tokens.next()) {
        (Some(key), Some(op)) => (key, op),
        _ => return Err(Error::malformed_expression(expr, "expected 'key operator [values]'")),
    };
    let operand: String = tokens.collect::<Vec<_>>().join("");
    let values: Vec<String> = operand
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();

    let operator = match op.to_ascii_lowercase().as_str() {
        "in" => "In",
        "notin" => "NotIn",
        "exists" => "Exists",
        "doesnotexist" => "DoesNotExist",
        "gt" => "Gt",
        "lt" => "Lt",
        other => {
            return Err(Error::malformed_expression(
                expr,
                format!("unknown operator '{}'", other),
            ))
        }
    };

    match operator {
        "In" | "NotIn" if values.is_empty() => {
            return Err(Error::malformed_expression(expr, format!("{} needs values", operator)))
        }
        "Exists" | "DoesNotExist" if !values.is_empty() => {
            return Err(Error::malformed_expression(expr, format!("{} takes no values", operator)))
        }
        "Gt" | "Lt" if values.len() != 1 || values[0].parse::<i64>().is_err() => {
            return Err(Error::malformed_expression(
                expr,
                format!("{} needs one integer", operator),
            ))
        }
        _ => {}
    }

    Ok(LabelSelectorRequirement {
        key: key.to_string(),
        operator: operator.to_string(),
        values,
    })
}

enum Entry {
    Equal(String, String),
    Expression(LabelSelectorRequirement),
}

fn entries(value: &Value) -> Result<Vec<Entry>> {
    if let Value::Object(map) = value {
        return map
            .iter()
            .map(|(key, value)| {
                scalar_string(value)
                    .map(|v| Entry::Equal(key.clone(), v))
                    .ok_or_else(|| Error::malformed_expression(key.as_str(), "label values must be scalars"))
            })
            .collect();
    }

    super::lines(value, "selector")?
        .into_iter()
        .map(|line| match line.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok(Entry::Equal(key.trim().to_string(), value.trim().to_string()))
            }
            Some(_) => Err(Error::malformed_expression(line.as_str(), "empty label key")),
            None => parse_requirement(&line).map(Entry::Expression),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn app_seed() -> BTreeMap<String, String> {
        let mut seed = BTreeMap::new();
        seed.insert("app".to_string(), "web".to_string());
        seed
    }

    // =========================================================================
    // Story: Mixed Equality And Expressions
    // =========================================================================

    /// Story: equality entries fold into matchLabels next to the seed
    #[test]
    fn story_mixed_list_splits_labels_and_expressions() {
        let selector =
            parse_label_selector(&json!(["tier In web,api", "env=prod"]), &app_seed()).unwrap();
        assert_eq!(
            serde_json::to_value(&selector).unwrap(),
            json!({
                "matchLabels": {"app": "web", "env": "prod"},
                "matchExpressions": [{"key": "tier", "operator": "In", "values": ["web", "api"]}]
            })
        );
    }

    #[test]
    fn story_map_is_exact_match() {
        let selector = parse_label_selector(&json!({"disk": "ssd", "app": "cache"}), &app_seed()).unwrap();
        assert_eq!(selector.match_labels.get("disk").map(String::as_str), Some("ssd"));
        assert_eq!(selector.match_labels.get("app").map(String::as_str), Some("cache"));
        assert!(selector.match_expressions.is_empty());
    }

    // =========================================================================
    // Story: Operators
    // =========================================================================

    #[test]
    fn story_operators_are_case_insensitive() {
        assert_eq!(parse_requirement("zone notin a, b").unwrap().operator, "NotIn");
        assert_eq!(parse_requirement("zone notin a, b").unwrap().values, vec!["a", "b"]);
        assert_eq!(parse_requirement("gpu EXISTS").unwrap().operator, "Exists");
        assert_eq!(parse_requirement("gpu doesnotexist").unwrap().operator, "DoesNotExist");
        let gt = parse_requirement("cores gt 4").unwrap();
        assert_eq!(gt.operator, "Gt");
        assert_eq!(gt.values, vec!["4"]);
    }

    #[test]
    fn story_operand_arity_enforced() {
        for bad in ["tier In", "gpu Exists yes", "cores Gt many", "cores Lt 1,2", "tier Like x", "tier"] {
            assert!(parse_requirement(bad).is_err(), "{:?}", bad);
        }
    }

    // =========================================================================
    // Story: Node Selector Terms
    // =========================================================================

    #[test]
    fn story_node_terms_turn_equality_into_in() {
        let terms = parse_node_selector_terms(&json!("disktype=ssd\nzone In us-east-1a,us-east-1b")).unwrap();
        assert_eq!(terms.len(), 1);
        let exprs = &terms[0].match_expressions;
        assert_eq!(exprs[0].key, "disktype");
        assert_eq!(exprs[0].operator, "In");
        assert_eq!(exprs[0].values, vec!["ssd"]);
        assert_eq!(exprs[1].values.len(), 2);

        assert!(parse_node_selector_terms(&Value::Null).unwrap().is_empty());
    }
}
