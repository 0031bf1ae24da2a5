//! Toleration lines
//!
//! ```text
//! line   := [key ["=" value]] [":" effect]
//! effect := NoSchedule | PreferNoSchedule | NoExecute
//! ```
//!
//! An empty key tolerates every taint.

use serde_json::Value;

use crate::k8s::Toleration;
use crate::{Error, Result};

const EFFECTS: &[&str] = &["NoSchedule", "PreferNoSchedule", "NoExecute"];

/// Parse a `tolerations` argument (multi-line string or list)
pub fn parse_tolerations(value: &Value) -> Result<Vec<Toleration>> {
    super::lines(value, "tolerations")?
        .iter()
        .map(|line| parse_toleration(line))
        .collect()
}

fn parse_toleration(line: &str) -> Result<Toleration> {
    let (rest, effect) = match line.rsplit_once(':') {
        Some((rest, effect)) => {
            let effect = effect.trim();
            if !EFFECTS.contains(&effect) {
                return Err(Error::malformed_expression(
                    line,
                    format!("unknown taint effect '{}'", effect),
                ));
            }
            (rest.trim(), Some(effect.to_string()))
        }
        None => (line.trim(), None),
    };

    let toleration = if rest.is_empty() {
        Toleration {
            operator: Some("Exists".to_string()),
            effect,
            ..Default::default()
        }
    } else if let Some((key, value)) = rest.split_once('=') {
        if key.trim().is_empty() {
            return Err(Error::malformed_expression(line, "empty taint key"));
        }
        Toleration {
            key: Some(key.trim().to_string()),
            operator: Some("Equal".to_string()),
            value: Some(value.trim().to_string()),
            effect,
        }
    } else {
        Toleration {
            key: Some(rest.to_string()),
            operator: Some("Exists".to_string()),
            effect,
            ..Default::default()
        }
    };
    Ok(toleration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn story_three_toleration_shapes() {
        let tolerations =
            parse_tolerations(&json!("dedicated=gpu:NoSchedule\nnode.kubernetes.io/unreachable\n:NoExecute"))
                .unwrap();
        assert_eq!(tolerations.len(), 3);

        assert_eq!(tolerations[0].key.as_deref(), Some("dedicated"));
        assert_eq!(tolerations[0].operator.as_deref(), Some("Equal"));
        assert_eq!(tolerations[0].value.as_deref(), Some("gpu"));
        assert_eq!(tolerations[0].effect.as_deref(), Some("NoSchedule"));

        assert_eq!(tolerations[1].key.as_deref(), Some("node.kubernetes.io/unreachable"));
        assert_eq!(tolerations[1].operator.as_deref(), Some("Exists"));
        assert_eq!(tolerations[1].effect, None);

        assert_eq!(tolerations[2].key, None);
        assert_eq!(tolerations[2].operator.as_deref(), Some("Exists"));
        assert_eq!(tolerations[2].effect.as_deref(), Some("NoExecute"));
    }

    #[test]
    fn story_unknown_effect_rejected() {
        let err = parse_tolerations(&json!(["gpu:Sometimes"])).unwrap_err();
        assert!(err.to_string().contains("Sometimes"));
        assert!(parse_tolerations(&json!(["=v"])).is_err());
    }
}
