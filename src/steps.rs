//! Step-file loading using yaml-rust2
//!
//! A step file is a YAML sequence of single-key mappings (or one mapping
//! whose keys run in order). A key may carry parenthesized params:
//!
//! ```yaml
//! - ns: demo
//! - app(web):
//!     - containers: {nginx: {image: nginx}}
//!     - deploy: 2
//! ```
//!
//! The value of an `app` key is its nested step list; every other value is
//! the directive argument, converted to `serde_json::Value` for typed
//! deserialization downstream.

use std::fs;
use std::path::Path;

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::directive::Step;
use crate::{Error, Result};

/// Parse a step stream from YAML text
///
/// Multiple YAML documents are concatenated in order. Empty input yields no steps.
pub fn load_str(input: &str) -> Result<Vec<Step>> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| Error::yaml(e.to_string()))?;
    let mut steps = Vec::new();
    for doc in docs {
        steps.extend(steps_from(yaml_to_json(doc)?)?);
    }
    Ok(steps)
}

/// Read and parse a step file
pub fn load_file(path: &Path) -> Result<Vec<Step>> {
    let text = fs::read_to_string(path)?;
    load_str(&text).map_err(|e| match e {
        Error::Yaml(msg) => Error::yaml(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

fn steps_from(value: Value) -> Result<Vec<Step>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => {
            let mut steps = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Object(map) => steps.extend(steps_from_map(map)?),
                    other => {
                        return Err(Error::yaml(format!(
                            "a step must be a mapping of directive to argument, got {}",
                            other
                        )))
                    }
                }
            }
            Ok(steps)
        }
        Value::Object(map) => steps_from_map(map),
        other => Err(Error::yaml(format!("expected a list of steps, got {}", other))),
    }
}

fn steps_from_map(map: Map<String, Value>) -> Result<Vec<Step>> {
    map.into_iter()
        .map(|(key, value)| {
            let (directive, params) = parse_key(&key)?;
            if directive == "app" {
                Ok(Step {
                    directive,
                    params,
                    arg: Value::Null,
                    steps: steps_from(value)?,
                })
            } else {
                Ok(Step {
                    directive,
                    params,
                    arg: value,
                    steps: Vec::new(),
                })
            }
        })
        .collect()
}

/// Split `name(p1, p2)` into the name and trimmed params
pub fn parse_key(key: &str) -> Result<(String, Vec<String>)> {
    let key = key.trim();
    let Some(open) = key.find('(') else {
        return Ok((key.to_string(), Vec::new()));
    };
    let inner = key[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| Error::yaml(format!("unbalanced params in '{}'", key)))?;
    let name = key[..open].trim().to_string();
    if name.is_empty() {
        return Err(Error::yaml(format!("missing directive name in '{}'", key)));
    }
    let params = if inner.trim().is_empty() {
        Vec::new()
    } else {
        inner.split(',').map(|p| p.trim().to_string()).collect()
    };
    Ok((name, params))
}

/// Convert a yaml_rust2::Yaml value to serde_json::Value
fn yaml_to_json(yaml: Yaml) -> Result<Value> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s.parse().map_err(|e: std::num::ParseFloatError| Error::yaml(e.to_string()))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(Error::yaml("unsupported YAML key type")),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(Error::yaml("YAML aliases not supported")),
        Yaml::BadValue => Err(Error::yaml("bad YAML value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn story_nested_app_steps() {
        let steps = load_str(
            r#"
- ns: demo
- app(web, true):
    - labels: {tier: frontend}
    - containers:
        nginx:
          image: nginx
          ports: ["8080:80"]
    - deploy: 2
- ingress:
    http://x.test/: web
"#,
        )
        .unwrap();

        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].directive, "ns");
        assert_eq!(steps[0].arg, json!("demo"));

        let app = &steps[1];
        assert_eq!(app.directive, "app");
        assert_eq!(app.params, vec!["web", "true"]);
        assert_eq!(app.steps.len(), 3);
        assert_eq!(app.steps[1].arg["nginx"]["ports"][0], "8080:80");
        assert_eq!(app.steps[2].arg, json!(2));

        assert_eq!(steps[2].arg["http://x.test/"], "web");
    }

    #[test]
    fn story_mapping_form_keeps_key_order() {
        let steps = load_str("ns: demo\next_service(db): db.example.com:5432\n").unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.directive.as_str()).collect();
        assert_eq!(names, vec!["ns", "ext_service"]);
        assert_eq!(steps[1].params, vec!["db"]);
    }

    #[test]
    fn story_keys_with_params() {
        assert_eq!(parse_key("deploy").unwrap(), ("deploy".to_string(), vec![]));
        assert_eq!(parse_key("app()").unwrap(), ("app".to_string(), vec![]));
        assert_eq!(
            parse_key("ingress_by_header( X-Canary , always )").unwrap(),
            ("ingress_by_header".to_string(), vec!["X-Canary".to_string(), "always".to_string()])
        );
        assert!(parse_key("app(web").is_err());
        assert!(parse_key("(web)").is_err());
    }

    #[test]
    fn story_invalid_step_files() {
        assert!(load_str("- just a string").is_err());
        assert!(load_str("42").is_err());
        assert!(load_str("not: valid: yaml: {{").is_err());
        assert!(load_str("").unwrap().is_empty());
    }

    #[test]
    fn story_load_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.yml");
        fs::write(&path, "- ns: demo\n").unwrap();
        assert_eq!(load_file(&path).unwrap().len(), 1);

        fs::write(&path, "- [unclosed\n").unwrap();
        let err = load_file(&path).unwrap_err();
        assert!(err.to_string().contains("steps.yml"));
    }
}
