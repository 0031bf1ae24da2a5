//! Variable substitution in argument trees
//!
//! ```text
//! text       := (literal | "$$" | "${" expression "}")*
//! expression := name ("." name)*          variable lookup
//!             | function "(" argument ")" function call
//! ```
//!
//! A string that is exactly one `${...}` expression is replaced by the raw
//! value, so a variable bound to a list stays a list. Expressions embedded in
//! longer text are rendered as strings. `$$` is a literal `$`; any other `$`
//! is left alone.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Function namespace consulted before the built-ins
pub trait Functions {
    /// Evaluate `name(argument)`, or `None` when `name` is not handled here
    fn call(&self, name: &str, argument: &str) -> Option<Result<Value>>;
}

/// Namespace with no functions of its own
pub struct NoFunctions;

impl Functions for NoFunctions {
    fn call(&self, _name: &str, _argument: &str) -> Option<Result<Value>> {
        None
    }
}

/// Substitutes variables in an argument tree
pub trait Resolver {
    /// Resolve with extra functions available to expressions
    fn resolve_with(&self, value: &Value, functions: &dyn Functions) -> Result<Value>;

    /// Resolve with only the built-in functions
    fn resolve(&self, value: &Value) -> Result<Value> {
        self.resolve_with(value, &NoFunctions)
    }
}

/// Whether a raw argument is exactly a `${read_file(...)}` expression
pub fn is_file_reference(value: &Value) -> bool {
    value
        .as_str()
        .and_then(whole_expression)
        .and_then(split_call)
        .is_some_and(|(name, _)| name == "read_file")
}

// =============================================================================
// Variables
// =============================================================================

/// Default resolver over a flat set of bindings
///
/// Built-in function: `read_file(path)`, relative to the base directory.
#[derive(Clone, Debug, Default)]
pub struct Variables {
    bindings: BTreeMap<String, Value>,
    base_dir: PathBuf,
}

impl Variables {
    /// Create an empty set resolving files against `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            bindings: BTreeMap::new(),
            base_dir: base_dir.into(),
        }
    }

    /// Bind a variable
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Bind or rebind a variable
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.bindings.insert(name.into(), value.into());
    }

    /// Parse a `name=value` assignment as given on the command line
    pub fn parse_assignment(text: &str) -> Result<(String, Value)> {
        match text.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                Ok((name.trim().to_string(), Value::String(value.to_string())))
            }
            _ => Err(Error::malformed_expression(text, "expected name=value")),
        }
    }

    fn lookup(&self, path: &str) -> Result<Value> {
        if let Some(value) = self.bindings.get(path) {
            return Ok(value.clone());
        }
        let mut segments = path.split('.');
        let mut current = segments.next().and_then(|head| self.bindings.get(head));
        for segment in segments {
            current = current.and_then(|v| v.get(segment));
        }
        current
            .cloned()
            .ok_or_else(|| Error::UndefinedVariable(path.to_string()))
    }

    fn evaluate(&self, expr: &str, functions: &dyn Functions) -> Result<Value> {
        let expr = expr.trim();
        let Some((name, argument)) = split_call(expr) else {
            return self.lookup(expr);
        };
        if let Some(result) = functions.call(name, argument) {
            return result;
        }
        match name {
            "read_file" => {
                let content = std::fs::read_to_string(self.base_dir.join(argument))?;
                Ok(Value::String(content))
            }
            other => Err(Error::malformed_expression(
                expr,
                format!("unknown function '{}'", other),
            )),
        }
    }

    fn interpolate(&self, text: &str, functions: &dyn Functions) -> Result<Value> {
        if let Some(expr) = whole_expression(text) {
            return self.evaluate(expr, functions);
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(idx) = rest.find('$') {
            out.push_str(&rest[..idx]);
            let tail = &rest[idx..];
            if let Some(after) = tail.strip_prefix("$$") {
                out.push('$');
                rest = after;
            } else if let Some(after) = tail.strip_prefix("${") {
                let end = after
                    .find('}')
                    .ok_or_else(|| Error::malformed_expression(text, "unterminated '${'"))?;
                match self.evaluate(&after[..end], functions)? {
                    Value::String(s) => out.push_str(&s),
                    Value::Null => {}
                    scalar @ (Value::Number(_) | Value::Bool(_)) => out.push_str(&scalar.to_string()),
                    _ => {
                        return Err(Error::malformed_expression(
                            text,
                            "a structured value cannot be embedded in text",
                        ))
                    }
                }
                rest = &after[end + 1..];
            } else {
                out.push('$');
                rest = &tail[1..];
            }
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }
}

impl Resolver for Variables {
    fn resolve_with(&self, value: &Value, functions: &dyn Functions) -> Result<Value> {
        match value {
            Value::String(text) => self.interpolate(text, functions),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_with(item, functions))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, item) in map {
                    let key = match self.interpolate(key, functions)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    resolved.insert(key, self.resolve_with(item, functions)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }
}

/// Inner expression when the whole text is a single `${...}`
fn whole_expression(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("${")?.strip_suffix('}')?;
    (!inner.contains('}') && !inner.contains("${")).then_some(inner)
}

/// Split `name(argument)`; surrounding quotes on the argument are dropped
fn split_call(expr: &str) -> Option<(&str, &str)> {
    let expr = expr.trim();
    let open = expr.find('(')?;
    let inner = expr.strip_suffix(')')?.get(open + 1..)?.trim();
    let name = expr[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    let unquoted = inner
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(inner);
    Some((name, unquoted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Variables {
        Variables::new(".")
            .with("domain", "x.test")
            .with("replicas", 3)
            .with("hosts", json!(["a", "b"]))
            .with("db", json!({"host": "pg", "port": 5432}))
    }

    // =========================================================================
    // Story: Substitution
    // =========================================================================

    /// Story: a lone expression keeps the bound value's type
    #[test]
    fn story_whole_expression_keeps_raw_value() {
        let v = vars();
        assert_eq!(v.resolve(&json!("${replicas}")).unwrap(), json!(3));
        assert_eq!(v.resolve(&json!("${hosts}")).unwrap(), json!(["a", "b"]));
        assert_eq!(v.resolve(&json!("${db.port}")).unwrap(), json!(5432));
    }

    #[test]
    fn story_embedded_expressions_render_as_text() {
        let v = vars();
        let resolved = v
            .resolve(&json!({"http://${domain}/": "web", "dsn": "${db.host}:${db.port}"}))
            .unwrap();
        assert_eq!(resolved, json!({"http://x.test/": "web", "dsn": "pg:5432"}));
    }

    #[test]
    fn story_dollar_escapes() {
        let v = vars();
        assert_eq!(v.resolve(&json!("$$HOME")).unwrap(), json!("$HOME"));
        assert_eq!(v.resolve(&json!("$$${domain}")).unwrap(), json!("$x.test"));
        assert_eq!(v.resolve(&json!("echo $PATH")).unwrap(), json!("echo $PATH"));
    }

    #[test]
    fn story_undefined_and_malformed_fail() {
        let v = vars();
        assert!(matches!(
            v.resolve(&json!("${missing}")).unwrap_err(),
            Error::UndefinedVariable(name) if name == "missing"
        ));
        assert!(v.resolve(&json!("a ${domain")).is_err());
        assert!(v.resolve(&json!("${nope(1)}")).is_err());
        assert!(v.resolve(&json!("list: ${hosts}")).is_err());
    }

    // =========================================================================
    // Story: Functions
    // =========================================================================

    #[test]
    fn story_read_file_relative_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nginx.conf"), "server {}").unwrap();
        let v = Variables::new(dir.path());

        assert_eq!(
            v.resolve(&json!("${read_file(nginx.conf)}")).unwrap(),
            json!("server {}")
        );
        assert_eq!(
            v.resolve(&json!("${read_file('nginx.conf')}")).unwrap(),
            json!("server {}")
        );
        assert!(matches!(
            v.resolve(&json!("${read_file(absent.conf)}")).unwrap_err(),
            Error::Io(_)
        ));
    }

    struct Upper;

    impl Functions for Upper {
        fn call(&self, name: &str, argument: &str) -> Option<Result<Value>> {
            (name == "upper").then(|| Ok(Value::String(argument.to_uppercase())))
        }
    }

    #[test]
    fn story_caller_functions_take_precedence() {
        let v = vars();
        assert_eq!(v.resolve_with(&json!("${upper(abc)}"), &Upper).unwrap(), json!("ABC"));
        assert!(v.resolve(&json!("${upper(abc)}")).is_err());
    }

    #[test]
    fn story_file_reference_detection() {
        assert!(is_file_reference(&json!("${read_file(a.conf)}")));
        assert!(!is_file_reference(&json!("prefix ${read_file(a.conf)}")));
        assert!(!is_file_reference(&json!("${domain}")));
        assert!(!is_file_reference(&json!(1)));
    }

    #[test]
    fn story_cli_assignments() {
        let (name, value) = Variables::parse_assignment("domain=x.test").unwrap();
        assert_eq!(name, "domain");
        assert_eq!(value, json!("x.test"));
        assert!(Variables::parse_assignment("novalue").is_err());
    }
}
