//! Container synthesis
//!
//! A [`ContainerBuilder`] lives for exactly one container definition. It
//! resolves variables in the container's options itself, because the
//! `ref_resource_field` reference needs the name of the container being
//! built. Declared ports and volumes are recorded into the app context as a
//! side effect; nothing else produces them.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::context::AppContext;
use crate::dialect::{self, scalar_string};
use crate::k8s::{
    Container, ContainerPort, EnvVar, EnvVarSource, KeySelector, Lifecycle, ObjectFieldSelector,
    Probe, ResourceFieldSelector,
};
use crate::vars::{Functions, Resolver};
use crate::{Error, Result};

/// Pull policy for an image: `Always` for untagged or `latest`, else `IfNotPresent`
pub fn image_pull_policy(image: &str) -> String {
    if image.contains('@') {
        return "IfNotPresent".to_string();
    }
    let name = image.rsplit('/').next().unwrap_or(image);
    match name.rsplit_once(':') {
        Some((_, tag)) if tag != "latest" => "IfNotPresent".to_string(),
        _ => "Always".to_string(),
    }
}

/// Turn a command argument into an argv; strings run through `sh -c`
pub fn command_argv(value: &Value, what: &str) -> Result<Option<Vec<String>>> {
    match value {
        Value::Null => Ok(None),
        Value::String(cmd) => Ok(Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            cmd.clone(),
        ])),
        Value::Array(_) => string_list(value, what).map(Some),
        _ => Err(Error::invalid_option(what, "expected a string or a list")),
    }
}

fn string_list(value: &Value, what: &str) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                scalar_string(item).ok_or_else(|| Error::invalid_option(what, "entries must be scalars"))
            })
            .collect(),
        other => scalar_string(other)
            .map(|s| vec![s])
            .ok_or_else(|| Error::invalid_option(what, "expected a list")),
    }
}

// =============================================================================
// Reference functions
// =============================================================================

/// Env reference functions bound to one container
struct ReferenceFunctions<'a> {
    container: &'a str,
    config_map: String,
    secret: String,
}

impl ReferenceFunctions<'_> {
    /// `key` or `name/key`, defaulting the name
    fn key_selector(default_name: &str, argument: &str) -> KeySelector {
        match argument.split_once('/') {
            Some((name, key)) if !name.is_empty() => KeySelector {
                name: name.to_string(),
                key: key.to_string(),
            },
            Some((_, key)) => KeySelector {
                name: default_name.to_string(),
                key: key.to_string(),
            },
            None => KeySelector {
                name: default_name.to_string(),
                key: argument.to_string(),
            },
        }
    }
}

impl Functions for ReferenceFunctions<'_> {
    fn call(&self, name: &str, argument: &str) -> Option<Result<Value>> {
        let source = match name {
            "ref_pod_field" => EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: argument.to_string(),
                }),
                ..Default::default()
            },
            "ref_resource_field" => EnvVarSource {
                resource_field_ref: Some(ResourceFieldSelector {
                    container_name: self.container.to_string(),
                    resource: argument.to_string(),
                }),
                ..Default::default()
            },
            "ref_config" => EnvVarSource {
                config_map_key_ref: Some(Self::key_selector(&self.config_map, argument)),
                ..Default::default()
            },
            "ref_secret" => EnvVarSource {
                secret_key_ref: Some(Self::key_selector(&self.secret, argument)),
                ..Default::default()
            },
            _ => return None,
        };
        Some(serde_json::to_value(source).map_err(Error::from))
    }
}

// =============================================================================
// ContainerBuilder
// =============================================================================

/// Options accepted in a container definition
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ContainerOptions {
    image: Option<String>,
    #[serde(alias = "pull", alias = "imagePullPolicy")]
    image_pull_policy: Option<String>,
    command: Value,
    args: Value,
    #[serde(alias = "workdir")]
    working_dir: Option<String>,
    env: Map<String, Value>,
    ports: Value,
    volumes: Value,
    resources: Value,
    #[serde(alias = "liveness")]
    liveness_probe: Value,
    #[serde(alias = "readiness")]
    readiness_probe: Value,
    #[serde(alias = "startup")]
    startup_probe: Value,
    post_start: Option<String>,
    pre_stop: Option<String>,
}

/// Builds one container and records its ports and volumes into the scope
pub struct ContainerBuilder<'a> {
    ctx: &'a mut AppContext,
    resolver: &'a dyn Resolver,
    name: String,
}

impl<'a> ContainerBuilder<'a> {
    /// Start building container `name` inside `ctx`
    pub fn new(ctx: &'a mut AppContext, resolver: &'a dyn Resolver, name: impl Into<String>) -> Self {
        Self {
            ctx,
            resolver,
            name: name.into(),
        }
    }

    /// Resolve the raw options and build the container
    pub fn build(self, raw: &Value) -> Result<Container> {
        let functions = ReferenceFunctions {
            container: &self.name,
            config_map: self.ctx.config_map_name(),
            secret: self.ctx.secret_name(),
        };
        let resolved = self.resolver.resolve_with(raw, &functions)?;
        let what = format!("containers.{}", self.name);
        let options: ContainerOptions = serde_json::from_value(resolved)
            .map_err(|e| Error::invalid_option(what.as_str(), e.to_string()))?;

        let image = options
            .image
            .ok_or_else(|| Error::invalid_option(what.as_str(), "missing 'image'"))?;
        let pull_policy = options
            .image_pull_policy
            .unwrap_or_else(|| image_pull_policy(&image));

        let env = options
            .env
            .iter()
            .map(|(key, value)| env_var(&what, key, value))
            .collect::<Result<Vec<_>>>()?;

        let mut ports = Vec::new();
        for line in dialect::lines(&options.ports, "ports")? {
            let port = dialect::parse_port(&line)?;
            ports.push(ContainerPort {
                container_port: port.container_port,
                protocol: port.explicit_protocol(),
            });
            self.ctx.add_port(port);
        }

        let mut volume_mounts = Vec::new();
        for line in dialect::mount_lines(&options.volumes)? {
            let mount = dialect::parse_mount(&line, &self.ctx.name)?;
            self.ctx.add_volume(&mount);
            volume_mounts.push(mount.to_volume_mount());
        }

        let lifecycle = match (&options.post_start, &options.pre_stop) {
            (None, None) => None,
            (post_start, pre_stop) => Some(Lifecycle {
                post_start: post_start.as_deref().map(dialect::parse_action).transpose()?,
                pre_stop: pre_stop.as_deref().map(dialect::parse_action).transpose()?,
            }),
        };

        let container = Container {
            name: self.name.clone(),
            image,
            image_pull_policy: Some(pull_policy),
            command: command_argv(&options.command, &what)?,
            args: match options.args {
                Value::Null => None,
                ref args => Some(string_list(args, &what)?),
            },
            working_dir: options.working_dir,
            env,
            ports,
            resources: dialect::parse_resources(&options.resources)?,
            volume_mounts,
            liveness_probe: optional_probe(&options.liveness_probe)?,
            readiness_probe: optional_probe(&options.readiness_probe)?,
            startup_probe: optional_probe(&options.startup_probe)?,
            lifecycle,
        };
        debug!(app = %self.ctx.name, container = %container.name, "built container");
        Ok(container)
    }
}

fn optional_probe(value: &Value) -> Result<Option<Probe>> {
    match value {
        Value::Null => Ok(None),
        other => dialect::parse_probe(other).map(Some),
    }
}

fn env_var(what: &str, key: &str, value: &Value) -> Result<EnvVar> {
    match value {
        Value::Null => Ok(EnvVar::literal(key, "")),
        Value::Object(_) => {
            let source: EnvVarSource = serde_json::from_value(value.clone())
                .map_err(|e| Error::invalid_option(what, format!("env '{}': {}", key, e)))?;
            Ok(EnvVar::reference(key, source))
        }
        other => scalar_string(other)
            .map(|v| EnvVar::literal(key, v))
            .ok_or_else(|| Error::invalid_option(what, format!("env '{}' must be a scalar", key))),
    }
}

/// Build every container of a `containers` or `init_containers` argument
///
/// The argument maps container names to options; order is preserved. An
/// argument that is not a map (`containers: ${cs}`) is resolved first and
/// must yield one.
pub fn build_containers(
    ctx: &mut AppContext,
    resolver: &dyn Resolver,
    containers: &Value,
) -> Result<Vec<Container>> {
    let resolved;
    let containers = if containers.is_object() {
        containers
    } else {
        resolved = resolver.resolve(containers)?;
        &resolved
    };
    let map = containers
        .as_object()
        .ok_or_else(|| Error::invalid_option("containers", "expected a map of name to options"))?;
    let mut built = Vec::with_capacity(map.len());
    for (name, raw) in map {
        built.push(ContainerBuilder::new(ctx, resolver, name.as_str()).build(raw)?);
    }
    Ok(built)
}

/// Default container for a Job or CronJob declared without `containers`
pub fn default_job_container(name: &str, image: &str, command: &Value) -> Result<Container> {
    let command = command_argv(command, "command")?
        .ok_or_else(|| Error::invalid_option(name, "job without containers needs a 'command'"))?;
    Ok(Container {
        name: name.to_string(),
        image: image.to_string(),
        image_pull_policy: Some(image_pull_policy(image)),
        command: Some(command),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::ExposureClass;
    use crate::vars::Variables;
    use serde_json::json;

    fn vars() -> Variables {
        Variables::new(".").with("tag", "1.25")
    }

    // =========================================================================
    // Story: Basic Container
    // =========================================================================

    /// Story: the end-to-end nginx container keeps its declared ports
    #[test]
    fn story_container_with_ports_records_them() {
        let mut ctx = AppContext::new("web", false);
        let resolver = vars();
        let containers = build_containers(
            &mut ctx,
            &resolver,
            &json!({"nginx": {"image": "nginx:${tag}", "ports": ["8080:80"]}}),
        )
        .unwrap();

        assert_eq!(containers.len(), 1);
        let nginx = &containers[0];
        assert_eq!(nginx.name, "nginx");
        assert_eq!(nginx.image, "nginx:1.25");
        assert_eq!(nginx.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(nginx.ports[0].container_port, 80);

        assert_eq!(ctx.ports.len(), 1);
        assert_eq!(ctx.ports[0].service_port, 8080);
        assert_eq!(ctx.ports[0].exposure(), ExposureClass::ClusterIp);
    }

    #[test]
    fn story_missing_image_and_unknown_option_rejected() {
        let mut ctx = AppContext::new("web", false);
        let resolver = vars();
        let err = build_containers(&mut ctx, &resolver, &json!({"c": {"ports": ["80"]}})).unwrap_err();
        assert!(err.to_string().contains("image"));

        let err = build_containers(&mut ctx, &resolver, &json!({"c": {"image": "x", "imagee": 1}})).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { .. }));
    }

    #[test]
    fn story_kubernetes_spelling_of_pull_policy_accepted() {
        let mut ctx = AppContext::new("web", false);
        let resolver = vars();
        let containers = build_containers(
            &mut ctx,
            &resolver,
            &json!({"nginx": {"image": "nginx:1.25", "imagePullPolicy": "Always"}}),
        )
        .unwrap();
        assert_eq!(containers[0].image_pull_policy.as_deref(), Some("Always"));
    }

    /// Story: a whole containers map can come from one variable
    #[test]
    fn story_containers_bound_to_a_variable() {
        let mut ctx = AppContext::new("web", false);
        let resolver = vars().with(
            "cs",
            json!({"nginx": {"image": "nginx:${tag}", "ports": ["80"]}}),
        );
        let containers = build_containers(&mut ctx, &resolver, &json!("${cs}")).unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].image, "nginx:1.25");
        assert_eq!(ctx.ports.len(), 1);

        let resolver = vars().with("cs", "nginx");
        let err = build_containers(&mut ctx, &resolver, &json!("${cs}")).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { .. }));
    }

    // =========================================================================
    // Story: Commands And Env
    // =========================================================================

    #[test]
    fn story_string_command_runs_through_shell() {
        let mut ctx = AppContext::new("web", false);
        let resolver = vars();
        let containers = build_containers(
            &mut ctx,
            &resolver,
            &json!({"app": {"image": "busybox", "command": "sleep 10 && echo done", "args": ["-v"]}}),
        )
        .unwrap();
        assert_eq!(
            containers[0].command.as_deref().unwrap(),
            ["sh", "-c", "sleep 10 && echo done"]
        );
        assert_eq!(containers[0].args.as_deref().unwrap(), ["-v"]);
        assert_eq!(containers[0].image_pull_policy.as_deref(), Some("Always"));
    }

    /// Story: reference functions know the container they are evaluated in
    #[test]
    fn story_env_references() {
        let mut ctx = AppContext::new("web", false);
        let resolver = vars();
        let containers = build_containers(
            &mut ctx,
            &resolver,
            &json!({"api": {
                "image": "api:1",
                "env": {
                    "LEVEL": "debug",
                    "WORKERS": 4,
                    "POD_IP": "${ref_pod_field(status.podIP)}",
                    "MEM": "${ref_resource_field(limits.memory)}",
                    "DSN": "${ref_config(dsn)}",
                    "TOKEN": "${ref_secret(shared/token)}"
                }
            }}),
        )
        .unwrap();

        let env = &containers[0].env;
        assert_eq!(env[0].value.as_deref(), Some("debug"));
        assert_eq!(env[1].value.as_deref(), Some("4"));

        let pod_ip = env[2].value_from.as_ref().unwrap();
        assert_eq!(pod_ip.field_ref.as_ref().unwrap().field_path, "status.podIP");

        let mem = env[3].value_from.as_ref().unwrap().resource_field_ref.as_ref().unwrap();
        assert_eq!(mem.container_name, "api");
        assert_eq!(mem.resource, "limits.memory");

        let dsn = env[4].value_from.as_ref().unwrap().config_map_key_ref.as_ref().unwrap();
        assert_eq!(dsn.name, "web-config");
        assert_eq!(dsn.key, "dsn");

        let token = env[5].value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(token.name, "shared");
        assert_eq!(token.key, "token");
    }

    // =========================================================================
    // Story: Volumes Shared Across Containers
    // =========================================================================

    #[test]
    fn story_same_mount_in_two_containers_yields_one_volume() {
        let mut ctx = AppContext::new("web", false);
        let resolver = vars();
        let containers = build_containers(
            &mut ctx,
            &resolver,
            &json!({
                "writer": {"image": "w:1", "volumes": "dir:///data:/data"},
                "reader": {"image": "r:1", "volumes": ["dir:///data:/srv/data:ro", "/tmp/cache"]}
            }),
        )
        .unwrap();

        assert_eq!(ctx.volumes().count(), 2);
        assert_eq!(containers[0].volume_mounts[0].name, containers[1].volume_mounts[0].name);
        assert_eq!(containers[0].volume_mounts[0].read_only, None);
        assert_eq!(containers[1].volume_mounts[0].read_only, Some(true));
    }

    // =========================================================================
    // Story: Probes, Lifecycle, Resources
    // =========================================================================

    #[test]
    fn story_probes_lifecycle_and_resources() {
        let mut ctx = AppContext::new("db", false);
        let resolver = vars();
        let containers = build_containers(
            &mut ctx,
            &resolver,
            &json!({"pg": {
                "image": "postgres:16",
                "liveness": {"action": "tcp://:5432", "seconds": "i=5 p=10"},
                "readiness": "pg_isready",
                "pre_stop": "pg_ctl stop",
                "resources": {"cpu": "250m~1", "memory": "256Mi~1Gi"}
            }}),
        )
        .unwrap();

        let pg = &containers[0];
        assert_eq!(pg.liveness_probe.as_ref().unwrap().initial_delay_seconds, Some(5));
        assert!(pg.readiness_probe.as_ref().unwrap().handler.exec.is_some());
        assert!(pg.startup_probe.is_none());
        let lifecycle = pg.lifecycle.as_ref().unwrap();
        assert!(lifecycle.post_start.is_none());
        assert_eq!(
            lifecycle.pre_stop.as_ref().unwrap().exec.as_ref().unwrap().command,
            vec!["sh", "-c", "pg_ctl stop"]
        );
        assert_eq!(
            pg.resources.as_ref().unwrap().limits.as_ref().unwrap().memory.as_deref(),
            Some("1Gi")
        );
    }

    // =========================================================================
    // Story: Helpers
    // =========================================================================

    #[test]
    fn story_image_pull_policy() {
        assert_eq!(image_pull_policy("nginx"), "Always");
        assert_eq!(image_pull_policy("nginx:latest"), "Always");
        assert_eq!(image_pull_policy("nginx:1.25"), "IfNotPresent");
        assert_eq!(image_pull_policy("registry:5000/team/app"), "Always");
        assert_eq!(image_pull_policy("registry:5000/team/app:v2"), "IfNotPresent");
        assert_eq!(image_pull_policy("app@sha256:abc"), "IfNotPresent");
    }

    #[test]
    fn story_default_job_container() {
        let container = default_job_container("backup", "busybox", &json!("tar czf /b.tgz /data")).unwrap();
        assert_eq!(container.name, "backup");
        assert_eq!(container.command.unwrap()[0], "sh");
        assert!(default_job_container("backup", "busybox", &Value::Null).is_err());
    }
}
