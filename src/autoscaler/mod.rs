//! HorizontalPodAutoscaler synthesis
//!
//! `hpa` wraps one workload directive and a set of metric targets:
//!
//! ```yaml
//! hpa:
//!   by: {cpu: 70%, memory: 512Mi}
//!   deploy: 2~10
//! ```
//!
//! The inner workload is synthesized with `min` replicas; the autoscaler
//! then owns the count between `min` and `max`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::AppContext;
use crate::dialect::{scalar_string, split_range};
use crate::directive::Directive;
use crate::k8s::{impl_api_defaults, HasApiResource, ObjectMeta};
use crate::workload::{self, normalize_replicas, Workload, WorkloadKind};
use crate::{Error, Result};

const DIRECTIVE: &str = "hpa";

// =============================================================================
// HorizontalPodAutoscaler
// =============================================================================

/// HorizontalPodAutoscaler (autoscaling/v2)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalPodAutoscaler {
    /// API version
    #[serde(default = "HorizontalPodAutoscaler::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "HorizontalPodAutoscaler::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: AutoscalerSpec,
}

impl HasApiResource for HorizontalPodAutoscaler {
    const API_VERSION: &'static str = "autoscaling/v2";
    const KIND: &'static str = "HorizontalPodAutoscaler";
}

impl_api_defaults!(HorizontalPodAutoscaler);

/// Autoscaler spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerSpec {
    /// Workload being scaled
    pub scale_target_ref: ScaleTargetRef,
    /// Lower replica bound
    pub min_replicas: i32,
    /// Upper replica bound
    pub max_replicas: i32,
    /// Scaling signals
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricSpec>,
}

/// Scale target reference
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Name
    pub name: String,
}

/// One scaling signal
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricSpec {
    /// Resource or Pods
    #[serde(rename = "type")]
    pub type_: String,
    /// Container resource metric (cpu, memory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceMetricSource>,
    /// Custom per-pod metric
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<PodsMetricSource>,
}

/// Resource metric source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResourceMetricSource {
    /// Resource name
    pub name: String,
    /// Target value
    pub target: MetricTarget,
}

/// Pods metric source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PodsMetricSource {
    /// Metric identifier
    pub metric: MetricIdentifier,
    /// Target value
    pub target: MetricTarget,
}

/// Metric identifier
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricIdentifier {
    /// Metric name
    pub name: String,
}

/// Metric target
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricTarget {
    /// Utilization or AverageValue
    #[serde(rename = "type")]
    pub type_: String,
    /// Percentage of the requested resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_utilization: Option<i32>,
    /// Absolute quantity averaged over pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_value: Option<String>,
}

impl MetricTarget {
    /// Parse `70%` into a utilization target, anything else into an average value
    pub fn parse(metric: &str, text: &str) -> Result<Self> {
        let text = text.trim();
        match text.strip_suffix('%') {
            Some(percent) => {
                let percent = percent.trim().parse::<i32>().ok().filter(|p| *p > 0).ok_or_else(|| {
                    Error::invalid_option(DIRECTIVE, format!("invalid utilization '{}' for {}", text, metric))
                })?;
                Ok(Self {
                    type_: "Utilization".to_string(),
                    average_utilization: Some(percent),
                    average_value: None,
                })
            }
            None if text.is_empty() => Err(Error::invalid_option(
                DIRECTIVE,
                format!("empty target for {}", metric),
            )),
            None => Ok(Self {
                type_: "AverageValue".to_string(),
                average_utilization: None,
                average_value: Some(text.to_string()),
            }),
        }
    }
}

/// Build the metric list from the `by` map
///
/// `cpu` and `memory` are resource metrics; any other name is a per-pod
/// custom metric and only takes an average value.
pub fn parse_metrics(by: &Value) -> Result<Vec<MetricSpec>> {
    let map = match by {
        Value::Null => return Ok(Vec::new()),
        Value::Object(map) => map,
        _ => {
            return Err(Error::invalid_option(
                DIRECTIVE,
                "'by' must map metric names to targets",
            ))
        }
    };

    let mut metrics = Vec::with_capacity(map.len());
    for (name, target) in map {
        let text = scalar_string(target).ok_or_else(|| {
            Error::invalid_option(DIRECTIVE, format!("target of {} must be a scalar", name))
        })?;
        let target = MetricTarget::parse(name, &text)?;
        let metric = match name.as_str() {
            "cpu" | "memory" => MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: name.clone(),
                    target,
                }),
                pods: None,
            },
            _ if target.average_utilization.is_some() => {
                return Err(Error::invalid_option(
                    DIRECTIVE,
                    format!("custom metric {} cannot use a utilization target", name),
                ))
            }
            _ => MetricSpec {
                type_: "Pods".to_string(),
                resource: None,
                pods: Some(PodsMetricSource {
                    metric: MetricIdentifier { name: name.clone() },
                    target,
                }),
            },
        };
        metrics.push(metric);
    }
    Ok(metrics)
}

// =============================================================================
// Synthesis
// =============================================================================

/// Workload key looked up through the directive table, so aliases such as
/// `deployment` work here too
fn scalable_kind(key: &str) -> Option<WorkloadKind> {
    match key.parse::<Directive>() {
        Ok(Directive::Workload(kind)) if kind.has_replicas() => Some(kind),
        _ => None,
    }
}

fn replica_bound(text: &str, which: &str) -> Result<i32> {
    text.parse::<i32>().ok().filter(|n| *n >= 1).ok_or_else(|| {
        Error::invalid_option(DIRECTIVE, format!("{} replicas must be a positive count, got '{}'", which, text))
    })
}

/// Synthesize the wrapped workload and its autoscaler
pub fn synthesize(
    ctx: &mut AppContext,
    option: Value,
    namespace: Option<&str>,
) -> Result<(Workload, HorizontalPodAutoscaler)> {
    if ctx.generate_name {
        return Err(Error::invalid_option(
            DIRECTIVE,
            format!("app '{}-' has a generated name the autoscaler cannot target", ctx.name),
        ));
    }
    let mut map: Map<String, Value> = match option {
        Value::Object(map) => map,
        other => {
            return Err(Error::invalid_option(
                DIRECTIVE,
                format!("expected a map with 'by' and one workload, got {}", other),
            ))
        }
    };
    let by = map.remove("by").unwrap_or(Value::Null);

    if map.len() != 1 {
        return Err(Error::invalid_option(
            DIRECTIVE,
            format!("expected exactly one of deploy, sts, rs, rc; got {} keys", map.len()),
        ));
    }
    let Some((key, inner)) = map.into_iter().next() else {
        return Err(Error::invalid_option(DIRECTIVE, "missing workload"));
    };
    let kind = scalable_kind(&key).ok_or_else(|| {
        Error::invalid_option(DIRECTIVE, format!("'{}' cannot be autoscaled", key))
    })?;

    let mut inner = normalize_replicas(kind.tag(), inner)?;
    let range = inner
        .get("replicas")
        .and_then(scalar_string)
        .ok_or_else(|| Error::invalid_option(DIRECTIVE, "inner workload needs replicas 'min~max'"))?;
    let (min, max) = match split_range(&range) {
        (min, Some(max)) => (replica_bound(&min, "min")?, replica_bound(&max, "max")?),
        (_, None) => {
            return Err(Error::invalid_option(
                DIRECTIVE,
                format!("replicas must be a 'min~max' range, got '{}'", range),
            ))
        }
    };
    if min > max {
        return Err(Error::invalid_option(
            DIRECTIVE,
            format!("min replicas {} exceed max {}", min, max),
        ));
    }
    inner.insert("replicas".to_string(), Value::from(min));

    let metrics = parse_metrics(&by)?;
    let workload = workload::synthesize(ctx, kind, Value::Object(inner), namespace)?;

    let autoscaler = HorizontalPodAutoscaler {
        api_version: HorizontalPodAutoscaler::default_api_version(),
        kind: HorizontalPodAutoscaler::default_kind(),
        metadata: ObjectMeta::new(ctx.name.clone(), namespace).with_labels(ctx.labels.clone()),
        spec: AutoscalerSpec {
            scale_target_ref: ScaleTargetRef {
                api_version: workload.api_version.clone(),
                kind: workload.kind.clone(),
                name: ctx.name.clone(),
            },
            min_replicas: min,
            max_replicas: max,
            metrics,
        },
    };
    Ok((workload, autoscaler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::Container;
    use serde_json::json;

    fn scope() -> AppContext {
        let mut ctx = AppContext::new("web", false);
        ctx.containers.push(Container {
            name: "nginx".to_string(),
            image: "nginx".to_string(),
            ..Default::default()
        });
        ctx
    }

    // =========================================================================
    // Story: Wrapping A Workload
    // =========================================================================

    /// Story: the inner workload starts at min and the HPA targets it
    #[test]
    fn story_deploy_wrapped_with_bounds() {
        let mut ctx = scope();
        let (workload, hpa) = synthesize(
            &mut ctx,
            json!({"by": {"cpu": "70%", "memory": "512Mi"}, "deploy": "2~10"}),
            Some("prod"),
        )
        .unwrap();

        assert_eq!(workload.kind, "Deployment");
        let doc = serde_json::to_value(&workload).unwrap();
        assert_eq!(doc["spec"]["replicas"], 2);

        let doc = serde_json::to_value(&hpa).unwrap();
        assert_eq!(doc["apiVersion"], "autoscaling/v2");
        assert_eq!(doc["metadata"]["name"], "web");
        assert_eq!(doc["metadata"]["namespace"], "prod");
        assert_eq!(
            doc["spec"]["scaleTargetRef"],
            json!({"apiVersion": "apps/v1", "kind": "Deployment", "name": "web"})
        );
        assert_eq!(doc["spec"]["minReplicas"], 2);
        assert_eq!(doc["spec"]["maxReplicas"], 10);
        assert_eq!(
            doc["spec"]["metrics"][0],
            json!({"type": "Resource", "resource": {"name": "cpu", "target": {"type": "Utilization", "averageUtilization": 70}}})
        );
        assert_eq!(
            doc["spec"]["metrics"][1]["resource"]["target"],
            json!({"type": "AverageValue", "averageValue": "512Mi"})
        );
    }

    #[test]
    fn story_statefulset_keeps_inner_options() {
        let mut ctx = scope();
        let (workload, hpa) = synthesize(
            &mut ctx,
            json!({"by": {"requests_per_second": "100"}, "sts": {"replicas": "1~3", "host_network": true}}),
            None,
        )
        .unwrap();

        assert!(ctx.is_stateful);
        let doc = serde_json::to_value(&workload).unwrap();
        assert_eq!(doc["spec"]["replicas"], 1);
        assert_eq!(doc["spec"]["template"]["spec"]["hostNetwork"], true);
        assert_eq!(hpa.spec.scale_target_ref.kind, "StatefulSet");
        assert_eq!(hpa.spec.metrics[0].type_, "Pods");
    }

    /// Story: the long workload names of the directive table work as targets
    #[test]
    fn story_workload_aliases_accepted() {
        let mut ctx = scope();
        let (workload, hpa) =
            synthesize(&mut ctx, json!({"by": {"cpu": "50%"}, "deployment": "1~3"}), None).unwrap();
        assert_eq!(workload.kind, "Deployment");
        assert_eq!(hpa.spec.max_replicas, 3);

        let mut ctx = scope();
        let (_, hpa) = synthesize(&mut ctx, json!({"replicaset": "2~4"}), None).unwrap();
        assert_eq!(hpa.spec.scale_target_ref.kind, "ReplicaSet");
    }

    /// Story: an app with a generated name has no stable name to scale
    #[test]
    fn story_generated_name_cannot_be_autoscaled() {
        let mut ctx = AppContext::new("batch-", false);
        ctx.containers = scope().containers;
        let err = synthesize(&mut ctx, json!({"by": {"cpu": "50%"}, "deploy": "1~3"}), None).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { ref message, .. } if message.contains("batch-")));
    }

    // =========================================================================
    // Story: Rejected Shapes
    // =========================================================================

    #[test]
    fn story_invalid_hpa_arguments() {
        let cases = [
            json!("deploy"),
            json!({"by": {"cpu": "50%"}}),
            json!({"deploy": "2~4", "sts": "1~2"}),
            json!({"ds": "1~2"}),
            json!({"daemonset": "1~2"}),
            json!({"job": "1~2"}),
            json!({"deploy": 3}),
            json!({"deploy": "5~2"}),
            json!({"deploy": "0~2"}),
            json!({"by": {"cpu": "lots%"}, "deploy": "1~2"}),
            json!({"by": {"qps": "50%"}, "deploy": "1~2"}),
            json!({"by": ["cpu"], "deploy": "1~2"}),
        ];
        for case in cases {
            let mut ctx = scope();
            assert!(synthesize(&mut ctx, case.clone(), None).is_err(), "{}", case);
        }
    }
}
