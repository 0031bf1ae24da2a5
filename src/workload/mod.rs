//! Workload synthesis
//!
//! This module assembles the pod template from the app context and wraps it
//! into one of the pod-based workload kinds:
//! - Pod: template only, no selector
//! - ReplicationController, ReplicaSet, DaemonSet, StatefulSet, Deployment: template plus selector
//! - Job, CronJob: run-to-completion template with `restartPolicy: Never`
//!
//! Each call is independent; the only state it leaves behind is the
//! statefulness flag a StatefulSet sets on the scope.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::container::default_job_container;
use crate::context::AppContext;
use crate::dialect::{
    parse_host_aliases, parse_label_selector, parse_node_selector_terms, parse_tolerations,
    scalar_string,
};
use crate::k8s::{
    Affinity, Container, HostAlias, LabelSelector, NodeAffinity, NodeSelector, ObjectMeta,
    PodAffinity, PodAffinityTerm, Toleration, Volume,
};
use crate::{Error, Result, DEFAULT_JOB_IMAGE, HOSTNAME_TOPOLOGY_KEY};

// =============================================================================
// Workload kinds
// =============================================================================

/// Pod-based workload kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// Bare pod
    Pod,
    /// Legacy replication controller
    ReplicationController,
    /// Replica set
    ReplicaSet,
    /// One pod per node
    DaemonSet,
    /// Stable identities and storage
    StatefulSet,
    /// Rolling replica set
    Deployment,
    /// Run to completion
    Job,
    /// Scheduled job
    CronJob,
}

impl WorkloadKind {
    /// All kinds
    pub const ALL: [WorkloadKind; 8] = [
        Self::Pod,
        Self::ReplicationController,
        Self::ReplicaSet,
        Self::DaemonSet,
        Self::StatefulSet,
        Self::Deployment,
        Self::Job,
        Self::CronJob,
    ];

    /// API version of the kind
    pub fn api_version(self) -> &'static str {
        match self {
            Self::Pod | Self::ReplicationController => "v1",
            Self::ReplicaSet | Self::DaemonSet | Self::StatefulSet | Self::Deployment => "apps/v1",
            Self::Job | Self::CronJob => "batch/v1",
        }
    }

    /// Kubernetes `kind`
    pub fn kind(self) -> &'static str {
        match self {
            Self::Pod => "Pod",
            Self::ReplicationController => "ReplicationController",
            Self::ReplicaSet => "ReplicaSet",
            Self::DaemonSet => "DaemonSet",
            Self::StatefulSet => "StatefulSet",
            Self::Deployment => "Deployment",
            Self::Job => "Job",
            Self::CronJob => "CronJob",
        }
    }

    /// Short tag, also the directive name
    pub fn tag(self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::ReplicationController => "rc",
            Self::ReplicaSet => "rs",
            Self::DaemonSet => "ds",
            Self::StatefulSet => "sts",
            Self::Deployment => "deploy",
            Self::Job => "job",
            Self::CronJob => "cronjob",
        }
    }

    /// Look a kind up by its Kubernetes `kind`
    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.kind() == kind)
    }

    /// Job and CronJob
    pub fn is_job(self) -> bool {
        matches!(self, Self::Job | Self::CronJob)
    }

    /// Kinds that carry a replica count
    pub fn has_replicas(self) -> bool {
        matches!(
            self,
            Self::ReplicationController | Self::ReplicaSet | Self::StatefulSet | Self::Deployment
        )
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

// =============================================================================
// Pod template
// =============================================================================

/// Pod template spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    /// Pod metadata
    pub metadata: PodMeta,
    /// Pod spec
    pub spec: PodSpec,
}

/// Pod template metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Pod spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Init containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    /// Containers
    pub containers: Vec<Container>,
    /// Restart policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    /// Volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Affinity rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    /// Tolerations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Use the node network namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,
    /// DNS policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,
    /// Pod hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Extra `/etc/hosts` entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_aliases: Vec<HostAlias>,
}

// =============================================================================
// Workload documents
// =============================================================================

/// A workload document of any kind
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Kind-specific spec
    pub spec: WorkloadSpec,
}

/// Spec of a workload, shaped by its kind
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WorkloadSpec {
    /// CronJob spec
    CronJob(Box<CronJobSpec>),
    /// Controller spec
    Controller(Box<ControllerSpec>),
    /// Job spec
    Job(Box<JobSpec>),
    /// Bare pod spec
    Pod(Box<PodSpec>),
}

/// Selector of a controller
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Selector {
    /// Set-based selector (apps/v1 controllers)
    Labels(LabelSelector),
    /// Equality map (ReplicationController)
    Equality(BTreeMap<String, String>),
}

/// Spec shared by the replicated controllers and DaemonSet
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSpec {
    /// Number of replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Governing service (StatefulSet)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Pod selector
    pub selector: Selector,
    /// Pod template
    pub template: PodTemplateSpec,
}

/// Job spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Successful pods required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completions: Option<i32>,
    /// Pods running at once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,
    /// Seconds before the job is terminated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
    /// Retries before the job is failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
    /// Seconds a finished job is kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
    /// Pod template
    pub template: PodTemplateSpec,
}

/// CronJob spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronJobSpec {
    /// Cron schedule
    pub schedule: String,
    /// Allow, Forbid or Replace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_policy: Option<String>,
    /// Successful jobs kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_jobs_history_limit: Option<i32>,
    /// Failed jobs kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs_history_limit: Option<i32>,
    /// Stop scheduling new runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    /// Template of each run
    pub job_template: JobTemplateSpec,
}

/// Job template of a CronJob
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplateSpec {
    /// Job spec
    pub spec: JobSpec,
}

// =============================================================================
// Options
// =============================================================================

/// Options of a workload directive, after replica normalization
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadOptions {
    /// Replica count
    pub replicas: Option<Value>,
    /// Exact-match node labels
    #[serde(alias = "node")]
    pub node_selector: Map<String, Value>,
    /// Node affinity expressions
    pub node_affinity: Value,
    /// Co-locate with pods matching these expressions
    pub pod_affinity: Value,
    /// Keep away from pods matching these expressions
    pub pod_anti_affinity: Value,
    /// Toleration lines
    pub tolerations: Value,
    /// Use the node network namespace
    pub host_network: bool,
    /// Pod hostname
    pub hostname: Option<String>,
    /// Extra `/etc/hosts` entries
    pub host_aliases: Value,
    /// Restart policy (Pod and controllers)
    pub restart_policy: Option<String>,
    /// Image of the synthesized job container
    pub image: Option<String>,
    /// Command of the synthesized job container
    pub command: Value,
    /// Job completions
    pub completions: Option<i32>,
    /// Job parallelism
    pub parallelism: Option<i32>,
    /// Job active deadline in seconds
    pub deadline: Option<i64>,
    /// Job backoff limit
    pub backoff: Option<i32>,
    /// Seconds a finished job is kept
    pub ttl: Option<i32>,
    /// CronJob schedule
    pub schedule: Option<String>,
    /// CronJob concurrency policy
    pub concurrency_policy: Option<String>,
    /// CronJob successful history limit
    pub successful_history: Option<i32>,
    /// CronJob failed history limit
    pub failed_history: Option<i32>,
    /// Suspend the CronJob
    pub suspend: Option<bool>,
}

/// Normalize a workload argument into an option map
///
/// A number or string is a replica count, a map passes through, null is an
/// empty map. Anything else is rejected.
pub fn normalize_replicas(directive: &str, option: Value) -> Result<Map<String, Value>> {
    match option {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        scalar @ (Value::Number(_) | Value::String(_)) => {
            let mut map = Map::new();
            map.insert("replicas".to_string(), scalar);
            Ok(map)
        }
        other => Err(Error::invalid_option(
            directive,
            format!("expected a replica count or an option map, got {}", other),
        )),
    }
}

impl WorkloadOptions {
    /// Parse the options of a workload directive
    pub fn parse(kind: WorkloadKind, option: Value) -> Result<Self> {
        let map = normalize_replicas(kind.tag(), option)?;
        serde_json::from_value(Value::Object(map))
            .map_err(|e| Error::invalid_option(kind.tag(), e.to_string()))
    }

    fn replica_count(&self, kind: WorkloadKind) -> Result<Option<i32>> {
        let Some(raw) = &self.replicas else {
            return Ok(None);
        };
        scalar_string(raw)
            .and_then(|s| s.trim().parse::<i32>().ok())
            .filter(|n| *n >= 0)
            .map(Some)
            .ok_or_else(|| {
                Error::invalid_option(kind.tag(), format!("replicas must be a count, got {}", raw))
            })
    }
}

// =============================================================================
// Synthesis
// =============================================================================

/// Build a workload document of `kind` for the app in `ctx`
///
/// A StatefulSet marks the scope stateful so its ClusterIP service becomes
/// headless.
pub fn synthesize(
    ctx: &mut AppContext,
    kind: WorkloadKind,
    option: Value,
    namespace: Option<&str>,
) -> Result<Workload> {
    let options = WorkloadOptions::parse(kind, option)?;
    let replicas = options.replica_count(kind)?;
    if replicas.is_some() && !kind.has_replicas() {
        warn!(app = %ctx.name, kind = %kind, "ignoring replicas");
    }
    if !kind.is_job() && job_options_set(&options) {
        warn!(app = %ctx.name, kind = %kind, "ignoring job options");
    }
    if kind == WorkloadKind::StatefulSet {
        ctx.is_stateful = true;
    }

    let pod_spec = pod_spec(ctx, kind, &options)?;
    let template = PodTemplateSpec {
        metadata: PodMeta {
            labels: ctx.labels.clone(),
        },
        spec: pod_spec,
    };

    let spec = match kind {
        WorkloadKind::Pod => WorkloadSpec::Pod(Box::new(template.spec)),
        WorkloadKind::ReplicationController => WorkloadSpec::Controller(Box::new(ControllerSpec {
            replicas,
            service_name: None,
            selector: Selector::Equality(ctx.selector_labels()),
            template,
        })),
        WorkloadKind::ReplicaSet
        | WorkloadKind::DaemonSet
        | WorkloadKind::StatefulSet
        | WorkloadKind::Deployment => WorkloadSpec::Controller(Box::new(ControllerSpec {
            replicas: if kind.has_replicas() { replicas } else { None },
            service_name: (kind == WorkloadKind::StatefulSet).then(|| ctx.name.clone()),
            selector: Selector::Labels(LabelSelector {
                match_labels: ctx.selector_labels(),
                ..Default::default()
            }),
            template,
        })),
        WorkloadKind::Job => WorkloadSpec::Job(Box::new(job_spec(&options, template))),
        WorkloadKind::CronJob => {
            let schedule = options
                .schedule
                .clone()
                .ok_or_else(|| Error::invalid_option(kind.tag(), "missing 'schedule'"))?;
            WorkloadSpec::CronJob(Box::new(CronJobSpec {
                schedule,
                concurrency_policy: concurrency_policy(options.concurrency_policy.as_deref())?,
                successful_jobs_history_limit: options.successful_history,
                failed_jobs_history_limit: options.failed_history,
                suspend: options.suspend,
                job_template: JobTemplateSpec {
                    spec: job_spec(&options, template),
                },
            }))
        }
    };

    let metadata = if ctx.generate_name {
        ObjectMeta::generated(format!("{}-", ctx.name), namespace)
    } else {
        ObjectMeta::new(ctx.name.clone(), namespace)
    }
    .with_labels(ctx.labels.clone());

    debug!(app = %ctx.name, kind = %kind, "synthesized workload");
    Ok(Workload {
        api_version: kind.api_version().to_string(),
        kind: kind.kind().to_string(),
        metadata,
        spec,
    })
}

fn job_options_set(options: &WorkloadOptions) -> bool {
    options.completions.is_some()
        || options.parallelism.is_some()
        || options.deadline.is_some()
        || options.backoff.is_some()
        || options.ttl.is_some()
        || options.schedule.is_some()
        || options.concurrency_policy.is_some()
        || options.successful_history.is_some()
        || options.failed_history.is_some()
        || options.suspend.is_some()
}

fn job_spec(options: &WorkloadOptions, template: PodTemplateSpec) -> JobSpec {
    JobSpec {
        completions: options.completions,
        parallelism: options.parallelism,
        active_deadline_seconds: options.deadline,
        backoff_limit: options.backoff,
        ttl_seconds_after_finished: options.ttl,
        template,
    }
}

fn concurrency_policy(policy: Option<&str>) -> Result<Option<String>> {
    let Some(policy) = policy else {
        return Ok(None);
    };
    match policy.to_ascii_lowercase().as_str() {
        "allow" => Ok(Some("Allow".to_string())),
        "forbid" => Ok(Some("Forbid".to_string())),
        "replace" => Ok(Some("Replace".to_string())),
        other => Err(Error::invalid_option(
            "cronjob",
            format!("concurrency_policy must be Allow, Forbid or Replace, got '{}'", other),
        )),
    }
}

/// Assemble the pod spec from the scope and the directive options
fn pod_spec(ctx: &AppContext, kind: WorkloadKind, options: &WorkloadOptions) -> Result<PodSpec> {
    let mut containers = ctx.containers.clone();
    if containers.is_empty() {
        if !kind.is_job() {
            return Err(Error::invalid_option(
                kind.tag(),
                format!("app '{}' declares no containers", ctx.name),
            ));
        }
        let image = options.image.as_deref().unwrap_or(DEFAULT_JOB_IMAGE);
        containers.push(default_job_container(&ctx.name, image, &options.command)?);
    }

    let restart_policy = if kind.is_job() {
        if matches!(options.restart_policy.as_deref(), Some(p) if p != "Never") {
            warn!(app = %ctx.name, kind = %kind, "jobs always use restartPolicy Never");
        }
        Some("Never".to_string())
    } else {
        options.restart_policy.clone()
    };

    let node_selector = options
        .node_selector
        .iter()
        .map(|(k, v)| {
            scalar_string(v)
                .map(|v| (k.clone(), v))
                .ok_or_else(|| Error::invalid_option("node_selector", format!("'{}' must be a scalar", k)))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    let hostname = if ctx.use_as_hostname {
        Some(ctx.name.clone())
    } else {
        options.hostname.clone()
    };

    Ok(PodSpec {
        init_containers: ctx.init_containers.clone(),
        containers,
        restart_policy,
        volumes: ctx.pod_volumes(),
        node_selector,
        affinity: affinity(ctx, options)?,
        tolerations: parse_tolerations(&options.tolerations)?,
        host_network: options.host_network.then_some(true),
        dns_policy: options
            .host_network
            .then(|| "ClusterFirstWithHostNet".to_string()),
        hostname,
        host_aliases: parse_host_aliases(&options.host_aliases)?,
    })
}

/// Combine the independently optional affinity kinds
fn affinity(ctx: &AppContext, options: &WorkloadOptions) -> Result<Option<Affinity>> {
    let terms = parse_node_selector_terms(&options.node_affinity)?;
    let node_affinity = (!terms.is_empty()).then(|| NodeAffinity {
        required_during_scheduling_ignored_during_execution: NodeSelector {
            node_selector_terms: terms,
        },
    });

    let pod_term = |value: &Value| -> Result<Option<PodAffinity>> {
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(PodAffinity {
            required_during_scheduling_ignored_during_execution: vec![PodAffinityTerm {
                label_selector: parse_label_selector(value, &ctx.selector_labels())?,
                topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
            }],
        }))
    };

    let affinity = Affinity {
        node_affinity,
        pod_affinity: pod_term(&options.pod_affinity)?,
        pod_anti_affinity: pod_term(&options.pod_anti_affinity)?,
    };
    Ok((!affinity.is_empty()).then_some(affinity))
}
