//! Directives and the steps that carry them
//!
//! The directive set is closed: every name a step file may use maps to one
//! [`Directive`] variant through [`Directive::TABLE`], aliases included.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::workload::WorkloadKind;
use crate::Error;

/// A directive the compiler understands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Directive {
    /// Set the run namespace
    Namespace,
    /// Open an app scope
    App,
    /// Merge labels into the scope
    Labels,
    /// Add ConfigMap entries
    Config,
    /// Add Secret entries
    Secret,
    /// Declare containers
    Containers,
    /// Declare init containers
    InitContainers,
    /// Emit a workload of the given kind
    Workload(WorkloadKind),
    /// Emit a workload and its autoscaler
    Autoscaler,
    /// Emit an Ingress
    Ingress,
    /// Emit a header-routed canary Ingress
    IngressByHeader,
    /// Emit a cookie-routed canary Ingress
    IngressByCookie,
    /// Emit a weighted canary Ingress
    IngressByWeight,
    /// Emit an ExternalName Service
    ExternalService,
}

impl Directive {
    /// Every accepted name, aliases included
    pub const TABLE: &'static [(&'static str, Directive)] = &[
        ("ns", Self::Namespace),
        ("namespace", Self::Namespace),
        ("app", Self::App),
        ("labels", Self::Labels),
        ("config", Self::Config),
        ("secret", Self::Secret),
        ("containers", Self::Containers),
        ("init_containers", Self::InitContainers),
        ("initContainers", Self::InitContainers),
        ("pod", Self::Workload(WorkloadKind::Pod)),
        ("rc", Self::Workload(WorkloadKind::ReplicationController)),
        ("rs", Self::Workload(WorkloadKind::ReplicaSet)),
        ("replicaset", Self::Workload(WorkloadKind::ReplicaSet)),
        ("ds", Self::Workload(WorkloadKind::DaemonSet)),
        ("daemonset", Self::Workload(WorkloadKind::DaemonSet)),
        ("sts", Self::Workload(WorkloadKind::StatefulSet)),
        ("statefulset", Self::Workload(WorkloadKind::StatefulSet)),
        ("deploy", Self::Workload(WorkloadKind::Deployment)),
        ("deployment", Self::Workload(WorkloadKind::Deployment)),
        ("job", Self::Workload(WorkloadKind::Job)),
        ("cronjob", Self::Workload(WorkloadKind::CronJob)),
        ("hpa", Self::Autoscaler),
        ("ingress", Self::Ingress),
        ("ingress_by_header", Self::IngressByHeader),
        ("ingress_by_cookie", Self::IngressByCookie),
        ("ingress_by_weight", Self::IngressByWeight),
        ("ext_service", Self::ExternalService),
    ];

    /// Canonical name
    pub fn name(self) -> &'static str {
        match self {
            Self::Namespace => "ns",
            Self::App => "app",
            Self::Labels => "labels",
            Self::Config => "config",
            Self::Secret => "secret",
            Self::Containers => "containers",
            Self::InitContainers => "init_containers",
            Self::Workload(kind) => kind.tag(),
            Self::Autoscaler => "hpa",
            Self::Ingress => "ingress",
            Self::IngressByHeader => "ingress_by_header",
            Self::IngressByCookie => "ingress_by_cookie",
            Self::IngressByWeight => "ingress_by_weight",
            Self::ExternalService => "ext_service",
        }
    }

    /// Directives that only make sense inside an `app` scope
    pub fn is_app_scoped(self) -> bool {
        matches!(
            self,
            Self::Labels
                | Self::Config
                | Self::Secret
                | Self::Containers
                | Self::InitContainers
                | Self::Workload(_)
                | Self::Autoscaler
        )
    }
}

impl FromStr for Directive {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::TABLE
            .iter()
            .find(|(alias, _)| *alias == name)
            .map(|(_, directive)| *directive)
            .ok_or_else(|| Error::UnknownDirective(name.to_string()))
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One step of a directive stream
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Step {
    /// Directive name as written
    pub directive: String,
    /// Parenthesized params, e.g. `app(web,true)`
    pub params: Vec<String>,
    /// Argument tree
    pub arg: Value,
    /// Nested steps of an `app`
    pub steps: Vec<Step>,
}

impl Step {
    /// A step with an argument and no params
    pub fn new(directive: impl Into<String>, arg: Value) -> Self {
        Self {
            directive: directive.into(),
            arg,
            ..Default::default()
        }
    }

    /// Set the params
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// An `app` step with nested steps
    pub fn app(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            directive: "app".to_string(),
            params: vec![name.into()],
            arg: Value::Null,
            steps,
        }
    }
}
