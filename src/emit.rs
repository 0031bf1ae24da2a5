//! Output emission
//!
//! Every finished document is wrapped in a [`Manifest`], tagged with a short
//! [`ResourceTag`] and handed to a [`DocumentSink`] together with the app it
//! belongs to. Sinks decide where documents go: [`MemorySink`] keeps them for
//! inspection, [`DirectorySink`] writes `<dir>/<app>-<tag>.yml`.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::autoscaler::HorizontalPodAutoscaler;
use crate::ingress::Ingress;
use crate::k8s::{ConfigMap, Namespace, Secret};
use crate::service::Service;
use crate::workload::Workload;
use crate::{Error, Result};

// =============================================================================
// Resource tags
// =============================================================================

/// Logical resource type of an emitted document
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceTag {
    /// Namespace
    Namespace,
    /// ConfigMap
    Config,
    /// Secret
    Secret,
    /// Service set (one or more Services)
    Service,
    /// Ingress
    Ingress,
    /// Pod
    Pod,
    /// ReplicationController
    ReplicationController,
    /// ReplicaSet
    ReplicaSet,
    /// DaemonSet
    DaemonSet,
    /// StatefulSet
    StatefulSet,
    /// Deployment
    Deployment,
    /// Job
    Job,
    /// CronJob
    CronJob,
    /// HorizontalPodAutoscaler
    Autoscaler,
}

impl ResourceTag {
    /// Tag for a Kubernetes `kind`
    pub fn from_kind(kind: &str) -> Option<Self> {
        Some(match kind {
            "Namespace" => Self::Namespace,
            "ConfigMap" => Self::Config,
            "Secret" => Self::Secret,
            "Service" => Self::Service,
            "Ingress" => Self::Ingress,
            "Pod" => Self::Pod,
            "ReplicationController" => Self::ReplicationController,
            "ReplicaSet" => Self::ReplicaSet,
            "DaemonSet" => Self::DaemonSet,
            "StatefulSet" => Self::StatefulSet,
            "Deployment" => Self::Deployment,
            "Job" => Self::Job,
            "CronJob" => Self::CronJob,
            "HorizontalPodAutoscaler" => Self::Autoscaler,
            _ => return None,
        })
    }

    /// Short form used in file names
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Namespace => "ns",
            Self::Config => "config",
            Self::Secret => "secret",
            Self::Service => "svc",
            Self::Ingress => "ingress",
            Self::Pod => "pod",
            Self::ReplicationController => "rc",
            Self::ReplicaSet => "rs",
            Self::DaemonSet => "ds",
            Self::StatefulSet => "sts",
            Self::Deployment => "deploy",
            Self::Job => "job",
            Self::CronJob => "cronjob",
            Self::Autoscaler => "hpa",
        }
    }
}

impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// A finished document
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    /// Namespace
    Namespace(Namespace),
    /// App ConfigMap
    ConfigMap(ConfigMap),
    /// App Secret
    Secret(Secret),
    /// Workload of any kind
    Workload(Box<Workload>),
    /// All Services of one app, one per exposure class
    Services(Vec<Service>),
    /// Ingress
    Ingress(Box<Ingress>),
    /// HorizontalPodAutoscaler
    Autoscaler(Box<HorizontalPodAutoscaler>),
    /// ExternalName Service
    ExternalService(Box<Service>),
}

impl Manifest {
    /// Kubernetes `kind` of the document
    pub fn kind(&self) -> &str {
        match self {
            Self::Namespace(ns) => &ns.kind,
            Self::ConfigMap(cm) => &cm.kind,
            Self::Secret(secret) => &secret.kind,
            Self::Workload(workload) => &workload.kind,
            Self::Services(_) | Self::ExternalService(_) => "Service",
            Self::Ingress(ingress) => &ingress.kind,
            Self::Autoscaler(hpa) => &hpa.kind,
        }
    }

    /// Resource tag of the document
    pub fn tag(&self) -> ResourceTag {
        ResourceTag::from_kind(self.kind()).unwrap_or(ResourceTag::Service)
    }

    /// Number of Kubernetes objects in the document
    pub fn object_count(&self) -> usize {
        match self {
            Self::Services(services) => services.len(),
            _ => 1,
        }
    }

    /// Render as YAML; a Service set becomes a multi-document stream
    pub fn to_yaml(&self) -> Result<String> {
        match self {
            Self::Namespace(ns) => render(ns),
            Self::ConfigMap(cm) => render(cm),
            Self::Secret(secret) => render(secret),
            Self::Workload(workload) => render(workload),
            Self::Services(services) => {
                let docs = services.iter().map(render).collect::<Result<Vec<_>>>()?;
                Ok(docs.join("---\n"))
            }
            Self::Ingress(ingress) => render(ingress),
            Self::Autoscaler(hpa) => render(hpa),
            Self::ExternalService(service) => render(service),
        }
    }

    /// Render as a JSON value; a Service set becomes an array
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Self::Namespace(ns) => serde_json::to_value(ns)?,
            Self::ConfigMap(cm) => serde_json::to_value(cm)?,
            Self::Secret(secret) => serde_json::to_value(secret)?,
            Self::Workload(workload) => serde_json::to_value(workload)?,
            Self::Services(services) => serde_json::to_value(services)?,
            Self::Ingress(ingress) => serde_json::to_value(ingress)?,
            Self::Autoscaler(hpa) => serde_json::to_value(hpa)?,
            Self::ExternalService(service) => serde_json::to_value(service)?,
        })
    }
}

fn render<T: Serialize>(doc: &T) -> Result<String> {
    Ok(serde_yaml::to_string(doc)?)
}

// =============================================================================
// Sinks
// =============================================================================

/// Receives finished documents
pub trait DocumentSink {
    /// Accept one document of `app`
    fn write(&mut self, tag: ResourceTag, app: &str, manifest: &Manifest) -> Result<()>;
}

/// One document captured by a [`MemorySink`]
#[derive(Clone, Debug, PartialEq)]
pub struct Emitted {
    /// Resource tag
    pub tag: ResourceTag,
    /// Owning app
    pub app: String,
    /// Document
    pub manifest: Manifest,
}

/// Keeps every document in emission order
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    /// Documents in emission order
    pub documents: Vec<Emitted>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents with `tag`, in emission order
    pub fn tagged(&self, tag: ResourceTag) -> impl Iterator<Item = &Emitted> {
        self.documents.iter().filter(move |d| d.tag == tag)
    }

    /// First document with `tag` emitted for `app`
    pub fn find(&self, tag: ResourceTag, app: &str) -> Option<&Manifest> {
        self.documents
            .iter()
            .find(|d| d.tag == tag && d.app == app)
            .map(|d| &d.manifest)
    }
}

impl DocumentSink for MemorySink {
    fn write(&mut self, tag: ResourceTag, app: &str, manifest: &Manifest) -> Result<()> {
        self.documents.push(Emitted {
            tag,
            app: app.to_string(),
            manifest: manifest.clone(),
        });
        Ok(())
    }
}

/// Writes each document to `<dir>/<app>-<tag>.yml`
///
/// Files left by an earlier run are replaced. Within one sink every path is
/// written at most once; a second document for the same app and tag (an
/// `ext_service` alias named like an app, say) fails with
/// [`Error::DuplicateOutput`].
#[derive(Clone, Debug)]
pub struct DirectorySink {
    dir: PathBuf,
    written: BTreeSet<PathBuf>,
}

impl DirectorySink {
    /// Create a sink rooted at `dir`; the directory is created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: BTreeSet::new(),
        }
    }

    /// Path of the file for `app` and `tag`
    pub fn path_for(&self, tag: ResourceTag, app: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.yml", app, tag))
    }
}

impl DocumentSink for DirectorySink {
    fn write(&mut self, tag: ResourceTag, app: &str, manifest: &Manifest) -> Result<()> {
        let path = self.path_for(tag, app);
        if self.written.contains(&path) {
            return Err(Error::DuplicateOutput(path));
        }
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, manifest.to_yaml()?)?;
        self.written.insert(path);
        Ok(())
    }
}

// =============================================================================
// Emitter
// =============================================================================

/// Tags, logs and forwards documents to a sink
pub struct Emitter<'a> {
    sink: &'a mut dyn DocumentSink,
    count: usize,
}

impl<'a> Emitter<'a> {
    /// Wrap a sink
    pub fn new(sink: &'a mut dyn DocumentSink) -> Self {
        Self { sink, count: 0 }
    }

    /// Emit one document of `app`
    pub fn emit(&mut self, app: &str, manifest: Manifest) -> Result<()> {
        let tag = manifest.tag();
        info!(app = %app, tag = %tag, objects = manifest.object_count(), "emitting document");
        self.sink.write(tag, app, &manifest)?;
        self.count += 1;
        Ok(())
    }

    /// Documents emitted so far
    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::ObjectMeta;
    use std::collections::BTreeMap;

    fn config(app: &str) -> Manifest {
        let mut data = BTreeMap::new();
        data.insert("LEVEL".to_string(), "debug".to_string());
        Manifest::ConfigMap(ConfigMap::new(ObjectMeta::new(format!("{}-config", app), None), data))
    }

    // =========================================================================
    // Story: Tags Follow Kinds
    // =========================================================================

    #[test]
    fn story_tags_derive_from_kind() {
        assert_eq!(config("web").tag(), ResourceTag::Config);
        assert_eq!(Manifest::Namespace(Namespace::new("demo")).tag(), ResourceTag::Namespace);
        assert_eq!(Manifest::Services(Vec::new()).tag(), ResourceTag::Service);
        assert_eq!(ResourceTag::from_kind("HorizontalPodAutoscaler"), Some(ResourceTag::Autoscaler));
        assert_eq!(ResourceTag::from_kind("Gateway"), None);
        assert_eq!(ResourceTag::CronJob.to_string(), "cronjob");
        assert_eq!(ResourceTag::Deployment.to_string(), "deploy");
    }

    // =========================================================================
    // Story: Sinks
    // =========================================================================

    #[test]
    fn story_memory_sink_keeps_order() {
        let mut sink = MemorySink::new();
        {
            let mut emitter = Emitter::new(&mut sink);
            emitter.emit("", Manifest::Namespace(Namespace::new("demo"))).unwrap();
            emitter.emit("web", config("web")).unwrap();
            assert_eq!(emitter.count(), 2);
        }
        assert_eq!(sink.documents.len(), 2);
        assert_eq!(sink.documents[1].app, "web");
        assert!(sink.find(ResourceTag::Config, "web").is_some());
        assert!(sink.find(ResourceTag::Config, "api").is_none());
        assert_eq!(sink.tagged(ResourceTag::Namespace).count(), 1);
    }

    /// Story: the directory sink writes one YAML file per app and tag
    #[test]
    fn story_directory_sink_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::new(dir.path().join("out"));
        sink.write(ResourceTag::Config, "web", &config("web")).unwrap();

        let path = sink.path_for(ResourceTag::Config, "web");
        assert!(path.ends_with("web-config.yml"));
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("kind: ConfigMap"));
        assert!(text.contains("name: web-config"));
        assert!(text.contains("LEVEL: debug"));
    }

    /// Story: a second document for the same file fails instead of replacing the first
    #[test]
    fn story_directory_sink_refuses_to_overwrite_within_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::new(dir.path());
        sink.write(ResourceTag::Config, "web", &config("web")).unwrap();

        let err = sink.write(ResourceTag::Config, "web", &config("web")).unwrap_err();
        assert!(matches!(err, Error::DuplicateOutput(ref path) if path.ends_with("web-config.yml")));

        // A fresh sink over the same directory replaces files of an earlier run
        let mut rerun = DirectorySink::new(dir.path());
        rerun.write(ResourceTag::Config, "web", &config("web")).unwrap();
    }

    #[test]
    fn story_service_set_renders_multi_document() {
        let service = |name: &str| Service {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata: ObjectMeta::new(name, None),
            spec: Default::default(),
        };
        let manifest = Manifest::Services(vec![service("web"), service("web-np")]);
        let yaml = manifest.to_yaml().unwrap();
        assert_eq!(yaml.matches("---").count(), 1);
        assert!(yaml.contains("name: web-np"));
        assert_eq!(manifest.to_value().unwrap().as_array().map(Vec::len), Some(2));
    }
}
