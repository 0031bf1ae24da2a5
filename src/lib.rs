//! k8sboot - compiles terse deployment directives into Kubernetes documents
//!
//! A run walks an ordered stream of directives (`ns`, `app`, `containers`,
//! `deploy`, `ingress`, ...) and emits documents whose fields agree with each
//! other: service target ports match container ports, ingress backends name
//! the service actually produced for a port, and stateful workloads get a
//! headless service.
//!
//! # Architecture
//!
//! The engine consumes three seams and nothing else:
//! - a stream of [`directive::Step`] values
//! - a [`vars::Resolver`] that substitutes variables in argument trees
//! - an [`emit::DocumentSink`] that receives finished documents
//!
//! # Modules
//!
//! - [`dialect`] - Stateless parsers for port, mount, probe, selector and other shorthands
//! - [`context`] - Per-app accumulator and the cross-app service registry
//! - [`container`] - Container builder scoped to one container definition
//! - [`workload`] - Pod template assembly and workload kinds
//! - [`service`] - Service documents derived from declared ports
//! - [`ingress`] - Ingress rules, backend resolution and canary annotations
//! - [`autoscaler`] - HorizontalPodAutoscaler wrapping a workload directive
//! - [`emit`] - Manifest envelope, resource tags and document sinks
//! - [`directive`] - Closed directive table and step type
//! - [`compiler`] - Directive dispatch and app scope lifecycle
//! - [`steps`] - YAML step-file loader
//! - [`vars`] - Default variable resolver
//! - [`k8s`] - Typed Kubernetes structs shared by the synthesizers
//! - [`error`] - Error types for compilation

#![warn(missing_docs)]

pub mod autoscaler;
pub mod compiler;
pub mod container;
pub mod context;
pub mod dialect;
pub mod directive;
pub mod emit;
pub mod error;
pub mod ingress;
pub mod k8s;
pub mod service;
pub mod steps;
pub mod vars;
pub mod workload;

pub use compiler::Compiler;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Label every app-scoped document carries, valued with the app name
pub const APP_LABEL: &str = "app";

/// Image used for the synthesized container of a Job or CronJob
pub const DEFAULT_JOB_IMAGE: &str = "busybox";

/// Ingress class set on every emitted Ingress
pub const INGRESS_CLASS: &str = "nginx";

/// Annotation prefix of the nginx ingress controller
pub const NGINX_ANNOTATION_PREFIX: &str = "nginx.ingress.kubernetes.io";

/// Topology key used for pod affinity and anti-affinity terms
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
