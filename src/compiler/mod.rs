//! Directive compiler for k8sboot
//!
//! The compiler walks a step stream in order and turns each directive into
//! context mutations and emitted documents.
//!
//! # Architecture
//!
//! The Compiler owns no global state. It borrows:
//! - a [`ServiceRegistry`] that outlives the run, so later ingresses can
//!   resolve services of earlier apps
//! - a [`Resolver`] for variable substitution
//! - a [`DocumentSink`] for finished documents
//!
//! # Usage
//!
//! ```text
//! let mut registry = ServiceRegistry::new();
//! let vars = Variables::new(".");
//! let mut sink = MemorySink::new();
//! Compiler::new(&mut registry, &vars, &mut sink).run(&steps)?;
//! ```
//!
//! # Scope lifecycle
//!
//! `app` pushes an [`AppContext`], runs its nested steps and flushes: the
//! ConfigMap, Secret and Service set are emitted and the services are
//! promoted into the registry. The context is then dropped.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use tracing::{debug, info};

use crate::autoscaler;
use crate::container::build_containers;
use crate::context::{AppContext, ServiceRegistry};
use crate::dialect::scalar_string;
use crate::directive::{Directive, Step};
use crate::emit::{DocumentSink, Emitter, Manifest};
use crate::ingress::{Canary, IngressBuilder};
use crate::k8s::{ConfigMap, Namespace, ObjectMeta, Secret};
use crate::service;
use crate::vars::{is_file_reference, Resolver};
use crate::workload;
use crate::{Error, Result};

/// Compiles a directive stream into documents
pub struct Compiler<'a> {
    registry: &'a mut ServiceRegistry,
    resolver: &'a dyn Resolver,
    emitter: Emitter<'a>,
    namespace: Option<String>,
    scopes: Vec<AppContext>,
}

impl<'a> Compiler<'a> {
    /// Create a compiler for one run
    pub fn new(
        registry: &'a mut ServiceRegistry,
        resolver: &'a dyn Resolver,
        sink: &'a mut dyn DocumentSink,
    ) -> Self {
        Self {
            registry,
            resolver,
            emitter: Emitter::new(sink),
            namespace: None,
            scopes: Vec::new(),
        }
    }

    /// Number of documents emitted so far
    pub fn emitted(&self) -> usize {
        self.emitter.count()
    }

    /// Run steps in order; the first error aborts the run
    pub fn run(&mut self, steps: &[Step]) -> Result<()> {
        for step in steps {
            self.dispatch(step)?;
        }
        Ok(())
    }

    /// Execute a single step
    pub fn dispatch(&mut self, step: &Step) -> Result<()> {
        let directive: Directive = step.directive.parse()?;
        debug!(directive = %directive, params = ?step.params, depth = self.scopes.len(), "dispatching");

        if directive.is_app_scoped() && self.scopes.is_empty() {
            return Err(Error::NoAppScope(directive.to_string()));
        }

        match directive {
            Directive::Namespace => self.namespace_directive(&step.arg),
            Directive::App => self.app(step),
            Directive::Labels => self.labels(&step.arg),
            Directive::Config => self.key_values(&step.arg, false),
            Directive::Secret => self.key_values(&step.arg, true),
            Directive::Containers => self.containers(&step.arg, false),
            Directive::InitContainers => self.containers(&step.arg, true),
            Directive::Workload(kind) => {
                let option = self.resolver.resolve(&step.arg)?;
                let ctx = current(&mut self.scopes, directive)?;
                let workload = workload::synthesize(ctx, kind, option, self.namespace.as_deref())?;
                self.emitter.emit(&ctx.name, Manifest::Workload(Box::new(workload)))
            }
            Directive::Autoscaler => {
                let option = self.resolver.resolve(&step.arg)?;
                let ctx = current(&mut self.scopes, directive)?;
                let (workload, hpa) = autoscaler::synthesize(ctx, option, self.namespace.as_deref())?;
                self.emitter.emit(&ctx.name, Manifest::Workload(Box::new(workload)))?;
                self.emitter.emit(&ctx.name, Manifest::Autoscaler(Box::new(hpa)))
            }
            Directive::Ingress => self.ingress(&step.arg, None),
            Directive::IngressByHeader => self.ingress(&step.arg, Some(Canary::by_header(&step.params)?)),
            Directive::IngressByCookie => self.ingress(&step.arg, Some(Canary::by_cookie(&step.params)?)),
            Directive::IngressByWeight => self.ingress(&step.arg, Some(Canary::by_weight(&step.params)?)),
            Directive::ExternalService => self.external_service(step),
        }
    }

    // =========================================================================
    // Run-level directives
    // =========================================================================

    fn namespace_directive(&mut self, arg: &Value) -> Result<()> {
        let name = scalar_string(&self.resolver.resolve(arg)?)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| Error::invalid_option("ns", "expected a namespace name"))?;
        if let Some(existing) = &self.namespace {
            return Err(Error::DuplicateNamespace {
                existing: existing.clone(),
                requested: name,
            });
        }
        info!(namespace = %name, "namespace set");
        self.namespace = Some(name.clone());
        self.emitter.emit(&name, Manifest::Namespace(Namespace::new(name.clone())))
    }

    fn app(&mut self, step: &Step) -> Result<()> {
        let name = step
            .params
            .first()
            .map(|p| p.trim())
            .filter(|p| !p.trim_end_matches('-').is_empty())
            .ok_or_else(|| Error::invalid_option("app", "expected app(name[, hostname])"))?;
        let use_as_hostname = match step.params.get(1).map(|p| p.trim()) {
            None | Some("") | Some("false") => false,
            Some("hostname") | Some("true") => true,
            Some(other) => {
                return Err(Error::invalid_option(
                    "app",
                    format!("unknown flag '{}', expected 'hostname'", other),
                ))
            }
        };

        self.scopes.push(AppContext::new(name, use_as_hostname));
        debug!(app = %name, "entered app scope");
        let result = self.run(&step.steps);
        let Some(ctx) = self.scopes.pop() else {
            return result;
        };
        result?;
        self.flush(ctx)
    }

    /// Emit the scope-level documents of a closing app
    fn flush(&mut self, ctx: AppContext) -> Result<()> {
        let namespace = self.namespace.as_deref();

        if !ctx.config.is_empty() {
            let metadata = ObjectMeta::new(ctx.config_map_name(), namespace).with_labels(ctx.labels.clone());
            let config = ConfigMap::new(metadata, ctx.config.data.clone());
            self.emitter.emit(&ctx.name, Manifest::ConfigMap(config))?;
        }

        if !ctx.secret.is_empty() {
            let metadata = ObjectMeta::new(ctx.secret_name(), namespace).with_labels(ctx.labels.clone());
            let data: BTreeMap<String, String> = ctx
                .secret
                .data
                .iter()
                .map(|(k, v)| (k.clone(), STANDARD.encode(v)))
                .collect();
            self.emitter.emit(&ctx.name, Manifest::Secret(Secret::opaque(metadata, data)))?;
        }

        let plan = service::plan(&ctx, namespace);
        if !plan.is_empty() {
            self.emitter.emit(&ctx.name, Manifest::Services(plan.services.clone()))?;
            service::register(self.registry, &ctx.name, &plan);
        }

        debug!(app = %ctx.name, "flushed app scope");
        Ok(())
    }

    fn ingress(&mut self, arg: &Value, canary: Option<Canary>) -> Result<()> {
        let routes = self.resolver.resolve(arg)?;
        let ingress = IngressBuilder::new(self.registry, self.scopes.last(), self.namespace.as_deref())
            .build(&routes, canary.as_ref())?;
        let app = ingress.metadata.display_name().to_string();
        self.emitter.emit(&app, Manifest::Ingress(Box::new(ingress)))
    }

    fn external_service(&mut self, step: &Step) -> Result<()> {
        let alias = step
            .params
            .first()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::invalid_option("ext_service", "expected ext_service(alias)"))?;
        let arg = self.resolver.resolve(&step.arg)?;
        let (service, ports) = service::external_service(&alias, &arg, self.namespace.as_deref())?;
        self.registry.register_external(&alias, ports);
        self.emitter.emit(&alias, Manifest::ExternalService(Box::new(service)))
    }

    // =========================================================================
    // App-scoped directives
    // =========================================================================

    fn labels(&mut self, arg: &Value) -> Result<()> {
        let resolved = self.resolver.resolve(arg)?;
        let map = resolved
            .as_object()
            .ok_or_else(|| Error::invalid_option("labels", "expected a map of label to value"))?;
        let mut labels = BTreeMap::new();
        for (key, value) in map {
            let value = scalar_string(value).ok_or_else(|| {
                Error::invalid_option("labels", format!("label '{}' must be a scalar", key))
            })?;
            labels.insert(key.clone(), value);
        }
        current(&mut self.scopes, Directive::Labels)?.merge_labels(labels);
        Ok(())
    }

    /// `config` and `secret`: keys whose raw value is a `read_file` expression
    /// are remembered as file keys
    ///
    /// A non-map argument (`config: ${cfg}`) is resolved as a whole and must
    /// yield a map; its values are taken as already substituted.
    fn key_values(&mut self, arg: &Value, secret: bool) -> Result<()> {
        let directive = if secret { Directive::Secret } else { Directive::Config };
        let resolved;
        let (map, literal) = match arg.as_object() {
            Some(map) => (map, true),
            None => {
                resolved = self.resolver.resolve(arg)?;
                let map = resolved.as_object().ok_or_else(|| {
                    Error::invalid_option(directive.name(), "expected a map of key to value")
                })?;
                (map, false)
            }
        };

        let mut entries = Vec::with_capacity(map.len());
        for (key, raw) in map {
            let value = if literal { self.resolver.resolve(raw)? } else { raw.clone() };
            let value = scalar_string(&value).ok_or_else(|| {
                Error::invalid_option(directive.name(), format!("value of '{}' must be a scalar", key))
            })?;
            entries.push((key.clone(), value, literal && is_file_reference(raw)));
        }

        let ctx = current(&mut self.scopes, directive)?;
        let data = if secret { &mut ctx.secret } else { &mut ctx.config };
        for (key, value, from_file) in entries {
            data.insert(key, value, from_file);
        }
        Ok(())
    }

    fn containers(&mut self, arg: &Value, init: bool) -> Result<()> {
        let directive = if init { Directive::InitContainers } else { Directive::Containers };
        let ctx = current(&mut self.scopes, directive)?;
        let built = build_containers(ctx, self.resolver, arg)?;
        debug!(app = %ctx.name, count = built.len(), init, "containers declared");
        if init {
            ctx.init_containers.extend(built);
        } else {
            ctx.containers.extend(built);
        }
        Ok(())
    }
}

fn current(scopes: &mut [AppContext], directive: Directive) -> Result<&mut AppContext> {
    scopes
        .last_mut()
        .ok_or_else(|| Error::NoAppScope(directive.to_string()))
}
