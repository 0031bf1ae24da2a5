//! k8sboot - compile directive files into Kubernetes manifests

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use k8sboot::context::ServiceRegistry;
use k8sboot::emit::DirectorySink;
use k8sboot::steps;
use k8sboot::vars::Variables;
use k8sboot::Compiler;

/// k8sboot - turn terse deployment directives into Kubernetes documents
#[derive(Parser, Debug)]
#[command(name = "k8sboot", version, about, long_about = None)]
struct Cli {
    /// Step files, compiled in order
    ///
    /// Services registered by one file are visible to ingresses in later files.
    #[arg(required = true)]
    step_files: Vec<PathBuf>,

    /// Output directory; each document is written to `<app>-<tag>.yml`
    #[arg(short, long, env = "K8SBOOT_OUT", default_value = "out")]
    out: PathBuf,

    /// Variable binding `name=value`, available as `${name}` (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    vars: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut bindings = Vec::with_capacity(cli.vars.len());
    for var in &cli.vars {
        bindings.push(Variables::parse_assignment(var)?);
    }

    let mut registry = ServiceRegistry::new();
    let mut sink = DirectorySink::new(&cli.out);
    let mut total = 0;

    for path in &cli.step_files {
        let steps = steps::load_file(path).with_context(|| format!("loading {}", path.display()))?;

        let base_dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let mut vars = Variables::new(base_dir);
        for (name, value) in &bindings {
            vars.set(name.clone(), value.clone());
        }

        let mut compiler = Compiler::new(&mut registry, &vars, &mut sink);
        compiler
            .run(&steps)
            .with_context(|| format!("compiling {}", path.display()))?;
        info!(file = %path.display(), documents = compiler.emitted(), "compiled");
        total += compiler.emitted();
    }

    info!(documents = total, out = %cli.out.display(), "done");
    Ok(())
}
