use std::sync::LazyLock;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Args;
use regex::Regex;

use crate::bind::BindSource;
use crate::buildah;
use crate::config::Config;
use crate::oci;
use crate::output::Console;
use crate::work::{self, ExecuteOptions};

#[derive(Args)]
pub struct BuildArgs {
    /// Id of the image or group to build
    pub thing_to_build: String,

    /// Provide a value for a templated parameter
    #[arg(long = "parameter", value_name = "NAME=VALUE")]
    pub parameters: Vec<String>,

    /// Config describing the images to build
    #[arg(long, value_name = "PATH", default_value = "buildalot.yaml")]
    pub config: Utf8PathBuf,

    /// Push images and manifests after building them
    #[arg(long)]
    pub push: bool,

    /// Print each command instead of running it
    #[arg(long)]
    pub dry_run: bool,

    /// Build only for the native architecture, ignoring configured ones
    #[arg(long)]
    pub native_arch_only: bool,

    /// Print intermediate configs and graphs while planning
    #[arg(long)]
    pub debug: bool,
}

pub fn run(args: &BuildArgs) -> Result<()> {
    tracing::info!(config = %args.config, target = %args.thing_to_build, "planning build");

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config {}", args.config))?;
    let config = Config::parse_str(&text)
        .with_context(|| format!("parsing config {}", args.config))?;

    // Reduce the config to the target and its transitive dependencies
    let relevant = config.partial_config(&[args.thing_to_build.as_str()])?;
    if args.debug {
        banner("relevant config");
        print!("{relevant}");
    }

    let needed = relevant.parameters();
    let provided = parse_cli_parameters(&args.parameters, &needed)?;

    let mut cli_source = BindSource::new("__command_line__").arguments(provided);
    if args.native_arch_only {
        cli_source = cli_source.architectures(Vec::new());
    }

    // Evaluate the config so all given parameters are applied. Parameters
    // the command line left out may still be satisfied by the group;
    // anything unsatisfied fails here.
    let bound = relevant.bind(cli_source)?;
    if args.debug {
        banner("bound config");
        print!("{bound}");
    }

    let oci_graph = oci::build_graph(&bound);
    if args.debug {
        banner("OCI graph");
        println!("{}", oci::graph_to_dot(&oci_graph));
    }

    let work_graph = buildah::build_graph(&oci_graph, args.push)?;
    if args.debug {
        banner("work graph");
        println!("{}", work::graph_to_dot(&work_graph));
    }
    tracing::info!(items = work_graph.len(), "executing build plan");

    let console = Console::stdout();
    let options = ExecuteOptions {
        max_workers: None,
        dry_run: args.dry_run,
    };
    work::execute(&work_graph, &console, &options)?;

    tracing::info!("all work complete");
    Ok(())
}

fn banner(label: &str) {
    println!("-----------------");
    println!("- Debug printing {label}");
}

static PARAMETER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^([A-Za-z0-9_-]+)=(.*)$").expect("valid regex"));

/// Parse repeated NAME=VALUE parameters, rejecting malformed entries and
/// names the config has no use for.
fn parse_cli_parameters(given: &[String], needed: &[String]) -> Result<Vec<(String, String)>> {
    let mut provided = Vec::with_capacity(given.len());
    for entry in given {
        let captures = PARAMETER_REGEX
            .captures(entry)
            .with_context(|| format!("invalid --parameter format '{entry}'"))?;
        let name = captures.get(1).expect("capture group").as_str();
        let value = captures.get(2).expect("capture group").as_str();
        anyhow::ensure!(
            needed.iter().any(|needed_name| needed_name == name),
            "given unnecessary --parameter {name}={value}"
        );
        provided.push((name.to_string(), value.to_string()));
    }
    Ok(provided)
}
