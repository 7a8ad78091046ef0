//! Conflux - launcher CLI

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use conflux::runtime::{Cluster, HandlerRegistry, RuntimeError};
use conflux::util::config::{self, RuntimeConfig, Verbosity};
use conflux::util::logger;
use conflux::{fanout, NAME, VERSION};
use tracing::{debug, error, info};

/// Launch a cluster of execution domains and run the fan-out workload
#[derive(Parser, Debug)]
#[command(name = "conflux")]
#[command(author = "Conflux Team")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    /// Number of execution domains
    #[arg(short = 'n', long = "num-domains", value_name = "N")]
    num_domains: Option<String>,

    /// Only print warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Include suspended tasks in diagnostics snapshots
    #[arg(short = 'b', long = "blockreport")]
    block_report: bool,

    /// Include the task tree in diagnostics snapshots
    #[arg(short = 't', long = "taskreport")]
    task_report: bool,

    /// Inject an environment variable (name=value) unless already set
    #[arg(short = 'E', value_name = "NAME=VALUE")]
    env: Vec<String>,

    /// Override a configuration value (name=value)
    #[arg(short = 's', value_name = "NAME=VALUE")]
    set: Vec<String>,

    /// Read configuration assignments from a file
    #[arg(short = 'f', value_name = "FILE")]
    file: Option<PathBuf>,

    /// Make the first K iterations of the workload fail
    #[arg(long, value_name = "K", default_value_t = 0)]
    fail: usize,

    /// Print the final snapshot as JSON
    #[arg(long)]
    json: bool,
}

fn build_config(args: &Args) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::default();
    if let Some(file) = &args.file {
        config
            .load_file(file)
            .with_context(|| format!("Failed to load config: {}", file.display()))?;
    }
    for assignment in &args.set {
        let Some((key, value)) = assignment.split_once('=') else {
            bail!("-s expects name=value, got {:?}", assignment);
        };
        config.set(key, value)?;
    }
    if let Some(n) = &args.num_domains {
        config.set("numLocales", n)?;
    }
    if args.quiet {
        config.verbosity = Verbosity::Quiet;
    }
    if args.verbose {
        config.verbosity = Verbosity::Verbose;
    }
    config.block_report |= args.block_report;
    config.task_report |= args.task_report;
    for entry in &args.env {
        config.add_env(entry)?;
    }
    Ok(config)
}

fn print_snapshot(
    cluster: &Cluster,
    json: bool,
) -> Result<()> {
    let report = cluster.snapshot();
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = build_config(&args)?;
    logger::init_for(config.verbosity);

    for name in config.apply_environment() {
        debug!("injected environment variable {}", name);
    }
    let config = config::install(config)?.clone();
    let reporting = config.block_report || config.task_report;
    info!("{} {} starting {} domain(s)", NAME, VERSION, config.num_domains);

    let mut handlers = HandlerRegistry::new();
    fanout::register(&mut handlers);
    let cluster = Arc::new(Cluster::launch(config, handlers).context("Failed to launch cluster")?);

    let worker = {
        let cluster = cluster.clone();
        let fail = args.fail;
        tokio::task::spawn_blocking(move || fanout::run(&cluster, fail))
    };

    tokio::select! {
        outcome = worker => {
            match outcome.context("workload thread panicked")? {
                Ok(values) => {
                    for (index, value) in values.iter().enumerate() {
                        info!("domain {} -> {}", index, value);
                    }
                    println!("fanout completed on {} domain(s)", values.len());
                },
                Err(RuntimeError::Uncaught(errors)) => {
                    for failure in errors.flatten() {
                        error!("{}", failure);
                    }
                    bail!("fanout failed with {} uncaught error(s)", errors.flatten().len());
                },
                Err(err) => return Err(err).context("fanout failed"),
            }
            if reporting {
                print_snapshot(&cluster, args.json)?;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            if reporting {
                print_snapshot(&cluster, args.json)?;
            }
            std::process::exit(130);
        }
    }

    Ok(())
}
