//! Command-line front end: `biscepter bisect` starts a job plus its REST
//! adapter, `biscepter clean` removes every Docker artifact biscepter has
//! ever created on this host.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context;
use clap::{Parser, Subcommand};
use signal_hook::consts::signal::SIGINT;
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use biscepter_core::{ContainerRuntime, DockerCli, Job};

mod tracing_setup;

#[derive(Parser, Debug)]
#[command(
    name = "biscepter",
    version,
    about = "Efficient git bisection using Docker image caching for fast repeated and concurrent bisection"
)]
struct Cli {
    /// Verbosity [0-3]; negative values silence all output.
    #[arg(short = 'v', long = "verbose", global = true, default_value_t = 1)]
    verbose: i8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a REST server for bisecting issues based on a job.yml.
    ///
    /// Each replica bisects one independent issue over the same commit
    /// range; drive them via GET /system and POST /isGood + /isBad.
    Bisect {
        /// Path to the job config YAML.
        job_yml: PathBuf,
        /// How many replicas to launch.
        #[arg(default_value_t = 1)]
        replicas: usize,
        /// The port on which to start the server.
        #[arg(short, long, default_value_t = 40032)]
        port: u16,
        /// The max amount of replicas that can run concurrently, or 0 if
        /// no limit.
        #[arg(short = 'c', long = "max-concurrency", default_value_t = 0)]
        max_concurrency: usize,
    },
    /// Clean all Docker artifacts created by biscepter.
    #[command(aliases = ["prune", "cleanup"])]
    Clean {
        /// Only delete containers, no images.
        #[arg(short = 'c', long)]
        containers: bool,
        /// Bypass the "Are you sure?" prompt.
        #[arg(short = 'y', long = "assume-yes")]
        assume_yes: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    tracing_setup::init(cli.verbose);

    let result = match cli.command {
        Commands::Bisect {
            job_yml,
            replicas,
            port,
            max_concurrency,
        } => bisect(&job_yml, replicas, port, max_concurrency),
        Commands::Clean {
            containers,
            assume_yes,
        } => clean(containers, assume_yes),
    };

    if let Err(err) = result {
        error!(target: "biscepter.cli", error = %format!("{err:#}"), "command failed");
        std::process::exit(1);
    }
}

fn bisect(
    job_yml: &PathBuf,
    replicas: usize,
    port: u16,
    max_concurrency: usize,
) -> anyhow::Result<()> {
    let file = File::open(job_yml)
        .with_context(|| format!("failed to open job config {}", job_yml.display()))?;
    let mut job = Job::from_config_reader(file).context("failed to read job config")?;
    job.replicas_count = replicas;
    job.max_concurrent_replicas = max_concurrency;

    let (systems, offenders) = job.run().context("failed to start job")?;
    let job = Arc::new(Mutex::new(job));

    // First interrupt shuts the job down gracefully and exits.
    let mut signals = Signals::new([SIGINT]).context("failed to register signal handler")?;
    let interrupted_job = Arc::clone(&job);
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            warn!(
                target: "biscepter.cli",
                "interrupt received, commencing graceful shutdown"
            );
            interrupted_job
                .lock()
                .expect("job lock poisoned")
                .stop();
            std::process::exit(1);
        }
    });

    // Panics anywhere in the process also try to leave no containers or
    // working directories behind.
    let panicked_job = Arc::clone(&job);
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        error!(target: "biscepter.cli", "panic captured, attempting graceful shutdown");
        if let Ok(mut job) = panicked_job.lock() {
            job.stop();
        }
    }));

    biscepter_server::serve_blocking(port, systems, offenders)
        .context("REST adapter failed")?;

    info!(target: "biscepter.cli", "job finished, shutting down");
    job.lock().expect("job lock poisoned").stop();
    Ok(())
}

fn clean(containers_only: bool, assume_yes: bool) -> anyhow::Result<()> {
    let runtime = DockerCli::new();
    let containers = runtime
        .labeled_containers()
        .context("failed to list biscepter containers")?;
    let images = if containers_only {
        Vec::new()
    } else {
        runtime
            .labeled_images()
            .context("failed to list biscepter images")?
    };

    if containers.is_empty() && images.is_empty() {
        info!(target: "biscepter.cli", "nothing to remove");
        return Ok(());
    }

    let mut summary = format!("About to delete {} containers", containers.len());
    if !containers_only {
        summary.push_str(&format!(" and {} images", images.len()));
    }
    info!(target: "biscepter.cli", "{summary}.");

    if !assume_yes && !confirm("Proceed? [y/N] ")? {
        info!(target: "biscepter.cli", "aborted");
        return Ok(());
    }

    for container in containers {
        info!(
            target: "biscepter.cli",
            name = %container.name,
            id = %container.id,
            "deleting container"
        );
        runtime
            .remove_container(&container.id)
            .with_context(|| format!("failed to remove container {}", container.id))?;
    }
    for image in images {
        info!(
            target: "biscepter.cli",
            name = %image.name,
            id = %image.id,
            "deleting image"
        );
        runtime
            .remove_image(&image.id)
            .with_context(|| format!("failed to remove image {}", image.id))?;
    }

    info!(target: "biscepter.cli", "done cleaning up");
    Ok(())
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush().ok();
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}
