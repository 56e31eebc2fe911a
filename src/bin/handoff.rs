use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use handoff::lifecycle::{self, SweepConfig};
use handoff::{
    BundleSchema, CancelToken, ChannelLocation, Coordinator, Descriptor, HandoffConfig, Waiter,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Hand resource bundles between test runner processes", long_about = None)]
struct Args {
    /// JSON handoff config (poll_interval, timeout, expected_consumers, ...)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a JSON resource map at a channel location
    Publish {
        #[arg(short, long)]
        location: PathBuf,

        /// File holding a JSON object of resource name -> descriptor
        #[arg(short, long)]
        resources: PathBuf,

        /// Generation tag of this handoff
        #[arg(short, long, default_value_t = 1)]
        generation: u64,

        /// Block until every expected consumer has retrieved the bundle, then clean up
        #[arg(long)]
        await_consumers: bool,

        /// Skip the required-resource check
        #[arg(long)]
        no_schema: bool,
    },
    /// Wait for a bundle and print its resources as JSON
    Wait {
        #[arg(short, long)]
        location: PathBuf,

        /// Leave a receipt under this consumer name
        #[arg(short, long)]
        consumer: Option<String>,

        /// Seconds between existence checks (overrides config)
        #[arg(long)]
        poll_interval: Option<f64>,

        /// Seconds to wait before giving up (overrides config)
        #[arg(long)]
        timeout: Option<f64>,

        /// Fail unless every resource the config requires is present
        #[arg(long)]
        require_schema: bool,
    },
    /// Show what a channel currently holds
    Status {
        #[arg(short, long)]
        location: PathBuf,
    },
    /// Remove a channel regardless of its consumers (operator recovery)
    Cleanup {
        #[arg(short, long)]
        location: PathBuf,
    },
    /// Remove leftovers of crashed publishers and report stale channels in a directory
    Sweep {
        #[arg(short, long)]
        dir: PathBuf,

        /// Seconds after which an artifact is stale (overrides config)
        #[arg(long)]
        max_staleness: Option<f64>,

        /// Also remove stale channels
        #[arg(long)]
        remove: bool,

        /// Extra file name prefix marking bundles written without a lock (repeatable)
        #[arg(long = "prefix")]
        prefixes: Vec<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => HandoffConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HandoffConfig::default(),
    };

    match args.command {
        Command::Publish {
            location,
            resources,
            generation,
            await_consumers,
            no_schema,
        } => publish(&config, location, &resources, generation, await_consumers, no_schema),
        Command::Wait {
            location,
            consumer,
            poll_interval,
            timeout,
            require_schema,
        } => {
            let mut waiter = Waiter::new(ChannelLocation::new(location)?, &config);
            if let Some(secs) = poll_interval {
                waiter = waiter.poll_interval(seconds(secs)?);
            }
            if let Some(secs) = timeout {
                waiter = waiter.timeout(seconds(secs)?);
            }
            if let Some(consumer) = consumer {
                waiter = waiter.as_consumer(consumer);
            }
            if require_schema {
                waiter = waiter.with_schema(BundleSchema::from_config(&config));
            }
            let bundle = waiter.wait()?;
            println!("{}", serde_json::to_string_pretty(bundle.resources())?);
            Ok(())
        }
        Command::Status { location } => {
            let status = lifecycle::inspect(&ChannelLocation::new(location)?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Cleanup { location } => {
            let location = ChannelLocation::new(location)?;
            lifecycle::remove_channel(&location)?;
            info!("Removed {location}");
            Ok(())
        }
        Command::Sweep {
            dir,
            max_staleness,
            remove,
            prefixes,
        } => {
            let mut sweep_config = SweepConfig::from_config(&config);
            if let Some(secs) = max_staleness {
                sweep_config.max_staleness = seconds(secs)?;
            }
            sweep_config.remove_stale_bundles = remove;
            sweep_config.channel_prefixes.extend(prefixes);
            let report = lifecycle::sweep(&dir, &sweep_config)
                .with_context(|| format!("Failed to sweep {}", dir.display()))?;
            println!("{}", report.summary());
            for path in &report.stale_channels {
                println!("stale: {}", path.display());
            }
            if report.has_errors() {
                bail!("sweep finished with {} errors", report.errors.len());
            }
            Ok(())
        }
    }
}

fn publish(
    config: &HandoffConfig,
    location: PathBuf,
    resources: &Path,
    generation: u64,
    await_consumers: bool,
    no_schema: bool,
) -> Result<()> {
    let data = std::fs::read(resources)
        .with_context(|| format!("Failed to read {}", resources.display()))?;
    let resources: BTreeMap<String, Descriptor> = serde_json::from_slice(&data)
        .with_context(|| format!("{} is not a JSON object", resources.display()))?;

    let mut coordinator = Coordinator::new(ChannelLocation::new(location)?, config.clone())?;
    if no_schema {
        coordinator = coordinator.with_schema(BundleSchema::empty());
    }
    coordinator.publish(handoff::Bundle::new(generation, resources))?;
    info!("Published generation {generation} at {}", coordinator.location());

    if !await_consumers {
        let location = coordinator.detach();
        info!("Run `handoff cleanup --location {location}` once consumers are done");
        return Ok(());
    }
    coordinator
        .await_consumed(&CancelToken::new())
        .context("Consumers did not retrieve the bundle")?;
    coordinator.cleanup()?;
    Ok(())
}

fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("invalid duration {secs}"))
}
