//! `uisee`: drive a device UI over MQTT with a remote-shell fallback.
//!
//! Run a scripted test with: `uisee run steps.json --repeat 3`

mod context;
mod report;

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uisee_core::{HistoryStorage, Settings, TargetCommand};
use uisee_sequencer::{RunOptions, StepList, StepSequencer, storage::FileRunStorage};
use uisee_sequencer::storage::JsonlHistory;

use crate::context::Context;

#[derive(Parser)]
#[command(
    name = "uisee",
    about = "Scripted UI commands for remote devices over MQTT or SSH",
    version,
    propagate_version = true
)]
struct Cli {
    /// Env file with MQTT_* / SSH_* settings (default: config/.env, then .env)
    #[arg(long, global = true, env = "UISEE_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Command history file
    #[arg(long, global = true, env = "UISEE_HISTORY", default_value = "uisee-history.jsonl")]
    history_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a step file
    Run {
        /// JSON step list
        steps: PathBuf,
        /// Passes over the list; anything below 1 runs once
        #[arg(long, default_value = "1")]
        repeat: String,
        /// Skip the pad after each step
        #[arg(long)]
        skip_post_wait: bool,
        /// Write the run log here as JSON
        #[arg(long)]
        export: Option<PathBuf>,
        /// Keep the run log in this directory, one file per run
        #[arg(long)]
        store: Option<PathBuf>,
        /// Use the in-process loopback instead of the broker and device
        #[arg(long)]
        dry_run: bool,
    },

    /// Send one `Path=Value` command and wait for the acknowledgement
    Send {
        command: String,
        /// Seconds to wait for the acknowledgement
        #[arg(long)]
        timeout: Option<f64>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a command on the device shell
    Exec { command: String },

    /// Simulate a sensor input
    Simin { input: String, value: String },

    /// List the inputs configured on the device
    Inputs,

    /// Check a step file without running it
    Validate { steps: PathBuf },

    /// Install firmware on a device and wait for its status report
    Firmware { device: String, url: String },

    /// Send a JSON test plan to a device
    Tests {
        device: String,
        plan: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },

    /// Update firmware, then send the test plan; stops if the update fails
    Provision {
        device: String,
        url: String,
        plan: PathBuf,
    },

    /// List the topics subscribed after connecting
    Topics,

    /// Show recent commands
    History {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.env_file.as_deref()).context("Failed to load settings")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted; stopping after the current step");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Run {
            steps,
            repeat,
            skip_post_wait,
            export,
            store,
            dry_run,
        } => {
            let list = StepList::load(&steps)
                .await
                .with_context(|| format!("Failed to load steps from {}", steps.display()))?;
            let options = RunOptions::from_text(&repeat, skip_post_wait);

            let ctx = Context::open(&settings, &cli.history_file, false, dry_run).await;
            let mut sequencer = StepSequencer::new(Arc::clone(&ctx.adapter));
            if let Some(dir) = store {
                sequencer = sequencer.with_storage(Arc::new(FileRunStorage::new(dir)));
            }

            let progress = tokio::spawn(report::print_progress(sequencer.events().history_plus_stream()));
            let outcome = sequencer.run(list.as_slice(), options, &cancel).await;
            ctx.close().await;
            let report = outcome?;
            if let Err(e) = progress.await {
                tracing::debug!("Progress printer stopped: {e}");
            }

            report::print_summary(&report);
            if let Some(path) = export {
                report
                    .log
                    .export(&path)
                    .await
                    .with_context(|| format!("Failed to export run log to {}", path.display()))?;
                println!("Run log written to {}", path.display());
            }
            Ok(report::exit_code(report::succeeded(&report)))
        }

        Commands::Send {
            command,
            timeout,
            dry_run,
        } => {
            let target = TargetCommand::parse(&command)?;
            let mut settings = settings;
            if let Some(seconds) = timeout {
                settings.response_timeout = Duration::try_from_secs_f64(seconds)
                    .with_context(|| format!("Invalid timeout {seconds}"))?;
            }
            let ctx = Context::open(&settings, &cli.history_file, false, dry_run).await;
            let routed = ctx.adapter.send_command(&target, Some(&cancel)).await;
            ctx.close().await;
            Ok(report::print_routed(&command, &routed))
        }

        Commands::Exec { command } => {
            let ctx = Context::open(&settings, &cli.history_file, true, false).await;
            let routed = ctx.adapter.exec(&command, Some(&cancel)).await;
            ctx.close().await;
            Ok(report::print_routed(&command, &routed))
        }

        Commands::Simin { input, value } => {
            let ctx = Context::open(&settings, &cli.history_file, true, false).await;
            let routed = ctx
                .adapter
                .simulate_input(&input, &value, Some(&cancel))
                .await;
            ctx.close().await;
            Ok(report::print_routed(&format!("simin {input} {value}"), &routed?))
        }

        Commands::Inputs => {
            let ctx = Context::open(&settings, &cli.history_file, true, false).await;
            let inputs = ctx.adapter.configured_inputs(Some(&cancel)).await;
            ctx.close().await;
            let inputs = inputs.context("Failed to read input configuration")?;
            if inputs.is_empty() {
                println!("No configured inputs");
            }
            for name in inputs {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate { steps } => {
            let list = StepList::load(&steps)
                .await
                .with_context(|| format!("Invalid step file {}", steps.display()))?;
            let malformed = report::print_validation(&list);
            if malformed > 0 {
                bail!("{malformed} publish step(s) will be reported as invalid");
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Firmware { device, url } => {
            let ctx = Context::open(&settings, &cli.history_file, false, false).await;
            let outcome = ctx.devices.update_firmware(&device, &url, Some(&cancel)).await;
            ctx.close().await;
            Ok(report::print_device(&format!("firmware {device}"), &outcome))
        }

        Commands::Tests {
            device,
            plan,
            dry_run,
        } => {
            let plan = report::load_plan(&plan).await?;
            let ctx = Context::open(&settings, &cli.history_file, false, dry_run).await;
            let outcome = ctx.devices.run_tests(&device, &plan).await;
            ctx.close().await;
            Ok(report::print_device(&format!("tests {device}"), &outcome.map(|()| Value::Null)))
        }

        Commands::Provision { device, url, plan } => {
            let plan = report::load_plan(&plan).await?;
            let ctx = Context::open(&settings, &cli.history_file, false, false).await;
            let outcome = ctx
                .devices
                .provision(&device, &url, &plan, Some(&cancel))
                .await;
            ctx.close().await;
            Ok(report::print_device(&format!("provision {device}"), &outcome))
        }

        Commands::Topics => {
            let ctx = Context::open(&settings, &cli.history_file, false, false).await;
            let topics = ctx.devices.list_topics();
            ctx.close().await;
            if topics.is_empty() {
                println!("No subscribed topics");
            }
            for topic in topics {
                println!(" - {topic}");
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::History { limit } => {
            let history = JsonlHistory::new(&cli.history_file);
            let records = history.recent(limit).await?;
            report::print_history(&records);
            Ok(ExitCode::SUCCESS)
        }
    }
}
