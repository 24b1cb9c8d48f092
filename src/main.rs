use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rbksd::config::{self, AppConfig, ReadinessMode};
use rbksd::context::AppContext;
use rbksd::core::notifications::BackupEvent;
use rbksd::core::report;
use rbksd::logging;
use rbksd::service::ServiceManager;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rbksd")]
#[command(about = "Automated RouterOS configuration backup", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(flatten)]
    overrides: OverrideArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up every configured router once and exit
    Run {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Back up all routers on a fixed interval until stopped
    Daemon,
    /// List the configured routers
    Devices,
    /// Print the effective configuration as TOML
    Config,
    /// Manage the systemd service
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand)]
enum ServiceAction {
    Install,
    Uninstall,
}

#[derive(Args, Serialize)]
struct OverrideArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    backup_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    connect_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "TransferOverrides::is_empty")]
    #[command(flatten)]
    transfer: TransferOverrides,
}

#[derive(Args, Serialize)]
struct TransferOverrides {
    /// How to wait for the export before fetching
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    readiness: Option<ReadinessMode>,
}

impl TransferOverrides {
    fn is_empty(&self) -> bool {
        self.readiness.is_none()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref(), Some(&cli.overrides))?;
    config.logging.verbose |= cli.verbose;
    config.logging.json |= cli.json_logs;

    logging::init(&config.logging)?;

    match cli.command {
        Commands::Run { json } => {
            let ctx = prepare(config).await?;
            run_once(ctx, json).await.context("Backup run failed")?
        }
        Commands::Daemon => {
            let ctx = prepare(config).await?;
            run_daemon(ctx).await.context("Daemon failed")?
        }
        Commands::Devices => list_devices(&config),
        Commands::Config => print!("{}", render_config(&config)?),
        Commands::Service { action } => {
            let config_path = cli
                .config
                .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_PATH));
            manage_service(action, &config_path, &config.backup_directory)?
        }
    }

    Ok(())
}

async fn prepare(config: AppConfig) -> Result<AppContext> {
    tokio::fs::create_dir_all(&config.backup_directory)
        .await
        .with_context(|| {
            format!(
                "Failed to create backup directory {}",
                config.backup_directory.display()
            )
        })?;
    Ok(AppContext::new(config))
}

async fn run_once(ctx: AppContext, json: bool) -> Result<()> {
    let result = ctx.batch_runner().run(&ctx.config.devices).await?;
    report::log_summary(&result);

    if json {
        println!("{}", report::render_json(&result)?);
    } else {
        print!("{}", report::render_text(&result));
    }

    if let Some(notifier) = &ctx.notifier {
        let event = BackupEvent::BatchCompleted {
            iteration: 1,
            result: result.clone(),
        };
        if let Err(e) = notifier.notify(event).await {
            warn!(error = %e, "Failed to send notification");
        }
    }

    if !result.all_succeeded() {
        bail!(
            "{} of {} routers failed to be backed up",
            result.failure_count,
            result.total()
        );
    }
    Ok(())
}

async fn run_daemon(ctx: AppContext) -> Result<()> {
    info!(devices = ctx.config.devices.len(), "Service started");

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            shutdown_signal().await;
            info!("Stopping service, waiting for the current batch to finish");
            stop.cancel();
        }
    });

    let batches = ctx.scheduler().run(stop).await;
    info!(batches, "Service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn list_devices(config: &AppConfig) {
    if config.devices.is_empty() {
        println!("No routers configured.");
        return;
    }

    println!("{:<24} {:<28} {}", "NAME", "ADDRESS", "USER");
    for device in &config.devices {
        println!(
            "{:<24} {:<28} {}",
            device.display_name(),
            device.address(),
            device.username
        );
    }
}

/// Device passwords are never serialized, so the output is safe to share.
fn render_config(config: &AppConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize configuration")
}

fn manage_service(action: ServiceAction, config_path: &Path, backup_dir: &Path) -> Result<()> {
    let manager = ServiceManager::new();
    match action {
        ServiceAction::Install => {
            manager
                .install(config_path, backup_dir)
                .context("Failed to install service")?;
            println!("rbksd service installed and started.");
        }
        ServiceAction::Uninstall => {
            manager.uninstall().context("Failed to uninstall service")?;
            println!("rbksd service removed.");
        }
    }
    Ok(())
}
