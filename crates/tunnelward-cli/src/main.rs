//! tunnelward - register, reconcile and supervise reverse-tunnel clients

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnelward_cli::{display, input, settings};
use tunnelward_engine::{Consistency, Controller, RuleSetKind};

/// Keep a reverse-tunnel client registered, configured and running
#[derive(Parser, Debug)]
#[command(name = "tunnelward")]
#[command(about = "Tunnel registration and reconciliation engine", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (YAML)
    #[arg(long, global = true, env = settings::CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Service directory holding rules, generated configs, PID and log files
    #[arg(long, global = true, env = settings::HOME_ENV)]
    home: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show whether each tunnel client is running
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Start the main tunnel (re-registers first if the config drifted)
    Start,
    /// Stop the main tunnel
    Stop,
    /// Restart the main tunnel (re-registers first if the config drifted)
    Restart,
    /// Re-register the main tunnel if its installed config is out of date
    Ensure,
    /// Show a rule list
    Rules {
        #[arg(value_enum, default_value = "main")]
        set: RuleSet,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Replace the main rule list and apply it
    SetMain {
        /// Rule as name:port[:bind], repeatable
        #[arg(short, long = "rule")]
        rules: Vec<String>,
        /// JSON rule document instead of --rule
        #[arg(long, conflicts_with = "rules")]
        file: Option<PathBuf>,
    },
    /// Replace the temporary rule list and switch the temporary tunnel
    SetTemporary {
        /// Rule as name:port[:bind], repeatable
        #[arg(short, long = "rule")]
        rules: Vec<String>,
        /// JSON rule document instead of --rule
        #[arg(long, conflicts_with = "rules")]
        file: Option<PathBuf>,
        /// Turn the temporary tunnel on
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        /// Turn the temporary tunnel off
        #[arg(long)]
        disable: bool,
    },
    /// Print the current visitor code of the temporary tunnel
    VisitorCode,
    /// Restore a rule list from the shipped defaults
    Reset {
        #[arg(value_enum)]
        set: RuleSet,
    },
    /// Bootstrap the tunnels and keep watching them until interrupted
    Run {
        /// Seconds between liveness checks of the main tunnel (0 disables)
        #[arg(long, default_value = "60")]
        watch_interval: u64,
        /// Stop both tunnels on shutdown instead of leaving them running
        #[arg(long)]
        stop_on_exit: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum RuleSet {
    Main,
    Temporary,
}

impl From<RuleSet> for RuleSetKind {
    fn from(set: RuleSet) -> Self {
        match set {
            RuleSet::Main => RuleSetKind::Main,
            RuleSet::Temporary => RuleSetKind::Temporary,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = settings::load_engine_config(cli.config.as_deref(), cli.home.as_deref())?;
    let controller = Controller::from_config(&config).context("Failed to initialize engine")?;

    match cli.command {
        Commands::Status { json } => handle_status(&controller, json).await,
        Commands::Start => {
            let pid = controller.start().await?;
            println!("Main tunnel running (PID: {})", pid);
            Ok(())
        }
        Commands::Stop => {
            controller.stop().await?;
            println!("Main tunnel stopped");
            Ok(())
        }
        Commands::Restart => {
            let pid = controller.restart().await?;
            println!("Main tunnel restarted (PID: {})", pid);
            Ok(())
        }
        Commands::Ensure => {
            match controller.ensure_consistent().await? {
                Consistency::AlreadyConsistent => println!("Installed configuration is up to date"),
                Consistency::Reregistered => println!("Configuration was out of date, re-registered"),
            }
            Ok(())
        }
        Commands::Rules { set, json } => handle_rules(&controller, set.into(), json),
        Commands::SetMain { rules, file } => {
            let rules = input::collect_rules(&rules, file.as_deref())?;
            let outcome = controller.save_main_rules(rules).await?;
            println!("{}", display::describe_save(&outcome));
            Ok(())
        }
        Commands::SetTemporary {
            rules,
            file,
            enable,
            disable,
        } => {
            let rules = input::collect_rules(&rules, file.as_deref())?;
            let enabled = if enable {
                true
            } else if disable {
                false
            } else {
                controller.temporary_enabled()?
            };
            let outcome = controller.save_temporary_rules(rules, enabled).await?;
            println!("{}", display::describe_temporary(&outcome));
            Ok(())
        }
        Commands::VisitorCode => {
            match controller.visitor_code()? {
                Some(code) => println!("{}", code),
                None => println!("No visitor code (temporary tunnel disabled)"),
            }
            Ok(())
        }
        Commands::Reset { set } => handle_reset(&controller, set.into()).await,
        Commands::Run {
            watch_interval,
            stop_on_exit,
        } => handle_run(&controller, watch_interval, stop_on_exit).await,
    }
}

async fn handle_status(controller: &Controller, json: bool) -> Result<()> {
    let status = controller.status().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("{}", display::format_status(&status));
    }
    Ok(())
}

fn handle_rules(controller: &Controller, kind: RuleSetKind, json: bool) -> Result<()> {
    let rules = match kind {
        RuleSetKind::Main => controller.main_rules()?,
        RuleSetKind::Temporary => controller.temporary_rules()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&rules)?);
        return Ok(());
    }

    println!("{}", display::format_rules(kind, &rules));
    if kind == RuleSetKind::Temporary {
        let state = if controller.temporary_enabled()? {
            "enabled"
        } else {
            "disabled"
        };
        println!("Temporary tunnel: {}", state);
    }
    Ok(())
}

async fn handle_reset(controller: &Controller, kind: RuleSetKind) -> Result<()> {
    match kind {
        RuleSetKind::Main => {
            let outcome = controller.reset_main_rules().await?;
            println!("Main rules reset to defaults");
            println!("{}", display::describe_save(&outcome));
        }
        RuleSetKind::Temporary => {
            let rules = controller.reset_temporary_rules().await?;
            println!("Temporary rules reset to defaults");
            println!("{}", display::format_rules(kind, &rules));
        }
    }
    Ok(())
}

async fn handle_run(controller: &Controller, watch_interval: u64, stop_on_exit: bool) -> Result<()> {
    info!("Starting tunnelward {}", env!("GIT_TAG"));

    match controller.bootstrap().await {
        Ok(Some(pid)) => info!("Main tunnel running (PID: {})", pid),
        Ok(None) => info!("Main tunnel not started, waiting for configuration"),
        Err(e) => error!("Failed to start main tunnel: {}", e),
    }

    let mut ticker = (watch_interval > 0).then(|| {
        let mut interval = tokio::time::interval(Duration::from_secs(watch_interval));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = async {
                match ticker.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => watch_main(controller).await,
        }
    }

    if stop_on_exit {
        info!("Stopping tunnels");
        if let Err(e) = controller.stop().await {
            warn!("Failed to stop main tunnel: {}", e);
        }
        if controller.temporary_enabled().unwrap_or(false) {
            let rules = controller.temporary_rules().unwrap_or_default();
            if let Err(e) = controller.save_temporary_rules(rules, false).await {
                warn!("Failed to stop temporary tunnel: {}", e);
            }
        }
    } else {
        info!("Leaving tunnel clients running");
    }

    Ok(())
}

/// Restart the main tunnel if it died while a configuration is installed
async fn watch_main(controller: &Controller) {
    match controller.revive_main().await {
        Ok(Some(pid)) => info!("Main tunnel restarted (PID: {})", pid),
        Ok(None) => {}
        Err(e) => error!("Failed to start main tunnel: {}", e),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
                    _ = terminate.recv() => info!("Received SIGTERM, shutting down..."),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Received Ctrl+C, shutting down...");
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
