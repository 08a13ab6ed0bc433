//! `timecapsule` - encrypted messages delivered by email at a chosen moment.
//!
//! `timecapsule run` is the delivery daemon; the other subcommands create
//! capsules and inspect the stored state.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use timecapsule_core::Config;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Time Capsule: write now, deliver later.
#[derive(Parser, Debug)]
#[command(name = "timecapsule", version, about)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, env = "TIMECAPSULE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format.
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines.
    Text,
    /// Pretty-printed JSON.
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the delivery daemon until interrupted.
    Run,
    /// Seal a new capsule.
    Schedule(commands::ScheduleArgs),
    /// List pending timers.
    Jobs,
    /// List stored capsules (metadata only).
    Capsules,
    /// Show one capsule's status.
    Status {
        /// Capsule job id.
        job_id: String,
    },
    /// Send a test email right away.
    TestEmail {
        /// Recipient address.
        #[arg(long)]
        to: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "timecapsule=info,timecapsule_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run => {
            info!("Starting Time Capsule");
            commands::run(config, shutdown_signal()).await
        }
        Command::Schedule(args) => commands::schedule(config, args, cli.format).await,
        Command::Jobs => commands::jobs(config, cli.format).await,
        Command::Capsules => commands::capsules(config, cli.format).await,
        Command::Status { job_id } => commands::status(config, &job_id, cli.format).await,
        Command::TestEmail { to } => commands::test_email(config, &to, cli.format).await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received SIGINT"); }
        () = terminate => { info!("received SIGTERM"); }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_accepts_instant_or_wall_clock() {
        let cli = Cli::try_parse_from([
            "timecapsule",
            "schedule",
            "--to",
            "a@b.com",
            "--message",
            "hi",
            "--at",
            "2030-01-02T03:04:05Z",
            "--attach",
            "a.txt",
            "--attach",
            "b.png",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Schedule(_)));

        assert!(
            Cli::try_parse_from([
                "timecapsule", "schedule", "--to", "a@b.com", "--message", "hi", "--date",
                "2030-01-02", "--time", "09:00",
            ])
            .is_ok()
        );
    }

    #[test]
    fn test_schedule_rejects_mixed_or_missing_times() {
        assert!(
            Cli::try_parse_from([
                "timecapsule", "schedule", "--to", "a@b.com", "--message", "hi",
            ])
            .is_err()
        );
        assert!(
            Cli::try_parse_from([
                "timecapsule", "schedule", "--to", "a@b.com", "--message", "hi", "--date",
                "2030-01-02", "--time", "09:00", "--at", "2030-01-02T03:04:05Z",
            ])
            .is_err()
        );
    }

    #[test]
    fn test_global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "timecapsule",
            "jobs",
            "--format",
            "json",
            "--config",
            "/etc/timecapsule.json",
        ])
        .unwrap();
        assert!(matches!(cli.format, OutputFormat::Json));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/timecapsule.json")));
    }
}
