use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

mod app;
mod core;

use crate::core::config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the config file (defaults to ./config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one volume-bounded migration batch from the manifest
    Migrate {
        /// Manifest CSV exported from the Zoom admin console
        manifest: PathBuf,

        /// Override the configured per-run volume cap, in gigabytes
        #[arg(long)]
        cap_gb: Option<f64>,

        /// Log what would be transferred without touching anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Compare migrated sessions against the source and write a report
    Verify {
        /// Manifest CSV exported from the Zoom admin console
        manifest: PathBuf,

        /// Where to write the verification report
        #[arg(long, default_value = "verification_report.csv")]
        output: PathBuf,
    },
    /// Delete fully-verified recordings from the source
    Delete {
        /// Verification report produced by `verify`
        report: PathBuf,

        /// Where to write the deletion report
        #[arg(long, default_value = "deletion_report.csv")]
        output: PathBuf,

        /// List what would be deleted without deleting anything
        #[arg(long)]
        dry_run: bool,

        /// Skip the interactive confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zoom_drive_migrator=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let app = app::App::new(config);

    match cli.command {
        Command::Migrate {
            manifest,
            cap_gb,
            dry_run,
        } => {
            info!(manifest = %manifest.display(), dry_run, "starting migration run");
            app.migrate(&manifest, cap_gb, dry_run).await?;
        }
        Command::Verify { manifest, output } => {
            info!(manifest = %manifest.display(), "starting verification");
            app.verify(&manifest, &output).await?;
        }
        Command::Delete {
            report,
            output,
            dry_run,
            force,
        } => {
            info!(report = %report.display(), dry_run, force, "starting deletion");
            app.delete(&report, &output, dry_run, force).await?;
        }
    }

    Ok(())
}
