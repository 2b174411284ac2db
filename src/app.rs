use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::core::config::Config;
use crate::core::deleter::DeletionExecutor;
use crate::core::drive::DriveClient;
use crate::core::ledger::ProgressLedger;
use crate::core::manifest::Manifest;
use crate::core::migrator::MigrationExecutor;
use crate::core::planner;
use crate::core::report;
use crate::core::retry::RetryPolicy;
use crate::core::verifier::VerificationAuditor;
use crate::core::zoom::ZoomClient;

/// Wires configuration, providers, and the engine together, one method
/// per phase. Anything that fails in here before a phase starts is an
/// operator error and surfaces as a non-zero exit; per-item failures stay
/// in the ledger and the reports.
pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn migrate(
        &self,
        manifest_path: &Path,
        cap_gb: Option<f64>,
        dry_run: bool,
    ) -> Result<()> {
        let manifest = Manifest::load(manifest_path, &self.config.naming)?;
        let mut ledger = ProgressLedger::open(&self.config.storage.ledger_path)
            .context("opening progress ledger")?;
        info!(
            sessions = manifest.sessions.len(),
            ledger_entries = ledger.len(),
            ledger = %ledger.path().display(),
            "manifest and ledger loaded"
        );

        let cap_bytes = self.config.cap_bytes(cap_gb);
        let plan = planner::plan(&manifest, &ledger, cap_bytes);
        info!(
            files = plan.len(),
            bytes = planner::planned_bytes(&plan),
            cap = cap_bytes,
            "batch planned"
        );

        let zoom = ZoomClient::connect(self.config.zoom.clone())
            .await
            .context("authenticating with zoom")?;
        let drive = DriveClient::connect(&self.config.drive)
            .await
            .context("authenticating with google drive")?;

        let retry = RetryPolicy::new(
            self.config.transfer.max_retries,
            Duration::from_secs(self.config.transfer.retry_delay_secs),
        );
        let mut executor = MigrationExecutor::new(
            &zoom,
            &drive,
            &mut ledger,
            self.config.storage.staging_dir.clone(),
            retry,
            cap_bytes,
        );

        let summary = executor.run(&plan, dry_run).await?;
        info!(
            planned = summary.planned,
            transferred = summary.transferred,
            failed = summary.failed,
            skipped = summary.skipped,
            bytes = summary.bytes_transferred,
            cap_reached = summary.cap_reached,
            dry_run,
            "migration run finished"
        );
        println!(
            "{} of {} planned files transferred ({} bytes), {} failed, {} skipped{}",
            summary.transferred,
            summary.planned,
            summary.bytes_transferred,
            summary.failed,
            summary.skipped,
            if dry_run { " [dry run]" } else { "" },
        );
        Ok(())
    }

    pub async fn verify(&self, manifest_path: &Path, output: &Path) -> Result<()> {
        let manifest = Manifest::load(manifest_path, &self.config.naming)?;
        info!(sessions = manifest.sessions.len(), "verifying sessions");

        let zoom = ZoomClient::connect(self.config.zoom.clone())
            .await
            .context("authenticating with zoom")?;
        let drive = DriveClient::connect(&self.config.drive)
            .await
            .context("authenticating with google drive")?;

        let auditor = VerificationAuditor::new(
            &zoom,
            &drive,
            self.config.verify.count_file_types.clone(),
        );
        let records = auditor.verify(&manifest).await;

        report::write_report(output, &records).context("writing verification report")?;
        println!(
            "verified {} sessions, report written to {}",
            records.len(),
            output.display()
        );
        Ok(())
    }

    pub async fn delete(
        &self,
        report_path: &Path,
        output: &Path,
        dry_run: bool,
        force: bool,
    ) -> Result<()> {
        let records = report::read_verification_report(report_path)?;
        info!(rows = records.len(), "loaded verification report");

        let zoom = ZoomClient::connect(self.config.zoom.clone())
            .await
            .context("authenticating with zoom")?;

        let executor = DeletionExecutor::new(&zoom);
        let results = executor
            .run(&records, dry_run, force, confirm_on_stdin)
            .await;

        report::write_report(output, &results).context("writing deletion report")?;
        println!(
            "processed {} sessions, report written to {}",
            results.len(),
            output.display()
        );
        Ok(())
    }
}

/// Asks once for the whole run; deletion is permanent, so the answer has
/// to be typed out in full.
fn confirm_on_stdin(eligible: usize) -> bool {
    print!(
        "About to permanently delete {eligible} recording(s) from Zoom cloud.\n\
         This cannot be undone. Type 'DELETE' to confirm: "
    );
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    answer.trim() == "DELETE"
}
