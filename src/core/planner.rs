use tracing::debug;

use crate::core::ledger::{FileStatus, ProgressLedger};
use crate::core::manifest::{Manifest, RecordingFile};

/// One file the executor should move this run.
#[derive(Debug, Clone)]
pub struct PlannedTransfer {
    pub session_id: String,
    pub folder_name: String,
    pub file: RecordingFile,
}

/// Selects the next volume-bounded unit of work. Pure: the same manifest
/// and ledger state always produce the same plan, so re-planning after a
/// crash cannot double-count anything.
///
/// Sessions are taken in manifest order and may be split at the cap; if
/// the very first candidate file is larger than the cap it is admitted
/// anyway so every run makes forward progress.
pub fn plan(manifest: &Manifest, ledger: &ProgressLedger, cap_bytes: u64) -> Vec<PlannedTransfer> {
    let mut planned = Vec::new();
    let mut total: u64 = 0;

    for session in &manifest.sessions {
        for file in &session.files {
            if ledger.get(&session.id, &file.id) == FileStatus::Done {
                continue;
            }
            if !planned.is_empty() && total + file.size > cap_bytes {
                debug!(
                    planned = planned.len(),
                    bytes = total,
                    cap = cap_bytes,
                    "volume cap reached, truncating plan"
                );
                return planned;
            }
            total += file.size;
            planned.push(PlannedTransfer {
                session_id: session.id.clone(),
                folder_name: session.folder_name.clone(),
                file: file.clone(),
            });
        }
    }

    planned
}

pub fn planned_bytes(plan: &[PlannedTransfer]) -> u64 {
    plan.iter().map(|t| t.file.size).sum()
}
