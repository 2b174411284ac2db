use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::core::verifier::VerificationRecord;

/// Writes a report as CSV. Rewrites the whole file: re-running a phase
/// replaces its report rather than appending stale rows.
pub fn write_report<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating report {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_verification_report(path: &Path) -> Result<Vec<VerificationRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening verification report {}", path.display()))?;
    let mut records = Vec::new();
    for (line, row) in reader.deserialize::<VerificationRecord>().enumerate() {
        let row = row.with_context(|| {
            format!("parsing verification report row {} of {}", line + 2, path.display())
        })?;
        records.push(row);
    }
    Ok(records)
}
