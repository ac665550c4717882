//! Cohort export
//!
//! Packs the trained parameters of one network/instance over several
//! datasets into a ZIP archive:
//!
//! ```text
//! params_core.pt                     core.* parameters (shared)
//! params_{session}_{scan_idx}.pt     everything else, one per dataset
//! units.csv                          session, scan_idx, unit_id, readout_id
//! scans.csv                          session, scan_idx, units, data_id
//! ```
//!
//! Files are staged in a temporary directory that is removed whether or
//! not the archive is written.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::dataset::{Dataset, VisualScan};
use crate::network::{StateDict, CORE_PREFIX};
use crate::progress::ModelKey;
use crate::train::model_parameters;
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Archive member holding the shared core parameters
pub const CORE_FILE: &str = "params_core.pt";

/// Models to export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    /// Network id shared by every model
    pub network_id: String,
    /// Instance id shared by every model
    pub instance_id: String,
    /// Datasets, the first supplying the core parameters
    pub data_ids: Vec<String>,
}

impl ExportManifest {
    /// Load a manifest from a JSON file.
    ///
    /// # Errors
    /// Returns `Io` or `Json` errors
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_reader(File::open(path)?)?)
    }

    fn models(&self) -> impl Iterator<Item = ModelKey> + '_ {
        self.data_ids
            .iter()
            .map(|data_id| ModelKey::new(data_id.clone(), self.network_id.clone(), self.instance_id.clone()))
    }
}

/// One row of `units.csv`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRow {
    /// Session
    pub session: u32,
    /// Scan
    pub scan_idx: u32,
    /// Unit id
    pub unit_id: u32,
    /// Readout column
    pub readout_id: usize,
}

/// One row of `scans.csv`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRow {
    /// Session
    pub session: u32,
    /// Scan
    pub scan_idx: u32,
    /// Readout units
    pub units: usize,
    /// Data id
    pub data_id: String,
}

/// Archive member holding the per-scan parameters
#[must_use]
pub fn scan_file(session: u32, scan_idx: u32) -> String {
    format!("params_{session}_{scan_idx}.pt")
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Stage every member in `dir`; returns the member names in archive order.
fn stage(ws: &Workspace, manifest: &ExportManifest, dir: &Path) -> Result<Vec<String>> {
    let mut members = vec![CORE_FILE.to_string()];
    let mut units = Vec::new();
    let mut scans = Vec::new();
    let mut seen = FxHashSet::default();

    for (index, key) in manifest.models().enumerate() {
        let parameters = model_parameters(ws, &key)?;
        if index == 0 {
            let core = parameters.filter(|name| name.starts_with(CORE_PREFIX));
            std::fs::write(dir.join(CORE_FILE), core.to_bytes()?)?;
        }

        let scan = ws.fetch1::<VisualScan>(&key.data_id)?.selection.scan;
        let file = scan_file(scan.session, scan.scan_idx);
        if !seen.insert(file.clone()) {
            return Err(Error::InvalidInput(format!(
                "two datasets of the cohort map to {file}"
            )));
        }
        let rest: StateDict = parameters.filter(|name| !name.starts_with(CORE_PREFIX));
        std::fs::write(dir.join(&file), rest.to_bytes()?)?;
        members.push(file);

        let dataset = ws.fetch1::<Dataset>(&key.data_id)?;
        units.extend(dataset.unit_ids.iter().enumerate().map(|(readout_id, &unit_id)| UnitRow {
            session: scan.session,
            scan_idx: scan.scan_idx,
            unit_id,
            readout_id,
        }));
        scans.push(ScanRow {
            session: scan.session,
            scan_idx: scan.scan_idx,
            units: dataset.unit_ids.len(),
            data_id: key.data_id.clone(),
        });
    }

    write_csv(&dir.join("units.csv"), &units)?;
    write_csv(&dir.join("scans.csv"), &scans)?;
    members.extend(["units.csv".to_string(), "scans.csv".to_string()]);
    Ok(members)
}

/// Zip `members` of `staging` into `path`. The archive is written next to
/// `path` and only replaces it once complete.
fn write_archive(staging: &Path, members: &[String], path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut archive = ZipWriter::new(tempfile::NamedTempFile::new_in(dir)?);
    let options = SimpleFileOptions::default();
    for member in members {
        let mut bytes = Vec::new();
        File::open(staging.join(member))?.read_to_end(&mut bytes)?;
        archive.start_file(member.as_str(), options)?;
        archive.write_all(&bytes)?;
    }
    let mut staged = archive.finish()?;
    staged.flush()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write the cohort archive to `path`.
///
/// # Errors
/// Returns `InvalidInput` for an empty manifest or colliding scans,
/// `MissingUpstream` if a model or dataset is not populated, and I/O,
/// CSV or ZIP errors
pub fn export(ws: &Workspace, manifest: &ExportManifest, path: impl AsRef<Path>) -> Result<PathBuf> {
    if manifest.data_ids.is_empty() {
        return Err(Error::InvalidInput("export manifest lists no datasets".to_string()));
    }
    let staging = tempfile::tempdir()?;
    let members = stage(ws, manifest, staging.path())?;

    let path = path.as_ref().to_path_buf();
    write_archive(staging.path(), &members, &path)?;

    tracing::info!(
        path = %path.display(),
        models = manifest.data_ids.len(),
        network_id = %manifest.network_id,
        "cohort exported"
    );
    Ok(path)
}
