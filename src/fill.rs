//! Population of every computed table in dependency order
//!
//! A [`Cohort`] restricts the dataset, model and response tables to the
//! listed ids; the recording caches are always populated in full. Keys
//! whose upstream rows are missing are reported and left for a later pass.

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::{populate_where, Computed, PopulateOptions, PopulateReport};
use crate::dataset::Dataset;
use crate::progress::ModelKey;
use crate::recording::{ResampledTraces, ResampledTrial, ResizedVideo, TraceSummary, TrialBounds, TrialSamples};
use crate::response::{VisualDirectionTuning, VisualMeasure, VisualSpatialTuning, VisualUnitCorrelation};
use crate::train::Model;
use crate::workspace::Workspace;
use crate::Result;

/// Groups of tables, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Trial bounds, samples, resized videos and resampled traces
    Recording,
    /// Datasets
    Dataset,
    /// Trained models
    Model,
    /// Visual responses
    Response,
}

impl Stage {
    /// Every stage, upstream first
    pub const ALL: [Self; 4] = [Self::Recording, Self::Dataset, Self::Model, Self::Response];
}

/// Ids a fill run is restricted to; an empty list accepts every id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cohort {
    /// Datasets
    #[serde(default)]
    pub data_ids: Vec<String>,
    /// Networks
    #[serde(default)]
    pub network_ids: Vec<String>,
    /// Training instances
    #[serde(default)]
    pub instance_ids: Vec<String>,
}

fn accepts(ids: &[String], id: &str) -> bool {
    ids.is_empty() || ids.iter().any(|i| i == id)
}

impl Cohort {
    /// Load a cohort from a JSON file.
    ///
    /// # Errors
    /// Returns `Io` or `Json` errors
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_reader(File::open(path)?)?)
    }

    /// Whether the dataset belongs to the cohort
    #[must_use]
    pub fn has_dataset(&self, data_id: &str) -> bool {
        accepts(&self.data_ids, data_id)
    }

    /// Whether the model belongs to the cohort
    #[must_use]
    pub fn has_model(&self, key: &ModelKey) -> bool {
        self.has_dataset(&key.data_id)
            && accepts(&self.network_ids, &key.network_id)
            && accepts(&self.instance_ids, &key.instance_id)
    }
}

/// Per-table outcome of a fill run, in population order
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FillReport {
    /// `(table, report)` pairs
    pub tables: Vec<(&'static str, PopulateReport)>,
}

impl FillReport {
    /// Rows committed over every table
    #[must_use]
    pub fn made(&self) -> usize {
        self.tables.iter().map(|(_, r)| r.made).sum()
    }

    /// Keys left for a later pass over every table
    #[must_use]
    pub fn missing(&self) -> usize {
        self.tables.iter().map(|(_, r)| r.missing).sum()
    }
}

fn run<C, F>(ws: &Workspace, options: PopulateOptions, report: &mut FillReport, restriction: F) -> Result<()>
where
    C: Computed,
    F: Fn(&C::Key) -> bool,
{
    let outcome = populate_where::<C, F>(ws, options, restriction)?;
    report.tables.push((C::TABLE, outcome));
    Ok(())
}

/// Populate the tables of `stages` for `cohort`.
///
/// # Errors
/// Returns the first non-missing `make` error unless `options` suppresses them
pub fn fill(ws: &Workspace, cohort: &Cohort, stages: &[Stage], options: PopulateOptions) -> Result<FillReport> {
    let mut stages = stages.to_vec();
    stages.sort();
    stages.dedup();

    let mut report = FillReport::default();
    for stage in stages {
        tracing::info!(?stage, "filling");
        match stage {
            Stage::Recording => {
                run::<TrialBounds, _>(ws, options, &mut report, |_| true)?;
                run::<TrialSamples, _>(ws, options, &mut report, |_| true)?;
                run::<ResampledTrial, _>(ws, options, &mut report, |_| true)?;
                run::<ResizedVideo, _>(ws, options, &mut report, |_| true)?;
                run::<ResampledTraces, _>(ws, options, &mut report, |_| true)?;
                run::<TraceSummary, _>(ws, options, &mut report, |_| true)?;
            }
            Stage::Dataset => {
                run::<Dataset, _>(ws, options, &mut report, |id| cohort.has_dataset(id))?;
            }
            Stage::Model => {
                run::<Model, _>(ws, options, &mut report, |key| cohort.has_model(key))?;
            }
            Stage::Response => {
                run::<VisualMeasure, _>(ws, options, &mut report, |key| cohort.has_model(&key.model))?;
                run::<VisualUnitCorrelation, _>(ws, options, &mut report, |key| cohort.has_model(&key.model))?;
                run::<VisualDirectionTuning, _>(ws, options, &mut report, |key| cohort.has_model(&key.model))?;
                run::<VisualSpatialTuning, _>(ws, options, &mut report, |key| cohort.has_model(&key.model))?;
            }
        }
    }
    tracing::info!(made = report.made(), missing = report.missing(), "fill finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{fixtures, VisualKey, VisualRequest};

    #[test]
    fn test_cohort_restriction() {
        let cohort = Cohort {
            data_ids: vec!["a".into()],
            network_ids: vec![],
            instance_ids: vec!["i".into()],
        };
        assert!(cohort.has_model(&ModelKey::new("a", "any", "i")));
        assert!(!cohort.has_model(&ModelKey::new("b", "any", "i")));
        assert!(!cohort.has_model(&ModelKey::new("a", "any", "j")));
        assert!(Cohort::default().has_dataset("anything"));
    }

    #[test]
    fn test_cohort_json_defaults() {
        let cohort: Cohort = serde_json::from_str(r#"{"data_ids": ["a"]}"#).unwrap();
        assert_eq!(cohort.data_ids, vec!["a"]);
        assert!(cohort.network_ids.is_empty());
        let stage: Stage = serde_json::from_str(r#""response""#).unwrap();
        assert_eq!(stage, Stage::Response);
    }

    fn requested(ws: &Workspace, key: &VisualKey) {
        ws.catalog().insert(VisualRequest { key: key.clone() }).unwrap();
    }

    #[test]
    fn test_response_stage_in_order() {
        let ws = Workspace::in_memory();
        let key = fixtures::scan(&ws, fixtures::directions(), 2);
        requested(&ws, &key);

        let report = fill(&ws, &Cohort::default(), &[Stage::Response], PopulateOptions::local()).unwrap();
        let tables: Vec<&str> = report.tables.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            tables,
            vec![
                "visual_measure",
                "visual_unit_correlation",
                "visual_direction_tuning",
                "visual_spatial_tuning"
            ]
        );
        // measure precedes correlation, so both land in one pass
        assert!(ws.table::<VisualUnitCorrelation>().unwrap().contains(&key));
        assert!(ws.table::<VisualDirectionTuning>().unwrap().contains(&key));
        // direction videos carry no spots, so spatial tuning has no keys
        let (_, spatial) = &report.tables[3];
        assert_eq!((spatial.made, spatial.missing, spatial.errors.len()), (0, 0, 0));
        assert_eq!(report.made(), 3);

        // a second pass finds nothing left to do
        let again = fill(&ws, &Cohort::default(), &[Stage::Response], PopulateOptions::local()).unwrap();
        assert_eq!((again.made(), again.missing()), (0, 0));
    }

    #[test]
    fn test_spot_only_videos_skip_direction_tuning() {
        let ws = Workspace::in_memory();
        let key = fixtures::scan(&ws, fixtures::spots(), 2);
        requested(&ws, &key);

        let report = fill(&ws, &Cohort::default(), &[Stage::Response], PopulateOptions::local()).unwrap();
        let (_, direction) = &report.tables[2];
        assert_eq!((direction.made, direction.errors.len()), (0, 0));
        assert!(ws.table::<VisualSpatialTuning>().unwrap().contains(&key));
        assert!(ws.table::<VisualDirectionTuning>().unwrap().is_empty());
    }

    #[test]
    fn test_mixed_video_set_fills_both_tunings() {
        let ws = Workspace::in_memory();
        let mut stimuli = fixtures::directions();
        stimuli.extend(fixtures::spots());
        let key = fixtures::scan(&ws, stimuli, 2);
        requested(&ws, &key);

        let report = fill(&ws, &Cohort::default(), &[Stage::Response], PopulateOptions::local()).unwrap();
        assert_eq!(report.made(), 4);
        assert!(ws.table::<VisualDirectionTuning>().unwrap().contains(&key));
        assert!(ws.table::<VisualSpatialTuning>().unwrap().contains(&key));
    }

    #[test]
    fn test_excluded_model_is_skipped() {
        let ws = Workspace::in_memory();
        let key = fixtures::scan(&ws, fixtures::directions(), 2);
        requested(&ws, &key);
        let cohort = Cohort {
            data_ids: vec!["other".into()],
            ..Cohort::default()
        };
        let stages = [Stage::Dataset, Stage::Model, Stage::Response];
        let report = fill(&ws, &cohort, &stages, PopulateOptions::local()).unwrap();
        assert_eq!(report.made(), 0);
        assert!(ws.table::<VisualMeasure>().unwrap().is_empty());
    }
}
