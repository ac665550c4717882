//! Dataset builder
//!
//! A [`VisualScan`] names the inputs of one dataset: a scan's trials, its
//! tier split, three trace sets and a [`Spec`]. [`Dataset`] joins them into
//! per-trial columns:
//!
//! | column         | type                          |
//! |----------------|-------------------------------|
//! | `trial_id`     | utf8                          |
//! | `training`     | bool                          |
//! | `samples`      | u64                           |
//! | `stimuli`      | `u8[samples, height, width]`  |
//! | `perspectives` | `f32[samples, perspectives]`  |
//! | `modulations`  | `f32[samples, modulations]`   |
//! | `units`        | `f32[samples, units]`         |
//!
//! Array columns are lazy: the row holds a blob key, [`DatasetTrial`]
//! decodes on demand. The index itself exports to Arrow and Parquet.

use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use ndarray::{Array2, Array3, Axis};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::blob;
use crate::catalog::{content_id, Catalog, Computed, Entity, Link};
use crate::network::DataShape;
use crate::params::{TraceSet, TrialSet};
use crate::recording::{
    channel_standardizer, RecordingKey, ResampleKey, ResampledTraces, ResampledTrial, ResizeKey,
    ResizedVideo, TierKind, Trace, TraceKind, Trial, TrialRateKey, TrialSamples,
};
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Trace channel class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Eye position and similar
    Perspective,
    /// Behavioral state
    Modulation,
    /// Recorded units
    Unit,
}

impl Channel {
    /// Every channel, in column order
    pub const ALL: [Self; 3] = [Self::Perspective, Self::Modulation, Self::Unit];

    /// Column name
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::Perspective => "perspectives",
            Self::Modulation => "modulations",
            Self::Unit => "units",
        }
    }
}

/// Per-channel resampling parameters (link ids)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceSpec {
    /// Offset link id
    pub offset_id: String,
    /// Resample link id
    pub resample_id: String,
    /// Standardize link id
    pub standardize_id: String,
}

/// Video and trace specification of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    /// Content id of the fields below
    pub spec_id: String,
    /// Stimulus height
    pub height: usize,
    /// Stimulus width
    pub width: usize,
    /// Resize link id
    pub resize_id: String,
    /// Rate link id shared by every column
    pub rate_id: String,
    /// Perspective channel
    pub perspective: TraceSpec,
    /// Modulation channel
    pub modulation: TraceSpec,
    /// Unit channel
    pub unit: TraceSpec,
}

impl Entity for Spec {
    const TABLE: &'static str = "spec";
    type Key = String;

    fn key(&self) -> String {
        self.spec_id.clone()
    }
}

impl Spec {
    /// Insert a spec (idempotent) and return its id.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a zero stimulus size
    #[allow(clippy::too_many_arguments)]
    pub fn fill(
        catalog: &Catalog,
        height: usize,
        width: usize,
        resize_id: String,
        rate_id: String,
        perspective: TraceSpec,
        modulation: TraceSpec,
        unit: TraceSpec,
    ) -> Result<String> {
        if height == 0 || width == 0 {
            return Err(Error::InvalidInput(format!(
                "stimulus size {height}x{width} is empty"
            )));
        }
        let spec_id = content_id(&(
            Self::TABLE,
            height,
            width,
            &resize_id,
            &rate_id,
            &perspective,
            &modulation,
            &unit,
        ))?;
        catalog.insert(Self {
            spec_id: spec_id.clone(),
            height,
            width,
            resize_id,
            rate_id,
            perspective,
            modulation,
            unit,
        })?;
        Ok(spec_id)
    }

    /// Parameters of one channel
    #[must_use]
    pub const fn channel(&self, channel: Channel) -> &TraceSpec {
        match channel {
            Channel::Perspective => &self.perspective,
            Channel::Modulation => &self.modulation,
            Channel::Unit => &self.unit,
        }
    }
}

/// Inputs of one dataset, before the spec is applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSelection {
    /// Source scan
    pub scan: RecordingKey,
    /// All trials of the dataset
    pub trialset_id: String,
    /// Tier link id
    pub tier_id: String,
    /// Perspective trace set
    pub perspectives_id: String,
    /// Modulation trace set
    pub modulations_id: String,
    /// Unit trace set
    pub units_id: String,
}

/// A dataset declaration: scan selection, tier split and spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualScan {
    /// Content id of the selection and spec
    pub data_id: String,
    /// Selection
    pub selection: ScanSelection,
    /// Spec id
    pub spec_id: String,
    /// Training tier
    pub training_trialset_id: String,
    /// Validation tier, `None` when every trial trains
    pub validation_trialset_id: Option<String>,
}

impl Entity for VisualScan {
    const TABLE: &'static str = "visual_scan";
    type Key = String;

    fn key(&self) -> String {
        self.data_id.clone()
    }
}

impl VisualScan {
    /// Split the trials into tiers and insert the declaration.
    ///
    /// # Errors
    /// Returns `MissingUpstream` for unknown sets, tier or spec, and
    /// `InvalidInput` if the split leaves no training trial
    pub fn fill(ws: &Workspace, selection: ScanSelection, spec_id: &str) -> Result<String> {
        let catalog = ws.catalog();
        ws.fetch1::<Spec>(&spec_id.to_string())?;
        for set in [&selection.perspectives_id, &selection.modulations_id, &selection.units_id] {
            catalog.fetch1::<TraceSet>(set)?;
        }
        let trials = TrialSet::members(catalog, &selection.trialset_id)?;
        let tier = Link::<TierKind>::get(catalog, &selection.tier_id)?;
        let (training, validation) = tier.split(&trials)?;
        if training.is_empty() {
            return Err(Error::InvalidInput(format!(
                "tier leaves no training trials out of {}",
                trials.len()
            )));
        }

        let training_trialset_id = TrialSet::fill(catalog, training)?;
        let validation_trialset_id = if validation.is_empty() {
            None
        } else {
            Some(TrialSet::fill(catalog, validation)?)
        };

        let data_id = content_id(&(Self::TABLE, &selection, spec_id))?;
        catalog.insert(Self {
            data_id: data_id.clone(),
            selection,
            spec_id: spec_id.to_string(),
            training_trialset_id,
            validation_trialset_id,
        })?;
        Ok(data_id)
    }

    /// Trace set of one channel
    #[must_use]
    pub fn traceset(&self, channel: Channel) -> &str {
        match channel {
            Channel::Perspective => &self.selection.perspectives_id,
            Channel::Modulation => &self.selection.modulations_id,
            Channel::Unit => &self.selection.units_id,
        }
    }

    /// Trial set of all trials
    #[must_use]
    pub fn trialset_id(&self) -> &str {
        &self.selection.trialset_id
    }
}

/// One row of a dataset; array columns are blob keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetTrial {
    /// Trial
    pub trial_id: String,
    /// Training tier membership
    pub training: bool,
    /// Sample count shared by every column
    pub samples: usize,
    /// `u8[samples, height, width]`
    pub stimuli: String,
    /// `f32[samples, perspectives]`
    pub perspectives: String,
    /// `f32[samples, modulations]`
    pub modulations: String,
    /// `f32[samples, units]`
    pub units: String,
}

impl DatasetTrial {
    fn load<T: DeserializeOwned>(ws: &Workspace, key: &str) -> Result<T> {
        blob::fetch(ws.blobs(), key)
    }

    /// Decode the stimulus frames.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the blob is absent
    pub fn stimuli(&self, ws: &Workspace) -> Result<Array3<u8>> {
        Self::load(ws, &self.stimuli)
    }

    /// Decode one trace channel.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the blob is absent
    pub fn channel(&self, ws: &Workspace, channel: Channel) -> Result<Array2<f32>> {
        let key = match channel {
            Channel::Perspective => &self.perspectives,
            Channel::Modulation => &self.modulations,
            Channel::Unit => &self.units,
        };
        Self::load(ws, key)
    }
}

/// Materialized dataset of one [`VisualScan`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Data id
    pub data_id: String,
    /// Array shapes
    pub shape: DataShape,
    /// Unit ids in column order of the `units` arrays
    pub unit_ids: Vec<u32>,
    /// Rows ordered by trial id
    pub trials: Vec<DatasetTrial>,
}

impl Entity for Dataset {
    const TABLE: &'static str = "dataset";
    type Key = String;

    fn key(&self) -> String {
        self.data_id.clone()
    }
}

fn load_traces(ws: &Workspace, traceset_id: &str) -> Result<Vec<Trace>> {
    TraceSet::members(ws.catalog(), traceset_id)?
        .iter()
        .map(|id| ws.fetch1::<Trace>(id))
        .collect()
}

/// Column permutation sorting unit traces by unit id.
fn unit_order(traces: &[Trace]) -> Result<(Vec<usize>, Vec<u32>)> {
    let mut ids = Vec::with_capacity(traces.len());
    for trace in traces {
        match trace.kind {
            TraceKind::Unit { unit_id } => ids.push(unit_id),
            ref other => {
                return Err(Error::InvalidInput(format!(
                    "unit trace set contains a {other:?} trace"
                )))
            }
        }
    }
    let mut order: Vec<usize> = (0..ids.len()).collect();
    order.sort_by_key(|&i| ids[i]);
    let sorted = order.iter().map(|&i| ids[i]).collect();
    Ok((order, sorted))
}

impl Computed for Dataset {
    fn key_source(ws: &Workspace) -> Result<Vec<String>> {
        Ok(ws.table::<VisualScan>()?.keys())
    }

    fn make(ws: &Workspace, data_id: &String) -> Result<Self> {
        let scan = ws.fetch1::<VisualScan>(data_id)?;
        let spec = ws.fetch1::<Spec>(&scan.spec_id)?;
        let catalog = ws.catalog();

        let training: FxHashSet<String> = TrialSet::members(catalog, &scan.training_trialset_id)?
            .into_iter()
            .collect();
        let mut trial_ids: Vec<String> = training.iter().cloned().collect();
        if let Some(validation) = &scan.validation_trialset_id {
            trial_ids.extend(TrialSet::members(catalog, validation)?);
        }
        trial_ids.sort();

        let mut transforms = Vec::with_capacity(Channel::ALL.len());
        let mut widths = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            transforms.push(channel_standardizer(
                ws,
                scan.traceset(channel),
                &scan.training_trialset_id,
                &spec.rate_id,
                spec.channel(channel),
            )?);
            widths.push(TraceSet::members(catalog, scan.traceset(channel))?.len());
        }
        let (order, unit_ids) = unit_order(&load_traces(ws, scan.traceset(Channel::Unit))?)?;

        let mut videos: FxHashMap<String, Array3<u8>> = FxHashMap::default();
        let mut rows = Vec::with_capacity(trial_ids.len());
        for (done, trial_id) in trial_ids.iter().enumerate() {
            let trial = ws.fetch1::<Trial>(trial_id)?;
            let rate_key = TrialRateKey {
                trial_id: trial_id.clone(),
                rate_id: spec.rate_id.clone(),
            };
            let samples = ws.fetch1::<TrialSamples>(&rate_key)?.samples;
            let index = ws.fetch1::<ResampledTrial>(&rate_key)?.index;
            if index.len() != samples {
                return Err(Error::MissingTrial(format!(
                    "trial {trial_id}: stimuli have {} of {samples} samples",
                    index.len()
                )));
            }

            if !videos.contains_key(&trial.video_id) {
                let resized = ws.fetch1::<ResizedVideo>(&ResizeKey {
                    video_id: trial.video_id.clone(),
                    resize_id: spec.resize_id.clone(),
                    height: spec.height,
                    width: spec.width,
                })?;
                videos.insert(trial.video_id.clone(), resized.load(ws)?);
            }
            let frames = &videos[&trial.video_id];
            if let Some(&bad) = index.iter().find(|&&i| i >= frames.len_of(Axis(0))) {
                return Err(Error::InvalidInput(format!(
                    "trial {trial_id} references frame {bad} of a {}-frame video",
                    frames.len_of(Axis(0))
                )));
            }
            let stimuli = frames.select(Axis(0), &index);

            let prefix = format!("datasets/{data_id}/{trial_id}");
            let mut keys = Vec::with_capacity(Channel::ALL.len());
            for (channel, transform) in Channel::ALL.into_iter().zip(&transforms) {
                let trace_spec = spec.channel(channel);
                let cached = ws.fetch1::<ResampledTraces>(&ResampleKey {
                    traceset_id: scan.traceset(channel).to_string(),
                    trial_id: trial_id.clone(),
                    rate_id: spec.rate_id.clone(),
                    offset_id: trace_spec.offset_id.clone(),
                    resample_id: trace_spec.resample_id.clone(),
                })?;
                let raw = cached.load(ws)?;
                if raw.nrows() != samples {
                    return Err(Error::MissingTrial(format!(
                        "trial {trial_id}: {} have {} of {samples} samples",
                        channel.column(),
                        raw.nrows()
                    )));
                }
                let mut standardized = transform.forward(raw.view())?;
                if channel == Channel::Unit {
                    standardized = standardized.select(Axis(1), &order);
                }
                let key = format!("{prefix}/{}.bin", channel.column());
                blob::put(ws.blobs(), &key, &standardized)?;
                keys.push(key);
            }
            let stimuli_key = format!("{prefix}/stimuli.bin");
            blob::put(ws.blobs(), &stimuli_key, &stimuli)?;

            let [perspectives, modulations, units]: [String; 3] = keys
                .try_into()
                .map_err(|_| Error::Other("channel count changed".to_string()))?;
            rows.push(DatasetTrial {
                trial_id: trial_id.clone(),
                training: training.contains(trial_id),
                samples,
                stimuli: stimuli_key,
                perspectives,
                modulations,
                units,
            });
            crate::context::tick(Self::TABLE, done + 1, trial_ids.len());
        }

        tracing::info!(data_id = %data_id, trials = rows.len(), units = unit_ids.len(), "dataset built");
        Ok(Self {
            data_id: data_id.clone(),
            shape: DataShape {
                height: spec.height,
                width: spec.width,
                perspectives: widths[0],
                modulations: widths[1],
                units: widths[2],
            },
            unit_ids,
            trials: rows,
        })
    }
}

impl Dataset {
    /// Training rows
    pub fn training(&self) -> impl Iterator<Item = &DatasetTrial> {
        self.trials.iter().filter(|t| t.training)
    }

    /// Validation rows
    pub fn validation(&self) -> impl Iterator<Item = &DatasetTrial> {
        self.trials.iter().filter(|t| !t.training)
    }

    /// Row of one trial
    #[must_use]
    pub fn trial(&self, trial_id: &str) -> Option<&DatasetTrial> {
        self.trials.iter().find(|t| t.trial_id == trial_id)
    }

    /// Arrow schema of the index frame
    #[must_use]
    pub fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("trial_id", DataType::Utf8, false),
            Field::new("training", DataType::Boolean, false),
            Field::new("samples", DataType::UInt64, false),
            Field::new("stimuli", DataType::Utf8, false),
            Field::new("perspectives", DataType::Utf8, false),
            Field::new("modulations", DataType::Utf8, false),
            Field::new("units", DataType::Utf8, false),
        ]))
    }

    /// Index frame with one row per trial; array columns hold blob keys.
    ///
    /// # Errors
    /// Returns error if the batch cannot be assembled
    pub fn frame(&self) -> Result<RecordBatch> {
        let strings = |f: fn(&DatasetTrial) -> &str| {
            Arc::new(StringArray::from_iter_values(self.trials.iter().map(f))) as Arc<dyn Array>
        };
        let batch = RecordBatch::try_new(
            Self::schema(),
            vec![
                strings(|t| &t.trial_id),
                Arc::new(BooleanArray::from(
                    self.trials.iter().map(|t| t.training).collect::<Vec<_>>(),
                )),
                Arc::new(UInt64Array::from_iter_values(
                    self.trials.iter().map(|t| t.samples as u64),
                )),
                strings(|t| &t.stimuli),
                strings(|t| &t.perspectives),
                strings(|t| &t.modulations),
                strings(|t| &t.units),
            ],
        )?;
        Ok(batch)
    }

    /// Write the index frame to a Parquet file.
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use parquet::arrow::ArrowWriter;

        let file = std::fs::File::create(path.as_ref())?;
        let mut writer = ArrowWriter::try_new(file, Self::schema(), None)?;
        writer.write(&self.frame()?)?;
        writer.close()?;
        Ok(())
    }

    /// Read an index frame written by [`Dataset::write_parquet`].
    ///
    /// # Errors
    /// Returns `StorageError` if the file does not match the index schema
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_parquet<P: AsRef<Path>>(path: P) -> Result<Vec<DatasetTrial>> {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let file = std::fs::File::open(path.as_ref())?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch?;
            let trial_id: &StringArray = column(&batch, "trial_id")?;
            let stimuli: &StringArray = column(&batch, "stimuli")?;
            let perspectives: &StringArray = column(&batch, "perspectives")?;
            let modulations: &StringArray = column(&batch, "modulations")?;
            let units: &StringArray = column(&batch, "units")?;
            let training: &BooleanArray = column(&batch, "training")?;
            let samples: &UInt64Array = column(&batch, "samples")?;
            for i in 0..batch.num_rows() {
                rows.push(DatasetTrial {
                    trial_id: trial_id.value(i).to_string(),
                    training: training.value(i),
                    samples: samples.value(i) as usize,
                    stimuli: stimuli.value(i).to_string(),
                    perspectives: perspectives.value(i).to_string(),
                    modulations: modulations.value(i).to_string(),
                    units: units.value(i).to_string(),
                });
            }
        }
        Ok(rows)
    }
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| Error::StorageError(format!("dataset index column `{name}` missing or mistyped")))
}
