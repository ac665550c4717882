//! Stimulus videos and their resized caches

use ndarray::{Array2, Array3, Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::blob::{self, cas_hash};
use crate::catalog::{content_id, Computed, Entity, Link};
use crate::dataset::Spec;
use crate::params::{positive, ResizeKind};
use crate::resample::{check_monotonic, flip_index};
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Pixel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoMode {
    /// One channel
    Grayscale,
    /// Three channels; stored but not decodable in this build
    Rgb,
}

/// Frame timing relative to the first frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VideoTiming {
    /// Frames shown every `period` seconds
    Period {
        /// Seconds per frame
        period: f64,
    },
    /// Explicit frame onset times
    Times {
        /// Strictly increasing onsets, one per frame
        times: Vec<f64>,
    },
}

/// A moving-grating (or similar) presentation with a direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionEvent {
    /// Onset in seconds from the video start
    pub onset: f64,
    /// Offset in seconds from the video start
    pub offset: f64,
    /// Direction in radians
    pub direction: f64,
}

/// A flashed spot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotEvent {
    /// Onset in seconds from the video start
    pub onset: f64,
    /// Offset in seconds from the video start
    pub offset: f64,
    /// Center row, as a fraction of the height
    pub y: f64,
    /// Center column, as a fraction of the width
    pub x: f64,
    /// Radius, as a fraction of the height
    pub radius: f64,
}

/// Parametric description of what a video shows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stimulus {
    /// Directional stimuli
    Direction(Vec<DirectionEvent>),
    /// Spot stimuli
    Spot(Vec<SpotEvent>),
}

/// A stimulus video. Frames live in the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    /// Content id of the frames and metadata
    pub video_id: String,
    /// Pixel layout
    pub mode: VideoMode,
    /// Frame count
    pub frames: usize,
    /// Frame height
    pub height: usize,
    /// Frame width
    pub width: usize,
    /// Channels per pixel
    pub channels: usize,
    /// Frame timing
    pub timing: VideoTiming,
    /// Stimulus description, if parametric
    pub stimulus: Option<Stimulus>,
    /// Blob key of the frames
    pub blob_key: String,
}

impl Entity for Video {
    const TABLE: &'static str = "video";
    type Key = String;

    fn key(&self) -> String {
        self.video_id.clone()
    }
}

fn check_timing(timing: &VideoTiming, frames: usize) -> Result<()> {
    match timing {
        VideoTiming::Period { period } => {
            positive("video period", *period)?;
        }
        VideoTiming::Times { times } => {
            if times.len() != frames {
                return Err(Error::InvalidInput(format!(
                    "video has {frames} frames but {} times",
                    times.len()
                )));
            }
            check_monotonic(times)?;
        }
    }
    Ok(())
}

impl Video {
    /// Store grayscale `frames` (`[frames, height, width]`) and insert the row.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an empty video or inconsistent timing
    pub fn fill(
        ws: &Workspace,
        frames: &Array3<u8>,
        timing: VideoTiming,
        stimulus: Option<Stimulus>,
    ) -> Result<String> {
        let (count, height, width) = frames.dim();
        Self::store(ws, frames, (count, height, width, 1), VideoMode::Grayscale, timing, stimulus)
    }

    /// Store RGB `frames` (`[frames, height, width, 3]`) and insert the row.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an empty video, a channel count other than
    /// 3, or inconsistent timing
    pub fn fill_rgb(
        ws: &Workspace,
        frames: &Array4<u8>,
        timing: VideoTiming,
        stimulus: Option<Stimulus>,
    ) -> Result<String> {
        let shape = frames.dim();
        if shape.3 != 3 {
            return Err(Error::InvalidInput(format!(
                "rgb video needs 3 channels, got {}",
                shape.3
            )));
        }
        Self::store(ws, frames, shape, VideoMode::Rgb, timing, stimulus)
    }

    fn store<T: Serialize>(
        ws: &Workspace,
        frames: &T,
        (count, height, width, channels): (usize, usize, usize, usize),
        mode: VideoMode,
        timing: VideoTiming,
        stimulus: Option<Stimulus>,
    ) -> Result<String> {
        if count == 0 || height == 0 || width == 0 {
            return Err(Error::InvalidInput("video has no pixels".to_string()));
        }
        check_timing(&timing, count)?;

        let bytes = bincode::serialize(frames)?;
        let video_id = content_id(&(cas_hash(&bytes), mode, &timing, &stimulus))?;
        let blob_key = format!("videos/{video_id}.bin");
        if !ws.blobs().exists(&blob_key)? {
            ws.blobs().set(&blob_key, bytes)?;
        }

        ws.catalog().insert(Self {
            video_id: video_id.clone(),
            mode,
            frames: count,
            height,
            width,
            channels,
            timing,
            stimulus,
            blob_key,
        })?;
        Ok(video_id)
    }

    /// Decode the frames.
    ///
    /// # Errors
    /// Returns `NotImplemented` for RGB videos and `MissingUpstream` if the
    /// blob is absent
    pub fn load(&self, ws: &Workspace) -> Result<Array3<u8>> {
        match self.mode {
            VideoMode::Grayscale => blob::fetch(ws.blobs(), &self.blob_key),
            VideoMode::Rgb => Err(Error::NotImplemented(format!(
                "rgb frames of video {}",
                self.video_id
            ))),
        }
    }

    /// Onset of every frame relative to the first.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn frame_times(&self) -> Vec<f64> {
        match &self.timing {
            VideoTiming::Period { period } => {
                (0..self.frames).map(|i| i as f64 * period).collect()
            }
            VideoTiming::Times { times } => times.iter().map(|t| t - times[0]).collect(),
        }
    }

    /// Frame index for every sample of a grid at `period` covering the video.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a non-positive period
    pub fn generate(&self, period: f64) -> Result<Vec<usize>> {
        flip_index(&self.frame_times(), period)
    }

    /// Duration from the first onset to the last.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.frame_times().last().copied().unwrap_or(0.0)
    }
}

/// Separable box-area weights mapping `source` pixels onto `target` pixels.
#[allow(clippy::cast_precision_loss)]
fn area_weights(source: usize, target: usize) -> Array2<f32> {
    let ratio = source as f64 / target as f64;
    let mut weights = Array2::zeros((target, source));
    for i in 0..target {
        let lo = i as f64 * ratio;
        let hi = (i + 1) as f64 * ratio;
        let mut j = lo.floor() as usize;
        while j < source && (j as f64) < hi {
            let overlap = hi.min((j + 1) as f64) - lo.max(j as f64);
            if overlap > 0.0 {
                weights[[i, j]] = (overlap / ratio) as f32;
            }
            j += 1;
        }
    }
    weights
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn nearest_index(i: usize, source: usize, target: usize) -> usize {
    let position = (i as f64 + 0.5) * source as f64 / target as f64;
    (position.floor() as usize).min(source - 1)
}

/// Resize every frame of `[frames, height, width]` to `(height, width)`.
///
/// # Errors
/// Returns `InvalidInput` for a zero target size or an empty video
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn resize(frames: ArrayView3<'_, u8>, height: usize, width: usize, kind: ResizeKind) -> Result<Array3<u8>> {
    let (count, source_h, source_w) = frames.dim();
    if height == 0 || width == 0 || source_h == 0 || source_w == 0 {
        return Err(Error::InvalidInput(format!(
            "cannot resize {source_h}x{source_w} to {height}x{width}"
        )));
    }
    let mut out = Array3::zeros((count, height, width));

    match kind {
        ResizeKind::Nearest => {
            let rows: Vec<usize> = (0..height).map(|i| nearest_index(i, source_h, height)).collect();
            let cols: Vec<usize> = (0..width).map(|j| nearest_index(j, source_w, width)).collect();
            for (mut target, source) in out.axis_iter_mut(Axis(0)).zip(frames.axis_iter(Axis(0))) {
                for (i, &r) in rows.iter().enumerate() {
                    for (j, &c) in cols.iter().enumerate() {
                        target[[i, j]] = source[[r, c]];
                    }
                }
            }
        }
        ResizeKind::Area => {
            let wy = area_weights(source_h, height);
            let wx = area_weights(source_w, width);
            for (mut target, source) in out.axis_iter_mut(Axis(0)).zip(frames.axis_iter(Axis(0))) {
                let source = source.mapv(f32::from);
                let resized = wy.dot(&source).dot(&wx.t());
                target.assign(&resized.mapv(|v| v.round().clamp(0.0, 255.0) as u8));
            }
        }
    }
    Ok(out)
}

/// Key of a resized video
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResizeKey {
    /// Video
    pub video_id: String,
    /// Resize method link id
    pub resize_id: String,
    /// Target height
    pub height: usize,
    /// Target width
    pub width: usize,
}

/// Resized frames cached in the blob store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizedVideo {
    /// Key
    pub key: ResizeKey,
    /// Blob key of the `[frames, height, width]` array
    pub blob_key: String,
}

impl Entity for ResizedVideo {
    const TABLE: &'static str = "resized_video";
    type Key = ResizeKey;

    fn key(&self) -> ResizeKey {
        self.key.clone()
    }
}

impl ResizedVideo {
    /// Decode the resized frames.
    ///
    /// # Errors
    /// Returns `MissingUpstream` if the blob is absent
    pub fn load(&self, ws: &Workspace) -> Result<Array3<u8>> {
        blob::fetch(ws.blobs(), &self.blob_key)
    }
}

impl Computed for ResizedVideo {
    fn key_source(ws: &Workspace) -> Result<Vec<ResizeKey>> {
        let specs = ws.table::<Spec>()?.rows();
        let videos = ws.table::<Video>()?.keys();
        Ok(videos
            .iter()
            .flat_map(|video_id| {
                specs.iter().map(move |spec| ResizeKey {
                    video_id: video_id.clone(),
                    resize_id: spec.resize_id.clone(),
                    height: spec.height,
                    width: spec.width,
                })
            })
            .collect())
    }

    fn make(ws: &Workspace, key: &ResizeKey) -> Result<Self> {
        let video = ws.fetch1::<Video>(&key.video_id)?;
        let kind = Link::<ResizeKind>::get(ws.catalog(), &key.resize_id)?;
        let frames = video.load(ws)?;
        let resized = resize(frames.view(), key.height, key.width, kind)?;

        let blob_key = format!("resized_videos/{}.bin", content_id(key)?);
        blob::put(ws.blobs(), &blob_key, &resized)?;
        Ok(Self {
            key: key.clone(),
            blob_key,
        })
    }
}
