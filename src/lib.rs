//! # Foundation: catalog, resampling and training for visual-cortex models
//!
//! Foundation keeps a content-addressed catalog of recordings (videos,
//! trials, traces), resamples them onto common time grids, materializes
//! datasets, trains networks across ranks with resumable checkpoints, and
//! measures the visual responses of the trained models.
//!
//! ## Pipeline
//!
//! ```text
//! Video, Trial, Trace ──> TrialBounds ──> ResampledTrial, ResampledTraces, TraceSummary
//!                                             │
//! VisualScan (selection, spec) ─────────> Dataset ──> Model ──> Visual* measures
//!                                                      │
//!                                     ModelInfo / ModelCheckpoint / ModelDone
//! ```
//!
//! Every computed table is filled by [`catalog::populate`]: each pending key
//! is reserved, made once and committed; keys whose upstream rows are not
//! there yet are skipped until a later pass.
//!
//! ## Example
//!
//! ```rust
//! use foundation::catalog::Link;
//! use foundation::params::RateKind;
//! use foundation::resample::samples;
//! use foundation::workspace::Workspace;
//!
//! let ws = Workspace::in_memory();
//! let rate_id = Link::fill(ws.catalog(), RateKind::Rate { period: 0.5 })?;
//! let period = RateKind::resolve(&ws, &rate_id)?;
//! assert_eq!(samples(0.0, 2.0, period)?, 5);
//! # Ok::<(), foundation::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod blob;
pub mod catalog;
pub mod config;
pub mod context;
pub mod dataset;
pub mod device;
pub mod error;
pub mod export;
pub mod fill;
pub mod network;
pub mod params;
pub mod progress;
pub mod recording;
pub mod resample;
pub mod response;
pub mod standardize;
pub mod train;
pub mod workspace;

pub use error::{Error, Result};
