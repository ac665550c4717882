//! Parameter entities
//!
//! Each enum below is stored in its own [`Link`](crate::catalog::Link)
//! table and is addressed by content id. The enums carry the capability
//! their id stands for: a sampling period, a time offset, a resampler
//! factory, a standardization recipe, a reducer, a resize method.

use serde::{Deserialize, Serialize};

use crate::catalog::{Link, LinkKind, LinkSet, SetKind};
use crate::resample::{Hamming, Resampler};
use crate::workspace::Workspace;
use crate::{Error, Result};

macro_rules! set_kind {
    ($(#[$doc:meta])* $name:ident, $table:literal, $member:literal, $ordered:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl SetKind for $name {
            const TABLE: &'static str = $table;
            const MEMBER_TABLE: &'static str = $member;
            const ORDERED: bool = $ordered;
        }
    };
}

set_kind!(
    /// Unordered set of trial ids
    TrialSetKind, "trialset", "trialset_member", false
);
set_kind!(
    /// Set of trace ids; `index` is the `traceset_index`
    TraceSetKind, "traceset", "traceset_member", false
);
set_kind!(
    /// Set of video ids
    VideoSetKind, "videoset", "videoset_member", false
);
set_kind!(
    /// Set of trial filter ids; a trial passes when every filter accepts it
    TrialFilterSetKind, "trialfilterset", "trialfilterset_member", false
);

/// Trial set
pub type TrialSet = LinkSet<TrialSetKind>;
/// Trace set
pub type TraceSet = LinkSet<TraceSetKind>;
/// Video set
pub type VideoSet = LinkSet<VideoSetKind>;
/// Trial filter set
pub type TrialFilterSet = LinkSet<TrialFilterSetKind>;

/// Sampling rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RateKind {
    /// Uniform sampling period in seconds
    Rate {
        /// Seconds between samples
        period: f64,
    },
}

impl LinkKind for RateKind {
    const TABLE: &'static str = "rate";

    fn type_tag(&self) -> &'static str {
        "rate"
    }
}

impl RateKind {
    /// Sampling period in seconds.
    #[must_use]
    pub const fn period(&self) -> f64 {
        match self {
            Self::Rate { period } => *period,
        }
    }

    /// Resolve a rate id to its period.
    ///
    /// # Errors
    /// Returns `MissingUpstream` for an unknown id
    pub fn resolve(ws: &Workspace, rate_id: &str) -> Result<f64> {
        Ok(Link::<Self>::get(ws.catalog(), rate_id)?.period())
    }
}

/// Time offset applied to the resampling grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OffsetKind {
    /// Constant offset in seconds
    Constant {
        /// Seconds added to every grid point
        offset: f64,
    },
}

impl LinkKind for OffsetKind {
    const TABLE: &'static str = "offset";

    fn type_tag(&self) -> &'static str {
        "constant"
    }
}

impl OffsetKind {
    /// Offset in seconds.
    #[must_use]
    pub const fn offset(&self) -> f64 {
        match self {
            Self::Constant { offset } => *offset,
        }
    }
}

/// Resampling method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResampleKind {
    /// Hamming low-pass at the target period, then linear interpolation
    Hamming,
    /// Hamming low-pass at an explicit period, then linear interpolation
    LowpassHamming {
        /// Low-pass period in seconds
        lowpass_period: f64,
    },
}

impl LinkKind for ResampleKind {
    const TABLE: &'static str = "resample";

    fn type_tag(&self) -> &'static str {
        match self {
            Self::Hamming => "hamming",
            Self::LowpassHamming { .. } => "lowpass_hamming",
        }
    }
}

impl ResampleKind {
    /// Build a resampler for one signal.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the signal is malformed
    pub fn resampler(
        &self,
        times: &[f64],
        values: &[f64],
        period: f64,
        offset: f64,
    ) -> Result<Box<dyn Resampler>> {
        let resampler = match self {
            Self::Hamming => Hamming::new(times, values, period, offset)?,
            Self::LowpassHamming { lowpass_period } => {
                Hamming::with_lowpass(times, values, period, offset, *lowpass_period)?
            }
        };
        Ok(Box::new(resampler))
    }
}

/// Scalar reducer over the finite values of an array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SummaryKind {
    /// Arithmetic mean
    Mean,
    /// Population standard deviation
    Std,
    /// Minimum
    Min,
    /// Maximum
    Max,
    /// Mean absolute value
    AbsMean,
    /// Quantile with linear interpolation, `q` in `[0, 1]`
    Quantile {
        /// Quantile
        q: f64,
    },
}

impl LinkKind for SummaryKind {
    const TABLE: &'static str = "summary";

    fn type_tag(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Std => "std",
            Self::Min => "min",
            Self::Max => "max",
            Self::AbsMean => "abs_mean",
            Self::Quantile { .. } => "quantile",
        }
    }
}

/// Standardization recipe; each field names a [`SummaryKind`] link id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StandardizeKind {
    /// `y = (x - shift) / scale`, shift forced to 0 on homogeneous channels
    Affine {
        /// Summary id of the shift
        shift_id: String,
        /// Summary id of the scale
        scale_id: String,
        /// Lower bound of the scale
        eps: f64,
    },
    /// `y = x / scale`
    Scale {
        /// Summary id of the scale
        scale_id: String,
        /// Lower bound of the scale
        eps: f64,
    },
}

impl LinkKind for StandardizeKind {
    const TABLE: &'static str = "standardize";

    fn type_tag(&self) -> &'static str {
        match self {
            Self::Affine { .. } => "affine",
            Self::Scale { .. } => "scale",
        }
    }
}

impl StandardizeKind {
    /// Summary ids this recipe reads, in `(shift, scale)` order.
    #[must_use]
    pub fn summary_ids(&self) -> Vec<&str> {
        match self {
            Self::Affine {
                shift_id, scale_id, ..
            } => vec![shift_id.as_str(), scale_id.as_str()],
            Self::Scale { scale_id, .. } => vec![scale_id.as_str()],
        }
    }
}

/// Frame resize method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeKind {
    /// Nearest-neighbour sampling
    Nearest,
    /// Box average over the source area of each target pixel
    Area,
}

impl LinkKind for ResizeKind {
    const TABLE: &'static str = "resize";

    fn type_tag(&self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Area => "area",
        }
    }
}

/// Predicate over trials used to select responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialFilterKind {
    /// Accept every trial
    All,
    /// Accept trials in a trial set
    Member {
        /// Trial set id
        trialset_id: String,
    },
    /// Accept trials whose duration lies in `[min, max]` seconds
    Duration {
        /// Minimum duration
        min: f64,
        /// Maximum duration
        max: f64,
    },
}

impl LinkKind for TrialFilterKind {
    const TABLE: &'static str = "trialfilter";

    fn type_tag(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Member { .. } => "member",
            Self::Duration { .. } => "duration",
        }
    }
}

/// Check that a period-like parameter is positive and finite.
pub(crate) fn positive(name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(Error::InvalidInput(format!(
            "{name} must be positive and finite, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_resolves_through_catalog() {
        let ws = Workspace::in_memory();
        let id = Link::fill(ws.catalog(), RateKind::Rate { period: 0.1 }).unwrap();
        assert!((RateKind::resolve(&ws, &id).unwrap() - 0.1).abs() < f64::EPSILON);
        assert!(RateKind::resolve(&ws, "unknown").unwrap_err().is_missing());
    }

    #[test]
    fn test_variants_get_distinct_ids() {
        let a = Link::new(ResampleKind::Hamming).unwrap();
        let b = Link::new(ResampleKind::LowpassHamming { lowpass_period: 0.1 }).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(b.type_tag, "lowpass_hamming");
    }

    #[test]
    fn test_resampler_factory() {
        let times = [0.0, 0.5, 1.0];
        let values = [0.0, 1.0, 2.0];
        let r = ResampleKind::Hamming
            .resampler(&times, &values, 0.5, 0.0)
            .unwrap();
        assert_eq!(r.resample(0.0, 1.0).unwrap(), vec![0.0f32, 1.0, 2.0]);
    }

    #[test]
    fn test_summary_ids() {
        let affine = StandardizeKind::Affine {
            shift_id: "m".into(),
            scale_id: "s".into(),
            eps: 1e-4,
        };
        assert_eq!(affine.summary_ids(), vec!["m", "s"]);
    }

    #[test]
    fn test_positive() {
        assert!(positive("period", 0.1).is_ok());
        assert!(positive("period", 0.0).is_err());
        assert!(positive("period", f64::NAN).is_err());
    }
}
