//! Per-channel standardization of `[samples, channels]` arrays
//!
//! Transforms are built from summary statistics (see
//! [`SummaryKind::reduce`]); a homogeneous channel never receives an
//! additive shift.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use trueno::Vector;

use crate::params::{StandardizeKind, SummaryKind};
use crate::{Error, Result};

/// Invertible per-channel transform.
pub trait Standardize: Send + Sync + std::fmt::Debug {
    /// Number of channels (columns) expected
    fn channels(&self) -> usize;

    /// Standardize `x`.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the column count differs from `channels()`
    fn forward(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>>;

    /// Undo [`Standardize::forward`].
    ///
    /// # Errors
    /// Returns `InvalidInput` if the column count differs from `channels()`
    fn inverse(&self, y: ArrayView2<'_, f32>) -> Result<Array2<f32>>;
}

fn check_columns(expected: usize, x: &ArrayView2<'_, f32>) -> Result<()> {
    if x.ncols() == expected {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "expected {expected} channels, got {}",
            x.ncols()
        )))
    }
}

/// `y = (x - shift) / max(scale, eps)`
#[derive(Debug, Clone, PartialEq)]
pub struct Affine {
    shift: Array1<f64>,
    scale: Array1<f64>,
}

impl Affine {
    /// Build from per-channel shift and scale; `homogeneous[i]` zeroes `shift[i]`.
    ///
    /// # Errors
    /// Returns `InvalidInput` on length mismatch, non-finite values or a
    /// non-positive `eps`
    pub fn new(shift: &[f64], scale: &[f64], homogeneous: &[bool], eps: f64) -> Result<Self> {
        if shift.len() != scale.len() || shift.len() != homogeneous.len() {
            return Err(Error::InvalidInput(format!(
                "shift ({}), scale ({}) and homogeneous ({}) differ in length",
                shift.len(),
                scale.len(),
                homogeneous.len()
            )));
        }
        if !(eps.is_finite() && eps > 0.0) {
            return Err(Error::InvalidInput(format!("eps must be positive, got {eps}")));
        }
        if shift.iter().chain(scale).any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput(
                "shift and scale must be finite".to_string(),
            ));
        }
        Ok(Self {
            shift: shift
                .iter()
                .zip(homogeneous)
                .map(|(&s, &h)| if h { 0.0 } else { s })
                .collect(),
            scale: scale.iter().map(|&s| s.max(eps)).collect(),
        })
    }

    /// Effective shift (zero on homogeneous channels)
    #[must_use]
    pub const fn shift(&self) -> &Array1<f64> {
        &self.shift
    }

    /// Effective scale (bounded below by `eps`)
    #[must_use]
    pub const fn scale(&self) -> &Array1<f64> {
        &self.scale
    }
}

#[allow(clippy::cast_possible_truncation)]
impl Standardize for Affine {
    fn channels(&self) -> usize {
        self.shift.len()
    }

    fn forward(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        check_columns(self.channels(), &x)?;
        let mut y = x.to_owned();
        for (mut column, (&shift, &scale)) in y
            .axis_iter_mut(Axis(1))
            .zip(self.shift.iter().zip(self.scale.iter()))
        {
            column.mapv_inplace(|v| ((f64::from(v) - shift) / scale) as f32);
        }
        Ok(y)
    }

    fn inverse(&self, y: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        check_columns(self.channels(), &y)?;
        let mut x = y.to_owned();
        for (mut column, (&shift, &scale)) in x
            .axis_iter_mut(Axis(1))
            .zip(self.shift.iter().zip(self.scale.iter()))
        {
            column.mapv_inplace(|v| (f64::from(v) * scale + shift) as f32);
        }
        Ok(x)
    }
}

/// `y = x / max(scale, eps)`
#[derive(Debug, Clone, PartialEq)]
pub struct Scale {
    scale: Array1<f64>,
}

impl Scale {
    /// Build from per-channel scale.
    ///
    /// # Errors
    /// Returns `InvalidInput` on non-finite scale or non-positive `eps`
    pub fn new(scale: &[f64], eps: f64) -> Result<Self> {
        if !(eps.is_finite() && eps > 0.0) {
            return Err(Error::InvalidInput(format!("eps must be positive, got {eps}")));
        }
        if scale.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput("scale must be finite".to_string()));
        }
        Ok(Self {
            scale: scale.iter().map(|&s| s.max(eps)).collect(),
        })
    }
}

#[allow(clippy::cast_possible_truncation)]
impl Standardize for Scale {
    fn channels(&self) -> usize {
        self.scale.len()
    }

    fn forward(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        check_columns(self.channels(), &x)?;
        let mut y = x.to_owned();
        for (mut column, &scale) in y.axis_iter_mut(Axis(1)).zip(self.scale.iter()) {
            column.mapv_inplace(|v| (f64::from(v) / scale) as f32);
        }
        Ok(y)
    }

    fn inverse(&self, y: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        check_columns(self.channels(), &y)?;
        let mut x = y.to_owned();
        for (mut column, &scale) in x.axis_iter_mut(Axis(1)).zip(self.scale.iter()) {
            column.mapv_inplace(|v| (f64::from(v) * scale) as f32);
        }
        Ok(x)
    }
}

impl StandardizeKind {
    /// Build the transform from per-channel summaries.
    ///
    /// `summaries[k][i]` is the value of `summary_ids()[k]` for channel `i`.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the summaries do not match the recipe
    pub fn build(&self, summaries: &[Vec<f64>], homogeneous: &[bool]) -> Result<Box<dyn Standardize>> {
        match (self, summaries) {
            (Self::Affine { eps, .. }, [shift, scale]) => {
                Ok(Box::new(Affine::new(shift, scale, homogeneous, *eps)?))
            }
            (Self::Scale { eps, .. }, [scale]) => {
                if scale.len() != homogeneous.len() {
                    return Err(Error::InvalidInput(format!(
                        "scale ({}) and homogeneous ({}) differ in length",
                        scale.len(),
                        homogeneous.len()
                    )));
                }
                Ok(Box::new(Scale::new(scale, *eps)?))
            }
            _ => Err(Error::InvalidInput(format!(
                "standardize `{}` needs {} summaries, got {}",
                crate::catalog::LinkKind::type_tag(self),
                self.summary_ids().len(),
                summaries.len()
            ))),
        }
    }
}

pub(crate) fn simd<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> Result<T> {
    result.map_err(|e| Error::Other(format!("SIMD reduction failed: {e}")))
}

impl SummaryKind {
    /// Reduce the finite values of `values`.
    ///
    /// # Errors
    /// Returns `InvalidInput` if no value is finite or `q` is outside `[0, 1]`
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn reduce(&self, values: &[f32]) -> Result<f64> {
        let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return Err(Error::InvalidInput(format!(
                "summary `{}` over {} values has no finite input",
                crate::catalog::LinkKind::type_tag(self),
                values.len()
            )));
        }
        let n = finite.len() as f64;
        let vector = Vector::from_slice(&finite);

        let value = match self {
            Self::Mean => f64::from(simd(vector.sum_kahan())?) / n,
            Self::Min => f64::from(simd(vector.min())?),
            Self::Max => f64::from(simd(vector.max())?),
            Self::AbsMean => {
                let abs: Vec<f32> = finite.iter().map(|v| v.abs()).collect();
                f64::from(simd(Vector::from_slice(&abs).sum_kahan())?) / n
            }
            Self::Std => {
                let mean = finite.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
                let centered: Vec<f32> = finite
                    .iter()
                    .map(|&v| (f64::from(v) - mean) as f32)
                    .collect();
                let centered = Vector::from_slice(&centered);
                (f64::from(simd(centered.dot(&centered))?) / n).sqrt()
            }
            Self::Quantile { q } => {
                if !(0.0..=1.0).contains(q) {
                    return Err(Error::InvalidInput(format!(
                        "quantile must lie in [0, 1], got {q}"
                    )));
                }
                let mut sorted: Vec<f64> = finite.iter().map(|&v| f64::from(v)).collect();
                sorted.sort_by(f64::total_cmp);
                let position = q * (n - 1.0);
                let lower = position.floor() as usize;
                let upper = position.ceil() as usize;
                let weight = position - position.floor();
                sorted[lower] * (1.0 - weight) + sorted[upper] * weight
            }
        };
        Ok(value)
    }
}
