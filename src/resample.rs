//! Resampling of irregularly sampled signals onto uniform grids
//!
//! All functions are pure. Times are seconds (`f64`); resampled output is
//! `f32` with NaN wherever the grid leaves the source support.
//!
//! ```text
//! samples(start, end, period) = floor((end - start) / period) + 1
//! target_index(t, period)     = floor(round(t / period, 1))
//! ```

use crate::{Error, Result};

/// Round to one decimal, ties to even.
#[must_use]
pub fn round1(x: f64) -> f64 {
    (x * 10.0).round_ties_even() / 10.0
}

fn check_period(period: f64) -> Result<()> {
    if period.is_finite() && period > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "period must be finite and positive, got {period}"
        )))
    }
}

/// Number of samples covering `[start, end]` at `period`.
///
/// # Errors
/// Returns `InvalidInput` for a non-positive period or `end < start`
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn samples(start: f64, end: f64, period: f64) -> Result<usize> {
    check_period(period)?;
    if !(start.is_finite() && end.is_finite()) || end < start {
        return Err(Error::InvalidInput(format!(
            "interval [{start}, {end}] is not a finite forward interval"
        )));
    }
    Ok(((end - start) / period).floor() as usize + 1)
}

/// Grid index of time `t`; the one-decimal rounding snaps values such as
/// `0.3 / 0.1 = 2.9999999999999996` to `3`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn target_index(t: f64, period: f64) -> i64 {
    round1(t / period).floor() as i64
}

/// Fail unless `times` is finite and strictly increasing.
///
/// # Errors
/// Returns `InvalidInput` naming the first offending position
pub fn check_monotonic(times: &[f64]) -> Result<()> {
    if let Some(i) = times.iter().position(|t| !t.is_finite()) {
        return Err(Error::InvalidInput(format!("time {i} is not finite")));
    }
    if let Some(i) = times.windows(2).position(|w| w[1] <= w[0]) {
        return Err(Error::InvalidInput(format!(
            "times are not strictly increasing at {}: {} -> {}",
            i + 1,
            times[i],
            times[i + 1]
        )));
    }
    Ok(())
}

/// For every grid sample, the last flip whose target index is at or before it.
///
/// `times` start at 0 and increase strictly; the result has
/// `target_index(times[last]) + 1` entries and is non-decreasing.
///
/// # Errors
/// Returns `InvalidInput` for empty, non-finite, non-monotonic or negative times
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn flip_index(times: &[f64], period: f64) -> Result<Vec<usize>> {
    check_period(period)?;
    if times.is_empty() {
        return Err(Error::InvalidInput("flip times are empty".to_string()));
    }
    check_monotonic(times)?;
    if times[0] < 0.0 {
        return Err(Error::InvalidInput(format!(
            "flip times must start at or after 0, got {}",
            times[0]
        )));
    }

    let targets: Vec<i64> = times.iter().map(|&t| target_index(t, period)).collect();
    let last = targets[targets.len() - 1];
    let count = last as usize + 1;

    let mut index = Vec::with_capacity(count);
    let mut flip = 0;
    for sample in 0..count {
        while flip + 1 < targets.len() && targets[flip + 1] <= sample as i64 {
            flip += 1;
        }
        index.push(flip);
    }
    Ok(index)
}

/// Common length of several arrays.
///
/// # Errors
/// Returns `LengthMismatch` if lengths differ by more than `tolerance`
pub fn common_length(lengths: &[usize], tolerance: usize) -> Result<usize> {
    let (Some(&min), Some(&max)) = (lengths.iter().min(), lengths.iter().max()) else {
        return Ok(0);
    };
    if max - min > tolerance {
        return Err(Error::LengthMismatch {
            lengths: lengths.to_vec(),
            tolerance,
        });
    }
    Ok(min)
}

/// Trim every array to the shortest length.
///
/// # Errors
/// Returns `LengthMismatch` if lengths differ by more than `tolerance`
pub fn truncate<'a, T>(arrays: &[&'a [T]], tolerance: usize) -> Result<Vec<&'a [T]>> {
    let lengths: Vec<usize> = arrays.iter().map(|a| a.len()).collect();
    let length = common_length(&lengths, tolerance)?;
    Ok(arrays.iter().map(|a| &a[..length]).collect())
}

/// Linearly interpolate NaNs from their finite neighbours; leading and
/// trailing NaNs take the nearest finite value.
///
/// # Errors
/// Returns `InvalidInput` if no value is finite
#[allow(clippy::cast_precision_loss)]
pub fn fill_nans(values: &[f64]) -> Result<Vec<f64>> {
    let finite: Vec<usize> = (0..values.len()).filter(|&i| !values[i].is_nan()).collect();
    let (Some(&first), Some(&last)) = (finite.first(), finite.last()) else {
        return Err(Error::InvalidInput(
            "cannot fill NaNs of an all-NaN trace".to_string(),
        ));
    };
    if finite.len() == values.len() {
        return Ok(values.to_vec());
    }

    let mut filled = values.to_vec();
    for value in &mut filled[..first] {
        *value = values[first];
    }
    for value in &mut filled[last + 1..] {
        *value = values[last];
    }
    for pair in finite.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let span = (b - a) as f64;
        for i in a + 1..b {
            let w = (i - a) as f64 / span;
            filled[i] = values[a] * (1.0 - w) + values[b] * w;
        }
    }
    Ok(filled)
}

/// Median of a non-empty slice (mean of the middle pair for even lengths).
#[must_use]
pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    match n {
        0 => f64::NAN,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => 0.5 * (sorted[n / 2 - 1] + sorted[n / 2]),
    }
}

/// Normalized Hamming window of `length` taps.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn hamming_window(length: usize) -> Vec<f64> {
    if length <= 1 {
        return vec![1.0; length];
    }
    let denom = (length - 1) as f64;
    let window: Vec<f64> = (0..length)
        .map(|n| 0.54 - 0.46 * (2.0 * std::f64::consts::PI * n as f64 / denom).cos())
        .collect();
    let total: f64 = window.iter().sum();
    window.into_iter().map(|w| w / total).collect()
}

/// Hamming low-pass of `values` sampled at `source_period` for `lowpass_period`.
///
/// No-op unless `lowpass_period > source_period`. The window has
/// `round(ratio) * 2 + 1` taps; at the edges it is renormalized over the
/// taps that fall inside the signal.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn hamming_lowpass(values: &[f64], source_period: f64, lowpass_period: f64) -> Vec<f64> {
    if !(lowpass_period > source_period) || values.len() < 2 {
        return values.to_vec();
    }
    let half = (lowpass_period / source_period).round() as usize;
    let window = hamming_window(half * 2 + 1);

    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(values.len() - 1);
            let mut acc = 0.0;
            let mut weight = 0.0;
            for j in lo..=hi {
                let w = window[j + half - i];
                acc += w * values[j];
                weight += w;
            }
            acc / weight
        })
        .collect()
}

/// A resampler evaluates one source signal on uniform grids.
pub trait Resampler: Send + Sync {
    /// Target period
    fn period(&self) -> f64;

    /// Values on the grid `start + offset + i * period`, `i < samples(start, end, period)`.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an invalid interval
    fn resample(&self, start: f64, end: f64) -> Result<Vec<f32>>;
}

/// Hamming low-pass followed by linear interpolation.
///
/// Times are centered on their median for numerical stability.
#[derive(Debug, Clone)]
pub struct Hamming {
    times: Vec<f64>,
    values: Vec<f64>,
    median: f64,
    period: f64,
    offset: f64,
}

impl Hamming {
    /// Filter for `target_period` when it is coarser than the source.
    ///
    /// # Errors
    /// Returns `InvalidInput` for mismatched lengths, non-monotonic times
    /// or non-finite values
    pub fn new(times: &[f64], values: &[f64], target_period: f64, target_offset: f64) -> Result<Self> {
        Self::with_lowpass(times, values, target_period, target_offset, target_period)
    }

    /// Filter for an explicit `lowpass_period`, independent of the target period.
    ///
    /// # Errors
    /// Same as [`Hamming::new`]
    pub fn with_lowpass(
        times: &[f64],
        values: &[f64],
        target_period: f64,
        target_offset: f64,
        lowpass_period: f64,
    ) -> Result<Self> {
        check_period(target_period)?;
        check_period(lowpass_period)?;
        if !target_offset.is_finite() {
            return Err(Error::InvalidInput(format!(
                "offset must be finite, got {target_offset}"
            )));
        }
        if times.len() != values.len() {
            return Err(Error::InvalidInput(format!(
                "times ({}) and values ({}) differ in length",
                times.len(),
                values.len()
            )));
        }
        if times.is_empty() {
            return Err(Error::InvalidInput("cannot resample an empty signal".to_string()));
        }
        check_monotonic(times)?;
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput(
                "values must be finite; fill NaNs before resampling".to_string(),
            ));
        }

        let median = median(times);
        let centered: Vec<f64> = times.iter().map(|t| t - median).collect();
        let source_period = if times.len() > 1 {
            let diffs: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).collect();
            self::median(&diffs)
        } else {
            lowpass_period
        };

        Ok(Self {
            times: centered,
            values: hamming_lowpass(values, source_period, lowpass_period),
            median,
            period: target_period,
            offset: target_offset,
        })
    }

    fn interpolate(&self, t: f64) -> f64 {
        let upper = self.times.partition_point(|&x| x <= t);
        if upper == 0 {
            return f64::NAN;
        }
        let lower = upper - 1;
        if upper == self.times.len() {
            return if t == self.times[lower] {
                self.values[lower]
            } else {
                f64::NAN
            };
        }
        let (t0, t1) = (self.times[lower], self.times[upper]);
        let (v0, v1) = (self.values[lower], self.values[upper]);
        if t == t0 {
            return v0;
        }
        v0 + (v1 - v0) * (t - t0) / (t1 - t0)
    }
}

impl Resampler for Hamming {
    fn period(&self) -> f64 {
        self.period
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn resample(&self, start: f64, end: f64) -> Result<Vec<f32>> {
        let n = samples(start, end, self.period)?;
        let origin = start + self.offset - self.median;
        Ok((0..n)
            .map(|i| self.interpolate(origin + i as f64 * self.period) as f32)
            .collect())
    }
}
