//! Direction tuning: impulse responses, bi-von-Mises fits, OSI and DSI

use std::f64::consts::{PI, TAU};

use serde::{Deserialize, Serialize};

use super::{requests_presenting, sample_period, visual_responses, VisualKey};
use crate::catalog::{Computed, Entity};
use crate::recording::Stimulus;
use crate::resample::target_index;
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Mean of the finite samples of `response` within `[onset, offset]`.
///
/// `response` starts `burnin` samples after the video onset. NaN when no
/// finite sample falls in the window.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
pub fn box_impulse(response: &[f32], onset: f64, offset: f64, period: f64, burnin: usize) -> f64 {
    let first = (target_index(onset, period) - burnin as i64).max(0);
    let last = (target_index(offset, period) - burnin as i64).min(response.len() as i64 - 1);
    if last < first {
        return f64::NAN;
    }
    let (sum, count) = response[first as usize..=last as usize]
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, n), &v| (sum + f64::from(v), n + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// `scale · [φ·g(x - μ) + (1 - φ)·g(x - μ - π)] + bias` with
/// `g(d) = exp(κ (cos d - 1))`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiVonMises {
    /// Preferred direction in `[0, 2π)`
    pub mu: f64,
    /// Weight of the preferred lobe, `≥ 0.5` once canonical
    pub phi: f64,
    /// Concentration
    pub kappa: f64,
    /// Amplitude
    pub scale: f64,
    /// Baseline
    pub bias: f64,
}

fn lobes(x: f64, mu: f64, phi: f64, kappa: f64) -> f64 {
    let g = |d: f64| (kappa * (d.cos() - 1.0)).exp();
    phi * g(x - mu) + (1.0 - phi) * g(x - mu - PI)
}

impl BiVonMises {
    /// Evaluate at direction `x`.
    #[must_use]
    pub fn eval(&self, x: f64) -> f64 {
        self.scale * lobes(x, self.mu, self.phi, self.kappa) + self.bias
    }

    /// The same curve with the larger lobe first.
    #[must_use]
    pub fn canonical(self) -> Self {
        if self.phi < 0.5 {
            Self {
                mu: (self.mu + PI).rem_euclid(TAU),
                phi: 1.0 - self.phi,
                ..self
            }
        } else {
            Self {
                mu: self.mu.rem_euclid(TAU),
                ..self
            }
        }
    }
}

/// A fitted curve and its mean squared error
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionFit {
    /// Curve
    pub curve: BiVonMises,
    /// Mean squared residual
    pub mse: f64,
}

/// Least-squares `scale` and `bias` for fixed lobes, and the resulting mse.
#[allow(clippy::cast_precision_loss)]
fn linear_fit(x: &[f64], y: &[f64], mu: f64, phi: f64, kappa: f64) -> DirectionFit {
    let n = x.len() as f64;
    let h: Vec<f64> = x.iter().map(|&x| lobes(x, mu, phi, kappa)).collect();
    let h_mean = h.iter().sum::<f64>() / n;
    let y_mean = y.iter().sum::<f64>() / n;
    let shh: f64 = h.iter().map(|v| (v - h_mean).powi(2)).sum();
    let shy: f64 = h.iter().zip(y).map(|(a, b)| (a - h_mean) * (b - y_mean)).sum();
    let scale = if shh > 1e-12 { shy / shh } else { 0.0 };
    let bias = y_mean - scale * h_mean;
    let curve = BiVonMises {
        mu,
        phi,
        kappa,
        scale,
        bias,
    };
    let mse = x.iter().zip(y).map(|(&x, &y)| (curve.eval(x) - y).powi(2)).sum::<f64>() / n;
    DirectionFit { curve, mse }
}

/// Fit a bi-von-Mises curve to mean responses per direction.
///
/// A coarse grid over `(μ, φ, κ)` is refined by coordinate search; `scale`
/// and `bias` are solved in closed form at every point. The result is
/// canonical (`φ ≥ 0.5`).
///
/// # Errors
/// Returns `InvalidInput` for fewer than 3 directions, mismatched lengths
/// or non-finite values
#[allow(clippy::cast_precision_loss)]
pub fn fit_bivonmises(directions: &[f64], responses: &[f64]) -> Result<DirectionFit> {
    if directions.len() != responses.len() {
        return Err(Error::LengthMismatch {
            lengths: vec![directions.len(), responses.len()],
            tolerance: 0,
        });
    }
    if directions.len() < 3 {
        return Err(Error::InvalidInput(format!(
            "bi-von-Mises fit needs 3 directions, got {}",
            directions.len()
        )));
    }
    if directions.iter().chain(responses).any(|v| !v.is_finite()) {
        return Err(Error::InvalidInput("direction responses must be finite".to_string()));
    }

    let mut best: Option<DirectionFit> = None;
    for m in 0..36 {
        let mu = TAU * f64::from(m) / 36.0;
        for p in 0..=10 {
            let phi = f64::from(p) / 10.0;
            for k in 0..12 {
                let fit = linear_fit(directions, responses, mu, phi, 0.1 * 1.5f64.powi(k));
                if best.map_or(true, |b| fit.mse < b.mse) {
                    best = Some(fit);
                }
            }
        }
    }
    let Some(mut fit) = best else {
        return Err(Error::Other("empty fit grid".to_string()));
    };

    let (mut d_mu, mut d_phi, mut d_log_kappa) = (TAU / 72.0, 0.05, 0.2);
    for _ in 0..200 {
        let c = fit.curve;
        let mut candidates = Vec::with_capacity(6);
        for sign in [-1.0, 1.0] {
            candidates.push((c.mu + sign * d_mu, c.phi, c.kappa));
            candidates.push((c.mu, (c.phi + sign * d_phi).clamp(0.0, 1.0), c.kappa));
            candidates.push((c.mu, c.phi, c.kappa * (sign * d_log_kappa).exp()));
        }
        let mut improved = false;
        for (mu, phi, kappa) in candidates {
            let candidate = linear_fit(directions, responses, mu, phi, kappa);
            if candidate.mse < fit.mse {
                fit = candidate;
                improved = true;
            }
        }
        if !improved {
            d_mu /= 2.0;
            d_phi /= 2.0;
            d_log_kappa /= 2.0;
        }
    }
    fit.curve = fit.curve.canonical();
    Ok(fit)
}

/// Global orientation and direction selectivity `(OSI, DSI)`:
/// `|Σ r·e^{2iθ}| / Σ r` and `|Σ r·e^{iθ}| / Σ r`. NaN when `Σ r ≤ 0`.
#[must_use]
pub fn direction_indices(directions: &[f64], responses: &[f64]) -> (f64, f64) {
    let total: f64 = responses.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return (f64::NAN, f64::NAN);
    }
    let resultant = |harmonic: f64| {
        let (re, im) = directions
            .iter()
            .zip(responses)
            .fold((0.0, 0.0), |(re, im), (&theta, &r)| {
                (re + r * (harmonic * theta).cos(), im + r * (harmonic * theta).sin())
            });
        re.hypot(im) / total
    };
    (resultant(2.0), resultant(1.0))
}

/// Direction tuning of every unit under a response request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualDirectionTuning {
    /// Request
    pub key: VisualKey,
    /// Unit ids in readout order
    pub unit_ids: Vec<u32>,
    /// Unique directions in `[0, 2π)`, ascending
    pub directions: Vec<f64>,
    /// `[unit][direction]` mean impulse response
    pub responses: Vec<Vec<f64>>,
    /// Per-unit fit
    pub fits: Vec<DirectionFit>,
    /// Per-unit global OSI
    pub osi: Vec<f64>,
    /// Per-unit global DSI
    pub dsi: Vec<f64>,
}

impl Entity for VisualDirectionTuning {
    const TABLE: &'static str = "visual_direction_tuning";
    type Key = VisualKey;

    fn key(&self) -> VisualKey {
        self.key.clone()
    }
}

/// Merge `(direction, response)` pairs into ascending unique directions
/// with the mean response of each.
#[allow(clippy::cast_precision_loss)]
fn per_direction(mut pairs: Vec<(f64, f64)>) -> (Vec<f64>, Vec<f64>) {
    pairs.retain(|(_, r)| r.is_finite());
    for pair in &mut pairs {
        pair.0 = pair.0.rem_euclid(TAU);
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut directions: Vec<f64> = Vec::new();
    let mut sums: Vec<(f64, usize)> = Vec::new();
    for (direction, response) in pairs {
        match (directions.last(), sums.last_mut()) {
            (Some(&last), Some(sum)) if (direction - last).abs() < 1e-9 => {
                sum.0 += response;
                sum.1 += 1;
            }
            _ => {
                directions.push(direction);
                sums.push((response, 1));
            }
        }
    }
    (directions, sums.into_iter().map(|(s, n)| s / n as f64).collect())
}

impl Computed for VisualDirectionTuning {
    fn key_source(ws: &Workspace) -> Result<Vec<VisualKey>> {
        requests_presenting(ws, |stimulus| matches!(stimulus, Stimulus::Direction(_)))
    }

    fn make(ws: &Workspace, key: &VisualKey) -> Result<Self> {
        let (dataset, responses) = visual_responses(ws, key)?;
        let period = sample_period(ws, &dataset.data_id)?;

        let mut pairs = vec![Vec::new(); dataset.shape.units];
        for (video, trials) in &responses {
            let Some(Stimulus::Direction(events)) = &video.stimulus else {
                continue;
            };
            let (predicted, _) = trials.means();
            for (unit, unit_pairs) in pairs.iter_mut().enumerate() {
                let response = predicted.column(unit).to_vec();
                unit_pairs.extend(events.iter().map(|event| {
                    (
                        event.direction,
                        box_impulse(&response, event.onset, event.offset, period, key.burnin),
                    )
                }));
            }
        }
        if pairs.iter().all(Vec::is_empty) {
            return Err(Error::InvalidInput(format!(
                "video set {} has no direction stimuli",
                key.videoset_id
            )));
        }

        let mut tuning = Self {
            key: key.clone(),
            unit_ids: dataset.unit_ids,
            directions: Vec::new(),
            responses: Vec::with_capacity(pairs.len()),
            fits: Vec::with_capacity(pairs.len()),
            osi: Vec::with_capacity(pairs.len()),
            dsi: Vec::with_capacity(pairs.len()),
        };
        for unit_pairs in pairs {
            let (directions, means) = per_direction(unit_pairs);
            let fit = fit_bivonmises(&directions, &means)?;
            let (osi, dsi) = direction_indices(&directions, &means);
            tuning.directions = directions;
            tuning.responses.push(means);
            tuning.fits.push(fit);
            tuning.osi.push(osi);
            tuning.dsi.push(dsi);
        }
        tracing::info!(model = %key.model, directions = tuning.directions.len(), "direction tuning fitted");
        Ok(tuning)
    }
}
