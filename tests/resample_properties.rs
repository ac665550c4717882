//! Property-based tests for resampling and standardization
//!
//! - Grid arithmetic (`samples`, `target_index`, `flip_index`)
//! - Length reconciliation (`truncate`)
//! - Filter and transform invariants (Hamming, Affine, summaries)
//! - Run with ProptestConfig::with_cases(100)

use foundation::params::SummaryKind;
use foundation::resample::{flip_index, samples, target_index, truncate, Hamming, Resampler};
use foundation::standardize::{Affine, Standardize};
use foundation::Error;
use ndarray::Array2;
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

/// Strictly increasing flip times starting at 0
fn arb_flip_times() -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(0.01f64..0.5, 0..40).prop_map(|steps| {
        let mut times = vec![0.0];
        for step in steps {
            let last = times[times.len() - 1];
            times.push(last + step);
        }
        times
    })
}

fn arb_period() -> impl Strategy<Value = f64> {
    prop_oneof![Just(0.1), Just(0.25), Just(1.0 / 30.0), 0.02f64..0.5]
}

// ============================================================================
// Grid arithmetic
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A single-point interval has one sample; longer intervals never have fewer
    #[test]
    fn prop_samples_monotone_in_end(start in -10.0f64..10.0, a in 0.0f64..5.0, b in 0.0f64..5.0, period in arb_period()) {
        let (short, long) = if a <= b { (a, b) } else { (b, a) };
        prop_assert_eq!(samples(start, start, period).unwrap(), 1);
        prop_assert!(samples(start, start + short, period).unwrap() <= samples(start, start + long, period).unwrap());
    }

    /// The last grid point never passes the interval end
    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn prop_samples_stay_inside(length in 0.0f64..20.0, period in arb_period()) {
        let n = samples(0.0, length, period).unwrap();
        prop_assert!((n - 1) as f64 * period <= length + 1e-9);
        prop_assert!(n as f64 * period > length - 1e-9);
    }

    /// flip_index covers every target sample, is non-decreasing and ends on the last flip
    #[test]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn prop_flip_index_shape(times in arb_flip_times(), period in arb_period()) {
        let index = flip_index(&times, period).unwrap();
        let last = target_index(times[times.len() - 1], period);
        prop_assert_eq!(index.len(), last as usize + 1);
        prop_assert!(index.windows(2).all(|w| w[0] <= w[1]));
        prop_assert_eq!(index[index.len() - 1], times.len() - 1);
    }

    /// Every sample shows a flip whose target index is at or before it
    #[test]
    #[allow(clippy::cast_possible_wrap)]
    fn prop_flip_index_never_shows_future_flips(times in arb_flip_times(), period in arb_period()) {
        let index = flip_index(&times, period).unwrap();
        for (sample, &flip) in index.iter().enumerate() {
            prop_assert!(target_index(times[flip], period) <= sample as i64);
        }
    }
}

// ============================================================================
// Length reconciliation
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Within tolerance, every array is cut to the shortest; beyond it, nothing is cut
    #[test]
    fn prop_truncate_to_shortest(lengths in proptest::collection::vec(0usize..20, 1..6), tolerance in 0usize..4) {
        let arrays: Vec<Vec<u8>> = lengths.iter().map(|&n| vec![0; n]).collect();
        let slices: Vec<&[u8]> = arrays.iter().map(Vec::as_slice).collect();
        let min = *lengths.iter().min().unwrap();
        let max = *lengths.iter().max().unwrap();

        match truncate(&slices, tolerance) {
            Ok(out) => {
                prop_assert!(max - min <= tolerance);
                prop_assert!(out.iter().all(|a| a.len() == min));
            }
            Err(Error::LengthMismatch { tolerance: t, .. }) => {
                prop_assert!(max - min > tolerance);
                prop_assert_eq!(t, tolerance);
            }
            Err(e) => prop_assert!(false, "unexpected error {e}"),
        }
    }
}

// ============================================================================
// Filter and transform invariants
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A constant signal resamples to the same constant inside its support
    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn prop_hamming_preserves_constants(value in -100.0f64..100.0, n in 2usize..50, period in arb_period()) {
        let times: Vec<f64> = (0..n).map(|i| i as f64 * 0.05).collect();
        let values = vec![value; n];
        let end = times[n - 1];
        let resampler = Hamming::new(&times, &values, period, 0.0).unwrap();
        let out = resampler.resample(0.0, end).unwrap();
        prop_assert_eq!(out.len(), samples(0.0, end, period).unwrap());
        for v in out.iter().filter(|v| v.is_finite()) {
            prop_assert!((f64::from(*v) - value).abs() < 1e-3 * value.abs().max(1.0));
        }
        prop_assert!(out[0].is_finite());
    }

    /// inverse(forward(x)) recovers x
    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn prop_affine_round_trip(
        columns in proptest::collection::vec((-50.0f64..50.0, 0.1f64..10.0, any::<bool>()), 1..5),
        rows in 1usize..8,
        fill in -100.0f32..100.0,
    ) {
        let shift: Vec<f64> = columns.iter().map(|c| c.0).collect();
        let scale: Vec<f64> = columns.iter().map(|c| c.1).collect();
        let homogeneous: Vec<bool> = columns.iter().map(|c| c.2).collect();
        let affine = Affine::new(&shift, &scale, &homogeneous, 1e-3).unwrap();

        let x = Array2::from_shape_fn((rows, columns.len()), |(r, c)| fill + (r * 3 + c) as f32);
        let back = affine.inverse(affine.forward(x.view()).unwrap().view()).unwrap();
        for (a, b) in x.iter().zip(back.iter()) {
            prop_assert!((a - b).abs() <= 1e-3 * a.abs().max(1.0));
        }
    }

    /// Summaries ignore non-finite values and are bounded by min and max
    #[test]
    fn prop_summaries_bounded(values in proptest::collection::vec(-1000.0f32..1000.0, 1..64), nans in 0usize..4) {
        let mut with_nans = values.clone();
        with_nans.extend(std::iter::repeat(f32::NAN).take(nans));
        let min = SummaryKind::Min.reduce(&with_nans).unwrap();
        let max = SummaryKind::Max.reduce(&with_nans).unwrap();
        let mean = SummaryKind::Mean.reduce(&with_nans).unwrap();
        prop_assert!(min <= mean + 1e-2 && mean <= max + 1e-2);
        prop_assert!(SummaryKind::Std.reduce(&with_nans).unwrap() >= 0.0);
        prop_assert!((SummaryKind::Mean.reduce(&values).unwrap() - mean).abs() < 1e-2);
    }
}

// ============================================================================
// Worked examples
// ============================================================================

#[test]
fn test_affine_example() {
    let affine = Affine::new(&[0.0, 20.0], &[1.0, 2.0], &[false, false], 1e-8).unwrap();
    let x = ndarray::array![[0.0f32, 20.0], [1.0, 22.0]];
    let y = affine.forward(x.view()).unwrap();
    assert_eq!(y, ndarray::array![[0.0f32, 0.0], [1.0, 1.0]]);
    assert_eq!(affine.inverse(y.view()).unwrap(), x);
}

#[test]
fn test_homogeneous_channel_is_only_scaled() {
    let affine = Affine::new(&[5.0], &[2.0], &[true], 1e-8).unwrap();
    let y = affine.forward(ndarray::array![[4.0f32], [8.0]].view()).unwrap();
    assert_eq!(y, ndarray::array![[2.0f32], [4.0]]);
}
