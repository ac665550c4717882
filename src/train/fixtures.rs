//! Synthetic datasets for training tests

use ndarray::{Array2, Array3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::loader::TrialData;
use crate::blob;
use crate::dataset::{Dataset, DatasetTrial};
use crate::network::{DataShape, Inputs};
use crate::workspace::Workspace;

pub(crate) const SAMPLES: usize = 6;

fn arrays(samples: usize, units: usize, seed: u64) -> (Array3<u8>, Array2<f32>, Array2<f32>, Array2<f32>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let stimuli = Array3::from_shape_fn((samples, 2, 2), |_| rng.gen::<u8>());
    let perspectives = Array2::from_shape_fn((samples, 1), |_| rng.gen_range(-1.0..1.0));
    let modulations = Array2::from_shape_fn((samples, 1), |_| rng.gen_range(-1.0..1.0));
    let units = Array2::from_shape_fn((samples, units), |(s, u)| {
        let pixel = f32::from(stimuli[[s, u % 2, 0]]) / 255.0;
        pixel - 0.5 + 0.25 * perspectives[[s, 0]]
    });
    (stimuli, perspectives, modulations, units)
}

pub(crate) fn trial_data(samples: usize, units: usize, seed: u64) -> TrialData {
    let (stimuli, perspectives, modulations, targets) = arrays(samples, units, seed);
    TrialData {
        trial_id: format!("trial-{seed}"),
        inputs: Inputs::new(&stimuli, perspectives, modulations).unwrap(),
        targets,
    }
}

/// Insert a dataset of `trials` trials, the last `validation` held out.
pub(crate) fn dataset(ws: &Workspace, data_id: &str, trials: usize, validation: usize, units: usize) -> Dataset {
    let seed = data_id.bytes().map(u64::from).sum::<u64>();
    let rows = (0..trials)
        .map(|t| {
            let (stimuli, perspectives, modulations, targets) = arrays(SAMPLES, units, seed * 1000 + t as u64);
            let prefix = format!("datasets/{data_id}/trial-{t:03}");
            blob::put(ws.blobs(), &format!("{prefix}/stimuli.bin"), &stimuli).unwrap();
            blob::put(ws.blobs(), &format!("{prefix}/perspectives.bin"), &perspectives).unwrap();
            blob::put(ws.blobs(), &format!("{prefix}/modulations.bin"), &modulations).unwrap();
            blob::put(ws.blobs(), &format!("{prefix}/units.bin"), &targets).unwrap();
            DatasetTrial {
                trial_id: format!("trial-{t:03}"),
                training: t < trials - validation,
                samples: SAMPLES,
                stimuli: format!("{prefix}/stimuli.bin"),
                perspectives: format!("{prefix}/perspectives.bin"),
                modulations: format!("{prefix}/modulations.bin"),
                units: format!("{prefix}/units.bin"),
            }
        })
        .collect();
    let dataset = Dataset {
        data_id: data_id.to_string(),
        shape: DataShape {
            height: 2,
            width: 2,
            perspectives: 1,
            modulations: 1,
            units,
        },
        unit_ids: (0..units as u32).collect(),
        trials: rows,
    };
    ws.catalog().insert(dataset.clone()).unwrap();
    dataset
}
