//! Training orchestration tests
//!
//! Resumption, cycles, foundation plans with transfer, and the failure
//! modes that must leave the progress tables untouched.

use foundation::blob;
use foundation::catalog::{populate, Link, PopulateOptions};
use foundation::dataset::{Dataset, DatasetTrial};
use foundation::device::Device;
use foundation::network::{DataShape, NetworkKind, StateDict, CORE_PREFIX};
use foundation::progress::{ModelCheckpoint, ModelInfo, ModelKey, ProgressStore};
use foundation::train::{
    initial_parameters, model_parameters, train, FreezePolicy, Instance, LoaderKind, Model, ObjectiveKind,
    OptimizerKind, Plan, SchedulerKind, TrainOptions, Transfer,
};
use foundation::workspace::Workspace;
use foundation::Error;
use ndarray::{Array2, Array3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

// ============================================================================
// Fixtures
// ============================================================================

const SAMPLES: usize = 6;
const EPOCHS: usize = 3;

/// Insert a 2x2 dataset of `trials` random trials, the last one held out.
fn dataset(ws: &Workspace, data_id: &str, trials: usize, seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let rows = (0..trials)
        .map(|t| {
            let stimuli = Array3::from_shape_fn((SAMPLES, 2, 2), |_| rng.gen::<u8>());
            let perspectives = Array2::from_shape_fn((SAMPLES, 1), |_| rng.gen_range(-1.0f32..1.0));
            let modulations = Array2::from_shape_fn((SAMPLES, 1), |_| rng.gen_range(-1.0f32..1.0));
            let units = Array2::from_shape_fn((SAMPLES, 2), |(s, u)| {
                f32::from(stimuli[[s, u, 0]]) / 255.0 - 0.5 + 0.25 * perspectives[[s, 0]]
            });

            let prefix = format!("datasets/{data_id}/trial-{t}");
            let key = |column: &str| format!("{prefix}/{column}.bin");
            blob::put(ws.blobs(), &key("stimuli"), &stimuli).unwrap();
            blob::put(ws.blobs(), &key("perspectives"), &perspectives).unwrap();
            blob::put(ws.blobs(), &key("modulations"), &modulations).unwrap();
            blob::put(ws.blobs(), &key("units"), &units).unwrap();
            DatasetTrial {
                trial_id: format!("trial-{t}"),
                training: t + 1 < trials,
                samples: SAMPLES,
                stimuli: key("stimuli"),
                perspectives: key("perspectives"),
                modulations: key("modulations"),
                units: key("units"),
            }
        })
        .collect();
    ws.catalog()
        .insert(Dataset {
            data_id: data_id.to_string(),
            shape: DataShape {
                height: 2,
                width: 2,
                perspectives: 1,
                modulations: 1,
                units: 2,
            },
            unit_ids: vec![1, 2],
            trials: rows,
        })
        .unwrap();
}

fn network(ws: &Workspace) -> String {
    Link::fill(ws.catalog(), NetworkKind::Linear { hidden: 3, streams: 1, init_scale: 1.0 }).unwrap()
}

fn instance(ws: &Workspace, plan: Plan, transfers: Vec<Transfer>) -> Instance {
    let catalog = ws.catalog();
    Instance {
        plan,
        cycle: 0,
        seed: 5,
        transfers,
        scheduler_id: Link::fill(
            catalog,
            SchedulerKind::CosineLr { lr: 0.05, cycle_size: EPOCHS, cycles: 1, burnin_epochs: 0, burnin_cycles: 0 },
        )
        .unwrap(),
        optimizer_id: Link::fill(
            catalog,
            OptimizerKind::SgdClip { momentum: 0.9, weight_decay: 1e-4, clip: 1.0, eps: 1e-3 },
        )
        .unwrap(),
        loader_id: Link::fill(catalog, LoaderKind::RandomBatches { batch_size: 2, batches: 3 }).unwrap(),
        objective_id: Link::fill(catalog, ObjectiveKind::NetworkLoss { sample_stream: false, burnin_frames: 1 })
            .unwrap(),
    }
}

fn individual(ws: &Workspace, data_id: &str, parallel: usize) -> ModelKey {
    let network_id = network(ws);
    let instance_id = Link::fill(ws.catalog(), instance(ws, Plan::Individual { parallel }, vec![])).unwrap();
    ModelKey::new(data_id, network_id, instance_id)
}

fn core(parameters: &StateDict) -> StateDict {
    parameters.filter(|name| name.starts_with(CORE_PREFIX))
}

// ============================================================================
// Resumption
// ============================================================================

#[test]
fn test_resumed_run_matches_uninterrupted_run() {
    let uninterrupted = Workspace::in_memory();
    dataset(&uninterrupted, "d0", 5, 1);
    let key = individual(&uninterrupted, "d0", 1);
    train(&uninterrupted, &key, &TrainOptions::default()).unwrap();

    let resumed = Workspace::in_memory();
    dataset(&resumed, "d0", 5, 1);
    let resumed_key = individual(&resumed, "d0", 1);
    assert_eq!(resumed_key, key);

    let interrupted = TrainOptions {
        epoch_limit: Some(1),
        ..TrainOptions::default()
    };
    train(&resumed, &key, &interrupted).unwrap();
    let store = ProgressStore::new(&resumed);
    assert!(!store.is_done(&key).unwrap());
    assert_eq!(store.resume_epoch(&key, 1).unwrap(), Some(0));

    train(&resumed, &key, &TrainOptions::default()).unwrap();
    assert!(store.is_done(&key).unwrap());
    assert_eq!(
        store.final_parameters(&key).unwrap(),
        ProgressStore::new(&uninterrupted).final_parameters(&key).unwrap()
    );
    assert_eq!(resumed.table::<ModelInfo>().unwrap().len(), EPOCHS);
}

#[test]
fn test_only_latest_checkpoint_is_kept() {
    let ws = Workspace::in_memory();
    dataset(&ws, "d0", 4, 2);
    let key = individual(&ws, "d0", 2);
    train(&ws, &key, &TrainOptions::default()).unwrap();

    let checkpoints = ws.table::<ModelCheckpoint>().unwrap().rows();
    assert_eq!(checkpoints.len(), 2);
    assert!(checkpoints.iter().all(|row| row.epoch() == EPOCHS - 1));
}

#[test]
fn test_missing_rank_checkpoint_is_inconsistent() {
    let ws = Workspace::in_memory();
    dataset(&ws, "d0", 4, 3);
    let key = individual(&ws, "d0", 2);
    let options = TrainOptions {
        epoch_limit: Some(1),
        ..TrainOptions::default()
    };
    train(&ws, &key, &options).unwrap();
    ws.table::<ModelCheckpoint>().unwrap().remove(&(key.clone(), 1));

    assert!(matches!(
        train(&ws, &key, &TrainOptions::default()),
        Err(Error::InconsistentCheckpoints(_))
    ));
    assert!(!ProgressStore::new(&ws).is_done(&key).unwrap());
}

// ============================================================================
// Cycles and transfer
// ============================================================================

#[test]
fn test_next_cycle_starts_from_previous_model() {
    let ws = Workspace::in_memory();
    dataset(&ws, "d0", 4, 4);
    let key = individual(&ws, "d0", 1);
    train(&ws, &key, &TrainOptions::default()).unwrap();
    populate::<Model>(&ws, PopulateOptions::local()).unwrap();

    let first = Link::<Instance>::get(ws.catalog(), &key.instance_id).unwrap();
    let next_id = Link::fill(ws.catalog(), first.next()).unwrap();
    assert_ne!(next_id, key.instance_id);
    let next = ModelKey::new("d0", key.network_id.clone(), next_id);

    assert_eq!(initial_parameters(&ws, &next).unwrap(), model_parameters(&ws, &key).unwrap());
}

#[test]
fn test_next_cycle_needs_previous_model() {
    let ws = Workspace::in_memory();
    dataset(&ws, "d0", 4, 4);
    let key = individual(&ws, "d0", 1);
    let first = Link::<Instance>::get(ws.catalog(), &key.instance_id).unwrap();
    let next_id = Link::fill(ws.catalog(), first.next()).unwrap();
    let next = ModelKey::new("d0", key.network_id, next_id);
    assert!(train(&ws, &next, &TrainOptions::default()).unwrap_err().is_missing());
}

#[test]
fn test_foundation_core_transfers_frozen() {
    let ws = Workspace::in_memory();
    for (i, data_id) in ["d0", "d1", "d2"].iter().enumerate() {
        dataset(&ws, data_id, 4, 10 + i as u64);
    }
    let network_id = network(&ws);
    let plan = Plan::Foundation {
        parallel: 1,
        data_ids: vec!["d0".into(), "d1".into()],
    };
    let foundation_id = Link::fill(ws.catalog(), instance(&ws, plan, vec![])).unwrap();
    let d0 = ModelKey::new("d0", network_id.clone(), foundation_id.clone());
    let d1 = ModelKey::new("d1", network_id.clone(), foundation_id.clone());

    // training one member trains the whole plan
    train(&ws, &d1, &TrainOptions::default()).unwrap();
    let store = ProgressStore::new(&ws);
    assert!(store.is_done(&d0).unwrap() && store.is_done(&d1).unwrap());
    populate::<Model>(&ws, PopulateOptions::local()).unwrap();

    let core0 = core(&model_parameters(&ws, &d0).unwrap());
    let core1 = core(&model_parameters(&ws, &d1).unwrap());
    for ((name, a), (_, b)) in core0.iter().zip(core1.iter()) {
        let diff = a.data.iter().zip(&b.data).map(|(x, y)| (x - y).abs()).fold(0.0f32, f32::max);
        assert!(diff < 1e-6, "{name} differs by {diff}");
    }
    assert_ne!(
        model_parameters(&ws, &d0).unwrap().get("readout.weight"),
        model_parameters(&ws, &d1).unwrap().get("readout.weight")
    );

    let transfer = Transfer {
        instance_id: foundation_id,
        modules: vec![CORE_PREFIX.to_string()],
        freeze: FreezePolicy::AllCycles,
    };
    let transferred_id = Link::fill(
        ws.catalog(),
        instance(&ws, Plan::Individual { parallel: 1 }, vec![transfer]),
    )
    .unwrap();
    let d2 = ModelKey::new("d2", network_id, transferred_id);
    assert_eq!(core(&initial_parameters(&ws, &d2).unwrap()), core0);

    train(&ws, &d2, &TrainOptions::default()).unwrap();
    let final_parameters = store.final_parameters(&d2).unwrap();
    assert_eq!(core(&final_parameters), core0);
}

// ============================================================================
// Failure modes
// ============================================================================

#[test]
fn test_foundation_plan_needs_a_device_per_rank() {
    let ws = Workspace::in_memory();
    dataset(&ws, "d0", 4, 20);
    dataset(&ws, "d1", 4, 21);
    let plan = Plan::Foundation {
        parallel: 1,
        data_ids: vec!["d0".into(), "d1".into()],
    };
    let key = ModelKey::new(
        "d0",
        network(&ws),
        Link::fill(ws.catalog(), instance(&ws, plan, vec![])).unwrap(),
    );
    let options = TrainOptions {
        device: Device::Cuda { first: 0, available: 1 },
        ..TrainOptions::default()
    };

    assert!(matches!(
        train(&ws, &key, &options),
        Err(Error::InsufficientDevices { required: 2, available: 1 })
    ));
    assert!(ws.table::<ModelCheckpoint>().unwrap().is_empty());
    assert!(ws.table::<ModelInfo>().unwrap().is_empty());
}

#[test]
fn test_data_id_outside_foundation_plan_is_rejected() {
    let ws = Workspace::in_memory();
    dataset(&ws, "d0", 4, 30);
    let plan = Plan::Foundation {
        parallel: 1,
        data_ids: vec!["d0".into()],
    };
    let key = ModelKey::new(
        "other",
        network(&ws),
        Link::fill(ws.catalog(), instance(&ws, plan, vec![])).unwrap(),
    );
    assert!(matches!(train(&ws, &key, &TrainOptions::default()), Err(Error::Restriction(_))));
}
