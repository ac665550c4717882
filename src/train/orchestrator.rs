//! Training orchestration
//!
//! One call to [`train`] runs every rank of a model's plan on its own
//! thread. A rank builds its network, applies transfers and the previous
//! cycle, resumes from its checkpoint, then walks the remaining epochs.

use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::distributed::{LocalWorld, ParameterGroups, ProcessGroup, RankLayout, Rendezvous, DEFAULT_TIMEOUT};
use super::loader::LoaderKind;
use super::objective::{NetworkLoss, ObjectiveKind};
use super::optimizer::{EpochRun, OptimizerKind, OptimizerState, SgdClip};
use super::scheduler::{CosineLr, SchedulerKind};
use super::{model_parameters, Instance, Plan};
use crate::catalog::{content_id, Link};
use crate::config::Settings;
use crate::dataset::Dataset;
use crate::device::Device;
use crate::network::{Network, NetworkKind, StateDict};
use crate::progress::{ModelKey, ProgressStore};
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Options of one training invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainOptions {
    /// Device ranks bind to
    pub device: Device,
    /// Stop after this many epochs; the model resumes on the next call
    pub epoch_limit: Option<usize>,
    /// Collective timeout
    pub timeout: Duration,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            epoch_limit: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl TrainOptions {
    /// Options with the device from `settings`
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            device: Device::from_settings(settings),
            ..Self::default()
        }
    }
}

/// Everything the ranks of one invocation share
struct Session<'a> {
    ws: &'a Workspace,
    instance: Instance,
    network_kind: NetworkKind,
    models: Vec<ModelKey>,
    datasets: Vec<Dataset>,
    scheduler: CosineLr,
    optimizer: SgdClip,
    loader: LoaderKind,
    objective: NetworkLoss,
    parallel: usize,
    device: Device,
    resume: Option<usize>,
    epoch_limit: Option<usize>,
}

/// Network of `key` after init, transfers and the previous cycle.
///
/// Returns the network and the frozen name prefixes.
fn build_network(
    ws: &Workspace,
    instance: &Instance,
    network_kind: &NetworkKind,
    dataset: &Dataset,
    key: &ModelKey,
) -> Result<(Box<dyn Network>, Vec<String>)> {
    let mut rng = ChaCha8Rng::seed_from_u64(instance.seed);
    let mut network = network_kind.build(dataset.shape, &mut rng)?;
    let mut frozen = Vec::new();

    for transfer in &instance.transfers {
        let source = Link::<Instance>::get(ws.catalog(), &transfer.instance_id)?;
        let Plan::Foundation { data_ids, .. } = &source.plan else {
            return Err(Error::InvalidInput(format!(
                "transfer source {} is not a foundation instance",
                transfer.instance_id
            )));
        };
        let source_data = data_ids.first().ok_or_else(|| {
            Error::InvalidInput(format!("foundation instance {} has no data ids", transfer.instance_id))
        })?;
        let source_key = ModelKey::new(source_data.clone(), key.network_id.clone(), transfer.instance_id.clone());
        let selected = model_parameters(ws, &source_key)?
            .filter(|name| transfer.modules.iter().any(|m| name.starts_with(m.as_str())));
        if selected.is_empty() {
            return Err(Error::InvalidInput(format!(
                "transfer of {:?} from {source_key} selects no parameters",
                transfer.modules
            )));
        }
        network.parameters_mut().load(&selected)?;
        if transfer.freeze.frozen(instance.cycle) {
            frozen.extend(transfer.modules.iter().cloned());
        }
    }

    if let Some(previous) = instance.previous() {
        let previous_key = ModelKey::new(
            key.data_id.clone(),
            key.network_id.clone(),
            Link::new(previous)?.id,
        );
        let parameters = model_parameters(ws, &previous_key)?;
        network.parameters_mut().load(&parameters)?;
    }
    Ok((network, frozen))
}

/// Parameters a fresh run of `key` starts from.
///
/// # Errors
/// Returns `MissingUpstream` if the dataset, a transfer source or the
/// previous cycle is not populated
pub fn initial_parameters(ws: &Workspace, key: &ModelKey) -> Result<StateDict> {
    let instance = Link::<Instance>::get(ws.catalog(), &key.instance_id)?;
    let network_kind = Link::<NetworkKind>::get(ws.catalog(), &key.network_id)?;
    let dataset = ws.fetch1::<Dataset>(&key.data_id)?;
    let (network, _) = build_network(ws, &instance, &network_kind, &dataset, key)?;
    Ok(network.parameters().clone())
}

fn run_rank(session: &Session<'_>, layout: RankLayout, world: &dyn ProcessGroup, data: &dyn ProcessGroup) -> Result<()> {
    let ws = session.ws;
    let dataset = &session.datasets[layout.data_index()];
    let model = &session.models[layout.data_index()];
    let local_rank = layout.local_rank();
    let store = ProgressStore::new(ws);
    let device = session.device.rank_device(layout.rank);
    let _cuda = session.device.bind(layout.rank);
    tracing::debug!(rank = layout.rank, ?device, "rank bound");

    let (mut network, frozen) = build_network(ws, &session.instance, &session.network_kind, dataset, model)?;
    let (start_epoch, state) = match session.resume {
        Some(epoch) => {
            let (_, state, parameters) = store.load_checkpoint::<OptimizerState>(model, local_rank)?;
            network.parameters_mut().load(&parameters)?;
            (epoch + 1, state)
        }
        None => (0, OptimizerState::default()),
    };

    let groups = ParameterGroups::new(network.parameters(), &frozen);
    let loader = session.loader.build(ws, dataset, session.instance.seed, local_rank)?;
    let total = session.scheduler.epochs();
    let run = EpochRun {
        network: network.as_mut(),
        scheduler: session.scheduler,
        loader: &loader,
        objective: session.objective,
        groups: &groups,
        world,
        data,
    };

    let mut next_epoch = start_epoch;
    for epoch in session
        .optimizer
        .epochs(run, start_epoch, state)
        .take(session.epoch_limit.unwrap_or(usize::MAX))
    {
        let epoch = epoch?;
        if layout.is_main() {
            store.record_info(model, epoch.epoch, epoch.info)?;
        }
        store.save_checkpoint(model, local_rank, epoch.epoch, device, &epoch.checkpoint, &epoch.parameters)?;
        next_epoch = epoch.epoch + 1;
        if layout.rank == 0 {
            crate::context::tick("training", next_epoch, total);
        }
    }

    if next_epoch >= total {
        world.barrier()?;
        if layout.is_main() {
            store.mark_done(model, session.parallel)?;
        }
    }
    Ok(())
}

/// Train `key` and every model sharing its plan.
///
/// A foundation plan trains all of its data ids together; models that are
/// already done are left untouched.
///
/// # Errors
/// Returns `InsufficientDevices` before anything is written when the plan
/// needs more devices than available, `MissingUpstream` for unpopulated
/// upstream rows or a plan already training elsewhere,
/// `InconsistentCheckpoints` when ranks disagree on the stored epoch, and
/// the first rank error otherwise
pub fn train(ws: &Workspace, key: &ModelKey, options: &TrainOptions) -> Result<()> {
    let instance = Link::<Instance>::get(ws.catalog(), &key.instance_id)?;
    let network_kind = Link::<NetworkKind>::get(ws.catalog(), &key.network_id)?;
    let data_ids = instance.data_ids(&key.data_id)?;
    let parallel = instance.plan.parallel();
    if parallel == 0 {
        return Err(Error::InvalidInput("plan needs at least one rank per data id".to_string()));
    }
    let world_size = parallel * data_ids.len();
    options.device.check(world_size)?;

    let store = ProgressStore::new(ws);
    let models: Vec<ModelKey> = data_ids
        .iter()
        .map(|data_id| ModelKey::new(data_id.clone(), key.network_id.clone(), key.instance_id.clone()))
        .collect();
    let done = models
        .iter()
        .map(|model| store.is_done(model))
        .collect::<Result<Vec<_>>>()?;
    if done.iter().all(|&d| d) {
        return Ok(());
    }
    if done.iter().any(|&d| d) {
        return Err(Error::InconsistentCheckpoints(format!(
            "plan of {key} is done for some data ids only"
        )));
    }

    let _job = ws
        .catalog()
        .jobs()
        .reserve("training", &content_id(&models)?)
        .map_err(|e| {
            if e.is_reserved() {
                Error::MissingUpstream(format!("{key} is being trained by another worker"))
            } else {
                e
            }
        })?;

    let datasets = data_ids
        .iter()
        .map(|data_id| ws.fetch1::<Dataset>(data_id))
        .collect::<Result<Vec<_>>>()?;
    let scheduler = Link::<SchedulerKind>::get(ws.catalog(), &instance.scheduler_id)?.build(instance.cycle)?;
    let optimizer = Link::<OptimizerKind>::get(ws.catalog(), &instance.optimizer_id)?.build()?;
    let loader = Link::<LoaderKind>::get(ws.catalog(), &instance.loader_id)?;
    let objective = Link::<ObjectiveKind>::get(ws.catalog(), &instance.objective_id)?.build();

    let epochs = models
        .iter()
        .map(|model| store.resume_epoch(model, parallel))
        .collect::<Result<Vec<_>>>()?;
    let resume = epochs[0];
    if epochs.iter().any(|&e| e != resume) {
        return Err(Error::InconsistentCheckpoints(format!(
            "data ids of {key} stopped at different epochs: {epochs:?}"
        )));
    }

    let rendezvous = Rendezvous::random(&mut rand::thread_rng());
    tracing::info!(
        model = %key,
        world_size,
        parallel,
        cycle = instance.cycle,
        resume = ?resume,
        init_method = %rendezvous.init_method(),
        "training started"
    );

    let world = LocalWorld::with_timeout(world_size, options.timeout)?;
    let data_groups = (0..data_ids.len())
        .map(|_| LocalWorld::with_timeout(parallel, options.timeout))
        .collect::<Result<Vec<_>>>()?;
    let session = Session {
        ws,
        instance,
        network_kind,
        models,
        datasets,
        scheduler,
        optimizer,
        loader,
        objective,
        parallel,
        device: options.device,
        resume,
        epoch_limit: options.epoch_limit,
    };

    let results: Vec<Result<()>> = std::thread::scope(|scope| {
        let handles: Vec<_> = world
            .iter()
            .enumerate()
            .map(|(rank, world_group)| {
                let layout = RankLayout { rank, parallel };
                let data_group = &data_groups[layout.data_index()][layout.local_rank()];
                let session = &session;
                scope.spawn(move || {
                    let result = run_rank(session, layout, world_group, data_group);
                    if let Err(e) = &result {
                        tracing::warn!(rank, error = %e, "training rank failed");
                        world_group.abort(&e.to_string());
                        data_group.abort(&e.to_string());
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::Other("training rank panicked".to_string())))
            })
            .collect()
    });

    let mut errors: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
    // report the root cause rather than a peer's aborted collective
    if let Some(position) = errors.iter().position(|e| !matches!(e, Error::Collective(_))) {
        return Err(errors.swap_remove(position));
    }
    if let Some(error) = errors.pop() {
        return Err(error);
    }
    tracing::info!(model = %key, "training invocation finished");
    Ok(())
}
