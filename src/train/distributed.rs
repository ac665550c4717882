//! Process groups and parameter groups
//!
//! Ranks only share state through collectives on a [`ProcessGroup`]. The
//! in-process [`LocalWorld`] fabric runs each rank on its own thread and
//! meets them at every all-reduce; a failing rank aborts the fabric, and
//! ranks waiting on a collective give up after the timeout.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;

use crate::network::{StateDict, CORE_PREFIX};
use crate::{Error, Result};

/// Default collective timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Message-passing substrate between training ranks.
pub trait ProcessGroup: Send + Sync {
    /// Rank within the group
    fn rank(&self) -> usize;

    /// Group size
    fn size(&self) -> usize;

    /// Replace `buffer` with the element-wise mean over all ranks.
    ///
    /// # Errors
    /// Returns `Collective` if the group was aborted, the buffers differ in
    /// length, or a peer did not arrive in time
    fn all_reduce_mean(&self, buffer: &mut [f32]) -> Result<()>;

    /// Wait for every rank.
    ///
    /// # Errors
    /// Same as [`ProcessGroup::all_reduce_mean`]
    fn barrier(&self) -> Result<()> {
        self.all_reduce_mean(&mut [])
    }

    /// Abort the group; pending and future collectives fail.
    fn abort(&self, reason: &str);
}

/// TCP rendezvous address handed to every rank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    /// Listening port in `[10000, 60000]`
    pub port: u16,
}

impl Rendezvous {
    /// Random port
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            port: rng.gen_range(10_000..=60_000),
        }
    }

    /// `tcp://0.0.0.0:<port>`
    #[must_use]
    pub fn init_method(&self) -> String {
        format!("tcp://0.0.0.0:{}", self.port)
    }
}

/// Position of a rank in a `parallel × data` world
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankLayout {
    /// Global rank
    pub rank: usize,
    /// Ranks per data id
    pub parallel: usize,
}

impl RankLayout {
    /// Index of the rank's data id
    #[must_use]
    pub const fn data_index(&self) -> usize {
        self.rank / self.parallel
    }

    /// Rank within the data group
    #[must_use]
    pub const fn local_rank(&self) -> usize {
        self.rank % self.parallel
    }

    /// First rank of its data group
    #[must_use]
    pub const fn is_main(&self) -> bool {
        self.local_rank() == 0
    }
}

#[derive(Debug)]
struct FabricState {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<f32>>>,
    result: Arc<Vec<f32>>,
    aborted: Option<String>,
}

#[derive(Debug)]
struct Fabric {
    size: usize,
    timeout: Duration,
    state: Mutex<FabricState>,
    turn: Condvar,
}

impl Fabric {
    fn lock(&self) -> Result<MutexGuard<'_, FabricState>> {
        self.state
            .lock()
            .map_err(|_| Error::Collective("fabric lock poisoned".to_string()))
    }
}

/// In-process fabric connecting `size` ranks.
#[derive(Debug)]
pub struct LocalWorld;

impl LocalWorld {
    /// One group handle per rank, with [`DEFAULT_TIMEOUT`].
    ///
    /// # Errors
    /// Returns `InvalidInput` for an empty world
    pub fn spawn(size: usize) -> Result<Vec<LocalGroup>> {
        Self::with_timeout(size, DEFAULT_TIMEOUT)
    }

    /// One group handle per rank.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an empty world
    pub fn with_timeout(size: usize, timeout: Duration) -> Result<Vec<LocalGroup>> {
        if size == 0 {
            return Err(Error::InvalidInput("process group needs at least one rank".to_string()));
        }
        let fabric = Arc::new(Fabric {
            size,
            timeout,
            state: Mutex::new(FabricState {
                generation: 0,
                arrived: 0,
                slots: vec![None; size],
                result: Arc::new(Vec::new()),
                aborted: None,
            }),
            turn: Condvar::new(),
        });
        Ok((0..size)
            .map(|rank| LocalGroup {
                rank,
                fabric: Arc::clone(&fabric),
            })
            .collect())
    }
}

/// One rank's handle on a [`LocalWorld`]
#[derive(Debug)]
pub struct LocalGroup {
    rank: usize,
    fabric: Arc<Fabric>,
}

fn abort_state(state: &mut FabricState, reason: String) -> Error {
    let error = Error::Collective(reason.clone());
    state.aborted.get_or_insert(reason);
    error
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.size
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn all_reduce_mean(&self, buffer: &mut [f32]) -> Result<()> {
        let fabric = &self.fabric;
        let mut state = fabric.lock()?;
        if let Some(reason) = &state.aborted {
            return Err(Error::Collective(format!("group aborted: {reason}")));
        }
        state.slots[self.rank] = Some(buffer.to_vec());
        state.arrived += 1;
        let generation = state.generation;

        if state.arrived == fabric.size {
            let slots: Vec<Vec<f32>> = state.slots.iter_mut().filter_map(Option::take).collect();
            if let Some(bad) = slots.iter().find(|s| s.len() != buffer.len()) {
                let reason = format!("buffer lengths differ: {} vs {}", bad.len(), buffer.len());
                let error = abort_state(&mut state, reason);
                fabric.turn.notify_all();
                return Err(error);
            }
            let mut mean = vec![0.0f64; buffer.len()];
            for slot in &slots {
                for (m, v) in mean.iter_mut().zip(slot) {
                    *m += f64::from(*v);
                }
            }
            let size = fabric.size as f64;
            state.result = Arc::new(mean.into_iter().map(|m| (m / size) as f32).collect());
            state.arrived = 0;
            state.generation += 1;
            fabric.turn.notify_all();
        } else {
            while state.generation == generation && state.aborted.is_none() {
                let (next, wait) = fabric
                    .turn
                    .wait_timeout(state, fabric.timeout)
                    .map_err(|_| Error::Collective("fabric lock poisoned".to_string()))?;
                state = next;
                if wait.timed_out() && state.generation == generation {
                    let reason = format!("rank {} timed out after {:?}", self.rank, fabric.timeout);
                    let error = abort_state(&mut state, reason);
                    fabric.turn.notify_all();
                    return Err(error);
                }
            }
            if state.generation == generation {
                let reason = state.aborted.clone().unwrap_or_default();
                return Err(Error::Collective(format!("group aborted: {reason}")));
            }
        }
        if state.result.len() != buffer.len() {
            return Err(Error::Collective("collective result has the wrong length".to_string()));
        }
        buffer.copy_from_slice(&state.result);
        Ok(())
    }

    fn abort(&self, reason: &str) {
        if let Ok(mut state) = self.fabric.lock() {
            abort_state(&mut state, format!("rank {}: {reason}", self.rank));
            self.fabric.turn.notify_all();
        }
    }
}

/// Trainable parameters split by synchronization scope.
///
/// `core.*` parameters are averaged over the whole world; all others are
/// per-animal and averaged within the data group. Names under a frozen
/// prefix take no part in either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterGroups {
    shared: Vec<String>,
    local: Vec<String>,
}

impl ParameterGroups {
    /// Split `parameters`, excluding names under any of `frozen`.
    #[must_use]
    pub fn new(parameters: &StateDict, frozen: &[String]) -> Self {
        let mut shared = Vec::new();
        let mut local = Vec::new();
        for name in parameters.names() {
            if frozen.iter().any(|prefix| name.starts_with(prefix.as_str())) {
                continue;
            }
            if name.starts_with(CORE_PREFIX) {
                shared.push(name.to_string());
            } else {
                local.push(name.to_string());
            }
        }
        Self { shared, local }
    }

    /// Names averaged over the world
    #[must_use]
    pub fn shared(&self) -> &[String] {
        &self.shared
    }

    /// Names averaged within the data group
    #[must_use]
    pub fn local(&self) -> &[String] {
        &self.local
    }

    /// Every trainable name
    pub fn trainable(&self) -> impl Iterator<Item = &String> {
        self.shared.iter().chain(&self.local)
    }

    /// Average gradients across ranks in place.
    ///
    /// # Errors
    /// Returns `Collective` if either group fails
    pub fn sync(&self, grads: &mut StateDict, world: &dyn ProcessGroup, data: &dyn ProcessGroup) -> Result<()> {
        for (names, group) in [(&self.shared, world), (&self.local, data)] {
            if group.size() > 1 {
                let mut flat = grads.flatten(names)?;
                group.all_reduce_mean(&mut flat)?;
                grads.unflatten(names, &flat)?;
            }
        }
        Ok(())
    }
}
