//! Scoped worker flags
//!
//! Two pieces of ambient state exist: the CUDA device binding and the
//! progress-tick switch. The device binding belongs to the calling thread,
//! since every training rank runs on a thread of its own and binds exactly
//! one device; the tick switch is process-wide. Both are only changed
//! through guards that restore the previous value when dropped, on every
//! exit path.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

const CUDA_DISABLED: i64 = -1;

thread_local! {
    static CUDA_DEVICE: Cell<i64> = const { Cell::new(CUDA_DISABLED) };
}
static TQDM: AtomicBool = AtomicBool::new(true);

/// CUDA device bound on the calling thread, if any.
#[must_use]
pub fn cuda_device() -> Option<usize> {
    usize::try_from(CUDA_DEVICE.with(Cell::get)).ok()
}

/// Whether progress ticks are enabled.
#[must_use]
pub fn tqdm_enabled() -> bool {
    TQDM.load(Ordering::SeqCst)
}

/// Guard returned by [`use_cuda`]; restores the prior binding on drop.
#[derive(Debug)]
#[must_use = "the device binding is released when the guard is dropped"]
pub struct CudaGuard {
    previous: i64,
    // restores a thread-local binding, so it must stay on its thread
    _thread: PhantomData<*const ()>,
}

/// Bind the calling thread to `device` (or disable CUDA with `None`) for the guard's lifetime.
pub fn use_cuda(device: Option<usize>) -> CudaGuard {
    let value = device.map_or(CUDA_DISABLED, |d| i64::try_from(d).unwrap_or(i64::MAX));
    let previous = CUDA_DEVICE.with(|cell| cell.replace(value));
    tracing::debug!(?device, "cuda device bound");
    CudaGuard {
        previous,
        _thread: PhantomData,
    }
}

impl Drop for CudaGuard {
    fn drop(&mut self) {
        CUDA_DEVICE.with(|cell| cell.set(self.previous));
    }
}

/// Guard returned by [`disable_tqdm`] and [`set_tqdm`].
#[derive(Debug)]
#[must_use = "the flag is restored when the guard is dropped"]
pub struct TqdmGuard {
    previous: bool,
}

/// Silence progress ticks for the guard's lifetime.
pub fn disable_tqdm() -> TqdmGuard {
    set_tqdm(false)
}

/// Set the progress-tick switch for the guard's lifetime.
pub fn set_tqdm(enabled: bool) -> TqdmGuard {
    TqdmGuard {
        previous: TQDM.swap(enabled, Ordering::SeqCst),
    }
}

impl Drop for TqdmGuard {
    fn drop(&mut self) {
        TQDM.store(self.previous, Ordering::SeqCst);
    }
}

/// Emit a progress tick at debug level when ticks are enabled.
pub fn tick(task: &str, done: usize, total: usize) {
    if tqdm_enabled() {
        tracing::debug!(task, done, total, "progress");
    }
}
