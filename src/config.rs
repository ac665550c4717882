//! Runtime settings read from `FOUNDATION_*` environment variables

use std::path::PathBuf;

use crate::{Error, Result};

/// Default blob-store root
pub const DEFAULT_ROOT: &str = "/mnt/scratch09/foundation/";

/// Process settings.
///
/// | variable          | meaning                                   | default |
/// |-------------------|-------------------------------------------|---------|
/// | `FOUNDATION_CUDA` | device id, `-1` disables CUDA             | `-1`    |
/// | `FOUNDATION_MP`   | worker count for trace resampling         | `1`     |
/// | `FOUNDATION_TQDM` | `1` emits progress ticks, `0` silences    | `1`     |
/// | `FOUNDATION_ROOT` | blob-store root directory                 | [`DEFAULT_ROOT`] |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// CUDA device, `None` when disabled
    pub cuda: Option<usize>,
    /// Trace resampling workers
    pub workers: usize,
    /// Progress ticks enabled
    pub tqdm: bool,
    /// Blob-store root
    pub root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cuda: None,
            workers: 1,
            tqdm: true,
            root: PathBuf::from(DEFAULT_ROOT),
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is set to an unparseable value
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through an arbitrary lookup (used by tests).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is set to an unparseable value
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(raw) = lookup("FOUNDATION_CUDA") {
            let device: i64 = raw.trim().parse().map_err(|_| {
                Error::InvalidInput(format!("FOUNDATION_CUDA must be an integer, got {raw:?}"))
            })?;
            settings.cuda = match device {
                -1 => None,
                d if d >= 0 => Some(usize::try_from(d).map_err(|_| {
                    Error::InvalidInput(format!("FOUNDATION_CUDA out of range: {d}"))
                })?),
                d => {
                    return Err(Error::InvalidInput(format!(
                        "FOUNDATION_CUDA must be -1 or a device id, got {d}"
                    )))
                }
            };
        }

        if let Some(raw) = lookup("FOUNDATION_MP") {
            let workers: usize = raw.trim().parse().map_err(|_| {
                Error::InvalidInput(format!("FOUNDATION_MP must be a positive integer, got {raw:?}"))
            })?;
            if workers == 0 {
                return Err(Error::InvalidInput("FOUNDATION_MP must be >= 1".to_string()));
            }
            settings.workers = workers;
        }

        if let Some(raw) = lookup("FOUNDATION_TQDM") {
            settings.tqdm = match raw.trim() {
                "1" => true,
                "0" => false,
                other => {
                    return Err(Error::InvalidInput(format!(
                        "FOUNDATION_TQDM must be 1 or 0, got {other:?}"
                    )))
                }
            };
        }

        if let Some(raw) = lookup("FOUNDATION_ROOT") {
            settings.root = PathBuf::from(raw);
        }

        Ok(settings)
    }
}
