//! Populate protocol for computed entities
//!
//! For every key of `key_source` not yet in the table: reserve it, call
//! `make` once, commit the row. Missing-upstream keys are left for a later
//! pass; any other error aborts (or is collected with `suppress_errors`).

use super::{render_key, Entity};
use crate::workspace::Workspace;
use crate::{Error, Result};

/// An entity whose rows are derived from upstream tables.
///
/// `make` must be a pure function of the key and upstream rows: it may not
/// depend on wall-clock time or process identity.
pub trait Computed: Entity {
    /// Keys that should exist given the current upstream tables.
    ///
    /// # Errors
    /// Returns error if upstream tables cannot be read
    fn key_source(ws: &Workspace) -> Result<Vec<Self::Key>>;

    /// Compute the row for `key`.
    ///
    /// # Errors
    /// `MissingUpstream` leaves the key for later; anything else aborts the row
    fn make(ws: &Workspace, key: &Self::Key) -> Result<Self>;
}

/// Populate options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulateOptions {
    /// Reserve each key in the job table before `make`
    pub reserve_jobs: bool,
    /// Collect non-missing errors instead of returning the first
    pub suppress_errors: bool,
    /// Stop after this many keys have been made
    pub limit: Option<usize>,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            reserve_jobs: true,
            suppress_errors: false,
            limit: None,
        }
    }
}

impl PopulateOptions {
    /// In-process population without job reservation (no concurrent workers).
    #[must_use]
    pub const fn local() -> Self {
        Self {
            reserve_jobs: false,
            suppress_errors: false,
            limit: None,
        }
    }
}

/// Outcome of a populate call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PopulateReport {
    /// Rows committed
    pub made: usize,
    /// Keys skipped because upstream rows are missing
    pub missing: usize,
    /// Keys skipped because another worker holds them
    pub reserved: usize,
    /// Suppressed errors as `(key, message)`
    pub errors: Vec<(String, String)>,
}

/// Populate every pending key of `C`.
///
/// # Errors
/// Returns the first non-missing `make` error unless `suppress_errors` is set
pub fn populate<C: Computed>(ws: &Workspace, options: PopulateOptions) -> Result<PopulateReport> {
    populate_where::<C, _>(ws, options, |_| true)
}

/// Populate the pending keys of `C` accepted by `restriction`.
///
/// # Errors
/// Returns the first non-missing `make` error unless `suppress_errors` is set
pub fn populate_where<C, F>(
    ws: &Workspace,
    options: PopulateOptions,
    restriction: F,
) -> Result<PopulateReport>
where
    C: Computed,
    F: Fn(&C::Key) -> bool,
{
    let table = ws.table::<C>()?;
    let mut pending: Vec<C::Key> = C::key_source(ws)?
        .into_iter()
        .filter(|key| restriction(key) && !table.contains(key))
        .collect();
    pending.sort();
    pending.dedup();

    let mut report = PopulateReport::default();
    let total = pending.len();

    for (done, key) in pending.into_iter().enumerate() {
        if options.limit.is_some_and(|limit| report.made >= limit) {
            break;
        }
        let rendered = render_key(&key);

        let _guard = if options.reserve_jobs {
            match ws.catalog().jobs().reserve(C::TABLE, &rendered) {
                Ok(guard) => Some(guard),
                Err(e) if e.is_reserved() => {
                    tracing::debug!(table = C::TABLE, key = %rendered, "reserved elsewhere");
                    report.reserved += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        // committed by another worker between key_source and reservation
        if table.contains(&key) {
            continue;
        }

        match C::make(ws, &key) {
            Ok(row) => {
                if row.key() != key {
                    return Err(Error::InvalidInput(format!(
                        "`{}` make returned key {} for {rendered}",
                        C::TABLE,
                        render_key(&row.key())
                    )));
                }
                table.insert(row)?;
                report.made += 1;
                tracing::debug!(table = C::TABLE, key = %rendered, "made");
            }
            Err(e) if e.is_missing() => {
                tracing::debug!(table = C::TABLE, key = %rendered, error = %e, "upstream missing");
                report.missing += 1;
            }
            Err(e) if options.suppress_errors => {
                tracing::warn!(table = C::TABLE, key = %rendered, error = %e, "make failed");
                report.errors.push((rendered, e.to_string()));
            }
            Err(e) => {
                tracing::warn!(table = C::TABLE, key = %rendered, error = %e, "make failed");
                return Err(e);
            }
        }
        crate::context::tick(C::TABLE, done + 1, total);
    }

    if report.made > 0 || report.missing > 0 || !report.errors.is_empty() {
        tracing::info!(
            table = C::TABLE,
            made = report.made,
            missing = report.missing,
            reserved = report.reserved,
            errors = report.errors.len(),
            "populated"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static MAKES: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Square {
        n: u32,
        squared: u64,
    }

    impl Entity for Square {
        const TABLE: &'static str = "square";
        type Key = u32;
        fn key(&self) -> u32 {
            self.n
        }
    }

    impl Computed for Square {
        fn key_source(_ws: &Workspace) -> Result<Vec<u32>> {
            Ok(vec![3, 1, 2, 13, 7])
        }

        fn make(_ws: &Workspace, key: &u32) -> Result<Self> {
            MAKES.fetch_add(1, Ordering::SeqCst);
            match key {
                7 => Err(Error::MissingUpstream("seven not ready".into())),
                13 => Err(Error::InvalidInput("unlucky".into())),
                n => Ok(Self {
                    n: *n,
                    squared: u64::from(*n) * u64::from(*n),
                }),
            }
        }
    }

    #[test]
    fn test_populate_protocol() {
        let ws = Workspace::in_memory();

        // the invalid key aborts without suppress_errors
        let err = populate::<Square>(&ws, PopulateOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let options = PopulateOptions {
            suppress_errors: true,
            ..PopulateOptions::default()
        };
        let report = populate::<Square>(&ws, options).unwrap();
        assert_eq!(report.missing, 1);
        assert_eq!(report.errors.len(), 1);

        let table = ws.table::<Square>().unwrap();
        assert_eq!(table.keys(), vec![1, 2, 3]);
        assert_eq!(table.get(&3).unwrap().squared, 9);
        assert!(ws.catalog().jobs().held().is_empty());

        // already-populated keys are not made again
        let before = MAKES.load(Ordering::SeqCst);
        let report = populate_where::<Square, _>(&ws, options, |k| *k < 5).unwrap();
        assert_eq!(report, PopulateReport::default());
        assert_eq!(MAKES.load(Ordering::SeqCst), before);
    }

    // ========================================================================
    // Concurrent workers
    // ========================================================================

    /// Rows whose `make` takes a while, each type counting its own calls
    macro_rules! slow_entity {
        ($name:ident, $table:literal, $makes:ident) => {
            static $makes: AtomicUsize = AtomicUsize::new(0);

            #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
            struct $name {
                n: u32,
            }

            impl Entity for $name {
                const TABLE: &'static str = $table;
                type Key = u32;
                fn key(&self) -> u32 {
                    self.n
                }
            }

            impl Computed for $name {
                fn key_source(_ws: &Workspace) -> Result<Vec<u32>> {
                    Ok(vec![1, 2])
                }

                fn make(_ws: &Workspace, key: &u32) -> Result<Self> {
                    $makes.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    Ok(Self { n: *key })
                }
            }
        };
    }

    slow_entity!(Slow, "slow", SLOW_MAKES);
    slow_entity!(Contended, "contended", CONTENDED_MAKES);

    #[test]
    fn test_key_held_elsewhere_is_skipped() {
        let ws = Workspace::in_memory();
        let held = ws.catalog().jobs().reserve(Slow::TABLE, &render_key(&1u32)).unwrap();

        let report = populate::<Slow>(&ws, PopulateOptions::default()).unwrap();
        assert_eq!((report.made, report.reserved), (1, 1));
        let table = ws.table::<Slow>().unwrap();
        assert!(!table.contains(&1));
        assert!(table.contains(&2));

        drop(held);
        let report = populate::<Slow>(&ws, PopulateOptions::default()).unwrap();
        assert_eq!((report.made, report.reserved), (1, 0));
        assert_eq!(table.keys(), vec![1, 2]);
        assert_eq!(SLOW_MAKES.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_workers_commit_each_key_once() {
        let ws = Workspace::in_memory();
        let start = std::sync::Barrier::new(2);

        let reports: Vec<PopulateReport> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        populate::<Contended>(&ws, PopulateOptions::default()).unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(reports.iter().map(|r| r.made).sum::<usize>(), 2);
        assert_eq!(CONTENDED_MAKES.load(Ordering::SeqCst), 2);
        assert_eq!(ws.table::<Contended>().unwrap().keys(), vec![1, 2]);
        assert!(ws.catalog().jobs().held().is_empty());
    }
}
