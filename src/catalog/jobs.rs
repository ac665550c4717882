//! Job reservation table
//!
//! A reservation is held for the duration of one `make(key)` call and
//! released when its guard drops, whether `make` succeeded or failed.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::{Error, Result};

/// Metadata of a held reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    /// Table being populated
    pub table: String,
    /// Rendered key
    pub key: String,
    /// Holder identity (process and thread), metadata only
    pub worker: String,
    /// Reservation time, metadata only
    pub reserved_at: DateTime<Utc>,
}

/// Reservations currently held, keyed by `table/key`.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: DashMap<String, JobInfo>,
}

impl JobTable {
    /// Reserve `(table, key)`.
    ///
    /// # Errors
    /// Returns `Reserved` if another worker holds the key
    pub fn reserve(&self, table: &str, key: &str) -> Result<JobGuard<'_>> {
        let id = format!("{table}/{key}");
        match self.jobs.entry(id.clone()) {
            Entry::Occupied(_) => Err(Error::Reserved {
                table: table.to_string(),
                key: key.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(JobInfo {
                    table: table.to_string(),
                    key: key.to_string(),
                    worker: format!(
                        "{}:{:?}",
                        std::process::id(),
                        std::thread::current().id()
                    ),
                    reserved_at: Utc::now(),
                });
                Ok(JobGuard { jobs: self, id })
            }
        }
    }

    /// Whether `(table, key)` is currently reserved.
    #[must_use]
    pub fn is_reserved(&self, table: &str, key: &str) -> bool {
        self.jobs.contains_key(&format!("{table}/{key}"))
    }

    /// Held reservations.
    #[must_use]
    pub fn held(&self) -> Vec<JobInfo> {
        self.jobs.iter().map(|job| job.value().clone()).collect()
    }
}

/// Releases its reservation on drop.
#[derive(Debug)]
#[must_use = "dropping the guard releases the reservation"]
pub struct JobGuard<'a> {
    jobs: &'a JobTable,
    id: String,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.jobs.jobs.remove(&self.id);
    }
}
