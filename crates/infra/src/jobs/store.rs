//! Recurring job storage.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use tessera_core::DomainError;

use super::types::{JobQueue, JobRun, RecurringJobDefinition};

/// Job store abstraction.
///
/// Several scheduler instances may share one store. [`try_advance`] is the
/// only coordination between them: whoever moves `next_run_at` forward runs
/// the job.
///
/// [`try_advance`]: RecurringJobStore::try_advance
pub trait RecurringJobStore: Send + Sync {
    /// Insert or replace a definition.
    fn upsert(&self, job: RecurringJobDefinition) -> Result<(), JobStoreError>;

    /// Returns whether a job was removed.
    fn remove(&self, id: &str) -> Result<bool, JobStoreError>;

    fn get(&self, id: &str) -> Result<Option<RecurringJobDefinition>, JobStoreError>;

    /// All jobs ordered by id.
    fn list(&self) -> Result<Vec<RecurringJobDefinition>, JobStoreError>;

    /// Jobs on `queue` whose next run is at or before `now`, earliest first.
    fn due(
        &self,
        queue: JobQueue,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringJobDefinition>, JobStoreError>;

    /// Set `next_run_at` to `next` only if it still equals `expected`.
    fn try_advance(
        &self,
        id: &str,
        expected: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, JobStoreError>;

    fn record_run(&self, id: &str, run: JobRun) -> Result<(), JobStoreError>;
}

impl<S> RecurringJobStore for Arc<S>
where
    S: RecurringJobStore + ?Sized,
{
    fn upsert(&self, job: RecurringJobDefinition) -> Result<(), JobStoreError> {
        (**self).upsert(job)
    }

    fn remove(&self, id: &str) -> Result<bool, JobStoreError> {
        (**self).remove(id)
    }

    fn get(&self, id: &str) -> Result<Option<RecurringJobDefinition>, JobStoreError> {
        (**self).get(id)
    }

    fn list(&self) -> Result<Vec<RecurringJobDefinition>, JobStoreError> {
        (**self).list()
    }

    fn due(
        &self,
        queue: JobQueue,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringJobDefinition>, JobStoreError> {
        (**self).due(queue, now)
    }

    fn try_advance(
        &self,
        id: &str,
        expected: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, JobStoreError> {
        (**self).try_advance(id, expected, next)
    }

    fn record_run(&self, id: &str, run: JobRun) -> Result<(), JobStoreError> {
        (**self).record_run(id, run)
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("recurring job not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for DomainError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(_) => DomainError::NotFound,
            JobStoreError::Storage(msg) => DomainError::Fatal(msg),
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRecurringJobStore {
    jobs: RwLock<BTreeMap<String, RecurringJobDefinition>>,
}

impl InMemoryRecurringJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, RecurringJobDefinition>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, RecurringJobDefinition>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job table lock poisoned".into()))
    }
}

impl RecurringJobStore for InMemoryRecurringJobStore {
    fn upsert(&self, job: RecurringJobDefinition) -> Result<(), JobStoreError> {
        self.write()?.insert(job.id.clone(), job);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool, JobStoreError> {
        Ok(self.write()?.remove(id).is_some())
    }

    fn get(&self, id: &str) -> Result<Option<RecurringJobDefinition>, JobStoreError> {
        Ok(self.read()?.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<RecurringJobDefinition>, JobStoreError> {
        Ok(self.read()?.values().cloned().collect())
    }

    fn due(
        &self,
        queue: JobQueue,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringJobDefinition>, JobStoreError> {
        let mut due: Vec<_> = self
            .read()?
            .values()
            .filter(|job| job.queue == queue && job.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.id.cmp(&b.id)));
        Ok(due)
    }

    fn try_advance(
        &self,
        id: &str,
        expected: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        if job.next_run_at != expected {
            return Ok(false);
        }
        job.next_run_at = next;
        Ok(true)
    }

    fn record_run(&self, id: &str, run: JobRun) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        job.last_run = Some(run);
        Ok(())
    }
}
