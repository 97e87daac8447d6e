//! Outbox storage contracts and the in-memory transactional database.
//!
//! ## Atomicity
//!
//! `append` is only reachable through a transaction handle
//! ([`OutboxAppend`]), so a message can never be written outside the domain
//! change that produced it. [`InMemoryDatabase::transaction`] runs the closure
//! against a private copy of the domain state plus a pending outbox batch and
//! publishes both at a single commit point. A closure that fails, or panics,
//! leaves the database exactly as it was.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument};

use tessera_core::MessageId;

use super::types::{OutboxMessage, OutboxStats, OutboxStatus, OutboxStoreError};

/// Write side of the outbox, available only inside a transaction.
pub trait OutboxAppend {
    fn append(&mut self, message: OutboxMessage) -> Result<(), OutboxStoreError>;
}

/// Processor-facing side of the outbox.
///
/// Time is passed in explicitly so every instance agrees on lease expiry with
/// the clock of the caller.
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` unprocessed messages for `owner`, oldest first.
    ///
    /// Messages held by another owner's live lease are skipped. A claim
    /// increments `attempts` and holds the message until `now + lease`.
    fn claim_unprocessed(
        &self,
        owner: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError>;

    /// Settle a claimed message as delivered. Clears any previous error.
    fn mark_processed(
        &self,
        id: MessageId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// Record a publish failure and release the claim; the message is retried
    /// on the next poll.
    fn mark_errored(&self, id: MessageId, owner: &str, error: &str)
    -> Result<(), OutboxStoreError>;

    /// Delete processed messages older than `cutoff`. Unprocessed messages are
    /// never purged.
    fn purge_processed_older_than(&self, cutoff: DateTime<Utc>)
    -> Result<usize, OutboxStoreError>;

    fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError>;

    fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, OutboxStoreError>;
}

impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    fn claim_unprocessed(
        &self,
        owner: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        (**self).claim_unprocessed(owner, limit, lease, now)
    }

    fn mark_processed(
        &self,
        id: MessageId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        (**self).mark_processed(id, owner, now)
    }

    fn mark_errored(
        &self,
        id: MessageId,
        owner: &str,
        error: &str,
    ) -> Result<(), OutboxStoreError> {
        (**self).mark_errored(id, owner, error)
    }

    fn purge_processed_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        (**self).purge_processed_older_than(cutoff)
    }

    fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        (**self).get(id)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats(now)
    }
}

#[derive(Debug, Default)]
struct Tables<S> {
    domain: S,
    // UUIDv7 keys iterate in creation order.
    outbox: BTreeMap<MessageId, OutboxMessage>,
}

/// Transaction handle passed to [`InMemoryDatabase::transaction`] closures.
#[derive(Debug)]
pub struct Transaction<S> {
    domain: S,
    pending: Vec<OutboxMessage>,
}

impl<S> Transaction<S> {
    /// The transaction's private copy of the domain state.
    pub fn state(&mut self) -> &mut S {
        &mut self.domain
    }

    pub fn pending_messages(&self) -> &[OutboxMessage] {
        &self.pending
    }
}

impl<S> OutboxAppend for Transaction<S> {
    fn append(&mut self, message: OutboxMessage) -> Result<(), OutboxStoreError> {
        if self.pending.iter().any(|m| m.id == message.id) {
            return Err(OutboxStoreError::Duplicate(message.id));
        }
        self.pending.push(message);
        Ok(())
    }
}

/// In-memory database holding domain state `S` next to the outbox table.
///
/// Transactions are serialised; reads see only committed state.
#[derive(Debug, Default)]
pub struct InMemoryDatabase<S> {
    tables: Mutex<Tables<S>>,
}

impl<S> InMemoryDatabase<S>
where
    S: Clone + Send,
{
    pub fn new(initial: S) -> Self {
        Self {
            tables: Mutex::new(Tables {
                domain: initial,
                outbox: BTreeMap::new(),
            }),
        }
    }

    pub fn arc(initial: S) -> Arc<Self> {
        Arc::new(Self::new(initial))
    }

    fn lock(&self) -> MutexGuard<'_, Tables<S>> {
        // Committed state is only ever replaced wholesale, so a panic while
        // holding the lock cannot leave it half-written.
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` atomically. Domain changes and appended messages become visible
    /// together when `f` returns `Ok`, and not at all otherwise.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<S>) -> Result<T, E>,
        E: From<OutboxStoreError>,
    {
        let mut tables = self.lock();
        let mut tx = Transaction {
            domain: tables.domain.clone(),
            pending: Vec::new(),
        };

        let value = f(&mut tx)?;

        if let Some(dup) = tx.pending.iter().find(|m| tables.outbox.contains_key(&m.id)) {
            return Err(OutboxStoreError::Duplicate(dup.id).into());
        }

        let appended = tx.pending.len();
        tables.domain = tx.domain;
        tables.outbox.extend(tx.pending.into_iter().map(|m| (m.id, m)));
        debug!(appended, "transaction committed");
        Ok(value)
    }

    /// Read committed domain state.
    pub fn read<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        f(&self.lock().domain)
    }

    /// All outbox rows, oldest first.
    pub fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.lock().outbox.values().cloned().collect()
    }
}

fn settle<'a>(
    outbox: &'a mut BTreeMap<MessageId, OutboxMessage>,
    id: MessageId,
    owner: &str,
) -> Result<&'a mut OutboxMessage, OutboxStoreError> {
    let message = outbox.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
    if message.is_processed() || message.claimed_by.as_deref() != Some(owner) {
        return Err(OutboxStoreError::ClaimLost {
            id,
            owner: owner.to_string(),
        });
    }
    message.claimed_by = None;
    message.claimed_until = None;
    Ok(message)
}

impl<S> OutboxStore for InMemoryDatabase<S>
where
    S: Clone + Send,
{
    #[instrument(skip_all, fields(owner = %owner, limit = limit))]
    fn claim_unprocessed(
        &self,
        owner: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let mut tables = self.lock();
        let mut batch: Vec<&mut OutboxMessage> = tables
            .outbox
            .values_mut()
            .filter(|m| m.is_claimable(now))
            .collect();
        batch.sort_by_key(|m| (m.created_on_utc, m.id));
        batch.truncate(limit);

        Ok(batch
            .into_iter()
            .map(|m| {
                m.claimed_by = Some(owner.to_string());
                m.claimed_until = Some(now + lease);
                m.attempts += 1;
                m.clone()
            })
            .collect())
    }

    fn mark_processed(
        &self,
        id: MessageId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let mut tables = self.lock();
        let message = settle(&mut tables.outbox, id, owner)?;
        message.processed_on_utc = Some(now);
        message.error = None;
        Ok(())
    }

    fn mark_errored(
        &self,
        id: MessageId,
        owner: &str,
        error: &str,
    ) -> Result<(), OutboxStoreError> {
        let mut tables = self.lock();
        let message = settle(&mut tables.outbox, id, owner)?;
        message.error = Some(error.to_string());
        Ok(())
    }

    fn purge_processed_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        let mut tables = self.lock();
        let before = tables.outbox.len();
        tables
            .outbox
            .retain(|_, m| !m.processed_on_utc.is_some_and(|at| at < cutoff));
        Ok(before - tables.outbox.len())
    }

    fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        Ok(self.lock().outbox.get(&id).cloned())
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, OutboxStoreError> {
        let tables = self.lock();
        let mut stats = OutboxStats::default();
        for message in tables.outbox.values() {
            match message.status() {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Errored => stats.errored += 1,
                OutboxStatus::Processed => stats.processed += 1,
            }
            if !message.is_processed() && !message.is_claimable(now) {
                stats.claimed += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Users {
        confirmed: Vec<String>,
    }

    fn lease() -> Duration {
        Duration::minutes(5)
    }

    fn seed(db: &InMemoryDatabase<Users>, n: usize, now: DateTime<Utc>) -> Vec<MessageId> {
        (0..n)
            .map(|i| {
                db.transaction(|tx| -> Result<_, OutboxStoreError> {
                    let m = OutboxMessage::new(
                        "EmailConfirmation",
                        json!({ "n": i }),
                        now + Duration::seconds(i as i64),
                    );
                    let id = m.id;
                    tx.append(m)?;
                    Ok(id)
                })
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn failed_transaction_commits_nothing() {
        let db = InMemoryDatabase::new(Users::default());
        let now = Utc::now();

        let result: Result<(), OutboxStoreError> = db.transaction(|tx| {
            tx.state().confirmed.push("jane".into());
            tx.append(OutboxMessage::new("EmailConfirmation", json!({}), now))?;
            Err(OutboxStoreError::Storage("crash before commit".into()))
        });

        assert!(result.is_err());
        assert_eq!(db.read(|u| u.confirmed.len()), 0);
        assert!(db.outbox_messages().is_empty());
    }

    #[test]
    fn claims_oldest_first_and_skips_leased() {
        let db = InMemoryDatabase::new(Users::default());
        let now = Utc::now();
        let ids = seed(&db, 3, now);

        let first = db.claim_unprocessed("a", 2, lease(), now).unwrap();
        assert_eq!(first.iter().map(|m| m.id).collect::<Vec<_>>(), ids[..2].to_vec());
        assert!(first.iter().all(|m| m.attempts == 1));

        let second = db.claim_unprocessed("b", 10, lease(), now).unwrap();
        assert_eq!(second.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[2]]);
        assert!(db.claim_unprocessed("c", 10, lease(), now).unwrap().is_empty());
    }

    #[test]
    fn settling_requires_the_current_claim() {
        let db = InMemoryDatabase::new(Users::default());
        let now = Utc::now();
        let id = seed(&db, 1, now)[0];

        db.claim_unprocessed("a", 1, lease(), now).unwrap();
        let later = now + lease();
        db.claim_unprocessed("b", 1, lease(), later).unwrap();

        assert!(matches!(
            db.mark_processed(id, "a", later),
            Err(OutboxStoreError::ClaimLost { .. })
        ));
        db.mark_processed(id, "b", later).unwrap();
        assert!(db.get(id).unwrap().unwrap().is_processed());
    }

    #[test]
    fn purge_keeps_unprocessed_and_recent() {
        let db = InMemoryDatabase::new(Users::default());
        let now = Utc::now();
        let ids = seed(&db, 3, now);

        for id in &ids[..2] {
            db.claim_unprocessed("a", 1, lease(), now).unwrap();
            db.mark_processed(*id, "a", now).unwrap();
        }
        let purged = db
            .purge_processed_older_than(now + Duration::seconds(1))
            .unwrap();

        assert_eq!(purged, 2);
        assert_eq!(db.get(ids[2]).unwrap().map(|m| m.id), Some(ids[2]));
        assert_eq!(
            db.stats(now).unwrap(),
            OutboxStats {
                pending: 1,
                ..Default::default()
            }
        );
    }
}
