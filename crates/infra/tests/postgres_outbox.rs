//! Postgres outbox against a live database.
//!
//! Runs only when `DATABASE_URL` is set. Each test works in its own schema so
//! claims never see another test's rows.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use uuid::Uuid;

use tessera_core::MessageId;
use tessera_infra::outbox::{OutboxMessage, OutboxStoreError, PostgresOutboxStore};

struct Db {
    store: PostgresOutboxStore,
    admin: PgPool,
    schema: String,
}

impl Db {
    async fn teardown(self) {
        self.store.pool().close().await;
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await
            .unwrap();
    }
}

async fn db() -> Option<Db> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping postgres outbox test");
        return None;
    };

    let admin = PgPoolOptions::new().max_connections(1).connect(&url).await.unwrap();
    let schema = format!("outbox_test_{}", Uuid::now_v7().simple());
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin)
        .await
        .unwrap();

    let options = url
        .parse::<PgConnectOptions>()
        .unwrap()
        .options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .unwrap();

    let store = PostgresOutboxStore::new(pool).unwrap();
    store.migrate().await.unwrap();
    Some(Db {
        store,
        admin,
        schema,
    })
}

/// Postgres keeps microseconds; whole seconds compare cleanly.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

async fn append(store: &PostgresOutboxStore, messages: &[OutboxMessage]) {
    let mut tx = store.pool().begin().await.unwrap();
    for message in messages {
        PostgresOutboxStore::append_in(&mut tx, message).await.unwrap();
    }
    tx.commit().await.unwrap();
}

fn message(n: i64, t0: DateTime<Utc>) -> OutboxMessage {
    OutboxMessage::new("Ping", serde_json::json!({ "n": n }), t0 + Duration::seconds(n))
}

#[tokio::test(flavor = "multi_thread")]
async fn claims_are_bounded_oldest_first_and_settled_by_their_owner() {
    let Some(db) = db().await else { return };
    let store = &db.store;
    let t0 = now();
    let messages: Vec<_> = (0..3).map(|n| message(n, t0)).collect();
    append(store, &messages).await;

    let lease = Duration::seconds(60);
    let first = store.claim_unprocessed("a", 2, lease, t0).await.unwrap();
    assert_eq!(
        first.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![messages[0].id, messages[1].id]
    );
    assert!(first.iter().all(|m| m.attempts == 1 && m.claimed_by.as_deref() == Some("a")));
    assert_eq!(first[0].claimed_until, Some(t0 + lease));

    let second = store.claim_unprocessed("b", 10, lease, t0).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, messages[2].id);

    store.mark_processed(messages[0].id, "a", t0).await.unwrap();
    store.mark_errored(messages[1].id, "a", "broker down").await.unwrap();

    let stranger = store.mark_processed(messages[2].id, "a", t0).await;
    assert!(matches!(stranger, Err(OutboxStoreError::ClaimLost { .. })));
    let settled_twice = store.mark_processed(messages[0].id, "a", t0).await;
    assert!(matches!(settled_twice, Err(OutboxStoreError::ClaimLost { .. })));

    let errored = store.get(messages[1].id).await.unwrap().unwrap();
    assert_eq!(errored.error.as_deref(), Some("broker down"));
    assert_eq!(errored.claimed_by, None);

    let stats = store.stats(t0).await.unwrap();
    assert_eq!(
        (stats.pending, stats.errored, stats.processed, stats.claimed),
        (1, 1, 1, 1)
    );

    // The errored message is claimable again straight away.
    let retry = store.claim_unprocessed("c", 10, lease, t0).await.unwrap();
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].attempts, 2);
    store.mark_processed(retry[0].id, "c", t0).await.unwrap();
    assert_eq!(store.get(retry[0].id).await.unwrap().unwrap().error, None);

    db.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_lease_moves_the_claim_to_a_new_owner() {
    let Some(db) = db().await else { return };
    let store = &db.store;
    let t0 = now();
    let m = message(0, t0);
    append(store, std::slice::from_ref(&m)).await;

    let lease = Duration::seconds(60);
    assert_eq!(store.claim_unprocessed("a", 10, lease, t0).await.unwrap().len(), 1);
    assert!(
        store
            .claim_unprocessed("b", 10, lease, t0 + Duration::seconds(30))
            .await
            .unwrap()
            .is_empty()
    );

    let reclaimed = store
        .claim_unprocessed("b", 10, lease, t0 + lease)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempts, 2);

    let late = store.mark_processed(m.id, "a", t0 + lease).await;
    assert!(matches!(late, Err(OutboxStoreError::ClaimLost { ref owner, .. }) if owner == "a"));
    store.mark_processed(m.id, "b", t0 + lease).await.unwrap();

    db.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rollback_discards_the_message_and_duplicates_are_rejected() {
    let Some(db) = db().await else { return };
    let store = &db.store;
    let t0 = now();

    let dropped = message(0, t0);
    let mut tx = store.pool().begin().await.unwrap();
    PostgresOutboxStore::append_in(&mut tx, &dropped).await.unwrap();
    tx.rollback().await.unwrap();
    assert!(store.get(dropped.id).await.unwrap().is_none());

    let kept = message(1, t0);
    append(store, std::slice::from_ref(&kept)).await;
    let mut tx = store.pool().begin().await.unwrap();
    let duplicate = PostgresOutboxStore::append_in(&mut tx, &kept).await;
    assert_eq!(duplicate, Err(OutboxStoreError::Duplicate(kept.id)));
    tx.rollback().await.unwrap();

    let missing = store.mark_processed(MessageId::new(), "a", t0).await;
    assert!(matches!(missing, Err(OutboxStoreError::NotFound(_))));

    db.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn purge_removes_only_processed_rows_older_than_the_cutoff() {
    let Some(db) = db().await else { return };
    let store = &db.store;
    let t0 = now();
    let old = message(0, t0);
    let pending = message(1, t0);
    append(store, &[old.clone(), pending.clone()]).await;

    store
        .claim_unprocessed("a", 1, Duration::seconds(60), t0)
        .await
        .unwrap();
    store.mark_processed(old.id, "a", t0).await.unwrap();

    assert_eq!(store.purge_processed_older_than(t0).await.unwrap(), 0);
    assert_eq!(
        store
            .purge_processed_older_than(t0 + Duration::seconds(1))
            .await
            .unwrap(),
        1
    );
    assert!(store.get(old.id).await.unwrap().is_none());
    assert!(store.get(pending.id).await.unwrap().is_some());

    db.teardown().await;
}
