//! Idempotency ledger for webhook and checkout processing
//!
//! A key is claimed with a single atomic conditional insert. Whoever inserts
//! the row owns the effect; every later claim of the same key is a duplicate.
//!
//! Checkout session keys are never pruned: the provider keeps a completed
//! session retrievable indefinitely, so its success redirect can be replayed
//! long after the event retention window.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};

/// Prefix of keys shared by a checkout's success redirect and completion webhook
pub const CHECKOUT_SESSION_KEY_PREFIX: &str = "checkout_session:";

/// A key guarding one observable effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey {
    pub key: String,
    pub event_type: String,
    pub event_created_at: Option<OffsetDateTime>,
}

impl IdempotencyKey {
    /// Key for a provider event id
    pub fn event(
        event_id: &str,
        event_type: &str,
        event_created_at: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            key: event_id.to_string(),
            event_type: event_type.to_string(),
            event_created_at,
        }
    }

    /// Key shared by the success redirect and the completion webhook of one checkout session
    pub fn checkout_session(session_id: &str) -> Self {
        Self {
            key: format!("{}{}", CHECKOUT_SESSION_KEY_PREFIX, session_id),
            event_type: "checkout.session.completed".to_string(),
            event_created_at: None,
        }
    }
}

/// A claimed key
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProcessedEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub event_created_at: Option<OffsetDateTime>,
    pub processed_at: OffsetDateTime,
}

#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Atomically record `key`. Returns `true` only for the first claim.
    async fn try_claim(&self, key: &IdempotencyKey) -> BillingResult<bool>;

    /// Drop a claim whose effect could not be applied, so a retry can apply it
    async fn release(&self, key: &str) -> BillingResult<()>;

    async fn find(&self, key: &str) -> BillingResult<Option<ProcessedEventRecord>>;

    /// Delete event records processed before `cutoff`, returning how many were
    /// removed. Checkout session keys are kept.
    async fn prune_older_than(&self, cutoff: OffsetDateTime) -> BillingResult<u64>;
}

/// Ledger backed by the `processed_webhook_events` table
#[derive(Clone)]
pub struct PgIdempotencyLedger {
    pool: PgPool,
}

impl PgIdempotencyLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyLedger for PgIdempotencyLedger {
    async fn try_claim(&self, key: &IdempotencyKey) -> BillingResult<bool> {
        // INSERT ... ON CONFLICT DO NOTHING RETURNING yields a row only for the
        // request that actually inserted, so two concurrent deliveries cannot
        // both observe "not yet claimed".
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_webhook_events (event_id, event_type, event_created_at, processed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(&key.key)
        .bind(&key.event_type)
        .bind(key.event_created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %key.key,
                error = %e,
                "Failed to claim idempotency key"
            );
            BillingError::Database(e.to_string())
        })?;

        Ok(claimed.is_some())
    }

    async fn release(&self, key: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM processed_webhook_events WHERE event_id = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find(&self, key: &str) -> BillingResult<Option<ProcessedEventRecord>> {
        let record = sqlx::query_as::<_, ProcessedEventRecord>(
            r#"
            SELECT event_id, event_type, event_created_at, processed_at
            FROM processed_webhook_events
            WHERE event_id = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn prune_older_than(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM processed_webhook_events
            WHERE processed_at < $1
              AND NOT starts_with(event_id, $2)
            "#,
        )
        .bind(cutoff)
        .bind(CHECKOUT_SESSION_KEY_PREFIX)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// In-memory ledger for tests and local development
#[derive(Default)]
pub struct InMemoryIdempotencyLedger {
    records: Mutex<HashMap<String, ProcessedEventRecord>>,
}

impl InMemoryIdempotencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Backdate a record, for exercising retention
    pub async fn set_processed_at(&self, key: &str, processed_at: OffsetDateTime) {
        if let Some(record) = self.records.lock().await.get_mut(key) {
            record.processed_at = processed_at;
        }
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryIdempotencyLedger {
    async fn try_claim(&self, key: &IdempotencyKey) -> BillingResult<bool> {
        let mut records = self.records.lock().await;
        if records.contains_key(&key.key) {
            return Ok(false);
        }
        records.insert(
            key.key.clone(),
            ProcessedEventRecord {
                event_id: key.key.clone(),
                event_type: key.event_type.clone(),
                event_created_at: key.event_created_at,
                processed_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str) -> BillingResult<()> {
        self.records.lock().await.remove(key);
        Ok(())
    }

    async fn find(&self, key: &str) -> BillingResult<Option<ProcessedEventRecord>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn prune_older_than(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|key, record| {
            record.processed_at >= cutoff || key.starts_with(CHECKOUT_SESSION_KEY_PREFIX)
        });
        Ok((before - records.len()) as u64)
    }
}
