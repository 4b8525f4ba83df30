//! # Postgres Shared Store
//!
//! [`SharedStore`] backed by three plain tables (lists, sets, hashes) and
//! PostgreSQL LISTEN/NOTIFY.
//!
//! Every operation runs in its own transaction. Atomic scripts additionally
//! take a transaction-scoped advisory lock on their logical table, so two
//! consumers (or a producer and a consumer) of the same table serialize while
//! unrelated tables proceed in parallel. Notifications are issued with
//! `pg_notify` inside the transaction and therefore only become visible when
//! the mutation commits.
//!
//! All notifications travel on one Postgres channel as a JSON envelope
//! `{"channel": ..., "payload": ...}`; a background task owns the
//! `PgListener` connection and routes each envelope through the local
//! [`SubscriberRegistry`].

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::pattern::ChannelPattern;
use super::pubsub::{SubscriberRegistry, Subscription};
use super::{
    check_payload_size, AtomicScript, CoalescingLayout, FieldValues, ScriptOutput, SharedStore,
};
use crate::config::StoreConfig;
use crate::constants::{keys::KEYSPACE_PREFIX, keyspace_ops};
use crate::error::{OrchBusError, OrchBusResult};

/// Postgres channel carrying every bus notification
pub const EVENT_CHANNEL: &str = "orchbus_events";

/// `pg_notify` rejects payloads of 8000 bytes or more
const PG_NOTIFY_MAX_BYTES: usize = 7999;

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS orchbus_lists (
        key TEXT NOT NULL,
        seq BIGSERIAL NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (key, seq)
    )",
    "CREATE TABLE IF NOT EXISTS orchbus_sets (
        key TEXT NOT NULL,
        member TEXT NOT NULL,
        PRIMARY KEY (key, member)
    )",
    "CREATE TABLE IF NOT EXISTS orchbus_hashes (
        key TEXT NOT NULL,
        field TEXT NOT NULL,
        value TEXT NOT NULL,
        seq BIGSERIAL NOT NULL,
        PRIMARY KEY (key, field)
    )",
];

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    channel: String,
    payload: String,
}

/// Serialize the envelope actually sent, rejecting what `pg_notify` would refuse
fn encode_envelope(channel: &str, payload: &str) -> OrchBusResult<String> {
    let envelope = serde_json::to_string(&Envelope {
        channel: channel.to_string(),
        payload: payload.to_string(),
    })?;
    if envelope.len() > PG_NOTIFY_MAX_BYTES {
        return Err(OrchBusError::PayloadTooLarge {
            size_bytes: envelope.len(),
            limit_bytes: PG_NOTIFY_MAX_BYTES,
        });
    }
    Ok(envelope)
}

fn sql_limit(max: usize) -> i64 {
    i64::try_from(max).unwrap_or(i64::MAX)
}

/// One store transaction with the helpers scripts are composed from
struct StoreTx {
    tx: Transaction<'static, Postgres>,
    keyspace_events: bool,
}

impl StoreTx {
    async fn lock(&mut self, resource: &str) -> OrchBusResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(resource)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn notify(&mut self, channel: &str, payload: &str) -> OrchBusResult<()> {
        let envelope = encode_envelope(channel, payload)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(EVENT_CHANNEL)
            .bind(envelope)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn touch(&mut self, key: &str, op: &str) -> OrchBusResult<()> {
        if self.keyspace_events {
            self.notify(&format!("{KEYSPACE_PREFIX}{key}"), op).await?;
        }
        Ok(())
    }

    async fn list_len(&mut self, list: &str) -> OrchBusResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orchbus_lists WHERE key = $1")
            .bind(list)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count as usize)
    }

    async fn rpush(&mut self, list: &str, entries: Vec<String>) -> OrchBusResult<usize> {
        if entries.is_empty() {
            return self.list_len(list).await;
        }
        for entry in entries {
            sqlx::query("INSERT INTO orchbus_lists (key, value) VALUES ($1, $2)")
                .bind(list)
                .bind(entry)
                .execute(&mut *self.tx)
                .await?;
        }
        self.touch(list, keyspace_ops::RPUSH).await?;
        self.list_len(list).await
    }

    async fn lpop(&mut self, list: &str, max: usize) -> OrchBusResult<Vec<String>> {
        let mut rows: Vec<(i64, String)> = sqlx::query_as(
            "DELETE FROM orchbus_lists WHERE (key, seq) IN (
                SELECT key, seq FROM orchbus_lists WHERE key = $1
                ORDER BY seq LIMIT $2 FOR UPDATE SKIP LOCKED
            ) RETURNING seq, value",
        )
        .bind(list)
        .bind(sql_limit(max))
        .fetch_all(&mut *self.tx)
        .await?;

        if !rows.is_empty() {
            self.touch(list, keyspace_ops::LPOP).await?;
        }
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, value)| value).collect())
    }

    async fn sadd(&mut self, set: &str, member: &str) -> OrchBusResult<bool> {
        let added = sqlx::query(
            "INSERT INTO orchbus_sets (key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(set)
        .bind(member)
        .execute(&mut *self.tx)
        .await?
        .rows_affected()
            > 0;
        if added {
            self.touch(set, keyspace_ops::SADD).await?;
        }
        Ok(added)
    }

    async fn srem(&mut self, set: &str, member: &str) -> OrchBusResult<bool> {
        let removed = sqlx::query("DELETE FROM orchbus_sets WHERE key = $1 AND member = $2")
            .bind(set)
            .bind(member)
            .execute(&mut *self.tx)
            .await?
            .rows_affected()
            > 0;
        if removed {
            self.touch(set, keyspace_ops::SREM).await?;
        }
        Ok(removed)
    }

    async fn spop(&mut self, set: &str, max: usize) -> OrchBusResult<Vec<String>> {
        let members: Vec<String> = sqlx::query_scalar(
            "DELETE FROM orchbus_sets WHERE (key, member) IN (
                SELECT key, member FROM orchbus_sets WHERE key = $1
                ORDER BY random() LIMIT $2 FOR UPDATE SKIP LOCKED
            ) RETURNING member",
        )
        .bind(set)
        .bind(sql_limit(max))
        .fetch_all(&mut *self.tx)
        .await?;
        if !members.is_empty() {
            self.touch(set, keyspace_ops::SPOP).await?;
        }
        Ok(members)
    }

    async fn hset(&mut self, key: &str, fields: FieldValues) -> OrchBusResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        for (field, value) in fields {
            sqlx::query(
                "INSERT INTO orchbus_hashes (key, field, value) VALUES ($1, $2, $3)
                 ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value",
            )
            .bind(key)
            .bind(field)
            .bind(value)
            .execute(&mut *self.tx)
            .await?;
        }
        self.touch(key, keyspace_ops::HSET).await
    }

    async fn take_hash(&mut self, key: &str) -> OrchBusResult<FieldValues> {
        let mut rows: Vec<(String, String, i64)> = sqlx::query_as(
            "DELETE FROM orchbus_hashes WHERE key = $1 RETURNING field, value, seq",
        )
        .bind(key)
        .fetch_all(&mut *self.tx)
        .await?;
        if !rows.is_empty() {
            self.touch(key, keyspace_ops::DEL).await?;
        }
        // RETURNING has no order; restore field insertion order
        rows.sort_by_key(|(_, _, seq)| *seq);
        Ok(rows
            .into_iter()
            .map(|(field, value, _)| (field, value))
            .collect())
    }

    async fn del(&mut self, key: &str) -> OrchBusResult<bool> {
        let mut removed = 0;
        for table in ["orchbus_lists", "orchbus_sets", "orchbus_hashes"] {
            removed += sqlx::query(&format!("DELETE FROM {table} WHERE key = $1"))
                .bind(key)
                .execute(&mut *self.tx)
                .await?
                .rows_affected();
        }
        if removed > 0 {
            self.touch(key, keyspace_ops::DEL).await?;
        }
        Ok(removed > 0)
    }

    async fn coalesced_pop(
        &mut self,
        layout: &CoalescingLayout,
        max: usize,
    ) -> OrchBusResult<Vec<(String, FieldValues)>> {
        let keys = self.spop(&layout.pending_set, max).await?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            let record_key = layout.record_key(&key);
            if self.srem(&layout.delete_set, &key).await? {
                self.take_hash(&record_key).await?;
            }
            let staged = self.take_hash(&layout.staging_key(&key)).await?;
            self.hset(&record_key, staged.clone()).await?;
            records.push((key, staged));
        }
        Ok(records)
    }

    async fn run(&mut self, script: AtomicScript) -> OrchBusResult<ScriptOutput> {
        match script {
            AtomicScript::ListPushAndPublish {
                list,
                entries,
                channel,
                payload,
            } => {
                self.lock(&list).await?;
                let len = self.rpush(&list, entries).await?;
                self.notify(&channel, &payload).await?;
                Ok(ScriptOutput::Count(len))
            }
            AtomicScript::ListPopFront { list, max } => {
                self.lock(&list).await?;
                Ok(ScriptOutput::Entries(self.lpop(&list, max).await?))
            }
            AtomicScript::StageWrite {
                layout,
                key,
                fields,
                token,
            } => {
                self.lock(&layout.pending_set).await?;
                self.hset(&layout.staging_key(&key), fields).await?;
                let added = self.sadd(&layout.pending_set, &key).await?;
                if added {
                    self.notify(&layout.channel, &token).await?;
                }
                Ok(ScriptOutput::Count(usize::from(added)))
            }
            AtomicScript::StageDelete { layout, key, token } => {
                self.lock(&layout.pending_set).await?;
                self.take_hash(&layout.staging_key(&key)).await?;
                self.sadd(&layout.delete_set, &key).await?;
                let added = self.sadd(&layout.pending_set, &key).await?;
                if added {
                    self.notify(&layout.channel, &token).await?;
                }
                Ok(ScriptOutput::Count(usize::from(added)))
            }
            AtomicScript::CoalescedPop { layout, max } => {
                self.lock(&layout.pending_set).await?;
                Ok(ScriptOutput::Records(self.coalesced_pop(&layout, max).await?))
            }
            AtomicScript::CoalescedClear { layout } => {
                self.lock(&layout.pending_set).await?;
                let pending = self.spop(&layout.pending_set, usize::MAX).await?;
                for key in &pending {
                    self.take_hash(&layout.staging_key(key)).await?;
                }
                self.del(&layout.delete_set).await?;
                Ok(ScriptOutput::Count(pending.len()))
            }
        }
    }

    async fn commit(self) -> OrchBusResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Shared store persisted in PostgreSQL
pub struct PostgresStore {
    pool: PgPool,
    registry: Arc<SubscriberRegistry>,
    listener_task: JoinHandle<()>,
    max_payload_size: usize,
    keyspace_events: bool,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .field("registry", &self.registry)
            .field("max_payload_size", &self.max_payload_size)
            .field("keyspace_events", &self.keyspace_events)
            .finish()
    }
}

impl PostgresStore {
    /// Connect a pool from configuration, create the schema and start listening
    #[instrument(skip(config))]
    pub async fn connect(config: &StoreConfig) -> OrchBusResult<Self> {
        let url = config.database_url.as_deref().ok_or_else(|| {
            OrchBusError::configuration("store.database_url is required for the postgres backend")
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;

        Self::with_pool(pool, config).await
    }

    /// Build on an existing pool
    pub async fn with_pool(pool: PgPool, config: &StoreConfig) -> OrchBusResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        let registry = Arc::new(SubscriberRegistry::new(config.notification_buffer_size));
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(EVENT_CHANNEL).await?;
        let listener_task = tokio::spawn(route_notifications(listener, Arc::clone(&registry)));

        info!(
            channel = EVENT_CHANNEL,
            keyspace_notifications = config.keyspace_notifications,
            "Postgres shared store ready"
        );

        Ok(Self {
            pool,
            registry,
            listener_task,
            max_payload_size: config.max_payload_size,
            keyspace_events: config.keyspace_notifications,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> OrchBusResult<StoreTx> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
            keyspace_events: self.keyspace_events,
        })
    }
}

impl Drop for PostgresStore {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

async fn route_notifications(listener: PgListener, registry: Arc<SubscriberRegistry>) {
    let mut stream = listener.into_stream();
    while let Some(notification) = stream.next().await {
        match notification {
            Ok(notification) => {
                match serde_json::from_str::<Envelope>(notification.payload()) {
                    Ok(envelope) => {
                        let delivered = registry.publish(&envelope.channel, &envelope.payload);
                        debug!(channel = %envelope.channel, delivered, "Routed store notification");
                    }
                    Err(e) => {
                        warn!(error = %e, payload = %notification.payload(), "Malformed notification envelope");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Notification listener connection failed");
                break;
            }
        }
    }
    info!("Notification listener loop ended");
}

#[async_trait]
impl SharedStore for PostgresStore {
    async fn list_push(&self, list: &str, entries: Vec<String>) -> OrchBusResult<usize> {
        let mut tx = self.begin().await?;
        let len = tx.rpush(list, entries).await?;
        tx.commit().await?;
        Ok(len)
    }

    async fn list_len(&self, list: &str) -> OrchBusResult<usize> {
        let mut tx = self.begin().await?;
        let len = tx.list_len(list).await?;
        tx.commit().await?;
        Ok(len)
    }

    async fn set_add(&self, set: &str, members: Vec<String>) -> OrchBusResult<usize> {
        let mut tx = self.begin().await?;
        let mut added = 0;
        for member in &members {
            if tx.sadd(set, member).await? {
                added += 1;
            }
        }
        tx.commit().await?;
        Ok(added)
    }

    async fn set_card(&self, set: &str) -> OrchBusResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orchbus_sets WHERE key = $1")
            .bind(set)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn hash_get_all(&self, key: &str) -> OrchBusResult<FieldValues> {
        let fields: FieldValues = sqlx::query_as(
            "SELECT field, value FROM orchbus_hashes WHERE key = $1 ORDER BY seq",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(fields)
    }

    async fn hash_set(&self, key: &str, fields: FieldValues) -> OrchBusResult<()> {
        let mut tx = self.begin().await?;
        tx.hset(key, fields).await?;
        tx.commit().await
    }

    async fn del(&self, key: &str) -> OrchBusResult<bool> {
        let mut tx = self.begin().await?;
        let existed = tx.del(key).await?;
        tx.commit().await?;
        Ok(existed)
    }

    #[instrument(skip(self))]
    async fn keys(&self, pattern: &str) -> OrchBusResult<Vec<String>> {
        let pattern = ChannelPattern::new(pattern)?;
        let prefix = format!("{}%", pattern.literal_prefix());
        let candidates: Vec<String> = sqlx::query_scalar(
            "SELECT key FROM orchbus_lists WHERE key LIKE $1
             UNION SELECT key FROM orchbus_sets WHERE key LIKE $1
             UNION SELECT key FROM orchbus_hashes WHERE key LIKE $1
             ORDER BY 1",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(candidates
            .into_iter()
            .filter(|k| pattern.matches(k))
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> OrchBusResult<usize> {
        check_payload_size(payload, self.max_payload_size)?;
        let mut tx = self.begin().await?;
        tx.notify(channel, payload).await?;
        tx.commit().await?;
        // Delivery happens asynchronously through the listener
        Ok(self.registry.subscriber_count())
    }

    async fn subscribe(
        &self,
        channels: &[String],
        patterns: &[String],
    ) -> OrchBusResult<Subscription> {
        self.registry.subscribe(channels, patterns)
    }

    #[instrument(skip(self, script), fields(script = script.name()))]
    async fn eval(&self, script: AtomicScript) -> OrchBusResult<ScriptOutput> {
        let name = script.name();
        let mut tx = self.begin().await?;
        let output = tx
            .run(script)
            .await
            .map_err(|e| OrchBusError::script_failed(name, e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| OrchBusError::script_failed(name, e.to_string()))?;
        Ok(output)
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}
