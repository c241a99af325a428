use crate::store::KernelStore;
use crate::types::*;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

/// Convert an epoch-ms i64 to a `chrono::DateTime<chrono::Utc>` for TIMESTAMPTZ binding.
fn epoch_ms_to_datetime(epoch_ms: i64) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    let secs = epoch_ms / 1000;
    let nanos = ((epoch_ms % 1000) * 1_000_000) as u32;
    chrono::Utc
        .timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(chrono::Utc::now)
}

fn datetime_to_epoch_ms(dt: chrono::DateTime<chrono::Utc>) -> i64 {
    dt.timestamp_millis()
}

/// PostgreSQL-backed implementation of `KernelStore`, backed by the
/// `timer_records`, `timer_command_log`, `kernel_snapshots`,
/// `published_envelopes`, and `kernel_lease` tables.
pub struct PostgresStore {
    pool: sqlx::PgPool,
}

impl PostgresStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run kernel-core migrations")?;
        Ok(())
    }
}

#[async_trait]
impl KernelStore for PostgresStore {
    async fn save_timer(&self, timer: &Timer) -> Result<()> {
        let metadata = timer.metadata.clone().unwrap_or(serde_json::Value::Null);
        let labels = serde_json::to_value(&timer.labels)?;
        let status = serde_json::to_value(timer.status)?;
        let fire_at = epoch_ms_to_datetime(timer.fire_at);
        let created_at = epoch_ms_to_datetime(timer.created_at);
        let fired_at = timer.fired_at.map(epoch_ms_to_datetime);
        let cancelled_at = timer.cancelled_at.map(epoch_ms_to_datetime);
        let settled_at = timer.settled_at.map(epoch_ms_to_datetime);

        sqlx::query(
            r#"
            INSERT INTO timer_records (
                tenant_id, timer_id, name, requested_by, duration_ms, fire_at,
                created_at, status, metadata, labels, action_bundle,
                agent_binding, jitter_ms, state_version, fired_at,
                cancelled_at, cancel_reason, cancelled_by, settled_at,
                failure_reason
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                      $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (tenant_id, timer_id) DO UPDATE SET
                status = EXCLUDED.status,
                metadata = EXCLUDED.metadata,
                labels = EXCLUDED.labels,
                jitter_ms = EXCLUDED.jitter_ms,
                state_version = EXCLUDED.state_version,
                fired_at = EXCLUDED.fired_at,
                cancelled_at = EXCLUDED.cancelled_at,
                cancel_reason = EXCLUDED.cancel_reason,
                cancelled_by = EXCLUDED.cancelled_by,
                settled_at = EXCLUDED.settled_at,
                failure_reason = EXCLUDED.failure_reason
            "#,
        )
        .bind(&timer.tenant_id)
        .bind(timer.timer_id)
        .bind(&timer.name)
        .bind(&timer.requested_by)
        .bind(timer.duration_ms as i64)
        .bind(fire_at)
        .bind(created_at)
        .bind(status)
        .bind(metadata)
        .bind(labels)
        .bind(&timer.action_bundle)
        .bind(&timer.agent_binding)
        .bind(timer.jitter_ms)
        .bind(timer.state_version as i64)
        .bind(fired_at)
        .bind(cancelled_at)
        .bind(&timer.cancel_reason)
        .bind(&timer.cancelled_by)
        .bind(settled_at)
        .bind(&timer.failure_reason)
        .execute(&self.pool)
        .await
        .context("failed to upsert timer record")?;
        Ok(())
    }

    async fn load_timer(&self, tenant_id: &str, timer_id: Uuid) -> Result<Option<Timer>> {
        let row = sqlx::query_as::<_, TimerRow>(
            "SELECT * FROM timer_records WHERE tenant_id = $1 AND timer_id = $2",
        )
        .bind(tenant_id)
        .bind(timer_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load timer")?;
        row.map(TimerRow::into_timer).transpose()
    }

    async fn load_active_timers(&self) -> Result<Vec<Timer>> {
        let rows = sqlx::query_as::<_, TimerRow>(
            "SELECT * FROM timer_records WHERE status NOT IN ('\"settled\"', '\"failed\"', '\"cancelled\"')",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load active timers")?;
        rows.into_iter().map(TimerRow::into_timer).collect()
    }

    async fn list_timers(
        &self,
        tenant_id: &str,
        status_filter: &[TimerStatus],
        label_filter: &[(String, String)],
        page_size: usize,
        page_token: Option<String>,
    ) -> Result<(Vec<Timer>, Option<String>)> {
        let after: Option<Uuid> = page_token
            .as_deref()
            .map(|t| t.parse())
            .transpose()
            .context("invalid page token")?;
        let statuses: Vec<serde_json::Value> = status_filter
            .iter()
            .map(|s| serde_json::to_value(s).expect("TimerStatus always serializes"))
            .collect();

        let rows = sqlx::query_as::<_, TimerRow>(
            r#"
            SELECT * FROM timer_records
            WHERE tenant_id = $1
              AND ($2::jsonb[] IS NULL OR array_length($2::jsonb[], 1) IS NULL OR status = ANY($2))
              AND ($3::uuid IS NULL OR timer_id > $3)
            ORDER BY timer_id
            LIMIT $4
            "#,
        )
        .bind(tenant_id)
        .bind(if statuses.is_empty() { None } else { Some(&statuses[..]) })
        .bind(after)
        .bind(page_size.max(1) as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to list timers")?;

        let timers: Vec<Timer> = rows
            .into_iter()
            .map(TimerRow::into_timer)
            .collect::<Result<_>>()?;
        let filtered: Vec<Timer> = timers
            .into_iter()
            .filter(|t| {
                label_filter
                    .iter()
                    .all(|(k, v)| t.labels.get(k).map(|tv| tv == v).unwrap_or(false))
            })
            .collect();
        let next_page_token = if filtered.len() as i64 >= page_size.max(1) as i64 {
            filtered.last().map(|t| t.timer_id.to_string())
        } else {
            None
        };
        Ok((filtered, next_page_token))
    }

    async fn append_command(&self, entry: &CommandLogEntry) -> Result<Seq> {
        let kind = serde_json::to_value(entry.command_kind)?;
        let appended_at = epoch_ms_to_datetime(entry.appended_at);
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO timer_command_log (
                epoch, command_kind, tenant_id, timer_id, payload, appended_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING seq
            "#,
        )
        .bind(entry.epoch as i64)
        .bind(kind)
        .bind(&entry.tenant_id)
        .bind(entry.timer_id)
        .bind(&entry.payload)
        .bind(appended_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to append command")?;
        Ok(row.0 as Seq)
    }

    async fn read_commands_since(&self, seq: Seq) -> Result<Vec<CommandLogEntry>> {
        let rows = sqlx::query_as::<_, CommandLogRow>(
            "SELECT * FROM timer_command_log WHERE seq > $1 ORDER BY seq",
        )
        .bind(seq as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to read command log")?;
        rows.into_iter().map(CommandLogRow::into_entry).collect()
    }

    async fn last_command_seq(&self) -> Result<Seq> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT max(seq) FROM timer_command_log")
                .fetch_one(&self.pool)
                .await
                .context("failed to read last command seq")?;
        Ok(row.0.unwrap_or(0) as Seq)
    }

    async fn write_snapshot_and_truncate(&self, snapshot: &Snapshot) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let timers = serde_json::to_value(&snapshot.timers)?;
        let created_at = epoch_ms_to_datetime(snapshot.created_at);

        sqlx::query(
            "INSERT INTO kernel_snapshots (last_seq, created_at, timers) VALUES ($1, $2, $3)",
        )
        .bind(snapshot.last_seq as i64)
        .bind(created_at)
        .bind(timers)
        .execute(&mut *tx)
        .await
        .context("failed to insert snapshot")?;

        sqlx::query("DELETE FROM timer_command_log WHERE seq <= $1")
            .bind(snapshot.last_seq as i64)
            .execute(&mut *tx)
            .await
            .context("failed to truncate command log")?;

        tx.commit().await.context("failed to commit snapshot transaction")?;
        Ok(())
    }

    async fn load_latest_snapshot(&self) -> Result<Option<Snapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT * FROM kernel_snapshots ORDER BY last_seq DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to load snapshot")?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    async fn claim_lease(&self, node_id: &str, now_ms: i64, lease_ms: u64) -> Result<LeaderLease> {
        let now = epoch_ms_to_datetime(now_ms);
        let expires_at = epoch_ms_to_datetime(now_ms + lease_ms as i64);

        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            INSERT INTO kernel_lease (id, node_id, epoch, acquired_at, expires_at)
            VALUES (1, $1, 1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                node_id = EXCLUDED.node_id,
                epoch = CASE WHEN kernel_lease.node_id = EXCLUDED.node_id
                             THEN kernel_lease.epoch
                             ELSE kernel_lease.epoch + 1 END,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE kernel_lease.node_id = $1 OR kernel_lease.expires_at <= $2
            RETURNING *
            "#,
        )
        .bind(node_id)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .context("failed to claim lease")?;

        match row {
            Some(r) => r.into_lease(),
            None => self
                .load_lease()
                .await?
                .ok_or_else(|| anyhow!("lease claim lost race and no lease row exists")),
        }
    }

    async fn load_lease(&self) -> Result<Option<LeaderLease>> {
        let row = sqlx::query_as::<_, LeaseRow>("SELECT * FROM kernel_lease WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("failed to load lease")?;
        row.map(LeaseRow::into_lease).transpose()
    }

    async fn mark_published(&self, dedupe_key: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO published_envelopes (dedupe_key) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(dedupe_key)
        .execute(&self.pool)
        .await
        .context("failed to record published dedupe key")?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(sqlx::FromRow)]
struct TimerRow {
    tenant_id: String,
    timer_id: Uuid,
    name: String,
    requested_by: String,
    duration_ms: i64,
    fire_at: chrono::DateTime<chrono::Utc>,
    created_at: chrono::DateTime<chrono::Utc>,
    status: serde_json::Value,
    metadata: serde_json::Value,
    labels: serde_json::Value,
    action_bundle: Option<Vec<u8>>,
    agent_binding: Option<Vec<u8>>,
    jitter_ms: i64,
    state_version: i64,
    fired_at: Option<chrono::DateTime<chrono::Utc>>,
    cancelled_at: Option<chrono::DateTime<chrono::Utc>>,
    cancel_reason: Option<String>,
    cancelled_by: Option<String>,
    settled_at: Option<chrono::DateTime<chrono::Utc>>,
    failure_reason: Option<String>,
}

impl TimerRow {
    fn into_timer(self) -> Result<Timer> {
        Ok(Timer {
            tenant_id: self.tenant_id,
            timer_id: self.timer_id,
            name: self.name,
            requested_by: self.requested_by,
            duration_ms: self.duration_ms as u64,
            fire_at: datetime_to_epoch_ms(self.fire_at),
            created_at: datetime_to_epoch_ms(self.created_at),
            status: serde_json::from_value(self.status).context("invalid status column")?,
            metadata: if self.metadata.is_null() { None } else { Some(self.metadata) },
            labels: serde_json::from_value(self.labels).context("invalid labels column")?,
            action_bundle: self.action_bundle,
            agent_binding: self.agent_binding,
            jitter_ms: self.jitter_ms,
            state_version: self.state_version as u64,
            fired_at: self.fired_at.map(datetime_to_epoch_ms),
            cancelled_at: self.cancelled_at.map(datetime_to_epoch_ms),
            cancel_reason: self.cancel_reason,
            cancelled_by: self.cancelled_by,
            settled_at: self.settled_at.map(datetime_to_epoch_ms),
            failure_reason: self.failure_reason,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CommandLogRow {
    seq: i64,
    epoch: i64,
    command_kind: serde_json::Value,
    tenant_id: String,
    timer_id: Uuid,
    payload: serde_json::Value,
    appended_at: chrono::DateTime<chrono::Utc>,
}

impl CommandLogRow {
    fn into_entry(self) -> Result<CommandLogEntry> {
        Ok(CommandLogEntry {
            seq: self.seq as Seq,
            epoch: self.epoch as Epoch,
            command_kind: serde_json::from_value(self.command_kind)
                .context("invalid command_kind column")?,
            tenant_id: self.tenant_id,
            timer_id: self.timer_id,
            payload: self.payload,
            appended_at: datetime_to_epoch_ms(self.appended_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    last_seq: i64,
    created_at: chrono::DateTime<chrono::Utc>,
    timers: serde_json::Value,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Snapshot> {
        Ok(Snapshot {
            last_seq: self.last_seq as Seq,
            created_at: datetime_to_epoch_ms(self.created_at),
            timers: serde_json::from_value(self.timers).context("invalid snapshot timers column")?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    #[allow(dead_code)]
    id: i32,
    node_id: String,
    epoch: i64,
    acquired_at: chrono::DateTime<chrono::Utc>,
    expires_at: chrono::DateTime<chrono::Utc>,
}

impl LeaseRow {
    fn into_lease(self) -> Result<LeaderLease> {
        Ok(LeaderLease {
            node_id: self.node_id,
            epoch: self.epoch as Epoch,
            acquired_at: datetime_to_epoch_ms(self.acquired_at),
            expires_at: datetime_to_epoch_ms(self.expires_at),
        })
    }
}
