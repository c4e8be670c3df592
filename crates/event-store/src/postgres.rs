use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, EventEnvelope, EventId, EventQuery, EventSequencer, EventStoreError, Result,
    Version, VersionRange,
    store::{
        AppendOptions, EventStore, PartitionInfo, TierStats, WarmTier, assign_versions,
        import_collision, partition_bounds, validate_events_for_append,
    },
};

const SELECT_COLUMNS: &str = "event_id, aggregate_id, aggregate_type, event_type, version, payload, metadata, occurred_at";

// Live rows or the recorded high-water mark, whichever is higher.
const CURRENT_VERSION: &str = r#"
    SELECT GREATEST(
        (SELECT MAX(version) FROM event_store WHERE aggregate_id = $1),
        (SELECT version FROM aggregate_versions WHERE aggregate_id = $1)
    )
"#;

/// PostgreSQL-backed event store: the durable warm tier and system of record.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    sequencer: Arc<EventSequencer>,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store with strict ordering.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            sequencer: Arc::new(EventSequencer::strict()),
        }
    }

    /// Replaces the sequencer used by `append`.
    pub fn with_sequencer(mut self, sequencer: EventSequencer) -> Self {
        self.sequencer = Arc::new(sequencer);
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            event_type: row.try_get("event_type")?,
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            version: Version::new(row.try_get("version")?),
            timestamp: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }

    async fn current_version_in(
        tx: &mut Transaction<'_, Postgres>,
        aggregate_id: AggregateId,
    ) -> Result<Version> {
        let current: Option<i64> = sqlx::query_scalar(CURRENT_VERSION)
            .bind(aggregate_id.as_uuid())
            .fetch_one(&mut **tx)
            .await?;
        Ok(Version::new(current.unwrap_or(0)))
    }

    /// Records `version` as committed for the aggregate unless a higher one already is.
    async fn raise_high_water(
        tx: &mut Transaction<'_, Postgres>,
        aggregate_id: AggregateId,
        version: Version,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO aggregate_versions (aggregate_id, version)
            VALUES ($1, $2)
            ON CONFLICT (aggregate_id) DO UPDATE
            SET version = GREATEST(aggregate_versions.version, EXCLUDED.version)
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .bind(version.as_i64())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn bounds_for(name: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        partition_bounds(name)
            .ok_or_else(|| EventStoreError::InvalidBatch(format!("unknown partition {name}")))
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        aggregate_id: AggregateId,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version> {
        validate_events_for_append(aggregate_id, &events)?;

        // Start a transaction
        let mut tx = self.pool.begin().await?;

        // Serialize appenders of the same aggregate for the rest of the transaction
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(aggregate_id.to_string())
            .execute(&mut *tx)
            .await?;

        let current_version = Self::current_version_in(&mut tx, aggregate_id).await?;

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            metrics::counter!("event_store_concurrency_conflicts_total").increment(1);
            tracing::warn!(%aggregate_id, %expected, actual = %current_version, "append rejected");
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual: current_version,
            });
        }

        if events.is_empty() {
            return Ok(current_version);
        }

        let ordered = self
            .sequencer
            .order_after(aggregate_id, current_version, events)?;
        let committed = assign_versions(current_version, ordered);
        let count = committed.len();

        let mut last_version = current_version;
        for event in &committed {
            let metadata_json = serde_json::to_value(&event.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO event_store (event_id, aggregate_id, aggregate_type, event_type, version, payload, metadata, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(event.aggregate_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(event.version.as_i64())
            .bind(&event.payload)
            .bind(metadata_json)
            .bind(event.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // Check if this is a unique constraint violation (concurrency conflict)
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_aggregate_version")
                {
                    return EventStoreError::ConcurrencyConflict {
                        aggregate_id,
                        expected: options.expected_version.unwrap_or(current_version),
                        actual: event.version,
                    };
                }
                EventStoreError::Database(e)
            })?;

            last_version = event.version;
        }

        Self::raise_high_water(&mut tx, aggregate_id, last_version).await?;
        tx.commit().await?;

        metrics::counter!("event_store_appends_total").increment(1);
        metrics::counter!("event_store_events_appended_total").increment(count as u64);

        Ok(last_version)
    }

    async fn load(
        &self,
        aggregate_id: AggregateId,
        range: VersionRange,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM event_store
            WHERE aggregate_id = $1
              AND ($2::BIGINT IS NULL OR version >= $2)
              AND ($3::BIGINT IS NULL OR version <= $3)
            ORDER BY version ASC
            "#
        ))
        .bind(aggregate_id.as_uuid())
        .bind(range.from.map(|v| v.as_i64()))
        .bind(range.to.map(|v| v.as_i64()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Version> {
        let version: Option<i64> = sqlx::query_scalar(CURRENT_VERSION)
            .bind(aggregate_id.as_uuid())
            .fetch_one(&self.pool)
            .await?;

        Ok(Version::new(version.unwrap_or(0)))
    }

    async fn load_events_by_type(&self, event_type: &str) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM event_store
            WHERE event_type = $1
            ORDER BY occurred_at ASC, version ASC
            "#
        ))
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let mut sql = QueryBuilder::<Postgres>::new(format!(
            "SELECT {SELECT_COLUMNS} FROM event_store WHERE TRUE"
        ));

        if let Some(id) = query.aggregate_id {
            sql.push(" AND aggregate_id = ").push_bind(id.as_uuid());
        }
        if let Some(aggregate_type) = query.aggregate_type {
            sql.push(" AND aggregate_type = ").push_bind(aggregate_type);
        }
        if !query.event_types.is_empty() {
            sql.push(" AND event_type = ANY(").push_bind(query.event_types).push(")");
        }
        if let Some(from) = query.versions.from {
            sql.push(" AND version >= ").push_bind(from.as_i64());
        }
        if let Some(to) = query.versions.to {
            sql.push(" AND version <= ").push_bind(to.as_i64());
        }
        if let Some(since) = query.since {
            sql.push(" AND occurred_at >= ").push_bind(since);
        }
        if let Some(until) = query.until {
            sql.push(" AND occurred_at <= ").push_bind(until);
        }

        sql.push(" ORDER BY occurred_at ASC, version ASC");
        if let Some(limit) = query.page.limit {
            sql.push(" LIMIT ").push_bind(limit as i64);
        }
        if query.page.offset > 0 {
            sql.push(" OFFSET ").push_bind(query.page.offset as i64);
        }

        let rows = sql.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }
}

#[async_trait]
impl WarmTier for PostgresEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn import_events(&self, events: Vec<EventEnvelope>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        let mut newest: HashMap<AggregateId, Version> = HashMap::new();
        let mut collisions = Vec::new();

        for event in &events {
            let metadata_json = serde_json::to_value(&event.metadata)?;
            let result = sqlx::query(
                r#"
                INSERT INTO event_store (event_id, aggregate_id, aggregate_type, event_type, version, payload, metadata, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(event.aggregate_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(event.version.as_i64())
            .bind(&event.payload)
            .bind(metadata_json)
            .bind(event.timestamp)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                let held: Option<Uuid> = sqlx::query_scalar(
                    "SELECT event_id FROM event_store WHERE aggregate_id = $1 AND version = $2",
                )
                .bind(event.aggregate_id.as_uuid())
                .bind(event.version.as_i64())
                .fetch_optional(&mut *tx)
                .await?;
                if held != Some(event.event_id.as_uuid()) {
                    collisions.push((event.aggregate_id, event.version));
                }
            }
            inserted += result.rows_affected() as usize;

            let seen = newest.entry(event.aggregate_id).or_insert(event.version);
            *seen = (*seen).max(event.version);
        }

        // dropping the transaction rolls back the rows inserted so far
        import_collision(collisions)?;

        for (aggregate_id, version) in newest {
            Self::raise_high_water(&mut tx, aggregate_id, version).await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT to_char(date_trunc('month', occurred_at AT TIME ZONE 'UTC'), '"events_"YYYY_MM') AS name,
                   COUNT(*) AS event_count
            FROM event_store
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut partitions = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let event_count: i64 = row.try_get("event_count")?;
            if let Some((starts_at, ends_at)) = partition_bounds(&name) {
                partitions.push(PartitionInfo {
                    name,
                    starts_at,
                    ends_at,
                    event_count: event_count as u64,
                });
            }
        }
        Ok(partitions)
    }

    async fn load_partition(&self, name: &str) -> Result<Vec<EventEnvelope>> {
        let (starts_at, ends_at) = Self::bounds_for(name)?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM event_store
            WHERE occurred_at >= $1 AND occurred_at < $2
            ORDER BY aggregate_id ASC, version ASC
            "#
        ))
        .bind(starts_at)
        .bind(ends_at)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    #[tracing::instrument(skip(self, archived), fields(archived = archived.len()))]
    async fn drop_partition(&self, name: &str, archived: &[EventId]) -> Result<u64> {
        let (starts_at, ends_at) = Self::bounds_for(name)?;
        let ids: Vec<Uuid> = archived.iter().map(EventId::as_uuid).collect();
        let result = sqlx::query(
            r#"
            DELETE FROM event_store
            WHERE event_id = ANY($1)
              AND occurred_at >= $2 AND occurred_at < $3
            "#,
        )
        .bind(ids)
        .bind(starts_at)
        .bind(ends_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn warm_stats(&self) -> Result<TierStats> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT aggregate_id) AS aggregates, COUNT(*) AS events FROM event_store",
        )
        .fetch_one(&self.pool)
        .await?;
        let aggregates: i64 = row.try_get("aggregates")?;
        let events: i64 = row.try_get("events")?;
        let partitions = self.list_partitions().await?.len() as u64;

        Ok(TierStats {
            aggregates: aggregates as u64,
            events: events as u64,
            partitions,
        })
    }
}
