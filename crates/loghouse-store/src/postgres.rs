//! Postgres Storage Implementation
//!
//! Implements [`EventStore`] and [`PartitionCatalog`] on a sqlx connection
//! pool. Bulk inserts go through `QueryBuilder::push_values`; the group
//! upsert is a true `ON CONFLICT` merge so concurrent writers from other
//! processes can never lose a `first_seen` or under-count a group.
//!
//! ## DDL discipline
//!
//! Partition DDL cannot take bind parameters, so identifiers are
//! interpolated - but only ever from the closed [`Table`] enum and names
//! validated against the date-derived scheme by [`validate_partition_name`].
//! Nothing user-controlled reaches a DDL string.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use loghouse_core::{EventRow, GroupDelta, LogRow, Source};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::partition::partition_name;
use crate::types::{PartitionInfo, ProjectKeyInfo, Table};
use crate::{EventStore, PartitionCatalog};

static PARTITION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(logs|events)_p\d{8}$").expect("valid partition name regex"));
static PARTITION_BOUND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"FOR VALUES FROM \('(.+?)'\) TO \('(.+?)'\)").expect("valid bound regex")
});

/// sqlx-backed store. Cheap to clone, safe to share across tasks.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, shared pools).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Deltas arrive in hash-map order. Two processes upserting overlapping
/// `(project_id, fingerprint)` sets inside open transactions must take row
/// locks in the same order or Postgres will deadlock one of them, so the
/// upsert loop always walks the keys sorted.
fn lock_ordered(deltas: &[GroupDelta]) -> Vec<&GroupDelta> {
    let mut ordered: Vec<&GroupDelta> = deltas.iter().collect();
    ordered.sort_by(|a, b| {
        (a.project_id.as_str(), a.fingerprint.as_str())
            .cmp(&(b.project_id.as_str(), b.fingerprint.as_str()))
    });
    ordered
}

/// Reject any partition name that is not `<table>_pYYYYMMDD`.
fn validate_partition_name(name: &str) -> Result<()> {
    if PARTITION_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidPartitionName(name.to_string()))
    }
}

/// Parse one side of a `pg_get_expr` range bound into an instant.
fn parse_bound_instant(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%#z") {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default()));
    }
    Err(StoreError::InvalidPartitionBound(raw.to_string()))
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap_or_default())
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert_logs(&self, rows: &[LogRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO logs \
             (id, project_id, source, trace_id, span_id, level, message, fingerprint, data, \"timestamp\") ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(Uuid::new_v4())
                .push_bind(&row.project_id)
                .push_bind(row.source.as_str())
                .push_bind(&row.trace_id)
                .push_bind(&row.span_id)
                .push_bind(&row.level)
                .push_bind(&row.message)
                .push_bind(&row.fingerprint)
                .push_bind(&row.data)
                .push_bind(row.timestamp);
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_events(&self, rows: &[EventRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO events \
             (id, project_id, source, trace_id, span_id, name, event_type, user_id, session_id, value, data, \"timestamp\") ",
        );
        qb.push_values(rows, |mut b, row| {
            b.push_bind(Uuid::new_v4())
                .push_bind(&row.project_id)
                .push_bind(row.source.as_str())
                .push_bind(&row.trace_id)
                .push_bind(&row.span_id)
                .push_bind(&row.name)
                .push_bind(&row.event_type)
                .push_bind(&row.user_id)
                .push_bind(&row.session_id)
                // Decimal-as-string, cast at the boundary so precision never
                // routes through a float.
                .push_bind(&row.value)
                .push_unseparated("::numeric")
                .push_bind(&row.data)
                .push_bind(row.timestamp);
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_groups(&self, deltas: &[GroupDelta]) -> Result<()> {
        if deltas.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for delta in lock_ordered(deltas) {
            sqlx::query(
                r#"
                INSERT INTO log_groups
                    (project_id, fingerprint, pattern, example_message, level, count, first_seen, last_seen)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (project_id, fingerprint) DO UPDATE SET
                    count = log_groups.count + EXCLUDED.count,
                    first_seen = LEAST(log_groups.first_seen, EXCLUDED.first_seen),
                    last_seen = GREATEST(log_groups.last_seen, EXCLUDED.last_seen),
                    level = EXCLUDED.level
                "#,
            )
            .bind(&delta.project_id)
            .bind(&delta.fingerprint)
            .bind(&delta.pattern)
            .bind(&delta.example_message)
            .bind(&delta.level)
            .bind(delta.count)
            .bind(delta.first_seen)
            .bind(delta.last_seen)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_project_key(&self, api_key: &str) -> Result<Option<ProjectKeyInfo>> {
        let row = sqlx::query(
            "SELECT id, api_key, allowed_referrers FROM projects \
             WHERE api_key = $1 OR browser_api_key = $1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let server_key: String = row.get("api_key");
        let referrers: serde_json::Value = row.get("allowed_referrers");
        let allowed_referrers = serde_json::from_value(referrers).unwrap_or_default();

        Ok(Some(ProjectKeyInfo {
            project_id: row.get("id"),
            kind: if server_key == api_key {
                Source::Server
            } else {
                Source::Browser
            },
            allowed_referrers,
        }))
    }

    async fn project_exists(&self, project_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete_rows_older_than(&self, table: Table, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE \"timestamp\" < $1",
            table.as_str()
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    async fn delete_oldest_rows(&self, table: Table, limit: i64) -> Result<u64> {
        let t = table.as_str();
        let deleted = sqlx::query(&format!(
            "DELETE FROM {t} WHERE id IN \
             (SELECT id FROM {t} ORDER BY \"timestamp\" ASC LIMIT $1)"
        ))
        .bind(limit)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    async fn database_size_bytes(&self) -> Result<i64> {
        let row = sqlx::query("SELECT pg_database_size(current_database()) AS size")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("size"))
    }
}

#[async_trait]
impl PartitionCatalog for PostgresStore {
    async fn is_partitioned(&self, table: Table) -> Result<bool> {
        let row = sqlx::query(
            "SELECT c.relkind = 'p' AS is_partitioned FROM pg_class c \
             WHERE c.relname = $1 AND c.relnamespace = 'public'::regnamespace",
        )
        .bind(table.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("is_partitioned")).unwrap_or(false))
    }

    async fn convert_to_partitioned(&self, table: Table) -> Result<()> {
        let t = table.as_str();

        // Single transactional block: readers either see the old table or
        // the fully migrated one, never a partial state.
        let migration = format!(
            r#"
            DO $$
            DECLARE
              is_partitioned boolean;
              has_data boolean;
              min_day date;
              max_day date;
              d date;
            BEGIN
              SELECT c.relkind = 'p' INTO is_partitioned FROM pg_class c WHERE c.oid = '{t}'::regclass;
              IF is_partitioned THEN
                RETURN;
              END IF;

              IF EXISTS (
                SELECT 1 FROM pg_class c
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE c.relname = '{t}_unpartitioned' AND n.nspname = 'public'
              ) THEN
                RAISE EXCEPTION 'Temporary table {t}_unpartitioned already exists. Drop or rename it first.';
              END IF;

              SELECT EXISTS (SELECT 1 FROM {t} LIMIT 1) INTO has_data;

              EXECUTE 'ALTER TABLE {t} RENAME TO {t}_unpartitioned';
              EXECUTE 'CREATE TABLE {t} (LIKE {t}_unpartitioned INCLUDING DEFAULTS INCLUDING CONSTRAINTS) PARTITION BY RANGE ("timestamp")';

              IF has_data THEN
                SELECT date_trunc('day', MIN("timestamp"))::date, date_trunc('day', MAX("timestamp"))::date
                INTO min_day, max_day
                FROM {t}_unpartitioned;
              ELSE
                min_day := CURRENT_DATE;
                max_day := CURRENT_DATE;
              END IF;

              FOR d IN SELECT generate_series(min_day, max_day + 1, interval '1 day')::date LOOP
                EXECUTE format(
                  'CREATE TABLE IF NOT EXISTS %I PARTITION OF {t} FOR VALUES FROM (%L) TO (%L);',
                  format('{t}_p%s', to_char(d, 'YYYYMMDD')),
                  d,
                  d + 1
                );
              END LOOP;

              EXECUTE format('CREATE TABLE IF NOT EXISTS %I PARTITION OF {t} DEFAULT;', '{t}_default');

              IF has_data THEN
                EXECUTE 'INSERT INTO {t} SELECT * FROM {t}_unpartitioned';
              END IF;

              EXECUTE 'DROP TABLE {t}_unpartitioned';
            END $$;
            "#
        );
        sqlx::query(&migration).execute(&self.pool).await?;

        // Secondary indexes after the old table is gone so names never clash.
        for ddl in index_ddl(table) {
            sqlx::query(&ddl).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn create_day_partition(&self, table: Table, day: NaiveDate) -> Result<()> {
        let name = partition_name(table, day);
        validate_partition_name(&name)?;

        let start = day_start(day);
        let end = start + chrono::Duration::days(1);

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" PARTITION OF {table} \
             FOR VALUES FROM ('{start}') TO ('{end}')",
            table = table.as_str(),
            start = start.format("%Y-%m-%d %H:%M:%S+00"),
            end = end.format("%Y-%m-%d %H:%M:%S+00"),
        );

        match sqlx::query(&ddl).execute(&self.pool).await {
            Ok(_) => Ok(()),
            // Two flushes racing on the same day boundary is normal.
            Err(e) if e.to_string().contains("already exists") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_leaf_partitions(&self, table: Table) -> Result<Vec<PartitionInfo>> {
        let rows = sqlx::query(
            "SELECT c.relname AS name, pg_get_expr(c.relpartbound, c.oid) AS bound \
             FROM pg_inherits i \
             JOIN pg_class c ON c.oid = i.inhrelid \
             WHERE i.inhparent = ($1::text)::regclass",
        )
        .bind(table.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut partitions = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("name");
            let bound: Option<String> = row.get("bound");
            // The default partition has a DEFAULT bound; skip it along with
            // anything else that is not an explicit range.
            let Some(bound) = bound else { continue };
            let Some(caps) = PARTITION_BOUND_RE.captures(&bound) else {
                continue;
            };
            let start = parse_bound_instant(&caps[1])?;
            let end = parse_bound_instant(&caps[2])?;
            partitions.push(PartitionInfo { name, start, end });
        }

        partitions.sort_by_key(|p| p.start);
        Ok(partitions)
    }

    async fn detach_and_drop_partition(&self, table: Table, name: &str) -> Result<()> {
        validate_partition_name(name)?;

        let detach = format!(
            "ALTER TABLE {} DETACH PARTITION \"{}\"",
            table.as_str(),
            name
        );
        match sqlx::query(&detach).execute(&self.pool).await {
            Ok(_) => {}
            // Already detached or gone: dropping is still the right move.
            Err(e) if e.to_string().contains("does not exist") => {}
            Err(e) => return Err(e.into()),
        }

        sqlx::query(&format!("DROP TABLE IF EXISTS \"{name}\""))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Secondary index DDL recreated after an online conversion.
fn index_ddl(table: Table) -> Vec<String> {
    let t = table.as_str();
    let mut ddl = vec![
        format!("CREATE INDEX IF NOT EXISTS {t}_project_idx ON {t} (project_id)"),
        format!("CREATE INDEX IF NOT EXISTS {t}_trace_idx ON {t} (trace_id)"),
        format!("CREATE INDEX IF NOT EXISTS {t}_time_idx ON {t} (\"timestamp\")"),
        format!("CREATE INDEX IF NOT EXISTS {t}_data_gin_idx ON {t} USING gin (data)"),
    ];
    match table {
        Table::Logs => {
            ddl.push(format!(
                "CREATE INDEX IF NOT EXISTS {t}_level_idx ON {t} (level)"
            ));
            ddl.push(format!(
                "CREATE INDEX IF NOT EXISTS {t}_fingerprint_idx ON {t} (fingerprint)"
            ));
            ddl.push(format!(
                "CREATE INDEX IF NOT EXISTS {t}_message_search_idx ON {t} \
                 USING gin (to_tsvector('simple', message))"
            ));
        }
        Table::Events => {
            ddl.push(format!(
                "CREATE INDEX IF NOT EXISTS {t}_type_idx ON {t} (event_type)"
            ));
            ddl.push(format!(
                "CREATE INDEX IF NOT EXISTS {t}_user_idx ON {t} (user_id)"
            ));
        }
    }
    ddl
}
