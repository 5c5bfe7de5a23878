//! Cache controller
//!
//! Receives the analyzed table list of a query, classifies each managed
//! table as hit or miss against `psqlfront.cache`, and refreshes every
//! missed table from its origin in parallel. Refreshes are single-flight
//! per table: contending requesters wait for the in-flight refresh and
//! return success, which is sound because the data rows and the metadata
//! row commit in the same transaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use parking_lot::RwLock;
use sqlx::postgres::Postgres;
use sqlx::{PgPool, QueryBuilder, Transaction};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::origin::{CacheWriter, Origin};
use crate::pg_wire::Notifier;
use crate::stats::StatsCounters;
use crate::table::Table;

pub fn cache_lifecycle_table() -> Table {
    Table::new("psqlfront", "cache")
}

pub fn stats_table() -> Table {
    Table::new("psqlfront", "stats")
}

/// A row of `psqlfront.cache`, after TTL adjustment for re-pointed origins.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CacheInfo {
    pub schema_name: String,
    pub table_name: String,
    pub origin_id: String,
    pub cached_at: NaiveDateTime,
    pub expired_at: NaiveDateTime,
}

pub struct CacheController {
    pool: PgPool,
    origins: HashMap<String, Arc<dyn Origin>>,
    cache_ttl: HashMap<String, Duration>,
    origin_ids_by_table: HashMap<String, String>,
    tables: Arc<RwLock<HashMap<String, Table>>>,
    gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    stats: Arc<StatsCounters>,
}

impl CacheController {
    pub fn new(
        pool: PgPool,
        origins: HashMap<String, Arc<dyn Origin>>,
        cache_ttl: HashMap<String, Duration>,
        origin_ids_by_table: HashMap<String, String>,
        tables: HashMap<String, Table>,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            pool,
            origins,
            cache_ttl,
            origin_ids_by_table,
            tables: Arc::new(RwLock::new(tables)),
            gates: DashMap::new(),
            stats,
        }
    }

    /// Current descriptor of a managed table, if any.
    pub fn managed_table(&self, table: &Table) -> Option<Table> {
        self.tables.read().get(&table.qualified_name()).cloned()
    }

    pub async fn control(
        self: &Arc<Self>,
        remote_addr: &str,
        query: &str,
        referenced_tables: &[Table],
        notifier: Arc<dyn Notifier>,
    ) -> Result<()> {
        debug!(remote = %remote_addr, "try cache control SQL: {query}");
        let system_tables = [
            cache_lifecycle_table().qualified_name(),
            stats_table().qualified_name(),
        ];
        let mut tables = Vec::new();
        for table in referenced_tables {
            if system_tables.contains(&table.qualified_name()) {
                continue;
            }
            if table.schema_name == "pg_catalog" || table.schema_name == "information_schema" {
                continue;
            }
            if let Some(descriptor) = self.managed_table(table) {
                tables.push(descriptor);
            }
        }
        if tables.is_empty() {
            info!(remote = %remote_addr, "only system tables or not managed, no check cache");
            return Ok(());
        }

        let cache_info = self.cache_info(remote_addr, &tables).await?;
        let (hit_tables, no_hit_tables): (Vec<Table>, Vec<Table>) = tables
            .into_iter()
            .partition(|t| cache_info.contains_key(&t.qualified_name()));
        self.stats.add_cache_hits(hit_tables.len() as i64);
        self.stats.add_cache_misses(no_hit_tables.len() as i64);
        if !hit_tables.is_empty() {
            let list = qualified_list(&hit_tables);
            if let Err(e) = notifier
                .notice("NOTICE", &format!("cache hit: [{list}]"))
                .await
            {
                warn!(remote = %remote_addr, error = %e, "send cache hit notice");
            }
        }
        if no_hit_tables.is_empty() {
            info!(remote = %remote_addr, "all tables cache hit");
            return Ok(());
        }
        info!(
            remote = %remote_addr,
            "cache no hit tables: [{}]",
            qualified_list(&no_hit_tables)
        );

        let mut refreshes = JoinSet::new();
        for table in no_hit_tables.clone() {
            let controller = Arc::clone(self);
            let remote_addr = remote_addr.to_string();
            refreshes.spawn(async move {
                let mut tx = controller.pool.begin().await?;
                debug!(remote = %remote_addr, "start `{table}` tx");
                let result = controller.refresh_cache(&mut tx, &table).await;
                match result {
                    Ok(()) => {
                        tx.commit().await?;
                        debug!(remote = %remote_addr, "end `{table}` tx");
                        Ok(())
                    }
                    Err(e) if e.is_origin_not_found() => {
                        warn!(remote = %remote_addr, error = %e, "{table} can not refresh cache");
                        tx.rollback().await.ok();
                        Ok(())
                    }
                    Err(e) => {
                        warn!(remote = %remote_addr, error = %e, "{table} can not refresh cache");
                        tx.rollback().await.ok();
                        Err(e)
                    }
                }
            });
        }
        let mut first_error: Option<Error> = None;
        while let Some(joined) = refreshes.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                        refreshes.abort_all();
                    }
                }
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => {
                    if first_error.is_none() {
                        first_error = Some(Error::Internal(format!(
                            "refresh task failed: {join_error}"
                        )));
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        analyze_tables(&self.pool, remote_addr, &no_hit_tables).await?;
        Ok(())
    }

    async fn cache_info(
        &self,
        remote_addr: &str,
        tables: &[Table],
    ) -> Result<HashMap<String, CacheInfo>> {
        debug!(remote = %remote_addr, "get cache info");
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT schema_name, table_name, origin_id, cached_at, expired_at FROM {} WHERE ",
            cache_lifecycle_table().qualified_name()
        ));
        for (i, table) in tables.iter().enumerate() {
            if i > 0 {
                builder.push(" OR ");
            }
            builder.push("(schema_name = ");
            builder.push_bind(table.schema_name.clone());
            builder.push(" AND table_name = ");
            builder.push_bind(table.rel_name.clone());
            builder.push(")");
        }
        let rows: Vec<CacheInfo> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await?;
        let now = chrono::Utc::now().naive_utc();
        Ok(classify_cache_rows(
            rows,
            &self.origin_ids_by_table,
            &self.cache_ttl,
            now,
        ))
    }

    /// Refreshes one table inside the caller's transaction, enforcing the
    /// per-table single-flight invariant. The waiter path returns success
    /// without doing I/O: once the holder's transaction has committed, the
    /// fresh metadata row is visible to any subsequent classification.
    pub async fn refresh_cache(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        table: &Table,
    ) -> Result<()> {
        let key = table.qualified_name();
        let gate = self
            .gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        debug!("lock check for {key}");
        match gate.clone().try_lock_owned() {
            Ok(guard) => {
                let result = self.do_refresh(tx, table).await;
                drop(guard);
                result
            }
            Err(_) => {
                info!("wait other refresh for {key}");
                let _wait = gate.lock_owned().await;
                info!("finish other refresh for {key}");
                Ok(())
            }
        }
    }

    async fn do_refresh(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        table: &Table,
    ) -> Result<()> {
        let key = table.qualified_name();
        debug!("refresh target {key}: {} columns", table.columns.len());
        let origin_id = self
            .origin_ids_by_table
            .get(&key)
            .ok_or_else(|| Error::OriginNotFound(format!("table {key} not found")))?;
        let origin = self
            .origins
            .get(origin_id)
            .ok_or_else(|| Error::OriginNotFound(format!("origin {origin_id} not found")))?;
        info!("refresh cache origin `{origin_id}`");
        {
            let mut writer = TxCacheWriter {
                tx,
                table: table.clone(),
                tables: Arc::clone(&self.tables),
            };
            origin.refresh_cache(&mut writer).await?;
        }

        let ttl = self
            .cache_ttl
            .get(origin_id)
            .ok_or_else(|| Error::Internal(format!("{origin_id}'s ttl not found")))?;
        let upsert = format!(
            "INSERT INTO {} (schema_name, table_name, origin_id, cached_at, expired_at) \
             VALUES ($1, $2, $3, NOW(), NOW() + interval '{} seconds') \
             ON CONFLICT (schema_name, table_name) DO UPDATE SET \
             origin_id = EXCLUDED.origin_id, cached_at = EXCLUDED.cached_at, \
             expired_at = EXCLUDED.expired_at",
            cache_lifecycle_table().qualified_name(),
            ttl.as_secs()
        );
        debug!("execute: {upsert}");
        sqlx::query(&upsert)
            .bind(&table.schema_name)
            .bind(&table.rel_name)
            .bind(origin_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

/// Keeps only fresh rows. A row whose persisted origin differs from the
/// currently configured one (the config has been re-pointed) gets its
/// expiry recomputed from the current TTL before the freshness check.
pub(crate) fn classify_cache_rows(
    rows: Vec<CacheInfo>,
    origin_ids_by_table: &HashMap<String, String>,
    cache_ttl: &HashMap<String, Duration>,
    now: NaiveDateTime,
) -> HashMap<String, CacheInfo> {
    let mut result = HashMap::new();
    for mut info in rows {
        let key = Table::new(&info.schema_name, &info.table_name).qualified_name();
        if let Some(configured) = origin_ids_by_table.get(&key) {
            if *configured != info.origin_id {
                info.origin_id = configured.clone();
                if let Some(ttl) = cache_ttl.get(configured) {
                    let renewed = info.cached_at
                        + chrono::Duration::from_std(*ttl).unwrap_or_else(|_| chrono::Duration::zero());
                    debug!(
                        "origin re-pointed for {key}: expired_at {} => {}",
                        info.expired_at, renewed
                    );
                    info.expired_at = renewed;
                }
            }
        }
        debug!(
            "cache info origin_id:{} {key} cached_at:{} expired_at:{}",
            info.origin_id, info.cached_at, info.expired_at
        );
        if now <= info.expired_at {
            result.insert(key, info);
        }
    }
    result
}

pub(crate) fn qualified_list(tables: &[Table]) -> String {
    tables
        .iter()
        .map(Table::qualified_name)
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) async fn analyze_tables(
    pool: &PgPool,
    remote_addr: &str,
    tables: &[Table],
) -> Result<()> {
    if tables.is_empty() {
        return Ok(());
    }
    let sql = format!("ANALYZE {};", qualified_list(tables));
    info!(remote = %remote_addr, "execute: {sql}");
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// Transactional write surface handed to origins during a refresh.
pub struct TxCacheWriter<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
    table: Table,
    tables: Arc<RwLock<HashMap<String, Table>>>,
}

#[async_trait::async_trait]
impl CacheWriter for TxCacheWriter<'_> {
    fn target_table(&self) -> &Table {
        &self.table
    }

    async fn delete_rows(&mut self) -> Result<()> {
        let sql = format!("DELETE FROM {}", self.table.qualified_name());
        debug!("execute: {sql}");
        let result = sqlx::query(&sql).execute(&mut **self.tx).await?;
        info!("{} {} rows deleted", self.table, result.rows_affected());
        Ok(())
    }

    async fn append_rows(&mut self, rows: Vec<Vec<Option<String>>>) -> Result<()> {
        for chunk in rows.chunks(1000) {
            self.insert_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn replace_cache_table(&mut self, table: Table) -> Result<()> {
        if table.qualified_name() != self.table.qualified_name() {
            return Err(Error::Internal("table name is mismatched".to_string()));
        }
        self.table.columns = table.columns;
        self.table.constraints = table.constraints;
        let drop_sql = format!("DROP TABLE IF EXISTS {}", self.table.qualified_name());
        debug!("execute: {drop_sql}");
        sqlx::query(&drop_sql).execute(&mut **self.tx).await?;
        let ddl = self.table.generate_ddl()?;
        debug!("execute: {ddl}");
        sqlx::query(&ddl).execute(&mut **self.tx).await?;
        self.tables
            .write()
            .insert(self.table.qualified_name(), self.table.clone());
        info!("{} replaced", self.table);
        Ok(())
    }
}

impl TxCacheWriter<'_> {
    async fn insert_chunk(&mut self, rows: &[Vec<Option<String>>]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns = &self.table.columns;
        for row in rows {
            if row.len() != columns.len() {
                return Err(Error::Internal(format!(
                    "expected columns {}, actual columns {}",
                    columns.len(),
                    row.len()
                )));
            }
        }
        let column_list = columns
            .iter()
            .map(|c| format!(r#""{}""#, c.name.to_lowercase()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({column_list}) VALUES ",
            self.table.qualified_name()
        ));
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push("(");
            for (j, (value, column)) in row.iter().zip(columns.iter()).enumerate() {
                if j > 0 {
                    builder.push(", ");
                }
                // bound as text, cast server-side to the declared type
                builder.push_bind(value.clone());
                builder.push(format!("::{}", column.sql_type()));
            }
            builder.push(")");
        }
        let result = builder.build().execute(&mut **self.tx).await?;
        info!("{} {} rows inserted", self.table, result.rows_affected());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(schema: &str, table: &str, origin: &str, cached_secs_ago: i64, ttl_secs: i64) -> CacheInfo {
        let now = chrono::Utc::now().naive_utc();
        let cached_at = now - chrono::Duration::seconds(cached_secs_ago);
        CacheInfo {
            schema_name: schema.to_string(),
            table_name: table.to_string(),
            origin_id: origin.to_string(),
            cached_at,
            expired_at: cached_at + chrono::Duration::seconds(ttl_secs),
        }
    }

    fn indices() -> (HashMap<String, String>, HashMap<String, Duration>) {
        let mut by_table = HashMap::new();
        by_table.insert(r#""example"."fuga""#.to_string(), "example-http".to_string());
        let mut ttl = HashMap::new();
        ttl.insert("example-http".to_string(), Duration::from_secs(3600));
        (by_table, ttl)
    }

    #[test]
    fn fresh_row_is_a_hit() {
        let (by_table, ttl) = indices();
        let now = chrono::Utc::now().naive_utc();
        let hits = classify_cache_rows(
            vec![row("example", "fuga", "example-http", 10, 600)],
            &by_table,
            &ttl,
            now,
        );
        assert!(hits.contains_key(r#""example"."fuga""#));
    }

    #[test]
    fn expired_row_is_a_miss() {
        let (by_table, ttl) = indices();
        let now = chrono::Utc::now().naive_utc();
        let hits = classify_cache_rows(
            vec![row("example", "fuga", "example-http", 700, 600)],
            &by_table,
            &ttl,
            now,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn repointed_origin_recomputes_expiry_from_current_ttl() {
        let (by_table, ttl) = indices();
        let now = chrono::Utc::now().naive_utc();
        // persisted under an old origin with an already-passed expiry, but
        // cached recently enough that the new TTL (1h) still covers it
        let hits = classify_cache_rows(
            vec![row("example", "fuga", "old-origin", 120, 60)],
            &by_table,
            &ttl,
            now,
        );
        let info = hits.get(r#""example"."fuga""#).expect("renewed hit");
        assert_eq!(info.origin_id, "example-http");
        assert_eq!(
            info.expired_at,
            info.cached_at + chrono::Duration::seconds(3600)
        );
    }

    #[test]
    fn unmanaged_rows_keep_their_expiry() {
        let (by_table, ttl) = indices();
        let now = chrono::Utc::now().naive_utc();
        let hits = classify_cache_rows(
            vec![row("other", "t", "gone-origin", 120, 60)],
            &by_table,
            &ttl,
            now,
        );
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn gate_allows_exactly_one_holder() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let gate = Arc::new(tokio::sync::Mutex::new(()));
        let performed = Arc::new(AtomicUsize::new(0));

        // emulate the refresh_cache locking discipline with a slow holder
        async fn refresh(
            gate: Arc<tokio::sync::Mutex<()>>,
            performed: Arc<AtomicUsize>,
        ) -> bool {
            match gate.clone().try_lock_owned() {
                Ok(guard) => {
                    performed.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    drop(guard);
                    true
                }
                Err(_) => {
                    let _wait = gate.lock_owned().await;
                    false
                }
            }
        }

        let first = tokio::spawn(refresh(gate.clone(), performed.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = tokio::spawn(refresh(gate.clone(), performed.clone()));
        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert!(first);
        assert!(!second, "waiter must not perform the refresh");
        assert_eq!(performed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn qualified_list_joins_identities() {
        let tables = vec![Table::new("example", "fuga"), Table::new("public", "hoge")];
        assert_eq!(
            qualified_list(&tables),
            r#""example"."fuga", "public"."hoge""#
        );
    }
}
