//! Server statistics
//!
//! Atomic counters snapshotted by the monitoring loop, logged in LTSV and
//! optionally persisted to `psqlfront.stats` with 30-day rotation.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::Postgres;
use sqlx::{PgPool, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::stats_table;
use crate::config::StatsConfig;
use crate::error::Result;

#[derive(Debug)]
pub struct StatsCounters {
    started_at: DateTime<Utc>,
    curr_connections: AtomicI64,
    total_connections: AtomicI64,
    queries: AtomicI64,
    cache_hits: AtomicI64,
    cache_misses: AtomicI64,
}

impl Default for StatsCounters {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            curr_connections: AtomicI64::new(0),
            total_connections: AtomicI64::new(0),
            queries: AtomicI64::new(0),
            cache_hits: AtomicI64::new(0),
            cache_misses: AtomicI64::new(0),
        }
    }
}

impl StatsCounters {
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.curr_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.curr_connections.fetch_add(-1, Ordering::Relaxed);
    }

    pub fn add_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cache_hits(&self, n: i64) {
        self.cache_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_cache_misses(&self, n: i64) {
        self.cache_misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStats {
        let now = Utc::now();
        ServerStats {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            pid: std::process::id(),
            uptime: (now - self.started_at).num_seconds(),
            time: now,
            version: crate::VERSION.to_string(),
            curr_connections: self.curr_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            memory_alloc: resident_memory_bytes(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub hostname: String,
    pub pid: u32,
    pub uptime: i64,
    pub time: DateTime<Utc>,
    pub version: String,
    pub curr_connections: i64,
    pub total_connections: i64,
    pub queries: i64,
    pub cache_hits: i64,
    pub cache_misses: i64,
    pub memory_alloc: u64,
}

impl fmt::Display for ServerStats {
    /// LTSV, one record per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hostname:{}\tpid:{}\tuptime:{}\ttime:{}\tversion:{}\t\
             curr_connections:{}\ttotal_connections:{}\tqueries:{}\t\
             cache_hits:{}\tcache_misses:{}\tmemory_alloc:{}",
            self.hostname,
            self.pid,
            self.uptime,
            self.time.timestamp(),
            self.version,
            self.curr_connections,
            self.total_connections,
            self.queries,
            self.cache_hits,
            self.cache_misses,
            self.memory_alloc
        )
    }
}

impl ServerStats {
    pub async fn insert_into(&self, tx: &mut Transaction<'static, Postgres>) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (hostname, pid, uptime, time, version, curr_connections, \
             total_connections, queries, cache_hits, cache_misses, memory_alloc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            stats_table().qualified_name()
        );
        sqlx::query(&sql)
            .bind(&self.hostname)
            .bind(self.pid as i32)
            .bind(self.uptime)
            .bind(self.time.naive_utc())
            .bind(&self.version)
            .bind(self.curr_connections)
            .bind(self.total_connections)
            .bind(self.queries)
            .bind(self.cache_hits)
            .bind(self.cache_misses)
            .bind(self.memory_alloc as i64)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn rotate(tx: &mut Transaction<'static, Postgres>) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE time < NOW() - interval '30 day'",
            stats_table().qualified_name()
        );
        sqlx::query(&sql).execute(&mut **tx).await?;
        Ok(())
    }
}

/// Resident set size in bytes, 0 where unavailable.
fn resident_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
            {
                return resident_pages * 4096;
            }
        }
    }
    0
}

/// Periodic monitoring loop: log a snapshot each interval and optionally
/// persist it.
pub async fn monitoring(
    token: CancellationToken,
    pool: PgPool,
    counters: Arc<StatsCounters>,
    cfg: StatsConfig,
) {
    let mut ticker = tokio::time::interval(cfg.monitoring_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let stats = counters.snapshot();
        info!("{stats}");
        if !cfg.store_database {
            continue;
        }
        if let Err(e) = store(&pool, &stats).await {
            warn!(error = %e, "can not store stats");
        }
    }
}

async fn store(pool: &PgPool, stats: &ServerStats) -> Result<()> {
    let mut tx = pool.begin().await?;
    stats.insert_into(&mut tx).await?;
    ServerStats::rotate(&mut tx).await?;
    tx.commit().await?;
    Ok(())
}
