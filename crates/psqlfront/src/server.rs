//! Server lifecycle
//!
//! Startup opens the cache-database pool, ensures the system tables and
//! every managed table exist, builds the controller indices, then accepts
//! client connections. Each accepted client gets its own upstream dial and
//! proxy-connection task; shutdown closes the listener, waits for in-flight
//! connections, and closes the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cache::{analyze_tables, CacheController};
use crate::config::{Config, StatsConfig};
use crate::error::{Error, Result};
use crate::origin::Origin;
use crate::pg_wire::{Notifier, ProxyConn, QueryHandler};
use crate::query::analyze_query;
use crate::stats::{monitoring, StatsCounters};
use crate::tls;

/// System-table DDL executed at startup (idempotent).
const SYSTEM_TABLE_DDL: &str = include_str!("../sql/psqlfront.sql");
const STATS_TABLE_DDL: &str = include_str!("../sql/stats.sql");

/// Hard ceiling for a cache-control run that outlived its handler.
const CACHE_CONTROL_HARD_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

pub struct Server {
    pool: PgPool,
    origins: HashMap<String, Arc<dyn Origin>>,
    cache_ttl: HashMap<String, Duration>,
    tls: Option<TlsAcceptor>,
    idle_timeout: Duration,
    cache_control_timeout: Duration,
    upstream_addr: String,
    stats_cfg: StatsConfig,
    stats: Arc<StatsCounters>,
}

impl Server {
    pub async fn new(cfg: &Config) -> Result<Server> {
        let pool = PgPoolOptions::new()
            .after_connect(|_conn, meta| {
                Box::pin(async move {
                    debug!(age = ?meta.age, "new cache database connection");
                    Ok(())
                })
            })
            .connect(&cfg.cache_database.dsn())
            .await?;

        let mut origins: HashMap<String, Arc<dyn Origin>> = HashMap::new();
        let mut cache_ttl = HashMap::new();
        for origin_cfg in &cfg.origins {
            let origin = origin_cfg.new_origin().map_err(|e| {
                Error::Internal(format!("origin `{}` initialize: {e}", origin_cfg.id))
            })?;
            cache_ttl.insert(origin_cfg.id.clone(), origin_cfg.ttl.unwrap_or(cfg.default_ttl));
            origins.insert(origin_cfg.id.clone(), origin);
        }

        let tls = if cfg.certificates.is_empty() {
            None
        } else {
            info!("use TLS");
            Some(tls::build_acceptor(&cfg.certificates)?)
        };

        Ok(Server {
            pool,
            origins,
            cache_ttl,
            tls,
            idle_timeout: cfg.idle_timeout,
            cache_control_timeout: cfg.cache_control_timeout(),
            upstream_addr: cfg.cache_database.upstream_addr(),
            stats_cfg: cfg.stats.clone(),
            stats: Arc::new(StatsCounters::default()),
        })
    }

    pub async fn run(self, token: CancellationToken, address: &str) -> Result<()> {
        let listener = TcpListener::bind(address).await?;
        self.run_with_listener(token, listener).await
    }

    pub async fn run_with_listener(
        self,
        token: CancellationToken,
        listener: TcpListener,
    ) -> Result<()> {
        info!(version = crate::VERSION, "start psql-front");
        self.bootstrap_schema().await?;

        // build the managed-table indices and ensure every table exists
        let mut origin_ids_by_table = HashMap::new();
        let mut tables = HashMap::new();
        let mut all_tables = Vec::new();
        let mut created_schemas = std::collections::HashSet::new();
        for (origin_id, origin) in &self.origins {
            let origin_tables = origin.tables().await.map_err(|e| {
                Error::Internal(format!("origin_id `{origin_id}` get tables: {e}"))
            })?;
            for table in origin_tables {
                let key = table.qualified_name();
                debug!("{key}: {} columns", table.columns.len());
                if table.schema_name != "public" && created_schemas.insert(table.schema_name.clone())
                {
                    let sql = format!(r#"CREATE SCHEMA IF NOT EXISTS "{}";"#, table.schema_name);
                    debug!("{sql}");
                    sqlx::query(&sql).execute(&self.pool).await?;
                }
                let ddl = table.generate_ddl()?;
                debug!("{ddl}");
                sqlx::query(&ddl).execute(&self.pool).await?;
                origin_ids_by_table.insert(key.clone(), origin_id.clone());
                tables.insert(key, table.clone());
                all_tables.push(table);
            }
        }
        analyze_tables(&self.pool, "-", &all_tables)
            .await
            .map_err(|e| Error::Internal(format!("execute initial analyze: {e}")))?;

        let controller = Arc::new(CacheController::new(
            self.pool.clone(),
            self.origins.clone(),
            self.cache_ttl.clone(),
            origin_ids_by_table,
            tables,
            self.stats.clone(),
        ));
        let handler: Arc<dyn QueryHandler> = Arc::new(CacheHandler {
            controller,
            stats: self.stats.clone(),
            cache_control_timeout: self.cache_control_timeout,
        });

        if self.stats_cfg.enabled {
            tokio::spawn(monitoring(
                token.child_token(),
                self.pool.clone(),
                self.stats.clone(),
                self.stats_cfg.clone(),
            ));
        }

        let tracker = TaskTracker::new();
        info!("PostgreSQL server is up and running at [{}]", listener.local_addr()?);
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (client, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "listener accept");
                    continue;
                }
            };
            self.stats.connection_opened();
            let remote_addr = peer_addr.to_string();
            info!(remote = %remote_addr, "new connection");
            client.set_nodelay(true).ok();

            let upstream = match TcpStream::connect(&self.upstream_addr).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    error!(remote = %remote_addr, error = %e, "can not connect upstream");
                    drop(client);
                    self.stats.connection_closed();
                    continue;
                }
            };

            let conn = ProxyConn::new(client, upstream)
                .with_tls(self.tls.clone())
                .with_query_handler(handler.clone())
                .with_idle_timeout(self.idle_timeout);
            let conn_token = token.child_token();
            let stats = self.stats.clone();
            tracker.spawn(async move {
                let result = conn.run(conn_token.clone()).await;
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_idle_timeout() => {
                        warn!(remote = %remote_addr, error = %e, "run proxy conn");
                    }
                    Err(e) if conn_token.is_cancelled() || e.is_disconnect() => {
                        debug!(remote = %remote_addr, error = %e, "run proxy conn");
                    }
                    Err(e) => {
                        error!(remote = %remote_addr, error = %e, "run proxy conn");
                    }
                }
                info!(remote = %remote_addr, "close connection");
                stats.connection_closed();
            });
        }

        info!("psql-front shutdown...");
        drop(listener);
        tracker.close();
        tracker.wait().await;
        self.pool.close().await;
        Ok(())
    }

    async fn bootstrap_schema(&self) -> Result<()> {
        let mut ddl = SYSTEM_TABLE_DDL.to_string();
        if self.stats_cfg.enabled {
            ddl.push('\n');
            ddl.push_str(STATS_TABLE_DDL);
        }
        for statement in ddl.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            debug!("{statement}");
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// Query handler wired into every proxy connection: analyze, then run the
/// cache controller on a detached task bounded by the soft deadline.
struct CacheHandler {
    controller: Arc<CacheController>,
    stats: Arc<StatsCounters>,
    cache_control_timeout: Duration,
}

#[async_trait]
impl QueryHandler for CacheHandler {
    async fn on_query(
        &self,
        remote_addr: &str,
        query: &str,
        _is_prepared_stmt: bool,
        notifier: Arc<dyn Notifier>,
    ) -> Result<()> {
        self.stats.add_query();
        debug!(remote = %remote_addr, "analyze SQL: {query}");
        let analysis = analyze_query(query)?;
        if analysis.tables.is_empty() {
            return Ok(());
        }
        info!(
            remote = %remote_addr,
            "referenced tables: [{}]",
            crate::cache::qualified_list(&analysis.tables)
        );

        let (result_tx, result_rx) = oneshot::channel();
        let controller = self.controller.clone();
        let background_remote = remote_addr.to_string();
        let background_query = query.to_string();
        let background_notifier = notifier.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(
                CACHE_CONTROL_HARD_LIMIT,
                controller.control(
                    &background_remote,
                    &background_query,
                    &analysis.tables,
                    background_notifier,
                ),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Internal("cache control hard deadline".to_string())),
            };
            match &result {
                Ok(()) => info!(remote = %background_remote, "cache control finished"),
                Err(e) => error!(remote = %background_remote, error = %e, "cache control failed"),
            }
            result_tx.send(result).ok();
        });

        tokio::select! {
            result = result_rx => {
                debug!(remote = %remote_addr, "trap finish cache control");
                result.unwrap_or(Ok(()))
            }
            _ = tokio::time::sleep(self.cache_control_timeout) => {
                info!(
                    remote = %remote_addr,
                    "since the timeout has arrived, cache control should be done on the background"
                );
                notifier
                    .notice("NOTICE", "timeout,please retry after")
                    .await
                    .ok();
                Ok(())
            }
        }
    }
}
