//! HTTP origin: CSV documents fetched over http(s)
//!
//! Each configured table points at a URL serving CSV. Columns are either
//! declared statically or detected from the document (`schema_detection`),
//! in which case the cache table is dropped and recreated whenever the
//! detected schema is refreshed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::origin::base::{decode_text, infer_columns, parse_csv, to_table, ColumnConfigs};
use crate::origin::{register_origin_type, CacheWriter, Origin};
use crate::table::Table;

pub const ORIGIN_TYPE: &str = "HTTP";

const DEFAULT_DETECTED_SCHEMA_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

pub fn register() {
    register_origin_type(ORIGIN_TYPE, build);
}

fn build(id: &str, spec: &serde_json::Value) -> Result<Arc<dyn Origin>> {
    let mut cfg: HttpOriginConfig = serde_json::from_value(spec.clone()).map_err(Error::config)?;
    cfg.restrict()?;
    Ok(Arc::new(HttpOrigin::new(id, cfg)))
}

#[derive(Debug, Clone, Deserialize)]
struct HttpOriginConfig {
    #[serde(default)]
    schema: String,
    tables: Vec<HttpTableConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpTableConfig {
    name: String,
    #[serde(default)]
    columns: ColumnConfigs,

    url: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    ignore_lines: usize,
    #[serde(default)]
    text_encoding: Option<String>,
    #[serde(default)]
    schema_detection: bool,
    #[serde(default, with = "crate::config::duration::option")]
    detected_schema_expiration: Option<Duration>,
}

impl HttpOriginConfig {
    fn restrict(&mut self) -> Result<()> {
        if self.schema.is_empty() {
            self.schema = "public".to_string();
        }
        for (i, table) in self.tables.iter_mut().enumerate() {
            table
                .restrict()
                .map_err(|e| Error::config(anyhow!("table[{i}]: {e}")))?;
        }
        Ok(())
    }
}

impl HttpTableConfig {
    fn restrict(&mut self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config(anyhow!("name is required")));
        }
        if self.url.is_empty() {
            return Err(Error::config(anyhow!("url is required")));
        }
        let url = Url::parse(&self.url).map_err(|e| Error::config(anyhow!("url is invalid: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::config(anyhow!("url scheme must be http/https")));
        }
        match self.format.as_deref() {
            None => self.format = Some("csv".to_string()),
            Some("csv") | Some("CSV") => {}
            Some(other) => {
                return Err(Error::config(anyhow!("format `{other}` is not supported")));
            }
        }
        if self.schema_detection {
            if self.detected_schema_expiration.is_none() {
                self.detected_schema_expiration = Some(DEFAULT_DETECTED_SCHEMA_EXPIRATION);
            }
        } else if self.columns.is_empty() {
            return Err(Error::config(anyhow!("columns: empty")));
        }
        self.columns.restrict()?;
        Ok(())
    }
}

struct HttpTable {
    cfg: HttpTableConfig,
    detected: RwLock<DetectedSchema>,
}

#[derive(Default)]
struct DetectedSchema {
    columns: Option<ColumnConfigs>,
    detected_at: Option<Instant>,
}

pub struct HttpOrigin {
    id: String,
    schema: String,
    tables: Vec<HttpTable>,
}

impl HttpOrigin {
    fn new(id: &str, cfg: HttpOriginConfig) -> Self {
        Self {
            id: id.to_string(),
            schema: cfg.schema,
            tables: cfg
                .tables
                .into_iter()
                .map(|cfg| HttpTable {
                    cfg,
                    detected: RwLock::new(DetectedSchema::default()),
                })
                .collect(),
        }
    }

    fn find_table(&self, target: &Table) -> Result<&HttpTable> {
        if self.schema != target.schema_name {
            return Err(Error::OriginNotFound("origin schema is mismatched".into()));
        }
        self.tables
            .iter()
            .find(|t| t.cfg.name == target.rel_name)
            .ok_or_else(|| Error::OriginNotFound("origin table not found".into()))
    }

    async fn fetch_records(&self, table: &HttpTable) -> Result<Vec<Vec<String>>> {
        debug!(url = %table.cfg.url, "http request: GET");
        let response = reqwest::get(&table.cfg.url)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::origin(anyhow!("GET {} failed: {e}", table.cfg.url)))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::origin(anyhow!("GET {} failed: {e}", table.cfg.url)))?;
        let text = decode_text(&body, table.cfg.text_encoding.as_deref());
        parse_csv(&text)
    }

    /// Re-runs schema inference when the cached detection has expired.
    /// Returns the current column set for the table.
    async fn detect_schema(&self, table: &HttpTable) -> Result<ColumnConfigs> {
        let expiration = table
            .cfg
            .detected_schema_expiration
            .unwrap_or(DEFAULT_DETECTED_SCHEMA_EXPIRATION);
        {
            let detected = table.detected.read();
            if let (Some(columns), Some(at)) = (&detected.columns, detected.detected_at) {
                if at.elapsed() < expiration {
                    return Ok(columns.clone());
                }
            }
        }
        let records = self.fetch_records(table).await?;
        let columns = infer_columns(&records, table.cfg.ignore_lines)?;
        let mut detected = table.detected.write();
        detected.columns = Some(columns.clone());
        detected.detected_at = Some(Instant::now());
        Ok(columns)
    }

    async fn current_columns(&self, table: &HttpTable) -> Result<ColumnConfigs> {
        if table.cfg.schema_detection {
            self.detect_schema(table).await
        } else {
            Ok(table.cfg.columns.clone())
        }
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    fn id(&self) -> &str {
        &self.id
    }

    async fn tables(&self) -> Result<Vec<Table>> {
        let mut tables = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let columns = self.current_columns(table).await?;
            tables.push(to_table(&self.schema, &table.cfg.name, &columns));
        }
        Ok(tables)
    }

    async fn refresh_cache(&self, writer: &mut (dyn CacheWriter + Send)) -> Result<()> {
        let target = writer.target_table().clone();
        let table = self.find_table(&target)?;
        let columns = self.current_columns(table).await?;
        if table.cfg.schema_detection {
            writer
                .replace_cache_table(to_table(&self.schema, &table.cfg.name, &columns))
                .await?;
        } else {
            writer.delete_rows().await?;
        }
        let records = self.fetch_records(table).await?;
        writer
            .append_rows(columns.to_rows(&records, table.cfg.ignore_lines))
            .await
    }
}
