//! Static origin: rows defined directly in the configuration

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::origin::base::{to_table, ColumnConfigs};
use crate::origin::{register_origin_type, CacheWriter, Origin};
use crate::table::Table;

pub const ORIGIN_TYPE: &str = "Static";

pub fn register() {
    register_origin_type(ORIGIN_TYPE, build);
}

fn build(id: &str, spec: &serde_json::Value) -> Result<Arc<dyn Origin>> {
    let mut cfg: StaticOriginConfig =
        serde_json::from_value(spec.clone()).map_err(Error::config)?;
    cfg.restrict()?;
    Ok(Arc::new(StaticOrigin::new(id, cfg)))
}

#[derive(Debug, Clone, Deserialize)]
struct StaticOriginConfig {
    #[serde(default)]
    schema: String,
    tables: Vec<StaticTableConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct StaticTableConfig {
    name: String,
    columns: ColumnConfigs,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

impl StaticOriginConfig {
    fn restrict(&mut self) -> Result<()> {
        if self.schema.is_empty() {
            self.schema = "public".to_string();
        }
        for (i, table) in self.tables.iter_mut().enumerate() {
            if table.name.is_empty() {
                return Err(Error::config(anyhow!("table[{i}]: name is required")));
            }
            if table.columns.is_empty() {
                return Err(Error::config(anyhow!("table[{i}].columns: empty")));
            }
            table
                .columns
                .restrict()
                .map_err(|e| Error::config(anyhow!("table[{i}:{}]: {e}", table.name)))?;
        }
        Ok(())
    }
}

pub struct StaticOrigin {
    id: String,
    tables: Vec<Table>,
    rows: HashMap<String, Vec<Vec<Option<String>>>>,
}

impl StaticOrigin {
    fn new(id: &str, cfg: StaticOriginConfig) -> Self {
        let tables: Vec<Table> = cfg
            .tables
            .iter()
            .map(|table| to_table(&cfg.schema, &table.name, &table.columns))
            .collect();
        let rows = cfg
            .tables
            .iter()
            .zip(&tables)
            .map(|(table_cfg, table)| {
                let rows = table_cfg
                    .rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .zip(table_cfg.columns.iter())
                            .map(|(value, column)| to_cell(value, &column.constraint))
                            .collect()
                    })
                    .collect();
                (table.qualified_name(), rows)
            })
            .collect();
        Self {
            id: id.to_string(),
            tables,
            rows,
        }
    }
}

fn to_cell(value: &serde_json::Value, constraint: &str) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => {
            if s.is_empty() && !constraint.to_uppercase().contains("NOT NULL") {
                None
            } else {
                Some(s.clone())
            }
        }
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl Origin for StaticOrigin {
    fn id(&self) -> &str {
        &self.id
    }

    async fn tables(&self) -> Result<Vec<Table>> {
        Ok(self.tables.clone())
    }

    async fn refresh_cache(&self, writer: &mut (dyn CacheWriter + Send)) -> Result<()> {
        let table = writer.target_table().clone();
        let rows = self
            .rows
            .get(&table.qualified_name())
            .ok_or_else(|| Error::OriginNotFound(format!("table {table} not found")))?
            .clone();
        writer.delete_rows().await?;
        writer.append_rows(rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::CommonOriginConfig;

    fn example_config() -> CommonOriginConfig {
        CommonOriginConfig {
            id: "example-static".into(),
            origin_type: ORIGIN_TYPE.into(),
            ttl: None,
            spec: serde_json::json!({
                "schema": "example",
                "tables": [{
                    "name": "hoge",
                    "columns": [
                        {"name": "ymd", "data_type": "DATE"},
                        {"name": "name", "data_type": "TEXT"},
                        {"name": "value", "data_type": "BIGINT"},
                        {"name": "is_holiday", "data_type": "BOOLEAN"},
                    ],
                    "rows": [["2022-08-11", "山の日", 25, true]],
                }],
            }),
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        table: Table,
        deleted: bool,
        replaced: Option<Table>,
        rows: Vec<Vec<Option<String>>>,
    }

    #[async_trait]
    impl CacheWriter for RecordingWriter {
        fn target_table(&self) -> &Table {
            &self.table
        }

        async fn delete_rows(&mut self) -> Result<()> {
            self.deleted = true;
            Ok(())
        }

        async fn append_rows(&mut self, rows: Vec<Vec<Option<String>>>) -> Result<()> {
            self.rows.extend(rows);
            Ok(())
        }

        async fn replace_cache_table(&mut self, table: Table) -> Result<()> {
            self.replaced = Some(table);
            Ok(())
        }
    }

    #[tokio::test]
    async fn builds_tables_and_refreshes() {
        register();
        let origin = example_config().new_origin().unwrap();
        let tables = origin.tables().await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].qualified_name(), r#""example"."hoge""#);
        assert_eq!(tables[0].columns.len(), 4);

        let mut writer = RecordingWriter {
            table: tables[0].clone(),
            ..Default::default()
        };
        origin.refresh_cache(&mut writer).await.unwrap();
        assert!(writer.deleted);
        assert!(writer.replaced.is_none());
        assert_eq!(
            writer.rows,
            vec![vec![
                Some("2022-08-11".to_string()),
                Some("山の日".to_string()),
                Some("25".to_string()),
                Some("true".to_string()),
            ]]
        );
    }

    #[tokio::test]
    async fn unknown_table_is_origin_not_found() {
        register();
        let origin = example_config().new_origin().unwrap();
        let mut writer = RecordingWriter {
            table: Table::new("example", "missing"),
            ..Default::default()
        };
        let err = origin.refresh_cache(&mut writer).await.unwrap_err();
        assert!(err.is_origin_not_found());
        assert!(!writer.deleted);
    }

    #[test]
    fn empty_columns_are_rejected() {
        register();
        let cfg = CommonOriginConfig {
            id: "bad".into(),
            origin_type: ORIGIN_TYPE.into(),
            ttl: None,
            spec: serde_json::json!({"tables": [{"name": "t", "columns": [], "rows": []}]}),
        };
        assert!(cfg.new_origin().is_err());
    }
}
