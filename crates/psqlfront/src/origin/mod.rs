//! Origins: external data producers behind managed cache tables
//!
//! An [`Origin`] is identified by a stable string id, announces a fixed set
//! of table descriptors at startup, and materializes any of them on demand
//! through a [`CacheWriter`]. Concrete origin types register a constructor
//! in the process-wide type registry; configuration decoding selects the
//! constructor by the `type` string of each `origins` entry.

pub mod base;
pub mod http;
pub mod static_origin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::table::Table;

/// Write surface handed to [`Origin::refresh_cache`]. All writes happen
/// inside the transaction owned by the refresh; a rollback discards both
/// the rows and the cache-metadata upsert.
#[async_trait]
pub trait CacheWriter: Send {
    fn target_table(&self) -> &Table;

    async fn delete_rows(&mut self) -> Result<()>;

    /// Appends rows whose values are ordered to match the target table's
    /// columns. Implementations chunk batches of more than 1,000 rows.
    async fn append_rows(&mut self, rows: Vec<Vec<Option<String>>>) -> Result<()>;

    /// Drops and recreates the cache table according to the new descriptor.
    /// Used when an origin detects that the source schema changed.
    async fn replace_cache_table(&mut self, table: Table) -> Result<()>;
}

#[async_trait]
pub trait Origin: Send + Sync {
    fn id(&self) -> &str;

    async fn tables(&self) -> Result<Vec<Table>>;

    async fn refresh_cache(&self, writer: &mut (dyn CacheWriter + Send)) -> Result<()>;
}

/// Constructor for a registered origin type: the origin id plus the
/// type-specific remainder of the configuration entry.
pub type OriginBuilder = fn(id: &str, spec: &serde_json::Value) -> Result<Arc<dyn Origin>>;

static ORIGIN_TYPES: Lazy<RwLock<HashMap<String, OriginBuilder>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn register_origin_type(type_name: &str, builder: OriginBuilder) {
    ORIGIN_TYPES.write().insert(type_name.to_string(), builder);
}

pub fn unregister_origin_type(type_name: &str) {
    ORIGIN_TYPES.write().remove(type_name);
}

pub fn is_registered(type_name: &str) -> bool {
    ORIGIN_TYPES.read().contains_key(type_name)
}

/// Registers the built-in origin types. Called once before the server
/// starts accepting connections; registration is not dynamic afterwards.
pub fn register_builtin() {
    http::register();
    static_origin::register();
}

/// The common fields of an `origins` configuration entry; everything else
/// is kept as the raw payload for the selected constructor.
#[derive(Debug, Clone, Deserialize)]
pub struct CommonOriginConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub origin_type: String,
    #[serde(default, with = "crate::config::duration::option")]
    pub ttl: Option<Duration>,

    #[serde(flatten)]
    pub spec: serde_json::Value,
}

impl CommonOriginConfig {
    pub fn restrict(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::config(anyhow!("origin id is required")));
        }
        if !is_registered(&self.origin_type) {
            return Err(Error::config(anyhow!(
                "type `{}` is not registered",
                self.origin_type
            )));
        }
        Ok(())
    }

    pub fn new_origin(&self) -> Result<Arc<dyn Origin>> {
        let builder = {
            let types = ORIGIN_TYPES.read();
            types.get(&self.origin_type).copied()
        };
        let builder = builder.ok_or_else(|| {
            Error::config(anyhow!("type `{}` is not registered", self.origin_type))
        })?;
        builder(&self.id, &self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullOrigin;

    #[async_trait]
    impl Origin for NullOrigin {
        fn id(&self) -> &str {
            "null"
        }

        async fn tables(&self) -> Result<Vec<Table>> {
            Ok(vec![])
        }

        async fn refresh_cache(&self, _writer: &mut (dyn CacheWriter + Send)) -> Result<()> {
            Ok(())
        }
    }

    fn build_null(_id: &str, _spec: &serde_json::Value) -> Result<Arc<dyn Origin>> {
        Ok(Arc::new(NullOrigin))
    }

    #[test]
    fn registry_round_trip() {
        register_origin_type("Null", build_null);
        assert!(is_registered("Null"));
        let cfg = CommonOriginConfig {
            id: "n".into(),
            origin_type: "Null".into(),
            ttl: None,
            spec: serde_json::Value::Null,
        };
        cfg.restrict().unwrap();
        let origin = cfg.new_origin().unwrap();
        assert_eq!(origin.id(), "null");
        unregister_origin_type("Null");
        assert!(!is_registered("Null"));
        assert!(cfg.restrict().is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let cfg = CommonOriginConfig {
            id: "x".into(),
            origin_type: "NoSuchType".into(),
            ttl: None,
            spec: serde_json::Value::Null,
        };
        assert!(cfg.restrict().is_err());
        assert!(cfg.new_origin().is_err());
    }

    #[test]
    fn empty_id_is_rejected() {
        register_origin_type("Null2", build_null);
        let cfg = CommonOriginConfig {
            id: String::new(),
            origin_type: "Null2".into(),
            ttl: None,
            spec: serde_json::Value::Null,
        };
        assert!(cfg.restrict().is_err());
        unregister_origin_type("Null2");
    }
}
