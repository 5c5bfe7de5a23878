//! Managed-table identity and DDL emission
//!
//! A managed table is addressed by `(schema_name, rel_name)`; the quoted
//! fully-qualified form is the map key used throughout the server.

use std::fmt;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub schema_name: String,
    pub rel_name: String,

    pub columns: Vec<Column>,
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub length: Option<u32>,
    #[serde(default)]
    pub constraint: String,
}

impl Column {
    /// SQL type expression including the optional length, e.g. `VARCHAR(64)`.
    pub fn sql_type(&self) -> String {
        match self.length {
            Some(l) if l > 0 => format!("{}({})", self.data_type, l),
            _ => self.data_type.clone(),
        }
    }
}

impl Table {
    pub fn new(schema_name: impl Into<String>, rel_name: impl Into<String>) -> Self {
        Self {
            schema_name: schema_name.into(),
            rel_name: rel_name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// `"<schema>"."<rel>"` — the identity used as map key everywhere.
    pub fn qualified_name(&self) -> String {
        format!(r#""{}"."{}""#, self.schema_name, self.rel_name)
    }

    pub fn generate_ddl(&self) -> Result<String> {
        if self.columns.is_empty() {
            return Err(Error::Internal(format!(
                "table {}: columns are required to generate DDL",
                self.qualified_name()
            )));
        }
        let mut fields: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let mut parts = vec![
                    format!(r#""{}""#, column.name.to_lowercase()),
                    column.sql_type(),
                ];
                if !column.constraint.is_empty() {
                    parts.push(column.constraint.clone());
                }
                parts.join(" ")
            })
            .collect();
        fields.extend(self.constraints.iter().cloned());
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
            self.qualified_name(),
            fields.join(",\n    ")
        ))
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}
