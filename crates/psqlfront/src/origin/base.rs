//! Shared origin plumbing
//!
//! Column configuration, record-to-row conversion, CSV parsing, text
//! encoding conversion, and schema inference for origins that detect their
//! source schema at refresh time.

use std::collections::HashMap;

use anyhow::anyhow;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::table::{Column, Table};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub length: Option<u32>,
    #[serde(default)]
    pub constraint: String,
    /// Source record index feeding this column; positional when absent.
    #[serde(default)]
    pub column_index: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ColumnConfigs(pub Vec<ColumnConfig>);

impl std::ops::Deref for ColumnConfigs {
    type Target = Vec<ColumnConfig>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ColumnConfigs {
    pub fn restrict(&mut self) -> Result<()> {
        for (j, column) in self.0.iter_mut().enumerate() {
            if column.name.is_empty() {
                return Err(Error::config(anyhow!("column[{j}]: name is required")));
            }
            if column.data_type.as_deref().unwrap_or("").is_empty() {
                column.data_type = Some("TEXT".to_string());
            }
        }
        Ok(())
    }

    pub fn to_columns(&self) -> Vec<Column> {
        self.0
            .iter()
            .map(|cfg| Column {
                name: cfg.name.clone(),
                data_type: cfg.data_type.clone().unwrap_or_else(|| "TEXT".to_string()),
                length: cfg.length,
                constraint: cfg.constraint.clone(),
            })
            .collect()
    }

    /// Maps raw records to cache rows ordered by these columns, skipping
    /// the first `ignore_lines` records.
    pub fn to_rows(&self, records: &[Vec<String>], ignore_lines: usize) -> Vec<Vec<Option<String>>> {
        if ignore_lines >= records.len() {
            return Vec::new();
        }
        records[ignore_lines..]
            .iter()
            .map(|record| {
                self.0
                    .iter()
                    .enumerate()
                    .map(|(i, cfg)| {
                        let index = cfg.column_index.unwrap_or(i);
                        record
                            .get(index)
                            .and_then(|value| to_cell(value, &cfg.constraint))
                    })
                    .collect()
            })
            .collect()
    }
}

/// An empty cell is NULL unless the column is constrained NOT NULL.
fn to_cell(value: &str, constraint: &str) -> Option<String> {
    if value.is_empty() && !constraint.to_uppercase().contains("NOT NULL") {
        return None;
    }
    Some(value.to_string())
}

/// Decodes raw bytes to text, honoring an explicit encoding label or
/// auto-detecting the charset.
pub fn decode_text(data: &[u8], label: Option<&str>) -> String {
    let encoding = match label {
        Some(label) => encoding_rs::Encoding::for_label(label.as_bytes()),
        None => {
            let mut detector = chardetng::EncodingDetector::new();
            detector.feed(data, true);
            Some(detector.guess(None, true))
        }
    };
    match encoding {
        Some(encoding) => encoding.decode(data).0.into_owned(),
        None => String::from_utf8_lossy(data).into_owned(),
    }
}

pub fn parse_csv(text: &str) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(Error::origin)?;
        records.push(record.iter().map(str::to_string).collect());
    }
    Ok(records)
}

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-zA-Z][a-zA-Z0-9_]*$").expect("identifier regex"));

/// Infers column configurations from raw records. With `ignore_lines == 1`
/// the first record supplies column names (unusable headers become
/// `anonymous_field`, duplicates get a numeric suffix); otherwise columns
/// are named `field1..fieldN`.
pub fn infer_columns(records: &[Vec<String>], ignore_lines: usize) -> Result<ColumnConfigs> {
    if records.len() <= ignore_lines {
        return Err(Error::origin(anyhow!("data not found")));
    }
    let mut named: Vec<(String, usize)> = Vec::new();
    let data_rows: &[Vec<String>];
    if ignore_lines == 1 {
        let mut duplication_count: HashMap<String, usize> = HashMap::new();
        duplication_count.insert("anonymous_field".to_string(), 1);
        for (i, header) in records[0].iter().enumerate() {
            let base = if IDENTIFIER.is_match(header) {
                header.clone()
            } else {
                "anonymous_field".to_string()
            };
            let count = duplication_count.get(&base).copied();
            match count {
                Some(c) => named.push((format!("{base}{c}"), i)),
                None => named.push((base.clone(), i)),
            }
            duplication_count.insert(base, count.unwrap_or(0) + 1);
        }
        data_rows = &records[1..];
    } else {
        for i in 0..records[0].len() {
            named.push((format!("field{}", i + 1), i));
        }
        data_rows = records;
    }

    let mut columns = Vec::with_capacity(named.len());
    for (name, index) in named {
        let values = data_rows.iter().filter_map(|row| row.get(index));
        let (data_type, length, constraint) = detect_type_info(values);
        columns.push(ColumnConfig {
            name,
            data_type: Some(data_type),
            length,
            constraint,
            column_index: Some(index),
        });
    }
    Ok(ColumnConfigs(columns))
}

const LIMIT_MAX_LENGTH: u32 = 65535;

const DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];
const TIMESTAMP_LAYOUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M",
];

fn as_date(s: &str) -> bool {
    DATE_LAYOUTS
        .iter()
        .any(|layout| chrono::NaiveDate::parse_from_str(s, layout).is_ok())
        || as_timestamp(s)
}

fn as_timestamp(s: &str) -> bool {
    TIMESTAMP_LAYOUTS
        .iter()
        .any(|layout| chrono::NaiveDateTime::parse_from_str(s, layout).is_ok())
}

fn as_boolean(s: &str) -> bool {
    let s = s.trim();
    s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false") || s == "1" || s == "0"
}

/// Narrows the candidate type set over at most 10,000 non-empty values.
fn detect_type_info<'a>(values: impl Iterator<Item = &'a String>) -> (String, Option<u32>, String) {
    let mut max_length: u32 = 64;
    let mut candidates = ["VARCHAR", "DATE", "TIMESTAMP", "BOOLEAN", "BIGINT", "FLOAT"]
        .map(|c| (c, true))
        .into_iter()
        .collect::<HashMap<_, _>>();
    let alive = |cands: &HashMap<&str, bool>| cands.values().filter(|v| **v).count();

    for (index, value) in values.enumerate() {
        if alive(&candidates) <= 1 && max_length == LIMIT_MAX_LENGTH {
            return ("VARCHAR".to_string(), Some(max_length), String::new());
        }
        if value.is_empty() {
            continue;
        }
        if index >= 10_000 {
            break;
        }
        if value.len() as u32 > max_length {
            max_length = (max_length * 2).min(LIMIT_MAX_LENGTH);
        }
        if candidates["DATE"] && !as_date(value) {
            candidates.insert("DATE", false);
        }
        if candidates["TIMESTAMP"] && !as_timestamp(value) {
            candidates.insert("TIMESTAMP", false);
        }
        if candidates["BOOLEAN"] && !as_boolean(value) {
            candidates.insert("BOOLEAN", false);
        }
        if candidates["BIGINT"] && value.parse::<i64>().is_err() {
            candidates.insert("BIGINT", false);
        }
        if candidates["FLOAT"] && value.parse::<f64>().is_err() {
            candidates.insert("FLOAT", false);
        }
    }

    if candidates["FLOAT"] {
        if candidates["BIGINT"] {
            return ("BIGINT".to_string(), None, String::new());
        }
        return ("FLOAT".to_string(), None, String::new());
    }
    if candidates["BIGINT"] {
        return ("BIGINT".to_string(), None, String::new());
    }
    if candidates["TIMESTAMP"] {
        return ("TIMESTAMP".to_string(), None, String::new());
    }
    if candidates["BOOLEAN"] {
        return ("BOOLEAN".to_string(), None, String::new());
    }
    if candidates["DATE"] {
        return ("DATE".to_string(), None, String::new());
    }
    ("VARCHAR".to_string(), Some(max_length), String::new())
}

/// Convenience: build a [`Table`] descriptor from a schema, name, and
/// column configs.
pub fn to_table(schema: &str, name: &str, columns: &ColumnConfigs) -> Table {
    Table {
        schema_name: schema.to_string(),
        rel_name: name.to_string(),
        columns: columns.to_columns(),
        constraints: Vec::new(),
    }
}
