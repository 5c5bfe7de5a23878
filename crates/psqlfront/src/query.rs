//! Query analysis
//!
//! Parses incoming SQL and extracts the tables a statement reads from, so
//! the cache controller can check their freshness before the query reaches
//! the upstream. Only row-producing statements (`SELECT`, `DECLARE ...
//! CURSOR FOR SELECT`) are analyzed; everything else yields an empty table
//! list and bypasses cache control entirely.

use std::collections::HashSet;

use sqlparser::ast::{
    BinaryOperator, Expr, ObjectName, ObjectNamePart, Query, SetExpr, Statement, TableFactor,
    TableWithJoins, Value,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::error::Result;
use crate::table::Table;

#[derive(Debug, Clone, Default)]
pub struct QueryAnalysis {
    pub tables: Vec<Table>,
    pub row_producing: bool,
}

/// A raw table reference before schema resolution.
#[derive(Debug, Clone)]
struct TableRef {
    schema: Option<String>,
    name: String,
}

pub fn analyze_query(sql: &str) -> Result<QueryAnalysis> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)?;
    let row_producing = statements.iter().any(|stmt| match stmt {
        Statement::Query(_) => true,
        Statement::Declare { stmts } => stmts.iter().any(|d| d.for_query.is_some()),
        _ => false,
    });
    if !row_producing {
        debug!("not a row-producing statement, skipping table extraction");
        return Ok(QueryAnalysis::default());
    }

    let mut ctes = HashSet::new();
    let mut refs = Vec::new();
    for stmt in &statements {
        match stmt {
            Statement::Query(query) => collect_query(query, &mut ctes, &mut refs),
            Statement::Declare { stmts } => {
                for declare in stmts {
                    if let Some(query) = &declare.for_query {
                        collect_query(query, &mut ctes, &mut refs);
                    }
                }
            }
            _ => {}
        }
    }

    let mut seen = HashSet::new();
    let mut tables = Vec::new();
    for r in refs {
        // A reference matching a CTE name resolves to the CTE, never to a
        // managed table.
        if ctes.contains(&r.name) {
            continue;
        }
        let schema = r.schema.unwrap_or_else(|| {
            if r.name.starts_with("pg_") {
                "pg_catalog".to_string()
            } else {
                "public".to_string()
            }
        });
        let table = Table::new(schema, r.name);
        if seen.insert(table.qualified_name()) {
            tables.push(table);
        }
    }

    for table in statements.iter().filter_map(catalog_probe).flatten() {
        if seen.insert(table.qualified_name()) {
            tables.push(table);
        }
    }

    Ok(QueryAnalysis {
        tables,
        row_producing: true,
    })
}

fn collect_query(query: &Query, ctes: &mut HashSet<String>, refs: &mut Vec<TableRef>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            ctes.insert(cte.alias.name.value.clone());
            collect_query(&cte.query, ctes, refs);
        }
    }
    collect_set_expr(&query.body, ctes, refs);
}

fn collect_set_expr(body: &SetExpr, ctes: &mut HashSet<String>, refs: &mut Vec<TableRef>) {
    match body {
        SetExpr::Select(select) => {
            for twj in &select.from {
                collect_table_with_joins(twj, ctes, refs);
            }
            if let Some(selection) = &select.selection {
                collect_expr(selection, ctes, refs);
            }
        }
        SetExpr::Query(query) => collect_query(query, ctes, refs),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, ctes, refs);
            collect_set_expr(right, ctes, refs);
        }
        _ => {}
    }
}

fn collect_table_with_joins(twj: &TableWithJoins, ctes: &mut HashSet<String>, refs: &mut Vec<TableRef>) {
    collect_table_factor(&twj.relation, ctes, refs);
    for join in &twj.joins {
        collect_table_factor(&join.relation, ctes, refs);
    }
}

fn collect_table_factor(factor: &TableFactor, ctes: &mut HashSet<String>, refs: &mut Vec<TableRef>) {
    match factor {
        TableFactor::Table { name, .. } => {
            if let Some(r) = table_ref(name) {
                refs.push(r);
            }
        }
        TableFactor::Derived { subquery, .. } => collect_query(subquery, ctes, refs),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_table_with_joins(table_with_joins, ctes, refs),
        _ => {}
    }
}

/// Subqueries inside WHERE also reference tables (`EXISTS`, `IN (SELECT ...)`).
fn collect_expr(expr: &Expr, ctes: &mut HashSet<String>, refs: &mut Vec<TableRef>) {
    match expr {
        Expr::Subquery(query) => collect_query(query, ctes, refs),
        Expr::Exists { subquery, .. } => collect_query(subquery, ctes, refs),
        Expr::InSubquery { expr, subquery, .. } => {
            collect_expr(expr, ctes, refs);
            collect_query(subquery, ctes, refs);
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_expr(left, ctes, refs);
            collect_expr(right, ctes, refs);
        }
        Expr::Nested(inner) | Expr::UnaryOp { expr: inner, .. } => collect_expr(inner, ctes, refs),
        _ => {}
    }
}

fn table_ref(name: &ObjectName) -> Option<TableRef> {
    let idents: Vec<&str> = name
        .0
        .iter()
        .filter_map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident.value.as_str()),
            _ => None,
        })
        .collect();
    let rel = (*idents.last()?).to_string();
    let schema = if idents.len() >= 2 {
        Some(idents[idents.len() - 2].to_string())
    } else {
        None
    };
    Some(TableRef { schema, name: rel })
}

/// Catalog-probe extraction: a client checking `pg_class ⋈ pg_namespace`
/// for a managed table should trigger a refresh of the real table. Only
/// top-level conjunctions with literal equalities on `nspname`/`relname`
/// are recognized; this intentionally mirrors the original behavior and is
/// best-effort.
fn catalog_probe(stmt: &Statement) -> Option<Vec<Table>> {
    let Statement::Query(query) = stmt else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };

    let mut from_rels = HashSet::new();
    for twj in &select.from {
        for factor in std::iter::once(&twj.relation).chain(twj.joins.iter().map(|j| &j.relation)) {
            if let TableFactor::Table { name, .. } = factor {
                if let Some(r) = table_ref(name) {
                    from_rels.insert(r.name);
                }
            }
        }
    }
    if !from_rels.contains("pg_class") || !from_rels.contains("pg_namespace") {
        return None;
    }

    let mut conjuncts = Vec::new();
    flatten_conjunction(select.selection.as_ref()?, &mut conjuncts);

    let mut nspname = None;
    let mut relname = None;
    for conjunct in conjuncts {
        if let Some((column, literal)) = literal_equality(conjunct) {
            match column {
                "nspname" => nspname = Some(literal),
                "relname" => relname = Some(literal),
                _ => {}
            }
        }
    }
    match (nspname, relname) {
        (Some(schema), Some(rel)) => Some(vec![Table::new(schema, rel)]),
        _ => None,
    }
}

fn flatten_conjunction<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            flatten_conjunction(left, out);
            flatten_conjunction(right, out);
        }
        Expr::Nested(inner) => flatten_conjunction(inner, out),
        other => out.push(other),
    }
}

/// `column = 'literal'` (either operand order) → `(column, literal)`.
fn literal_equality(expr: &Expr) -> Option<(&str, String)> {
    let Expr::BinaryOp {
        left,
        op: BinaryOperator::Eq,
        right,
    } = expr
    else {
        return None;
    };
    match (column_name(left), string_literal(right)) {
        (Some(column), Some(literal)) => return Some((column, literal)),
        _ => {}
    }
    match (column_name(right), string_literal(left)) {
        (Some(column), Some(literal)) => Some((column, literal)),
        _ => None,
    }
}

fn column_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.as_str()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.as_str()),
        _ => None,
    }
}

fn string_literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(value) => match &value.value {
            Value::SingleQuotedString(s) => Some(s.clone()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(analysis: &QueryAnalysis) -> Vec<String> {
        analysis.tables.iter().map(|t| t.qualified_name()).collect()
    }

    #[test]
    fn basic_select() {
        let analysis = analyze_query("SELECT * FROM calender").unwrap();
        assert!(analysis.row_producing);
        assert_eq!(names(&analysis), vec![r#""public"."calender""#]);
    }

    #[test]
    fn schema_qualified_select() {
        let analysis = analyze_query("SELECT ymd, name, value FROM example.fuga LIMIT 100").unwrap();
        assert_eq!(names(&analysis), vec![r#""example"."fuga""#]);
    }

    #[test]
    fn pg_prefix_resolves_to_pg_catalog() {
        let analysis = analyze_query("SELECT * FROM pg_tables LIMIT 1").unwrap();
        assert_eq!(names(&analysis), vec![r#""pg_catalog"."pg_tables""#]);
    }

    #[test]
    fn select_without_tables() {
        let analysis = analyze_query("SELECT 1").unwrap();
        assert!(analysis.row_producing);
        assert!(analysis.tables.is_empty());
    }

    #[test]
    fn insert_into_select_is_not_row_producing() {
        let analysis =
            analyze_query("INSERT INTO x SELECT * FROM calender").unwrap();
        assert!(!analysis.row_producing);
        assert!(analysis.tables.is_empty());
    }

    #[test]
    fn with_cte_shadows_table_name() {
        let sql = r#"
            WITH calender AS (
                SELECT ymd FROM access.log
            )
            SELECT * FROM calender
        "#;
        let analysis = analyze_query(sql).unwrap();
        assert_eq!(names(&analysis), vec![r#""access"."log""#]);
    }

    #[test]
    fn cte_and_real_tables_mix() {
        let sql = r#"
            WITH totals AS (
                SELECT ymd, count(*) AS n FROM access.log GROUP BY 1
            )
            SELECT c.ymd, t.n
            FROM calender AS c
            JOIN totals AS t ON t.ymd = c.ymd
        "#;
        let analysis = analyze_query(sql).unwrap();
        assert_eq!(
            names(&analysis),
            vec![r#""access"."log""#, r#""public"."calender""#]
        );
    }

    #[test]
    fn declare_cursor_for_select() {
        let sql = "DECLARE cur CURSOR FOR SELECT ymd, name, value FROM example.fuga LIMIT 100";
        let analysis = analyze_query(sql).unwrap();
        assert!(analysis.row_producing);
        assert_eq!(names(&analysis), vec![r#""example"."fuga""#]);
    }

    #[test]
    fn fetch_has_no_tables() {
        let analysis = analyze_query("FETCH 100 IN cur").unwrap();
        assert!(!analysis.row_producing);
        assert!(analysis.tables.is_empty());
    }

    #[test]
    fn subquery_in_where_is_collected() {
        let sql = "SELECT * FROM calender WHERE ymd IN (SELECT ymd FROM access.log)";
        let analysis = analyze_query(sql).unwrap();
        assert_eq!(
            names(&analysis),
            vec![r#""public"."calender""#, r#""access"."log""#]
        );
    }

    #[test]
    fn duplicate_references_are_deduplicated() {
        let sql = "SELECT * FROM calender a JOIN calender b ON a.ymd = b.ymd";
        let analysis = analyze_query(sql).unwrap();
        assert_eq!(names(&analysis), vec![r#""public"."calender""#]);
    }

    #[test]
    fn catalog_probe_extracts_probed_table() {
        let sql = r#"
            SELECT c.oid
            FROM pg_catalog.pg_class c, pg_catalog.pg_namespace n
            WHERE n.oid = c.relnamespace
              AND n.nspname = 'example'
              AND c.relname = 'fuga'
        "#;
        let analysis = analyze_query(sql).unwrap();
        let got = names(&analysis);
        assert!(got.contains(&r#""pg_catalog"."pg_class""#.to_string()));
        assert!(got.contains(&r#""pg_catalog"."pg_namespace""#.to_string()));
        assert!(got.contains(&r#""example"."fuga""#.to_string()));
    }

    #[test]
    fn catalog_probe_accepts_swapped_operands() {
        let sql = r#"
            SELECT 1 FROM pg_class, pg_namespace
            WHERE 'example' = nspname AND 'fuga' = relname
        "#;
        let analysis = analyze_query(sql).unwrap();
        assert!(names(&analysis).contains(&r#""example"."fuga""#.to_string()));
    }

    #[test]
    fn catalog_probe_requires_both_relations() {
        let sql = "SELECT 1 FROM pg_class WHERE relname = 'fuga'";
        let analysis = analyze_query(sql).unwrap();
        assert!(!names(&analysis).contains(&r#""public"."fuga""#.to_string()));
    }

    #[test]
    fn catalog_probe_ignores_disjunctions() {
        let sql = r#"
            SELECT 1 FROM pg_class, pg_namespace
            WHERE nspname = 'example' OR relname = 'fuga'
        "#;
        let analysis = analyze_query(sql).unwrap();
        assert!(!names(&analysis).contains(&r#""example"."fuga""#.to_string()));
    }

    #[test]
    fn parse_failure_is_an_error() {
        assert!(analyze_query("SELECT * FROM WHERE ???").is_err());
    }
}
