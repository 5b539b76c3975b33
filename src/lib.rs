//! Column-level lineage for SQL.
//!
//! Given SQL text and a catalog of known `(database, schema, table, column)`
//! facts, work out which physical columns the query reads, following CTEs,
//! subqueries, aliases and wildcards down to the tables they come from.
//!
//! ```no_run
//! use column_lineage::{CatalogIndex, CatalogRow, LineageAnalyzer};
//!
//! let catalog = CatalogIndex::from_rows(vec![CatalogRow::new("ip", "mg", "loan", "fpb")]);
//! let report = LineageAnalyzer::new(&catalog).analyze_sql("SELECT fpb FROM loan")?;
//! assert_eq!(report.lines(), vec!["ip.mg.loan.fpb"]);
//! # Ok::<(), column_lineage::LineageError>(())
//! ```

pub mod catalog;
pub mod config;
mod cte;
pub mod error;
pub mod handlers;
pub mod relation;
mod report;
pub mod resolver;
mod scope;
pub mod server;
pub mod tree;
pub mod wildcard;

use sqlparser::ast::{Spanned, Statement};
use sqlparser::dialect::{dialect_from_str, Dialect, GenericDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Span;

pub use catalog::{normalize_name, CatalogEntry, CatalogIndex, CatalogRow};
pub use cte::dependency_order;
pub use error::{LineageError, Result};
pub use relation::LineageRecord;
pub use report::{LineageReport, StatementLineage, Warning};
pub use resolver::{CyclePolicy, ReferenceMode, ResolveOptions, Resolver};

use crate::tree::QueryNode;

/// Parses SQL in one dialect and resolves its lineage against a catalog.
#[derive(Debug)]
pub struct LineageAnalyzer<'c> {
    catalog: &'c CatalogIndex,
    dialect: Box<dyn Dialect>,
    options: ResolveOptions,
}

impl<'c> LineageAnalyzer<'c> {
    /// Generic dialect, projection lineage, cycles reported as warnings.
    pub fn new(catalog: &'c CatalogIndex) -> Self {
        Self {
            catalog,
            dialect: Box::new(GenericDialect {}),
            options: ResolveOptions::default(),
        }
    }

    /// Switch to a dialect by its sqlparser name (`generic`, `hive`,
    /// `postgresql`, `mysql`, `snowflake`, ...).
    pub fn with_dialect(mut self, name: &str) -> Result<Self> {
        self.dialect =
            dialect_from_str(name).ok_or_else(|| LineageError::UnknownDialect(name.to_string()))?;
        Ok(self)
    }

    pub fn with_options(mut self, options: ResolveOptions) -> Self {
        self.options = options;
        self
    }

    /// Lineage of every query in `sql`, merged into one report.
    pub fn analyze_sql(&self, sql: &str) -> Result<LineageReport> {
        let statements = Parser::parse_sql(self.dialect.as_ref(), sql)?;
        let mut report = LineageReport::default();
        for stmt in &statements {
            report.merge(self.analyze_statement(stmt)?);
        }
        Ok(report)
    }

    /// Lineage per statement, with statement kind and position. Statements
    /// that embed no query are left out.
    pub fn analyze_sql_detailed(&self, sql: &str) -> Result<Vec<StatementLineage>> {
        let statements = Parser::parse_sql(self.dialect.as_ref(), sql)?;
        let mut out = Vec::new();
        for (idx, stmt) in statements.iter().enumerate() {
            let queries = tree::lower_statement(stmt)?;
            if queries.is_empty() {
                tracing::debug!(stmt_index = idx, "statement holds no query, skipping");
                continue;
            }
            let mut report = LineageReport::default();
            for query in &queries {
                report.merge(self.analyze_query(query)?);
            }
            let span = stmt.span();
            out.push(StatementLineage {
                stmt_index: idx,
                stmt_type: statement_kind(stmt).to_string(),
                start_line: span.start.line as u32,
                start_col: span.start.column as u32,
                end_line: span.end.line as u32,
                end_col: span.end.column as u32,
                report,
                statement: statement_text(sql, span).unwrap_or_else(|| stmt.to_string()),
            });
        }
        Ok(out)
    }

    pub fn analyze_statement(&self, stmt: &Statement) -> Result<LineageReport> {
        let mut report = LineageReport::default();
        for query in tree::lower_statement(stmt)? {
            report.merge(self.analyze_query(&query)?);
        }
        Ok(report)
    }

    pub fn analyze_query(&self, query: &QueryNode) -> Result<LineageReport> {
        Resolver::new(self.catalog, self.options).analyze(query)
    }
}

/// Projection lineage of `sql` in the generic dialect.
pub fn analyze_sql_lineage(sql: &str, catalog: &CatalogIndex) -> Result<LineageReport> {
    LineageAnalyzer::new(catalog).analyze_sql(sql)
}

fn statement_kind(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Query(_) => "QUERY",
        Statement::Insert(_) => "INSERT",
        Statement::CreateTable(_) => "CTAS",
        Statement::CreateView { .. } => "CREATE_VIEW",
        _ => "OTHER",
    }
}

/// The source text covered by `span`, or `None` when the parser recorded no
/// position for the statement.
fn statement_text(sql: &str, span: Span) -> Option<String> {
    if span.start.line == 0 || span.end.line == 0 {
        return None;
    }
    let start_line = span.start.line as usize;
    let end_line = span.end.line as usize;
    let start_col = span.start.column.max(1) as usize;
    let end_col = span.end.column.max(1) as usize;
    let lines: Vec<&str> = sql.lines().collect();

    if start_line == end_line {
        let line = lines.get(start_line - 1)?;
        return Some(
            line.chars()
                .skip(start_col - 1)
                .take(end_col.saturating_sub(start_col))
                .collect(),
        );
    }

    let mut text = String::new();
    if let Some(line) = lines.get(start_line - 1) {
        text.extend(line.chars().skip(start_col - 1));
        text.push('\n');
    }
    for line in lines.iter().take(end_line - 1).skip(start_line) {
        text.push_str(line);
        text.push('\n');
    }
    if let Some(line) = lines.get(end_line - 1) {
        text.extend(line.chars().take(end_col - 1));
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn loan_catalog() -> CatalogIndex {
        CatalogIndex::from_rows(vec![
            CatalogRow::new("ip", "mg", "loan", "loan_number"),
            CatalogRow::new("ip", "mg", "loan", "fpb"),
            CatalogRow::new("ip", "mg", "letter", "loan_number"),
            CatalogRow::new("ip", "mg", "letter", "letter_date"),
            CatalogRow::new("ip", "delq", "delq", "loan_number"),
            CatalogRow::new("ip", "delq", "delq", "dpd"),
        ])
    }

    fn lines(sql: &str, catalog: &CatalogIndex) -> Result<Vec<String>> {
        Ok(analyze_sql_lineage(sql, catalog)?.lines())
    }

    const LOAN_LETTER_DELQ: &str = "SELECT a.loan_number, b.letter_date, c.dpd \
        FROM mg.loan a \
        LEFT JOIN mg.letter b ON a.loan_number = b.loan_number \
        LEFT JOIN (SELECT loan_number, dpd FROM delq) c ON a.loan_number = c.loan_number";

    #[test]
    fn test_loan_letter_delq_projection() -> Result<()> {
        let catalog = loan_catalog();
        assert_eq!(
            lines(LOAN_LETTER_DELQ, &catalog)?,
            vec![
                "ip.delq.delq.dpd",
                "ip.mg.letter.letter_date",
                "ip.mg.loan.loan_number",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_loan_letter_delq_all_references() -> Result<()> {
        let catalog = loan_catalog();
        let report = LineageAnalyzer::new(&catalog)
            .with_options(ResolveOptions {
                mode: ReferenceMode::AllReferences,
                ..ResolveOptions::default()
            })
            .analyze_sql(LOAN_LETTER_DELQ)?;
        assert_eq!(
            report.lines(),
            vec![
                "ip.delq.delq.dpd",
                "ip.delq.delq.loan_number",
                "ip.mg.letter.letter_date",
                "ip.mg.letter.loan_number",
                "ip.mg.loan.loan_number",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_cte_cycle_is_reported() -> Result<()> {
        let catalog = loan_catalog();
        let report = analyze_sql_lineage(
            "WITH cte1 AS (SELECT * FROM cte2), cte2 AS (SELECT * FROM cte1) SELECT * FROM cte1",
            &catalog,
        )?;
        assert_eq!(
            report.warnings,
            vec![Warning::CteCycle {
                ctes: vec!["cte1".to_string(), "cte2".to_string()]
            }]
        );

        let err = LineageAnalyzer::new(&catalog)
            .with_options(ResolveOptions {
                on_cte_cycle: CyclePolicy::Fail,
                ..ResolveOptions::default()
            })
            .analyze_sql(
                "WITH cte1 AS (SELECT * FROM cte2), cte2 AS (SELECT * FROM cte1) SELECT * FROM cte1",
            )
            .unwrap_err();
        assert!(matches!(err, LineageError::CteCycle { .. }));
        Ok(())
    }

    #[test]
    fn test_cte_shadows_catalog_table() -> Result<()> {
        let catalog = loan_catalog();
        assert!(lines(
            "WITH loan AS (SELECT 1 AS fpb) SELECT fpb FROM loan",
            &catalog
        )?
        .is_empty());
        assert_eq!(
            lines(
                "WITH loan AS (SELECT dpd AS fpb FROM delq) SELECT l.fpb FROM loan l",
                &catalog
            )?,
            vec!["ip.delq.delq.dpd"]
        );
        Ok(())
    }

    #[test]
    fn test_three_level_cte_chain_keeps_physical_source() -> Result<()> {
        let catalog = loan_catalog();
        assert_eq!(
            lines(
                "WITH c1 AS (SELECT fpb AS a FROM mg.loan), \
                      c2 (b) AS (SELECT a FROM c1), \
                      c3 AS (SELECT b AS c FROM c2) \
                 SELECT c FROM c3",
                &catalog
            )?,
            vec!["ip.mg.loan.fpb"]
        );
        Ok(())
    }

    #[test]
    fn test_wildcard_matches_explicit_column_list() -> Result<()> {
        let catalog = loan_catalog();
        let star = analyze_sql_lineage("SELECT l.* FROM mg.loan l", &catalog)?;
        let listed = analyze_sql_lineage("SELECT l.loan_number, l.fpb FROM mg.loan l", &catalog)?;
        assert_eq!(star, listed);

        let through_subquery =
            analyze_sql_lineage("SELECT d.* FROM (SELECT * FROM mg.loan) d", &catalog)?;
        assert_eq!(through_subquery.records, listed.records);
        Ok(())
    }

    #[test]
    fn test_ambiguous_unqualified_column_fans_out() -> Result<()> {
        let catalog = loan_catalog();
        assert_eq!(
            lines(
                "SELECT loan_number FROM mg.loan JOIN mg.letter ON true",
                &catalog
            )?,
            vec!["ip.mg.letter.loan_number", "ip.mg.loan.loan_number"]
        );
        // the column exists only in one of the joined tables
        assert_eq!(
            lines("SELECT fpb FROM mg.loan JOIN mg.letter ON true", &catalog)?,
            vec!["ip.mg.loan.fpb"]
        );
        Ok(())
    }

    #[test]
    fn test_idempotent_and_order_independent() -> Result<()> {
        let catalog = loan_catalog();
        let first = analyze_sql_lineage(LOAN_LETTER_DELQ, &catalog)?;
        assert_eq!(first, analyze_sql_lineage(LOAN_LETTER_DELQ, &catalog)?);

        let reordered = analyze_sql_lineage(
            "SELECT c.dpd, b.letter_date, a.loan_number \
             FROM (SELECT dpd, loan_number FROM delq) c \
             LEFT JOIN mg.letter b ON c.loan_number = b.loan_number \
             LEFT JOIN mg.loan a ON a.loan_number = c.loan_number",
            &catalog,
        )?;
        assert_eq!(first.records, reordered.records);

        let ctes_a = analyze_sql_lineage(
            "WITH x AS (SELECT fpb FROM mg.loan), y AS (SELECT dpd FROM delq) \
             SELECT x.fpb, y.dpd FROM x JOIN y ON true",
            &catalog,
        )?;
        let ctes_b = analyze_sql_lineage(
            "WITH y AS (SELECT dpd FROM delq), x AS (SELECT fpb FROM mg.loan) \
             SELECT x.fpb, y.dpd FROM x JOIN y ON true",
            &catalog,
        )?;
        assert_eq!(ctes_a, ctes_b);
        Ok(())
    }

    #[test]
    fn test_set_operation_branches_merge() -> Result<()> {
        let catalog = loan_catalog();
        assert_eq!(
            lines(
                "SELECT u.v FROM (SELECT fpb AS v FROM mg.loan \
                 UNION ALL SELECT letter_date FROM mg.letter) u",
                &catalog
            )?,
            vec!["ip.mg.letter.letter_date", "ip.mg.loan.fpb"]
        );
        Ok(())
    }

    #[test]
    fn test_set_operation_order_by_uses_output_columns() -> Result<()> {
        let catalog = CatalogIndex::from_rows(vec![
            CatalogRow::new("ip", "mg", "loan", "id"),
            CatalogRow::new("ip", "mg", "letter", "id"),
            CatalogRow::new("ip", "x", "unrelated", "id"),
        ]);
        let report = LineageAnalyzer::new(&catalog)
            .with_options(ResolveOptions {
                mode: ReferenceMode::AllReferences,
                ..ResolveOptions::default()
            })
            .analyze_sql("SELECT id FROM loan UNION ALL SELECT id FROM letter ORDER BY id")?;
        assert_eq!(report.lines(), vec!["ip.mg.letter.id", "ip.mg.loan.id"]);
        Ok(())
    }

    #[test]
    fn test_using_join_keys_are_references() -> Result<()> {
        let catalog = CatalogIndex::from_rows(vec![
            CatalogRow::new("ip", "mg", "loan", "id"),
            CatalogRow::new("ip", "mg", "loan", "fpb"),
            CatalogRow::new("ip", "mg", "letter", "id"),
        ]);
        let analyzer = LineageAnalyzer::new(&catalog).with_options(ResolveOptions {
            mode: ReferenceMode::AllReferences,
            ..ResolveOptions::default()
        });
        assert_eq!(
            analyzer
                .analyze_sql("SELECT fpb FROM loan JOIN letter USING (id)")?
                .lines(),
            vec!["ip.mg.letter.id", "ip.mg.loan.fpb", "ip.mg.loan.id"]
        );
        // output columns only by default
        assert_eq!(
            lines("SELECT fpb FROM loan JOIN letter USING (id)", &catalog)?,
            vec!["ip.mg.loan.fpb"]
        );
        Ok(())
    }

    #[test]
    fn test_correlated_scalar_subquery_feeds_projection() -> Result<()> {
        let catalog = loan_catalog();
        assert_eq!(
            lines(
                "SELECT (SELECT max(letter_date) FROM mg.letter b \
                         WHERE b.loan_number = a.loan_number) AS last_letter \
                 FROM mg.loan a",
                &catalog
            )?,
            vec!["ip.mg.letter.letter_date"]
        );
        Ok(())
    }

    #[test]
    fn test_unknown_table_keeps_null_qualifiers() -> Result<()> {
        let catalog = loan_catalog();
        let report = analyze_sql_lineage("SELECT x, t.y FROM tmp_stage t", &catalog)?;
        assert_eq!(
            report.records,
            BTreeSet::from([
                LineageRecord::new(None, None, "tmp_stage", "x"),
                LineageRecord::new(None, None, "tmp_stage", "y"),
            ])
        );
        assert_eq!(report.lines(), vec!["?.?.tmp_stage.x", "?.?.tmp_stage.y"]);
        Ok(())
    }

    #[test]
    fn test_detailed_covers_insert_and_ctas() -> Result<()> {
        let catalog = loan_catalog();
        let infos = LineageAnalyzer::new(&catalog)
            .with_dialect("hive")?
            .analyze_sql_detailed(
                "INSERT INTO TABLE tgt SELECT fpb FROM mg.loan;\n\
                 CREATE TABLE plain (id INT);\n\
                 CREATE TABLE t2 AS SELECT dpd FROM delq;",
            )?;
        let summary: Vec<(usize, &str, Vec<String>)> = infos
            .iter()
            .map(|info| (info.stmt_index, info.stmt_type.as_str(), info.report.lines()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, "INSERT", vec!["ip.mg.loan.fpb".to_string()]),
                (2, "CTAS", vec!["ip.delq.delq.dpd".to_string()]),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_bad_input_is_an_error() {
        let catalog = loan_catalog();
        assert!(matches!(
            LineageAnalyzer::new(&catalog).with_dialect("cobol"),
            Err(LineageError::UnknownDialect(_))
        ));
        assert!(matches!(
            analyze_sql_lineage("SELEC nothing FROM", &catalog),
            Err(LineageError::Parse(_))
        ));
    }
}
