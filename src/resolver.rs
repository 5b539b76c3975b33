//! Column resolution over a lowered query.
//!
//! Each SELECT is handled in two phases: its FROM sources are turned into a
//! [`Scope`] (subqueries and CTE bodies resolved first, see `scope` and
//! `cte`), then every column reference is resolved against that scope and
//! the catalog. Derived relations flow upward as plain values; only the
//! outermost output (or, in [`ReferenceMode::AllReferences`], every resolved
//! reference) lands in the report.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogIndex;
use crate::error::Result;
use crate::relation::{DerivedColumn, DerivedRelation, LineageRecord, Relation, Scope};
use crate::report::{LineageReport, Warning};
use crate::tree::{ColumnRef, Projection, QueryNode, SelectNode, SetNode, ValueExpr};
use crate::wildcard;

/// Which resolved references end up in the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    /// Lineage of the outermost query's output columns.
    #[default]
    Projection,
    /// Every column reference resolved anywhere in the query, filters and
    /// join conditions included.
    AllReferences,
}

/// What to do when sibling CTEs depend on each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePolicy {
    /// Record a warning and resolve in declaration order.
    #[default]
    Warn,
    /// Abort with [`crate::LineageError::CteCycle`].
    Fail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveOptions {
    #[serde(default)]
    pub mode: ReferenceMode,
    #[serde(default)]
    pub on_cte_cycle: CyclePolicy,
}

/// Resolves one query against a catalog snapshot.
pub struct Resolver<'c> {
    pub(crate) catalog: &'c CatalogIndex,
    pub(crate) options: ResolveOptions,
    records: BTreeSet<LineageRecord>,
    pub(crate) warnings: Vec<Warning>,
}

impl<'c> Resolver<'c> {
    pub fn new(catalog: &'c CatalogIndex, options: ResolveOptions) -> Self {
        Self {
            catalog,
            options,
            records: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }

    /// Resolve `query` and return its lineage.
    pub fn analyze(mut self, query: &QueryNode) -> Result<LineageReport> {
        let root = Scope::root();
        let output = self.resolve_query(query, &root)?;
        self.records.extend(output.all_sources());
        Ok(LineageReport {
            records: self.records,
            warnings: self.warnings,
        })
    }

    /// Resolve a full query (its WITH clause, body and trailing clauses) in
    /// a fresh scope below `parent`.
    pub(crate) fn resolve_query(
        &mut self,
        query: &QueryNode,
        parent: &Scope<'_>,
    ) -> Result<DerivedRelation> {
        let mut scope = Scope::child(parent);
        self.resolve_ctes(&query.ctes, query.recursive, &mut scope)?;
        let output = self.resolve_body(&query.body, &scope)?;
        for expr in &query.trailing {
            self.resolve_ordering(expr, &output, &scope)?;
        }
        Ok(output)
    }

    /// ORDER BY of a set operation: bare names are output columns of the
    /// query, only qualified names and subqueries reach the scope.
    fn resolve_ordering(
        &mut self,
        expr: &ValueExpr,
        output: &DerivedRelation,
        scope: &Scope<'_>,
    ) -> Result<()> {
        let mut sources = BTreeSet::new();
        for column in &expr.columns {
            match column.qualifier {
                None if output.exposes(&column.name) => {
                    sources.extend(output.sources_of(&column.name))
                }
                None => {
                    tracing::debug!(
                        column = %column.name,
                        "ORDER BY name is not an output column, dropping"
                    );
                }
                Some(_) => sources.extend(self.resolve_column(column, scope)),
            }
        }
        for query in &expr.subqueries {
            sources.extend(self.resolve_query(query, scope)?.all_sources());
        }
        if self.options.mode == ReferenceMode::AllReferences {
            self.records.extend(sources);
        }
        Ok(())
    }

    fn resolve_body(&mut self, body: &SetNode, scope: &Scope<'_>) -> Result<DerivedRelation> {
        match body {
            SetNode::Select(select) => self.resolve_select(select, scope),
            SetNode::Query(query) => self.resolve_query(query, scope),
            SetNode::SetOperation { left, right } => {
                let mut output = self.resolve_body(left, scope)?;
                output.merge_positional(self.resolve_body(right, scope)?);
                Ok(output)
            }
            SetNode::Opaque(expr) => {
                self.resolve_value(expr, scope)?;
                Ok(DerivedRelation::default())
            }
        }
    }

    fn resolve_select(
        &mut self,
        select: &SelectNode,
        parent: &Scope<'_>,
    ) -> Result<DerivedRelation> {
        let scope = self.build_scope(select, parent)?;

        let mut columns = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            match item {
                Projection::Wildcard(wildcard) => {
                    let expanded =
                        wildcard::expand(&scope, wildcard.qualifier.as_deref(), self.catalog);
                    if self.options.mode == ReferenceMode::AllReferences {
                        for column in &expanded {
                            self.records.extend(column.sources.iter().cloned());
                        }
                    }
                    columns.extend(expanded);
                }
                Projection::Expr { name, expr } => {
                    let sources = self.resolve_value(expr, &scope)?;
                    columns.push(DerivedColumn::new(name.clone(), sources));
                }
            }
        }

        for filter in &select.filters {
            self.resolve_value(filter, &scope)?;
        }
        Ok(DerivedRelation::new(columns))
    }

    /// Physical sources of one opaque expression: its own column references
    /// plus the output of every subquery it contains.
    pub(crate) fn resolve_value(
        &mut self,
        expr: &ValueExpr,
        scope: &Scope<'_>,
    ) -> Result<BTreeSet<LineageRecord>> {
        let mut sources = BTreeSet::new();
        for column in &expr.columns {
            sources.extend(self.resolve_column(column, scope));
        }
        for query in &expr.subqueries {
            sources.extend(self.resolve_query(query, scope)?.all_sources());
        }
        if self.options.mode == ReferenceMode::AllReferences {
            self.records.extend(sources.iter().cloned());
        }
        Ok(sources)
    }

    pub(crate) fn resolve_column(
        &self,
        column: &ColumnRef,
        scope: &Scope<'_>,
    ) -> BTreeSet<LineageRecord> {
        match (column.qualifier.as_deref(), &column.field_root) {
            (Some(qualifier), Some((alias, root)))
                if scope.lookup(qualifier).is_none() && scope.lookup(alias).is_some() =>
            {
                self.resolve_qualified(alias, root, scope)
            }
            (Some(qualifier), _) => self.resolve_qualified(qualifier, &column.name, scope),
            (None, _) => self.resolve_unqualified(&column.name, scope),
        }
    }

    fn resolve_qualified(
        &self,
        qualifier: &str,
        name: &str,
        scope: &Scope<'_>,
    ) -> BTreeSet<LineageRecord> {
        match scope.lookup(qualifier) {
            Some(Relation::Physical(table)) => BTreeSet::from([table.record(name)]),
            Some(Relation::Derived(derived)) => {
                let sources = derived.sources_of(name);
                if sources.is_empty() {
                    tracing::debug!(qualifier, column = name, "derived column has no sources");
                }
                sources
            }
            None => {
                tracing::debug!(qualifier, column = name, "unresolved qualifier, dropping");
                BTreeSet::new()
            }
        }
    }

    fn resolve_unqualified(&self, name: &str, scope: &Scope<'_>) -> BTreeSet<LineageRecord> {
        let mut level = Some(scope);
        while let Some(current) = level {
            let mut matched = false;
            let mut sources = BTreeSet::new();
            for entry in current.entries() {
                match &entry.relation {
                    Relation::Physical(table) => {
                        if self.catalog.has_column(
                            &table.table,
                            table.database.as_deref(),
                            table.schema.as_deref(),
                            name,
                        ) {
                            matched = true;
                            sources.insert(table.record(name));
                        }
                    }
                    Relation::Derived(derived) => {
                        if derived.exposes(name) {
                            matched = true;
                            sources.extend(derived.sources_of(name));
                        }
                    }
                }
            }
            if matched {
                return sources;
            }
            if let [only] = current.entries() {
                if let Relation::Physical(table) = &only.relation {
                    if !self.catalog.knows_table(&table.table) {
                        return BTreeSet::from([table.record(name)]);
                    }
                }
            }
            level = current.parent();
        }

        if scope.is_opaque(|table| self.catalog.knows_table(&table.table)) {
            return self
                .catalog
                .tables_of(name)
                .into_iter()
                .filter(|entry| !scope.shadows(&entry.table))
                .map(LineageRecord::from)
                .collect();
        }
        tracing::debug!(column = name, "no source in scope exposes column, dropping");
        BTreeSet::new()
    }
}
