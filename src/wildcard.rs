//! Expansion of `*` and `alias.*` projections.

use std::collections::BTreeSet;

use itertools::Itertools;

use crate::catalog::CatalogIndex;
use crate::relation::{DerivedColumn, LineageRecord, Relation, Scope};

/// Output columns a wildcard stands for in `scope`.
///
/// `alias.*` takes the aliased relation's columns; a bare `*` takes every
/// source of the current SELECT in FROM/JOIN order. A bare `*` without any
/// FROM clause stands for the whole catalog.
pub fn expand(
    scope: &Scope<'_>,
    qualifier: Option<&str>,
    catalog: &CatalogIndex,
) -> Vec<DerivedColumn> {
    match qualifier {
        Some(alias) => match scope.lookup(alias) {
            Some(relation) => expand_relation(relation, catalog),
            None => {
                tracing::debug!(alias, "wildcard qualifier not in scope");
                Vec::new()
            }
        },
        None if !scope.has_from() => catalog
            .entries()
            .iter()
            .map(|entry| {
                DerivedColumn::new(
                    entry.column.clone(),
                    BTreeSet::from([LineageRecord::from(entry)]),
                )
            })
            .collect(),
        None => scope
            .entries()
            .iter()
            .flat_map(|entry| expand_relation(&entry.relation, catalog))
            .collect(),
    }
}

/// Columns of one relation: a derived relation's outputs in production
/// order, or every catalog column of a physical table. A table the catalog
/// does not list expands to nothing.
pub fn expand_relation(relation: &Relation, catalog: &CatalogIndex) -> Vec<DerivedColumn> {
    match relation {
        Relation::Derived(derived) => derived.columns.clone(),
        Relation::Physical(table) => catalog
            .columns_in(
                &table.table,
                table.database.as_deref(),
                table.schema.as_deref(),
            )
            .map(|entry| entry.column.as_str())
            .unique()
            .map(|column| DerivedColumn::new(column, BTreeSet::from([table.record(column)])))
            .collect(),
    }
}
