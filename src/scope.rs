//! Turning the FROM/JOIN sources of one SELECT into a [`Scope`].

use crate::error::Result;
use crate::relation::{CteBinding, DerivedRelation, PhysicalTable, Relation, Scope};
use crate::report::Warning;
use crate::resolver::Resolver;
use crate::tree::{DerivedSource, SelectNode, Source, TableRef};
use crate::wildcard;

impl<'c> Resolver<'c> {
    /// Build the scope of `select` below `parent`. Every subquery source is
    /// resolved completely before it is registered.
    pub(crate) fn build_scope<'p>(
        &mut self,
        select: &SelectNode,
        parent: &'p Scope<'p>,
    ) -> Result<Scope<'p>> {
        let mut scope = Scope::child(parent);
        if select.has_from {
            scope.mark_from();
        }

        for source in &select.sources {
            let (alias, relation) = match source {
                Source::Table(table) => (
                    Some(table.binding_name()),
                    self.table_relation(table, &scope),
                ),
                Source::Derived(derived) => {
                    let relation = if derived.lateral {
                        self.derived_relation(derived, &scope)?
                    } else {
                        self.derived_relation(derived, parent)?
                    };
                    (derived.alias.clone(), Relation::Derived(relation))
                }
            };
            if scope.bind(alias.clone(), relation) {
                if let Some(alias) = alias {
                    tracing::warn!("Duplicate alias `{}` in FROM clause, later source wins", alias);
                    self.warnings.push(Warning::DuplicateAlias { alias });
                }
            }
        }
        Ok(scope)
    }

    /// A column-alias list (`FROM loan x (k, v)`) renames the table's known
    /// columns by position; a table without known columns exposes none.
    fn table_relation(&self, table: &TableRef, scope: &Scope<'_>) -> Relation {
        let relation = self.named_relation(table, scope);
        if table.columns.is_empty() {
            return relation;
        }
        let columns = wildcard::expand_relation(&relation, self.catalog);
        if columns.is_empty() {
            tracing::debug!(
                table = %table.name.table,
                "column aliases over a table with no known columns"
            );
        }
        Relation::Derived(DerivedRelation::new(columns).renamed(&table.columns))
    }

    /// A CTE visible from `scope` wins over any catalog table of the same
    /// bare name.
    fn named_relation(&self, table: &TableRef, scope: &Scope<'_>) -> Relation {
        if table.name.is_bare() {
            match scope.lookup_cte(&table.name.table) {
                Some(CteBinding::Resolved(relation)) => {
                    return Relation::Derived(relation.clone())
                }
                Some(CteBinding::Pending) => {
                    tracing::debug!(cte = %table.name.table, "reference to unresolved CTE");
                    return Relation::Derived(DerivedRelation::default());
                }
                None => {}
            }
        }

        let (database, schema) = self.catalog.qualify(
            &table.name.table,
            table.name.database.as_deref(),
            table.name.schema.as_deref(),
        );
        Relation::Physical(PhysicalTable {
            database: database.map(str::to_string),
            schema: schema.map(str::to_string),
            table: table.name.table.clone(),
        })
    }

    fn derived_relation(
        &mut self,
        derived: &DerivedSource,
        parent: &Scope<'_>,
    ) -> Result<DerivedRelation> {
        let relation = self.resolve_query(&derived.query, parent)?;
        Ok(relation.renamed(&derived.columns))
    }
}
