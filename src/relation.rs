//! Relations, bindings and the scope chain shared by the resolver stages.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogEntry;

/// A resolved physical origin of a column reference.
///
/// Ordering is (database, schema, table, column) with unknown qualifiers
/// first, which is the presentation order of a lineage set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineageRecord {
    pub database: Option<String>,
    pub schema: Option<String>,
    pub table: String,
    pub column: String,
}

impl LineageRecord {
    pub fn new(
        database: Option<&str>,
        schema: Option<&str>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            database: database.map(str::to_string),
            schema: schema.map(str::to_string),
            table: table.into(),
            column: column.into(),
        }
    }
}

impl From<&CatalogEntry> for LineageRecord {
    fn from(entry: &CatalogEntry) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            database: non_empty(&entry.database),
            schema: non_empty(&entry.schema),
            table: entry.table.clone(),
            column: entry.column.clone(),
        }
    }
}

impl fmt::Display for LineageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.database.as_deref().unwrap_or("?"),
            self.schema.as_deref().unwrap_or("?"),
            self.table,
            self.column
        )
    }
}

/// A named output column of a derived relation together with one physical
/// source it reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ColumnBinding {
    pub name: String,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub table: String,
    pub column: String,
}

impl ColumnBinding {
    pub fn source(&self) -> LineageRecord {
        LineageRecord {
            database: self.database.clone(),
            schema: self.schema.clone(),
            table: self.table.clone(),
            column: self.column.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalTable {
    pub database: Option<String>,
    pub schema: Option<String>,
    pub table: String,
}

impl PhysicalTable {
    /// The record for `column` read from this table, whether or not the
    /// catalog lists that column.
    pub fn record(&self, column: &str) -> LineageRecord {
        LineageRecord::new(
            self.database.as_deref(),
            self.schema.as_deref(),
            self.table.clone(),
            column,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedColumn {
    pub name: String,
    pub sources: BTreeSet<LineageRecord>,
}

impl DerivedColumn {
    pub fn new(name: impl Into<String>, sources: BTreeSet<LineageRecord>) -> Self {
        Self {
            name: name.into(),
            sources,
        }
    }
}

/// Output of a resolved subquery or CTE body, in projection order.
///
/// Columns computed only from constants keep their slot with no sources so
/// positional renames and set operations stay aligned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedRelation {
    pub columns: Vec<DerivedColumn>,
}

impl DerivedRelation {
    pub fn new(columns: Vec<DerivedColumn>) -> Self {
        Self { columns }
    }

    /// Flattened `(name, source)` bindings in the order they were produced.
    pub fn bindings(&self) -> Vec<ColumnBinding> {
        self.columns
            .iter()
            .flat_map(|col| {
                col.sources.iter().map(|src| ColumnBinding {
                    name: col.name.clone(),
                    database: src.database.clone(),
                    schema: src.schema.clone(),
                    table: src.table.clone(),
                    column: src.column.clone(),
                })
            })
            .collect()
    }

    pub fn exposes(&self, name: &str) -> bool {
        self.columns.iter().any(|col| col.name == name)
    }

    pub fn sources_of(&self, name: &str) -> BTreeSet<LineageRecord> {
        self.columns
            .iter()
            .filter(|col| col.name == name)
            .flat_map(|col| col.sources.iter().cloned())
            .collect()
    }

    pub fn all_sources(&self) -> BTreeSet<LineageRecord> {
        self.columns
            .iter()
            .flat_map(|col| col.sources.iter().cloned())
            .collect()
    }

    /// Apply a column-alias list (`AS d (x, y)` / `WITH c (x, y)`)
    /// positionally. Extra names beyond the output width are ignored.
    pub fn renamed(mut self, names: &[String]) -> Self {
        for (col, name) in self.columns.iter_mut().zip(names) {
            col.name = name.clone();
        }
        self
    }

    /// Fold a set-operation branch into this one: column `i` of `other`
    /// feeds column `i` here, names stay those of the left branch.
    pub fn merge_positional(&mut self, other: DerivedRelation) {
        for (i, col) in other.columns.into_iter().enumerate() {
            match self.columns.get_mut(i) {
                Some(existing) => existing.sources.extend(col.sources),
                None => self.columns.push(col),
            }
        }
    }
}

/// Anything a FROM/JOIN source can denote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    Physical(PhysicalTable),
    Derived(DerivedRelation),
}

#[derive(Debug, Clone)]
pub struct ScopeEntry {
    pub alias: Option<String>,
    pub relation: Relation,
}

#[derive(Debug, Clone)]
enum CteSlot {
    // declared in the WITH clause, body not resolved yet
    Pending,
    // own name while its non-recursive body resolves
    Hidden,
    Resolved(DerivedRelation),
}

/// Result of looking a name up in the CTE registries of a scope chain.
#[derive(Debug, Clone, Copy)]
pub enum CteBinding<'a> {
    Resolved(&'a DerivedRelation),
    Pending,
}

/// The aliases visible at one nesting level, chained to the enclosing level.
///
/// A scope owns its own entries and CTE registry and only borrows its
/// parent, so a child never outlives the query level that created it.
#[derive(Debug)]
pub struct Scope<'p> {
    parent: Option<&'p Scope<'p>>,
    entries: Vec<ScopeEntry>,
    ctes: HashMap<String, CteSlot>,
    has_from: bool,
}

impl<'p> Scope<'p> {
    pub fn root() -> Self {
        Self {
            parent: None,
            entries: Vec::new(),
            ctes: HashMap::new(),
            has_from: false,
        }
    }

    pub fn child(parent: &'p Scope<'p>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::root()
        }
    }

    pub fn parent(&self) -> Option<&'p Scope<'p>> {
        self.parent
    }

    /// Sources introduced at this level, in FROM/JOIN order.
    pub fn entries(&self) -> &[ScopeEntry] {
        &self.entries
    }

    pub fn has_from(&self) -> bool {
        self.has_from
    }

    pub fn mark_from(&mut self) {
        self.has_from = true;
    }

    /// Register a source. Returns `true` when the alias was already bound at
    /// this level; the newer binding wins lookups either way.
    pub fn bind(&mut self, alias: Option<String>, relation: Relation) -> bool {
        let duplicate = alias
            .as_deref()
            .is_some_and(|name| self.lookup_local(name).is_some());
        self.entries.push(ScopeEntry { alias, relation });
        duplicate
    }

    pub fn lookup_local(&self, alias: &str) -> Option<&Relation> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.alias.as_deref() == Some(alias))
            .map(|entry| &entry.relation)
    }

    /// Resolve an alias, innermost level first.
    pub fn lookup(&self, alias: &str) -> Option<&Relation> {
        let mut level: Option<&Scope<'p>> = Some(self);
        while let Some(scope) = level {
            if let Some(relation) = scope.lookup_local(alias) {
                return Some(relation);
            }
            level = scope.parent;
        }
        None
    }

    pub fn declare_cte(&mut self, name: &str) {
        self.ctes.insert(name.to_string(), CteSlot::Pending);
    }

    pub fn hide_cte(&mut self, name: &str) {
        self.ctes.insert(name.to_string(), CteSlot::Hidden);
    }

    pub fn define_cte(&mut self, name: &str, relation: DerivedRelation) {
        self.ctes
            .insert(name.to_string(), CteSlot::Resolved(relation));
    }

    /// Find the CTE a bare table name refers to. A hidden slot is skipped so
    /// the name falls through to enclosing levels.
    pub fn lookup_cte(&self, name: &str) -> Option<CteBinding<'_>> {
        let mut level: Option<&Scope<'p>> = Some(self);
        while let Some(scope) = level {
            match scope.ctes.get(name) {
                Some(CteSlot::Resolved(relation)) => return Some(CteBinding::Resolved(relation)),
                Some(CteSlot::Pending) => return Some(CteBinding::Pending),
                Some(CteSlot::Hidden) | None => {}
            }
            level = scope.parent;
        }
        None
    }

    /// Whether `name` denotes a CTE or a derived alias anywhere in the chain,
    /// so that it must never be read as a catalog table.
    pub fn shadows(&self, name: &str) -> bool {
        let mut level: Option<&Scope<'p>> = Some(self);
        while let Some(scope) = level {
            if matches!(
                scope.ctes.get(name),
                Some(CteSlot::Pending | CteSlot::Resolved(_))
            ) {
                return true;
            }
            let derived_alias = scope.entries.iter().any(|entry| {
                entry.alias.as_deref() == Some(name)
                    && matches!(entry.relation, Relation::Derived(_))
            });
            if derived_alias {
                return true;
            }
            level = scope.parent;
        }
        false
    }

    /// Whether every source in the chain is a physical table the catalog has
    /// no rows for, i.e. nothing in scope can answer for a bare column.
    pub fn is_opaque(&self, known_table: impl Fn(&PhysicalTable) -> bool) -> bool {
        let mut level: Option<&Scope<'p>> = Some(self);
        while let Some(scope) = level {
            for entry in &scope.entries {
                match &entry.relation {
                    Relation::Physical(table) if !known_table(table) => {}
                    _ => return false,
                }
            }
            level = scope.parent;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rec(table: &str, column: &str) -> LineageRecord {
        LineageRecord::new(Some("ip"), Some("mg"), table, column)
    }

    fn physical(table: &str) -> Relation {
        Relation::Physical(PhysicalTable {
            database: Some("ip".to_string()),
            schema: Some("mg".to_string()),
            table: table.to_string(),
        })
    }

    fn derived(cols: &[(&str, &str)]) -> DerivedRelation {
        DerivedRelation::new(
            cols.iter()
                .map(|(name, src)| DerivedColumn::new(*name, BTreeSet::from([rec("t", src)])))
                .collect(),
        )
    }

    #[test]
    fn test_records_sort_unknown_qualifiers_first() {
        let mut records = vec![
            rec("loan", "fpb"),
            LineageRecord::new(None, None, "zeta", "a"),
            LineageRecord::new(Some("ip"), None, "loan", "fpb"),
        ];
        records.sort();
        assert_eq!(records[0].database, None);
        assert_eq!(records[1].schema, None);
        assert_eq!(records[2].to_string(), "ip.mg.loan.fpb");
        assert_eq!(records[0].to_string(), "?.?.zeta.a");
    }

    #[test]
    fn test_lookup_prefers_innermost_and_last_binding() {
        let mut outer = Scope::root();
        outer.bind(Some("a".to_string()), physical("outer_a"));
        outer.bind(Some("b".to_string()), physical("outer_b"));
        let mut inner = Scope::child(&outer);
        assert!(!inner.bind(Some("a".to_string()), physical("inner_a")));
        assert!(inner.bind(Some("a".to_string()), physical("inner_a2")));

        assert_eq!(inner.lookup("a"), Some(&physical("inner_a2")));
        assert_eq!(inner.lookup("b"), Some(&physical("outer_b")));
        assert_eq!(inner.lookup("c"), None);
    }

    #[test]
    fn test_hidden_cte_falls_through_to_parent() {
        let mut outer = Scope::root();
        outer.define_cte("t", derived(&[("x", "x")]));
        let mut inner = Scope::child(&outer);
        inner.declare_cte("t");
        assert!(matches!(inner.lookup_cte("t"), Some(CteBinding::Pending)));
        inner.hide_cte("t");
        assert!(matches!(inner.lookup_cte("t"), Some(CteBinding::Resolved(_))));
        assert!(inner.shadows("t"));
        assert!(!inner.shadows("loan"));
    }

    #[test]
    fn test_derived_rename_and_positional_merge() {
        let mut left = derived(&[("id", "id"), ("v", "v")]).renamed(&["x".to_string()]);
        left.merge_positional(derived(&[("other_id", "id2"), ("w", "w"), ("extra", "e")]));

        let names: Vec<&str> = left.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["x", "v", "extra"]);
        assert_eq!(
            left.sources_of("x"),
            BTreeSet::from([rec("t", "id"), rec("t", "id2")])
        );
        assert_eq!(left.bindings().len(), 5);
        assert!(left.bindings().iter().all(|b| b.source().table == "t"));
    }

    #[test]
    fn test_opaque_scope_only_holds_unknown_tables() {
        let mut scope = Scope::root();
        scope.bind(Some("m".to_string()), physical("mystery"));
        assert!(scope.is_opaque(|_| false));
        assert!(!scope.is_opaque(|t| t.table == "mystery"));
        scope.bind(Some("d".to_string()), Relation::Derived(DerivedRelation::default()));
        assert!(!scope.is_opaque(|_| false));
    }
}
