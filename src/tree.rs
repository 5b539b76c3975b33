//! The query model the resolver works on, lowered from the sqlparser AST.
//!
//! Lowering keeps only what lineage needs: FROM/JOIN sources, projections,
//! CTE definitions and the column references (plus nested subqueries) found
//! inside every other clause. Expressions themselves are opaque; CASE,
//! window functions and the like only matter for the columns they mention.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{
    Expr, Ident, JoinConstraint, JoinOperator, ObjectName, ObjectNamePart, Query, Select,
    SelectItem, SelectItemQualifiedWildcardKind, SetExpr, Statement, TableAlias, TableFactor,
    TableWithJoins, Visit, Visitor,
};

use crate::catalog::normalize_name;
use crate::error::{LineageError, Result};

/// A possibly-qualified physical table name as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub database: Option<String>,
    pub schema: Option<String>,
    pub table: String,
}

impl TableName {
    pub fn is_bare(&self) -> bool {
        self.database.is_none() && self.schema.is_none()
    }
}

/// `FROM name [alias [(columns)]]`: a catalog table or a CTE, decided
/// during scope building.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: TableName,
    pub alias: Option<String>,
    pub columns: Vec<String>,
}

impl TableRef {
    /// The key this source is registered under in its scope.
    pub fn binding_name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.name.table.clone())
    }
}

/// `FROM (subquery) [alias [(columns)]]`
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSource {
    pub query: Box<QueryNode>,
    pub alias: Option<String>,
    pub columns: Vec<String>,
    pub lateral: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Table(TableRef),
    Derived(DerivedSource),
}

/// A column reference, `qualifier.name` or bare `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
    /// For three or more parts, the leading `alias.column` pair. Read when
    /// `qualifier` is not in scope: `t.s.f` is field `f` of struct column
    /// `t.s`, lineage stops at the column.
    pub field_root: Option<(String, String)>,
}

impl ColumnRef {
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
            field_root: None,
        }
    }

    pub fn qualified(qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            qualifier: Some(qualifier.into()),
            name: name.into(),
            field_root: None,
        }
    }

    // `db.schema.t.col` keeps only the table part as qualifier
    fn from_idents(idents: &[Ident]) -> Option<Self> {
        match idents {
            [] => None,
            [name] => Some(Self::bare(normalize(name))),
            [qualifier, name] => Some(Self::qualified(normalize(qualifier), normalize(name))),
            [alias, column, .., qualifier, name] => Some(Self {
                field_root: Some((normalize(alias), normalize(column))),
                ..Self::qualified(normalize(qualifier), normalize(name))
            }),
        }
    }
}

/// `*` or `qualifier.*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardRef {
    pub qualifier: Option<String>,
}

/// The column references of one opaque expression, and the subqueries it
/// contains (scalar, IN, EXISTS).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueExpr {
    pub columns: Vec<ColumnRef>,
    pub subqueries: Vec<QueryNode>,
}

impl ValueExpr {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.subqueries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Wildcard(WildcardRef),
    Expr { name: String, expr: ValueExpr },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectNode {
    /// FROM/JOIN sources in order, nested joins flattened.
    pub sources: Vec<Source>,
    pub projection: Vec<Projection>,
    /// Every other clause: WHERE, JOIN conditions, GROUP BY, HAVING, QUALIFY,
    /// ORDER BY, window definitions, lateral views.
    pub filters: Vec<ValueExpr>,
    /// Whether a FROM clause was written, even one binding no relation.
    pub has_from: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetNode {
    Select(Box<SelectNode>),
    Query(Box<QueryNode>),
    SetOperation {
        left: Box<SetNode>,
        right: Box<SetNode>,
    },
    /// VALUES and other bodies exposing no tracked columns.
    Opaque(ValueExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CteDef {
    pub name: String,
    pub columns: Vec<String>,
    pub body: QueryNode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryNode {
    pub ctes: Vec<CteDef>,
    pub recursive: bool,
    pub body: SetNode,
    /// Query-level ORDER BY when the body is not a plain SELECT.
    pub trailing: Vec<ValueExpr>,
}

impl QueryNode {
    /// Bare table names this query reads from outside itself, nested bodies
    /// included. Names bound by a WITH inside the query are not references.
    /// Used to find dependencies between sibling CTEs.
    pub fn table_references(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_table_references(&BTreeSet::new(), &mut out);
        out
    }

    fn collect_table_references(&self, shadowed: &BTreeSet<String>, out: &mut BTreeSet<String>) {
        let mut shadowed = shadowed.clone();
        shadowed.extend(self.ctes.iter().map(|cte| cte.name.clone()));
        for cte in &self.ctes {
            cte.body.collect_table_references(&shadowed, out);
        }
        self.body.collect_table_references(&shadowed, out);
        for expr in &self.trailing {
            expr.collect_table_references(&shadowed, out);
        }
    }
}

impl SetNode {
    fn collect_table_references(&self, shadowed: &BTreeSet<String>, out: &mut BTreeSet<String>) {
        match self {
            SetNode::Select(select) => {
                for source in &select.sources {
                    match source {
                        Source::Table(table)
                            if table.name.is_bare() && !shadowed.contains(&table.name.table) =>
                        {
                            out.insert(table.name.table.clone());
                        }
                        Source::Table(_) => {}
                        Source::Derived(derived) => {
                            derived.query.collect_table_references(shadowed, out)
                        }
                    }
                }
                for item in &select.projection {
                    if let Projection::Expr { expr, .. } = item {
                        expr.collect_table_references(shadowed, out);
                    }
                }
                for expr in &select.filters {
                    expr.collect_table_references(shadowed, out);
                }
            }
            SetNode::Query(query) => query.collect_table_references(shadowed, out),
            SetNode::SetOperation { left, right } => {
                left.collect_table_references(shadowed, out);
                right.collect_table_references(shadowed, out);
            }
            SetNode::Opaque(expr) => expr.collect_table_references(shadowed, out),
        }
    }
}

impl ValueExpr {
    fn collect_table_references(&self, shadowed: &BTreeSet<String>, out: &mut BTreeSet<String>) {
        for query in &self.subqueries {
            query.collect_table_references(shadowed, out);
        }
    }
}

/// Lower every outermost query reachable from a statement: the statement
/// itself for a plain query, the source of INSERT ... SELECT, the body of
/// CTAS / CREATE VIEW, and so on.
pub fn lower_statement(statement: &Statement) -> Result<Vec<QueryNode>> {
    let mut finder = QueryFinder::default();
    if let ControlFlow::Break(err) = statement.visit(&mut finder) {
        return Err(err);
    }
    Ok(finder.queries)
}

pub fn lower_query(query: &Query) -> Result<QueryNode> {
    let mut ctes = Vec::new();
    let mut recursive = false;
    if let Some(with) = &query.with {
        recursive = with.recursive;
        for cte in &with.cte_tables {
            ctes.push(CteDef {
                name: normalize(&cte.alias.name),
                columns: alias_columns(&cte.alias),
                body: lower_query(&cte.query)?,
            });
        }
    }

    let mut body = lower_set_expr(&query.body)?;
    let mut trailing = Vec::new();
    let order_by = collect_value(&query.order_by)?;
    if !order_by.is_empty() {
        match &mut body {
            SetNode::Select(select) => select.filters.push(order_by),
            _ => trailing.push(order_by),
        }
    }

    Ok(QueryNode {
        ctes,
        recursive,
        body,
        trailing,
    })
}

fn lower_set_expr(body: &SetExpr) -> Result<SetNode> {
    match body {
        SetExpr::Select(select) => Ok(SetNode::Select(Box::new(lower_select(select)?))),
        SetExpr::Query(query) => Ok(SetNode::Query(Box::new(lower_query(query)?))),
        SetExpr::SetOperation { left, right, .. } => Ok(SetNode::SetOperation {
            left: Box::new(lower_set_expr(left)?),
            right: Box::new(lower_set_expr(right)?),
        }),
        other => {
            tracing::debug!(body = %other, "query body exposes no tracked columns");
            Ok(SetNode::Opaque(collect_value(other)?))
        }
    }
}

fn lower_select(select: &Select) -> Result<SelectNode> {
    let mut node = SelectNode {
        has_from: !select.from.is_empty(),
        ..SelectNode::default()
    };
    lower_from(&select.from, &mut node)?;

    for item in &select.projection {
        node.projection.push(lower_select_item(item)?);
    }

    let clauses = [
        collect_value(&select.selection)?,
        collect_value(&select.group_by)?,
        collect_value(&select.having)?,
        collect_value(&select.qualify)?,
        collect_value(&select.named_window)?,
        collect_value(&select.lateral_views)?,
        collect_value(&select.cluster_by)?,
        collect_value(&select.distribute_by)?,
        collect_value(&select.sort_by)?,
    ];
    node.filters
        .extend(clauses.into_iter().filter(|clause| !clause.is_empty()));
    Ok(node)
}

fn lower_from(from: &[TableWithJoins], node: &mut SelectNode) -> Result<()> {
    for twj in from {
        lower_table_factor(&twj.relation, node)?;
        for join in &twj.joins {
            lower_table_factor(&join.relation, node)?;
            push_filter(node, collect_value(&join.join_operator)?);
            if let Some(JoinConstraint::Using(names)) = join_constraint(&join.join_operator) {
                push_filter(node, using_columns(names)?);
            }
        }
    }
    Ok(())
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Join(constraint)
        | JoinOperator::Inner(constraint)
        | JoinOperator::Left(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::Right(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint)
        | JoinOperator::Semi(constraint)
        | JoinOperator::LeftSemi(constraint)
        | JoinOperator::RightSemi(constraint)
        | JoinOperator::Anti(constraint)
        | JoinOperator::LeftAnti(constraint)
        | JoinOperator::RightAnti(constraint)
        | JoinOperator::StraightJoin(constraint)
        | JoinOperator::AsOf { constraint, .. } => Some(constraint),
        _ => None,
    }
}

// USING keys are plain names, not expressions; each reads both sides
fn using_columns(names: &[ObjectName]) -> Result<ValueExpr> {
    let mut expr = ValueExpr::default();
    for name in names {
        if let Some(column) = object_name_parts(name)?.pop() {
            expr.columns.push(ColumnRef::bare(column));
        }
    }
    Ok(expr)
}

fn lower_table_factor(factor: &TableFactor, node: &mut SelectNode) -> Result<()> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            node.sources.push(Source::Table(TableRef {
                name: table_name(name)?,
                alias: alias.as_ref().map(|a| normalize(&a.name)),
                columns: alias.as_ref().map(alias_columns).unwrap_or_default(),
            }));
        }
        TableFactor::Derived {
            lateral,
            subquery,
            alias,
            ..
        } => {
            node.sources.push(Source::Derived(DerivedSource {
                query: Box::new(lower_query(subquery)?),
                alias: alias.as_ref().map(|a| normalize(&a.name)),
                columns: alias.as_ref().map(alias_columns).unwrap_or_default(),
                lateral: *lateral,
            }));
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => lower_from(std::slice::from_ref(table_with_joins.as_ref()), node)?,
        other => {
            tracing::debug!(source = %other, "table factor binds no tracked relation");
            push_filter(node, collect_value(other)?);
        }
    }
    Ok(())
}

fn lower_select_item(item: &SelectItem) -> Result<Projection> {
    let projection = match item {
        SelectItem::UnnamedExpr(expr) => Projection::Expr {
            name: output_name(expr),
            expr: collect_value(expr)?,
        },
        SelectItem::ExprWithAlias { expr, alias } => Projection::Expr {
            name: normalize(alias),
            expr: collect_value(expr)?,
        },
        SelectItem::Wildcard(_) => Projection::Wildcard(WildcardRef { qualifier: None }),
        SelectItem::QualifiedWildcard(kind, _) => match kind {
            SelectItemQualifiedWildcardKind::ObjectName(name) => {
                let parts = object_name_parts(name)?;
                Projection::Wildcard(WildcardRef {
                    qualifier: parts.last().cloned(),
                })
            }
            SelectItemQualifiedWildcardKind::Expr(expr) => Projection::Expr {
                name: expr.to_string(),
                expr: collect_value(expr)?,
            },
        },
    };
    Ok(projection)
}

fn output_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => normalize(ident),
        Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(normalize)
            .unwrap_or_else(|| expr.to_string()),
        _ => expr.to_string(),
    }
}

fn table_name(name: &ObjectName) -> Result<TableName> {
    let mut parts = object_name_parts(name)?;
    let table = parts
        .pop()
        .ok_or_else(|| LineageError::UnsupportedName(name.to_string()))?;
    let schema = parts.pop();
    let database = parts.pop();
    Ok(TableName {
        database,
        schema,
        table,
    })
}

fn object_name_parts(name: &ObjectName) -> Result<Vec<String>> {
    let mut parts: Vec<String> = Vec::with_capacity(name.0.len());
    for part in &name.0 {
        match part {
            ObjectNamePart::Identifier(ident) => parts.push(normalize(ident)),
            ObjectNamePart::Function(_) => {
                return Err(LineageError::UnsupportedName(name.to_string()))
            }
        }
    }
    Ok(parts)
}

fn alias_columns(alias: &TableAlias) -> Vec<String> {
    alias.columns.iter().map(|c| normalize(&c.name)).collect()
}

fn normalize(ident: &Ident) -> String {
    normalize_name(&ident.value)
}

fn push_filter(node: &mut SelectNode, expr: ValueExpr) {
    if !expr.is_empty() {
        node.filters.push(expr);
    }
}

/// Collect the column references under any AST node without descending into
/// nested queries; those are lowered whole and kept as subqueries.
fn collect_value<V: Visit>(node: &V) -> Result<ValueExpr> {
    let mut collector = ExprCollector::default();
    if let ControlFlow::Break(err) = node.visit(&mut collector) {
        return Err(err);
    }
    Ok(collector.expr)
}

#[derive(Default)]
struct ExprCollector {
    depth: usize,
    expr: ValueExpr,
}

impl Visitor for ExprCollector {
    type Break = LineageError;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if self.depth == 0 {
            match lower_query(query) {
                Ok(node) => self.expr.subqueries.push(node),
                Err(err) => return ControlFlow::Break(err),
            }
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth = self.depth.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        match expr {
            Expr::Identifier(ident) => self.expr.columns.push(ColumnRef::bare(normalize(ident))),
            Expr::CompoundIdentifier(idents) => {
                if let Some(column) = ColumnRef::from_idents(idents) {
                    self.expr.columns.push(column);
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

#[derive(Default)]
struct QueryFinder {
    depth: usize,
    queries: Vec<QueryNode>,
}

impl Visitor for QueryFinder {
    type Break = LineageError;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if self.depth == 0 {
            match lower_query(query) {
                Ok(node) => self.queries.push(node),
                Err(err) => return ControlFlow::Break(err),
            }
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth = self.depth.saturating_sub(1);
        ControlFlow::Continue(())
    }
}
