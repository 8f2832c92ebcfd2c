/// SQL tree optimization infrastructure.
///
/// Provides a pass-based system for rewriting the bound SQL tree before it
/// is formatted. Each pass takes a tree, returns a potentially modified tree
/// and preserves both query semantics and the root output columns. Passes
/// run in a fixed order and later passes rely on the shape earlier ones leave.
use tracing::debug;

use crate::config::OptimizerConfig;
use crate::error::{QueryError, Result};
use crate::value::{DataType, Value};

use super::types::*;

/// A single rewrite pass over a SQL tree.
///
/// Passes should be pure functions: given the same input, they produce
/// the same output. This makes them composable and testable.
///
/// # Example
///
/// ```ignore
/// struct DropForUpdate;
///
/// impl OptimizationPass for DropForUpdate {
///     fn name(&self) -> &str { "drop_for_update" }
///     fn transform(&self, expr: SqlExpr) -> Result<SqlExpr> {
///         // Clear `for_update` on every select of the tree
///     }
/// }
/// ```
pub trait OptimizationPass: Send + Sync {
    /// Unique name identifying this pass.
    fn name(&self) -> &str;

    /// Optional description of what this pass does.
    fn description(&self) -> &str {
        ""
    }

    /// Rewrite a tree, returning the optimized version.
    /// Returns the tree unchanged if no rewrite applies.
    fn transform(&self, expr: SqlExpr) -> Result<SqlExpr>;
}

/// Manages and executes a pipeline of optimization passes.
#[derive(Default)]
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an optimizer with every built-in pass, in order.
    pub fn with_defaults() -> Self {
        Self::from_config(&OptimizerConfig::default())
    }

    /// Create an optimizer with the built-in passes the config enables.
    pub fn from_config(config: &OptimizerConfig) -> Self {
        let mut opt = Self::new();
        if config.enum_type_normalization {
            opt.add_pass(Box::new(EnumTypeNormalization));
        }
        if config.order_by_combination {
            opt.add_pass(Box::new(OrderByCombination));
        }
        if config.apply_join_rewrite {
            opt.add_pass(Box::new(ApplyJoinRewrite));
        }
        if config.redundant_subquery_elision {
            opt.add_pass(Box::new(RedundantSubqueryElision));
        }
        if config.auto_increment_insert_adjustment {
            opt.add_pass(Box::new(AutoIncrementInsertAdjustment));
        }
        opt
    }

    /// Add an optimization pass to the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    /// Run all optimization passes on a tree in order.
    pub fn optimize(&self, expr: SqlExpr) -> Result<SqlExpr> {
        let mut current = expr;
        for pass in &self.passes {
            debug!(pass = pass.name(), "running optimization pass");
            current = pass.transform(current)?;
        }
        Ok(current)
    }

    /// List registered pass names.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }
}

/// Built-in pass: gives both operands of an enum comparison one type.
///
/// An integer constant or placeholder compared with an enum becomes an enum
/// value. A conversion of an enum to its underlying integer is stripped
/// first, and re-added only when the other side is a computed integer.
struct EnumTypeNormalization;

impl OptimizationPass for EnumTypeNormalization {
    fn name(&self) -> &str {
        "enum_type_normalization"
    }

    fn description(&self) -> &str {
        "Types integer operands of enum comparisons and arithmetic as the enum"
    }

    fn transform(&self, expr: SqlExpr) -> Result<SqlExpr> {
        expr.transform_up(&mut |e| match e {
            SqlExpr::Binary { op, left, right } if !op.is_logical() => {
                let left = strip_enum_conversion(*left);
                let right = strip_enum_conversion(*right);
                let (left, right) = match (enum_type(&left), enum_type(&right)) {
                    (Some(name), None) => unify_enum(left, right, &name),
                    (None, Some(name)) => {
                        let (right, left) = unify_enum(right, left, &name);
                        (left, right)
                    }
                    _ => (left, right),
                };
                Ok(SqlExpr::binary(op, left, right))
            }
            other => Ok(other),
        })
    }
}

fn enum_type(expr: &SqlExpr) -> Option<String> {
    match expr.data_type().unwrap_nullable() {
        DataType::Enum(name) => Some(name.clone()),
        _ => None,
    }
}

fn strip_enum_conversion(expr: SqlExpr) -> SqlExpr {
    match expr {
        SqlExpr::Convert { operand, data_type }
            if operand.data_type().is_enum() && *data_type.unwrap_nullable() == DataType::Int =>
        {
            *operand
        }
        other => other,
    }
}

/// Returns `(enum_side, other)` rewritten to share one type.
fn unify_enum(enum_side: SqlExpr, other: SqlExpr, type_name: &str) -> (SqlExpr, SqlExpr) {
    match other {
        SqlExpr::Constant(value) => (enum_side, SqlExpr::Constant(as_enum(value, type_name))),
        SqlExpr::Placeholder { index, value } => (
            enum_side,
            SqlExpr::Placeholder {
                index,
                value: as_enum(value, type_name),
            },
        ),
        other if *other.data_type().unwrap_nullable() == DataType::Int => {
            let data_type = enum_side.data_type().underlying();
            let converted = SqlExpr::Convert {
                operand: Box::new(enum_side),
                data_type,
            };
            (converted, other)
        }
        other => (enum_side, other),
    }
}

fn as_enum(value: Value, type_name: &str) -> Value {
    match value {
        Value::Int(value) => Value::Enum {
            type_name: type_name.to_string(),
            value,
        },
        other => other,
    }
}

/// Built-in pass: lifts inner orderings into the select that reads them.
///
/// Orderings travel outward through derived tables so that the final
/// ordering is stated once, on the outermost select that can carry it.
/// A select marked `reverse` has its directions flipped afterwards.
struct OrderByCombination;

impl OptimizationPass for OrderByCombination {
    fn name(&self) -> &str {
        "order_by_combination"
    }

    fn description(&self) -> &str {
        "Moves derived-table orderings outward and applies reversed orderings"
    }

    fn transform(&self, expr: SqlExpr) -> Result<SqlExpr> {
        rewrite_selects(expr, &mut combine_orderings)
    }
}

fn combine_orderings(mut select: SelectExpr) -> Result<SelectExpr> {
    select.from = match select.from.take() {
        Some(SqlExpr::Select(inner)) => {
            let receives = select.group_by.is_empty() && !select.distinct && !select.has_aggregates();
            let (inner, lifted) = lift_ordering(*inner, receives);
            select.order_by.extend(lifted);
            Some(SqlExpr::Select(Box::new(inner)))
        }
        other => other,
    };
    if select.reverse {
        if select.order_by.is_empty() {
            return Err(QueryError::binding(
                "Last and LastOrDefault require an ordered sequence",
            ));
        }
        for ordering in &mut select.order_by {
            ordering.direction = ordering.direction.reversed();
        }
        select.reverse = false;
    }
    Ok(select)
}

/// Takes the ordering off `inner`, rewritten over its output columns.
///
/// A paged inner select keeps its ordering. An outer select that cannot
/// carry an ordering gets nothing, and an unpaged inner ordering is then
/// meaningless and dropped.
fn lift_ordering(mut inner: SelectExpr, receives: bool) -> (SelectExpr, Vec<OrderByExpr>) {
    if inner.order_by.is_empty() {
        return (inner, Vec::new());
    }
    let pages = inner.skip.is_some() || inner.take.is_some();
    if !receives {
        if !pages {
            inner.order_by.clear();
        }
        return (inner, Vec::new());
    }
    // a distinct select cannot grow columns
    if inner.distinct
        && inner
            .order_by
            .iter()
            .any(|o| !inner.columns.iter().any(|c| c.expr == o.expr))
    {
        return (inner, Vec::new());
    }
    let orderings = if pages {
        inner.order_by.clone()
    } else {
        std::mem::take(&mut inner.order_by)
    };
    let lifted = orderings
        .into_iter()
        .map(|o| OrderByExpr {
            expr: inner.reference_column(o.expr),
            direction: o.direction,
        })
        .collect();
    (inner, lifted)
}

/// Built-in pass: turns decorrelatable applies into plain joins.
///
/// When the right side of an apply only refers to the left side from its
/// `WHERE`, that predicate becomes the join condition. Dialects without
/// `CROSS APPLY` can then render the query.
struct ApplyJoinRewrite;

impl OptimizationPass for ApplyJoinRewrite {
    fn name(&self) -> &str {
        "apply_join_rewrite"
    }

    fn description(&self) -> &str {
        "Rewrites applies correlated only in WHERE as inner or left joins"
    }

    fn transform(&self, expr: SqlExpr) -> Result<SqlExpr> {
        expr.transform_up(&mut |e| match e {
            SqlExpr::Join(join) => Ok(SqlExpr::Join(Box::new(rewrite_apply(*join)?))),
            other => Ok(other),
        })
    }
}

fn rewrite_apply(join: JoinExpr) -> Result<JoinExpr> {
    let kind = match join.kind {
        JoinKind::CrossApply => JoinKind::Inner,
        JoinKind::OuterApply => JoinKind::Left,
        _ => return Ok(join),
    };
    let JoinExpr {
        kind: apply,
        left,
        right,
        condition,
    } = join;
    let outer = declared_aliases(&left);
    match right {
        SqlExpr::Select(mut select) if correlated_only_in_where(&select, &outer) => {
            let inner = select.from.as_ref().map(declared_aliases).unwrap_or_default();
            let predicate = match select.where_clause.take() {
                Some(predicate) => Some(predicate.transform_up(&mut |e| match e {
                    SqlExpr::Column(c) if inner.contains(&c.alias) => {
                        Ok(select.reference_column(SqlExpr::Column(c)))
                    }
                    other => Ok(other),
                })?),
                None => None,
            };
            Ok(JoinExpr {
                kind,
                left,
                right: SqlExpr::Select(select),
                condition: SqlExpr::and_all(condition.into_iter().chain(predicate)),
            })
        }
        right => Ok(JoinExpr {
            kind: apply,
            left,
            right,
            condition,
        }),
    }
}

fn correlated_only_in_where(select: &SelectExpr, outer: &[String]) -> bool {
    let refers_outward = |e: &SqlExpr| outer.iter().any(|a| e.references_alias(a));
    select.where_clause.is_some()
        && select.order_by.is_empty()
        && select.group_by.is_empty()
        && !select.distinct
        && select.skip.is_none()
        && select.take.is_none()
        && !select.reverse
        && !select.has_aggregates()
        && !select.columns.iter().any(|c| refers_outward(&c.expr))
        && !select.from.as_ref().is_some_and(refers_outward)
}

/// Aliases a source introduces into the enclosing select's scope.
fn declared_aliases(source: &SqlExpr) -> Vec<String> {
    match source {
        SqlExpr::Table(t) => vec![t.alias.clone()],
        SqlExpr::Select(s) => vec![s.alias.clone()],
        SqlExpr::Union(u) => vec![u.alias.clone()],
        SqlExpr::Join(j) => {
            let mut aliases = declared_aliases(&j.left);
            aliases.extend(declared_aliases(&j.right));
            aliases
        }
        _ => Vec::new(),
    }
}

/// Built-in pass: removes derived tables that only rename columns.
///
/// A select in `FROM` (or on a join side) with no filter, ordering,
/// grouping, paging or distinct, whose columns are plain column references,
/// is dropped. The enclosing select reads the inner source directly.
struct RedundantSubqueryElision;

impl OptimizationPass for RedundantSubqueryElision {
    fn name(&self) -> &str {
        "redundant_subquery_elision"
    }

    fn description(&self) -> &str {
        "Removes pass-through derived tables"
    }

    fn transform(&self, expr: SqlExpr) -> Result<SqlExpr> {
        rewrite_selects(expr, &mut elide_redundant)
    }
}

fn elide_redundant(mut select: SelectExpr) -> Result<SelectExpr> {
    loop {
        let Some(from) = select.from.take() else {
            return Ok(select);
        };
        let mut removed = Vec::new();
        select.from = Some(strip_redundant(from, false, &mut removed));
        if removed.is_empty() {
            return Ok(select);
        }
        for inner in &removed {
            select = select
                .map_children(&mut |child| child.inline_columns(&inner.alias, &inner.columns))?;
        }
    }
}

fn strip_redundant(source: SqlExpr, join_side: bool, removed: &mut Vec<SelectExpr>) -> SqlExpr {
    match source {
        SqlExpr::Select(inner) if is_redundant(&inner, join_side) => {
            let mut inner = *inner;
            match inner.from.take() {
                Some(from) => {
                    removed.push(inner);
                    from
                }
                None => SqlExpr::Select(Box::new(inner)),
            }
        }
        SqlExpr::Join(join) => {
            let JoinExpr {
                kind,
                left,
                right,
                condition,
            } = *join;
            SqlExpr::Join(Box::new(JoinExpr {
                kind,
                left: strip_redundant(left, true, removed),
                right: strip_redundant(right, true, removed),
                condition,
            }))
        }
        other => other,
    }
}

fn is_redundant(select: &SelectExpr, join_side: bool) -> bool {
    let source_fits = match &select.from {
        None => false,
        Some(SqlExpr::Join(_)) => !join_side,
        Some(SqlExpr::Table(_)) | Some(SqlExpr::Select(_)) | Some(SqlExpr::Union(_)) => true,
        Some(_) => false,
    };
    source_fits
        && select.is_plain()
        && !select.columns.is_empty()
        && select
            .columns
            .iter()
            .all(|c| !c.no_optimise && matches!(c.expr, SqlExpr::Column(_)))
}

/// Built-in pass: reconciles explicit auto-increment assignments.
///
/// Without identity insert the server generates the value, so an explicit
/// assignment is dropped. With it the assigned value is kept and is not
/// read back.
struct AutoIncrementInsertAdjustment;

impl OptimizationPass for AutoIncrementInsertAdjustment {
    fn name(&self) -> &str {
        "auto_increment_insert_adjustment"
    }

    fn description(&self) -> &str {
        "Drops explicitly assigned auto-increment columns from the insert or from RETURNING"
    }

    fn transform(&self, expr: SqlExpr) -> Result<SqlExpr> {
        expr.transform_up(&mut |e| match e {
            SqlExpr::Insert(mut insert) => {
                if !insert.identity_insert {
                    let generated = &insert.returning;
                    let (columns, values) = insert
                        .columns
                        .drain(..)
                        .zip(insert.values.drain(..))
                        .filter(|(column, _)| !generated.contains(column))
                        .unzip();
                    insert.columns = columns;
                    insert.values = values;
                }
                let assigned = &insert.columns;
                insert.returning.retain(|c| !assigned.contains(c));
                Ok(SqlExpr::Insert(insert))
            }
            other => Ok(other),
        })
    }
}

/// Applies `f` bottom-up to every select of the tree, wherever it appears.
fn rewrite_selects(
    expr: SqlExpr,
    f: &mut dyn FnMut(SelectExpr) -> Result<SelectExpr>,
) -> Result<SqlExpr> {
    expr.transform_up(&mut |node| match node {
        SqlExpr::Select(s) => Ok(SqlExpr::Select(Box::new(f(*s)?))),
        SqlExpr::Subquery(s) => Ok(SqlExpr::Subquery(Box::new(f(*s)?))),
        SqlExpr::Projection(p) => {
            let mut p = *p;
            p.select = f(p.select)?;
            Ok(SqlExpr::Projection(Box::new(p)))
        }
        SqlExpr::Grouping { key, group } => {
            let mut group = *group;
            group.select = f(group.select)?;
            Ok(SqlExpr::Grouping {
                key,
                group: Box::new(group),
            })
        }
        SqlExpr::Union(u) => {
            let mut u = *u;
            u.left = f(u.left)?;
            u.right = f(u.right)?;
            Ok(SqlExpr::Union(Box::new(u)))
        }
        other => Ok(other),
    })
}
