//! Query binder: operator trees to SQL expression trees.
//!
//! The binder is a recursive-descent visitor over [`Expr`]. Every sequence
//! operator produces a [`Projection`]: a select with a fresh alias plus the
//! projector describing how its columns rebuild host values. Lambda
//! parameters are bound by name to the projector of the sequence they range
//! over, so member access on a parameter resolves to columns.
//!
//! All state lives in the `Binder` and is discarded after one bind call:
//! the alias counter, the selector depth, the parameter scope, the group-by
//! correlation map and the pending order-by list.

mod members;
mod mutation;
mod objects;
mod sequence;

use std::collections::HashMap;

use tracing::debug;

use crate::ast::projector::project_columns;
use crate::ast::types::{
    ColumnDeclaration, OrderByExpr, Projection, SelectExpr, SqlExpr,
};
use crate::error::{QueryError, Result};
use crate::query::{Expr, Lambda, QueryOp};
use crate::schema::{TypeDescriptor, TypeDescriptorProvider};
use crate::value::Value;

pub struct Binder<'a> {
    provider: &'a dyn TypeDescriptorProvider,
    alias_counter: usize,
    /// Nesting depth of selector and predicate bodies.
    selector_depth: usize,
    parameters: HashMap<String, SqlExpr>,
    /// Element select alias -> its group.
    /// Element expression of each group, relative to the grouped source,
    /// keyed by the group's element alias.
    group_elements: HashMap<String, SqlExpr>,
    /// Element alias of the group whose result selector is being bound.
    current_group_element: Option<String>,
    /// Ordering the next `Select` projection must carry.
    pending_order_by: Vec<OrderByExpr>,
}

impl<'a> Binder<'a> {
    pub fn new(provider: &'a dyn TypeDescriptorProvider) -> Self {
        Self {
            provider,
            alias_counter: 0,
            selector_depth: 0,
            parameters: HashMap::new(),
            group_elements: HashMap::new(),
            current_group_element: None,
            pending_order_by: Vec::new(),
        }
    }

    /// Binds a whole query. The outermost operator is the root.
    pub fn bind(expr: &Expr, provider: &'a dyn TypeDescriptorProvider) -> Result<Projection> {
        Binder::new(provider).bind_root(expr)
    }

    pub fn bind_root(&mut self, expr: &Expr) -> Result<Projection> {
        let bound = match expr {
            Expr::Query(op) => self.bind_operator(op, true)?,
            other => self.visit(other)?,
        };
        let projection = self.to_sequence(bound)?;
        debug!(
            alias = %projection.select.alias,
            aliases = self.alias_counter,
            aggregator = projection.aggregator.is_some(),
            "bound query"
        );
        Ok(projection)
    }

    fn next_alias(&mut self) -> String {
        let alias = format!("T{}", self.alias_counter);
        self.alias_counter += 1;
        alias
    }

    fn descriptor(&self, type_name: &str) -> Result<&'a TypeDescriptor> {
        let provider: &'a dyn TypeDescriptorProvider = self.provider;
        provider
            .type_descriptor(type_name)
            .ok_or_else(|| QueryError::binding(format!("unknown type \"{}\"", type_name)))
    }

    fn visit(&mut self, expr: &Expr) -> Result<SqlExpr> {
        match expr {
            Expr::Constant(value) | Expr::Variable { value, .. } => {
                Ok(SqlExpr::Constant(value.clone()))
            }
            Expr::Placeholder { index, value } => Ok(SqlExpr::Placeholder {
                index: *index,
                value: value.clone(),
            }),
            Expr::Parameter(name) => self.parameters.get(name).cloned().ok_or_else(|| {
                QueryError::binding(format!("parameter \"{}\" is not in scope", name))
            }),
            Expr::Source { type_name } => Ok(self.table_projection(type_name)?.into()),
            Expr::Member { target, member } => {
                let target = self.visit(target)?;
                self.bind_member(target, member)
            }
            Expr::Binary { op, left, right } => self.bind_binary(*op, left, right),
            Expr::Unary { op, operand } => self.bind_unary(*op, operand),
            Expr::Convert { operand, data_type } => match self.visit(operand)? {
                SqlExpr::Constant(value) => Ok(SqlExpr::Constant(value.coerce(data_type))),
                operand => Ok(SqlExpr::Convert {
                    operand: Box::new(operand),
                    data_type: data_type.clone(),
                }),
            },
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => Ok(SqlExpr::Conditional {
                test: Box::new(self.visit(test)?),
                if_true: Box::new(self.visit(if_true)?),
                if_false: Box::new(self.visit(if_false)?),
            }),
            Expr::Call {
                target,
                method,
                args,
            } => self.bind_call(target.as_deref(), method, args),
            Expr::New { type_name, members } => self.bind_new(type_name.as_deref(), members),
            Expr::Query(op) => self.bind_operator(op, false),
        }
    }

    fn bind_operator(&mut self, op: &QueryOp, is_root: bool) -> Result<SqlExpr> {
        match op {
            QueryOp::Where { source, predicate } => {
                let projection = self.visit_sequence(source)?;
                Ok(self.bind_where(projection, predicate)?.into())
            }
            QueryOp::Select { source, selector } => {
                Ok(self.bind_select(source, selector)?.into())
            }
            QueryOp::SelectMany {
                source,
                collection,
                result,
            } => Ok(self
                .bind_select_many(source, collection, result.as_ref())?
                .into()),
            QueryOp::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
                left,
            } => Ok(self
                .bind_join(outer, inner, outer_key, inner_key, result, *left)?
                .into()),
            QueryOp::GroupJoin {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
            } => Ok(self
                .bind_group_join(outer, inner, outer_key, inner_key, result)?
                .into()),
            QueryOp::GroupBy {
                source,
                key,
                element,
                result,
            } => Ok(self
                .bind_group_by(source, key, element.as_ref(), result.as_ref())?
                .into()),
            QueryOp::OrderBy { .. } | QueryOp::ThenBy { .. } => Ok(self.bind_order_by(op)?.into()),
            QueryOp::Take { source, count } => {
                let mut projection = self.visit_sequence(source)?;
                let count = self.visit(count)?;
                // OFFSET applies before LIMIT, so a skip-only select takes the count itself
                if projection.select.skip.is_some() && projection.select.take.is_none() {
                    projection.select.take = Some(count);
                    return Ok(projection.into());
                }
                let mut wrapped = self.wrap(projection)?;
                wrapped.select.take = Some(count);
                Ok(wrapped.into())
            }
            QueryOp::Skip { source, count } => {
                let projection = self.visit_sequence(source)?;
                let count = self.visit(count)?;
                let mut wrapped = self.wrap(projection)?;
                wrapped.select.skip = Some(count);
                Ok(wrapped.into())
            }
            QueryOp::Distinct { source } => {
                let projection = self.visit_sequence(source)?;
                let mut wrapped = self.wrap(projection)?;
                wrapped.select.distinct = true;
                Ok(wrapped.into())
            }
            QueryOp::ForUpdate { source } => {
                let projection = self.visit_sequence(source)?;
                let mut wrapped = self.wrap(projection)?;
                wrapped.select.for_update = true;
                Ok(wrapped.into())
            }
            QueryOp::First {
                source,
                kind,
                predicate,
            } => self.bind_first(source, *kind, predicate.as_ref(), is_root),
            QueryOp::Aggregate {
                source,
                kind,
                selector,
            } => self.bind_aggregate(source, *kind, selector.as_ref(), is_root),
            QueryOp::DefaultIfEmpty { source, default } => {
                Ok(self.bind_default_if_empty(source, default.as_ref())?.into())
            }
            QueryOp::Contains { source, item } => self.bind_contains(source, item, is_root),
            QueryOp::Any { source, predicate } => {
                self.bind_any(source, predicate.as_ref(), is_root)
            }
            QueryOp::All { source, predicate } => self.bind_all(source, predicate, is_root),
            QueryOp::Union { left, right, all } => {
                Ok(self.bind_union(left, right, *all)?.into())
            }
            QueryOp::Include { source, path } => Ok(self.bind_include(source, path)?.into()),
            QueryOp::Insert {
                target,
                assignments,
                identity_insert,
            } => Ok(self
                .bind_insert(target, assignments, *identity_insert)?
                .into()),
            QueryOp::Update {
                source,
                row,
                assignments,
            } => Ok(self.bind_update(source, row, assignments)?.into()),
            QueryOp::Delete { source } => Ok(self.bind_delete(source)?.into()),
            QueryOp::Call { name, .. } => Err(QueryError::UnsupportedOperator(name.clone())),
        }
    }

    /// Binds `expr` and requires a row sequence.
    fn visit_sequence(&mut self, expr: &Expr) -> Result<Projection> {
        let bound = self.visit(expr)?;
        self.to_sequence(bound)
    }

    fn to_sequence(&self, expr: SqlExpr) -> Result<Projection> {
        match expr {
            SqlExpr::Projection(projection) => Ok(*projection),
            SqlExpr::Grouping { group, .. } => Ok(*group),
            other => Err(QueryError::binding(format!(
                "expected a sequence, found {}",
                other.kind_name()
            ))),
        }
    }

    /// Binds a lambda body with its parameters mapped to `args`.
    fn bind_lambda(&mut self, lambda: &Lambda, args: Vec<SqlExpr>) -> Result<SqlExpr> {
        self.bind_body(&lambda.params, args, &lambda.body)
    }

    fn bind_body(&mut self, params: &[String], args: Vec<SqlExpr>, body: &Expr) -> Result<SqlExpr> {
        if params.len() != args.len() {
            return Err(QueryError::binding(format!(
                "lambda takes {} parameters but {} were supplied",
                params.len(),
                args.len()
            )));
        }
        let saved: Vec<(String, Option<SqlExpr>)> = params
            .iter()
            .zip(args)
            .map(|(name, arg)| (name.clone(), self.parameters.insert(name.clone(), arg)))
            .collect();

        self.selector_depth += 1;
        let result = self.visit(body);
        self.selector_depth -= 1;

        for (name, previous) in saved.into_iter().rev() {
            match previous {
                Some(previous) => {
                    self.parameters.insert(name, previous);
                }
                None => {
                    self.parameters.remove(&name);
                }
            }
        }
        result
    }

    /// A new select over `from` projecting `projector`.
    fn new_select(
        &mut self,
        from: SqlExpr,
        from_aliases: &[String],
        projector: SqlExpr,
    ) -> Result<Projection> {
        let alias = self.next_alias();
        let mut projected = project_columns(projector, &alias, Vec::new(), from_aliases)?;
        if projected.columns.is_empty() {
            // a select needs at least one column even when the projector is host-only
            projected
                .columns
                .push(ColumnDeclaration::new("c0", SqlExpr::Constant(Value::Int(1))));
        }
        let select = SelectExpr::new(alias)
            .with_columns(projected.columns)
            .with_from(from);
        Ok(Projection::new(select, projected.projector))
    }

    /// Wraps `source` in a new select with the same projector.
    fn wrap(&mut self, source: Projection) -> Result<Projection> {
        let aliases = [source.select.alias.clone()];
        self.new_select(
            SqlExpr::Select(Box::new(source.select)),
            &aliases,
            source.projector,
        )
    }

    /// Like `new_select`, but the select takes over the pending ordering.
    fn project_flushing(
        &mut self,
        from: SqlExpr,
        from_aliases: &[String],
        projector: SqlExpr,
    ) -> Result<Projection> {
        let mut projection = self.new_select(from, from_aliases, projector)?;
        projection.select.order_by = std::mem::take(&mut self.pending_order_by);
        Ok(projection)
    }
}

/// Selects whose only clause is an optional `WHERE`.
fn is_filter_only(select: &SelectExpr) -> bool {
    select.order_by.is_empty()
        && select.group_by.is_empty()
        && !select.distinct
        && select.skip.is_none()
        && select.take.is_none()
        && !select.for_update
        && !select.reverse
        && !select.has_aggregates()
        && !select.columns.iter().any(|c| c.no_optimise)
}

/// A stack of filter-only selects over one source.
struct FilterChain<'s> {
    /// Outermost first.
    layers: Vec<&'s SelectExpr>,
    source: &'s SqlExpr,
}

impl<'s> FilterChain<'s> {
    fn of(select: &'s SelectExpr) -> Option<Self> {
        if !is_filter_only(select) {
            return None;
        }
        let mut layers = vec![select];
        let mut current = select;
        loop {
            match current.from.as_ref()? {
                SqlExpr::Select(inner) if is_filter_only(inner) => {
                    layers.push(inner);
                    current = inner;
                }
                source => return Some(Self { layers, source }),
            }
        }
    }

    /// Re-expresses `expr`, written against the outermost layer, over the source.
    fn resolve(&self, expr: SqlExpr) -> Result<SqlExpr> {
        self.resolve_from(0, expr)
    }

    fn resolve_from(&self, depth: usize, mut expr: SqlExpr) -> Result<SqlExpr> {
        for layer in &self.layers[depth..] {
            expr = expr.inline_columns(&layer.alias, &layer.columns)?;
        }
        Ok(expr)
    }

    /// Every layer's predicate over the source, innermost first.
    fn predicates(&self) -> Result<Vec<SqlExpr>> {
        let mut predicates = Vec::new();
        for (depth, layer) in self.layers.iter().enumerate().rev() {
            if let Some(predicate) = &layer.where_clause {
                predicates.push(self.resolve_from(depth + 1, predicate.clone())?);
            }
        }
        Ok(predicates)
    }
}

/// Scalar leaves of a key: object bindings, record members and tuple items.
fn scalar_leaves(expr: &SqlExpr) -> Vec<SqlExpr> {
    match expr {
        SqlExpr::ObjectReference(object) => object
            .bindings
            .iter()
            .flat_map(|b| scalar_leaves(&b.expr))
            .collect(),
        SqlExpr::Record(members) => members.iter().flat_map(|(_, e)| scalar_leaves(e)).collect(),
        SqlExpr::Tuple(items) => items.iter().flat_map(scalar_leaves).collect(),
        other => vec![other.clone()],
    }
}

fn has_included_collections(projector: &SqlExpr) -> bool {
    projector.any(&mut |e| matches!(e, SqlExpr::IncludedCollection(_)))
}
