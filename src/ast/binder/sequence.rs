//! Sequence operators: filtering, projection, joins, grouping, ordering,
//! element selection and aggregates.

use crate::ast::projector::{is_column_expr, project_columns};
use crate::ast::types::{
    AggregateExpr, Aggregator, BinaryOperator, ColumnDeclaration, JoinExpr, JoinKind,
    MemberBinding, OrderByExpr, Projection, SelectExpr, SqlExpr, SqlFunction, UnionExpr,
};
use crate::error::{QueryError, Result};
use crate::query::{AggregateKind, Expr, Lambda, OrderDirection, QueryOp, SelectFirstKind};
use crate::schema::RelationshipKind;
use crate::value::{DataType, Value};

use super::{has_included_collections, scalar_leaves, Binder};

impl<'a> Binder<'a> {
    pub(super) fn bind_where(&mut self, projection: Projection, predicate: &Lambda) -> Result<Projection> {
        let predicate = self.bind_lambda(predicate, vec![projection.projector.clone()])?;
        let mut filtered = self.wrap(projection)?;
        filtered.select.where_clause = Some(predicate);
        Ok(filtered)
    }

    pub(super) fn bind_select(&mut self, source: &Expr, selector: &Lambda) -> Result<Projection> {
        let projection = self.visit_sequence(source)?;
        let projector = self.bind_lambda(selector, vec![projection.projector.clone()])?;
        let aliases = [projection.select.alias.clone()];
        self.project_flushing(
            SqlExpr::Select(Box::new(projection.select)),
            &aliases,
            projector,
        )
    }

    pub(super) fn bind_select_many(
        &mut self,
        source: &Expr,
        collection: &Lambda,
        result: Option<&Lambda>,
    ) -> Result<Projection> {
        let projection = self.visit_sequence(source)?;
        let (body, outer) = match strip_default_if_empty(&collection.body) {
            (body, Some(None)) => (body, true),
            (_, Some(Some(_))) => {
                return Err(QueryError::unsupported_argument(
                    "DefaultIfEmpty",
                    "a default value is not supported inside SelectMany",
                ))
            }
            (body, None) => (body, false),
        };
        let bound = self.bind_body(&collection.params, vec![projection.projector.clone()], body)?;
        let inner = self.to_sequence(bound)?;

        let correlated = inner.select.references_alias(&projection.select.alias);
        let (kind, condition) = match (correlated, outer) {
            (false, false) => (JoinKind::Cross, None),
            (false, true) => (JoinKind::Left, Some(SqlExpr::Constant(Value::Bool(true)))),
            (true, false) => (JoinKind::CrossApply, None),
            (true, true) => (JoinKind::OuterApply, None),
        };

        let projector = match result {
            Some(result) => self.bind_lambda(
                result,
                vec![projection.projector.clone(), inner.projector.clone()],
            )?,
            None => inner.projector.clone(),
        };
        let aliases = [projection.select.alias.clone(), inner.select.alias.clone()];
        let join = SqlExpr::Join(Box::new(JoinExpr {
            kind,
            left: SqlExpr::Select(Box::new(projection.select)),
            right: SqlExpr::Select(Box::new(inner.select)),
            condition,
        }));
        self.new_select(join, &aliases, projector)
    }

    pub(super) fn bind_join(
        &mut self,
        outer: &Expr,
        inner: &Expr,
        outer_key: &Lambda,
        inner_key: &Lambda,
        result: &Lambda,
        left: bool,
    ) -> Result<Projection> {
        let outer = self.visit_sequence(outer)?;
        let inner = self.visit_sequence(inner)?;
        let outer_key = self.bind_lambda(outer_key, vec![outer.projector.clone()])?;
        let inner_key = self.bind_lambda(inner_key, vec![inner.projector.clone()])?;
        let condition = self.key_equality(outer_key, inner_key)?;
        let projector = self.bind_lambda(
            result,
            vec![outer.projector.clone(), inner.projector.clone()],
        )?;

        let aliases = [outer.select.alias.clone(), inner.select.alias.clone()];
        let join = SqlExpr::Join(Box::new(JoinExpr {
            kind: if left { JoinKind::Left } else { JoinKind::Inner },
            left: SqlExpr::Select(Box::new(outer.select)),
            right: SqlExpr::Select(Box::new(inner.select)),
            condition: Some(condition),
        }));
        self.new_select(join, &aliases, projector)
    }

    pub(super) fn bind_group_join(
        &mut self,
        outer: &Expr,
        inner: &Expr,
        outer_key: &Lambda,
        inner_key: &Lambda,
        result: &Lambda,
    ) -> Result<Projection> {
        let outer = self.visit_sequence(outer)?;
        let outer_key = self.bind_lambda(outer_key, vec![outer.projector.clone()])?;
        let inner = self.visit_sequence(inner)?;
        let inner_key = self.bind_lambda(inner_key, vec![inner.projector.clone()])?;

        let mut group = self.wrap(inner)?;
        group.select.where_clause = Some(self.key_equality(inner_key, outer_key)?);

        let projector = self.bind_lambda(result, vec![outer.projector.clone(), group.into()])?;
        let aliases = [outer.select.alias.clone()];
        self.new_select(SqlExpr::Select(Box::new(outer.select)), &aliases, projector)
    }

    pub(super) fn bind_group_by(
        &mut self,
        source: &Expr,
        key: &Lambda,
        element: Option<&Lambda>,
        result: Option<&Lambda>,
    ) -> Result<Projection> {
        let projection = self.visit_sequence(source)?;
        let key_expr = self.bind_lambda(key, vec![projection.projector.clone()])?;
        let element_expr = match element {
            Some(element) => self.bind_lambda(element, vec![projection.projector.clone()])?,
            None => projection.projector.clone(),
        };

        // the element sequence re-reads the source under fresh aliases
        let sub = self.visit_sequence(source)?;
        let sub_key = self.bind_lambda(key, vec![sub.projector.clone()])?;
        let sub_element = match element {
            Some(element) => self.bind_lambda(element, vec![sub.projector.clone()])?,
            None => sub.projector.clone(),
        };
        let correlation = SqlExpr::and_all(
            scalar_leaves(&sub_key)
                .into_iter()
                .zip(scalar_leaves(&key_expr))
                .map(|(a, b)| nulls_equal(a, b)),
        );
        let sub_aliases = [sub.select.alias.clone()];
        let mut group = self.new_select(
            SqlExpr::Select(Box::new(sub.select)),
            &sub_aliases,
            sub_element,
        )?;
        group.select.where_clause = correlation;

        let alias = self.next_alias();
        let source_aliases = [projection.select.alias.clone()];
        let key_columns = project_columns(key_expr.clone(), &alias, Vec::new(), &source_aliases)?;
        let element_alias = group.select.alias.clone();
        self.group_elements.insert(element_alias.clone(), element_expr);

        let projector = match result {
            Some(result) => {
                let saved = self.current_group_element.replace(element_alias);
                let bound = self.bind_lambda(result, vec![key_expr.clone(), group.into()]);
                self.current_group_element = saved;
                bound?
            }
            None => SqlExpr::Grouping {
                key: Box::new(key_expr.clone()),
                group: Box::new(group),
            },
        };

        let projected = project_columns(projector, &alias, key_columns.columns, &source_aliases)?;
        let mut select = SelectExpr::new(alias)
            .with_columns(projected.columns)
            .with_from(SqlExpr::Select(Box::new(projection.select)));
        select.group_by = scalar_leaves(&key_expr);
        Ok(Projection::new(select, projected.projector))
    }

    /// Flattens an `OrderBy(...).ThenBy(...)` chain into one ordered select.
    pub(super) fn bind_order_by(&mut self, op: &QueryOp) -> Result<Projection> {
        let mut keys = Vec::new();
        let mut current = op;
        let source = loop {
            match current {
                QueryOp::ThenBy {
                    source,
                    key,
                    direction,
                } => {
                    keys.push((key, *direction));
                    match source.as_query() {
                        Some(inner @ (QueryOp::ThenBy { .. } | QueryOp::OrderBy { .. })) => {
                            current = inner
                        }
                        _ => return Err(QueryError::binding("ThenBy must follow an ordering")),
                    }
                }
                QueryOp::OrderBy {
                    source,
                    key,
                    direction,
                } => {
                    keys.push((key, *direction));
                    break source;
                }
                other => return Err(QueryError::UnsupportedOperator(other.name().to_string())),
            }
        };
        keys.reverse();

        let projection = self.visit_sequence(source)?;
        let mut order_by = Vec::new();
        for (key, direction) in keys {
            let bound = self.bind_lambda(key, vec![projection.projector.clone()])?;
            for expr in self.order_keys(bound)? {
                order_by.push(OrderByExpr { expr, direction });
            }
        }
        let mut ordered = self.wrap(projection)?;
        ordered.select.order_by = order_by;
        Ok(ordered)
    }

    fn order_keys(&self, key: SqlExpr) -> Result<Vec<SqlExpr>> {
        match key {
            SqlExpr::ObjectReference(object) => self.primary_key_values(&object),
            SqlExpr::Record(members) => {
                let mut keys = Vec::new();
                for (_, member) in members {
                    keys.extend(self.order_keys(member)?);
                }
                Ok(keys)
            }
            SqlExpr::Tuple(items) => {
                let mut keys = Vec::new();
                for item in items {
                    keys.extend(self.order_keys(item)?);
                }
                Ok(keys)
            }
            other => Ok(vec![other]),
        }
    }

    pub(super) fn bind_first(
        &mut self,
        source: &Expr,
        kind: SelectFirstKind,
        predicate: Option<&Lambda>,
        is_root: bool,
    ) -> Result<SqlExpr> {
        let (source, stripped) = if is_root {
            strip_default_if_empty(source)
        } else {
            (source, None)
        };
        let mut projection = self.visit_sequence(source)?;
        if let Some(predicate) = predicate {
            projection = self.bind_where(projection, predicate)?;
        }
        let included = has_included_collections(&projection.projector);
        let mut first = self.wrap(projection)?;
        if !included {
            let limit = if kind.is_single() && is_root { 2 } else { 1 };
            first.select.take = Some(SqlExpr::Constant(Value::Int(limit)));
        }
        first.select.reverse = kind.is_last();

        if is_root {
            let default = match stripped {
                Some(Some(value)) => {
                    let bound = self.visit(value)?;
                    Some(host_value(bound)?)
                }
                Some(None) => Some(first.projector.data_type().default_value()),
                None if kind.or_default() => Some(first.projector.data_type().default_value()),
                None => None,
            };
            return Ok(first
                .with_aggregator(Aggregator::SelectFirst { kind, default })
                .into());
        }
        if is_column_expr(&first.projector) && !is_host_only(&first.projector) {
            let value = first.projector.clone();
            return Ok(SqlExpr::Subquery(Box::new(self.value_select(first, vec![value])?)));
        }
        Ok(first.into())
    }

    pub(super) fn bind_aggregate(
        &mut self,
        source: &Expr,
        kind: AggregateKind,
        selector: Option<&Lambda>,
        is_root: bool,
    ) -> Result<SqlExpr> {
        let (source, stripped) = if is_root {
            strip_default_if_empty(source)
        } else {
            (source, None)
        };
        let mut projection = self.visit_sequence(source)?;
        let mut selector = selector;
        if kind.is_count() {
            if let Some(predicate) = selector.take() {
                projection = self.bind_where(projection, predicate)?;
            }
        }
        let (projection, distinct) = if selector.is_none() {
            fold_distinct(projection)?
        } else {
            (projection, false)
        };

        let argument_over = |binder: &mut Self, element: SqlExpr| -> Result<Option<SqlExpr>> {
            match selector {
                Some(selector) => binder.bind_lambda(selector, vec![element]).map(Some),
                None if kind.is_count() && !distinct => Ok(None),
                None if is_column_expr(&element) => Ok(Some(element)),
                None => Err(QueryError::unsupported_argument(
                    kind.name(),
                    format!("cannot aggregate a sequence of {}", element.kind_name()),
                )),
            }
        };

        let argument = argument_over(self, projection.projector.clone())?;
        let argument_type = argument
            .as_ref()
            .map(SqlExpr::data_type)
            .unwrap_or(DataType::Int);
        let aggregate = self.aggregate_expr(kind, argument, distinct)?;
        let data_type = aggregate.data_type.clone();

        if is_root {
            let default = match stripped {
                Some(Some(value)) => {
                    let bound = self.visit(value)?;
                    Some(host_value(bound)?)
                }
                _ => None,
            };
            let select =
                self.value_select(projection, vec![SqlExpr::Aggregate(Box::new(aggregate))])?;
            let projector = SqlExpr::column(&select.alias, "c0", data_type);
            return Ok(Projection::new(select, projector)
                .with_aggregator(Aggregator::Aggregate {
                    kind,
                    nullable: argument_type.is_nullable(),
                    default_if_empty: stripped.is_some(),
                    default,
                    zero: argument_type.zero_value(),
                })
                .into());
        }

        let alias = projection.select.alias.clone();
        if self.current_group_element.as_deref() == Some(alias.as_str()) {
            if let Some(element) = self.group_elements.get(&alias).cloned() {
                let argument = argument_over(self, element)?;
                return Ok(SqlExpr::Aggregate(Box::new(
                    self.aggregate_expr(kind, argument, distinct)?,
                )));
            }
        }
        let subquery =
            self.value_select(projection, vec![SqlExpr::Aggregate(Box::new(aggregate))])?;
        Ok(SqlExpr::Subquery(Box::new(subquery)))
    }

    pub(super) fn aggregate_expr(
        &self,
        kind: AggregateKind,
        argument: Option<SqlExpr>,
        distinct: bool,
    ) -> Result<AggregateExpr> {
        let data_type = match (kind, &argument) {
            (AggregateKind::Count | AggregateKind::LongCount, _) => DataType::Int,
            (AggregateKind::Average, _) => DataType::nullable(DataType::Float),
            (_, Some(argument)) => DataType::nullable(argument.data_type()),
            (_, None) => {
                return Err(QueryError::unsupported_argument(
                    kind.name(),
                    "a value to aggregate is required",
                ))
            }
        };
        Ok(AggregateExpr {
            kind,
            argument,
            distinct,
            data_type,
        })
    }

    /// Non-root `DefaultIfEmpty`: a left join from a one-row select so an
    /// empty source still yields one all-NULL row.
    pub(super) fn bind_default_if_empty(
        &mut self,
        source: &Expr,
        default: Option<&Expr>,
    ) -> Result<Projection> {
        if default.is_some() {
            return Err(QueryError::unsupported_argument(
                "DefaultIfEmpty",
                "a default value is only supported at the root of a query",
            ));
        }
        let projection = self.visit_sequence(source)?;
        let empty_alias = self.next_alias();
        let empty = SelectExpr::new(empty_alias.clone()).with_columns(vec![
            ColumnDeclaration::pinned("empty", SqlExpr::Constant(Value::Null)),
        ]);
        let aliases = [empty_alias, projection.select.alias.clone()];
        let join = SqlExpr::Join(Box::new(JoinExpr {
            kind: JoinKind::Left,
            left: SqlExpr::Select(Box::new(empty)),
            right: SqlExpr::Select(Box::new(projection.select)),
            condition: Some(SqlExpr::Constant(Value::Bool(true))),
        }));
        self.new_select(join, &aliases, projection.projector)
    }

    pub(super) fn bind_contains(&mut self, source: &Expr, item: &Expr, is_root: bool) -> Result<SqlExpr> {
        let collection = self.visit(source)?;
        let item = self.visit(item)?;
        let membership = self.membership(collection, item)?;
        self.boolean_result(membership, is_root)
    }

    pub(super) fn bind_any(
        &mut self,
        source: &Expr,
        predicate: Option<&Lambda>,
        is_root: bool,
    ) -> Result<SqlExpr> {
        let mut projection = self.visit_sequence(source)?;
        if let Some(predicate) = predicate {
            projection = self.bind_where(projection, predicate)?;
        }
        let exists = SqlExpr::function(
            SqlFunction::Exists,
            vec![SqlExpr::Subquery(Box::new(projection.select))],
            DataType::Bool,
        );
        self.boolean_result(exists, is_root)
    }

    /// `All(p)` is `NOT EXISTS (... WHERE NOT p)`.
    pub(super) fn bind_all(&mut self, source: &Expr, predicate: &Lambda, is_root: bool) -> Result<SqlExpr> {
        let projection = self.visit_sequence(source)?;
        let condition = self.bind_lambda(predicate, vec![projection.projector.clone()])?;
        let mut violations = self.wrap(projection)?;
        violations.select.where_clause = Some(SqlExpr::not(condition));
        let exists = SqlExpr::function(
            SqlFunction::Exists,
            vec![SqlExpr::Subquery(Box::new(violations.select))],
            DataType::Bool,
        );
        self.boolean_result(SqlExpr::not(exists), is_root)
    }

    /// Outside any selector a predicate becomes a one-row, one-column query.
    fn boolean_result(&mut self, predicate: SqlExpr, is_root: bool) -> Result<SqlExpr> {
        if !is_root && self.selector_depth > 0 {
            return Ok(predicate);
        }
        let alias = self.next_alias();
        let select =
            SelectExpr::new(alias.clone()).with_columns(vec![ColumnDeclaration::new("value", predicate)]);
        Ok(
            Projection::new(select, SqlExpr::column(&alias, "value", DataType::Bool))
                .with_aggregator(Aggregator::SingleOrDefault)
                .into(),
        )
    }

    pub(super) fn bind_union(&mut self, left: &Expr, right: &Expr, all: bool) -> Result<Projection> {
        let left = self.visit_sequence(left)?;
        let right = self.visit_sequence(right)?;
        if left.select.columns.len() != right.select.columns.len() {
            return Err(QueryError::binding(format!(
                "union sides have {} and {} columns",
                left.select.columns.len(),
                right.select.columns.len()
            )));
        }
        let alias = self.next_alias();
        let projector = left.projector.retarget_alias(&left.select.alias, &alias)?;
        let union = SqlExpr::Union(Box::new(UnionExpr {
            alias: alias.clone(),
            left: left.select,
            right: right.select,
            all,
        }));
        self.new_select(union, &[alias], projector)
    }

    pub(super) fn bind_include(&mut self, source: &Expr, path: &Lambda) -> Result<Projection> {
        let projection = self.visit_sequence(source)?;
        let SqlExpr::ObjectReference(mut owner) = projection.projector.clone() else {
            return Err(QueryError::unsupported_argument(
                "Include",
                "the source must be a sequence of objects",
            ));
        };
        let member = match &path.body {
            Expr::Member { target, member }
                if matches!(&**target, Expr::Parameter(p) if path.params.first() == Some(p)) =>
            {
                member.clone()
            }
            _ => {
                return Err(QueryError::unsupported_argument(
                    "Include",
                    "the path must name a member of the lambda parameter",
                ))
            }
        };
        let descriptor = self.descriptor(&owner.type_name)?;
        let relationship = descriptor.find_relationship(&member).ok_or_else(|| {
            QueryError::UnsupportedMember {
                target: owner.type_name.clone(),
                member: member.clone(),
            }
        })?;
        let source_alias = projection.select.alias.clone();

        match relationship.kind {
            RelationshipKind::Reference => {
                let target = self.table_projection(&relationship.target)?;
                let slot = owner
                    .bindings
                    .iter_mut()
                    .find(|b| b.member == member)
                    .ok_or_else(|| {
                        QueryError::binding(format!("reference \"{}\" is not bound", member))
                    })?;
                let foreign_key = std::mem::replace(&mut slot.expr, target.projector.clone());
                let condition =
                    self.object_comparison(BinaryOperator::Eq, target.projector.clone(), foreign_key)?;
                let aliases = [source_alias, target.select.alias.clone()];
                let join = SqlExpr::Join(Box::new(JoinExpr {
                    kind: JoinKind::Left,
                    left: SqlExpr::Select(Box::new(projection.select)),
                    right: SqlExpr::Select(Box::new(target.select)),
                    condition: Some(condition),
                }));
                self.new_select(join, &aliases, SqlExpr::ObjectReference(owner))
            }
            RelationshipKind::Collection => {
                let back_reference = relationship.back_reference.as_deref().ok_or_else(|| {
                    QueryError::binding(format!(
                        "collection \"{}\" has no back reference",
                        member
                    ))
                })?;
                let children = self.table_projection(&relationship.target)?;
                let child_owner = match &children.projector {
                    SqlExpr::ObjectReference(child) => child.binding(back_reference).cloned(),
                    _ => None,
                }
                .ok_or_else(|| {
                    QueryError::binding(format!(
                        "{} has no reference \"{}\"",
                        relationship.target, back_reference
                    ))
                })?;
                let condition = self.object_comparison(
                    BinaryOperator::Eq,
                    child_owner,
                    SqlExpr::ObjectReference(owner.clone()),
                )?;

                // the owners' ordering leads, their keys keep each owner's rows adjacent
                let mut owners = projection.select;
                let inherited = inherit_ordering(&mut owners);
                self.pending_order_by.extend(inherited);
                let keys = self.primary_key_values(&owner)?;
                self.pending_order_by
                    .extend(keys.into_iter().map(|expr| OrderByExpr {
                        expr,
                        direction: OrderDirection::Ascending,
                    }));

                owner.bindings.push(MemberBinding {
                    member,
                    expr: SqlExpr::IncludedCollection(Box::new(children.projector)),
                });
                let aliases = [source_alias, children.select.alias.clone()];
                let join = SqlExpr::Join(Box::new(JoinExpr {
                    kind: JoinKind::Left,
                    left: SqlExpr::Select(Box::new(owners)),
                    right: SqlExpr::Select(Box::new(children.select)),
                    condition: Some(condition),
                }));
                self.project_flushing(join, &aliases, SqlExpr::ObjectReference(owner))
            }
        }
    }

    /// Equality of join keys; records and tuples compare member-wise.
    fn key_equality(&mut self, left: SqlExpr, right: SqlExpr) -> Result<SqlExpr> {
        let composite = matches!(left, SqlExpr::Record(_) | SqlExpr::Tuple(_))
            && matches!(right, SqlExpr::Record(_) | SqlExpr::Tuple(_));
        if !composite {
            return self.bind_comparison(BinaryOperator::Eq, left, right);
        }
        let (left, right) = (scalar_leaves(&left), scalar_leaves(&right));
        if left.len() != right.len() {
            return Err(QueryError::binding("join keys have different shapes"));
        }
        let mut predicates = Vec::with_capacity(left.len());
        for (a, b) in left.into_iter().zip(right) {
            predicates.push(self.bind_comparison(BinaryOperator::Eq, a, b)?);
        }
        SqlExpr::and_all(predicates).ok_or_else(|| QueryError::binding("empty join key"))
    }
}

/// The ordering of `select` re-expressed over its output columns.
///
/// An unpaged select gives its ordering up. A paged one keeps it, since the
/// page depends on it.
fn inherit_ordering(select: &mut SelectExpr) -> Vec<OrderByExpr> {
    if select.order_by.is_empty() || select.reverse {
        return Vec::new();
    }
    let exposed = select
        .order_by
        .iter()
        .all(|o| select.columns.iter().any(|c| c.expr == o.expr));
    if select.distinct && !exposed {
        return Vec::new();
    }
    let orderings = if select.skip.is_some() || select.take.is_some() {
        select.order_by.clone()
    } else {
        std::mem::take(&mut select.order_by)
    };
    orderings
        .into_iter()
        .map(|o| OrderByExpr {
            expr: select.reference_column(o.expr),
            direction: o.direction,
        })
        .collect()
}

/// Splits off a trailing `DefaultIfEmpty`, returning its default when present.
fn strip_default_if_empty(source: &Expr) -> (&Expr, Option<Option<&Expr>>) {
    match source.as_query() {
        Some(QueryOp::DefaultIfEmpty { source, default }) => (source, Some(default.as_ref())),
        _ => (source, None),
    }
}

/// `(a IS NULL AND b IS NULL) OR a = b`
fn nulls_equal(a: SqlExpr, b: SqlExpr) -> SqlExpr {
    let is_null = |e: SqlExpr| SqlExpr::function(SqlFunction::IsNull, vec![e], DataType::Bool);
    SqlExpr::binary(
        BinaryOperator::Or,
        SqlExpr::binary(BinaryOperator::And, is_null(a.clone()), is_null(b.clone())),
        SqlExpr::binary(BinaryOperator::Eq, a, b),
    )
}

fn is_host_only(expr: &SqlExpr) -> bool {
    matches!(expr, SqlExpr::Constant(_) | SqlExpr::Placeholder { .. })
}

fn host_value(expr: SqlExpr) -> Result<Value> {
    match expr {
        SqlExpr::Constant(value) | SqlExpr::Placeholder { value, .. } => Ok(value),
        other => Err(QueryError::unsupported_argument(
            "DefaultIfEmpty",
            format!("the default must be a host value, found {}", other.kind_name()),
        )),
    }
}

/// Drops a bare `DISTINCT` select over a scalar so the aggregate can carry it.
fn fold_distinct(projection: Projection) -> Result<(Projection, bool)> {
    let select = &projection.select;
    let foldable = select.distinct
        && select.where_clause.is_none()
        && select.order_by.is_empty()
        && select.group_by.is_empty()
        && select.skip.is_none()
        && select.take.is_none()
        && !select.for_update
        && matches!(select.from, Some(SqlExpr::Select(_)))
        && is_column_expr(&projection.projector)
        && !is_host_only(&projection.projector);
    if !foldable {
        return Ok((projection, false));
    }
    let Projection {
        select, projector, ..
    } = projection;
    let SelectExpr {
        alias,
        columns,
        from,
        ..
    } = select;
    match from {
        Some(SqlExpr::Select(inner)) => {
            let projector = projector.inline_columns(&alias, &columns)?;
            Ok((Projection::new(*inner, projector), true))
        }
        _ => Err(QueryError::binding("distinct select lost its source")),
    }
}
