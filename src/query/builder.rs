//! Fluent construction of operator trees.
//!
//! ```
//! use querybind::query::{lambda, param, Expr, Queryable};
//!
//! let query = Queryable::source("Widget")
//!     .filter(lambda("w", param("w").member("Price").gt(Expr::constant(10))))
//!     .order_by(lambda("w", param("w").member("Name")))
//!     .take(5);
//! assert_eq!(query.expr().as_query().unwrap().name(), "Take");
//! ```

use anyhow::Context;

use crate::value::{DataType, Value};

use super::*;

/// Reference to a lambda parameter.
pub fn param(name: &str) -> Expr {
    Expr::Parameter(name.to_string())
}

pub fn lambda(param: &str, body: Expr) -> Lambda {
    Lambda {
        params: vec![param.to_string()],
        body,
    }
}

pub fn lambda2(first: &str, second: &str, body: Expr) -> Lambda {
    Lambda {
        params: vec![first.to_string(), second.to_string()],
        body,
    }
}

impl Expr {
    pub fn constant(value: impl Into<Value>) -> Expr {
        Expr::Constant(value.into())
    }

    pub fn null() -> Expr {
        Expr::Constant(Value::Null)
    }

    pub fn variable(name: &str, value: impl Into<Value>) -> Expr {
        Expr::Variable {
            name: name.to_string(),
            value: value.into(),
        }
    }

    pub fn source(type_name: &str) -> Expr {
        Expr::Source {
            type_name: type_name.to_string(),
        }
    }

    pub fn record(members: Vec<(&str, Expr)>) -> Expr {
        Expr::New {
            type_name: None,
            members: members
                .into_iter()
                .map(|(name, e)| (name.to_string(), e))
                .collect(),
        }
    }

    pub fn server_now() -> Expr {
        Expr::Call {
            target: None,
            method: Method::Now,
            args: Vec::new(),
        }
    }

    pub fn member(self, member: &str) -> Expr {
        Expr::Member {
            target: Box::new(self),
            member: member.to_string(),
        }
    }

    pub fn binary(self, op: BinaryOp, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    pub fn eq(self, right: Expr) -> Expr {
        self.binary(BinaryOp::Equal, right)
    }

    pub fn ne(self, right: Expr) -> Expr {
        self.binary(BinaryOp::NotEqual, right)
    }

    pub fn gt(self, right: Expr) -> Expr {
        self.binary(BinaryOp::GreaterThan, right)
    }

    pub fn ge(self, right: Expr) -> Expr {
        self.binary(BinaryOp::GreaterThanOrEqual, right)
    }

    pub fn lt(self, right: Expr) -> Expr {
        self.binary(BinaryOp::LessThan, right)
    }

    pub fn le(self, right: Expr) -> Expr {
        self.binary(BinaryOp::LessThanOrEqual, right)
    }

    pub fn and(self, right: Expr) -> Expr {
        self.binary(BinaryOp::And, right)
    }

    pub fn or(self, right: Expr) -> Expr {
        self.binary(BinaryOp::Or, right)
    }

    pub fn add(self, right: Expr) -> Expr {
        self.binary(BinaryOp::Add, right)
    }

    pub fn sub(self, right: Expr) -> Expr {
        self.binary(BinaryOp::Subtract, right)
    }

    pub fn mul(self, right: Expr) -> Expr {
        self.binary(BinaryOp::Multiply, right)
    }

    pub fn coalesce(self, right: Expr) -> Expr {
        self.binary(BinaryOp::Coalesce, right)
    }

    pub fn not(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(self),
        }
    }

    pub fn convert(self, data_type: DataType) -> Expr {
        Expr::Convert {
            operand: Box::new(self),
            data_type,
        }
    }

    pub fn call(self, method: Method, args: Vec<Expr>) -> Expr {
        Expr::Call {
            target: Some(Box::new(self)),
            method,
            args,
        }
    }

    fn op(op: QueryOp) -> Expr {
        Expr::Query(Box::new(op))
    }
}

/// A composable query over the stored instances of a type.
#[derive(Debug, Clone, PartialEq)]
pub struct Queryable {
    expr: Expr,
}

impl Queryable {
    pub fn source(type_name: &str) -> Self {
        Self::from_expr(Expr::source(type_name))
    }

    pub fn from_expr(expr: Expr) -> Self {
        Self { expr }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn into_expr(self) -> Expr {
        self.expr
    }

    /// Reads an operator tree serialized with [`Queryable::to_json`].
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let expr = serde_json::from_str(json).context("Failed to parse query tree")?;
        Ok(Self::from_expr(expr))
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(&self.expr).context("Failed to serialize query tree")
    }

    fn wrap(op: QueryOp) -> Self {
        Self::from_expr(Expr::op(op))
    }

    pub fn filter(self, predicate: Lambda) -> Self {
        Self::wrap(QueryOp::Where {
            source: self.expr,
            predicate,
        })
    }

    pub fn select(self, selector: Lambda) -> Self {
        Self::wrap(QueryOp::Select {
            source: self.expr,
            selector,
        })
    }

    pub fn select_many(self, collection: Lambda, result: Option<Lambda>) -> Self {
        Self::wrap(QueryOp::SelectMany {
            source: self.expr,
            collection,
            result,
        })
    }

    pub fn join(self, inner: Queryable, outer_key: Lambda, inner_key: Lambda, result: Lambda) -> Self {
        Self::wrap(QueryOp::Join {
            outer: self.expr,
            inner: inner.expr,
            outer_key,
            inner_key,
            result,
            left: false,
        })
    }

    pub fn left_join(
        self,
        inner: Queryable,
        outer_key: Lambda,
        inner_key: Lambda,
        result: Lambda,
    ) -> Self {
        Self::wrap(QueryOp::Join {
            outer: self.expr,
            inner: inner.expr,
            outer_key,
            inner_key,
            result,
            left: true,
        })
    }

    pub fn group_join(
        self,
        inner: Queryable,
        outer_key: Lambda,
        inner_key: Lambda,
        result: Lambda,
    ) -> Self {
        Self::wrap(QueryOp::GroupJoin {
            outer: self.expr,
            inner: inner.expr,
            outer_key,
            inner_key,
            result,
        })
    }

    pub fn group_by(self, key: Lambda) -> Self {
        Self::wrap(QueryOp::GroupBy {
            source: self.expr,
            key,
            element: None,
            result: None,
        })
    }

    pub fn group_by_with(self, key: Lambda, element: Option<Lambda>, result: Option<Lambda>) -> Self {
        Self::wrap(QueryOp::GroupBy {
            source: self.expr,
            key,
            element,
            result,
        })
    }

    pub fn order_by(self, key: Lambda) -> Self {
        Self::wrap(QueryOp::OrderBy {
            source: self.expr,
            key,
            direction: OrderDirection::Ascending,
        })
    }

    pub fn order_by_descending(self, key: Lambda) -> Self {
        Self::wrap(QueryOp::OrderBy {
            source: self.expr,
            key,
            direction: OrderDirection::Descending,
        })
    }

    pub fn then_by(self, key: Lambda) -> Self {
        Self::wrap(QueryOp::ThenBy {
            source: self.expr,
            key,
            direction: OrderDirection::Ascending,
        })
    }

    pub fn then_by_descending(self, key: Lambda) -> Self {
        Self::wrap(QueryOp::ThenBy {
            source: self.expr,
            key,
            direction: OrderDirection::Descending,
        })
    }

    pub fn take(self, count: i64) -> Self {
        Self::wrap(QueryOp::Take {
            source: self.expr,
            count: Expr::constant(count),
        })
    }

    pub fn skip(self, count: i64) -> Self {
        Self::wrap(QueryOp::Skip {
            source: self.expr,
            count: Expr::constant(count),
        })
    }

    pub fn distinct(self) -> Self {
        Self::wrap(QueryOp::Distinct { source: self.expr })
    }

    pub fn default_if_empty(self) -> Self {
        Self::wrap(QueryOp::DefaultIfEmpty {
            source: self.expr,
            default: None,
        })
    }

    pub fn default_if_empty_value(self, value: Expr) -> Self {
        Self::wrap(QueryOp::DefaultIfEmpty {
            source: self.expr,
            default: Some(value),
        })
    }

    pub fn union(self, other: Queryable) -> Self {
        Self::wrap(QueryOp::Union {
            left: self.expr,
            right: other.expr,
            all: false,
        })
    }

    pub fn concat(self, other: Queryable) -> Self {
        Self::wrap(QueryOp::Union {
            left: self.expr,
            right: other.expr,
            all: true,
        })
    }

    pub fn include(self, path: Lambda) -> Self {
        Self::wrap(QueryOp::Include {
            source: self.expr,
            path,
        })
    }

    pub fn for_update(self) -> Self {
        Self::wrap(QueryOp::ForUpdate { source: self.expr })
    }

    pub fn first_kind(self, kind: SelectFirstKind, predicate: Option<Lambda>) -> Self {
        Self::wrap(QueryOp::First {
            source: self.expr,
            kind,
            predicate,
        })
    }

    pub fn first(self) -> Self {
        self.first_kind(SelectFirstKind::First, None)
    }

    pub fn first_or_default(self) -> Self {
        self.first_kind(SelectFirstKind::FirstOrDefault, None)
    }

    pub fn single(self) -> Self {
        self.first_kind(SelectFirstKind::Single, None)
    }

    pub fn single_where(self, predicate: Lambda) -> Self {
        self.first_kind(SelectFirstKind::Single, Some(predicate))
    }

    pub fn single_or_default(self) -> Self {
        self.first_kind(SelectFirstKind::SingleOrDefault, None)
    }

    pub fn last(self) -> Self {
        self.first_kind(SelectFirstKind::Last, None)
    }

    pub fn aggregate(self, kind: AggregateKind, selector: Option<Lambda>) -> Self {
        Self::wrap(QueryOp::Aggregate {
            source: self.expr,
            kind,
            selector,
        })
    }

    pub fn count(self) -> Self {
        self.aggregate(AggregateKind::Count, None)
    }

    pub fn long_count(self) -> Self {
        self.aggregate(AggregateKind::LongCount, None)
    }

    pub fn sum(self, selector: Lambda) -> Self {
        self.aggregate(AggregateKind::Sum, Some(selector))
    }

    pub fn min(self, selector: Lambda) -> Self {
        self.aggregate(AggregateKind::Min, Some(selector))
    }

    pub fn max(self, selector: Lambda) -> Self {
        self.aggregate(AggregateKind::Max, Some(selector))
    }

    pub fn average(self, selector: Lambda) -> Self {
        self.aggregate(AggregateKind::Average, Some(selector))
    }

    pub fn contains(self, item: Expr) -> Self {
        Self::wrap(QueryOp::Contains {
            source: self.expr,
            item,
        })
    }

    pub fn any(self) -> Self {
        Self::wrap(QueryOp::Any {
            source: self.expr,
            predicate: None,
        })
    }

    pub fn any_where(self, predicate: Lambda) -> Self {
        Self::wrap(QueryOp::Any {
            source: self.expr,
            predicate: Some(predicate),
        })
    }

    pub fn all(self, predicate: Lambda) -> Self {
        Self::wrap(QueryOp::All {
            source: self.expr,
            predicate,
        })
    }

    pub fn insert(type_name: &str, assignments: Vec<(&str, Expr)>) -> Self {
        Self::wrap(QueryOp::Insert {
            target: Expr::source(type_name),
            assignments: to_assignments(assignments),
            identity_insert: false,
        })
    }

    pub fn insert_with_identity(type_name: &str, assignments: Vec<(&str, Expr)>) -> Self {
        Self::wrap(QueryOp::Insert {
            target: Expr::source(type_name),
            assignments: to_assignments(assignments),
            identity_insert: true,
        })
    }

    pub fn update(self, row: &str, assignments: Vec<(&str, Expr)>) -> Self {
        Self::wrap(QueryOp::Update {
            source: self.expr,
            row: row.to_string(),
            assignments: to_assignments(assignments),
        })
    }

    pub fn delete(self) -> Self {
        Self::wrap(QueryOp::Delete { source: self.expr })
    }

    /// Applies an operator that has no dedicated builder method.
    pub fn call(self, name: &str, mut args: Vec<Expr>) -> Self {
        args.insert(0, self.expr);
        Self::wrap(QueryOp::Call {
            name: name.to_string(),
            args,
        })
    }
}

fn to_assignments(assignments: Vec<(&str, Expr)>) -> Vec<Assignment> {
    assignments
        .into_iter()
        .map(|(member, value)| Assignment {
            member: member.to_string(),
            value,
        })
        .collect()
}

impl From<Queryable> for Expr {
    fn from(q: Queryable) -> Self {
        q.expr
    }
}
