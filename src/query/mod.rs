//! The query operator tree: the caller-composed input to translation.
//!
//! `Expr` models host-language expressions (constants, captured variables,
//! lambda parameters, member access, operators, method calls) and
//! `QueryOp` models the composed query operators. Both are plain values:
//! composing a query builds new nodes and never mutates existing ones.
//! Use [`builder::Queryable`] for a fluent way to build trees.

pub mod builder;

use serde::{Deserialize, Serialize};

use crate::value::{DataType, Value};

pub use builder::{lambda, lambda2, param, Queryable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
    /// `left ?? right`
    Coalesce,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }

    /// The operator that gives the same result with swapped operands.
    pub fn mirrored(self) -> BinaryOp {
        match self {
            BinaryOp::LessThan => BinaryOp::GreaterThan,
            BinaryOp::LessThanOrEqual => BinaryOp::GreaterThanOrEqual,
            BinaryOp::GreaterThan => BinaryOp::LessThan,
            BinaryOp::GreaterThanOrEqual => BinaryOp::LessThanOrEqual,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
}

/// Host methods with a translation rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// String containment, or membership when the target is a list.
    Contains,
    StartsWith,
    EndsWith,
    Substring,
    Trim,
    TrimStart,
    TrimEnd,
    ToUpper,
    ToLower,
    IsNullOrEmpty,
    IsLike,
    CompareTo,
    Equals,
    AddDays,
    AddHours,
    AddMinutes,
    AddSeconds,
    AddMonths,
    AddYears,
    /// Server-side current local time.
    Now,
    /// Server-side current UTC time.
    UtcNow,
    /// Any other method, carried by name.
    Other(String),
}

impl Method {
    pub fn name(&self) -> &str {
        match self {
            Method::Contains => "Contains",
            Method::StartsWith => "StartsWith",
            Method::EndsWith => "EndsWith",
            Method::Substring => "Substring",
            Method::Trim => "Trim",
            Method::TrimStart => "TrimStart",
            Method::TrimEnd => "TrimEnd",
            Method::ToUpper => "ToUpper",
            Method::ToLower => "ToLower",
            Method::IsNullOrEmpty => "IsNullOrEmpty",
            Method::IsLike => "IsLike",
            Method::CompareTo => "CompareTo",
            Method::Equals => "Equals",
            Method::AddDays => "AddDays",
            Method::AddHours => "AddHours",
            Method::AddMinutes => "AddMinutes",
            Method::AddSeconds => "AddSeconds",
            Method::AddMonths => "AddMonths",
            Method::AddYears => "AddYears",
            Method::Now => "Now",
            Method::UtcNow => "UtcNow",
            Method::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OrderDirection {
    #[default]
    Ascending,
    Descending,
}

impl OrderDirection {
    pub fn reversed(self) -> Self {
        match self {
            OrderDirection::Ascending => OrderDirection::Descending,
            OrderDirection::Descending => OrderDirection::Ascending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectFirstKind {
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    Last,
    LastOrDefault,
}

impl SelectFirstKind {
    pub fn is_single(self) -> bool {
        matches!(self, SelectFirstKind::Single | SelectFirstKind::SingleOrDefault)
    }

    pub fn is_last(self) -> bool {
        matches!(self, SelectFirstKind::Last | SelectFirstKind::LastOrDefault)
    }

    pub fn or_default(self) -> bool {
        matches!(
            self,
            SelectFirstKind::FirstOrDefault
                | SelectFirstKind::SingleOrDefault
                | SelectFirstKind::LastOrDefault
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            SelectFirstKind::First => "First",
            SelectFirstKind::FirstOrDefault => "FirstOrDefault",
            SelectFirstKind::Single => "Single",
            SelectFirstKind::SingleOrDefault => "SingleOrDefault",
            SelectFirstKind::Last => "Last",
            SelectFirstKind::LastOrDefault => "LastOrDefault",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateKind {
    Count,
    LongCount,
    Min,
    Max,
    Sum,
    Average,
}

impl AggregateKind {
    pub fn is_count(self) -> bool {
        matches!(self, AggregateKind::Count | AggregateKind::LongCount)
    }

    pub fn name(self) -> &'static str {
        match self {
            AggregateKind::Count => "Count",
            AggregateKind::LongCount => "LongCount",
            AggregateKind::Min => "Min",
            AggregateKind::Max => "Max",
            AggregateKind::Sum => "Sum",
            AggregateKind::Average => "Average",
        }
    }
}

/// A selector or predicate: parameters bound by name within `body`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Expr,
}

/// One `member = value` pair of an insert or update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub member: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Constant(Value),
    /// A host variable captured by the query.
    Variable {
        name: String,
        value: Value,
    },
    /// A precomputed host value. Produced by partial evaluation.
    Placeholder {
        index: usize,
        value: Value,
    },
    Parameter(String),
    /// The abstract data source of every stored instance of a type.
    Source {
        type_name: String,
    },
    Member {
        target: Box<Expr>,
        member: String,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Convert {
        operand: Box<Expr>,
        data_type: DataType,
    },
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    Call {
        target: Option<Box<Expr>>,
        method: Method,
        args: Vec<Expr>,
    },
    /// Record construction. Typed when `type_name` is set.
    New {
        type_name: Option<String>,
        members: Vec<(String, Expr)>,
    },
    Query(Box<QueryOp>),
}

impl Expr {
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Constant(_)
            | Expr::Variable { .. }
            | Expr::Placeholder { .. }
            | Expr::Parameter(_)
            | Expr::Source { .. } => Vec::new(),
            Expr::Member { target, .. } => vec![&**target],
            Expr::Binary { left, right, .. } => vec![&**left, &**right],
            Expr::Unary { operand, .. } | Expr::Convert { operand, .. } => vec![&**operand],
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => vec![&**test, &**if_true, &**if_false],
            Expr::Call { target, args, .. } => {
                target.iter().map(|t| &**t).chain(args.iter()).collect()
            }
            Expr::New { members, .. } => members.iter().map(|(_, e)| e).collect(),
            Expr::Query(op) => op.exprs(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Constant(_)
            | Expr::Variable { .. }
            | Expr::Placeholder { .. }
            | Expr::Parameter(_)
            | Expr::Source { .. } => Vec::new(),
            Expr::Member { target, .. } => vec![&mut **target],
            Expr::Binary { left, right, .. } => vec![&mut **left, &mut **right],
            Expr::Unary { operand, .. } | Expr::Convert { operand, .. } => vec![&mut **operand],
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => vec![&mut **test, &mut **if_true, &mut **if_false],
            Expr::Call { target, args, .. } => target
                .iter_mut()
                .map(|t| &mut **t)
                .chain(args.iter_mut())
                .collect(),
            Expr::New { members, .. } => members.iter_mut().map(|(_, e)| e).collect(),
            Expr::Query(op) => op.exprs_mut(),
        }
    }

    pub fn as_query(&self) -> Option<&QueryOp> {
        match self {
            Expr::Query(op) => Some(op),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryOp {
    Where {
        source: Expr,
        predicate: Lambda,
    },
    Select {
        source: Expr,
        selector: Lambda,
    },
    SelectMany {
        source: Expr,
        collection: Lambda,
        result: Option<Lambda>,
    },
    Join {
        outer: Expr,
        inner: Expr,
        outer_key: Lambda,
        inner_key: Lambda,
        result: Lambda,
        left: bool,
    },
    GroupJoin {
        outer: Expr,
        inner: Expr,
        outer_key: Lambda,
        inner_key: Lambda,
        result: Lambda,
    },
    GroupBy {
        source: Expr,
        key: Lambda,
        element: Option<Lambda>,
        result: Option<Lambda>,
    },
    OrderBy {
        source: Expr,
        key: Lambda,
        direction: OrderDirection,
    },
    ThenBy {
        source: Expr,
        key: Lambda,
        direction: OrderDirection,
    },
    Take {
        source: Expr,
        count: Expr,
    },
    Skip {
        source: Expr,
        count: Expr,
    },
    Distinct {
        source: Expr,
    },
    First {
        source: Expr,
        kind: SelectFirstKind,
        predicate: Option<Lambda>,
    },
    Aggregate {
        source: Expr,
        kind: AggregateKind,
        selector: Option<Lambda>,
    },
    DefaultIfEmpty {
        source: Expr,
        default: Option<Expr>,
    },
    Contains {
        source: Expr,
        item: Expr,
    },
    Any {
        source: Expr,
        predicate: Option<Lambda>,
    },
    All {
        source: Expr,
        predicate: Lambda,
    },
    /// `Union` when `all` is false, `Concat` otherwise.
    Union {
        left: Expr,
        right: Expr,
        all: bool,
    },
    /// Eagerly loads a navigation member, reference or collection.
    Include {
        source: Expr,
        path: Lambda,
    },
    ForUpdate {
        source: Expr,
    },
    Insert {
        target: Expr,
        assignments: Vec<Assignment>,
        identity_insert: bool,
    },
    /// Assignment values may reference `row`, the row being updated.
    Update {
        source: Expr,
        row: String,
        assignments: Vec<Assignment>,
    },
    Delete {
        source: Expr,
    },
    /// An operator with no translation rule.
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

impl QueryOp {
    pub fn name(&self) -> &str {
        match self {
            QueryOp::Where { .. } => "Where",
            QueryOp::Select { .. } => "Select",
            QueryOp::SelectMany { .. } => "SelectMany",
            QueryOp::Join { left: false, .. } => "Join",
            QueryOp::Join { left: true, .. } => "LeftJoin",
            QueryOp::GroupJoin { .. } => "GroupJoin",
            QueryOp::GroupBy { .. } => "GroupBy",
            QueryOp::OrderBy {
                direction: OrderDirection::Ascending,
                ..
            } => "OrderBy",
            QueryOp::OrderBy { .. } => "OrderByDescending",
            QueryOp::ThenBy {
                direction: OrderDirection::Ascending,
                ..
            } => "ThenBy",
            QueryOp::ThenBy { .. } => "ThenByDescending",
            QueryOp::Take { .. } => "Take",
            QueryOp::Skip { .. } => "Skip",
            QueryOp::Distinct { .. } => "Distinct",
            QueryOp::First { kind, .. } => kind.name(),
            QueryOp::Aggregate { kind, .. } => kind.name(),
            QueryOp::DefaultIfEmpty { .. } => "DefaultIfEmpty",
            QueryOp::Contains { .. } => "Contains",
            QueryOp::Any { .. } => "Any",
            QueryOp::All { .. } => "All",
            QueryOp::Union { all: false, .. } => "Union",
            QueryOp::Union { all: true, .. } => "Concat",
            QueryOp::Include { .. } => "Include",
            QueryOp::ForUpdate { .. } => "ForUpdate",
            QueryOp::Insert { .. } => "Insert",
            QueryOp::Update { .. } => "Update",
            QueryOp::Delete { .. } => "Delete",
            QueryOp::Call { name, .. } => name,
        }
    }

    /// Every expression held by this operator, lambda bodies included.
    pub fn exprs(&self) -> Vec<&Expr> {
        let mut out: Vec<&Expr> = Vec::new();
        match self {
            QueryOp::Where {
                source,
                predicate: l,
            }
            | QueryOp::Select {
                source,
                selector: l,
            }
            | QueryOp::OrderBy { source, key: l, .. }
            | QueryOp::ThenBy { source, key: l, .. }
            | QueryOp::All {
                source,
                predicate: l,
            }
            | QueryOp::Include { source, path: l } => {
                out.push(source);
                out.push(&l.body);
            }
            QueryOp::SelectMany {
                source,
                collection,
                result,
            } => {
                out.push(source);
                out.push(&collection.body);
                out.extend(result.iter().map(|l| &l.body));
            }
            QueryOp::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
                ..
            }
            | QueryOp::GroupJoin {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
            } => {
                out.extend([outer, inner, &outer_key.body, &inner_key.body, &result.body]);
            }
            QueryOp::GroupBy {
                source,
                key,
                element,
                result,
            } => {
                out.push(source);
                out.push(&key.body);
                out.extend(element.iter().map(|l| &l.body));
                out.extend(result.iter().map(|l| &l.body));
            }
            QueryOp::Take { source, count } | QueryOp::Skip { source, count } => {
                out.extend([source, count]);
            }
            QueryOp::Distinct { source }
            | QueryOp::ForUpdate { source }
            | QueryOp::Delete { source } => out.push(source),
            QueryOp::First {
                source, predicate, ..
            }
            | QueryOp::Any { source, predicate } => {
                out.push(source);
                out.extend(predicate.iter().map(|l| &l.body));
            }
            QueryOp::Aggregate {
                source, selector, ..
            } => {
                out.push(source);
                out.extend(selector.iter().map(|l| &l.body));
            }
            QueryOp::DefaultIfEmpty { source, default } => {
                out.push(source);
                out.extend(default.iter());
            }
            QueryOp::Contains { source, item } => out.extend([source, item]),
            QueryOp::Union { left, right, .. } => out.extend([left, right]),
            QueryOp::Insert {
                target,
                assignments,
                ..
            } => {
                out.push(target);
                out.extend(assignments.iter().map(|a| &a.value));
            }
            QueryOp::Update {
                source,
                assignments,
                ..
            } => {
                out.push(source);
                out.extend(assignments.iter().map(|a| &a.value));
            }
            QueryOp::Call { args, .. } => out.extend(args.iter()),
        }
        out
    }

    pub fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        let mut out: Vec<&mut Expr> = Vec::new();
        match self {
            QueryOp::Where {
                source,
                predicate: l,
            }
            | QueryOp::Select {
                source,
                selector: l,
            }
            | QueryOp::OrderBy { source, key: l, .. }
            | QueryOp::ThenBy { source, key: l, .. }
            | QueryOp::All {
                source,
                predicate: l,
            }
            | QueryOp::Include { source, path: l } => {
                out.push(source);
                out.push(&mut l.body);
            }
            QueryOp::SelectMany {
                source,
                collection,
                result,
            } => {
                out.push(source);
                out.push(&mut collection.body);
                out.extend(result.iter_mut().map(|l| &mut l.body));
            }
            QueryOp::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
                ..
            }
            | QueryOp::GroupJoin {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
            } => {
                out.extend([
                    outer,
                    inner,
                    &mut outer_key.body,
                    &mut inner_key.body,
                    &mut result.body,
                ]);
            }
            QueryOp::GroupBy {
                source,
                key,
                element,
                result,
            } => {
                out.push(source);
                out.push(&mut key.body);
                out.extend(element.iter_mut().map(|l| &mut l.body));
                out.extend(result.iter_mut().map(|l| &mut l.body));
            }
            QueryOp::Take { source, count } | QueryOp::Skip { source, count } => {
                out.extend([source, count]);
            }
            QueryOp::Distinct { source }
            | QueryOp::ForUpdate { source }
            | QueryOp::Delete { source } => out.push(source),
            QueryOp::First {
                source, predicate, ..
            }
            | QueryOp::Any { source, predicate } => {
                out.push(source);
                out.extend(predicate.iter_mut().map(|l| &mut l.body));
            }
            QueryOp::Aggregate {
                source, selector, ..
            } => {
                out.push(source);
                out.extend(selector.iter_mut().map(|l| &mut l.body));
            }
            QueryOp::DefaultIfEmpty { source, default } => {
                out.push(source);
                out.extend(default.iter_mut());
            }
            QueryOp::Contains { source, item } => out.extend([source, item]),
            QueryOp::Union { left, right, .. } => out.extend([left, right]),
            QueryOp::Insert {
                target,
                assignments,
                ..
            } => {
                out.push(target);
                out.extend(assignments.iter_mut().map(|a| &mut a.value));
            }
            QueryOp::Update {
                source,
                assignments,
                ..
            } => {
                out.push(source);
                out.extend(assignments.iter_mut().map(|a| &mut a.value));
            }
            QueryOp::Call { args, .. } => out.extend(args.iter_mut()),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_names() {
        let q = Queryable::source("Widget").order_by_descending(lambda("w", param("w").member("Id")));
        assert_eq!(q.expr().as_query().unwrap().name(), "OrderByDescending");

        let q = Queryable::source("Widget").concat(Queryable::source("Widget"));
        assert_eq!(q.expr().as_query().unwrap().name(), "Concat");
    }

    #[test]
    fn test_exprs_include_lambda_bodies() {
        let q = Queryable::source("Widget").filter(lambda("w", param("w").member("Active")));
        let op = q.expr().as_query().unwrap();
        let exprs = op.exprs();
        assert_eq!(exprs.len(), 2);
        assert!(matches!(exprs[1], Expr::Member { .. }));
    }

    #[test]
    fn test_mirrored_comparison() {
        assert_eq!(BinaryOp::GreaterThan.mirrored(), BinaryOp::LessThan);
        assert_eq!(BinaryOp::Equal.mirrored(), BinaryOp::Equal);
    }

    #[test]
    fn test_query_tree_from_json() {
        let q = Queryable::source("Widget")
            .filter(lambda("w", param("w").member("Name").eq(Expr::constant("X"))))
            .take(3);
        let json = q.to_json().unwrap();
        let parsed = Queryable::from_json(&json).unwrap();
        assert_eq!(parsed, q);
    }

    #[test]
    fn test_malformed_query_tree() {
        let err = Queryable::from_json("{\"Nope\": 1}").unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse query tree"));
    }
}
