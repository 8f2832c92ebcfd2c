//! SQL expression tree types for querybind.
//!
//! This module defines the intermediate representation produced by the
//! binder, rewritten by the optimizer passes and rendered by the formatter.
//! The tree is:
//! - Closed (one enum, exhaustive matches in every stage)
//! - Immutable-friendly (clone-based, pure rewrites)
//! - Dialect-agnostic (function identifiers are abstract until formatting)

use crate::error::{QueryError, Result};
use crate::query::{AggregateKind, OrderDirection, SelectFirstKind};
use crate::value::{DataType, Value};

/// A node of the SQL expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Table(TableExpr),
    Select(Box<SelectExpr>),
    Join(Box<JoinExpr>),
    Union(Box<UnionExpr>),
    Insert(Box<InsertExpr>),
    Update(Box<UpdateExpr>),
    Delete(Box<DeleteExpr>),
    /// A row-producing select plus how rows turn into host values.
    Projection(Box<Projection>),
    /// A select used as a scalar value.
    Subquery(Box<SelectExpr>),

    Column(ColumnExpr),
    Constant(Value),
    /// A host value computed before binding.
    Placeholder {
        index: usize,
        value: Value,
    },
    Binary {
        op: BinaryOperator,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<SqlExpr>,
    },
    Convert {
        operand: Box<SqlExpr>,
        data_type: DataType,
    },
    Conditional {
        test: Box<SqlExpr>,
        if_true: Box<SqlExpr>,
        if_false: Box<SqlExpr>,
    },
    FunctionCall {
        function: SqlFunction,
        args: Vec<SqlExpr>,
        data_type: DataType,
    },
    Aggregate(Box<AggregateExpr>),
    /// A row value `(a, b, ...)`.
    Tuple(Vec<SqlExpr>),

    /// A reconstructed domain object.
    ObjectReference(ObjectReference),
    /// An anonymous record built by a selector.
    Record(Vec<(String, SqlExpr)>),
    /// The result of a group-by: its key and its element sequence.
    Grouping {
        key: Box<SqlExpr>,
        group: Box<Projection>,
    },
    /// An eagerly included collection. Each row carries one element, and
    /// consecutive rows of the same owner fold into one list.
    IncludedCollection(Box<SqlExpr>),
}

/// A SELECT with all clauses the binder produces.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectExpr {
    pub alias: String,
    pub columns: Vec<ColumnDeclaration>,
    pub from: Option<SqlExpr>,
    pub where_clause: Option<SqlExpr>,
    pub order_by: Vec<OrderByExpr>,
    pub group_by: Vec<SqlExpr>,
    pub distinct: bool,
    pub skip: Option<SqlExpr>,
    pub take: Option<SqlExpr>,
    pub for_update: bool,
    /// Ordering must be inverted (set by `Last`).
    pub reverse: bool,
}

/// A named output column of a select.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDeclaration {
    pub name: String,
    pub expr: SqlExpr,
    /// Pins the column so no pass may remove its select.
    pub no_optimise: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: SqlExpr,
    pub direction: OrderDirection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnExpr {
    pub alias: String,
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableExpr {
    pub alias: String,
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Cross,
    Inner,
    Left,
    CrossApply,
    OuterApply,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinExpr {
    pub kind: JoinKind,
    pub left: SqlExpr,
    pub right: SqlExpr,
    pub condition: Option<SqlExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionExpr {
    pub alias: String,
    pub left: SelectExpr,
    pub right: SelectExpr,
    pub all: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertExpr {
    pub table: TableExpr,
    pub columns: Vec<String>,
    pub values: Vec<SqlExpr>,
    /// Server-generated columns to read back after the insert.
    pub returning: Vec<String>,
    pub identity_insert: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: SqlExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateExpr {
    pub table: TableExpr,
    pub assignments: Vec<Assignment>,
    pub where_clause: Option<SqlExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteExpr {
    pub table: TableExpr,
    pub where_clause: Option<SqlExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub kind: AggregateKind,
    pub argument: Option<SqlExpr>,
    pub distinct: bool,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberBinding {
    pub member: String,
    pub expr: SqlExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectReference {
    pub type_name: String,
    pub bindings: Vec<MemberBinding>,
    /// Only the primary key is bound (a foreign-key reference).
    pub deflated: bool,
}

impl ObjectReference {
    pub fn binding(&self, member: &str) -> Option<&SqlExpr> {
        self.bindings
            .iter()
            .find(|b| b.member == member)
            .map(|b| &b.expr)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub select: SelectExpr,
    pub projector: SqlExpr,
    pub aggregator: Option<Aggregator>,
}

/// Host-side collapsing of a result set into one value.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregator {
    /// First/Single/Last semantics over the (already limited) rows.
    SelectFirst {
        kind: SelectFirstKind,
        /// Substituted for an empty result instead of failing.
        default: Option<Value>,
    },
    /// Unwraps the single row of a root aggregate.
    Aggregate {
        kind: AggregateKind,
        nullable: bool,
        default_if_empty: bool,
        default: Option<Value>,
        zero: Value,
    },
    /// The single boolean row of a root `Contains`, `Any` or `All`.
    SingleOrDefault,
    /// Reads the first row and reports the affected row count.
    RecordsAffected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

impl BinaryOperator {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Minus,
}

/// Abstract function identifiers, resolved per dialect when formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlFunction {
    IsNull,
    IsNotNull,
    In,
    NotIn,
    Exists,
    Like,
    NotLike,
    Concat,
    Coalesce,
    StringLength,
    ContainsString,
    StartsWith,
    EndsWith,
    Substring,
    Trim,
    TrimLeft,
    TrimRight,
    Upper,
    Lower,
    ServerNow,
    ServerUtcNow,
    Year,
    Month,
    Week,
    DayOfYear,
    DayOfMonth,
    DayOfWeek,
    Hour,
    Minute,
    Second,
    Date,
    RecordsAffected,
}

impl SqlFunction {
    pub fn name(self) -> &'static str {
        match self {
            SqlFunction::IsNull => "IS NULL",
            SqlFunction::IsNotNull => "IS NOT NULL",
            SqlFunction::In => "IN",
            SqlFunction::NotIn => "NOT IN",
            SqlFunction::Exists => "EXISTS",
            SqlFunction::Like => "LIKE",
            SqlFunction::NotLike => "NOT LIKE",
            SqlFunction::Concat => "CONCAT",
            SqlFunction::Coalesce => "COALESCE",
            SqlFunction::StringLength => "LENGTH",
            SqlFunction::ContainsString => "CONTAINS",
            SqlFunction::StartsWith => "STARTSWITH",
            SqlFunction::EndsWith => "ENDSWITH",
            SqlFunction::Substring => "SUBSTRING",
            SqlFunction::Trim => "TRIM",
            SqlFunction::TrimLeft => "LTRIM",
            SqlFunction::TrimRight => "RTRIM",
            SqlFunction::Upper => "UPPER",
            SqlFunction::Lower => "LOWER",
            SqlFunction::ServerNow => "NOW",
            SqlFunction::ServerUtcNow => "UTCNOW",
            SqlFunction::Year => "YEAR",
            SqlFunction::Month => "MONTH",
            SqlFunction::Week => "WEEK",
            SqlFunction::DayOfYear => "DAYOFYEAR",
            SqlFunction::DayOfMonth => "DAY",
            SqlFunction::DayOfWeek => "DAYOFWEEK",
            SqlFunction::Hour => "HOUR",
            SqlFunction::Minute => "MINUTE",
            SqlFunction::Second => "SECOND",
            SqlFunction::Date => "DATE",
            SqlFunction::RecordsAffected => "RECORDS_AFFECTED",
        }
    }
}

impl SelectExpr {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            columns: Vec::new(),
            from: None,
            where_clause: None,
            order_by: Vec::new(),
            group_by: Vec::new(),
            distinct: false,
            skip: None,
            take: None,
            for_update: false,
            reverse: false,
        }
    }

    pub fn with_columns(mut self, columns: Vec<ColumnDeclaration>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_from(mut self, from: SqlExpr) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_where(mut self, predicate: Option<SqlExpr>) -> Self {
        self.where_clause = predicate;
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDeclaration> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// A reference to the column computing `expr`, declaring one if needed.
    pub fn reference_column(&mut self, expr: SqlExpr) -> SqlExpr {
        let data_type = expr.data_type();
        let name = match self.columns.iter().find(|c| c.expr == expr) {
            Some(column) => column.name.clone(),
            None => {
                let base = match &expr {
                    SqlExpr::Column(c) => c.name.clone(),
                    _ => "c".to_string(),
                };
                let mut name = base.clone();
                let mut suffix = 0;
                while self.find_column(&name).is_some() {
                    name = format!("{}{}", base, suffix);
                    suffix += 1;
                }
                self.columns.push(ColumnDeclaration::new(name.clone(), expr));
                name
            }
        };
        SqlExpr::column(&self.alias, &name, data_type)
    }

    /// No clause other than the column list and the source.
    pub fn is_plain(&self) -> bool {
        self.where_clause.is_none()
            && self.order_by.is_empty()
            && self.group_by.is_empty()
            && !self.distinct
            && self.skip.is_none()
            && self.take.is_none()
            && !self.for_update
            && !self.reverse
    }

    pub fn has_aggregates(&self) -> bool {
        self.columns
            .iter()
            .any(|c| matches!(c.expr, SqlExpr::Aggregate(_)))
    }

    /// Visits every direct child expression in clause order.
    pub fn for_each_child(&self, f: &mut dyn FnMut(&SqlExpr)) {
        for column in &self.columns {
            f(&column.expr);
        }
        if let Some(from) = &self.from {
            f(from);
        }
        if let Some(predicate) = &self.where_clause {
            f(predicate);
        }
        for group in &self.group_by {
            f(group);
        }
        for order in &self.order_by {
            f(&order.expr);
        }
        if let Some(skip) = &self.skip {
            f(skip);
        }
        if let Some(take) = &self.take {
            f(take);
        }
    }

    /// Rebuilds the select with every direct child expression mapped.
    pub fn map_children(
        self,
        f: &mut dyn FnMut(SqlExpr) -> Result<SqlExpr>,
    ) -> Result<SelectExpr> {
        let SelectExpr {
            alias,
            columns,
            from,
            where_clause,
            order_by,
            group_by,
            distinct,
            skip,
            take,
            for_update,
            reverse,
        } = self;
        Ok(SelectExpr {
            alias,
            columns: columns
                .into_iter()
                .map(|c| {
                    Ok(ColumnDeclaration {
                        expr: f(c.expr)?,
                        ..c
                    })
                })
                .collect::<Result<_>>()?,
            from: from.map(&mut *f).transpose()?,
            where_clause: where_clause.map(&mut *f).transpose()?,
            group_by: group_by
                .into_iter()
                .map(&mut *f)
                .collect::<Result<_>>()?,
            order_by: order_by
                .into_iter()
                .map(|o| {
                    Ok(OrderByExpr {
                        expr: f(o.expr)?,
                        direction: o.direction,
                    })
                })
                .collect::<Result<_>>()?,
            skip: skip.map(&mut *f).transpose()?,
            take: take.map(&mut *f).transpose()?,
            distinct,
            for_update,
            reverse,
        })
    }
}

impl ColumnDeclaration {
    pub fn new(name: impl Into<String>, expr: SqlExpr) -> Self {
        Self {
            name: name.into(),
            expr,
            no_optimise: false,
        }
    }

    pub fn pinned(name: impl Into<String>, expr: SqlExpr) -> Self {
        Self {
            name: name.into(),
            expr,
            no_optimise: true,
        }
    }
}

impl Projection {
    pub fn new(select: SelectExpr, projector: SqlExpr) -> Self {
        Self {
            select,
            projector,
            aggregator: None,
        }
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = Some(aggregator);
        self
    }
}

impl SqlExpr {
    pub fn column(alias: &str, name: &str, data_type: DataType) -> SqlExpr {
        SqlExpr::Column(ColumnExpr {
            alias: alias.to_string(),
            name: name.to_string(),
            data_type,
        })
    }

    pub fn binary(op: BinaryOperator, left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn function(function: SqlFunction, args: Vec<SqlExpr>, data_type: DataType) -> SqlExpr {
        SqlExpr::FunctionCall {
            function,
            args,
            data_type,
        }
    }

    pub fn not(operand: SqlExpr) -> SqlExpr {
        SqlExpr::Unary {
            op: UnaryOperator::Not,
            operand: Box::new(operand),
        }
    }

    /// Joins predicates with AND, left to right.
    pub fn and_all(predicates: impl IntoIterator<Item = SqlExpr>) -> Option<SqlExpr> {
        predicates
            .into_iter()
            .reduce(|acc, p| SqlExpr::binary(BinaryOperator::And, acc, p))
    }

    pub fn is_null_constant(&self) -> bool {
        matches!(self, SqlExpr::Constant(Value::Null))
    }

    pub fn as_column(&self) -> Option<&ColumnExpr> {
        match self {
            SqlExpr::Column(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_projection(self) -> Result<Projection> {
        match self {
            SqlExpr::Projection(p) => Ok(*p),
            other => Err(QueryError::binding(format!(
                "expected a sequence, found {}",
                other.kind_name()
            ))),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            SqlExpr::Table(_) => "table",
            SqlExpr::Select(_) => "select",
            SqlExpr::Join(_) => "join",
            SqlExpr::Union(_) => "union",
            SqlExpr::Insert(_) => "insert",
            SqlExpr::Update(_) => "update",
            SqlExpr::Delete(_) => "delete",
            SqlExpr::Projection(_) => "projection",
            SqlExpr::Subquery(_) => "subquery",
            SqlExpr::Column(_) => "column",
            SqlExpr::Constant(_) => "constant",
            SqlExpr::Placeholder { .. } => "placeholder",
            SqlExpr::Binary { .. } => "binary expression",
            SqlExpr::Unary { .. } => "unary expression",
            SqlExpr::Convert { .. } => "conversion",
            SqlExpr::Conditional { .. } => "conditional",
            SqlExpr::FunctionCall { .. } => "function call",
            SqlExpr::Aggregate(_) => "aggregate",
            SqlExpr::Tuple(_) => "tuple",
            SqlExpr::ObjectReference(_) => "object reference",
            SqlExpr::Record(_) => "record",
            SqlExpr::Grouping { .. } => "grouping",
            SqlExpr::IncludedCollection(_) => "included collection",
        }
    }

    /// Static type of a scalar expression.
    pub fn data_type(&self) -> DataType {
        match self {
            SqlExpr::Column(c) => c.data_type.clone(),
            SqlExpr::Constant(v) | SqlExpr::Placeholder { value: v, .. } => v.data_type(),
            SqlExpr::Binary { op, left, right } => {
                if op.is_comparison() || op.is_logical() {
                    DataType::Bool
                } else {
                    let (l, r) = (left.data_type(), right.data_type());
                    if *r.unwrap_nullable() == DataType::Float {
                        r
                    } else {
                        l
                    }
                }
            }
            SqlExpr::Unary {
                op: UnaryOperator::Not,
                ..
            } => DataType::Bool,
            SqlExpr::Unary { operand, .. } => operand.data_type(),
            SqlExpr::Convert { data_type, .. } => data_type.clone(),
            SqlExpr::Conditional { if_true, .. } => if_true.data_type(),
            SqlExpr::FunctionCall { data_type, .. } => data_type.clone(),
            SqlExpr::Aggregate(a) => a.data_type.clone(),
            SqlExpr::Subquery(s) => s
                .columns
                .first()
                .map(|c| DataType::nullable(c.expr.data_type()))
                .unwrap_or(DataType::Unknown),
            SqlExpr::ObjectReference(o) => DataType::Object(o.type_name.clone()),
            _ => DataType::Unknown,
        }
    }

    /// Visits every direct child expression.
    pub fn for_each_child(&self, f: &mut dyn FnMut(&SqlExpr)) {
        match self {
            SqlExpr::Table(_)
            | SqlExpr::Column(_)
            | SqlExpr::Constant(_)
            | SqlExpr::Placeholder { .. } => {}
            SqlExpr::Select(s) | SqlExpr::Subquery(s) => s.for_each_child(f),
            SqlExpr::Join(j) => {
                f(&j.left);
                f(&j.right);
                if let Some(c) = &j.condition {
                    f(c);
                }
            }
            SqlExpr::Union(u) => {
                u.left.for_each_child(f);
                u.right.for_each_child(f);
            }
            SqlExpr::Insert(i) => i.values.iter().for_each(|v| f(v)),
            SqlExpr::Update(u) => {
                u.assignments.iter().for_each(|a| f(&a.value));
                if let Some(w) = &u.where_clause {
                    f(w);
                }
            }
            SqlExpr::Delete(d) => {
                if let Some(w) = &d.where_clause {
                    f(w);
                }
            }
            SqlExpr::Projection(p) => {
                p.select.for_each_child(f);
                f(&p.projector);
            }
            SqlExpr::Binary { left, right, .. } => {
                f(left);
                f(right);
            }
            SqlExpr::Unary { operand, .. } | SqlExpr::Convert { operand, .. } => f(operand),
            SqlExpr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                f(test);
                f(if_true);
                f(if_false);
            }
            SqlExpr::FunctionCall { args, .. } | SqlExpr::Tuple(args) => {
                args.iter().for_each(|a| f(a))
            }
            SqlExpr::Aggregate(a) => {
                if let Some(arg) = &a.argument {
                    f(arg);
                }
            }
            SqlExpr::ObjectReference(o) => o.bindings.iter().for_each(|b| f(&b.expr)),
            SqlExpr::Record(members) => members.iter().for_each(|(_, e)| f(e)),
            SqlExpr::Grouping { key, group } => {
                f(key);
                group.select.for_each_child(f);
                f(&group.projector);
            }
            SqlExpr::IncludedCollection(element) => f(element),
        }
    }

    /// Rebuilds this node with every direct child expression mapped.
    pub fn map_children(self, f: &mut dyn FnMut(SqlExpr) -> Result<SqlExpr>) -> Result<SqlExpr> {
        Ok(match self {
            leaf @ (SqlExpr::Table(_)
            | SqlExpr::Column(_)
            | SqlExpr::Constant(_)
            | SqlExpr::Placeholder { .. }) => leaf,
            SqlExpr::Select(s) => SqlExpr::Select(Box::new(s.map_children(f)?)),
            SqlExpr::Subquery(s) => SqlExpr::Subquery(Box::new(s.map_children(f)?)),
            SqlExpr::Join(j) => {
                let JoinExpr {
                    kind,
                    left,
                    right,
                    condition,
                } = *j;
                SqlExpr::Join(Box::new(JoinExpr {
                    kind,
                    left: f(left)?,
                    right: f(right)?,
                    condition: condition.map(&mut *f).transpose()?,
                }))
            }
            SqlExpr::Union(u) => {
                let UnionExpr {
                    alias,
                    left,
                    right,
                    all,
                } = *u;
                SqlExpr::Union(Box::new(UnionExpr {
                    alias,
                    left: left.map_children(f)?,
                    right: right.map_children(f)?,
                    all,
                }))
            }
            SqlExpr::Insert(i) => {
                let mut i = *i;
                i.values = i.values.into_iter().map(&mut *f).collect::<Result<_>>()?;
                SqlExpr::Insert(Box::new(i))
            }
            SqlExpr::Update(u) => {
                let mut u = *u;
                u.assignments = u
                    .assignments
                    .into_iter()
                    .map(|a| {
                        Ok(Assignment {
                            column: a.column,
                            value: f(a.value)?,
                        })
                    })
                    .collect::<Result<_>>()?;
                u.where_clause = u.where_clause.map(&mut *f).transpose()?;
                SqlExpr::Update(Box::new(u))
            }
            SqlExpr::Delete(d) => {
                let mut d = *d;
                d.where_clause = d.where_clause.map(&mut *f).transpose()?;
                SqlExpr::Delete(Box::new(d))
            }
            SqlExpr::Projection(p) => SqlExpr::Projection(Box::new(map_projection(*p, f)?)),
            SqlExpr::Binary { op, left, right } => SqlExpr::Binary {
                op,
                left: Box::new(f(*left)?),
                right: Box::new(f(*right)?),
            },
            SqlExpr::Unary { op, operand } => SqlExpr::Unary {
                op,
                operand: Box::new(f(*operand)?),
            },
            SqlExpr::Convert { operand, data_type } => SqlExpr::Convert {
                operand: Box::new(f(*operand)?),
                data_type,
            },
            SqlExpr::Conditional {
                test,
                if_true,
                if_false,
            } => SqlExpr::Conditional {
                test: Box::new(f(*test)?),
                if_true: Box::new(f(*if_true)?),
                if_false: Box::new(f(*if_false)?),
            },
            SqlExpr::FunctionCall {
                function,
                args,
                data_type,
            } => SqlExpr::FunctionCall {
                function,
                args: args.into_iter().map(&mut *f).collect::<Result<_>>()?,
                data_type,
            },
            SqlExpr::Aggregate(a) => SqlExpr::Aggregate(Box::new(map_aggregate(*a, f)?)),
            SqlExpr::Tuple(items) => {
                SqlExpr::Tuple(items.into_iter().map(&mut *f).collect::<Result<_>>()?)
            }
            SqlExpr::ObjectReference(o) => SqlExpr::ObjectReference(ObjectReference {
                type_name: o.type_name,
                bindings: o
                    .bindings
                    .into_iter()
                    .map(|b| {
                        Ok(MemberBinding {
                            member: b.member,
                            expr: f(b.expr)?,
                        })
                    })
                    .collect::<Result<_>>()?,
                deflated: o.deflated,
            }),
            SqlExpr::Record(members) => SqlExpr::Record(
                members
                    .into_iter()
                    .map(|(n, e)| Ok((n, f(e)?)))
                    .collect::<Result<_>>()?,
            ),
            SqlExpr::Grouping { key, group } => SqlExpr::Grouping {
                key: Box::new(f(*key)?),
                group: Box::new(map_projection(*group, f)?),
            },
            SqlExpr::IncludedCollection(element) => {
                SqlExpr::IncludedCollection(Box::new(f(*element)?))
            }
        })
    }

    /// Post-order rewrite: children first, then `f` on the rebuilt node.
    pub fn transform_up(self, f: &mut dyn FnMut(SqlExpr) -> Result<SqlExpr>) -> Result<SqlExpr> {
        let rebuilt = self.map_children(&mut |child| child.transform_up(&mut *f))?;
        f(rebuilt)
    }

    /// Whether any node in this subtree satisfies `pred`.
    pub fn any(&self, pred: &mut dyn FnMut(&SqlExpr) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        let mut found = false;
        self.for_each_child(&mut |child| {
            if !found && child.any(&mut *pred) {
                found = true;
            }
        });
        found
    }

    /// Whether a column of `alias` is referenced anywhere in this subtree.
    pub fn references_alias(&self, alias: &str) -> bool {
        self.any(&mut |e| matches!(e, SqlExpr::Column(c) if c.alias == alias))
    }

    /// Replaces every column of `alias` with the expression it declares.
    pub fn inline_columns(self, alias: &str, columns: &[ColumnDeclaration]) -> Result<SqlExpr> {
        self.transform_up(&mut |e| match e {
            SqlExpr::Column(c) if c.alias == alias => columns
                .iter()
                .find(|d| d.name == c.name)
                .map(|d| d.expr.clone())
                .ok_or_else(|| {
                    QueryError::binding(format!("column {}.{} is not declared", c.alias, c.name))
                }),
            other => Ok(other),
        })
    }

    /// Re-points every column of `from` to `to`, keeping names.
    pub fn retarget_alias(self, from: &str, to: &str) -> Result<SqlExpr> {
        self.transform_up(&mut |e| match e {
            SqlExpr::Column(mut c) if c.alias == from => {
                c.alias = to.to_string();
                Ok(SqlExpr::Column(c))
            }
            other => Ok(other),
        })
    }
}

impl From<Projection> for SqlExpr {
    fn from(projection: Projection) -> Self {
        SqlExpr::Projection(Box::new(projection))
    }
}

impl SelectExpr {
    /// Whether any expression of this select references `alias`.
    pub fn references_alias(&self, alias: &str) -> bool {
        let mut found = false;
        self.for_each_child(&mut |child| {
            if !found && child.references_alias(alias) {
                found = true;
            }
        });
        found
    }
}

fn map_projection(
    projection: Projection,
    f: &mut dyn FnMut(SqlExpr) -> Result<SqlExpr>,
) -> Result<Projection> {
    Ok(Projection {
        select: projection.select.map_children(f)?,
        projector: f(projection.projector)?,
        aggregator: projection.aggregator,
    })
}

fn map_aggregate(
    aggregate: AggregateExpr,
    f: &mut dyn FnMut(SqlExpr) -> Result<SqlExpr>,
) -> Result<AggregateExpr> {
    Ok(AggregateExpr {
        argument: aggregate.argument.map(f).transpose()?,
        ..aggregate
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget_select(alias: &str, table_alias: &str) -> SelectExpr {
        SelectExpr::new(alias)
            .with_columns(vec![
                ColumnDeclaration::new("Id", SqlExpr::column(table_alias, "Id", DataType::Int)),
                ColumnDeclaration::new(
                    "Name",
                    SqlExpr::column(table_alias, "Name", DataType::Text),
                ),
            ])
            .with_from(SqlExpr::Table(TableExpr {
                alias: table_alias.into(),
                name: "Widgets".into(),
                type_name: "Widget".into(),
            }))
    }

    #[test]
    fn test_default_select_is_plain() {
        let select = SelectExpr::new("T0");
        assert!(select.is_plain());
        assert!(select.columns.is_empty());
        assert!(select.from.is_none());
    }

    #[test]
    fn test_find_column() {
        let select = widget_select("T1", "T0");
        assert_eq!(select.column_index("Name"), Some(1));
        assert!(select.find_column("Missing").is_none());
    }

    #[test]
    fn test_references_alias() {
        let select = SqlExpr::Select(Box::new(widget_select("T1", "T0")));
        assert!(select.references_alias("T0"));
        assert!(!select.references_alias("T1"));
    }

    #[test]
    fn test_transform_up_renames_columns() {
        let select = SqlExpr::Select(Box::new(widget_select("T1", "T0")));
        let renamed = select
            .transform_up(&mut |e| match e {
                SqlExpr::Column(mut c) if c.alias == "T0" => {
                    c.alias = "T9".into();
                    Ok(SqlExpr::Column(c))
                }
                other => Ok(other),
            })
            .unwrap();
        assert!(renamed.references_alias("T9"));
        assert!(!renamed.references_alias("T0"));
    }

    #[test]
    fn test_inline_columns() {
        let select = widget_select("T1", "T0");
        let reference = SqlExpr::column("T1", "Name", DataType::Text);
        let inlined = reference.inline_columns("T1", &select.columns).unwrap();
        assert_eq!(inlined, SqlExpr::column("T0", "Name", DataType::Text));

        let missing = SqlExpr::column("T1", "Nope", DataType::Text);
        assert!(missing.inline_columns("T1", &select.columns).is_err());
    }

    #[test]
    fn test_and_all() {
        let a = SqlExpr::column("T0", "A", DataType::Bool);
        let b = SqlExpr::column("T0", "B", DataType::Bool);
        let joined = SqlExpr::and_all(vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(joined, SqlExpr::binary(BinaryOperator::And, a, b));
        assert!(SqlExpr::and_all(Vec::new()).is_none());
    }

    #[test]
    fn test_comparison_data_type() {
        let cmp = SqlExpr::binary(
            BinaryOperator::Gt,
            SqlExpr::column("T0", "Price", DataType::Float),
            SqlExpr::Constant(Value::Int(3)),
        );
        assert_eq!(cmp.data_type(), DataType::Bool);
    }
}
