//! Member access, operators and method calls.

use crate::ast::evaluator::interpret;
use crate::ast::types::{BinaryOperator, ObjectReference, SqlExpr, SqlFunction, UnaryOperator};
use crate::error::{QueryError, Result};
use crate::query::{BinaryOp, Expr, Method, UnaryOp};
use crate::value::{DataType, Value};

use super::Binder;

impl<'a> Binder<'a> {
    pub(super) fn bind_member(&mut self, target: SqlExpr, member: &str) -> Result<SqlExpr> {
        match target {
            SqlExpr::ObjectReference(object) => self.object_member(object, member),
            SqlExpr::Record(members) => members
                .into_iter()
                .find(|(name, _)| name == member)
                .map(|(_, expr)| expr)
                .ok_or_else(|| QueryError::UnsupportedMember {
                    target: "record".into(),
                    member: member.into(),
                }),
            SqlExpr::Grouping { key, .. } if member == "Key" => Ok(*key),
            SqlExpr::Grouping { group, .. } if member == "Count" => {
                self.sequence_count(*group)
            }
            SqlExpr::Projection(projection) if member == "Count" => {
                self.sequence_count(*projection)
            }
            // a member of a single-row sequence such as a nested First()
            SqlExpr::Projection(projection) => {
                let value = self.bind_member(projection.projector.clone(), member)?;
                Ok(SqlExpr::Subquery(Box::new(
                    self.value_select(*projection, vec![value])?,
                )))
            }
            SqlExpr::Constant(value) | SqlExpr::Placeholder { value, .. } => {
                let host = Expr::Member {
                    target: Box::new(Expr::Constant(value)),
                    member: member.to_string(),
                };
                Ok(SqlExpr::Constant(interpret(&host)?))
            }
            scalar => scalar_member(scalar, member),
        }
    }

    fn sequence_count(&mut self, projection: crate::ast::types::Projection) -> Result<SqlExpr> {
        let count = self.aggregate_expr(crate::query::AggregateKind::Count, None, false)?;
        Ok(SqlExpr::Subquery(Box::new(self.value_select(
            projection,
            vec![SqlExpr::Aggregate(Box::new(count))],
        )?)))
    }

    pub(super) fn bind_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<SqlExpr> {
        if op.is_comparison() {
            if let Some(rewritten) = self.compare_to(op, left, right)? {
                return Ok(rewritten);
            }
        }
        let left = self.visit(left)?;
        let right = self.visit(right)?;
        match op {
            BinaryOp::Coalesce => {
                let data_type = right.data_type();
                Ok(SqlExpr::function(SqlFunction::Coalesce, vec![left, right], data_type))
            }
            BinaryOp::Add if is_text(&left) || is_text(&right) => Ok(SqlExpr::function(
                SqlFunction::Concat,
                vec![left, right],
                DataType::Text,
            )),
            op => self.bind_comparison(sql_operator(op)?, left, right),
        }
    }

    /// Builds `left op right`, expanding objects and NULL equality.
    pub(super) fn bind_comparison(
        &mut self,
        op: BinaryOperator,
        left: SqlExpr,
        right: SqlExpr,
    ) -> Result<SqlExpr> {
        let is_equality = matches!(op, BinaryOperator::Eq | BinaryOperator::NotEq);
        if is_equality
            && (matches!(left, SqlExpr::ObjectReference(_))
                || matches!(right, SqlExpr::ObjectReference(_)))
        {
            return self.object_comparison(op, left, right);
        }
        if is_equality && (is_null(&left) || is_null(&right)) {
            let operand = if is_null(&left) { right } else { left };
            let function = if op == BinaryOperator::Eq {
                SqlFunction::IsNull
            } else {
                SqlFunction::IsNotNull
            };
            return Ok(SqlExpr::function(function, vec![operand], DataType::Bool));
        }
        Ok(SqlExpr::binary(op, left, right))
    }

    /// `a.CompareTo(b) op 0` becomes `a op b`, mirrored when the call is on the right.
    fn compare_to(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Option<SqlExpr>> {
        let (call, other, mirrored) = match (left, right) {
            (
                Expr::Call {
                    method: Method::CompareTo,
                    ..
                },
                other,
            ) => (left, other, false),
            (
                other,
                Expr::Call {
                    method: Method::CompareTo,
                    ..
                },
            ) => (right, other, true),
            _ => return Ok(None),
        };
        let Expr::Call {
            target: Some(target),
            args,
            ..
        } = call
        else {
            return Err(QueryError::unsupported_argument(
                "CompareTo",
                "expected an instance call",
            ));
        };
        let [argument] = args.as_slice() else {
            return Err(QueryError::unsupported_argument(
                "CompareTo",
                "expected exactly one argument",
            ));
        };
        let compared_with = match other {
            Expr::Constant(value)
            | Expr::Placeholder { value, .. }
            | Expr::Variable { value, .. } => value.as_i64(),
            _ => None,
        };
        if compared_with != Some(0) {
            return Err(QueryError::unsupported_argument(
                "CompareTo",
                "the result can only be compared with 0",
            ));
        }
        let op = if mirrored { op.mirrored() } else { op };
        let left = self.visit(target)?;
        let right = self.visit(argument)?;
        Ok(Some(self.bind_comparison(sql_operator(op)?, left, right)?))
    }

    pub(super) fn bind_unary(&mut self, op: UnaryOp, operand: &Expr) -> Result<SqlExpr> {
        let operand = self.visit(operand)?;
        match op {
            UnaryOp::Negate => Ok(SqlExpr::Unary {
                op: UnaryOperator::Minus,
                operand: Box::new(operand),
            }),
            UnaryOp::Not => Ok(match operand {
                SqlExpr::FunctionCall {
                    function,
                    args,
                    data_type,
                } => match negated(function) {
                    Some(function) => SqlExpr::FunctionCall {
                        function,
                        args,
                        data_type,
                    },
                    None => SqlExpr::not(SqlExpr::FunctionCall {
                        function,
                        args,
                        data_type,
                    }),
                },
                SqlExpr::Unary {
                    op: UnaryOperator::Not,
                    operand,
                } => *operand,
                SqlExpr::Constant(Value::Bool(b)) => SqlExpr::Constant(Value::Bool(!b)),
                other => SqlExpr::not(other),
            }),
        }
    }

    pub(super) fn bind_call(
        &mut self,
        target: Option<&Expr>,
        method: &Method,
        args: &[Expr],
    ) -> Result<SqlExpr> {
        match method {
            Method::Now => return Ok(SqlExpr::function(SqlFunction::ServerNow, vec![], DataType::DateTime)),
            Method::UtcNow => {
                return Ok(SqlExpr::function(
                    SqlFunction::ServerUtcNow,
                    vec![],
                    DataType::DateTime,
                ))
            }
            Method::CompareTo => {
                return Err(QueryError::unsupported_argument(
                    "CompareTo",
                    "the result can only be compared with 0",
                ))
            }
            Method::AddDays
            | Method::AddHours
            | Method::AddMinutes
            | Method::AddSeconds
            | Method::AddMonths
            | Method::AddYears
            | Method::Other(_) => return Err(QueryError::UnsupportedMethod(method.name().to_string())),
            _ => {}
        }

        // static helpers take their subject as the first argument
        let (subject, rest) = match (target, args) {
            (Some(target), args) => (self.visit(target)?, args),
            (None, [first, rest @ ..]) => (self.visit(first)?, rest),
            (None, []) => {
                return Err(QueryError::unsupported_argument(
                    method.name(),
                    "missing the value to operate on",
                ))
            }
        };
        let args = rest
            .iter()
            .map(|a| self.visit(a))
            .collect::<Result<Vec<_>>>()?;

        let text = |function: SqlFunction,
                    mut call_args: Vec<SqlExpr>,
                    data_type: DataType|
         -> Result<SqlExpr> {
            call_args.insert(0, subject.clone());
            Ok(SqlExpr::function(function, call_args, data_type))
        };

        match method {
            Method::Contains => {
                let [item] = <[SqlExpr; 1]>::try_from(args).map_err(|_| {
                    QueryError::unsupported_argument("Contains", "expected one argument")
                })?;
                if is_collection(&subject) {
                    self.membership(subject, item)
                } else {
                    Ok(SqlExpr::function(
                        SqlFunction::ContainsString,
                        vec![subject, item],
                        DataType::Bool,
                    ))
                }
            }
            Method::StartsWith => text(SqlFunction::StartsWith, args, DataType::Bool),
            Method::EndsWith => text(SqlFunction::EndsWith, args, DataType::Bool),
            Method::ToUpper => text(SqlFunction::Upper, vec![], DataType::Text),
            Method::ToLower => text(SqlFunction::Lower, vec![], DataType::Text),
            Method::Trim | Method::TrimStart | Method::TrimEnd => {
                if !args.iter().all(is_empty_trim_set) {
                    return Err(QueryError::unsupported_argument(
                        method.name(),
                        "custom trim characters are not supported",
                    ));
                }
                let function = match method {
                    Method::TrimStart => SqlFunction::TrimLeft,
                    Method::TrimEnd => SqlFunction::TrimRight,
                    _ => SqlFunction::Trim,
                };
                text(function, vec![], DataType::Text)
            }
            Method::Substring => {
                let mut args = args.into_iter();
                let start = args.next().ok_or_else(|| {
                    QueryError::unsupported_argument("Substring", "missing the start index")
                })?;
                let mut call_args = vec![one_based(start)];
                call_args.extend(args);
                text(SqlFunction::Substring, call_args, DataType::Text)
            }
            Method::IsNullOrEmpty => Ok(SqlExpr::binary(
                BinaryOperator::Or,
                SqlExpr::function(SqlFunction::IsNull, vec![subject.clone()], DataType::Bool),
                SqlExpr::binary(
                    BinaryOperator::Eq,
                    subject,
                    SqlExpr::Constant(Value::Text(String::new())),
                ),
            )),
            Method::IsLike => text(SqlFunction::Like, args, DataType::Bool),
            Method::Equals => {
                let [other] = <[SqlExpr; 1]>::try_from(args).map_err(|_| {
                    QueryError::unsupported_argument("Equals", "expected one argument")
                })?;
                self.bind_comparison(BinaryOperator::Eq, subject, other)
            }
            other => Err(QueryError::UnsupportedMethod(other.name().to_string())),
        }
    }

    /// `item IN (...)` over a host list or a sequence.
    pub(super) fn membership(&mut self, collection: SqlExpr, item: SqlExpr) -> Result<SqlExpr> {
        if matches!(
            collection,
            SqlExpr::Constant(Value::List(_)) | SqlExpr::Placeholder { value: Value::List(_), .. }
        ) {
            return Ok(SqlExpr::function(
                SqlFunction::In,
                vec![item, collection],
                DataType::Bool,
            ));
        }
        let projection = self.to_sequence(collection)?;
        let (item, value) = match (item, &projection.projector) {
            (SqlExpr::ObjectReference(object), SqlExpr::ObjectReference(element)) => {
                let element = element.clone();
                let mut keys = self.primary_key_values(&object)?;
                let mut element_keys = self.primary_key_values(&element)?;
                if keys.len() != 1 || element_keys.len() != 1 {
                    return Err(QueryError::unsupported_argument(
                        "Contains",
                        "objects with a composite primary key",
                    ));
                }
                (keys.remove(0), element_keys.remove(0))
            }
            (item, projector) => (item, projector.clone()),
        };
        let select = self.value_select(projection, vec![value])?;
        Ok(SqlExpr::function(
            SqlFunction::In,
            vec![item, SqlExpr::Subquery(Box::new(select))],
            DataType::Bool,
        ))
    }

    pub(super) fn bind_new(
        &mut self,
        type_name: Option<&str>,
        members: &[(String, Expr)],
    ) -> Result<SqlExpr> {
        let bound = members
            .iter()
            .map(|(name, expr)| Ok((name.clone(), self.visit(expr)?)))
            .collect::<Result<Vec<_>>>()?;
        if let Some(descriptor) = type_name.and_then(|t| self.provider.type_descriptor(t)) {
            let keyed = descriptor.primary_keys().count() > 0
                && descriptor
                    .primary_keys()
                    .all(|pk| bound.iter().any(|(name, _)| *name == pk.name));
            if keyed {
                return Ok(SqlExpr::ObjectReference(ObjectReference {
                    type_name: descriptor.name.clone(),
                    bindings: bound
                        .into_iter()
                        .map(|(member, expr)| crate::ast::types::MemberBinding { member, expr })
                        .collect(),
                    deflated: false,
                }));
            }
        }
        Ok(SqlExpr::Record(bound))
    }
}

/// Members of scalar columns: string length and date parts.
fn scalar_member(expr: SqlExpr, member: &str) -> Result<SqlExpr> {
    let data_type = expr.data_type();
    let unsupported = || QueryError::UnsupportedMember {
        target: data_type.to_string(),
        member: member.to_string(),
    };
    if data_type.is_nullable() {
        match member {
            "HasValue" => {
                return Ok(SqlExpr::function(
                    SqlFunction::IsNotNull,
                    vec![expr],
                    DataType::Bool,
                ))
            }
            "Value" => return Ok(expr),
            _ => {}
        }
    }
    match data_type.unwrap_nullable() {
        DataType::Text if member == "Length" => Ok(SqlExpr::function(
            SqlFunction::StringLength,
            vec![expr],
            DataType::Int,
        )),
        DataType::DateTime => {
            let function = match member {
                "Year" => SqlFunction::Year,
                "Month" => SqlFunction::Month,
                "Week" => SqlFunction::Week,
                "Day" => SqlFunction::DayOfMonth,
                "DayOfYear" => SqlFunction::DayOfYear,
                "DayOfWeek" => SqlFunction::DayOfWeek,
                "Hour" => SqlFunction::Hour,
                "Minute" => SqlFunction::Minute,
                "Second" => SqlFunction::Second,
                "Date" => {
                    return Ok(SqlExpr::function(
                        SqlFunction::Date,
                        vec![expr],
                        DataType::DateTime,
                    ))
                }
                _ => return Err(unsupported()),
            };
            Ok(SqlExpr::function(function, vec![expr], DataType::Int))
        }
        _ => Err(unsupported()),
    }
}

fn sql_operator(op: BinaryOp) -> Result<BinaryOperator> {
    Ok(match op {
        BinaryOp::Add => BinaryOperator::Plus,
        BinaryOp::Subtract => BinaryOperator::Minus,
        BinaryOp::Multiply => BinaryOperator::Multiply,
        BinaryOp::Divide => BinaryOperator::Divide,
        BinaryOp::Modulo => BinaryOperator::Modulo,
        BinaryOp::Equal => BinaryOperator::Eq,
        BinaryOp::NotEqual => BinaryOperator::NotEq,
        BinaryOp::LessThan => BinaryOperator::Lt,
        BinaryOp::LessThanOrEqual => BinaryOperator::LtEq,
        BinaryOp::GreaterThan => BinaryOperator::Gt,
        BinaryOp::GreaterThanOrEqual => BinaryOperator::GtEq,
        BinaryOp::And => BinaryOperator::And,
        BinaryOp::Or => BinaryOperator::Or,
        BinaryOp::Coalesce => return Err(QueryError::binding("?? has no infix SQL operator")),
    })
}

fn negated(function: SqlFunction) -> Option<SqlFunction> {
    match function {
        SqlFunction::In => Some(SqlFunction::NotIn),
        SqlFunction::NotIn => Some(SqlFunction::In),
        SqlFunction::Like => Some(SqlFunction::NotLike),
        SqlFunction::NotLike => Some(SqlFunction::Like),
        SqlFunction::IsNull => Some(SqlFunction::IsNotNull),
        SqlFunction::IsNotNull => Some(SqlFunction::IsNull),
        _ => None,
    }
}

fn is_null(expr: &SqlExpr) -> bool {
    matches!(
        expr,
        SqlExpr::Constant(Value::Null) | SqlExpr::Placeholder { value: Value::Null, .. }
    )
}

fn is_text(expr: &SqlExpr) -> bool {
    *expr.data_type().unwrap_nullable() == DataType::Text
}

fn is_collection(expr: &SqlExpr) -> bool {
    matches!(
        expr,
        SqlExpr::Projection(_)
            | SqlExpr::Grouping { .. }
            | SqlExpr::Constant(Value::List(_))
            | SqlExpr::Placeholder { value: Value::List(_), .. }
    )
}

fn is_empty_trim_set(arg: &SqlExpr) -> bool {
    match arg {
        SqlExpr::Constant(value) | SqlExpr::Placeholder { value, .. } => match value {
            Value::List(items) => items.is_empty(),
            Value::Text(chars) => chars.is_empty(),
            Value::Null => true,
            _ => false,
        },
        _ => false,
    }
}

/// Host string indices start at 0, SQL ones at 1.
fn one_based(index: SqlExpr) -> SqlExpr {
    match index {
        SqlExpr::Constant(Value::Int(i)) => SqlExpr::Constant(Value::Int(i + 1)),
        other => SqlExpr::binary(BinaryOperator::Plus, other, SqlExpr::Constant(Value::Int(1))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::binder::Binder;
    use crate::query::{lambda, param, Expr};
    use crate::testing::{schema, widgets};

    fn predicate_of(body: Expr) -> Result<SqlExpr> {
        let schema = schema();
        let projection = Binder::bind(widgets().filter(lambda("w", body)).expr(), &schema)?;
        Ok(projection.select.where_clause.unwrap())
    }

    fn name() -> Expr {
        param("w").member("Name")
    }

    #[test]
    fn test_compare_to_rewrites_to_comparison() {
        let body = name()
            .call(Method::CompareTo, vec![Expr::constant("m")])
            .gt(Expr::constant(0));
        let SqlExpr::Binary { op, left, .. } = predicate_of(body).unwrap() else {
            panic!("expected a comparison");
        };
        assert_eq!(op, BinaryOperator::Gt);
        assert_eq!(left.as_column().unwrap().name, "Name");
    }

    #[test]
    fn test_compare_to_on_the_right_is_mirrored() {
        let body = Expr::constant(0).lt(name().call(Method::CompareTo, vec![Expr::constant("m")]));
        let SqlExpr::Binary { op, .. } = predicate_of(body).unwrap() else {
            panic!("expected a comparison");
        };
        assert_eq!(op, BinaryOperator::Gt);
    }

    #[test]
    fn test_compare_to_non_zero_is_unsupported() {
        let body = name()
            .call(Method::CompareTo, vec![Expr::constant("m")])
            .gt(Expr::constant(1));
        let err = predicate_of(body).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedArgument { .. }));
    }

    #[test]
    fn test_null_equality_becomes_is_null() {
        let body = param("w").member("Discount").eq(Expr::null());
        assert!(matches!(
            predicate_of(body).unwrap(),
            SqlExpr::FunctionCall {
                function: SqlFunction::IsNull,
                ..
            }
        ));
    }

    #[test]
    fn test_string_plus_is_concat() {
        let body = name().add(Expr::constant("x")).eq(Expr::constant("ax"));
        let SqlExpr::Binary { left, .. } = predicate_of(body).unwrap() else {
            panic!("expected a comparison");
        };
        assert!(matches!(
            *left,
            SqlExpr::FunctionCall {
                function: SqlFunction::Concat,
                ..
            }
        ));
    }

    #[test]
    fn test_trim_with_characters_is_unsupported() {
        let body = name()
            .call(Method::Trim, vec![Expr::constant("x")])
            .eq(Expr::constant("a"));
        let err = predicate_of(body).unwrap_err();
        assert!(err.to_string().contains("custom trim characters"));
    }

    #[test]
    fn test_trim_without_characters() {
        let body = name().call(Method::Trim, vec![]).eq(Expr::constant("a"));
        assert!(predicate_of(body).is_ok());
    }

    #[test]
    fn test_not_like_folds() {
        let body = name()
            .call(Method::IsLike, vec![Expr::constant("a%")])
            .not();
        assert!(matches!(
            predicate_of(body).unwrap(),
            SqlExpr::FunctionCall {
                function: SqlFunction::NotLike,
                ..
            }
        ));
    }

    #[test]
    fn test_substring_start_is_one_based() {
        let body = name()
            .call(Method::Substring, vec![Expr::constant(0), Expr::constant(2)])
            .eq(Expr::constant("ab"));
        let SqlExpr::Binary { left, .. } = predicate_of(body).unwrap() else {
            panic!("expected a comparison");
        };
        let SqlExpr::FunctionCall { args, .. } = *left else {
            panic!("expected a function call");
        };
        assert_eq!(args[1], SqlExpr::Constant(Value::Int(1)));
    }

    #[test]
    fn test_date_parts() {
        let body = param("w").member("Created").member("Year").eq(Expr::constant(2024));
        let SqlExpr::Binary { left, .. } = predicate_of(body).unwrap() else {
            panic!("expected a comparison");
        };
        assert!(matches!(
            *left,
            SqlExpr::FunctionCall {
                function: SqlFunction::Year,
                ..
            }
        ));
    }

    #[test]
    fn test_string_length() {
        let body = name().member("Length").gt(Expr::constant(3));
        assert!(predicate_of(body).is_ok());
    }

    #[test]
    fn test_unknown_member_and_method() {
        let err = predicate_of(param("w").member("Price").member("Digits").gt(Expr::constant(1)))
            .unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedMember { .. }));

        let err = predicate_of(name().call(Method::Other("Soundex".into()), vec![]))
            .unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedMethod(ref m) if m == "Soundex"));
    }

    #[test]
    fn test_column_date_arithmetic_is_unsupported() {
        let body = param("w")
            .member("Created")
            .call(Method::AddDays, vec![Expr::constant(1)])
            .gt(Expr::server_now());
        let err = predicate_of(body).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedMethod(_)));
    }
}
