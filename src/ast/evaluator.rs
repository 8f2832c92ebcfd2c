//! Partial evaluation of host-side subexpressions.
//!
//! Every maximal subtree that does not depend on a lambda parameter or the
//! data source is interpreted once and replaced with an indexed
//! placeholder. Later stages only ever see constants, placeholders and
//! expressions that genuinely need the database.

use chrono::{Duration, Months, NaiveDateTime};

use crate::error::{QueryError, Result};
use crate::query::{BinaryOp, Expr, Method, UnaryOp};
use crate::value::{DataType, Value};

/// The default nomination predicate.
pub fn can_evaluate_locally(expr: &Expr) -> bool {
    match expr {
        Expr::Parameter(_) | Expr::Source { .. } | Expr::Query(_) => false,
        Expr::Call { method, .. } => !matches!(
            method,
            Method::Now | Method::UtcNow | Method::IsLike | Method::Other(_)
        ),
        _ => true,
    }
}

/// Result of partial evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluated {
    pub expr: Expr,
    /// Placeholder values, indexed by placeholder index.
    pub placeholders: Vec<Value>,
}

/// Partially evaluates with the default predicate.
pub fn partial_eval(expr: &Expr) -> Result<Evaluated> {
    partial_eval_with(expr, &can_evaluate_locally)
}

pub fn partial_eval_with(expr: &Expr, predicate: &dyn Fn(&Expr) -> bool) -> Result<Evaluated> {
    let mut evaluator = PartialEvaluator {
        predicate,
        placeholders: Vec::new(),
    };
    let mut expr = expr.clone();
    if evaluator.nominate(&mut expr)? {
        expr = evaluator.evaluate(expr)?;
    }
    Ok(Evaluated {
        expr,
        placeholders: evaluator.placeholders,
    })
}

struct PartialEvaluator<'a> {
    predicate: &'a dyn Fn(&Expr) -> bool,
    placeholders: Vec<Value>,
}

impl PartialEvaluator<'_> {
    /// Returns whether `expr` is evaluable as a whole. When it is not, its
    /// evaluable children have already been replaced in place.
    fn nominate(&mut self, expr: &mut Expr) -> Result<bool> {
        let mut flags = Vec::new();
        for child in expr.children_mut() {
            flags.push(self.nominate(child)?);
        }
        if flags.iter().all(|f| *f) && (self.predicate)(expr) {
            return Ok(true);
        }
        for (child, evaluable) in expr.children_mut().into_iter().zip(flags) {
            if evaluable {
                let taken = std::mem::replace(child, Expr::Constant(Value::Null));
                *child = self.evaluate(taken)?;
            }
        }
        Ok(false)
    }

    fn evaluate(&mut self, expr: Expr) -> Result<Expr> {
        match expr {
            Expr::Constant(_) | Expr::Placeholder { .. } => Ok(expr),
            Expr::Convert {
                ref operand,
                ref data_type,
            } if matches!(**operand, Expr::Constant(_)) => {
                Ok(Expr::Constant(convert(interpret(operand)?, data_type)?))
            }
            other => {
                let value = interpret(&other)?;
                let index = self.placeholders.len();
                self.placeholders.push(value.clone());
                Ok(Expr::Placeholder { index, value })
            }
        }
    }
}

/// Interprets a host-only expression.
pub fn interpret(expr: &Expr) -> Result<Value> {
    match expr {
        Expr::Constant(v) | Expr::Variable { value: v, .. } | Expr::Placeholder { value: v, .. } => {
            Ok(v.clone())
        }
        Expr::Member { target, member } => {
            let target = interpret(target)?;
            member_value(&target, member)
        }
        Expr::Binary { op, left, right } => {
            let left = interpret(left)?;
            match (op, &left) {
                (BinaryOp::And, Value::Bool(false)) => return Ok(Value::Bool(false)),
                (BinaryOp::Or, Value::Bool(true)) => return Ok(Value::Bool(true)),
                (BinaryOp::Coalesce, v) if !v.is_null() => return Ok(left),
                _ => {}
            }
            binary(*op, left, interpret(right)?)
        }
        Expr::Unary { op, operand } => match (op, interpret(operand)?) {
            (_, Value::Null) => Ok(Value::Null),
            (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
            (UnaryOp::Negate, Value::Int(i)) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| QueryError::Evaluation(format!("integer overflow in -{}", i))),
            (UnaryOp::Negate, Value::Float(f)) => Ok(Value::Float(-f)),
            (op, v) => Err(QueryError::Evaluation(format!(
                "cannot apply {:?} to {}",
                op, v
            ))),
        },
        Expr::Convert { operand, data_type } => convert(interpret(operand)?, data_type),
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => match interpret(test)? {
            Value::Bool(true) => interpret(if_true),
            _ => interpret(if_false),
        },
        Expr::Call {
            target,
            method,
            args,
        } => {
            let target = target.as_deref().map(interpret).transpose()?;
            let args = args.iter().map(interpret).collect::<Result<Vec<_>>>()?;
            call(target, method, args)
        }
        Expr::New { type_name, members } => {
            let fields = members
                .iter()
                .map(|(name, e)| Ok((name.clone(), interpret(e)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(match type_name {
                Some(type_name) => Value::Object {
                    type_name: type_name.clone(),
                    fields,
                },
                None => Value::Record(fields),
            })
        }
        Expr::Parameter(_) | Expr::Source { .. } | Expr::Query(_) => Err(QueryError::Evaluation(
            "expression depends on the data source".to_string(),
        )),
    }
}

fn member_value(target: &Value, member: &str) -> Result<Value> {
    if let Some(v) = target.field(member) {
        return Ok(v.clone());
    }
    match (target, member) {
        (Value::Text(s), "Length") => Ok(Value::Int(s.chars().count() as i64)),
        (Value::List(items), "Count") => Ok(Value::Int(items.len() as i64)),
        (Value::DateTime(dt), part) => date_part(dt, part),
        _ => Err(QueryError::Evaluation(format!(
            "{} has no member {}",
            target, member
        ))),
    }
}

fn date_part(dt: &NaiveDateTime, part: &str) -> Result<Value> {
    use chrono::{Datelike, Timelike};
    let v = match part {
        "Year" => dt.year() as i64,
        "Month" => dt.month() as i64,
        "Day" => dt.day() as i64,
        "Hour" => dt.hour() as i64,
        "Minute" => dt.minute() as i64,
        "Second" => dt.second() as i64,
        "DayOfYear" => dt.ordinal() as i64,
        "DayOfWeek" => dt.weekday().num_days_from_sunday() as i64,
        "Date" => return Ok(Value::DateTime(dt.date().and_time(chrono::NaiveTime::MIN))),
        other => {
            return Err(QueryError::Evaluation(format!(
                "datetime has no member {}",
                other
            )))
        }
    };
    Ok(Value::Int(v))
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    use Value::*;
    let bad = |l: &Value, r: &Value| {
        Err(QueryError::Evaluation(format!(
            "cannot apply {:?} to {} and {}",
            op, l, r
        )))
    };
    match op {
        BinaryOp::Coalesce => Ok(if left.is_null() { right } else { left }),
        BinaryOp::And | BinaryOp::Or => match (left.as_bool(), right.as_bool()) {
            (Some(l), Some(r)) => Ok(Bool(if op == BinaryOp::And { l && r } else { l || r })),
            _ => bad(&left, &right),
        },
        BinaryOp::Equal => Ok(Bool(left == right)),
        BinaryOp::NotEqual => Ok(Bool(left != right)),
        BinaryOp::LessThan
        | BinaryOp::LessThanOrEqual
        | BinaryOp::GreaterThan
        | BinaryOp::GreaterThanOrEqual => {
            let ordering = match (&left, &right) {
                (Text(l), Text(r)) => l.partial_cmp(r),
                (DateTime(l), DateTime(r)) => l.partial_cmp(r),
                (l, r) => match (l.as_f64(), r.as_f64()) {
                    (Some(l), Some(r)) => l.partial_cmp(&r),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return bad(&left, &right);
            };
            Ok(Bool(match op {
                BinaryOp::LessThan => ordering.is_lt(),
                BinaryOp::LessThanOrEqual => ordering.is_le(),
                BinaryOp::GreaterThan => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        _ => match (left, right) {
            (Null, _) | (_, Null) => Ok(Null),
            (Text(l), Text(r)) if op == BinaryOp::Add => Ok(Text(l + &r)),
            (Int(l), Int(r)) => {
                if matches!(op, BinaryOp::Divide | BinaryOp::Modulo) && r == 0 {
                    return Err(QueryError::Evaluation("division by zero".to_string()));
                }
                let result = match op {
                    BinaryOp::Add => l.checked_add(r),
                    BinaryOp::Subtract => l.checked_sub(r),
                    BinaryOp::Multiply => l.checked_mul(r),
                    BinaryOp::Divide => l.checked_div(r),
                    _ => l.checked_rem(r),
                };
                result.map(Int).ok_or_else(|| {
                    QueryError::Evaluation(format!("integer overflow in {} {:?} {}", l, op, r))
                })
            }
            (l, r) => match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => Ok(Float(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Subtract => a - b,
                    BinaryOp::Multiply => a * b,
                    BinaryOp::Divide => a / b,
                    _ => a % b,
                })),
                _ => bad(&l, &r),
            },
        },
    }
}

fn convert(value: Value, data_type: &DataType) -> Result<Value> {
    Ok(match (value, data_type.unwrap_nullable()) {
        (Value::Null, _) => Value::Null,
        (Value::Int(i), DataType::Float) => Value::Float(i as f64),
        (Value::Float(f), DataType::Int) => Value::Int(f as i64),
        (Value::Int(i), DataType::Enum(name)) => Value::Enum {
            type_name: name.clone(),
            value: i,
        },
        (Value::Enum { value, .. }, DataType::Int) => Value::Int(value),
        (Value::Bool(b), DataType::Int) => Value::Int(b as i64),
        (v, DataType::Text) => match v {
            Value::Text(s) => Value::Text(s),
            other => Value::Text(other.to_string()),
        },
        (v, _) => v,
    })
}

fn call(target: Option<Value>, method: &Method, args: Vec<Value>) -> Result<Value> {
    let name = method.name();
    let unsupported = || QueryError::Evaluation(format!("cannot evaluate {} locally", name));
    let text_arg = |i: usize| -> Result<String> {
        match args.get(i) {
            Some(Value::Text(s)) => Ok(s.clone()),
            _ => Err(QueryError::Evaluation(format!(
                "{} expects a text argument",
                name
            ))),
        }
    };
    let int_arg = |i: usize| -> Result<i64> {
        args.get(i)
            .and_then(Value::as_i64)
            .ok_or_else(|| QueryError::Evaluation(format!("{} expects an integer", name)))
    };

    match (method, target) {
        (Method::IsNullOrEmpty, None) => Ok(Value::Bool(match args.first() {
            None | Some(Value::Null) => true,
            Some(Value::Text(s)) => s.is_empty(),
            Some(_) => false,
        })),
        (_, Some(Value::Null)) => Ok(Value::Null),
        (Method::Contains, Some(Value::List(items))) => {
            Ok(Value::Bool(args.first().is_some_and(|a| items.contains(a))))
        }
        (Method::Equals, Some(t)) => Ok(Value::Bool(args.first() == Some(&t))),
        (Method::CompareTo, Some(t)) => {
            let other = args.into_iter().next().unwrap_or(Value::Null);
            match binary(BinaryOp::LessThan, t.clone(), other.clone())? {
                Value::Bool(true) => Ok(Value::Int(-1)),
                _ if t == other => Ok(Value::Int(0)),
                _ => Ok(Value::Int(1)),
            }
        }
        (method, Some(Value::Text(s))) => match method {
            Method::Contains => Ok(Value::Bool(s.contains(&text_arg(0)?))),
            Method::StartsWith => Ok(Value::Bool(s.starts_with(&text_arg(0)?))),
            Method::EndsWith => Ok(Value::Bool(s.ends_with(&text_arg(0)?))),
            Method::ToUpper => Ok(Value::Text(s.to_uppercase())),
            Method::ToLower => Ok(Value::Text(s.to_lowercase())),
            Method::Trim => Ok(Value::Text(s.trim().to_string())),
            Method::TrimStart => Ok(Value::Text(s.trim_start().to_string())),
            Method::TrimEnd => Ok(Value::Text(s.trim_end().to_string())),
            Method::Substring => {
                let start = int_arg(0)?.max(0) as usize;
                let chars = s.chars().skip(start);
                Ok(Value::Text(match args.get(1) {
                    Some(_) => chars.take(int_arg(1)?.max(0) as usize).collect(),
                    None => chars.collect(),
                }))
            }
            _ => Err(unsupported()),
        },
        (method, Some(Value::DateTime(dt))) => {
            let n = int_arg(0)?;
            let shifted = match method {
                Method::AddDays => Duration::try_days(n).and_then(|d| dt.checked_add_signed(d)),
                Method::AddHours => Duration::try_hours(n).and_then(|d| dt.checked_add_signed(d)),
                Method::AddMinutes => {
                    Duration::try_minutes(n).and_then(|d| dt.checked_add_signed(d))
                }
                Method::AddSeconds => {
                    Duration::try_seconds(n).and_then(|d| dt.checked_add_signed(d))
                }
                Method::AddMonths => shift_months(dt, Some(n)),
                Method::AddYears => shift_months(dt, n.checked_mul(12)),
                _ => return Err(unsupported()),
            };
            shifted
                .map(Value::DateTime)
                .ok_or_else(|| QueryError::Evaluation("datetime out of range".to_string()))
        }
        _ => Err(unsupported()),
    }
}

/// `None` when `months` is missing or the result leaves chrono's range.
fn shift_months(dt: NaiveDateTime, months: Option<i64>) -> Option<NaiveDateTime> {
    let months = months?;
    let count = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        dt.checked_add_months(count)
    } else {
        dt.checked_sub_months(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{lambda, param, Queryable};

    fn predicate_of(expr: &Expr) -> &Expr {
        match expr.as_query() {
            Some(crate::query::QueryOp::Where { predicate, .. }) => &predicate.body,
            other => panic!("Expected Where, got {:?}", other),
        }
    }

    #[test]
    fn test_captured_variable_becomes_placeholder() {
        let q = Queryable::source("Widget").filter(lambda(
            "w",
            param("w")
                .member("Price")
                .gt(Expr::variable("limit", 10).mul(Expr::constant(2))),
        ));
        let evaluated = partial_eval(q.expr()).unwrap();
        assert_eq!(evaluated.placeholders, vec![Value::Int(20)]);

        match predicate_of(&evaluated.expr) {
            Expr::Binary { right, .. } => assert_eq!(
                **right,
                Expr::Placeholder {
                    index: 0,
                    value: Value::Int(20)
                }
            ),
            other => panic!("Expected Binary, got {:?}", other),
        }
    }

    #[test]
    fn test_literals_pass_through() {
        let q = Queryable::source("Widget")
            .filter(lambda("w", param("w").member("Name").eq(Expr::constant("X"))));
        let evaluated = partial_eval(q.expr()).unwrap();
        assert!(evaluated.placeholders.is_empty());
        assert_eq!(&evaluated.expr, q.expr());
    }

    #[test]
    fn test_placeholders_are_sequential() {
        let q = Queryable::source("Widget").filter(lambda(
            "w",
            param("w")
                .member("Name")
                .eq(Expr::variable("a", "x"))
                .or(param("w").member("Name").eq(Expr::variable("b", "y"))),
        ));
        let evaluated = partial_eval(q.expr()).unwrap();
        assert_eq!(
            evaluated.placeholders,
            vec![Value::Text("x".into()), Value::Text("y".into())]
        );
    }

    #[test]
    fn test_parameter_dependent_subtree_is_kept() {
        let body = param("w").member("Name").call(Method::ToUpper, vec![]);
        let q = Queryable::source("Widget").select(lambda("w", body.clone()));
        let evaluated = partial_eval(q.expr()).unwrap();
        assert!(evaluated.placeholders.is_empty());
        assert_eq!(&evaluated.expr, q.expr());
    }

    #[test]
    fn test_convert_of_literal_folds_to_literal() {
        let q = Queryable::source("Widget").filter(lambda(
            "w",
            param("w")
                .member("Color")
                .eq(Expr::constant(2).convert(DataType::Enum("Color".into()))),
        ));
        let evaluated = partial_eval(q.expr()).unwrap();
        assert!(evaluated.placeholders.is_empty());
        match predicate_of(&evaluated.expr) {
            Expr::Binary { right, .. } => assert!(matches!(
                **right,
                Expr::Constant(Value::Enum { value: 2, .. })
            )),
            other => panic!("Expected Binary, got {:?}", other),
        }
    }

    #[test]
    fn test_server_time_is_not_evaluated() {
        let q = Queryable::source("Widget")
            .filter(lambda("w", param("w").member("Created").lt(Expr::server_now())));
        let evaluated = partial_eval(q.expr()).unwrap();
        assert!(evaluated.placeholders.is_empty());
    }

    #[test]
    fn test_interpret_string_and_date_methods() {
        let upper = Expr::constant(" abc ").call(Method::Trim, vec![]);
        assert_eq!(interpret(&upper).unwrap(), Value::Text("abc".into()));

        let dt = chrono::NaiveDate::from_ymd_opt(2024, 1, 31)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let shifted = Expr::Constant(Value::DateTime(dt)).call(Method::AddDays, vec![Expr::constant(1)]);
        match interpret(&shifted).unwrap() {
            Value::DateTime(d) => assert_eq!(d.to_string(), "2024-02-01 00:00:00"),
            other => panic!("Expected DateTime, got {:?}", other),
        }
    }

    #[test]
    fn test_interpret_division_by_zero_fails() {
        let expr = Expr::constant(1).binary(BinaryOp::Divide, Expr::constant(0));
        assert!(matches!(interpret(&expr), Err(QueryError::Evaluation(_))));
    }

    #[test]
    fn test_integer_overflow_is_an_evaluation_error() {
        let q = Queryable::source("Widget").filter(lambda(
            "w",
            param("w").member("Quantity").gt(
                Expr::variable("min", i64::MIN)
                    .binary(BinaryOp::Divide, Expr::variable("divisor", -1)),
            ),
        ));
        let err = partial_eval(q.expr()).unwrap_err();
        assert!(matches!(err, QueryError::Evaluation(_)));

        let rem = Expr::constant(i64::MIN).binary(BinaryOp::Modulo, Expr::constant(-1));
        assert!(matches!(interpret(&rem), Err(QueryError::Evaluation(_))));
        let sum = Expr::constant(i64::MAX).add(Expr::constant(1));
        assert!(matches!(interpret(&sum), Err(QueryError::Evaluation(_))));
        let negated = Expr::Unary {
            op: UnaryOp::Negate,
            operand: Box::new(Expr::constant(i64::MIN)),
        };
        assert!(matches!(interpret(&negated), Err(QueryError::Evaluation(_))));
    }

    #[test]
    fn test_out_of_range_date_shifts_fail() {
        let dt = Expr::Constant(Value::DateTime(
            chrono::NaiveDate::from_ymd_opt(2024, 1, 31)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        ));
        for method in [
            Method::AddDays,
            Method::AddHours,
            Method::AddMinutes,
            Method::AddSeconds,
            Method::AddMonths,
            Method::AddYears,
        ] {
            for n in [i64::MAX, i64::MIN] {
                let shifted = dt.clone().call(method.clone(), vec![Expr::constant(n)]);
                assert!(
                    matches!(interpret(&shifted), Err(QueryError::Evaluation(_))),
                    "{:?} by {}",
                    method,
                    n
                );
            }
        }
    }

    #[test]
    fn test_add_months_crosses_year() {
        let dt = chrono::NaiveDate::from_ymd_opt(2024, 11, 30)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let shifted = Expr::Constant(Value::DateTime(dt)).call(Method::AddMonths, vec![Expr::constant(-11)]);
        assert_eq!(
            interpret(&shifted).unwrap(),
            Value::DateTime(
                chrono::NaiveDate::from_ymd_opt(2023, 12, 30)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
            )
        );
        let years = Expr::Constant(Value::DateTime(dt)).call(Method::AddYears, vec![Expr::constant(1)]);
        assert!(matches!(interpret(&years), Ok(Value::DateTime(d)) if d.to_string() == "2025-11-30 00:00:00"));
    }
}
