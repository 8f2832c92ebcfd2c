//! Result materialization.
//!
//! An [`ObjectProjector`] reads rows from a [`RowSource`] and evaluates the
//! compiled [`ReaderNode`] over each one. Rows are pulled one at a time and
//! never cached; the source is closed exactly once, on exhaustion, on the
//! first failure, or when the iterator is dropped early.

use std::collections::HashSet;
use std::marker::PhantomData;

use tracing::trace;

use crate::ast::compiler::{CompiledQuery, ReaderNode};
use crate::ast::types::Aggregator;
use crate::error::{QueryError, Result};
use crate::query::AggregateKind;
use crate::value::{FromValue, Value};

/// A forward-only cursor over result rows, supplied by the caller.
pub trait RowSource {
    fn next_row(&mut self) -> Result<Option<Vec<Value>>>;

    /// Rows changed by a mutation, when the backend reports it.
    fn records_affected(&self) -> Option<u64> {
        None
    }

    /// Releases the underlying cursor. Called once.
    fn close(&mut self) {}
}

pub struct ObjectProjector<'q, S: RowSource> {
    query: &'q CompiledQuery,
    source: S,
}

impl<'q, S: RowSource> ObjectProjector<'q, S> {
    pub fn new(query: &'q CompiledQuery, source: S) -> Self {
        Self { query, source }
    }

    /// Every result as a lazy iterator.
    pub fn rows<T: FromValue>(self) -> Rows<'q, S, T> {
        Rows {
            query: self.query,
            source: Some(self.source),
            pending: None,
            row_count: 0,
            _marker: PhantomData,
        }
    }

    /// The single value of a query with an aggregator: `First`, `Single`,
    /// `Last`, a root aggregate, a root predicate or a mutation.
    pub fn scalar<T: FromValue>(self) -> Result<T> {
        let aggregator = self.query.aggregator.clone().ok_or_else(|| {
            QueryError::binding("the query yields a sequence, not a single value")
        })?;
        let mut rows = self.rows::<Value>();
        let value = match aggregator {
            Aggregator::SelectFirst { kind, default } => {
                let first = rows.next_value()?;
                if first.is_some() && kind.is_single() && rows.next_value()?.is_some() {
                    return Err(QueryError::MoreThanOneElement);
                }
                match first {
                    Some(first) => first,
                    None => default.ok_or(QueryError::EmptySequence)?,
                }
            }
            Aggregator::Aggregate {
                kind,
                nullable,
                default_if_empty,
                default,
                zero,
            } => {
                let value = rows.next_value()?.unwrap_or(Value::Null);
                collapse_aggregate(kind, nullable, default_if_empty, default, zero, value)?
            }
            Aggregator::SingleOrDefault => rows.next_value()?.unwrap_or(Value::Bool(false)),
            Aggregator::RecordsAffected => {
                rows.next_value()?;
                let affected = rows
                    .source
                    .as_ref()
                    .and_then(RowSource::records_affected)
                    .ok_or_else(|| {
                        QueryError::row_source("the row source does not report affected records")
                    })?;
                Value::Int(i64::try_from(affected).unwrap_or(i64::MAX))
            }
        };
        T::from_value(value)
    }
}

/// Unwraps the one row of a root aggregate.
fn collapse_aggregate(
    kind: AggregateKind,
    nullable: bool,
    default_if_empty: bool,
    default: Option<Value>,
    zero: Value,
    value: Value,
) -> Result<Value> {
    if kind.is_count() {
        let count = value.as_i64().unwrap_or(0);
        if count == 0 && default_if_empty {
            return Ok(default.unwrap_or(Value::Int(1)));
        }
        return Ok(Value::Int(count));
    }
    if !value.is_null() {
        return Ok(value);
    }
    // NULL is what SQL returns for an aggregate over no rows
    if default_if_empty {
        return Ok(default.unwrap_or(zero));
    }
    match kind {
        AggregateKind::Sum => Ok(zero),
        _ if nullable => Ok(Value::Null),
        _ => Err(QueryError::EmptySequence),
    }
}

/// Lazy results of one execution.
pub struct Rows<'q, S: RowSource, T> {
    query: &'q CompiledQuery,
    /// `None` once released.
    source: Option<S>,
    /// A row read ahead while folding, belonging to the next result.
    pending: Option<Vec<Value>>,
    row_count: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<S: RowSource, T> Rows<'_, S, T> {
    fn next_value(&mut self) -> Result<Option<Value>> {
        let Some(row) = self.fetch()? else {
            return Ok(None);
        };
        let mut value = self.read(&row)?;
        let query = self.query;
        if let Some(key) = query.reader.fold_key() {
            let owner = key_values(&row, key);
            let mut folded = Folded::default();
            while let Some(next) = self.fetch()? {
                if key_values(&next, key) != owner {
                    self.pending = Some(next);
                    break;
                }
                let more = self.read(&next)?;
                folded.merge(&query.reader, &mut value, more);
            }
        }
        Ok(Some(value))
    }

    fn fetch(&mut self) -> Result<Option<Vec<Value>>> {
        if let Some(row) = self.pending.take() {
            return Ok(Some(row));
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        let row = source.next_row()?;
        if row.is_some() {
            self.row_count += 1;
        }
        Ok(row)
    }

    fn read(&self, row: &[Value]) -> Result<Value> {
        let context = ReadContext {
            row,
            placeholders: &self.query.placeholders,
            records_affected: self.source.as_ref().and_then(RowSource::records_affected),
        };
        context.read(&self.query.reader)
    }

    fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
            trace!(rows = self.row_count, "released row source");
        }
    }
}

impl<S: RowSource, T: FromValue> Iterator for Rows<'_, S, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_value() {
            Ok(Some(value)) => Some(T::from_value(value)),
            Ok(None) => {
                self.release();
                None
            }
            Err(err) => {
                self.release();
                Some(Err(err))
            }
        }
    }
}

impl<S: RowSource, T> Drop for Rows<'_, S, T> {
    fn drop(&mut self) {
        self.release();
    }
}

struct ReadContext<'a> {
    row: &'a [Value],
    placeholders: &'a [Value],
    records_affected: Option<u64>,
}

impl ReadContext<'_> {
    fn read(&self, node: &ReaderNode) -> Result<Value> {
        match node {
            ReaderNode::Column { ordinal, data_type } => {
                Ok(self.column(*ordinal)?.clone().coerce(data_type))
            }
            ReaderNode::Constant(value) => Ok(value.clone()),
            ReaderNode::Placeholder(index) => self.placeholders.get(*index).cloned().ok_or_else(|| {
                QueryError::binding(format!("placeholder {} has no value", index))
            }),
            ReaderNode::Object {
                type_name,
                fields,
                key,
            } => {
                if !key.is_empty() && key.iter().all(|o| self.row.get(*o).map_or(true, Value::is_null)) {
                    return Ok(Value::Null);
                }
                Ok(Value::Object {
                    type_name: type_name.clone(),
                    fields: self.fields(fields)?,
                })
            }
            ReaderNode::Record(fields) => Ok(Value::Record(self.fields(fields)?)),
            ReaderNode::Collection { element, .. } => {
                let element = self.read(element)?;
                if element.is_null() {
                    return Ok(Value::List(Vec::new()));
                }
                Ok(Value::List(vec![element]))
            }
            ReaderNode::RecordsAffected => Ok(self
                .records_affected
                .map(|n| Value::Int(i64::try_from(n).unwrap_or(i64::MAX)))
                .unwrap_or(Value::Null)),
        }
    }

    fn fields(&self, fields: &[(String, ReaderNode)]) -> Result<Vec<(String, Value)>> {
        fields
            .iter()
            .map(|(name, node)| Ok((name.clone(), self.read(node)?)))
            .collect()
    }

    fn column(&self, ordinal: usize) -> Result<&Value> {
        self.row.get(ordinal).ok_or_else(|| {
            QueryError::row_source(format!(
                "row has {} columns, column {} was requested",
                self.row.len(),
                ordinal
            ))
        })
    }
}

fn key_values<'r>(row: &'r [Value], key: &[usize]) -> Vec<Option<&'r Value>> {
    key.iter().map(|o| row.get(*o)).collect()
}

/// Elements already folded into each included collection of one result,
/// indexed by the collection's position in the reader.
#[derive(Default)]
struct Folded {
    seen: Vec<HashSet<String>>,
}

impl Folded {
    /// Appends the collection elements of `more` to those of `into`.
    fn merge(&mut self, node: &ReaderNode, into: &mut Value, more: Value) {
        let mut slot = 0;
        self.merge_at(node, into, more, &mut slot);
    }

    fn merge_at(&mut self, node: &ReaderNode, into: &mut Value, more: Value, slot: &mut usize) {
        match (node, into, more) {
            (ReaderNode::Collection { .. }, Value::List(items), Value::List(new)) => {
                let index = *slot;
                *slot += 1;
                if self.seen.len() <= index {
                    self.seen.resize_with(index + 1, HashSet::new);
                }
                let known = &mut self.seen[index];
                if known.is_empty() {
                    known.extend(items.iter().map(identity));
                }
                for element in new {
                    if known.insert(identity(&element)) {
                        items.push(element);
                    }
                }
            }
            (ReaderNode::Collection { .. }, _, _) => *slot += 1,
            (
                ReaderNode::Object { fields: nodes, .. },
                Value::Object { fields, .. },
                Value::Object { fields: new, .. },
            )
            | (ReaderNode::Record(nodes), Value::Record(fields), Value::Record(new)) => {
                for ((_, node), ((_, target), (_, value))) in
                    nodes.iter().zip(fields.iter_mut().zip(new))
                {
                    self.merge_at(node, target, value, slot);
                }
            }
            _ => {}
        }
    }
}

/// Structural identity of a folded element.
fn identity(element: &Value) -> String {
    format!("{:?}", element)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::ast::compiler::QueryTranslator;
    use crate::ast::dialect::DialectKind;
    use crate::query::{lambda, param, Expr, Queryable};
    use crate::testing::{schema, widgets, VecRowSource};
    use crate::value::DataType;

    fn compile(query: Queryable) -> CompiledQuery {
        let schema = schema();
        QueryTranslator::with_dialect(&schema, DialectKind::Sqlite)
            .translate(query.expr())
            .unwrap()
    }

    fn names() -> Queryable {
        widgets().select(lambda("w", param("w").member("Name")))
    }

    fn text_rows(values: &[&str]) -> Vec<Vec<Value>> {
        values.iter().map(|v| vec![Value::Text(v.to_string())]).collect()
    }

    #[test]
    fn test_rows_are_read_in_order() {
        let query = compile(names());
        let names: Vec<String> = ObjectProjector::new(&query, VecRowSource::new(text_rows(&["a", "b"])))
            .rows::<String>()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_columns_are_coerced_to_declared_types() {
        let query = compile(widgets().select(lambda(
            "w",
            Expr::record(vec![
                ("Price", param("w").member("Price")),
                ("Color", param("w").member("Color")),
            ]),
        )));
        let source = VecRowSource::new(vec![vec![Value::Int(2), Value::Int(1)]]);
        let row = ObjectProjector::new(&query, source)
            .rows::<Value>()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(row.field("Price"), Some(&Value::Float(2.0)));
        assert_eq!(
            row.field("Color"),
            Some(&Value::Enum {
                type_name: "Color".into(),
                value: 1
            })
        );
    }

    #[test]
    fn test_exhaustion_closes_source() {
        let query = compile(names());
        let source = VecRowSource::new(text_rows(&["a"]));
        let closed = source.closed_flag();
        let mut rows = ObjectProjector::new(&query, source).rows::<String>();
        assert!(rows.next().is_some());
        assert!(!closed.load(Ordering::SeqCst));
        assert!(rows.next().is_none());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_early_drop_closes_source() {
        let query = compile(names());
        let source = VecRowSource::new(text_rows(&["a", "b", "c"]));
        let closed = source.closed_flag();
        let first = ObjectProjector::new(&query, source).rows::<String>().next();
        assert_eq!(first.unwrap().unwrap(), "a");
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failure_is_yielded_once() {
        let query = compile(names());
        let source = VecRowSource::failing_after(text_rows(&["a"]));
        let closed = source.closed_flag();
        let mut rows = ObjectProjector::new(&query, source).rows::<String>();
        assert_eq!(rows.next().unwrap().unwrap(), "a");
        let err = rows.next().unwrap().unwrap_err();
        assert!(matches!(err, QueryError::RowSource(_)));
        assert!(closed.load(Ordering::SeqCst));
        assert!(rows.next().is_none());
    }

    #[test]
    fn test_single_over_zero_one_and_two_rows() {
        let query = compile(
            widgets()
                .filter(lambda("w", param("w").member("Name").eq(Expr::constant("X"))))
                .select(lambda("w", param("w").member("Name")))
                .single(),
        );
        let single = |values: &[&str]| {
            ObjectProjector::new(&query, VecRowSource::new(text_rows(values))).scalar::<String>()
        };
        assert!(matches!(single(&[]), Err(QueryError::EmptySequence)));
        assert_eq!(single(&["X"]).unwrap(), "X");
        assert!(matches!(single(&["X", "X"]), Err(QueryError::MoreThanOneElement)));
    }

    #[test]
    fn test_first_or_default_substitutes_type_default() {
        let query = compile(
            widgets()
                .select(lambda("w", param("w").member("Quantity")))
                .first_or_default(),
        );
        let value = ObjectProjector::new(&query, VecRowSource::new(Vec::new()))
            .scalar::<i64>()
            .unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn test_count_over_empty_source_is_zero() {
        let query = compile(widgets().count());
        let count = ObjectProjector::new(&query, VecRowSource::new(vec![vec![Value::Int(0)]]))
            .scalar::<i64>()
            .unwrap();
        assert_eq!(count, 0);
        let count = ObjectProjector::new(&query, VecRowSource::new(Vec::new()))
            .scalar::<i64>()
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_default_if_empty_count_is_one() {
        let query = compile(widgets().default_if_empty().count());
        let count = ObjectProjector::new(&query, VecRowSource::new(vec![vec![Value::Int(0)]]))
            .scalar::<i64>()
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_empty_aggregates() {
        let sum = compile(widgets().sum(lambda("w", param("w").member("Price"))));
        let total = ObjectProjector::new(&sum, VecRowSource::new(vec![vec![Value::Null]]))
            .scalar::<f64>()
            .unwrap();
        assert_eq!(total, 0.0);

        let min = compile(widgets().min(lambda("w", param("w").member("Quantity"))));
        let err = ObjectProjector::new(&min, VecRowSource::new(vec![vec![Value::Null]]))
            .scalar::<i64>()
            .unwrap_err();
        assert!(matches!(err, QueryError::EmptySequence));
        assert_eq!(err.to_string(), "Sequence contains no elements");

        let nullable = compile(widgets().max(lambda("w", param("w").member("Discount"))));
        let max = ObjectProjector::new(&nullable, VecRowSource::new(vec![vec![Value::Null]]))
            .scalar::<Option<f64>>()
            .unwrap();
        assert_eq!(max, None);
    }

    #[test]
    fn test_records_affected() {
        let query = compile(
            widgets()
                .filter(lambda("w", param("w").member("Quantity").eq(Expr::constant(0))))
                .delete(),
        );
        let source = VecRowSource::new(vec![vec![Value::Null]]).with_records_affected(3);
        let closed = source.closed_flag();
        let affected = ObjectProjector::new(&query, source).scalar::<i64>().unwrap();
        assert_eq!(affected, 3);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_scalar_needs_aggregator() {
        let query = compile(names());
        let err = ObjectProjector::new(&query, VecRowSource::new(Vec::new()))
            .scalar::<String>()
            .unwrap_err();
        assert!(matches!(err, QueryError::Binding(_)));
    }

    #[test]
    fn test_included_rows_fold_by_owner() {
        let column = |ordinal, data_type| ReaderNode::Column { ordinal, data_type };
        let query = CompiledQuery {
            sql: String::new(),
            parameters: Vec::new(),
            reader: ReaderNode::Object {
                type_name: "Person".into(),
                fields: vec![
                    ("Id".into(), column(0, DataType::Int)),
                    ("Name".into(), column(1, DataType::Text)),
                    (
                        "Widgets".into(),
                        ReaderNode::Collection {
                            element: Box::new(ReaderNode::Object {
                                type_name: "Widget".into(),
                                fields: vec![
                                    ("Id".into(), column(2, DataType::Int)),
                                    ("Name".into(), column(3, DataType::Text)),
                                ],
                                key: vec![2],
                            }),
                            owner_key: vec![0],
                        },
                    ),
                ],
                key: vec![0],
            },
            aggregator: None,
            placeholders: Vec::new(),
        };
        let row = |id: i64, name: &str, widget: Option<(i64, &str)>| {
            let (wid, wname) = match widget {
                Some((i, n)) => (Value::Int(i), Value::Text(n.into())),
                None => (Value::Null, Value::Null),
            };
            vec![Value::Int(id), Value::Text(name.into()), wid, wname]
        };
        let source = VecRowSource::new(vec![
            row(1, "ann", Some((10, "bolt"))),
            row(1, "ann", Some((11, "nut"))),
            row(2, "bob", None),
        ]);
        let people: Vec<Value> = ObjectProjector::new(&query, source)
            .rows::<Value>()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(people.len(), 2);
        let Some(Value::List(widgets)) = people[0].field("Widgets") else {
            panic!("expected a widget list");
        };
        assert_eq!(widgets.len(), 2);
        assert_eq!(widgets[1].field("Name"), Some(&Value::Text("nut".into())));
        assert_eq!(people[1].field("Widgets"), Some(&Value::List(Vec::new())));
    }

    #[test]
    fn test_repeated_elements_fold_once_in_first_seen_order() {
        let column = |ordinal, data_type| ReaderNode::Column { ordinal, data_type };
        let query = CompiledQuery {
            sql: String::new(),
            parameters: Vec::new(),
            reader: ReaderNode::Object {
                type_name: "Person".into(),
                fields: vec![
                    ("Id".into(), column(0, DataType::Int)),
                    (
                        "Widgets".into(),
                        ReaderNode::Collection {
                            element: Box::new(ReaderNode::Object {
                                type_name: "Widget".into(),
                                fields: vec![("Id".into(), column(1, DataType::Int))],
                                key: vec![1],
                            }),
                            owner_key: vec![0],
                        },
                    ),
                ],
                key: vec![0],
            },
            aggregator: None,
            placeholders: Vec::new(),
        };
        // every widget appears twice, as a second included collection would cause
        let rows = (0..2000)
            .map(|i| vec![Value::Int(1), Value::Int(i % 1000)])
            .collect();
        let people: Vec<Value> = ObjectProjector::new(&query, VecRowSource::new(rows))
            .rows::<Value>()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(people.len(), 1);
        let Some(Value::List(widgets)) = people[0].field("Widgets") else {
            panic!("expected a widget list");
        };
        assert_eq!(widgets.len(), 1000);
        assert_eq!(widgets[0].field("Id"), Some(&Value::Int(0)));
        assert_eq!(widgets[999].field("Id"), Some(&Value::Int(999)));
    }

    #[test]
    fn test_placeholders_are_read_from_the_compiled_query() {
        let query = CompiledQuery {
            sql: String::new(),
            parameters: Vec::new(),
            reader: ReaderNode::Record(vec![("Limit".into(), ReaderNode::Placeholder(0))]),
            aggregator: None,
            placeholders: vec![Value::Int(5)],
        };
        let row = ObjectProjector::new(&query, VecRowSource::new(vec![Vec::new()]))
            .rows::<Value>()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(row.field("Limit"), Some(&Value::Int(5)));
    }
}
