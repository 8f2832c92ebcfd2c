//! Object references: table projections, navigation and key equality.

use crate::ast::types::{
    BinaryOperator, ColumnDeclaration, MemberBinding, ObjectReference, Projection, SelectExpr,
    SqlExpr, SqlFunction, TableExpr,
};
use crate::error::{QueryError, Result};
use crate::schema::{RelationshipDescriptor, RelationshipKind};
use crate::value::{DataType, Value};

use super::{Binder, FilterChain};

impl<'a> Binder<'a> {
    /// Every stored instance of `type_name`, as a fresh select over its table.
    pub(super) fn table_projection(&mut self, type_name: &str) -> Result<Projection> {
        let descriptor = self.descriptor(type_name)?;
        if descriptor.primary_keys().next().is_none() {
            return Err(QueryError::binding(format!(
                "type \"{}\" has no primary key",
                type_name
            )));
        }
        let table_alias = self.next_alias();
        let alias = self.next_alias();

        let mut columns: Vec<ColumnDeclaration> = Vec::new();
        let mut bindings = Vec::new();
        for member in &descriptor.members {
            columns.push(ColumnDeclaration::new(
                member.name.clone(),
                SqlExpr::column(&table_alias, member.column_name(), member.data_type.clone()),
            ));
            bindings.push(MemberBinding {
                member: member.name.clone(),
                expr: SqlExpr::column(&alias, &member.name, member.data_type.clone()),
            });
        }

        for relationship in descriptor
            .relationships
            .iter()
            .filter(|r| r.kind == RelationshipKind::Reference)
        {
            let target = self.descriptor(&relationship.target)?;
            let foreign_keys = descriptor.foreign_key_columns(relationship, target);
            let mut keys = Vec::new();
            for (column, key) in foreign_keys.iter().zip(target.primary_keys()) {
                let data_type = DataType::nullable(key.data_type.clone());
                if !columns.iter().any(|c| c.name == *column) {
                    columns.push(ColumnDeclaration::new(
                        column.clone(),
                        SqlExpr::column(&table_alias, column, data_type.clone()),
                    ));
                }
                keys.push(MemberBinding {
                    member: key.name.clone(),
                    expr: SqlExpr::column(&alias, column, data_type),
                });
            }
            bindings.push(MemberBinding {
                member: relationship.name.clone(),
                expr: SqlExpr::ObjectReference(ObjectReference {
                    type_name: target.name.clone(),
                    bindings: keys,
                    deflated: true,
                }),
            });
        }

        let table = SqlExpr::Table(TableExpr {
            alias: table_alias,
            name: descriptor.table_name().to_string(),
            type_name: descriptor.name.clone(),
        });
        let select = SelectExpr::new(alias)
            .with_columns(columns)
            .with_from(table);
        Ok(Projection::new(
            select,
            SqlExpr::ObjectReference(ObjectReference {
                type_name: descriptor.name.clone(),
                bindings,
                deflated: false,
            }),
        ))
    }

    pub(super) fn object_member(&mut self, object: ObjectReference, member: &str) -> Result<SqlExpr> {
        if let Some(bound) = object.binding(member) {
            return Ok(bound.clone());
        }
        let descriptor = self.descriptor(&object.type_name)?;
        if let Some(relationship) = descriptor.find_relationship(member) {
            return match relationship.kind {
                RelationshipKind::Collection => {
                    Ok(self.navigation_projection(&object, relationship)?.into())
                }
                RelationshipKind::Reference => Err(QueryError::binding(format!(
                    "reference \"{}\" of {} is not bound",
                    member, object.type_name
                ))),
            };
        }
        if descriptor.find_member(member).is_none() {
            return Err(QueryError::UnsupportedMember {
                target: object.type_name.clone(),
                member: member.to_string(),
            });
        }
        if !object.deflated {
            return Err(QueryError::binding(format!(
                "member \"{}\" of {} is not bound",
                member, object.type_name
            )));
        }

        // only the key is known: look the member up by primary key
        let target = self.table_projection(&object.type_name)?;
        let predicate = self.object_comparison(
            BinaryOperator::Eq,
            target.projector.clone(),
            SqlExpr::ObjectReference(object),
        )?;
        let mut lookup = self.wrap(target)?;
        lookup.select.where_clause = Some(predicate);
        let value = match &lookup.projector {
            SqlExpr::ObjectReference(full) => full.binding(member).cloned(),
            _ => None,
        }
        .ok_or_else(|| QueryError::binding(format!("member \"{}\" is not bound", member)))?;
        Ok(SqlExpr::Subquery(Box::new(self.value_select(lookup, vec![value])?)))
    }

    /// The children of `owner` along a one-to-many relationship.
    pub(super) fn navigation_projection(
        &mut self,
        owner: &ObjectReference,
        relationship: &RelationshipDescriptor,
    ) -> Result<Projection> {
        let back_reference = relationship.back_reference.as_deref().ok_or_else(|| {
            QueryError::binding(format!(
                "collection \"{}\" has no back reference",
                relationship.name
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
        let predicate = self.object_comparison(
            BinaryOperator::Eq,
            child_owner,
            SqlExpr::ObjectReference(owner.clone()),
        )?;
        let mut navigation = self.wrap(children)?;
        navigation.select.where_clause = Some(predicate);
        Ok(navigation)
    }

    /// Component-wise primary key comparison of an object with another operand.
    pub(super) fn object_comparison(
        &mut self,
        op: BinaryOperator,
        left: SqlExpr,
        right: SqlExpr,
    ) -> Result<SqlExpr> {
        let (object, other) = match (left, right) {
            (SqlExpr::ObjectReference(object), other) | (other, SqlExpr::ObjectReference(object)) => {
                (object, other)
            }
            (left, _) => {
                return Err(QueryError::binding(format!(
                    "expected an object, found {}",
                    left.kind_name()
                )))
            }
        };
        let keys = self.primary_key_values(&object)?;
        let no_key =
            || QueryError::binding(format!("type \"{}\" has no primary key", object.type_name));

        let predicates: Vec<SqlExpr> = match other {
            SqlExpr::ObjectReference(other) => {
                let other_keys = self.primary_key_values(&other)?;
                if other_keys.len() != keys.len() {
                    return Err(QueryError::binding(format!(
                        "cannot compare {} with {}",
                        object.type_name, other.type_name
                    )));
                }
                return keys_compared(op, keys.into_iter().zip(other_keys)).ok_or_else(no_key);
            }
            SqlExpr::Constant(Value::Null) | SqlExpr::Placeholder { value: Value::Null, .. } => keys
                .into_iter()
                .map(|k| SqlExpr::function(SqlFunction::IsNull, vec![k], DataType::Bool))
                .collect(),
            SqlExpr::Constant(host @ Value::Object { .. })
            | SqlExpr::Placeholder {
                value: host @ Value::Object { .. },
                ..
            } => {
                let values = self.host_key_values(&object.type_name, &host)?;
                return keys_compared(op, keys.into_iter().zip(values)).ok_or_else(no_key);
            }
            SqlExpr::Projection(projection) => {
                let other_keys = match &projection.projector {
                    SqlExpr::ObjectReference(element) => self.primary_key_values(element)?,
                    other => {
                        return Err(QueryError::unsupported_argument(
                            "==",
                            format!("cannot compare an object with a sequence of {}", other.kind_name()),
                        ))
                    }
                };
                let lookup = SqlExpr::Subquery(Box::new(self.value_select(*projection, other_keys)?));
                let mut keys = keys;
                let key = if keys.len() == 1 {
                    keys.remove(0)
                } else {
                    SqlExpr::Tuple(keys)
                };
                vec![SqlExpr::binary(BinaryOperator::Eq, key, lookup)]
            }
            other => {
                return Err(QueryError::unsupported_argument(
                    "==",
                    format!("cannot compare an object with a {}", other.kind_name()),
                ))
            }
        };

        let combined = SqlExpr::and_all(predicates).ok_or_else(no_key)?;
        Ok(match op {
            BinaryOperator::NotEq => SqlExpr::not(combined),
            _ => combined,
        })
    }

    /// Bound primary key members of `object`, in descriptor key order.
    pub(super) fn primary_key_values(&self, object: &ObjectReference) -> Result<Vec<SqlExpr>> {
        let descriptor = self.descriptor(&object.type_name)?;
        descriptor
            .primary_keys()
            .map(|key| {
                object
                    .binding(&key.name)
                    .cloned()
                    .ok_or_else(|| QueryError::binding("Missing ObjectReference bindings"))
            })
            .collect()
    }

    pub(super) fn host_key_values(&self, type_name: &str, host: &Value) -> Result<Vec<SqlExpr>> {
        let descriptor = self.descriptor(type_name)?;
        descriptor
            .primary_keys()
            .map(|key| {
                host.field(&key.name)
                    .cloned()
                    .map(SqlExpr::Constant)
                    .ok_or_else(|| {
                        QueryError::binding(format!(
                            "host {} value has no key \"{}\"",
                            type_name, key.name
                        ))
                    })
            })
            .collect()
    }

    /// A select of `values` over the rows of `projection`.
    ///
    /// Filter-only layers are flattened so the values and predicates apply to
    /// the innermost source directly. Columns are named `c0`, `c1`, ...
    pub(super) fn value_select(
        &mut self,
        projection: Projection,
        values: Vec<SqlExpr>,
    ) -> Result<SelectExpr> {
        let alias = self.next_alias();
        if let Some(chain) = FilterChain::of(&projection.select) {
            let columns = values
                .into_iter()
                .enumerate()
                .map(|(i, v)| Ok(ColumnDeclaration::new(format!("c{}", i), chain.resolve(v)?)))
                .collect::<Result<Vec<_>>>()?;
            let predicate = SqlExpr::and_all(chain.predicates()?);
            return Ok(SelectExpr::new(alias)
                .with_columns(columns)
                .with_from(chain.source.clone())
                .with_where(predicate));
        }
        let columns = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| ColumnDeclaration::new(format!("c{}", i), v))
            .collect();
        Ok(SelectExpr::new(alias)
            .with_columns(columns)
            .with_from(SqlExpr::Select(Box::new(projection.select))))
    }
}

/// Key-wise `=` or `<>` of two objects.
///
/// Inequality holds when any key differs, including a NULL key against a
/// present one, so a missing reference is unequal to every object.
fn keys_compared(
    op: BinaryOperator,
    pairs: impl IntoIterator<Item = (SqlExpr, SqlExpr)>,
) -> Option<SqlExpr> {
    let pairs = pairs.into_iter();
    if op != BinaryOperator::NotEq {
        return SqlExpr::and_all(pairs.map(|(a, b)| SqlExpr::binary(BinaryOperator::Eq, a, b)));
    }
    pairs
        .map(|(a, b)| distinct_keys(a, b))
        .reduce(|acc, p| SqlExpr::binary(BinaryOperator::Or, acc, p))
}

/// `a <> b`, widened with the NULL cases of whichever side is nullable.
fn distinct_keys(a: SqlExpr, b: SqlExpr) -> SqlExpr {
    let test = |function: SqlFunction, e: &SqlExpr| SqlExpr::function(function, vec![e.clone()], DataType::Bool);
    let mut predicate = SqlExpr::binary(BinaryOperator::NotEq, a.clone(), b.clone());
    let widen = match (a.data_type().is_nullable(), b.data_type().is_nullable()) {
        (true, true) => vec![
            SqlExpr::binary(
                BinaryOperator::And,
                test(SqlFunction::IsNull, &a),
                test(SqlFunction::IsNotNull, &b),
            ),
            SqlExpr::binary(
                BinaryOperator::And,
                test(SqlFunction::IsNotNull, &a),
                test(SqlFunction::IsNull, &b),
            ),
        ],
        (true, false) => vec![test(SqlFunction::IsNull, &a)],
        (false, true) => vec![test(SqlFunction::IsNull, &b)],
        (false, false) => Vec::new(),
    };
    for case in widen {
        predicate = SqlExpr::binary(BinaryOperator::Or, predicate, case);
    }
    predicate
}
