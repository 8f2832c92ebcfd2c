//! Insert, update and delete.
//!
//! A mutation is wrapped in a select with one pinned `affected` column so
//! that every query, mutations included, is a projection. The aggregator
//! reports the row source's affected-record count.

use crate::ast::types::{
    Aggregator, Assignment, ColumnDeclaration, DeleteExpr, InsertExpr, Projection, SelectExpr,
    SqlExpr, SqlFunction, TableExpr, UpdateExpr,
};
use crate::error::{QueryError, Result};
use crate::query::{self, Expr};
use crate::schema::{RelationshipKind, TypeDescriptor};
use crate::value::{DataType, Value};

use super::{Binder, FilterChain};

impl<'a> Binder<'a> {
    pub(super) fn bind_insert(
        &mut self,
        target: &Expr,
        assignments: &[query::Assignment],
        identity_insert: bool,
    ) -> Result<Projection> {
        let Expr::Source { type_name } = target else {
            return Err(QueryError::unsupported_argument(
                "Insert",
                "the target must be the source of a stored type",
            ));
        };
        let descriptor = self.descriptor(type_name)?;
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for assignment in assignments {
            let value = self.visit(&assignment.value)?;
            for (column, value) in self.assignment_columns(descriptor, &assignment.member, value)? {
                columns.push(column);
                values.push(value);
            }
        }
        let returning = descriptor
            .members
            .iter()
            .filter(|m| m.auto_increment)
            .map(|m| m.column_name().to_string())
            .collect();
        let table = TableExpr {
            alias: self.next_alias(),
            name: descriptor.table_name().to_string(),
            type_name: descriptor.name.clone(),
        };
        self.mutation_projection(SqlExpr::Insert(Box::new(InsertExpr {
            table,
            columns,
            values,
            returning,
            identity_insert,
        })))
    }

    pub(super) fn bind_update(
        &mut self,
        source: &Expr,
        row: &str,
        assignments: &[query::Assignment],
    ) -> Result<Projection> {
        let projection = self.visit_sequence(source)?;
        let chain = FilterChain::of(&projection.select)
            .ok_or_else(|| QueryError::unsupported_argument("Update", NOT_A_FILTERED_TABLE))?;
        let SqlExpr::Table(table) = chain.source else {
            return Err(QueryError::unsupported_argument("Update", NOT_A_FILTERED_TABLE));
        };
        let descriptor = self.descriptor(&table.type_name)?;

        let params = [row.to_string()];
        let mut sets = Vec::new();
        for assignment in assignments {
            let value = self.bind_body(&params, vec![projection.projector.clone()], &assignment.value)?;
            let value = chain.resolve(value)?;
            for (column, value) in self.assignment_columns(descriptor, &assignment.member, value)? {
                sets.push(Assignment { column, value });
            }
        }
        let where_clause = SqlExpr::and_all(chain.predicates()?);
        let update = SqlExpr::Update(Box::new(UpdateExpr {
            table: table.clone(),
            assignments: sets,
            where_clause,
        }));
        self.mutation_projection(update)
    }

    pub(super) fn bind_delete(&mut self, source: &Expr) -> Result<Projection> {
        let projection = self.visit_sequence(source)?;
        let chain = FilterChain::of(&projection.select)
            .ok_or_else(|| QueryError::unsupported_argument("Delete", NOT_A_FILTERED_TABLE))?;
        let SqlExpr::Table(table) = chain.source else {
            return Err(QueryError::unsupported_argument("Delete", NOT_A_FILTERED_TABLE));
        };
        let delete = SqlExpr::Delete(Box::new(DeleteExpr {
            table: table.clone(),
            where_clause: SqlExpr::and_all(chain.predicates()?),
        }));
        self.mutation_projection(delete)
    }

    /// Column/value pairs for one assigned member. A reference assigns its
    /// foreign-key columns.
    fn assignment_columns(
        &self,
        descriptor: &TypeDescriptor,
        member: &str,
        value: SqlExpr,
    ) -> Result<Vec<(String, SqlExpr)>> {
        if let Some(scalar) = descriptor.find_member(member) {
            let value = match value {
                SqlExpr::Constant(v) => SqlExpr::Constant(v.coerce(&scalar.data_type)),
                other => other,
            };
            return Ok(vec![(scalar.column_name().to_string(), value)]);
        }
        let relationship = descriptor
            .find_relationship(member)
            .filter(|r| r.kind == RelationshipKind::Reference)
            .ok_or_else(|| QueryError::UnsupportedMember {
                target: descriptor.name.clone(),
                member: member.to_string(),
            })?;
        let target = self.descriptor(&relationship.target)?;
        let columns = descriptor.foreign_key_columns(relationship, target);

        let keys = match value {
            SqlExpr::ObjectReference(object) => self.primary_key_values(&object)?,
            SqlExpr::Constant(Value::Null) | SqlExpr::Placeholder { value: Value::Null, .. } => {
                columns.iter().map(|_| SqlExpr::Constant(Value::Null)).collect()
            }
            SqlExpr::Constant(host @ Value::Object { .. })
            | SqlExpr::Placeholder {
                value: host @ Value::Object { .. },
                ..
            } => self.host_key_values(&target.name, &host)?,
            other => {
                return Err(QueryError::unsupported_argument(
                    member,
                    format!("cannot assign a {} to a reference", other.kind_name()),
                ))
            }
        };
        if keys.len() != columns.len() {
            return Err(QueryError::binding(format!(
                "reference \"{}\" has {} key columns but {} values",
                member,
                columns.len(),
                keys.len()
            )));
        }
        Ok(columns.into_iter().zip(keys).collect())
    }

    fn mutation_projection(&mut self, mutation: SqlExpr) -> Result<Projection> {
        let alias = self.next_alias();
        let select = SelectExpr::new(alias)
            .with_columns(vec![ColumnDeclaration::pinned(
                "affected",
                SqlExpr::Constant(Value::Null),
            )])
            .with_from(mutation);
        Ok(Projection::new(
            select,
            SqlExpr::function(SqlFunction::RecordsAffected, Vec::new(), DataType::Int),
        )
        .with_aggregator(Aggregator::RecordsAffected))
    }
}

const NOT_A_FILTERED_TABLE: &str = "the source must be a table with optional filters";

#[cfg(test)]
mod tests {
    use crate::ast::binder::Binder;
    use crate::ast::types::{Aggregator, SqlExpr};
    use crate::error::QueryError;
    use crate::query::{lambda, param, Expr, Queryable};
    use crate::testing::{schema, widgets};
    use crate::value::Value;

    #[test]
    fn test_insert_assigns_columns_and_returns_identity() {
        let schema = schema();
        let query = Queryable::insert(
            "Widget",
            vec![("Name", Expr::constant("bolt")), ("Price", Expr::constant(2.5))],
        );
        let projection = Binder::bind(query.expr(), &schema).unwrap();
        assert_eq!(projection.aggregator, Some(Aggregator::RecordsAffected));
        assert!(projection.select.columns[0].no_optimise);
        let Some(SqlExpr::Insert(insert)) = &projection.select.from else {
            panic!("expected an insert");
        };
        assert_eq!(insert.columns, vec!["Name", "Price"]);
        assert_eq!(insert.returning, vec!["Id"]);
    }

    #[test]
    fn test_insert_reference_assigns_foreign_key() {
        let schema = schema();
        let owner = Value::Object {
            type_name: "Person".into(),
            fields: vec![("Id".into(), Value::Int(7))],
        };
        let query = Queryable::insert("Widget", vec![("Owner", Expr::constant(owner))]);
        let projection = Binder::bind(query.expr(), &schema).unwrap();
        let Some(SqlExpr::Insert(insert)) = &projection.select.from else {
            panic!("expected an insert");
        };
        assert_eq!(insert.columns, vec!["OwnerId"]);
        assert_eq!(insert.values, vec![SqlExpr::Constant(Value::Int(7))]);
    }

    #[test]
    fn test_update_flattens_filters() {
        let schema = schema();
        let query = widgets()
            .filter(lambda("w", param("w").member("Quantity").eq(Expr::constant(0))))
            .update(
                "w",
                vec![("Price", param("w").member("Price").mul(Expr::constant(2)))],
            );
        let projection = Binder::bind(query.expr(), &schema).unwrap();
        let Some(SqlExpr::Update(update)) = &projection.select.from else {
            panic!("expected an update");
        };
        assert_eq!(update.table.name, "Widgets");
        assert!(update.where_clause.as_ref().unwrap().references_alias(&update.table.alias));
        assert!(update.assignments[0].value.references_alias(&update.table.alias));
    }

    #[test]
    fn test_delete_over_ordered_source_is_unsupported() {
        let schema = schema();
        let query = widgets()
            .order_by(lambda("w", param("w").member("Name")))
            .delete();
        let err = Binder::bind(query.expr(), &schema).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedArgument { .. }));
    }

    #[test]
    fn test_unknown_assignment_member() {
        let schema = schema();
        let query = Queryable::insert("Widget", vec![("Weight", Expr::constant(1))]);
        let err = Binder::bind(query.expr(), &schema).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedMember { .. }));
    }
}
