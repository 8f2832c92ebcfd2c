//! Column projection: turns a projector expression into select columns.
//!
//! Every time the binder wraps a select in a new one, the projector must be
//! rewritten so it only references columns of the new alias. The
//! [`ColumnProjector`] walks the projector, declares one column per distinct
//! SQL-evaluable subtree and replaces that subtree by a reference to it.
//! Object references, records, groupings and included collections are walked
//! structurally. Constants and placeholders stay host-side.
//!
//! Nested projections (a group's element subquery, a navigation sequence)
//! are not turned into columns. Their free references to the wrapped source
//! are re-pointed through new columns of the wrapping select instead.

use std::collections::HashSet;

use crate::ast::types::{ColumnDeclaration, Projection, SqlExpr};
use crate::error::Result;
use crate::value::Value;

/// New columns plus the projector rewritten over them.
#[derive(Debug, Clone)]
pub struct ProjectedColumns {
    pub columns: Vec<ColumnDeclaration>,
    pub projector: SqlExpr,
}

/// Projects `expr` into columns of the select aliased `new_alias`.
///
/// `existing` columns are kept first and reused when an expression matches.
/// `source_aliases` are the aliases visible in the new select's `FROM`.
pub fn project_columns(
    expr: SqlExpr,
    new_alias: &str,
    existing: Vec<ColumnDeclaration>,
    source_aliases: &[String],
) -> Result<ProjectedColumns> {
    let mut projector = ColumnProjector::new(new_alias, existing, source_aliases);
    let projected = projector.project(expr, None)?;
    Ok(ProjectedColumns {
        columns: projector.columns,
        projector: projected,
    })
}

/// Whether `expr` can be computed by the database as one column value.
pub fn is_column_expr(expr: &SqlExpr) -> bool {
    match expr {
        SqlExpr::Column(_)
        | SqlExpr::Constant(_)
        | SqlExpr::Placeholder { .. }
        | SqlExpr::Aggregate(_)
        | SqlExpr::Subquery(_) => true,
        SqlExpr::Binary { left, right, .. } => is_column_expr(left) && is_column_expr(right),
        SqlExpr::Unary { operand, .. } | SqlExpr::Convert { operand, .. } => {
            is_column_expr(operand)
        }
        SqlExpr::Conditional {
            test,
            if_true,
            if_false,
        } => is_column_expr(test) && is_column_expr(if_true) && is_column_expr(if_false),
        // IN and EXISTS take a projection or a tuple as argument
        SqlExpr::FunctionCall { args, .. } => args.iter().all(|a| {
            matches!(a, SqlExpr::Projection(_)) || matches!(a, SqlExpr::Tuple(_)) || is_column_expr(a)
        }),
        _ => false,
    }
}

struct ColumnProjector<'a> {
    new_alias: &'a str,
    source_aliases: &'a [String],
    columns: Vec<ColumnDeclaration>,
    names: HashSet<String>,
    counter: usize,
}

impl<'a> ColumnProjector<'a> {
    fn new(new_alias: &'a str, existing: Vec<ColumnDeclaration>, source_aliases: &'a [String]) -> Self {
        let names = existing.iter().map(|c| c.name.clone()).collect();
        Self {
            new_alias,
            source_aliases,
            columns: existing,
            names,
            counter: 0,
        }
    }

    fn project(&mut self, expr: SqlExpr, hint: Option<&str>) -> Result<SqlExpr> {
        match expr {
            SqlExpr::Constant(_) | SqlExpr::Placeholder { .. } => Ok(expr),
            e if is_column_expr(&e) => Ok(self.map_column(e, hint)),
            SqlExpr::ObjectReference(mut object) => {
                for binding in &mut object.bindings {
                    let bound = std::mem::replace(&mut binding.expr, SqlExpr::Constant(Value::Null));
                    binding.expr = self.project(bound, Some(&binding.member))?;
                }
                Ok(SqlExpr::ObjectReference(object))
            }
            SqlExpr::Record(members) => Ok(SqlExpr::Record(
                members
                    .into_iter()
                    .map(|(name, e)| {
                        let projected = self.project(e, Some(&name))?;
                        Ok((name, projected))
                    })
                    .collect::<Result<_>>()?,
            )),
            SqlExpr::Tuple(items) => Ok(SqlExpr::Tuple(
                items
                    .into_iter()
                    .map(|e| self.project(e, None))
                    .collect::<Result<_>>()?,
            )),
            SqlExpr::Conditional {
                test,
                if_true,
                if_false,
            } => Ok(SqlExpr::Conditional {
                test: Box::new(self.project(*test, None)?),
                if_true: Box::new(self.project(*if_true, hint)?),
                if_false: Box::new(self.project(*if_false, hint)?),
            }),
            SqlExpr::Grouping { key, group } => Ok(SqlExpr::Grouping {
                key: Box::new(self.project(*key, Some("Key"))?),
                group: Box::new(self.remap_nested(*group)?),
            }),
            SqlExpr::Projection(p) => Ok(SqlExpr::Projection(Box::new(self.remap_nested(*p)?))),
            SqlExpr::IncludedCollection(element) => Ok(SqlExpr::IncludedCollection(Box::new(
                self.project(*element, hint)?,
            ))),
            other => other.map_children(&mut |child| self.project(child, None)),
        }
    }

    /// Declares (or reuses) a column for `expr` and returns a reference to it.
    fn map_column(&mut self, expr: SqlExpr, hint: Option<&str>) -> SqlExpr {
        let data_type = expr.data_type();
        if let Some(existing) = self.columns.iter().find(|c| c.expr == expr) {
            return SqlExpr::column(self.new_alias, &existing.name, data_type);
        }
        let base = match (&expr, hint) {
            (_, Some(hint)) => hint.to_string(),
            (SqlExpr::Column(c), None) => c.name.clone(),
            _ => "c".to_string(),
        };
        let name = self.unique_name(base);
        self.columns.push(ColumnDeclaration::new(name.clone(), expr));
        SqlExpr::column(self.new_alias, &name, data_type)
    }

    fn unique_name(&mut self, base: String) -> String {
        let mut name = if base == "c" {
            self.counter += 1;
            format!("c{}", self.counter - 1)
        } else {
            base.clone()
        };
        let mut suffix = 1;
        while self.names.contains(&name) {
            name = format!("{}{}", base, suffix);
            suffix += 1;
        }
        self.names.insert(name.clone());
        name
    }

    /// Re-points columns of the wrapped sources inside a nested projection.
    fn remap_nested(&mut self, projection: Projection) -> Result<Projection> {
        let sources = self.source_aliases;
        let mut remap = |e: SqlExpr| -> Result<SqlExpr> {
            match e {
                SqlExpr::Column(c) if sources.iter().any(|a| *a == c.alias) => {
                    Ok(self.map_column(SqlExpr::Column(c), None))
                }
                other => Ok(other),
            }
        };
        let projected = SqlExpr::Projection(Box::new(projection)).transform_up(&mut remap)?;
        projected.into_projection()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::types::{
        AggregateExpr, BinaryOperator, MemberBinding, ObjectReference, SelectExpr,
    };
    use crate::query::AggregateKind;
    use crate::value::DataType;

    fn col(alias: &str, name: &str) -> SqlExpr {
        SqlExpr::column(alias, name, DataType::Int)
    }

    #[test]
    fn test_columns_keep_their_names() {
        let projected = project_columns(col("T1", "Price"), "T2", vec![], &["T1".into()]).unwrap();
        assert_eq!(projected.columns.len(), 1);
        assert_eq!(projected.columns[0].name, "Price");
        assert_eq!(projected.projector, col("T2", "Price"));
    }

    #[test]
    fn test_duplicate_expressions_share_a_column() {
        let record = SqlExpr::Record(vec![
            ("A".into(), col("T1", "Id")),
            ("B".into(), col("T1", "Id")),
        ]);
        let projected = project_columns(record, "T2", vec![], &["T1".into()]).unwrap();
        assert_eq!(projected.columns.len(), 1);
        assert_eq!(
            projected.projector,
            SqlExpr::Record(vec![
                ("A".into(), col("T2", "A")),
                ("B".into(), col("T2", "A")),
            ])
        );
    }

    #[test]
    fn test_name_collisions_get_suffixes() {
        let record = SqlExpr::Record(vec![
            ("Id".into(), col("T1", "Id")),
            ("Other".into(), col("T3", "Id")),
        ]);
        let existing = vec![ColumnDeclaration::new("Other", col("T1", "Name"))];
        let projected =
            project_columns(record, "T4", existing, &["T1".into(), "T3".into()]).unwrap();
        let names: Vec<_> = projected.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Other", "Id", "Other1"]);
    }

    #[test]
    fn test_computed_expressions_become_one_column() {
        let sum = SqlExpr::binary(BinaryOperator::Plus, col("T1", "A"), col("T1", "B"));
        let projected = project_columns(sum, "T2", vec![], &["T1".into()]).unwrap();
        assert_eq!(projected.columns.len(), 1);
        assert_eq!(projected.columns[0].name, "c0");
    }

    #[test]
    fn test_constants_stay_host_side() {
        let record = SqlExpr::Record(vec![
            ("X".into(), SqlExpr::Constant(Value::Int(1))),
            ("Y".into(), col("T1", "Y")),
        ]);
        let projected = project_columns(record, "T2", vec![], &["T1".into()]).unwrap();
        assert_eq!(projected.columns.len(), 1);
        match projected.projector {
            SqlExpr::Record(members) => assert_eq!(members[0].1, SqlExpr::Constant(Value::Int(1))),
            other => panic!("unexpected projector {:?}", other),
        }
    }

    #[test]
    fn test_object_bindings_are_projected() {
        let object = SqlExpr::ObjectReference(ObjectReference {
            type_name: "Widget".into(),
            bindings: vec![MemberBinding {
                member: "Id".into(),
                expr: col("T1", "Id"),
            }],
            deflated: false,
        });
        let projected = project_columns(object, "T2", vec![], &["T1".into()]).unwrap();
        match projected.projector {
            SqlExpr::ObjectReference(o) => assert_eq!(o.binding("Id"), Some(&col("T2", "Id"))),
            other => panic!("unexpected projector {:?}", other),
        }
    }

    #[test]
    fn test_nested_projection_references_are_remapped() {
        let element = SelectExpr::new("T4")
            .with_columns(vec![ColumnDeclaration::new("V", col("T3", "V"))])
            .with_where(Some(SqlExpr::binary(
                BinaryOperator::Eq,
                col("T3", "K"),
                col("T5", "K"),
            )));
        let grouping = SqlExpr::Grouping {
            key: Box::new(col("T5", "K")),
            group: Box::new(Projection::new(element, col("T4", "V"))),
        };
        let projected = project_columns(grouping, "T6", vec![], &["T5".into()]).unwrap();
        assert_eq!(projected.columns.len(), 1);
        let SqlExpr::Grouping { key, group } = projected.projector else {
            panic!("expected a grouping");
        };
        assert_eq!(*key, col("T6", "Key"));
        assert!(!group.select.where_clause.as_ref().unwrap().references_alias("T5"));
        assert!(group.select.where_clause.as_ref().unwrap().references_alias("T6"));
    }

    #[test]
    fn test_aggregates_are_columns() {
        let aggregate = SqlExpr::Aggregate(Box::new(AggregateExpr {
            kind: AggregateKind::Count,
            argument: None,
            distinct: false,
            data_type: DataType::Int,
        }));
        assert!(is_column_expr(&aggregate));
        let projected =
            project_columns(aggregate, "T2", vec![], &["T1".into()]).unwrap();
        assert_eq!(projected.projector, col("T2", "c0"));
    }
}
