/// Query pipeline driver.
///
/// Runs one operator tree through every stage:
///
/// ```text
/// Expr ──partial_eval──► Expr + placeholders
///      ──Binder──────► Projection
///      ──Optimizer───► Projection
///      ──Formatter───► SQL + parameters
///      ──reader──────► ReaderNode
/// ```
///
/// The result is a [`CompiledQuery`]: immutable, `Send + Sync`, and
/// reusable for any number of executions.
use tracing::debug;

use crate::config::TranslatorConfig;
use crate::error::{QueryError, Result};
use crate::query::Expr;
use crate::schema::TypeDescriptorProvider;
use crate::value::{DataType, Value};

use super::binder::Binder;
use super::dialect::{Dialect, DialectKind};
use super::evaluator::partial_eval;
use super::formatter::{Formatter, Parameter};
use super::optimizer::Optimizer;
use super::types::*;

/// Declarative description of how one row becomes a host value.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderNode {
    /// A column of the row, coerced to its declared type.
    Column { ordinal: usize, data_type: DataType },
    Constant(Value),
    /// A compiled placeholder value, by index.
    Placeholder(usize),
    /// A domain object. Reads as NULL when every `key` column is NULL.
    Object {
        type_name: String,
        fields: Vec<(String, ReaderNode)>,
        key: Vec<usize>,
    },
    Record(Vec<(String, ReaderNode)>),
    /// An included collection: one element per row, folded across the
    /// consecutive rows sharing `owner_key`.
    Collection {
        element: Box<ReaderNode>,
        owner_key: Vec<usize>,
    },
    /// The row source's affected-record count.
    RecordsAffected,
}

impl ReaderNode {
    /// Owner key of the first included collection, if any.
    pub fn fold_key(&self) -> Option<&[usize]> {
        match self {
            ReaderNode::Collection { owner_key, .. } => Some(owner_key),
            ReaderNode::Object { fields, .. } | ReaderNode::Record(fields) => {
                fields.iter().find_map(|(_, node)| node.fold_key())
            }
            _ => None,
        }
    }
}

/// SQL text, parameters and everything needed to read the results back.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub parameters: Vec<Parameter>,
    pub reader: ReaderNode,
    pub aggregator: Option<Aggregator>,
    /// Placeholder values by index, as computed by partial evaluation.
    pub placeholders: Vec<Value>,
}

/// Translates operator trees for one schema and dialect.
pub struct QueryTranslator<'p> {
    provider: &'p dyn TypeDescriptorProvider,
    dialect: &'static dyn Dialect,
    optimizer: Optimizer,
}

impl<'p> QueryTranslator<'p> {
    pub fn new(provider: &'p dyn TypeDescriptorProvider, config: &TranslatorConfig) -> Self {
        Self {
            provider,
            dialect: config.dialect.dialect(),
            optimizer: Optimizer::from_config(&config.optimizer),
        }
    }

    /// A translator with every optimization pass enabled.
    pub fn with_dialect(provider: &'p dyn TypeDescriptorProvider, dialect: DialectKind) -> Self {
        Self::new(provider, &TranslatorConfig::with_dialect(dialect))
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    pub fn translate(&self, query: &Expr) -> Result<CompiledQuery> {
        let evaluated = partial_eval(query)?;
        debug!(placeholders = evaluated.placeholders.len(), "partially evaluated query");

        let projection = Binder::bind(&evaluated.expr, self.provider)?;
        check_root_projector(&projection.projector)?;

        let optimized = self.optimizer.optimize(projection.into())?;
        let formatted = Formatter::new(self.dialect).format(&optimized)?;
        let projection = optimized.into_projection()?;

        let reader = ReaderBuilder {
            provider: self.provider,
            select: &projection.select,
        }
        .build(&projection.projector)?;
        debug!(
            dialect = self.dialect.name(),
            columns = projection.select.columns.len(),
            folded = reader.fold_key().is_some(),
            "compiled query"
        );

        Ok(CompiledQuery {
            sql: formatted.sql,
            parameters: formatted.parameters,
            reader,
            aggregator: projection.aggregator,
            placeholders: evaluated.placeholders,
        })
    }
}

/// Shapes that bind but cannot be read back from flat rows.
fn check_root_projector(projector: &SqlExpr) -> Result<()> {
    let mut grouping = false;
    let mut nested = false;
    projector.any(&mut |e| {
        match e {
            SqlExpr::Grouping { .. } => grouping = true,
            SqlExpr::Projection(_) => nested = true,
            _ => {}
        }
        false
    });
    if grouping {
        return Err(QueryError::unsupported_argument(
            "GroupBy",
            "a group-by at the root needs a result selector",
        ));
    }
    if nested {
        return Err(QueryError::unsupported_argument(
            "Select",
            "a nested sequence cannot be read from flat rows; use Include",
        ));
    }
    Ok(())
}

/// Turns a root projector into a reader over the root select's columns.
struct ReaderBuilder<'a> {
    provider: &'a dyn TypeDescriptorProvider,
    select: &'a SelectExpr,
}

impl ReaderBuilder<'_> {
    fn build(&self, projector: &SqlExpr) -> Result<ReaderNode> {
        match projector {
            SqlExpr::Column(column) => Ok(ReaderNode::Column {
                ordinal: self.ordinal(column)?,
                data_type: column.data_type.clone(),
            }),
            SqlExpr::Constant(value) => Ok(ReaderNode::Constant(value.clone())),
            SqlExpr::Placeholder { index, .. } => Ok(ReaderNode::Placeholder(*index)),
            SqlExpr::FunctionCall {
                function: SqlFunction::RecordsAffected,
                ..
            } => Ok(ReaderNode::RecordsAffected),
            SqlExpr::Record(members) => {
                let mut fields = Vec::with_capacity(members.len());
                for (name, expr) in members {
                    fields.push((name.clone(), self.build(expr)?));
                }
                Ok(ReaderNode::Record(fields))
            }
            SqlExpr::ObjectReference(object) => self.object(object),
            other => Err(QueryError::binding(format!(
                "cannot read a {} from a row",
                other.kind_name()
            ))),
        }
    }

    fn object(&self, object: &ObjectReference) -> Result<ReaderNode> {
        let key = self.key_ordinals(object)?;
        let mut fields = Vec::with_capacity(object.bindings.len());
        for binding in &object.bindings {
            let node = match &binding.expr {
                SqlExpr::IncludedCollection(element) => ReaderNode::Collection {
                    element: Box::new(self.build(element)?),
                    owner_key: key.clone(),
                },
                expr => self.build(expr)?,
            };
            fields.push((binding.member.clone(), node));
        }
        Ok(ReaderNode::Object {
            type_name: object.type_name.clone(),
            fields,
            key,
        })
    }

    /// Ordinals of the object's key columns. A deflated reference is all key.
    fn key_ordinals(&self, object: &ObjectReference) -> Result<Vec<usize>> {
        let descriptor = self
            .provider
            .type_descriptor(&object.type_name)
            .ok_or_else(|| QueryError::binding(format!("unknown type \"{}\"", object.type_name)))?;
        let mut ordinals = Vec::new();
        for key in descriptor.primary_keys() {
            if let Some(SqlExpr::Column(column)) = object.binding(&key.name) {
                ordinals.push(self.ordinal(column)?);
            }
        }
        Ok(ordinals)
    }

    fn ordinal(&self, column: &ColumnExpr) -> Result<usize> {
        if column.alias != self.select.alias {
            return Err(QueryError::binding(format!(
                "column {}.{} is not produced by the root select {}",
                column.alias, column.name, self.select.alias
            )));
        }
        self.select.column_index(&column.name).ok_or_else(|| {
            QueryError::binding(format!(
                "root select {} has no column \"{}\"",
                self.select.alias, column.name
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::query::{lambda, lambda2, param, Expr, Queryable};
    use crate::testing::{init_tracing, people, schema, widgets};

    fn translate(dialect: DialectKind, query: Queryable) -> Result<CompiledQuery> {
        init_tracing();
        let schema = schema();
        QueryTranslator::with_dialect(&schema, dialect).translate(query.expr())
    }

    fn price() -> Expr {
        param("w").member("Price")
    }

    #[test]
    fn test_translator_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<QueryTranslator<'static>>();
        assert_send_sync::<CompiledQuery>();
    }

    #[test]
    fn test_translation_is_deterministic() {
        let query = || {
            widgets()
                .filter(lambda("w", price().gt(Expr::constant(2.5))))
                .order_by(lambda("w", param("w").member("Name")))
        };
        let first = translate(DialectKind::Postgres, query()).unwrap();
        let second = translate(DialectKind::Postgres, query()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_chained_filters_match_conjunction() {
        let cheap = || price().gt(Expr::constant(1.5));
        let stocked = || param("w").member("Quantity").ne(Expr::constant(0));
        let chained = translate(
            DialectKind::Sqlite,
            widgets()
                .filter(lambda("w", cheap()))
                .filter(lambda("w", stocked())),
        )
        .unwrap();
        let combined = translate(
            DialectKind::Sqlite,
            widgets().filter(lambda("w", cheap().and(stocked()))),
        )
        .unwrap();
        assert_eq!(chained.reader, combined.reader);
        assert_eq!(chained.parameters, combined.parameters);
        assert!(chained.sql.contains("\"Price\" > @p0"), "{}", chained.sql);
        assert!(chained.sql.contains("\"Quantity\" <> 0"), "{}", chained.sql);
    }

    #[test]
    fn test_sqlite_take_and_skip() {
        let take = translate(DialectKind::Sqlite, widgets().take(5)).unwrap();
        assert!(take.sql.ends_with(" LIMIT 5"), "{}", take.sql);
        let skip = translate(DialectKind::Sqlite, widgets().skip(5)).unwrap();
        assert!(skip.sql.ends_with(" LIMIT -1 OFFSET 5"), "{}", skip.sql);
    }

    #[test]
    fn test_ordered_take_limits_after_ordering() {
        let query = widgets()
            .order_by(lambda("w", param("w").member("Name")))
            .take(5);
        let compiled = translate(DialectKind::Sqlite, query).unwrap();
        assert_eq!(compiled.sql.matches("ORDER BY").count(), 1, "{}", compiled.sql);
        assert!(compiled.sql.ends_with("\"Name\" LIMIT 5"), "{}", compiled.sql);
    }

    #[test]
    fn test_ordered_page_uses_offset_fetch() {
        let query = widgets()
            .order_by(lambda("w", param("w").member("Name")))
            .skip(10)
            .take(5);
        let compiled = translate(DialectKind::Sql92, query).unwrap();
        assert_eq!(compiled.sql.matches("ORDER BY").count(), 1, "{}", compiled.sql);
        assert!(
            compiled
                .sql
                .ends_with("\"Name\" OFFSET 10 ROWS FETCH NEXT 5 ROWS ONLY"),
            "{}",
            compiled.sql
        );
    }

    #[test]
    fn test_take_after_skip_shares_one_select() {
        let query = widgets().skip(10).take(5);
        let compiled = translate(DialectKind::Postgres, query).unwrap();
        assert_eq!(compiled.sql.matches("SELECT").count(), 1, "{}", compiled.sql);
        assert!(compiled.sql.ends_with(" LIMIT 5 OFFSET 10"), "{}", compiled.sql);
    }

    #[test]
    fn test_variables_become_parameters() {
        let query = widgets().filter(lambda("w", price().gt(Expr::variable("min", 2.5))));
        let compiled = translate(DialectKind::Sql92, query).unwrap();
        assert_eq!(compiled.placeholders, vec![Value::Float(2.5)]);
        assert_eq!(compiled.parameters.len(), 1);
        assert_eq!(compiled.parameters[0].value, Value::Float(2.5));
        assert!(compiled.sql.contains("@p0"));
    }

    #[test]
    fn test_insert_identity_suffixes() {
        let insert = || Queryable::insert("Widget", vec![("Name", Expr::constant("bolt"))]);
        let mysql = translate(DialectKind::MySql, insert()).unwrap();
        assert!(mysql.sql.ends_with("; SELECT LAST_INSERT_ID()"), "{}", mysql.sql);
        let sqlite = translate(DialectKind::Sqlite, insert()).unwrap();
        assert!(sqlite.sql.ends_with("; SELECT last_insert_rowid()"), "{}", sqlite.sql);
        assert_eq!(sqlite.reader, ReaderNode::RecordsAffected);
        assert_eq!(sqlite.aggregator, Some(Aggregator::RecordsAffected));
    }

    #[test]
    fn test_explicit_identity_is_not_read_back() {
        let query = Queryable::insert_with_identity(
            "Widget",
            vec![("Id", Expr::constant(9)), ("Name", Expr::constant("bolt"))],
        );
        let compiled = translate(DialectKind::Postgres, query).unwrap();
        assert!(compiled.sql.contains("\"Id\""), "{}", compiled.sql);
        assert!(!compiled.sql.contains("RETURNING"), "{}", compiled.sql);
    }

    #[test]
    fn test_generated_identity_ignores_explicit_value() {
        let query = Queryable::insert(
            "Widget",
            vec![("Id", Expr::constant(9)), ("Name", Expr::constant("bolt"))],
        );
        let compiled = translate(DialectKind::Postgres, query).unwrap();
        assert!(compiled.sql.starts_with("INSERT INTO \"Widgets\" (\"Name\")"), "{}", compiled.sql);
        assert!(compiled.sql.ends_with(" RETURNING \"Id\""), "{}", compiled.sql);
    }

    #[test]
    fn test_record_reader_uses_column_ordinals() {
        let query = widgets().select(lambda(
            "w",
            Expr::record(vec![("Name", param("w").member("Name")), ("Price", price())]),
        ));
        let compiled = translate(DialectKind::Sqlite, query).unwrap();
        let ReaderNode::Record(fields) = &compiled.reader else {
            panic!("expected a record reader");
        };
        assert!(matches!(fields[0].1, ReaderNode::Column { ordinal: 0, .. }));
        assert!(matches!(fields[1].1, ReaderNode::Column { ordinal: 1, .. }));
    }

    #[test]
    fn test_object_reader_has_key() {
        let compiled = translate(DialectKind::Sqlite, widgets()).unwrap();
        let ReaderNode::Object { type_name, key, .. } = &compiled.reader else {
            panic!("expected an object reader");
        };
        assert_eq!(type_name, "Widget");
        assert_eq!(key.len(), 1);
        assert!(compiled.reader.fold_key().is_none());
    }

    #[test]
    fn test_included_collection_folds_by_owner() {
        let query = people().include(lambda("p", param("p").member("Widgets")));
        let compiled = translate(DialectKind::Sqlite, query).unwrap();
        assert!(compiled.reader.fold_key().is_some());
        assert!(compiled.sql.contains("LEFT JOIN"), "{}", compiled.sql);
        assert!(compiled.sql.contains("ORDER BY"), "{}", compiled.sql);
    }

    #[test]
    fn test_ordered_include_keeps_owner_ordering() {
        let query = people()
            .order_by_descending(lambda("p", param("p").member("Name")))
            .include(lambda("p", param("p").member("Widgets")));
        let compiled = translate(DialectKind::Sqlite, query).unwrap();
        assert_eq!(compiled.sql.matches("ORDER BY").count(), 1, "{}", compiled.sql);
        let (_, ordering) = compiled.sql.rsplit_once(" ORDER BY ").unwrap();
        let keys: Vec<&str> = ordering.split(", ").collect();
        assert_eq!(keys.len(), 2, "{}", compiled.sql);
        assert!(keys[0].ends_with("\"Name\" DESC"), "{}", compiled.sql);
        assert!(keys[1].ends_with("\"Id\""), "{}", compiled.sql);
    }

    #[test]
    fn test_group_by_result_selector_aggregates_inline() {
        let query = widgets().group_by_with(
            lambda("w", param("w").member("Category")),
            None,
            Some(lambda2(
                "k",
                "g",
                Expr::record(vec![
                    ("Category", param("k")),
                    (
                        "Total",
                        Queryable::from_expr(param("g"))
                            .sum(lambda("x", param("x").member("Price")))
                            .into_expr(),
                    ),
                ]),
            )),
        );
        let compiled = translate(DialectKind::Sqlite, query).unwrap();
        assert!(compiled.sql.contains("GROUP BY"), "{}", compiled.sql);
        assert!(compiled.sql.contains("SUM("), "{}", compiled.sql);
    }

    #[test]
    fn test_group_aggregate_correlates_null_safely() {
        let query = widgets()
            .group_by(lambda("w", param("w").member("Category")))
            .select(lambda(
                "g",
                Expr::record(vec![
                    ("Category", param("g").member("Key")),
                    (
                        "Total",
                        Queryable::from_expr(param("g"))
                            .sum(lambda("x", param("x").member("Price")))
                            .into_expr(),
                    ),
                ]),
            ));
        let compiled = translate(DialectKind::Sqlite, query).unwrap();
        assert!(compiled.sql.contains("IS NULL"), "{}", compiled.sql);
        assert!(compiled.sql.contains("SUM("), "{}", compiled.sql);
    }

    #[test]
    fn test_root_group_by_needs_result_selector() {
        let err = translate(
            DialectKind::Sqlite,
            widgets().group_by(lambda("w", param("w").member("Category"))),
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedArgument { ref method, .. } if method == "GroupBy"));
    }

    #[test]
    fn test_nested_sequence_at_root_is_unsupported() {
        let err = translate(
            DialectKind::Sqlite,
            people().select(lambda("p", param("p").member("Widgets"))),
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedArgument { .. }));
    }

    #[test]
    fn test_last_needs_order_by_combination() {
        let query = || {
            widgets()
                .order_by(lambda("w", param("w").member("Name")))
                .last()
        };
        let compiled = translate(DialectKind::Sqlite, query()).unwrap();
        assert!(compiled.sql.contains(" DESC"), "{}", compiled.sql);

        let schema = schema();
        let config = TranslatorConfig {
            dialect: DialectKind::Sqlite,
            optimizer: OptimizerConfig {
                order_by_combination: false,
                ..OptimizerConfig::default()
            },
        };
        let err = QueryTranslator::new(&schema, &config)
            .translate(query().expr())
            .unwrap_err();
        assert!(matches!(err, QueryError::Binding(_)));
    }

    #[test]
    fn test_apply_needs_rewrite_on_sqlite() {
        let query = people().select_many(lambda("p", param("p").member("Widgets")), None);
        let compiled = translate(DialectKind::Sqlite, query.clone()).unwrap();
        assert!(compiled.sql.contains(" INNER JOIN "), "{}", compiled.sql);
        let (_, condition) = compiled.sql.split_once(" ON ").unwrap();
        assert!(condition.contains("\"OwnerId\""), "{}", compiled.sql);
        assert!(!compiled.sql.contains("APPLY"), "{}", compiled.sql);
        assert!(!compiled.sql.contains("LATERAL"), "{}", compiled.sql);

        let schema = schema();

        let config = TranslatorConfig {
            dialect: DialectKind::Sqlite,
            optimizer: OptimizerConfig {
                apply_join_rewrite: false,
                ..OptimizerConfig::default()
            },
        };
        let err = QueryTranslator::new(&schema, &config)
            .translate(query.expr())
            .unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedByDialect { dialect: "SQLite", .. }));
    }

    #[test]
    fn test_generated_sql_reparses() {
        use sqlparser::dialect::{MySqlDialect, PostgreSqlDialect};
        use sqlparser::parser::Parser;

        let query = || {
            widgets()
                .filter(lambda(
                    "w",
                    price()
                        .gt(Expr::variable("min", 1.5))
                        .and(param("w").member("Quantity").ne(Expr::constant(0))),
                ))
                .order_by(lambda("w", param("w").member("Name")))
                .skip(10)
                .take(5)
        };
        let mysql = translate(DialectKind::MySql, query()).unwrap();
        assert!(Parser::parse_sql(&MySqlDialect {}, &mysql.sql).is_ok(), "{}", mysql.sql);
        let postgres = translate(DialectKind::Postgres, query()).unwrap();
        assert!(
            Parser::parse_sql(&PostgreSqlDialect {}, &postgres.sql).is_ok(),
            "{}",
            postgres.sql
        );
    }
}
