/// SQL text generation.
///
/// Renders an optimized SQL tree into statement text plus the ordered list
/// of parameter values, in a single forward pass over a [`SqlWriter`].
/// Everything backend specific is asked of the [`Dialect`].
///
/// NULL, booleans and integers are written inline. Every other constant and
/// every placeholder becomes a parameter, in order of appearance.
use tracing::debug;

use crate::error::{QueryError, Result};
use crate::query::{AggregateKind, OrderDirection};
use crate::schema::{RelationshipDescriptor, RelationshipKind, TypeDescriptor};
use crate::value::{DataType, Value};

use super::dialect::{Dialect, FunctionSyntax, IdentityRetrieval, Paging};
use super::types::*;

/// One bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: Value,
    /// The persisted type. Enums are typed by their underlying integer.
    pub data_type: DataType,
}

/// Statement text plus its parameters, in marker order.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedQuery {
    pub sql: String,
    pub parameters: Vec<Parameter>,
}

/// Formats SQL trees for one dialect.
pub struct Formatter<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> Formatter<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    /// Format a statement: a projection, a select or a mutation.
    pub fn format(&self, expr: &SqlExpr) -> Result<FormattedQuery> {
        let mut writer = SqlWriter::new(self.dialect);
        writer.statement(expr)?;
        let (sql, parameters) = writer.finish();
        debug!(
            dialect = self.dialect.name(),
            parameters = parameters.len(),
            sql = %sql,
            "formatted query"
        );
        Ok(FormattedQuery { sql, parameters })
    }

    /// `FOREIGN KEY (...) REFERENCES target (...)` for a reference, with the
    /// dialect's deferral clause.
    pub fn format_references(
        &self,
        owner: &TypeDescriptor,
        relationship: &RelationshipDescriptor,
        target: &TypeDescriptor,
    ) -> Result<String> {
        if relationship.kind != RelationshipKind::Reference {
            return Err(QueryError::binding(format!(
                "\"{}\" is a collection and has no foreign key",
                relationship.name
            )));
        }
        let quote = |names: Vec<String>| {
            names
                .iter()
                .map(|n| self.dialect.quote_identifier(n))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let columns = quote(owner.foreign_key_columns(relationship, target));
        let keys = quote(
            target
                .primary_keys()
                .map(|k| k.column_name().to_string())
                .collect(),
        );
        let mut sql = format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            columns,
            self.dialect.quote_identifier(target.table_name()),
            keys
        );
        if let Some(clause) = self.dialect.deferrability(relationship.deferrability) {
            sql.push(' ');
            sql.push_str(clause);
        }
        Ok(sql)
    }
}

/// Output buffer plus the running parameter list.
struct SqlWriter<'d> {
    dialect: &'d dyn Dialect,
    sql: String,
    parameters: Vec<Parameter>,
    /// `(alias, table)` of the UPDATE or DELETE being written.
    mutation_table: Option<(String, String)>,
}

impl<'d> SqlWriter<'d> {
    fn new(dialect: &'d dyn Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            parameters: Vec::new(),
            mutation_table: None,
        }
    }

    fn finish(self) -> (String, Vec<Parameter>) {
        (self.sql, self.parameters)
    }

    fn push(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn push_identifier(&mut self, ident: &str) {
        let quoted = self.dialect.quote_identifier(ident);
        self.sql.push_str(&quoted);
    }

    fn push_parameter(&mut self, value: Value) {
        let marker = self.dialect.parameter_marker(self.parameters.len());
        self.sql.push_str(&marker);
        let data_type = value.data_type().underlying();
        self.parameters.push(Parameter { value, data_type });
    }

    fn push_literal(&mut self, value: bool) {
        let literal = self.dialect.boolean_literal(value);
        self.push(literal);
    }

    fn comma_separated<T>(
        &mut self,
        items: &[T],
        mut f: impl FnMut(&mut Self, &T) -> Result<()>,
    ) -> Result<()> {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            f(self, item)?;
        }
        Ok(())
    }

    fn statement(&mut self, expr: &SqlExpr) -> Result<()> {
        match expr {
            SqlExpr::Projection(p) => self.select_statement(&p.select),
            SqlExpr::Select(s) => self.select_statement(s),
            SqlExpr::Insert(_) | SqlExpr::Update(_) | SqlExpr::Delete(_) => self.mutation(expr),
            other => Err(QueryError::binding(format!(
                "cannot format a {} as a statement",
                other.kind_name()
            ))),
        }
    }

    /// A select wrapping a mutation is the mutation itself.
    fn select_statement(&mut self, select: &SelectExpr) -> Result<()> {
        match &select.from {
            Some(mutation @ (SqlExpr::Insert(_) | SqlExpr::Update(_) | SqlExpr::Delete(_))) => {
                self.mutation(mutation)
            }
            _ => self.select(select),
        }
    }

    fn select(&mut self, select: &SelectExpr) -> Result<()> {
        if select.reverse {
            return Err(QueryError::binding(
                "reversed ordering was not resolved before formatting",
            ));
        }
        self.push("SELECT ");
        if select.distinct {
            self.push("DISTINCT ");
        }
        if select.columns.is_empty() {
            self.push("NULL");
        }
        self.comma_separated(&select.columns, |w, column| {
            w.value(&column.expr)?;
            let same_name = matches!(&column.expr, SqlExpr::Column(c) if c.name == column.name);
            if !same_name {
                w.push(" AS ");
                w.push_identifier(&column.name);
            }
            Ok(())
        })?;

        if let Some(from) = &select.from {
            self.push(" FROM ");
            self.source(from)?;
        }
        if let Some(predicate) = &select.where_clause {
            self.push(" WHERE ");
            self.predicate(predicate)?;
        }
        if !select.group_by.is_empty() {
            self.push(" GROUP BY ");
            self.comma_separated(&select.group_by, |w, e| w.value(e))?;
        }
        // constants in ORDER BY would read as column ordinals
        let orderings: Vec<&OrderByExpr> = select
            .order_by
            .iter()
            .filter(|o| !matches!(o.expr, SqlExpr::Constant(_) | SqlExpr::Placeholder { .. }))
            .collect();
        if !orderings.is_empty() {
            self.push(" ORDER BY ");
            self.comma_separated(&orderings, |w, o| {
                w.value(&o.expr)?;
                if o.direction == OrderDirection::Descending {
                    w.push(" DESC");
                }
                Ok(())
            })?;
        }
        self.paging(select.skip.as_ref(), select.take.as_ref())?;
        if select.for_update {
            if !self.dialect.supports_for_update() {
                return Err(self.dialect.unsupported("FOR UPDATE"));
            }
            self.push(" FOR UPDATE");
        }
        Ok(())
    }

    fn paging(&mut self, skip: Option<&SqlExpr>, take: Option<&SqlExpr>) -> Result<()> {
        match self.dialect.paging() {
            Paging::LimitOffset { no_limit } => {
                match (take, no_limit) {
                    (Some(take), _) => {
                        self.push(" LIMIT ");
                        self.value(take)?;
                    }
                    (None, Some(sentinel)) if skip.is_some() => {
                        self.push(" LIMIT ");
                        self.push(sentinel);
                    }
                    _ => {}
                }
                if let Some(skip) = skip {
                    self.push(" OFFSET ");
                    self.value(skip)?;
                }
            }
            Paging::OffsetFetch => {
                if skip.is_none() && take.is_none() {
                    return Ok(());
                }
                self.push(" OFFSET ");
                match skip {
                    Some(skip) => self.value(skip)?,
                    None => self.push("0"),
                }
                self.push(" ROWS");
                if let Some(take) = take {
                    self.push(" FETCH NEXT ");
                    self.value(take)?;
                    self.push(" ROWS ONLY");
                }
            }
        }
        Ok(())
    }

    /// A `FROM` item.
    fn source(&mut self, source: &SqlExpr) -> Result<()> {
        match source {
            SqlExpr::Table(table) => {
                self.push_identifier(&table.name);
                self.push(" AS ");
                self.push(&table.alias);
            }
            SqlExpr::Select(select) => {
                self.push("(");
                self.select(select)?;
                self.push(") AS ");
                self.push(&select.alias);
            }
            SqlExpr::Union(union) => {
                self.push("(");
                self.union_side(&union.left)?;
                self.push(if union.all { " UNION ALL " } else { " UNION " });
                self.union_side(&union.right)?;
                self.push(") AS ");
                self.push(&union.alias);
            }
            SqlExpr::Join(join) => self.join(join)?,
            other => {
                return Err(QueryError::binding(format!(
                    "cannot use a {} as a source",
                    other.kind_name()
                )))
            }
        }
        Ok(())
    }

    fn union_side(&mut self, side: &SelectExpr) -> Result<()> {
        if side.order_by.is_empty() && side.skip.is_none() && side.take.is_none() {
            return self.select(side);
        }
        self.push("SELECT * FROM (");
        self.select(side)?;
        self.push(") AS ");
        self.push(&side.alias);
        Ok(())
    }

    fn join(&mut self, join: &JoinExpr) -> Result<()> {
        let keyword = self.dialect.join_keyword(join.kind)?;
        self.source(&join.left)?;
        self.push(" ");
        self.push(keyword);
        self.push(" ");
        if let SqlExpr::Join(_) = join.right {
            self.push("(");
            self.source(&join.right)?;
            self.push(")");
        } else {
            self.source(&join.right)?;
        }
        match (join.kind, &join.condition) {
            (JoinKind::Cross | JoinKind::CrossApply, None) => {}
            (_, Some(condition)) => {
                self.push(" ON ");
                self.predicate(condition)?;
            }
            (_, None) => {
                self.push(" ON ");
                self.predicate(&SqlExpr::Constant(Value::Bool(true)))?;
            }
        }
        Ok(())
    }

    fn mutation(&mut self, mutation: &SqlExpr) -> Result<()> {
        match mutation {
            SqlExpr::Insert(insert) => {
                self.push("INSERT INTO ");
                self.push_identifier(&insert.table.name);
                if insert.columns.is_empty() {
                    self.push(" ");
                    self.push(self.dialect.default_values());
                } else {
                    self.push(" (");
                    self.comma_separated(&insert.columns, |w, c| {
                        w.push_identifier(c);
                        Ok(())
                    })?;
                    self.push(") VALUES (");
                    self.comma_separated(&insert.values, |w, v| w.value(v))?;
                    self.push(")");
                }
                if !insert.returning.is_empty() {
                    match self.dialect.identity_retrieval() {
                        IdentityRetrieval::None => {}
                        IdentityRetrieval::Statement(statement) => self.push(statement),
                        IdentityRetrieval::Returning => {
                            self.push(" RETURNING ");
                            self.comma_separated(&insert.returning, |w, c| {
                                w.push_identifier(c);
                                Ok(())
                            })?;
                        }
                    }
                }
            }
            SqlExpr::Update(update) => {
                self.mutation_table = Some((update.table.alias.clone(), update.table.name.clone()));
                self.push("UPDATE ");
                self.push_identifier(&update.table.name);
                self.push(" SET ");
                self.comma_separated(&update.assignments, |w, a| {
                    w.push_identifier(&a.column);
                    w.push(" = ");
                    w.value(&a.value)
                })?;
                if let Some(predicate) = &update.where_clause {
                    self.push(" WHERE ");
                    self.predicate(predicate)?;
                }
                self.mutation_table = None;
            }
            SqlExpr::Delete(delete) => {
                self.mutation_table = Some((delete.table.alias.clone(), delete.table.name.clone()));
                self.push("DELETE FROM ");
                self.push_identifier(&delete.table.name);
                if let Some(predicate) = &delete.where_clause {
                    self.push(" WHERE ");
                    self.predicate(predicate)?;
                }
                self.mutation_table = None;
            }
            other => {
                return Err(QueryError::binding(format!(
                    "{} is not a mutation",
                    other.kind_name()
                )))
            }
        }
        Ok(())
    }

    /// An expression where a value is expected.
    fn value(&mut self, expr: &SqlExpr) -> Result<()> {
        if is_predicate(expr) && !self.dialect.predicates_are_values() {
            self.push("CASE WHEN ");
            self.expr(expr)?;
            self.push(" THEN ");
            self.push_literal(true);
            self.push(" ELSE ");
            self.push_literal(false);
            self.push(" END");
            return Ok(());
        }
        self.expr(expr)
    }

    /// An expression where a condition is expected.
    fn predicate(&mut self, expr: &SqlExpr) -> Result<()> {
        if is_predicate(expr) {
            return self.expr(expr);
        }
        match expr {
            SqlExpr::Constant(Value::Bool(b)) if self.dialect.predicates_are_values() => {
                self.push_literal(*b);
            }
            SqlExpr::Constant(Value::Bool(b)) => self.push(if *b { "1 = 1" } else { "1 = 0" }),
            other => {
                self.push("(");
                self.value(other)?;
                self.push(" = ");
                self.push_literal(true);
                self.push(")");
            }
        }
        Ok(())
    }

    fn expr(&mut self, expr: &SqlExpr) -> Result<()> {
        match expr {
            SqlExpr::Column(column) => {
                match &self.mutation_table {
                    Some((alias, table)) if *alias == column.alias => {
                        let table = table.clone();
                        self.push_identifier(&table);
                    }
                    _ => self.push(&column.alias),
                }
                self.push(".");
                self.push_identifier(&column.name);
            }
            SqlExpr::Constant(value) => self.constant(value)?,
            SqlExpr::Placeholder { value, .. } => self.push_parameter(value.clone()),
            SqlExpr::Binary { op, left, right } => {
                self.push("(");
                if op.is_logical() {
                    self.predicate(left)?;
                    self.push(binary_operator(*op));
                    self.predicate(right)?;
                } else {
                    self.value(left)?;
                    self.push(binary_operator(*op));
                    self.value(right)?;
                }
                self.push(")");
            }
            SqlExpr::Unary {
                op: UnaryOperator::Not,
                operand,
            } => {
                self.push("NOT (");
                self.predicate(operand)?;
                self.push(")");
            }
            SqlExpr::Unary {
                op: UnaryOperator::Minus,
                operand,
            } => {
                self.push("(-");
                self.value(operand)?;
                self.push(")");
            }
            SqlExpr::Convert { operand, data_type } => {
                let from = operand.data_type().underlying();
                if from.unwrap_nullable() == data_type.underlying().unwrap_nullable() {
                    return self.value(operand);
                }
                let type_name = self.dialect.type_name(data_type)?;
                self.push("CAST(");
                self.value(operand)?;
                self.push(" AS ");
                self.push(type_name);
                self.push(")");
            }
            SqlExpr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                self.push("CASE WHEN ");
                self.predicate(test)?;
                self.push(" THEN ");
                self.value(if_true)?;
                self.push(" ELSE ");
                self.value(if_false)?;
                self.push(" END");
            }
            SqlExpr::FunctionCall { function, args, .. } => self.function(*function, args)?,
            SqlExpr::Aggregate(aggregate) => self.aggregate(aggregate)?,
            SqlExpr::Subquery(select) | SqlExpr::Select(select) => self.subquery(select)?,
            SqlExpr::Projection(projection) => self.subquery(&projection.select)?,
            SqlExpr::Tuple(items) => {
                self.push("(");
                self.comma_separated(items, |w, e| w.value(e))?;
                self.push(")");
            }
            other => {
                return Err(QueryError::binding(format!(
                    "cannot format a {} as SQL",
                    other.kind_name()
                )))
            }
        }
        Ok(())
    }

    fn subquery(&mut self, select: &SelectExpr) -> Result<()> {
        self.push("(");
        self.select(select)?;
        self.push(")");
        Ok(())
    }

    fn constant(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.push("NULL"),
            Value::Bool(b) => self.push_literal(*b),
            Value::Int(i) => self.push(&i.to_string()),
            Value::List(_) | Value::Record(_) | Value::Object { .. } => {
                return Err(QueryError::binding(format!(
                    "a {} constant has no SQL form",
                    value.data_type()
                )))
            }
            other => self.push_parameter(other.clone()),
        }
        Ok(())
    }

    fn function(&mut self, function: SqlFunction, args: &[SqlExpr]) -> Result<()> {
        match function {
            SqlFunction::In | SqlFunction::NotIn => return self.membership(function, args),
            SqlFunction::Exists => {
                self.push("EXISTS ");
                let [query] = args else {
                    return Err(QueryError::binding("EXISTS takes one subquery"));
                };
                return self.expr(query);
            }
            SqlFunction::RecordsAffected => {
                return Err(QueryError::binding(
                    "the affected-record count is read from the row source",
                ))
            }
            _ => {}
        }
        match self.dialect.function(function, args.len())? {
            FunctionSyntax::Call(name) => {
                self.push(name);
                self.push("(");
                self.comma_separated(args, |w, e| w.value(e))?;
                self.push(")");
            }
            FunctionSyntax::Infix(op) => {
                self.push("(");
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        self.push(" ");
                        self.push(op);
                        self.push(" ");
                    }
                    self.value(arg)?;
                }
                self.push(")");
            }
            FunctionSyntax::Postfix(op) => {
                let [operand] = args else {
                    return Err(QueryError::binding(format!("{} takes one argument", op)));
                };
                self.push("(");
                self.value(operand)?;
                self.push(" ");
                self.push(op);
                self.push(")");
            }
            FunctionSyntax::Keyword(keyword) => self.push(keyword),
            FunctionSyntax::Template(template) => self.template(template, args)?,
        }
        Ok(())
    }

    /// Writes `template`, replacing each `{n}` by argument `n`.
    fn template(&mut self, template: &str, args: &[SqlExpr]) -> Result<()> {
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            self.push(&rest[..start]);
            let end = rest[start..]
                .find('}')
                .map(|offset| start + offset)
                .ok_or_else(|| QueryError::binding(format!("malformed template {}", template)))?;
            let arg = rest[start + 1..end]
                .parse::<usize>()
                .ok()
                .and_then(|index| args.get(index))
                .ok_or_else(|| {
                    QueryError::binding(format!(
                        "template {} does not fit {} arguments",
                        template,
                        args.len()
                    ))
                })?;
            self.value(arg)?;
            rest = &rest[end + 1..];
        }
        self.push(rest);
        Ok(())
    }

    fn membership(&mut self, function: SqlFunction, args: &[SqlExpr]) -> Result<()> {
        let [item, collection] = args else {
            return Err(QueryError::binding("IN takes an item and a collection"));
        };
        let negated = function == SqlFunction::NotIn;
        let keyword = if negated { " NOT IN (" } else { " IN (" };
        match collection {
            SqlExpr::Constant(Value::List(values)) | SqlExpr::Placeholder { value: Value::List(values), .. } => {
                if values.is_empty() {
                    // nothing is a member of an empty list
                    return self.predicate(&SqlExpr::Constant(Value::Bool(negated)));
                }
                let as_parameters = matches!(collection, SqlExpr::Placeholder { .. });
                self.push("(");
                self.value(item)?;
                self.push(keyword);
                self.comma_separated(values, |w, v| {
                    if as_parameters {
                        w.push_parameter(v.clone());
                        Ok(())
                    } else {
                        w.constant(v)
                    }
                })?;
                self.push("))");
            }
            SqlExpr::Subquery(select) | SqlExpr::Select(select) => {
                self.push("(");
                self.value(item)?;
                self.push(keyword);
                self.select(select)?;
                self.push("))");
            }
            SqlExpr::Projection(projection) => {
                self.push("(");
                self.value(item)?;
                self.push(keyword);
                self.select(&projection.select)?;
                self.push("))");
            }
            other => {
                return Err(QueryError::binding(format!(
                    "cannot test membership in a {}",
                    other.kind_name()
                )))
            }
        }
        Ok(())
    }

    fn aggregate(&mut self, aggregate: &AggregateExpr) -> Result<()> {
        let name = match aggregate.kind {
            AggregateKind::Count | AggregateKind::LongCount => "COUNT",
            AggregateKind::Min => "MIN",
            AggregateKind::Max => "MAX",
            AggregateKind::Sum => "SUM",
            AggregateKind::Average => "AVG",
        };
        self.push(name);
        self.push("(");
        if aggregate.distinct {
            self.push("DISTINCT ");
        }
        match &aggregate.argument {
            Some(argument) => self.value(argument)?,
            None => self.push("*"),
        }
        self.push(")");
        Ok(())
    }
}

fn binary_operator(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::Eq => " = ",
        BinaryOperator::NotEq => " <> ",
        BinaryOperator::Lt => " < ",
        BinaryOperator::LtEq => " <= ",
        BinaryOperator::Gt => " > ",
        BinaryOperator::GtEq => " >= ",
        BinaryOperator::And => " AND ",
        BinaryOperator::Or => " OR ",
        BinaryOperator::Plus => " + ",
        BinaryOperator::Minus => " - ",
        BinaryOperator::Multiply => " * ",
        BinaryOperator::Divide => " / ",
        BinaryOperator::Modulo => " % ",
    }
}

/// Whether `expr` is a condition rather than a value in SQL.
fn is_predicate(expr: &SqlExpr) -> bool {
    match expr {
        SqlExpr::Binary { op, .. } => op.is_comparison() || op.is_logical(),
        SqlExpr::Unary {
            op: UnaryOperator::Not,
            ..
        } => true,
        SqlExpr::FunctionCall { function, .. } => matches!(
            function,
            SqlFunction::IsNull
                | SqlFunction::IsNotNull
                | SqlFunction::In
                | SqlFunction::NotIn
                | SqlFunction::Exists
                | SqlFunction::Like
                | SqlFunction::NotLike
                | SqlFunction::ContainsString
                | SqlFunction::StartsWith
                | SqlFunction::EndsWith
        ),
        _ => false,
    }
}
