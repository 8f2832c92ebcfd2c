//! SQL dialects: the per-backend override table used by the formatter.
//!
//! The [`Dialect`] trait defaults to SQL92 spelling. Each backend overrides
//! only what it spells differently: quoting, parameter markers, function
//! shapes, joins, paging, identity retrieval and constraint syntax.

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::schema::Deferrability;
use crate::value::DataType;

use super::types::{JoinKind, SqlFunction};

/// How a function call is spelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionSyntax {
    /// `NAME(a, b, ...)`
    Call(&'static str),
    /// `(a OP b OP ...)`
    Infix(&'static str),
    /// `(a OP)`
    Postfix(&'static str),
    /// `NAME` with no parentheses.
    Keyword(&'static str),
    /// Text where `{n}` is replaced by argument `n`.
    Template(&'static str),
}

/// How `LIMIT`/`OFFSET` are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    /// `LIMIT t OFFSET s`. A skip without a take needs the `no_limit`
    /// sentinel when the backend requires `LIMIT` before `OFFSET`.
    LimitOffset { no_limit: Option<&'static str> },
    /// `OFFSET s ROWS FETCH NEXT t ROWS ONLY`
    OffsetFetch,
}

/// How server-generated keys are read back after an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRetrieval {
    None,
    /// A statement appended after the insert.
    Statement(&'static str),
    /// A `RETURNING` clause naming the generated columns.
    Returning,
}

/// A target SQL backend.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Marker of the `index`-th (zero-based) parameter.
    fn parameter_marker(&self, index: usize) -> String {
        format!("@p{}", index)
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    /// Whether a predicate may be used where a value is expected.
    fn predicates_are_values(&self) -> bool {
        false
    }

    fn function(&self, function: SqlFunction, arity: usize) -> Result<FunctionSyntax> {
        Ok(match function {
            SqlFunction::IsNull => FunctionSyntax::Postfix("IS NULL"),
            SqlFunction::IsNotNull => FunctionSyntax::Postfix("IS NOT NULL"),
            SqlFunction::Like => FunctionSyntax::Infix("LIKE"),
            SqlFunction::NotLike => FunctionSyntax::Infix("NOT LIKE"),
            SqlFunction::Concat => FunctionSyntax::Infix("||"),
            SqlFunction::Coalesce => FunctionSyntax::Call("COALESCE"),
            SqlFunction::StringLength => FunctionSyntax::Call("CHAR_LENGTH"),
            SqlFunction::ContainsString => FunctionSyntax::Template("({0} LIKE '%' || {1} || '%')"),
            SqlFunction::StartsWith => FunctionSyntax::Template("({0} LIKE {1} || '%')"),
            SqlFunction::EndsWith => FunctionSyntax::Template("({0} LIKE '%' || {1})"),
            SqlFunction::Substring if arity == 2 => {
                FunctionSyntax::Template("SUBSTRING({0} FROM {1})")
            }
            SqlFunction::Substring => FunctionSyntax::Template("SUBSTRING({0} FROM {1} FOR {2})"),
            SqlFunction::Trim => FunctionSyntax::Call("TRIM"),
            SqlFunction::TrimLeft => FunctionSyntax::Template("TRIM(LEADING FROM {0})"),
            SqlFunction::TrimRight => FunctionSyntax::Template("TRIM(TRAILING FROM {0})"),
            SqlFunction::Upper => FunctionSyntax::Call("UPPER"),
            SqlFunction::Lower => FunctionSyntax::Call("LOWER"),
            SqlFunction::ServerNow | SqlFunction::ServerUtcNow => {
                FunctionSyntax::Keyword("CURRENT_TIMESTAMP")
            }
            SqlFunction::Year => FunctionSyntax::Template("EXTRACT(YEAR FROM {0})"),
            SqlFunction::Month => FunctionSyntax::Template("EXTRACT(MONTH FROM {0})"),
            SqlFunction::DayOfMonth => FunctionSyntax::Template("EXTRACT(DAY FROM {0})"),
            SqlFunction::Hour => FunctionSyntax::Template("EXTRACT(HOUR FROM {0})"),
            SqlFunction::Minute => FunctionSyntax::Template("EXTRACT(MINUTE FROM {0})"),
            SqlFunction::Second => FunctionSyntax::Template("EXTRACT(SECOND FROM {0})"),
            SqlFunction::Date => FunctionSyntax::Template("CAST({0} AS DATE)"),
            SqlFunction::Week | SqlFunction::DayOfYear | SqlFunction::DayOfWeek => {
                return Err(self.unsupported(function.name()))
            }
            // formatted structurally or evaluated host-side
            SqlFunction::In
            | SqlFunction::NotIn
            | SqlFunction::Exists
            | SqlFunction::RecordsAffected => return Err(self.unsupported(function.name())),
        })
    }

    fn join_keyword(&self, kind: JoinKind) -> Result<&'static str> {
        match kind {
            JoinKind::Cross => Ok("CROSS JOIN"),
            JoinKind::Inner => Ok("INNER JOIN"),
            JoinKind::Left => Ok("LEFT OUTER JOIN"),
            JoinKind::CrossApply | JoinKind::OuterApply => {
                Err(self.unsupported("CROSS APPLY and OUTER APPLY"))
            }
        }
    }

    fn paging(&self) -> Paging {
        Paging::OffsetFetch
    }

    fn supports_for_update(&self) -> bool {
        true
    }

    fn identity_retrieval(&self) -> IdentityRetrieval {
        IdentityRetrieval::None
    }

    /// Constraint deferral clause, `None` when the backend has none.
    fn deferrability(&self, deferrability: Deferrability) -> Option<&'static str> {
        Some(match deferrability {
            Deferrability::NotDeferrable => "NOT DEFERRABLE",
            Deferrability::Deferrable => "DEFERRABLE",
            Deferrability::InitiallyDeferred => "DEFERRABLE INITIALLY DEFERRED",
            Deferrability::InitiallyImmediate => "DEFERRABLE INITIALLY IMMEDIATE",
        })
    }

    /// Tail of an insert that assigns no columns.
    fn default_values(&self) -> &'static str {
        "DEFAULT VALUES"
    }

    /// Type name used in `CAST(x AS ...)`.
    fn type_name(&self, data_type: &DataType) -> Result<&'static str> {
        match data_type.underlying().unwrap_nullable() {
            DataType::Bool => Ok("BOOLEAN"),
            DataType::Int => Ok("INTEGER"),
            DataType::Float => Ok("DOUBLE PRECISION"),
            DataType::Text => Ok("VARCHAR(4000)"),
            DataType::DateTime => Ok("TIMESTAMP"),
            other => Err(QueryError::binding(format!("cannot convert to {}", other))),
        }
    }

    fn unsupported(&self, feature: &str) -> QueryError {
        QueryError::UnsupportedByDialect {
            dialect: self.name(),
            feature: feature.to_string(),
        }
    }
}

/// The supported backends, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    #[default]
    Sql92,
    Sqlite,
    MySql,
    Postgres,
}

impl DialectKind {
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            DialectKind::Sql92 => &Sql92,
            DialectKind::Sqlite => &Sqlite,
            DialectKind::MySql => &MySql,
            DialectKind::Postgres => &Postgres,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sql92;

impl Dialect for Sql92 {
    fn name(&self) -> &'static str {
        "SQL92"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

/// `CAST(STRFTIME('<format>', x) AS INTEGER)`
macro_rules! strftime {
    ($format:literal) => {
        FunctionSyntax::Template(concat!("CAST(STRFTIME('", $format, "', {0}) AS INTEGER)"))
    };
}

impl Dialect for Sqlite {
    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn predicates_are_values(&self) -> bool {
        true
    }

    fn function(&self, function: SqlFunction, arity: usize) -> Result<FunctionSyntax> {
        Ok(match function {
            SqlFunction::StringLength => FunctionSyntax::Call("LENGTH"),
            SqlFunction::Substring => FunctionSyntax::Call("SUBSTR"),
            SqlFunction::TrimLeft => FunctionSyntax::Call("LTRIM"),
            SqlFunction::TrimRight => FunctionSyntax::Call("RTRIM"),
            SqlFunction::ServerNow => FunctionSyntax::Template("DATETIME('now', 'localtime')"),
            SqlFunction::ServerUtcNow => FunctionSyntax::Template("DATETIME('now')"),
            SqlFunction::Year => strftime!("%Y"),
            SqlFunction::Month => strftime!("%m"),
            SqlFunction::Week => strftime!("%W"),
            SqlFunction::DayOfYear => strftime!("%j"),
            SqlFunction::DayOfMonth => strftime!("%d"),
            SqlFunction::DayOfWeek => strftime!("%w"),
            SqlFunction::Hour => strftime!("%H"),
            SqlFunction::Minute => strftime!("%M"),
            SqlFunction::Second => strftime!("%S"),
            SqlFunction::Date => FunctionSyntax::Call("DATE"),
            other => return Sql92.function(other, arity),
        })
    }

    fn join_keyword(&self, kind: JoinKind) -> Result<&'static str> {
        match kind {
            JoinKind::Left => Ok("LEFT JOIN"),
            other => Sql92.join_keyword(other).map_err(|_| self.unsupported("CROSS APPLY and OUTER APPLY")),
        }
    }

    fn paging(&self) -> Paging {
        Paging::LimitOffset {
            no_limit: Some("-1"),
        }
    }

    fn supports_for_update(&self) -> bool {
        false
    }

    fn identity_retrieval(&self) -> IdentityRetrieval {
        IdentityRetrieval::Statement("; SELECT last_insert_rowid()")
    }

    fn type_name(&self, data_type: &DataType) -> Result<&'static str> {
        match data_type.underlying().unwrap_nullable() {
            DataType::Bool | DataType::Int => Ok("INTEGER"),
            DataType::Float => Ok("REAL"),
            DataType::Text | DataType::DateTime => Ok("TEXT"),
            _ => Sql92.type_name(data_type),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySql;

impl Dialect for MySql {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn parameter_marker(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn predicates_are_values(&self) -> bool {
        true
    }

    fn function(&self, function: SqlFunction, arity: usize) -> Result<FunctionSyntax> {
        Ok(match function {
            SqlFunction::Concat => FunctionSyntax::Call("CONCAT"),
            SqlFunction::ContainsString => FunctionSyntax::Template("({0} LIKE CONCAT('%', {1}, '%'))"),
            SqlFunction::StartsWith => FunctionSyntax::Template("({0} LIKE CONCAT({1}, '%'))"),
            SqlFunction::EndsWith => FunctionSyntax::Template("({0} LIKE CONCAT('%', {1}))"),
            SqlFunction::Substring => FunctionSyntax::Call("SUBSTRING"),
            SqlFunction::TrimLeft => FunctionSyntax::Call("LTRIM"),
            SqlFunction::TrimRight => FunctionSyntax::Call("RTRIM"),
            SqlFunction::ServerNow => FunctionSyntax::Call("NOW"),
            SqlFunction::ServerUtcNow => FunctionSyntax::Call("UTC_TIMESTAMP"),
            SqlFunction::Year => FunctionSyntax::Call("YEAR"),
            SqlFunction::Month => FunctionSyntax::Call("MONTH"),
            SqlFunction::Week => FunctionSyntax::Call("WEEK"),
            SqlFunction::DayOfYear => FunctionSyntax::Call("DAYOFYEAR"),
            SqlFunction::DayOfMonth => FunctionSyntax::Call("DAY"),
            SqlFunction::DayOfWeek => FunctionSyntax::Template("(DAYOFWEEK({0}) - 1)"),
            SqlFunction::Hour => FunctionSyntax::Call("HOUR"),
            SqlFunction::Minute => FunctionSyntax::Call("MINUTE"),
            SqlFunction::Second => FunctionSyntax::Call("SECOND"),
            SqlFunction::Date => FunctionSyntax::Call("DATE"),
            other => return Sql92.function(other, arity),
        })
    }

    fn join_keyword(&self, kind: JoinKind) -> Result<&'static str> {
        match kind {
            JoinKind::CrossApply => Ok("CROSS JOIN LATERAL"),
            JoinKind::OuterApply => Ok("LEFT OUTER JOIN LATERAL"),
            other => Sql92.join_keyword(other),
        }
    }

    fn paging(&self) -> Paging {
        Paging::LimitOffset {
            no_limit: Some("18446744073709551615"),
        }
    }

    fn identity_retrieval(&self) -> IdentityRetrieval {
        IdentityRetrieval::Statement("; SELECT LAST_INSERT_ID()")
    }

    fn deferrability(&self, _deferrability: Deferrability) -> Option<&'static str> {
        None
    }

    fn default_values(&self) -> &'static str {
        "VALUES ()"
    }

    fn type_name(&self, data_type: &DataType) -> Result<&'static str> {
        match data_type.underlying().unwrap_nullable() {
            DataType::Bool | DataType::Int => Ok("SIGNED"),
            DataType::Float => Ok("DOUBLE"),
            DataType::Text => Ok("CHAR"),
            DataType::DateTime => Ok("DATETIME"),
            _ => Sql92.type_name(data_type),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn parameter_marker(&self, index: usize) -> String {
        format!("${}", index + 1)
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    fn predicates_are_values(&self) -> bool {
        true
    }

    fn function(&self, function: SqlFunction, arity: usize) -> Result<FunctionSyntax> {
        Ok(match function {
            SqlFunction::StringLength => FunctionSyntax::Call("LENGTH"),
            SqlFunction::TrimLeft => FunctionSyntax::Call("LTRIM"),
            SqlFunction::TrimRight => FunctionSyntax::Call("RTRIM"),
            SqlFunction::ServerNow => FunctionSyntax::Call("NOW"),
            SqlFunction::ServerUtcNow => FunctionSyntax::Template("(NOW() AT TIME ZONE 'UTC')"),
            SqlFunction::Year => FunctionSyntax::Template("CAST(EXTRACT(YEAR FROM {0}) AS INTEGER)"),
            SqlFunction::Month => FunctionSyntax::Template("CAST(EXTRACT(MONTH FROM {0}) AS INTEGER)"),
            SqlFunction::Week => FunctionSyntax::Template("CAST(EXTRACT(WEEK FROM {0}) AS INTEGER)"),
            SqlFunction::DayOfYear => FunctionSyntax::Template("CAST(EXTRACT(DOY FROM {0}) AS INTEGER)"),
            SqlFunction::DayOfMonth => FunctionSyntax::Template("CAST(EXTRACT(DAY FROM {0}) AS INTEGER)"),
            SqlFunction::DayOfWeek => FunctionSyntax::Template("CAST(EXTRACT(DOW FROM {0}) AS INTEGER)"),
            SqlFunction::Hour => FunctionSyntax::Template("CAST(EXTRACT(HOUR FROM {0}) AS INTEGER)"),
            SqlFunction::Minute => FunctionSyntax::Template("CAST(EXTRACT(MINUTE FROM {0}) AS INTEGER)"),
            SqlFunction::Second => FunctionSyntax::Template("CAST(EXTRACT(SECOND FROM {0}) AS INTEGER)"),
            other => return Sql92.function(other, arity),
        })
    }

    fn join_keyword(&self, kind: JoinKind) -> Result<&'static str> {
        match kind {
            JoinKind::CrossApply => Ok("CROSS JOIN LATERAL"),
            JoinKind::OuterApply => Ok("LEFT OUTER JOIN LATERAL"),
            other => Sql92.join_keyword(other),
        }
    }

    fn paging(&self) -> Paging {
        Paging::LimitOffset { no_limit: None }
    }

    fn identity_retrieval(&self) -> IdentityRetrieval {
        IdentityRetrieval::Returning
    }

    fn type_name(&self, data_type: &DataType) -> Result<&'static str> {
        match data_type.underlying().unwrap_nullable() {
            DataType::Int => Ok("BIGINT"),
            DataType::Text => Ok("TEXT"),
            _ => Sql92.type_name(data_type),
        }
    }
}
