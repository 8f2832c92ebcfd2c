//! Composable query operator trees translated to SQL.
//!
//! A query is built with [`query::Queryable`], translated once by
//! [`ast::QueryTranslator`] into a [`ast::CompiledQuery`] for one dialect,
//! executed by the caller, and read back with
//! [`materialize::ObjectProjector`].

pub mod ast;
pub mod config;
pub mod error;
pub mod materialize;
pub mod query;
pub mod schema;
pub mod value;

#[cfg(test)]
mod testing;

pub use error::{QueryError, Result};
