/// Query translation pipeline.
///
/// ```text
/// Operator tree           (crate::query)
///       ↓
/// Partial evaluation      (evaluator.rs)
///       ↓
/// Binding                 (binder/, projector.rs)
///       ↓
/// SQL expression tree     (types.rs)
///       ↓
/// Optimization passes     (optimizer.rs)
///       ↓
/// Dialect formatting      (formatter.rs, dialect.rs)
///       ↓
/// Compiled query + reader (compiler.rs)
/// ```
///
/// Execution is up to the caller; results are read back by
/// `crate::materialize`.
pub mod binder;
pub mod compiler;
pub mod dialect;
pub mod evaluator;
pub mod formatter;
pub mod optimizer;
pub mod projector;
pub mod types;

// Re-export key types for convenience
pub use binder::Binder;
pub use compiler::{CompiledQuery, QueryTranslator, ReaderNode};
pub use dialect::{Dialect, DialectKind};
pub use evaluator::{partial_eval, Evaluated};
pub use formatter::{FormattedQuery, Formatter, Parameter};
pub use optimizer::{OptimizationPass, Optimizer};
pub use types::*;
