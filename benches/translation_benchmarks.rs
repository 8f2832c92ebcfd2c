//! Benchmarks for the translation pipeline.
//!
//! Benchmarks cover:
//! - binding (operator tree → SQL expression tree)
//! - optimization passes
//! - formatting per dialect
//! - full translation and materialization
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use querybind::ast::{partial_eval, Binder, DialectKind, Formatter, Optimizer, QueryTranslator};
use querybind::materialize::{ObjectProjector, RowSource};
use querybind::query::{lambda, lambda2, param, Expr, Queryable};
use querybind::schema::Schema;
use querybind::value::Value;

const SCHEMA: &str = r#"
[[type]]
name = "Customer"
table = "Customers"

[[type.members]]
name = "Id"
data_type = "Int"
primary_key = true
auto_increment = true

[[type.members]]
name = "Name"
data_type = "Text"

[[type.members]]
name = "City"
data_type = "Text"

[[type.relationships]]
name = "Orders"
target = "Order"
kind = "collection"
back_reference = "Customer"

[[type]]
name = "Order"
table = "Orders"

[[type.members]]
name = "Id"
data_type = "Int"
primary_key = true
auto_increment = true

[[type.members]]
name = "Total"
data_type = "Float"

[[type.members]]
name = "Placed"
data_type = "DateTime"

[[type.relationships]]
name = "Customer"
target = "Customer"
kind = "reference"
"#;

// ---------------------------------------------------------------------------
// Queries organized by complexity
// ---------------------------------------------------------------------------

fn customers() -> Queryable {
    Queryable::source("Customer")
}

fn orders() -> Queryable {
    Queryable::source("Order")
}

fn cases() -> Vec<(&'static str, Queryable)> {
    vec![
        ("table", customers()),
        (
            "filter_order_page",
            customers()
                .filter(lambda("c", param("c").member("City").eq(Expr::variable("city", "Oslo"))))
                .order_by(lambda("c", param("c").member("Name")))
                .skip(20)
                .take(10),
        ),
        (
            "join",
            orders().join(
                customers(),
                lambda("o", param("o").member("Customer").member("Id")),
                lambda("c", param("c").member("Id")),
                lambda2(
                    "o",
                    "c",
                    Expr::record(vec![
                        ("Customer", param("c").member("Name")),
                        ("Total", param("o").member("Total")),
                    ]),
                ),
            ),
        ),
        (
            "group_by",
            orders().group_by_with(
                lambda("o", param("o").member("Customer").member("Id")),
                None,
                Some(lambda2(
                    "k",
                    "g",
                    Expr::record(vec![
                        ("Customer", param("k")),
                        (
                            "Total",
                            Queryable::from_expr(param("g"))
                                .sum(lambda("x", param("x").member("Total")))
                                .into_expr(),
                        ),
                    ]),
                )),
            ),
        ),
        (
            "include",
            customers().include(lambda("c", param("c").member("Orders"))),
        ),
        ("count", orders().count()),
        (
            "update",
            orders()
                .filter(lambda("o", param("o").member("Total").lt(Expr::constant(0.0))))
                .update("o", vec![("Total", Expr::constant(0.0))]),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Benchmark groups
// ---------------------------------------------------------------------------

fn bench_binding(c: &mut Criterion) {
    let schema = Schema::from_toml_str(SCHEMA).unwrap();
    let mut group = c.benchmark_group("binding");

    for (name, query) in cases() {
        let evaluated = partial_eval(query.expr()).unwrap();
        group.bench_with_input(BenchmarkId::new("bind", name), &evaluated.expr, |b, expr| {
            b.iter(|| Binder::bind(black_box(expr), &schema).unwrap());
        });
    }

    group.finish();
}

fn bench_optimization(c: &mut Criterion) {
    let schema = Schema::from_toml_str(SCHEMA).unwrap();
    let optimizer = Optimizer::with_defaults();
    let mut group = c.benchmark_group("optimization");

    for (name, query) in cases() {
        let evaluated = partial_eval(query.expr()).unwrap();
        let bound = Binder::bind(&evaluated.expr, &schema).unwrap();
        group.bench_with_input(BenchmarkId::new("optimize", name), &bound, |b, bound| {
            b.iter(|| optimizer.optimize(black_box(bound.clone().into())).unwrap());
        });
    }

    group.finish();
}

fn bench_formatting(c: &mut Criterion) {
    let schema = Schema::from_toml_str(SCHEMA).unwrap();
    let optimizer = Optimizer::with_defaults();
    let mut group = c.benchmark_group("formatting");

    for (name, query) in cases() {
        let evaluated = partial_eval(query.expr()).unwrap();
        let bound = Binder::bind(&evaluated.expr, &schema).unwrap();
        let optimized = optimizer.optimize(bound.into()).unwrap();
        for kind in [DialectKind::Sqlite, DialectKind::MySql, DialectKind::Postgres] {
            let formatter = Formatter::new(kind.dialect());
            let id = BenchmarkId::new(format!("{:?}", kind), name);
            group.bench_with_input(id, &optimized, |b, tree| {
                b.iter(|| formatter.format(black_box(tree)).unwrap());
            });
        }
    }

    group.finish();
}

fn bench_translation(c: &mut Criterion) {
    let schema = Schema::from_toml_str(SCHEMA).unwrap();
    let translator = QueryTranslator::with_dialect(&schema, DialectKind::Postgres);
    let mut group = c.benchmark_group("translation");

    for (name, query) in cases() {
        group.bench_with_input(BenchmarkId::new("translate", name), &query, |b, query| {
            b.iter(|| translator.translate(black_box(query.expr())).unwrap());
        });
    }

    group.finish();
}

/// Rows repeated from memory.
struct RepeatRows {
    row: Vec<Value>,
    remaining: usize,
}

impl RowSource for RepeatRows {
    fn next_row(&mut self) -> querybind::Result<Option<Vec<Value>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(self.row.clone()))
    }
}

fn bench_materialization(c: &mut Criterion) {
    let schema = Schema::from_toml_str(SCHEMA).unwrap();
    let translator = QueryTranslator::with_dialect(&schema, DialectKind::Sqlite);
    let query = customers().select(lambda(
        "c",
        Expr::record(vec![
            ("Id", param("c").member("Id")),
            ("Name", param("c").member("Name")),
            ("City", param("c").member("City")),
        ]),
    ));
    let compiled = translator.translate(query.expr()).unwrap();
    let row = vec![
        Value::Int(1),
        Value::Text("Ada".into()),
        Value::Text("Oslo".into()),
    ];

    let mut group = c.benchmark_group("materialization");
    for count in [100usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("records", count), &count, |b, &count| {
            b.iter(|| {
                let source = RepeatRows {
                    row: row.clone(),
                    remaining: count,
                };
                ObjectProjector::new(&compiled, source)
                    .rows::<Value>()
                    .count()
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_binding,
    bench_optimization,
    bench_formatting,
    bench_translation,
    bench_materialization,
);
criterion_main!(benches);
