//! Fixtures shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use crate::error::{QueryError, Result};
use crate::materialize::RowSource;
use crate::query::Queryable;
use crate::schema::{MemberDescriptor, RelationshipDescriptor, Schema, TypeDescriptor};
use crate::value::{DataType, Value};

/// Routes pipeline events to the test writer. Filter with `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Widgets owned by people and stored in shelf slots.
pub fn schema() -> Schema {
    Schema::new()
        .with_type(
            TypeDescriptor::new("Widget")
                .table("Widgets")
                .member(
                    MemberDescriptor::new("Id", DataType::Int)
                        .primary_key()
                        .auto_increment(),
                )
                .member(MemberDescriptor::new("Name", DataType::Text))
                .member(MemberDescriptor::new("Price", DataType::Float))
                .member(MemberDescriptor::new("Quantity", DataType::Int))
                .member(MemberDescriptor::new(
                    "Color",
                    DataType::Enum("Color".into()),
                ))
                .member(MemberDescriptor::new("Category", DataType::Text))
                .member(MemberDescriptor::new(
                    "Discount",
                    DataType::nullable(DataType::Float),
                ))
                .member(MemberDescriptor::new("Created", DataType::DateTime))
                .relationship(RelationshipDescriptor::reference("Owner", "Person"))
                .relationship(RelationshipDescriptor::reference("Slot", "Slot")),
        )
        .with_type(
            TypeDescriptor::new("Person")
                .table("People")
                .member(
                    MemberDescriptor::new("Id", DataType::Int)
                        .primary_key()
                        .auto_increment(),
                )
                .member(MemberDescriptor::new("Name", DataType::Text))
                .member(MemberDescriptor::new("Age", DataType::Int))
                .relationship(RelationshipDescriptor::collection(
                    "Widgets", "Widget", "Owner",
                )),
        )
        .with_type(
            TypeDescriptor::new("Slot")
                .member(MemberDescriptor::new("Shelf", DataType::Int).primary_key())
                .member(MemberDescriptor::new("Position", DataType::Int).primary_key())
                .member(MemberDescriptor::new("Label", DataType::Text)),
        )
}

pub fn widgets() -> Queryable {
    Queryable::source("Widget")
}

pub fn people() -> Queryable {
    Queryable::source("Person")
}

/// An in-memory row source that records when it is released.
pub struct VecRowSource {
    rows: VecDeque<Result<Vec<Value>>>,
    affected: Option<u64>,
    closed: Arc<AtomicBool>,
}

impl VecRowSource {
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        Self {
            rows: rows.into_iter().map(Ok).collect(),
            affected: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Rows followed by one failure.
    pub fn failing_after(rows: Vec<Vec<Value>>) -> Self {
        let mut source = Self::new(rows);
        source
            .rows
            .push_back(Err(QueryError::row_source("connection reset")));
        source
    }

    pub fn with_records_affected(mut self, affected: u64) -> Self {
        self.affected = Some(affected);
        self
    }

    /// A flag that turns true once the source is closed.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl RowSource for VecRowSource {
    fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        self.rows.pop_front().transpose()
    }

    fn records_affected(&self) -> Option<u64> {
        self.affected
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
