//! Type descriptors: the read-only mapping from object types to tables.
//!
//! The binder never discovers schema itself. It asks a
//! [`TypeDescriptorProvider`] for the persisted members, primary keys and
//! relationships of a type. [`Schema`] is an in-memory provider that can
//! be loaded from TOML.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::value::DataType;

/// A persisted scalar member of an object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberDescriptor {
    pub name: String,
    /// Persisted column name. Defaults to the member name.
    #[serde(default)]
    pub column: Option<String>,
    pub data_type: DataType,
    #[serde(default)]
    pub primary_key: bool,
    /// Value assigned by the server on insert.
    #[serde(default)]
    pub auto_increment: bool,
}

impl MemberDescriptor {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            column: None,
            data_type,
            primary_key: false,
            auto_increment: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Many-to-one: this table stores the foreign key.
    Reference,
    /// One-to-many: the target table stores a reference back to this type.
    Collection,
}

/// Constraint deferral mode of a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deferrability {
    #[default]
    NotDeferrable,
    Deferrable,
    InitiallyDeferred,
    InitiallyImmediate,
}

/// A navigation member, resolved by name rather than by object cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub target: String,
    pub kind: RelationshipKind,
    /// For references: local foreign-key columns aligned with the target's
    /// primary key. Defaults to `{name}{KeyMember}`.
    #[serde(default)]
    pub foreign_key: Vec<String>,
    /// For collections: the reference member on the target pointing back.
    #[serde(default)]
    pub back_reference: Option<String>,
    #[serde(default)]
    pub deferrability: Deferrability,
}

impl RelationshipDescriptor {
    pub fn reference(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            kind: RelationshipKind::Reference,
            foreign_key: Vec::new(),
            back_reference: None,
            deferrability: Deferrability::NotDeferrable,
        }
    }

    pub fn collection(name: &str, target: &str, back_reference: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            kind: RelationshipKind::Collection,
            foreign_key: Vec::new(),
            back_reference: Some(back_reference.to_string()),
            deferrability: Deferrability::NotDeferrable,
        }
    }

    pub fn foreign_key(mut self, columns: &[&str]) -> Self {
        self.foreign_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn deferrable(mut self, deferrability: Deferrability) -> Self {
        self.deferrability = deferrability;
        self
    }
}

/// Table mapping of one object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    /// Defaults to the type name.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub members: Vec<MemberDescriptor>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDescriptor>,
}

impl TypeDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table: None,
            members: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn member(mut self, member: MemberDescriptor) -> Self {
        self.members.push(member);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    pub fn primary_keys(&self) -> impl Iterator<Item = &MemberDescriptor> {
        self.members.iter().filter(|m| m.primary_key)
    }

    pub fn find_member(&self, name: &str) -> Option<&MemberDescriptor> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Foreign-key columns of a reference, aligned with the target keys.
    pub fn foreign_key_columns(
        &self,
        relationship: &RelationshipDescriptor,
        target: &TypeDescriptor,
    ) -> Vec<String> {
        if !relationship.foreign_key.is_empty() {
            return relationship.foreign_key.clone();
        }
        target
            .primary_keys()
            .map(|pk| format!("{}{}", relationship.name, pk.name))
            .collect()
    }
}

/// The type descriptor service consumed by the binder.
pub trait TypeDescriptorProvider: Send + Sync {
    fn type_descriptor(&self, type_name: &str) -> Option<&TypeDescriptor>;
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    #[serde(default, rename = "type")]
    types: Vec<TypeDescriptor>,
}

/// In-memory registry of type descriptors.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: HashMap<String, TypeDescriptor>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: TypeDescriptor) {
        self.types.insert(descriptor.name.clone(), descriptor);
    }

    pub fn with_type(mut self, descriptor: TypeDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    /// Parses a schema from `[[type]]` tables.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: SchemaFile = toml::from_str(content).context("Failed to parse schema")?;
        let mut schema = Self::new();
        for descriptor in file.types {
            schema.register(descriptor);
        }
        Ok(schema)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl TypeDescriptorProvider for Schema {
    fn type_descriptor(&self, type_name: &str) -> Option<&TypeDescriptor> {
        self.types.get(type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
[[type]]
name = "Person"
table = "People"

[[type.members]]
name = "Id"
data_type = "Int"
primary_key = true
auto_increment = true

[[type.members]]
name = "Name"
column = "FullName"
data_type = "Text"

[[type.relationships]]
name = "Pets"
target = "Pet"
kind = "collection"
back_reference = "Owner"

[[type]]
name = "Pet"

[[type.members]]
name = "Id"
data_type = "Int"
primary_key = true

[[type.relationships]]
name = "Owner"
target = "Person"
kind = "reference"
deferrability = "initially_deferred"
"#;

    #[test]
    fn test_schema_from_toml() {
        let schema = Schema::from_toml_str(SCHEMA).unwrap();
        assert_eq!(schema.type_names(), vec!["Person", "Pet"]);

        let person = schema.type_descriptor("Person").unwrap();
        assert_eq!(person.table_name(), "People");
        assert_eq!(person.find_member("Name").unwrap().column_name(), "FullName");
        assert_eq!(person.primary_keys().count(), 1);
        assert!(person.find_member("Id").unwrap().auto_increment);
    }

    #[test]
    fn test_default_foreign_key_columns() {
        let schema = Schema::from_toml_str(SCHEMA).unwrap();
        let pet = schema.type_descriptor("Pet").unwrap();
        let person = schema.type_descriptor("Person").unwrap();
        let owner = pet.find_relationship("Owner").unwrap();
        assert_eq!(pet.foreign_key_columns(owner, person), vec!["OwnerId"]);
        assert_eq!(owner.deferrability, Deferrability::InitiallyDeferred);
        assert_eq!(pet.table_name(), "Pet");
    }

    #[test]
    fn test_invalid_schema_reports_context() {
        let err = Schema::from_toml_str("[[type]]\nname = 3").unwrap_err();
        assert!(err.to_string().contains("Failed to parse schema"));
    }
}
