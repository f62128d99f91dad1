// crates/sqe-core/src/tables.rs
// ============================================================================
// Module: SQE Table Metadata
// Description: Registry of owner/owned table pairs and their column shapes.
// Purpose: Keep table and column names out of caller control so generic SQL
//          can be assembled without string injection.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! Every mutable entity follows the owner/owned convention: an owned data
//! table `<entity>` holding immutable content rows, and an owner table
//! `<entity>_owner` linking rows to editions. This module describes those
//! pairs as validated metadata. The store layer assembles SQL only from
//! registered [`TableSpec`]s, so identifiers reaching SQL text are always
//! drawn from this registry, never from request payloads.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Column Metadata
// ============================================================================

/// Storage class of a content column.
///
/// # Invariants
/// - Variants are stable for schema generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// Signed 64-bit integer column.
    Integer,
    /// Floating-point column.
    Real,
    /// UTF-8 text column.
    Text,
    /// Boolean column (stored as 0/1).
    Boolean,
    /// Geometry column holding normalized WKT text.
    Geometry,
}

/// One content column of an owned table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name (validated identifier).
    pub name: String,
    /// Storage class of the column.
    pub kind: ColumnKind,
}

// ============================================================================
// SECTION: Table Metadata
// ============================================================================

/// Metadata for one owner/owned table pair.
///
/// # Invariants
/// - `name` and all column names satisfy the identifier grammar
///   `[a-z][a-z0-9_]*` and are unique within the table.
/// - The primary key column (`<name>_id`) and the owner table
///   (`<name>_owner`) are derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Owned-table name.
    name: String,
    /// Content columns in declaration order.
    columns: Vec<ColumnSpec>,
}

impl TableSpec {
    /// Builds a table spec, validating all identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`TableRegistryError`] when the table name or a column name
    /// violates the identifier grammar, when no columns are declared, or when
    /// a column name repeats.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnSpec>,
    ) -> Result<Self, TableRegistryError> {
        let name = name.into();
        validate_identifier(&name)?;
        if columns.is_empty() {
            return Err(TableRegistryError::NoColumns {
                table: name,
            });
        }
        for (index, column) in columns.iter().enumerate() {
            validate_identifier(&column.name)?;
            if columns[..index].iter().any(|prior| prior.name == column.name) {
                return Err(TableRegistryError::DuplicateColumn {
                    table: name,
                    column: column.name.clone(),
                });
            }
        }
        Ok(Self {
            name,
            columns,
        })
    }

    /// Returns the owned-table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the content columns in declaration order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Returns the derived primary-key column name (`<table>_id`).
    #[must_use]
    pub fn pk_column(&self) -> String {
        format!("{}_id", self.name)
    }

    /// Returns the derived owner-table name (`<table>_owner`).
    #[must_use]
    pub fn owner_table(&self) -> String {
        format!("{}_owner", self.name)
    }

    /// Looks up a content column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Returns `true` when the named column is geometry-typed.
    #[must_use]
    pub fn is_geometry(&self, name: &str) -> bool {
        self.column(name).is_some_and(|column| column.kind == ColumnKind::Geometry)
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Table registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableRegistryError {
    /// Identifier violates the `[a-z][a-z0-9_]*` grammar.
    #[error("invalid table or column identifier: {identifier}")]
    InvalidIdentifier {
        /// Offending identifier.
        identifier: String,
    },
    /// Owned table declared with no content columns.
    #[error("table {table} declares no content columns")]
    NoColumns {
        /// Offending table name.
        table: String,
    },
    /// Column name repeated within one table.
    #[error("table {table} declares column {column} more than once")]
    DuplicateColumn {
        /// Table name.
        table: String,
        /// Repeated column name.
        column: String,
    },
    /// Table registered twice.
    #[error("table {table} already registered")]
    DuplicateTable {
        /// Offending table name.
        table: String,
    },
}

/// Validates one SQL identifier against the allowed grammar.
fn validate_identifier(identifier: &str) -> Result<(), TableRegistryError> {
    let mut chars = identifier.chars();
    let valid_head = chars.next().is_some_and(|head| head.is_ascii_lowercase());
    let valid_tail =
        chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
    if valid_head && valid_tail {
        Ok(())
    } else {
        Err(TableRegistryError::InvalidIdentifier {
            identifier: identifier.to_string(),
        })
    }
}

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Registry of all owner/owned table pairs known to the mutation engine.
///
/// # Invariants
/// - Table names are unique.
/// - Iteration order is deterministic (sorted by table name).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRegistry {
    /// Registered tables keyed by owned-table name.
    tables: BTreeMap<String, TableSpec>,
}

impl TableRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
        }
    }

    /// Registers a table pair.
    ///
    /// # Errors
    ///
    /// Returns [`TableRegistryError::DuplicateTable`] when the name is
    /// already registered.
    pub fn register(&mut self, spec: TableSpec) -> Result<(), TableRegistryError> {
        if self.tables.contains_key(spec.name()) {
            return Err(TableRegistryError::DuplicateTable {
                table: spec.name().to_string(),
            });
        }
        self.tables.insert(spec.name().to_string(), spec);
        Ok(())
    }

    /// Looks up a registered table by owned-table name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.get(name)
    }

    /// Iterates over registered tables in name order.
    pub fn iter(&self) -> impl Iterator<Item = &TableSpec> {
        self.tables.values()
    }

    /// Returns the number of registered tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns `true` when no tables are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
