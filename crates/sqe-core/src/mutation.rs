// crates/sqe-core/src/mutation.rs
// ============================================================================
// Module: SQE Mutation Protocol
// Description: Table-agnostic mutation requests and their results.
// Purpose: Describe one intended Create/Update/Delete against an owner/owned
//          table pair, with construction-time invariants.
// Dependencies: serde, thiserror, crate::identifiers, crate::tables
// ============================================================================

//! ## Overview
//! A [`MutationRequest`] is a self-describing intent to change which values
//! an edition owns: `Create` links new content, `Update` re-links an edition
//! from one owned row to another, `Delete` unlinks. Content columns travel as
//! an ordered [`ColumnAssignments`] map of tagged [`ColumnValue`]s; the
//! column list is always derived from the assignment keys, never supplied
//! separately. Invariants that would otherwise surface mid-transaction are
//! enforced at construction.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::identifiers::RecordId;
use crate::tables::ColumnKind;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Reserved assignment key holding the owned-table primary key for
/// `Update`/`Delete` requests. Folded in by [`MutationRequest::new`]; callers
/// may not assign it themselves.
pub const OWNED_ID_COLUMN: &str = "owned_table_id";

// ============================================================================
// SECTION: Actions and Values
// ============================================================================

/// The kind of change a mutation request describes.
///
/// # Invariants
/// - Variants are stable for audit labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutateAction {
    /// Link new owned content to the edition.
    Create,
    /// Re-link the edition from an existing owned row to new content.
    Update,
    /// Unlink an owned row from the edition.
    Delete,
}

impl MutateAction {
    /// Returns a stable label for the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A tagged column value.
///
/// Geometry values carry WKT text; the store layer applies one shared
/// normalization before binding so that identical shapes dedup to the same
/// owned row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnValue {
    /// Signed integer value.
    Integer(i64),
    /// Floating-point value.
    Real(f64),
    /// UTF-8 text value.
    Text(String),
    /// Boolean value.
    Boolean(bool),
    /// Geometry value as WKT text.
    Geometry(String),
}

impl ColumnValue {
    /// Returns the column kind this value satisfies.
    #[must_use]
    pub const fn kind(&self) -> ColumnKind {
        match self {
            Self::Integer(_) => ColumnKind::Integer,
            Self::Real(_) => ColumnKind::Real,
            Self::Text(_) => ColumnKind::Text,
            Self::Boolean(_) => ColumnKind::Boolean,
            Self::Geometry(_) => ColumnKind::Geometry,
        }
    }
}

// ============================================================================
// SECTION: Column Assignments
// ============================================================================

/// Ordered mapping from column name to value.
///
/// # Invariants
/// - Column names are unique; insertion order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnAssignments {
    /// Ordered (column, value) pairs.
    entries: Vec<(String, ColumnValue)>,
}

impl ColumnAssignments {
    /// Creates an empty assignment set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts a column assignment, rejecting duplicate column names.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError::DuplicateColumn`] when the column is already
    /// assigned.
    pub fn insert(
        &mut self,
        column: impl Into<String>,
        value: ColumnValue,
    ) -> Result<(), MutationError> {
        let column = column.into();
        if self.get(&column).is_some() {
            return Err(MutationError::DuplicateColumn {
                column,
            });
        }
        self.entries.push((column, value));
        Ok(())
    }

    /// Returns the value assigned to a column, if any.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.entries.iter().find(|(name, _)| name == column).map(|(_, value)| value)
    }

    /// Returns the assigned column names in insertion order.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Iterates over (column, value) pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Returns the number of assignments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no columns are assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while constructing mutation requests.
///
/// All of these fire before any I/O occurs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MutationError {
    /// Update/Delete without the primary key of the row to act on.
    #[error("{action} mutation requires the owned-table primary key")]
    PkRequired {
        /// Action label that was missing its key.
        action: &'static str,
    },
    /// Create with a primary key (the key is assigned by the database).
    #[error("create mutation must not carry an owned-table primary key")]
    PkForbidden,
    /// Caller assigned the reserved primary-key column directly.
    #[error("column name {column} is reserved")]
    ReservedColumn {
        /// Offending column name.
        column: String,
    },
    /// Column assigned more than once.
    #[error("column {column} assigned more than once")]
    DuplicateColumn {
        /// Offending column name.
        column: String,
    },
    /// Create/Update with no content columns at all.
    #[error("{action} mutation requires at least one content column")]
    NoColumns {
        /// Action label that was missing content.
        action: &'static str,
    },
    /// Primary key does not fit the signed 64-bit storage class.
    #[error("owned-table primary key {pk} out of range")]
    PkOutOfRange {
        /// Offending key value.
        pk: u64,
    },
}

// ============================================================================
// SECTION: Mutation Request
// ============================================================================

/// One intended Create/Update/Delete against a registered owner/owned table
/// pair.
///
/// # Invariants
/// - `Update`/`Delete` always carry the primary key of the owned row whose
///   link is affected; `Create` never does.
/// - The reserved key [`OWNED_ID_COLUMN`] appears in the assignments exactly
///   when a primary key was supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// The kind of change requested.
    action: MutateAction,
    /// Registered owned-table name the request targets.
    table: String,
    /// Primary key of the owned row whose link is affected.
    pk: Option<RecordId>,
    /// Content column assignments plus the folded-in reserved key.
    assignments: ColumnAssignments,
}

impl MutationRequest {
    /// Builds a mutation request, enforcing the action/key invariants.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError`] when the key is missing for Update/Delete,
    /// present for Create, when the reserved key was assigned directly, or
    /// when Create/Update carry no content columns.
    pub fn new(
        action: MutateAction,
        table: impl Into<String>,
        mut assignments: ColumnAssignments,
        table_pk_id: Option<RecordId>,
    ) -> Result<Self, MutationError> {
        if assignments.get(OWNED_ID_COLUMN).is_some() {
            return Err(MutationError::ReservedColumn {
                column: OWNED_ID_COLUMN.to_string(),
            });
        }
        match action {
            MutateAction::Create => {
                if table_pk_id.is_some() {
                    return Err(MutationError::PkForbidden);
                }
            }
            MutateAction::Update | MutateAction::Delete => {
                if table_pk_id.is_none() {
                    return Err(MutationError::PkRequired {
                        action: action.as_str(),
                    });
                }
            }
        }
        if matches!(action, MutateAction::Create | MutateAction::Update) && assignments.is_empty()
        {
            return Err(MutationError::NoColumns {
                action: action.as_str(),
            });
        }
        if let Some(pk) = table_pk_id {
            let raw = i64::try_from(pk.get()).map_err(|_| MutationError::PkOutOfRange {
                pk: pk.get(),
            })?;
            assignments.insert(OWNED_ID_COLUMN, ColumnValue::Integer(raw))?;
        }
        Ok(Self {
            action,
            table: table.into(),
            pk: table_pk_id,
            assignments,
        })
    }

    /// Returns the requested action.
    #[must_use]
    pub const fn action(&self) -> MutateAction {
        self.action
    }

    /// Returns the target owned-table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the owned-row primary key, when the action carries one.
    #[must_use]
    pub const fn pk(&self) -> Option<RecordId> {
        self.pk
    }

    /// Returns the column assignments, reserved key included.
    #[must_use]
    pub const fn assignments(&self) -> &ColumnAssignments {
        &self.assignments
    }

    /// Iterates over the content assignments, skipping the reserved key.
    pub fn content_assignments(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.assignments.iter().filter(|(name, _)| *name != OWNED_ID_COLUMN)
    }
}

// ============================================================================
// SECTION: Altered Record
// ============================================================================

/// Result of one executed mutation request.
///
/// # Invariants
/// - `old_id` is present for Update/Delete results; `new_id` for
///   Create/Update results.
/// - The writer returns altered records in the same order as the input
///   requests; callers correlate positionally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlteredRecord {
    /// Owned-table name the mutation targeted.
    pub table: String,
    /// Primary key the edition was linked to before the mutation.
    pub old_id: Option<RecordId>,
    /// Primary key the edition is linked to after the mutation.
    pub new_id: Option<RecordId>,
}

impl AlteredRecord {
    /// Result of a Create: only a new id.
    #[must_use]
    pub fn created(table: impl Into<String>, new_id: RecordId) -> Self {
        Self {
            table: table.into(),
            old_id: None,
            new_id: Some(new_id),
        }
    }

    /// Result of an Update: both ids.
    #[must_use]
    pub fn updated(table: impl Into<String>, old_id: RecordId, new_id: RecordId) -> Self {
        Self {
            table: table.into(),
            old_id: Some(old_id),
            new_id: Some(new_id),
        }
    }

    /// Result of a Delete: only the old id.
    #[must_use]
    pub fn deleted(table: impl Into<String>, old_id: RecordId) -> Self {
        Self {
            table: table.into(),
            old_id: Some(old_id),
            new_id: None,
        }
    }
}
