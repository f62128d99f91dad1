// crates/sqe-core/tests/mutation_request_unit.rs
// ============================================================================
// Module: Mutation Request Unit Tests
// Description: Construction-invariant tests for mutation requests.
// Purpose: Validate the action/key rules, the reserved-column guard, and
//          duplicate-assignment rejection before any I/O can occur.
// ============================================================================

//! ## Overview
//! Unit-level tests for mutation request construction:
//! - Update/Delete require the owned-table primary key; Create rejects it
//! - The reserved key is folded into assignments and filtered back out
//! - Duplicate and reserved column assignments are rejected
//! - Create/Update require at least one content column

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use sqe_core::ColumnAssignments;
use sqe_core::ColumnValue;
use sqe_core::MutateAction;
use sqe_core::MutationError;
use sqe_core::MutationRequest;
use sqe_core::OWNED_ID_COLUMN;
use sqe_core::RecordId;

fn sign_assignments() -> ColumnAssignments {
    let mut assignments = ColumnAssignments::new();
    assignments.insert("sign_char", ColumnValue::Text("א".to_string())).unwrap();
    assignments.insert("is_reconstructed", ColumnValue::Boolean(false)).unwrap();
    assignments
}

#[test]
fn create_rejects_primary_key() {
    let error = MutationRequest::new(
        MutateAction::Create,
        "sign",
        sign_assignments(),
        Some(RecordId::from_raw(7).unwrap()),
    )
    .unwrap_err();
    assert_eq!(error, MutationError::PkForbidden);
}

#[test]
fn update_and_delete_require_primary_key() {
    let update = MutationRequest::new(MutateAction::Update, "sign", sign_assignments(), None)
        .unwrap_err();
    assert_eq!(
        update,
        MutationError::PkRequired {
            action: "update"
        }
    );
    let delete =
        MutationRequest::new(MutateAction::Delete, "sign", ColumnAssignments::new(), None)
            .unwrap_err();
    assert_eq!(
        delete,
        MutationError::PkRequired {
            action: "delete"
        }
    );
}

#[test]
fn reserved_column_cannot_be_assigned_directly() {
    let mut assignments = sign_assignments();
    assignments.insert(OWNED_ID_COLUMN, ColumnValue::Integer(3)).unwrap();
    let error =
        MutationRequest::new(MutateAction::Create, "sign", assignments, None).unwrap_err();
    assert_eq!(
        error,
        MutationError::ReservedColumn {
            column: OWNED_ID_COLUMN.to_string()
        }
    );
}

#[test]
fn duplicate_column_assignment_is_rejected() {
    let mut assignments = sign_assignments();
    let error =
        assignments.insert("sign_char", ColumnValue::Text("ב".to_string())).unwrap_err();
    assert_eq!(
        error,
        MutationError::DuplicateColumn {
            column: "sign_char".to_string()
        }
    );
}

#[test]
fn create_and_update_need_content_columns() {
    let empty = MutationRequest::new(MutateAction::Create, "sign", ColumnAssignments::new(), None)
        .unwrap_err();
    assert_eq!(
        empty,
        MutationError::NoColumns {
            action: "create"
        }
    );
    let update = MutationRequest::new(
        MutateAction::Update,
        "sign",
        ColumnAssignments::new(),
        Some(RecordId::from_raw(4).unwrap()),
    )
    .unwrap_err();
    assert_eq!(
        update,
        MutationError::NoColumns {
            action: "update"
        }
    );
}

#[test]
fn primary_key_folds_into_assignments() {
    let pk = RecordId::from_raw(42).unwrap();
    let request =
        MutationRequest::new(MutateAction::Update, "sign", sign_assignments(), Some(pk)).unwrap();
    assert_eq!(request.pk(), Some(pk));
    assert_eq!(
        request.assignments().get(OWNED_ID_COLUMN),
        Some(&ColumnValue::Integer(42))
    );
    // The reserved key never leaks into the content view.
    let content: Vec<&str> = request.content_assignments().map(|(name, _)| name).collect();
    assert_eq!(content, vec!["sign_char", "is_reconstructed"]);
}

#[test]
fn delete_accepts_empty_assignments() {
    let pk = RecordId::from_raw(9).unwrap();
    let request =
        MutationRequest::new(MutateAction::Delete, "sign", ColumnAssignments::new(), Some(pk))
            .unwrap();
    assert_eq!(request.action(), MutateAction::Delete);
    assert_eq!(request.content_assignments().count(), 0);
    assert_eq!(request.assignments().len(), 1);
}
