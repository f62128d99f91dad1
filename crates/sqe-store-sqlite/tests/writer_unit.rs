// crates/sqe-store-sqlite/tests/writer_unit.rs
// ============================================================================
// Module: Mutation Writer Unit Tests
// Description: Transactional behavior tests for the mutation engine.
// Purpose: Validate batch atomicity, content dedup, non-destructive updates,
//          the permission and lock gates, and batch result ordering.
// ============================================================================

//! ## Overview
//! Unit-level tests for the mutation writer:
//! - Identical content dedups to one owned row, across editions
//! - Updates re-link the edition and never destroy old content
//! - A failing request aborts the whole batch, audit rows included
//! - Results preserve input order; empty batches are no-ops
//! - Write access requires enrollment, write capability, and an unlocked
//!   edition (admins write through locks)

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::num::NonZeroU64;
use std::path::Path;

use rusqlite::Connection;
use sqe_core::ApiError;
use sqe_core::ColumnAssignments;
use sqe_core::ColumnKind;
use sqe_core::ColumnSpec;
use sqe_core::ColumnValue;
use sqe_core::MutateAction;
use sqe_core::MutationRequest;
use sqe_core::RecordId;
use sqe_core::TableRegistry;
use sqe_core::TableSpec;
use sqe_core::UserId;
use sqe_core::UserInfo;
use sqe_store_sqlite::EditorGrant;
use sqe_store_sqlite::MutationWriter;
use sqe_store_sqlite::RetryConfig;
use sqe_store_sqlite::WriterConfig;
use sqe_store_sqlite::WriterError;
use tempfile::TempDir;

fn user(raw: u64) -> UserId {
    UserId::new(NonZeroU64::new(raw).unwrap())
}

fn registry() -> TableRegistry {
    let mut registry = TableRegistry::new();
    registry
        .register(
            TableSpec::new(
                "sign",
                vec![
                    ColumnSpec {
                        name: "sign_char".to_string(),
                        kind: ColumnKind::Text,
                    },
                    ColumnSpec {
                        name: "is_reconstructed".to_string(),
                        kind: ColumnKind::Boolean,
                    },
                ],
            )
            .unwrap(),
        )
        .unwrap();
    registry
}

fn open_writer(dir: &TempDir) -> MutationWriter {
    let config = WriterConfig {
        path: dir.path().join("sqe.db"),
        busy_timeout_ms: 5_000,
        retry: RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_jitter_ms: 0,
            breaker_threshold: 5,
        },
    };
    MutationWriter::open(config, registry()).unwrap()
}

fn create_sign(text: &str) -> MutationRequest {
    let mut assignments = ColumnAssignments::new();
    assignments.insert("sign_char", ColumnValue::Text(text.to_string())).unwrap();
    assignments.insert("is_reconstructed", ColumnValue::Boolean(false)).unwrap();
    MutationRequest::new(MutateAction::Create, "sign", assignments, None).unwrap()
}

fn update_sign(old: RecordId, text: &str) -> MutationRequest {
    let mut assignments = ColumnAssignments::new();
    assignments.insert("sign_char", ColumnValue::Text(text.to_string())).unwrap();
    assignments.insert("is_reconstructed", ColumnValue::Boolean(false)).unwrap();
    MutationRequest::new(MutateAction::Update, "sign", assignments, Some(old)).unwrap()
}

fn delete_sign(old: RecordId) -> MutationRequest {
    MutationRequest::new(MutateAction::Delete, "sign", ColumnAssignments::new(), Some(old))
        .unwrap()
}

fn count_rows(path: &Path, table: &str) -> i64 {
    let conn = Connection::open(path).unwrap();
    let sql = format!("SELECT COUNT(*) FROM {table}");
    conn.query_row(&sql, [], |row| row.get(0)).unwrap()
}

#[test]
fn identical_content_dedups_to_one_owned_row() {
    let dir = TempDir::new().unwrap();
    let writer = open_writer(&dir);
    let alice = writer.create_edition(user(1)).unwrap();
    let bob = writer.create_edition(user(2)).unwrap();
    let alice_ctx = UserInfo::new(user(1), alice);
    let bob_ctx = UserInfo::new(user(2), bob);

    let first = writer.write_mutations(&alice_ctx, &[create_sign("א")]).unwrap();
    let second = writer.write_mutations(&bob_ctx, &[create_sign("א")]).unwrap();
    assert_eq!(first[0].new_id, second[0].new_id);
    assert_eq!(count_rows(&dir.path().join("sqe.db"), "sign"), 1);
    assert_eq!(count_rows(&dir.path().join("sqe.db"), "sign_owner"), 2);
}

#[test]
fn relinking_owned_content_twice_is_a_conflict() {
    let dir = TempDir::new().unwrap();
    let writer = open_writer(&dir);
    let edition = writer.create_edition(user(1)).unwrap();
    let ctx = UserInfo::new(user(1), edition);

    writer.write_mutations(&ctx, &[create_sign("א")]).unwrap();
    let error = writer.write_mutations(&ctx, &[create_sign("א")]).unwrap_err();
    assert!(matches!(
        error,
        WriterError::Api(ApiError::Conflict { .. })
    ));
}

#[test]
fn update_relinks_without_destroying_old_content() {
    let dir = TempDir::new().unwrap();
    let writer = open_writer(&dir);
    let edition = writer.create_edition(user(1)).unwrap();
    let ctx = UserInfo::new(user(1), edition);

    let created = writer.write_mutations(&ctx, &[create_sign("א")]).unwrap();
    let old_id = created[0].new_id.unwrap();
    let updated = writer.write_mutations(&ctx, &[update_sign(old_id, "ב")]).unwrap();
    assert_eq!(updated[0].old_id, Some(old_id));
    let new_id = updated[0].new_id.unwrap();
    assert_ne!(old_id, new_id);

    // The old content row survives; only the owner link moved.
    let db = dir.path().join("sqe.db");
    assert_eq!(count_rows(&db, "sign"), 2);
    assert_eq!(count_rows(&db, "sign_owner"), 1);
    let records = writer.edition_records(&ctx, "sign").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, new_id);
    assert_eq!(
        records[0].1.get("sign_char"),
        Some(&ColumnValue::Text("ב".to_string()))
    );
}

#[test]
fn failing_request_aborts_the_whole_batch() {
    let dir = TempDir::new().unwrap();
    let writer = open_writer(&dir);
    let edition = writer.create_edition(user(1)).unwrap();
    let ctx = UserInfo::new(user(1), edition);

    let missing = RecordId::from_raw(999).unwrap();
    let error = writer
        .write_mutations(&ctx, &[create_sign("א"), delete_sign(missing)])
        .unwrap_err();
    assert!(matches!(
        error,
        WriterError::Api(ApiError::NotFound { .. })
    ));
    // Nothing from the batch survives, audit rows included.
    let db = dir.path().join("sqe.db");
    assert_eq!(count_rows(&db, "sign"), 0);
    assert_eq!(count_rows(&db, "sign_owner"), 0);
    assert_eq!(count_rows(&db, "main_action"), 0);
    assert_eq!(count_rows(&db, "single_action"), 0);
    assert_eq!(writer.stats().batches_aborted, 1);
}

#[test]
fn results_preserve_input_order() {
    let dir = TempDir::new().unwrap();
    let writer = open_writer(&dir);
    let edition = writer.create_edition(user(1)).unwrap();
    let ctx = UserInfo::new(user(1), edition);

    let batch = [create_sign("א"), create_sign("ב"), create_sign("ג")];
    let results = writer.write_mutations(&ctx, &batch).unwrap();
    assert_eq!(results.len(), 3);
    let ids: Vec<RecordId> = results.iter().map(|record| record.new_id.unwrap()).collect();
    let listed = writer.edition_records(&ctx, "sign").unwrap();
    let listed_ids: Vec<RecordId> = listed.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, listed_ids);
}

#[test]
fn empty_batch_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let writer = open_writer(&dir);
    let edition = writer.create_edition(user(1)).unwrap();
    let ctx = UserInfo::new(user(1), edition);

    let results = writer.write_mutations(&ctx, &[]).unwrap();
    assert!(results.is_empty());
    assert_eq!(count_rows(&dir.path().join("sqe.db"), "main_action"), 0);
    assert_eq!(writer.stats().batches_committed, 0);
}

#[test]
fn unenrolled_and_read_only_users_cannot_write() {
    let dir = TempDir::new().unwrap();
    let writer = open_writer(&dir);
    let edition = writer.create_edition(user(1)).unwrap();
    let admin = UserInfo::new(user(1), edition);

    let stranger = UserInfo::new(user(7), edition);
    let error = writer.write_mutations(&stranger, &[create_sign("א")]).unwrap_err();
    assert!(matches!(
        error,
        WriterError::Api(ApiError::Forbidden { .. })
    ));

    writer
        .grant_editor(
            &admin,
            user(8),
            EditorGrant {
                may_read: true,
                may_write: false,
                may_lock: false,
                is_admin: false,
            },
        )
        .unwrap();
    let reader = UserInfo::new(user(8), edition);
    let error = writer.write_mutations(&reader, &[create_sign("א")]).unwrap_err();
    assert!(matches!(
        error,
        WriterError::Api(ApiError::Forbidden { .. })
    ));
    // Reading still works for the read-only grant.
    assert!(writer.edition_records(&reader, "sign").unwrap().is_empty());
}

#[test]
fn locked_edition_rejects_non_admin_writers() {
    let dir = TempDir::new().unwrap();
    let writer = open_writer(&dir);
    let edition = writer.create_edition(user(1)).unwrap();
    let admin = UserInfo::new(user(1), edition);

    writer
        .grant_editor(
            &admin,
            user(2),
            EditorGrant {
                may_read: true,
                may_write: true,
                may_lock: false,
                is_admin: false,
            },
        )
        .unwrap();
    writer.lock_edition(&admin).unwrap();

    let editor = UserInfo::new(user(2), edition);
    let error = writer.write_mutations(&editor, &[create_sign("א")]).unwrap_err();
    assert!(matches!(error, WriterError::Api(ApiError::Locked { .. })));

    // Admins write through the lock; unlocking restores the editor.
    writer.write_mutations(&admin, &[create_sign("ב")]).unwrap();
    writer.unlock_edition(&admin).unwrap();
    writer.write_mutations(&editor, &[create_sign("ג")]).unwrap();

    // The lock capability itself is enforced.
    let error = writer.lock_edition(&editor).unwrap_err();
    assert!(matches!(
        error,
        WriterError::Api(ApiError::Forbidden { .. })
    ));
}

#[test]
fn unknown_tables_and_mistyped_values_are_bad_input() {
    let dir = TempDir::new().unwrap();
    let writer = open_writer(&dir);
    let edition = writer.create_edition(user(1)).unwrap();
    let ctx = UserInfo::new(user(1), edition);

    let mut assignments = ColumnAssignments::new();
    assignments.insert("sign_char", ColumnValue::Text("א".to_string())).unwrap();
    let unknown_table =
        MutationRequest::new(MutateAction::Create, "papyrus", assignments, None).unwrap();
    let error = writer.write_mutations(&ctx, &[unknown_table]).unwrap_err();
    assert!(matches!(
        error,
        WriterError::Api(ApiError::BadInput { .. })
    ));

    let mut mistyped = ColumnAssignments::new();
    mistyped.insert("sign_char", ColumnValue::Integer(3)).unwrap();
    mistyped.insert("is_reconstructed", ColumnValue::Boolean(true)).unwrap();
    let request = MutationRequest::new(MutateAction::Create, "sign", mistyped, None).unwrap();
    let error = writer.write_mutations(&ctx, &[request]).unwrap_err();
    assert!(matches!(
        error,
        WriterError::Api(ApiError::BadInput { .. })
    ));

    let mut partial = ColumnAssignments::new();
    partial.insert("sign_char", ColumnValue::Text("א".to_string())).unwrap();
    let request = MutationRequest::new(MutateAction::Create, "sign", partial, None).unwrap();
    let error = writer.write_mutations(&ctx, &[request]).unwrap_err();
    assert!(matches!(
        error,
        WriterError::Api(ApiError::BadInput { .. })
    ));
}

#[test]
fn reopening_preserves_schema_and_data() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("sqe.db");
    let (edition, id) = {
        let writer = open_writer(&dir);
        let edition = writer.create_edition(user(1)).unwrap();
        let ctx = UserInfo::new(user(1), edition);
        let results = writer.write_mutations(&ctx, &[create_sign("א")]).unwrap();
        (edition, results[0].new_id.unwrap())
    };
    let writer = open_writer(&dir);
    let ctx = UserInfo::new(user(1), edition);
    let (found, columns) = writer.edition_record(&ctx, "sign", id).unwrap();
    assert_eq!(found, id);
    assert_eq!(
        columns.get("sign_char"),
        Some(&ColumnValue::Text("א".to_string()))
    );
    assert_eq!(count_rows(&db, "schema_meta"), 1);
}
