// crates/sqe-store-sqlite/src/lib.rs
// ============================================================================
// Module: SQE SQLite Store
// Description: Transactional mutation engine with append-only versioning.
// Purpose: Execute mutation batches in one permission-checked transaction,
//          audit every physical change, and absorb transient database faults.
// Dependencies: sqe-core, rusqlite, rand, serde, thiserror, tokio
// ============================================================================

//! ## Overview
//! This crate executes [`sqe_core::MutationRequest`] batches against SQLite.
//! Content rows are never updated or deleted in place: every change inserts
//! or re-links owner rows, and every physically altered row is recorded in
//! the append-only `main_action`/`single_action` audit trail. Every database
//! round trip runs through a bounded, randomized retry policy with a
//! process-wide circuit breaker.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod resilient;
pub mod writer;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use resilient::CancelFlag;
pub use resilient::CircuitBreaker;
pub use resilient::CommError;
pub use resilient::RetryConfig;
pub use resilient::RetryError;
pub use resilient::RetryExecutor;
pub use resilient::RetryStatsSnapshot;
pub use resilient::TransientError;
pub use writer::EditorGrant;
pub use writer::MainActionRecord;
pub use writer::MutationWriter;
pub use writer::SingleActionKind;
pub use writer::SingleActionRecord;
pub use writer::WriterConfig;
pub use writer::WriterError;
pub use writer::WriterStatsSnapshot;
