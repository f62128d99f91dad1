// crates/sqe-core/src/lib.rs
// ============================================================================
// Module: SQE Core
// Description: Domain model for the SQE collaborative-edition mutation core.
// Purpose: Define identifiers, the mutation protocol, table metadata,
//          permissions, and the shared error taxonomy.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! `sqe-core` carries the backend-agnostic domain model of the SQE mutation
//! subsystem. Every write to edition data is described as a
//! [`MutationRequest`] against a registered owner/owned table pair and
//! answered with an [`AlteredRecord`]. Permission resolution, the error
//! taxonomy shared by HTTP and realtime transports, and the table metadata
//! registry all live here; the transactional engine that executes requests
//! lives in `sqe-store-sqlite`.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod error;
pub mod identifiers;
pub mod mutation;
pub mod permissions;
pub mod tables;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use error::ApiError;
pub use error::ErrorEnvelope;
pub use identifiers::EditionEditorId;
pub use identifiers::EditionId;
pub use identifiers::RecordId;
pub use identifiers::UserId;
pub use mutation::AlteredRecord;
pub use mutation::ColumnAssignments;
pub use mutation::ColumnValue;
pub use mutation::MutateAction;
pub use mutation::MutationError;
pub use mutation::MutationRequest;
pub use mutation::OWNED_ID_COLUMN;
pub use permissions::EditionPermissions;
pub use permissions::PermissionGate;
pub use permissions::UserInfo;
pub use tables::ColumnKind;
pub use tables::ColumnSpec;
pub use tables::TableRegistry;
pub use tables::TableRegistryError;
pub use tables::TableSpec;
