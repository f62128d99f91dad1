// crates/sqe-core/src/permissions.rs
// ============================================================================
// Module: SQE Permission Gate
// Description: Per-request, per-edition capability resolution.
// Purpose: Resolve whether the acting user may read/write/lock/admin the
//          edition, once per request, cached for its lifetime.
// Dependencies: serde, crate::error, crate::identifiers
// ============================================================================

//! ## Overview
//! Every request acts as one user on one edition. [`UserInfo`] carries that
//! pair plus a lazily resolved [`EditionPermissions`] snapshot; resolution
//! happens at most once per request through a [`PermissionGate`]
//! implementation (the store crate provides one over the `edition_editor`
//! table). The mutation engine re-resolves inside its transaction so the
//! batch is checked against current rights, then the snapshot serves any
//! further checks in the same request.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::OnceLock;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ApiError;
use crate::identifiers::EditionEditorId;
use crate::identifiers::EditionId;
use crate::identifiers::UserId;

// ============================================================================
// SECTION: Permissions
// ============================================================================

/// Resolved capability set of one user on one edition.
///
/// # Invariants
/// - `edition_editor_id` is present exactly when the user is enrolled as an
///   editor of the edition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditionPermissions {
    /// User may read edition data.
    pub may_read: bool,
    /// User may write edition data.
    pub may_write: bool,
    /// User may lock or unlock the edition.
    pub may_lock: bool,
    /// User administers the edition (grants rights, overrides locks).
    pub is_admin: bool,
    /// Provenance row binding the user to the edition, when enrolled.
    pub edition_editor_id: Option<EditionEditorId>,
}

impl EditionPermissions {
    /// No capabilities at all (user not enrolled on the edition).
    pub const NONE: Self = Self {
        may_read: false,
        may_write: false,
        may_lock: false,
        is_admin: false,
        edition_editor_id: None,
    };

    /// Full capabilities, as granted to an edition's creator.
    #[must_use]
    pub const fn full(edition_editor_id: EditionEditorId) -> Self {
        Self {
            may_read: true,
            may_write: true,
            may_lock: true,
            is_admin: true,
            edition_editor_id: Some(edition_editor_id),
        }
    }
}

// ============================================================================
// SECTION: Gate Trait
// ============================================================================

/// Resolves the capability set of a user on an edition.
pub trait PermissionGate {
    /// Resolves current permissions for the (user, edition) pair.
    ///
    /// An unenrolled user resolves to [`EditionPermissions::NONE`], not an
    /// error; errors are reserved for resolution failures.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when resolution itself fails.
    fn resolve(
        &self,
        user_id: UserId,
        edition_id: EditionId,
    ) -> Result<EditionPermissions, ApiError>;
}

// ============================================================================
// SECTION: User Info
// ============================================================================

/// Acting user context for one request against one edition.
///
/// # Invariants
/// - Permissions are resolved at most once and cached for the request.
#[derive(Debug)]
pub struct UserInfo {
    /// Acting user.
    user_id: UserId,
    /// Edition the request operates on.
    edition_id: EditionId,
    /// Request-scoped permission cache.
    permissions: OnceLock<EditionPermissions>,
}

impl UserInfo {
    /// Creates a request context for a user acting on an edition.
    #[must_use]
    pub const fn new(user_id: UserId, edition_id: EditionId) -> Self {
        Self {
            user_id,
            edition_id,
            permissions: OnceLock::new(),
        }
    }

    /// Returns the acting user.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Returns the edition the request operates on.
    #[must_use]
    pub const fn edition_id(&self) -> EditionId {
        self.edition_id
    }

    /// Resolves permissions through the gate, caching the first result.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the gate fails to resolve.
    pub fn permissions(
        &self,
        gate: &dyn PermissionGate,
    ) -> Result<&EditionPermissions, ApiError> {
        if let Some(cached) = self.permissions.get() {
            return Ok(cached);
        }
        let resolved = gate.resolve(self.user_id, self.edition_id)?;
        Ok(self.permissions.get_or_init(|| resolved))
    }

    /// Returns whether the user may write the edition.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the gate fails to resolve.
    pub fn may_write(&self, gate: &dyn PermissionGate) -> Result<bool, ApiError> {
        Ok(self.permissions(gate)?.may_write)
    }

    /// Returns whether the user may read the edition.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the gate fails to resolve.
    pub fn may_read(&self, gate: &dyn PermissionGate) -> Result<bool, ApiError> {
        Ok(self.permissions(gate)?.may_read)
    }

    /// Returns the provenance id stamped into owner-link rows.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Forbidden`] when the user is not enrolled as an
    /// editor of the edition.
    pub fn edition_editor_id(
        &self,
        gate: &dyn PermissionGate,
    ) -> Result<EditionEditorId, ApiError> {
        self.permissions(gate)?.edition_editor_id.ok_or_else(|| ApiError::Forbidden {
            message: format!(
                "user {} is not an editor of edition {}",
                self.user_id, self.edition_id
            ),
        })
    }
}
