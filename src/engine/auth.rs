//! Authorization gate
//!
//! Every RPC entry point runs through `require_member`/`require_owner`
//! before touching engine state. `Authorizer` is a small seam: this crate
//! ships an in-memory reference implementation; a real deployment backs it
//! with whatever external auth provider issues identities (out of scope
//! here, see the top-level design notes).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Result, SyncError};
use crate::types::{Role, UserId, WorkspaceId};

pub trait Authorizer: Send + Sync {
    fn role_of(&self, workspace_id: &str, user_id: &str) -> Option<Role>;
}

pub fn require_member(
    authorizer: &dyn Authorizer,
    workspace_id: &str,
    user_id: &str,
) -> Result<Role> {
    authorizer
        .role_of(workspace_id, user_id)
        .ok_or_else(|| SyncError::unauthorized("not a member of this workspace"))
}

pub fn require_owner(
    authorizer: &dyn Authorizer,
    workspace_id: &str,
    user_id: &str,
) -> Result<()> {
    let role = require_member(authorizer, workspace_id, user_id)?;
    if role.can_administer() {
        Ok(())
    } else {
        Err(SyncError::forbidden(
            "this operation requires the owner role",
        ))
    }
}

/// In-memory membership table: `(workspace_id, user_id) -> role`.
#[derive(Default)]
pub struct InMemoryAuthorizer {
    memberships: RwLock<HashMap<(WorkspaceId, UserId), Role>>,
}

impl InMemoryAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_role(&self, workspace_id: &str, user_id: &str, role: Role) {
        self.memberships
            .write()
            .unwrap()
            .insert((workspace_id.to_string(), user_id.to_string()), role);
    }

    pub fn remove(&self, workspace_id: &str, user_id: &str) {
        self.memberships
            .write()
            .unwrap()
            .remove(&(workspace_id.to_string(), user_id.to_string()));
    }
}

impl Authorizer for InMemoryAuthorizer {
    fn role_of(&self, workspace_id: &str, user_id: &str) -> Option<Role> {
        self.memberships
            .read()
            .unwrap()
            .get(&(workspace_id.to_string(), user_id.to_string()))
            .copied()
    }
}
