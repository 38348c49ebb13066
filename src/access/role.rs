//! Closed role enumeration and the transitions between roles.

use serde::{Deserialize, Serialize};

use crate::error::AccessError;

/// Role of a registered identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    /// Admins and the owner may review registrations and manage records.
    pub fn is_staff(&self) -> bool {
        matches!(self, Self::Admin | Self::Owner)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A named change of role. These are the only ways a role can change after
/// approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    PromoteToAdmin,
    DemoteToUser,
}

impl RoleChange {
    /// Validate the change for `actor` acting on `target` and return the new
    /// role for the target.
    ///
    /// Only the owner may create or remove admins, and the owner role itself
    /// is never granted or revoked.
    pub fn apply(self, actor: Role, target: Role) -> Result<Role, AccessError> {
        if actor != Role::Owner {
            return Err(AccessError::Forbidden);
        }
        match (self, target) {
            (Self::PromoteToAdmin, Role::User) => Ok(Role::Admin),
            (Self::DemoteToUser, Role::Admin) => Ok(Role::User),
            (Self::PromoteToAdmin, Role::Admin) => {
                Err(AccessError::InvalidTransition("already an admin".into()))
            }
            (Self::DemoteToUser, Role::User) => {
                Err(AccessError::InvalidTransition("not an admin".into()))
            }
            (_, Role::Owner) => Err(AccessError::InvalidTransition(
                "the owner's role cannot be changed".into(),
            )),
        }
    }
}

/// Whether `actor` may delete the identity `target`.
///
/// Admins may remove plain users; the owner may remove anyone except the
/// owner.
pub fn may_remove(actor: Role, target: Role) -> bool {
    match (actor, target) {
        (_, Role::Owner) => false,
        (Role::Owner, _) => true,
        (Role::Admin, Role::User) => true,
        _ => false,
    }
}
