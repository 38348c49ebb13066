//! Access control: resolves a caller's capability tier and gates every
//! entry point and field-level action.

pub mod role;

use std::sync::Arc;
use std::time::Duration;

pub use role::{Role, RoleChange, may_remove};

use crate::error::{AccessError, DatabaseError};
use crate::store::{self, Database, Identity};

/// Capability tier of a chat user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// Never contacted the bot, or was rejected.
    Unregistered,
    /// Waiting for an admin to approve the registration.
    Pending,
    /// A registered identity.
    Known(Identity),
}

impl Access {
    pub fn describe(&self) -> String {
        match self {
            Self::Unregistered => "unregistered".to_string(),
            Self::Pending => "pending approval".to_string(),
            Self::Known(identity) => format!(
                "{} ({}{}), can assign tasks: {}",
                identity.alias,
                identity.role,
                if identity.division.is_empty() {
                    String::new()
                } else {
                    format!(", {}", identity.division)
                },
                if identity.can_assign { "yes" } else { "no" }
            ),
        }
    }
}

/// Who may list identities and pending requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DirectoryVisibility {
    /// Any registered identity.
    #[default]
    AnyKnown,
    /// The owner only.
    OwnerOnly,
}

impl std::str::FromStr for DirectoryVisibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "known" => Ok(Self::AnyKnown),
            "owner" => Ok(Self::OwnerOnly),
            other => Err(format!("expected 'known' or 'owner', got '{other}'")),
        }
    }
}

/// A gated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AddTask,
    ReviewPending,
    ManageAdmins,
    ListOwnTasks,
    ListDirectory,
    EditAlias,
    DeleteTask,
    RemoveUser,
}

impl Operation {
    /// Whether `identity` may perform this operation.
    pub fn permits(self, identity: &Identity, visibility: DirectoryVisibility) -> bool {
        match self {
            Self::AddTask => identity.can_assign,
            Self::ReviewPending | Self::EditAlias | Self::DeleteTask | Self::RemoveUser => {
                identity.role.is_staff()
            }
            Self::ManageAdmins => identity.role == Role::Owner,
            Self::ListOwnTasks => true,
            Self::ListDirectory => match visibility {
                DirectoryVisibility::AnyKnown => true,
                DirectoryVisibility::OwnerOnly => identity.role == Role::Owner,
            },
        }
    }
}

/// Process-wide access checker backed by the record store.
pub struct AccessControl {
    store: Arc<dyn Database>,
    visibility: DirectoryVisibility,
    store_timeout: Duration,
}

impl AccessControl {
    pub fn new(
        store: Arc<dyn Database>,
        visibility: DirectoryVisibility,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            visibility,
            store_timeout,
        }
    }

    pub fn visibility(&self) -> DirectoryVisibility {
        self.visibility
    }

    /// Resolve the capability tier of `user_id`.
    pub async fn resolve(&self, user_id: i64) -> Result<Access, AccessError> {
        if let Some(identity) =
            store::with_timeout(self.store_timeout, self.store.get_identity(user_id)).await?
        {
            return Ok(Access::Known(identity));
        }
        let pending =
            store::with_timeout(self.store_timeout, self.store.get_pending(user_id)).await?;
        Ok(if pending.is_some() {
            Access::Pending
        } else {
            Access::Unregistered
        })
    }

    /// Check that `user_id` may perform `op` and return their identity.
    pub async fn require(&self, user_id: i64, op: Operation) -> Result<Identity, AccessError> {
        match self.resolve(user_id).await? {
            Access::Unregistered => Err(AccessError::Unregistered),
            Access::Pending => Err(AccessError::Pending),
            Access::Known(identity) => {
                if op.permits(&identity, self.visibility) {
                    Ok(identity)
                } else {
                    tracing::debug!(user_id, ?op, role = %identity.role, "Operation denied");
                    Err(AccessError::Forbidden)
                }
            }
        }
    }

    /// Apply a role change requested by `actor_id` to the identity with
    /// `alias`. Returns the updated identity.
    pub async fn change_role(
        &self,
        actor_id: i64,
        alias: &str,
        change: RoleChange,
    ) -> Result<Identity, AccessError> {
        let actor = self.require(actor_id, Operation::ManageAdmins).await?;
        let mut target = self.lookup_alias(alias).await?;

        let new_role = change.apply(actor.role, target.role)?;
        store::with_timeout(
            self.store_timeout,
            self.store.set_identity_role(target.id, new_role),
        )
        .await?;

        tracing::info!(
            actor = actor.id,
            target = target.id,
            from = %target.role,
            to = %new_role,
            "Role changed"
        );
        target.role = new_role;
        Ok(target)
    }

    /// Delete the identity with `alias` on behalf of `actor_id`. Returns the
    /// removed identity.
    pub async fn remove_identity(
        &self,
        actor_id: i64,
        alias: &str,
    ) -> Result<Identity, AccessError> {
        let actor = self.require(actor_id, Operation::RemoveUser).await?;
        let target = self.lookup_alias(alias).await?;

        if target.id == actor.id || !may_remove(actor.role, target.role) {
            return Err(AccessError::Forbidden);
        }

        let removed =
            store::with_timeout(self.store_timeout, self.store.delete_identity(target.id)).await?;
        if !removed {
            return Err(AccessError::UnknownAlias(alias.to_string()));
        }

        tracing::info!(actor = actor.id, target = target.id, alias = %target.alias, "Identity removed");
        Ok(target)
    }

    async fn lookup_alias(&self, alias: &str) -> Result<Identity, AccessError> {
        store::with_timeout(self.store_timeout, self.store.find_identity_by_alias(alias))
            .await?
            .ok_or_else(|| AccessError::UnknownAlias(alias.to_string()))
    }
}

/// Make sure the configured owner exists with the owner role. An existing
/// identity keeps its alias and division.
pub async fn bootstrap_owner(
    store: &dyn Database,
    owner_id: i64,
    alias: &str,
) -> Result<Identity, DatabaseError> {
    if let Some(mut existing) = store.get_identity(owner_id).await? {
        if existing.role != Role::Owner {
            store.set_identity_role(owner_id, Role::Owner).await?;
            tracing::info!(owner_id, from = %existing.role, "Restored owner role");
            existing.role = Role::Owner;
        }
        return Ok(existing);
    }

    let owner = Identity {
        role: Role::Owner,
        ..Identity::approved(owner_id, alias, "", true)
    };
    store.insert_identity(&owner).await?;
    // Drop a registration request sent before the owner was configured.
    store.delete_pending(owner_id).await?;
    tracing::info!(owner_id, alias, "Owner identity created");
    Ok(owner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlBackend, PendingRequest};

    async fn setup(visibility: DirectoryVisibility) -> (Arc<LibSqlBackend>, AccessControl) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let owner = Identity {
            role: Role::Owner,
            ..Identity::approved(1, "owner", "", true)
        };
        db.insert_identity(&owner).await.unwrap();
        let admin = Identity {
            role: Role::Admin,
            ..Identity::approved(2, "alice", "ops", false)
        };
        db.insert_identity(&admin).await.unwrap();
        db.insert_identity(&Identity::approved(3, "bob", "eng", false))
            .await
            .unwrap();
        db.insert_identity(&Identity::approved(4, "carol", "eng", true))
            .await
            .unwrap();
        db.create_pending(&PendingRequest::new(10, "Eve", ""))
            .await
            .unwrap();

        let access = AccessControl::new(db.clone(), visibility, Duration::from_secs(5));
        (db, access)
    }

    #[tokio::test]
    async fn resolve_tiers() {
        let (_db, access) = setup(DirectoryVisibility::AnyKnown).await;
        assert_eq!(access.resolve(99).await.unwrap(), Access::Unregistered);
        assert_eq!(access.resolve(10).await.unwrap(), Access::Pending);
        match access.resolve(3).await.unwrap() {
            Access::Known(identity) => {
                assert_eq!(identity.alias, "bob");
                assert_eq!(identity.role, Role::User);
            }
            other => panic!("expected Known, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn add_task_requires_can_assign() {
        let (_db, access) = setup(DirectoryVisibility::AnyKnown).await;
        assert!(access.require(4, Operation::AddTask).await.is_ok());
        assert!(matches!(
            access.require(3, Operation::AddTask).await,
            Err(AccessError::Forbidden)
        ));
        // Staff role alone does not grant assignment.
        assert!(matches!(
            access.require(2, Operation::AddTask).await,
            Err(AccessError::Forbidden)
        ));
        assert!(matches!(
            access.require(10, Operation::AddTask).await,
            Err(AccessError::Pending)
        ));
        assert!(matches!(
            access.require(99, Operation::AddTask).await,
            Err(AccessError::Unregistered)
        ));
    }

    #[tokio::test]
    async fn review_pending_requires_staff() {
        let (_db, access) = setup(DirectoryVisibility::AnyKnown).await;
        assert!(access.require(1, Operation::ReviewPending).await.is_ok());
        assert!(access.require(2, Operation::ReviewPending).await.is_ok());
        assert!(access.require(4, Operation::ReviewPending).await.is_err());
    }

    #[tokio::test]
    async fn directory_visibility_policy() {
        let (_db, open) = setup(DirectoryVisibility::AnyKnown).await;
        assert!(open.require(3, Operation::ListDirectory).await.is_ok());

        let (_db, closed) = setup(DirectoryVisibility::OwnerOnly).await;
        assert!(closed.require(1, Operation::ListDirectory).await.is_ok());
        assert!(closed.require(2, Operation::ListDirectory).await.is_err());
        assert!(closed.require(3, Operation::ListDirectory).await.is_err());
    }

    #[tokio::test]
    async fn owner_promotes_and_demotes() {
        let (db, access) = setup(DirectoryVisibility::AnyKnown).await;

        let bob = access
            .change_role(1, "BOB", RoleChange::PromoteToAdmin)
            .await
            .unwrap();
        assert_eq!(bob.role, Role::Admin);
        assert_eq!(db.get_identity(3).await.unwrap().unwrap().role, Role::Admin);

        access
            .change_role(1, "bob", RoleChange::DemoteToUser)
            .await
            .unwrap();
        assert_eq!(db.get_identity(3).await.unwrap().unwrap().role, Role::User);
    }

    #[tokio::test]
    async fn admin_cannot_change_roles() {
        let (db, access) = setup(DirectoryVisibility::AnyKnown).await;
        let err = access
            .change_role(2, "bob", RoleChange::PromoteToAdmin)
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Forbidden));
        assert_eq!(db.get_identity(3).await.unwrap().unwrap().role, Role::User);
    }

    #[tokio::test]
    async fn owner_role_is_immutable() {
        let (_db, access) = setup(DirectoryVisibility::AnyKnown).await;
        let err = access
            .change_role(1, "owner", RoleChange::DemoteToUser)
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn unknown_alias_is_reported() {
        let (_db, access) = setup(DirectoryVisibility::AnyKnown).await;
        let err = access
            .change_role(1, "nobody", RoleChange::PromoteToAdmin)
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::UnknownAlias(ref a) if a == "nobody"));
    }

    #[tokio::test]
    async fn removal_follows_role_rules() {
        let (db, access) = setup(DirectoryVisibility::AnyKnown).await;

        // Admin may not remove another admin or the owner.
        assert!(access.remove_identity(2, "owner").await.is_err());
        // Admin removes a plain user.
        let bob = access.remove_identity(2, "bob").await.unwrap();
        assert_eq!(bob.id, 3);
        assert!(db.get_identity(3).await.unwrap().is_none());

        // Owner removes an admin but never themselves.
        assert!(access.remove_identity(1, "alice").await.is_ok());
        assert!(matches!(
            access.remove_identity(1, "owner").await,
            Err(AccessError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn bootstrap_creates_owner_once() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.create_pending(&PendingRequest::new(42, "Olga", "")).await.unwrap();

        let owner = bootstrap_owner(&db, 42, "boss").await.unwrap();
        assert_eq!(owner.role, Role::Owner);
        assert!(owner.can_assign);
        assert!(db.get_pending(42).await.unwrap().is_none());

        // Second boot keeps the stored record.
        db.update_identity_alias(42, "chief", "hq").await.unwrap();
        let again = bootstrap_owner(&db, 42, "boss").await.unwrap();
        assert_eq!(again.alias, "chief");
        assert_eq!(db.list_identities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_restores_owner_role() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.insert_identity(&Identity::approved(42, "boss", "", false))
            .await
            .unwrap();
        let owner = bootstrap_owner(&db, 42, "boss").await.unwrap();
        assert_eq!(owner.role, Role::Owner);
        assert_eq!(db.get_identity(42).await.unwrap().unwrap().role, Role::Owner);
    }

    #[test]
    fn visibility_parses() {
        assert_eq!(
            "known".parse::<DirectoryVisibility>().unwrap(),
            DirectoryVisibility::AnyKnown
        );
        assert_eq!(
            "OWNER".parse::<DirectoryVisibility>().unwrap(),
            DirectoryVisibility::OwnerOnly
        );
        assert!("everyone".parse::<DirectoryVisibility>().is_err());
    }
}
