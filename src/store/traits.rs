//! `Database` trait: single async interface for all persistence.

use async_trait::async_trait;

use crate::access::Role;
use crate::error::DatabaseError;
use crate::store::model::{Identity, NewTask, PendingRequest, Task};

/// Backend-agnostic database trait covering identities, pending requests,
/// and tasks.
///
/// Alias comparisons are case-insensitive everywhere. Alias uniqueness is
/// enforced by the backend; a conflicting write fails with
/// `DatabaseError::UniqueViolation`.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Identities ──────────────────────────────────────────────────

    async fn get_identity(&self, id: i64) -> Result<Option<Identity>, DatabaseError>;

    /// Case-insensitive exact alias lookup.
    async fn find_identity_by_alias(&self, alias: &str)
    -> Result<Option<Identity>, DatabaseError>;

    /// All identities ordered by alias.
    async fn list_identities(&self) -> Result<Vec<Identity>, DatabaseError>;

    /// Insert an identity directly (owner bootstrap). Returns `false` if an
    /// identity with the same id already exists.
    async fn insert_identity(&self, identity: &Identity) -> Result<bool, DatabaseError>;

    /// Change alias and division of an existing identity.
    async fn update_identity_alias(
        &self,
        id: i64,
        alias: &str,
        division: &str,
    ) -> Result<(), DatabaseError>;

    async fn set_identity_role(&self, id: i64, role: Role) -> Result<(), DatabaseError>;

    /// Delete an identity. Returns whether a row was removed.
    async fn delete_identity(&self, id: i64) -> Result<bool, DatabaseError>;

    // ── Pending requests ────────────────────────────────────────────

    async fn get_pending(&self, id: i64) -> Result<Option<PendingRequest>, DatabaseError>;

    /// All pending requests, oldest first.
    async fn list_pending(&self) -> Result<Vec<PendingRequest>, DatabaseError>;

    /// Record a pending request. Idempotent: returns `false` if one already
    /// exists for this id.
    async fn create_pending(&self, request: &PendingRequest) -> Result<bool, DatabaseError>;

    /// Discard a pending request. Returns whether a row was removed.
    async fn delete_pending(&self, id: i64) -> Result<bool, DatabaseError>;

    /// Promote a pending request into an identity in one atomic step.
    ///
    /// Fails with `NotFound` if the request no longer exists and with
    /// `UniqueViolation` if the alias is taken; nothing changes in either case.
    async fn approve_pending(&self, identity: &Identity) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a task and return it with its assigned id.
    async fn insert_task(&self, task: &NewTask) -> Result<Task, DatabaseError>;

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError>;

    /// All tasks, ordered by deadline.
    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError>;

    /// Tasks the user gave or received, ordered by deadline.
    async fn list_tasks_involving(&self, user_id: i64) -> Result<Vec<Task>, DatabaseError>;

    /// Delete a task. Returns whether a row was removed.
    async fn delete_task(&self, id: i64) -> Result<bool, DatabaseError>;
}
