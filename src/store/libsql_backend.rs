//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::access::Role;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{Identity, NewTask, PendingRequest, Task};
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. Writes are
/// serialized through `write_lock` so a multi-statement transaction never
/// interleaves with another writer on the shared connection.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_identities(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<Identity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            out.push(row_to_identity(&row)?);
        }
        Ok(out)
    }

    async fn query_pending(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<PendingRequest>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            out.push(row_to_pending(&row)?);
        }
        Ok(out)
    }

    async fn query_tasks(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            out.push(row_to_task(&row)?);
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn get_i64(row: &libsql::Row, idx: i32, name: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

fn get_text(row: &libsql::Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

const IDENTITY_COLUMNS: &str = "id, alias, division, role, can_assign, created_at";

const PENDING_COLUMNS: &str = "id, first_name, last_name, requested_at";

const TASK_COLUMNS: &str = "id, giver_id, receiver_id, description, deadline, created_at";

fn row_to_identity(row: &libsql::Row) -> Result<Identity, DatabaseError> {
    let role_str = get_text(row, 3, "identity.role")?;
    let role: Role = role_str
        .parse()
        .map_err(|e: String| DatabaseError::Query(format!("identity.role: {e}")))?;
    let created_str = get_text(row, 5, "identity.created_at")?;

    Ok(Identity {
        id: get_i64(row, 0, "identity.id")?,
        alias: get_text(row, 1, "identity.alias")?,
        division: row.get::<String>(2).unwrap_or_default(),
        role,
        can_assign: get_i64(row, 4, "identity.can_assign")? != 0,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_pending(row: &libsql::Row) -> Result<PendingRequest, DatabaseError> {
    let requested_str = get_text(row, 3, "pending.requested_at")?;
    Ok(PendingRequest {
        id: get_i64(row, 0, "pending.id")?,
        first_name: row.get::<String>(1).unwrap_or_default(),
        last_name: row.get::<String>(2).unwrap_or_default(),
        requested_at: parse_datetime(&requested_str),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let deadline_str = get_text(row, 4, "task.deadline")?;
    let deadline = NaiveDate::parse_from_str(&deadline_str, "%Y-%m-%d")
        .map_err(|e| DatabaseError::Query(format!("task.deadline '{deadline_str}': {e}")))?;
    let created_str = get_text(row, 5, "task.created_at")?;

    Ok(Task {
        id: get_i64(row, 0, "task.id")?,
        giver_id: get_i64(row, 1, "task.giver_id")?,
        receiver_id: get_i64(row, 2, "task.receiver_id")?,
        description: get_text(row, 3, "task.description")?,
        deadline,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Identities ──────────────────────────────────────────────────

    async fn get_identity(&self, id: i64) -> Result<Option<Identity>, DatabaseError> {
        let found = self
            .query_identities(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
                params![id],
                "get_identity",
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn find_identity_by_alias(
        &self,
        alias: &str,
    ) -> Result<Option<Identity>, DatabaseError> {
        // `alias` is declared COLLATE NOCASE, so `=` is case-insensitive.
        let found = self
            .query_identities(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE alias = ?1"),
                params![alias.trim()],
                "find_identity_by_alias",
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, DatabaseError> {
        self.query_identities(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY alias ASC"),
            (),
            "list_identities",
        )
        .await
    }

    async fn insert_identity(&self, identity: &Identity) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO identities ({IDENTITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (id) DO NOTHING"
                ),
                params![
                    identity.id,
                    identity.alias.as_str(),
                    identity.division.as_str(),
                    identity.role.as_str(),
                    identity.can_assign as i64,
                    identity.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_identity", e))?;

        debug!(id = identity.id, alias = %identity.alias, inserted = count > 0, "Identity insert");
        Ok(count > 0)
    }

    async fn update_identity_alias(
        &self,
        id: i64,
        alias: &str,
        division: &str,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE identities SET alias = ?1, division = ?2 WHERE id = ?3",
                params![alias, division, id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("update_identity_alias", e))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "identity".into(),
                id: id.to_string(),
            });
        }
        debug!(id, alias, "Identity alias updated");
        Ok(())
    }

    async fn set_identity_role(&self, id: i64, role: Role) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE identities SET role = ?1 WHERE id = ?2",
                params![role.as_str(), id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("set_identity_role", e))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "identity".into(),
                id: id.to_string(),
            });
        }
        debug!(id, role = %role, "Identity role updated");
        Ok(())
    }

    async fn delete_identity(&self, id: i64) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute("DELETE FROM identities WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::from_libsql("delete_identity", e))?;
        Ok(count > 0)
    }

    // ── Pending requests ────────────────────────────────────────────

    async fn get_pending(&self, id: i64) -> Result<Option<PendingRequest>, DatabaseError> {
        let found = self
            .query_pending(
                &format!("SELECT {PENDING_COLUMNS} FROM pending_requests WHERE id = ?1"),
                params![id],
                "get_pending",
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn list_pending(&self) -> Result<Vec<PendingRequest>, DatabaseError> {
        self.query_pending(
            &format!("SELECT {PENDING_COLUMNS} FROM pending_requests ORDER BY requested_at ASC"),
            (),
            "list_pending",
        )
        .await
    }

    async fn create_pending(&self, request: &PendingRequest) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO pending_requests ({PENDING_COLUMNS}) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (id) DO NOTHING"
                ),
                params![
                    request.id,
                    request.first_name.as_str(),
                    request.last_name.as_str(),
                    request.requested_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("create_pending", e))?;

        debug!(id = request.id, created = count > 0, "Pending request");
        Ok(count > 0)
    }

    async fn delete_pending(&self, id: i64) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute("DELETE FROM pending_requests WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::from_libsql("delete_pending", e))?;
        Ok(count > 0)
    }

    async fn approve_pending(&self, identity: &Identity) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("approve_pending begin: {e}")))?;

        let removed = match tx
            .execute(
                "DELETE FROM pending_requests WHERE id = ?1",
                params![identity.id],
            )
            .await
        {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(DatabaseError::from_libsql("approve_pending delete", e));
            }
        };

        if removed == 0 {
            let _ = tx.rollback().await;
            return Err(DatabaseError::NotFound {
                entity: "pending request".into(),
                id: identity.id.to_string(),
            });
        }

        let inserted = tx
            .execute(
                &format!(
                    "INSERT INTO identities ({IDENTITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    identity.id,
                    identity.alias.as_str(),
                    identity.division.as_str(),
                    identity.role.as_str(),
                    identity.can_assign as i64,
                    identity.created_at.to_rfc3339(),
                ],
            )
            .await;

        if let Err(e) = inserted {
            let _ = tx.rollback().await;
            return Err(DatabaseError::from_libsql("approve_pending insert", e));
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("approve_pending commit: {e}")))?;

        info!(id = identity.id, alias = %identity.alias, "Pending request approved");
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &NewTask) -> Result<Task, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let created_at = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO tasks (giver_id, receiver_id, description, deadline, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task.giver_id,
                    task.receiver_id,
                    task.description.as_str(),
                    task.deadline.format("%Y-%m-%d").to_string(),
                    created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_task", e))?;

        let id = self.conn().last_insert_rowid();
        debug!(id, receiver = task.receiver_id, "Task inserted");

        Ok(Task {
            id,
            giver_id: task.giver_id,
            receiver_id: task.receiver_id,
            description: task.description.clone(),
            deadline: task.deadline,
            created_at,
        })
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        let found = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                "get_task",
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY deadline ASC, id ASC"),
            (),
            "list_tasks",
        )
        .await
    }

    async fn list_tasks_involving(&self, user_id: i64) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE receiver_id = ?1 OR giver_id = ?1
                 ORDER BY deadline ASC, id ASC"
            ),
            params![user_id],
            "list_tasks_involving",
        )
        .await
    }

    async fn delete_task(&self, id: i64) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::from_libsql("delete_task", e))?;
        Ok(count > 0)
    }
}
