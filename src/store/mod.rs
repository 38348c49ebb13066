//! Persistence layer: libSQL-backed storage for identities, pending
//! requests, and tasks.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

use std::future::Future;
use std::time::Duration;

pub use libsql_backend::LibSqlBackend;
pub use model::{Identity, NewTask, PendingRequest, Task};
pub use traits::Database;

use crate::error::DatabaseError;

/// Run a store call under a deadline. Elapsing counts as a store failure.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, DatabaseError>
where
    F: Future<Output = Result<T, DatabaseError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| DatabaseError::Timeout(limit))?
}
