//! Records held by the store: identities, pending requests, and tasks.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::access::Role;

/// A registered, role-bearing user. `id` is the chat user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    /// Unique across identities, compared case-insensitively.
    pub alias: String,
    pub division: String,
    pub role: Role,
    /// Whether this identity may assign tasks.
    pub can_assign: bool,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    /// A freshly approved identity. Approval always yields `Role::User`.
    pub fn approved(id: i64, alias: &str, division: &str, can_assign: bool) -> Self {
        Self {
            id,
            alias: alias.to_string(),
            division: division.to_string(),
            role: Role::User,
            can_assign,
            created_at: Utc::now(),
        }
    }
}

/// An unapproved contact awaiting admin/owner action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub requested_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn new(id: i64, first_name: &str, last_name: &str) -> Self {
        Self {
            id,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            requested_at: Utc::now(),
        }
    }

    /// First and last name joined, for display.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// A task assigned by one identity to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub giver_id: i64,
    pub receiver_id: i64,
    pub description: String,
    pub deadline: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// A task that has not been stored yet (the store assigns the id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub giver_id: i64,
    pub receiver_id: i64,
    pub description: String,
    pub deadline: NaiveDate,
}
