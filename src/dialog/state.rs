//! Dialog state machine: which flow a session runs and which step it is on.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Identity, PendingRequest};

/// The multi-step flows a session can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    AddTask,
    ApproveUser,
    EditAlias,
}

impl Flow {
    /// The step a fresh session of this flow starts on.
    pub fn first_step(self) -> Step {
        match self {
            Self::AddTask => Step::AskDescription,
            Self::ApproveUser => Step::AskAlias,
            Self::EditAlias => Step::SelectUser,
        }
    }
}

impl std::fmt::Display for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AddTask => "add_task",
            Self::ApproveUser => "approve_user",
            Self::EditAlias => "edit_alias",
        };
        write!(f, "{s}")
    }
}

/// A step within a flow.
///
/// Add-Task: AskDescription → AskDeadline → AskReceiver → commit.
/// Approve-User: AskAlias → AskDivision → AskPermission → commit.
/// Edit-Alias: SelectUser → InputNewValues → commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AskDescription,
    AskDeadline,
    AskReceiver,
    AskAlias,
    AskDivision,
    AskPermission,
    SelectUser,
    InputNewValues,
}

impl Step {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: Step) -> bool {
        use Step::*;
        matches!(
            (self, target),
            (AskDescription, AskDeadline)
                | (AskDeadline, AskReceiver)
                | (AskAlias, AskDivision)
                | (AskDivision, AskPermission)
                | (SelectUser, InputNewValues)
        )
    }

    /// The following step, or `None` when this step leads to the commit.
    pub fn next(&self) -> Option<Step> {
        use Step::*;
        match self {
            AskDescription => Some(AskDeadline),
            AskDeadline => Some(AskReceiver),
            AskAlias => Some(AskDivision),
            AskDivision => Some(AskPermission),
            SelectUser => Some(InputNewValues),
            AskReceiver | AskPermission | InputNewValues => None,
        }
    }

    /// The flow this step belongs to.
    pub fn flow(&self) -> Flow {
        use Step::*;
        match self {
            AskDescription | AskDeadline | AskReceiver => Flow::AddTask,
            AskAlias | AskDivision | AskPermission => Flow::ApproveUser,
            SelectUser | InputNewValues => Flow::EditAlias,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AskDescription => "ask_description",
            Self::AskDeadline => "ask_deadline",
            Self::AskReceiver => "ask_receiver",
            Self::AskAlias => "ask_alias",
            Self::AskDivision => "ask_division",
            Self::AskPermission => "ask_permission",
            Self::SelectUser => "select_user",
            Self::InputNewValues => "input_new_values",
        };
        write!(f, "{s}")
    }
}

/// Field values collected so far, per flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Draft {
    AddTask {
        giver_id: i64,
        giver_alias: String,
        description: Option<String>,
        deadline: Option<NaiveDate>,
    },
    ApproveUser {
        pending: PendingRequest,
        alias: Option<String>,
        division: Option<String>,
    },
    EditAlias {
        target: Option<Identity>,
    },
}

impl Draft {
    pub fn flow(&self) -> Flow {
        match self {
            Self::AddTask { .. } => Flow::AddTask,
            Self::ApproveUser { .. } => Flow::ApproveUser,
            Self::EditAlias { .. } => Flow::EditAlias,
        }
    }
}

/// A user's in-flight dialog. Never persisted.
#[derive(Debug, Clone)]
pub struct DialogSession {
    pub id: Uuid,
    pub user_id: i64,
    pub step: Step,
    pub draft: Draft,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl DialogSession {
    pub fn new(user_id: i64, draft: Draft) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            step: draft.flow().first_step(),
            draft,
            started_at: now,
            last_activity: now,
        }
    }

    pub fn flow(&self) -> Flow {
        self.draft.flow()
    }

    /// Move to the next step. Returns an error at a commit step.
    pub fn advance(&mut self) -> Result<Step, String> {
        let next = self
            .step
            .next()
            .ok_or_else(|| format!("{} leads to the commit", self.step))?;
        if !self.step.can_transition_to(next) {
            return Err(format!("Cannot transition from {} to {}", self.step, next));
        }
        self.step = next;
        Ok(next)
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Text shown to the user, with optional button choices.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Prompt {
    pub text: String,
    pub choices: Vec<String>,
}

impl Prompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            choices: Vec::new(),
        }
    }

    pub fn with_choices(text: impl Into<String>, choices: Vec<String>) -> Self {
        Self {
            text: text.into(),
            choices,
        }
    }
}
