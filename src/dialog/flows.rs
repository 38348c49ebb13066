//! Flow definitions: what each step asks, how its input is checked, and
//! the single store mutation each flow ends with.

use std::time::Duration;

use crate::error::{DatabaseError, DialogError};
use crate::store::{self, Database, Identity, NewTask, PendingRequest};

use super::state::{DialogSession, Draft, Prompt, Step};
use super::validate;

/// How a new session is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Start {
    AddTask,
    ApproveUser { pending_id: i64 },
    EditAlias,
}

/// Store access shared by every step.
#[derive(Clone, Copy)]
pub struct FlowContext<'a> {
    pub store: &'a dyn Database,
    pub timeout: Duration,
}

impl FlowContext<'_> {
    async fn find_alias(&self, alias: &str) -> Result<Option<Identity>, DatabaseError> {
        store::with_timeout(self.timeout, self.store.find_identity_by_alias(alias)).await
    }

    async fn aliases(&self) -> Result<Vec<String>, DatabaseError> {
        let identities =
            store::with_timeout(self.timeout, self.store.list_identities()).await?;
        Ok(identities.into_iter().map(|i| i.alias).collect())
    }
}

/// Result of feeding valid input to the current step.
#[derive(Debug)]
pub enum Advance {
    /// Moved to the next step.
    Next,
    /// All fields collected; the flow ends with this mutation.
    Commit(Commit),
}

/// The terminal mutation of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Commit {
    InsertTask {
        task: NewTask,
        giver_alias: String,
        receiver_alias: String,
    },
    ApprovePending(Identity),
    UpdateAlias {
        target: Identity,
        alias: String,
        division: String,
    },
}

/// A best-effort push to a third party after a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub user_id: i64,
    pub text: String,
}

/// What a successful commit produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub reply: String,
    pub notice: Option<Notice>,
}

/// Build a new session for `user_id`. Fails with `NotFound` if the record the
/// flow operates on does not exist.
pub async fn open(
    user_id: i64,
    start: Start,
    ctx: FlowContext<'_>,
) -> Result<DialogSession, DialogError> {
    let draft = match start {
        Start::AddTask => {
            let giver = store::with_timeout(ctx.timeout, ctx.store.get_identity(user_id))
                .await?
                .ok_or_else(|| DialogError::not_found("user", user_id))?;
            Draft::AddTask {
                giver_id: giver.id,
                giver_alias: giver.alias,
                description: None,
                deadline: None,
            }
        }
        Start::ApproveUser { pending_id } => {
            let pending = store::with_timeout(ctx.timeout, ctx.store.get_pending(pending_id))
                .await?
                .ok_or_else(|| DialogError::not_found("pending request", pending_id))?;
            Draft::ApproveUser {
                pending,
                alias: None,
                division: None,
            }
        }
        Start::EditAlias => Draft::EditAlias { target: None },
    };
    Ok(DialogSession::new(user_id, draft))
}

/// The prompt for the session's current step.
pub async fn prompt(session: &DialogSession, ctx: FlowContext<'_>) -> Result<Prompt, DialogError> {
    let prompt = match (&session.step, &session.draft) {
        (Step::AskDescription, _) => Prompt::text("📌 What is the task?"),
        (Step::AskDeadline, _) => Prompt::text("📅 What is the deadline? (YYYY-MM-DD)"),
        (Step::AskReceiver, _) => Prompt::with_choices(
            "👤 Who is this task for? Send their alias.",
            ctx.aliases().await?,
        ),
        (Step::AskAlias, Draft::ApproveUser { pending, .. }) => Prompt::text(format!(
            "Choose an alias for {} (id {}).",
            describe_pending(pending),
            pending.id
        )),
        (Step::AskDivision, Draft::ApproveUser { alias, .. }) => Prompt::text(format!(
            "Which division is {} in? Send - for none.",
            alias.as_deref().unwrap_or("this user")
        )),
        (Step::AskPermission, Draft::ApproveUser { alias, .. }) => Prompt::with_choices(
            format!(
                "May {} assign tasks to others?",
                alias.as_deref().unwrap_or("this user")
            ),
            vec!["true".to_string(), "false".to_string()],
        ),
        (Step::SelectUser, _) => Prompt::with_choices(
            "Whose alias do you want to change?",
            ctx.aliases().await?,
        ),
        (Step::InputNewValues, Draft::EditAlias { target: Some(target) }) => {
            Prompt::text(format!(
                "Current: {} ({}). Send the new alias, optionally followed by a division.",
                target.alias,
                if target.division.is_empty() {
                    "no division"
                } else {
                    target.division.as_str()
                }
            ))
        }
        (step, draft) => {
            tracing::error!(%step, flow = %draft.flow(), "Step does not match draft");
            return Err(DialogError::OutOfSync(format!("{} at {step}", draft.flow())));
        }
    };
    Ok(prompt)
}

/// Validate `raw` against the current step.
///
/// On `Err(DialogError::Validation)` the session is untouched. Any other
/// error means the flow must abort.
pub async fn apply_input(
    session: &mut DialogSession,
    raw: &str,
    ctx: FlowContext<'_>,
) -> Result<Advance, DialogError> {
    let step = session.step;
    match (step, &mut session.draft) {
        (Step::AskDescription, Draft::AddTask { description, .. }) => {
            *description = Some(validate::description(raw).map_err(DialogError::Validation)?);
        }
        (Step::AskDeadline, Draft::AddTask { deadline, .. }) => {
            *deadline = Some(validate::deadline(raw).map_err(DialogError::Validation)?);
        }
        (
            Step::AskReceiver,
            Draft::AddTask {
                giver_id,
                giver_alias,
                description: Some(description),
                deadline: Some(deadline),
            },
        ) => {
            let wanted = raw.trim().trim_start_matches('@');
            let receiver = ctx
                .find_alias(wanted)
                .await?
                .ok_or_else(|| DialogError::not_found("user", wanted))?;
            return Ok(Advance::Commit(Commit::InsertTask {
                task: NewTask {
                    giver_id: *giver_id,
                    receiver_id: receiver.id,
                    description: description.clone(),
                    deadline: *deadline,
                },
                giver_alias: giver_alias.clone(),
                receiver_alias: receiver.alias,
            }));
        }
        (Step::AskAlias, Draft::ApproveUser { alias, .. }) => {
            let candidate = validate::alias(raw).map_err(DialogError::Validation)?;
            if let Some(existing) = ctx.find_alias(&candidate).await? {
                return Err(alias_taken(&existing.alias));
            }
            *alias = Some(candidate);
        }
        (Step::AskDivision, Draft::ApproveUser { division, .. }) => {
            *division = Some(validate::division(raw));
        }
        (
            Step::AskPermission,
            Draft::ApproveUser {
                pending,
                alias: Some(alias),
                division: Some(division),
            },
        ) => {
            let can_assign = validate::permission(raw).map_err(DialogError::Validation)?;
            return Ok(Advance::Commit(Commit::ApprovePending(Identity::approved(
                pending.id, alias, division, can_assign,
            ))));
        }
        (Step::SelectUser, Draft::EditAlias { target }) => {
            let wanted = raw.trim().trim_start_matches('@');
            let found = ctx
                .find_alias(wanted)
                .await?
                .ok_or_else(|| DialogError::not_found("user", wanted))?;
            *target = Some(found);
        }
        (Step::InputNewValues, Draft::EditAlias { target: Some(target) }) => {
            let (alias, division) =
                validate::alias_and_division(raw).map_err(DialogError::Validation)?;
            let clash = ctx
                .find_alias(&alias)
                .await?
                .filter(|existing| existing.id != target.id);
            if let Some(existing) = clash {
                return Err(alias_taken(&existing.alias));
            }
            return Ok(Advance::Commit(Commit::UpdateAlias {
                division: division.unwrap_or_else(|| target.division.clone()),
                target: target.clone(),
                alias,
            }));
        }
        (step, draft) => {
            tracing::error!(%step, flow = %draft.flow(), "Step does not match draft");
            return Err(DialogError::OutOfSync(format!("{} at {step}", draft.flow())));
        }
    }

    session.advance().map_err(DialogError::OutOfSync)?;
    Ok(Advance::Next)
}

impl Commit {
    /// Apply the mutation. A uniqueness violation surfaces as a validation
    /// failure; every other error aborts the flow.
    pub async fn execute(self, ctx: FlowContext<'_>) -> Result<Committed, DialogError> {
        match self {
            Self::InsertTask {
                task,
                giver_alias,
                receiver_alias,
            } => {
                let task = store::with_timeout(ctx.timeout, ctx.store.insert_task(&task)).await?;
                tracing::info!(
                    task_id = task.id,
                    giver = task.giver_id,
                    receiver = task.receiver_id,
                    deadline = %task.deadline,
                    "Task created"
                );
                Ok(Committed {
                    reply: format!(
                        "✅ Task #{} added:\n\n📌 {}\n📅 {}\n👤 {}",
                        task.id, task.description, task.deadline, receiver_alias
                    ),
                    notice: Some(Notice {
                        user_id: task.receiver_id,
                        text: format!(
                            "📥 New task from {}:\n\n📌 {}\n📅 Deadline: {}",
                            giver_alias, task.description, task.deadline
                        ),
                    }),
                })
            }
            Self::ApprovePending(identity) => {
                let result =
                    store::with_timeout(ctx.timeout, ctx.store.approve_pending(&identity)).await;
                match result {
                    Ok(()) => {}
                    Err(DatabaseError::UniqueViolation(_)) => {
                        return Err(alias_taken(&identity.alias));
                    }
                    Err(DatabaseError::NotFound { .. }) => {
                        return Err(DialogError::not_found("pending request", identity.id));
                    }
                    Err(e) => return Err(e.into()),
                }
                let mut welcome = format!(
                    "✅ Your registration was approved. Your alias is {}.",
                    identity.alias
                );
                if identity.can_assign {
                    welcome.push_str(" You can assign tasks with /add.");
                }
                Ok(Committed {
                    reply: format!(
                        "✅ Approved {} as {} (can assign: {}).",
                        identity.id, identity.alias, identity.can_assign
                    ),
                    notice: Some(Notice {
                        user_id: identity.id,
                        text: welcome,
                    }),
                })
            }
            Self::UpdateAlias {
                target,
                alias,
                division,
            } => {
                let result = store::with_timeout(
                    ctx.timeout,
                    ctx.store.update_identity_alias(target.id, &alias, &division),
                )
                .await;
                match result {
                    Ok(()) => {}
                    Err(DatabaseError::UniqueViolation(_)) => return Err(alias_taken(&alias)),
                    Err(e) => return Err(e.into()),
                }
                tracing::info!(id = target.id, from = %target.alias, to = %alias, "Alias changed");
                Ok(Committed {
                    reply: format!(
                        "✅ {} is now {}{}.",
                        target.alias,
                        alias,
                        if division.is_empty() {
                            String::new()
                        } else {
                            format!(" ({division})")
                        }
                    ),
                    notice: None,
                })
            }
        }
    }
}

fn alias_taken(alias: &str) -> DialogError {
    DialogError::Validation(format!("The alias '{alias}' is already taken. Choose another."))
}

fn describe_pending(pending: &PendingRequest) -> String {
    let name = pending.display_name();
    if name.is_empty() {
        "this user".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::access::Role;
    use crate::store::LibSqlBackend;

    async fn seeded() -> LibSqlBackend {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.insert_identity(&Identity {
            role: Role::Owner,
            ..Identity::approved(1, "owner", "", true)
        })
        .await
        .unwrap();
        db.insert_identity(&Identity::approved(2, "bob", "eng", false))
            .await
            .unwrap();
        db.create_pending(&PendingRequest::new(10, "Eve", "Smith"))
            .await
            .unwrap();
        db
    }

    fn ctx(db: &LibSqlBackend) -> FlowContext<'_> {
        FlowContext {
            store: db,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn add_task_collects_fields_then_commits() {
        let db = seeded().await;
        let mut session = open(1, Start::AddTask, ctx(&db)).await.unwrap();

        assert!(matches!(
            apply_input(&mut session, "Ship report", ctx(&db)).await.unwrap(),
            Advance::Next
        ));
        assert!(matches!(
            apply_input(&mut session, "2025-07-15", ctx(&db)).await.unwrap(),
            Advance::Next
        ));
        assert_eq!(session.step, Step::AskReceiver);
        let receiver_prompt = prompt(&session, ctx(&db)).await.unwrap();
        assert!(receiver_prompt.choices.contains(&"bob".to_string()));

        let commit = match apply_input(&mut session, "BOB", ctx(&db)).await.unwrap() {
            Advance::Commit(commit) => commit,
            other => panic!("expected commit, got {other:?}"),
        };
        assert_eq!(
            commit,
            Commit::InsertTask {
                task: NewTask {
                    giver_id: 1,
                    receiver_id: 2,
                    description: "Ship report".into(),
                    deadline: NaiveDate::from_ymd_opt(2025, 7, 15).unwrap(),
                },
                giver_alias: "owner".into(),
                receiver_alias: "bob".into(),
            }
        );
        // Nothing is written before execute.
        assert!(db.list_tasks().await.unwrap().is_empty());

        let done = commit.execute(ctx(&db)).await.unwrap();
        assert_eq!(done.notice.unwrap().user_id, 2);
        assert_eq!(db.list_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_input_leaves_session_untouched() {
        let db = seeded().await;
        let mut session = open(1, Start::AddTask, ctx(&db)).await.unwrap();
        apply_input(&mut session, "Ship report", ctx(&db)).await.unwrap();
        let before = session.draft.clone();

        let err = apply_input(&mut session, "15-07-2025", ctx(&db))
            .await
            .unwrap_err();
        assert!(matches!(err, DialogError::Validation(_)));
        assert_eq!(session.step, Step::AskDeadline);
        assert_eq!(session.draft, before);
    }

    #[tokio::test]
    async fn unknown_receiver_aborts() {
        let db = seeded().await;
        let mut session = open(1, Start::AddTask, ctx(&db)).await.unwrap();
        apply_input(&mut session, "x", ctx(&db)).await.unwrap();
        apply_input(&mut session, "2025-07-15", ctx(&db)).await.unwrap();
        let err = apply_input(&mut session, "nobody", ctx(&db))
            .await
            .unwrap_err();
        assert!(matches!(err, DialogError::NotFound { .. }));
    }

    #[tokio::test]
    async fn approve_missing_pending_fails_to_open() {
        let db = seeded().await;
        let err = open(1, Start::ApproveUser { pending_id: 999 }, ctx(&db))
            .await
            .unwrap_err();
        assert!(matches!(err, DialogError::NotFound { ref key, .. } if key == "999"));
    }

    #[tokio::test]
    async fn approve_rejects_taken_alias_case_insensitively() {
        let db = seeded().await;
        let mut session = open(1, Start::ApproveUser { pending_id: 10 }, ctx(&db))
            .await
            .unwrap();
        let err = apply_input(&mut session, "Bob", ctx(&db)).await.unwrap_err();
        assert!(matches!(err, DialogError::Validation(_)));
        assert_eq!(session.step, Step::AskAlias);
    }

    #[tokio::test]
    async fn approve_commit_promotes_pending() {
        let db = seeded().await;
        let mut session = open(1, Start::ApproveUser { pending_id: 10 }, ctx(&db))
            .await
            .unwrap();
        apply_input(&mut session, "eve", ctx(&db)).await.unwrap();
        apply_input(&mut session, "ops", ctx(&db)).await.unwrap();
        let permission_prompt = prompt(&session, ctx(&db)).await.unwrap();
        assert_eq!(permission_prompt.choices, vec!["true", "false"]);

        assert!(apply_input(&mut session, "maybe", ctx(&db)).await.is_err());
        let Advance::Commit(commit) = apply_input(&mut session, "True", ctx(&db)).await.unwrap()
        else {
            panic!("expected commit");
        };
        let done = commit.execute(ctx(&db)).await.unwrap();
        assert_eq!(done.notice.unwrap().user_id, 10);

        let eve = db.get_identity(10).await.unwrap().unwrap();
        assert_eq!(eve.role, Role::User);
        assert!(eve.can_assign);
        assert_eq!(eve.division, "ops");
        assert!(db.get_pending(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn approve_commit_after_rejection_is_not_found() {
        let db = seeded().await;
        let commit = Commit::ApprovePending(Identity::approved(10, "eve", "", false));
        db.delete_pending(10).await.unwrap();

        let err = commit.execute(ctx(&db)).await.unwrap_err();
        assert!(matches!(err, DialogError::NotFound { .. }));
        assert!(db.get_identity(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn edit_alias_allows_keeping_own_alias_and_retains_division() {
        let db = seeded().await;
        let mut session = open(1, Start::EditAlias, ctx(&db)).await.unwrap();
        apply_input(&mut session, "bob", ctx(&db)).await.unwrap();

        // Changing only the case of one's own alias is not a collision.
        let Advance::Commit(commit) = apply_input(&mut session, "Bob", ctx(&db)).await.unwrap()
        else {
            panic!("expected commit");
        };
        let done = commit.execute(ctx(&db)).await.unwrap();
        assert!(done.notice.is_none());

        let bob = db.get_identity(2).await.unwrap().unwrap();
        assert_eq!(bob.alias, "Bob");
        assert_eq!(bob.division, "eng");
    }

    #[tokio::test]
    async fn edit_alias_rejects_collision_with_someone_else() {
        let db = seeded().await;
        let mut session = open(1, Start::EditAlias, ctx(&db)).await.unwrap();
        apply_input(&mut session, "bob", ctx(&db)).await.unwrap();
        let err = apply_input(&mut session, "OWNER ops", ctx(&db))
            .await
            .unwrap_err();
        assert!(matches!(err, DialogError::Validation(_)));
        assert_eq!(session.step, Step::InputNewValues);
    }

    #[tokio::test]
    async fn edit_alias_unknown_user_aborts() {
        let db = seeded().await;
        let mut session = open(1, Start::EditAlias, ctx(&db)).await.unwrap();
        let err = apply_input(&mut session, "ghost", ctx(&db))
            .await
            .unwrap_err();
        assert!(matches!(err, DialogError::NotFound { .. }));
    }
}
