//! Bot: routes each inbound message to a command handler or the user's
//! active dialog, and renders the reply.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::access::{Access, AccessControl, Operation, RoleChange};
use crate::bot::command::{Command, CommandParser, Input};
use crate::channels::{Button, IncomingMessage, Notifier, OutgoingResponse, notify_within};
use crate::config::Timeouts;
use crate::dialog::{Prompt, Start};
use crate::error::{AccessError, DatabaseError, DialogError};
use crate::session::{CancelOutcome, SessionManager, StepOutcome};
use crate::store::{self, Database, Identity, PendingRequest, Task};

const GENERIC_FAILURE: &str = "Something went wrong. Please try again.";

/// Everything a message handler needs.
pub struct Bot {
    store: Arc<dyn Database>,
    access: Arc<AccessControl>,
    sessions: Arc<SessionManager>,
    notifier: Arc<dyn Notifier>,
    timeouts: Timeouts,
    owner_id: i64,
}

impl Bot {
    pub fn new(
        store: Arc<dyn Database>,
        access: Arc<AccessControl>,
        sessions: Arc<SessionManager>,
        notifier: Arc<dyn Notifier>,
        timeouts: Timeouts,
        owner_id: i64,
    ) -> Self {
        Self {
            store,
            access,
            sessions,
            notifier,
            timeouts,
            owner_id,
        }
    }

    /// Handle one inbound message and produce the reply.
    pub async fn handle(&self, msg: &IncomingMessage) -> OutgoingResponse {
        match CommandParser::parse(&msg.content) {
            Input::Command(command) => {
                tracing::debug!(user_id = msg.user_id, ?command, "Command");
                self.handle_command(msg, command).await
            }
            Input::Text(text) => self.handle_text(msg.user_id, &text).await,
        }
    }

    async fn handle_text(&self, user_id: i64, text: &str) -> OutgoingResponse {
        match self.sessions.step(user_id, text).await {
            Ok(StepOutcome::Prompt(prompt)) => prompt_response(None, prompt),
            Ok(StepOutcome::Rejection { message, prompt }) => {
                prompt_response(Some(&format!("⚠️ {message}")), prompt)
            }
            Ok(StepOutcome::Completion(reply)) => OutgoingResponse::text(reply),
            Err(DialogError::NoActiveSession) => self.idle_hint(user_id).await,
            Err(DialogError::Validation(message)) => OutgoingResponse::text(format!(
                "⚠️ {message}\nThe flow was cancelled; please start again."
            )),
            Err(e) => OutgoingResponse::text(format!("❌ {e}\nThe flow was cancelled.")),
        }
    }

    async fn idle_hint(&self, user_id: i64) -> OutgoingResponse {
        match self.access.resolve(user_id).await {
            Ok(Access::Unregistered) => {
                OutgoingResponse::text("You are not registered yet. Send /start to request access.")
            }
            Ok(Access::Pending) => {
                OutgoingResponse::text("⏳ Your registration is still waiting for approval.")
            }
            Ok(Access::Known(_)) => OutgoingResponse::text("Send /help to see what I can do."),
            Err(e) => access_failure(e),
        }
    }

    async fn handle_command(&self, msg: &IncomingMessage, command: Command) -> OutgoingResponse {
        let user_id = msg.user_id;

        if command.starts_dialog() {
            if let Some(flow) = self.sessions.active_flow(user_id).await {
                return OutgoingResponse::text(format!(
                    "{} (current: {flow})",
                    DialogError::AlreadyActive
                ));
            }
        }

        match command {
            Command::Start => self.start(msg).await,
            Command::Add => match self.access.require(user_id, Operation::AddTask).await {
                Ok(_) => self.begin(user_id, Start::AddTask).await,
                Err(e) => access_failure(e),
            },
            Command::List => self.list_tasks(user_id).await,
            Command::ListUsers => self.list_users(user_id).await,
            Command::Pending | Command::Approve { pending_id: None } => {
                self.list_pending(user_id).await
            }
            Command::Approve {
                pending_id: Some(pending_id),
            } => match self.access.require(user_id, Operation::ReviewPending).await {
                Ok(_) => self.begin(user_id, Start::ApproveUser { pending_id }).await,
                Err(e) => access_failure(e),
            },
            Command::Reject { pending_id } => self.reject(user_id, pending_id).await,
            Command::AddAdmin { alias } => {
                self.change_role(user_id, &alias, RoleChange::PromoteToAdmin)
                    .await
            }
            Command::RemoveAdmin { alias } => {
                self.change_role(user_id, &alias, RoleChange::DemoteToUser)
                    .await
            }
            Command::EditAlias => match self.access.require(user_id, Operation::EditAlias).await {
                Ok(_) => self.begin(user_id, Start::EditAlias).await,
                Err(e) => access_failure(e),
            },
            Command::Cancel => match self.sessions.cancel(user_id).await {
                CancelOutcome::Cancelled(_) => OutgoingResponse::text("❌ Cancelled."),
                CancelOutcome::NoActiveSession => OutgoingResponse::text("Nothing to cancel."),
            },
            Command::Help => self.help(user_id).await,
            Command::DeleteTask { task_id } => self.delete_task(user_id, task_id).await,
            Command::RemoveUser { alias } => self.remove_user(user_id, &alias).await,
            Command::WhoAmI => match self.access.resolve(user_id).await {
                Ok(access) => OutgoingResponse::text(format!(
                    "You are {} (id {user_id}).",
                    access.describe()
                )),
                Err(e) => access_failure(e),
            },
            Command::Invalid { usage } => OutgoingResponse::text(format!("Usage: {usage}")),
            Command::Unknown(name) => OutgoingResponse::text(format!(
                "Unknown command /{name}. Send /help to see what I can do."
            )),
        }
    }

    async fn begin(&self, user_id: i64, start: Start) -> OutgoingResponse {
        match self.sessions.begin(user_id, start).await {
            Ok((_, prompt)) => prompt_response(None, prompt),
            Err(DialogError::Store(e)) => {
                error!(user_id, error = %e, "Could not start dialog");
                OutgoingResponse::text(GENERIC_FAILURE)
            }
            Err(e) => OutgoingResponse::text(format!("❌ {e}")),
        }
    }

    // ── Registration ────────────────────────────────────────────────

    async fn start(&self, msg: &IncomingMessage) -> OutgoingResponse {
        let user_id = msg.user_id;
        match self.access.resolve(user_id).await {
            Ok(Access::Known(identity)) => OutgoingResponse::text(format!(
                "✅ Welcome back, {}! Send /help to see what you can do.",
                identity.alias
            )),
            Ok(Access::Pending) => {
                OutgoingResponse::text("⏳ Your registration is still waiting for approval.")
            }
            Ok(Access::Unregistered) => {
                let request = PendingRequest::new(user_id, &msg.first_name, &msg.last_name);
                match self
                    .with_store(self.store.create_pending(&request))
                    .await
                {
                    Ok(created) => {
                        if created {
                            info!(user_id, name = %request.display_name(), "Registration requested");
                            self.push(
                                self.owner_id,
                                &format!(
                                    "🆕 Registration request from {} (id {user_id}).\nUse /approve {user_id} or /reject {user_id}.",
                                    display_or_id(&request)
                                ),
                            )
                            .await;
                        }
                        OutgoingResponse::text(
                            "👋 Your request has been sent. You'll get a message once it is approved.",
                        )
                    }
                    Err(e) => store_failure("create_pending", e),
                }
            }
            Err(e) => access_failure(e),
        }
    }

    async fn list_pending(&self, user_id: i64) -> OutgoingResponse {
        let viewer = match self.access.require(user_id, Operation::ListDirectory).await {
            Ok(identity) => identity,
            Err(e) => return access_failure(e),
        };
        let pending = match self.with_store(self.store.list_pending()).await {
            Ok(p) => p,
            Err(e) => return store_failure("list_pending", e),
        };
        if pending.is_empty() {
            return OutgoingResponse::text("📭 No pending requests.");
        }

        let mut text = String::from("⏳ Pending requests:\n");
        let mut buttons = Vec::new();
        for request in &pending {
            text.push_str(&format!(
                "\n• {} (id {}) since {}",
                display_or_id(request),
                request.id,
                request.requested_at.format("%Y-%m-%d")
            ));
            if viewer.role.is_staff() {
                buttons.push(Button::new(
                    format!("✅ {}", display_or_id(request)),
                    format!("/approve {}", request.id),
                ));
                buttons.push(Button::new(
                    format!("❌ {}", display_or_id(request)),
                    format!("/reject {}", request.id),
                ));
            }
        }
        OutgoingResponse::text(text).with_buttons(buttons)
    }

    async fn reject(&self, user_id: i64, pending_id: i64) -> OutgoingResponse {
        if let Err(e) = self.access.require(user_id, Operation::ReviewPending).await {
            return access_failure(e);
        }
        let request = match self.with_store(self.store.get_pending(pending_id)).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                return OutgoingResponse::text(format!("❌ pending request '{pending_id}' not found"));
            }
            Err(e) => return store_failure("get_pending", e),
        };
        match self.with_store(self.store.delete_pending(pending_id)).await {
            Ok(true) => {
                info!(actor = user_id, pending_id, "Registration rejected");
                self.push(pending_id, "❌ Your registration request was declined.")
                    .await;
                OutgoingResponse::text(format!(
                    "Rejected {} (id {pending_id}).",
                    display_or_id(&request)
                ))
            }
            Ok(false) => {
                OutgoingResponse::text(format!("❌ pending request '{pending_id}' not found"))
            }
            Err(e) => store_failure("delete_pending", e),
        }
    }

    // ── Directory ───────────────────────────────────────────────────

    async fn list_users(&self, user_id: i64) -> OutgoingResponse {
        if let Err(e) = self.access.require(user_id, Operation::ListDirectory).await {
            return access_failure(e);
        }
        let identities = match self.with_store(self.store.list_identities()).await {
            Ok(i) => i,
            Err(e) => return store_failure("list_identities", e),
        };
        let mut text = String::from("👥 Users:\n");
        for identity in &identities {
            text.push_str(&format!(
                "\n• {} ({}){}{}",
                identity.alias,
                identity.role,
                if identity.division.is_empty() {
                    String::new()
                } else {
                    format!(", {}", identity.division)
                },
                if identity.can_assign {
                    ", can assign"
                } else {
                    ""
                }
            ));
        }
        OutgoingResponse::text(text)
    }

    async fn change_role(&self, user_id: i64, alias: &str, change: RoleChange) -> OutgoingResponse {
        match self.access.change_role(user_id, alias, change).await {
            Ok(target) => {
                let (notice, reply) = match change {
                    RoleChange::PromoteToAdmin => (
                        "⭐ You are now an admin. Send /help to see your new commands.",
                        format!("⭐ {} is now an admin.", target.alias),
                    ),
                    RoleChange::DemoteToUser => (
                        "You are no longer an admin.",
                        format!("{} is no longer an admin.", target.alias),
                    ),
                };
                self.push(target.id, notice).await;
                OutgoingResponse::text(reply)
            }
            Err(e) => access_failure(e),
        }
    }

    async fn remove_user(&self, user_id: i64, alias: &str) -> OutgoingResponse {
        match self.access.remove_identity(user_id, alias).await {
            Ok(removed) => {
                self.sessions.cancel(removed.id).await;
                OutgoingResponse::text(format!("🗑️ Removed {}.", removed.alias))
            }
            Err(e) => access_failure(e),
        }
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn list_tasks(&self, user_id: i64) -> OutgoingResponse {
        if let Err(e) = self.access.require(user_id, Operation::ListOwnTasks).await {
            return access_failure(e);
        }
        let tasks = match self.with_store(self.store.list_tasks_involving(user_id)).await {
            Ok(t) => t,
            Err(e) => return store_failure("list_tasks_involving", e),
        };
        if tasks.is_empty() {
            return OutgoingResponse::text("📭 No tasks.");
        }
        let aliases: HashMap<i64, String> = match self.with_store(self.store.list_identities()).await
        {
            Ok(identities) => identities.into_iter().map(|i| (i.id, i.alias)).collect(),
            Err(e) => return store_failure("list_identities", e),
        };

        let (received, given): (Vec<&Task>, Vec<&Task>) =
            tasks.iter().partition(|t| t.receiver_id == user_id);
        let mut text = String::new();
        if !received.is_empty() {
            text.push_str("📥 Assigned to you:\n");
            for task in &received {
                text.push_str(&task_line(task, "from", alias_of(&aliases, task.giver_id)));
            }
        }
        if !given.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("📤 Assigned by you:\n");
            for task in &given {
                text.push_str(&task_line(task, "to", alias_of(&aliases, task.receiver_id)));
            }
        }
        OutgoingResponse::text(text.trim_end().to_string())
    }

    async fn delete_task(&self, user_id: i64, task_id: i64) -> OutgoingResponse {
        if let Err(e) = self.access.require(user_id, Operation::DeleteTask).await {
            return access_failure(e);
        }
        let task = match self.with_store(self.store.get_task(task_id)).await {
            Ok(Some(task)) => task,
            Ok(None) => return OutgoingResponse::text(format!("❌ task '{task_id}' not found")),
            Err(e) => return store_failure("get_task", e),
        };
        match self.with_store(self.store.delete_task(task_id)).await {
            Ok(true) => {
                info!(actor = user_id, task_id, receiver = task.receiver_id, "Task deleted");
                OutgoingResponse::text(format!(
                    "🗑️ Task #{task_id} deleted: {} (due {})",
                    task.description, task.deadline
                ))
            }
            // Deleted by someone else in between.
            Ok(false) => OutgoingResponse::text(format!("❌ task '{task_id}' not found")),
            Err(e) => store_failure("delete_task", e),
        }
    }

    // ── Help ────────────────────────────────────────────────────────

    async fn help(&self, user_id: i64) -> OutgoingResponse {
        let identity = match self.access.resolve(user_id).await {
            Ok(Access::Known(identity)) => identity,
            Ok(Access::Pending) => {
                return OutgoingResponse::text(
                    "⏳ Your registration is waiting for approval.\n/whoami — show your status",
                );
            }
            Ok(Access::Unregistered) => {
                return OutgoingResponse::text("/start — request access\n/help — this message");
            }
            Err(e) => return access_failure(e),
        };
        OutgoingResponse::text(help_text(&identity, self.access.visibility()))
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn with_store<T, F>(&self, call: F) -> Result<T, DatabaseError>
    where
        F: std::future::Future<Output = Result<T, DatabaseError>>,
    {
        store::with_timeout(self.timeouts.store, call).await
    }

    async fn push(&self, user_id: i64, text: &str) {
        if let Err(e) =
            notify_within(self.notifier.as_ref(), self.timeouts.notify, user_id, text).await
        {
            warn!(user_id, error = %e, "Notification failed");
        }
    }
}

fn prompt_response(preface: Option<&str>, prompt: Prompt) -> OutgoingResponse {
    let text = match preface {
        Some(preface) => format!("{preface}\n\n{}", prompt.text),
        None => prompt.text,
    };
    OutgoingResponse::text(text).with_choices(&prompt.choices)
}

fn access_failure(err: AccessError) -> OutgoingResponse {
    match err {
        AccessError::Database(e) => store_failure("access check", e),
        other => OutgoingResponse::text(format!("⛔ {other}")),
    }
}

fn store_failure(context: &str, err: DatabaseError) -> OutgoingResponse {
    error!(context, error = %err, "Store call failed");
    OutgoingResponse::text(GENERIC_FAILURE)
}

fn display_or_id(request: &PendingRequest) -> String {
    let name = request.display_name();
    if name.is_empty() {
        format!("user {}", request.id)
    } else {
        name
    }
}

fn alias_of(aliases: &HashMap<i64, String>, id: i64) -> &str {
    aliases.get(&id).map(String::as_str).unwrap_or("(removed user)")
}

fn task_line(task: &Task, direction: &str, other: &str) -> String {
    format!(
        "• #{} {} (📅 {}, {direction} {other})\n",
        task.id, task.description, task.deadline
    )
}

fn help_text(identity: &Identity, visibility: crate::access::DirectoryVisibility) -> String {
    let mut lines = vec![
        "/list — your tasks".to_string(),
        "/whoami — your status".to_string(),
        "/cancel — abandon the current flow".to_string(),
    ];
    if identity.can_assign {
        lines.insert(0, "/add — assign a task".to_string());
    }
    if Operation::ListDirectory.permits(identity, visibility) {
        lines.push("/listusers — everyone registered".to_string());
        lines.push("/pending — registration requests".to_string());
    }
    if identity.role.is_staff() {
        lines.push("/approve <id> — approve a registration".to_string());
        lines.push("/reject <id> — decline a registration".to_string());
        lines.push("/editalias — change someone's alias or division".to_string());
        lines.push("/deletetask <id> — delete a task".to_string());
        lines.push("/removeuser <alias> — remove a user".to_string());
    }
    if Operation::ManageAdmins.permits(identity, visibility) {
        lines.push("/addadmin <alias> — make someone an admin".to_string());
        lines.push("/removeadmin <alias> — revoke admin".to_string());
    }
    lines.join("\n")
}
