//! Session manager: at most one dialog per user, advanced one message at a
//! time.
//!
//! Each user's session lives in its own slot guarded by an async mutex, so
//! `begin`, `step` and `cancel` for one user never overlap while different
//! users proceed in parallel. The slot map lock is only held for lookups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{Notifier, notify_within};
use crate::config::Timeouts;
use crate::dialog::{
    Advance, DialogSession, Flow, FlowContext, Notice, Prompt, Start, Step, flows,
};
use crate::error::DialogError;
use crate::store::Database;

type Slot = Arc<tokio::sync::Mutex<Option<DialogSession>>>;

/// Result of feeding one message to an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Input accepted; here is the next question.
    Prompt(Prompt),
    /// The flow committed and the session is gone.
    Completion(String),
    /// Input rejected; the session stays on the same step.
    Rejection { message: String, prompt: Prompt },
}

/// Result of `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(Flow),
    NoActiveSession,
}

/// Owns every in-flight dialog.
pub struct SessionManager {
    store: Arc<dyn Database>,
    notifier: Arc<dyn Notifier>,
    timeouts: Timeouts,
    slots: Mutex<HashMap<i64, Slot>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Database>, notifier: Arc<dyn Notifier>, timeouts: Timeouts) -> Self {
        Self {
            store,
            notifier,
            timeouts,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn ctx(&self) -> FlowContext<'_> {
        FlowContext {
            store: self.store.as_ref(),
            timeout: self.timeouts.store,
        }
    }

    fn slot(&self, user_id: i64) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(user_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    fn existing_slot(&self, user_id: i64) -> Option<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
    }

    /// Start a flow for `user_id` and return its first prompt.
    ///
    /// Fails with `AlreadyActive` if the user has a session, which is left
    /// untouched. Fails with `NotFound` if the record the flow operates on is
    /// missing; no session is created then.
    pub async fn begin(&self, user_id: i64, start: Start) -> Result<(Uuid, Prompt), DialogError> {
        let slot = self.slot(user_id);
        let mut guard = slot.lock().await;
        if guard.is_some() {
            return Err(DialogError::AlreadyActive);
        }

        let session = flows::open(user_id, start, self.ctx()).await?;
        let prompt = flows::prompt(&session, self.ctx()).await?;
        let id = session.id;
        info!(user_id, session_id = %id, flow = %session.flow(), "Dialog started");
        *guard = Some(session);
        Ok((id, prompt))
    }

    /// Feed one raw input to the user's active session.
    ///
    /// Every error except `NoActiveSession` means the session was destroyed.
    pub async fn step(&self, user_id: i64, raw: &str) -> Result<StepOutcome, DialogError> {
        let slot = self
            .existing_slot(user_id)
            .ok_or(DialogError::NoActiveSession)?;
        let mut guard = slot.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(DialogError::NoActiveSession);
        };
        session.touch();

        let advanced = flows::apply_input(session, raw, self.ctx()).await;
        let outcome = match advanced {
            Ok(Advance::Next) => flows::prompt(session, self.ctx()).await.map(StepOutcome::Prompt),
            Err(DialogError::Validation(message)) => flows::prompt(session, self.ctx())
                .await
                .map(|prompt| StepOutcome::Rejection { message, prompt }),
            Ok(Advance::Commit(commit)) => {
                // The slot stays locked until the commit and its push finish,
                // so begin/cancel for this user wait for the outcome.
                if let Some(finished) = guard.take() {
                    debug!(user_id, session_id = %finished.id, "Committing dialog");
                }
                let done = commit.execute(self.ctx()).await.inspect_err(|e| {
                    warn!(user_id, error = %e, "Dialog commit failed");
                })?;
                if let Some(notice) = done.notice {
                    self.push(notice).await;
                }
                drop(guard);
                return Ok(StepOutcome::Completion(done.reply));
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            warn!(user_id, error = %e, "Dialog aborted");
            *guard = None;
        }
        outcome
    }

    /// Destroy the user's session, if any. Idempotent.
    pub async fn cancel(&self, user_id: i64) -> CancelOutcome {
        let Some(slot) = self.existing_slot(user_id) else {
            return CancelOutcome::NoActiveSession;
        };
        let mut guard = slot.lock().await;
        match guard.take() {
            Some(session) => {
                info!(user_id, session_id = %session.id, flow = %session.flow(), "Dialog cancelled");
                CancelOutcome::Cancelled(session.flow())
            }
            None => CancelOutcome::NoActiveSession,
        }
    }

    pub async fn active_flow(&self, user_id: i64) -> Option<Flow> {
        let slot = self.existing_slot(user_id)?;
        let guard = slot.lock().await;
        guard.as_ref().map(DialogSession::flow)
    }

    pub async fn current_step(&self, user_id: i64) -> Option<Step> {
        let slot = self.existing_slot(user_id)?;
        let guard = slot.lock().await;
        guard.as_ref().map(|s| s.step)
    }

    /// Drop sessions idle for at least `max_idle`. Sessions busy with a
    /// message are skipped. Returns how many were dropped.
    pub async fn prune_idle(&self, max_idle: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return 0;
        };

        let snapshot: Vec<(i64, Slot)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut pruned = 0;
        for (user_id, slot) in snapshot {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            if guard.as_ref().is_some_and(|s| s.last_activity <= cutoff) {
                if let Some(session) = guard.take() {
                    info!(user_id, session_id = %session.id, flow = %session.flow(), "Idle dialog dropped");
                }
                pruned += 1;
            }
        }

        // Forget empty slots nobody is waiting on.
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, slot| {
                Arc::strong_count(slot) > 1
                    || slot.try_lock().map(|g| g.is_some()).unwrap_or(true)
            });

        pruned
    }

    async fn push(&self, notice: Notice) {
        if let Err(e) = notify_within(
            self.notifier.as_ref(),
            self.timeouts.notify,
            notice.user_id,
            &notice.text,
        )
        .await
        {
            warn!(user_id = notice.user_id, error = %e, "Notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::access::Role;
    use crate::channels::recording::RecordingNotifier;
    use crate::store::{Identity, LibSqlBackend, PendingRequest, Task};

    const OWNER: i64 = 1;
    const ADMIN: i64 = 2;
    const BOB: i64 = 3;

    struct Harness {
        db: Arc<LibSqlBackend>,
        notifier: Arc<RecordingNotifier>,
        sessions: SessionManager,
    }

    async fn harness() -> Harness {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.insert_identity(&Identity {
            role: Role::Owner,
            ..Identity::approved(OWNER, "owner", "", true)
        })
        .await
        .unwrap();
        db.insert_identity(&Identity {
            role: Role::Admin,
            ..Identity::approved(ADMIN, "alice", "ops", true)
        })
        .await
        .unwrap();
        db.insert_identity(&Identity::approved(BOB, "bob", "eng", false))
            .await
            .unwrap();
        db.create_pending(&PendingRequest::new(10, "Eve", ""))
            .await
            .unwrap();
        db.create_pending(&PendingRequest::new(11, "Mallory", ""))
            .await
            .unwrap();

        let notifier = Arc::new(RecordingNotifier::new());
        let sessions = SessionManager::new(db.clone(), notifier.clone(), Timeouts::default());
        Harness {
            db,
            notifier,
            sessions,
        }
    }

    async fn snapshot(db: &LibSqlBackend) -> (Vec<Identity>, Vec<PendingRequest>, Vec<Task>) {
        (
            db.list_identities().await.unwrap(),
            db.list_pending().await.unwrap(),
            db.list_tasks().await.unwrap(),
        )
    }

    #[tokio::test]
    async fn add_task_happy_path() {
        let h = harness().await;
        h.sessions.begin(OWNER, Start::AddTask).await.unwrap();

        assert!(matches!(
            h.sessions.step(OWNER, "Ship report").await.unwrap(),
            StepOutcome::Prompt(_)
        ));
        assert!(matches!(
            h.sessions.step(OWNER, "2025-07-15").await.unwrap(),
            StepOutcome::Prompt(_)
        ));
        let done = h.sessions.step(OWNER, "bob").await.unwrap();
        assert!(matches!(done, StepOutcome::Completion(_)));

        let tasks = h.db.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].receiver_id, BOB);
        assert_eq!(tasks[0].giver_id, OWNER);
        assert_eq!(tasks[0].description, "Ship report");
        assert_eq!(tasks[0].deadline, NaiveDate::from_ymd_opt(2025, 7, 15).unwrap());

        assert_eq!(h.notifier.sent().len(), 1);
        assert_eq!(h.notifier.sent_to(BOB).len(), 1);
        assert!(h.notifier.sent_to(BOB)[0].contains("Ship report"));

        assert_eq!(h.sessions.active_flow(OWNER).await, None);
    }

    #[tokio::test]
    async fn second_begin_fails_and_keeps_session() {
        let h = harness().await;
        h.sessions.begin(OWNER, Start::AddTask).await.unwrap();
        h.sessions.step(OWNER, "Ship report").await.unwrap();

        let err = h.sessions.begin(OWNER, Start::EditAlias).await.unwrap_err();
        assert!(matches!(err, DialogError::AlreadyActive));
        assert_eq!(h.sessions.active_flow(OWNER).await, Some(Flow::AddTask));
        assert_eq!(h.sessions.current_step(OWNER).await, Some(Step::AskDeadline));

        // Accumulated description survives the failed begin.
        h.sessions.step(OWNER, "2025-07-15").await.unwrap();
        h.sessions.step(OWNER, "bob").await.unwrap();
        let tasks = h.db.list_tasks().await.unwrap();
        assert_eq!(tasks[0].description, "Ship report");
    }

    #[tokio::test]
    async fn bad_deadline_reprompts_same_step() {
        let h = harness().await;
        h.sessions.begin(OWNER, Start::AddTask).await.unwrap();
        h.sessions.step(OWNER, "Ship report").await.unwrap();

        let outcome = h.sessions.step(OWNER, "15-07-2025").await.unwrap();
        match outcome {
            StepOutcome::Rejection { message, prompt } => {
                assert!(message.contains("YYYY-MM-DD"));
                assert!(prompt.text.contains("deadline"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(h.sessions.current_step(OWNER).await, Some(Step::AskDeadline));
        assert!(h.db.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_receiver_aborts_flow() {
        let h = harness().await;
        h.sessions.begin(OWNER, Start::AddTask).await.unwrap();
        h.sessions.step(OWNER, "Ship report").await.unwrap();
        h.sessions.step(OWNER, "2025-07-15").await.unwrap();

        let err = h.sessions.step(OWNER, "nobody").await.unwrap_err();
        assert!(matches!(err, DialogError::NotFound { .. }));
        assert_eq!(h.sessions.active_flow(OWNER).await, None);
        assert!(h.db.list_tasks().await.unwrap().is_empty());
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn approving_missing_pending_is_not_found() {
        let h = harness().await;
        let before = h.db.list_identities().await.unwrap();

        let err = h
            .sessions
            .begin(ADMIN, Start::ApproveUser { pending_id: 999 })
            .await
            .unwrap_err();
        assert!(matches!(err, DialogError::NotFound { .. }));
        assert_eq!(h.sessions.active_flow(ADMIN).await, None);
        assert_eq!(h.db.list_identities().await.unwrap(), before);
    }

    #[tokio::test]
    async fn concurrent_approvals_with_same_alias_leave_one_winner() {
        let h = harness().await;
        for (actor, pending) in [(OWNER, 10), (ADMIN, 11)] {
            h.sessions
                .begin(actor, Start::ApproveUser { pending_id: pending })
                .await
                .unwrap();
            h.sessions.step(actor, "zeta").await.unwrap();
            h.sessions.step(actor, "-").await.unwrap();
            assert_eq!(h.sessions.current_step(actor).await, Some(Step::AskPermission));
        }

        let (a, b) = tokio::join!(
            h.sessions.step(OWNER, "true"),
            h.sessions.step(ADMIN, "false")
        );
        let results = [a, b];
        let wins = results
            .iter()
            .filter(|r| matches!(r, Ok(StepOutcome::Completion(_))))
            .count();
        let losses = results
            .iter()
            .filter(|r| matches!(r, Err(DialogError::Validation(_))))
            .count();
        assert_eq!((wins, losses), (1, 1));

        let zetas: Vec<_> = h
            .db
            .list_identities()
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.alias.eq_ignore_ascii_case("zeta"))
            .collect();
        assert_eq!(zetas.len(), 1);
        // The loser's registration is still pending.
        assert_eq!(h.db.list_pending().await.unwrap().len(), 1);
        assert_eq!(h.sessions.active_flow(OWNER).await, None);
        assert_eq!(h.sessions.active_flow(ADMIN).await, None);
    }

    #[tokio::test]
    async fn cancel_at_any_step_leaves_store_unchanged() {
        let h = harness().await;
        let before = snapshot(&h.db).await;

        let scripts: [(Start, &[&str]); 3] = [
            (Start::AddTask, &["Ship report", "2025-07-15"]),
            (Start::ApproveUser { pending_id: 10 }, &["eve", "ops"]),
            (Start::EditAlias, &["bob"]),
        ];
        for (start, inputs) in scripts {
            for cut in 0..=inputs.len() {
                h.sessions.begin(OWNER, start.clone()).await.unwrap();
                for input in &inputs[..cut] {
                    h.sessions.step(OWNER, input).await.unwrap();
                }
                assert!(matches!(
                    h.sessions.cancel(OWNER).await,
                    CancelOutcome::Cancelled(_)
                ));
                assert_eq!(snapshot(&h.db).await, before);
            }
        }
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let h = harness().await;
        assert_eq!(h.sessions.cancel(BOB).await, CancelOutcome::NoActiveSession);
        h.sessions.begin(OWNER, Start::EditAlias).await.unwrap();
        assert_eq!(
            h.sessions.cancel(OWNER).await,
            CancelOutcome::Cancelled(Flow::EditAlias)
        );
        assert_eq!(h.sessions.cancel(OWNER).await, CancelOutcome::NoActiveSession);
    }

    #[tokio::test]
    async fn step_without_session() {
        let h = harness().await;
        let err = h.sessions.step(BOB, "hello").await.unwrap_err();
        assert!(matches!(err, DialogError::NoActiveSession));
    }

    #[tokio::test]
    async fn notification_failure_does_not_abort_commit() {
        let h = harness().await;
        h.notifier.fail_for(BOB);

        h.sessions.begin(OWNER, Start::AddTask).await.unwrap();
        h.sessions.step(OWNER, "Ship report").await.unwrap();
        h.sessions.step(OWNER, "2025-07-15").await.unwrap();
        let done = h.sessions.step(OWNER, "bob").await.unwrap();

        assert!(matches!(done, StepOutcome::Completion(_)));
        assert_eq!(h.db.list_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn approval_notifies_new_user() {
        let h = harness().await;
        h.sessions
            .begin(ADMIN, Start::ApproveUser { pending_id: 10 })
            .await
            .unwrap();
        h.sessions.step(ADMIN, "eve").await.unwrap();
        h.sessions.step(ADMIN, "ops").await.unwrap();
        h.sessions.step(ADMIN, "FALSE").await.unwrap();

        let eve = h.db.get_identity(10).await.unwrap().unwrap();
        assert_eq!(eve.role, Role::User);
        assert!(!eve.can_assign);
        assert_eq!(h.notifier.sent_to(10).len(), 1);
    }

    #[tokio::test]
    async fn begin_and_cancel_wait_for_an_in_flight_commit() {
        let h = harness().await;
        h.notifier.delay_all(Duration::from_millis(300));
        let sessions = Arc::new(SessionManager::new(
            h.db.clone(),
            h.notifier.clone(),
            Timeouts::default(),
        ));
        sessions.begin(OWNER, Start::AddTask).await.unwrap();
        sessions.step(OWNER, "Ship report").await.unwrap();
        sessions.step(OWNER, "2025-07-15").await.unwrap();

        let committing = {
            let sessions = sessions.clone();
            tokio::spawn(async move { sessions.step(OWNER, "bob").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Both calls queue behind the commit and its push.
        assert_eq!(sessions.cancel(OWNER).await, CancelOutcome::NoActiveSession);
        assert_eq!(h.notifier.sent_to(BOB).len(), 1);
        assert_eq!(h.db.list_tasks().await.unwrap().len(), 1);
        assert!(sessions.begin(OWNER, Start::EditAlias).await.is_ok());

        let done = committing.await.unwrap().unwrap();
        assert!(matches!(done, StepOutcome::Completion(_)));
    }

    #[tokio::test]
    async fn prune_drops_only_idle_sessions() {
        let h = harness().await;
        h.sessions.begin(OWNER, Start::AddTask).await.unwrap();

        assert_eq!(h.sessions.prune_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(h.sessions.active_flow(OWNER).await, Some(Flow::AddTask));

        assert_eq!(h.sessions.prune_idle(Duration::ZERO).await, 1);
        assert_eq!(h.sessions.active_flow(OWNER).await, None);
        assert!(h.sessions.begin(OWNER, Start::AddTask).await.is_ok());
    }
}
