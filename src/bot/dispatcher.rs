//! Per-user message dispatch.
//!
//! Each user gets an inbox drained by one worker task, so a user's messages
//! are handled strictly in arrival order while different users proceed in
//! parallel. A worker exits after sitting idle and is respawned on the next
//! message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bot::handler::Bot;
use crate::channels::{Channel, IncomingMessage};

/// How long a worker waits for the next message before exiting.
pub const DEFAULT_INBOX_IDLE: Duration = Duration::from_secs(300);

type Inbox = mpsc::UnboundedSender<IncomingMessage>;

pub struct Dispatcher {
    bot: Arc<Bot>,
    channel: Arc<dyn Channel>,
    respond_timeout: Duration,
    idle: Duration,
    inboxes: Mutex<HashMap<i64, Inbox>>,
}

impl Dispatcher {
    pub fn new(bot: Arc<Bot>, channel: Arc<dyn Channel>, respond_timeout: Duration) -> Self {
        Self {
            bot,
            channel,
            respond_timeout,
            idle: DEFAULT_INBOX_IDLE,
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Number of users with a live worker.
    pub fn active_inboxes(&self) -> usize {
        self.inboxes().len()
    }

    /// Queue `msg` on its sender's inbox, starting a worker if none is live.
    pub fn dispatch(self: &Arc<Self>, msg: IncomingMessage) {
        let user_id = msg.user_id;
        let mut inboxes = self.inboxes();

        let msg = match inboxes.get(&user_id) {
            Some(inbox) => match inbox.send(msg) {
                Ok(()) => return,
                // Worker died without deregistering; replace it.
                Err(mpsc::error::SendError(msg)) => {
                    warn!(user_id, "Inbox worker gone, respawning");
                    msg
                }
            },
            None => msg,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(msg);
        inboxes.insert(user_id, tx);
        drop(inboxes);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_inbox(user_id, rx).await });
    }

    async fn run_inbox(&self, user_id: i64, mut rx: mpsc::UnboundedReceiver<IncomingMessage>) {
        debug!(user_id, "Inbox worker started");
        loop {
            let msg = match tokio::time::timeout(self.idle, rx.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(_) => {
                    // A dispatch may have slipped in between the timeout and
                    // taking the lock; deregister only if the inbox is empty.
                    let mut inboxes = self.inboxes();
                    match rx.try_recv() {
                        Ok(msg) => msg,
                        Err(_) => {
                            inboxes.remove(&user_id);
                            break;
                        }
                    }
                }
            };
            self.process(msg).await;
        }
        debug!(user_id, "Inbox worker idle, exiting");
    }

    async fn process(&self, msg: IncomingMessage) {
        debug!(
            message_id = %msg.id,
            channel = %msg.channel,
            user_id = msg.user_id,
            queued_ms = msg.queued_for(Utc::now()).num_milliseconds(),
            "Handling message"
        );
        let response = self.bot.handle(&msg).await;
        match tokio::time::timeout(self.respond_timeout, self.channel.respond(&msg, response)).await
        {
            Ok(Ok(())) => debug!(
                message_id = %msg.id,
                elapsed_ms = msg.queued_for(Utc::now()).num_milliseconds(),
                "Reply sent"
            ),
            Ok(Err(e)) => warn!(
                message_id = %msg.id,
                channel = %msg.channel,
                user_id = msg.user_id,
                error = %e,
                "Failed to send reply"
            ),
            Err(_) => warn!(
                message_id = %msg.id,
                channel = %msg.channel,
                user_id = msg.user_id,
                timeout = ?self.respond_timeout,
                "Reply timed out"
            ),
        }
    }

    fn inboxes(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Inbox>> {
        self.inboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::access::{AccessControl, DirectoryVisibility, Role};
    use crate::channels::recording::RecordingNotifier;
    use crate::channels::{MessageStream, OutgoingResponse};
    use crate::config::Timeouts;
    use crate::error::ChannelError;
    use crate::session::SessionManager;
    use crate::store::{Database, Identity, LibSqlBackend};

    #[derive(Default)]
    struct CapturingChannel {
        replies: Mutex<Vec<(i64, String)>>,
    }

    impl CapturingChannel {
        fn replies_to(&self, user_id: i64) -> Vec<String> {
            self.replies
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| *id == user_id)
                .map(|(_, text)| text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Channel for CapturingChannel {
        fn name(&self) -> &str {
            "capture"
        }

        async fn start(&self) -> Result<MessageStream, ChannelError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn respond(
            &self,
            msg: &IncomingMessage,
            response: OutgoingResponse,
        ) -> Result<(), ChannelError> {
            self.replies
                .lock()
                .unwrap()
                .push((msg.user_id, response.content));
            Ok(())
        }

        async fn health_check(&self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    async fn setup(idle: Duration) -> (Arc<LibSqlBackend>, Arc<CapturingChannel>, Arc<Dispatcher>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.insert_identity(&Identity {
            role: Role::Owner,
            ..Identity::approved(1, "owner", "", true)
        })
        .await
        .unwrap();
        db.insert_identity(&Identity::approved(2, "bob", "", true))
            .await
            .unwrap();
        db.insert_identity(&Identity::approved(3, "carol", "", false))
            .await
            .unwrap();

        let notifier = Arc::new(RecordingNotifier::new());
        let timeouts = Timeouts::default();
        let access = Arc::new(AccessControl::new(
            db.clone(),
            DirectoryVisibility::AnyKnown,
            timeouts.store,
        ));
        let sessions = Arc::new(SessionManager::new(db.clone(), notifier.clone(), timeouts));
        let bot = Arc::new(Bot::new(db.clone(), access, sessions, notifier, timeouts, 1));
        let channel = Arc::new(CapturingChannel::default());
        let dispatcher =
            Arc::new(Dispatcher::new(bot, channel.clone(), Duration::from_secs(5)).with_idle(idle));
        (db, channel, dispatcher)
    }

    async fn wait_for_replies(channel: &CapturingChannel, user_id: i64, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let replies = channel.replies_to(user_id);
            if replies.len() >= count {
                return replies;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} replies to {user_id}");
    }

    fn text(user_id: i64, content: &str) -> IncomingMessage {
        IncomingMessage::new("capture", user_id, content)
    }

    #[tokio::test]
    async fn user_messages_are_handled_in_order() {
        let (db, channel, dispatcher) = setup(DEFAULT_INBOX_IDLE).await;

        // Queued back to back; any reordering would break the flow.
        for content in ["/add", "Ship report", "2025-07-15", "carol"] {
            dispatcher.dispatch(text(1, content));
        }
        for content in ["/add", "Review", "2025-07-20", "carol"] {
            dispatcher.dispatch(text(2, content));
        }

        let owner = wait_for_replies(&channel, 1, 4).await;
        assert!(owner[0].contains("What is the task"));
        assert!(owner[1].contains("deadline"));
        assert!(owner[2].contains("Who is this task for"));
        assert!(owner[3].contains("Ship report"));

        let bob = wait_for_replies(&channel, 2, 4).await;
        assert!(bob[3].contains("Review"));

        assert_eq!(db.list_tasks_involving(3).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn idle_worker_exits_and_is_respawned() {
        let (_db, channel, dispatcher) = setup(Duration::from_millis(20)).await;

        dispatcher.dispatch(text(3, "/whoami"));
        wait_for_replies(&channel, 3, 1).await;

        for _ in 0..100 {
            if dispatcher.active_inboxes() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dispatcher.active_inboxes(), 0);

        dispatcher.dispatch(text(3, "/whoami"));
        let replies = wait_for_replies(&channel, 3, 2).await;
        assert!(replies[1].contains("carol"));
    }
}
