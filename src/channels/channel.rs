//! Channel trait and the message types that cross it.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use uuid::Uuid;

use crate::error::ChannelError;

/// How an inbound message was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Typed text, including `/command` tokens.
    Text,
    /// An inline button press. `callback_id` is acknowledged by the channel.
    Selection { callback_id: String },
}

/// A message received from a chat user.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Uuid,
    pub channel: String,
    /// Chat user id; the key for identities, pending requests and sessions.
    pub user_id: i64,
    /// Chat to reply into. Equal to `user_id` in private chats.
    pub chat_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub content: String,
    pub kind: MessageKind,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(channel: &str, user_id: i64, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            user_id,
            chat_id: user_id,
            first_name: String::new(),
            last_name: String::new(),
            content: content.to_string(),
            kind: MessageKind::Text,
            received_at: Utc::now(),
        }
    }

    pub fn with_chat(mut self, chat_id: i64) -> Self {
        self.chat_id = chat_id;
        self
    }

    pub fn with_names(mut self, first_name: &str, last_name: &str) -> Self {
        self.first_name = first_name.to_string();
        self.last_name = last_name.to_string();
        self
    }

    pub fn as_selection(mut self, callback_id: &str) -> Self {
        self.kind = MessageKind::Selection {
            callback_id: callback_id.to_string(),
        };
        self
    }

    /// How long the message has waited since the channel received it.
    pub fn queued_for(&self, now: DateTime<Utc>) -> TimeDelta {
        (now - self.received_at).max(TimeDelta::zero())
    }
}

/// An inline button. `data` is sent back verbatim when pressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// A reply to an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingResponse {
    pub content: String,
    pub buttons: Vec<Button>,
}

impl OutgoingResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(mut self, buttons: Vec<Button>) -> Self {
        self.buttons = buttons;
        self
    }

    /// Buttons whose label and data are the same choice text.
    pub fn with_choices(self, choices: &[String]) -> Self {
        self.with_buttons(choices.iter().map(|c| Button::new(c, c)).collect())
    }
}

/// Stream of inbound messages produced by `Channel::start`.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A chat transport.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Begin receiving messages.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Reply into the chat `msg` came from.
    async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError>;

    async fn health_check(&self) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError>;
}

/// Proactive pushes to a user who did not just message the bot.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: i64, text: &str) -> Result<(), ChannelError>;
}

/// `Notifier::notify` under a deadline.
pub async fn notify_within(
    notifier: &dyn Notifier,
    limit: Duration,
    user_id: i64,
    text: &str,
) -> Result<(), ChannelError> {
    tokio::time::timeout(limit, notifier.notify(user_id, text))
        .await
        .map_err(|_| ChannelError::Timeout {
            name: "notify".into(),
            timeout: limit,
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_time_counts_from_receipt() {
        let msg = IncomingMessage::new("telegram", 5, "/whoami");
        let later = msg.received_at + TimeDelta::milliseconds(1500);
        assert_eq!(msg.queued_for(later), TimeDelta::milliseconds(1500));
        // A clock step backwards never yields a negative wait.
        let earlier = msg.received_at - TimeDelta::seconds(3);
        assert_eq!(msg.queued_for(earlier), TimeDelta::zero());
    }

    struct Stalled;

    #[async_trait]
    impl Notifier for Stalled {
        async fn notify(&self, _user_id: i64, _text: &str) -> Result<(), ChannelError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[test]
    fn incoming_defaults_to_private_text() {
        let msg = IncomingMessage::new("telegram", 42, "/start").with_names("Eve", "");
        assert_eq!(msg.chat_id, 42);
        assert_eq!(msg.kind, MessageKind::Text);
        assert_eq!(msg.first_name, "Eve");
    }

    #[test]
    fn choices_become_buttons() {
        let resp = OutgoingResponse::text("pick").with_choices(&["true".into(), "false".into()]);
        assert_eq!(resp.buttons.len(), 2);
        assert_eq!(resp.buttons[1], Button::new("false", "false"));
    }

    #[tokio::test]
    async fn notify_within_times_out() {
        let err = notify_within(&Stalled, Duration::from_millis(10), 1, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
    }
}
