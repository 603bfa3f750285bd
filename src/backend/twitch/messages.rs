use serde::{Deserialize, Serialize};

use super::error::{Result, TwitchError};

/// WebSocket message received from Twitch EventSub
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventSubMessage {
    pub metadata: Metadata,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    pub message_id: String,
    pub message_type: String,
    pub message_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_version: Option<String>,
}

/// Session object carried by `session_welcome` and `session_reconnect`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Session {
    pub id: String,
    pub status: String,
    pub connected_at: String,
    /// Null in `session_reconnect` messages
    pub keepalive_timeout_seconds: Option<u64>,
    pub reconnect_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionPayload {
    session: Session,
}

/// Notification payload containing events
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationPayload {
    pub subscription: SubscriptionInfo,
    pub event: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    pub status: String,
    #[serde(default)]
    pub cost: u32,
    #[serde(default)]
    pub condition: serde_json::Value,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RevocationPayload {
    subscription: SubscriptionInfo,
}

/// An EventSub frame after its payload has been decoded by `message_type`
#[derive(Debug, Clone)]
pub enum Frame {
    Welcome(Session),
    Keepalive,
    Reconnect(Session),
    Notification(NotificationPayload),
    Revocation(SubscriptionInfo),
    Unknown(String),
}

impl EventSubMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn into_frame(self) -> Result<Frame> {
        let frame = match self.metadata.message_type.as_str() {
            "session_welcome" => {
                let payload: SessionPayload = serde_json::from_value(self.payload)?;
                Frame::Welcome(payload.session)
            }
            "session_keepalive" => Frame::Keepalive,
            "session_reconnect" => {
                let payload: SessionPayload = serde_json::from_value(self.payload)?;
                Frame::Reconnect(payload.session)
            }
            "notification" => Frame::Notification(serde_json::from_value(self.payload)?),
            "revocation" => {
                let payload: RevocationPayload = serde_json::from_value(self.payload)?;
                Frame::Revocation(payload.subscription)
            }
            other => Frame::Unknown(other.to_string()),
        };
        Ok(frame)
    }
}

/// Chat message event from channel.chat.message subscription
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessageEvent {
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
    pub broadcaster_user_name: String,
    pub chatter_user_id: String,
    pub chatter_user_login: String,
    pub chatter_user_name: String,
    pub message_id: String,
    pub message: Message,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub badges: Vec<Badge>,
    pub message_type: String,
    pub reply: Option<Reply>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Badge {
    pub set_id: String,
    pub id: String,
    pub info: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Reply {
    pub parent_message_id: String,
    pub parent_message_body: String,
    pub parent_user_id: String,
    pub parent_user_login: String,
    pub thread_message_id: String,
}

/// Message delete event
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageDeleteEvent {
    pub broadcaster_user_id: String,
    pub target_user_id: String,
    pub target_user_login: String,
    pub message_id: String,
}

/// Clear user messages event (ban/timeout)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClearUserMessagesEvent {
    pub broadcaster_user_id: String,
    pub target_user_id: String,
    pub target_user_login: String,
}

/// Chat clear event
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatClearEvent {
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
}

/// Events that can be received from Twitch
#[derive(Debug, Clone)]
pub enum TwitchEvent {
    ChatMessage(ChatMessageEvent),
    MessageDelete(MessageDeleteEvent),
    ClearUserMessages(ClearUserMessagesEvent),
    ChatClear(ChatClearEvent),
    Other {
        subscription_type: String,
        event: serde_json::Value,
    },
}

impl TwitchEvent {
    /// Parse event data based on subscription type
    pub fn parse(subscription_type: &str, event: serde_json::Value) -> Result<Self> {
        let parsed = match subscription_type {
            "channel.chat.message" => TwitchEvent::ChatMessage(serde_json::from_value(event)?),
            "channel.chat.message_delete" => {
                TwitchEvent::MessageDelete(serde_json::from_value(event)?)
            }
            "channel.chat.clear_user_messages" => {
                TwitchEvent::ClearUserMessages(serde_json::from_value(event)?)
            }
            "channel.chat.clear" => TwitchEvent::ChatClear(serde_json::from_value(event)?),
            _ => TwitchEvent::Other {
                subscription_type: subscription_type.to_string(),
                event,
            },
        };
        Ok(parsed)
    }
}

impl NotificationPayload {
    pub fn into_event(self) -> Result<TwitchEvent> {
        TwitchEvent::parse(&self.subscription.subscription_type, self.event).map_err(|e| {
            TwitchError::MalformedPayload(format!(
                "{} event: {}",
                self.subscription.subscription_type, e
            ))
        })
    }
}
