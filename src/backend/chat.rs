use crate::backend::cache::AppCache;
use crate::backend::twitch::{Result, SendChatMessageRequest, SendMessageData, TwitchError};

/// Sends chat messages as the bot into the broadcaster's channel
#[derive(Clone)]
pub struct ChatSender {
    cache: AppCache,
}

impl ChatSender {
    pub fn new(cache: AppCache) -> Self {
        Self { cache }
    }

    /// True only if Twitch accepted the message. Why it failed goes to the
    /// message log.
    pub async fn send(&self, message: &str, reply_parent_message_id: Option<&str>) -> bool {
        match self.try_send(message, reply_parent_message_id).await {
            Ok(data) if data.is_sent => {
                log::debug!("Chat message sent: {}", data.message_id);
                true
            }
            Ok(data) => {
                let reason = data
                    .drop_reason
                    .map(|r| format!("{} ({})", r.message, r.code))
                    .unwrap_or_else(|| "no reason given".to_string());
                self.cache
                    .log()
                    .warning(format!("Chat message was dropped: {}", reason));
                false
            }
            Err(e) => {
                self.cache
                    .log()
                    .error(format!("Could not send chat message: {}", e));
                false
            }
        }
    }

    async fn try_send(
        &self,
        message: &str,
        reply_parent_message_id: Option<&str>,
    ) -> Result<SendMessageData> {
        self.cache.config().await.ok_or_else(|| unavailable("configuration"))?;
        let broadcaster = self
            .cache
            .broadcaster()
            .await
            .ok_or_else(|| unavailable("broadcaster identity"))?;
        let bot = self
            .cache
            .bot()
            .await
            .ok_or_else(|| unavailable("bot identity"))?;
        let tokens = self
            .cache
            .tokens()
            .await
            .ok_or_else(|| unavailable("credentials"))?;
        let access_token = tokens.access_token().await?;

        let request = SendChatMessageRequest {
            broadcaster_id: broadcaster.id.clone(),
            sender_id: bot.id.clone(),
            message: message.to_string(),
            reply_parent_message_id: reply_parent_message_id.map(str::to_string),
        };
        tokens.helix().send_chat_message(&access_token, &request).await
    }
}

fn unavailable(what: &str) -> TwitchError {
    TwitchError::ConfigMissing(format!("{} unavailable", what))
}
