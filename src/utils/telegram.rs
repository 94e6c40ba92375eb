use anyhow::{Context, Result};
use log::info;
use teloxide::prelude::{ChatId, Requester};
use teloxide::Bot;

use crate::utils::notifier::Transport;

/// Delivers messages to a single Telegram chat.
pub struct TelegramTransport {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramTransport {
    pub fn new(bot_token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(bot_token),
            chat_id: ChatId(chat_id),
        }
    }
}

impl Transport for TelegramTransport {
    // Sends the constructed message to the chat
    async fn send(&self, message: &str) -> Result<()> {
        let sent = self
            .bot
            .send_message(self.chat_id, message)
            .await
            .context("Text message wasn't sent")?;
        info!("Text message sent successfully {:?}", sent.id);
        Ok(())
    }
}
