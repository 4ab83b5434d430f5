/// Telegram side of the delivery pipeline.
use std::path::Path;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::InputFile;
use tracing::{error, info, warn};

use vidbot_downloader::ChatSink;
use vidbot_shared::errors::DeliveryError;
use vidbot_shared::models::AttachmentKind;

/// Sends files and status messages to one chat.
pub struct TelegramSink {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramSink {
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        Self { bot, chat_id }
    }
}

#[async_trait]
impl ChatSink for TelegramSink {
    async fn send_file(&self, path: &Path, kind: AttachmentKind) -> Result<(), DeliveryError> {
        let input = InputFile::file(path.to_path_buf());
        let result = match kind {
            AttachmentKind::Document => self.bot.send_document(self.chat_id, input).await.map(|_| ()),
            AttachmentKind::Audio => self.bot.send_audio(self.chat_id, input).await.map(|_| ()),
        };
        match result {
            Ok(()) => {
                info!("Sent {:?} to chat {} as {:?}", path, self.chat_id, kind);
                Ok(())
            }
            Err(e) => {
                error!("Upload of {:?} to chat {} failed: {}", path, self.chat_id, e);
                Err(DeliveryError(upload_error_message(&e)))
            }
        }
    }

    async fn notify(&self, text: &str) {
        if let Err(e) = self.bot.send_message(self.chat_id, text).await {
            warn!("Failed to notify chat {}: {}", self.chat_id, e);
        }
    }
}

/// Convert a Telegram API error into a short chat message.
fn upload_error_message(err: &teloxide::RequestError) -> String {
    let err_str = err.to_string();
    if err_str.contains("Request Entity Too Large") || err_str.contains("too big") {
        "Telegram rejected the file as too large.".to_string()
    } else if err_str.contains("timed out") || err_str.contains("operation timed out") {
        "The upload timed out.".to_string()
    } else if err_str.contains("bot was blocked") {
        "The bot was blocked by the user.".to_string()
    } else {
        err_str
    }
}
