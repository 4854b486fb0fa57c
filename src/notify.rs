//! Рассылка уведомлений в Telegram: групповой чат или список админов.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{MessageId, ThreadId};

/// Адресат уведомления.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Групповой чат уведомлений, иначе все администраторы.
    Admins,
    /// Конкретный чат (например, владеющий агент).
    Chat(i64),
}

/// Канал уведомлений ядра. Отправка fire-and-forget: сбои только логируются.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, audience: Audience, message: &str);
}

pub struct TelegramNotifier {
    bot: Bot,
    group_chat_id: Option<i64>,
    topic_id: Option<i32>,
    admin_ids: Vec<i64>,
}

impl TelegramNotifier {
    pub fn new(
        bot: Bot,
        group_chat_id: Option<i64>,
        topic_id: Option<i32>,
        admin_ids: Vec<i64>,
    ) -> Self {
        Self {
            bot,
            group_chat_id,
            topic_id,
            admin_ids,
        }
    }

    async fn send_to_chat(&self, chat_id: i64, message: &str, in_topic: bool) {
        let mut request = self.bot.send_message(ChatId(chat_id), message);
        if in_topic && let Some(topic_id) = self.topic_id {
            request = request.message_thread_id(ThreadId(MessageId(topic_id)));
        }
        if let Err(error) = request.await {
            tracing::warn!(
                chat_id = chat_id,
                error = %error,
                "Не удалось отправить уведомление"
            );
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn notify(&self, audience: Audience, message: &str) {
        match audience {
            Audience::Admins => {
                if let Some(group_chat_id) = self.group_chat_id {
                    self.send_to_chat(group_chat_id, message, true).await;
                    return;
                }
                for admin_id in &self.admin_ids {
                    self.send_to_chat(*admin_id, message, false).await;
                }
            }
            Audience::Chat(chat_id) => {
                self.send_to_chat(chat_id, message, false).await;
            }
        }
    }
}
