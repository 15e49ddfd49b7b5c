//! Deliver filtered announcements to users.
//!
//! Delivery is best effort and at most once: a failed user is logged and
//! reported, and the wave goes on with the next one. Nothing is retried.

use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::html;
use teloxide::{ApiError, RequestError};

use crate::announcements::Announcement;
use crate::filter::Delivery;
use crate::models::User;
use crate::utils::format_to;

/// Telegram rejects longer messages.
const MAX_MESSAGE_LEN: usize = 4096;
const MAX_TITLE_LEN: usize = 512;
const HEADER: &str = "🔔 <b>Nuovi annunci</b>\n";

/// Outbound side of the chat transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an HTML-formatted message to `chat`.
    async fn send_html(
        &self,
        chat: ChatId,
        text: String,
    ) -> Result<(), RequestError>;
}

#[async_trait]
impl Transport for Bot {
    async fn send_html(
        &self,
        chat: ChatId,
        text: String,
    ) -> Result<(), RequestError> {
        self.send_message(chat, text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true)
            .await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("telegram request failed: {0}")]
    Request(#[from] RequestError),
}

impl DeliveryError {
    /// The chat can not receive messages anymore, e.g. the user blocked the
    /// bot or deleted the account.
    pub const fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Request(RequestError::Api(
                ApiError::BotBlocked
                    | ApiError::ChatNotFound
                    | ApiError::UserDeactivated
                    | ApiError::BotKicked
            ))
        )
    }
}

#[derive(Debug)]
pub struct DeliveryFailure {
    pub user: User,
    pub error: DeliveryError,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: Vec<User>,
    pub failures: Vec<DeliveryFailure>,
}

/// Send every delivery, waiting `pause` between two users.
pub async fn dispatch<T: Transport + ?Sized>(
    transport: &T,
    deliveries: &[Delivery<'_>],
    pause: Duration,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    for (idx, delivery) in deliveries.iter().enumerate() {
        if idx > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        match dispatch_one(transport, delivery).await {
            Ok(()) => report.delivered.push(delivery.user.clone()),
            Err(error) => {
                let user = delivery.user.clone();
                if error.is_unreachable() {
                    log::info!("{} is unreachable: {error}", user.id);
                } else {
                    log::warn!("Failed to notify {}: {error}", user.id);
                }
                report.failures.push(DeliveryFailure { user, error });
            }
        }
    }
    report
}

/// Send one user their announcements, as one message or, when too long, as
/// a group of consecutive messages.
pub async fn dispatch_one<T: Transport + ?Sized>(
    transport: &T,
    delivery: &Delivery<'_>,
) -> Result<(), DeliveryError> {
    let chat = ChatId::from(delivery.user.chat_id);
    for text in format_messages(&delivery.announcements) {
        transport.send_html(chat, text).await?;
    }
    Ok(())
}

/// Render announcements as HTML messages, splitting between announcements so
/// that no message exceeds the Telegram limit. An announcement that does not
/// fit in a message on its own is skipped.
pub fn format_messages(announcements: &[&Announcement]) -> Vec<String> {
    let max_entry_len = MAX_MESSAGE_LEN - HEADER.chars().count();
    let mut messages = Vec::new();
    let mut current = String::from(HEADER);
    let mut current_len = current.chars().count();
    let mut current_empty = true;
    for announcement in announcements {
        let entry = format_entry(announcement);
        let entry_len = entry.chars().count();
        if entry_len > max_entry_len {
            log::warn!(
                "Skipping oversized announcement {} ({entry_len} chars)",
                announcement.link.chars().take(80).collect::<String>(),
            );
            continue;
        }
        if !current_empty && current_len + entry_len > MAX_MESSAGE_LEN {
            messages.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(&entry);
        current_len += entry_len;
        current_empty = false;
    }
    if !current_empty {
        messages.push(current);
    }
    messages
}

fn format_entry(announcement: &Announcement) -> String {
    let mut title = announcement.title.clone();
    if let Some((idx, _)) = title.char_indices().nth(MAX_TITLE_LEN) {
        title.truncate(idx);
        title.push('…');
    }
    let mut entry = String::new();
    format_to!(
        entry,
        "\n<b>{}</b> · {}\n<a href=\"{}\">{}</a>\n",
        html::escape(announcement.website.as_str()),
        html::escape(&announcement.tag),
        html::escape(&announcement.link),
        html::escape(&title),
    );
    if let Some(published_at) = announcement.published_at {
        format_to!(entry, "<i>{}</i>\n", published_at.format("%d/%m/%Y %H:%M"));
    }
    entry
}
