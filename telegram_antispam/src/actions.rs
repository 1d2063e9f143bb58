use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use html_escape::encode_text;
use teloxide::{
    payloads::{RestrictChatMemberSetters, SendMessageSetters, UnbanChatMemberSetters},
    prelude::Requester,
    sugar::request::{RequestLinkPreviewExt, RequestReplyExt},
    types::{ChatId, ChatPermissions, MessageId, ParseMode, UserId},
    ApiError, Bot, RequestError,
};

use crate::{
    database::Database,
    error::DeliveryError,
    executor::ModerationClient,
    types::{Decision, EventKind, MessageEvent},
};

/// Sort a Telegram failure into whether it's worth retrying or not.
fn delivery_error(error: &RequestError) -> DeliveryError {
    match error {
        RequestError::RetryAfter(seconds) => DeliveryError::Transient {
            reason: error.to_string(),
            retry_after: Some(seconds.duration()),
        },
        RequestError::Network(_) | RequestError::Io(_) => DeliveryError::transient(error.to_string()),
        // Missing rights, user not in the chat, bot kicked, and anything else Telegram
        // refused to do.
        _ => DeliveryError::permanent(error.to_string()),
    }
}

/// How a kick went, given that the user is already banned and out of the chat.
///
/// The user is out once the ban is in. A ban that can't be lifted afterwards is only logged,
/// and stays until someone lifts it by hand.
fn kicked(
    unban: Result<(), RequestError>,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<(), DeliveryError> {
    if let Err(e) = unban {
        log::warn!("Chat {chat_id}: user {user_id}: kicked, but could not lift the ban: {e}");
    }
    Ok(())
}

/// Moderation through the Telegram Bot API.
pub struct TelegramClient {
    bot: Bot,
    database: Arc<Database>,
}

impl TelegramClient {
    #[must_use]
    pub fn new(bot: Bot, database: Arc<Database>) -> Self {
        Self { bot, database }
    }
}

impl ModerationClient for TelegramClient {
    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), DeliveryError> {
        match self.bot.delete_message(chat_id, message_id).await {
            Ok(_) => Ok(()),
            Err(RequestError::Api(ApiError::MessageIdInvalid | ApiError::MessageToDeleteNotFound)) => {
                // Someone else probably has already deleted it. That's fine.
                Ok(())
            }
            Err(e) => Err(delivery_error(&e)),
        }
    }

    async fn mute_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        duration: Duration,
    ) -> Result<(), DeliveryError> {
        let until = Utc::now() + TimeDelta::seconds(duration.as_secs() as i64);
        self.bot
            .restrict_chat_member(chat_id, user_id, ChatPermissions::empty())
            .until_date(until)
            .await
            .map(|_| ())
            .map_err(|e| delivery_error(&e))
    }

    async fn kick_user(&self, chat_id: ChatId, user_id: UserId) -> Result<(), DeliveryError> {
        // Telegram has no kicks, only bans that can be lifted right away.
        self.bot
            .ban_chat_member(chat_id, user_id)
            .await
            .map_err(|e| delivery_error(&e))?;
        let unban = self
            .bot
            .unban_chat_member(chat_id, user_id)
            .only_if_banned(true)
            .await
            .map(|_| ());
        kicked(unban, chat_id, user_id)
    }

    async fn ban_user(&self, chat_id: ChatId, user_id: UserId) -> Result<(), DeliveryError> {
        self.bot
            .ban_chat_member(chat_id, user_id)
            .await
            .map(|_| ())
            .map_err(|e| delivery_error(&e))
    }

    async fn send_warning(
        &self,
        chat_id: ChatId,
        reply_to: Option<MessageId>,
        text: String,
    ) -> Result<(), DeliveryError> {
        let mut request = self
            .bot
            .send_message(chat_id, text)
            .disable_link_preview(true);
        if let Some(reply_to) = reply_to {
            request = request.reply_to(reply_to);
        }
        request.await.map(|_| ()).map_err(|e| delivery_error(&e))
    }

    async fn is_exempt(&self, chat_id: ChatId, user_id: UserId) -> bool {
        match self.bot.get_chat_member(chat_id, user_id).await {
            Ok(member) => member.kind.is_privileged(),
            Err(e) => {
                log::warn!("Chat {chat_id}: user {user_id}: could not check for admin rights: {e}");
                false
            }
        }
    }

    async fn report(&self, event: &MessageEvent, decision: &Decision) {
        let owner = match self.database.owner().await {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                log::warn!("The bot does not have an owner");
                return;
            }
            Err(e) => {
                log::error!("Database error! {e:?}");
                return;
            }
        };

        let content = match &event.kind {
            EventKind::Join {
                username,
                full_name,
            } => match username {
                Some(username) => format!("Joined as {full_name} (@{username})"),
                None => format!("Joined as {full_name}"),
            },
            _ => event.text_full().unwrap_or("(no text)").to_string(),
        };

        let text = format!(
            "Applied <b>{}</b> to <a href=\"tg://user?id={user}\">user {user}</a> \
            in chat <code>{}</code> for the following:\n\n\
            <blockquote>{}</blockquote>\n\n\
            Reason: {}",
            decision.action,
            event.chat_id,
            encode_text(&content),
            encode_text(&decision.reason),
            user = event.user_id,
        );

        if let Err(e) = self
            .bot
            .send_message(ChatId::from(owner), text)
            .parse_mode(ParseMode::Html)
            .disable_link_preview(true)
            .await
        {
            log::warn!("Failed to report to the owner: {e}");
        }
    }
}
