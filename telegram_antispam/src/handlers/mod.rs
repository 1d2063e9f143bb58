use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{Me, User},
    RequestError,
};

use crate::{
    actions::TelegramClient,
    database::Database,
    error::PipelineError,
    misc::{chat_name_prettyprint, message_links},
    pipeline::Pipeline,
    types::{Attachment, AttachmentKind, EventKind, MessageEvent},
};

pub mod commands;

pub use commands::{bot_command_scope, generate_bot_commands};

/// The pipeline as the bot runs it.
pub type BotPipeline = Pipeline<TelegramClient>;

/// Files attached to this message, largest photo size only.
fn message_attachments(message: &Message) -> Vec<Attachment> {
    let attachment = |kind, unique_id: &teloxide::types::FileUniqueId| Attachment {
        kind,
        unique_id: Some(unique_id.0.clone()),
    };

    let mut attachments = Vec::new();

    if let Some(photo) = message.photo().and_then(|sizes| sizes.last()) {
        attachments.push(attachment(AttachmentKind::Photo, &photo.file.unique_id));
    }
    if let Some(video) = message.video() {
        attachments.push(attachment(AttachmentKind::Video, &video.file.unique_id));
    }
    if let Some(animation) = message.animation() {
        attachments.push(attachment(
            AttachmentKind::Animation,
            &animation.file.unique_id,
        ));
    }
    if let Some(document) = message.document() {
        attachments.push(attachment(
            AttachmentKind::Document,
            &document.file.unique_id,
        ));
    }
    if let Some(sticker) = message.sticker() {
        attachments.push(attachment(AttachmentKind::Sticker, &sticker.file.unique_id));
    }
    if let Some(audio) = message.audio() {
        attachments.push(attachment(AttachmentKind::Audio, &audio.file.unique_id));
    }
    if let Some(voice) = message.voice() {
        attachments.push(attachment(AttachmentKind::Voice, &voice.file.unique_id));
    }
    if let Some(video_note) = message.video_note() {
        attachments.push(attachment(AttachmentKind::Other, &video_note.file.unique_id));
    }

    attachments
}

/// A join of this user, as seen in this message.
fn join_event(message: &Message, user: &User) -> MessageEvent {
    MessageEvent::join(
        message.chat.id,
        user.id,
        message.id,
        message.date,
        user.username.clone(),
        user.full_name(),
    )
}

/// Turn a group message into events for the moderation pipeline.
///
/// A message may hold several joins at once, if someone added several users.
/// Messages sent on behalf of a chat have no user to moderate and yield nothing.
pub fn message_events(message: &Message) -> Vec<MessageEvent> {
    if let Some(sender_chat) = &message.sender_chat {
        log::debug!(
            "Chat {}: skipping message {} sent on behalf of {}",
            message.chat.id,
            message.id,
            chat_name_prettyprint(sender_chat, true)
        );
        return Vec::new();
    }

    if let Some(members) = message.new_chat_members() {
        return members
            .iter()
            .filter(|user| !user.is_bot)
            .map(|user| join_event(message, user))
            .collect();
    }

    let Some(sender) = &message.from else {
        return Vec::new();
    };

    if sender.is_bot {
        return Vec::new();
    }

    let attachments = message_attachments(message);

    let kind = if !attachments.is_empty() {
        EventKind::Media {
            caption: message.caption().map(str::to_string),
            links: message_links(message),
            attachments,
        }
    } else if let Some(text) = message.text() {
        EventKind::Text {
            text: text.to_string(),
            links: message_links(message),
        }
    } else {
        EventKind::System
    };

    vec![MessageEvent {
        chat_id: message.chat.id,
        user_id: sender.id,
        message_id: message.id,
        timestamp: message.date,
        kind,
    }]
}

pub async fn handle_message(
    bot: Bot,
    me: Me,
    message: Message,
    pipeline: BotPipeline,
    database: Arc<Database>,
) -> Result<(), RequestError> {
    // First check if it's a private message.
    if message.chat.is_private() {
        return commands::handle_private_message(bot, me, message, pipeline, database).await;
    }

    for event in message_events(&message) {
        let (chat_id, user_id) = (event.chat_id, event.user_id);
        match pipeline.submit(event) {
            Ok(()) => (),
            Err(e @ PipelineError::QueueOverflow(_)) => {
                log::warn!("Chat {chat_id}: user {user_id}: {e}");
            }
            Err(PipelineError::ShuttingDown) => {
                log::debug!("Chat {chat_id}: user {user_id}: ignoring message, shutting down");
            }
        }
    }

    Ok(())
}
