//! Commands the owner of the bot can use in a private chat with it.

use std::{collections::BTreeSet, sync::Arc};

use teloxide::{
    prelude::*,
    types::{BotCommand, BotCommandScope, ChatId, Me, UserId},
    RequestError,
};

use super::BotPipeline;
use crate::{database::Database, misc::user_name_prettyprint};

pub struct Command {
    pub callname: &'static str,
    pub description: &'static str,
    /// Whether only the owner may use it.
    pub owner_only: bool,
    hidden: bool,
}

pub const COMMANDS: &[Command] = &[
    Command {
        callname: "/start",
        description: "Show what this bot does.",
        owner_only: false,
        hidden: true,
    },
    Command {
        callname: "/help",
        description: "Show what this bot does.",
        owner_only: false,
        hidden: false,
    },
    Command {
        callname: "/list",
        description: "List prohibited words.",
        owner_only: true,
        hidden: false,
    },
    Command {
        callname: "/add <word>",
        description: "Add a prohibited word.",
        owner_only: true,
        hidden: false,
    },
    Command {
        callname: "/delete <word>",
        description: "Delete a prohibited word.",
        owner_only: true,
        hidden: false,
    },
    Command {
        callname: "/forgive <chat id> <user id>",
        description: "Forget violations of a user in a chat.",
        owner_only: true,
        hidden: false,
    },
];

impl Command {
    /// The command itself, like `/add`.
    fn name(&self) -> &'static str {
        self.callname
            .split_ascii_whitespace()
            .next()
            .unwrap_or(self.callname)
    }

    fn find(name: &str) -> Option<&'static Command> {
        COMMANDS.iter().find(|command| command.name() == name)
    }
}

const HELP_HEADER: &str = "
This bot removes spam from groups it's an admin in, and mutes or bans users who keep spamming.

To use it, add it to a group and give it administrator status with \"Delete messages\" and \"Ban users\" permissions.

The first person to use one of the commands below becomes the owner of the bot, gets reports of removed messages, and manages the list of prohibited words.";

/// Help text listing every visible command.
#[must_use]
pub fn generate_help() -> String {
    let mut help = HELP_HEADER.trim().to_string();
    help.push_str("\n\n");
    for command in COMMANDS.iter().filter(|c| !c.hidden) {
        help.push_str(command.callname);
        help.push_str(" - ");
        help.push_str(command.description);
        help.push('\n');
    }
    help.pop();
    help
}

#[must_use]
pub fn generate_bot_commands() -> Vec<BotCommand> {
    COMMANDS
        .iter()
        .filter(|command| !command.hidden)
        .map(|command| BotCommand {
            // Cut off the /
            command: command.name()[1..].to_string(),
            description: command.description.to_string(),
        })
        .collect()
}

/// Where the command menu shows up. Commands only work in private chats with the bot, so
/// groups don't get it.
#[must_use]
pub fn bot_command_scope() -> BotCommandScope {
    BotCommandScope::AllPrivateChats
}

/// Split a command message into the lowercase command, without the bot's username, and its
/// parameters.
///
/// Returns `None` if this isn't a command, or if it's addressed to a different bot.
fn split_command<'a>(text: &'a str, bot_username: &str) -> Option<(String, &'a str)> {
    if !text.starts_with('/') {
        return None;
    }

    let command = text.split_whitespace().next()?;
    let params = text[command.len()..].trim();

    let command = match command.split_once('@') {
        Some((command, username)) if username.eq_ignore_ascii_case(bot_username) => command,
        // Not for us.
        Some(_) => return None,
        None => command,
    };

    Some((command.to_lowercase(), params))
}

/// The one word in these parameters, lowercase.
fn word_param(params: &str) -> Option<String> {
    let mut words = params.split_whitespace();
    let word = words.next()?;
    if words.next().is_some() {
        return None;
    }
    Some(word.to_lowercase())
}

fn forgive_params(params: &str) -> Option<(ChatId, UserId)> {
    let mut words = params.split_whitespace();
    let chat_id = words.next()?.parse().ok()?;
    let user_id = words.next()?.parse().ok()?;
    if words.next().is_some() {
        return None;
    }
    Some((ChatId(chat_id), UserId(user_id)))
}

fn list_words(words: &BTreeSet<String>) -> String {
    if words.is_empty() {
        return "No prohibited words.".to_string();
    }
    let mut text = "Prohibited words:".to_string();
    for word in words {
        text.push('\n');
        text.push_str(word);
    }
    text
}

/// Check that this user owns the bot, making them the owner if nobody does yet.
async fn authenticate_owner(
    bot: &Bot,
    message: &Message,
    database: &Database,
) -> Result<bool, RequestError> {
    let Some(user) = &message.from else {
        return Ok(false);
    };

    let had_owner = database.owner().await.expect("Database died!").is_some();
    let owner = database
        .claim_owner(user.id)
        .await
        .expect("Database died!");

    if owner != user.id {
        log::info!(
            "{} tried to use an owner command",
            user_name_prettyprint(user, true)
        );
        bot.send_message(message.chat.id, "You are not the owner of the bot.")
            .await?;
        return Ok(false);
    }

    if !had_owner {
        log::info!(
            "{} is now the owner of the bot",
            user_name_prettyprint(user, true)
        );
        bot.send_message(message.chat.id, "You are now the owner of the bot.")
            .await?;
    }

    Ok(true)
}

/// Returns `true` if a command was parsed and responded to.
async fn handle_command(
    bot: &Bot,
    me: &Me,
    message: &Message,
    pipeline: &BotPipeline,
    database: &Database,
) -> Result<bool, RequestError> {
    let Some(text) = message.text() else {
        return Ok(false);
    };
    let Some((name, params)) = split_command(text, me.username()) else {
        return Ok(false);
    };
    // Any kind of "/start", "/help" or unknown commands yield false and
    // hence cause the help message to be printed.
    let Some(command) = Command::find(&name) else {
        return Ok(false);
    };
    if !command.owner_only {
        return Ok(false);
    }

    if !authenticate_owner(bot, message, database).await? {
        return Ok(true);
    }

    let usage = || format!("Usage: {}", command.callname);

    let response = match name.as_str() {
        "/list" => list_words(&database.words()),
        "/add" => match word_param(params) {
            None => usage(),
            Some(word) => match database.add_word(&word).await.expect("Database died!") {
                true => format!("Added prohibited word: {word}"),
                false => format!("Already prohibited: {word}"),
            },
        },
        "/delete" => match word_param(params) {
            None => usage(),
            Some(word) => match database.delete_word(&word).await.expect("Database died!") {
                true => format!("Deleted prohibited word: {word}"),
                false => format!("Not a prohibited word: {word}"),
            },
        },
        "/forgive" => match forgive_params(params) {
            None => usage(),
            Some((chat_id, user_id)) => {
                let store = pipeline.moderator().store();
                match store.reset_violations(chat_id, user_id).await {
                    true => {
                        log::info!("Chat {chat_id}: user {user_id}: forgiven by the owner");
                        format!("Forgave user {user_id} in chat {chat_id}.")
                    }
                    false => format!("Nothing is known about user {user_id} in chat {chat_id}."),
                }
            }
        },
        _ => return Ok(false),
    };

    bot.send_message(message.chat.id, response).await?;
    Ok(true)
}

pub async fn handle_private_message(
    bot: Bot,
    me: Me,
    message: Message,
    pipeline: BotPipeline,
    database: Arc<Database>,
) -> Result<(), RequestError> {
    if handle_command(&bot, &me, &message, &pipeline, &database).await? {
        return Ok(());
    }

    bot.send_message(message.chat.id, generate_help()).await?;
    Ok(())
}
