use teloxide::types::{Chat, Message, MessageEntityRef, User};
use url::Url;

/// Try to parse a string as a [`Url`] in a way that telegram parses it,
/// with allowing an implicit `https://` prefix, or as a username.
///
/// # Errors
/// Errors if it fails to parse either way.
pub fn parse_url_like_telegram(string: &str) -> Result<Url, url::ParseError> {
    if let Some(username) = string.strip_prefix('@') {
        // Probably a username like "@amogus"
        // Convert to a format like "https://t.me/amogus" then parse
        return Url::parse(&format!("https://t.me/{username}"));
    }

    match Url::parse(string) {
        Ok(url) => Ok(url),
        Err(e @ url::ParseError::RelativeUrlWithoutBase) => {
            // Try prepending https:// to it
            if let Ok(url) = Url::parse(&format!("https://{string}")) {
                Ok(url)
            } else {
                Err(e)
            }
        }
        Err(e) => Err(e),
    }
}

/// Returns true if this word looks like something Telegram would turn into a link or a mention.
fn looks_like_link(word: &str) -> bool {
    if let Some(username) = word.strip_prefix('@') {
        // Telegram usernames are at least 4 characters of letters, digits and underscores.
        return username.len() >= 4
            && username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
    }

    if !word.contains('.') {
        return false;
    }

    let Ok(url) = parse_url_like_telegram(word) else {
        return false;
    };

    if !matches!(url.scheme(), "http" | "https" | "tg") {
        return false;
    }

    let Some(domain) = url.domain() else {
        // IP address links count too.
        return url.host().is_some();
    };

    // Needs a top level domain that looks like one. This skips things like "e.g." or "v1.2".
    domain.rsplit_once('.').is_some_and(|(name, tld)| {
        !name.is_empty() && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
    })
}

/// Find things that look like links or mentions in plain text, for when Telegram didn't give us
/// any message entities.
#[must_use]
pub fn find_links_in_text(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| {
                matches!(c, '(' | ')' | '[' | ']' | '<' | '>' | '"' | '\'' | ',' | '!' | '?')
            })
            .trim_end_matches(['.', ':', ';'])
        })
        .filter(|word| looks_like_link(word))
        .map(str::to_string)
        .collect()
}

/// Get a link or a mention from this message entity, if it is one.
#[must_use]
pub fn get_entity_link(entity: &MessageEntityRef) -> Option<String> {
    use teloxide::types::MessageEntityKind as Kind;

    match entity.kind() {
        // Code and Pre because some spammers use monospace to make links clickable but
        // undetectable.
        Kind::Url | Kind::Mention => Some(entity.text().to_string()),
        Kind::Code | Kind::Pre { .. } => {
            Some(entity.text()).filter(|t| looks_like_link(t)).map(str::to_string)
        }
        Kind::TextLink { url } => Some(url.to_string()),
        Kind::TextMention { user } => Some(
            user.username
                .as_ref()
                .map_or_else(|| format!("tg://user?id={}", user.id), |u| format!("@{u}")),
        ),
        _ => None,
    }
}

/// All links and mentions Telegram marked up in this message's text or caption.
/// Falls back to looking through the text by hand if there are no entities at all.
#[must_use]
pub fn message_links(message: &Message) -> Vec<String> {
    match message
        .parse_entities()
        .or_else(|| message.parse_caption_entities())
    {
        Some(entities) => entities.iter().filter_map(get_entity_link).collect(),
        None => message
            .text()
            .or_else(|| message.caption())
            .map(find_links_in_text)
            .unwrap_or_default(),
    }
}

/// Squash text into a form where trivial edits (case, spacing, punctuation, numbers) don't
/// matter. Used to spot near-duplicate messages.
#[must_use]
pub fn normalize_for_fingerprint(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphabetic())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Tries to print the user in the prettiest way possible, with either `@username` or full name.
/// Optionally allows including user ID.
#[must_use]
pub fn user_name_prettyprint(user: &User, with_id: bool) -> String {
    let mut name = match &user.username {
        Some(username) => format!("@{username}"),
        None => user.full_name(),
    };

    if with_id {
        use std::fmt::Write;
        write!(name, " (userid {})", user.id).expect("Writing to a String never fails");
    }

    name
}

/// Tries to print the chat name in the prettiest way possible, with either `@username` or chat
/// title or full name.
#[must_use]
pub fn chat_name_prettyprint(chat: &Chat, with_id: bool) -> String {
    let mut name = if let Some(username) = chat.username() {
        format!("@{username}")
    } else if let Some(title) = chat.title() {
        title.to_string()
    } else if let Some(first_name) = chat.first_name() {
        let mut full_name = first_name.to_string();

        if let Some(last_name) = chat.last_name() {
            full_name.push(' ');
            full_name.push_str(last_name);
        }
        full_name
    } else {
        // Shouldn't happen, but eh.
        "a private chat".to_string()
    };

    if with_id {
        use std::fmt::Write;
        write!(name, " (chatid {})", chat.id).expect("Writing to a String never fails");
    }

    name
}
