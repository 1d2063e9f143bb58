//! Source code for a Telegram anti-spam bot: scores every group message for spam, and deletes,
//! warns, mutes or bans accordingly, escalating on repeat offenders.

/// Deployment configuration.
pub mod config;

/// Error types.
pub mod error;

/// Various types used throughout.
pub mod types;

/// Miscellaneous functions.
pub mod misc;

/// Per-user moderation state.
pub mod state;

/// Independent spam signals extracted from each message.
pub mod signals;

/// Combining signals into a verdict.
pub mod scoring;

/// Deciding what to do about a verdict.
pub mod policy;

/// Applying decisions on the chat platform.
pub mod executor;

/// Sequencing all of the above per event.
pub mod pipeline;

/// The database.
pub mod database;

/// Functions that perform stuff via the bot.
mod actions;

/// Functions that handle events from Telegram.
mod handlers;

/// Entry function that starts the bot.
mod entry;
pub use entry::*;

#[cfg(test)]
mod testing;
