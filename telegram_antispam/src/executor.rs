//! Carrying out decisions against the chat platform.

use std::{future::Future, sync::Arc, time::Duration};

use teloxide::types::{ChatId, MessageId, UserId};

use crate::{
    config::ExecutorConfig,
    error::DeliveryError,
    types::{Action, Decision, MessageEvent},
};

/// Everything the moderation engine needs from the chat platform.
pub trait ModerationClient: Send + Sync + 'static {
    /// Delete a message. Deleting a message that is already gone must succeed.
    fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    fn mute_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        duration: Duration,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    /// Remove a user from the chat, letting them come back later.
    fn kick_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    fn ban_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    /// Post a warning into the chat, in reply to a message if it's still there.
    fn send_warning(
        &self,
        chat_id: ChatId,
        reply_to: Option<MessageId>,
        text: String,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    /// True if this user is not to be moderated at all, like chat admins.
    fn is_exempt(&self, _chat_id: ChatId, _user_id: UserId) -> impl Future<Output = bool> + Send {
        async { false }
    }

    /// Let whoever runs the bot know about an action taken. Best effort.
    fn report(
        &self,
        _event: &MessageEvent,
        _decision: &Decision,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// What came out of executing a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    /// Nothing to do.
    Noop,
    Applied { attempts: u32 },
    /// The user is exempt from moderation; nothing was done.
    Exempt,
    Failed {
        error: DeliveryError,
        attempts: u32,
    },
}

impl ActionResult {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, ActionResult::Applied { .. })
    }
}

pub struct ActionExecutor<C> {
    client: Arc<C>,
    config: ExecutorConfig,
}

impl<C: ModerationClient> ActionExecutor<C> {
    #[must_use]
    pub fn new(client: Arc<C>, config: ExecutorConfig) -> Self {
        Self { client, config }
    }

    /// Carry out the decision made about this event.
    ///
    /// Transient failures are retried with backoff. The returned result is about the primary
    /// part of the action: the restriction for mutes, kicks and bans, the deletion for deletes.
    /// Secondary parts, like the warning after a deletion, are best effort.
    pub async fn execute(&self, event: &MessageEvent, decision: &Decision) -> ActionResult {
        let chat_id = event.chat_id;
        let user_id = event.user_id;
        let message_id = event.message_id;

        if decision.action == Action::Allow {
            return ActionResult::Noop;
        }

        if self.client.is_exempt(chat_id, user_id).await {
            log::debug!(
                "Chat {chat_id}: user {user_id}: exempt, not applying {}",
                decision.action
            );
            return ActionResult::Exempt;
        }

        let warning = || warning_text(decision);

        let (result, attempts) = match decision.action {
            Action::Allow => return ActionResult::Noop,
            Action::Warn => {
                self.with_retry(event, "warn", || {
                    self.client.send_warning(chat_id, Some(message_id), warning())
                })
                .await
            }
            Action::Delete => {
                self.with_retry(event, "delete", || {
                    self.client.delete_message(chat_id, message_id)
                })
                .await
            }
            Action::DeleteAndWarn => {
                let outcome = self
                    .with_retry(event, "delete", || {
                        self.client.delete_message(chat_id, message_id)
                    })
                    .await;
                if outcome.0.is_ok() {
                    self.best_effort(event, "warn", || {
                        self.client.send_warning(chat_id, None, warning())
                    })
                    .await;
                }
                outcome
            }
            Action::Mute(duration) => {
                self.best_effort(event, "delete", || {
                    self.client.delete_message(chat_id, message_id)
                })
                .await;
                self.with_retry(event, "mute", || {
                    self.client.mute_user(chat_id, user_id, duration)
                })
                .await
            }
            Action::Kick => {
                self.best_effort(event, "delete", || {
                    self.client.delete_message(chat_id, message_id)
                })
                .await;
                self.with_retry(event, "kick", || self.client.kick_user(chat_id, user_id))
                    .await
            }
            Action::Ban => {
                self.best_effort(event, "delete", || {
                    self.client.delete_message(chat_id, message_id)
                })
                .await;
                self.with_retry(event, "ban", || self.client.ban_user(chat_id, user_id))
                    .await
            }
        };

        match result {
            Ok(()) => {
                if decision.action.is_punitive() {
                    log::info!(
                        "Chat {chat_id}: user {user_id}: applied {} ({})",
                        decision.action,
                        decision.reason
                    );
                }
                if decision.action.deletes_message() || decision.heightened_scrutiny {
                    self.client.report(event, decision).await;
                }
                ActionResult::Applied { attempts }
            }
            Err(error) => {
                log::warn!(
                    "Chat {chat_id}: user {user_id}: could not apply {} \
                    after {attempts} attempts: {error}",
                    decision.action
                );
                ActionResult::Failed { error, attempts }
            }
        }
    }

    /// Make a request once, with a timeout.
    async fn attempt<F, Fut>(&self, call: F) -> Result<(), DeliveryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), DeliveryError>>,
    {
        match tokio::time::timeout(self.config.request_timeout(), call()).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::transient("request timed out")),
        }
    }

    /// Make a request, retrying transient failures. Returns the outcome and the attempts made.
    async fn with_retry<F, Fut>(
        &self,
        event: &MessageEvent,
        what: &str,
        mut call: F,
    ) -> (Result<(), DeliveryError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), DeliveryError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let error = match self.attempt(&mut call).await {
                Ok(()) => return (Ok(()), attempts),
                Err(error) => error,
            };

            if !error.is_retryable() || attempts >= self.config.max_attempts {
                return (Err(error), attempts);
            }

            let mut delay = self.config.backoff(attempts);
            if let DeliveryError::Transient {
                retry_after: Some(retry_after),
                ..
            } = &error
            {
                delay = delay.max(*retry_after);
            }
            log::debug!(
                "Chat {}: user {}: {what} failed ({error}), retrying in {}ms",
                event.chat_id,
                event.user_id,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Make a request that doesn't matter much. Failures are logged and forgotten.
    async fn best_effort<F, Fut>(&self, event: &MessageEvent, what: &str, call: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), DeliveryError>>,
    {
        if let (Err(e), _) = self.with_retry(event, what, call).await {
            log::debug!(
                "Chat {}: user {}: {what} failed, carrying on: {e}",
                event.chat_id,
                event.user_id
            );
        }
    }
}

/// Text of the warning posted for this decision.
#[must_use]
pub fn warning_text(decision: &Decision) -> String {
    match decision.action {
        Action::Warn => "Your message looks like spam. Please don't.".to_string(),
        _ => "A message was removed for looking like spam. \
            Keep it up and you will be muted, then banned."
            .to_string(),
    }
}
