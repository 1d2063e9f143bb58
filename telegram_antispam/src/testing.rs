//! A chat platform that only exists in memory, for tests.

#![allow(clippy::unwrap_used)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
    time::Duration,
};

use teloxide::types::{ChatId, MessageId, UserId};

use crate::{
    error::DeliveryError,
    executor::ModerationClient,
    types::{Action, Decision, MessageEvent},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Delete(ChatId, MessageId),
    Mute(ChatId, UserId, Duration),
    Kick(ChatId, UserId),
    Ban(ChatId, UserId),
    Warn(ChatId, Option<MessageId>, String),
    Report(ChatId, UserId, Action),
}

impl Call {
    fn method(&self) -> &'static str {
        match self {
            Call::Delete(..) => "delete",
            Call::Mute(..) => "mute",
            Call::Kick(..) => "kick",
            Call::Ban(..) => "ban",
            Call::Warn(..) => "warn",
            Call::Report(..) => "report",
        }
    }
}

enum Scripted {
    Fail(DeliveryError),
    /// Never answer.
    Hang,
}

/// Records every call that succeeded, and fails or hangs on request.
#[derive(Default)]
pub struct MockClient {
    calls: Mutex<Vec<Call>>,
    attempts: Mutex<HashMap<&'static str, u32>>,
    script: Mutex<HashMap<&'static str, VecDeque<Scripted>>>,
    exempt: Mutex<HashSet<UserId>>,
    latency: Mutex<Option<Duration>>,
}

impl MockClient {
    /// Make the next call of this method fail with this error.
    pub fn fail_next(&self, method: &'static str, error: DeliveryError) {
        let mut script = self.script.lock().unwrap();
        script
            .entry(method)
            .or_default()
            .push_back(Scripted::Fail(error));
    }

    /// Make the next call of this method never return.
    pub fn hang_next(&self, method: &'static str) {
        let mut script = self.script.lock().unwrap();
        script.entry(method).or_default().push_back(Scripted::Hang);
    }

    pub fn exempt(&self, user_id: UserId) {
        self.exempt.lock().unwrap().insert(user_id);
    }

    /// Make every call take this long.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Calls that succeeded, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls of this method made, successful or not.
    pub fn attempts(&self, method: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    async fn call(&self, call: Call) -> Result<(), DeliveryError> {
        let method = call.method();
        *self.attempts.lock().unwrap().entry(method).or_default() += 1;
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        let latency = *self.latency.lock().unwrap();

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match scripted {
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => {
                self.calls.lock().unwrap().push(call);
                Ok(())
            }
        }
    }
}

impl ModerationClient for MockClient {
    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), DeliveryError> {
        self.call(Call::Delete(chat_id, message_id)).await
    }

    async fn mute_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        duration: Duration,
    ) -> Result<(), DeliveryError> {
        self.call(Call::Mute(chat_id, user_id, duration)).await
    }

    async fn kick_user(&self, chat_id: ChatId, user_id: UserId) -> Result<(), DeliveryError> {
        self.call(Call::Kick(chat_id, user_id)).await
    }

    async fn ban_user(&self, chat_id: ChatId, user_id: UserId) -> Result<(), DeliveryError> {
        self.call(Call::Ban(chat_id, user_id)).await
    }

    async fn send_warning(
        &self,
        chat_id: ChatId,
        reply_to: Option<MessageId>,
        text: String,
    ) -> Result<(), DeliveryError> {
        self.call(Call::Warn(chat_id, reply_to, text)).await
    }

    async fn is_exempt(&self, _chat_id: ChatId, user_id: UserId) -> bool {
        self.exempt.lock().unwrap().contains(&user_id)
    }

    async fn report(&self, event: &MessageEvent, decision: &Decision) {
        let _ = self
            .call(Call::Report(event.chat_id, event.user_id, decision.action))
            .await;
    }
}
