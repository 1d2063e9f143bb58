//! The moderation pipeline: takes inbound events, runs them through the extractors, the
//! aggregator, the policy and the executor, and commits the results into the state store.
//!
//! Each chat gets a bounded queue and a dispatcher task that hands events over to workers,
//! never two events of the same user at once, so that every user's events are processed in the
//! order they came in. Different users and chats are processed concurrently, up to a limit.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use dashmap::DashMap;
use teloxide::types::{ChatId, UserId};
use tokio::sync::{Notify, Semaphore};
use tokio_util::task::TaskTracker;

use crate::{
    config::{Config, PipelineConfig},
    error::PipelineError,
    executor::{ActionExecutor, ActionResult, ModerationClient},
    policy::DecisionPolicy,
    scoring::Aggregator,
    signals::{default_extractors, extract_all, SignalExtractor, WordList},
    state::{record_action, record_message, StateStore, TrustLevel, UserState},
    types::{Decision, MessageEvent, Verdict},
};

/// How much of an event made it into the sender's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// The message and the action taken about it.
    Everything,
    /// Only the message. Nothing was done about it, and nothing will be.
    MessageOnly,
    /// Nothing at all; processing the event again will give the same result.
    Nothing,
}

/// Everything that happened to one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub verdict: Verdict,
    pub decision: Decision,
    pub result: ActionResult,
    pub commit: Commit,
}

/// Processes one event at a time, start to finish.
pub struct Moderator<C> {
    config: Arc<Config>,
    store: Arc<StateStore>,
    extractors: Vec<Box<dyn SignalExtractor>>,
    aggregator: Aggregator,
    policy: DecisionPolicy,
    executor: ActionExecutor<C>,
}

impl<C: ModerationClient> Moderator<C> {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        store: Arc<StateStore>,
        client: Arc<C>,
        words: WordList,
    ) -> Self {
        Self {
            extractors: default_extractors(&config, words),
            aggregator: Aggregator::new(config.weights.clone(), config.scoring.clone()),
            policy: DecisionPolicy::new(config.policy.clone()),
            executor: ActionExecutor::new(client, config.executor.clone()),
            store,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Judge an event against the sender's state from before it. Has no effects.
    ///
    /// The stored trust level is only updated by commits, so it is derived again for the time of
    /// the event: a member who joined and stayed quiet has matured since.
    #[must_use]
    pub fn evaluate(&self, event: &MessageEvent, state: &UserState) -> (Verdict, Decision) {
        let mut state = state.clone();
        state.trust_level = TrustLevel::derive(&state, event.timestamp, &self.config);

        let signals = extract_all(&self.extractors, event, &state);
        let verdict = self.aggregator.aggregate(signals, &state);
        let decision = self.policy.decide(event, &verdict, &state, event.timestamp);
        (verdict, decision)
    }

    /// Evaluate an event, act on it and commit the outcome.
    ///
    /// The sender's state stays locked throughout, and is only changed once the action is
    /// either done or definitely impossible. If the action failed in a way that might go away
    /// on its own, nothing is committed.
    pub async fn process(&self, event: &MessageEvent) -> Outcome {
        let chat_id = event.chat_id;
        let user_id = event.user_id;

        let mut state = self
            .store
            .get_or_create(chat_id, user_id, event.timestamp)
            .await;
        let before = state.clone();

        let (verdict, decision) = self.evaluate(event, &before);
        log::debug!(
            "Chat {chat_id}: user {user_id}: message {} is {} ({:.2}), decided to {}: {}",
            event.message_id,
            verdict.classification,
            verdict.aggregate_score,
            decision.action,
            decision.reason
        );

        let result = self.executor.execute(event, &decision).await;

        let commit = match &result {
            ActionResult::Noop | ActionResult::Applied { .. } => Commit::Everything,
            ActionResult::Exempt => Commit::MessageOnly,
            ActionResult::Failed { error, .. } if !error.is_retryable() => Commit::MessageOnly,
            ActionResult::Failed { .. } => Commit::Nothing,
        };

        match commit {
            Commit::Everything => {
                let next = record_message(&before, event, &self.config);
                *state = record_action(&next, event, &decision, &self.config);
            }
            Commit::MessageOnly => {
                *state = record_message(&before, event, &self.config);
            }
            Commit::Nothing => {
                log::warn!(
                    "Chat {chat_id}: user {user_id}: gave up on message {}, state left as it was",
                    event.message_id
                );
            }
        }

        Outcome {
            verdict,
            decision,
            result,
            commit,
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<MessageEvent>,
    /// Users with an event being processed right now.
    busy: HashSet<UserId>,
    dispatcher_running: bool,
}

impl QueueState {
    /// Take the oldest event whose sender has nothing in flight.
    fn take_ready(&mut self) -> Option<MessageEvent> {
        let index = self
            .pending
            .iter()
            .position(|event| !self.busy.contains(&event.user_id))?;
        let event = self.pending.remove(index)?;
        self.busy.insert(event.user_id);
        Some(event)
    }
}

#[derive(Default)]
struct ChatQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ChatQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Nothing panics while holding this lock, but even if it did, the queue stays usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, user_id: UserId) {
        self.lock().busy.remove(&user_id);
        self.notify.notify_one();
    }
}

struct Inner<C> {
    moderator: Moderator<C>,
    queues: DashMap<ChatId, Arc<ChatQueue>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    accepting: AtomicBool,
    queue_size: usize,
}

/// Queues inbound events and processes them in the background.
pub struct Pipeline<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Pipeline<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: ModerationClient> Pipeline<C> {
    #[must_use]
    pub fn new(moderator: Moderator<C>, config: &PipelineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                moderator,
                queues: DashMap::new(),
                permits: Arc::new(Semaphore::new(config.max_concurrent)),
                tracker: TaskTracker::new(),
                accepting: AtomicBool::new(true),
                queue_size: config.queue_size_per_chat,
            }),
        }
    }

    #[must_use]
    pub fn moderator(&self) -> &Moderator<C> {
        &self.inner.moderator
    }

    /// Queue an event for processing. Never waits.
    ///
    /// If the chat's queue is full, an older event is dropped to make room: the oldest one from
    /// a user with a clean record, or the oldest one overall if there are none. The new event is
    /// queued either way.
    ///
    /// # Errors
    /// [`PipelineError::ShuttingDown`] if the event was not accepted, and
    /// [`PipelineError::QueueOverflow`] if it was, but another one got dropped.
    pub fn submit(&self, event: MessageEvent) -> Result<(), PipelineError> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::Acquire) {
            return Err(PipelineError::ShuttingDown);
        }

        let chat_id = event.chat_id;
        let queue = inner.queues.entry(chat_id).or_default().value().clone();

        let (dropped, start_dispatcher) = {
            let mut state = queue.lock();
            let dropped = if state.pending.len() >= inner.queue_size {
                let store = inner.moderator.store();
                let index = state
                    .pending
                    .iter()
                    .position(|e| store.has_clean_record(e.chat_id, e.user_id))
                    .unwrap_or(0);
                state.pending.remove(index)
            } else {
                None
            };
            state.pending.push_back(event);
            let start_dispatcher = !state.dispatcher_running;
            state.dispatcher_running = true;
            (dropped, start_dispatcher)
        };

        if start_dispatcher {
            inner
                .tracker
                .spawn(Self::dispatch(inner.clone(), chat_id, queue));
        } else {
            queue.notify.notify_one();
        }

        match dropped {
            Some(dropped) => {
                log::warn!(
                    "Chat {chat_id}: user {}: queue full, dropped message {}",
                    dropped.user_id,
                    dropped.message_id
                );
                Err(PipelineError::QueueOverflow(chat_id))
            }
            None => Ok(()),
        }
    }

    /// Hands events of one chat over to workers until the queue runs dry.
    async fn dispatch(inner: Arc<Inner<C>>, chat_id: ChatId, queue: Arc<ChatQueue>) {
        loop {
            let next = {
                let mut state = queue.lock();
                if state.pending.is_empty() {
                    state.dispatcher_running = false;
                    return;
                }
                state.take_ready()
            };

            let Some(event) = next else {
                // Everyone with something queued is busy. Wait for one of them to finish.
                queue.notify.notified().await;
                continue;
            };

            let Ok(permit) = inner.permits.clone().acquire_owned().await else {
                log::error!("Chat {chat_id}: worker limit is gone, dropping everything queued");
                let mut state = queue.lock();
                state.pending.clear();
                state.dispatcher_running = false;
                return;
            };

            let worker_inner = inner.clone();
            let worker_queue = queue.clone();
            inner.tracker.spawn(async move {
                worker_inner.moderator.process(&event).await;
                drop(permit);
                worker_queue.finish(event.user_id);
            });
        }
    }

    /// True if nothing is queued or being processed.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.queues.iter().all(|queue| {
            let state = queue.lock();
            state.pending.is_empty() && state.busy.is_empty()
        })
    }

    /// Stop taking new events, discard the queued ones, and wait for events being processed to
    /// finish, for at most `grace`.
    ///
    /// Returns the number of events discarded.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::Release);

        let mut discarded = 0;
        for queue in &inner.queues {
            let mut state = queue.lock();
            discarded += state.pending.len();
            state.pending.clear();
            drop(state);
            queue.notify.notify_one();
        }

        inner.tracker.close();
        if tokio::time::timeout(grace, inner.tracker.wait())
            .await
            .is_err()
        {
            log::warn!(
                "{} tasks still running after the shutdown grace period, abandoning them",
                inner.tracker.len()
            );
        }

        if discarded > 0 {
            log::warn!("Discarded {discarded} queued events on shutdown");
        }
        discarded
    }
}
