use std::{
    collections::BTreeSet,
    str::FromStr,
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
pub use sqlx::Error;
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Executor, Row, Sqlite,
};
use teloxide::types::{ChatId, UserId};
use tokio::sync::watch;

use crate::{
    error::StateError,
    signals::WordList,
    state::{LastAction, StateKey, StateStore, TrustLevel, UserState},
    types::Action,
};

type Pool = sqlx::Pool<Sqlite>;

pub struct Database {
    pool: Pool,
    words: watch::Sender<Arc<BTreeSet<String>>>,
}

impl Database {
    /// Open the database at this `sqlx` connection string, creating it if needed.
    pub async fn new(path: &str) -> Result<Arc<Database>, Error> {
        if !Sqlite::database_exists(path).await.unwrap_or(false) {
            Sqlite::create_database(path).await?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(
                SqliteConnectOptions::from_str(path)?
                    .pragma("cache_size", "-32768")
                    .busy_timeout(Duration::from_secs(600)),
            )
            .await?;

        Self::with_pool(pool).await
    }

    /// A database that lives only as long as this process.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Arc<Database>, Error> {
        // One connection that never gets closed, or the database is lost.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: Pool) -> Result<Arc<Database>, Error> {
        // USER_STATES:
        // Durable part of per (chat, user) moderation state.
        // Recent message windows are not saved; they're stale after a restart anyway.
        // Times are date+time in UTC. last_action is in the form of `Action`'s Display.
        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS user_states (
                    chat_id INTEGER NOT NULL,
                    user_id INTEGER NOT NULL,
                    violation_count INTEGER NOT NULL,
                    trust_level INTEGER NOT NULL,
                    joined_at TEXT NOT NULL,
                    join_observed INTEGER NOT NULL,
                    clean_messages INTEGER NOT NULL,
                    last_action TEXT NULL,
                    last_action_at TEXT NULL,
                    heightened_scrutiny INTEGER NOT NULL,
                    last_activity TEXT NOT NULL,
                    PRIMARY KEY (chat_id, user_id)
                ) STRICT;",
        ))
        .await?;

        // PROHIBITED_WORDS:
        // word (unique primary key, lowercase string)
        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS prohibited_words (
                    word TEXT PRIMARY KEY NOT NULL
                ) STRICT;",
        ))
        .await?;

        // SETTINGS:
        // Bot-wide key-value settings. For now, just "owner_id".
        pool.execute(sqlx::query(
            "
                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL
                ) STRICT;",
        ))
        .await?;

        let words: BTreeSet<String> = sqlx::query("SELECT word FROM prohibited_words;")
            .map(|row: SqliteRow| row.get::<String, _>("word"))
            .fetch_all(&pool)
            .await?
            .into_iter()
            .collect();
        log::info!("Loaded {} prohibited words.", words.len());

        let (words, _) = watch::channel(Arc::new(words));

        Ok(Arc::new(Database { pool, words }))
    }

    /// A live view of the prohibited words, updated whenever they change.
    #[must_use]
    pub fn word_list(&self) -> WordList {
        self.words.subscribe()
    }

    /// All prohibited words, sorted.
    #[must_use]
    pub fn words(&self) -> Arc<BTreeSet<String>> {
        self.words.borrow().clone()
    }

    /// Add a prohibited word. Returns `false` if it was already there.
    pub async fn add_word(&self, word: &str) -> Result<bool, Error> {
        let word = word.to_lowercase();
        let added = sqlx::query("INSERT OR IGNORE INTO prohibited_words(word) VALUES (?);")
            .bind(&word)
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0;

        if added {
            self.words.send_modify(|words| {
                Arc::make_mut(words).insert(word);
            });
        }
        Ok(added)
    }

    /// Remove a prohibited word. Returns `false` if it wasn't there.
    pub async fn delete_word(&self, word: &str) -> Result<bool, Error> {
        let word = word.to_lowercase();
        let deleted = sqlx::query("DELETE FROM prohibited_words WHERE word=?;")
            .bind(&word)
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0;

        if deleted {
            self.words.send_modify(|words| {
                Arc::make_mut(words).remove(&word);
            });
        }
        Ok(deleted)
    }

    /// The user who administers the bot, if anyone has claimed it yet.
    pub async fn owner(&self) -> Result<Option<UserId>, Error> {
        let owner = sqlx::query("SELECT value FROM settings WHERE key='owner_id';")
            .map(|row: SqliteRow| row.get::<String, _>("value"))
            .fetch_optional(&self.pool)
            .await?;
        Ok(owner.and_then(|x| x.parse().ok()).map(UserId))
    }

    /// Make this user the owner of the bot, unless someone already is.
    /// Returns the owner, whoever it ends up being.
    pub async fn claim_owner(&self, user_id: UserId) -> Result<UserId, Error> {
        sqlx::query("INSERT OR IGNORE INTO settings(key, value) VALUES ('owner_id', ?);")
            .bind(user_id.0.to_string())
            .execute(&self.pool)
            .await?;
        Ok(self.owner().await?.unwrap_or(user_id))
    }

    /// Save these states, replacing older saves of them, and forget saved states that have been
    /// inactive since before `expired_before`.
    pub async fn save_states(
        &self,
        states: &[(StateKey, UserState)],
        expired_before: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        for ((chat_id, user_id), state) in states {
            sqlx::query(
                "INSERT INTO user_states(
                    chat_id, user_id, violation_count, trust_level, joined_at, join_observed,
                    clean_messages, last_action, last_action_at, heightened_scrutiny,
                    last_activity
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chat_id, user_id) DO
                UPDATE SET
                    violation_count=excluded.violation_count,
                    trust_level=excluded.trust_level,
                    joined_at=excluded.joined_at,
                    join_observed=excluded.join_observed,
                    clean_messages=excluded.clean_messages,
                    last_action=excluded.last_action,
                    last_action_at=excluded.last_action_at,
                    heightened_scrutiny=excluded.heightened_scrutiny,
                    last_activity=excluded.last_activity;",
            )
            .bind(chat_id.0)
            .bind(user_id.0 as i64)
            .bind(i64::from(state.violation_count))
            .bind(state.trust_level.as_u8())
            .bind(state.joined_at)
            .bind(state.join_observed)
            .bind(i64::from(state.clean_messages))
            .bind(state.last_action.map(|x| x.action.to_string()))
            .bind(state.last_action.map(|x| x.at))
            .bind(state.heightened_scrutiny)
            .bind(state.last_activity)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM user_states WHERE last_activity < ?;")
            .bind(expired_before)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    /// Load all saved states. Rows that make no sense are logged and skipped, which amounts to
    /// resetting them.
    pub async fn load_states(&self) -> Result<Vec<(StateKey, UserState)>, Error> {
        let rows = sqlx::query("SELECT * FROM user_states;")
            .fetch_all(&self.pool)
            .await?;

        let mut states = Vec::with_capacity(rows.len());
        for row in &rows {
            match state_from_row(row) {
                Ok(state) => states.push(state),
                Err(e) => log::warn!("{e}. Resetting it."),
            }
        }
        Ok(states)
    }
}

fn state_from_row(row: &SqliteRow) -> Result<(StateKey, UserState), StateError> {
    let chat_id = ChatId(row.get::<i64, _>("chat_id"));
    let user_id = UserId(row.get::<i64, _>("user_id") as u64);
    let corrupted = |reason: String| StateError {
        chat_id,
        user_id,
        reason,
    };
    let field = |e: Error| corrupted(e.to_string());

    let violation_count: i64 = row.try_get("violation_count").map_err(field)?;
    let violation_count = u32::try_from(violation_count)
        .map_err(|_| corrupted(format!("violation count of {violation_count}")))?;
    let trust_level: u8 = row.try_get("trust_level").map_err(field)?;
    let trust_level = TrustLevel::from_u8(trust_level)
        .ok_or_else(|| corrupted(format!("trust level of {trust_level}")))?;
    let clean_messages: i64 = row.try_get("clean_messages").map_err(field)?;
    let clean_messages = u32::try_from(clean_messages)
        .map_err(|_| corrupted(format!("clean message count of {clean_messages}")))?;

    let last_action = match (
        row.try_get::<Option<String>, _>("last_action")
            .map_err(field)?,
        row.try_get::<Option<DateTime<Utc>>, _>("last_action_at")
            .map_err(field)?,
    ) {
        (Some(action), Some(at)) => Some(LastAction {
            action: Action::from_str(&action).map_err(corrupted)?,
            at,
        }),
        (None, None) => None,
        _ => return Err(corrupted("last action without a time".to_string())),
    };

    let state = UserState {
        recent_messages: Default::default(),
        fingerprints: Default::default(),
        violation_count,
        trust_level,
        joined_at: row.try_get("joined_at").map_err(field)?,
        join_observed: row.try_get("join_observed").map_err(field)?,
        clean_messages,
        last_action,
        heightened_scrutiny: row.try_get("heightened_scrutiny").map_err(field)?,
        last_activity: row.try_get("last_activity").map_err(field)?,
    };

    if violation_count > 0 && trust_level != TrustLevel::New {
        return Err(corrupted("user with violations is not marked as new".to_string()));
    }

    Ok(((chat_id, user_id), state))
}

/// Put everything saved into the state store.
pub async fn restore_states(database: &Database, store: &StateStore) -> Result<(), Error> {
    let states = database.load_states().await?;
    log::info!("Restored moderation state of {} users.", states.len());
    store.restore(states);
    Ok(())
}

/// Save what's in the state store right now.
pub async fn save_states(
    database: &Database,
    store: &StateStore,
    ttl: TimeDelta,
) -> Result<(), Error> {
    let states = store.committed_states();
    database.save_states(&states, Utc::now() - ttl).await?;
    log::debug!("Saved moderation state of {} users.", states.len());
    Ok(())
}

/// Periodically save the state store, for as long as both it and the database are around.
pub async fn save_spinloop(
    database: Weak<Database>,
    store: Weak<StateStore>,
    interval: Duration,
    ttl: TimeDelta,
) {
    loop {
        tokio::time::sleep(interval).await;

        let (Some(database), Some(store)) = (database.upgrade(), store.upgrade()) else {
            // Shutting down.
            return;
        };

        if let Err(e) = save_states(&database, &store, ttl).await {
            log::error!("Failed to save moderation state: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn words_are_kept_and_broadcast() {
        let database = Database::in_memory().await.unwrap();
        let list = database.word_list();
        assert!(list.borrow().is_empty());

        assert!(database.add_word("Casino").await.unwrap());
        assert!(!database.add_word("casino").await.unwrap());
        assert!(database.add_word("airdrop").await.unwrap());
        assert_eq!(
            list.borrow().iter().collect::<Vec<_>>(),
            ["airdrop", "casino"]
        );

        assert!(database.delete_word("CASINO").await.unwrap());
        assert!(!database.delete_word("casino").await.unwrap());
        assert_eq!(database.words().len(), 1);
    }

    #[tokio::test]
    async fn first_claimant_owns_the_bot() {
        let database = Database::in_memory().await.unwrap();
        assert_eq!(database.owner().await.unwrap(), None);
        assert_eq!(database.claim_owner(UserId(5)).await.unwrap(), UserId(5));
        assert_eq!(database.claim_owner(UserId(6)).await.unwrap(), UserId(5));
        assert_eq!(database.owner().await.unwrap(), Some(UserId(5)));
    }

    #[tokio::test]
    async fn states_survive_a_restart() {
        let database = Database::in_memory().await.unwrap();
        let mut state = UserState::new(t(0));
        state.violation_count = 2;
        state.join_observed = true;
        state.last_action = Some(LastAction {
            action: Action::Mute(Duration::from_secs(600)),
            at: t(10),
        });
        state.last_activity = t(10);
        state.recent_messages.push_back(t(10));
        let key = (ChatId(-100_123), UserId(u64::from(u32::MAX) + 7));

        database.save_states(&[(key, state.clone())], t(0)).await.unwrap();
        // Saving again replaces.
        database.save_states(&[(key, state.clone())], t(0)).await.unwrap();

        let loaded = database.load_states().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let (loaded_key, loaded_state) = &loaded[0];
        assert_eq!(*loaded_key, key);
        state.recent_messages.clear();
        assert_eq!(*loaded_state, state);
    }

    #[tokio::test]
    async fn stale_and_broken_rows_are_dropped() {
        let database = Database::in_memory().await.unwrap();
        let old = UserState::new(t(0));
        let fresh = UserState::new(t(1000));
        database
            .save_states(
                &[
                    ((ChatId(-1), UserId(1)), old),
                    ((ChatId(-1), UserId(2)), fresh),
                ],
                t(500),
            )
            .await
            .unwrap();
        sqlx::query("UPDATE user_states SET violation_count=-3 WHERE user_id=2;")
            .execute(&database.pool)
            .await
            .unwrap();

        let store = StateStore::new(Arc::new(crate::config::Config::default()));
        restore_states(&database, &store).await.unwrap();
        assert!(store.is_empty());
    }
}
