//! Global game state singleton (`game_state`).
//!
//! One document, created on first read, changed only through merge patches
//! checked against its version.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use studio_agency::WeekKey;

use crate::event_store::EventStoreError;

pub const GAME_STATE_ID: &str = "global";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    pub current_week: u32,
    pub current_cycle: u32,
    pub auto_pilot: bool,
    /// ISO week of the last weekly settlement.
    pub last_finance_run: Option<WeekKey>,
    pub last_performance_run: Option<WeekKey>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl GameConfig {
    pub fn initial(at: DateTime<Utc>) -> Self {
        Self {
            current_week: 1,
            current_cycle: 1,
            auto_pilot: false,
            last_finance_run: None,
            last_performance_run: None,
            version: 1,
            updated_at: at,
        }
    }

    fn merged(&self, patch: &GameConfigPatch, at: DateTime<Utc>) -> Self {
        Self {
            current_week: patch.current_week.unwrap_or(self.current_week),
            current_cycle: patch.current_cycle.unwrap_or(self.current_cycle),
            auto_pilot: patch.auto_pilot.unwrap_or(self.auto_pilot),
            last_finance_run: patch
                .last_finance_run
                .clone()
                .or_else(|| self.last_finance_run.clone()),
            last_performance_run: patch
                .last_performance_run
                .clone()
                .or_else(|| self.last_performance_run.clone()),
            version: self.version + 1,
            updated_at: at,
        }
    }
}

/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfigPatch {
    pub current_week: Option<u32>,
    pub current_cycle: Option<u32>,
    pub auto_pilot: Option<bool>,
    pub last_finance_run: Option<WeekKey>,
    pub last_performance_run: Option<WeekKey>,
}

impl GameConfigPatch {
    pub fn finance_run(week: WeekKey) -> Self {
        Self {
            last_finance_run: Some(week),
            ..Self::default()
        }
    }

    pub fn auto_pilot(enabled: bool) -> Self {
        Self {
            auto_pilot: Some(enabled),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Error)]
pub enum GameConfigError {
    #[error("game config changed concurrently (expected version {expected}, found {actual})")]
    Concurrency { expected: u64, actual: u64 },
    #[error("game config unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt game config: {0}")]
    Corrupt(String),
}

impl From<EventStoreError> for GameConfigError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Corrupt(msg) => GameConfigError::Corrupt(msg),
            other => GameConfigError::Unavailable(other.to_string()),
        }
    }
}

pub trait GameConfigStore: Send + Sync {
    /// Current document, inserting the initial one when absent.
    fn get_or_create(&self) -> Result<GameConfig, GameConfigError>;

    /// Merge `patch` into the document if it is still at `expected_version`.
    fn patch(&self, patch: &GameConfigPatch, expected_version: u64) -> Result<GameConfig, GameConfigError>;
}

impl<S> GameConfigStore for Arc<S>
where
    S: GameConfigStore + ?Sized,
{
    fn get_or_create(&self) -> Result<GameConfig, GameConfigError> {
        (**self).get_or_create()
    }

    fn patch(&self, patch: &GameConfigPatch, expected_version: u64) -> Result<GameConfig, GameConfigError> {
        (**self).patch(patch, expected_version)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryGameConfigStore {
    inner: Mutex<Option<GameConfig>>,
}

impl InMemoryGameConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<GameConfig>>, GameConfigError> {
        self.inner
            .lock()
            .map_err(|_| GameConfigError::Unavailable("game config lock poisoned".to_string()))
    }
}

impl GameConfigStore for InMemoryGameConfigStore {
    fn get_or_create(&self) -> Result<GameConfig, GameConfigError> {
        let mut slot = self.lock()?;
        Ok(slot.get_or_insert_with(|| GameConfig::initial(Utc::now())).clone())
    }

    fn patch(&self, patch: &GameConfigPatch, expected_version: u64) -> Result<GameConfig, GameConfigError> {
        let mut slot = self.lock()?;
        let current = slot.get_or_insert_with(|| GameConfig::initial(Utc::now()));
        if current.version != expected_version {
            return Err(GameConfigError::Concurrency {
                expected: expected_version,
                actual: current.version,
            });
        }
        let next = current.merged(patch, Utc::now());
        *current = next.clone();
        Ok(next)
    }
}

#[cfg(feature = "postgres")]
pub use self::postgres::PostgresGameConfigStore;

#[cfg(feature = "postgres")]
mod postgres {
    use std::sync::Arc;

    use chrono::Utc;
    use sqlx::{PgPool, Row};
    use tokio::runtime::Runtime;

    use super::{GameConfig, GameConfigError, GameConfigPatch, GameConfigStore, GAME_STATE_ID};
    use crate::event_store::postgres::map_sqlx_error;
    use crate::event_store::PostgresEventStore;

    /// Game state row in the same database as the event log.
    #[derive(Debug, Clone)]
    pub struct PostgresGameConfigStore {
        pool: PgPool,
        runtime: Arc<Runtime>,
    }

    impl PostgresGameConfigStore {
        /// Share the event store's pool and runtime.
        pub fn from_event_store(store: &PostgresEventStore) -> Self {
            Self {
                pool: store.pool().clone(),
                runtime: store.runtime(),
            }
        }

        async fn get_or_create_async(&self) -> Result<GameConfig, GameConfigError> {
            let initial = GameConfig::initial(Utc::now());
            let document = serde_json::to_value(&initial)
                .map_err(|e| GameConfigError::Corrupt(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO game_state (id, document, version)
                VALUES ($1, $2, $3)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(GAME_STATE_ID)
            .bind(&document)
            .bind(initial.version as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_game_state", e))?;

            let row = sqlx::query("SELECT document FROM game_state WHERE id = $1")
                .bind(GAME_STATE_ID)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("load_game_state", e))?;
            decode(&row)
        }

        async fn patch_async(
            &self,
            patch: &GameConfigPatch,
            expected_version: u64,
        ) -> Result<GameConfig, GameConfigError> {
            let current = self.get_or_create_async().await?;
            if current.version != expected_version {
                return Err(GameConfigError::Concurrency {
                    expected: expected_version,
                    actual: current.version,
                });
            }
            let next = current.merged(patch, Utc::now());
            let document =
                serde_json::to_value(&next).map_err(|e| GameConfigError::Corrupt(e.to_string()))?;

            // The version predicate makes the update a compare-and-swap.
            let updated = sqlx::query(
                r#"
                UPDATE game_state
                SET document = $2, version = $3, updated_at = NOW()
                WHERE id = $1 AND version = $4
                "#,
            )
            .bind(GAME_STATE_ID)
            .bind(&document)
            .bind(next.version as i64)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("patch_game_state", e))?;

            if updated.rows_affected() == 0 {
                return Err(GameConfigError::Concurrency {
                    expected: expected_version,
                    actual: expected_version + 1,
                });
            }
            Ok(next)
        }
    }

    fn decode(row: &sqlx::postgres::PgRow) -> Result<GameConfig, GameConfigError> {
        let document: serde_json::Value = row
            .try_get("document")
            .map_err(|e| GameConfigError::Corrupt(e.to_string()))?;
        serde_json::from_value(document).map_err(|e| GameConfigError::Corrupt(e.to_string()))
    }

    impl GameConfigStore for PostgresGameConfigStore {
        fn get_or_create(&self) -> Result<GameConfig, GameConfigError> {
            self.runtime.block_on(self.get_or_create_async())
        }

        fn patch(&self, patch: &GameConfigPatch, expected_version: u64) -> Result<GameConfig, GameConfigError> {
            self.runtime.block_on(self.patch_async(patch, expected_version))
        }
    }
}
