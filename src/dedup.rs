//! At-most-once gate in front of the remote service.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, instrument};

use crate::db::{self, Pool};
use crate::model::{AccountStatus, AccountUpsert};
use crate::parser::{Signal, SignalKind};

/// Last known outcome for an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub has_2fa: bool,
    pub code: Option<String>,
}

impl From<&Signal> for Outcome {
    fn from(signal: &Signal) -> Self {
        Self {
            has_2fa: signal.has_2fa,
            code: signal.code.clone(),
        }
    }
}

/// In-memory map of resolved identifiers backed by the repository.
///
/// Assumes a single engine instance owns the database; the cache is never
/// invalidated by outside writers.
#[derive(Debug)]
pub struct DedupGate {
    seen: Mutex<HashMap<String, Outcome>>,
    pool: Pool,
}

impl DedupGate {
    pub fn empty(pool: Pool) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            pool,
        }
    }

    /// Warm the cache with every identifier the repository already knows.
    #[instrument(skip_all)]
    pub async fn load(pool: Pool) -> Result<Self> {
        let resolved = db::load_resolved(&pool)
            .await
            .context("failed to load resolved accounts")?;
        let seen: HashMap<String, Outcome> = resolved
            .into_iter()
            .map(|r| {
                (
                    r.account_id,
                    Outcome {
                        has_2fa: r.has_2fa,
                        code: r.latest_code,
                    },
                )
            })
            .collect();
        info!(count = seen.len(), "dedup cache loaded");
        Ok(Self {
            seen: Mutex::new(seen),
            pool,
        })
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Outcome>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seen(&self, id: u64) -> bool {
        self.map().contains_key(&id.to_string())
    }

    pub fn outcome(&self, id: u64) -> Option<Outcome> {
        self.map().get(&id.to_string()).cloned()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Persist the resolution, then mark the identifier as seen.
    ///
    /// The cache is updated even when a write fails; the error is returned
    /// for the caller to log.
    #[instrument(skip(self, signal))]
    pub async fn record(&self, id: u64, signal: &Signal) -> Result<()> {
        let account_id = id.to_string();
        let result = self.persist(&account_id, signal).await;
        self.map().insert(account_id, Outcome::from(signal));
        result
    }

    async fn persist(&self, account_id: &str, signal: &Signal) -> Result<()> {
        let mut upsert = AccountUpsert::new(account_id);
        upsert.has_2fa = signal.has_2fa;
        upsert.status = AccountStatus::Resolved;
        if signal.kind == SignalKind::TwoStepPassword {
            upsert.two_step_password = signal.code.clone();
        }
        db::save_account(&self.pool, &upsert).await?;

        if let Some(code) = &signal.code {
            db::save_verification_code(&self.pool, account_id, code, Utc::now().timestamp())
                .await?;
        }
        Ok(())
    }
}
