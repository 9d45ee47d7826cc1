//! Pull the remote mission list and each mission's accounts into the store.

use anyhow::{Context, Result};
use serde_json::Value;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::client::MissionClient;
use crate::db::{self, Pool};
use crate::model::MissionUpsert;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mission_limit: u32,
    pub account_limit: u32,
    /// Pause after each account page.
    pub interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mission_limit: 10,
            account_limit: 10,
            interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissionSyncReport {
    pub missions: usize,
    pub accounts: usize,
    pub failed_pages: usize,
    pub cancelled: bool,
}

/// Ids come back as numbers or strings depending on the endpoint.
fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_lenient(v: Option<&Value>) -> i64 {
    v.and_then(|v| {
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    })
    .unwrap_or(0)
}

#[instrument(skip_all)]
pub async fn sync_missions(
    pool: &Pool,
    client: &dyn MissionClient,
    cancel: &CancellationToken,
    options: &SyncOptions,
) -> Result<MissionSyncReport> {
    let mut report = MissionSyncReport::default();
    let listing = client
        .list_missions(1, options.mission_limit)
        .await
        .context("failed to list missions")?;
    if listing.data.is_empty() {
        info!("no missions found");
        return Ok(report);
    }

    for mission in &listing.data {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let Some(mission_id) = mission.get("id").and_then(id_string) else {
            warn!(%mission, "mission without id; skipping");
            continue;
        };
        let upsert = MissionUpsert {
            mission_id: mission_id.clone(),
            mission_type: mission.get("type").and_then(id_string),
            status: int_lenient(mission.get("status")),
        };
        if let Err(err) = db::save_mission(pool, &upsert).await {
            warn!(%mission_id, ?err, "mission not saved");
            continue;
        }
        report.missions += 1;

        let saved = sync_mission_accounts(pool, client, cancel, options, &mission_id, &mut report).await;
        info!(%mission_id, accounts = saved, "mission synced");
    }

    info!(
        missions = report.missions,
        accounts = report.accounts,
        failed_pages = report.failed_pages,
        "mission sync finished"
    );
    Ok(report)
}

async fn sync_mission_accounts(
    pool: &Pool,
    client: &dyn MissionClient,
    cancel: &CancellationToken,
    options: &SyncOptions,
    mission_id: &str,
    report: &mut MissionSyncReport,
) -> usize {
    let first = match client
        .list_mission_accounts(mission_id, 1, options.account_limit)
        .await
    {
        Ok(page) => page,
        Err(err) => {
            warn!(%mission_id, %err, "failed to list mission accounts");
            report.failed_pages += 1;
            return 0;
        }
    };
    let total_pages = first.total_pages();
    info!(
        %mission_id,
        total_records = first.total_records,
        limit = first.limit,
        total_pages,
        "listing mission accounts"
    );

    let mut saved = save_rows(pool, mission_id, &first.data).await;
    for page in 2..=total_pages {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        if !options.interval.is_zero() {
            time::sleep(options.interval).await;
        }
        match client
            .list_mission_accounts(mission_id, page, options.account_limit)
            .await
        {
            Ok(next) => saved += save_rows(pool, mission_id, &next.data).await,
            Err(err) => {
                warn!(%mission_id, page, %err, "mission account page failed");
                report.failed_pages += 1;
            }
        }
    }
    report.accounts += saved;
    saved
}

async fn save_rows(pool: &Pool, mission_id: &str, rows: &[Value]) -> usize {
    let mut saved = 0;
    for row in rows {
        let Some(account_id) = row
            .get("account_id")
            .or_else(|| row.get("id"))
            .and_then(id_string)
        else {
            warn!(%mission_id, %row, "mission account row without account id");
            continue;
        };
        let status = int_lenient(row.get("status"));
        match db::save_mission_account(pool, mission_id, &account_id, status).await {
            Ok(()) => saved += 1,
            Err(err) => warn!(%mission_id, %account_id, ?err, "mission account not saved"),
        }
    }
    saved
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_accept_numbers_and_strings() {
        assert_eq!(id_string(&json!(42)).as_deref(), Some("42"));
        assert_eq!(id_string(&json!("m-7")).as_deref(), Some("m-7"));
        assert_eq!(id_string(&json!("")), None);
        assert_eq!(id_string(&json!(null)), None);
    }

    #[test]
    fn status_defaults_to_zero() {
        assert_eq!(int_lenient(Some(&json!(2))), 2);
        assert_eq!(int_lenient(Some(&json!("3"))), 3);
        assert_eq!(int_lenient(Some(&json!("x"))), 0);
        assert_eq!(int_lenient(None), 0);
    }
}
