//! One-shot import of the old `request_history.json` file.
//!
//! The file maps account ids to `{has_2fa, imported_to_mission, result,
//! request_time}`. After a successful import it is renamed to
//! `request_history.json.bak` so the import never runs twice. A string
//! `result` is the display text shown at scan time and still carries the
//! two-step password or verification code.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::db::{self, Pool};
use crate::model::{AccountStatus, AccountUpsert};
use crate::parser::{extract_signal, Signal, SignalKind};

pub const HISTORY_FILE: &str = "request_history.json";

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    has_2fa: bool,
    #[serde(default)]
    imported_to_mission: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    request_time: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub accounts: usize,
    pub codes: usize,
    pub failed: usize,
}

fn epoch_lenient(v: &Value) -> i64 {
    v.as_i64()
        .or_else(|| v.as_f64().map(|f| f as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        .unwrap_or(0)
}

/// Secret recovered from a history `result`: either a `{code}` object or
/// the display text the scanner stored for the id.
fn legacy_signal(result: &Value) -> Option<Signal> {
    if let Value::String(text) = result {
        let signal = extract_signal(text);
        return (signal.kind != SignalKind::None).then_some(signal);
    }
    let code = match result.get("code")? {
        Value::String(s) => s.clone(),
        Value::Null => return None,
        other => other.to_string(),
    };
    Some(Signal {
        kind: SignalKind::VerificationCode,
        has_2fa: false,
        display_text: format!("验证码: {}", code),
        code: Some(code),
    })
}

/// Import `path` if it exists. Returns `None` when there was nothing to do.
#[instrument(skip(pool))]
pub async fn import_history(pool: &Pool, path: &Path) -> Result<Option<ImportReport>> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }

    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let history: BTreeMap<String, HistoryEntry> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let mut report = ImportReport::default();
    for (account_id, entry) in &history {
        let signal = legacy_signal(&entry.result);
        let mut upsert = AccountUpsert::new(account_id);
        upsert.has_2fa = entry.has_2fa || signal.as_ref().is_some_and(|s| s.has_2fa);
        if let Some(s) = signal.as_ref().filter(|s| s.kind == SignalKind::TwoStepPassword) {
            upsert.two_step_password = s.code.clone();
        }
        upsert.status = if entry.imported_to_mission {
            AccountStatus::Online
        } else {
            AccountStatus::Resolved
        };
        if let Err(err) = db::save_account(pool, &upsert).await {
            warn!(%account_id, ?err, "legacy account not imported");
            report.failed += 1;
            continue;
        }
        report.accounts += 1;

        if let Some(code) = signal.and_then(|s| s.code) {
            let send_time = epoch_lenient(&entry.request_time);
            match db::save_verification_code(pool, account_id, &code, send_time).await {
                Ok(_) => report.codes += 1,
                Err(err) => {
                    warn!(%account_id, ?err, "legacy code not imported");
                    report.failed += 1;
                }
            }
        }
    }

    let backup = path.with_extension("json.bak");
    fs::rename(path, &backup)
        .await
        .with_context(|| format!("failed to rename {} to {}", path.display(), backup.display()))?;
    info!(
        accounts = report.accounts,
        codes = report.codes,
        failed = report.failed,
        backup = %backup.display(),
        "legacy history imported"
    );
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn code(result: Value) -> Option<String> {
        legacy_signal(&result).and_then(|s| s.code)
    }

    #[test]
    fn codes_from_objects_and_display_text() {
        assert_eq!(code(json!({"code": "A1"})).as_deref(), Some("A1"));
        assert_eq!(code(json!({"code": 778899})).as_deref(), Some("778899"));
        assert_eq!(code(json!("验证码: A1")).as_deref(), Some("A1"));
        assert_eq!(code(json!("否")), None);
        assert_eq!(code(json!({"msg": "x"})), None);
        assert_eq!(code(Value::Null), None);

        let two_step = legacy_signal(&json!("设置两步密码【123456】成功")).unwrap();
        assert_eq!(two_step.kind, SignalKind::TwoStepPassword);
        assert!(two_step.has_2fa);
        assert_eq!(two_step.code.as_deref(), Some("123456"));
    }

    #[test]
    fn request_time_is_lenient() {
        assert_eq!(epoch_lenient(&json!(1700000000)), 1700000000);
        assert_eq!(epoch_lenient(&json!(1700000000.7)), 1700000000);
        assert_eq!(epoch_lenient(&json!("42")), 42);
        assert_eq!(epoch_lenient(&json!("2024-01-01 00:00:00")), 0);
    }
}
