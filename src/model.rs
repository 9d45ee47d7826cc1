use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a scanned account as stored in `accounts.status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum AccountStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Deleted,
    Resolved,
}

impl AccountStatus {
    pub fn code(&self) -> i64 {
        match self {
            AccountStatus::Unknown => 0,
            AccountStatus::Online => 1,
            AccountStatus::Offline => 2,
            AccountStatus::Deleted => 3,
            AccountStatus::Resolved => 4,
        }
    }

    /// Unrecognised codes map to `Unknown` rather than failing the row.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => AccountStatus::Online,
            2 => AccountStatus::Offline,
            3 => AccountStatus::Deleted,
            4 => AccountStatus::Resolved,
            _ => AccountStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Unknown => "unknown",
            AccountStatus::Online => "online",
            AccountStatus::Offline => "offline",
            AccountStatus::Deleted => "deleted",
            AccountStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session credentials for the remote service. Acquired outside this crate.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub cookie: String,
    pub token: String,
}

impl Credentials {
    pub fn new(cookie: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
            token: token.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.cookie.trim().is_empty() && !self.token.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("cookie", &"[REDACTED]")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationCode {
    pub id: i64,
    pub account_id: String,
    pub code: String,
    /// Epoch seconds reported by the caller.
    pub send_time: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub account_id: String,
    pub phone: Option<String>,
    pub username: Option<String>,
    pub has_2fa: bool,
    pub status: AccountStatus,
    pub success_count: i64,
    pub fail_count: i64,
    pub group: Option<String>,
    pub two_step_password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Row with the greatest `created_at` for this account, if any.
    pub latest_code: Option<VerificationCode>,
}

/// Input for `db::save_account`. `None` leaves the stored column untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountUpsert {
    pub account_id: String,
    pub phone: Option<String>,
    pub username: Option<String>,
    pub has_2fa: bool,
    pub status: AccountStatus,
    pub success_count: Option<i64>,
    pub fail_count: Option<i64>,
    pub group: Option<String>,
    /// An empty string is treated like `None`.
    pub two_step_password: Option<String>,
}

impl AccountUpsert {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: i64,
    pub mission_id: String,
    pub mission_type: Option<String>,
    pub status: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissionUpsert {
    pub mission_id: String,
    pub mission_type: Option<String>,
    pub status: i64,
}

/// Optional filters for `db::get_all_accounts`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountFilter {
    pub has_2fa: Option<bool>,
    /// `Some(true)` keeps only accounts with a non-empty `two_step_password`.
    pub has_secret: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub data: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip_and_unknown_fallback() {
        for status in [
            AccountStatus::Unknown,
            AccountStatus::Online,
            AccountStatus::Offline,
            AccountStatus::Deleted,
            AccountStatus::Resolved,
        ] {
            assert_eq!(AccountStatus::from_code(status.code()), status);
        }
        assert_eq!(AccountStatus::from_code(42), AccountStatus::Unknown);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::new("sess-123", "tok-456");
        let dbg = format!("{:?}", creds);
        assert!(!dbg.contains("sess-123"));
        assert!(!dbg.contains("tok-456"));
        assert!(creds.is_complete());
        assert!(!Credentials::new("", "tok").is_complete());
    }
}
