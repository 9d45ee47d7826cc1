use super::model::ResolvedAccount;
use crate::model::{
    Account, AccountFilter, AccountStatus, AccountUpsert, Mission, MissionUpsert, Page,
    VerificationCode,
};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

pub type Pool = SqlitePool;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Account columns joined with the newest verification code of that account.
const ACCOUNT_SELECT: &str = "SELECT a.id, a.account_id, a.phone, a.username, a.has_2fa, a.status, \
        a.success_count, a.fail_count, a.group_name, a.two_step_password, \
        a.created_at, a.updated_at, \
        v.id AS code_id, v.code AS code, v.send_time AS code_send_time, \
        v.created_at AS code_created_at \
     FROM accounts a \
     LEFT JOIN verification_codes v ON v.id = ( \
        SELECT vc.id FROM verification_codes vc \
        WHERE vc.account_id = a.account_id \
        ORDER BY vc.created_at DESC, vc.id DESC LIMIT 1)";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus full sync; workers write concurrently so wait on locks instead of failing.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

/// Apply the embedded, versioned migrations. Already-applied versions are skipped.
pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to run migrations")?;
    info!("database migrations applied");
    Ok(())
}

fn account_from_row(row: &SqliteRow) -> Result<Account> {
    let code_id: Option<i64> = row.try_get("code_id")?;
    let latest_code = match code_id {
        Some(id) => Some(VerificationCode {
            id,
            account_id: row.try_get("account_id")?,
            code: row.try_get("code")?,
            send_time: row.try_get("code_send_time")?,
            created_at: row.try_get("code_created_at")?,
        }),
        None => None,
    };

    Ok(Account {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        phone: row.try_get("phone")?,
        username: row.try_get("username")?,
        has_2fa: row.try_get("has_2fa")?,
        status: AccountStatus::from_code(row.try_get("status")?),
        success_count: row.try_get("success_count")?,
        fail_count: row.try_get("fail_count")?,
        group: row.try_get("group_name")?,
        two_step_password: row.try_get("two_step_password")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        latest_code,
    })
}

/// Upsert an account by `account_id`.
///
/// `created_at` is written only by the first insert. `two_step_password` keeps
/// the stored value when the new one is missing or empty; other optional
/// fields keep the stored value when `None`.
#[instrument(skip_all, fields(account_id = %data.account_id))]
pub async fn save_account(pool: &Pool, data: &AccountUpsert) -> Result<()> {
    let now = Utc::now();
    let secret = data
        .two_step_password
        .as_deref()
        .filter(|s| !s.is_empty());
    sqlx::query(
        "INSERT INTO accounts (account_id, phone, username, has_2fa, status, success_count, \
            fail_count, group_name, two_step_password, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, 0), COALESCE(?7, 0), ?8, COALESCE(?9, ''), ?10, ?10) \
         ON CONFLICT(account_id) DO UPDATE SET \
            phone = COALESCE(?2, accounts.phone), \
            username = COALESCE(?3, accounts.username), \
            has_2fa = ?4, \
            status = ?5, \
            success_count = COALESCE(?6, accounts.success_count), \
            fail_count = COALESCE(?7, accounts.fail_count), \
            group_name = COALESCE(?8, accounts.group_name), \
            two_step_password = COALESCE(?9, accounts.two_step_password), \
            updated_at = ?10",
    )
    .bind(&data.account_id)
    .bind(data.phone.as_deref())
    .bind(data.username.as_deref())
    .bind(data.has_2fa)
    .bind(data.status.code())
    .bind(data.success_count)
    .bind(data.fail_count)
    .bind(data.group.as_deref())
    .bind(secret)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to save account")?;
    Ok(())
}

/// Append a verification code row. Prior rows are never touched.
#[instrument(skip_all, fields(account_id = %account_id))]
pub async fn save_verification_code(
    pool: &Pool,
    account_id: &str,
    code: &str,
    send_time: i64,
) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO verification_codes (account_id, code, send_time, created_at) \
         VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(account_id)
    .bind(code)
    .bind(send_time)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to save verification code")?
    .get("id");
    Ok(id)
}

#[instrument(skip_all)]
pub async fn get_account(pool: &Pool, account_id: &str) -> Result<Option<Account>> {
    let sql = format!("{} WHERE a.account_id = ?", ACCOUNT_SELECT);
    let row = sqlx::query(&sql)
        .bind(account_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(account_from_row).transpose()
}

/// Page through accounts, newest first. `page` is 1-based.
#[instrument(skip_all)]
pub async fn get_all_accounts(
    pool: &Pool,
    page: i64,
    limit: i64,
    filter: AccountFilter,
) -> Result<Page<Account>> {
    let page = page.max(1);
    let limit = limit.max(1);
    let predicate = "WHERE (?1 IS NULL OR a.has_2fa = ?1) \
        AND (?2 IS NULL OR (CASE WHEN a.two_step_password <> '' THEN 1 ELSE 0 END) = ?2)";

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM accounts a {}", predicate))
        .bind(filter.has_2fa)
        .bind(filter.has_secret)
        .fetch_one(pool)
        .await?;

    let sql = format!(
        "{} {} ORDER BY a.created_at DESC, a.id DESC LIMIT ?3 OFFSET ?4",
        ACCOUNT_SELECT, predicate
    );
    let rows = sqlx::query(&sql)
        .bind(filter.has_2fa)
        .bind(filter.has_secret)
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(pool)
        .await?;
    let data = rows.iter().map(account_from_row).collect::<Result<Vec<_>>>()?;

    Ok(Page {
        total,
        page,
        limit,
        data,
    })
}

/// Every stored account id with its 2FA flag and newest code.
#[instrument(skip_all)]
pub async fn load_resolved(pool: &Pool) -> Result<Vec<ResolvedAccount>> {
    let sql = format!("{} ORDER BY a.id ASC", ACCOUNT_SELECT);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.into_iter()
        .map(|row| {
            Ok(ResolvedAccount {
                account_id: row.try_get("account_id")?,
                has_2fa: row.try_get("has_2fa")?,
                latest_code: row.try_get("code")?,
            })
        })
        .collect()
}

/// Full code history of one account, oldest first.
pub async fn list_verification_codes(pool: &Pool, account_id: &str) -> Result<Vec<VerificationCode>> {
    let rows = sqlx::query(
        "SELECT id, account_id, code, send_time, created_at FROM verification_codes \
         WHERE account_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            Ok(VerificationCode {
                id: row.try_get("id")?,
                account_id: row.try_get("account_id")?,
                code: row.try_get("code")?,
                send_time: row.try_get("send_time")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

#[instrument(skip_all, fields(mission_id = %data.mission_id))]
pub async fn save_mission(pool: &Pool, data: &MissionUpsert) -> Result<()> {
    sqlx::query(
        "INSERT INTO missions (mission_id, mission_type, status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?4) \
         ON CONFLICT(mission_id) DO UPDATE SET \
            mission_type = COALESCE(?2, missions.mission_type), \
            status = ?3, \
            updated_at = ?4",
    )
    .bind(&data.mission_id)
    .bind(data.mission_type.as_deref())
    .bind(data.status)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to save mission")?;
    Ok(())
}

pub async fn get_mission(pool: &Pool, mission_id: &str) -> Result<Option<Mission>> {
    let row = sqlx::query(
        "SELECT id, mission_id, mission_type, status, created_at, updated_at \
         FROM missions WHERE mission_id = ?",
    )
    .bind(mission_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(Mission {
        id: row.try_get("id")?,
        mission_id: row.try_get("mission_id")?,
        mission_type: row.try_get("mission_type")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

#[instrument(skip_all, fields(mission_id = %mission_id, account_id = %account_id))]
pub async fn save_mission_account(
    pool: &Pool,
    mission_id: &str,
    account_id: &str,
    status: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO mission_accounts (mission_id, account_id, status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?4) \
         ON CONFLICT(mission_id, account_id) DO UPDATE SET \
            status = ?3, \
            updated_at = ?4",
    )
    .bind(mission_id)
    .bind(account_id)
    .bind(status)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to save mission account")?;
    Ok(())
}

/// Accounts linked to a mission. Links whose account was never scanned are skipped.
pub async fn list_mission_accounts(
    pool: &Pool,
    mission_id: &str,
    page: i64,
    limit: i64,
) -> Result<Page<Account>> {
    let page = page.max(1);
    let limit = limit.max(1);
    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM mission_accounts ma \
         JOIN accounts a ON ma.account_id = a.account_id WHERE ma.mission_id = ?",
    )
    .bind(mission_id)
    .fetch_one(pool)
    .await?;

    let sql = format!(
        "{} JOIN mission_accounts ma ON ma.account_id = a.account_id \
         WHERE ma.mission_id = ? ORDER BY ma.id ASC LIMIT ? OFFSET ?",
        ACCOUNT_SELECT
    );
    let rows = sqlx::query(&sql)
        .bind(mission_id)
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(pool)
        .await?;
    let data = rows.iter().map(account_from_row).collect::<Result<Vec<_>>>()?;
    Ok(Page {
        total,
        page,
        limit,
        data,
    })
}

/// An account counts as imported once it belongs to any mission.
pub async fn is_imported(pool: &Pool, account_id: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM mission_accounts WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

pub async fn get_config(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM configs WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(value.flatten())
}

#[instrument(skip_all, fields(key = %key))]
pub async fn save_config(pool: &Pool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO configs (key, value, updated_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to save config")?;
    Ok(())
}
