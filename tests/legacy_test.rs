use serde_json::json;
use std::fs;
use tempfile::tempdir;
use tgcloud_scanner::db;
use tgcloud_scanner::legacy::{import_history, HISTORY_FILE};
use tgcloud_scanner::model::AccountStatus;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[tokio::test]
async fn imports_history_then_renames_file() {
    let pool = setup_pool().await;
    let dir = tempdir().unwrap();
    let path = dir.path().join(HISTORY_FILE);
    let history = json!({
        "1001": { "has_2fa": true, "imported_to_mission": false, "result": { "code": "A1B2" }, "request_time": 1700000000 },
        "1002": { "has_2fa": false, "imported_to_mission": true, "result": "否" },
        "1003": { "has_2fa": true },
        "1004": { "has_2fa": false, "result": "设置两步密码【123456】成功", "request_time": "1700000100" },
        "1005": { "result": "验证码: Q7X" }
    });
    fs::write(&path, history.to_string()).unwrap();

    let report = import_history(&pool, &path).await.unwrap().unwrap();
    assert_eq!(report.accounts, 5);
    assert_eq!(report.codes, 3);
    assert_eq!(report.failed, 0);

    assert!(!path.exists());
    assert!(dir.path().join("request_history.json.bak").exists());

    let a = db::get_account(&pool, "1001").await.unwrap().unwrap();
    assert!(a.has_2fa);
    assert_eq!(a.status, AccountStatus::Resolved);
    let code = a.latest_code.unwrap();
    assert_eq!(code.code, "A1B2");
    assert_eq!(code.send_time, 1700000000);

    let b = db::get_account(&pool, "1002").await.unwrap().unwrap();
    assert_eq!(b.status, AccountStatus::Online);
    assert!(b.latest_code.is_none());

    assert!(db::get_account(&pool, "1003").await.unwrap().is_some());

    // display text stored by older scans still carries the secret
    let d = db::get_account(&pool, "1004").await.unwrap().unwrap();
    assert!(d.has_2fa);
    assert_eq!(d.two_step_password, "123456");
    let code = d.latest_code.unwrap();
    assert_eq!(code.code, "123456");
    assert_eq!(code.send_time, 1700000100);

    let e = db::get_account(&pool, "1005").await.unwrap().unwrap();
    assert_eq!(e.two_step_password, "");
    assert_eq!(e.latest_code.unwrap().code, "Q7X");

    // the file is gone, so a second call does nothing
    assert!(import_history(&pool, &path).await.unwrap().is_none());
}

#[tokio::test]
async fn missing_file_is_a_no_op() {
    let pool = setup_pool().await;
    let dir = tempdir().unwrap();
    let report = import_history(&pool, &dir.path().join(HISTORY_FILE))
        .await
        .unwrap();
    assert!(report.is_none());
    assert!(db::load_resolved(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn unparsable_file_is_left_in_place() {
    let pool = setup_pool().await;
    let dir = tempdir().unwrap();
    let path = dir.path().join(HISTORY_FILE);
    fs::write(&path, "{ not json").unwrap();

    assert!(import_history(&pool, &path).await.is_err());
    assert!(path.exists());
}
