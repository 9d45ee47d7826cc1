use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tgcloud_scanner::client::{parse_listing, ClientError, MissionClient, RemotePage};
use tgcloud_scanner::db;
use tgcloud_scanner::missions::{sync_missions, SyncOptions};
use tgcloud_scanner::model::AccountUpsert;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn link_status(pool: &sqlx::SqlitePool, mission_id: &str, account_id: &str) -> Option<i64> {
    sqlx::query_scalar("SELECT status FROM mission_accounts WHERE mission_id = ? AND account_id = ?")
        .bind(mission_id)
        .bind(account_id)
        .fetch_optional(pool)
        .await
        .unwrap()
}

fn listing(rows: Vec<Value>, total: u64, limit: u64) -> Value {
    json!({ "code": 1, "msg": "ok", "data": { "data": rows, "totalPage": total, "limit": limit } })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Missions { page: u32, limit: u32 },
    Accounts { mission_id: String, page: u32 },
}

#[derive(Clone, Default)]
struct RecordingMissions {
    missions: Arc<Mutex<Option<Value>>>,
    accounts: Arc<Mutex<HashMap<(String, u32), Value>>>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl RecordingMissions {
    async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl MissionClient for RecordingMissions {
    async fn list_missions(&self, page: u32, limit: u32) -> Result<RemotePage, ClientError> {
        self.calls.lock().await.push(Call::Missions { page, limit });
        let body = self
            .missions
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| json!({ "error": "not logged in" }));
        parse_listing(body)
    }

    async fn list_mission_accounts(
        &self,
        mission_id: &str,
        page: u32,
        _limit: u32,
    ) -> Result<RemotePage, ClientError> {
        self.calls.lock().await.push(Call::Accounts {
            mission_id: mission_id.to_string(),
            page,
        });
        let body = self
            .accounts
            .lock()
            .await
            .get(&(mission_id.to_string(), page))
            .cloned()
            .unwrap_or_else(|| json!({ "code": 0, "msg": "page unavailable" }));
        parse_listing(body)
    }
}

#[tokio::test]
async fn syncs_missions_and_all_account_pages() {
    let pool = setup_pool().await;
    for id in ["100", "101", "102"] {
        db::save_account(&pool, &AccountUpsert::new(id)).await.unwrap();
    }

    let client = RecordingMissions::default();
    *client.missions.lock().await = Some(listing(
        vec![
            json!({ "id": 7, "type": "filter", "status": 1 }),
            json!({ "id": "8", "status": "2" }),
        ],
        2,
        10,
    ));
    {
        let mut accounts = client.accounts.lock().await;
        accounts.insert(
            ("7".into(), 1),
            listing(
                vec![
                    json!({ "account_id": 100, "status": 1 }),
                    json!({ "account_id": "101" }),
                ],
                3,
                2,
            ),
        );
        accounts.insert(
            ("7".into(), 2),
            listing(vec![json!({ "account_id": 102, "status": 3 })], 3, 2),
        );
        accounts.insert(("8".into(), 1), listing(vec![], 0, 10));
    }

    let report = sync_missions(&pool, &client, &CancellationToken::new(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.missions, 2);
    assert_eq!(report.accounts, 3);
    assert_eq!(report.failed_pages, 0);
    assert!(!report.cancelled);

    assert_eq!(
        client.calls().await,
        vec![
            Call::Missions { page: 1, limit: 10 },
            Call::Accounts { mission_id: "7".into(), page: 1 },
            Call::Accounts { mission_id: "7".into(), page: 2 },
            Call::Accounts { mission_id: "8".into(), page: 1 },
        ]
    );

    let seven = db::get_mission(&pool, "7").await.unwrap().unwrap();
    assert_eq!(seven.mission_type.as_deref(), Some("filter"));
    assert_eq!(seven.status, 1);
    assert_eq!(db::get_mission(&pool, "8").await.unwrap().unwrap().status, 2);

    assert_eq!(link_status(&pool, "7", "101").await, Some(0));
    assert_eq!(link_status(&pool, "7", "102").await, Some(3));
    assert!(db::is_imported(&pool, "100").await.unwrap());

    let page = db::list_mission_accounts(&pool, "7", 1, 10).await.unwrap();
    assert_eq!(page.total, 3);
}

#[tokio::test]
async fn failed_account_pages_are_skipped() {
    let pool = setup_pool().await;
    let client = RecordingMissions::default();
    *client.missions.lock().await = Some(listing(vec![json!({ "id": 1 }), json!({ "id": 2 })], 2, 10));
    {
        let mut accounts = client.accounts.lock().await;
        // mission 1: page 2 of 3 is missing
        accounts.insert(("1".into(), 1), listing(vec![json!({ "account_id": 11 })], 3, 1));
        accounts.insert(("1".into(), 3), listing(vec![json!({ "account_id": 13 })], 3, 1));
        // mission 2: first page is missing entirely
    }

    let report = sync_missions(&pool, &client, &CancellationToken::new(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.missions, 2);
    assert_eq!(report.accounts, 2);
    assert_eq!(report.failed_pages, 2);
    assert!(link_status(&pool, "1", "13").await.is_some());
    assert!(link_status(&pool, "1", "12").await.is_none());
}

#[tokio::test]
async fn mission_list_failure_is_an_error() {
    let pool = setup_pool().await;
    let client = RecordingMissions::default();
    let err = sync_missions(&pool, &client, &CancellationToken::new(), &SyncOptions::default())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("not logged in"));
}

#[tokio::test]
async fn cancelled_sync_stops_before_missions() {
    let pool = setup_pool().await;
    let client = RecordingMissions::default();
    *client.missions.lock().await = Some(listing(vec![json!({ "id": 1 })], 1, 10));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = sync_missions(&pool, &client, &cancel, &SyncOptions::default())
        .await
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.missions, 0);
    assert_eq!(client.calls().await.len(), 1);
}
