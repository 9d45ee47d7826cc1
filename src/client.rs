//! HTTP collaborator: per-id account lookups and mission listings.

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::Remote;
use crate::model::Credentials;

const ACCOUNT_MISSION_PATH: &str = "tgcloud/account/account_mission";
const MISSION_LIST_PATH: &str = "tgcloud/mission/mission_list";
const MISSION_ACCOUNT_PATH: &str = "tgcloud/mission/mission_account";
const REFERER_PATH: &str = "tgcloud_pc/";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("remote error: {0}")]
    Remote(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One page of a paginated remote response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePage {
    pub data: Vec<Value>,
    /// Total number of records across all pages.
    pub total_records: u64,
    /// Page size the server applied; 0 when it did not say.
    pub limit: u64,
    /// Full response body as received.
    pub raw: Value,
}

impl RemotePage {
    /// Number of pages needed to cover `total_records`. Never less than one.
    pub fn total_pages(&self) -> u32 {
        if self.limit == 0 {
            return 1;
        }
        let pages = self.total_records.div_ceil(self.limit).max(1);
        u32::try_from(pages).unwrap_or(u32::MAX)
    }
}

/// Per-identifier lookup used by the scan workers.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn fetch_account_page(&self, id: u64, page: u32) -> Result<RemotePage, ClientError>;
}

/// Listing calls used by the mission sync.
#[async_trait]
pub trait MissionClient: Send + Sync {
    async fn list_missions(&self, page: u32, limit: u32) -> Result<RemotePage, ClientError>;

    async fn list_mission_accounts(
        &self,
        mission_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<RemotePage, ClientError>;
}

/// Builds an authenticated client for one engine run.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteClient>, ClientError>;
}

/// Read `data.data`, the record total and the page size out of a response body.
pub fn parse_account_page(raw: Value) -> Result<RemotePage, ClientError> {
    if let Some(err) = raw.get("error") {
        let msg = err
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(ClientError::Remote(msg));
    }

    let body = raw
        .get("data")
        .ok_or_else(|| ClientError::Malformed("missing `data`".into()))?;
    let data = body
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| ClientError::Malformed("`data.data` is not an array".into()))?;

    let total_records = ["totalRecords", "total", "totalPage"]
        .iter()
        .find_map(|key| body.get(*key).and_then(as_u64_lenient))
        .unwrap_or(data.len() as u64);
    let limit = body.get("limit").and_then(as_u64_lenient).unwrap_or(0);

    Ok(RemotePage {
        data,
        total_records,
        limit,
        raw,
    })
}

/// Listing endpoints signal success with `code == 1`.
pub fn parse_listing(raw: Value) -> Result<RemotePage, ClientError> {
    if raw.get("error").is_none() {
        let code = raw.get("code").and_then(as_u64_lenient);
        if code != Some(1) {
            let msg = raw
                .get("msg")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("unexpected code {:?}", code));
            return Err(ClientError::Remote(msg));
        }
    }
    parse_account_page(raw)
}

fn as_u64_lenient(v: &Value) -> Option<u64> {
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

#[derive(Clone)]
pub struct HttpRemoteClient {
    http: Client,
    base_url: Url,
    cookie: String,
    token: String,
    page_limit: u32,
}

impl fmt::Debug for HttpRemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemoteClient")
            .field("base_url", &self.base_url)
            .field("page_limit", &self.page_limit)
            .finish_non_exhaustive()
    }
}

impl HttpRemoteClient {
    pub fn new(remote: &Remote, credentials: &Credentials) -> Result<Self, ClientError> {
        let base_url = Url::parse(&remote.base_url)
            .map_err(|e| ClientError::Malformed(format!("invalid base url: {}", e)))?;
        // No per-request timeout; the transport default applies.
        let http = Client::builder()
            .user_agent(remote.user_agent.clone())
            .danger_accept_invalid_certs(remote.accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            base_url,
            cookie: credentials.cookie.clone(),
            token: credentials.token.clone(),
            page_limit: remote.page_limit,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::Malformed(format!("invalid endpoint {}: {}", path, e)))
    }

    fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder, ClientError> {
        let referer = self.endpoint(REFERER_PATH)?;
        Ok(self
            .http
            .request(method, self.endpoint(path)?)
            .header("Accept", "application/json, text/plain, */*")
            .header("Cookie", format!("PHPSESSID={}", self.cookie))
            .header("Referer", referer.as_str())
            .header("X-KL-Ajax-Request", "Ajax_Request")
            .header("token", &self.token))
    }

    pub fn build_account_request(&self, id: u64, page: u32) -> Result<reqwest::Request, ClientError> {
        Ok(self
            .request(Method::GET, ACCOUNT_MISSION_PATH)?
            .query(&[
                ("id", id.to_string()),
                ("page", page.to_string()),
                ("limit", self.page_limit.to_string()),
            ])
            .build()?)
    }

    pub fn build_listing_request(&self, path: &str, body: &Value) -> Result<reqwest::Request, ClientError> {
        Ok(self.request(Method::POST, path)?.json(body).build()?)
    }

    async fn execute(&self, request: reqwest::Request) -> Result<Value, ClientError> {
        debug!(url = %request.url(), method = %request.method(), "remote request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "remote returned non-success status");
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let text = res.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    #[instrument(skip(self))]
    async fn fetch_account_page(&self, id: u64, page: u32) -> Result<RemotePage, ClientError> {
        let request = self.build_account_request(id, page)?;
        let mut raw = self.execute(request).await?;
        if let Some(obj) = raw.as_object_mut() {
            obj.insert(
                "params".into(),
                json!({ "id": id, "page": page, "limit": self.page_limit }),
            );
        }
        parse_account_page(raw)
    }
}

#[async_trait]
impl MissionClient for HttpRemoteClient {
    #[instrument(skip(self))]
    async fn list_missions(&self, page: u32, limit: u32) -> Result<RemotePage, ClientError> {
        let body = json!({ "map": { "type": "filter" }, "page": page, "limit": limit });
        let request = self.build_listing_request(MISSION_LIST_PATH, &body)?;
        parse_listing(self.execute(request).await?)
    }

    #[instrument(skip(self))]
    async fn list_mission_accounts(
        &self,
        mission_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<RemotePage, ClientError> {
        // The service expects a numeric mission id when it looks like one.
        let mission: Value = mission_id
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(mission_id));
        let body = json!({ "map": {}, "mission_id": mission, "page": page, "limit": limit });
        let request = self.build_listing_request(MISSION_ACCOUNT_PATH, &body)?;
        parse_listing(self.execute(request).await?)
    }
}

/// Connector producing `HttpRemoteClient`s from the `remote` config section.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    remote: Remote,
}

impl HttpConnector {
    pub fn new(remote: Remote) -> Self {
        Self { remote }
    }
}

impl RemoteConnector for HttpConnector {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteClient>, ClientError> {
        Ok(Arc::new(HttpRemoteClient::new(&self.remote, credentials)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> Remote {
        Remote {
            base_url: "http://scan.example/".into(),
            user_agent: "tgcloud-scanner/test".into(),
            page_limit: 10,
            accept_invalid_certs: false,
        }
    }

    #[test]
    fn parses_account_page() {
        let page = parse_account_page(json!({
            "data": { "data": [{"a": 1}, {"a": 2}], "totalPage": 25, "limit": 10 }
        }))
        .unwrap();
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.total_records, 25);
        assert_eq!(page.limit, 10);
        assert_eq!(page.total_pages(), 3);
    }

    #[test]
    fn total_records_prefers_explicit_field_and_accepts_strings() {
        let page = parse_account_page(json!({
            "data": { "data": [], "totalRecords": "7", "totalPage": 99, "limit": "5" }
        }))
        .unwrap();
        assert_eq!(page.total_records, 7);
        assert_eq!(page.total_pages(), 2);
    }

    #[test]
    fn missing_limit_means_single_page() {
        let page = parse_account_page(json!({ "data": { "data": [1, 2, 3] } })).unwrap();
        assert_eq!(page.total_records, 3);
        assert_eq!(page.total_pages(), 1);

        let empty = parse_account_page(json!({ "data": { "data": [], "totalPage": 0, "limit": 10 } }))
            .unwrap();
        assert_eq!(empty.total_pages(), 1);
    }

    #[test]
    fn error_shapes() {
        let err = parse_account_page(json!({ "error": "session expired" })).unwrap_err();
        assert!(matches!(err, ClientError::Remote(ref m) if m == "session expired"));

        let err = parse_account_page(json!({ "data": { "data": "nope" } })).unwrap_err();
        assert!(matches!(err, ClientError::Malformed(_)));

        let err = parse_listing(json!({ "code": 0, "msg": "denied", "data": { "data": [] } }))
            .unwrap_err();
        assert!(matches!(err, ClientError::Remote(ref m) if m == "denied"));

        let ok = parse_listing(json!({ "code": 1, "data": { "data": [{}], "totalPage": 1, "limit": 10 } }))
            .unwrap();
        assert_eq!(ok.data.len(), 1);
    }

    #[test]
    fn account_request_carries_auth_and_paging() {
        let client = HttpRemoteClient::new(&remote(), &Credentials::new("sess", "tok")).unwrap();
        let req = client.build_account_request(11312122, 2).unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.url().path(), "/tgcloud/account/account_mission");
        assert_eq!(req.url().query(), Some("id=11312122&page=2&limit=10"));
        assert_eq!(req.headers()["Cookie"], "PHPSESSID=sess");
        assert_eq!(req.headers()["token"], "tok");
        assert_eq!(req.headers()["X-KL-Ajax-Request"], "Ajax_Request");
    }

    #[test]
    fn listing_request_is_json_post() {
        let client = HttpRemoteClient::new(&remote(), &Credentials::new("sess", "tok")).unwrap();
        let body = json!({ "map": {}, "mission_id": 7, "page": 1, "limit": 10 });
        let req = client
            .build_listing_request(MISSION_ACCOUNT_PATH, &body)
            .unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.url().path(), "/tgcloud/mission/mission_account");
        let sent: Value = serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(sent, body);
    }
}
