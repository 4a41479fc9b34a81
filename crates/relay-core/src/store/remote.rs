use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::{
    domain::{ClientId, SessionBlob},
    errors::Error,
    store::{SessionStore, StoreBackend, StoredSession},
    utils::{iso_timestamp_utc, truncate_text},
    Result,
};

const TABLE: &str = "whatsapp_sessions";
const PROVISION_RPC: &str = "create_whatsapp_sessions_table";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Supabase (PostgREST) session store.
///
/// Rows look like `{client_id, session_data, updated_at}` with `client_id` unique.
pub struct RemoteStore {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct SessionRow {
    session_data: SessionBlob,
}

impl RemoteStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/rest/v1/{path}", self.base_url)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    /// Create the sessions table through the provisioning RPC if the project defines one.
    async fn provision(&self) -> Result<()> {
        let resp = self
            .authed(self.http.post(self.endpoint(&format!("rpc/{PROVISION_RPC}"))))
            .json(&json!({}))
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if is_auth_failure(status) {
            return Err(rejected("provisioning", status, resp).await);
        }

        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND || body.contains("already exists") {
            tracing::debug!(%status, "table provisioning skipped");
        } else {
            tracing::warn!(%status, body = %truncate_text(&body, 300), "table provisioning failed");
        }
        Ok(())
    }

    /// Cheap read proving the credentials work and the table is reachable.
    async fn probe(&self) -> Result<()> {
        let resp = self
            .authed(self.http.get(self.endpoint(TABLE)))
            .query(&[("select", "client_id"), ("limit", "1")])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(rejected("table probe", status, resp).await);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for RemoteStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Remote
    }

    async fn initialize(&self) -> Result<()> {
        self.provision().await?;
        self.probe().await?;
        tracing::info!("remote session storage initialized");
        Ok(())
    }

    async fn save(&self, client_id: &ClientId, session: &SessionBlob) -> Result<()> {
        let row = StoredSession {
            client_id: client_id.0.clone(),
            session_data: session.clone(),
            updated_at: iso_timestamp_utc(),
        };
        let resp = self
            .authed(self.http.post(self.endpoint(TABLE)))
            .query(&[("on_conflict", "client_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(rejected("save", status, resp).await);
        }
        Ok(())
    }

    async fn load(&self, client_id: &ClientId) -> Result<Option<SessionBlob>> {
        let resp = self
            .authed(self.http.get(self.endpoint(TABLE)))
            .query(&[
                ("select", "session_data".to_string()),
                ("client_id", format!("eq.{}", client_id.as_str())),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(rejected("load", status, resp).await);
        }
        let rows: Vec<SessionRow> = resp.json().await?;
        Ok(rows.into_iter().next().map(|r| r.session_data))
    }

    async fn delete(&self, client_id: &ClientId) -> Result<()> {
        let resp = self
            .authed(self.http.delete(self.endpoint(TABLE)))
            .query(&[("client_id", format!("eq.{}", client_id.as_str()))])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(rejected("delete", status, resp).await);
        }
        Ok(())
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

async fn rejected(op: &str, status: StatusCode, resp: Response) -> Error {
    let body = resp.text().await.unwrap_or_default();
    Error::Storage(format!(
        "supabase {op} failed with {status}: {}",
        truncate_text(body.trim(), 300)
    ))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use axum::{
        extract::{Query, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::Value;
    use tokio::sync::Mutex;

    use super::*;

    const GOOD_KEY: &str = "anon-key";

    #[derive(Clone, Default)]
    struct FakeDb {
        rows: Arc<Mutex<HashMap<String, Value>>>,
        has_rpc: bool,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("apikey").and_then(|v| v.to_str().ok()) == Some(GOOD_KEY)
            && headers.get("authorization").and_then(|v| v.to_str().ok())
                == Some(&format!("Bearer {GOOD_KEY}")[..])
    }

    fn client_filter(q: &HashMap<String, String>) -> Option<String> {
        q.get("client_id")
            .and_then(|v| v.strip_prefix("eq."))
            .map(|s| s.to_string())
    }

    async fn rpc(State(db): State<FakeDb>, headers: HeaderMap) -> (AxumStatus, Json<Value>) {
        if !authorized(&headers) {
            return (AxumStatus::UNAUTHORIZED, Json(json!({"message": "Invalid API key"})));
        }
        if !db.has_rpc {
            return (AxumStatus::NOT_FOUND, Json(json!({"code": "PGRST202"})));
        }
        (AxumStatus::OK, Json(Value::Null))
    }

    async fn select(
        State(db): State<FakeDb>,
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
    ) -> (AxumStatus, Json<Value>) {
        if !authorized(&headers) {
            return (AxumStatus::UNAUTHORIZED, Json(json!({"message": "Invalid API key"})));
        }
        let rows = db.rows.lock().await;
        let out = match client_filter(&q) {
            Some(id) => rows
                .get(&id)
                .map(|data| vec![json!({ "session_data": data })])
                .unwrap_or_default(),
            None => rows
                .keys()
                .take(1)
                .map(|id| json!({ "client_id": id }))
                .collect(),
        };
        (AxumStatus::OK, Json(Value::Array(out)))
    }

    async fn upsert(
        State(db): State<FakeDb>,
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
        Json(body): Json<Vec<Value>>,
    ) -> AxumStatus {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED;
        }
        let merge = headers
            .get("prefer")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("resolution=merge-duplicates"));
        if !merge || q.get("on_conflict").map(String::as_str) != Some("client_id") {
            return AxumStatus::CONFLICT;
        }
        let mut rows = db.rows.lock().await;
        for row in body {
            let (Some(id), Some(data)) = (
                row.get("client_id").and_then(|v| v.as_str()),
                row.get("session_data"),
            ) else {
                return AxumStatus::BAD_REQUEST;
            };
            if row.get("updated_at").and_then(|v| v.as_str()).is_none() {
                return AxumStatus::BAD_REQUEST;
            }
            rows.insert(id.to_string(), data.clone());
        }
        AxumStatus::CREATED
    }

    async fn remove(
        State(db): State<FakeDb>,
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
    ) -> AxumStatus {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED;
        }
        if let Some(id) = client_filter(&q) {
            db.rows.lock().await.remove(&id);
        }
        AxumStatus::NO_CONTENT
    }

    async fn spawn_fake(db: FakeDb) -> String {
        let app = Router::new()
            .route(&format!("/rest/v1/rpc/{PROVISION_RPC}"), post(rpc))
            .route(
                &format!("/rest/v1/{TABLE}"),
                get(select).post(upsert).delete(remove),
            )
            .with_state(db);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn id() -> ClientId {
        ClientId("whatsapp-bot".to_string())
    }

    #[tokio::test]
    async fn initialize_then_round_trip() {
        let url = spawn_fake(FakeDb {
            has_rpc: true,
            ..Default::default()
        })
        .await;
        let store = RemoteStore::new(&url, GOOD_KEY).unwrap();
        store.initialize().await.unwrap();
        store.initialize().await.unwrap();

        let blob = SessionBlob(json!({"WABrowserId": "b", "WASecretBundle": {"k": 1}}));
        store.save(&id(), &blob).await.unwrap();
        assert_eq!(store.load(&id()).await.unwrap(), Some(blob));
    }

    #[tokio::test]
    async fn missing_rpc_is_tolerated() {
        let url = spawn_fake(FakeDb::default()).await;
        let store = RemoteStore::new(&url, GOOD_KEY).unwrap();
        store.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_id_loads_none() {
        let url = spawn_fake(FakeDb::default()).await;
        let store = RemoteStore::new(&url, GOOD_KEY).unwrap();
        assert_eq!(store.load(&ClientId("ghost".to_string())).await.unwrap(), None);
    }

    #[tokio::test]
    async fn upsert_overwrites_and_delete_removes() {
        let db = FakeDb::default();
        let url = spawn_fake(db.clone()).await;
        let store = RemoteStore::new(&url, GOOD_KEY).unwrap();

        store.save(&id(), &SessionBlob(json!("old"))).await.unwrap();
        store.save(&id(), &SessionBlob(json!("new"))).await.unwrap();
        assert_eq!(db.rows.lock().await.len(), 1);
        assert_eq!(store.load(&id()).await.unwrap(), Some(SessionBlob(json!("new"))));

        store.delete(&id()).await.unwrap();
        store.delete(&id()).await.unwrap();
        assert_eq!(store.load(&id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bad_credentials_fail_initialize() {
        let url = spawn_fake(FakeDb {
            has_rpc: true,
            ..Default::default()
        })
        .await;
        let store = RemoteStore::new(&url, "wrong").unwrap();

        let err = store.initialize().await.unwrap_err();
        assert!(
            matches!(&err, Error::Storage(msg) if msg.contains("401")),
            "unexpected error: {err}"
        );
        assert!(matches!(store.load(&id()).await, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = RemoteStore::new(&format!("http://{addr}"), GOOD_KEY).unwrap();
        assert!(matches!(store.initialize().await, Err(Error::Http(_))));
    }
}
