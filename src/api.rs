//! HTTP surface
//!
//! Health and stats probes, the historical query routes backed by the store,
//! and the upgrade handshake that promotes a connection into the hub. All
//! non-upgrade responses are JSON; store failures surface as 500 `{error}`
//! and validation failures as 400.

use std::sync::Arc;
use std::time::Instant;

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::client::run_connection;
use crate::config::DEFAULT_RETENTION_HOURS;
use crate::hub::{ClientRole, ConnectionHub};
use crate::registry::SessionRegistry;
use crate::store::{ReplayStore, StoreError};

const DEFAULT_SESSIONS_LIMIT: i64 = 50;
const MAX_SESSIONS_LIMIT: i64 = 500;
const DEFAULT_EVENTS_LIMIT: usize = 100;
const MAX_EVENTS_LIMIT: usize = 1_000;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ConnectionHub>,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<dyn ReplayStore>,
    pub batcher: Arc<crate::batcher::EventBatcher>,
    pub started_at: Instant,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_handler))
        .route("/health", web::get().to(health_handler))
        .route("/stats", web::get().to(stats_handler))
        .route("/sessions/active", web::get().to(active_sessions_handler))
        .route("/sessions/cleanup", web::delete().to(cleanup_handler))
        .route("/sessions/{id}/events", web::get().to(session_events_handler))
        .route("/sessions", web::get().to(sessions_handler))
        .route("/ws", web::get().to(ws_handler));
}

async fn index_handler() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "service": "replay-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_handler(state: web::Data<AppState>) -> HttpResponse {
    let websockets = state.hub.client_counts();
    let sessions = json!({
        "inMemory": state.registry.session_count(),
        "active": state.registry.active_session_count(),
    });

    let (status, database) = match state.store.stats().await {
        Ok(stats) if !state.batcher.is_degraded() => ("ok", json!(stats)),
        Ok(stats) => ("degraded", json!(stats)),
        Err(e) => {
            error!(error = %e, "health check could not reach the store");
            ("degraded", json!({ "error": e.to_string() }))
        }
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
        "uptime": state.started_at.elapsed().as_secs(),
        "database": database,
        "sessions": sessions,
        "websockets": websockets,
    }))
}

async fn stats_handler(state: web::Data<AppState>) -> HttpResponse {
    let counts = state.hub.client_counts();
    HttpResponse::Ok().json(json!({
        "totalClients": counts.total,
        "activeSessions": state.registry.active_session_count(),
        "viewers": counts.viewers,
        "trackers": counts.trackers,
        "totalEvents": state.registry.total_event_count(),
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

async fn active_sessions_handler(state: web::Data<AppState>) -> HttpResponse {
    match state.store.active_sessions().await {
        Ok(sessions) => HttpResponse::Ok().json(json!({ "sessions": sessions })),
        Err(e) => store_failure(e),
    }
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn sessions_handler(
    state: web::Data<AppState>,
    query: web::Query<SessionsQuery>,
) -> HttpResponse {
    let limit = query.limit.unwrap_or(DEFAULT_SESSIONS_LIMIT);
    let offset = query.offset.unwrap_or(0);
    if limit < 1 || offset < 0 {
        return HttpResponse::BadRequest()
            .json(json!({ "error": "limit must be positive and offset non-negative" }));
    }
    let limit = limit.min(MAX_SESSIONS_LIMIT);

    match state.store.all_sessions(limit, offset).await {
        Ok(sessions) => HttpResponse::Ok().json(json!({
            "sessions": sessions,
            "limit": limit,
            "offset": offset,
        })),
        Err(e) => store_failure(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    #[serde(default)]
    from_index: usize,
    limit: Option<usize>,
}

async fn session_events_handler(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<EventsQuery>,
) -> HttpResponse {
    let session_id = path.into_inner();
    let limit = query.limit.unwrap_or(DEFAULT_EVENTS_LIMIT).min(MAX_EVENTS_LIMIT);

    match state
        .store
        .session_events_page(&session_id, query.from_index, limit)
        .await
    {
        Ok(page) => HttpResponse::Ok().json(json!({
            "sessionId": session_id,
            "events": page.events,
            "fromIndex": query.from_index,
            "count": page.events.len(),
        })),
        Err(e) => store_failure(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupQuery {
    max_age_hours: Option<i64>,
}

async fn cleanup_handler(
    state: web::Data<AppState>,
    query: web::Query<CleanupQuery>,
) -> HttpResponse {
    let max_age_hours = query.max_age_hours.unwrap_or(DEFAULT_RETENTION_HOURS);
    if max_age_hours < 1 {
        return HttpResponse::BadRequest().json(json!({ "error": "maxAgeHours must be positive" }));
    }

    match state.store.cleanup_old_sessions(max_age_hours).await {
        Ok(deleted) => HttpResponse::Ok().json(json!({ "deletedCount": deleted })),
        Err(e) => store_failure(e),
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "type")]
    client_type: Option<String>,
}

async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsQuery>,
) -> actix_web::Result<HttpResponse> {
    let role = ClientRole::from_query(query.client_type.as_deref());
    let (response, session, stream) = actix_ws::handle(&req, stream)?;

    let connection_id = Uuid::new_v4();
    info!(%connection_id, ?role, "websocket upgrade accepted");

    let hub = state.hub.clone();
    actix_web::rt::spawn(async move {
        run_connection(hub, connection_id, role, session, stream).await;
    });

    Ok(response)
}

fn store_failure(e: StoreError) -> HttpResponse {
    error!(error = %e, "store query failed");
    HttpResponse::InternalServerError().json(json!({ "error": e.to_string() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{BatchWriter, EventBatcher, SessionBatch};
    use crate::store::{EventsPage, HistoryReader, StoreStats, StoredSession};
    use actix_web::{test, App};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct NullWriter;

    #[async_trait]
    impl BatchWriter for NullWriter {
        async fn apply_batches(&self, _batches: &[SessionBatch]) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct EmptyHistory;

    #[async_trait]
    impl HistoryReader for EmptyHistory {
        async fn events_page(
            &self,
            _session_id: &str,
            _from_index: usize,
            _limit: usize,
        ) -> Result<EventsPage, StoreError> {
            Ok(EventsPage::default())
        }

        async fn session_detail(
            &self,
            _session_id: &str,
        ) -> Result<Option<StoredSession>, StoreError> {
            Ok(None)
        }
    }

    /// Canned store: one session "s1" with a fixed event stream, or a store
    /// whose every query fails.
    struct FakeStore {
        sessions: Vec<StoredSession>,
        events: Vec<Value>,
        fail: bool,
    }

    impl FakeStore {
        fn with_session(is_active: bool, events: Vec<Value>) -> Arc<Self> {
            let now = Utc::now();
            Arc::new(Self {
                sessions: vec![StoredSession {
                    session_id: "s1".to_string(),
                    user_id: "u1".to_string(),
                    metadata: json!({"url": "/a"}),
                    is_active,
                    created_at: now,
                    updated_at: now,
                    event_count: events.len() as i64,
                    error_count: 0,
                }],
                events,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { sessions: Vec::new(), events: Vec::new(), fail: true })
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.fail {
                Err(StoreError::Unavailable("store is down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ReplayStore for FakeStore {
        async fn active_sessions(&self) -> Result<Vec<StoredSession>, StoreError> {
            self.check()?;
            Ok(self.sessions.iter().filter(|s| s.is_active).cloned().collect())
        }

        async fn all_sessions(
            &self,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<StoredSession>, StoreError> {
            self.check()?;
            Ok(self
                .sessions
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn session_events_page(
            &self,
            session_id: &str,
            from_index: usize,
            limit: usize,
        ) -> Result<EventsPage, StoreError> {
            self.check()?;
            if session_id != "s1" {
                return Ok(EventsPage::default());
            }
            let events = self.events.iter().skip(from_index).take(limit).cloned().collect();
            Ok(EventsPage { events, total_events: self.events.len() as u64 })
        }

        async fn stats(&self) -> Result<StoreStats, StoreError> {
            self.check()?;
            Ok(StoreStats {
                total_sessions: self.sessions.len() as i64,
                active_sessions: self.sessions.iter().filter(|s| s.is_active).count() as i64,
                total_events: self.events.len() as i64,
            })
        }

        async fn cleanup_old_sessions(&self, _max_age_hours: i64) -> Result<u64, StoreError> {
            self.check()?;
            Ok(2)
        }
    }

    fn test_state(store: Arc<dyn ReplayStore>) -> web::Data<AppState> {
        let batcher = EventBatcher::new(Arc::new(NullWriter), 10);
        let registry = Arc::new(SessionRegistry::new(batcher.clone(), 100));
        let hub = Arc::new(ConnectionHub::new(
            registry.clone(),
            Arc::new(EmptyHistory),
            Duration::from_secs(60),
        ));
        web::Data::new(AppState { hub, registry, store, batcher, started_at: Instant::now() })
    }

    #[actix_web::test]
    async fn test_index_identifies_service() {
        let app = test::init_service(App::new().route("/", web::get().to(index_handler))).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert!(resp.status().is_success());

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["service"], "replay-relay");
    }

    #[actix_web::test]
    async fn test_paged_history_over_http() {
        let store = FakeStore::with_session(true, vec![json!({"k": 1}), json!({"k": 2})]);
        let app = test::init_service(App::new().app_data(test_state(store)).configure(configure))
            .await;

        let req = test::TestRequest::get()
            .uri("/sessions/s1/events?fromIndex=0&limit=1")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["sessionId"], "s1");
        assert_eq!(body["events"], json!([{"k": 1}]));
        assert_eq!(body["count"], 1);
        assert_eq!(body["fromIndex"], 0);

        let req = test::TestRequest::get()
            .uri("/sessions/s1/events?fromIndex=1&limit=1")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["events"], json!([{"k": 2}]));
        assert_eq!(body["fromIndex"], 1);
    }

    #[actix_web::test]
    async fn test_events_past_end_is_empty() {
        let store = FakeStore::with_session(true, vec![json!({"k": 1})]);
        let app = test::init_service(App::new().app_data(test_state(store)).configure(configure))
            .await;

        let req = test::TestRequest::get()
            .uri("/sessions/s1/events?fromIndex=10&limit=5")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: Value = test::read_body_json(resp).await;
        assert!(body["events"].as_array().unwrap().is_empty());
        assert_eq!(body["count"], 0);
    }

    #[actix_web::test]
    async fn test_ended_session_listed_only_in_full_index() {
        let store = FakeStore::with_session(false, Vec::new());
        let app = test::init_service(App::new().app_data(test_state(store)).configure(configure))
            .await;

        // Ended sessions disappear from the active listing.
        let req = test::TestRequest::get().uri("/sessions/active").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: Value = test::read_body_json(resp).await;
        assert!(body["sessions"].as_array().unwrap().is_empty());

        // The full index still lists them, inactive.
        let req = test::TestRequest::get().uri("/sessions?limit=10&offset=0").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["sessions"][0]["sessionId"], "s1");
        assert_eq!(body["sessions"][0]["isActive"], false);
        assert_eq!(body["limit"], 10);
        assert_eq!(body["offset"], 0);
    }

    #[actix_web::test]
    async fn test_store_failure_surfaces_as_500() {
        let app = test::init_service(
            App::new().app_data(test_state(FakeStore::failing())).configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/sessions/active").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 500);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"].as_str().is_some());
    }

    #[actix_web::test]
    async fn test_invalid_pagination_is_rejected() {
        let store = FakeStore::with_session(true, Vec::new());
        let app = test::init_service(App::new().app_data(test_state(store)).configure(configure))
            .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/sessions?limit=0").to_request(),
        )
        .await;
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[actix_web::test]
    async fn test_cleanup_reports_deleted_count() {
        let store = FakeStore::with_session(false, Vec::new());
        let app = test::init_service(App::new().app_data(test_state(store)).configure(configure))
            .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::delete().uri("/sessions/cleanup?maxAgeHours=48").to_request(),
        )
        .await;
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["deletedCount"], 2);

        let resp = test::call_service(
            &app,
            test::TestRequest::delete().uri("/sessions/cleanup?maxAgeHours=0").to_request(),
        )
        .await;
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[actix_web::test]
    async fn test_health_reports_degraded_when_store_down() {
        let app = test::init_service(
            App::new().app_data(test_state(FakeStore::failing())).configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "degraded");
        assert!(body["database"]["error"].as_str().is_some());
        assert_eq!(body["websockets"]["total"], 0);
    }

    #[actix_web::test]
    async fn test_stats_shape() {
        let store = FakeStore::with_session(true, Vec::new());
        let app = test::init_service(App::new().app_data(test_state(store)).configure(configure))
            .await;

        let req = test::TestRequest::get().uri("/stats").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["totalClients"], 0);
        assert_eq!(body["trackers"], 0);
        assert_eq!(body["viewers"], 0);
        assert_eq!(body["activeSessions"], 0);
    }

    #[actix_web::test]
    async fn test_events_query_parses_camel_case() {
        let query: EventsQuery = serde_json::from_str(r#"{"fromIndex": 5, "limit": 2}"#).unwrap();
        assert_eq!(query.from_index, 5);
        assert_eq!(query.limit, Some(2));
    }
}
