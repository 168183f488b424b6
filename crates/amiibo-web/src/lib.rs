//! Axum + Askama HTTP surface for the amiibo tracker.

use std::sync::Arc;

use amiibo_adapters::{CatalogDatabase, DatabaseQuery};
use amiibo_core::{MergedView, ToggleAction, UserContext};
use amiibo_storage::StoreError;
use amiibo_sync::{BackfillJob, ReconcileError, ReconciliationEngine, TrackerConfig, TrackerServices};
use askama::Template;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "amiibo-web";

pub const SHEET_HEADER: &str = "x-amiibo-sheet";
pub const SHEET_COOKIE: &str = "amiibo_sheet";
pub const TOKEN_COOKIE: &str = "amiibo_token";
pub const SCRAPE_TOKEN_HEADER: &str = "x-scrape-token";

/// Seconds suggested to a throttled client when Sheets sent no `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub backfill: Arc<BackfillJob>,
    pub database: Arc<CatalogDatabase>,
    /// Required to force a scrape; without it `force` is ignored.
    pub scrape_token: Option<String>,
}

impl AppState {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        backfill: Arc<BackfillJob>,
        database: Arc<CatalogDatabase>,
    ) -> Self {
        Self {
            engine,
            backfill,
            database,
            scrape_token: None,
        }
    }

    pub fn with_scrape_token(mut self, token: Option<String>) -> Self {
        self.scrape_token = token;
        self
    }
}

impl From<TrackerServices> for AppState {
    fn from(services: TrackerServices) -> Self {
        Self::new(services.engine, services.backfill, services.database)
            .with_scrape_token(services.scrape_token)
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    signed_in: bool,
    dark_mode: bool,
}

#[derive(Template)]
#[template(path = "tracker.html")]
struct TrackerTemplate {
    view: MergedView,
    dark_mode: bool,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    message: String,
    dark_mode: bool,
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    amiibo_id: String,
    action: String,
    #[serde(default)]
    amiibo_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DarkModeRequest {
    dark_mode: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ScrapeQuery {
    force: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DatabaseParams {
    name: Option<String>,
    gameseries: Option<String>,
    character: Option<String>,
    showusage: Option<String>,
}

fn flag_set(value: Option<&str>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "" | "1" | "true" | "yes"))
}

impl From<DatabaseParams> for DatabaseQuery {
    fn from(params: DatabaseParams) -> Self {
        Self {
            show_usage: flag_set(params.showusage.as_deref()),
            name: params.name,
            game_series: params.gameseries,
            character: params.character,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/tracker", get(tracker_handler))
        .route("/toggle", post(toggle_handler))
        .route("/toggle-dark-mode", post(dark_mode_handler))
        .route(
            "/api/scrape-nintendo",
            get(scrape_health_handler).post(scrape_handler),
        )
        .route("/api/amiibo", get(database_handler))
        .route("/api/amiibo/", get(database_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(config: TrackerConfig) -> anyhow::Result<()> {
    let services = TrackerServices::from_config(&config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "amiibo tracker listening");
    axum::serve(listener, app(services.into())).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(TrackerConfig::from_env()).await
}

fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
}

/// Per-request user context from the session headers or cookies. The sheet id
/// is required; the bearer credential is optional so local stores work without one.
pub fn session_from_headers(headers: &HeaderMap) -> Option<UserContext> {
    let sheet = headers
        .get(SHEET_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| cookie(headers, SHEET_COOKIE))
        .map(str::trim)
        .filter(|s| !s.is_empty())?;

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| cookie(headers, TOKEN_COOKIE))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let user = UserContext::new(sheet);
    Some(match token {
        Some(token) => user.with_credential(token),
        None => user,
    })
}

async fn index_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user = session_from_headers(&headers);
    let dark_mode = match &user {
        Some(user) => state
            .engine
            .preferences(user)
            .await
            .map(|p| p.dark_mode)
            .unwrap_or(false),
        None => false,
    };
    render_html(IndexTemplate {
        signed_in: user.is_some(),
        dark_mode,
    })
}

async fn tracker_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(user) = session_from_headers(&headers) else {
        return Redirect::to("/").into_response();
    };
    match state.engine.render_view(&user).await {
        Ok(view) => {
            let dark_mode = view.preferences.dark_mode;
            render_html(TrackerTemplate { view, dark_mode })
        }
        Err(err) => {
            warn!(error = %err, "rendering tracker failed");
            let status = error_status(&err);
            let mut resp = render_html(ErrorTemplate {
                message: err.user_message().to_string(),
                dark_mode: false,
            });
            *resp.status_mut() = status;
            resp
        }
    }
}

fn error_status(err: &ReconcileError) -> StatusCode {
    match err {
        ReconcileError::CatalogUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ReconcileError::UnknownAmiibo(_) => StatusCode::NOT_FOUND,
        ReconcileError::AwaitingBackfill(_) => StatusCode::CONFLICT,
        ReconcileError::StoreReadFailed(StoreError::RateLimited { .. })
        | ReconcileError::StoreWriteFailed(StoreError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
        ReconcileError::StoreReadFailed(_) | ReconcileError::StoreWriteFailed(_) => StatusCode::BAD_GATEWAY,
    }
}

/// JSON error body for a failed store call; throttling becomes a 429 carrying `retry_after`.
fn store_error_response(err: &ReconcileError) -> Response {
    let (ReconcileError::StoreReadFailed(StoreError::RateLimited { retry_after_secs })
    | ReconcileError::StoreWriteFailed(StoreError::RateLimited { retry_after_secs })) = err
    else {
        return json_error(error_status(err), err.user_message());
    };
    let retry_after = retry_after_secs.unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.to_string())],
        Json(json!({
            "status": "rate_limited",
            "message": err.user_message(),
            "retry_after": retry_after,
        })),
    )
        .into_response()
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "status": "error", "message": message.into() })),
    )
        .into_response()
}

fn unauthorized() -> Response {
    json_error(StatusCode::UNAUTHORIZED, "not signed in")
}

async fn toggle_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(user) = session_from_headers(&headers) else {
        return unauthorized();
    };
    let request: ToggleRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, format!("invalid toggle payload: {err}")),
    };
    let action: ToggleAction = match request.action.parse() {
        Ok(action) => action,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, err),
    };

    match state
        .engine
        .toggle(&user, &request.amiibo_id, request.amiibo_name.as_deref(), action)
        .await
    {
        Ok(collected) => Json(json!({ "status": "success", "collected": collected })).into_response(),
        Err(ReconcileError::UnknownAmiibo(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "status": "not found" }))).into_response()
        }
        Err(err) => {
            warn!(error = %err, amiibo_id = %request.amiibo_id, "toggle failed");
            store_error_response(&err)
        }
    }
}

async fn dark_mode_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(user) = session_from_headers(&headers) else {
        return unauthorized();
    };
    let request: DarkModeRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, format!("invalid dark mode payload: {err}")),
    };
    match state.engine.set_dark_mode(&user, request.dark_mode).await {
        Ok(prefs) => Json(json!({ "status": "success", "dark_mode": prefs.dark_mode })).into_response(),
        Err(err) => {
            warn!(error = %err, "saving dark mode failed");
            store_error_response(&err)
        }
    }
}

/// True when the request carries the configured scrape token, as a bearer
/// credential or in `x-scrape-token`.
fn scrape_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.scrape_token.as_deref() else {
        return false;
    };
    let presented = headers
        .get(SCRAPE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim);
    presented == Some(expected)
}

async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ScrapeQuery>,
) -> Response {
    let requested = query
        .force
        .as_deref()
        .is_some_and(|v| !v.trim().is_empty() && flag_set(Some(v)));
    let force = requested && scrape_authorized(&state, &headers);
    if requested && !force {
        warn!("force requested without a valid scrape token; staleness guard applies");
    }
    let outcome = state.backfill.run(force).await;
    Json(outcome).into_response()
}

async fn database_handler(State(state): State<Arc<AppState>>, Query(params): Query<DatabaseParams>) -> Response {
    match state.database.list(&params.into()).await {
        Ok(listing) => Json(json!({ "amiibo": listing.amiibo })).into_response(),
        Err(err) => {
            warn!(error = %err, "amiibo database unavailable");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "The amiibo catalog is unavailable right now. Please try again later.",
            )
        }
    }
}

async fn scrape_health_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.backfill.snapshot();
    let last_run = snapshot.modified_at().await.map(|t| t.to_rfc3339());
    Json(json!({
        "status": "ok",
        "endpoint": "scrape-nintendo",
        "method": "POST",
        "snapshot": snapshot.path().display().to_string(),
        "interval_secs": state.backfill.interval().as_secs(),
        "last_run": last_run,
    }))
    .into_response()
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use amiibo_adapters::{AdapterError, CatalogError, CatalogProvider, LineupSource, ScrapedAmiibo, StaticCatalog};
    use amiibo_core::{AmiiboKind, AmiiboRecord, CatalogEntry, ReleaseDates, UserPreferences};
    use amiibo_storage::{CollectionStore, MemoryCollectionStore, SnapshotStore};
    use std::collections::BTreeMap;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct NoLineup;

    #[async_trait]
    impl LineupSource for NoLineup {
        async fn fetch_lineup(&self) -> Result<Vec<ScrapedAmiibo>, AdapterError> {
            Err(AdapterError::Message("offline".into()))
        }
    }

    struct DownCatalog;

    #[async_trait]
    impl CatalogProvider for DownCatalog {
        async fn fetch_catalog(&self) -> Result<Vec<AmiiboRecord>, CatalogError> {
            Err(CatalogError::Unavailable {
                remote: "timeout".into(),
                snapshot: "missing".into(),
            })
        }
    }

    fn record(id: &str, name: &str) -> AmiiboRecord {
        AmiiboRecord {
            id: id.to_string(),
            name: name.to_string(),
            series: "Super Mario Bros.".to_string(),
            image_url: String::new(),
            kind: AmiiboKind::Figure,
            release: ReleaseDates::default(),
            is_upcoming: false,
            needs_backfill: false,
        }
    }

    /// Rejects every call as throttled, like Sheets under load.
    struct ThrottledStore;

    #[async_trait]
    impl CollectionStore for ThrottledStore {
        async fn read_all(&self, _user: &UserContext) -> Result<BTreeMap<String, bool>, StoreError> {
            Ok(BTreeMap::new())
        }

        async fn write(&self, _: &UserContext, _: &str, _: &str, _: bool) -> Result<(), StoreError> {
            Err(StoreError::RateLimited { retry_after_secs: Some(11) })
        }

        async fn read_preferences(&self, _user: &UserContext) -> Result<UserPreferences, StoreError> {
            Ok(UserPreferences::default())
        }

        async fn write_preferences(&self, _: &UserContext, _: UserPreferences) -> Result<(), StoreError> {
            Err(StoreError::RateLimited { retry_after_secs: None })
        }
    }

    fn state_with(catalog: Arc<dyn CatalogProvider>, store: Arc<dyn CollectionStore>) -> (AppState, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = SnapshotStore::new(dir.path().join("amiibo_database.json"));
        let engine = ReconciliationEngine::new(catalog, store).with_retry_delay(Duration::ZERO);
        let backfill = BackfillJob::new(snapshot.clone(), Arc::new(NoLineup));
        let database = CatalogDatabase::new(None, Some(snapshot));
        (AppState::new(Arc::new(engine), Arc::new(backfill), Arc::new(database)), dir)
    }

    fn snapshot_entry(head: &str, name: &str, game_series: &str) -> CatalogEntry {
        CatalogEntry {
            head: head.into(),
            tail: "00000002".into(),
            game_series: game_series.into(),
            character: name.into(),
            name: name.into(),
            kind: "Figure".into(),
            ..Default::default()
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn mario_state(store: Arc<MemoryCollectionStore>) -> (AppState, TempDir) {
        state_with(Arc::new(StaticCatalog::new(vec![record("A1", "Mario")])), store)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(SHEET_HEADER, "sheet-1")
            .header(header::AUTHORIZATION, "Bearer token-1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn text_body(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn session_reads_headers_or_cookies() {
        let mut headers = HeaderMap::new();
        assert!(session_from_headers(&headers).is_none());

        headers.insert(header::COOKIE, "theme=x; amiibo_sheet=sheet-9; amiibo_token=tok".parse().unwrap());
        let user = session_from_headers(&headers).unwrap();
        assert_eq!(user.user_id, "sheet-9");
        assert_eq!(user.credential.as_deref(), Some("tok"));

        headers.insert(SHEET_HEADER, "sheet-1".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        let user = session_from_headers(&headers).unwrap();
        assert_eq!(user.user_id, "sheet-1");
        assert_eq!(user.credential.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn toggle_collects_and_tracker_renders_it() {
        let store = Arc::new(MemoryCollectionStore::new());
        let (state, _dir) = mario_state(store.clone());
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(post_json("/toggle", r#"{"amiibo_id":"A1","action":"collect"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["collected"], true);

        let rows = store.rows(&UserContext::new("sheet-1")).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amiibo_name, "Mario");

        let page = app
            .oneshot(
                Request::builder()
                    .uri("/tracker")
                    .header(header::COOKIE, "amiibo_sheet=sheet-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(page.status(), StatusCode::OK);
        let html = text_body(page).await;
        assert!(html.contains("1 of 1 collected"));
        assert!(html.contains(r#"data-amiibo-id="A1""#));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found_and_store_unchanged() {
        let store = Arc::new(MemoryCollectionStore::new());
        let (state, _dir) = mario_state(store.clone());
        let resp = app(state)
            .oneshot(post_json("/toggle", r#"{"amiibo_id":"ZZZ","action":"collect"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["status"], "not found");
        assert!(store.rows(&UserContext::new("sheet-1")).await.is_empty());
    }

    #[tokio::test]
    async fn toggle_rejects_bad_payloads_and_missing_sessions() {
        let (state, _dir) = mario_state(Arc::new(MemoryCollectionStore::new()));
        let app = app(state);

        let bad_action = app
            .clone()
            .oneshot(post_json("/toggle", r#"{"amiibo_id":"A1","action":"flip"}"#))
            .await
            .unwrap();
        assert_eq!(bad_action.status(), StatusCode::BAD_REQUEST);

        let bad_json = app.clone().oneshot(post_json("/toggle", "{")).await.unwrap();
        assert_eq!(bad_json.status(), StatusCode::BAD_REQUEST);

        let anonymous = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/toggle")
                    .body(Body::from(r#"{"amiibo_id":"A1","action":"collect"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn tracker_without_session_redirects_home() {
        let (state, _dir) = mario_state(Arc::new(MemoryCollectionStore::new()));
        let resp = app(state)
            .oneshot(Request::builder().uri("/tracker").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.status().is_redirection());
        assert_eq!(resp.headers()[header::LOCATION], "/");
    }

    #[tokio::test]
    async fn catalog_outage_renders_error_page() {
        let (state, _dir) = state_with(Arc::new(DownCatalog), Arc::new(MemoryCollectionStore::new()));
        let resp = app(state)
            .oneshot(
                Request::builder()
                    .uri("/tracker")
                    .header(SHEET_HEADER, "sheet-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(text_body(resp).await.contains("catalog is unavailable"));
    }

    #[tokio::test]
    async fn dark_mode_is_persisted_and_rendered() {
        let store = Arc::new(MemoryCollectionStore::new());
        let (state, _dir) = mario_state(store.clone());
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(post_json("/toggle-dark-mode", r#"{"dark_mode":true}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["dark_mode"], true);

        let page = app
            .oneshot(
                Request::builder()
                    .uri("/tracker")
                    .header(SHEET_HEADER, "sheet-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(text_body(page).await.contains(r#"class="dark-mode""#));
    }

    #[tokio::test]
    async fn scrape_trigger_reports_soft_failure_with_ok_status() {
        let (state, _dir) = mario_state(Arc::new(MemoryCollectionStore::new()));
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/scrape-nintendo?force=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["new"], 0);

        let health = app
            .oneshot(Request::builder().uri("/api/scrape-nintendo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        let body = json_body(health).await;
        assert_eq!(body["status"], "ok");
        assert!(body["last_run"].is_null());
    }

    #[tokio::test]
    async fn throttled_toggle_is_429_with_retry_after() {
        let (state, _dir) = state_with(
            Arc::new(StaticCatalog::new(vec![record("A1", "Mario")])),
            Arc::new(ThrottledStore),
        );
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(post_json("/toggle", r#"{"amiibo_id":"A1","action":"collect"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "11");
        let body = json_body(resp).await;
        assert_eq!(body["status"], "rate_limited");
        assert_eq!(body["retry_after"], 11);
        assert!(body["message"].as_str().unwrap().to_lowercase().contains("rate limit"));

        let dark = app
            .oneshot(post_json("/toggle-dark-mode", r#"{"dark_mode":true}"#))
            .await
            .unwrap();
        assert_eq!(dark.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(dark).await["retry_after"], 30);
    }

    #[tokio::test]
    async fn announced_placeholder_toggle_is_a_conflict() {
        let mut pending = record("ff0a1b2cSuper Mario Bros.ff3d4e5f", "Mario - Gold Edition");
        pending.is_upcoming = true;
        pending.needs_backfill = true;
        let store = Arc::new(MemoryCollectionStore::new());
        let (state, _dir) = state_with(
            Arc::new(StaticCatalog::new(vec![record("A1", "Mario"), pending])),
            store.clone(),
        );
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/toggle",
                r#"{"amiibo_id":"ff0a1b2cSuper Mario Bros.ff3d4e5f","action":"collect"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["status"], "error");
        assert!(store.rows(&UserContext::new("sheet-1")).await.is_empty());

        let page = app
            .oneshot(
                Request::builder()
                    .uri("/tracker")
                    .header(SHEET_HEADER, "sheet-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(text_body(page).await.contains("Announced"));
    }

    #[tokio::test]
    async fn force_scrape_needs_the_scrape_token() {
        let (state, dir) = mario_state(Arc::new(MemoryCollectionStore::new()));
        SnapshotStore::new(dir.path().join("amiibo_database.json"))
            .save_atomic(&[snapshot_entry("00000000", "Mario", "Super Mario")])
            .await
            .unwrap();
        let app = app(state.with_scrape_token(Some("cron-secret".into())));
        let force = |token: Option<&str>| {
            let mut req = Request::builder().method("POST").uri("/api/scrape-nintendo?force=1");
            if let Some(token) = token {
                req = req.header(SCRAPE_TOKEN_HEADER, token);
            }
            req.body(Body::empty()).unwrap()
        };

        let anonymous = json_body(app.clone().oneshot(force(None)).await.unwrap()).await;
        assert_eq!(anonymous["status"], "skipped");
        assert_eq!(anonymous["reason"], "cache_valid");

        let wrong = json_body(app.clone().oneshot(force(Some("guess"))).await.unwrap()).await;
        assert_eq!(wrong["status"], "skipped");

        // the job runs and reports the unreachable line-up page
        let scheduler = json_body(app.oneshot(force(Some("cron-secret"))).await.unwrap()).await;
        assert_eq!(scheduler["status"], "error");
    }

    #[tokio::test]
    async fn amiibo_database_filters_snapshot_entries() {
        let (state, dir) = mario_state(Arc::new(MemoryCollectionStore::new()));
        SnapshotStore::new(dir.path().join("amiibo_database.json"))
            .save_atomic(&[
                snapshot_entry("00000000", "Mario", "Super Mario"),
                snapshot_entry("01000000", "Link", "The Legend of Zelda"),
            ])
            .await
            .unwrap();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(get("/api/amiibo/?name=mar&gameseries=super"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        let amiibo = body["amiibo"].as_array().unwrap();
        assert_eq!(amiibo.len(), 1);
        assert_eq!(amiibo[0]["name"], "Mario");
        assert_eq!(amiibo[0]["gameSeries"], "Super Mario");

        let all = json_body(app.oneshot(get("/api/amiibo")).await.unwrap()).await;
        assert_eq!(all["amiibo"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn amiibo_database_without_any_source_is_unavailable() {
        let (state, _dir) = mario_state(Arc::new(MemoryCollectionStore::new()));
        let resp = app(state).oneshot(get("/api/amiibo/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["status"], "error");
    }

    #[tokio::test]
    async fn index_and_healthz_respond() {
        let (state, _dir) = mario_state(Arc::new(MemoryCollectionStore::new()));
        let app = app(state);
        let index = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(index.status(), StatusCode::OK);
        assert!(text_body(index).await.contains("Amiibo Tracker"));

        let health = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(health).await["status"], "ok");
    }
}
