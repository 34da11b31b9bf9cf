//! Thin axum JSON surface over the stores and stage runners.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::NaiveDate;
use matchengine_core::{
    events, AccessType, NewWebhook, NotificationSettings, OpportunityFilter, OpportunityOrder,
    SearchConfigId, TenantId, WebhookId, WebhookSubscription,
};
use matchengine_pipeline::{collect_stats, PipelineConfig, Stage, StageRunner, Stores};
use matchengine_storage::{
    NotificationSettingsStore, OpportunityStore, SearchConfigRegistry, StoreError, WebhookRegistry,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "matchengine-web";

const DEFAULT_LOG_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub runner: StageRunner,
    pub config: PipelineConfig,
}

impl AppState {
    pub fn new(stores: Stores, runner: StageRunner, config: PipelineConfig) -> Self {
        Self {
            stores,
            runner,
            config,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/workers/run/{stage}", post(run_worker_handler))
        .route("/api/users/{user_id}/opportunities", get(opportunities_handler))
        .route(
            "/api/users/{user_id}/notifications",
            get(get_notifications_handler).put(put_notifications_handler),
        )
        .route(
            "/api/users/{user_id}/webhooks",
            get(list_webhooks_handler).post(create_webhook_handler),
        )
        .route("/api/search-configs/{id}/active", put(set_config_active_handler))
        .route("/api/webhooks/events", get(webhook_events_handler))
        .route("/api/webhooks/{id}", delete(delete_webhook_handler))
        .route("/api/webhooks/{id}/logs", get(webhook_logs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match collect_stats(&state.stores).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err),
    }
}

async fn run_worker_handler(
    State(state): State<Arc<AppState>>,
    Path(stage): Path<String>,
) -> Response {
    let stage: Stage = match stage.parse() {
        Ok(stage) => stage,
        Err(message) => return bad_request(message),
    };
    info!(%stage, "manual worker run requested");
    match state.runner.run_global(stage, None, &state.config).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct OpportunitiesQuery {
    autonomous_region: Option<String>,
    disability_quota: Option<bool>,
    access_type: Option<String>,
    organism: Option<String>,
    search: Option<String>,
    deadline_from: Option<NaiveDate>,
    deadline_to: Option<NaiveDate>,
    min_score: Option<u8>,
    order_by: Option<OpportunityOrder>,
    order: Option<String>,
    limit: Option<usize>,
}

impl OpportunitiesQuery {
    fn into_filter(self) -> Result<OpportunityFilter, String> {
        let access_type = match self.access_type.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<AccessType>()?),
        };
        let ascending = match self.order.as_deref() {
            None => false,
            Some(o) if o.eq_ignore_ascii_case("asc") => true,
            Some(o) if o.eq_ignore_ascii_case("desc") => false,
            Some(other) => return Err(format!("unknown order '{other}'")),
        };
        let defaults = OpportunityFilter::default();
        Ok(OpportunityFilter {
            autonomous_region: self.autonomous_region.filter(|s| !s.is_empty()),
            disability_quota: self.disability_quota,
            access_type,
            organism: self.organism.filter(|s| !s.is_empty()),
            search: self.search.filter(|s| !s.is_empty()),
            deadline_from: self.deadline_from,
            deadline_to: self.deadline_to,
            min_score: self.min_score,
            order_by: self.order_by.unwrap_or(defaults.order_by),
            ascending,
            limit: self.limit.unwrap_or(defaults.limit).clamp(1, 500),
        })
    }
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<TenantId>,
    Query(query): Query<OpportunitiesQuery>,
) -> Response {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(message) => return bad_request(message),
    };
    match state.stores.opportunities.list(Some(user_id), &filter).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn get_notifications_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<TenantId>,
) -> Response {
    match state.stores.notifications.get(user_id).await {
        Ok(settings) => {
            Json(settings.unwrap_or_else(|| NotificationSettings::defaults_for(user_id)))
                .into_response()
        }
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct NotificationSettingsPatch {
    email_enabled: Option<bool>,
    email_address: Option<String>,
    #[serde(alias = "telegram_enabled")]
    chat_enabled: Option<bool>,
    #[serde(alias = "telegram_chat_id")]
    chat_id: Option<String>,
    notify_on_new_opportunity: Option<bool>,
    notify_on_deadline_approaching: Option<bool>,
    deadline_days_before: Option<u32>,
}

impl NotificationSettingsPatch {
    fn apply(self, settings: &mut NotificationSettings) {
        if let Some(v) = self.email_enabled {
            settings.email_enabled = v;
        }
        if let Some(v) = self.email_address {
            settings.email_address = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some(v) = self.chat_enabled {
            settings.chat_enabled = v;
        }
        if let Some(v) = self.chat_id {
            settings.chat_id = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some(v) = self.notify_on_new_opportunity {
            settings.notify_on_new_opportunity = v;
        }
        if let Some(v) = self.notify_on_deadline_approaching {
            settings.notify_on_deadline_approaching = v;
        }
        if let Some(v) = self.deadline_days_before {
            settings.deadline_days_before = v;
        }
    }
}

async fn put_notifications_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<TenantId>,
    Json(patch): Json<NotificationSettingsPatch>,
) -> Response {
    let mut settings = match state.stores.notifications.get(user_id).await {
        Ok(existing) => existing.unwrap_or_else(|| NotificationSettings::defaults_for(user_id)),
        Err(err) => return server_error(err),
    };
    patch.apply(&mut settings);
    match state.stores.notifications.upsert(&settings).await {
        Ok(()) => Json(settings).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct CreateWebhookBody {
    name: String,
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    secret: Option<String>,
    events: Vec<String>,
}

/// Subscription as exposed over the API; the secret itself is never returned.
fn webhook_view(subscription: &WebhookSubscription) -> JsonValue {
    let mut value = json!(subscription);
    if let Some(object) = value.as_object_mut() {
        object.remove("secret");
        object.insert(
            "has_secret".to_string(),
            json!(subscription.secret.is_some()),
        );
    }
    value
}

async fn create_webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<TenantId>,
    Json(body): Json<CreateWebhookBody>,
) -> Response {
    if body.name.trim().is_empty() {
        return bad_request("name is required");
    }
    if url::Url::parse(&body.url).is_err() {
        return bad_request(format!("invalid url '{}'", body.url));
    }
    if body.events.is_empty() {
        return bad_request("at least one event is required");
    }
    if let Some(unknown) = body.events.iter().find(|e| !events::is_known(e)) {
        return bad_request(format!("unknown event '{unknown}'"));
    }

    let webhook = NewWebhook {
        tenant_id: user_id,
        name: body.name,
        url: body.url,
        method: body
            .method
            .map(|m| m.to_uppercase())
            .unwrap_or_else(|| "POST".to_string()),
        headers: body.headers,
        secret: body.secret.filter(|s| !s.is_empty()),
        events: body.events,
        active: true,
    };
    match state.stores.webhooks.create(webhook).await {
        Ok(created) => (StatusCode::CREATED, Json(webhook_view(&created))).into_response(),
        Err(err) => server_error(err),
    }
}

async fn list_webhooks_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<TenantId>,
) -> Response {
    match state.stores.webhooks.list_for_tenant(user_id).await {
        Ok(rows) => Json(rows.iter().map(webhook_view).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err),
    }
}

async fn delete_webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<WebhookId>,
) -> Response {
    match state.stores.webhooks.delete(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found(format!("webhook {id} not found")),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn webhook_logs_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<WebhookId>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, 500);
    match state.stores.webhooks.list_delivery_logs(id, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ActiveBody {
    active: bool,
}

async fn set_config_active_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SearchConfigId>,
    Json(body): Json<ActiveBody>,
) -> Response {
    match state.stores.configs.set_active(id, body.active).await {
        Ok(()) => {}
        Err(StoreError::NotFound { .. }) => {
            return not_found(format!("search configuration {id} not found"));
        }
        Err(err) => return server_error(err),
    }
    info!(config_id = id, active = body.active, "search configuration toggled");
    match state.stores.configs.get(id).await {
        Ok(Some(config)) => Json(config).into_response(),
        Ok(None) => not_found(format!("search configuration {id} not found")),
        Err(err) => server_error(err),
    }
}

async fn webhook_events_handler() -> Response {
    Json(json!({ "events": events::ALL })).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

fn not_found(message: impl Into<String>) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message.into() }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use matchengine_adapters::scripted::{
        RecordingChannel, ScriptedClassifier, ScriptedExtractor, ScriptedSearchProvider,
    };
    use matchengine_adapters::ChannelKind;
    use matchengine_core::{JobStatus, NewSearchConfiguration, SearchHit, TenantScope};
    use matchengine_pipeline::Collaborators;
    use chrono::Utc;
    use matchengine_storage::{Deduplicator, JobStore, MemoryStore};
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores::shared(store.clone());
        let collaborators = Collaborators {
            search: Arc::new(ScriptedSearchProvider::new()),
            classifier: Arc::new(ScriptedClassifier::new("SI")),
            extractor: Arc::new(ScriptedExtractor::new()),
            email: Arc::new(RecordingChannel::new(ChannelKind::Email)),
            chat: Arc::new(RecordingChannel::new(ChannelKind::Chat)),
        };
        let runner = StageRunner::new(&stores, &collaborators);
        let config = PipelineConfig::from_env();
        (app(AppState::new(stores, runner, config)), store)
    }

    async fn body_json(resp: Response) -> JsonValue {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_health_and_events() {
        let (app, _) = test_app();
        let resp = app.clone().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(get_request("/api/webhooks/events")).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["events"].as_array().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn manual_classify_run_reports_counts() {
        let (app, store) = test_app();
        store
            .insert_if_absent(Deduplicator::new_posting(
                &SearchHit {
                    url: "https://example.gov/a".into(),
                    title: "Plazas".into(),
                    snippet: "Convocatoria".into(),
                    source: None,
                },
                "tavily",
                &TenantScope::global(),
            ))
            .await
            .unwrap();

        let resp = app
            .clone()
            .oneshot(json_request("POST", "/api/workers/run/classify", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["stage"], "classify");
        assert_eq!(body["relevant"], 1);
        assert_eq!(store.postings().await[0].status, JobStatus::Classified);

        let resp = app
            .oneshot(json_request("POST", "/api/workers/run/agent", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn notification_settings_default_then_upsert() {
        let (app, _) = test_app();
        let body = body_json(
            app.clone()
                .oneshot(get_request("/api/users/5/notifications"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body["notify_on_new_opportunity"], true);
        assert_eq!(body["deadline_days_before"], 7);

        let resp = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/users/5/notifications",
                json!({ "telegram_enabled": true, "telegram_chat_id": "99" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(app.oneshot(get_request("/api/users/5/notifications")).await.unwrap()).await;
        assert_eq!(body["chat_enabled"], true);
        assert_eq!(body["chat_id"], "99");
        assert_eq!(body["email_enabled"], false);
    }

    #[tokio::test]
    async fn webhook_lifecycle_hides_secret() {
        let (app, _) = test_app();
        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/users/3/webhooks",
                json!({
                    "name": "crm",
                    "url": "https://hooks.example.org/in",
                    "secret": "s3cret",
                    "events": ["opportunity.created"]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["method"], "POST");
        assert_eq!(created["has_secret"], true);
        assert!(created.get("secret").is_none());
        let id = created["id"].as_i64().unwrap();

        let listed = body_json(
            app.clone()
                .oneshot(get_request("/api/users/3/webhooks"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let logs = app
            .clone()
            .oneshot(get_request(&format!("/api/webhooks/{id}/logs")))
            .await
            .unwrap();
        assert_eq!(body_json(logs).await, json!([]));

        let deleted = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/webhooks/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let again = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/webhooks/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn paused_search_config_leaves_the_eligible_set() {
        let (app, store) = test_app();
        let config = SearchConfigRegistry::create(
            store.as_ref(),
            NewSearchConfiguration {
                tenant_id: 3,
                name: "sanidad".into(),
                queries: vec!["oposiciones enfermeria".into()],
                filters: Default::default(),
                max_results: 5,
                run_interval_minutes: 60,
            },
        )
        .await
        .unwrap();

        let uri = format!("/api/search-configs/{}/active", config.id);
        let resp = app
            .clone()
            .oneshot(json_request("PUT", &uri, json!({ "active": false })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["active"], json!(false));
        assert!(store.list_eligible(Utc::now(), 10).await.unwrap().is_empty());

        let resp = app
            .clone()
            .oneshot(json_request("PUT", &uri, json!({ "active": true })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.list_eligible(Utc::now(), 10).await.unwrap().len(), 1);

        let resp = app
            .oneshot(json_request(
                "PUT",
                "/api/search-configs/9999/active",
                json!({ "active": false }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_webhook_event_is_rejected() {
        let (app, _) = test_app();
        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/users/3/webhooks",
                json!({ "name": "x", "url": "https://hooks.example.org", "events": ["job.deleted"] }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn opportunities_are_filtered_per_user() {
        let (app, store) = test_app();
        for (n, tenant) in [(1, 3), (2, 3), (3, 4)] {
            let scope = TenantScope {
                tenant_id: Some(tenant),
                search_config_id: None,
            };
            store
                .insert_if_absent(Deduplicator::new_posting(
                    &SearchHit {
                        url: format!("https://example.gov/{n}"),
                        title: String::new(),
                        snippet: String::new(),
                        source: None,
                    },
                    "tavily",
                    &scope,
                ))
                .await
                .unwrap();
        }
        for posting in store.postings().await {
            let fields = matchengine_core::ExtractedFields {
                title: Some(format!("Plaza {}", posting.id)),
                disability_quota: posting.id % 2 == 1,
                autonomous_region: Some("Madrid".into()),
                ..Default::default()
            };
            store.upsert_for_posting(posting.id, &fields).await.unwrap();
        }

        let all = body_json(
            app.clone()
                .oneshot(get_request("/api/users/3/opportunities"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let quota = body_json(
            app.clone()
                .oneshot(get_request(
                    "/api/users/3/opportunities?disability_quota=true&order_by=title&order=asc",
                ))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(quota.as_array().unwrap().len(), 1);
        assert_eq!(quota[0]["disability_quota"], true);

        let bad = app
            .oneshot(get_request("/api/users/3/opportunities?access_type=lottery"))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_endpoint_reports_totals() {
        let (app, _) = test_app();
        let body = body_json(app.oneshot(get_request("/api/stats")).await.unwrap()).await;
        assert_eq!(body["opportunities"]["total"], 0);
    }
}
