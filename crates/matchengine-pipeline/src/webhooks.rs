//! Signed, concurrent webhook delivery with per-delivery logging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use hmac::{Hmac, Mac};
use matchengine_core::{DeliveryOutcome, NewDeliveryLog, TenantId, WebhookSubscription};
use matchengine_storage::{StoreError, WebhookRegistry};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_USER_AGENT: &str = "MatchEngine-Webhook/1.0";
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_HEADER: &str = "x-webhook-event";
const SIGNATURE_HEADER: &str = "x-webhook-signature";
const MAX_LOGGED_BODY_CHARS: usize = 1000;

/// Per-delivery failures. Logged by the dispatcher, never returned to callers.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("subscription lookup failed: {0}")]
    Lookup(#[source] StoreError),
    #[error("recording delivery for webhook {webhook_id} failed: {source}")]
    Bookkeeping {
        webhook_id: i64,
        #[source]
        source: StoreError,
    },
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Hex HMAC-SHA256 of `body` keyed by `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn build_envelope(
    event: &str,
    tenant_id: TenantId,
    data: &JsonValue,
    at: DateTime<Utc>,
) -> JsonValue {
    json!({
        "event": event,
        "timestamp": at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "tenant_id": tenant_id,
        "data": data,
    })
}

/// Defaults, then the subscription's custom headers, then the signature.
/// Custom headers that are not valid HTTP headers are skipped.
pub fn build_headers(
    subscription: &WebhookSubscription,
    event: &str,
    signature: Option<&str>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(WEBHOOK_USER_AGENT));
    if let Ok(value) = HeaderValue::from_str(event) {
        headers.insert(HeaderName::from_static(EVENT_HEADER), value);
    }

    for (name, value) in &subscription.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(webhook_id = subscription.id, header = name.as_str(), "skipping invalid custom header"),
        }
    }

    if let Some(signature) = signature.and_then(|s| HeaderValue::from_str(s).ok()) {
        headers.insert(HeaderName::from_static(SIGNATURE_HEADER), signature);
    }
    headers
}

fn method_for(subscription: &WebhookSubscription) -> Method {
    Method::from_bytes(subscription.method.trim().to_uppercase().as_bytes()).unwrap_or_else(|_| {
        warn!(webhook_id = subscription.id, method = subscription.method.as_str(), "invalid method, using POST");
        Method::POST
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub matched: usize,
    pub succeeded: usize,
    pub http_errors: usize,
    pub transport_failures: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        if outcome.is_success() {
            self.succeeded += 1;
        } else if outcome.is_transport_failure() {
            self.transport_failures += 1;
        } else {
            self.http_errors += 1;
        }
    }
}

pub struct WebhookDispatcher {
    registry: Arc<dyn WebhookRegistry>,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(registry: Arc<dyn WebhookRegistry>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            registry,
            client: reqwest::Client::builder().build()?,
            timeout: DEFAULT_WEBHOOK_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deliver `data` to every active subscription of `tenant_id` listening
    /// for `event`, concurrently. Waits for all deliveries; never fails.
    pub async fn dispatch(&self, event: &str, tenant_id: TenantId, data: &JsonValue) -> DispatchReport {
        let span = info_span!("webhook_dispatch", event, tenant_id);
        async move {
            match self.try_dispatch(event, tenant_id, data).await {
                Ok(report) => report,
                Err(err) => {
                    error!(error = %err, "webhook dispatch aborted");
                    DispatchReport::default()
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_dispatch(
        &self,
        event: &str,
        tenant_id: TenantId,
        data: &JsonValue,
    ) -> Result<DispatchReport, WebhookError> {
        let subscriptions: Vec<WebhookSubscription> = self
            .registry
            .list_active_for_event(event)
            .await
            .map_err(WebhookError::Lookup)?
            .into_iter()
            .filter(|s| s.active && s.tenant_id == tenant_id && s.subscribes_to(event))
            .collect();

        let mut report = DispatchReport {
            matched: subscriptions.len(),
            ..Default::default()
        };
        if subscriptions.is_empty() {
            return Ok(report);
        }

        let envelope = build_envelope(event, tenant_id, data, Utc::now());
        let body = serde_json::to_vec(&envelope)?;

        let deliveries = subscriptions
            .iter()
            .map(|subscription| self.deliver(subscription, event, &envelope, &body));
        for outcome in join_all(deliveries).await {
            report.record(&outcome);
        }

        info!(
            matched = report.matched,
            succeeded = report.succeeded,
            http_errors = report.http_errors,
            transport_failures = report.transport_failures,
            "webhook dispatch finished"
        );
        Ok(report)
    }

    async fn deliver(
        &self,
        subscription: &WebhookSubscription,
        event: &str,
        envelope: &JsonValue,
        body: &[u8],
    ) -> DeliveryOutcome {
        let span = info_span!("webhook_delivery", webhook_id = subscription.id, event);
        async move {
            let signature = subscription
                .secret
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|secret| sign_payload(secret, body));
            let headers = build_headers(subscription, event, signature.as_deref());

            let started = Instant::now();
            let sent = self
                .client
                .request(method_for(subscription), &subscription.url)
                .headers(headers)
                .body(body.to_vec())
                .timeout(self.timeout)
                .send()
                .await;

            let (outcome, response_body) = match sent {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.ok().map(|t| truncate(&t));
                    (DeliveryOutcome::Response { status }, text)
                }
                Err(err) => {
                    let message = if err.is_timeout() {
                        format!("timed out after {}ms", self.timeout.as_millis())
                    } else {
                        err.to_string()
                    };
                    (DeliveryOutcome::TransportFailure { error: message }, None)
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            if outcome.is_success() {
                info!(status = outcome.recorded_status(), duration_ms, "webhook delivered");
            } else {
                warn!(
                    status = outcome.recorded_status(),
                    error = %outcome.error_text().unwrap_or_default(),
                    duration_ms,
                    "webhook delivery failed"
                );
            }

            if let Err(err) = self
                .record(subscription, event, envelope, &outcome, response_body, duration_ms)
                .await
            {
                error!(error = %err, "webhook bookkeeping failed");
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn record(
        &self,
        subscription: &WebhookSubscription,
        event: &str,
        envelope: &JsonValue,
        outcome: &DeliveryOutcome,
        response_body: Option<String>,
        duration_ms: u64,
    ) -> Result<(), WebhookError> {
        let bookkeeping = |source| WebhookError::Bookkeeping {
            webhook_id: subscription.id,
            source,
        };
        let response_status = match outcome {
            DeliveryOutcome::Response { status } => Some(*status),
            DeliveryOutcome::TransportFailure { .. } => None,
        };

        self.registry
            .append_delivery_log(NewDeliveryLog {
                webhook_id: subscription.id,
                event: event.to_string(),
                payload: envelope.clone(),
                response_status,
                response_body,
                error_message: outcome.error_text(),
                duration_ms,
            })
            .await
            .map_err(bookkeeping)?;
        self.registry
            .record_delivery_outcome(subscription.id, outcome, Utc::now())
            .await
            .map_err(bookkeeping)?;
        Ok(())
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_LOGGED_BODY_CHARS) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
