use std::sync::Arc;

use async_trait::async_trait;
use matchengine_storage::HttpClient;
use serde_json::json;
use tracing::{info, warn};

use crate::{ChannelKind, NotificationChannel, RenderedMessage};

/// Chat delivery through the Telegram Bot API.
pub struct TelegramChannel {
    http: Arc<HttpClient>,
    bot_token: Option<String>,
    base_url: String,
}

impl TelegramChannel {
    pub fn new(http: Arc<HttpClient>, bot_token: Option<String>) -> Self {
        Self {
            http,
            bot_token,
            base_url: "https://api.telegram.org".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Chat
    }

    async fn send(&self, destination: &str, message: &RenderedMessage) -> bool {
        let Some(token) = self.bot_token.as_deref() else {
            warn!("telegram bot token not configured, skipping chat notification");
            return false;
        };
        let url = format!(
            "{}/bot{}/sendMessage",
            self.base_url.trim_end_matches('/'),
            token
        );
        let body = json!({
            "chat_id": destination,
            "text": message.body,
            "parse_mode": "HTML",
        });

        match self.http.post_json("telegram", &url, None, &body).await {
            Ok(answer) if answer.get("ok").and_then(|v| v.as_bool()) == Some(true) => {
                info!(chat_id = destination, "chat notification sent");
                true
            }
            Ok(answer) => {
                warn!(chat_id = destination, %answer, "telegram rejected the message");
                false
            }
            Err(err) => {
                warn!(chat_id = destination, error = %err, "chat notification failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MailRelayConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub from: String,
}

/// Email delivery through a JSON mail-relay API.
pub struct MailRelayChannel {
    http: Arc<HttpClient>,
    config: MailRelayConfig,
}

impl MailRelayChannel {
    pub fn new(http: Arc<HttpClient>, config: MailRelayConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl NotificationChannel for MailRelayChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, destination: &str, message: &RenderedMessage) -> bool {
        let Some(url) = self.config.api_url.as_deref() else {
            warn!("mail relay not configured, skipping email notification");
            return false;
        };
        let body = json!({
            "from": self.config.from,
            "to": destination,
            "subject": message.subject,
            "html": message.body,
        });

        match self
            .http
            .post_json("mail", url, self.config.api_key.as_deref(), &body)
            .await
        {
            Ok(_) => {
                info!(to = destination, "email notification sent");
                true
            }
            Err(err) => {
                warn!(to = destination, error = %err, "email notification failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use matchengine_storage::{BackoffPolicy, HttpClientConfig};
    use serde_json::Value as JsonValue;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    fn http() -> Arc<HttpClient> {
        Arc::new(HttpClient::new(HttpClientConfig::default()).unwrap())
    }

    fn single_shot_http() -> Arc<HttpClient> {
        Arc::new(
            HttpClient::new(HttpClientConfig {
                backoff: BackoffPolicy::none(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    type Received = Arc<Mutex<Vec<JsonValue>>>;

    /// Local Bot API stand-in answering every sendMessage with `status`.
    async fn bot_api(status: StatusCode) -> (String, Received) {
        let received: Received = Arc::default();
        let app = Router::new()
            .route(
                "/botTEST/sendMessage",
                post(
                    move |State(received): State<Received>, Json(body): Json<JsonValue>| async move {
                        received.lock().await.push(body);
                        (status, Json(json!({ "ok": status.is_success() })))
                    },
                ),
            )
            .with_state(received.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), received)
    }

    fn digest() -> RenderedMessage {
        RenderedMessage {
            subject: "Nuevas oportunidades".into(),
            body: "<b>2</b> nuevas plazas".into(),
        }
    }

    #[tokio::test]
    async fn telegram_posts_message_to_bot_api() {
        let (base_url, received) = bot_api(StatusCode::OK).await;
        let chat = TelegramChannel::new(single_shot_http(), Some("TEST".into()))
            .with_base_url(format!("{base_url}/"));

        assert!(chat.send("4242", &digest()).await);

        let received = received.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["chat_id"], "4242");
        assert_eq!(received[0]["text"], "<b>2</b> nuevas plazas");
        assert_eq!(received[0]["parse_mode"], "HTML");
    }

    #[tokio::test]
    async fn telegram_server_error_is_not_resent() {
        let (base_url, received) = bot_api(StatusCode::SERVICE_UNAVAILABLE).await;
        let chat =
            TelegramChannel::new(single_shot_http(), Some("TEST".into())).with_base_url(base_url);

        assert!(!chat.send("4242", &digest()).await);
        assert_eq!(received.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_channels_report_failure_without_raising() {
        let message = RenderedMessage {
            subject: "s".into(),
            body: "b".into(),
        };
        let chat = TelegramChannel::new(http(), None);
        let mail = MailRelayChannel::new(http(), MailRelayConfig::default());

        assert_eq!(chat.kind(), ChannelKind::Chat);
        assert_eq!(mail.kind(), ChannelKind::Email);
        assert!(!chat.send("123", &message).await);
        assert!(!mail.send("a@example.org", &message).await);
    }
}
