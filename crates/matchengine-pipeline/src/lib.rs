//! Ingestion pipeline: stage runners, notification and webhook fan-out, and the orchestrator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use matchengine_adapters::{
    AdapterError, Classifier, Extractor, MailRelayChannel, MailRelayConfig, NotificationChannel,
    OpenAiClassifier, OpenAiClient, OpenAiConfig, OpenAiExtractor, SearchProvider, TavilyConfig,
    TavilySearchProvider, TelegramChannel,
};
use matchengine_core::{JobStatus, OpportunityStats, TenantScope};
use matchengine_storage::{
    BackoffPolicy, HttpClient, HttpClientConfig, JobStore, NotificationSettingsStore,
    OpportunityStore, SearchConfigRegistry, StoreError, WebhookRegistry,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

mod notify;
mod orchestrator;
mod stages;
mod webhooks;

pub use notify::{render_chat_digest, render_email_digest, Notifier, NotifyReport};
pub use orchestrator::{
    ConfigRunReport, Orchestrator, OrchestratorSettings, TickPhase, TickReport,
};
pub use stages::{
    ClassifyReport, ExtractReport, SearchReport, Stage, StageReport, StageRunner,
};
pub use webhooks::{
    build_envelope, build_headers, sign_payload, DispatchReport, WebhookDispatcher, WebhookError,
    DEFAULT_WEBHOOK_TIMEOUT, WEBHOOK_USER_AGENT,
};

pub const CRATE_NAME: &str = "matchengine-pipeline";

/// Failures that escalate past a stage boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("search provider failed for query '{query}': {source}")]
    Search {
        query: String,
        #[source]
        source: AdapterError,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub search_file: PathBuf,
    pub tavily: TavilyConfig,
    pub openai: OpenAiConfig,
    pub telegram_bot_token: Option<String>,
    pub mail: MailRelayConfig,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub tick_secs: u64,
    pub classify_batch: usize,
    pub extract_batch: usize,
    pub config_batch: usize,
    pub web_port: u16,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let tavily_defaults = TavilyConfig::default();
        let openai_defaults = OpenAiConfig::default();
        Self {
            database_url: env_opt("DATABASE_URL"),
            search_file: std::env::var("MATCHENGINE_SEARCH_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("search.yaml")),
            tavily: TavilyConfig {
                api_key: env_opt("TAVILY_API_KEY"),
                base_url: std::env::var("TAVILY_BASE_URL")
                    .unwrap_or(tavily_defaults.base_url),
            },
            openai: OpenAiConfig {
                api_key: env_opt("OPENAI_API_KEY"),
                base_url: std::env::var("OPENAI_BASE_URL")
                    .unwrap_or(openai_defaults.base_url),
                model: std::env::var("OPENAI_MODEL").unwrap_or(openai_defaults.model),
            },
            telegram_bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            mail: MailRelayConfig {
                api_url: env_opt("MAIL_API_URL"),
                api_key: env_opt("MAIL_API_KEY"),
                from: std::env::var("MAIL_FROM")
                    .unwrap_or_else(|_| "MatchEngine <no-reply@matchengine.local>".to_string()),
            },
            http_timeout_secs: env_parse("MATCHENGINE_HTTP_TIMEOUT_SECS", 30),
            user_agent: std::env::var("MATCHENGINE_USER_AGENT")
                .unwrap_or_else(|_| "matchengine/0.1".to_string()),
            tick_secs: env_parse("MATCHENGINE_TICK_SECS", 300),
            classify_batch: env_parse("MATCHENGINE_CLASSIFY_BATCH", 20),
            extract_batch: env_parse("MATCHENGINE_EXTRACT_BATCH", 10),
            config_batch: env_parse("MATCHENGINE_CONFIG_BATCH", 10),
            web_port: env_parse("MATCHENGINE_WEB_PORT", 8000),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            classify_batch: self.classify_batch,
            extract_batch: self.extract_batch,
            config_batch: self.config_batch,
            tick_interval: Duration::from_secs(self.tick_secs.max(1)),
        }
    }
}

/// Query file for the global, non-tenant pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFile {
    pub queries: Vec<String>,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

fn default_max_results() -> u32 {
    10
}

impl SearchFile {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing search file")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }
}

/// Store handles injected into runners and the orchestrator.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub opportunities: Arc<dyn OpportunityStore>,
    pub configs: Arc<dyn SearchConfigRegistry>,
    pub webhooks: Arc<dyn WebhookRegistry>,
    pub notifications: Arc<dyn NotificationSettingsStore>,
}

impl Stores {
    /// Back every store trait with one implementation.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: JobStore
            + OpportunityStore
            + SearchConfigRegistry
            + WebhookRegistry
            + NotificationSettingsStore
            + 'static,
    {
        Self {
            jobs: store.clone(),
            opportunities: store.clone(),
            configs: store.clone(),
            webhooks: store.clone(),
            notifications: store,
        }
    }
}

/// External collaborators, constructed once at process start.
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchProvider>,
    pub classifier: Arc<dyn Classifier>,
    pub extractor: Arc<dyn Extractor>,
    pub email: Arc<dyn NotificationChannel>,
    pub chat: Arc<dyn NotificationChannel>,
}

impl Collaborators {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let http = Arc::new(
            HttpClient::new(http_config(config, BackoffPolicy::default()))
                .context("building collaborator http client")?,
        );
        // Channel sends are not idempotent; a retry after a lost answer
        // would deliver the digest twice.
        let notify_http = Arc::new(
            HttpClient::new(notification_http_config(config))
                .context("building notification http client")?,
        );
        let openai = Arc::new(OpenAiClient::new(http.clone(), config.openai.clone()));

        Ok(Self {
            search: Arc::new(TavilySearchProvider::new(http.clone(), config.tavily.clone())),
            classifier: Arc::new(OpenAiClassifier::new(openai.clone())),
            extractor: Arc::new(OpenAiExtractor::new(openai)),
            email: Arc::new(MailRelayChannel::new(notify_http.clone(), config.mail.clone())),
            chat: Arc::new(TelegramChannel::new(
                notify_http,
                config.telegram_bot_token.clone(),
            )),
        })
    }
}

fn http_config(config: &PipelineConfig, backoff: BackoffPolicy) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        backoff,
        ..Default::default()
    }
}

fn notification_http_config(config: &PipelineConfig) -> HttpClientConfig {
    http_config(config, BackoffPolicy::none())
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub postings_by_status: BTreeMap<JobStatus, u64>,
    pub opportunities: OpportunityStats,
}

pub async fn collect_stats(stores: &Stores) -> Result<PipelineStats, PipelineError> {
    Ok(PipelineStats {
        postings_by_status: stores.jobs.count_by_status().await?,
        opportunities: stores.opportunities.stats().await?,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct StandaloneReport {
    pub search: SearchReport,
    pub classify: ClassifyReport,
    pub extract: ExtractReport,
    pub stats: PipelineStats,
}

/// Global search, classify and extract in sequence, then statistics.
pub async fn run_standalone(
    runner: &StageRunner,
    stores: &Stores,
    search: &SearchFile,
    config: &PipelineConfig,
) -> Result<StandaloneReport, PipelineError> {
    let scope = TenantScope::global();

    let search = runner
        .run_search(&search.queries, search.max_results, &scope)
        .await?;
    let classify = runner.run_classify(config.classify_batch, &scope).await?;
    let extract = runner.run_extract(config.extract_batch, &scope).await?;
    let stats = collect_stats(stores).await?;

    info!(
        inserted = search.inserted,
        relevant = classify.relevant,
        extracted = extract.extracted,
        "standalone pipeline finished"
    );

    Ok(StandaloneReport {
        search,
        classify,
        extract,
        stats,
    })
}
