//! Durable stores, URL deduplication and the shared HTTP client for MatchEngine.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchengine_core::{
    DeliveryOutcome, ExtractedFields, JobStatus, NewDeliveryLog, NewPosting,
    NewSearchConfiguration, NewWebhook, NotificationSettings, Opportunity, OpportunityFilter,
    OpportunityStats, Posting, PostingId, SearchConfigId, SearchConfiguration, SearchHit,
    TenantId, TenantScope, UpsertedOpportunity, WebhookDeliveryLog, WebhookId,
    WebhookSubscription,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClient,
    HttpClientConfig, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "matchengine-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
}

/// Canonical form and content hash of a posting URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUrl {
    pub url: String,
    pub hash: String,
}

pub struct Deduplicator;

impl Deduplicator {
    /// Strip the query string. Input that does not parse as a URL is kept verbatim.
    pub fn canonical_url(raw: &str) -> String {
        match url::Url::parse(raw) {
            Ok(mut parsed) => {
                parsed.set_query(None);
                parsed.to_string()
            }
            Err(_) => raw.to_string(),
        }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn canonicalize(raw: &str) -> CanonicalUrl {
        let url = Self::canonical_url(raw);
        let hash = Self::sha256_hex(url.as_bytes());
        CanonicalUrl { url, hash }
    }

    pub fn new_posting(
        hit: &SearchHit,
        default_source: &str,
        scope: &TenantScope,
    ) -> NewPosting {
        let CanonicalUrl { url, hash } = Self::canonicalize(&hit.url);
        NewPosting {
            url,
            url_hash: hash,
            title: hit.title.clone(),
            snippet: hit.snippet.clone(),
            source: hit
                .source
                .clone()
                .unwrap_or_else(|| default_source.to_string()),
            tenant_id: scope.tenant_id,
            search_config_id: scope.search_config_id,
        }
    }
}

/// Durable record of postings keyed by URL hash.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert unless the hash exists. Returns true when a row was created.
    async fn insert_if_absent(&self, posting: NewPosting) -> Result<bool, StoreError>;

    /// Oldest-created first, restricted to `scope`.
    async fn select_by_status(
        &self,
        status: JobStatus,
        relevant: Option<bool>,
        scope: &TenantScope,
        limit: usize,
    ) -> Result<Vec<Posting>, StoreError>;

    /// Atomic compare-and-set of the status. Returns false when the posting is
    /// no longer in `expected`; rejects transitions outside the lifecycle.
    async fn update_status(
        &self,
        id: PostingId,
        expected: JobStatus,
        next: JobStatus,
        relevant: Option<bool>,
    ) -> Result<bool, StoreError>;

    /// Move `extraction_failed` postings in scope back to `classified`.
    async fn requeue_failed_extractions(&self, scope: &TenantScope) -> Result<u64, StoreError>;

    async fn get(&self, id: PostingId) -> Result<Option<Posting>, StoreError>;

    async fn count_by_status(&self) -> Result<BTreeMap<JobStatus, u64>, StoreError>;
}

#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Create the opportunity for `posting_id`, or overwrite title, organism
    /// and specialty of the existing one.
    async fn upsert_for_posting(
        &self,
        posting_id: PostingId,
        fields: &ExtractedFields,
    ) -> Result<UpsertedOpportunity, StoreError>;

    /// Move the posting `classified -> extracted` and upsert its opportunity
    /// as one atomic step. `None` when the posting already left `classified`;
    /// nothing is written in that case.
    async fn complete_extraction(
        &self,
        posting_id: PostingId,
        fields: &ExtractedFields,
    ) -> Result<Option<UpsertedOpportunity>, StoreError>;

    async fn list(
        &self,
        tenant_id: Option<TenantId>,
        filter: &OpportunityFilter,
    ) -> Result<Vec<Opportunity>, StoreError>;

    async fn stats(&self) -> Result<OpportunityStats, StoreError>;
}

#[async_trait]
pub trait SearchConfigRegistry: Send + Sync {
    async fn create(&self, config: NewSearchConfiguration)
        -> Result<SearchConfiguration, StoreError>;

    /// Active and due configurations, least recently run first.
    async fn list_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SearchConfiguration>, StoreError>;

    async fn get(&self, id: SearchConfigId) -> Result<Option<SearchConfiguration>, StoreError>;

    async fn mark_run(&self, id: SearchConfigId, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn set_active(&self, id: SearchConfigId, active: bool) -> Result<(), StoreError>;
}

#[async_trait]
pub trait WebhookRegistry: Send + Sync {
    async fn create(&self, webhook: NewWebhook) -> Result<WebhookSubscription, StoreError>;

    async fn get(&self, id: WebhookId) -> Result<Option<WebhookSubscription>, StoreError>;

    async fn list_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<WebhookSubscription>, StoreError>;

    async fn delete(&self, id: WebhookId) -> Result<bool, StoreError>;

    async fn list_active_for_event(
        &self,
        event: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError>;

    /// A response of any status resets the retry counter; a transport failure
    /// stores status 0 and increments it.
    async fn record_delivery_outcome(
        &self,
        id: WebhookId,
        outcome: &DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn append_delivery_log(&self, entry: NewDeliveryLog) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_delivery_logs(
        &self,
        webhook_id: WebhookId,
        limit: usize,
    ) -> Result<Vec<WebhookDeliveryLog>, StoreError>;
}

#[async_trait]
pub trait NotificationSettingsStore: Send + Sync {
    async fn get(&self, tenant_id: TenantId) -> Result<Option<NotificationSettings>, StoreError>;

    async fn upsert(&self, settings: &NotificationSettings) -> Result<(), StoreError>;
}

pub(crate) fn check_transition(from: JobStatus, to: JobStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}
