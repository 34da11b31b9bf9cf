//! In-process store used by tests and `--memory` runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchengine_core::{
    DeliveryOutcome, ExtractedFields, JobStatus, NewDeliveryLog, NewPosting,
    NewSearchConfiguration, NewWebhook, NotificationSettings, Opportunity, OpportunityFilter,
    OpportunityOrder, OpportunityStats, Posting, PostingId, SearchConfigId, SearchConfiguration,
    TenantId, TenantScope, UpsertedOpportunity, WebhookDeliveryLog, WebhookId,
    WebhookSubscription,
};
use tokio::sync::Mutex;

use crate::{
    check_transition, JobStore, NotificationSettingsStore, OpportunityStore,
    SearchConfigRegistry, StoreError, WebhookRegistry,
};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    postings: BTreeMap<PostingId, Posting>,
    hashes: HashMap<String, PostingId>,
    opportunities: BTreeMap<i64, Opportunity>,
    configs: BTreeMap<SearchConfigId, SearchConfiguration>,
    webhooks: BTreeMap<WebhookId, WebhookSubscription>,
    delivery_logs: Vec<WebhookDeliveryLog>,
    settings: BTreeMap<TenantId, NotificationSettings>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn upsert_opportunity(
        &mut self,
        posting_id: PostingId,
        fields: &ExtractedFields,
    ) -> Result<UpsertedOpportunity, StoreError> {
        let tenant_id = self
            .postings
            .get(&posting_id)
            .ok_or(StoreError::NotFound {
                entity: "posting",
                id: posting_id,
            })?
            .tenant_id;
        let now = Utc::now();

        if let Some(existing) = self
            .opportunities
            .values_mut()
            .find(|o| o.posting_id == posting_id)
        {
            existing.fields.title = fields.title.clone();
            existing.fields.organism = fields.organism.clone();
            existing.fields.specialty = fields.specialty.clone();
            existing.updated_at = now;
            return Ok(UpsertedOpportunity {
                id: existing.id,
                created: false,
            });
        }

        let id = self.next_id();
        self.opportunities.insert(
            id,
            Opportunity {
                id,
                posting_id,
                tenant_id,
                fields: fields.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(UpsertedOpportunity { id, created: true })
    }
}

/// Every operation holds the single state lock, so each status transition is
/// an atomic read-modify-write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every posting, in insertion order.
    pub async fn postings(&self) -> Vec<Posting> {
        self.state.lock().await.postings.values().cloned().collect()
    }

    pub async fn opportunities(&self) -> Vec<Opportunity> {
        self.state.lock().await.opportunities.values().cloned().collect()
    }

    pub async fn delivery_logs(&self) -> Vec<WebhookDeliveryLog> {
        self.state.lock().await.delivery_logs.clone()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_if_absent(&self, posting: NewPosting) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.hashes.contains_key(&posting.url_hash) {
            return Ok(false);
        }
        let id = state.next_id();
        state.hashes.insert(posting.url_hash.clone(), id);
        state.postings.insert(
            id,
            Posting {
                id,
                url: posting.url,
                url_hash: posting.url_hash,
                title: posting.title,
                snippet: posting.snippet,
                source: posting.source,
                tenant_id: posting.tenant_id,
                search_config_id: posting.search_config_id,
                status: JobStatus::Pending,
                is_relevant: None,
                created_at: Utc::now(),
                classified_at: None,
                extracted_at: None,
            },
        );
        Ok(true)
    }

    async fn select_by_status(
        &self,
        status: JobStatus,
        relevant: Option<bool>,
        scope: &TenantScope,
        limit: usize,
    ) -> Result<Vec<Posting>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .postings
            .values()
            .filter(|p| p.status == status)
            .filter(|p| relevant.map_or(true, |r| p.is_relevant == Some(r)))
            .filter(|p| scope.matches(p))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|p| (p.created_at, p.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn update_status(
        &self,
        id: PostingId,
        expected: JobStatus,
        next: JobStatus,
        relevant: Option<bool>,
    ) -> Result<bool, StoreError> {
        check_transition(expected, next)?;
        let mut state = self.state.lock().await;
        let posting = state
            .postings
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "posting", id })?;
        if posting.status != expected {
            return Ok(false);
        }
        let now = Utc::now();
        posting.status = next;
        if let Some(flag) = relevant {
            posting.is_relevant = Some(flag);
        }
        if next.stamps_classified_at() && expected == JobStatus::Pending {
            posting.classified_at = Some(now);
        }
        if next.stamps_extracted_at() {
            posting.extracted_at = Some(now);
        }
        Ok(true)
    }

    async fn requeue_failed_extractions(&self, scope: &TenantScope) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut moved = 0;
        for posting in state.postings.values_mut() {
            if posting.status == JobStatus::ExtractionFailed && scope.matches(posting) {
                posting.status = JobStatus::Classified;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn get(&self, id: PostingId) -> Result<Option<Posting>, StoreError> {
        Ok(self.state.lock().await.postings.get(&id).cloned())
    }

    async fn count_by_status(&self) -> Result<BTreeMap<JobStatus, u64>, StoreError> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for posting in state.postings.values() {
            *counts.entry(posting.status).or_default() += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn upsert_for_posting(
        &self,
        posting_id: PostingId,
        fields: &ExtractedFields,
    ) -> Result<UpsertedOpportunity, StoreError> {
        self.state.lock().await.upsert_opportunity(posting_id, fields)
    }

    async fn complete_extraction(
        &self,
        posting_id: PostingId,
        fields: &ExtractedFields,
    ) -> Result<Option<UpsertedOpportunity>, StoreError> {
        let mut state = self.state.lock().await;
        let posting = state
            .postings
            .get_mut(&posting_id)
            .ok_or(StoreError::NotFound {
                entity: "posting",
                id: posting_id,
            })?;
        if posting.status != JobStatus::Classified {
            return Ok(None);
        }
        posting.status = JobStatus::Extracted;
        posting.extracted_at = Some(Utc::now());
        state.upsert_opportunity(posting_id, fields).map(Some)
    }

    async fn list(
        &self,
        tenant_id: Option<TenantId>,
        filter: &OpportunityFilter,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .opportunities
            .values()
            .filter(|o| tenant_id.map_or(true, |t| o.tenant_id == Some(t)))
            .filter(|o| filter.matches(o))
            .cloned()
            .collect::<Vec<_>>();

        rows.sort_by(|a, b| {
            let ordering = match filter.order_by {
                OpportunityOrder::CreatedAt => a.created_at.cmp(&b.created_at),
                OpportunityOrder::ApplicationDeadline => a
                    .fields
                    .application_deadline
                    .cmp(&b.fields.application_deadline),
                OpportunityOrder::AiScore => a.fields.ai_score.cmp(&b.fields.ai_score),
                OpportunityOrder::Title => a.fields.title.cmp(&b.fields.title),
            }
            .then(a.id.cmp(&b.id));
            if filter.ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
        rows.truncate(filter.limit);
        Ok(rows)
    }

    async fn stats(&self) -> Result<OpportunityStats, StoreError> {
        let state = self.state.lock().await;
        let regions = state
            .opportunities
            .values()
            .filter_map(|o| o.fields.autonomous_region.as_deref())
            .collect::<BTreeSet<_>>();
        Ok(OpportunityStats {
            total: state.opportunities.len() as u64,
            with_disability_quota: state
                .opportunities
                .values()
                .filter(|o| o.fields.disability_quota)
                .count() as u64,
            regions: regions.len() as u64,
        })
    }
}

#[async_trait]
impl SearchConfigRegistry for MemoryStore {
    async fn create(
        &self,
        config: NewSearchConfiguration,
    ) -> Result<SearchConfiguration, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let created = SearchConfiguration {
            id,
            tenant_id: config.tenant_id,
            name: config.name,
            queries: config.queries,
            filters: config.filters,
            max_results: config.max_results,
            run_interval_minutes: config.run_interval_minutes,
            active: true,
            last_run_at: None,
            created_at: Utc::now(),
        };
        state.configs.insert(id, created.clone());
        Ok(created)
    }

    async fn list_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SearchConfiguration>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .configs
            .values()
            .filter(|c| c.is_due(now))
            .cloned()
            .collect::<Vec<_>>();
        // `None` sorts before `Some`, so never-run configurations come first.
        rows.sort_by_key(|c| (c.last_run_at, c.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn get(&self, id: SearchConfigId) -> Result<Option<SearchConfiguration>, StoreError> {
        Ok(self.state.lock().await.configs.get(&id).cloned())
    }

    async fn mark_run(&self, id: SearchConfigId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let config = state.configs.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "search configuration",
            id,
        })?;
        config.last_run_at = Some(at);
        Ok(())
    }

    async fn set_active(&self, id: SearchConfigId, active: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let config = state.configs.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "search configuration",
            id,
        })?;
        config.active = active;
        Ok(())
    }
}

#[async_trait]
impl WebhookRegistry for MemoryStore {
    async fn create(&self, webhook: NewWebhook) -> Result<WebhookSubscription, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let created = WebhookSubscription {
            id,
            tenant_id: webhook.tenant_id,
            name: webhook.name,
            url: webhook.url,
            method: webhook.method,
            headers: webhook.headers,
            secret: webhook.secret,
            events: webhook.events,
            active: webhook.active,
            last_triggered_at: None,
            last_status: None,
            last_error: None,
            retry_count: 0,
        };
        state.webhooks.insert(id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: WebhookId) -> Result<Option<WebhookSubscription>, StoreError> {
        Ok(self.state.lock().await.webhooks.get(&id).cloned())
    }

    async fn list_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .webhooks
            .values()
            .filter(|w| w.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: WebhookId) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.webhooks.remove(&id).is_some())
    }

    async fn list_active_for_event(
        &self,
        event: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .webhooks
            .values()
            .filter(|w| w.active && w.subscribes_to(event))
            .cloned()
            .collect())
    }

    async fn record_delivery_outcome(
        &self,
        id: WebhookId,
        outcome: &DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let webhook = state
            .webhooks
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "webhook", id })?;
        webhook.last_triggered_at = Some(at);
        webhook.last_status = Some(outcome.recorded_status());
        webhook.last_error = outcome.error_text();
        webhook.retry_count = if outcome.is_transport_failure() {
            webhook.retry_count + 1
        } else {
            0
        };
        Ok(())
    }

    async fn append_delivery_log(&self, entry: NewDeliveryLog) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.delivery_logs.push(WebhookDeliveryLog {
            id,
            webhook_id: entry.webhook_id,
            event: entry.event,
            payload: entry.payload,
            response_status: entry.response_status,
            response_body: entry.response_body,
            error_message: entry.error_message,
            duration_ms: entry.duration_ms,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_delivery_logs(
        &self,
        webhook_id: WebhookId,
        limit: usize,
    ) -> Result<Vec<WebhookDeliveryLog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .delivery_logs
            .iter()
            .rev()
            .filter(|l| l.webhook_id == webhook_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NotificationSettingsStore for MemoryStore {
    async fn get(&self, tenant_id: TenantId) -> Result<Option<NotificationSettings>, StoreError> {
        Ok(self.state.lock().await.settings.get(&tenant_id).cloned())
    }

    async fn upsert(&self, settings: &NotificationSettings) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .settings
            .insert(settings.tenant_id, settings.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Deduplicator;
    use matchengine_core::SearchHit;

    fn hit(url: &str) -> SearchHit {
        SearchHit {
            url: url.to_string(),
            title: "Convocatoria".into(),
            snippet: "Plazas de auxiliar".into(),
            source: None,
        }
    }

    async fn insert(store: &MemoryStore, url: &str) -> bool {
        store
            .insert_if_absent(Deduplicator::new_posting(
                &hit(url),
                "tavily",
                &TenantScope::global(),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn same_url_with_different_query_is_a_duplicate() {
        let store = MemoryStore::new();
        assert!(insert(&store, "https://example.gov/oferta/1?utm=a").await);
        assert!(!insert(&store, "https://example.gov/oferta/1?utm=b").await);
        assert_eq!(store.postings().await.len(), 1);
    }

    #[tokio::test]
    async fn discarded_posting_cannot_become_classified() {
        let store = MemoryStore::new();
        insert(&store, "https://example.gov/oferta/2").await;
        let id = store.postings().await[0].id;

        assert!(store
            .update_status(id, JobStatus::Pending, JobStatus::Discarded, Some(false))
            .await
            .unwrap());

        let err = store
            .update_status(id, JobStatus::Discarded, JobStatus::Classified, Some(true))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        // A stale compare-and-set from pending is a no-op, not a transition.
        assert!(!store
            .update_status(id, JobStatus::Pending, JobStatus::Classified, Some(true))
            .await
            .unwrap());
        let posting = JobStore::get(&store, id).await.unwrap().unwrap();
        assert_eq!(posting.status, JobStatus::Discarded);
        assert_eq!(posting.is_relevant, Some(false));
        assert!(posting.classified_at.is_some());
    }

    #[tokio::test]
    async fn requeue_moves_only_failed_extractions() {
        let store = MemoryStore::new();
        insert(&store, "https://example.gov/a").await;
        insert(&store, "https://example.gov/b").await;
        let ids = store.postings().await.iter().map(|p| p.id).collect::<Vec<_>>();
        for id in &ids {
            store
                .update_status(*id, JobStatus::Pending, JobStatus::Classified, Some(true))
                .await
                .unwrap();
        }
        store
            .update_status(ids[0], JobStatus::Classified, JobStatus::ExtractionFailed, None)
            .await
            .unwrap();

        assert_eq!(
            store
                .requeue_failed_extractions(&TenantScope::global())
                .await
                .unwrap(),
            1
        );
        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&JobStatus::Classified), Some(&2));
        assert_eq!(counts.get(&JobStatus::ExtractionFailed), None);
    }

    #[tokio::test]
    async fn upsert_overwrites_only_identifying_fields() {
        let store = MemoryStore::new();
        insert(&store, "https://example.gov/c").await;
        let posting_id = store.postings().await[0].id;

        let first = ExtractedFields {
            title: Some("Old title".into()),
            organism: Some("Old organism".into()),
            province: Some("Sevilla".into()),
            ai_score: 70,
            ..Default::default()
        };
        let created = store.upsert_for_posting(posting_id, &first).await.unwrap();
        assert!(created.created);

        let second = ExtractedFields {
            title: Some("New title".into()),
            organism: Some("New organism".into()),
            specialty: Some("Enfermeria".into()),
            province: Some("Malaga".into()),
            ai_score: 90,
            ..Default::default()
        };
        let updated = store.upsert_for_posting(posting_id, &second).await.unwrap();
        assert_eq!(updated.id, created.id);
        assert!(!updated.created);

        let stored = &store.opportunities().await[0];
        assert_eq!(stored.fields.title.as_deref(), Some("New title"));
        assert_eq!(stored.fields.specialty.as_deref(), Some("Enfermeria"));
        assert_eq!(stored.fields.province.as_deref(), Some("Sevilla"));
        assert_eq!(stored.fields.ai_score, 70);
    }

    #[tokio::test]
    async fn eligible_configs_are_oldest_first_and_capped() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for n in 0..3 {
            let config = SearchConfigRegistry::create(
                &store,
                NewSearchConfiguration {
                    tenant_id: 1,
                    name: format!("cfg-{n}"),
                    queries: vec!["oposiciones".into()],
                    filters: Default::default(),
                    max_results: 5,
                    run_interval_minutes: 60,
                },
            )
            .await
            .unwrap();
            ids.push(config.id);
        }
        store
            .mark_run(ids[0], now - chrono::Duration::minutes(120))
            .await
            .unwrap();
        store.mark_run(ids[1], now).await.unwrap();

        let eligible = store.list_eligible(now, 10).await.unwrap();
        let eligible_ids = eligible.iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(eligible_ids, vec![ids[2], ids[0]]);

        assert_eq!(store.list_eligible(now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transport_failures_increment_and_responses_reset_retry_count() {
        let store = MemoryStore::new();
        let hook = WebhookRegistry::create(
            &store,
            NewWebhook {
                tenant_id: 1,
                name: "crm".into(),
                url: "http://127.0.0.1:9/hook".into(),
                method: "POST".into(),
                headers: Default::default(),
                secret: None,
                events: vec!["opportunity.created".into()],
                active: true,
            },
        )
        .await
        .unwrap();

        let failure = DeliveryOutcome::TransportFailure {
            error: "connection refused".into(),
        };
        store
            .record_delivery_outcome(hook.id, &failure, Utc::now())
            .await
            .unwrap();
        store
            .record_delivery_outcome(hook.id, &failure, Utc::now())
            .await
            .unwrap();
        let stored = WebhookRegistry::get(&store, hook.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.last_status, Some(0));

        store
            .record_delivery_outcome(hook.id, &DeliveryOutcome::Response { status: 503 }, Utc::now())
            .await
            .unwrap();
        let stored = WebhookRegistry::get(&store, hook.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 503"));
    }
}
