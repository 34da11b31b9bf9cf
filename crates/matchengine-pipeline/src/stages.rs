use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use matchengine_adapters::{Classifier, Extractor, SearchProvider};
use matchengine_core::{
    ExtractedFields, JobStatus, OpportunitySummary, Posting, Relevance, SearchHit, TenantScope,
};
use matchengine_storage::{Deduplicator, JobStore, OpportunityStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Collaborators, PipelineConfig, PipelineError, SearchFile, Stores};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchReport {
    pub queries: usize,
    pub fetched: usize,
    pub unique: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifyReport {
    pub total: usize,
    pub relevant: usize,
    pub discarded: usize,
    pub failed: usize,
    /// Postings that left `pending` between selection and update.
    pub stale: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractReport {
    pub total: usize,
    pub extracted: usize,
    pub failed: usize,
    pub stale: usize,
    pub opportunities: Vec<OpportunitySummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Search,
    Classify,
    Extract,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Search => "search",
            Stage::Classify => "classify",
            Stage::Extract => "extract",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "search" => Ok(Stage::Search),
            "classify" | "classifier" => Ok(Stage::Classify),
            "extract" | "extractor" => Ok(Stage::Extract),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageReport {
    Search(SearchReport),
    Classify(ClassifyReport),
    Extract(ExtractReport),
}

/// Batch stage runners over the job and opportunity stores.
#[derive(Clone)]
pub struct StageRunner {
    jobs: Arc<dyn JobStore>,
    opportunities: Arc<dyn OpportunityStore>,
    search: Arc<dyn SearchProvider>,
    classifier: Arc<dyn Classifier>,
    extractor: Arc<dyn Extractor>,
}

impl StageRunner {
    pub fn new(stores: &Stores, collaborators: &Collaborators) -> Self {
        Self {
            jobs: stores.jobs.clone(),
            opportunities: stores.opportunities.clone(),
            search: collaborators.search.clone(),
            classifier: collaborators.classifier.clone(),
            extractor: collaborators.extractor.clone(),
        }
    }

    /// One provider call per query, then insert every distinct result URL.
    /// A provider failure aborts the stage.
    pub async fn run_search(
        &self,
        queries: &[String],
        max_results: u32,
        scope: &TenantScope,
    ) -> Result<SearchReport, PipelineError> {
        let mut report = SearchReport {
            queries: queries.len(),
            ..Default::default()
        };
        let mut hits = Vec::new();

        for query in queries {
            let found = self
                .search
                .search(query, max_results)
                .await
                .map_err(|source| PipelineError::Search {
                    query: query.clone(),
                    source,
                })?;
            debug!(query = query.as_str(), hits = found.len(), "search query answered");
            hits.extend(found);
        }
        report.fetched = hits.len();

        let unique = last_occurrence_by_url(hits);
        report.unique = unique.len();

        for hit in &unique {
            let posting = Deduplicator::new_posting(hit, self.search.provider_id(), scope);
            if self.jobs.insert_if_absent(posting).await? {
                report.inserted += 1;
            } else {
                report.duplicates += 1;
            }
        }

        info!(
            tenant_id = scope.tenant_id,
            config_id = scope.search_config_id,
            fetched = report.fetched,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "search stage finished"
        );
        Ok(report)
    }

    /// Classify up to `limit` pending postings. Classifier errors leave the
    /// posting pending for a later pass.
    pub async fn run_classify(
        &self,
        limit: usize,
        scope: &TenantScope,
    ) -> Result<ClassifyReport, PipelineError> {
        let batch = self
            .jobs
            .select_by_status(JobStatus::Pending, None, scope, limit)
            .await?;
        let mut report = ClassifyReport {
            total: batch.len(),
            ..Default::default()
        };

        for posting in batch {
            let output = match self.classifier.classify(&posting.classifier_text()).await {
                Ok(output) => output,
                Err(err) => {
                    warn!(job_id = posting.id, error = %err, "classifier failed, leaving posting pending");
                    report.failed += 1;
                    continue;
                }
            };

            let relevance = Relevance::from_classifier_output(&output);
            let applied = self
                .jobs
                .update_status(
                    posting.id,
                    JobStatus::Pending,
                    relevance.target_status(),
                    Some(relevance.is_relevant()),
                )
                .await?;

            if !applied {
                debug!(job_id = posting.id, "posting no longer pending, skipping");
                report.stale += 1;
            } else if relevance.is_relevant() {
                report.relevant += 1;
            } else {
                report.discarded += 1;
            }
        }

        info!(
            tenant_id = scope.tenant_id,
            config_id = scope.search_config_id,
            total = report.total,
            relevant = report.relevant,
            discarded = report.discarded,
            failed = report.failed,
            "classify stage finished"
        );
        Ok(report)
    }

    /// Extract up to `limit` relevant classified postings into opportunities.
    pub async fn run_extract(
        &self,
        limit: usize,
        scope: &TenantScope,
    ) -> Result<ExtractReport, PipelineError> {
        let batch = self
            .jobs
            .select_by_status(JobStatus::Classified, Some(true), scope, limit)
            .await?;
        let mut report = ExtractReport {
            total: batch.len(),
            ..Default::default()
        };

        for posting in batch.iter().filter(|p| p.is_extractable()) {
            match self.extract_one(posting).await {
                Ok(Some(fields)) => {
                    let Some(upserted) = self
                        .opportunities
                        .complete_extraction(posting.id, &fields)
                        .await?
                    else {
                        debug!(job_id = posting.id, "posting no longer classified, dropping extraction");
                        report.stale += 1;
                        continue;
                    };
                    debug!(
                        job_id = posting.id,
                        opportunity_id = upserted.id,
                        created = upserted.created,
                        "opportunity stored"
                    );
                    report.extracted += 1;
                    report
                        .opportunities
                        .push(OpportunitySummary::new(upserted.id, &fields));
                }
                Ok(None) => {
                    if self.mark_failed(posting).await? {
                        report.failed += 1;
                    } else {
                        report.stale += 1;
                    }
                }
                Err(message) => {
                    warn!(job_id = posting.id, url = posting.url.as_str(), error = %message, "extraction failed");
                    if self.mark_failed(posting).await? {
                        report.failed += 1;
                    } else {
                        report.stale += 1;
                    }
                }
            }
        }

        info!(
            tenant_id = scope.tenant_id,
            config_id = scope.search_config_id,
            total = report.total,
            extracted = report.extracted,
            failed = report.failed,
            "extract stage finished"
        );
        Ok(report)
    }

    /// Run one stage over the global scope.
    pub async fn run_global(
        &self,
        stage: Stage,
        search_file: Option<&SearchFile>,
        config: &PipelineConfig,
    ) -> anyhow::Result<StageReport> {
        let scope = TenantScope::global();
        Ok(match stage {
            Stage::Search => {
                let file = match search_file {
                    Some(file) => file.clone(),
                    None => SearchFile::load(&config.search_file).await?,
                };
                StageReport::Search(
                    self.run_search(&file.queries, file.max_results, &scope)
                        .await?,
                )
            }
            Stage::Classify => {
                StageReport::Classify(self.run_classify(config.classify_batch, &scope).await?)
            }
            Stage::Extract => {
                StageReport::Extract(self.run_extract(config.extract_batch, &scope).await?)
            }
        })
    }

    /// `Ok(None)` covers absent and malformed extractor output.
    async fn extract_one(&self, posting: &Posting) -> Result<Option<ExtractedFields>, String> {
        match self.extractor.extract(posting).await {
            Ok(Some(value)) => {
                let fields = ExtractedFields::from_json(&value);
                if fields.is_none() {
                    warn!(job_id = posting.id, "extractor output is not an object");
                }
                Ok(fields)
            }
            Ok(None) => {
                warn!(job_id = posting.id, "extractor returned nothing usable");
                Ok(None)
            }
            Err(err) => Err(err.to_string()),
        }
    }

    async fn mark_failed(&self, posting: &Posting) -> Result<bool, PipelineError> {
        Ok(self
            .jobs
            .update_status(
                posting.id,
                JobStatus::Classified,
                JobStatus::ExtractionFailed,
                None,
            )
            .await?)
    }
}

/// Keep one hit per provider URL; a later hit replaces an earlier one in place.
fn last_occurrence_by_url(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut order: Vec<String> = Vec::new();
    let mut by_url: HashMap<String, SearchHit> = HashMap::new();
    for hit in hits {
        if by_url.insert(hit.url.clone(), hit.clone()).is_none() {
            order.push(hit.url);
        }
    }
    order
        .into_iter()
        .filter_map(|url| by_url.remove(&url))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchengine_adapters::scripted::{
        RecordingChannel, ScriptedClassifier, ScriptedExtractor, ScriptedSearchProvider,
    };
    use matchengine_adapters::ChannelKind;
    use matchengine_core::NewPosting;
    use matchengine_storage::MemoryStore;
    use serde_json::json;

    fn hit(url: &str, title: &str) -> SearchHit {
        SearchHit {
            url: url.to_string(),
            title: title.to_string(),
            snippet: "Proceso selectivo".to_string(),
            source: None,
        }
    }

    fn runner(
        store: &Arc<MemoryStore>,
        search: ScriptedSearchProvider,
        classifier: ScriptedClassifier,
        extractor: ScriptedExtractor,
    ) -> StageRunner {
        let stores = Stores::shared(store.clone());
        let collaborators = Collaborators {
            search: Arc::new(search),
            classifier: Arc::new(classifier),
            extractor: Arc::new(extractor),
            email: Arc::new(RecordingChannel::new(ChannelKind::Email)),
            chat: Arc::new(RecordingChannel::new(ChannelKind::Chat)),
        };
        StageRunner::new(&stores, &collaborators)
    }

    async fn seed(store: &MemoryStore, url: &str, title: &str) -> i64 {
        let posting: NewPosting =
            Deduplicator::new_posting(&hit(url, title), "tavily", &TenantScope::global());
        store.insert_if_absent(posting).await.unwrap();
        store
            .postings()
            .await
            .into_iter()
            .find(|p| p.url == url)
            .map(|p| p.id)
            .unwrap()
    }

    #[test]
    fn duplicate_provider_urls_keep_last_occurrence() {
        let mut second = hit("https://example.gov/a", "second");
        second.snippet = "later".into();
        let unique = last_occurrence_by_url(vec![
            hit("https://example.gov/a", "first"),
            hit("https://example.gov/b", "other"),
            second,
        ]);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].title, "second");
        assert_eq!(unique[1].url, "https://example.gov/b");
    }

    #[test]
    fn stage_names_parse() {
        assert_eq!("search".parse::<Stage>().unwrap(), Stage::Search);
        assert_eq!("classifier".parse::<Stage>().unwrap(), Stage::Classify);
        assert!("agent".parse::<Stage>().is_err());
    }

    #[tokio::test]
    async fn search_counts_new_and_duplicate_postings() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "https://example.gov/known", "Plazas").await;
        let search = ScriptedSearchProvider::new().with_hits(
            "q",
            vec![
                hit("https://example.gov/known?utm=1", "Plazas"),
                hit("https://example.gov/new-1", "Plazas"),
                hit("https://example.gov/new-2", "Plazas"),
            ],
        );
        let runner = runner(&store, search, ScriptedClassifier::new("NO"), ScriptedExtractor::new());

        let scope = TenantScope {
            tenant_id: Some(1),
            search_config_id: None,
        };
        let report = runner
            .run_search(&["q".to_string()], 5, &scope)
            .await
            .unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.duplicates, 1);
        let new = store
            .postings()
            .await
            .into_iter()
            .filter(|p| p.tenant_id == Some(1))
            .count();
        assert_eq!(new, 2);
    }

    #[tokio::test]
    async fn search_provider_failure_escalates() {
        let store = Arc::new(MemoryStore::new());
        let search = ScriptedSearchProvider::new().failing_on("q");
        let runner = runner(&store, search, ScriptedClassifier::new("NO"), ScriptedExtractor::new());

        let err = runner
            .run_search(&["q".to_string()], 5, &TenantScope::global())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Search { .. }));
    }

    #[tokio::test]
    async fn classifier_failure_is_isolated_to_one_item() {
        let store = Arc::new(MemoryStore::new());
        let ok_a = seed(&store, "https://example.gov/1", "Plazas auxiliar").await;
        let boom = seed(&store, "https://example.gov/2", "boom").await;
        let ok_b = seed(&store, "https://example.gov/3", "Noticias").await;
        let classifier = ScriptedClassifier::new("NO")
            .answer("Plazas", "Sí, SI")
            .fail_on("boom");
        let runner = runner(&store, ScriptedSearchProvider::new(), classifier, ScriptedExtractor::new());

        let report = runner.run_classify(20, &TenantScope::global()).await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.relevant, 1);
        assert_eq!(report.discarded, 1);
        assert_eq!(report.failed, 1);

        let status = |id| {
            let store = store.clone();
            async move { JobStore::get(store.as_ref(), id).await.unwrap().unwrap() }
        };
        let a = status(ok_a).await;
        assert_eq!(a.status, JobStatus::Classified);
        assert_eq!(a.is_relevant, Some(true));
        assert_eq!(status(boom).await.status, JobStatus::Pending);
        assert_eq!(status(ok_b).await.status, JobStatus::Discarded);
    }

    #[tokio::test]
    async fn classify_respects_batch_limit() {
        let store = Arc::new(MemoryStore::new());
        for n in 0..5 {
            seed(&store, &format!("https://example.gov/{n}"), "Plazas").await;
        }
        let runner = runner(
            &store,
            ScriptedSearchProvider::new(),
            ScriptedClassifier::new("SI"),
            ScriptedExtractor::new(),
        );

        let report = runner.run_classify(2, &TenantScope::global()).await.unwrap();
        assert_eq!(report.total, 2);
        let pending = store
            .postings()
            .await
            .into_iter()
            .filter(|p| p.status == JobStatus::Pending)
            .count();
        assert_eq!(pending, 3);
    }

    #[tokio::test]
    async fn extract_only_touches_relevant_classified_postings() {
        let store = Arc::new(MemoryStore::new());
        let pending = seed(&store, "https://example.gov/pending", "p").await;
        let discarded = seed(&store, "https://example.gov/discarded", "d").await;
        let good = seed(&store, "https://example.gov/good", "g").await;
        let malformed = seed(&store, "https://example.gov/malformed", "m").await;
        let broken = seed(&store, "https://example.gov/broken", "b").await;

        store
            .update_status(discarded, JobStatus::Pending, JobStatus::Discarded, Some(false))
            .await
            .unwrap();
        for id in [good, malformed, broken] {
            store
                .update_status(id, JobStatus::Pending, JobStatus::Classified, Some(true))
                .await
                .unwrap();
        }

        let extractor = ScriptedExtractor::new()
            .respond("/good", Some(json!({ "title": "Auxiliar", "organism": "Ayto" })))
            .respond("/malformed", Some(json!(["not", "an", "object"])))
            .fail_on("/broken");
        let runner = runner(&store, ScriptedSearchProvider::new(), ScriptedClassifier::new("NO"), extractor);

        let report = runner.run_extract(10, &TenantScope::global()).await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.extracted, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.opportunities.len(), 1);
        assert_eq!(report.opportunities[0].title.as_deref(), Some("Auxiliar"));

        let get = |id| {
            let store = store.clone();
            async move { JobStore::get(store.as_ref(), id).await.unwrap().unwrap() }
        };
        assert_eq!(get(pending).await.status, JobStatus::Pending);
        assert_eq!(get(discarded).await.status, JobStatus::Discarded);
        assert_eq!(get(good).await.status, JobStatus::Extracted);
        assert!(get(good).await.extracted_at.is_some());
        assert_eq!(get(malformed).await.status, JobStatus::ExtractionFailed);
        assert_eq!(get(broken).await.status, JobStatus::ExtractionFailed);

        let opportunities = store.opportunities().await;
        assert_eq!(opportunities.len(), 1);
        assert_eq!(opportunities[0].posting_id, good);
        assert_eq!(opportunities[0].fields.ai_score, 50);
    }

    #[tokio::test]
    async fn requeued_failures_are_extracted_again() {
        let store = Arc::new(MemoryStore::new());
        let id = seed(&store, "https://example.gov/retry", "r").await;
        store
            .update_status(id, JobStatus::Pending, JobStatus::Classified, Some(true))
            .await
            .unwrap();

        let failing = runner(
            &store,
            ScriptedSearchProvider::new(),
            ScriptedClassifier::new("NO"),
            ScriptedExtractor::new(),
        );
        let report = failing.run_extract(10, &TenantScope::global()).await.unwrap();
        assert_eq!(report.failed, 1);

        assert_eq!(
            store
                .requeue_failed_extractions(&TenantScope::global())
                .await
                .unwrap(),
            1
        );

        let working = runner(
            &store,
            ScriptedSearchProvider::new(),
            ScriptedClassifier::new("NO"),
            ScriptedExtractor::new().respond("/retry", Some(json!({ "title": "ok" }))),
        );
        let report = working.run_extract(10, &TenantScope::global()).await.unwrap();
        assert_eq!(report.extracted, 1);
    }

    /// Simulates a concurrent worker that fails the posting while the model call is in flight.
    struct RacingExtractor {
        store: Arc<MemoryStore>,
    }

    #[async_trait::async_trait]
    impl Extractor for RacingExtractor {
        async fn extract(
            &self,
            posting: &Posting,
        ) -> Result<Option<serde_json::Value>, matchengine_adapters::AdapterError> {
            self.store
                .update_status(
                    posting.id,
                    JobStatus::Classified,
                    JobStatus::ExtractionFailed,
                    None,
                )
                .await
                .unwrap();
            Ok(Some(json!({ "title": "Auxiliar" })))
        }
    }

    #[tokio::test]
    async fn extraction_for_a_posting_moved_elsewhere_writes_no_opportunity() {
        let store = Arc::new(MemoryStore::new());
        let id = seed(&store, "https://example.gov/raced", "r").await;
        store
            .update_status(id, JobStatus::Pending, JobStatus::Classified, Some(true))
            .await
            .unwrap();

        let stores = Stores::shared(store.clone());
        let collaborators = Collaborators {
            search: Arc::new(ScriptedSearchProvider::new()),
            classifier: Arc::new(ScriptedClassifier::new("NO")),
            extractor: Arc::new(RacingExtractor {
                store: store.clone(),
            }),
            email: Arc::new(RecordingChannel::new(ChannelKind::Email)),
            chat: Arc::new(RecordingChannel::new(ChannelKind::Chat)),
        };
        let runner = StageRunner::new(&stores, &collaborators);

        let report = runner.run_extract(10, &TenantScope::global()).await.unwrap();

        assert_eq!(report.extracted, 0);
        assert_eq!(report.stale, 1);
        assert!(report.opportunities.is_empty());
        let posting = JobStore::get(store.as_ref(), id).await.unwrap().unwrap();
        assert_eq!(posting.status, JobStatus::ExtractionFailed);
        assert!(posting.extracted_at.is_none());
        assert!(store.opportunities().await.is_empty());
    }
}
