use std::sync::Arc;

use async_trait::async_trait;
use matchengine_core::SearchHit;
use matchengine_storage::HttpClient;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{decode_error, AdapterError, SearchProvider};

const SERVICE: &str = "tavily";

#[derive(Debug, Clone)]
pub struct TavilyConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

impl Default for TavilyConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.tavily.com".to_string(),
        }
    }
}

pub struct TavilySearchProvider {
    http: Arc<HttpClient>,
    config: TavilyConfig,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

impl TavilySearchProvider {
    pub fn new(http: Arc<HttpClient>, config: TavilyConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl SearchProvider for TavilySearchProvider {
    fn provider_id(&self) -> &'static str {
        SERVICE
    }

    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchHit>, AdapterError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(AdapterError::NotConfigured("TAVILY_API_KEY"))?;
        let url = format!("{}/search", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "query": query,
            "max_results": max_results,
        });

        let raw = self.http.post_json(SERVICE, &url, Some(api_key), &body).await?;
        let response: TavilyResponse =
            serde_json::from_value(raw).map_err(|err| decode_error(SERVICE, err.to_string()))?;
        debug!(query, hits = response.results.len(), "search provider answered");

        Ok(response
            .results
            .into_iter()
            .map(|r| SearchHit {
                url: r.url,
                title: r.title,
                snippet: r.content,
                source: Some(SERVICE.to_string()),
            })
            .collect())
    }
}
