//! Deterministic collaborators for tests and offline runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use matchengine_core::{Posting, SearchHit};
use serde_json::Value as JsonValue;

use crate::{
    AdapterError, ChannelKind, Classifier, Extractor, NotificationChannel, RenderedMessage,
    SearchProvider,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn scripted_failure(what: &str) -> AdapterError {
    AdapterError::Decode {
        service: "scripted",
        message: format!("scripted failure for {what}"),
    }
}

/// Returns canned hits per query; unknown queries yield no hits.
#[derive(Default)]
pub struct ScriptedSearchProvider {
    hits: HashMap<String, Vec<SearchHit>>,
    failing: Vec<String>,
    calls: Mutex<Vec<(String, u32)>>,
}

impl ScriptedSearchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hits(mut self, query: &str, hits: Vec<SearchHit>) -> Self {
        self.hits.insert(query.to_string(), hits);
        self
    }

    pub fn failing_on(mut self, query: &str) -> Self {
        self.failing.push(query.to_string());
        self
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearchProvider {
    fn provider_id(&self) -> &'static str {
        "scripted"
    }

    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchHit>, AdapterError> {
        lock(&self.calls).push((query.to_string(), max_results));
        if self.failing.iter().any(|q| q == query) {
            return Err(scripted_failure(query));
        }
        let hits = self.hits.get(query).cloned().unwrap_or_default();
        Ok(hits.into_iter().take(max_results as usize).collect())
    }
}

enum Rule<T> {
    Answer(T),
    Fail,
}

/// Answers by the first rule whose needle occurs in the classified text.
pub struct ScriptedClassifier {
    rules: Vec<(String, Rule<String>)>,
    default_answer: String,
    calls: Mutex<usize>,
}

impl ScriptedClassifier {
    pub fn new(default_answer: &str) -> Self {
        Self {
            rules: Vec::new(),
            default_answer: default_answer.to_string(),
            calls: Mutex::new(0),
        }
    }

    pub fn answer(mut self, needle: &str, output: &str) -> Self {
        self.rules
            .push((needle.to_string(), Rule::Answer(output.to_string())));
        self
    }

    pub fn fail_on(mut self, needle: &str) -> Self {
        self.rules.push((needle.to_string(), Rule::Fail));
        self
    }

    pub fn call_count(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, text: &str) -> Result<String, AdapterError> {
        *lock(&self.calls) += 1;
        match self.rules.iter().find(|(needle, _)| text.contains(needle.as_str())) {
            Some((_, Rule::Answer(output))) => Ok(output.clone()),
            Some((needle, Rule::Fail)) => Err(scripted_failure(needle)),
            None => Ok(self.default_answer.clone()),
        }
    }
}

/// Answers by the first rule whose needle occurs in the posting URL; otherwise `None`.
#[derive(Default)]
pub struct ScriptedExtractor {
    rules: Vec<(String, Rule<Option<JsonValue>>)>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, url_needle: &str, output: Option<JsonValue>) -> Self {
        self.rules.push((url_needle.to_string(), Rule::Answer(output)));
        self
    }

    pub fn fail_on(mut self, url_needle: &str) -> Self {
        self.rules.push((url_needle.to_string(), Rule::Fail));
        self
    }

    /// URLs of every posting handed to the extractor, in call order.
    pub fn seen(&self) -> Vec<String> {
        lock(&self.seen).clone()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(&self, posting: &Posting) -> Result<Option<JsonValue>, AdapterError> {
        lock(&self.seen).push(posting.url.clone());
        match self
            .rules
            .iter()
            .find(|(needle, _)| posting.url.contains(needle.as_str()))
        {
            Some((_, Rule::Answer(output))) => Ok(output.clone()),
            Some((needle, Rule::Fail)) => Err(scripted_failure(needle)),
            None => Ok(None),
        }
    }
}

/// Records every message and reports a fixed outcome.
pub struct RecordingChannel {
    kind: ChannelKind,
    succeed: bool,
    sent: Mutex<Vec<(String, RenderedMessage)>>,
}

impl RecordingChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            succeed: true,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(kind: ChannelKind) -> Self {
        Self {
            succeed: false,
            ..Self::new(kind)
        }
    }

    pub fn sent(&self) -> Vec<(String, RenderedMessage)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, destination: &str, message: &RenderedMessage) -> bool {
        lock(&self.sent).push((destination.to_string(), message.clone()));
        self.succeed
    }
}
