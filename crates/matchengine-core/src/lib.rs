//! Core domain model for MatchEngine: postings, opportunities, tenant search
//! configuration and webhook/notification bookkeeping.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "matchengine-core";

pub type TenantId = i64;
pub type PostingId = i64;
pub type OpportunityId = i64;
pub type SearchConfigId = i64;
pub type WebhookId = i64;

/// Token whose presence in classifier output marks a posting as relevant.
pub const CLASSIFIER_YES_TOKEN: &str = "SI";

/// Confidence assigned to an opportunity when the extractor gives none.
pub const DEFAULT_AI_SCORE: u8 = 50;

/// Webhook event names understood by the dispatcher.
pub mod events {
    pub const OPPORTUNITY_CREATED: &str = "opportunity.created";
    pub const OPPORTUNITY_UPDATED: &str = "opportunity.updated";
    pub const OPPORTUNITY_DEADLINE_APPROACHING: &str = "opportunity.deadline_approaching";
    pub const SEARCH_COMPLETED: &str = "search.completed";
    pub const CLASSIFICATION_COMPLETED: &str = "classification.completed";
    pub const EXTRACTION_COMPLETED: &str = "extraction.completed";

    pub const ALL: [&str; 6] = [
        OPPORTUNITY_CREATED,
        OPPORTUNITY_UPDATED,
        OPPORTUNITY_DEADLINE_APPROACHING,
        SEARCH_COMPLETED,
        CLASSIFICATION_COMPLETED,
        EXTRACTION_COMPLETED,
    ];

    pub fn is_known(event: &str) -> bool {
        ALL.contains(&event)
    }
}

/// Posting lifecycle.
///
/// ```text
/// pending -> classified -> extracted
/// pending -> discarded
/// classified -> extraction_failed -> classified (explicit requeue only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Classified,
    Discarded,
    Extracted,
    ExtractionFailed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Classified,
        JobStatus::Discarded,
        JobStatus::Extracted,
        JobStatus::ExtractionFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Classified => "classified",
            JobStatus::Discarded => "discarded",
            JobStatus::Extracted => "extracted",
            JobStatus::ExtractionFailed => "extraction_failed",
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Classified)
                | (JobStatus::Pending, JobStatus::Discarded)
                | (JobStatus::Classified, JobStatus::Extracted)
                | (JobStatus::Classified, JobStatus::ExtractionFailed)
                | (JobStatus::ExtractionFailed, JobStatus::Classified)
        )
    }

    /// True when entering `self` stamps the classification time.
    pub fn stamps_classified_at(self) -> bool {
        matches!(self, JobStatus::Classified | JobStatus::Discarded)
    }

    pub fn stamps_extracted_at(self) -> bool {
        matches!(self, JobStatus::Extracted | JobStatus::ExtractionFailed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown job status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Normalized two-outcome classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relevance {
    Relevant,
    NotRelevant,
}

impl Relevance {
    /// Decode free classifier text. Any output containing the yes token,
    /// compared case-insensitively, is relevant.
    pub fn from_classifier_output(output: &str) -> Self {
        if output.to_uppercase().contains(CLASSIFIER_YES_TOKEN) {
            Relevance::Relevant
        } else {
            Relevance::NotRelevant
        }
    }

    pub fn is_relevant(self) -> bool {
        self == Relevance::Relevant
    }

    pub fn target_status(self) -> JobStatus {
        match self {
            Relevance::Relevant => JobStatus::Classified,
            Relevance::NotRelevant => JobStatus::Discarded,
        }
    }
}

/// Restricts stage queries to one tenant and/or one search configuration.
/// The default scope is global.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantScope {
    pub tenant_id: Option<TenantId>,
    pub search_config_id: Option<SearchConfigId>,
}

impl TenantScope {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn for_config(config: &SearchConfiguration) -> Self {
        Self {
            tenant_id: Some(config.tenant_id),
            search_config_id: Some(config.id),
        }
    }

    pub fn matches(&self, posting: &Posting) -> bool {
        self.tenant_id.map_or(true, |t| posting.tenant_id == Some(t))
            && self
                .search_config_id
                .map_or(true, |c| posting.search_config_id == Some(c))
    }
}

/// One raw result returned by a search provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// Insert payload for the job store; the url is already canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPosting {
    pub url: String,
    pub url_hash: String,
    pub title: String,
    pub snippet: String,
    pub source: String,
    pub tenant_id: Option<TenantId>,
    pub search_config_id: Option<SearchConfigId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: PostingId,
    pub url: String,
    pub url_hash: String,
    pub title: String,
    pub snippet: String,
    pub source: String,
    pub tenant_id: Option<TenantId>,
    pub search_config_id: Option<SearchConfigId>,
    pub status: JobStatus,
    pub is_relevant: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub classified_at: Option<DateTime<Utc>>,
    pub extracted_at: Option<DateTime<Utc>>,
}

impl Posting {
    pub fn is_extractable(&self) -> bool {
        self.status == JobStatus::Classified && self.is_relevant == Some(true)
    }

    pub fn classifier_text(&self) -> String {
        format!("{}\n{}", self.title, self.snippet)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    #[serde(alias = "libre")]
    Free,
    #[serde(alias = "concurso")]
    Competitive,
    #[serde(alias = "oposicion")]
    Exam,
}

impl AccessType {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessType::Free => "free",
            AccessType::Competitive => "competitive",
            AccessType::Exam => "exam",
        }
    }

    /// Lenient mapping of extractor vocabulary.
    pub fn from_loose(input: &str) -> Option<Self> {
        let lowered = input.trim().to_lowercase();
        let lowered = lowered.replace('ó', "o");
        match lowered.as_str() {
            "free" | "libre" | "turno libre" => Some(AccessType::Free),
            "competitive" | "concurso" | "concurso-oposicion" | "concurso oposicion" => {
                Some(AccessType::Competitive)
            }
            "exam" | "oposicion" => Some(AccessType::Exam),
            _ => None,
        }
    }
}

impl FromStr for AccessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccessType::from_loose(s).ok_or_else(|| format!("unknown access type '{s}'"))
    }
}

/// Structured fields produced by a successful extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub title: Option<String>,
    pub organism: Option<String>,
    pub specialty: Option<String>,
    pub position_type: Option<String>,
    pub access_type: Option<AccessType>,
    pub disability_quota: bool,
    pub disability_percentage: Option<f64>,
    pub education_level: Option<String>,
    pub application_deadline: Option<NaiveDate>,
    pub exam_date: Option<NaiveDate>,
    pub syllabus_url: Option<String>,
    pub province: Option<String>,
    pub autonomous_region: Option<String>,
    pub ai_score: u8,
}

impl Default for ExtractedFields {
    fn default() -> Self {
        Self {
            title: None,
            organism: None,
            specialty: None,
            position_type: None,
            access_type: None,
            disability_quota: false,
            disability_percentage: None,
            education_level: None,
            application_deadline: None,
            exam_date: None,
            syllabus_url: None,
            province: None,
            autonomous_region: None,
            ai_score: DEFAULT_AI_SCORE,
        }
    }
}

impl ExtractedFields {
    /// Decode extractor output. Anything that is not a JSON object is
    /// malformed and yields `None`; individual fields are best-effort.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let object = value.as_object()?;
        let get = |key: &str| object.get(key);

        Some(Self {
            title: json_text(get("title")),
            organism: json_text(get("organism")),
            specialty: json_text(get("specialty")),
            position_type: json_text(get("position_type")),
            access_type: json_text(get("access_type")).and_then(|s| AccessType::from_loose(&s)),
            disability_quota: json_truthy(get("disability_quota")),
            disability_percentage: json_number(get("disability_percentage")),
            education_level: json_text(get("education_level")),
            application_deadline: json_date(get("application_deadline")),
            exam_date: json_date(get("exam_date")),
            syllabus_url: json_text(get("syllabus_url")),
            province: json_text(get("province")),
            autonomous_region: json_text(get("autonomous_region")),
            ai_score: json_number(get("ai_score"))
                .map(|score| score.round().clamp(0.0, 100.0) as u8)
                .unwrap_or(DEFAULT_AI_SCORE),
        })
    }
}

fn json_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_number(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().trim_end_matches('%').trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

fn json_truthy(value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(JsonValue::String(s)) => matches!(
            s.trim().to_lowercase().as_str(),
            "true" | "yes" | "si" | "sí" | "1"
        ),
        _ => false,
    }
}

fn json_date(value: Option<&JsonValue>) -> Option<NaiveDate> {
    let text = json_text(value)?;
    let head = text.get(..10).unwrap_or(&text);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&text, "%d/%m/%Y"))
        .ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: OpportunityId,
    pub posting_id: PostingId,
    pub tenant_id: Option<TenantId>,
    #[serde(flatten)]
    pub fields: ExtractedFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of the opportunity upsert keyed by posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertedOpportunity {
    pub id: OpportunityId,
    pub created: bool,
}

/// Compact view handed to notifications and webhook payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunitySummary {
    pub id: OpportunityId,
    pub title: Option<String>,
    pub organism: Option<String>,
    pub specialty: Option<String>,
    pub application_deadline: Option<NaiveDate>,
    pub disability_quota: bool,
    pub autonomous_region: Option<String>,
    pub syllabus_url: Option<String>,
}

impl OpportunitySummary {
    pub fn new(id: OpportunityId, fields: &ExtractedFields) -> Self {
        Self {
            id,
            title: fields.title.clone(),
            organism: fields.organism.clone(),
            specialty: fields.specialty.clone(),
            application_deadline: fields.application_deadline,
            disability_quota: fields.disability_quota,
            autonomous_region: fields.autonomous_region.clone(),
            syllabus_url: fields.syllabus_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityStats {
    pub total: u64,
    pub with_disability_quota: u64,
    pub regions: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityOrder {
    #[default]
    CreatedAt,
    ApplicationDeadline,
    AiScore,
    Title,
}

impl OpportunityOrder {
    pub fn column(self) -> &'static str {
        match self {
            OpportunityOrder::CreatedAt => "created_at",
            OpportunityOrder::ApplicationDeadline => "application_deadline",
            OpportunityOrder::AiScore => "ai_score",
            OpportunityOrder::Title => "title",
        }
    }
}

/// Listing filter for opportunities. Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityFilter {
    pub autonomous_region: Option<String>,
    pub disability_quota: Option<bool>,
    pub access_type: Option<AccessType>,
    pub organism: Option<String>,
    pub search: Option<String>,
    pub deadline_from: Option<NaiveDate>,
    pub deadline_to: Option<NaiveDate>,
    pub min_score: Option<u8>,
    pub order_by: OpportunityOrder,
    pub ascending: bool,
    pub limit: usize,
}

impl Default for OpportunityFilter {
    fn default() -> Self {
        Self {
            autonomous_region: None,
            disability_quota: None,
            access_type: None,
            organism: None,
            search: None,
            deadline_from: None,
            deadline_to: None,
            min_score: None,
            order_by: OpportunityOrder::CreatedAt,
            ascending: false,
            limit: 100,
        }
    }
}

impl OpportunityFilter {
    pub fn matches(&self, opportunity: &Opportunity) -> bool {
        let f = &opportunity.fields;
        let contains = |haystack: &Option<String>, needle: &str| {
            haystack
                .as_deref()
                .is_some_and(|h| h.to_lowercase().contains(&needle.to_lowercase()))
        };

        self.autonomous_region
            .as_ref()
            .map_or(true, |r| f.autonomous_region.as_ref() == Some(r))
            && self.disability_quota.map_or(true, |q| f.disability_quota == q)
            && self.access_type.map_or(true, |a| f.access_type == Some(a))
            && self.organism.as_deref().map_or(true, |o| contains(&f.organism, o))
            && self
                .search
                .as_deref()
                .map_or(true, |s| contains(&f.title, s) || contains(&f.specialty, s))
            && self
                .deadline_from
                .map_or(true, |d| f.application_deadline.is_some_and(|x| x >= d))
            && self
                .deadline_to
                .map_or(true, |d| f.application_deadline.is_some_and(|x| x <= d))
            && self.min_score.map_or(true, |m| f.ai_score >= m)
    }
}

/// Tenant-defined filter document. Opaque to the pipeline; only objects are
/// accepted, anything else collapses to an empty object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchFilters(JsonValue);

impl SearchFilters {
    pub fn new(value: JsonValue) -> Self {
        if value.is_object() {
            Self(value)
        } else {
            Self::default()
        }
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self(JsonValue::Object(Default::default()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfiguration {
    pub id: SearchConfigId,
    pub tenant_id: TenantId,
    pub name: String,
    pub queries: Vec<String>,
    pub filters: SearchFilters,
    pub max_results: u32,
    pub run_interval_minutes: u32,
    pub active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SearchConfiguration {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.last_run_at.map_or(true, |last| {
                now - last >= Duration::minutes(i64::from(self.run_interval_minutes))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSearchConfiguration {
    pub tenant_id: TenantId,
    pub name: String,
    pub queries: Vec<String>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_run_interval")]
    pub run_interval_minutes: u32,
}

fn default_max_results() -> u32 {
    10
}

fn default_run_interval() -> u32 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: WebhookId,
    pub tenant_id: TenantId,
    pub name: String,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub secret: Option<String>,
    pub events: Vec<String>,
    pub active: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

impl WebhookSubscription {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWebhook {
    pub tenant_id: TenantId,
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub secret: Option<String>,
    pub events: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_true() -> bool {
    true
}

/// What happened to one webhook delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Response { status: u16 },
    TransportFailure { error: String },
}

impl DeliveryOutcome {
    /// Status stored on the subscription; 0 marks a transport failure.
    pub fn recorded_status(&self) -> u16 {
        match self {
            DeliveryOutcome::Response { status } => *status,
            DeliveryOutcome::TransportFailure { .. } => 0,
        }
    }

    pub fn error_text(&self) -> Option<String> {
        match self {
            DeliveryOutcome::Response { status } if (200..300).contains(status) => None,
            DeliveryOutcome::Response { status } => Some(format!("HTTP {status}")),
            DeliveryOutcome::TransportFailure { error } => Some(error.clone()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Response { status } if (200..300).contains(status))
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(self, DeliveryOutcome::TransportFailure { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeliveryLog {
    pub webhook_id: WebhookId,
    pub event: String,
    pub payload: JsonValue,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDeliveryLog {
    pub id: i64,
    pub webhook_id: WebhookId,
    pub event: String,
    pub payload: JsonValue,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub email_enabled: bool,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub chat_enabled: bool,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default = "default_true")]
    pub notify_on_new_opportunity: bool,
    #[serde(default)]
    pub notify_on_deadline_approaching: bool,
    #[serde(default = "default_deadline_days")]
    pub deadline_days_before: u32,
}

fn default_deadline_days() -> u32 {
    7
}

impl NotificationSettings {
    pub fn defaults_for(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            email_enabled: false,
            email_address: None,
            chat_enabled: false,
            chat_id: None,
            notify_on_new_opportunity: true,
            notify_on_deadline_approaching: false,
            deadline_days_before: default_deadline_days(),
        }
    }

    pub fn email_destination(&self) -> Option<&str> {
        non_blank(self.email_enabled, self.email_address.as_deref())
    }

    pub fn chat_destination(&self) -> Option<&str> {
        non_blank(self.chat_enabled, self.chat_id.as_deref())
    }

    pub fn any_channel_enabled(&self) -> bool {
        self.email_enabled || self.chat_enabled
    }
}

fn non_blank(enabled: bool, value: Option<&str>) -> Option<&str> {
    value.filter(|v| enabled && !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn status_transitions_follow_lifecycle() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Classified));
        assert!(Pending.can_transition_to(Discarded));
        assert!(Classified.can_transition_to(Extracted));
        assert!(Classified.can_transition_to(ExtractionFailed));
        assert!(ExtractionFailed.can_transition_to(Classified));

        assert!(!Discarded.can_transition_to(Classified));
        assert!(!Discarded.can_transition_to(Pending));
        assert!(!Extracted.can_transition_to(Classified));
        assert!(!Pending.can_transition_to(Extracted));
        assert!(!Classified.can_transition_to(Discarded));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("archived".parse::<JobStatus>().is_err());
    }

    #[test]
    fn classifier_output_is_normalized_case_insensitively() {
        assert_eq!(Relevance::from_classifier_output("SI"), Relevance::Relevant);
        assert_eq!(Relevance::from_classifier_output("  si.\n"), Relevance::Relevant);
        assert_eq!(Relevance::from_classifier_output("NO"), Relevance::NotRelevant);
        assert_eq!(Relevance::from_classifier_output(""), Relevance::NotRelevant);
        assert_eq!(Relevance::Relevant.target_status(), JobStatus::Classified);
        assert_eq!(Relevance::NotRelevant.target_status(), JobStatus::Discarded);
    }

    #[test]
    fn extracted_fields_reject_non_objects() {
        assert!(ExtractedFields::from_json(&json!(null)).is_none());
        assert!(ExtractedFields::from_json(&json!("text")).is_none());
        assert!(ExtractedFields::from_json(&json!([1, 2])).is_none());
    }

    #[test]
    fn extracted_fields_decode_leniently() {
        let fields = ExtractedFields::from_json(&json!({
            "title": " Auxiliar Administrativo ",
            "organism": "Ayuntamiento de Valencia",
            "access_type": "Oposición",
            "disability_quota": "true",
            "disability_percentage": "7%",
            "application_deadline": "2026-11-30",
            "exam_date": "not yet",
            "province": "",
            "ai_score": 87.6
        }))
        .unwrap();

        assert_eq!(fields.title.as_deref(), Some("Auxiliar Administrativo"));
        assert_eq!(fields.access_type, Some(AccessType::Exam));
        assert!(fields.disability_quota);
        assert_eq!(fields.disability_percentage, Some(7.0));
        assert_eq!(
            fields.application_deadline,
            NaiveDate::from_ymd_opt(2026, 11, 30)
        );
        assert_eq!(fields.exam_date, None);
        assert_eq!(fields.province, None);
        assert_eq!(fields.ai_score, 88);
    }

    #[test]
    fn missing_ai_score_defaults_to_fifty() {
        let fields = ExtractedFields::from_json(&json!({ "title": "x" })).unwrap();
        assert_eq!(fields.ai_score, DEFAULT_AI_SCORE);
        assert!(!fields.disability_quota);
    }

    #[test]
    fn search_configuration_due_by_interval() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let mut config = SearchConfiguration {
            id: 1,
            tenant_id: 7,
            name: "boe".into(),
            queries: vec!["convocatoria".into()],
            filters: SearchFilters::default(),
            max_results: 5,
            run_interval_minutes: 60,
            active: true,
            last_run_at: None,
            created_at: now,
        };
        assert!(config.is_due(now));

        config.last_run_at = Some(now - Duration::minutes(59));
        assert!(!config.is_due(now));

        config.last_run_at = Some(now - Duration::minutes(60));
        assert!(config.is_due(now));

        config.active = false;
        assert!(!config.is_due(now));
    }

    #[test]
    fn search_filters_only_keep_objects() {
        assert_eq!(SearchFilters::new(json!([1])).as_json(), &json!({}));
        assert_eq!(
            SearchFilters::new(json!({"region": "Madrid"})).as_json(),
            &json!({"region": "Madrid"})
        );
    }

    #[test]
    fn delivery_outcome_bookkeeping() {
        let ok = DeliveryOutcome::Response { status: 204 };
        let server_error = DeliveryOutcome::Response { status: 500 };
        let transport = DeliveryOutcome::TransportFailure {
            error: "timed out".into(),
        };

        assert_eq!(ok.error_text(), None);
        assert_eq!(server_error.error_text().as_deref(), Some("HTTP 500"));
        assert_eq!(transport.recorded_status(), 0);
        assert_eq!(transport.error_text().as_deref(), Some("timed out"));
        assert!(transport.is_transport_failure());
    }

    #[test]
    fn notification_destinations_require_enabled_and_value() {
        let mut settings = NotificationSettings::defaults_for(3);
        settings.email_address = Some("a@example.org".into());
        assert_eq!(settings.email_destination(), None);
        settings.email_enabled = true;
        assert_eq!(settings.email_destination(), Some("a@example.org"));
        settings.chat_enabled = true;
        settings.chat_id = Some("  ".into());
        assert_eq!(settings.chat_destination(), None);
    }

    #[test]
    fn tenant_scope_matches_postings() {
        let now = Utc::now();
        let posting = Posting {
            id: 1,
            url: "https://example.gov/a".into(),
            url_hash: "h".into(),
            title: "t".into(),
            snippet: "s".into(),
            source: "tavily".into(),
            tenant_id: Some(4),
            search_config_id: Some(9),
            status: JobStatus::Pending,
            is_relevant: None,
            created_at: now,
            classified_at: None,
            extracted_at: None,
        };
        assert!(TenantScope::global().matches(&posting));
        assert!(TenantScope { tenant_id: Some(4), search_config_id: Some(9) }.matches(&posting));
        assert!(!TenantScope { tenant_id: Some(5), search_config_id: None }.matches(&posting));
    }
}
