use std::sync::Arc;

use async_trait::async_trait;
use matchengine_core::Posting;
use matchengine_storage::HttpClient;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::{decode_error, AdapterError, Classifier, Extractor};

const SERVICE: &str = "openai";

const CLASSIFY_PROMPT: &str = r#"Eres un clasificador extremadamente estricto.

Responde SOLO "SI" o "NO".

Marca "SI" únicamente si el texto parece describir una convocatoria REAL de empleo público
(oposiciones, proceso selectivo, plazas disponibles, turno libre, acceso a función pública),
aunque el plazo no sea visible en el fragmento.

Marca "NO" si es:

- histórico
- boletín informativo
- noticias
- ayudas o subvenciones
- páginas informativas
- preguntas frecuentes
- documentación sin proceso selectivo claro
- temarios sin convocatoria
- bolsas genéricas sin apertura

Texto:
"#;

const EXTRACT_PROMPT: &str = r#"Extrae la información de esta convocatoria pública.

Devuelve SOLO JSON válido.

Campos:

- title
- organism
- specialty
- position_type
- access_type (libre / concurso / oposicion)
- disability_quota (true/false)
- disability_percentage
- education_level
- application_deadline (YYYY-MM-DD si aparece)
- exam_date (YYYY-MM-DD si aparece)
- syllabus_url (si existe)
- province
- autonomous_region
- ai_score (0-100 según oficialidad)

Contenido:
"#;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4.1-mini".to_string(),
        }
    }
}

/// Minimal chat-completions client shared by the classifier and the extractor.
pub struct OpenAiClient {
    http: Arc<HttpClient>,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(http: Arc<HttpClient>, config: OpenAiConfig) -> Self {
        Self { http, config }
    }

    pub async fn complete(
        &self,
        prompt: &str,
        temperature: Option<f32>,
    ) -> Result<String, AdapterError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(AdapterError::NotConfigured("OPENAI_API_KEY"))?;
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut body = json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(temperature) = temperature {
            body["temperature"] = json!(temperature);
        }

        let raw = self.http.post_json(SERVICE, &url, Some(api_key), &body).await?;
        message_content(&raw)
    }
}

fn message_content(raw: &JsonValue) -> Result<String, AdapterError> {
    raw.pointer("/choices/0/message/content")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| decode_error(SERVICE, "missing choices[0].message.content"))
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    match rest.split_once('\n') {
        Some((lang, body)) if !lang.trim().contains(' ') => body.trim(),
        _ => rest.trim(),
    }
}

pub struct OpenAiClassifier {
    client: Arc<OpenAiClient>,
}

impl OpenAiClassifier {
    pub fn new(client: Arc<OpenAiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(&self, text: &str) -> Result<String, AdapterError> {
        let prompt = format!("{CLASSIFY_PROMPT}{text}\n");
        let answer = self.client.complete(&prompt, None).await?;
        Ok(answer.trim().to_string())
    }
}

pub struct OpenAiExtractor {
    client: Arc<OpenAiClient>,
}

impl OpenAiExtractor {
    pub fn new(client: Arc<OpenAiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    async fn extract(&self, posting: &Posting) -> Result<Option<JsonValue>, AdapterError> {
        let prompt = format!("{EXTRACT_PROMPT}{}\n{}\n", posting.snippet, posting.url);
        let answer = self.client.complete(&prompt, Some(0.2)).await?;

        match serde_json::from_str::<JsonValue>(strip_code_fence(&answer)) {
            Ok(value) => {
                debug!(job_id = posting.id, "extractor returned json");
                Ok(Some(value))
            }
            Err(err) => {
                warn!(job_id = posting.id, error = %err, "extractor output is not json");
                Ok(None)
            }
        }
    }
}
