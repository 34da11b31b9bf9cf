use std::sync::Arc;

use askama::Template;
use matchengine_adapters::{NotificationChannel, RenderedMessage};
use matchengine_core::{NotificationSettings, OpportunitySummary};
use serde::Serialize;
use tracing::{info, warn};

use crate::Collaborators;

/// Chat digests list at most this many opportunities.
const CHAT_DIGEST_LIMIT: usize = 10;

struct DigestRow {
    position: usize,
    title: String,
    organism: String,
    quota: &'static str,
    deadline: String,
    region: String,
}

impl DigestRow {
    fn new(position: usize, opportunity: &OpportunitySummary) -> Self {
        Self {
            position,
            title: opportunity
                .title
                .clone()
                .unwrap_or_else(|| "Sin título".to_string()),
            organism: opportunity.organism.clone().unwrap_or_default(),
            quota: if opportunity.disability_quota { "Sí" } else { "No" },
            deadline: opportunity
                .application_deadline
                .map(|d| d.format("%d/%m/%Y").to_string())
                .unwrap_or_default(),
            region: opportunity.autonomous_region.clone().unwrap_or_default(),
        }
    }
}

#[derive(Template)]
#[template(path = "email_digest.html")]
struct EmailDigestTemplate {
    rows: Vec<DigestRow>,
}

#[derive(Template)]
#[template(path = "chat_digest.txt", escape = "html")]
struct ChatDigestTemplate {
    total: usize,
    rows: Vec<DigestRow>,
    remaining: usize,
}

fn rows(opportunities: &[OpportunitySummary]) -> Vec<DigestRow> {
    opportunities
        .iter()
        .enumerate()
        .map(|(i, opp)| DigestRow::new(i + 1, opp))
        .collect()
}

pub fn render_email_digest(
    opportunities: &[OpportunitySummary],
) -> Result<RenderedMessage, askama::Error> {
    let mut rows = rows(opportunities);
    for row in &mut rows {
        if row.deadline.is_empty() {
            row.deadline = "N/A".to_string();
        }
        if row.region.is_empty() {
            row.region = "N/A".to_string();
        }
    }
    let body = EmailDigestTemplate { rows }.render()?;
    Ok(RenderedMessage {
        subject: format!("MatchEngine: {} nuevas oportunidades", opportunities.len()),
        body,
    })
}

pub fn render_chat_digest(
    opportunities: &[OpportunitySummary],
) -> Result<RenderedMessage, askama::Error> {
    let shown = &opportunities[..opportunities.len().min(CHAT_DIGEST_LIMIT)];
    let mut rows = rows(shown);
    for row in &mut rows {
        if row.organism.is_empty() {
            row.organism = "N/A".to_string();
        }
    }
    let body = ChatDigestTemplate {
        total: opportunities.len(),
        rows,
        remaining: opportunities.len().saturating_sub(CHAT_DIGEST_LIMIT),
    }
    .render()?;
    Ok(RenderedMessage {
        subject: "Nuevas Oportunidades".to_string(),
        body,
    })
}

/// `None` means the channel was not attempted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotifyReport {
    pub email: Option<bool>,
    pub chat: Option<bool>,
}

/// Email and chat fan-out for newly extracted opportunities.
#[derive(Clone)]
pub struct Notifier {
    email: Arc<dyn NotificationChannel>,
    chat: Arc<dyn NotificationChannel>,
}

impl Notifier {
    pub fn new(collaborators: &Collaborators) -> Self {
        Self {
            email: collaborators.email.clone(),
            chat: collaborators.chat.clone(),
        }
    }

    /// At most one email and one chat message. Channel failures are logged
    /// and never affect each other.
    pub async fn notify_new_opportunities(
        &self,
        settings: &NotificationSettings,
        opportunities: &[OpportunitySummary],
    ) -> NotifyReport {
        let mut report = NotifyReport::default();
        if opportunities.is_empty() {
            return report;
        }
        info!(
            tenant_id = settings.tenant_id,
            count = opportunities.len(),
            "sending opportunity notifications"
        );

        if let Some(address) = settings.email_destination() {
            let sent = match render_email_digest(opportunities) {
                Ok(message) => self.email.send(address, &message).await,
                Err(err) => {
                    warn!(tenant_id = settings.tenant_id, error = %err, "email digest failed to render");
                    false
                }
            };
            report.email = Some(sent);
        }

        if let Some(chat_id) = settings.chat_destination() {
            let sent = match render_chat_digest(opportunities) {
                Ok(message) => self.chat.send(chat_id, &message).await,
                Err(err) => {
                    warn!(tenant_id = settings.tenant_id, error = %err, "chat digest failed to render");
                    false
                }
            };
            report.chat = Some(sent);
        }

        report
    }
}
