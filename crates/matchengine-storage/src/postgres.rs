//! Postgres-backed implementation of the store traits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use matchengine_core::{
    AccessType, DeliveryOutcome, ExtractedFields, JobStatus, NewDeliveryLog, NewPosting,
    NewSearchConfiguration, NewWebhook, NotificationSettings, Opportunity, OpportunityFilter,
    OpportunityStats, Posting, PostingId, SearchConfigId, SearchConfiguration, SearchFilters,
    TenantId, TenantScope, UpsertedOpportunity, WebhookDeliveryLog, WebhookId,
    WebhookSubscription,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;

use crate::{
    check_transition, JobStore, NotificationSettingsStore, OpportunityStore,
    SearchConfigRegistry, StoreError, WebhookRegistry,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    value.max(0) as u32
}

fn push_scope(qb: &mut QueryBuilder<'_, Postgres>, scope: &TenantScope) {
    if let Some(tenant_id) = scope.tenant_id {
        qb.push(" AND tenant_id = ").push_bind(tenant_id);
    }
    if let Some(config_id) = scope.search_config_id {
        qb.push(" AND search_config_id = ").push_bind(config_id);
    }
}

fn posting_from_row(row: &PgRow) -> Result<Posting, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Posting {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        url_hash: row.try_get("url_hash")?,
        title: row.try_get("title")?,
        snippet: row.try_get("snippet")?,
        source: row.try_get("source")?,
        tenant_id: row.try_get("tenant_id")?,
        search_config_id: row.try_get("search_config_id")?,
        status: status.parse().map_err(|err: matchengine_core::UnknownStatus| {
            StoreError::Corrupt {
                table: "jobs",
                message: err.to_string(),
            }
        })?,
        is_relevant: row.try_get("is_relevant")?,
        created_at: row.try_get("created_at")?,
        classified_at: row.try_get("classified_at")?,
        extracted_at: row.try_get("extracted_at")?,
    })
}

fn opportunity_from_row(row: &PgRow) -> Result<Opportunity, StoreError> {
    let access_type: Option<String> = row.try_get("access_type")?;
    let ai_score: i16 = row.try_get("ai_score")?;
    Ok(Opportunity {
        id: row.try_get("id")?,
        posting_id: row.try_get("job_id")?,
        tenant_id: row.try_get("tenant_id")?,
        fields: ExtractedFields {
            title: row.try_get("title")?,
            organism: row.try_get("organism")?,
            specialty: row.try_get("specialty")?,
            position_type: row.try_get("position_type")?,
            access_type: access_type.as_deref().and_then(AccessType::from_loose),
            disability_quota: row.try_get("disability_quota")?,
            disability_percentage: row.try_get("disability_percentage")?,
            education_level: row.try_get("education_level")?,
            application_deadline: row.try_get("application_deadline")?,
            exam_date: row.try_get("exam_date")?,
            syllabus_url: row.try_get("syllabus_url")?,
            province: row.try_get("province")?,
            autonomous_region: row.try_get("autonomous_region")?,
            ai_score: ai_score.clamp(0, 100) as u8,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn config_from_row(row: &PgRow) -> Result<SearchConfiguration, StoreError> {
    let queries: Json<Vec<String>> = row.try_get("queries")?;
    let filters: Json<JsonValue> = row.try_get("filters")?;
    Ok(SearchConfiguration {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        queries: queries.0,
        filters: SearchFilters::new(filters.0),
        max_results: to_u32(row.try_get("max_results")?),
        run_interval_minutes: to_u32(row.try_get("run_interval_minutes")?),
        active: row.try_get("is_active")?,
        last_run_at: row.try_get("last_run_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn webhook_from_row(row: &PgRow) -> Result<WebhookSubscription, StoreError> {
    let headers: Json<BTreeMap<String, String>> = row.try_get("headers")?;
    let events: Json<Vec<String>> = row.try_get("events")?;
    let last_status: Option<i32> = row.try_get("last_status")?;
    Ok(WebhookSubscription {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        method: row.try_get("method")?,
        headers: headers.0,
        secret: row.try_get("secret")?,
        events: events.0,
        active: row.try_get("is_active")?,
        last_triggered_at: row.try_get("last_triggered_at")?,
        last_status: last_status.and_then(|s| u16::try_from(s).ok()),
        last_error: row.try_get("last_error")?,
        retry_count: to_u32(row.try_get("retry_count")?),
    })
}

fn delivery_log_from_row(row: &PgRow) -> Result<WebhookDeliveryLog, StoreError> {
    let payload: Json<JsonValue> = row.try_get("payload")?;
    let status: Option<i32> = row.try_get("response_status")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;
    Ok(WebhookDeliveryLog {
        id: row.try_get("id")?,
        webhook_id: row.try_get("webhook_id")?,
        event: row.try_get("event")?,
        payload: payload.0,
        response_status: status.and_then(|s| u16::try_from(s).ok()),
        response_body: row.try_get("response_body")?,
        error_message: row.try_get("error_message")?,
        duration_ms: duration_ms.max(0) as u64,
        created_at: row.try_get("created_at")?,
    })
}

fn settings_from_row(row: &PgRow) -> Result<NotificationSettings, StoreError> {
    Ok(NotificationSettings {
        tenant_id: row.try_get("tenant_id")?,
        email_enabled: row.try_get("email_enabled")?,
        email_address: row.try_get("email_address")?,
        chat_enabled: row.try_get("chat_enabled")?,
        chat_id: row.try_get("chat_id")?,
        notify_on_new_opportunity: row.try_get("notify_on_new_opportunity")?,
        notify_on_deadline_approaching: row.try_get("notify_on_deadline_approaching")?,
        deadline_days_before: to_u32(row.try_get("deadline_days_before")?),
    })
}

/// Insert, or overwrite only the identifying fields of, the opportunity for `posting_id`.
async fn upsert_opportunity<'e, E>(
    executor: E,
    posting_id: PostingId,
    fields: &ExtractedFields,
) -> Result<UpsertedOpportunity, StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO opportunities (
            job_id, title, organism, specialty, position_type, access_type,
            disability_quota, disability_percentage, education_level,
            application_deadline, exam_date, syllabus_url, province,
            autonomous_region, ai_score
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (job_id) DO UPDATE
           SET title = EXCLUDED.title,
               organism = EXCLUDED.organism,
               specialty = EXCLUDED.specialty,
               updated_at = now()
        RETURNING id, (xmax = 0) AS created
        "#,
    )
    .bind(posting_id)
    .bind(&fields.title)
    .bind(&fields.organism)
    .bind(&fields.specialty)
    .bind(&fields.position_type)
    .bind(fields.access_type.map(AccessType::as_str))
    .bind(fields.disability_quota)
    .bind(fields.disability_percentage)
    .bind(&fields.education_level)
    .bind(fields.application_deadline)
    .bind(fields.exam_date)
    .bind(&fields.syllabus_url)
    .bind(&fields.province)
    .bind(&fields.autonomous_region)
    .bind(i16::from(fields.ai_score))
    .fetch_one(executor)
    .await?;

    Ok(UpsertedOpportunity {
        id: row.try_get("id")?,
        created: row.try_get("created")?,
    })
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_if_absent(&self, posting: NewPosting) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (tenant_id, search_config_id, url, url_hash, title, snippet, source, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            ON CONFLICT (url_hash) DO NOTHING
            "#,
        )
        .bind(posting.tenant_id)
        .bind(posting.search_config_id)
        .bind(&posting.url)
        .bind(&posting.url_hash)
        .bind(&posting.title)
        .bind(&posting.snippet)
        .bind(&posting.source)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn select_by_status(
        &self,
        status: JobStatus,
        relevant: Option<bool>,
        scope: &TenantScope,
        limit: usize,
    ) -> Result<Vec<Posting>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM jobs WHERE status = ");
        qb.push_bind(status.as_str());
        if let Some(flag) = relevant {
            qb.push(" AND is_relevant = ").push_bind(flag);
        }
        push_scope(&mut qb, scope);
        qb.push(" ORDER BY created_at ASC, id ASC LIMIT ")
            .push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(posting_from_row).collect()
    }

    async fn update_status(
        &self,
        id: PostingId,
        expected: JobStatus,
        next: JobStatus,
        relevant: Option<bool>,
    ) -> Result<bool, StoreError> {
        check_transition(expected, next)?;
        let stamp_classified = next.stamps_classified_at() && expected == JobStatus::Pending;
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET status = $1,
                   is_relevant = COALESCE($2, is_relevant),
                   classified_at = CASE WHEN $3 THEN now() ELSE classified_at END,
                   extracted_at = CASE WHEN $4 THEN now() ELSE extracted_at END
             WHERE id = $5 AND status = $6
            "#,
        )
        .bind(next.as_str())
        .bind(relevant)
        .bind(stamp_classified)
        .bind(next.stamps_extracted_at())
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue_failed_extractions(&self, scope: &TenantScope) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "UPDATE jobs SET status = 'classified' WHERE status = 'extraction_failed'",
        );
        push_scope(&mut qb, scope);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: PostingId) -> Result<Option<Posting>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(posting_from_row).transpose()
    }

    async fn count_by_status(&self) -> Result<BTreeMap<JobStatus, u64>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let status = status.parse().map_err(|err: matchengine_core::UnknownStatus| {
                StoreError::Corrupt {
                    table: "jobs",
                    message: err.to_string(),
                }
            })?;
            counts.insert(status, count.max(0) as u64);
        }
        Ok(counts)
    }
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn upsert_for_posting(
        &self,
        posting_id: PostingId,
        fields: &ExtractedFields,
    ) -> Result<UpsertedOpportunity, StoreError> {
        upsert_opportunity(&self.pool, posting_id, fields).await
    }

    async fn complete_extraction(
        &self,
        posting_id: PostingId,
        fields: &ExtractedFields,
    ) -> Result<Option<UpsertedOpportunity>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            r#"
            UPDATE jobs
               SET status = 'extracted', extracted_at = now()
             WHERE id = $1 AND status = 'classified'
            "#,
        )
        .bind(posting_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }
        let upserted = upsert_opportunity(&mut *tx, posting_id, fields).await?;
        tx.commit().await?;
        Ok(Some(upserted))
    }

    async fn list(
        &self,
        tenant_id: Option<TenantId>,
        filter: &OpportunityFilter,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT o.*, j.tenant_id FROM opportunities o JOIN jobs j ON o.job_id = j.id WHERE 1 = 1",
        );
        if let Some(tenant_id) = tenant_id {
            qb.push(" AND j.tenant_id = ").push_bind(tenant_id);
        }
        if let Some(region) = &filter.autonomous_region {
            qb.push(" AND o.autonomous_region = ").push_bind(region.clone());
        }
        if let Some(quota) = filter.disability_quota {
            qb.push(" AND o.disability_quota = ").push_bind(quota);
        }
        if let Some(access) = filter.access_type {
            qb.push(" AND o.access_type = ").push_bind(access.as_str());
        }
        if let Some(organism) = &filter.organism {
            qb.push(" AND o.organism ILIKE ")
                .push_bind(format!("%{organism}%"));
        }
        if let Some(search) = &filter.search {
            let pattern = format!("%{search}%");
            qb.push(" AND (o.title ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR o.specialty ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(from) = filter.deadline_from {
            qb.push(" AND o.application_deadline >= ").push_bind(from);
        }
        if let Some(to) = filter.deadline_to {
            qb.push(" AND o.application_deadline <= ").push_bind(to);
        }
        if let Some(min_score) = filter.min_score {
            qb.push(" AND o.ai_score >= ").push_bind(i16::from(min_score));
        }
        qb.push(format!(
            " ORDER BY o.{} {}, o.id {} LIMIT ",
            filter.order_by.column(),
            if filter.ascending { "ASC" } else { "DESC" },
            if filter.ascending { "ASC" } else { "DESC" },
        ))
        .push_bind(filter.limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    async fn stats(&self) -> Result<OpportunityStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE disability_quota) AS with_disability_quota,
                   COUNT(DISTINCT autonomous_region) AS regions
              FROM opportunities
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let with_quota: i64 = row.try_get("with_disability_quota")?;
        let regions: i64 = row.try_get("regions")?;
        Ok(OpportunityStats {
            total: total.max(0) as u64,
            with_disability_quota: with_quota.max(0) as u64,
            regions: regions.max(0) as u64,
        })
    }
}

#[async_trait]
impl SearchConfigRegistry for PgStore {
    async fn create(
        &self,
        config: NewSearchConfiguration,
    ) -> Result<SearchConfiguration, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO search_configs (tenant_id, name, queries, filters, max_results, run_interval_minutes, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE)
            RETURNING *
            "#,
        )
        .bind(config.tenant_id)
        .bind(&config.name)
        .bind(Json(&config.queries))
        .bind(Json(config.filters.as_json()))
        .bind(to_i32(config.max_results))
        .bind(to_i32(config.run_interval_minutes))
        .fetch_one(&self.pool)
        .await?;
        config_from_row(&row)
    }

    async fn list_eligible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SearchConfiguration>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM search_configs
             WHERE is_active
               AND (last_run_at IS NULL
                    OR last_run_at <= $1 - make_interval(mins => run_interval_minutes))
             ORDER BY last_run_at ASC NULLS FIRST, id ASC
             LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(config_from_row).collect()
    }

    async fn get(&self, id: SearchConfigId) -> Result<Option<SearchConfiguration>, StoreError> {
        let row = sqlx::query("SELECT * FROM search_configs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn mark_run(&self, id: SearchConfigId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE search_configs SET last_run_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "search configuration",
                id,
            });
        }
        Ok(())
    }

    async fn set_active(&self, id: SearchConfigId, active: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE search_configs SET is_active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WebhookRegistry for PgStore {
    async fn create(&self, webhook: NewWebhook) -> Result<WebhookSubscription, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO webhooks (tenant_id, name, url, method, headers, secret, events, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(webhook.tenant_id)
        .bind(&webhook.name)
        .bind(&webhook.url)
        .bind(&webhook.method)
        .bind(Json(&webhook.headers))
        .bind(&webhook.secret)
        .bind(Json(&webhook.events))
        .bind(webhook.active)
        .fetch_one(&self.pool)
        .await?;
        webhook_from_row(&row)
    }

    async fn get(&self, id: WebhookId) -> Result<Option<WebhookSubscription>, StoreError> {
        let row = sqlx::query("SELECT * FROM webhooks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(webhook_from_row).transpose()
    }

    async fn list_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let rows = sqlx::query("SELECT * FROM webhooks WHERE tenant_id = $1 ORDER BY created_at DESC")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(webhook_from_row).collect()
    }

    async fn delete(&self, id: WebhookId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_active_for_event(
        &self,
        event: &str,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM webhooks WHERE is_active AND events @> jsonb_build_array($1::text)",
        )
        .bind(event)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(webhook_from_row).collect()
    }

    async fn record_delivery_outcome(
        &self,
        id: WebhookId,
        outcome: &DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sql = if outcome.is_transport_failure() {
            r#"
            UPDATE webhooks
               SET last_triggered_at = $2, last_status = $3, last_error = $4,
                   retry_count = retry_count + 1
             WHERE id = $1
            "#
        } else {
            r#"
            UPDATE webhooks
               SET last_triggered_at = $2, last_status = $3, last_error = $4,
                   retry_count = 0
             WHERE id = $1
            "#
        };
        sqlx::query(sql)
            .bind(id)
            .bind(at)
            .bind(i32::from(outcome.recorded_status()))
            .bind(outcome.error_text())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_delivery_log(&self, entry: NewDeliveryLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_logs (webhook_id, event, payload, response_status, response_body, error_message, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.webhook_id)
        .bind(&entry.event)
        .bind(Json(&entry.payload))
        .bind(entry.response_status.map(i32::from))
        .bind(&entry.response_body)
        .bind(&entry.error_message)
        .bind(i64::try_from(entry.duration_ms).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_delivery_logs(
        &self,
        webhook_id: WebhookId,
        limit: usize,
    ) -> Result<Vec<WebhookDeliveryLog>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_logs WHERE webhook_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(webhook_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delivery_log_from_row).collect()
    }
}

#[async_trait]
impl NotificationSettingsStore for PgStore {
    async fn get(&self, tenant_id: TenantId) -> Result<Option<NotificationSettings>, StoreError> {
        let row = sqlx::query("SELECT * FROM notification_settings WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(settings_from_row).transpose()
    }

    async fn upsert(&self, settings: &NotificationSettings) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notification_settings (
                tenant_id, email_enabled, email_address, chat_enabled, chat_id,
                notify_on_new_opportunity, notify_on_deadline_approaching, deadline_days_before
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id) DO UPDATE
               SET email_enabled = EXCLUDED.email_enabled,
                   email_address = EXCLUDED.email_address,
                   chat_enabled = EXCLUDED.chat_enabled,
                   chat_id = EXCLUDED.chat_id,
                   notify_on_new_opportunity = EXCLUDED.notify_on_new_opportunity,
                   notify_on_deadline_approaching = EXCLUDED.notify_on_deadline_approaching,
                   deadline_days_before = EXCLUDED.deadline_days_before
            "#,
        )
        .bind(settings.tenant_id)
        .bind(settings.email_enabled)
        .bind(&settings.email_address)
        .bind(settings.chat_enabled)
        .bind(&settings.chat_id)
        .bind(settings.notify_on_new_opportunity)
        .bind(settings.notify_on_deadline_approaching)
        .bind(to_i32(settings.deadline_days_before))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
