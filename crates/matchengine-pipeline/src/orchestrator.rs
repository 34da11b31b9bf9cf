//! Tick state machine over eligible search configurations plus the scheduler loop.

use std::time::Duration;

use chrono::Utc;
use matchengine_core::{
    events, OpportunitySummary, SearchConfigId, SearchConfiguration, TenantId, TenantScope,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    ClassifyReport, Collaborators, DispatchReport, ExtractReport, Notifier, NotifyReport,
    PipelineError, SearchReport, StageRunner, Stores, WebhookDispatcher,
};

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub classify_batch: usize,
    pub extract_batch: usize,
    pub config_batch: usize,
    pub tick_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            classify_batch: 20,
            extract_batch: 10,
            config_batch: 10,
            tick_interval: Duration::from_secs(300),
        }
    }
}

/// Observable position inside a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TickPhase {
    Idle,
    SelectingConfigs,
    RunningConfig {
        index: usize,
        config_id: SearchConfigId,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigRunReport {
    pub config_id: SearchConfigId,
    pub tenant_id: TenantId,
    pub search: SearchReport,
    pub classify: ClassifyReport,
    pub extract: ExtractReport,
    pub notified: Option<NotifyReport>,
    pub webhooks: Option<DispatchReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigFailure {
    pub config_id: SearchConfigId,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub run_id: Uuid,
    pub selected: usize,
    pub completed: Vec<ConfigRunReport>,
    pub failed: Vec<ConfigFailure>,
}

pub struct Orchestrator {
    stores: Stores,
    runner: StageRunner,
    notifier: Notifier,
    dispatcher: WebhookDispatcher,
    settings: OrchestratorSettings,
    phase: watch::Sender<TickPhase>,
}

impl Orchestrator {
    pub fn new(
        stores: Stores,
        collaborators: &Collaborators,
        dispatcher: WebhookDispatcher,
        settings: OrchestratorSettings,
    ) -> Self {
        let (phase, _) = watch::channel(TickPhase::Idle);
        Self {
            runner: StageRunner::new(&stores, collaborators),
            notifier: Notifier::new(collaborators),
            stores,
            dispatcher,
            settings,
            phase,
        }
    }

    pub fn phase(&self) -> watch::Receiver<TickPhase> {
        self.phase.subscribe()
    }

    /// One pass over the eligible configurations, in sequence. A failing
    /// configuration is logged and skipped; only selection errors escalate.
    pub async fn tick(&self) -> Result<TickReport, PipelineError> {
        let run_id = Uuid::new_v4();
        self.phase.send_replace(TickPhase::SelectingConfigs);

        let configs = match self
            .stores
            .configs
            .list_eligible(Utc::now(), self.settings.config_batch)
            .await
        {
            Ok(configs) => configs,
            Err(err) => {
                self.phase.send_replace(TickPhase::Idle);
                return Err(err.into());
            }
        };

        let mut report = TickReport {
            run_id,
            selected: configs.len(),
            completed: Vec::new(),
            failed: Vec::new(),
        };
        info!(%run_id, selected = configs.len(), "orchestrator tick started");

        for (index, config) in configs.iter().enumerate() {
            self.phase.send_replace(TickPhase::RunningConfig {
                index,
                config_id: config.id,
            });
            let span = info_span!(
                "config_run",
                %run_id,
                config_id = config.id,
                tenant_id = config.tenant_id,
                name = config.name.as_str()
            );
            match self.run_config(config).instrument(span).await {
                Ok(done) => report.completed.push(done),
                Err(err) => {
                    error!(%run_id, config_id = config.id, error = %err, "configuration run failed");
                    report.failed.push(ConfigFailure {
                        config_id: config.id,
                        error: err.to_string(),
                    });
                }
            }
        }

        self.phase.send_replace(TickPhase::Idle);
        info!(
            %run_id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "orchestrator tick finished"
        );
        Ok(report)
    }

    async fn run_config(
        &self,
        config: &SearchConfiguration,
    ) -> Result<ConfigRunReport, PipelineError> {
        let scope = TenantScope::for_config(config);

        let search = self
            .runner
            .run_search(&config.queries, config.max_results, &scope)
            .await?;
        let classify = self
            .runner
            .run_classify(self.settings.classify_batch, &scope)
            .await?;
        let extract = self
            .runner
            .run_extract(self.settings.extract_batch, &scope)
            .await?;

        let (notified, webhooks) = if extract.opportunities.is_empty() {
            (None, None)
        } else {
            let notified = self
                .notify_tenant(config.tenant_id, &extract.opportunities)
                .await;
            let payload = json!({
                "count": extract.opportunities.len(),
                "opportunities": extract.opportunities,
                "search_config": { "id": config.id, "name": config.name },
            });
            let webhooks = self
                .dispatcher
                .dispatch(events::OPPORTUNITY_CREATED, config.tenant_id, &payload)
                .await;
            (notified, Some(webhooks))
        };

        self.stores.configs.mark_run(config.id, Utc::now()).await?;

        Ok(ConfigRunReport {
            config_id: config.id,
            tenant_id: config.tenant_id,
            search,
            classify,
            extract,
            notified,
            webhooks,
        })
    }

    async fn notify_tenant(
        &self,
        tenant_id: TenantId,
        opportunities: &[OpportunitySummary],
    ) -> Option<NotifyReport> {
        let settings = match self.stores.notifications.get(tenant_id).await {
            Ok(Some(settings)) => settings,
            Ok(None) => return None,
            Err(err) => {
                warn!(tenant_id, error = %err, "notification settings lookup failed");
                return None;
            }
        };
        if !settings.notify_on_new_opportunity || !settings.any_channel_enabled() {
            return None;
        }
        Some(
            self.notifier
                .notify_new_opportunities(&settings, opportunities)
                .await,
        )
    }

    /// Tick immediately, then on every interval until `shutdown` turns true
    /// or its sender is dropped. A running tick is finished before stopping.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.settings.tick_interval.as_secs(),
            "orchestrator started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "orchestrator tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("orchestrator stopped");
    }
}
