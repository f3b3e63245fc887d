//! Request processing engine.
//!
//! Owns the three stores and drives an inbound message through them:
//! the trigger store picks a trigger, the scenario store runs its steps.

use crate::config::GlobalSettings;
use crate::db::Database;
use crate::error::{MockError, Result};
use crate::message::Message;
use crate::scenario::ScenarioStore;
use crate::template::TemplateStore;
use crate::trigger::TriggerStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Mock engine
///
/// Matches inbound messages against stored triggers and answers with the
/// output of the matched trigger's scenario.
pub struct MockEngine {
    settings: GlobalSettings,
    triggers: Arc<TriggerStore>,
    scenarios: Arc<ScenarioStore>,
    templates: Arc<TemplateStore>,
    /// Total messages processed.
    requests_total: AtomicU64,
    /// Messages answered by a trigger.
    requests_matched: AtomicU64,
    /// Messages no trigger fired for.
    requests_unmatched: AtomicU64,
}

/// Snapshot of counters and cache sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub requests_total: u64,
    pub requests_matched: u64,
    pub requests_unmatched: u64,
    pub triggers: usize,
    pub templates: usize,
    pub scenario_steps: usize,
}

impl MockEngine {
    /// Create an engine over a database. Caches start empty; call [`load`](Self::load).
    pub fn new(db: Arc<Database>, settings: GlobalSettings) -> Self {
        let templates = Arc::new(TemplateStore::new(db.clone()));
        let scenarios = Arc::new(ScenarioStore::new(db.clone(), templates.clone()));
        let triggers = Arc::new(TriggerStore::new(db));

        Self {
            settings,
            triggers,
            scenarios,
            templates,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        }
    }

    /// Fill every cache from the database.
    pub async fn load(&self) -> Result<()> {
        self.templates.reload().await?;
        self.scenarios.reload().await?;
        self.triggers.reload().await?;

        info!(
            triggers = self.triggers.len().await,
            templates = self.templates.len().await,
            steps = self.scenarios.len().await,
            "Mock engine loaded"
        );
        Ok(())
    }

    pub fn triggers(&self) -> &TriggerStore {
        &self.triggers
    }

    pub fn scenarios(&self) -> &ScenarioStore {
        &self.scenarios
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            requests_total: self.total_requests(),
            requests_matched: self.total_matched(),
            requests_unmatched: self.total_unmatched(),
            triggers: self.triggers.len().await,
            templates: self.templates.len().await,
            scenario_steps: self.scenarios.len().await,
        }
    }

    /// Answer an inbound message.
    ///
    /// Fails with [`MockError::Unmatched`] when no trigger fires, or with the
    /// first error raised by a scenario step.
    pub async fn process_inbound_message(&self, message: &Message) -> Result<Message> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let Some(trigger_id) = self.triggers.evaluate(message).await else {
            self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
            if self.settings.log_unmatched {
                warn!(
                    body_len = message.body.len(),
                    headers = message.headers.len(),
                    "No matching trigger found"
                );
            }
            return Err(MockError::Unmatched);
        };

        self.requests_matched.fetch_add(1, Ordering::Relaxed);
        if self.settings.log_matches {
            debug!(trigger_id, "Message matched trigger");
        }

        self.scenarios.run(message, trigger_id).await
    }
}
