//! Scenarios: the ordered steps a trigger executes.
//!
//! Each trigger owns zero or more steps, run in ascending `order_number`
//! (ties by ascending id). A step either renders a template against the
//! running message or pauses the request.

use crate::db::Database;
use crate::error::{MockError, Result};
use crate::message::Message;
use crate::template::TemplateStore;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const INSERT_QUERY: &str = "INSERT INTO scenario_steps (order_number, value, trigger_id, step_type) VALUES (?1, ?2, ?3, ?4)";
const UPDATE_QUERY: &str = "UPDATE scenario_steps SET order_number = ?1, value = ?2, trigger_id = ?3, step_type = ?4 WHERE id = ?5";
const DELETE_QUERY: &str = "DELETE FROM scenario_steps WHERE id = ?1";
const SELECT_ALL_QUERY: &str =
    "SELECT id, order_number, value, trigger_id, step_type FROM scenario_steps";
const SELECT_BY_TRIGGER_QUERY: &str =
    "SELECT id, order_number, value, trigger_id, step_type FROM scenario_steps WHERE trigger_id = ?1";

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepKind {
    /// Replace the message with a rendered template; `value` is the template id
    TemplateProcessing,
    /// Sleep for `value` milliseconds
    Delay,
    /// Unrecognized kind, kept verbatim and skipped at run time
    Other(String),
}

impl StepKind {
    pub fn as_str(&self) -> &str {
        match self {
            StepKind::TemplateProcessing => "template_processing",
            StepKind::Delay => "delay",
            StepKind::Other(kind) => kind,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for StepKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "template_processing" => StepKind::TemplateProcessing,
            "delay" => StepKind::Delay,
            _ => StepKind::Other(value),
        }
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One step of a trigger's scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioStep {
    /// Unset (or negative) for steps not yet stored
    #[serde(default)]
    pub id: Option<i64>,

    #[serde(default)]
    pub order_number: i64,

    /// Template id or delay in milliseconds, depending on `step_type`
    #[serde(default)]
    pub value: i64,

    pub trigger_id: i64,

    pub step_type: StepKind,
}

impl ScenarioStep {
    pub fn new(trigger_id: i64, order_number: i64, step_type: StepKind, value: i64) -> Self {
        Self {
            id: None,
            order_number,
            value,
            trigger_id,
            step_type,
        }
    }

    /// Stored id, if the step has one.
    pub fn stored_id(&self) -> Option<i64> {
        self.id.filter(|id| *id >= 0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.step_type == StepKind::Delay && self.value < 0 {
            return Err(MockError::validation(format!(
                "delay must not be negative, got {} ms",
                self.value
            )));
        }
        Ok(())
    }

    fn sort_key(&self) -> (i64, i64) {
        (self.order_number, self.id.unwrap_or(i64::MAX))
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let step_type: String = row.get(4)?;
        Ok(Self {
            id: Some(row.get(0)?),
            order_number: row.get(1)?,
            value: row.get(2)?,
            trigger_id: row.get(3)?,
            step_type: step_type.into(),
        })
    }
}

fn sort_steps(steps: &mut [ScenarioStep]) {
    steps.sort_by_key(ScenarioStep::sort_key);
}

/// In-memory step cache, grouped by trigger, backed by the `scenario_steps` table.
pub struct ScenarioStore {
    db: Arc<Database>,
    templates: Arc<TemplateStore>,
    /// Per-trigger steps, always kept sorted
    steps: RwLock<HashMap<i64, Vec<ScenarioStep>>>,
    /// Held by writers and `reload` from the database round trip through the cache patch
    writes: Mutex<()>,
}

impl ScenarioStore {
    pub fn new(db: Arc<Database>, templates: Arc<TemplateStore>) -> Self {
        Self {
            db,
            templates,
            steps: RwLock::new(HashMap::new()),
            writes: Mutex::new(()),
        }
    }

    /// Copy of a trigger's steps in execution order; empty for unknown triggers.
    pub async fn get_ordered_steps(&self, trigger_id: i64) -> Vec<ScenarioStep> {
        let mut steps = self
            .steps
            .read()
            .await
            .get(&trigger_id)
            .cloned()
            .unwrap_or_default();
        sort_steps(&mut steps);
        steps
    }

    /// Number of cached steps across all triggers.
    pub async fn len(&self) -> usize {
        self.steps.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn add_step(&self, mut step: ScenarioStep) -> Result<ScenarioStep> {
        step.validate()?;
        let _writes = self.writes.lock().await;

        step.id = {
            let conn = self.db.conn();
            conn.execute(
                INSERT_QUERY,
                params![
                    step.order_number,
                    step.value,
                    step.trigger_id,
                    step.step_type.as_str()
                ],
            )?;
            Some(conn.last_insert_rowid())
        };

        {
            let mut cache = self.steps.write().await;
            let steps = cache.entry(step.trigger_id).or_default();
            steps.push(step.clone());
            sort_steps(steps);
        }
        info!(step_id = ?step.id, trigger_id = step.trigger_id, "Scenario step added");
        Ok(step)
    }

    pub async fn update_step(&self, step: ScenarioStep) -> Result<ScenarioStep> {
        step.validate()?;
        let id = step
            .stored_id()
            .ok_or_else(|| MockError::validation("step id is not specified"))?;
        let _writes = self.writes.lock().await;

        let changed = self.db.conn().execute(
            UPDATE_QUERY,
            params![
                step.order_number,
                step.value,
                step.trigger_id,
                step.step_type.as_str(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(MockError::not_found("scenario step", id));
        }

        let patched = {
            let mut cache = self.steps.write().await;
            let previous = cache.values_mut().find_map(|steps| {
                let idx = steps.iter().position(|s| s.id == Some(id))?;
                Some(steps.remove(idx))
            });
            if previous.is_some() {
                let steps = cache.entry(step.trigger_id).or_default();
                steps.push(step.clone());
                sort_steps(steps);
            }
            previous.is_some()
        };

        if !patched {
            warn!(step_id = id, "Updated step missing from cache, reloading");
            self.reload_locked().await?;
        }
        info!(step_id = id, trigger_id = step.trigger_id, "Scenario step updated");
        Ok(step)
    }

    pub async fn delete_step(&self, id: i64) -> Result<()> {
        let _writes = self.writes.lock().await;
        let changed = self.db.conn().execute(DELETE_QUERY, params![id])?;
        if changed == 0 {
            return Err(MockError::not_found("scenario step", id));
        }

        let removed = {
            let mut cache = self.steps.write().await;
            cache.values_mut().any(|steps| {
                let before = steps.len();
                steps.retain(|s| s.id != Some(id));
                steps.len() != before
            })
        };
        if !removed {
            self.reload_locked().await?;
        }
        info!(step_id = id, "Scenario step deleted");
        Ok(())
    }

    /// Insert new steps and update stored ones for a trigger in one transaction.
    ///
    /// Stored steps may come from another trigger; they are moved to this one.
    /// On failure nothing is written and the cache is left as it was.
    pub async fn replace_steps_for_trigger(
        &self,
        steps: Vec<ScenarioStep>,
        trigger_id: i64,
    ) -> Result<Vec<ScenarioStep>> {
        for step in &steps {
            step.validate()?;
            if step.trigger_id != trigger_id {
                return Err(MockError::validation(format!(
                    "step belongs to trigger {} instead of {}",
                    step.trigger_id, trigger_id
                )));
            }
        }

        let _writes = self.writes.lock().await;
        let mut fresh = {
            let mut conn = self.db.conn();
            let tx = conn.transaction()?;
            {
                let mut insert = tx.prepare(INSERT_QUERY)?;
                let mut update = tx.prepare(UPDATE_QUERY)?;
                for step in &steps {
                    let kind = step.step_type.as_str();
                    match step.stored_id() {
                        None => {
                            insert.execute(params![
                                step.order_number,
                                step.value,
                                step.trigger_id,
                                kind
                            ])?;
                        }
                        Some(id) => {
                            let changed = update.execute(params![
                                step.order_number,
                                step.value,
                                step.trigger_id,
                                kind,
                                id
                            ])?;
                            if changed == 0 {
                                // Dropping `tx` rolls back
                                return Err(MockError::not_found("scenario step", id));
                            }
                        }
                    }
                }
            }
            tx.commit()?;

            let mut stmt = conn.prepare(SELECT_BY_TRIGGER_QUERY)?;
            let rows = stmt
                .query_map(params![trigger_id], ScenarioStep::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        sort_steps(&mut fresh);
        {
            let mut cache = self.steps.write().await;
            // Steps moved from other triggers must leave their old entries
            for (owner, cached) in cache.iter_mut() {
                if *owner != trigger_id {
                    cached.retain(|s| !fresh.iter().any(|f| f.id == s.id));
                }
            }
            cache.insert(trigger_id, fresh.clone());
        }
        info!(trigger_id, steps = fresh.len(), "Scenario replaced");
        Ok(fresh)
    }

    /// Rebuild the cache from the database.
    pub async fn reload(&self) -> Result<()> {
        let _writes = self.writes.lock().await;
        self.reload_locked().await
    }

    /// [`reload`](Self::reload) for callers already holding the write gate.
    async fn reload_locked(&self) -> Result<()> {
        let rows = {
            let conn = self.db.conn();
            let mut stmt = conn.prepare(SELECT_ALL_QUERY)?;
            let rows = stmt
                .query_map([], ScenarioStep::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let count = rows.len();
        let mut steps: HashMap<i64, Vec<ScenarioStep>> = HashMap::new();
        for step in rows {
            steps.entry(step.trigger_id).or_default().push(step);
        }
        steps.values_mut().for_each(|s| sort_steps(s));

        *self.steps.write().await = steps;
        info!(steps = count, "Scenario steps loaded");
        Ok(())
    }

    /// Execute a trigger's scenario against a message.
    ///
    /// A trigger without steps yields an empty message, not the input.
    pub async fn run(&self, message: &Message, trigger_id: i64) -> Result<Message> {
        let steps = self.get_ordered_steps(trigger_id).await;
        if steps.is_empty() {
            debug!(trigger_id, "Trigger has no scenario steps");
            return Ok(Message::default());
        }

        let mut current = message.clone();
        for (i, step) in steps.iter().enumerate() {
            debug!(trigger_id, step = i, kind = %step.step_type, value = step.value, "Executing step");
            match step.step_type {
                StepKind::TemplateProcessing => {
                    current = self.templates.render(step.value, &current).await?;
                }
                StepKind::Delay => {
                    let millis = u64::try_from(step.value).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
                StepKind::Other(_) => {}
            }
        }

        Ok(current)
    }
}
