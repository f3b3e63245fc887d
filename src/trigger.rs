//! Triggers decide which scenario runs for an inbound message.
//!
//! The [`TriggerStore`] keeps every trigger, prepared and ready for matching,
//! in an in-memory cache that mirrors the `triggers` table.

use crate::db::{decode_headers, encode_headers, Database};
use crate::error::{MockError, Result};
use crate::matcher::{matches_headers, CompiledExpression};
use crate::message::Message;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

const CONTENT_TYPE: &str = "Content-Type";
const CONTENT_TYPE_JSON: &str = "application/json";

const INSERT_QUERY: &str = "INSERT INTO triggers (type, expression, description, active, headers, subsystem) VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
const UPDATE_QUERY: &str = "UPDATE triggers SET type = ?1, expression = ?2, description = ?3, active = ?4, headers = ?5, subsystem = ?6 WHERE id = ?7";
const DELETE_QUERY: &str = "DELETE FROM triggers WHERE id = ?1";
const SELECT_ALL_QUERY: &str = "SELECT id, type, expression, description, active, headers, subsystem FROM triggers";

/// Matching strategy of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TriggerKind {
    /// Regular expression over the body
    Regex,
    /// JSON path must exist in the body
    JsonExists,
    /// JSONPath expression must evaluate to `true`
    JsonPathBoolean,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Regex => "regex",
            TriggerKind::JsonExists => "gson",
            TriggerKind::JsonPathBoolean => "jsonpath",
        }
    }

    fn is_json(&self) -> bool {
        matches!(self, TriggerKind::JsonExists | TriggerKind::JsonPathBoolean)
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = MockError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "regex" => Ok(TriggerKind::Regex),
            "gson" => Ok(TriggerKind::JsonExists),
            "jsonpath" => Ok(TriggerKind::JsonPathBoolean),
            "" => Err(MockError::validation("trigger type is not specified")),
            other => Err(MockError::validation(format!("unknown trigger type '{}'", other))),
        }
    }
}

impl TryFrom<String> for TriggerKind {
    type Error = MockError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TriggerKind> for String {
    fn from(kind: TriggerKind) -> Self {
        kind.as_str().to_string()
    }
}

/// A persisted match rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub id: i64,

    #[serde(rename = "type")]
    pub kind: TriggerKind,

    #[serde(default)]
    pub expression: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub is_active: bool,

    /// Expected header values
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub subsystem: String,

    /// Derived from `kind` and `expression` by [`Trigger::prepare`]
    #[serde(skip)]
    compiled: Option<Arc<CompiledExpression>>,
}

impl Trigger {
    pub fn new(kind: TriggerKind, expression: impl Into<String>) -> Self {
        Self {
            id: 0,
            kind,
            expression: expression.into(),
            description: String::new(),
            is_active: true,
            headers: BTreeMap::new(),
            subsystem: String::new(),
            compiled: None,
        }
    }

    /// Builder-style expected header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.expression.trim().is_empty() {
            return Err(MockError::validation("trigger expression cannot be empty"));
        }
        Ok(())
    }

    /// Compile the expression and default the JSON content type header.
    pub fn prepare(&mut self) -> Result<()> {
        self.validate()?;

        let compiled = match self.kind {
            TriggerKind::Regex => CompiledExpression::regex(&self.expression),
            TriggerKind::JsonExists => CompiledExpression::json_exists(&self.expression),
            TriggerKind::JsonPathBoolean => CompiledExpression::json_path_boolean(&self.expression),
        }
        .map_err(MockError::Validation)?;

        if self.kind.is_json() {
            self.headers
                .entry(CONTENT_TYPE.to_string())
                .or_insert_with(|| CONTENT_TYPE_JSON.to_string());
        }

        self.compiled = Some(Arc::new(compiled));
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.compiled.is_some()
    }

    /// Whether this trigger fires for the message.
    pub fn fires_on(&self, message: &Message) -> bool {
        if !self.is_active || !matches_headers(&self.headers, message) {
            return false;
        }
        self.compiled
            .as_ref()
            .map(|compiled| compiled.matches(&message.body))
            .unwrap_or(false)
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Self, String)> {
        let kind: String = row.get(1)?;
        let headers: String = row.get(5)?;
        let trigger = Self {
            id: row.get(0)?,
            // Unknown types surface when the row is prepared
            kind: TriggerKind::Regex,
            expression: row.get(2)?,
            description: row.get(3)?,
            is_active: row.get(4)?,
            headers: decode_headers(&headers),
            subsystem: row.get(6)?,
            compiled: None,
        };
        Ok((trigger, kind))
    }
}

/// In-memory trigger cache backed by the `triggers` table.
pub struct TriggerStore {
    db: Arc<Database>,
    /// Keyed by id; iteration order is the dispatch order.
    triggers: RwLock<BTreeMap<i64, Arc<Trigger>>>,
    /// Held by writers and `reload` from the database round trip through the cache patch
    writes: Mutex<()>,
}

impl TriggerStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            triggers: RwLock::new(BTreeMap::new()),
            writes: Mutex::new(()),
        }
    }

    pub async fn list_all(&self) -> Vec<Trigger> {
        self.triggers
            .read()
            .await
            .values()
            .map(|t| Trigger::clone(t))
            .collect()
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Trigger> {
        self.triggers
            .read()
            .await
            .get(&id)
            .map(|t| Trigger::clone(t))
            .ok_or_else(|| MockError::not_found("trigger", id))
    }

    pub async fn len(&self) -> usize {
        self.triggers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Validate, persist and cache a new trigger. Returns it prepared, with its id.
    pub async fn add_trigger(&self, trigger: Trigger) -> Result<Trigger> {
        let mut prepared = trigger.clone();
        prepared.prepare()?;

        let headers = encode_headers(&trigger.headers)?;
        let _writes = self.writes.lock().await;
        let id = {
            let conn = self.db.conn();
            conn.execute(
                INSERT_QUERY,
                params![
                    trigger.kind.as_str(),
                    trigger.expression,
                    trigger.description,
                    trigger.is_active,
                    headers,
                    trigger.subsystem
                ],
            )?;
            conn.last_insert_rowid()
        };
        prepared.id = id;

        self.triggers
            .write()
            .await
            .insert(id, Arc::new(prepared.clone()));
        info!(trigger_id = id, kind = %prepared.kind, "Trigger added");
        Ok(prepared)
    }

    pub async fn update_trigger(&self, trigger: Trigger) -> Result<Trigger> {
        let mut prepared = trigger.clone();
        prepared.prepare()?;

        let headers = encode_headers(&trigger.headers)?;
        let _writes = self.writes.lock().await;
        let changed = self.db.conn().execute(
            UPDATE_QUERY,
            params![
                trigger.kind.as_str(),
                trigger.expression,
                trigger.description,
                trigger.is_active,
                headers,
                trigger.subsystem,
                trigger.id
            ],
        )?;
        if changed == 0 {
            return Err(MockError::not_found("trigger", trigger.id));
        }

        self.triggers
            .write()
            .await
            .insert(trigger.id, Arc::new(prepared.clone()));
        info!(trigger_id = trigger.id, "Trigger updated");
        Ok(prepared)
    }

    pub async fn delete_trigger(&self, id: i64) -> Result<()> {
        let _writes = self.writes.lock().await;
        let changed = self.db.conn().execute(DELETE_QUERY, params![id])?;
        if changed == 0 {
            return Err(MockError::not_found("trigger", id));
        }

        self.triggers.write().await.remove(&id);
        info!(trigger_id = id, "Trigger deleted");
        Ok(())
    }

    /// Rebuild the cache from the database.
    pub async fn reload(&self) -> Result<()> {
        let _writes = self.writes.lock().await;
        let rows = {
            let conn = self.db.conn();
            let mut stmt = conn.prepare(SELECT_ALL_QUERY)?;
            let rows = stmt
                .query_map([], Trigger::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut triggers = BTreeMap::new();
        for (mut trigger, kind) in rows {
            trigger.kind = kind.parse()?;
            trigger.prepare()?;
            triggers.insert(trigger.id, Arc::new(trigger));
        }

        let count = triggers.len();
        *self.triggers.write().await = triggers;
        info!(triggers = count, "Triggers loaded");
        Ok(())
    }

    /// Id of the first trigger, in ascending id order, that fires for the message.
    pub async fn evaluate(&self, message: &Message) -> Option<i64> {
        let triggers = self.triggers.read().await;
        let found = triggers
            .values()
            .find(|trigger| trigger.fires_on(message))
            .map(|trigger| trigger.id);

        if let Some(id) = found {
            debug!(trigger_id = id, "Trigger selected");
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TriggerStore {
        TriggerStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn test_parse_trigger_json() {
        let json = serde_json::json!({
            "type": "regex",
            "expression": "^ERR",
            "description": "errors",
            "is_active": true,
            "headers": {"X-System": "billing"},
            "subsystem": "billing"
        });
        let trigger: Trigger = serde_json::from_value(json).unwrap();

        assert_eq!(trigger.kind, TriggerKind::Regex);
        assert_eq!(trigger.headers["X-System"], "billing");
        assert!(!trigger.is_prepared());

        let back = serde_json::to_value(&trigger).unwrap();
        assert_eq!(back["type"], "regex");
    }

    #[test]
    fn test_empty_or_unknown_type_rejected() {
        let err = serde_json::from_value::<Trigger>(serde_json::json!({"type": "", "expression": "x"}))
            .unwrap_err();
        assert!(err.to_string().contains("not specified"));

        assert!("xml".parse::<TriggerKind>().is_err());
        assert_eq!("gson".parse::<TriggerKind>().unwrap(), TriggerKind::JsonExists);
        assert_eq!(
            "jsonpath".parse::<TriggerKind>().unwrap(),
            TriggerKind::JsonPathBoolean
        );
    }

    #[test]
    fn test_prepare_defaults_json_content_type() {
        let mut trigger = Trigger::new(TriggerKind::JsonExists, "user.id");
        trigger.prepare().unwrap();
        assert_eq!(trigger.headers[CONTENT_TYPE], CONTENT_TYPE_JSON);

        let mut explicit = Trigger::new(TriggerKind::JsonPathBoolean, "$.ok")
            .with_header(CONTENT_TYPE, "application/vnd.api+json");
        explicit.prepare().unwrap();
        assert_eq!(explicit.headers[CONTENT_TYPE], "application/vnd.api+json");

        let mut regex = Trigger::new(TriggerKind::Regex, "x");
        regex.prepare().unwrap();
        assert!(regex.headers.is_empty());
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let store = store();
        let added = store
            .add_trigger(Trigger::new(TriggerKind::Regex, "^ERR"))
            .await
            .unwrap();

        assert!(added.id > 0);
        let fetched = store.get_by_id(added.id).await.unwrap();
        assert_eq!(fetched.expression, "^ERR");
        assert_eq!(store.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let store = store();
        assert!(matches!(
            store.get_by_id(42).await,
            Err(MockError::NotFound { id: 42, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_expression_leaves_store_untouched() {
        let store = store();
        let err = store
            .add_trigger(Trigger::new(TriggerKind::Regex, "(unclosed"))
            .await
            .unwrap_err();
        assert!(matches!(err, MockError::Validation(_)));

        let err = store
            .add_trigger(Trigger::new(TriggerKind::Regex, "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, MockError::Validation(_)));

        assert!(store.is_empty().await);
        store.reload().await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_evaluate_regex() {
        let store = store();
        let trigger = store
            .add_trigger(Trigger::new(TriggerKind::Regex, "^ERR"))
            .await
            .unwrap();

        assert_eq!(
            store.evaluate(&Message::new("ERR: disk full")).await,
            Some(trigger.id)
        );
        assert_eq!(store.evaluate(&Message::new("ok ERR")).await, None);
    }

    #[tokio::test]
    async fn test_inactive_never_selected() {
        let store = store();
        let mut trigger = Trigger::new(TriggerKind::Regex, ".*");
        trigger.is_active = false;
        store.add_trigger(trigger).await.unwrap();

        assert_eq!(store.evaluate(&Message::new("anything")).await, None);
    }

    #[tokio::test]
    async fn test_header_semicolon_matching() {
        let store = store();
        let trigger = store
            .add_trigger(Trigger::new(TriggerKind::Regex, "ping").with_header("X-Tags", "b"))
            .await
            .unwrap();

        let msg = Message::new("ping").with_header("X-Tags", "a; b;c");
        assert_eq!(store.evaluate(&msg).await, Some(trigger.id));

        let msg = Message::new("ping").with_header("X-Tags", "a;c");
        assert_eq!(store.evaluate(&msg).await, None);
    }

    #[tokio::test]
    async fn test_json_triggers_require_content_type() {
        let store = store();
        let trigger = store
            .add_trigger(Trigger::new(TriggerKind::JsonPathBoolean, "$.ok"))
            .await
            .unwrap();

        let body = r#"{"ok": true}"#;
        assert_eq!(store.evaluate(&Message::new(body)).await, None);

        let msg = Message::new(body).with_header(CONTENT_TYPE, "application/json; charset=utf-8");
        assert_eq!(store.evaluate(&msg).await, Some(trigger.id));
    }

    #[tokio::test]
    async fn test_first_match_in_id_order() {
        let store = store();
        let first = store
            .add_trigger(Trigger::new(TriggerKind::Regex, "order"))
            .await
            .unwrap();
        store
            .add_trigger(Trigger::new(TriggerKind::Regex, "order-\\d+"))
            .await
            .unwrap();

        for _ in 0..5 {
            assert_eq!(
                store.evaluate(&Message::new("order-17")).await,
                Some(first.id)
            );
        }
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = store();
        let mut trigger = store
            .add_trigger(Trigger::new(TriggerKind::Regex, "old"))
            .await
            .unwrap();

        trigger.expression = "new".to_string();
        store.update_trigger(trigger.clone()).await.unwrap();
        assert_eq!(store.evaluate(&Message::new("old")).await, None);
        assert_eq!(store.evaluate(&Message::new("new")).await, Some(trigger.id));

        store.delete_trigger(trigger.id).await.unwrap();
        assert_eq!(store.evaluate(&Message::new("new")).await, None);
        assert!(matches!(
            store.delete_trigger(trigger.id).await,
            Err(MockError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let store = store();
        let mut trigger = Trigger::new(TriggerKind::Regex, "x");
        trigger.id = 99;
        assert!(matches!(
            store.update_trigger(trigger).await,
            Err(MockError::NotFound { id: 99, .. })
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_with_invalid_expression_keeps_previous() {
        let store = store();
        let mut trigger = store
            .add_trigger(Trigger::new(TriggerKind::Regex, "keep"))
            .await
            .unwrap();

        trigger.expression = "[".to_string();
        assert!(store.update_trigger(trigger.clone()).await.is_err());

        store.reload().await.unwrap();
        assert_eq!(store.get_by_id(trigger.id).await.unwrap().expression, "keep");
    }

    #[tokio::test]
    async fn test_reload_rebuilds_prepared_cache() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = TriggerStore::new(db.clone());
        let added = store
            .add_trigger(
                Trigger::new(TriggerKind::JsonExists, "user.id").with_header("X-Env", "a=b, c"),
            )
            .await
            .unwrap();

        let fresh = TriggerStore::new(db);
        fresh.reload().await.unwrap();

        let loaded = fresh.get_by_id(added.id).await.unwrap();
        assert!(loaded.is_prepared());
        assert_eq!(loaded.kind, TriggerKind::JsonExists);
        assert_eq!(loaded.headers["X-Env"], "a=b, c");
        assert_eq!(loaded.headers[CONTENT_TYPE], CONTENT_TYPE_JSON);
    }

    #[tokio::test]
    async fn test_reload_reads_legacy_header_rows() {
        let db = Arc::new(Database::in_memory().unwrap());
        db.conn()
            .execute(
                "INSERT INTO triggers (type, expression, description, active, headers, subsystem) \
                 VALUES ('regex', 'hello', '', 1, 'X-Mode=test, X-Team=core, ', '')",
                [],
            )
            .unwrap();

        let store = TriggerStore::new(db);
        store.reload().await.unwrap();

        let msg = Message::new("hello")
            .with_header("X-Mode", "test")
            .with_header("X-Team", "core");
        assert!(store.evaluate(&msg).await.is_some());
        assert!(store.evaluate(&Message::new("hello")).await.is_none());
    }

    #[tokio::test]
    async fn test_reload_rejects_unknown_type_rows() {
        let db = Arc::new(Database::in_memory().unwrap());
        db.conn()
            .execute(
                "INSERT INTO triggers (type, expression, active, headers) VALUES ('xml', 'x', 1, '')",
                [],
            )
            .unwrap();

        let store = TriggerStore::new(db);
        assert!(matches!(
            store.reload().await,
            Err(MockError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_evaluation_during_writes() {
        let store = Arc::new(store());
        store
            .add_trigger(Trigger::new(TriggerKind::Regex, "^hit"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                if i % 8 == 0 {
                    store.reload().await.unwrap();
                }
                store.evaluate(&Message::new("hit me")).await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }
    }

    fn snapshot(triggers: Vec<Trigger>) -> Vec<(i64, String)> {
        triggers.into_iter().map(|t| (t.id, t.expression)).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_survive_reloads() {
        let store = Arc::new(store());

        let mut handles = Vec::new();
        for i in 0..40 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    store
                        .add_trigger(Trigger::new(TriggerKind::Regex, format!("t{i}")))
                        .await
                        .map(|_| ())
                } else {
                    store.reload().await
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let cached = snapshot(store.list_all().await);
        assert_eq!(cached.len(), 20);
        store.reload().await.unwrap();
        assert_eq!(snapshot(store.list_all().await), cached);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_update_racing_delete_does_not_resurrect() {
        let store = Arc::new(store());

        for _ in 0..20 {
            let mut trigger = store
                .add_trigger(Trigger::new(TriggerKind::Regex, "before"))
                .await
                .unwrap();
            trigger.expression = "after".to_string();
            let id = trigger.id;

            let updater = {
                let store = store.clone();
                tokio::spawn(async move { store.update_trigger(trigger).await.map(|_| ()) })
            };
            let deleter = {
                let store = store.clone();
                tokio::spawn(async move { store.delete_trigger(id).await })
            };

            // The update may lose the race and find nothing to update
            let _ = updater.await.unwrap();
            deleter.await.unwrap().unwrap();
            assert!(store.is_empty().await);
        }

        store.reload().await.unwrap();
        assert!(store.is_empty().await);
    }
}
