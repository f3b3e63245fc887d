//! Response templates with numbered placeholders.
//!
//! A template body contains `${N}` placeholders. Rendering resolves each one
//! through the extractor bound to `N`, leaving it verbatim when there is no
//! extractor or the message carries no value. Header bindings then copy
//! values from the inbound message into headers of the rendered message.

use crate::db::{json_column_error, Database};
use crate::error::{MockError, Result};
use crate::extract::{Extractor, ExtractorSpec, HeaderUpdater, Updater};
use crate::message::Message;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

const INSERT_QUERY: &str =
    "INSERT INTO templates (name, body, subsystem, bindings) VALUES (?1, ?2, ?3, ?4)";
const UPDATE_QUERY: &str =
    "UPDATE templates SET name = ?1, body = ?2, subsystem = ?3, bindings = ?4 WHERE id = ?5";
const DELETE_QUERY: &str = "DELETE FROM templates WHERE id = ?1";
const SELECT_ALL_QUERY: &str = "SELECT id, name, body, subsystem, bindings FROM templates";

/// A persisted response template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub id: i64,

    pub name: String,

    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub subsystem: String,

    #[serde(default)]
    pub bindings: TemplateBindings,
}

/// Extractor table and updater chain of a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateBindings {
    /// Extractor for each placeholder number
    #[serde(default)]
    pub placeholders: BTreeMap<u32, ExtractorSpec>,

    /// Headers written into the rendered message
    #[serde(default)]
    pub headers: Vec<HeaderBinding>,
}

/// Copy an extracted value into an output header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderBinding {
    /// Output header name
    pub header: String,
    pub source: ExtractorSpec,
}

/// Template listing entry without the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateSummary {
    pub id: i64,
    pub name: String,
    pub subsystem: String,
}

impl Template {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            body: body.into(),
            subsystem: String::new(),
            bindings: TemplateBindings::default(),
        }
    }

    /// Builder-style placeholder binding to a request header.
    pub fn with_header_placeholder(mut self, index: u32, header: impl Into<String>) -> Self {
        self.bindings
            .placeholders
            .insert(index, ExtractorSpec::Header { name: header.into() });
        self
    }

    /// Builder-style output header copied from a request header.
    pub fn with_header_binding(mut self, header: impl Into<String>, source: impl Into<String>) -> Self {
        self.bindings.headers.push(HeaderBinding {
            header: header.into(),
            source: ExtractorSpec::Header { name: source.into() },
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MockError::validation("template name is not specified"));
        }
        for spec in self.bindings.placeholders.values() {
            spec.validate().map_err(MockError::Validation)?;
        }
        for binding in &self.bindings.headers {
            if binding.header.is_empty() {
                return Err(MockError::validation("header binding requires a header name"));
            }
            binding.source.validate().map_err(MockError::Validation)?;
        }
        Ok(())
    }

    fn summary(&self) -> TemplateSummary {
        TemplateSummary {
            id: self.id,
            name: self.name.clone(),
            subsystem: self.subsystem.clone(),
        }
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let bindings: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            body: row.get(2)?,
            subsystem: row.get(3)?,
            bindings: serde_json::from_str(&bindings).map_err(|e| json_column_error(4, e))?,
        })
    }
}

/// Piece of a parsed template body.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(u32),
}

/// Split a body into literals and `${N}` placeholders.
///
/// Anything that looks like a placeholder but is not `$` `{` digits `}` is literal text.
fn parse_segments(body: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut rest = body;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let digits = after.len() - after.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let index = (digits > 0 && after[digits..].starts_with('}'))
            .then(|| after[..digits].parse::<u32>().ok())
            .flatten();

        match index {
            Some(index) => {
                current.push_str(&rest[..start]);
                if !current.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut current)));
                }
                segments.push(Segment::Placeholder(index));
                rest = &after[digits + 1..];
            }
            None => {
                current.push_str(&rest[..start + 2]);
                rest = after;
            }
        }
    }

    current.push_str(rest);
    if !current.is_empty() {
        segments.push(Segment::Literal(current));
    }

    segments
}

/// A template admitted to the cache, with its body parsed and bindings built.
#[derive(Debug)]
struct CompiledTemplate {
    template: Template,
    segments: Vec<Segment>,
    extractors: HashMap<u32, Box<dyn Extractor>>,
    updaters: Vec<(Box<dyn Extractor>, Box<dyn Updater>)>,
}

impl CompiledTemplate {
    fn compile(template: Template) -> Self {
        let segments = parse_segments(&template.body);
        let extractors = template
            .bindings
            .placeholders
            .iter()
            .map(|(index, spec)| (*index, spec.build()))
            .collect();
        let updaters = template
            .bindings
            .headers
            .iter()
            .map(|binding| {
                let updater: Box<dyn Updater> = Box::new(HeaderUpdater::new(binding.header.clone()));
                (binding.source.build(), updater)
            })
            .collect();

        Self {
            template,
            segments,
            extractors,
            updaters,
        }
    }

    fn render(&self, input: &Message) -> Message {
        let mut body = String::with_capacity(self.template.body.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => body.push_str(text),
                Segment::Placeholder(index) => {
                    match self.extractors.get(index).and_then(|e| e.extract(input)) {
                        Some(value) => body.push_str(&value),
                        None => {
                            body.push_str("${");
                            body.push_str(&index.to_string());
                            body.push('}');
                        }
                    }
                }
            }
        }

        let mut output = Message::new(body);
        for (extractor, updater) in &self.updaters {
            if let Some(value) = extractor.extract(input) {
                updater.update(&mut output, value);
            }
        }
        output
    }
}

/// In-memory template cache backed by the `templates` table.
pub struct TemplateStore {
    db: Arc<Database>,
    templates: RwLock<HashMap<i64, Arc<CompiledTemplate>>>,
    /// Held by writers and `reload` from the database round trip through the cache patch
    writes: Mutex<()>,
}

impl TemplateStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            templates: RwLock::new(HashMap::new()),
            writes: Mutex::new(()),
        }
    }

    /// All templates, ordered by id.
    pub async fn list_all(&self) -> Vec<Template> {
        let mut templates: Vec<Template> = self
            .templates
            .read()
            .await
            .values()
            .map(|t| t.template.clone())
            .collect();
        templates.sort_by_key(|t| t.id);
        templates
    }

    /// Id, name and subsystem of every template, ordered by id.
    pub async fn list_summaries(&self) -> Vec<TemplateSummary> {
        let mut summaries: Vec<TemplateSummary> = self
            .templates
            .read()
            .await
            .values()
            .map(|t| t.template.summary())
            .collect();
        summaries.sort_by_key(|t| t.id);
        summaries
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Template> {
        self.templates
            .read()
            .await
            .get(&id)
            .map(|t| t.template.clone())
            .ok_or_else(|| MockError::not_found("template", id))
    }

    pub async fn len(&self) -> usize {
        self.templates.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn add_template(&self, mut template: Template) -> Result<Template> {
        template.validate()?;
        let bindings = encode_bindings(&template.bindings)?;
        let _writes = self.writes.lock().await;

        template.id = {
            let conn = self.db.conn();
            conn.execute(
                INSERT_QUERY,
                params![template.name, template.body, template.subsystem, bindings],
            )?;
            conn.last_insert_rowid()
        };

        let compiled = Arc::new(CompiledTemplate::compile(template.clone()));
        self.templates.write().await.insert(template.id, compiled);
        info!(template_id = template.id, name = %template.name, "Template added");
        Ok(template)
    }

    pub async fn update_template(&self, template: Template) -> Result<Template> {
        template.validate()?;
        let bindings = encode_bindings(&template.bindings)?;
        let _writes = self.writes.lock().await;

        let changed = self.db.conn().execute(
            UPDATE_QUERY,
            params![
                template.name,
                template.body,
                template.subsystem,
                bindings,
                template.id
            ],
        )?;
        if changed == 0 {
            return Err(MockError::not_found("template", template.id));
        }

        let compiled = Arc::new(CompiledTemplate::compile(template.clone()));
        self.templates.write().await.insert(template.id, compiled);
        info!(template_id = template.id, "Template updated");
        Ok(template)
    }

    pub async fn delete_template(&self, id: i64) -> Result<()> {
        let _writes = self.writes.lock().await;
        let changed = self.db.conn().execute(DELETE_QUERY, params![id])?;
        if changed == 0 {
            return Err(MockError::not_found("template", id));
        }

        self.templates.write().await.remove(&id);
        info!(template_id = id, "Template deleted");
        Ok(())
    }

    /// Rebuild the cache from the database.
    pub async fn reload(&self) -> Result<()> {
        let _writes = self.writes.lock().await;
        let rows = {
            let conn = self.db.conn();
            let mut stmt = conn.prepare(SELECT_ALL_QUERY)?;
            let rows = stmt
                .query_map([], Template::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let templates: HashMap<_, _> = rows
            .into_iter()
            .map(|t| (t.id, Arc::new(CompiledTemplate::compile(t))))
            .collect();

        let count = templates.len();
        *self.templates.write().await = templates;
        info!(templates = count, "Templates loaded");
        Ok(())
    }

    /// Render a template against a message.
    pub async fn render(&self, id: i64, message: &Message) -> Result<Message> {
        let compiled = self
            .templates
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| MockError::not_found("template", id))?;

        debug!(template_id = id, "Rendering template");
        Ok(compiled.render(message))
    }
}

fn encode_bindings(bindings: &TemplateBindings) -> Result<String> {
    serde_json::to_string(bindings)
        .map_err(|e| MockError::Persistence(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TemplateStore {
        TemplateStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn test_parse_segments() {
        assert_eq!(
            parse_segments("Hello ${0}, you owe ${12}!"),
            vec![
                Segment::Literal("Hello ".to_string()),
                Segment::Placeholder(0),
                Segment::Literal(", you owe ".to_string()),
                Segment::Placeholder(12),
                Segment::Literal("!".to_string()),
            ]
        );
        assert_eq!(parse_segments(""), vec![]);
        assert_eq!(
            parse_segments("${name} ${} ${1"),
            vec![Segment::Literal("${name} ${} ${1".to_string())]
        );
        assert_eq!(
            parse_segments("$${3}"),
            vec![Segment::Literal("$".to_string()), Segment::Placeholder(3)]
        );
    }

    #[tokio::test]
    async fn test_render_header_placeholder() {
        let store = store();
        let template = store
            .add_template(Template::new("greeting", "Hello ${0}").with_header_placeholder(0, "X-Name"))
            .await
            .unwrap();

        let input = Message::new("").with_header("X-Name", "Ann");
        let output = store.render(template.id, &input).await.unwrap();

        assert_eq!(output.body, "Hello Ann");
        assert!(output.headers.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_placeholders_left_verbatim() {
        let store = store();
        let template = store
            .add_template(
                Template::new("partial", "${0}-${1}-${2}").with_header_placeholder(1, "X-Missing"),
            )
            .await
            .unwrap();

        let output = store
            .render(template.id, &Message::new("ignored"))
            .await
            .unwrap();
        assert_eq!(output.body, "${0}-${1}-${2}");
    }

    #[tokio::test]
    async fn test_render_is_idempotent() {
        let store = store();
        let template = store
            .add_template(
                Template::new("twice", "id=${0}")
                    .with_header_placeholder(0, "X-Id")
                    .with_header_binding("X-Echo", "X-Id"),
            )
            .await
            .unwrap();

        let input = Message::new("body").with_header("X-Id", "7");
        let first = store.render(template.id, &input).await.unwrap();
        let second = store.render(template.id, &input).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(input, Message::new("body").with_header("X-Id", "7"));
    }

    #[tokio::test]
    async fn test_header_bindings_after_substitution() {
        let store = store();
        let template = store
            .add_template(
                Template::new("echo", "{\"id\": \"${0}\"}")
                    .with_header_placeholder(0, "X-Request-Id")
                    .with_header_binding("X-Correlation-Id", "X-Request-Id")
                    .with_header_binding("X-Absent", "X-Nope"),
            )
            .await
            .unwrap();

        let input = Message::new("").with_header("X-Request-Id", "r-1");
        let output = store.render(template.id, &input).await.unwrap();

        assert_eq!(output.body, r#"{"id": "r-1"}"#);
        assert_eq!(output.header("X-Correlation-Id"), Some("r-1"));
        assert_eq!(output.headers.len(), 1);
    }

    #[tokio::test]
    async fn test_render_unknown_template() {
        let store = store();
        assert!(matches!(
            store.render(5, &Message::default()).await,
            Err(MockError::NotFound { id: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_name_is_validation_failure() {
        let store = store();
        store.add_template(Template::new("keep", "x")).await.unwrap();

        let err = store.add_template(Template::new("", "body")).await.unwrap_err();
        assert!(matches!(err, MockError::Validation(_)));
        assert_eq!(store.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let store = store();
        store.add_template(Template::new("same", "a")).await.unwrap();

        let err = store.add_template(Template::new("same", "b")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_summaries_omit_body() {
        let store = store();
        let mut template = Template::new("big", "x".repeat(1024));
        template.subsystem = "billing".to_string();
        let added = store.add_template(template).await.unwrap();

        let summaries = store.list_summaries().await;
        assert_eq!(
            summaries,
            vec![TemplateSummary {
                id: added.id,
                name: "big".to_string(),
                subsystem: "billing".to_string(),
            }]
        );
        let json = serde_json::to_value(&summaries[0]).unwrap();
        assert!(json.get("body").is_none());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = store();
        let mut template = store.add_template(Template::new("t", "v1")).await.unwrap();

        template.body = "v2".to_string();
        store.update_template(template.clone()).await.unwrap();
        let output = store.render(template.id, &Message::default()).await.unwrap();
        assert_eq!(output.body, "v2");

        template.name = String::new();
        assert!(matches!(
            store.update_template(template.clone()).await,
            Err(MockError::Validation(_))
        ));
        assert_eq!(store.get_by_id(template.id).await.unwrap().name, "t");

        store.delete_template(template.id).await.unwrap();
        assert!(store.is_empty().await);
        assert!(matches!(
            store.delete_template(template.id).await,
            Err(MockError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reload_restores_bindings() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = TemplateStore::new(db.clone());
        let added = store
            .add_template(Template::new("persisted", "Hi ${0}").with_header_placeholder(0, "X-Who"))
            .await
            .unwrap();

        let fresh = TemplateStore::new(db);
        fresh.reload().await.unwrap();
        assert_eq!(fresh.get_by_id(added.id).await.unwrap(), added);

        let output = fresh
            .render(added.id, &Message::new("").with_header("X-Who", "Bo"))
            .await
            .unwrap();
        assert_eq!(output.body, "Hi Bo");
    }

    #[test]
    fn test_template_json_shape() {
        let json = serde_json::json!({
            "name": "order",
            "body": "Order ${0}",
            "bindings": {
                "placeholders": {"0": {"type": "header", "name": "X-Order"}},
                "headers": [{"header": "X-Order", "source": {"type": "header", "name": "X-Order"}}]
            }
        });
        let template: Template = serde_json::from_value(json).unwrap();

        assert_eq!(template.id, 0);
        assert_eq!(template.subsystem, "");
        assert_eq!(template.bindings.placeholders.len(), 1);
        assert_eq!(template.bindings.headers[0].header, "X-Order");
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
                        .add_template(Template::new(format!("t{i}"), "body"))
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

        let cached = store.list_all().await;
        assert_eq!(cached.len(), 20);
        store.reload().await.unwrap();
        assert_eq!(store.list_all().await, cached);
    }
}
