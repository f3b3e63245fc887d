use super::error::AppError;
use super::AppState;
use crate::engine::EngineStats;
use crate::message::Message;
use crate::scenario::ScenarioStep;
use crate::template::Template;
use crate::trigger::Trigger;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

type ApiResult<T> = Result<T, AppError>;

fn parse_id(raw: &str) -> ApiResult<i64> {
    raw.parse()
        .map_err(|_| AppError::bad_request(format!("invalid id: {raw:?}")))
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| AppError::bad_request(format!("invalid request body: {e}")))
}

/// `content-type` -> `Content-Type`
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Build an inbound message from request headers and body.
fn inbound_message(headers: &HeaderMap, body: &Bytes) -> Message {
    let mut message = Message::new(String::from_utf8_lossy(body));
    for name in headers.keys() {
        let value = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        message
            .headers
            .insert(canonical_header_name(name.as_str()), value);
    }
    message
}

/// Turn an output message into a 200 response carrying its headers and body.
fn message_response(message: Message) -> Response {
    let mut response = Response::new(Body::from(message.body));
    let headers = response.headers_mut();
    for (name, value) in message.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Dropping header that is not valid HTTP"),
        }
    }
    response
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    stats: EngineStats,
}

/// GET /health
pub async fn health(State(app): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        stats: app.engine.stats().await,
    })
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// GET /api/triggers
pub async fn list_triggers(State(app): State<AppState>) -> Json<Vec<Trigger>> {
    Json(app.engine.triggers().list_all().await)
}

/// POST /api/triggers
pub async fn add_trigger(
    State(app): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Trigger>)> {
    let trigger: Trigger = parse_body(&body)?;
    let trigger = app.engine.triggers().add_trigger(trigger).await?;
    Ok((StatusCode::CREATED, Json(trigger)))
}

/// GET /api/triggers/{id}
pub async fn get_trigger(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Trigger>> {
    let id = parse_id(&id)?;
    Ok(Json(app.engine.triggers().get_by_id(id).await?))
}

/// PUT /api/triggers/{id}
pub async fn update_trigger(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Trigger>> {
    let mut trigger: Trigger = parse_body(&body)?;
    trigger.id = parse_id(&id)?;
    Ok(Json(app.engine.triggers().update_trigger(trigger).await?))
}

/// DELETE /api/triggers/{id}
pub async fn delete_trigger(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    app.engine.triggers().delete_trigger(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListTemplatesQuery {
    #[serde(rename = "includeBody", default)]
    include_body: bool,
}

/// GET /api/templates?includeBody=bool
pub async fn list_templates(
    State(app): State<AppState>,
    Query(query): Query<ListTemplatesQuery>,
) -> Response {
    let templates = app.engine.templates();
    if query.include_body {
        Json(templates.list_all().await).into_response()
    } else {
        Json(templates.list_summaries().await).into_response()
    }
}

/// POST /api/templates
pub async fn add_template(
    State(app): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Template>)> {
    let template: Template = parse_body(&body)?;
    let template = app.engine.templates().add_template(template).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

/// GET /api/templates/{id}
pub async fn get_template(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Template>> {
    let id = parse_id(&id)?;
    Ok(Json(app.engine.templates().get_by_id(id).await?))
}

/// PUT /api/templates/{id}
pub async fn update_template(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Template>> {
    let mut template: Template = parse_body(&body)?;
    template.id = parse_id(&id)?;
    Ok(Json(app.engine.templates().update_template(template).await?))
}

/// DELETE /api/templates/{id}
pub async fn delete_template(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    app.engine.templates().delete_template(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// ANY /api/templates/{id}/process[/{*rest}]: render a template against the request.
pub async fn process_template(
    State(app): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let raw = params
        .get("id")
        .ok_or_else(|| AppError::bad_request("template id is not specified"))?;
    let id = parse_id(raw)?;

    let message = inbound_message(&headers, &body);
    let output = app.engine.templates().render(id, &message).await?;
    Ok(message_response(output))
}

// ---------------------------------------------------------------------------
// Scenario steps
// ---------------------------------------------------------------------------

/// GET /api/steps/field/triggerId/{trigger_id}
pub async fn get_steps(
    State(app): State<AppState>,
    Path(trigger_id): Path<String>,
) -> ApiResult<Json<Vec<ScenarioStep>>> {
    let trigger_id = parse_id(&trigger_id)?;
    Ok(Json(app.engine.scenarios().get_ordered_steps(trigger_id).await))
}

/// POST /api/steps
pub async fn add_step(
    State(app): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ScenarioStep>)> {
    let step: ScenarioStep = parse_body(&body)?;
    let step = app.engine.scenarios().add_step(step).await?;
    Ok((StatusCode::CREATED, Json(step)))
}

/// PUT /api/steps/{id}
pub async fn update_step(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ScenarioStep>> {
    let mut step: ScenarioStep = parse_body(&body)?;
    step.id = Some(parse_id(&id)?);
    Ok(Json(app.engine.scenarios().update_step(step).await?))
}

/// DELETE /api/steps/{id}
pub async fn delete_step(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    app.engine.scenarios().delete_step(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/steps/field/triggerId/{trigger_id}: insert or update a trigger's steps in bulk.
pub async fn replace_steps(
    State(app): State<AppState>,
    Path(trigger_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Vec<ScenarioStep>>> {
    let trigger_id = parse_id(&trigger_id)?;
    let steps: Vec<ScenarioStep> = parse_body(&body)?;
    let steps = app
        .engine
        .scenarios()
        .replace_steps_for_trigger(steps, trigger_id)
        .await?;
    Ok(Json(steps))
}

// ---------------------------------------------------------------------------
// Mock endpoint
// ---------------------------------------------------------------------------

/// ANY /api/http/process[/{*rest}]: answer the request with the matched scenario's output.
pub async fn process_http(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let message = inbound_message(&headers, &body);
    let output = app.engine.process_inbound_message(&message).await?;
    Ok(message_response(output))
}
