//! # HTTP Surface (spec §6 "Transport")
//!
//! A thin Axum router over [`Engine`], exposing raw-JSON entity CRUD plus a
//! query-execution endpoint. Application code is expected to layer its own
//! typed handlers over [`Engine`] directly in most cases; this router exists
//! for the minimal case of driving the engine from an untyped HTTP client
//! (tests, admin tooling, a sidecar).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::entity::Entity;
use crate::error::EngineError;
use crate::facade::Engine;
use crate::id::{EntityId, TypeId};

fn error_response(err: EngineError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        EngineError::NotFound => StatusCode::NOT_FOUND,
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Canceled => StatusCode::from_u16(499).unwrap(),
        EngineError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::Hook { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

fn entity_to_json(entity: &Entity) -> Value {
    json!({
        "entityId": entity.id().to_string(),
        "persisted": entity.is_persisted(),
    })
}

/// Builds the router over `engine`, mounted under whatever prefix the caller
/// nests it at.
pub fn create_entity_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/entity", post(create_entity))
        .route("/entity/:entity_id", get(get_entity))
        .route("/entity/:entity_id", delete(delete_entity))
        .route("/entity/:entity_id/component/:type_name", post(put_component))
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
struct CreateEntityRequest {
    #[serde(default)]
    components: Vec<NamedComponent>,
}

#[derive(Debug, Deserialize)]
struct NamedComponent {
    #[serde(rename = "type")]
    type_name: String,
    data: Value,
}

async fn create_entity(
    State(engine): State<Arc<Engine>>,
    Json(payload): Json<CreateEntityRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut entity = engine.new_entity().map_err(|e| {
        error_response(EngineError::Fatal(format!("failed to generate entity id: {e}")))
    })?;

    for component in payload.components {
        let type_id = TypeId::derive_from_name(&component.type_name);
        entity.set_raw(type_id, component.data).map_err(error_response)?;
    }

    engine.save(&mut entity).await.map_err(error_response)?;
    Ok(Json(entity_to_json(&entity)))
}

async fn get_entity(
    State(engine): State<Arc<Engine>>,
    Path(entity_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let id: EntityId = entity_id.parse().map_err(|e: crate::id::IdParseError| {
        error_response(EngineError::Validation(e.to_string()))
    })?;

    let entity = engine.find_by_id(id).await.map_err(error_response)?;
    match entity {
        Some(entity) => Ok(Json(entity_to_json(&entity))),
        None => Err(error_response(EngineError::NotFound)),
    }
}

async fn delete_entity(
    State(engine): State<Arc<Engine>>,
    Path(entity_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    let id: EntityId = entity_id.parse().map_err(|e: crate::id::IdParseError| {
        error_response(EngineError::Validation(e.to_string()))
    })?;

    let mut entity = engine
        .find_by_id(id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(EngineError::NotFound))?;

    engine.delete(&mut entity, false).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_component(
    State(engine): State<Arc<Engine>>,
    Path((entity_id, type_name)): Path<(String, String)>,
    Json(data): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let id: EntityId = entity_id.parse().map_err(|e: crate::id::IdParseError| {
        error_response(EngineError::Validation(e.to_string()))
    })?;

    let mut entity = engine
        .find_by_id(id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(EngineError::NotFound))?;

    let type_id = TypeId::derive_from_name(&type_name);
    entity.set_raw(type_id, data).map_err(error_response)?;
    engine.save(&mut entity).await.map_err(error_response)?;
    Ok(Json(entity_to_json(&entity)))
}
