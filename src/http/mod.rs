pub mod extract;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::acl::AclSubsystem;
use crate::database::{DatabaseInstance, DatabaseMeta, ExecuteRequest, ReplicationConfig, Role};
use crate::error::{Error, Result};
use crate::node::NodeRuntime;
use crate::tee::EncryptionMode;
use crate::vector::{CreateIndexRequest, VectorIndexFacility};
use crate::wal::WalJournal;
use extract::{
    BatchExecuteRequestDto, CreateDatabaseRequestDto, CreateDatabaseResponseDto, ExecuteRequestDto,
    GrantRequestDto, RevokeRequestDto, StatusResponseDto, VectorInsertRequestDto,
    VectorSearchRequestDto, WalIntrospectionDto,
};

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<NodeRuntime>,
}

/// Builds the full §6 client HTTP surface, plus the supplemental
/// `/v2/db/{id}/wal` introspection endpoint (SPEC_FULL.md §B.4). CORS and
/// gzip/br compression are applied to every route (SPEC_FULL.md §B.1).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v2/db", post(create_database))
        .route("/v2/db/:id", get(get_database).delete(delete_database))
        .route("/v2/db/:id/execute", post(execute))
        .route("/v2/db/:id/batch", post(batch_execute))
        .route("/v2/db/:id/grant", post(grant))
        .route("/v2/db/:id/revoke", post(revoke))
        .route("/v2/db/:id/acl", get(list_acl))
        .route("/v2/db/:id/vector/index", post(vector_create_index))
        .route("/v2/db/:id/vector/insert", post(vector_insert))
        .route("/v2/db/:id/vector/search", post(vector_search))
        .route("/v2/db/:id/wal", get(wal_introspect))
        .route("/v2/db/:id/replication", get(replication_status))
        .route("/v2/db/:id/ws", get(ws::execute_stream))
        .route("/v2/wal/sync", post(wal_sync))
        .route("/v2/node", get(node_info))
        .route("/v1/status", get(status))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn require_database(state: &AppState, id: &str) -> Result<Arc<DatabaseInstance>> {
    state
        .node
        .database(id)
        .ok_or_else(|| Error::NotFound(id.to_string()))
}

async fn create_database(
    State(state): State<AppState>,
    Json(req): Json<CreateDatabaseRequestDto>,
) -> Result<Json<CreateDatabaseResponseDto>> {
    let database_id = req
        .database_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let now = Utc::now().timestamp_millis();
    let meta = DatabaseMeta {
        id: database_id.clone(),
        name: req.name.clone(),
        owner: req.owner.clone(),
        encryption_mode: req.encryption_mode.unwrap_or(EncryptionMode::None),
        replication: req.replication.unwrap_or_default(),
        primary_node_id: state.node.info.node_id.clone(),
        replica_node_ids: Vec::new(),
        role: Role::Primary,
        wal_position: 0,
        schema_version: 1,
        schema_hash: String::new(),
        created_at: now,
        updated_at: now,
    };

    let instance = DatabaseInstance::create(
        &state.node.data_dir,
        meta,
        req.initial_ddl.as_deref(),
        state.node.info.node_id.clone(),
        state.node.events.clone(),
        state.node.accepted_tee_levels().to_vec(),
    )?;
    state.node.insert_database(database_id.clone(), Arc::new(instance));

    Ok(Json(CreateDatabaseResponseDto {
        database_id,
        name: req.name,
        owner: req.owner,
    }))
}

async fn get_database(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DatabaseMeta>> {
    let instance = require_database(&state, &id)?;
    let mut meta = instance.meta.clone();
    meta.wal_position = instance.wal_position()?;
    Ok(Json(meta))
}

async fn delete_database(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    require_database(&state, &id)?;
    state.node.remove_database(&id);
    DatabaseInstance::delete(&state.node.data_dir, &id)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequestDto>,
) -> Result<Json<crate::database::ExecuteResponse>> {
    let instance = match state.node.database(&id) {
        Some(instance) => instance,
        None if state.node.dev_mode => {
            let now = Utc::now().timestamp_millis();
            let meta = DatabaseMeta {
                id: id.clone(),
                name: id.clone(),
                owner: req.caller_address.clone().unwrap_or_default(),
                encryption_mode: EncryptionMode::None,
                replication: ReplicationConfig::default(),
                primary_node_id: state.node.info.node_id.clone(),
                replica_node_ids: Vec::new(),
                role: Role::Primary,
                wal_position: 0,
                schema_version: 1,
                schema_hash: String::new(),
                created_at: now,
                updated_at: now,
            };
            let instance = Arc::new(DatabaseInstance::create(
                &state.node.data_dir,
                meta,
                None,
                state.node.info.node_id.clone(),
                state.node.events.clone(),
                state.node.accepted_tee_levels().to_vec(),
            )?);
            state.node.insert_database(id.clone(), Arc::clone(&instance));
            instance
        }
        None => return Err(Error::NotFound(id)),
    };

    if let (Some(sig), Some(ts)) = (&req.signature, req.timestamp) {
        if let Some(caller) = &req.caller_address {
            if caller != &instance.meta.owner {
                extract::verify_signature(&instance.meta.owner, ts, &req.sql, sig)?;
            }
        }
    }

    let response = instance
        .execute(ExecuteRequest {
            sql: req.sql,
            params: req.params,
            required_wal_position: req.required_wal_position,
            caller: req.caller_address,
        })
        .await?;
    Ok(Json(response))
}

async fn batch_execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BatchExecuteRequestDto>,
) -> Result<Json<Vec<crate::database::ExecuteResponse>>> {
    let instance = require_database(&state, &id)?;
    let statements = req.statements.into_iter().map(|s| (s.sql, s.params)).collect();
    let responses = instance
        .batch_execute(statements, req.transactional, req.caller_address)
        .await?;
    Ok(Json(responses))
}

async fn grant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<GrantRequestDto>,
) -> Result<impl IntoResponse> {
    let instance = require_database(&state, &id)?;
    let now = Utc::now().timestamp_millis();
    let caller = req.caller_address.as_deref().unwrap_or(&instance.meta.owner);
    AclSubsystem::require(instance.storage(), &instance.meta.owner, caller, crate::acl::Permission::Admin, now)?;
    AclSubsystem::grant(instance.storage(), &req.grantee, &req.permissions, now, req.expires_at)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn revoke(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RevokeRequestDto>,
) -> Result<impl IntoResponse> {
    let instance = require_database(&state, &id)?;
    let now = Utc::now().timestamp_millis();
    let caller = req.caller_address.as_deref().unwrap_or(&instance.meta.owner);
    AclSubsystem::require(instance.storage(), &instance.meta.owner, caller, crate::acl::Permission::Admin, now)?;
    AclSubsystem::revoke(instance.storage(), &req.grantee, &req.permissions)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn list_acl(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<crate::acl::AclRule>>> {
    let instance = require_database(&state, &id)?;
    Ok(Json(AclSubsystem::list(instance.storage())?))
}

async fn vector_create_index(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreateIndexRequest>,
) -> Result<impl IntoResponse> {
    let instance = require_database(&state, &id)?;
    VectorIndexFacility::create_index(instance.storage(), &req)?;
    Ok(axum::http::StatusCode::CREATED)
}

async fn vector_insert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<VectorInsertRequestDto>,
) -> Result<Json<i64>> {
    let instance = require_database(&state, &id)?;
    let rowid = VectorIndexFacility::insert(
        instance.storage(),
        &req.table_name,
        &req.vector,
        &req.metadata,
        req.partition_value.as_ref(),
    )?;
    Ok(Json(rowid))
}

async fn vector_search(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<VectorSearchRequestDto>,
) -> Result<Json<Vec<crate::vector::SearchHit>>> {
    let instance = require_database(&state, &id)?;
    let hits = VectorIndexFacility::search(
        instance.storage(),
        &req.table_name,
        &req.vector,
        req.k,
        req.partition_value.as_ref(),
        req.metadata_filter.as_deref(),
        req.include_metadata,
    )?;
    Ok(Json(hits))
}

async fn wal_introspect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WalIntrospectionDto>> {
    let instance = require_database(&state, &id)?;
    Ok(Json(WalIntrospectionDto {
        database_id: id,
        head_position: WalJournal::head_position(instance.storage())?,
    }))
}

async fn replication_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<std::collections::HashMap<String, crate::database::ReplicaStatus>>> {
    let instance = require_database(&state, &id)?;
    Ok(Json(instance.replication_status()))
}

async fn wal_sync(
    State(state): State<AppState>,
    Json(req): Json<crate::replication::WalSyncRequest>,
) -> Result<Json<crate::replication::WalSyncResponse>> {
    let instance = require_database(&state, &req.database_id)?;
    let result = WalJournal::fetch_range(instance.storage(), req.from_position, req.limit)?;
    instance.record_replica_sync(
        req.node_id.clone(),
        crate::database::ReplicaStatus {
            wal_position: req.from_position,
            lag: result.current_pos.saturating_sub(req.from_position),
            last_sync: Some(Utc::now().timestamp_millis()),
            syncing: result.has_more,
        },
    );
    Ok(Json(crate::replication::WalSyncResponse {
        entries: result.entries,
        has_more: result.has_more,
        current_position: result.current_pos,
    }))
}

async fn node_info(State(state): State<AppState>) -> Json<crate::node::NodeInfoDto> {
    Json(state.node.to_dto())
}

async fn status(State(state): State<AppState>) -> Json<StatusResponseDto> {
    Json(StatusResponseDto {
        status: "ok",
        block_height: 0,
        databases: state.node.databases.read().len(),
    })
}
