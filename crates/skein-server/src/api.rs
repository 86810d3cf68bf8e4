//! HTTP routes (warp-based)
//!
//! Thin collaborator over the store and the query pipeline: schema CRUD,
//! event CRUD, query execution and the codegen debug dump. Status mapping:
//! 200 success, 400 validation/decode, 404 unknown table, 500 I/O or
//! codegen failure.

use crate::timestamp;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use skein_core::{DataType, Event, Query, Value};
use skein_query::{MapperCache, Mapper, QueryError};
use skein_store::{Store, StoreError};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Shared server state.
pub struct AppState {
    pub store: Arc<Store>,
    pub cache: MapperCache,
}

pub type SharedState = Arc<AppState>;

pub fn shared_state(store: Arc<Store>) -> SharedState {
    Arc::new(AppState {
        store,
        cache: MapperCache::default(),
    })
}

fn with_state(
    state: SharedState,
) -> impl Filter<Extract = (SharedState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Builds the full route tree.
pub fn routes(
    state: SharedState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ping = warp::path("ping")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({ "message": "ok" })));

    let stats = warp::path("stats")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_stats);

    let create_table = warp::path("tables")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_create_table);

    let list_tables = warp::path("tables")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_list_tables);

    let get_table = warp::path("tables")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_get_table);

    let delete_table = warp::path("tables")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(handle_delete_table);

    let add_property = warp::path("tables")
        .and(warp::path::param::<String>())
        .and(warp::path("properties"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_add_property);

    let list_properties = warp::path("tables")
        .and(warp::path::param::<String>())
        .and(warp::path("properties"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_list_properties);

    let upsert_event = warp::path("tables")
        .and(warp::path::param::<String>())
        .and(warp::path("objects"))
        .and(warp::path::param::<String>())
        .and(warp::path("events"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::patch())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_upsert_event);

    let get_event = warp::path("tables")
        .and(warp::path::param::<String>())
        .and(warp::path("objects"))
        .and(warp::path::param::<String>())
        .and(warp::path("events"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_get_event);

    let delete_event = warp::path("tables")
        .and(warp::path::param::<String>())
        .and(warp::path("objects"))
        .and(warp::path::param::<String>())
        .and(warp::path("events"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(handle_delete_event);

    let list_events = warp::path("tables")
        .and(warp::path::param::<String>())
        .and(warp::path("objects"))
        .and(warp::path::param::<String>())
        .and(warp::path("events"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_list_events);

    let delete_object = warp::path("tables")
        .and(warp::path::param::<String>())
        .and(warp::path("objects"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(handle_delete_object);

    let query = warp::path("tables")
        .and(warp::path::param::<String>())
        .and(warp::path("query"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::query::<QueryParams>())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_query);

    let codegen = warp::path("tables")
        .and(warp::path::param::<String>())
        .and(warp::path("query"))
        .and(warp::path("codegen"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(handle_codegen);

    ping.or(stats)
        .or(create_table)
        .or(list_tables)
        .or(codegen)
        .or(query)
        .or(add_property)
        .or(list_properties)
        .or(upsert_event)
        .or(get_event)
        .or(delete_event)
        .or(list_events)
        .or(delete_object)
        .or(get_table)
        .or(delete_table)
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateTableRequest {
    name: String,
    #[serde(default)]
    properties: Vec<PropertyRequest>,
}

#[derive(Debug, Deserialize)]
struct PropertyRequest {
    name: String,
    #[serde(default)]
    transient: bool,
    #[serde(rename = "dataType")]
    data_type: DataType,
}

#[derive(Debug, Deserialize)]
struct EventRequest {
    #[serde(default)]
    data: IndexMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct EventReply {
    timestamp: String,
    data: IndexMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    /// Optional query timeout in milliseconds; checked at shard boundaries.
    #[serde(rename = "timeoutMs")]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    error: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

type HandlerResult = Result<warp::reply::WithStatus<warp::reply::Json>, Infallible>;

fn ok_json(value: &impl Serialize) -> HandlerResult {
    Ok(warp::reply::with_status(
        warp::reply::json(value),
        StatusCode::OK,
    ))
}

fn error_json(status: StatusCode, message: String) -> HandlerResult {
    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorReply { error: message }),
        status,
    ))
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::TableNotFound(_)
        | StoreError::EventNotFound
        | StoreError::FactorNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidArgument(_)
        | StoreError::TableAlreadyExists(_)
        | StoreError::Schema(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_error(err: StoreError) -> HandlerResult {
    error_json(store_status(&err), err.to_string())
}

fn query_error(err: QueryError) -> HandlerResult {
    let status = match &err {
        QueryError::Validation(_) => StatusCode::BAD_REQUEST,
        QueryError::Store(inner) => store_status(inner),
        QueryError::Codegen(_) | QueryError::DeadlineExceeded => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_json(status, err.to_string())
}

async fn handle_stats(state: SharedState) -> HandlerResult {
    match state.store.stats() {
        Ok(stats) => ok_json(&stats),
        Err(e) => store_error(e),
    }
}

async fn handle_create_table(request: CreateTableRequest, state: SharedState) -> HandlerResult {
    if let Err(e) = state.store.create_table(&request.name) {
        return store_error(e);
    }
    for property in &request.properties {
        if let Err(e) = state.store.add_property(
            &request.name,
            &property.name,
            property.transient,
            property.data_type,
        ) {
            return store_error(e);
        }
    }
    match state.store.table(&request.name) {
        Ok(table) => ok_json(&*table),
        Err(e) => store_error(e),
    }
}

async fn handle_list_tables(state: SharedState) -> HandlerResult {
    match state.store.table_names() {
        Ok(names) => ok_json(&names),
        Err(e) => store_error(e),
    }
}

async fn handle_get_table(name: String, state: SharedState) -> HandlerResult {
    match state.store.table(&name) {
        Ok(table) => ok_json(&*table),
        Err(e) => store_error(e),
    }
}

async fn handle_delete_table(name: String, state: SharedState) -> HandlerResult {
    match state.store.drop_table(&name) {
        Ok(()) => ok_json(&serde_json::json!({})),
        Err(e) => store_error(e),
    }
}

async fn handle_add_property(
    table: String,
    request: PropertyRequest,
    state: SharedState,
) -> HandlerResult {
    match state
        .store
        .add_property(&table, &request.name, request.transient, request.data_type)
    {
        Ok(property) => ok_json(&property),
        Err(e) => store_error(e),
    }
}

async fn handle_list_properties(table: String, state: SharedState) -> HandlerResult {
    match state.store.table(&table) {
        Ok(table) => ok_json(&table.properties),
        Err(e) => store_error(e),
    }
}

async fn handle_upsert_event(
    table_name: String,
    object: String,
    ts: String,
    request: EventRequest,
    state: SharedState,
) -> HandlerResult {
    let timestamp = match timestamp::parse(&ts) {
        Ok(timestamp) => timestamp,
        Err(message) => return error_json(StatusCode::BAD_REQUEST, message),
    };
    let table = match state.store.table(&table_name) {
        Ok(table) => table,
        Err(e) => return store_error(e),
    };
    let data = match table.normalize(&request.data) {
        Ok(data) => data,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let event = Event { timestamp, data };
    match state.store.insert_event(&table_name, &object, event) {
        Ok(()) => ok_json(&serde_json::json!({})),
        Err(e) => store_error(e),
    }
}

async fn handle_get_event(
    table_name: String,
    object: String,
    ts: String,
    state: SharedState,
) -> HandlerResult {
    let timestamp = match timestamp::parse(&ts) {
        Ok(timestamp) => timestamp,
        Err(message) => return error_json(StatusCode::BAD_REQUEST, message),
    };
    let table = match state.store.table(&table_name) {
        Ok(table) => table,
        Err(e) => return store_error(e),
    };
    match state.store.get_event(&table_name, &object, timestamp) {
        Ok(Some(event)) => ok_json(&EventReply {
            timestamp: timestamp::format(event.timestamp),
            data: table.denormalize(&event.data),
        }),
        Ok(None) => error_json(StatusCode::NOT_FOUND, "event not found".to_string()),
        Err(e) => store_error(e),
    }
}

async fn handle_list_events(
    table_name: String,
    object: String,
    state: SharedState,
) -> HandlerResult {
    let table = match state.store.table(&table_name) {
        Ok(table) => table,
        Err(e) => return store_error(e),
    };
    match state.store.get_events(&table_name, &object) {
        Ok(events) => {
            let replies: Vec<EventReply> = events
                .iter()
                .map(|event| EventReply {
                    timestamp: timestamp::format(event.timestamp),
                    data: table.denormalize(&event.data),
                })
                .collect();
            ok_json(&replies)
        }
        Err(e) => store_error(e),
    }
}

async fn handle_delete_event(
    table_name: String,
    object: String,
    ts: String,
    state: SharedState,
) -> HandlerResult {
    let timestamp = match timestamp::parse(&ts) {
        Ok(timestamp) => timestamp,
        Err(message) => return error_json(StatusCode::BAD_REQUEST, message),
    };
    match state.store.delete_event(&table_name, &object, timestamp) {
        Ok(()) => ok_json(&serde_json::json!({})),
        Err(e) => store_error(e),
    }
}

async fn handle_delete_object(
    table_name: String,
    object: String,
    state: SharedState,
) -> HandlerResult {
    match state.store.delete_object(&table_name, &object) {
        Ok(()) => ok_json(&serde_json::json!({})),
        Err(e) => store_error(e),
    }
}

async fn handle_query(
    table_name: String,
    params: QueryParams,
    query: Query,
    state: SharedState,
) -> HandlerResult {
    let table = match state.store.table(&table_name) {
        Ok(table) => table,
        Err(e) => return store_error(e),
    };
    let deadline = params
        .timeout_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    // queries scan under read txns; keep them off the async workers
    let state = state.clone();
    let result = tokio::task::spawn_blocking(move || {
        skein_query::execute(&state.store, &state.cache, &table, &query, deadline)
    })
    .await;

    match result {
        Ok(Ok(value)) => ok_json(&value),
        Ok(Err(e)) => query_error(e),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn handle_codegen(table_name: String, query: Query, state: SharedState) -> HandlerResult {
    let table = match state.store.table(&table_name) {
        Ok(table) => table,
        Err(e) => return store_error(e),
    };
    match Mapper::new(&query, &table, &state.store) {
        Ok(mapper) => ok_json(&serde_json::json!({ "ir": mapper.dump() })),
        Err(e) => query_error(e),
    }
}
