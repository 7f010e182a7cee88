use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::node::CacheNode;
use super::protocol::{
    EntriesResponse, ErrorResponse, GetAllRequest, PutAllRequest, PutAllResponse, PutRequest,
    RebalancingRequest, TopologyResponse, TxOperation, TxRequest, TxResponse, ValueResponse,
};
use crate::commands::Flags;
use crate::error::CacheError;

fn error_response(error: CacheError) -> Response {
    let status = match error {
        CacheError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CacheError::TopologyWaitTimeout { .. } | CacheError::RemoteTimeout { .. } => {
            StatusCode::GATEWAY_TIMEOUT
        }
        CacheError::UnknownTransaction(_) => StatusCode::NOT_FOUND,
        CacheError::Configuration(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::error!("Request failed: {}", error);
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn value_response(result: Result<Option<String>, CacheError>) -> Response {
    match result {
        Ok(value) => (StatusCode::OK, Json(ValueResponse { value })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_put(
    Extension(cache): Extension<Arc<CacheNode>>,
    Json(req): Json<PutRequest>,
) -> Response {
    let mut flags = Flags::empty();
    if req.force_synchronous {
        flags |= Flags::FORCE_SYNCHRONOUS;
    }
    if req.force_asynchronous {
        flags |= Flags::FORCE_ASYNCHRONOUS;
    }
    value_response(cache.put_with_flags(&req.key, &req.value, flags).await)
}

pub async fn handle_get(
    Extension(cache): Extension<Arc<CacheNode>>,
    Path(key): Path<String>,
) -> Response {
    value_response(cache.get(&key).await)
}

pub async fn handle_get_all(
    Extension(cache): Extension<Arc<CacheNode>>,
    Json(req): Json<GetAllRequest>,
) -> Response {
    let keys: Vec<&str> = req.keys.iter().map(String::as_str).collect();
    match cache.get_all(&keys).await {
        Ok(entries) => (StatusCode::OK, Json(EntriesResponse { entries })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_put_all(
    Extension(cache): Extension<Arc<CacheNode>>,
    Json(req): Json<PutAllRequest>,
) -> Response {
    match cache.put_all(req.entries).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(PutAllResponse {
                unavailable: outcome.unavailable,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_remove(
    Extension(cache): Extension<Arc<CacheNode>>,
    Path(key): Path<String>,
) -> Response {
    value_response(cache.remove(&key).await)
}

pub async fn handle_clear(Extension(cache): Extension<Arc<CacheNode>>) -> Response {
    match cache.clear().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_tx(
    Extension(cache): Extension<Arc<CacheNode>>,
    Json(req): Json<TxRequest>,
) -> (StatusCode, Json<TxResponse>) {
    let tx = cache.begin();
    for operation in &req.operations {
        let staged = match operation {
            TxOperation::Put { key, value } => tx.put(key, value).await,
            TxOperation::Remove { key } => tx.remove(key).await,
        };
        if let Err(e) = staged {
            let _ = tx.rollback().await;
            return (
                StatusCode::BAD_REQUEST,
                Json(TxResponse {
                    committed: false,
                    error: Some(e.to_string()),
                }),
            );
        }
    }

    let outcome = if req.rollback {
        tx.rollback().await.map(|()| false)
    } else {
        tx.commit().await.map(|()| true)
    };
    match outcome {
        Ok(committed) => (
            StatusCode::OK,
            Json(TxResponse {
                committed,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::error!("Transaction failed: {}", e);
            (
                StatusCode::CONFLICT,
                Json(TxResponse {
                    committed: false,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_topology(
    Extension(cache): Extension<Arc<CacheNode>>,
) -> (StatusCode, Json<TopologyResponse>) {
    let topology = cache.topology();
    let response = TopologyResponse {
        topology_id: topology.topology_id,
        view_id: topology.view_id,
        members: topology.members.clone(),
        rebalancing: topology.is_rebalancing(),
        rebalancing_enabled: cache.is_rebalancing_enabled(),
        owned_segments: topology.current.segments_owned_by(cache.address()).len(),
        local_entries: cache.local_size(),
    };
    (StatusCode::OK, Json(response))
}

pub async fn handle_rebalancing(
    Extension(cache): Extension<Arc<CacheNode>>,
    Json(req): Json<RebalancingRequest>,
) -> StatusCode {
    cache.set_rebalancing_enabled(req.enabled);
    StatusCode::NO_CONTENT
}
