use axum::{body::Bytes, extract::Extension, http::StatusCode, routing::post, Router};
use std::sync::Arc;

use super::protocol::{Envelope, RpcResponse, ENDPOINT_RPC_BULK, ENDPOINT_RPC_CONTROL};
use super::transport::RpcHandler;
use crate::error::ClusterError;

/// Routes for both RPC channels, served on the node's HTTP port.
pub fn router(handler: Arc<dyn RpcHandler>) -> Router {
    Router::new()
        .route(ENDPOINT_RPC_CONTROL, post(handle_rpc))
        .route(ENDPOINT_RPC_BULK, post(handle_rpc))
        .layer(Extension(handler))
}

pub async fn handle_rpc(
    Extension(handler): Extension<Arc<dyn RpcHandler>>,
    body: Bytes,
) -> (StatusCode, Bytes) {
    let response = match bincode::deserialize::<Envelope>(&body) {
        Ok(envelope) => {
            tracing::trace!("RPC {:?} from {:?}", envelope.priority, envelope.from);
            handler.handle(envelope).await
        }
        Err(e) => {
            tracing::warn!("Failed to decode RPC envelope: {}", e);
            RpcResponse::Error(ClusterError::Codec(e.to_string()))
        }
    };

    match bincode::serialize(&response) {
        Ok(bytes) => (StatusCode::OK, Bytes::from(bytes)),
        Err(e) => {
            tracing::error!("Failed to encode RPC response: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
        }
    }
}
