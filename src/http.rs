use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client::Registrar;
use crate::config::ClientConfig;
use crate::coordinator::{TransferCoordinator, TransferInfo};
use crate::error::TransferError;
use crate::identity::FileMetaData;

pub const REGISTRATION_PATH: &str = "/getFileTransferInfo";

/// Envelope of every registration answer; `data` is present only when
/// `code` is 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "success".to_string(),
            data: Some(data),
        }
    }

    fn failure(code: i32, msg: String) -> Self {
        Self { code, msg, data: None }
    }
}

type RegistrationReply = (StatusCode, Json<ApiResponse<TransferInfo>>);

pub fn build_router(coordinator: TransferCoordinator) -> Router {
    Router::new()
        .route(REGISTRATION_PATH, post(handle_get_file_transfer_info))
        .with_state(coordinator)
}

pub async fn serve_http(listener: TcpListener, coordinator: TransferCoordinator) -> Result<(), TransferError> {
    info!("Registration endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(coordinator)).await?;
    Ok(())
}

async fn handle_get_file_transfer_info(
    State(coordinator): State<TransferCoordinator>,
    payload: Result<Json<FileMetaData>, JsonRejection>,
) -> RegistrationReply {
    let meta = match payload {
        Ok(Json(meta)) => meta,
        Err(JsonRejection::JsonDataError(e)) => {
            debug!("Rejected registration body: {}", e);
            return reply_error(1, format!("invalid parameters: {}", e.body_text()));
        }
        Err(e) => {
            debug!("Undecodable registration body: {}", e);
            return reply_error(2, format!("failed to decode request: {}", e.body_text()));
        }
    };

    let content_hash = meta.content_hash.clone();
    match coordinator.register(meta).await {
        Ok(info) => {
            debug!("Registration of {}: {} chunks unreceived", content_hash, info.unreceived.len());
            (StatusCode::OK, Json(ApiResponse::success(info)))
        }
        Err(e) => {
            let code = e.code();
            let msg = match code {
                1 => format!("invalid parameters: {}", e),
                3 => format!("failed to get file transfer info: {}", e),
                _ => e.to_string(),
            };
            warn!("Registration of {} failed: {}", content_hash, e);
            reply_error(code, msg)
        }
    }
}

fn reply_error(code: i32, msg: String) -> RegistrationReply {
    let status = match code {
        1 | 2 => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::failure(code, msg)))
}

/// Registers files with a remote coordinator over HTTP.
pub struct HttpRegistrar {
    client: reqwest::Client,
    url: String,
}

impl HttpRegistrar {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, url: url.into() })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, TransferError> {
        Self::new(config.registration_url(), config.timeout())
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn register(&self, meta: &FileMetaData) -> Result<TransferInfo, TransferError> {
        let response = self.client.post(&self.url).json(meta).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        let reply: ApiResponse<TransferInfo> = match serde_json::from_slice(&body) {
            Ok(reply) => reply,
            Err(_) if !status.is_success() => {
                return Err(TransferError::RemoteError {
                    code: 4,
                    msg: format!("registration endpoint answered HTTP {}", status),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if reply.code != 0 {
            return Err(TransferError::RemoteError {
                code: reply.code,
                msg: reply.msg,
            });
        }
        reply
            .data
            .ok_or_else(|| TransferError::ProtocolError("registration reply carried no data".to_string()))
    }
}
