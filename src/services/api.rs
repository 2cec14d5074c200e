//! Outbound boundary: every request the client can make to the game server.

use std::error::Error;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::dto::{
    game::GameSnapshotDto,
    requests::{ChangeRoleRequest, FlipRequest, JoinRequest, RoundConfigRequest, SendRequest},
};

/// Convenient result alias returning [`ApiError`] failures.
pub type ApiResult<T> = Result<T, ApiError>;

type BoxError = Box<dyn Error + Send + Sync>;

/// Failures that can occur while talking to the game server.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build HTTP client")]
    ClientBuilder {
        #[source]
        source: BoxError,
    },
    /// The request could not be sent.
    #[error("failed to send request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: BoxError,
    },
    /// The server answered with a non-success status.
    #[error("server rejected `{path}` with status {status}: {detail}")]
    RequestStatus {
        path: String,
        status: u16,
        detail: String,
    },
    /// The response body could not be decoded.
    #[error("failed to decode response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: BoxError,
    },
}

impl ApiError {
    /// Human-readable reason suitable for an advisory.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::RequestStatus { detail, .. } if !detail.is_empty() => detail.clone(),
            ApiError::RequestStatus { status, .. } => format!("server answered {status}"),
            ApiError::RequestSend { .. } | ApiError::ClientBuilder { .. } => {
                "server unreachable".to_string()
            }
            ApiError::DecodeResponse { .. } => "unexpected server response".to_string(),
        }
    }
}

/// Abstraction over the game server's HTTP endpoints.
pub trait ServerApi: Send + Sync {
    fn create_room(&self) -> BoxFuture<'static, ApiResult<String>>;
    fn join_room(
        &self,
        room_id: &str,
        request: JoinRequest,
        spectator: bool,
    ) -> BoxFuture<'static, ApiResult<GameSnapshotDto>>;
    fn change_role(
        &self,
        room_id: &str,
        request: ChangeRoleRequest,
    ) -> BoxFuture<'static, ApiResult<()>>;
    fn configure_rounds(
        &self,
        room_id: &str,
        request: RoundConfigRequest,
    ) -> BoxFuture<'static, ApiResult<()>>;
    fn start_game(&self, room_id: &str) -> BoxFuture<'static, ApiResult<()>>;
    fn next_round(&self, room_id: &str) -> BoxFuture<'static, ApiResult<()>>;
    fn reset_game(&self, room_id: &str) -> BoxFuture<'static, ApiResult<()>>;
    fn flip_coin(&self, room_id: &str, request: FlipRequest) -> BoxFuture<'static, ApiResult<()>>;
    fn send_batch(&self, room_id: &str, request: SendRequest)
    -> BoxFuture<'static, ApiResult<()>>;
    fn fetch_state(&self, room_id: &str) -> BoxFuture<'static, ApiResult<GameSnapshotDto>>;
}
