use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    dto::{
        game::GameSnapshotDto,
        requests::{
            ChangeRoleRequest, CreateRoomResponse, ErrorDetail, FlipRequest, JoinRequest,
            RoundConfigRequest, SendRequest,
        },
    },
    services::api::{ApiError, ApiResult, ServerApi},
};

/// [`ServerApi`] backed by the server's REST endpoints. The host secret set by
/// `/game/create` travels in the cookie store shared by every clone.
#[derive(Clone)]
pub struct HttpServerApi {
    client: Client,
    base_url: Arc<str>,
}

impl HttpServerApi {
    /// Build a client for the server at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> ApiResult<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|source| ApiError::ClientBuilder {
                source: Box::new(source),
            })?;

        Ok(Self {
            client,
            base_url: Arc::<str>::from(base_url.trim_end_matches('/')),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        self.client.request(method, url)
    }

    async fn send(&self, builder: RequestBuilder, path: &str) -> ApiResult<Response> {
        debug!(path, "sending request");
        let response = builder
            .send()
            .await
            .map_err(|source| ApiError::RequestSend {
                path: path.to_string(),
                source: Box::new(source),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = response
            .json::<ErrorDetail>()
            .await
            .ok()
            .and_then(|body| body.detail)
            .unwrap_or_default();
        Err(ApiError::RequestStatus {
            path: path.to_string(),
            status: status.as_u16(),
            detail,
        })
    }

    async fn decode<T>(response: Response, path: &str) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        response
            .json::<T>()
            .await
            .map_err(|source| ApiError::DecodeResponse {
                path: path.to_string(),
                source: Box::new(source),
            })
    }

    async fn post_empty(&self, path: String) -> ApiResult<()> {
        self.send(self.request(Method::POST, &path), &path)
            .await
            .map(drop)
    }

    async fn post_json<B>(&self, path: String, body: &B) -> ApiResult<()>
    where
        B: Serialize,
    {
        self.send(self.request(Method::POST, &path).json(body), &path)
            .await
            .map(drop)
    }
}

impl ServerApi for HttpServerApi {
    fn create_room(&self) -> BoxFuture<'static, ApiResult<String>> {
        let api = self.clone();
        Box::pin(async move {
            let path = "game/create";
            let response = api.send(api.request(Method::POST, path), path).await?;
            let created = Self::decode::<CreateRoomResponse>(response, path).await?;
            Ok(created.room_id)
        })
    }

    fn join_room(
        &self,
        room_id: &str,
        request: JoinRequest,
        spectator: bool,
    ) -> BoxFuture<'static, ApiResult<GameSnapshotDto>> {
        let api = self.clone();
        let path = format!("game/join/{room_id}");
        Box::pin(async move {
            let builder = api
                .request(Method::POST, &path)
                .query(&[("spectator", spectator)])
                .json(&request);
            let response = api.send(builder, &path).await?;
            Self::decode(response, &path).await
        })
    }

    fn change_role(
        &self,
        room_id: &str,
        request: ChangeRoleRequest,
    ) -> BoxFuture<'static, ApiResult<()>> {
        let api = self.clone();
        let path = format!("game/change_role/{room_id}");
        Box::pin(async move { api.post_json(path, &request).await })
    }

    fn configure_rounds(
        &self,
        room_id: &str,
        request: RoundConfigRequest,
    ) -> BoxFuture<'static, ApiResult<()>> {
        let api = self.clone();
        let path = format!("game/round_config/{room_id}");
        Box::pin(async move { api.post_json(path, &request).await })
    }

    fn start_game(&self, room_id: &str) -> BoxFuture<'static, ApiResult<()>> {
        let api = self.clone();
        let path = format!("game/start/{room_id}");
        Box::pin(async move { api.post_empty(path).await })
    }

    fn next_round(&self, room_id: &str) -> BoxFuture<'static, ApiResult<()>> {
        let api = self.clone();
        let path = format!("game/next_round/{room_id}");
        Box::pin(async move { api.post_empty(path).await })
    }

    fn reset_game(&self, room_id: &str) -> BoxFuture<'static, ApiResult<()>> {
        let api = self.clone();
        let path = format!("game/reset/{room_id}");
        Box::pin(async move { api.post_empty(path).await })
    }

    fn flip_coin(&self, room_id: &str, request: FlipRequest) -> BoxFuture<'static, ApiResult<()>> {
        let api = self.clone();
        let path = format!("game/flip/{room_id}");
        Box::pin(async move { api.post_json(path, &request).await })
    }

    fn send_batch(
        &self,
        room_id: &str,
        request: SendRequest,
    ) -> BoxFuture<'static, ApiResult<()>> {
        let api = self.clone();
        let path = format!("game/send/{room_id}");
        Box::pin(async move { api.post_json(path, &request).await })
    }

    fn fetch_state(&self, room_id: &str) -> BoxFuture<'static, ApiResult<GameSnapshotDto>> {
        let api = self.clone();
        let path = format!("game/state/{room_id}");
        Box::pin(async move {
            let response = api.send(api.request(Method::GET, &path), &path).await?;
            Self::decode(response, &path).await
        })
    }
}
