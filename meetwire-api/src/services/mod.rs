// Copyright 2025 LiveKit, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt::Debug, fmt::Display, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::proto::{
    CloseTracksRequest, CloseTracksResponse, NewSessionRequest, NewSessionResponse,
    RenegotiateRequest, RenegotiateResponse, TracksRequest, TracksResponse,
};

pub use http_client::HttpMediaService;

mod http_client;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid environment: {0}")]
    Env(#[from] std::env::VarError),
    #[error("failed to parse the url: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("invalid bearer token")]
    InvalidToken,
    #[error("failed to execute the request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("service error: {0}")]
    Service(ServiceErrorCode),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceErrorCode {
    pub code: String,
    pub msg: String,
}

impl Display for ServiceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.msg)
    }
}

#[derive(Clone)]
pub struct ApiOptions {
    /// Application base url, e.g. `https://media.example.com/v1/apps/<app-id>`.
    pub base_url: String,
    pub token: String,
    pub request_timeout: Duration,
}

impl ApiOptions {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.to_owned(),
            token: token.to_owned(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Reads `MEETWIRE_API_URL` and `MEETWIRE_API_TOKEN`.
    pub fn from_env() -> ApiResult<Self> {
        let (base_url, token) = crate::get_env_keys()?;
        Ok(Self::new(&base_url, &token))
    }
}

impl Debug for ApiOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiOptions")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// The four endpoints of the media-routing service the engine relies on.
///
/// Implementations return the decoded body as-is; error fields carried in a
/// successful body are left for the caller to interpret.
#[async_trait]
pub trait MediaService: Debug + Send + Sync {
    /// `POST /sessions/new`
    async fn new_session(&self, req: NewSessionRequest) -> ApiResult<NewSessionResponse>;

    /// `POST /sessions/{id}/tracks/new`
    async fn new_tracks(&self, session_id: &str, req: TracksRequest)
        -> ApiResult<TracksResponse>;

    /// `PUT /sessions/{id}/renegotiate`
    async fn renegotiate(
        &self,
        session_id: &str,
        req: RenegotiateRequest,
    ) -> ApiResult<RenegotiateResponse>;

    /// `PUT /sessions/{id}/tracks/close`
    async fn close_tracks(
        &self,
        session_id: &str,
        req: CloseTracksRequest,
    ) -> ApiResult<CloseTracksResponse>;
}
