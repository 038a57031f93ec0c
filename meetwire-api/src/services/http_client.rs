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

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Method,
};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

use super::{ApiError, ApiOptions, ApiResult, MediaService, ServiceErrorCode};
use crate::proto::{
    CloseTracksRequest, CloseTracksResponse, NewSessionRequest, NewSessionResponse,
    RenegotiateRequest, RenegotiateResponse, ServiceStatus, TracksRequest, TracksResponse,
};

/// [`MediaService`] over HTTPS with bearer-token authentication.
#[derive(Debug)]
pub struct HttpMediaService {
    base_url: String,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl HttpMediaService {
    pub fn new(options: ApiOptions) -> ApiResult<Self> {
        // Validate once so that every request url is known to parse
        Url::parse(&options.base_url)?;

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", options.token))
            .map_err(|_| ApiError::InvalidToken)?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder().timeout(options.request_timeout).build()?;

        Ok(Self { base_url: options.base_url.trim_end_matches('/').to_owned(), headers, client })
    }

    fn url(&self, path: &str) -> ApiResult<Url> {
        Ok(Url::parse(&format!("{}{}", self.base_url, path))?)
    }

    async fn request<D: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        data: &D,
    ) -> ApiResult<R> {
        let url = self.url(path)?;
        log::debug!("{} {}", method, url.path());

        let resp = self
            .client
            .request(method, url)
            .headers(self.headers.clone())
            .json(data)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }

        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ServiceStatus>(&body) {
            Ok(ServiceStatus { error_code: Some(code), error_description }) => {
                Err(ApiError::Service(ServiceErrorCode {
                    code,
                    msg: error_description.unwrap_or_default(),
                }))
            }
            _ => Err(ApiError::Status { status: status.as_u16(), body }),
        }
    }
}

#[async_trait]
impl MediaService for HttpMediaService {
    async fn new_session(&self, req: NewSessionRequest) -> ApiResult<NewSessionResponse> {
        self.request(Method::POST, "/sessions/new", &req).await
    }

    async fn new_tracks(
        &self,
        session_id: &str,
        req: TracksRequest,
    ) -> ApiResult<TracksResponse> {
        self.request(Method::POST, &format!("/sessions/{}/tracks/new", session_id), &req).await
    }

    async fn renegotiate(
        &self,
        session_id: &str,
        req: RenegotiateRequest,
    ) -> ApiResult<RenegotiateResponse> {
        self.request(Method::PUT, &format!("/sessions/{}/renegotiate", session_id), &req).await
    }

    async fn close_tracks(
        &self,
        session_id: &str,
        req: CloseTracksRequest,
    ) -> ApiResult<CloseTracksResponse> {
        self.request(Method::PUT, &format!("/sessions/{}/tracks/close", session_id), &req).await
    }
}
