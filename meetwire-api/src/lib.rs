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

pub mod proto;
pub mod services;

pub use proto::{TrackDescriptor, TrackLocation, TrackObject};
pub use services::{
    ApiError, ApiOptions, ApiResult, HttpMediaService, MediaService, ServiceErrorCode,
};

pub(crate) fn get_env_keys() -> Result<(String, String), std::env::VarError> {
    let api_url = std::env::var("MEETWIRE_API_URL")?;
    let api_token = std::env::var("MEETWIRE_API_TOKEN")?;
    Ok((api_url, api_token))
}
