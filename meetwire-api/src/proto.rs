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

//! JSON bodies exchanged with the media service. Field names are camelCase on
//! the wire.

use std::fmt::{Display, Formatter};

use meetwire_rtc::session_description::SessionDescription;
use serde::{Deserialize, Serialize};

use crate::services::ServiceErrorCode;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackLocation {
    Local,
    Remote,
}

/// A track as the service knows it. Pushes are sent as `{location: local,
/// mid, trackName}` and pulls as `{location: remote, sessionId, trackName}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackObject {
    pub location: TrackLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
}

/// Identifies a track published by another session. Only [`Self::remote`]
/// builds one, so every descriptor is pulled with `location: remote`.
/// Equality is structural, so two requests for the same track compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackDescriptor {
    session_id: String,
    track_name: String,
}

impl TrackDescriptor {
    pub fn remote(session_id: impl Into<String>, track_name: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), track_name: track_name.into() }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn track_name(&self) -> &str {
        &self.track_name
    }

    pub fn to_track_object(&self) -> TrackObject {
        TrackObject {
            location: TrackLocation::Remote,
            mid: None,
            session_id: Some(self.session_id.clone()),
            track_name: Some(self.track_name.clone()),
        }
    }
}

impl Display for TrackDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.session_id, self.track_name)
    }
}

/// Error fields every response may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl ServiceStatus {
    pub fn error(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self { error_code: Some(code.into()), error_description: Some(description.into()) }
    }

    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    pub fn check(&self) -> Result<(), ServiceErrorCode> {
        match &self.error_code {
            Some(code) => Err(ServiceErrorCode {
                code: code.clone(),
                msg: self.error_description.clone().unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionRequest {
    pub session_description: SessionDescription,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub session_description: Option<SessionDescription>,
    #[serde(flatten)]
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracksRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_description: Option<SessionDescription>,
    pub tracks: Vec<TrackObject>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackResult {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub track_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracksResponse {
    #[serde(default)]
    pub requires_immediate_renegotiation: bool,
    #[serde(default)]
    pub session_description: Option<SessionDescription>,
    #[serde(default)]
    pub tracks: Vec<TrackResult>,
    #[serde(flatten)]
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenegotiateRequest {
    pub session_description: SessionDescription,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenegotiateResponse {
    #[serde(flatten)]
    pub status: ServiceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedTrack {
    pub mid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTracksRequest {
    pub tracks: Vec<ClosedTrack>,
    pub session_description: SessionDescription,
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTracksResponse {
    #[serde(default)]
    pub session_description: Option<SessionDescription>,
    #[serde(default)]
    pub tracks: Vec<TrackResult>,
    #[serde(default)]
    pub requires_immediate_renegotiation: bool,
    #[serde(flatten)]
    pub status: ServiceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use meetwire_rtc::session_description::SdpType;
    use serde_json::json;

    #[test]
    fn push_track_object_omits_missing_fields() {
        let track = TrackObject {
            location: TrackLocation::Local,
            mid: Some("2".into()),
            session_id: None,
            track_name: Some("a1b2".into()),
        };
        assert_eq!(
            serde_json::to_value(&track).unwrap(),
            json!({"location": "local", "mid": "2", "trackName": "a1b2"})
        );
    }

    #[test]
    fn pull_descriptor_wire_shape() {
        let descriptor = TrackDescriptor::remote("s9", "mic");
        assert_eq!(
            serde_json::to_value(descriptor.to_track_object()).unwrap(),
            json!({"location": "remote", "sessionId": "s9", "trackName": "mic"})
        );
    }

    #[test]
    fn descriptor_identity() {
        let descriptor = TrackDescriptor::remote("s9", "mic");
        assert_eq!(descriptor.session_id(), "s9");
        assert_eq!(descriptor.track_name(), "mic");
        assert_eq!(descriptor.to_string(), "s9/mic");
        assert_eq!(descriptor.to_track_object().location, TrackLocation::Remote);
        assert_ne!(descriptor, TrackDescriptor::remote("s9", "cam"));
    }

    #[test]
    fn tracks_response_with_per_track_error() {
        let body = json!({
            "requiresImmediateRenegotiation": true,
            "sessionDescription": {"type": "offer", "sdp": "v=0\r\n"},
            "tracks": [
                {"mid": "4", "trackName": "mic", "sessionId": "s9"},
                {"trackName": "cam", "sessionId": "s9", "errorCode": "not_found", "errorDescription": "no such track"}
            ]
        });
        let resp: TracksResponse = serde_json::from_value(body).unwrap();
        assert!(resp.requires_immediate_renegotiation);
        assert_eq!(resp.session_description.unwrap().sdp_type(), SdpType::Offer);
        assert!(resp.status.check().is_ok());
        assert_eq!(resp.tracks[0].mid.as_deref(), Some("4"));
        let err = resp.tracks[1].status.check().unwrap_err();
        assert_eq!(err.code, "not_found");
        assert_eq!(err.msg, "no such track");
    }

    #[test]
    fn new_session_error_response() {
        let resp: NewSessionResponse =
            serde_json::from_value(json!({"errorCode": "invalid_sdp", "errorDescription": "bad"}))
                .unwrap();
        assert!(resp.session_id.is_none());
        assert!(resp.status.is_error());
    }

    #[test]
    fn close_request_shape() {
        let req = CloseTracksRequest {
            tracks: vec![ClosedTrack { mid: "3".into() }],
            session_description: SessionDescription::parse("v=0\r\n", SdpType::Offer).unwrap(),
            force: false,
        };
        assert_eq!(
            serde_json::to_value(req).unwrap(),
            json!({
                "tracks": [{"mid": "3"}],
                "sessionDescription": {"type": "offer", "sdp": "v=0\r\n"},
                "force": false
            })
        );
    }
}
