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

//! Transport surface consumed by the meetwire engine.
//!
//! The engine never talks to a concrete WebRTC stack directly. A backend (the
//! browser's `RTCPeerConnection`, a native stack, or an in-memory double used
//! in tests) implements [`peer_connection::PeerConnection`],
//! [`rtp_transceiver::RtpTransceiver`] and
//! [`peer_connection_factory::PeerConnectionFactory`].

use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RtcErrorType {
    Internal,
    InvalidSdp,
    InvalidState,
    Closed,
}

#[derive(Error, Debug, Clone)]
#[error("an RtcError occured: {error_type:?} - {message}")]
pub struct RtcError {
    pub error_type: RtcErrorType,
    pub message: String,
}

impl RtcError {
    pub fn new(error_type: RtcErrorType, message: impl Into<String>) -> Self {
        Self { error_type, message: message.into() }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(RtcErrorType::InvalidState, message)
    }

    pub fn closed() -> Self {
        Self::new(RtcErrorType::Closed, "peer connection is closed")
    }
}

pub mod media_stream_track;
pub mod peer_connection;
pub mod peer_connection_factory;
pub mod prelude;
pub mod rtp_transceiver;
pub mod session_description;

pub mod native {
    pub fn create_random_uuid() -> String {
        use uuid::Uuid;
        Uuid::new_v4().to_string()
    }
}
