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

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::{media_stream_track::MediaStreamTrack, MediaType, RtcError};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RtpTransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RtpTransceiverInit {
    pub direction: RtpTransceiverDirection,
    pub stream_ids: Vec<String>,
}

impl Default for RtpTransceiverInit {
    fn default() -> Self {
        Self { direction: RtpTransceiverDirection::SendRecv, stream_ids: Vec::new() }
    }
}

pub type SharedTransceiver = Arc<dyn RtpTransceiver>;

/// A bidirectional media channel of a [`crate::peer_connection::PeerConnection`].
///
/// The sender side is flattened into the transceiver: swapping the outgoing
/// track never requires a renegotiation.
#[async_trait]
pub trait RtpTransceiver: Debug + Send + Sync {
    /// Negotiation id, assigned once a local description containing this
    /// transceiver has been applied.
    fn mid(&self) -> Option<String>;

    fn media_type(&self) -> MediaType;

    fn direction(&self) -> RtpTransceiverDirection;

    fn set_direction(&self, direction: RtpTransceiverDirection) -> Result<(), RtcError>;

    fn current_direction(&self) -> Option<RtpTransceiverDirection>;

    fn sender_track(&self) -> Option<MediaStreamTrack>;

    fn receiver_track(&self) -> Option<MediaStreamTrack>;

    async fn replace_track(&self, track: Option<MediaStreamTrack>) -> Result<(), RtcError>;

    fn stop(&self) -> Result<(), RtcError>;
}
