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

use std::fmt::Debug;

use async_trait::async_trait;

use crate::{
    media_stream_track::MediaStreamTrack,
    rtp_transceiver::{RtpTransceiverInit, SharedTransceiver},
    session_description::SessionDescription,
    MediaType, RtcError,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Failed and Closed end the life of a connection instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveLocalPrAnswer,
    HaveRemoteOffer,
    HaveRemotePrAnswer,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct OfferOptions {
    pub ice_restart: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {}

/// Raised when the remote side starts sending on a transceiver.
#[derive(Debug, Clone)]
pub struct TrackEvent {
    pub track: MediaStreamTrack,
    pub transceiver: SharedTransceiver,
}

impl TrackEvent {
    pub fn mid(&self) -> Option<String> {
        self.transceiver.mid()
    }
}

pub type OnConnectionChange = Box<dyn FnMut(PeerConnectionState) + Send + Sync>;
pub type OnIceConnectionChange = Box<dyn FnMut(IceConnectionState) + Send + Sync>;
pub type OnTrack = Box<dyn FnMut(TrackEvent) + Send + Sync>;

/// A single transport connection and the negotiation document it holds.
///
/// Callbacks may be invoked from any thread and must not block.
#[async_trait]
pub trait PeerConnection: Debug + Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, RtcError>;

    async fn create_answer(&self, options: AnswerOptions)
        -> Result<SessionDescription, RtcError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError>;

    fn add_transceiver(
        &self,
        track: MediaStreamTrack,
        init: RtpTransceiverInit,
    ) -> Result<SharedTransceiver, RtcError>;

    fn add_transceiver_for_media(
        &self,
        media_type: MediaType,
        init: RtpTransceiverInit,
    ) -> Result<SharedTransceiver, RtcError>;

    fn transceivers(&self) -> Vec<SharedTransceiver>;

    fn close(&self);

    fn connection_state(&self) -> PeerConnectionState;

    fn ice_connection_state(&self) -> IceConnectionState;

    fn signaling_state(&self) -> SignalingState;

    fn current_local_description(&self) -> Option<SessionDescription>;

    fn current_remote_description(&self) -> Option<SessionDescription>;

    fn on_connection_state_change(&self, f: Option<OnConnectionChange>);

    fn on_ice_connection_state_change(&self, f: Option<OnIceConnectionChange>);

    fn on_track(&self, f: Option<OnTrack>);

    fn transceiver_by_mid(&self, mid: &str) -> Option<SharedTransceiver> {
        self.transceivers().into_iter().find(|t| t.mid().as_deref() == Some(mid))
    }
}
