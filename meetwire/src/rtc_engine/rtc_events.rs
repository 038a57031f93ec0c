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

use std::sync::Arc;

use meetwire_rtc::prelude::*;
use tokio::sync::watch;

use super::peer_transport::ReceivedTracks;

/// Installs the transport callbacks of a connection. Every event is forwarded
/// into the watch channels and the received-track table owned by the
/// [`super::peer_transport::Connection`], so nothing here holds a reference
/// to the connection itself.
pub(super) fn forward_pc_events(
    connection_id: u64,
    peer_connection: &dyn PeerConnection,
    state_tx: watch::Sender<PeerConnectionState>,
    ice_tx: watch::Sender<IceConnectionState>,
    received: Arc<ReceivedTracks>,
) {
    peer_connection
        .on_connection_state_change(Some(on_connection_state_change(connection_id, state_tx)));
    peer_connection
        .on_ice_connection_state_change(Some(on_ice_connection_state_change(connection_id, ice_tx)));
    peer_connection.on_track(Some(on_track(connection_id, received)));
}

fn on_connection_state_change(
    connection_id: u64,
    state_tx: watch::Sender<PeerConnectionState>,
) -> OnConnectionChange {
    Box::new(move |state| {
        log::debug!("connection {} state changed to {:?}", connection_id, state);
        state_tx.send_replace(state);
    })
}

fn on_ice_connection_state_change(
    connection_id: u64,
    ice_tx: watch::Sender<IceConnectionState>,
) -> OnIceConnectionChange {
    Box::new(move |state| {
        log::debug!("connection {} ice state changed to {:?}", connection_id, state);
        ice_tx.send_replace(state);
    })
}

fn on_track(connection_id: u64, received: Arc<ReceivedTracks>) -> OnTrack {
    Box::new(move |event| match event.mid() {
        Some(mid) => {
            log::debug!("connection {} received track {} on mid {}", connection_id, event.track, mid);
            received.insert(mid, event.track);
        }
        None => {
            log::warn!("connection {} received track {} without a mid", connection_id, event.track)
        }
    })
}
