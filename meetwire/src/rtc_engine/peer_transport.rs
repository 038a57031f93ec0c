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

use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use meetwire_rtc::prelude::*;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use super::{rtc_events, scheduler::TaskScheduler, EngineError, EngineResult};

/// Tracks announced by the transport, keyed by mid.
#[derive(Default)]
pub(super) struct ReceivedTracks {
    tracks: Mutex<HashMap<String, MediaStreamTrack>>,
    notify: Notify,
}

impl ReceivedTracks {
    pub fn insert(&self, mid: String, track: MediaStreamTrack) {
        self.tracks.lock().insert(mid, track);
        self.notify.notify_waiters();
    }

    pub fn get(&self, mid: &str) -> Option<MediaStreamTrack> {
        self.tracks.lock().get(mid).cloned()
    }

    async fn wait(&self, mid: &str) -> MediaStreamTrack {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(track) = self.get(mid) {
                return track;
            }

            notified.await;
        }
    }
}

/// One transport connection and everything negotiated over it.
///
/// A connection is never reused once it failed or was closed; the engine
/// builds a new one instead. All local negotiation-document mutations go
/// through [`Connection::schedule`].
pub struct Connection {
    id: u64,
    created_at: Instant,
    peer_connection: Arc<dyn PeerConnection>,
    state: watch::Receiver<PeerConnectionState>,
    ice_state: watch::Receiver<IceConnectionState>,
    received: Arc<ReceivedTracks>,
    scheduler: TaskScheduler,
    closed: AtomicBool,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .field("ice_state", &*self.ice_state.borrow())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        factory: &dyn PeerConnectionFactory,
        config: RtcConfiguration,
    ) -> EngineResult<Arc<Self>> {
        let peer_connection = factory.create_peer_connection(config)?;

        let (state_tx, state) = watch::channel(peer_connection.connection_state());
        let (ice_tx, ice_state) = watch::channel(peer_connection.ice_connection_state());
        let received = Arc::new(ReceivedTracks::default());
        rtc_events::forward_pc_events(
            id,
            peer_connection.as_ref(),
            state_tx,
            ice_tx,
            received.clone(),
        );

        log::debug!("created connection {}", id);

        Ok(Arc::new(Self {
            id,
            created_at: Instant::now(),
            peer_connection,
            state,
            ice_state,
            received,
            scheduler: TaskScheduler::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn peer_connection(&self) -> Arc<dyn PeerConnection> {
        self.peer_connection.clone()
    }

    pub fn state(&self) -> PeerConnectionState {
        *self.state.borrow()
    }

    pub fn ice_state(&self) -> IceConnectionState {
        *self.ice_state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PeerConnectionState> {
        self.state.clone()
    }

    pub fn subscribe_ice_state(&self) -> watch::Receiver<IceConnectionState> {
        self.ice_state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fails with [`EngineError::ConnectionClosed`] once this connection was
    /// superseded or closed. Checked before every negotiation step and after
    /// every remote call.
    pub fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() || self.state().is_terminal() {
            return Err(EngineError::ConnectionClosed);
        }
        Ok(())
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        log::debug!("closing connection {}", self.id);
        self.peer_connection.close();
    }

    /// Runs `task` after every previously scheduled task of this connection
    /// settled.
    pub async fn schedule<F, T>(&self, task: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.scheduler.schedule(task).await.map_err(|_| EngineError::ConnectionClosed)?
    }

    /// Creates an offer for a renegotiation, with DTX enabled on every Opus
    /// payload.
    pub async fn create_offer(&self) -> EngineResult<SessionDescription> {
        let offer = self.peer_connection.create_offer(OfferOptions::default()).await?;

        let munged = munge_opus_dtx(offer.sdp());
        if munged == offer.sdp() {
            return Ok(offer);
        }

        match SessionDescription::parse(&munged, offer.sdp_type()) {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                log::warn!("failed to parse munged SDP, falling back to the original offer: {}", err);
                Ok(offer)
            }
        }
    }

    /// Discards a pending local or remote offer so the next negotiation
    /// starts from a stable state. Does nothing once the connection is closed.
    pub async fn rollback(&self) {
        if self.is_closed() {
            return;
        }

        let res = match self.peer_connection.signaling_state() {
            SignalingState::HaveLocalOffer => {
                self.peer_connection.set_local_description(SessionDescription::rollback()).await
            }
            SignalingState::HaveRemoteOffer => {
                self.peer_connection.set_remote_description(SessionDescription::rollback()).await
            }
            _ => return,
        };

        match res {
            Ok(()) => log::debug!("connection {}: rolled back pending offer", self.id),
            Err(err) => log::warn!("connection {}: failed to roll back pending offer: {}", self.id, err),
        }
    }

    pub async fn wait_ice_connected(&self, timeout: Duration) -> EngineResult<()> {
        let mut ice_state = self.ice_state.clone();
        let wait = async {
            loop {
                let state = *ice_state.borrow_and_update();
                if state.is_connected() {
                    return Ok(());
                }
                if state.is_terminal() || self.is_closed() {
                    return Err(EngineError::ConnectionClosed);
                }
                if ice_state.changed().await.is_err() {
                    return Err(EngineError::ConnectionClosed);
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            EngineError::Connection(format!("ice of connection {} did not connect in time", self.id))
        })?
    }

    /// Waits until the transport announced an incoming track on `mid`.
    pub async fn wait_for_track(
        &self,
        mid: &str,
        timeout: Duration,
    ) -> EngineResult<MediaStreamTrack> {
        tokio::time::timeout(timeout, self.received.wait(mid))
            .await
            .map_err(|_| EngineError::ResolveTimeout(mid.to_owned()))
    }
}

/// Adds `usedtx=1` to the fmtp line of every Opus payload type, replacing an
/// existing `usedtx` value. Payloads without an fmtp line are left alone.
fn munge_opus_dtx(sdp: &str) -> String {
    let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = sdp.split(eol).collect();

    let mut opus_pts: Vec<&str> = Vec::new();
    for line in &lines {
        if let Some(rest) = line.trim().strip_prefix("a=rtpmap:") {
            let mut it = rest.split_whitespace();
            let pt = it.next().unwrap_or("");
            let codec = it.next().unwrap_or("");
            if codec.to_ascii_lowercase().starts_with("opus/48000") && !pt.is_empty() {
                opus_pts.push(pt);
            }
        }
    }
    if opus_pts.is_empty() {
        return sdp.to_string();
    }

    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for line in &lines {
        let mut rewritten = line.to_string();

        for pt in &opus_pts {
            let prefix = format!("a=fmtp:{pt} ");
            if rewritten.starts_with(&prefix) {
                if let Some(pos) = rewritten.find("usedtx=") {
                    let end = rewritten[pos..].find(';').map(|i| pos + i).unwrap_or(rewritten.len());
                    rewritten.replace_range(pos..end, "usedtx=1");
                } else {
                    rewritten.push_str(";usedtx=1");
                }
                break;
            }
        }

        out.push(rewritten);
    }

    let mut munged = out.join(eol);
    if !munged.ends_with(eol) {
        munged.push_str(eol);
    }
    munged
}
