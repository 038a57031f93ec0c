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

use meetwire_api::TrackObject;
use meetwire_rtc::{native::create_random_uuid, prelude::*};
use tokio::sync::watch;

use super::Interrupt;
use crate::{
    rtc_engine::{EngineError, EngineInner, EngineResult, PushRequest, Session},
    utils::cancel::{cancel_pair, CancelGuard, CancelSignal},
};

#[derive(Debug, Clone)]
pub enum PushState {
    /// Waiting for a track and a session.
    Registered,
    TransceiverCreated,
    Batched,
    Negotiating,
    Published(TrackObject),
    Failed(EngineError),
    Closing,
    Closed,
}

/// Handle to a pushed track. Dropping it closes the track.
#[derive(Debug)]
pub struct LocalTrackPublication {
    track_name: String,
    state: watch::Receiver<PushState>,
    _guard: CancelGuard,
}

impl LocalTrackPublication {
    /// Stable name the track is published under, kept across rebuilds.
    pub fn track_name(&self) -> &str {
        &self.track_name
    }

    pub fn state(&self) -> PushState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PushState> {
        self.state.clone()
    }

    /// Waits for the track to be published, or for the pipeline to give up.
    pub async fn published(&self) -> EngineResult<TrackObject> {
        let mut state = self.state.clone();
        let state = state
            .wait_for(|state| {
                matches!(state, PushState::Published(_) | PushState::Failed(_) | PushState::Closed)
            })
            .await
            .map_err(|_| EngineError::Closed)?
            .clone();

        match state {
            PushState::Published(track) => Ok(track),
            PushState::Failed(err) => Err(err),
            _ => Err(EngineError::Closed),
        }
    }

    /// Closes the track and waits until the media service was told.
    pub async fn unpublish(self) {
        let mut state = self.state.clone();
        drop(self);
        let _ = state
            .wait_for(|state| matches!(state, PushState::Closed | PushState::Failed(_)))
            .await;
    }
}

struct Publication {
    session: Arc<Session>,
    transceiver: SharedTransceiver,
    track: TrackObject,
}

struct PushTask {
    engine: Arc<EngineInner>,
    track_name: String,
    source: watch::Receiver<Option<MediaStreamTrack>>,
    source_closed: bool,
    state: Arc<watch::Sender<PushState>>,
    cancel: CancelSignal,
}

pub(crate) fn spawn(
    engine: Arc<EngineInner>,
    source: watch::Receiver<Option<MediaStreamTrack>>,
) -> LocalTrackPublication {
    let track_name = create_random_uuid();
    let (state_tx, state_rx) = watch::channel(PushState::Registered);
    let (guard, cancel) = cancel_pair();

    let task = PushTask {
        engine,
        track_name: track_name.clone(),
        source,
        source_closed: false,
        state: Arc::new(state_tx),
        cancel,
    };
    tokio::spawn(task.run());

    LocalTrackPublication { track_name, state: state_rx, _guard: guard }
}

impl PushTask {
    async fn run(mut self) {
        let Some(mut track) = self.first_track().await else {
            self.set_state(PushState::Closed);
            return;
        };

        loop {
            let publication = match self.publish_with_retry(&track).await {
                Ok(Some(publication)) => publication,
                Ok(None) | Err(EngineError::Closed) => {
                    self.set_state(PushState::Closed);
                    return;
                }
                Err(err) => {
                    log::error!("failed to publish track {}: {}", self.track_name, err);
                    self.set_state(PushState::Failed(err));
                    return;
                }
            };

            log::info!(
                "published track {} on mid {:?} of session {}",
                self.track_name,
                publication.track.mid,
                publication.session.session_id()
            );
            self.set_state(PushState::Published(publication.track.clone()));

            match self.supervise(&publication, &mut track).await {
                Interrupt::Cancelled => {
                    self.close(publication).await;
                    return;
                }
                Interrupt::SessionChanged => {
                    log::info!("session changed, republishing track {}", self.track_name);
                    self.set_state(PushState::Registered);
                }
                Interrupt::EngineClosed => {
                    self.set_state(PushState::Closed);
                    return;
                }
            }
        }
    }

    fn set_state(&self, state: PushState) {
        self.state.send_replace(state);
    }

    async fn first_track(&mut self) -> Option<MediaStreamTrack> {
        loop {
            let current = self.source.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                res = self.source.changed() => {
                    if res.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn publish_with_retry(
        &self,
        track: &MediaStreamTrack,
    ) -> EngineResult<Option<Publication>> {
        let options = self.engine.options();
        let mut attempt = 0;
        loop {
            match self.publish(track).await {
                Ok(publication) => return Ok(publication),
                Err(EngineError::Closed) => return Err(EngineError::Closed),
                Err(err) if attempt < options.max_retries => {
                    attempt += 1;
                    log::warn!(
                        "publishing track {} failed (attempt {}/{}): {}",
                        self.track_name,
                        attempt,
                        options.max_retries + 1,
                        err
                    );

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(options.retry_delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns `None` when the handle was dropped before anything was sent to
    /// the media service.
    async fn publish(&self, track: &MediaStreamTrack) -> EngineResult<Option<Publication>> {
        let session = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            session = self.engine.wait_session() => session?,
        };

        let transceiver = session.connection().peer_connection().add_transceiver(
            track.clone(),
            RtpTransceiverInit { direction: RtpTransceiverDirection::SendOnly, stream_ids: vec![] },
        )?;
        self.set_state(PushState::TransceiverCreated);

        // Give the owner one tick to drop the handle before anything goes out
        tokio::task::yield_now().await;
        if self.cancel.is_cancelled() {
            log::debug!("track {} dropped before it was registered", self.track_name);
            let _ = transceiver.stop();
            return Ok(None);
        }

        let result = session.push_track(
            self.track_name.clone(),
            PushRequest { transceiver: transceiver.clone(), state: self.state.clone() },
        );
        self.set_state(PushState::Batched);

        match result.await {
            Ok(track) => Ok(Some(Publication { session, transceiver, track })),
            Err(err) => {
                let _ = transceiver.stop();
                Err(err)
            }
        }
    }

    async fn supervise(
        &mut self,
        publication: &Publication,
        track: &mut MediaStreamTrack,
    ) -> Interrupt {
        let mut sessions = self.engine.subscribe_session();
        loop {
            let slot = sessions.borrow_and_update().clone();
            if let Some(interrupt) = Interrupt::from_slot(&slot, &publication.session) {
                return interrupt;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Interrupt::Cancelled,
                res = sessions.changed() => {
                    if res.is_err() {
                        return Interrupt::EngineClosed;
                    }
                },
                res = self.source.changed(), if !self.source_closed => {
                    if res.is_err() {
                        self.source_closed = true;
                        continue;
                    }

                    let next = self.source.borrow_and_update().clone();
                    if let Some(next) = next.filter(|next| *next != *track) {
                        log::debug!("replacing track {} with {}", self.track_name, next);
                        if let Err(err) = publication.transceiver.replace_track(Some(next.clone())).await {
                            log::warn!("failed to replace track {}: {}", self.track_name, err);
                        }
                        *track = next;
                    }
                }
            }
        }
    }

    async fn close(&self, publication: Publication) {
        self.set_state(PushState::Closing);
        if let Some(mid) = publication.track.mid.clone() {
            if let Err(err) = publication.session.close_track(mid).await {
                log::warn!("failed to close track {}: {}", self.track_name, err);
            }
        }
        log::info!("closed track {}", self.track_name);
        self.set_state(PushState::Closed);
    }
}
