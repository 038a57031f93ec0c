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
    sync::{Arc, Weak},
};

use meetwire_api::TrackDescriptor;
use meetwire_rtc::prelude::*;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::Interrupt;
use crate::{
    rtc_engine::{EngineError, EngineInner, EngineResult, Session},
    utils::cancel::{cancel_pair, CancelGuard, CancelSignal},
};

/// A remote track as received on the local connection.
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub descriptor: TrackDescriptor,
    /// Local mid the track is received on.
    pub mid: String,
    pub track: MediaStreamTrack,
}

#[derive(Debug, Clone)]
pub enum PullState {
    Requested,
    Batched,
    Resolving,
    Subscribed(RemoteTrack),
    Failed(EngineError),
    Closing,
    Closed,
}

#[derive(Debug)]
pub(crate) struct PullShared {
    descriptor: TrackDescriptor,
    state: watch::Receiver<PullState>,
    _guard: CancelGuard,
}

/// Handle to a pulled track. Clones share the same pull, which is closed when
/// the last one is dropped.
#[derive(Debug, Clone)]
pub struct RemoteTrackSubscription {
    shared: Arc<PullShared>,
}

impl RemoteTrackSubscription {
    pub fn descriptor(&self) -> &TrackDescriptor {
        &self.shared.descriptor
    }

    pub fn state(&self) -> PullState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PullState> {
        self.shared.state.clone()
    }

    /// Waits for the remote track to be received, or for the pull to give up.
    pub async fn track(&self) -> EngineResult<RemoteTrack> {
        let mut state = self.shared.state.clone();
        let state = state
            .wait_for(|state| {
                matches!(state, PullState::Subscribed(_) | PullState::Failed(_) | PullState::Closed)
            })
            .await
            .map_err(|_| EngineError::Closed)?
            .clone();

        match state {
            PullState::Subscribed(track) => Ok(track),
            PullState::Failed(err) => Err(err),
            _ => Err(EngineError::Closed),
        }
    }

    /// Drops this handle. If it was the last one, waits until the media
    /// service was told to stop forwarding the track.
    pub async fn unsubscribe(self) {
        let Ok(shared) = Arc::try_unwrap(self.shared) else {
            return;
        };

        let mut state = shared.state.clone();
        drop(shared);
        let _ = state
            .wait_for(|state| matches!(state, PullState::Closed | PullState::Failed(_)))
            .await;
    }
}

/// Live pulls by descriptor, so equal subscriptions share one pipeline.
#[derive(Debug, Default)]
pub(crate) struct PullRegistry {
    pulls: Mutex<HashMap<TrackDescriptor, Weak<PullShared>>>,
}

pub(crate) fn subscribe(
    engine: &Arc<EngineInner>,
    descriptor: TrackDescriptor,
) -> RemoteTrackSubscription {
    let mut pulls = engine.pulls.pulls.lock();
    if let Some(shared) = pulls.get(&descriptor).and_then(Weak::upgrade) {
        log::debug!("joining existing pull of {}", descriptor);
        return RemoteTrackSubscription { shared };
    }
    pulls.retain(|_, pull| pull.strong_count() > 0);

    let (state_tx, state_rx) = watch::channel(PullState::Requested);
    let (guard, cancel) = cancel_pair();
    let shared =
        Arc::new(PullShared { descriptor: descriptor.clone(), state: state_rx, _guard: guard });
    pulls.insert(descriptor.clone(), Arc::downgrade(&shared));

    let task = PullTask { engine: engine.clone(), descriptor, state: state_tx, cancel };
    tokio::spawn(task.run());

    RemoteTrackSubscription { shared }
}

struct Subscribed {
    session: Arc<Session>,
    remote: RemoteTrack,
}

struct PullTask {
    engine: Arc<EngineInner>,
    descriptor: TrackDescriptor,
    state: watch::Sender<PullState>,
    cancel: CancelSignal,
}

impl PullTask {
    async fn run(self) {
        loop {
            let subscribed = match self.pull_with_retry().await {
                Ok(Some(subscribed)) => subscribed,
                Ok(None) | Err(EngineError::Closed) => {
                    self.set_state(PullState::Closed);
                    return;
                }
                Err(err) => {
                    log::error!("failed to pull {}: {}", self.descriptor, err);
                    self.set_state(PullState::Failed(err));
                    return;
                }
            };

            log::info!(
                "pulled {} on mid {} of session {}",
                self.descriptor,
                subscribed.remote.mid,
                subscribed.session.session_id()
            );
            self.set_state(PullState::Subscribed(subscribed.remote.clone()));

            match self.supervise(&subscribed.session).await {
                Interrupt::Cancelled => {
                    self.close(&subscribed.session, subscribed.remote.mid).await;
                    return;
                }
                Interrupt::SessionChanged => {
                    log::info!("session changed, pulling {} again", self.descriptor);
                    self.set_state(PullState::Requested);
                }
                Interrupt::EngineClosed => {
                    self.set_state(PullState::Closed);
                    return;
                }
            }
        }
    }

    fn set_state(&self, state: PullState) {
        self.state.send_replace(state);
    }

    async fn pull_with_retry(&self) -> EngineResult<Option<Subscribed>> {
        let options = self.engine.options();
        let mut attempt = 0;
        loop {
            match self.pull().await {
                Ok(subscribed) => return Ok(subscribed),
                Err(EngineError::Closed) => return Err(EngineError::Closed),
                Err(err) if attempt < options.max_retries => {
                    attempt += 1;
                    log::warn!(
                        "pulling {} failed (attempt {}/{}): {}",
                        self.descriptor,
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

    async fn pull(&self) -> EngineResult<Option<Subscribed>> {
        let options = self.engine.options();
        let session = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            session = self.engine.wait_session() => session?,
        };
        let connection = session.connection();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            res = connection.wait_ice_connected(options.session_connect_timeout) => res?,
        }

        tokio::task::yield_now().await;
        if self.cancel.is_cancelled() {
            log::debug!("pull of {} dropped before it was registered", self.descriptor);
            return Ok(None);
        }

        let mid = session.pull_track(self.descriptor.clone());
        self.set_state(PullState::Batched);
        let mid = mid.await?;

        self.set_state(PullState::Resolving);
        let resolved = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            res = connection.wait_for_track(&mid, options.track_resolve_timeout) => Some(res),
        };

        match resolved {
            Some(Ok(track)) => Ok(Some(Subscribed {
                remote: RemoteTrack { descriptor: self.descriptor.clone(), mid, track },
                session,
            })),
            Some(Err(err)) => {
                // Release the mid so the remote side stops forwarding
                let _ = session.close_track(mid);
                Err(err)
            }
            None => {
                self.close(&session, mid).await;
                Ok(None)
            }
        }
    }

    async fn supervise(&self, session: &Arc<Session>) -> Interrupt {
        let mut sessions = self.engine.subscribe_session();
        loop {
            let slot = sessions.borrow_and_update().clone();
            if let Some(interrupt) = Interrupt::from_slot(&slot, session) {
                return interrupt;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Interrupt::Cancelled,
                res = sessions.changed() => {
                    if res.is_err() {
                        return Interrupt::EngineClosed;
                    }
                }
            }
        }
    }

    async fn close(&self, session: &Session, mid: String) {
        self.set_state(PullState::Closing);
        if let Err(err) = session.close_track(mid).await {
            log::warn!("failed to close pull of {}: {}", self.descriptor, err);
        }
        log::info!("closed pull of {}", self.descriptor);
        self.set_state(PullState::Closed);
    }
}
