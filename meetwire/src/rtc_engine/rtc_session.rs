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

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_util::FutureExt;
use meetwire_api::{
    proto::{
        ClosedTrack, CloseTracksRequest, NewSessionRequest, RenegotiateRequest, TrackResult,
        TracksRequest,
    },
    MediaService, TrackDescriptor, TrackLocation, TrackObject,
};
use meetwire_rtc::prelude::*;
use tokio::sync::watch;

use super::{
    dispatcher::{BatchOutput, BatchResult, BulkRequestDispatcher},
    peer_transport::Connection,
    EngineError, EngineOptions, EngineResult,
};
use crate::track::PushState;

/// A push waiting for negotiation. `state` is moved to
/// [`PushState::Negotiating`] when the batch starts.
#[derive(Debug, Clone)]
pub(crate) struct PushRequest {
    pub transceiver: SharedTransceiver,
    pub state: Arc<watch::Sender<PushState>>,
}

type PushDispatcher = BulkRequestDispatcher<String, PushRequest, TrackObject, EngineError>;
type PullDispatcher = BulkRequestDispatcher<TrackDescriptor, (), String, EngineError>;
type CloseDispatcher = BulkRequestDispatcher<String, (), (), EngineError>;

/// What the batch executors of one session share.
#[derive(Debug)]
struct SessionContext {
    session_id: String,
    connection: Arc<Connection>,
    service: Arc<dyn MediaService>,
    session_connect_timeout: Duration,
}

/// A remote session bound to exactly one [`Connection`].
#[derive(Debug)]
pub struct Session {
    ctx: Arc<SessionContext>,
    push_dispatcher: PushDispatcher,
    pull_dispatcher: PullDispatcher,
    close_dispatcher: CloseDispatcher,
}

impl Session {
    /// Creates the remote session for `connection` and waits for ICE to
    /// connect. Every failure is reported as [`EngineError::SessionCreation`].
    pub(crate) async fn negotiate(
        connection: Arc<Connection>,
        service: Arc<dyn MediaService>,
        options: &EngineOptions,
    ) -> EngineResult<Arc<Self>> {
        let session_id = connection
            .schedule({
                let connection = connection.clone();
                let service = service.clone();
                async move { create_session(&connection, service.as_ref()).await }
            })
            .await
            .map_err(EngineError::into_session_creation)?;

        connection
            .wait_ice_connected(options.session_connect_timeout)
            .await
            .map_err(EngineError::into_session_creation)?;

        log::info!("session {} ready on connection {}", session_id, connection.id());
        Ok(Arc::new(Self::new(session_id, connection, service, options)))
    }

    fn new(
        session_id: String,
        connection: Arc<Connection>,
        service: Arc<dyn MediaService>,
        options: &EngineOptions,
    ) -> Self {
        let ctx = Arc::new(SessionContext {
            session_id,
            connection,
            service,
            session_connect_timeout: options.session_connect_timeout,
        });

        let push_dispatcher =
            BulkRequestDispatcher::new(options.max_batch_size, options.flush_delay, {
                let ctx = ctx.clone();
                move |requests| push_tracks(ctx.clone(), requests).boxed()
            });
        let pull_dispatcher =
            BulkRequestDispatcher::new(options.max_batch_size, options.flush_delay, {
                let ctx = ctx.clone();
                move |requests| pull_tracks(ctx.clone(), requests).boxed()
            });
        let close_dispatcher =
            BulkRequestDispatcher::new(options.max_batch_size, options.flush_delay, {
                let ctx = ctx.clone();
                move |requests| close_tracks(ctx.clone(), requests).boxed()
            });

        Self { ctx, push_dispatcher, pull_dispatcher, close_dispatcher }
    }

    pub fn session_id(&self) -> &str {
        &self.ctx.session_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.ctx.connection
    }

    /// Registers a send-only transceiver for publishing under `track_name`.
    pub(crate) fn push_track(
        &self,
        track_name: String,
        request: PushRequest,
    ) -> BatchResult<TrackObject, EngineError> {
        self.push_dispatcher.register(track_name, request)
    }

    /// Resolves to the local mid the remote track will be received on.
    pub(crate) fn pull_track(&self, descriptor: TrackDescriptor) -> BatchResult<String, EngineError> {
        self.pull_dispatcher.register(descriptor, ())
    }

    pub(crate) fn close_track(&self, mid: String) -> BatchResult<(), EngineError> {
        self.close_dispatcher.register(mid, ())
    }
}

async fn create_session(
    connection: &Connection,
    service: &dyn MediaService,
) -> EngineResult<String> {
    connection.ensure_open()?;
    let peer_connection = connection.peer_connection();

    // The remote side rejects an offer without any media section
    peer_connection.add_transceiver_for_media(
        MediaType::Audio,
        RtpTransceiverInit { direction: RtpTransceiverDirection::Inactive, ..Default::default() },
    )?;

    let offer = peer_connection.create_offer(OfferOptions::default()).await?;
    peer_connection.set_local_description(offer.clone()).await?;

    let resp = service.new_session(NewSessionRequest { session_description: offer }).await?;
    connection.ensure_open()?;
    resp.status.check().map_err(|err| EngineError::SessionCreation(err.to_string()))?;

    let session_id = resp
        .session_id
        .ok_or_else(|| EngineError::SessionCreation("response has no session id".to_owned()))?;

    if let Some(answer) = resp.session_description {
        peer_connection.set_remote_description(answer).await?;
    }

    Ok(session_id)
}

async fn push_tracks(
    ctx: Arc<SessionContext>,
    requests: Vec<(String, PushRequest)>,
) -> BatchOutput<String, TrackObject, EngineError> {
    log::debug!("session {}: pushing {} tracks", ctx.session_id, requests.len());

    let task_ctx = ctx.clone();
    let results = ctx
        .connection
        .schedule(async move {
            let ctx = task_ctx;
            let connection = &ctx.connection;
            for (_, request) in &requests {
                request.state.send_replace(PushState::Negotiating);
            }

            connection.ensure_open()?;
            let peer_connection = connection.peer_connection();
            let offer = connection.create_offer().await?;
            peer_connection.set_local_description(offer.clone()).await?;

            let exchanged: EngineResult<_> = async {
                let mut tracks = Vec::with_capacity(requests.len());
                for (track_name, request) in &requests {
                    let mid = request.transceiver.mid().ok_or_else(|| {
                        EngineError::Internal(format!("transceiver of {} has no mid", track_name))
                    })?;
                    tracks.push(TrackObject {
                        location: TrackLocation::Local,
                        mid: Some(mid),
                        session_id: None,
                        track_name: Some(track_name.clone()),
                    });
                }

                let resp = ctx
                    .service
                    .new_tracks(
                        &ctx.session_id,
                        TracksRequest { session_description: Some(offer), tracks },
                    )
                    .await?;
                connection.ensure_open()?;
                resp.status.check().map_err(|err| EngineError::TrackOperation(err.to_string()))?;

                let answer = resp.session_description.ok_or_else(|| {
                    EngineError::TrackOperation(
                        "push response has no session description".to_owned(),
                    )
                })?;
                peer_connection.set_remote_description(answer).await?;
                Ok(resp.tracks)
            }
            .await;

            if exchanged.is_err() {
                connection.rollback().await;
            }
            let tracks = exchanged?;

            connection.wait_ice_connected(ctx.session_connect_timeout).await?;
            Ok(tracks)
        })
        .await?;

    let mut output = HashMap::with_capacity(results.len());
    for track in results {
        let Some(track_name) = track.track_name.clone() else {
            log::warn!("session {}: push result without track name", ctx.session_id);
            continue;
        };

        let result = track_result(&track).map(|_| TrackObject {
            location: TrackLocation::Local,
            mid: track.mid.clone(),
            session_id: Some(ctx.session_id.clone()),
            track_name: Some(track_name.clone()),
        });
        output.insert(track_name, result);
    }

    Ok(output)
}

async fn pull_tracks(
    ctx: Arc<SessionContext>,
    requests: Vec<(TrackDescriptor, ())>,
) -> BatchOutput<TrackDescriptor, String, EngineError> {
    log::debug!("session {}: pulling {} tracks", ctx.session_id, requests.len());

    let descriptors: Vec<TrackDescriptor> =
        requests.into_iter().map(|(descriptor, _)| descriptor).collect();

    let task_ctx = ctx.clone();
    let tracks: Vec<TrackObject> =
        descriptors.iter().map(TrackDescriptor::to_track_object).collect();
    let results = ctx
        .connection
        .schedule(async move {
            let ctx = task_ctx;
            let connection = &ctx.connection;
            connection.ensure_open()?;

            let resp = ctx
                .service
                .new_tracks(&ctx.session_id, TracksRequest { session_description: None, tracks })
                .await?;
            connection.ensure_open()?;
            resp.status.check().map_err(|err| EngineError::TrackOperation(err.to_string()))?;

            if resp.requires_immediate_renegotiation {
                let offer = resp.session_description.ok_or_else(|| {
                    EngineError::TrackOperation("renegotiation requested without an offer".to_owned())
                })?;

                let peer_connection = connection.peer_connection();
                peer_connection.set_remote_description(offer).await?;

                let exchanged: EngineResult<()> = async {
                    let answer = peer_connection.create_answer(AnswerOptions::default()).await?;
                    peer_connection.set_local_description(answer.clone()).await?;

                    let renegotiated = ctx
                        .service
                        .renegotiate(
                            &ctx.session_id,
                            RenegotiateRequest { session_description: answer },
                        )
                        .await?;
                    connection.ensure_open()?;
                    renegotiated
                        .status
                        .check()
                        .map_err(|err| EngineError::TrackOperation(err.to_string()))?;
                    Ok(())
                }
                .await;

                if exchanged.is_err() {
                    connection.rollback().await;
                }
                exchanged?;

                connection.wait_ice_connected(ctx.session_connect_timeout).await?;
            }

            Ok(resp.tracks)
        })
        .await?;

    let mut output = HashMap::with_capacity(results.len());
    for (index, track) in results.into_iter().enumerate() {
        let descriptor = match (&track.session_id, &track.track_name) {
            (Some(session_id), Some(track_name)) => {
                TrackDescriptor::remote(session_id.clone(), track_name.clone())
            }
            // Results come back in request order
            _ => match descriptors.get(index) {
                Some(descriptor) => descriptor.clone(),
                None => {
                    log::warn!("session {}: unexpected pull result {:?}", ctx.session_id, track);
                    continue;
                }
            },
        };

        let result = track_result(&track).and_then(|_| {
            track.mid.clone().ok_or_else(|| {
                EngineError::TrackOperation(format!("no mid assigned to {}", descriptor))
            })
        });
        output.insert(descriptor, result);
    }

    Ok(output)
}

/// Stops sending and receiving on the given mids and tells the remote side.
/// Nothing happens unless the connection is live; mids without a transceiver
/// are dropped from the batch.
async fn close_tracks(
    ctx: Arc<SessionContext>,
    requests: Vec<(String, ())>,
) -> BatchOutput<String, (), EngineError> {
    let mids: Vec<String> = requests.into_iter().map(|(mid, _)| mid).collect();

    let task_ctx = ctx.clone();
    let task_mids = mids.clone();
    ctx.connection
        .schedule(async move {
            let ctx = task_ctx;
            let connection = &ctx.connection;
            if connection.is_closed() || !connection.is_connected() {
                log::debug!(
                    "session {}: connection is not live, skipping close of {:?}",
                    ctx.session_id,
                    task_mids
                );
                return Ok(());
            }

            let peer_connection = connection.peer_connection();
            let mut closing = Vec::with_capacity(task_mids.len());
            for mid in task_mids {
                match peer_connection.transceiver_by_mid(&mid) {
                    Some(transceiver) => {
                        transceiver.set_direction(RtpTransceiverDirection::Inactive)?;
                        closing.push(ClosedTrack { mid });
                    }
                    None => log::debug!("session {}: no transceiver for mid {}", ctx.session_id, mid),
                }
            }
            if closing.is_empty() {
                return Ok(());
            }

            let offer = connection.create_offer().await?;
            peer_connection.set_local_description(offer.clone()).await?;

            let exchanged: EngineResult<()> = async {
                let resp = ctx
                    .service
                    .close_tracks(
                        &ctx.session_id,
                        CloseTracksRequest {
                            tracks: closing,
                            session_description: offer,
                            force: false,
                        },
                    )
                    .await?;
                connection.ensure_open()?;
                resp.status.check().map_err(|err| EngineError::TrackOperation(err.to_string()))?;

                for track in &resp.tracks {
                    if let Err(err) = track.status.check() {
                        log::warn!(
                            "session {}: failed to close {:?}: {}",
                            ctx.session_id,
                            track.mid,
                            err
                        );
                    }
                }

                let answer = resp.session_description.ok_or_else(|| {
                    EngineError::TrackOperation(
                        "close response has no session description".to_owned(),
                    )
                })?;
                peer_connection.set_remote_description(answer).await?;
                Ok(())
            }
            .await;

            if exchanged.is_err() {
                connection.rollback().await;
            }
            exchanged
        })
        .await?;

    Ok(mids.into_iter().map(|mid| (mid, Ok(()))).collect())
}

fn track_result(track: &TrackResult) -> EngineResult<()> {
    track.status.check().map_err(|err| EngineError::TrackOperation(err.to_string()))
}

