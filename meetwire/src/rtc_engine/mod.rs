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
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use meetwire_api::{ApiError, ApiOptions, HttpMediaService, MediaService, TrackDescriptor};
use meetwire_rtc::prelude::*;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::track::{
    pull::{self, PullRegistry},
    push, LocalTrackPublication, RemoteTrackSubscription,
};

mod dispatcher;
mod peer_transport;
mod rtc_events;
mod rtc_session;
mod scheduler;

pub use dispatcher::{BatchOutput, BatchResult, BulkRequestDispatcher, DispatchError};
pub use peer_transport::Connection;
pub(crate) use rtc_session::PushRequest;
pub use rtc_session::Session;
pub use scheduler::{Scheduled, TaskDropped, TaskScheduler};

pub type EngineEmitter = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;
pub type EngineResult<T> = Result<T, EngineError>;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 32;
pub const SESSION_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DISCONNECT_GRACE_PERIOD: Duration = Duration::from_secs(7);
pub const TRACK_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
pub const TRACK_RETRY_ATTEMPTS: u32 = 2;
pub const TRACK_RETRY_DELAY: Duration = Duration::from_millis(250);
pub const REBUILD_ATTEMPTS: u32 = 10;
pub const REBUILD_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("session creation failed: {0}")]
    SessionCreation(String),
    #[error("track operation failed: {0}")]
    TrackOperation(String),
    #[error("no track was received on mid {0} in time")]
    ResolveTimeout(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("the connection was superseded or closed")]
    ConnectionClosed,
    #[error("the engine is closed")]
    Closed,
    #[error("internal webrtc failure: {0}")]
    Rtc(#[from] RtcError),
    #[error("media service failure: {0}")]
    Api(Arc<ApiError>),
    #[error("dispatch failure: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("internal error: {0}")]
    Internal(String), // Unexpected error
}

impl From<ApiError> for EngineError {
    fn from(err: ApiError) -> Self {
        Self::Api(Arc::new(err))
    }
}

impl EngineError {
    pub(crate) fn into_session_creation(self) -> Self {
        match self {
            Self::SessionCreation(_) => self,
            other => Self::SessionCreation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildReason {
    Failed,
    Closed,
    DisconnectTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientInitiated,
    RebuildFailed,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConnectionStateChanged { connection_id: u64, state: PeerConnectionState },
    SessionReady { connection_id: u64, session_id: String },
    /// The current connection is being replaced. Published tracks are
    /// republished and subscriptions pulled again once the next session is
    /// ready.
    Rebuilding { connection_id: u64, reason: RebuildReason },
    SessionFailed { error: EngineError },
    Disconnected { reason: DisconnectReason },
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub rtc_config: RtcConfiguration,
    pub max_batch_size: usize,
    /// Extra time a batch stays open after its first request. Zero flushes on
    /// the next scheduler tick.
    pub flush_delay: Duration,
    pub session_connect_timeout: Duration,
    /// How long a disconnected connection may take to recover on its own.
    pub disconnect_grace_period: Duration,
    pub track_resolve_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_rebuild_attempts: u32,
    pub rebuild_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            rtc_config: RtcConfiguration::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_delay: Duration::ZERO,
            session_connect_timeout: SESSION_CONNECT_TIMEOUT,
            disconnect_grace_period: DISCONNECT_GRACE_PERIOD,
            track_resolve_timeout: TRACK_RESOLVE_TIMEOUT,
            max_retries: TRACK_RETRY_ATTEMPTS,
            retry_delay: TRACK_RETRY_DELAY,
            max_rebuild_attempts: REBUILD_ATTEMPTS,
            rebuild_interval: REBUILD_INTERVAL,
        }
    }
}

/// Current session as seen by the track pipelines.
#[derive(Debug, Clone)]
pub(crate) enum SessionSlot {
    Pending,
    Ready(Arc<Session>),
    Closed,
}

pub(crate) struct EngineInner {
    options: EngineOptions,
    factory: Arc<dyn PeerConnectionFactory>,
    service: Arc<dyn MediaService>,
    engine_tx: EngineEmitter,
    session_tx: watch::Sender<SessionSlot>,
    state_tx: watch::Sender<PeerConnectionState>,
    pub(crate) pulls: PullRegistry,
    running_handle: Mutex<Option<(JoinHandle<()>, oneshot::Sender<()>)>>,
    next_connection_id: AtomicU64,
}

impl Debug for EngineInner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EngineInner")
            .field("state", &*self.state_tx.borrow())
            .field("session", &*self.session_tx.borrow())
            .finish()
    }
}

/// Keeps one live session with the media service and rebuilds it when the
/// underlying connection is lost.
#[derive(Debug)]
pub struct RtcEngine {
    inner: Arc<EngineInner>,
}

impl RtcEngine {
    /// Connects the first session. Fails if it cannot be established; later
    /// losses are handled by rebuilding.
    pub async fn connect(
        factory: Arc<dyn PeerConnectionFactory>,
        service: Arc<dyn MediaService>,
        options: EngineOptions,
    ) -> EngineResult<(Self, EngineEvents)> {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            options,
            factory,
            service,
            engine_tx,
            session_tx: watch::channel(SessionSlot::Pending).0,
            state_tx: watch::channel(PeerConnectionState::New).0,
            pulls: PullRegistry::default(),
            running_handle: Mutex::new(None),
            next_connection_id: AtomicU64::new(1),
        });

        let session = inner.create_session().await?;
        inner.publish_session(&session);

        let (close_tx, close_rx) = oneshot::channel();
        let connection_task = tokio::spawn(inner.clone().connection_task(session, close_rx));
        *inner.running_handle.lock() = Some((connection_task, close_tx));

        Ok((Self { inner }, engine_rx))
    }

    /// Same as [`RtcEngine::connect`] over HTTPS.
    pub async fn connect_with_api(
        factory: Arc<dyn PeerConnectionFactory>,
        api_options: ApiOptions,
        options: EngineOptions,
    ) -> EngineResult<(Self, EngineEvents)> {
        let service = HttpMediaService::new(api_options)?;
        Self::connect(factory, Arc::new(service), options).await
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// The session tracks are currently negotiated on, if any.
    pub fn session(&self) -> Option<Arc<Session>> {
        match &*self.inner.session_tx.borrow() {
            SessionSlot::Ready(session) => Some(session.clone()),
            _ => None,
        }
    }

    pub async fn wait_session(&self) -> EngineResult<Arc<Session>> {
        self.inner.wait_session().await
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<PeerConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Publishes the track carried by `source`. `None` means the track is not
    /// available yet; once published, later `None` values are ignored and a
    /// new track replaces the sent one without renegotiation.
    pub fn push_track(
        &self,
        source: watch::Receiver<Option<MediaStreamTrack>>,
    ) -> LocalTrackPublication {
        push::spawn(self.inner.clone(), source)
    }

    /// Subscribes to a remote track. Subscriptions to an equal descriptor share
    /// one pull.
    pub fn pull_track(&self, descriptor: TrackDescriptor) -> RemoteTrackSubscription {
        pull::subscribe(&self.inner, descriptor)
    }

    pub async fn close(&self) {
        let handle = self.inner.running_handle.lock().take();
        if let Some((connection_task, close_tx)) = handle {
            let _ = close_tx.send(());
            let _ = connection_task.await;
        }
    }
}

impl Drop for RtcEngine {
    fn drop(&mut self) {
        if let Some((_, close_tx)) = self.inner.running_handle.lock().take() {
            let _ = close_tx.send(());
        }
    }
}

impl EngineInner {
    pub(crate) fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub(crate) fn subscribe_session(&self) -> watch::Receiver<SessionSlot> {
        self.session_tx.subscribe()
    }

    /// Waits for a session whose connection is still open.
    pub(crate) async fn wait_session(&self) -> EngineResult<Arc<Session>> {
        let mut session_rx = self.session_tx.subscribe();
        let slot = session_rx
            .wait_for(|slot| match slot {
                SessionSlot::Pending => false,
                SessionSlot::Ready(session) => !session.connection().is_closed(),
                SessionSlot::Closed => true,
            })
            .await
            .map_err(|_| EngineError::Closed)?
            .clone();

        match slot {
            SessionSlot::Ready(session) => Ok(session),
            _ => Err(EngineError::Closed),
        }
    }

    async fn create_session(&self) -> EngineResult<Arc<Session>> {
        let connection = self.new_connection()?;
        match Session::negotiate(connection.clone(), self.service.clone(), &self.options).await {
            Ok(session) => Ok(session),
            Err(err) => {
                connection.close();
                Err(err)
            }
        }
    }

    fn new_connection(&self) -> EngineResult<Arc<Connection>> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        Connection::new(id, self.factory.as_ref(), self.options.rtc_config.clone())
            .map_err(EngineError::into_session_creation)
    }

    fn publish_session(&self, session: &Arc<Session>) {
        let connection_id = session.connection().id();
        self.session_tx.send_replace(SessionSlot::Ready(session.clone()));
        let _ = self.engine_tx.send(EngineEvent::SessionReady {
            connection_id,
            session_id: session.session_id().to_owned(),
        });
    }

    fn publish_state(&self, connection_id: u64, state: PeerConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });

        if changed {
            let _ = self.engine_tx.send(EngineEvent::ConnectionStateChanged { connection_id, state });
        }
    }

    async fn connection_task(
        self: Arc<Self>,
        mut session: Arc<Session>,
        mut close_rx: oneshot::Receiver<()>,
    ) {
        let reason = 'supervise: loop {
            let rebuild_reason = tokio::select! {
                reason = self.monitor_connection(session.connection()) => reason,
                _ = &mut close_rx => break 'supervise DisconnectReason::ClientInitiated,
            };

            let connection_id = session.connection().id();
            log::warn!("connection {} lost ({:?}), rebuilding", connection_id, rebuild_reason);
            self.session_tx.send_replace(SessionSlot::Pending);
            let _ = self
                .engine_tx
                .send(EngineEvent::Rebuilding { connection_id, reason: rebuild_reason });
            session.connection().close();

            let mut attempt = 0;
            session = loop {
                if attempt >= self.options.max_rebuild_attempts {
                    log::error!("failed to rebuild the connection after {} attempts", attempt);
                    break 'supervise DisconnectReason::RebuildFailed;
                }
                attempt += 1;

                let negotiated = match self.new_connection() {
                    Ok(connection) => tokio::select! {
                        res = Session::negotiate(connection.clone(), self.service.clone(), &self.options) => {
                            if res.is_err() {
                                connection.close();
                            }
                            res
                        },
                        _ = &mut close_rx => {
                            connection.close();
                            break 'supervise DisconnectReason::ClientInitiated;
                        }
                    },
                    Err(err) => Err(err),
                };

                match negotiated {
                    Ok(new_session) => break new_session,
                    Err(err) => {
                        log::error!(
                            "rebuilding the connection failed (attempt {}/{}): {}",
                            attempt,
                            self.options.max_rebuild_attempts,
                            err
                        );
                        let _ = self.engine_tx.send(EngineEvent::SessionFailed { error: err });

                        tokio::select! {
                            _ = tokio::time::sleep(self.options.rebuild_interval) => {},
                            _ = &mut close_rx => break 'supervise DisconnectReason::ClientInitiated,
                        }
                    }
                }
            };

            self.publish_session(&session);
        };

        log::debug!("engine closing: {:?}", reason);
        session.connection().close();
        self.session_tx.send_replace(SessionSlot::Closed);
        self.publish_state(session.connection().id(), PeerConnectionState::Closed);
        let _ = self.engine_tx.send(EngineEvent::Disconnected { reason });
    }

    /// Returns once the connection must be replaced: it failed or closed, or
    /// stayed disconnected for longer than the grace period.
    async fn monitor_connection(&self, connection: &Arc<Connection>) -> RebuildReason {
        let mut state_rx = connection.subscribe_state();
        let mut ice_rx = connection.subscribe_ice_state();
        let mut grace_timer = None;

        loop {
            let state = *state_rx.borrow_and_update();
            let ice_state = *ice_rx.borrow_and_update();
            self.publish_state(connection.id(), state);

            if state == PeerConnectionState::Failed || ice_state == IceConnectionState::Failed {
                return RebuildReason::Failed;
            }
            if state.is_terminal() || ice_state.is_terminal() {
                return RebuildReason::Closed;
            }

            let disconnected = state == PeerConnectionState::Disconnected
                || ice_state == IceConnectionState::Disconnected;
            if disconnected {
                if grace_timer.is_none() {
                    log::info!(
                        "connection {} disconnected, waiting {:?} for it to recover",
                        connection.id(),
                        self.options.disconnect_grace_period
                    );
                    grace_timer =
                        Some(Box::pin(tokio::time::sleep(self.options.disconnect_grace_period)));
                }
            } else if grace_timer.take().is_some() {
                log::info!("connection {} recovered", connection.id());
            }

            let grace_elapsed = async {
                match grace_timer.as_mut() {
                    Some(timer) => timer.await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                res = state_rx.changed() => {
                    if res.is_err() {
                        return RebuildReason::Closed;
                    }
                },
                res = ice_rx.changed() => {
                    if res.is_err() {
                        return RebuildReason::Closed;
                    }
                },
                _ = grace_elapsed => return RebuildReason::DisconnectTimeout,
            }
        }
    }
}
