#![allow(dead_code)]

use std::{
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use meetwire::{
    api::{
        proto::{
            CloseTracksRequest, CloseTracksResponse, NewSessionRequest, NewSessionResponse,
            RenegotiateRequest, RenegotiateResponse, ServiceStatus, TrackResult, TracksRequest,
            TracksResponse,
        },
        ApiResult, MediaService, TrackObject,
    },
    webrtc::prelude::*,
    EngineEvent, EngineEvents, EngineOptions, RtcEngine,
};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify, Semaphore};

const SDP_HEADER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

fn direction_attribute(direction: RtpTransceiverDirection) -> &'static str {
    match direction {
        RtpTransceiverDirection::SendRecv => "a=sendrecv",
        RtpTransceiverDirection::SendOnly => "a=sendonly",
        RtpTransceiverDirection::RecvOnly => "a=recvonly",
        RtpTransceiverDirection::Inactive | RtpTransceiverDirection::Stopped => "a=inactive",
    }
}

fn media_section(mid: &str, media_type: MediaType, direction: RtpTransceiverDirection) -> String {
    let codec = match media_type {
        MediaType::Audio => {
            "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
             a=rtpmap:111 opus/48000/2\r\n\
             a=fmtp:111 minptime=10;useinbandfec=1\r\n"
        }
        MediaType::Video => "m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n",
    };
    format!("{codec}a=mid:{mid}\r\n{}\r\n", direction_attribute(direction))
}

#[derive(Debug)]
struct TransceiverState {
    mid: Option<String>,
    direction: RtpTransceiverDirection,
    current_direction: Option<RtpTransceiverDirection>,
    sender: Option<MediaStreamTrack>,
    receiver: Option<MediaStreamTrack>,
}

#[derive(Debug)]
pub struct MockTransceiver {
    media_type: MediaType,
    state: Mutex<TransceiverState>,
}

impl MockTransceiver {
    fn new(
        media_type: MediaType,
        direction: RtpTransceiverDirection,
        sender: Option<MediaStreamTrack>,
    ) -> Self {
        Self {
            media_type,
            state: Mutex::new(TransceiverState {
                mid: None,
                direction,
                current_direction: None,
                sender,
                receiver: None,
            }),
        }
    }
}

#[async_trait]
impl RtpTransceiver for MockTransceiver {
    fn mid(&self) -> Option<String> {
        self.state.lock().mid.clone()
    }

    fn media_type(&self) -> MediaType {
        self.media_type
    }

    fn direction(&self) -> RtpTransceiverDirection {
        self.state.lock().direction
    }

    fn set_direction(&self, direction: RtpTransceiverDirection) -> Result<(), RtcError> {
        let mut state = self.state.lock();
        if state.direction == RtpTransceiverDirection::Stopped {
            return Err(RtcError::invalid_state("transceiver is stopped"));
        }
        state.direction = direction;
        Ok(())
    }

    fn current_direction(&self) -> Option<RtpTransceiverDirection> {
        self.state.lock().current_direction
    }

    fn sender_track(&self) -> Option<MediaStreamTrack> {
        self.state.lock().sender.clone()
    }

    fn receiver_track(&self) -> Option<MediaStreamTrack> {
        self.state.lock().receiver.clone()
    }

    async fn replace_track(&self, track: Option<MediaStreamTrack>) -> Result<(), RtcError> {
        self.state.lock().sender = track;
        Ok(())
    }

    fn stop(&self) -> Result<(), RtcError> {
        let mut state = self.state.lock();
        state.direction = RtpTransceiverDirection::Stopped;
        state.sender = None;
        Ok(())
    }
}

struct PcState {
    transceivers: Vec<Arc<MockTransceiver>>,
    signaling: SignalingState,
    connection: PeerConnectionState,
    ice: IceConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    // What a rollback restores
    stable_local: Option<SessionDescription>,
    stable_remote: Option<SessionDescription>,
    offered: Vec<Arc<MockTransceiver>>,
    next_mid: u32,
    closed: bool,
    failing_answers: u32,
}

/// In-memory peer connection. Enforces the offer/answer state machine, so
/// interleaved negotiations fail loudly, and connects as soon as the first
/// remote description is applied.
pub struct MockPeerConnection {
    state: Mutex<PcState>,
    on_state: Mutex<Option<OnConnectionChange>>,
    on_ice: Mutex<Option<OnIceConnectionChange>>,
    on_track: Mutex<Option<OnTrack>>,
}

impl Debug for MockPeerConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockPeerConnection")
            .field("signaling", &state.signaling)
            .field("connection", &state.connection)
            .field("closed", &state.closed)
            .finish()
    }
}

impl MockPeerConnection {
    fn new() -> Self {
        Self {
            state: Mutex::new(PcState {
                transceivers: Vec::new(),
                signaling: SignalingState::Stable,
                connection: PeerConnectionState::New,
                ice: IceConnectionState::New,
                local: None,
                remote: None,
                stable_local: None,
                stable_remote: None,
                offered: Vec::new(),
                next_mid: 0,
                closed: false,
                failing_answers: 0,
            }),
            on_state: Mutex::new(None),
            on_ice: Mutex::new(None),
            on_track: Mutex::new(None),
        }
    }

    pub fn set_connection_state(&self, state: PeerConnectionState) {
        self.state.lock().connection = state;
        if let Some(f) = self.on_state.lock().as_mut() {
            f(state);
        }
    }

    pub fn set_ice_state(&self, state: IceConnectionState) {
        self.state.lock().ice = state;
        if let Some(f) = self.on_ice.lock().as_mut() {
            f(state);
        }
    }

    pub fn fail(&self) {
        self.set_ice_state(IceConnectionState::Failed);
        self.set_connection_state(PeerConnectionState::Failed);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Makes the next `create_answer` fail.
    pub fn fail_next_answer(&self) {
        self.state.lock().failing_answers += 1;
    }

    pub fn mock_transceiver(&self, mid: &str) -> Option<Arc<MockTransceiver>> {
        self.state.lock().transceivers.iter().find(|t| t.mid().as_deref() == Some(mid)).cloned()
    }

    pub fn sending_transceivers(&self) -> Vec<Arc<MockTransceiver>> {
        self.state
            .lock()
            .transceivers
            .iter()
            .filter(|t| t.direction() == RtpTransceiverDirection::SendOnly)
            .cloned()
            .collect()
    }

    fn ensure_open(state: &PcState) -> Result<(), RtcError> {
        if state.closed {
            return Err(RtcError::closed());
        }
        Ok(())
    }

    fn render(state: &PcState) -> String {
        let mut sdp = SDP_HEADER.to_owned();
        let mut preview_mid = state.next_mid;
        for transceiver in &state.transceivers {
            let mid = transceiver.mid().unwrap_or_else(|| {
                let mid = preview_mid.to_string();
                preview_mid += 1;
                mid
            });
            sdp.push_str(&media_section(&mid, transceiver.media_type, transceiver.direction()));
        }
        sdp
    }

    fn connect(&self) {
        let connect = {
            let state = self.state.lock();
            state.connection == PeerConnectionState::New
                || state.connection == PeerConnectionState::Connecting
        };
        if connect {
            self.set_ice_state(IceConnectionState::Connected);
            self.set_connection_state(PeerConnectionState::Connected);
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self, _options: OfferOptions) -> Result<SessionDescription, RtcError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::Stable {
            return Err(RtcError::invalid_state(format!(
                "create_offer in {:?}",
                state.signaling
            )));
        }
        SessionDescription::parse(&Self::render(&state), SdpType::Offer)
            .map_err(|err| RtcError::new(RtcErrorType::InvalidSdp, err.to_string()))
    }

    async fn create_answer(
        &self,
        _options: AnswerOptions,
    ) -> Result<SessionDescription, RtcError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(RtcError::invalid_state(format!(
                "create_answer in {:?}",
                state.signaling
            )));
        }
        if state.failing_answers > 0 {
            state.failing_answers -= 1;
            return Err(RtcError::new(RtcErrorType::Internal, "answer failed"));
        }
        SessionDescription::parse(&Self::render(&state), SdpType::Answer)
            .map_err(|err| RtcError::new(RtcErrorType::InvalidSdp, err.to_string()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        match (desc.sdp_type(), state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => {
                state.signaling = SignalingState::HaveLocalOffer;
                state.stable_local = state.local.clone();
                let mut next_mid = state.next_mid;
                for transceiver in &state.transceivers {
                    let mut transceiver = transceiver.state.lock();
                    if transceiver.mid.is_none() {
                        transceiver.mid = Some(next_mid.to_string());
                        next_mid += 1;
                    }
                }
                state.next_mid = next_mid;
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                state.signaling = SignalingState::Stable;
                state.offered.clear();
            }
            (SdpType::Rollback, SignalingState::HaveLocalOffer) => {
                state.signaling = SignalingState::Stable;
                state.local = state.stable_local.take();
                return Ok(());
            }
            (sdp_type, signaling) => {
                return Err(RtcError::invalid_state(format!(
                    "set_local_description({}) in {:?}",
                    sdp_type, signaling
                )));
            }
        }
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            match (desc.sdp_type(), state.signaling) {
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                }
                (SdpType::Rollback, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.remote = state.stable_remote.take();
                    // Transceivers the offer created go away with it
                    let offered = std::mem::take(&mut state.offered);
                    state.transceivers.retain(|t| !offered.iter().any(|o| Arc::ptr_eq(t, o)));
                    return Ok(());
                }
                (SdpType::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.stable_remote = state.remote.clone();
                    for mid in desc.mids() {
                        let known = state
                            .transceivers
                            .iter()
                            .any(|t| t.mid().as_deref() == Some(mid.as_str()));
                        if known {
                            continue;
                        }
                        let track = MediaStreamTrack::new(format!("remote-{mid}"), MediaType::Audio);
                        let transceiver = Arc::new(MockTransceiver::new(
                            MediaType::Audio,
                            RtpTransceiverDirection::RecvOnly,
                            None,
                        ));
                        {
                            let mut transceiver = transceiver.state.lock();
                            transceiver.mid = Some(mid);
                            transceiver.receiver = Some(track.clone());
                        }
                        state.transceivers.push(transceiver.clone());
                        state.offered.push(transceiver.clone());
                        events.push(TrackEvent { track, transceiver });
                    }
                }
                (sdp_type, signaling) => {
                    return Err(RtcError::invalid_state(format!(
                        "set_remote_description({}) in {:?}",
                        sdp_type, signaling
                    )));
                }
            }
            state.remote = Some(desc);
        }

        if let Some(f) = self.on_track.lock().as_mut() {
            for event in events {
                f(event);
            }
        }
        self.connect();
        Ok(())
    }

    fn add_transceiver(
        &self,
        track: MediaStreamTrack,
        init: RtpTransceiverInit,
    ) -> Result<SharedTransceiver, RtcError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let transceiver = Arc::new(MockTransceiver::new(track.kind(), init.direction, Some(track)));
        state.transceivers.push(transceiver.clone());
        Ok(transceiver)
    }

    fn add_transceiver_for_media(
        &self,
        media_type: MediaType,
        init: RtpTransceiverInit,
    ) -> Result<SharedTransceiver, RtcError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let transceiver = Arc::new(MockTransceiver::new(media_type, init.direction, None));
        state.transceivers.push(transceiver.clone());
        Ok(transceiver)
    }

    fn transceivers(&self) -> Vec<SharedTransceiver> {
        self.state.lock().transceivers.iter().map(|t| t.clone() as SharedTransceiver).collect()
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.signaling = SignalingState::Closed;
        }
        self.set_ice_state(IceConnectionState::Closed);
        self.set_connection_state(PeerConnectionState::Closed);
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn current_local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    fn current_remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    fn on_connection_state_change(&self, f: Option<OnConnectionChange>) {
        *self.on_state.lock() = f;
    }

    fn on_ice_connection_state_change(&self, f: Option<OnIceConnectionChange>) {
        *self.on_ice.lock() = f;
    }

    fn on_track(&self, f: Option<OnTrack>) {
        *self.on_track.lock() = f;
    }
}

#[derive(Debug, Default)]
pub struct MockFactory {
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl MockFactory {
    pub fn created(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connection(&self, index: usize) -> Arc<MockPeerConnection> {
        self.connections.lock()[index].clone()
    }

    pub fn last(&self) -> Arc<MockPeerConnection> {
        self.connections.lock().last().cloned().expect("no connection created")
    }
}

impl PeerConnectionFactory for MockFactory {
    fn create_peer_connection(
        &self,
        _config: RtcConfiguration,
    ) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let peer_connection = Arc::new(MockPeerConnection::new());
        self.connections.lock().push(peer_connection.clone());
        Ok(peer_connection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    NewSession,
    NewTracks { session_id: String, tracks: Vec<TrackObject>, with_offer: bool },
    Renegotiate { session_id: String },
    CloseTracks { session_id: String, mids: Vec<String> },
}

/// Media service double. Sessions are named `s1`, `s2`, ... and pulled
/// tracks are offered on mids `r1`, `r2`, ...
#[derive(Debug, Default)]
pub struct MockMediaService {
    calls: Mutex<Vec<Call>>,
    sessions: AtomicU32,
    remote_mids: AtomicU32,
    failing_sessions: AtomicU32,
    failing_track_requests: AtomicU32,
    failing_closes: AtomicU32,
    fail_tracks: AtomicBool,
    omit_pulled_media: AtomicBool,
    omit_pulled_session_ids: AtomicBool,
    track_gate: Mutex<Option<Arc<Semaphore>>>,
    track_requests: Notify,
}

impl MockMediaService {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn new_sessions(&self) -> usize {
        self.calls().iter().filter(|call| matches!(call, Call::NewSession)).count()
    }

    pub fn new_tracks(&self) -> Vec<(String, Vec<TrackObject>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::NewTracks { session_id, tracks, .. } => Some((session_id, tracks)),
                _ => None,
            })
            .collect()
    }

    pub fn closed_tracks(&self) -> Vec<(String, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CloseTracks { session_id, mids } => Some((session_id, mids)),
                _ => None,
            })
            .collect()
    }

    pub fn fail_next_sessions(&self, count: u32) {
        self.failing_sessions.store(count, Ordering::SeqCst);
    }

    /// Rejects the next `count` `tracks/new` requests as a whole.
    pub fn fail_next_track_requests(&self, count: u32) {
        self.failing_track_requests.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_closes(&self, count: u32) {
        self.failing_closes.store(count, Ordering::SeqCst);
    }

    /// Per-track pull results no longer echo the remote session id.
    pub fn omit_pulled_session_ids(&self, omit: bool) {
        self.omit_pulled_session_ids.store(omit, Ordering::SeqCst);
    }

    pub fn fail_tracks(&self, fail: bool) {
        self.fail_tracks.store(fail, Ordering::SeqCst);
    }

    /// Pull offers no longer carry a media section, so no track ever arrives.
    pub fn omit_pulled_media(&self, omit: bool) {
        self.omit_pulled_media.store(omit, Ordering::SeqCst);
    }

    /// Holds every `tracks/new` request until released.
    pub fn hold_tracks(&self) {
        *self.track_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_tracks(&self, permits: usize) {
        if let Some(gate) = self.track_gate.lock().as_ref() {
            gate.add_permits(permits);
        }
    }

    pub async fn track_request(&self) {
        self.track_requests.notified().await;
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }

    fn answer(offer: &SessionDescription) -> SessionDescription {
        SessionDescription::parse(offer.sdp(), SdpType::Answer).unwrap()
    }
}

#[async_trait]
impl MediaService for MockMediaService {
    async fn new_session(&self, req: NewSessionRequest) -> ApiResult<NewSessionResponse> {
        self.record(Call::NewSession);

        if Self::take_failure(&self.failing_sessions) {
            return Ok(NewSessionResponse {
                status: ServiceStatus::error("unavailable", "no capacity"),
                ..Default::default()
            });
        }

        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(NewSessionResponse {
            session_id: Some(format!("s{n}")),
            session_description: Some(Self::answer(&req.session_description)),
            status: ServiceStatus::default(),
        })
    }

    async fn new_tracks(&self, session_id: &str, req: TracksRequest) -> ApiResult<TracksResponse> {
        self.record(Call::NewTracks {
            session_id: session_id.to_owned(),
            tracks: req.tracks.clone(),
            with_offer: req.session_description.is_some(),
        });
        self.track_requests.notify_one();

        let gate = self.track_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        if Self::take_failure(&self.failing_track_requests) {
            return Ok(TracksResponse {
                status: ServiceStatus::error("internal", "tracks request failed"),
                ..Default::default()
            });
        }

        if let Some(offer) = req.session_description {
            let fail = self.fail_tracks.load(Ordering::SeqCst);
            let tracks = req
                .tracks
                .into_iter()
                .map(|track| TrackResult {
                    mid: track.mid,
                    track_name: track.track_name,
                    session_id: None,
                    status: if fail {
                        ServiceStatus::error("rejected", "track rejected")
                    } else {
                        ServiceStatus::default()
                    },
                })
                .collect();

            return Ok(TracksResponse {
                requires_immediate_renegotiation: false,
                session_description: Some(Self::answer(&offer)),
                tracks,
                status: ServiceStatus::default(),
            });
        }

        let mut sdp = SDP_HEADER.to_owned();
        let mut tracks = Vec::with_capacity(req.tracks.len());
        for track in req.tracks {
            let mid = format!("r{}", self.remote_mids.fetch_add(1, Ordering::SeqCst) + 1);
            if !self.omit_pulled_media.load(Ordering::SeqCst) {
                sdp.push_str(&media_section(
                    &mid,
                    MediaType::Audio,
                    RtpTransceiverDirection::SendOnly,
                ));
            }
            let session_id = if self.omit_pulled_session_ids.load(Ordering::SeqCst) {
                None
            } else {
                track.session_id
            };
            tracks.push(TrackResult {
                mid: Some(mid),
                track_name: track.track_name,
                session_id,
                status: ServiceStatus::default(),
            });
        }

        Ok(TracksResponse {
            requires_immediate_renegotiation: true,
            session_description: Some(SessionDescription::parse(&sdp, SdpType::Offer).unwrap()),
            tracks,
            status: ServiceStatus::default(),
        })
    }

    async fn renegotiate(
        &self,
        session_id: &str,
        _req: RenegotiateRequest,
    ) -> ApiResult<RenegotiateResponse> {
        self.record(Call::Renegotiate { session_id: session_id.to_owned() });
        Ok(RenegotiateResponse::default())
    }

    async fn close_tracks(
        &self,
        session_id: &str,
        req: CloseTracksRequest,
    ) -> ApiResult<CloseTracksResponse> {
        let mids: Vec<String> = req.tracks.iter().map(|track| track.mid.clone()).collect();
        self.record(Call::CloseTracks { session_id: session_id.to_owned(), mids: mids.clone() });

        if Self::take_failure(&self.failing_closes) {
            return Ok(CloseTracksResponse {
                status: ServiceStatus::error("internal", "close request failed"),
                ..Default::default()
            });
        }

        Ok(CloseTracksResponse {
            session_description: Some(Self::answer(&req.session_description)),
            tracks: mids
                .into_iter()
                .map(|mid| TrackResult { mid: Some(mid), ..Default::default() })
                .collect(),
            requires_immediate_renegotiation: false,
            status: ServiceStatus::default(),
        })
    }
}

pub struct TestEngine {
    pub engine: RtcEngine,
    pub events: EngineEvents,
    pub factory: Arc<MockFactory>,
    pub service: Arc<MockMediaService>,
}

/// Short timeouts so failure paths finish quickly.
pub fn test_options() -> EngineOptions {
    EngineOptions {
        session_connect_timeout: Duration::from_secs(1),
        disconnect_grace_period: Duration::from_millis(200),
        track_resolve_timeout: Duration::from_millis(200),
        retry_delay: Duration::from_millis(10),
        max_rebuild_attempts: 3,
        rebuild_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

pub async fn test_engine() -> Result<TestEngine> {
    let factory = Arc::new(MockFactory::default());
    let service = Arc::new(MockMediaService::default());
    let (engine, events) =
        RtcEngine::connect(factory.clone(), service.clone(), test_options()).await?;
    Ok(TestEngine { engine, events, factory, service })
}

pub fn audio_source(
    id: &str,
) -> (watch::Sender<Option<MediaStreamTrack>>, watch::Receiver<Option<MediaStreamTrack>>) {
    watch::channel(Some(MediaStreamTrack::new(id, MediaType::Audio)))
}

/// Polls `cond` until it holds, for at most two seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..400 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    bail!("timed out waiting for {what}")
}

/// Receives engine events until `matches` accepts one, for at most two
/// seconds.
pub async fn wait_for_event(
    events: &mut EngineEvents,
    mut matches: impl FnMut(&EngineEvent) -> bool,
) -> Result<EngineEvent> {
    let wait = async {
        while let Some(event) = events.recv().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    };

    match tokio::time::timeout(Duration::from_secs(2), wait).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => bail!("engine events closed"),
        Err(_) => bail!("timed out waiting for an engine event"),
    }
}
