#![allow(dead_code)]

use async_trait::async_trait;
use mediconnect::call::PeerEventSink;
use mediconnect::config::CallConfig;
use mediconnect::media::{
    CaptureError, LocalTrack, MediaCaptureProvider, MediaConstraints, MediaStream, RemoteStream,
    RemoteTrack, TrackKind, TrackSource,
};
use mediconnect::peer::{IceCandidate, PeerConnection, PeerConnectionFactory, Role, SessionDescription};
use mediconnect::signaling::{
    SignalHandler, SignalKind, SignalMessage, SignalPayload, SignalSubscription, SignalingChannel,
    SignalingError,
};
use mediconnect::{CallDeps, CallError, CallResult, CallSession};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

pub const SESSION: &str = "consult-1";

// ---------- media ----------

/// Считает обращения к источникам треков
#[derive(Default)]
pub struct TrackCounter {
    pub stops: AtomicUsize,
    pub toggles: AtomicUsize,
}

impl TrackCounter {
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct CountingSource(Arc<TrackCounter>);

impl TrackSource for CountingSource {
    fn set_enabled(&self, _enabled: bool) {
        self.0.toggles.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.0.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct CountingCapture {
    pub counter: Arc<TrackCounter>,
    deny: Option<CaptureError>,
    deny_once: Mutex<Option<CaptureError>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl CountingCapture {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(TrackCounter::default()),
            deny: None,
            deny_once: Mutex::new(None),
            gate: Mutex::new(None),
        }
    }

    pub fn denying(err: CaptureError) -> Self {
        Self {
            deny: Some(err),
            ..Self::new()
        }
    }

    /// Первый захват отказывает, следующие проходят
    pub fn denying_once(err: CaptureError) -> Self {
        Self {
            deny_once: Mutex::new(Some(err)),
            ..Self::new()
        }
    }

    /// Захват завершится только после сигнала из возвращённого sender
    pub fn gated() -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let capture = Self {
            gate: Mutex::new(Some(rx)),
            ..Self::new()
        };
        (capture, tx)
    }
}

#[async_trait]
impl MediaCaptureProvider for CountingCapture {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, CaptureError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(err) = &self.deny {
            return Err(err.clone());
        }
        if let Some(err) = self.deny_once.lock().take() {
            return Err(err);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, Arc::new(CountingSource(self.counter.clone()))));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, Arc::new(CountingSource(self.counter.clone()))));
        }
        Ok(MediaStream::new(tracks))
    }
}

// ---------- peer connection ----------

#[derive(Default)]
pub struct PeerStats {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    /// кандидаты, пришедшие в соединение раньше remote description
    pub early_candidates: AtomicUsize,
}

impl PeerStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn early_candidates(&self) -> usize {
        self.early_candidates.load(Ordering::SeqCst)
    }
}

pub struct FakePeerState {
    pub index: usize,
    pub role: Role,
    pub sink: PeerEventSink,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
    pub applied: Mutex<Vec<IceCandidate>>,
}

impl FakePeerState {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().iter().map(|c| c.candidate.clone()).collect()
    }

    fn gather(&self) {
        let n = self.index + 1;
        self.sink.local_candidate(IceCandidate::new(format!(
            "candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"
        )));
        self.sink.local_candidate(IceCandidate::new(format!(
            "candidate:{n}1 1 udp 16777215 203.0.113.{n} 3478 typ relay"
        )));
    }

    fn maybe_connect(&self) {
        let ready = self.local_set.load(Ordering::SeqCst) && self.remote_set.load(Ordering::SeqCst);
        if ready && !self.connected.swap(true, Ordering::SeqCst) {
            // поток приходит раньше, чем connected
            self.sink.remote_stream(RemoteStream {
                id: format!("remote-{}", self.index),
                tracks: vec![RemoteTrack {
                    id: "remote-audio".into(),
                    kind: TrackKind::Audio,
                }],
            });
            self.sink.remote_stream(RemoteStream {
                id: format!("remote-{}", self.index),
                tracks: vec![RemoteTrack {
                    id: "remote-video".into(),
                    kind: TrackKind::Video,
                }],
            });
            self.sink.connected();
        }
    }
}

/// Соединение без сети: connected наступает, когда установлены обе
/// стороны SDP и применён хотя бы один удалённый кандидат
#[derive(Default)]
pub struct FakePeerFactory {
    pub stats: Arc<PeerStats>,
    peers: Mutex<Vec<Arc<FakePeerState>>>,
    fail_create: AtomicBool,
}

impl FakePeerFactory {
    pub fn peer(&self, index: usize) -> Arc<FakePeerState> {
        self.peers.lock()[index].clone()
    }

    pub fn last(&self) -> Arc<FakePeerState> {
        let peers = self.peers.lock();
        peers[peers.len() - 1].clone()
    }

    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        role: Role,
        _config: &CallConfig,
        local: &MediaStream,
        events: PeerEventSink,
    ) -> CallResult<Box<dyn PeerConnection>> {
        assert!(!local.tracks().is_empty(), "peer created without local tracks");
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(CallError::PeerConnection("fake create failure".into()));
        }

        let mut peers = self.peers.lock();
        let state = Arc::new(FakePeerState {
            index: peers.len(),
            role,
            sink: events,
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
        });
        peers.push(state.clone());

        self.stats.created.fetch_add(1, Ordering::SeqCst);
        let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(FakePeer {
            state,
            stats: self.stats.clone(),
        }))
    }
}

struct FakePeer {
    state: Arc<FakePeerState>,
    stats: Arc<PeerStats>,
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> CallResult<SessionDescription> {
        self.state.local_set.store(true, Ordering::SeqCst);
        self.state.gather();
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n",
            self.state.index
        )))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> CallResult<SessionDescription> {
        if !offer.sdp.starts_with("v=0") {
            return Err(CallError::PeerConnection("malformed offer".into()));
        }
        self.state.remote_set.store(true, Ordering::SeqCst);
        self.state.local_set.store(true, Ordering::SeqCst);
        self.state.gather();
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\n",
            self.state.index
        )))
    }

    async fn accept_answer(&self, _answer: SessionDescription) -> CallResult<()> {
        self.state.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()> {
        if !self.state.remote_set.load(Ordering::SeqCst) {
            self.stats.early_candidates.fetch_add(1, Ordering::SeqCst);
            return Err(CallError::PeerConnection("candidate before remote description".into()));
        }
        self.state.applied.lock().push(candidate);
        self.state.maybe_connect();
        Ok(())
    }

    async fn close(&self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
            self.stats.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// ---------- signaling ----------

/// Запоминает отправленное; входящие подаются вручную через `deliver`
#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<SignalMessage>>,
    handler: Arc<Mutex<Option<SignalHandler>>>,
    refuse_next: AtomicBool,
}

impl RecordingSignaling {
    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_offers(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| matches!(m.payload, SignalPayload::Offer(_)))
            .count()
    }

    /// Следующая отправка вернёт ошибку и ничего не запишет
    pub fn refuse_next_send(&self) {
        self.refuse_next.store(true, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn deliver(&self, message: SignalMessage) -> bool {
        match self.handler.lock().as_ref() {
            Some(handler) => {
                handler(message);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if self.refuse_next.swap(false, Ordering::SeqCst) {
            return Err(SignalingError::NoSubscriber(message.session_id));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn on_signal(&self, _session_id: &str, handler: SignalHandler) -> SignalSubscription {
        *self.handler.lock() = Some(handler);
        let slot = self.handler.clone();
        SignalSubscription::new(move || {
            slot.lock().take();
        })
    }
}

/// Пересылает в настоящий канал и запоминает отправленное
pub struct TappedSignaling<S> {
    inner: S,
    sent: Mutex<Vec<SignalMessage>>,
}

impl<S> TappedSignaling<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self, kind: SignalKind) -> usize {
        self.sent.lock().iter().filter(|m| m.kind() == kind).count()
    }
}

#[async_trait]
impl<S: SignalingChannel> SignalingChannel for TappedSignaling<S> {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.sent.lock().push(message.clone());
        self.inner.send(message).await
    }

    fn on_signal(&self, session_id: &str, handler: SignalHandler) -> SignalSubscription {
        self.inner.on_signal(session_id, handler)
    }
}

// ---------- wiring ----------

pub struct Side {
    pub capture: Arc<CountingCapture>,
    pub peers: Arc<FakePeerFactory>,
}

impl Side {
    pub fn new() -> Self {
        Self::with_capture(CountingCapture::new())
    }

    pub fn with_capture(capture: CountingCapture) -> Self {
        Self {
            capture: Arc::new(capture),
            peers: Arc::new(FakePeerFactory::default()),
        }
    }

    pub fn deps(&self, signaling: Arc<dyn SignalingChannel>) -> CallDeps {
        CallDeps {
            media: self.capture.clone(),
            peers: self.peers.clone(),
            signaling,
        }
    }

    pub fn session(&self, peer_id: &str, role: Role, signaling: Arc<dyn SignalingChannel>) -> CallSession {
        CallSession::new(SESSION, role, self.deps(signaling), CallConfig::default())
            .with_local_peer_id(peer_id)
    }
}

/// Прокачивает очереди обеих сессий, пока события не кончатся
pub async fn pump(a: &mut CallSession, b: &mut CallSession) {
    let mut idle_rounds = 0;
    while idle_rounds < 5 {
        tokio::task::yield_now().await;
        let handled = a.drain().await + b.drain().await;
        if handled == 0 {
            idle_rounds += 1;
        } else {
            idle_rounds = 0;
        }
    }
}

pub fn remote_candidate(n: u8) -> SignalMessage {
    SignalMessage::new(
        SESSION,
        "remote",
        SignalPayload::Candidate(IceCandidate::new(format!(
            "candidate:{n} 1 udp 2130706431 192.168.1.{n} 6000 typ host"
        ))),
    )
}

pub fn remote_answer() -> SignalMessage {
    SignalMessage::new(SESSION, "remote", SignalPayload::Answer(SessionDescription::answer("v=0")))
}

pub fn remote_offer() -> SignalMessage {
    SignalMessage::new(SESSION, "remote", SignalPayload::Offer(SessionDescription::offer("v=0")))
}
