//! Сессия звонка: одна state machine на одну консультацию.
//!
//! Все асинхронные результаты (захват медиа, события соединения, таймеры)
//! приходят в одну очередь сессии с билетом поколения. После любой
//! разборки поколение растёт, и всё, что пришло с устаревшим билетом,
//! отбрасывается (опоздавший медиапоток при этом сразу останавливается).

use super::events::{ticketed, Envelope, EventSender, PeerEventSink, SessionEvent};
use super::state::CallState;
use crate::config::CallConfig;
use crate::error::{CallError, CallResult};
use crate::media::{CaptureError, MediaCaptureProvider, MediaConstraints, MediaStream, RemoteStream, TrackKind};
use crate::peer::ice::{analyze_candidates, CandidateBuffer};
use crate::peer::{IceCandidate, PeerConnection, PeerConnectionFactory, Role, SessionDescription};
use crate::signaling::{SignalHandler, SignalMessage, SignalPayload, SignalSubscription, SignalingChannel};
use crate::utils::{format_duration, random_id};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Внешние зависимости сессии
#[derive(Clone)]
pub struct CallDeps {
    pub media: Arc<dyn MediaCaptureProvider>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub signaling: Arc<dyn SignalingChannel>,
}

/// То, что видит UI: публикуется после каждого изменения сессии
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub session_id: String,
    pub role: Role,
    pub state: CallState,
    pub local_muted: bool,
    pub local_video_off: bool,
    pub has_local_stream: bool,
    pub has_remote_stream: bool,
    pub duration_secs: Option<i64>,
    /// `mm:ss`, только пока звонок активен
    pub duration: Option<String>,
    pub error: Option<String>,
}

pub struct CallSession {
    session_id: String,
    local_peer_id: String,
    role: Role,
    state: CallState,
    generation: u64,
    config: CallConfig,
    deps: CallDeps,

    local_stream: Option<MediaStream>,
    remote_stream: Option<RemoteStream>,
    // удалённый поток, пришедший до Connected
    early_remote: Option<RemoteStream>,
    local_muted: bool,
    local_video_off: bool,
    started_at: Option<DateTime<Utc>>,
    connected_at: Option<DateTime<Utc>>,
    // сигнал, который канал ещё не принял
    pending_signal: Option<SignalMessage>,
    last_error: Option<CallError>,

    peer: Option<Box<dyn PeerConnection>>,
    offer_sent: bool,
    // поколение удалённой стороны, чей SDP применён
    remote_generation: Option<u64>,
    remote_candidates: CandidateBuffer,
    local_candidates: Vec<IceCandidate>,
    subscription: Option<SignalSubscription>,
    timers: Vec<JoinHandle<()>>,

    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<Envelope>,
    snapshots: watch::Sender<CallSnapshot>,
}

impl CallSession {
    pub fn new(session_id: impl Into<String>, role: Role, deps: CallDeps, config: CallConfig) -> Self {
        let session_id = session_id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshots, _) = watch::channel(CallSnapshot {
            session_id: session_id.clone(),
            role,
            state: CallState::Idle,
            local_muted: false,
            local_video_off: false,
            has_local_stream: false,
            has_remote_stream: false,
            duration_secs: None,
            duration: None,
            error: None,
        });

        Self {
            session_id,
            local_peer_id: random_id(),
            role,
            state: CallState::Idle,
            generation: 0,
            config,
            deps,
            local_stream: None,
            remote_stream: None,
            early_remote: None,
            local_muted: false,
            local_video_off: false,
            started_at: None,
            connected_at: None,
            pending_signal: None,
            last_error: None,
            peer: None,
            offer_sent: false,
            remote_generation: None,
            remote_candidates: CandidateBuffer::new(),
            local_candidates: Vec::new(),
            subscription: None,
            timers: Vec::new(),
            events_tx,
            events_rx,
            snapshots,
        }
    }

    /// Фиксированный id участника вместо случайного
    pub fn with_local_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.local_peer_id = peer_id.into();
        self
    }

    /// Создаёт сессию и ведёт её до `negotiating`
    pub async fn start(
        session_id: impl Into<String>,
        role: Role,
        constraints: MediaConstraints,
        deps: CallDeps,
        config: CallConfig,
    ) -> CallResult<Self> {
        let mut session = Self::new(session_id, role, deps, config);
        session.start_call(constraints).await?;
        Ok(session)
    }

    /// Запускает захват медиа, не дожидаясь результата.
    /// Результат придёт в очередь и будет обработан в [`CallSession::step`].
    pub fn begin(&mut self, constraints: MediaConstraints) -> CallResult<()> {
        if self.state != CallState::Idle {
            return Err(CallError::InvalidTransition {
                from: self.state,
                action: "start a call",
            });
        }

        self.transition(CallState::RequestingMedia);
        self.started_at = Some(Utc::now());

        let generation = self.generation;
        let media = self.deps.media.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = media.acquire(constraints).await;
            ticketed(&tx, generation, SessionEvent::MediaResolved(result));
        });

        tracing::info!(session = %self.session_id, role = %self.role, ?constraints, "requesting media");
        self.publish();
        Ok(())
    }

    /// `begin` + ожидание результата захвата
    pub async fn start_call(&mut self, constraints: MediaConstraints) -> CallResult<()> {
        self.begin(constraints)?;
        while self.state == CallState::RequestingMedia {
            if !self.step().await {
                break;
            }
        }

        match self.state {
            CallState::Error => Err(self
                .last_error
                .clone()
                .unwrap_or_else(|| CallError::PeerConnection("call setup failed".into()))),
            _ => Ok(()),
        }
    }

    /// Обрабатывает одно событие очереди, дожидаясь его
    pub async fn step(&mut self) -> bool {
        match self.next_envelope().await {
            Some(envelope) => {
                self.dispatch(envelope).await;
                true
            }
            None => false,
        }
    }

    /// Обрабатывает всё, что уже лежит в очереди
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.events_rx.try_recv() {
            self.dispatch(envelope).await;
            handled += 1;
        }
        handled
    }

    /// Входящий сигнал от удалённого участника
    pub async fn accept_incoming_signal(&mut self, message: SignalMessage) -> CallResult<()> {
        if !self.state.accepts_signals() {
            return Err(self.reject(format!("{} signal arrived too early or too late", message.kind())));
        }
        if message.session_id != self.session_id {
            return Err(self.reject(format!("signal belongs to session {}", message.session_id)));
        }
        if message.from == self.local_peer_id {
            return Err(self.reject("own signal echoed back"));
        }

        tracing::debug!(
            session = %self.session_id,
            kind = %message.kind(),
            from = %message.from,
            generation = message.generation,
            "signal received"
        );
        let generation = message.generation;
        match message.payload {
            SignalPayload::Offer(offer) => self.apply_offer(offer, &message.from, generation).await,
            SignalPayload::Answer(answer) => self.apply_answer(answer, generation).await,
            SignalPayload::Candidate(candidate) => {
                self.apply_candidate(candidate, generation).await;
                Ok(())
            }
        }
    }

    /// Переключает микрофон, возвращает новое значение `muted`
    pub fn toggle_mute(&mut self) -> CallResult<bool> {
        let muted = !self.local_muted;
        self.set_track_enabled(TrackKind::Audio, !muted)?;
        self.local_muted = muted;
        tracing::debug!(session = %self.session_id, muted, "microphone toggled");
        self.publish();
        Ok(muted)
    }

    /// Переключает камеру, возвращает новое значение `video_off`
    pub fn toggle_video(&mut self) -> CallResult<bool> {
        let video_off = !self.local_video_off;
        self.set_track_enabled(TrackKind::Video, !video_off)?;
        self.local_video_off = video_off;
        tracing::debug!(session = %self.session_id, video_off, "camera toggled");
        self.publish();
        Ok(video_off)
    }

    /// Завершает звонок. Повторный вызов ничего не делает.
    pub async fn end_call(&mut self) {
        if matches!(self.state, CallState::Ending | CallState::Ended) {
            tracing::debug!(session = %self.session_id, "call already ended");
            return;
        }

        self.transition(CallState::Ending);
        self.cleanup().await;
        self.transition(CallState::Ended);
        tracing::info!(session = %self.session_id, "call ended");
        self.publish();
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let duration_secs = self.call_duration().map(|d| d.num_seconds());
        CallSnapshot {
            session_id: self.session_id.clone(),
            role: self.role,
            state: self.state,
            local_muted: self.local_muted,
            local_video_off: self.local_video_off,
            has_local_stream: self.local_stream.is_some(),
            has_remote_stream: self.remote_stream.is_some(),
            duration_secs,
            duration: duration_secs.map(format_duration),
            error: self.last_error.as_ref().map(ToString::to_string),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.local_muted
    }

    pub fn is_video_off(&self) -> bool {
        self.local_video_off
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    /// Длительность считается только в `active`
    pub fn call_duration(&self) -> Option<chrono::Duration> {
        match (self.state, self.connected_at) {
            (CallState::Active, Some(connected_at)) => Some(Utc::now() - connected_at),
            _ => None,
        }
    }

    /// Сигнал, который не удалось передать каналу.
    /// После успешной отправки здесь пусто.
    pub fn pending_signal(&self) -> Option<&SignalMessage> {
        self.pending_signal.as_ref()
    }

    pub fn last_error(&self) -> Option<&CallError> {
        self.last_error.as_ref()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.remote_candidates.len()
    }

    pub fn has_peer_connection(&self) -> bool {
        self.peer.is_some()
    }

    pub(crate) async fn next_envelope(&mut self) -> Option<Envelope> {
        self.events_rx.recv().await
    }

    pub(crate) async fn dispatch(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Inbound(message) => {
                if let Err(e) = self.accept_incoming_signal(message).await {
                    tracing::warn!(session = %self.session_id, error = %e, "inbound signal dropped");
                }
            }
            Envelope::Ticketed { generation, event } if generation != self.generation => {
                discard_stale(&self.session_id, generation, event);
            }
            Envelope::Ticketed { event, .. } => self.handle_event(event).await,
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::MediaResolved(result) => self.on_media_resolved(result).await,
            SessionEvent::LocalCandidate(candidate) if self.state.accepts_signals() => {
                self.local_candidates.push(candidate.clone());
                self.emit_signal(SignalPayload::Candidate(candidate)).await;
            }
            SessionEvent::Connected => self.on_connected(),
            SessionEvent::RemoteStream(stream) => self.on_remote_stream(stream),
            SessionEvent::PeerFailed(reason) if self.state.accepts_signals() => {
                self.fail(CallError::PeerConnection(reason)).await;
            }
            SessionEvent::RemoteClosed if self.state.accepts_signals() => {
                tracing::info!(session = %self.session_id, "peer connection closed remotely");
                self.end_call().await;
            }
            SessionEvent::NegotiationTimeout if self.state == CallState::Negotiating => {
                let secs = self.config.negotiation_timeout.as_secs();
                self.fail(CallError::PeerConnection(format!(
                    "negotiation did not complete within {secs}s"
                )))
                .await;
            }
            SessionEvent::Tick if self.state == CallState::Active => self.publish(),
            other => {
                tracing::trace!(session = %self.session_id, state = %self.state, event = ?other, "event ignored in current state");
            }
        }
    }

    async fn on_media_resolved(&mut self, result: Result<MediaStream, CaptureError>) {
        if self.state != CallState::RequestingMedia {
            if let Ok(stream) = result {
                stream.stop_all();
            }
            return;
        }

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(session = %self.session_id, error = %e, "media capture failed");
                self.fail(CallError::MediaUnavailable(e)).await;
                return;
            }
        };

        tracing::info!(
            session = %self.session_id,
            stream = %stream.id(),
            tracks = stream.tracks().len(),
            "local media acquired"
        );
        self.local_stream = Some(stream);
        self.transition(CallState::Negotiating);

        if let Err(e) = self.open_peer().await {
            self.fail(e).await;
            return;
        }
        self.subscribe_signals();
        self.arm_negotiation_timeout();

        if self.role == Role::Initiator {
            if let Err(e) = self.send_offer().await {
                self.fail(e).await;
                return;
            }
        }
        self.publish();
    }

    /// Создаёт соединение под текущие роль и поколение
    async fn open_peer(&mut self) -> CallResult<()> {
        // одновременно живёт не больше одного соединения
        if let Some(old) = self.peer.take() {
            old.close().await;
        }
        self.offer_sent = false;
        self.remote_generation = None;

        let local = self
            .local_stream
            .as_ref()
            .ok_or_else(|| CallError::PeerConnection("no local stream to send".into()))?;
        let sink = PeerEventSink::new(self.generation, self.events_tx.clone());
        let peer = self.deps.peers.create(self.role, &self.config, local, sink).await?;
        self.peer = Some(peer);

        tracing::debug!(session = %self.session_id, role = %self.role, generation = self.generation, "peer connection created");
        Ok(())
    }

    fn subscribe_signals(&mut self) {
        let tx = self.events_tx.clone();
        let handler: SignalHandler = Box::new(move |message| {
            let _ = tx.send(Envelope::Inbound(message));
        });
        self.subscription = Some(self.deps.signaling.on_signal(&self.session_id, handler));
    }

    fn arm_negotiation_timeout(&mut self) {
        let tx = self.events_tx.clone();
        let generation = self.generation;
        let timeout = self.config.negotiation_timeout;
        self.timers.push(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            ticketed(&tx, generation, SessionEvent::NegotiationTimeout);
        }));
    }

    fn start_duration_timer(&mut self) {
        let tx = self.events_tx.clone();
        let generation = self.generation;
        let period = self.config.tick_interval;
        self.timers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // первый тик срабатывает сразу
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let tick = Envelope::Ticketed {
                    generation,
                    event: SessionEvent::Tick,
                };
                if tx.send(tick).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }

    async fn send_offer(&mut self) -> CallResult<()> {
        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| CallError::PeerConnection("no peer connection".into()))?;
        let offer = peer.create_offer().await?;
        self.offer_sent = true;
        self.emit_signal(SignalPayload::Offer(offer)).await;
        Ok(())
    }

    async fn emit_signal(&mut self, payload: SignalPayload) {
        let message = SignalMessage::new(self.session_id.clone(), self.local_peer_id.clone(), payload)
            .with_generation(self.generation);
        let kind = message.kind();

        match self.deps.signaling.send(message.clone()).await {
            Ok(()) => {
                self.pending_signal = None;
                tracing::debug!(session = %self.session_id, %kind, "signal sent");
            }
            // канал не гарантирует доставку, сессия ждёт дальше
            Err(e) => {
                tracing::warn!(session = %self.session_id, %kind, error = %e, "failed to send signal");
                self.pending_signal = Some(message);
            }
        }
    }

    async fn apply_offer(&mut self, offer: SessionDescription, from: &str, generation: u64) -> CallResult<()> {
        if self.remote_generation.is_some() {
            return Err(self.reject("renegotiation is not supported"));
        }

        if self.role == Role::Initiator {
            // Встречные offer: инициатором остаётся участник с меньшим id
            if self.local_peer_id.as_str() < from {
                tracing::info!(session = %self.session_id, remote = %from, "offer collision, keeping local offer");
                return Ok(());
            }

            tracing::info!(session = %self.session_id, remote = %from, "offer collision, switching to responder");
            self.role = Role::Responder;
            // ответ и новые кандидаты уйдут с новым поколением,
            // кандидаты закрытого соединения другая сторона отбросит
            self.generation += 1;
            self.stop_timers();
            self.local_candidates.clear();
            if let Err(e) = self.open_peer().await {
                self.fail(e.clone()).await;
                return Err(e);
            }
            self.arm_negotiation_timeout();
        }

        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| CallError::PeerConnection("no peer connection".into()))?;
        let answer = match peer.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(e.clone()).await;
                return Err(e);
            }
        };

        self.remote_generation = Some(generation);
        self.apply_buffered_candidates(generation).await;
        self.emit_signal(SignalPayload::Answer(answer)).await;
        self.publish();
        Ok(())
    }

    async fn apply_answer(&mut self, answer: SessionDescription, generation: u64) -> CallResult<()> {
        if self.role != Role::Initiator || !self.offer_sent {
            return Err(self.reject("answer without a local offer"));
        }
        if self.remote_generation.is_some() {
            return Err(self.reject("answer already applied"));
        }

        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| CallError::PeerConnection("no peer connection".into()))?;
        if let Err(e) = peer.accept_answer(answer).await {
            self.fail(e.clone()).await;
            return Err(e);
        }

        self.remote_generation = Some(generation);
        self.apply_buffered_candidates(generation).await;
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate, generation: u64) {
        match self.remote_generation {
            None => self.remote_candidates.push(generation, candidate),
            Some(current) if current != generation => {
                tracing::debug!(
                    session = %self.session_id,
                    candidate = %candidate.candidate,
                    generation,
                    current,
                    "candidate of a replaced remote connection dropped"
                );
            }
            Some(_) => self.add_remote_candidate(candidate).await,
        }
    }

    async fn apply_buffered_candidates(&mut self, generation: u64) {
        let buffered = self.remote_candidates.take_for(generation);
        if !buffered.is_empty() {
            tracing::debug!(session = %self.session_id, count = buffered.len(), "applying buffered candidates");
        }
        for candidate in buffered {
            self.add_remote_candidate(candidate).await;
        }
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            tracing::warn!(session = %self.session_id, error = %e, "failed to add remote candidate");
        }
    }

    fn on_connected(&mut self) {
        match self.state {
            CallState::Negotiating => {
                self.transition(CallState::Active);
                self.connected_at = Some(Utc::now());
                if let Some(remote) = self.early_remote.take() {
                    self.remote_stream = Some(remote);
                }
                // Таймаут переговоров больше не нужен
                self.stop_timers();
                self.start_duration_timer();
                analyze_candidates(&self.local_candidates);
                tracing::info!(session = %self.session_id, role = %self.role, "call connected");
                self.publish();
            }
            CallState::Active => {
                tracing::debug!(session = %self.session_id, "connection recovered");
            }
            _ => {}
        }
    }

    fn on_remote_stream(&mut self, stream: RemoteStream) {
        let slot = match self.state {
            CallState::Active => &mut self.remote_stream,
            CallState::Negotiating => &mut self.early_remote,
            _ => return,
        };
        match slot {
            Some(existing) if existing.id == stream.id => existing.merge(stream),
            _ => *slot = Some(stream),
        }
        tracing::debug!(session = %self.session_id, state = %self.state, "remote stream attached");
        self.publish();
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> CallResult<()> {
        let track = self
            .local_stream
            .as_ref()
            .and_then(|stream| stream.track(kind))
            .filter(|track| !track.is_stopped())
            .ok_or(CallError::NoActiveTrack(kind))?;
        track.set_enabled(enabled);
        Ok(())
    }

    async fn fail(&mut self, err: CallError) {
        if !self.state.is_live() {
            tracing::debug!(session = %self.session_id, state = %self.state, error = %err, "failure after teardown ignored");
            return;
        }

        tracing::error!(session = %self.session_id, state = %self.state, error = %err, "call failed");
        self.cleanup().await;
        self.last_error = Some(err);
        self.transition(CallState::Error);
        self.publish();
    }

    /// Единственная точка освобождения ресурсов. Повторный вызов безопасен.
    async fn cleanup(&mut self) {
        self.generation += 1;
        self.stop_timers();
        self.subscription = None;

        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        if let Some(stream) = self.local_stream.take() {
            let stopped = stream.stop_all();
            tracing::debug!(session = %self.session_id, stopped, "local tracks stopped");
        }

        self.remote_stream = None;
        self.early_remote = None;
        self.remote_candidates.clear();
        self.local_candidates.clear();
        self.pending_signal = None;
        self.offer_sent = false;
        self.remote_generation = None;
    }

    fn reject(&self, detail: impl Into<String>) -> CallError {
        CallError::InvalidSignalState {
            state: self.state,
            detail: detail.into(),
        }
    }

    fn transition(&mut self, next: CallState) {
        if !self.state.can_transition_to(next) {
            tracing::error!(session = %self.session_id, from = %self.state, to = %next, "illegal state transition ignored");
            return;
        }
        tracing::info!(session = %self.session_id, from = %self.state, to = %next, "call state changed");
        self.state = next;
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

fn discard_stale(session_id: &str, generation: u64, event: SessionEvent) {
    match event {
        SessionEvent::MediaResolved(Ok(stream)) => {
            let stopped = stream.stop_all();
            tracing::info!(session = %session_id, generation, stopped, "late media released");
        }
        other => {
            tracing::trace!(session = %session_id, generation, event = ?other, "stale event dropped");
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.stop_timers();
        if let Some(peer) = self.peer.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { peer.close().await });
            }
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("session_id", &self.session_id)
            .field("local_peer_id", &self.local_peer_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish()
    }
}
