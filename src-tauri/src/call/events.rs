use crate::media::{CaptureError, MediaStream, RemoteStream};
use crate::peer::types::IceCandidate;
use crate::signaling::SignalMessage;
use tokio::sync::mpsc;

/// Событие с билетом поколения сессии. Всё, что приходит со старым
/// поколением, относится к уже разобранной сессии и не применяется.
#[derive(Debug)]
pub(crate) enum Envelope {
    Ticketed { generation: u64, event: SessionEvent },
    Inbound(SignalMessage),
}

#[derive(Debug)]
pub(crate) enum SessionEvent {
    MediaResolved(Result<MediaStream, CaptureError>),
    LocalCandidate(IceCandidate),
    Connected,
    RemoteStream(RemoteStream),
    PeerFailed(String),
    RemoteClosed,
    NegotiationTimeout,
    Tick,
}

pub(crate) type EventSender = mpsc::UnboundedSender<Envelope>;

pub(crate) fn ticketed(tx: &EventSender, generation: u64, event: SessionEvent) {
    if let Err(mpsc::error::SendError(envelope)) = tx.send(Envelope::Ticketed { generation, event }) {
        // Сессия уже уничтожена; ресурсы события освобождаются вместе с ним
        tracing::trace!(?envelope, "session queue closed, event dropped");
    }
}

/// Через этот sink соединение сообщает о своих событиях в очередь сессии
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: EventSender,
}

impl PeerEventSink {
    pub(crate) fn new(generation: u64, tx: EventSender) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        ticketed(&self.tx, self.generation, SessionEvent::LocalCandidate(candidate));
    }

    pub fn connected(&self) {
        ticketed(&self.tx, self.generation, SessionEvent::Connected);
    }

    pub fn remote_stream(&self, stream: RemoteStream) {
        ticketed(&self.tx, self.generation, SessionEvent::RemoteStream(stream));
    }

    pub fn failed(&self, reason: impl Into<String>) {
        ticketed(&self.tx, self.generation, SessionEvent::PeerFailed(reason.into()));
    }

    pub fn closed(&self) {
        ticketed(&self.tx, self.generation, SessionEvent::RemoteClosed);
    }
}

impl std::fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEventSink")
            .field("generation", &self.generation)
            .finish()
    }
}
