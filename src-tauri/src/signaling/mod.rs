//! Контракт сигнального канала и формат сообщений.
//!
//! На проводе сообщение выглядит так:
//! `{"sessionId": "...", "from": "...", "generation": 0, "kind": "offer"|"answer"|"candidate", "payload": {...}}`.
//! `generation` меняется, когда отправитель пересоздаёт соединение; по нему
//! получатель отличает кандидаты старого соединения. Если поля нет, это 0.
//! Канал не обязан сохранять порядок или доставлять всё; сессия сама
//! буферизует кандидаты, пришедшие раньше remote description.

pub mod compact;
pub mod manual;
pub mod memory;

pub use manual::ManualSignaling;
pub use memory::{MemoryHub, MemorySignaling};

use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("failed to encode signal: {0}")]
    Encode(String),
    #[error("failed to decode signal: {0}")]
    Decode(String),
    #[error("signal exceeds {0} bytes after decompression")]
    TooLarge(u64),
    #[error("nobody listens for session {0}")]
    NoSubscriber(String),
    #[error("too many undelivered signals for session {0}")]
    Backlog(String),
}

/// Сколько недоставленных сигналов одной сессии держит канал.
/// Сверх этого отправка отклоняется, уже лежащие сигналы остаются.
pub const MAX_UNDELIVERED: usize = 64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => f.write_str("offer"),
            SignalKind::Answer => f.write_str("answer"),
            SignalKind::Candidate => f.write_str("candidate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::Candidate(_) => SignalKind::Candidate,
        }
    }
}

/// Сигнальное сообщение между двумя участниками одной сессии
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "WireMessage")]
pub struct SignalMessage {
    pub session_id: String,
    /// id участника-отправителя
    pub from: String,
    /// поколение соединения отправителя
    pub generation: u64,
    pub payload: SignalPayload,
}

impl SignalMessage {
    pub fn new(session_id: impl Into<String>, from: impl Into<String>, payload: SignalPayload) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            generation: 0,
            payload,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Encode(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json).map_err(|e| SignalingError::Decode(e.to_string()))
    }
}

impl Serialize for SignalMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SignalMessage", 5)?;
        state.serialize_field("sessionId", &self.session_id)?;
        state.serialize_field("from", &self.from)?;
        state.serialize_field("generation", &self.generation)?;
        state.serialize_field("kind", &self.kind())?;
        match &self.payload {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => {
                state.serialize_field("payload", desc)?
            }
            SignalPayload::Candidate(candidate) => state.serialize_field("payload", candidate)?,
        }
        state.end()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    session_id: String,
    from: String,
    #[serde(default)]
    generation: u64,
    kind: SignalKind,
    payload: serde_json::Value,
}

impl TryFrom<WireMessage> for SignalMessage {
    type Error = String;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let payload = match wire.kind {
            SignalKind::Offer | SignalKind::Answer => {
                let desc: SessionDescription =
                    serde_json::from_value(wire.payload).map_err(|e| e.to_string())?;
                match (wire.kind, desc.kind) {
                    (SignalKind::Offer, SdpKind::Offer) => SignalPayload::Offer(desc),
                    (SignalKind::Answer, SdpKind::Answer) => SignalPayload::Answer(desc),
                    (kind, sdp) => {
                        return Err(format!("kind `{kind}` carries sdp of type {sdp:?}"));
                    }
                }
            }
            SignalKind::Candidate => SignalPayload::Candidate(
                serde_json::from_value(wire.payload).map_err(|e| e.to_string())?,
            ),
        };

        Ok(SignalMessage {
            session_id: wire.session_id,
            from: wire.from,
            generation: wire.generation,
            payload,
        })
    }
}

pub type SignalHandler = Box<dyn Fn(SignalMessage) + Send + Sync>;

/// Подписка на входящие сигналы; отписывается при drop
pub struct SignalSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SignalSubscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for SignalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Транспорт сигналов между участниками
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Fire-and-forget отправка
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;

    /// Доставляет входящие сигналы сессии в `handler`, пока жива подписка
    fn on_signal(&self, session_id: &str, handler: SignalHandler) -> SignalSubscription;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_wire_shape() {
        let msg = SignalMessage::new(
            "consult-42",
            "peer-a",
            SignalPayload::Offer(SessionDescription::offer("v=0")),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "sessionId": "consult-42",
                "from": "peer-a",
                "generation": 0,
                "kind": "offer",
                "payload": {"type": "offer", "sdp": "v=0"}
            })
        );
        assert_eq!(SignalMessage::from_json(&value.to_string()).unwrap(), msg);
    }

    #[test]
    fn generation_survives_the_wire_and_defaults_to_zero() {
        let msg = SignalMessage::new(
            "consult-42",
            "peer-a",
            SignalPayload::Answer(SessionDescription::answer("v=0")),
        )
        .with_generation(3);
        let json = msg.to_json().unwrap();
        assert_eq!(SignalMessage::from_json(&json).unwrap().generation, 3);

        let raw = json!({
            "sessionId": "s",
            "from": "p",
            "kind": "answer",
            "payload": {"type": "answer", "sdp": "v=0"}
        });
        assert_eq!(SignalMessage::from_json(&raw.to_string()).unwrap().generation, 0);
    }

    #[test]
    fn candidate_wire_shape() {
        let msg = SignalMessage::new(
            "consult-42",
            "peer-b",
            SignalPayload::Candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5000 typ host")),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "candidate");
        assert_eq!(value["payload"]["sdpMid"], "0");
        assert_eq!(value["payload"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn mismatched_kind_is_rejected() {
        let raw = json!({
            "sessionId": "s",
            "from": "p",
            "kind": "offer",
            "payload": {"type": "answer", "sdp": "v=0"}
        });
        let err = SignalMessage::from_json(&raw.to_string()).unwrap_err();
        assert!(matches!(err, SignalingError::Decode(_)));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = r#"{"sessionId":"s","from":"p","kind":"bye","payload":{}}"#;
        assert!(SignalMessage::from_json(raw).is_err());
    }

    #[test]
    fn subscription_cancels_once_on_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = SignalSubscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
