use super::{
    compact, SignalHandler, SignalMessage, SignalSubscription, SignalingChannel, SignalingError,
    MAX_UNDELIVERED,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

type SharedHandler = Arc<dyn Fn(SignalMessage) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    entries: Vec<(u64, String, SharedHandler)>,
}

/// Ручной сигнальный канал: исходящие сигналы копятся в outbox сессии
/// в компактном виде, пользователь переносит их сам (QR, мессенджер),
/// входящие импортируются через [`ManualSignaling::import`].
#[derive(Default)]
pub struct ManualSignaling {
    outbox: Mutex<HashMap<String, VecDeque<String>>>,
    handlers: Arc<Mutex<Handlers>>,
}

impl ManualSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Забирает накопленные исходящие сигналы сессии
    pub fn take_outgoing(&self, session_id: &str) -> Vec<String> {
        self.outbox
            .lock()
            .remove(session_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn outgoing_len(&self, session_id: &str) -> usize {
        self.outbox.lock().get(session_id).map_or(0, VecDeque::len)
    }

    /// Выбрасывает то, что сессия так и не передала
    pub fn discard(&self, session_id: &str) -> usize {
        let dropped = self.outbox.lock().remove(session_id).map_or(0, |queue| queue.len());
        if dropped > 0 {
            tracing::debug!(session = %session_id, dropped, "undelivered manual signals discarded");
        }
        dropped
    }

    /// Декодирует сигнал и отдаёт его подписчикам сессии
    pub fn import(&self, encoded: &str) -> Result<SignalMessage, SignalingError> {
        let message = compact::decode(encoded)?;
        let targets: Vec<SharedHandler> = self
            .handlers
            .lock()
            .entries
            .iter()
            .filter(|(_, session, _)| *session == message.session_id)
            .map(|(_, _, handler)| handler.clone())
            .collect();

        if targets.is_empty() {
            return Err(SignalingError::NoSubscriber(message.session_id));
        }
        for handler in targets {
            handler(message.clone());
        }
        Ok(message)
    }
}

#[async_trait]
impl SignalingChannel for ManualSignaling {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let encoded = compact::encode(&message)?;
        tracing::debug!(
            session = %message.session_id,
            kind = %message.kind(),
            len = encoded.len(),
            "signal queued for manual transfer"
        );
        let mut outbox = self.outbox.lock();
        let queue = outbox.entry(message.session_id.clone()).or_default();
        if queue.len() >= MAX_UNDELIVERED {
            tracing::warn!(session = %message.session_id, "manual outbox is full");
            return Err(SignalingError::Backlog(message.session_id));
        }
        queue.push_back(encoded);
        Ok(())
    }

    fn on_signal(&self, session_id: &str, handler: SignalHandler) -> SignalSubscription {
        let id = {
            let mut handlers = self.handlers.lock();
            handlers.next_id += 1;
            let id = handlers.next_id;
            handlers
                .entries
                .push((id, session_id.to_string(), Arc::from(handler)));
            id
        };
        let handlers = self.handlers.clone();
        SignalSubscription::new(move || {
            handlers.lock().entries.retain(|(entry, _, _)| *entry != id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::IceCandidate;
    use crate::signaling::SignalPayload;

    #[tokio::test]
    async fn outgoing_signals_can_be_imported_on_the_other_side() {
        let caller = ManualSignaling::new();
        let callee = ManualSignaling::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = callee.on_signal("s1", Box::new(move |m| sink.lock().push(m)));

        let msg = SignalMessage::new(
            "s1",
            "peer-a",
            SignalPayload::Candidate(IceCandidate::new("candidate:1 1 udp 1 1.2.3.4 9 typ host")),
        );
        caller.send(msg.clone()).await.unwrap();
        assert_eq!(caller.outgoing_len("s1"), 1);
        let outgoing = caller.take_outgoing("s1");
        assert_eq!(outgoing.len(), 1);
        assert_eq!(caller.outgoing_len("s1"), 0);

        let imported = callee.import(&outgoing[0]).unwrap();
        assert_eq!(imported, msg);
        assert_eq!(seen.lock().as_slice(), &[msg]);
    }

    #[tokio::test]
    async fn import_without_subscriber_fails() {
        let side = ManualSignaling::new();
        let msg = SignalMessage::new(
            "lonely",
            "peer-a",
            SignalPayload::Candidate(IceCandidate::new("candidate:x")),
        );
        let encoded = compact::encode(&msg).unwrap();
        assert_eq!(
            side.import(&encoded).unwrap_err(),
            SignalingError::NoSubscriber("lonely".into())
        );
    }

    #[tokio::test]
    async fn outbox_is_kept_per_session() {
        let side = ManualSignaling::new();
        let candidate = |session: &str| {
            SignalMessage::new(
                session,
                "peer-a",
                SignalPayload::Candidate(IceCandidate::new("candidate:1 1 udp 1 1.2.3.4 9 typ host")),
            )
        };
        side.send(candidate("s1")).await.unwrap();
        side.send(candidate("s2")).await.unwrap();
        side.send(candidate("s2")).await.unwrap();

        assert_eq!(side.take_outgoing("s1").len(), 1);
        assert_eq!(side.outgoing_len("s2"), 2);
        assert_eq!(side.discard("s2"), 2);
        assert!(side.take_outgoing("s2").is_empty());
    }

    #[tokio::test]
    async fn full_outbox_refuses_new_signals() {
        let side = ManualSignaling::new();
        let msg = SignalMessage::new("s1", "peer-a", SignalPayload::Candidate(IceCandidate::new("candidate:x")));
        for _ in 0..MAX_UNDELIVERED {
            side.send(msg.clone()).await.unwrap();
        }
        assert_eq!(
            side.send(msg).await.unwrap_err(),
            SignalingError::Backlog("s1".into())
        );
        assert_eq!(side.outgoing_len("s1"), MAX_UNDELIVERED);
    }
}
