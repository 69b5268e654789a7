use super::{
    SignalHandler, SignalMessage, SignalSubscription, SignalingChannel, SignalingError, MAX_UNDELIVERED,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

type SharedHandler = Arc<dyn Fn(SignalMessage) + Send + Sync>;

struct Subscriber {
    id: u64,
    session_id: String,
    participant: String,
    handler: SharedHandler,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    // Сообщения, для которых ещё нет получателя
    mailbox: Vec<SignalMessage>,
}

/// Ретранслятор сигналов внутри процесса.
///
/// Сообщение доставляется всем подписчикам той же сессии, кроме
/// отправителя; если таких нет, оно ждёт в почтовом ящике. Ящик
/// держит не больше [`MAX_UNDELIVERED`] сообщений на сессию.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Конечная точка участника; `participant` должен совпадать с его peer id
    pub fn endpoint(&self, participant: impl Into<String>) -> MemorySignaling {
        MemorySignaling {
            hub: self.clone(),
            participant: participant.into(),
        }
    }

    /// Сколько сообщений сессии ещё не доставлено
    pub fn pending(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .mailbox
            .iter()
            .filter(|m| m.session_id == session_id)
            .count()
    }

    fn deliver(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let targets: Vec<SharedHandler> = {
            let mut inner = self.inner.lock();
            let targets: Vec<SharedHandler> = inner
                .subscribers
                .iter()
                .filter(|s| s.session_id == message.session_id && s.participant != message.from)
                .map(|s| s.handler.clone())
                .collect();
            if targets.is_empty() {
                let parked = inner
                    .mailbox
                    .iter()
                    .filter(|m| m.session_id == message.session_id)
                    .count();
                if parked >= MAX_UNDELIVERED {
                    tracing::warn!(session = %message.session_id, parked, "mailbox is full, signal refused");
                    return Err(SignalingError::Backlog(message.session_id));
                }
                tracing::trace!(session = %message.session_id, kind = %message.kind(), "no receiver yet, parking signal");
                inner.mailbox.push(message);
                return Ok(());
            }
            targets
        };

        // Обработчики вызываются без удержания блокировки
        for handler in targets {
            handler(message.clone());
        }
        Ok(())
    }

    fn subscribe(&self, session_id: &str, participant: &str, handler: SignalHandler) -> SignalSubscription {
        let handler: SharedHandler = Arc::from(handler);
        let (id, parked) = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.subscribers.push(Subscriber {
                id,
                session_id: session_id.to_string(),
                participant: participant.to_string(),
                handler: handler.clone(),
            });

            let mut parked = Vec::new();
            inner.mailbox.retain(|m| {
                if m.session_id == session_id && m.from != participant {
                    parked.push(m.clone());
                    false
                } else {
                    true
                }
            });
            (id, parked)
        };

        for message in parked {
            handler(message);
        }

        let inner = self.inner.clone();
        SignalSubscription::new(move || {
            inner.lock().subscribers.retain(|s| s.id != id);
        })
    }
}

/// Канал одного участника поверх [`MemoryHub`]
#[derive(Clone)]
pub struct MemorySignaling {
    hub: MemoryHub,
    participant: String,
}

impl MemorySignaling {
    pub fn participant(&self) -> &str {
        &self.participant
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.hub.deliver(message)
    }

    fn on_signal(&self, session_id: &str, handler: SignalHandler) -> SignalSubscription {
        self.hub.subscribe(session_id, &self.participant, handler)
    }
}
