use super::events::Envelope;
use super::session::{CallDeps, CallSession, CallSnapshot};
use super::state::CallState;
use crate::config::{CallConfig, ConfigError};
use crate::error::{CallError, CallResult};
use crate::media::{MediaConstraints, TrackKind};
use crate::peer::{Role, ServerConfig};
use crate::signaling::SignalMessage;
use crate::utils::random_id;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

const COMMAND_QUEUE: usize = 32;

/// Команды от UI к сессии. Обрабатываются в той же очереди, что и
/// события соединения, поэтому никогда не пересекаются с ними.
#[derive(Debug)]
pub enum CallCommand {
    AcceptSignal(SignalMessage, oneshot::Sender<CallResult<()>>),
    ToggleMute(oneshot::Sender<CallResult<bool>>),
    ToggleVideo(oneshot::Sender<CallResult<bool>>),
    End(oneshot::Sender<()>),
}

enum Input {
    Command(Option<CallCommand>),
    Event(Option<Envelope>),
}

/// Ручка на сессию, живущую в собственной задаче
#[derive(Clone, Debug)]
pub struct CallHandle {
    session_id: String,
    commands: mpsc::Sender<CallCommand>,
    snapshots: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    /// Запускает захват медиа и переносит сессию в отдельную задачу
    pub fn begin(mut session: CallSession, constraints: MediaConstraints) -> CallResult<Self> {
        session.begin(constraints)?;
        Ok(Self::spawn(session))
    }

    /// Переносит сессию (в любом состоянии) в отдельную задачу
    pub fn spawn(session: CallSession) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let snapshots = session.subscribe();
        let session_id = session.session_id().to_string();
        tokio::spawn(run(session, rx));

        Self {
            session_id,
            commands,
            snapshots,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.clone()
    }

    /// Ждёт, пока сессия выйдет из захвата медиа
    pub async fn settled(&self) -> CallSnapshot {
        self.wait_for(|s| !matches!(s.state, CallState::Idle | CallState::RequestingMedia))
            .await
    }

    /// Ждёт снимка, удовлетворяющего условию; если сессия уже
    /// уничтожена, возвращает последний снимок
    pub async fn wait_for(&self, mut ready: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        let mut rx = self.snapshots.clone();
        let result = rx.wait_for(|s| ready(s)).await.map(|s| (*s).clone());
        result.unwrap_or_else(|_| rx.borrow().clone())
    }

    pub async fn accept_signal(&self, message: SignalMessage) -> CallResult<()> {
        self.request("accept a signal", |tx| CallCommand::AcceptSignal(message, tx))
            .await
    }

    pub async fn toggle_mute(&self) -> CallResult<bool> {
        self.request("toggle microphone", CallCommand::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> CallResult<bool> {
        self.request("toggle camera", CallCommand::ToggleVideo).await
    }

    /// Завершает звонок; для уже завершённого ничего не делает
    pub async fn end(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(CallCommand::End(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn request<T>(
        &self,
        action: &'static str,
        make: impl FnOnce(oneshot::Sender<CallResult<T>>) -> CallCommand,
    ) -> CallResult<T> {
        let closed = || CallError::InvalidTransition {
            from: CallState::Ended,
            action,
        };
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| closed())?;
        rx.await.unwrap_or_else(|_| Err(closed()))
    }
}

async fn run(mut session: CallSession, mut commands: mpsc::Receiver<CallCommand>) {
    tracing::debug!(session = %session.session_id(), "call task started");

    loop {
        // Ждём только приёма: обработка идёт вне select, чтобы её не прервать
        let input = tokio::select! {
            biased;
            command = commands.recv() => Input::Command(command),
            envelope = session.next_envelope() => Input::Event(envelope),
        };

        match input {
            Input::Command(Some(command)) => execute(&mut session, command).await,
            Input::Command(None) => {
                // все ручки потеряны
                session.end_call().await;
            }
            Input::Event(Some(envelope)) => session.dispatch(envelope).await,
            Input::Event(None) => break,
        }

        if session.state().is_terminal() {
            break;
        }
    }

    tracing::debug!(session = %session.session_id(), "call task finished");
}

async fn execute(session: &mut CallSession, command: CallCommand) {
    match command {
        CallCommand::AcceptSignal(message, reply) => {
            let _ = reply.send(session.accept_incoming_signal(message).await);
        }
        CallCommand::ToggleMute(reply) => {
            let _ = reply.send(session.toggle_mute());
        }
        CallCommand::ToggleVideo(reply) => {
            let _ = reply.send(session.toggle_video());
        }
        CallCommand::End(reply) => {
            session.end_call().await;
            let _ = reply.send(());
        }
    }
}

type Calls = Arc<Mutex<HashMap<String, CallHandle>>>;

/// Все звонки приложения, по id консультации.
/// Завершённые звонки удаляются из реестра сами.
pub struct CallRegistry {
    local_peer_id: String,
    deps: CallDeps,
    config: RwLock<CallConfig>,
    calls: Calls,
}

impl CallRegistry {
    pub fn new(deps: CallDeps, config: CallConfig) -> Self {
        Self {
            local_peer_id: random_id(),
            deps,
            config: RwLock::new(config),
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// id этого участника во всех звонках (например, id пользователя)
    pub fn with_local_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.local_peer_id = peer_id.into();
        self
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn config(&self) -> CallConfig {
        self.config.read().clone()
    }

    /// Новые ICE серверы действуют для звонков, начатых после замены
    pub fn set_ice_servers(&self, servers: Vec<ServerConfig>) -> Result<(), ConfigError> {
        let updated = self.config().with_ice_servers(servers)?;
        tracing::info!(count = updated.ice_servers.len(), "ICE servers updated");
        *self.config.write() = updated;
        Ok(())
    }

    pub fn ice_servers(&self) -> Vec<ServerConfig> {
        self.config.read().ice_servers.clone()
    }

    /// Начинает звонок. Возвращается сразу после запроса медиа;
    /// дождаться результата можно через [`CallHandle::settled`].
    /// Звонок той же консультации, закончившийся ошибкой, заменяется новым.
    pub async fn start(
        &self,
        session_id: impl Into<String>,
        role: Role,
        constraints: MediaConstraints,
    ) -> CallResult<CallHandle> {
        let session_id = session_id.into();
        let mut calls = self.calls.lock().await;

        if let Some(existing) = calls.get(&session_id) {
            let state = existing.snapshot().state;
            if state.is_live() {
                return Err(CallError::InvalidTransition {
                    from: state,
                    action: "start a second call for the same consultation",
                });
            }
            if !state.is_terminal() {
                tracing::debug!(session = %session_id, %state, "replacing failed call");
                existing.end().await;
            }
        }

        let session = CallSession::new(session_id.clone(), role, self.deps.clone(), self.config())
            .with_local_peer_id(self.local_peer_id.clone());
        let handle = CallHandle::begin(session, constraints)?;
        calls.insert(session_id, handle.clone());
        forget_when_ended(Arc::downgrade(&self.calls), &handle);
        Ok(handle)
    }

    pub async fn get(&self, session_id: &str) -> Option<CallHandle> {
        self.calls.lock().await.get(session_id).cloned()
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<CallSnapshot> {
        self.get(session_id).await.map(|handle| handle.snapshot())
    }

    pub async fn accept_signal(&self, message: SignalMessage) -> CallResult<()> {
        match self.get(&message.session_id).await {
            Some(handle) => handle.accept_signal(message).await,
            None => Err(CallError::InvalidSignalState {
                state: CallState::Idle,
                detail: format!("no call for session {}", message.session_id),
            }),
        }
    }

    pub async fn toggle_mute(&self, session_id: &str) -> CallResult<bool> {
        match self.get(session_id).await {
            Some(handle) => handle.toggle_mute().await,
            None => Err(CallError::NoActiveTrack(TrackKind::Audio)),
        }
    }

    pub async fn toggle_video(&self, session_id: &str) -> CallResult<bool> {
        match self.get(session_id).await {
            Some(handle) => handle.toggle_video().await,
            None => Err(CallError::NoActiveTrack(TrackKind::Video)),
        }
    }

    /// Завершает звонок и забывает его. `false`, если звонка не было.
    pub async fn end(&self, session_id: &str) -> bool {
        let handle = self.calls.lock().await.remove(session_id);
        match handle {
            Some(handle) => {
                handle.end().await;
                true
            }
            None => false,
        }
    }

    pub async fn end_all(&self) {
        let handles: Vec<CallHandle> = self.calls.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.end().await;
        }
    }

    /// Сколько звонков сейчас в реестре
    pub async fn active_calls(&self) -> usize {
        self.calls.lock().await.len()
    }
}

/// Убирает звонок из реестра, когда тот завершится сам (например,
/// собеседник закрыл соединение). Замена звонка новым не затрагивается.
/// Сильную ручку не держит: иначе звонок не заметит потерю всех ручек.
fn forget_when_ended(calls: Weak<Mutex<HashMap<String, CallHandle>>>, handle: &CallHandle) {
    let session_id = handle.session_id.clone();
    let commands = handle.commands.downgrade();
    let mut snapshots = handle.subscribe();

    tokio::spawn(async move {
        // Err означает, что сессии уже нет
        let _ = snapshots.wait_for(|s| s.state.is_terminal()).await;
        let Some(calls) = calls.upgrade() else {
            return;
        };
        let mut calls = calls.lock().await;
        let ours = match (calls.get(&session_id), commands.upgrade()) {
            (Some(current), Some(commands)) => current.commands.same_channel(&commands),
            _ => false,
        };
        if ours {
            calls.remove(&session_id);
            tracing::debug!(session = %session_id, "ended call removed from registry");
        }
    });
}
