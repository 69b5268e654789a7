use super::{CallBackend, CommandResult};
use crate::call::CallSnapshot;
use crate::media::MediaConstraints;
use crate::peer::Role;
use crate::signaling::SignalMessage;
use tauri::{command, AppHandle, Emitter, Runtime, State};
use tokio::sync::watch;

/// Событие с новым снимком звонка
pub const CALL_STATE_EVENT: &str = "mediconnect://call-state";

/// Начинает звонок и ждёт результата захвата медиа.
/// Дальнейшие изменения приходят событиями `mediconnect://call-state`.
#[command]
pub async fn start_call<R: Runtime>(
    app: AppHandle<R>,
    backend: State<'_, CallBackend>,
    session_id: String,
    role: Role,
    constraints: Option<MediaConstraints>,
) -> CommandResult<CallSnapshot> {
    tracing::info!(session = %session_id, %role, "start_call called");
    let handle = backend
        .registry
        .start(session_id, role, constraints.unwrap_or_default())
        .await?;
    forward_snapshots(app, handle.subscribe());
    Ok(handle.settled().await)
}

/// Входящий сигнал в JSON виде
#[command]
pub async fn accept_signal(backend: State<'_, CallBackend>, signal: String) -> CommandResult<()> {
    let message = SignalMessage::from_json(&signal)?;
    backend.registry.accept_signal(message).await?;
    Ok(())
}

#[command]
pub async fn toggle_mute(backend: State<'_, CallBackend>, session_id: String) -> CommandResult<bool> {
    Ok(backend.registry.toggle_mute(&session_id).await?)
}

#[command]
pub async fn toggle_video(backend: State<'_, CallBackend>, session_id: String) -> CommandResult<bool> {
    Ok(backend.registry.toggle_video(&session_id).await?)
}

/// `false`, если такого звонка не было
#[command]
pub async fn end_call(backend: State<'_, CallBackend>, session_id: String) -> CommandResult<bool> {
    let ended = backend.registry.end(&session_id).await;
    backend.signaling.discard(&session_id);
    Ok(ended)
}

#[command]
pub async fn call_snapshot(
    backend: State<'_, CallBackend>,
    session_id: String,
) -> CommandResult<Option<CallSnapshot>> {
    Ok(backend.registry.snapshot(&session_id).await)
}

/// Исходящие сигналы звонка в компактном виде, для ручной передачи собеседнику
#[command]
pub fn take_outgoing_signals(backend: State<'_, CallBackend>, session_id: String) -> Vec<String> {
    backend.signaling.take_outgoing(&session_id)
}

/// Сигнал, полученный от собеседника вручную
#[command]
pub fn import_signal(backend: State<'_, CallBackend>, encoded: String) -> CommandResult<SignalMessage> {
    Ok(backend.signaling.import(&encoded)?)
}

fn forward_snapshots<R: Runtime>(app: AppHandle<R>, mut snapshots: watch::Receiver<CallSnapshot>) {
    tauri::async_runtime::spawn(async move {
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            if let Err(e) = app.emit(CALL_STATE_EVENT, &snapshot) {
                tracing::warn!(error = %e, "failed to emit call state");
            }
            if snapshot.state.is_terminal() || snapshots.changed().await.is_err() {
                break;
            }
        }
    });
}
