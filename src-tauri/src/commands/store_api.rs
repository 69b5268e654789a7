use super::{CommandError, CommandResult};
use crate::auth::{issue_token, TokenConfig};
use crate::store::{
    AiDiagnosis, AppState, Appointment, AppointmentUpdate, HealthDataUpdate, Screen, SharedStore,
    StoredSnapshot, Subscription, User,
};
use serde::Serialize;
use tauri::{command, State};

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoginOutcome {
    pub screen: Screen,
    pub token: Option<String>,
}

fn signed_in(done: bool) -> CommandResult<()> {
    if done {
        Ok(())
    } else {
        Err(CommandError::Rejected("no signed-in user".into()))
    }
}

#[command]
pub fn get_app_state(store: State<'_, SharedStore>) -> AppState {
    store.read(|s| s.state().clone())
}

#[command]
pub fn navigate(store: State<'_, SharedStore>, screen: Screen) -> Screen {
    store.update(|s| s.navigate(screen))
}

/// Вход или регистрация прошли; для известного пользователя выдаём токен
#[command]
pub fn login_succeeded(
    store: State<'_, SharedStore>,
    tokens: State<'_, TokenConfig>,
    user: Option<User>,
) -> CommandResult<LoginOutcome> {
    let token = user
        .as_ref()
        .map(|user| issue_token(&user.id, &tokens))
        .transpose()?;
    let screen = store.update(|s| s.login_succeeded(user));
    Ok(LoginOutcome { screen, token })
}

#[command]
pub fn logout(store: State<'_, SharedStore>) -> Screen {
    store.update(|s| s.logout())
}

#[command]
pub fn add_appointment(store: State<'_, SharedStore>, appointment: Appointment) -> CommandResult<()> {
    signed_in(store.update(|s| s.add_appointment(appointment)))
}

#[command]
pub fn update_appointment(
    store: State<'_, SharedStore>,
    id: String,
    updates: AppointmentUpdate,
) -> CommandResult<()> {
    if store.update(|s| s.update_appointment(&id, updates)) {
        Ok(())
    } else {
        Err(CommandError::Rejected(format!("appointment {id} not found")))
    }
}

#[command]
pub fn add_health_data(store: State<'_, SharedStore>, data: HealthDataUpdate) -> CommandResult<()> {
    signed_in(store.update(|s| s.add_health_data(data)))
}

#[command]
pub fn add_ai_diagnosis(store: State<'_, SharedStore>, diagnosis: AiDiagnosis) -> CommandResult<()> {
    signed_in(store.update(|s| s.add_ai_diagnosis(diagnosis)))
}

#[command]
pub fn update_subscription(store: State<'_, SharedStore>, subscription: Subscription) -> CommandResult<()> {
    signed_in(store.update(|s| s.update_subscription(subscription)))
}

/// Снимок под ключом `mediconnect-storage`
#[command]
pub fn export_app_state(store: State<'_, SharedStore>) -> CommandResult<StoredSnapshot> {
    Ok(store.export()?)
}

#[command]
pub fn import_app_state(store: State<'_, SharedStore>, value: String) -> CommandResult<AppState> {
    Ok(store.import(&value)?)
}
