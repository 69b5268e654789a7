pub mod auth;
pub mod call;
pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod store;
pub mod utils;

pub use call::{CallDeps, CallHandle, CallRegistry, CallSession, CallSnapshot, CallState};
pub use commands::CallBackend;
pub use config::CallConfig;
pub use error::{CallError, CallResult};

use auth::TokenConfig;
use store::SharedStore;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{Manager, Runtime};

/// Плагин видеоконсультаций: `.plugin(mediconnect::init())`
pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new("mediconnect")
        .invoke_handler(tauri::generate_handler![
            // Звонок
            commands::call_api::start_call,
            commands::call_api::accept_signal,
            commands::call_api::toggle_mute,
            commands::call_api::toggle_video,
            commands::call_api::end_call,
            commands::call_api::call_snapshot,
            // Ручная передача сигналов
            commands::call_api::take_outgoing_signals,
            commands::call_api::import_signal,
            // ICE серверы
            commands::util_api::set_ice_servers,
            commands::util_api::get_ice_servers,
            commands::util_api::check_ice_server_availability,
            // Состояние приложения
            commands::store_api::get_app_state,
            commands::store_api::navigate,
            commands::store_api::login_succeeded,
            commands::store_api::logout,
            commands::store_api::add_appointment,
            commands::store_api::update_appointment,
            commands::store_api::add_health_data,
            commands::store_api::add_ai_diagnosis,
            commands::store_api::update_subscription,
            commands::store_api::export_app_state,
            commands::store_api::import_app_state,
        ])
        .setup(|app, _api| {
            logger::init();
            app.manage(CallBackend::new(CallConfig::default()));
            let store = match app.path().app_data_dir() {
                Ok(dir) => SharedStore::open(dir),
                Err(e) => {
                    tracing::warn!(error = %e, "no app data dir, app state will not be saved");
                    SharedStore::in_memory()
                }
            };
            app.manage(store);
            app.manage(TokenConfig::from_env());
            tracing::info!("mediconnect plugin initialized");
            Ok(())
        })
        .build()
}
