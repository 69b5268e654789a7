use super::{CallBackend, CommandResult};
use crate::config::ICE_CHECK_TIMEOUT;
use crate::peer::ice::check_ice_server;
use crate::peer::ServerConfig;
use tauri::{command, State};

/// Новые серверы применяются к звонкам, начатым после вызова
#[command]
pub fn set_ice_servers(backend: State<'_, CallBackend>, servers: Vec<ServerConfig>) -> CommandResult<()> {
    backend.registry.set_ice_servers(servers)?;
    Ok(())
}

#[command]
pub fn get_ice_servers(backend: State<'_, CallBackend>) -> Vec<ServerConfig> {
    backend.registry.ice_servers()
}

/// проверка доступности STUN/TURN
#[command]
pub async fn check_ice_server_availability(config: ServerConfig) -> bool {
    tracing::info!(server = %config.id, url = %config.url, "checking ICE server");
    check_ice_server(&config, ICE_CHECK_TIMEOUT).await
}
