// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::peer::types::ServerConfig;
use std::time::Duration;
use thiserror::Error;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

/// Фильтр по умолчанию, если RUST_LOG не задан
pub const DEFAULT_LOG_FILTER: &str = "mediconnect=debug,webrtc=warn";

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    // ВАЖНО: Эта настройка работает только в debug режиме!
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Период ожидания перед тем, как считать разорванное соединение потерянным
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Сколько ждём установления соединения после начала переговоров
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Шаг таймера длительности звонка
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Сколько ждём кандидата при проверке ICE сервера
pub const ICE_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ICE server `{0}` has an empty url")]
    EmptyUrl(String),
    #[error("TURN server `{0}` requires username and credential")]
    MissingTurnCredentials(String),
    #[error("unknown ICE server type `{kind}` for `{id}`")]
    UnknownServerType { id: String, kind: String },
}

/// Настройки звонка, общие для всех сессий
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub negotiation_timeout: Duration,
    pub grace_period: Duration,
    pub tick_interval: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            negotiation_timeout: NEGOTIATION_TIMEOUT,
            grace_period: GRACE_PERIOD,
            tick_interval: TICK_INTERVAL,
        }
    }
}

impl CallConfig {
    /// Заменяет список ICE серверов, предварительно проверив каждый
    pub fn with_ice_servers(mut self, servers: Vec<ServerConfig>) -> Result<Self, ConfigError> {
        validate_ice_servers(&servers)?;
        self.ice_servers = servers;
        Ok(self)
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

/// Дефолтные публичные STUN серверы
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

/// Валидация серверов, пришедших из фронтенда
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(ConfigError::EmptyUrl(server.id.clone()));
        }

        match server.r#type.as_str() {
            "stun" => {}
            "turn" => {
                if server.username.is_none() || server.credential.is_none() {
                    return Err(ConfigError::MissingTurnCredentials(server.id.clone()));
                }
            }
            other => {
                return Err(ConfigError::UnknownServerType {
                    id: server.id.clone(),
                    kind: other.to_string(),
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: &str, url: &str) -> ServerConfig {
        ServerConfig {
            id: format!("{kind}-1"),
            r#type: kind.into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn defaults_use_public_stun() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers.iter().all(|s| s.r#type == "stun"));
        assert_eq!(config.grace_period, GRACE_PERIOD);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let err = CallConfig::default()
            .with_ice_servers(vec![server("turn", "turn.example.org:3478")])
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingTurnCredentials("turn-1".into()));
    }

    #[test]
    fn empty_url_is_rejected() {
        let err = validate_ice_servers(&[server("stun", "  ")]).unwrap_err();
        assert_eq!(err, ConfigError::EmptyUrl("stun-1".into()));
    }

    #[test]
    fn valid_servers_replace_defaults() {
        let mut turn = server("turn", "turn.example.org:3478");
        turn.username = Some("doctor".into());
        turn.credential = Some("secret".into());

        let config = CallConfig::default()
            .with_ice_servers(vec![turn.clone()])
            .unwrap();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].url, turn.url);
    }
}
