pub mod call_api;
pub mod store_api;
pub mod util_api;

use crate::auth::AuthError;
use crate::call::{CallDeps, CallRegistry};
use crate::config::{CallConfig, ConfigError};
use crate::error::CallError;
use crate::media::SyntheticCapture;
use crate::peer::RtcPeerFactory;
use crate::signaling::{ManualSignaling, SignalingError};
use crate::store::StoreError;
use serde::{Serialize, Serializer};
use std::sync::Arc;
use thiserror::Error;

/// Ошибка команды; во фронтенд уходит строкой
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Rejected(String),
}

impl Serialize for CommandError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

/// Звонки приложения вместе с ручным сигнальным каналом
pub struct CallBackend {
    pub registry: CallRegistry,
    pub signaling: Arc<ManualSignaling>,
}

impl CallBackend {
    pub fn new(config: CallConfig) -> Self {
        let signaling = Arc::new(ManualSignaling::new());
        let deps = CallDeps {
            media: Arc::new(SyntheticCapture::default()),
            peers: Arc::new(RtcPeerFactory::new()),
            signaling: signaling.clone(),
        };
        Self {
            registry: CallRegistry::new(deps, config),
            signaling,
        }
    }
}
