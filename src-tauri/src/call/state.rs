use serde::{Deserialize, Serialize};
use std::fmt;

/// Состояние сессии звонка
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Idle,
    RequestingMedia,
    Negotiating,
    Active,
    Ending,
    Ended,
    Error,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RequestingMedia => "requesting-media",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Ending => "ending",
            Self::Ended => "ended",
            Self::Error => "error",
        }
    }

    /// Принимает ли сессия входящие сигналы
    pub fn accepts_signals(&self) -> bool {
        matches!(self, Self::Negotiating | Self::Active)
    }

    /// Есть ли у сессии ресурсы, которые придётся освобождать
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::RequestingMedia | Self::Negotiating | Self::Active
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Таблица переходов
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, RequestingMedia)
                | (RequestingMedia, Negotiating)
                | (RequestingMedia, Error)
                | (Negotiating, Negotiating)
                | (Negotiating, Active)
                | (Negotiating, Error)
                | (Active, Active)
                | (Active, Error)
                | (Idle, Ending)
                | (RequestingMedia, Ending)
                | (Negotiating, Ending)
                | (Active, Ending)
                | (Error, Ending)
                | (Ending, Ended)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
