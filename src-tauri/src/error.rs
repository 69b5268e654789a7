use crate::call::state::CallState;
use crate::media::{CaptureError, TrackKind};
use thiserror::Error;

pub type CallResult<T> = Result<T, CallError>;

/// Ошибки звонка. Наружу state machine отдаёт только их, без паник.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// Захват медиа не удался; повтор только по действию пользователя
    #[error("media unavailable: {0}")]
    MediaUnavailable(CaptureError),

    /// Сбой переговоров или транспорта; сессия полностью разобрана
    #[error("peer connection error: {0}")]
    PeerConnection(String),

    /// Сигнал пришёл в неподходящий момент; сессия продолжает ждать
    #[error("signal rejected in state {state}: {detail}")]
    InvalidSignalState { state: CallState, detail: String },

    #[error("no active {0} track")]
    NoActiveTrack(TrackKind),

    #[error("cannot {action} while {from}")]
    InvalidTransition { from: CallState, action: &'static str },
}

impl From<CaptureError> for CallError {
    fn from(err: CaptureError) -> Self {
        CallError::MediaUnavailable(err)
    }
}

impl From<webrtc::Error> for CallError {
    fn from(err: webrtc::Error) -> Self {
        CallError::PeerConnection(err.to_string())
    }
}

impl CallError {
    /// Фатальна ли ошибка для текущей сессии
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::MediaUnavailable(_) | CallError::PeerConnection(_)
        )
    }
}
