//! Локальные медиапотоки и контракт провайдера захвата.
//!
//! Поток владеет своими треками: при `Drop` все треки останавливаются,
//! поэтому поток, потерявший владельца на любом пути выхода, не держит
//! камеру и микрофон.

use crate::utils::random_id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Ограничения, передаваемые провайдеру захвата
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("permission to use camera or microphone was denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Устройство (или заглушка), стоящее за локальным треком
pub trait TrackSource: Send + Sync {
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    source: Arc<dyn TrackSource>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: Arc<dyn TrackSource>) -> Self {
        Self {
            id: format!("{kind}-{}", random_id()),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            source,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Переключает трек без пересогласования соединения
    pub fn set_enabled(&self, enabled: bool) {
        if self.is_stopped() {
            return;
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        self.source.set_enabled(enabled);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Останавливает трек; источник освобождается ровно один раз.
    /// Возвращает `true`, если остановка произошла именно сейчас.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.enabled.store(false, Ordering::SeqCst);
        self.source.stop();
        true
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug)]
pub struct MediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: format!("stream-{}", random_id()),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.track(TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.track(TrackKind::Video)
    }

    /// Останавливает все треки, возвращает число реально остановленных
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    pub fn is_released(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_stopped)
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        let stopped = self.stop_all();
        if stopped > 0 {
            tracing::debug!(stream = %self.id, stopped, "media stream dropped, tracks released");
        }
    }
}

/// Удалённый трек, о котором сообщило соединение
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Добавляет треки другого события того же потока, без дублей
    pub fn merge(&mut self, other: RemoteStream) {
        for track in other.tracks {
            if !self.tracks.iter().any(|t| t.id == track.id) {
                self.tracks.push(track);
            }
        }
    }
}

/// Провайдер захвата камеры и микрофона. Повторов не делает:
/// повторная попытка всегда исходит от пользователя.
#[async_trait]
pub trait MediaCaptureProvider: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, CaptureError>;
}

/// Какие устройства есть у синтетического провайдера
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInventory {
    pub camera: bool,
    pub microphone: bool,
    pub permission_granted: bool,
}

impl Default for DeviceInventory {
    fn default() -> Self {
        Self {
            camera: true,
            microphone: true,
            permission_granted: true,
        }
    }
}

struct SyntheticSource {
    kind: TrackKind,
}

impl TrackSource for SyntheticSource {
    fn set_enabled(&self, enabled: bool) {
        tracing::trace!(kind = %self.kind, enabled, "synthetic track toggled");
    }

    fn stop(&self) {
        tracing::trace!(kind = %self.kind, "synthetic track stopped");
    }
}

/// Провайдер без реального железа: выдаёт треки-заглушки по описанию устройств
#[derive(Debug, Clone, Default)]
pub struct SyntheticCapture {
    devices: DeviceInventory,
}

impl SyntheticCapture {
    pub fn new(devices: DeviceInventory) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl MediaCaptureProvider for SyntheticCapture {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, CaptureError> {
        if !constraints.audio && !constraints.video {
            return Err(CaptureError::DeviceUnavailable(
                "neither audio nor video requested".into(),
            ));
        }
        if !self.devices.permission_granted {
            return Err(CaptureError::PermissionDenied);
        }
        if constraints.video && !self.devices.camera {
            return Err(CaptureError::DeviceUnavailable("no camera".into()));
        }
        if constraints.audio && !self.devices.microphone {
            return Err(CaptureError::DeviceUnavailable("no microphone".into()));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(
                TrackKind::Audio,
                Arc::new(SyntheticSource {
                    kind: TrackKind::Audio,
                }),
            ));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(
                TrackKind::Video,
                Arc::new(SyntheticSource {
                    kind: TrackKind::Video,
                }),
            ));
        }
        Ok(MediaStream::new(tracks))
    }
}
