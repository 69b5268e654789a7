use crate::call::events::PeerEventSink;
use crate::config::CallConfig;
use crate::error::{CallError, CallResult};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{MediaStream, RemoteStream, RemoteTrack, TrackKind};
use crate::peer::types::{IceCandidate, Role, SdpKind, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
};

/// Одно peer-соединение сессии. События (кандидаты, connect, треки,
/// ошибки) идут не через возвращаемые значения, а через [`PeerEventSink`].
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Создаёт offer и устанавливает его как local description
    async fn create_offer(&self) -> CallResult<SessionDescription>;

    /// Применяет удалённый offer, возвращает установленный локально answer
    async fn accept_offer(&self, offer: SessionDescription) -> CallResult<SessionDescription>;

    async fn accept_answer(&self, answer: SessionDescription) -> CallResult<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        role: Role,
        config: &CallConfig,
        local: &MediaStream,
        events: PeerEventSink,
    ) -> CallResult<Box<dyn PeerConnection>>;
}

/// Фабрика соединений на webrtc-rs
#[derive(Debug, Default, Clone)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        role: Role,
        config: &CallConfig,
        local: &MediaStream,
        events: PeerEventSink,
    ) -> CallResult<Box<dyn PeerConnection>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&config.ice_servers)).await?);

        // Локальные треки; включение/выключение делает источник, без renegotiation
        for track in local.tracks() {
            let mime_type = match track.kind() {
                TrackKind::Audio => MIME_TYPE_OPUS,
                TrackKind::Video => MIME_TYPE_VP8,
            };
            let rtc_track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id().to_owned(),
                local.id().to_owned(),
            ));
            pc.add_track(rtc_track as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }

        let peer = RtcPeer {
            pc,
            grace_task: Arc::new(Mutex::new(None)),
        };
        peer.attach_handlers(events, config);

        tracing::debug!(%role, tracks = local.tracks().len(), "webrtc peer connection created");
        Ok(Box::new(peer))
    }
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    // Отложенная проверка после disconnect
    grace_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RtcPeer {
    fn attach_handlers(&self, events: PeerEventSink, config: &CallConfig) {
        // Обработчик для локальных кандидатов (Trickle-ICE)
        let sink = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            };
                            dump_candidate("LOCAL", &candidate);
                            sink.local_candidate(candidate);
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to serialize local candidate"),
                    },
                    // cand == None означает конец сбора
                    None => tracing::debug!("ICE candidate gathering completed"),
                }
                Box::pin(async {})
            }));

        let sink = events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    tracing::info!(%kind, id = %track.id(), "remote track arrived");
                    sink.remote_stream(RemoteStream {
                        id: track.stream_id().to_string(),
                        tracks: vec![RemoteTrack {
                            id: track.id().to_string(),
                            kind,
                        }],
                    });
                }
                Box::pin(async {})
            },
        ));

        // Слабая ссылка: обработчик живёт внутри самого соединения
        let pc_state = Arc::downgrade(&self.pc);
        let grace_slot = self.grace_task.clone();
        let grace = config.grace_period;
        let sink = events;

        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                tracing::debug!(state = ?st, generation = sink.generation(), "peer connection state changed");

                match st {
                    RTCPeerConnectionState::Connected => {
                        // отменяем отложенную проверку, если она была
                        if let Some(handle) = grace_slot.lock().take() {
                            tracing::info!("connection recovered during grace period");
                            handle.abort();
                        }
                        sink.connected();
                    }

                    RTCPeerConnectionState::Disconnected => {
                        let mut slot = grace_slot.lock();
                        // уже ожидаем? – ничего не делаем
                        if slot.is_some() {
                            return Box::pin(async {});
                        }

                        tracing::warn!(grace_secs = grace.as_secs(), "peer disconnected, starting grace period");
                        let pc = pc_state.clone();
                        let sink = sink.clone();
                        *slot = Some(tokio::spawn(async move {
                            sleep(grace).await;
                            let Some(pc) = pc.upgrade() else {
                                return;
                            };
                            let state_now = pc.connection_state();
                            if state_now != RTCPeerConnectionState::Connected {
                                dump_selected_pair(&pc, "BEFORE-FAIL").await;
                                sink.failed(format!(
                                    "connection not recovered within {}s ({state_now:?})",
                                    grace.as_secs()
                                ));
                            }
                        }));
                    }

                    RTCPeerConnectionState::Failed => {
                        if let Some(handle) = grace_slot.lock().take() {
                            handle.abort();
                        }
                        let pc = pc_state.clone();
                        let sink = sink.clone();
                        tokio::spawn(async move {
                            if let Some(pc) = pc.upgrade() {
                                dump_selected_pair(&pc, "FAILED").await;
                            }
                            sink.failed("ICE transport failed");
                        });
                    }

                    RTCPeerConnectionState::Closed => {
                        if let Some(handle) = grace_slot.lock().take() {
                            handle.abort();
                        }
                        sink.closed();
                    }

                    _ => {}
                }
                Box::pin(async {})
            }));
    }

    async fn local_description(&self) -> CallResult<RTCSessionDescription> {
        self.pc
            .local_description()
            .await
            .ok_or_else(|| CallError::PeerConnection("local description missing".into()))
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> CallResult<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        let local = self.local_description().await?;
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> CallResult<SessionDescription> {
        self.pc
            .set_remote_description(to_rtc_description(offer)?)
            .await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        let local = self.local_description().await?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> CallResult<()> {
        self.pc
            .set_remote_description(to_rtc_description(answer)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> CallResult<()> {
        dump_candidate("REMOTE", &candidate);
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(handle) = self.grace_task.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "error while closing peer connection");
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> CallResult<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: to_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Перевод серверов из формата фронтенда в webrtc
pub fn to_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_get_schemes_and_credentials() {
        let servers = vec![
            ServerConfig {
                id: "s".into(),
                r#type: "stun".into(),
                url: "stun.example.org:19302".into(),
                username: None,
                credential: None,
            },
            ServerConfig {
                id: "t".into(),
                r#type: "turn".into(),
                url: "turn.example.org:3478".into(),
                username: Some("doctor".into()),
                credential: Some("pw".into()),
            },
        ];

        let rtc = to_ice_servers(&servers);
        assert_eq!(rtc[0].urls, vec!["stun:stun.example.org:19302".to_string()]);
        assert!(rtc[0].username.is_empty());
        assert_eq!(rtc[1].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(rtc[1].credential, "pw");

        let config = rtc_config(&servers);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.bundle_policy, RTCBundlePolicy::MaxBundle);
    }

    #[tokio::test]
    async fn offer_carries_local_tracks() {
        use crate::media::{MediaCaptureProvider, MediaConstraints, SyntheticCapture};

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let local = SyntheticCapture::default()
            .acquire(MediaConstraints::default())
            .await
            .unwrap();
        let config = CallConfig {
            ice_servers: Vec::new(),
            ..CallConfig::default()
        };

        let peer = RtcPeerFactory::new()
            .create(Role::Initiator, &config, &local, PeerEventSink::new(0, tx))
            .await
            .unwrap();
        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        peer.close().await;
    }
}
