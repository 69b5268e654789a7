use crate::peer::connection::to_ice_servers;
use crate::peer::types::{IceCandidate, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_gatherer_state::RTCIceGathererState,
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

/// Кандидаты, полученные до установки remote description.
/// Отдаются строго в порядке поступления. Каждый помечен поколением
/// соединения отправителя: после встречных offer удалённая сторона
/// пересоздаёт соединение, и кандидаты старого уже не подходят.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<(u64, IceCandidate)>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, generation: u64, candidate: IceCandidate) {
        tracing::debug!(candidate = %candidate.candidate, generation, queued = self.pending.len() + 1, "remote description not set yet, queuing candidate");
        self.pending.push((generation, candidate));
    }

    /// Забирает кандидаты поколения `generation`, остальные выбрасывает
    pub fn take_for(&mut self, generation: u64) -> Vec<IceCandidate> {
        let mut matching = Vec::with_capacity(self.pending.len());
        for (candidate_generation, candidate) in self.pending.drain(..) {
            if candidate_generation == generation {
                matching.push(candidate);
            } else {
                tracing::debug!(candidate = %candidate.candidate, candidate_generation, generation, "dropping candidate of a replaced connection");
            }
        }
        matching
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateStats {
    let mut stats = CandidateStats::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            stats.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            stats.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            stats.relay += 1;
        }
    }

    tracing::debug!(
        host = stats.host,
        srflx = stats.srflx,
        relay = stats.relay,
        "candidate analysis"
    );
    if stats.relay == 0 && !candidates.is_empty() {
        tracing::warn!("no TURN relay candidates found, connection through NAT may fail");
    }
    stats
}

/// Проверяет, что ICE сервер отвечает: для STUN ждём srflx кандидата,
/// для TURN relay.
pub async fn check_ice_server(config: &ServerConfig, wait: Duration) -> bool {
    let rtc_config = RTCConfiguration {
        ice_servers: to_ice_servers(std::slice::from_ref(config)),
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    let peer_connection = match api.new_peer_connection(rtc_config).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            tracing::warn!(error = %e, "failed to create check peer connection");
            return false;
        }
    };

    let result = check_via_ice_gathering(&peer_connection, &config.r#type, wait).await;
    if let Err(e) = peer_connection.close().await {
        tracing::debug!(error = %e, "check connection close failed");
    }
    tracing::info!(server = %config.id, available = result, "ICE server check finished");
    result
}

async fn check_via_ice_gathering(
    peer_connection: &Arc<RTCPeerConnection>,
    server_type: &str,
    wait: Duration,
) -> bool {
    // Подписываемся на изменения состояния gathering
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
        let _ = state_tx.send(state);
        Box::pin(async {})
    }));

    // Подписываемся на ICE кандидатов
    let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel();
    let wanted = if server_type == "turn" {
        "typ relay"
    } else {
        "typ srflx"
    };
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(json) if json.candidate.contains(wanted) => {
                    let _ = candidate_tx.send(());
                }
                Ok(json) => tracing::trace!(candidate = %json.candidate, "check candidate of other type"),
                Err(e) => tracing::debug!(error = %e, "failed to read check candidate"),
            }
        }
        Box::pin(async {})
    }));

    // Data channel и offer нужны, чтобы запустить сбор кандидатов
    if let Err(e) = peer_connection.create_data_channel("ice-check", None).await {
        tracing::warn!(error = %e, "failed to create check data channel");
        return false;
    }
    let offer = match peer_connection.create_offer(None).await {
        Ok(offer) => offer,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create check offer");
            return false;
        }
    };
    if let Err(e) = peer_connection.set_local_description(offer).await {
        tracing::warn!(error = %e, "failed to set check local description");
        return false;
    }

    let gathering_done = async {
        while let Some(state) = state_rx.recv().await {
            if state == RTCIceGathererState::Complete {
                break;
            }
        }
    };

    tokio::select! {
        // Ждем подходящего кандидата
        result = timeout(wait, candidate_rx.recv()) => matches!(result, Ok(Some(()))),
        // Или окончания сбора без нужного кандидата
        _ = gathering_done => false,
    }
}
