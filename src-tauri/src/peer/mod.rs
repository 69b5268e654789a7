pub mod connection;
pub mod ice;
pub mod types;

pub use connection::{PeerConnection, PeerConnectionFactory, RtcPeerFactory};
pub use ice::{CandidateBuffer, CandidateStats};
pub use types::{IceCandidate, Role, SdpKind, ServerConfig, SessionDescription};
