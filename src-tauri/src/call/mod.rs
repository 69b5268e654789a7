pub mod events;
pub mod handle;
pub mod session;
pub mod state;

pub use events::PeerEventSink;
pub use handle::{CallCommand, CallHandle, CallRegistry};
pub use session::{CallDeps, CallSession, CallSnapshot};
pub use state::CallState;
