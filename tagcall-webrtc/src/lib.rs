pub mod config;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
mod peer;
mod receiver;
mod sender;
pub mod session;

pub use config::IceConfig;
pub use error::NegotiationError;
pub use peer::{Peer, RtcPeerFactory};
pub use session::{PeerConnectionState, PeerEvent, PeerFactory, PeerSession};
