pub mod channel;
pub mod dispatch;
pub mod error;
pub mod transport;

pub use channel::{ChannelConfig, ChannelState, SignalingChannel};
pub use dispatch::Binding;
pub use error::SignalingError;
