pub mod ws;

pub use ws::{EventKind, SignalingMessage};
