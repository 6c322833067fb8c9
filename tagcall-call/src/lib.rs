pub mod config;
pub mod engine;
pub mod error;
pub mod incoming;
pub mod session;

pub use config::CallConfig;
pub use engine::{CallEngine, CallTarget};
pub use error::{CallError, FailureKind};
pub use incoming::{IncomingCall, IncomingCalls};
pub use session::{ActiveCall, CallEvent, CallStatus};
