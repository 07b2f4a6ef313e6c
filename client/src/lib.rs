//! Hookline client
//!
//! Exposes a local HTTP service through the relay's tunnel endpoint and,
//! optionally, captures outbound requests from a local process into a bin.

pub mod capture;
pub mod config;
pub mod forwarder;
pub mod headers;
pub mod observer;
pub mod session;
pub mod supervisor;

pub use capture::{CaptureConfig, CaptureRelay};
pub use config::{HooklineConfig, SessionIdentity};
pub use forwarder::{Forwarder, ForwarderConfig};
pub use observer::{ConsoleObserver, Direction, ForwardObserver, ForwardResult, SharedObserver};
pub use session::{ConnectionState, SessionEnd, TunnelSession};
pub use supervisor::{ReconnectPolicy, ShutdownHandle, Supervisor};
