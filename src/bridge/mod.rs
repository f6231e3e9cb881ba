pub mod handler;
pub mod runner;

pub use handler::{ForwardingHandler, PROGRESS_LOG_EVERY};
pub use runner::{Bridge, BridgeError, BridgeSettings};
