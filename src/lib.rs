pub mod bridge;
pub mod cli;
pub mod config;
pub mod record;
pub mod sender;
pub mod session;
pub mod sink;
pub mod source;
