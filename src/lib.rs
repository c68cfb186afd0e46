//! boardwalk: a user-space agent that accepts peer-to-peer connections
//! and proxies PTY-backed panes over WebRTC data channels.

pub mod agent;
pub mod auth;
pub mod cert;
pub mod config;
pub mod control;
pub mod errors;
pub mod logging;
pub mod pane;
pub mod peer;
pub mod peerbook;
pub mod pidfile;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod signaling;
pub mod terminal;

pub use errors::{AgentError, Result};
