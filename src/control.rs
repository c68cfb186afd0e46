//! Control-frame dispatch: applies parsed requests to the agent context
//! and produces the replies owed to the peer. Kept free of transport
//! types so the auth gate and ack semantics are testable with stubs.

use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::AgentContext;
use crate::protocol::{ControlRequest, Winsize, parse_frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauth,
    Authed,
    Rejected,
}

/// The per-peer state the control protocol reads and writes.
pub struct ControlState {
    auth: Mutex<AuthState>,
    default_size: Mutex<Winsize>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            auth: Mutex::new(AuthState::Unauth),
            default_size: Mutex::new(Winsize::DEFAULT),
        }
    }

    pub fn auth(&self) -> AuthState {
        *self.auth.lock().unwrap()
    }

    pub fn is_authed(&self) -> bool {
        self.auth() == AuthState::Authed
    }

    pub fn default_size(&self) -> Winsize {
        *self.default_size.lock().unwrap()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ack { ref_id: u32, body: Option<Value> },
    Nack { ref_id: u32, desc: String },
}

/// What one frame produced: at most one reply, and whether the peer
/// must be torn down (after the reply has had a chance to flush).
#[derive(Debug, Default)]
pub struct Dispatch {
    pub reply: Option<Reply>,
    pub close_peer: bool,
}

impl Dispatch {
    fn ack(ref_id: u32, body: Option<Value>) -> Self {
        Self {
            reply: Some(Reply::Ack { ref_id, body }),
            close_peer: false,
        }
    }

    fn nack(ref_id: u32, desc: impl Into<String>) -> Self {
        Self {
            reply: Some(Reply::Nack {
                ref_id,
                desc: desc.into(),
            }),
            close_peer: false,
        }
    }
}

/// Parses and applies one newline-stripped control frame.
pub fn dispatch_line(state: &ControlState, ctx: &Arc<AgentContext>, line: &str) -> Dispatch {
    let (meta, request) = match parse_frame(line) {
        Ok(parsed) => parsed,
        Err(err) => return Dispatch::nack(err.ref_id, err.desc),
    };
    let ref_id = meta.message_id;

    // The auth gate: nothing but `auth` is honored before `authed`.
    if !state.is_authed() && !matches!(request, ControlRequest::Auth { .. }) {
        return Dispatch::nack(ref_id, "unauthorized");
    }

    match request {
        ControlRequest::Auth { token } => {
            if ctx.tokens.is_authorized(&token) {
                *state.auth.lock().unwrap() = AuthState::Authed;
                info!("peer authorized");
                Dispatch::ack(ref_id, None)
            } else {
                *state.auth.lock().unwrap() = AuthState::Rejected;
                let mut dispatch = Dispatch::nack(ref_id, "unauthorized");
                dispatch.close_peer = true;
                dispatch
            }
        }
        ControlRequest::AddPane { command, size, env } => {
            let size = size.unwrap_or_else(|| state.default_size());
            match ctx.panes.create(&command, size, env) {
                Ok(pane) => Dispatch::ack(ref_id, Some(json!({ "pane_id": pane.id() }))),
                Err(err) => Dispatch::nack(ref_id, err.to_string()),
            }
        }
        ControlRequest::ResizePane { pane_id, size } => match ctx.panes.get(pane_id) {
            Some(pane) => match pane.resize(size) {
                Ok(()) => {
                    *state.default_size.lock().unwrap() = size;
                    Dispatch::ack(ref_id, None)
                }
                Err(err) => Dispatch::nack(ref_id, err.to_string()),
            },
            None => Dispatch::nack(ref_id, "unknown pane"),
        },
        ControlRequest::GetPayload => {
            let payload = ctx.payload.lock().unwrap().clone();
            Dispatch::ack(ref_id, Some(payload))
        }
        ControlRequest::SetPayload { payload } => {
            *ctx.payload.lock().unwrap() = payload;
            Dispatch::ack(ref_id, None)
        }
        ControlRequest::Mark => {
            let marker = Uuid::new_v4().to_string();
            let snapshot = ctx.payload.lock().unwrap().clone();
            ctx.markers.lock().unwrap().insert(marker.clone(), snapshot);
            Dispatch::ack(ref_id, Some(json!({ "marker": marker })))
        }
        ControlRequest::Restore { marker } => {
            let snapshot = ctx.markers.lock().unwrap().get(&marker).cloned();
            match snapshot {
                Some(snapshot) => {
                    *ctx.payload.lock().unwrap() = snapshot;
                    Dispatch::ack(ref_id, None)
                }
                None => Dispatch::nack(ref_id, "unknown marker"),
            }
        }
        ControlRequest::Reply { ref_id, desc } => {
            debug!(ref_id, desc = ?desc, "client reply");
            Dispatch::default()
        }
    }
}
