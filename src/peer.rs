//! One remote endpoint: its peer connection, authorization state, and
//! the multiplexer that binds incoming data channels to the control
//! protocol or to panes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::agent::AgentContext;
use crate::control::{self, AuthState, ControlState, Reply};
use crate::errors::{AgentError, Result};
use crate::pane::ChannelSink;
use crate::protocol::{self, ChannelLabel, LineBuffer, Winsize, parse_label};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const NACK_FLUSH_GRACE: Duration = Duration::from_millis(500);
const GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// The base64-wrapped SDP envelope exchanged over signalling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpEnvelope {
    pub fingerprint: String,
    pub version: u32,
    #[serde(default)]
    pub offer: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
}

pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SdpPayload {
    #[serde(rename = "type")]
    typ: String,
    sdp: String,
}

fn decode_offer(encoded: &str) -> Result<RTCSessionDescription> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|err| AgentError::Protocol(format!("offer is not base64: {err}")))?;
    let payload: SdpPayload = serde_json::from_slice(&bytes)
        .map_err(|err| AgentError::Protocol(format!("offer payload: {err}")))?;
    match payload.typ.as_str() {
        "offer" => RTCSessionDescription::offer(payload.sdp)
            .map_err(|err| AgentError::Protocol(format!("bad offer sdp: {err}"))),
        other => Err(AgentError::Protocol(format!(
            "expected an offer, got {other:?}"
        ))),
    }
}

fn encode_description(desc: &RTCSessionDescription) -> String {
    let payload = SdpPayload {
        typ: desc.sdp_type.to_string(),
        sdp: desc.sdp.clone(),
    };
    BASE64.encode(serde_json::to_vec(&payload).expect("sdp payload serializes"))
}

/// Locally gathered ICE candidates, parked for the signalling long-poll.
pub struct CandidateQueue {
    items: Mutex<VecDeque<String>>,
    complete: AtomicBool,
    notify: Notify,
}

impl CandidateQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            complete: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn push(&self, candidate: String) {
        self.items.lock().unwrap().push_back(candidate);
        self.notify.notify_waiters();
    }

    fn finish(&self) {
        self.complete.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// The next candidate, or `None` once gathering is complete (or the
    /// wait elapses) and the queue is drained.
    pub async fn next(&self, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(candidate) = self.items.lock().unwrap().pop_front() {
                return Some(candidate);
            }
            if self.complete.load(Ordering::SeqCst) {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }
}

fn build_api(setting: SettingEngine) -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| AgentError::Transport(err.to_string()))?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|err| AgentError::Transport(err.to_string()))?;
    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct Peer {
    id: String,
    fingerprint: String,
    pc: Arc<RTCPeerConnection>,
    ctx: Weak<AgentContext>,
    state: ControlState,
    out_msg_id: AtomicU32,
    control: Mutex<Option<Arc<DcSink>>>,
    pub candidates: Arc<CandidateQueue>,
    auth_timer_started: AtomicBool,
    closed: AtomicBool,
}

impl Peer {
    /// Accepts a remote offer: builds the peer connection, wires the
    /// channel multiplexer and candidate queue, and returns the peer
    /// together with its base64 answer.
    pub async fn connect(
        ctx: &Arc<AgentContext>,
        envelope: &SdpEnvelope,
    ) -> Result<(Arc<Peer>, String)> {
        let offer = envelope
            .offer
            .as_deref()
            .ok_or_else(|| AgentError::Protocol("envelope carries no offer".into()))?;
        let offer_desc = decode_offer(offer)?;

        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let api = build_api(setting)?;
        let rtc_config = RTCConfiguration {
            certificates: vec![ctx.certificate.rtc_certificate()],
            ice_servers: ctx.ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| AgentError::Transport(err.to_string()))?,
        );

        let peer = Arc::new(Peer {
            id: Uuid::new_v4().to_string(),
            fingerprint: envelope.fingerprint.clone(),
            pc: pc.clone(),
            ctx: Arc::downgrade(ctx),
            state: ControlState::new(),
            out_msg_id: AtomicU32::new(1),
            control: Mutex::new(None),
            candidates: Arc::new(CandidateQueue::new()),
            auth_timer_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let queue = peer.candidates.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let queue = queue.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            if let Ok(text) = serde_json::to_string(&init) {
                                queue.push(text);
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "dropping unencodable ice candidate");
                        }
                    },
                    None => queue.finish(),
                }
            })
        }));

        let peer_for_channels = peer.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let peer = peer_for_channels.clone();
            Box::pin(async move {
                peer.handle_channel(dc);
            })
        }));

        let peer_for_state = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peer = peer_for_state.clone();
            Box::pin(async move {
                debug!(peer_id = %peer.id, ?state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => peer.start_auth_timer(),
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => peer.close("transport closed"),
                    _ => {}
                }
            })
        }));

        pc.set_remote_description(offer_desc)
            .await
            .map_err(|err| AgentError::Transport(err.to_string()))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|err| AgentError::Transport(err.to_string()))?;
        pc.set_local_description(answer)
            .await
            .map_err(|err| AgentError::Transport(err.to_string()))?;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| AgentError::Transport("missing local description".into()))?;

        // Candidates trickle through the queue; bound gathering so the
        // long-poll always terminates.
        let queue = peer.candidates.clone();
        tokio::spawn(async move {
            tokio::time::sleep(GATHER_TIMEOUT).await;
            queue.finish();
        });

        info!(peer_id = %peer.id, fingerprint = %peer.fingerprint, "peer negotiating");
        Ok((peer.clone(), encode_description(&local)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn auth_state(&self) -> AuthState {
        self.state.auth()
    }

    pub fn default_size(&self) -> Winsize {
        self.state.default_size()
    }

    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|err| AgentError::Transport(format!("add ice candidate: {err}")))
    }

    fn start_auth_timer(self: &Arc<Self>) {
        if self.auth_timer_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let peer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(AUTH_TIMEOUT).await;
            if peer.auth_state() != AuthState::Authed {
                info!(peer_id = %peer.id, "auth timeout");
                peer.close("auth timeout");
            }
        });
    }

    /// Idempotent teardown; removes the peer from the table and closes
    /// the transport, which in turn unbinds any pane channels.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(peer_id = %self.id, reason, "closing peer");
        self.candidates.finish();
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.peers.forget(&self.id);
        }
        let pc = self.pc.clone();
        tokio::spawn(async move {
            let _ = pc.close().await;
        });
    }

    fn reply_ids(&self) -> (u32, u64) {
        let message_id = self.out_msg_id.fetch_add(1, Ordering::SeqCst);
        let time = self
            .ctx
            .upgrade()
            .map(|ctx| ctx.monotonic_ms())
            .unwrap_or_default();
        (message_id, time)
    }

    pub fn send_ack(&self, ref_id: u32, body: Option<Value>) {
        let (message_id, time) = self.reply_ids();
        self.send_control(protocol::encode_ack(message_id, time, ref_id, body));
    }

    pub fn send_nack(&self, ref_id: u32, desc: &str) {
        let (message_id, time) = self.reply_ids();
        self.send_control(protocol::encode_nack(message_id, time, ref_id, desc));
    }

    fn send_control(&self, frame: Vec<u8>) {
        let control = self.control.lock().unwrap().clone();
        match control {
            Some(sink) => {
                if let Err(err) = sink.send(&frame) {
                    warn!(peer_id = %self.id, error = %err, "control reply lost");
                }
            }
            None => debug!(peer_id = %self.id, "no control channel for reply"),
        }
    }

    /// Channel multiplexer: routes every incoming channel by label.
    fn handle_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let label = dc.label().to_string();
        debug!(peer_id = %self.id, label = %label, "data channel announced");

        if self.auth_state() != AuthState::Authed && label != "%" {
            // Unauth peers get exactly one channel: control.
            self.send_nack(0, "unauthorized");
            close_channel(&dc);
            return;
        }

        match parse_label(&label) {
            Ok(ChannelLabel::Control) => self.install_control(dc),
            Ok(ChannelLabel::Attach { size, pane_id }) => self.attach_pane(dc, pane_id, size),
            Ok(ChannelLabel::Command(argv)) => self.open_pane(dc, argv),
            Err(err) => {
                self.send_nack(0, &err.to_string());
                close_channel(&dc);
            }
        }
    }

    fn install_control(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let sink = DcSink::new(dc.clone(), "%");
        {
            let mut control = self.control.lock().unwrap();
            if control.is_some() {
                warn!(peer_id = %self.id, "second control channel refused");
                drop(control);
                close_channel(&dc);
                return;
            }
            *control = Some(sink);
        }

        // Frames are processed in arrival order by one task per peer.
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(msg.data.to_vec());
            })
        }));

        let peer = self.clone();
        dc.on_close(Box::new(move || {
            let peer = peer.clone();
            Box::pin(async move {
                debug!(peer_id = %peer.id, "control channel closed");
                peer.control.lock().unwrap().take();
            })
        }));

        let peer = self.clone();
        tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            while let Some(bytes) = rx.recv().await {
                for line in lines.push(&bytes) {
                    let Some(ctx) = peer.ctx.upgrade() else {
                        return;
                    };
                    let dispatch = control::dispatch_line(&peer.state, &ctx, &line);
                    match dispatch.reply {
                        Some(Reply::Ack { ref_id, body }) => peer.send_ack(ref_id, body),
                        Some(Reply::Nack { ref_id, desc }) => peer.send_nack(ref_id, &desc),
                        None => {}
                    }
                    if dispatch.close_peer {
                        let peer = peer.clone();
                        // Let the nack flush before tearing the transport down.
                        tokio::spawn(async move {
                            tokio::time::sleep(NACK_FLUSH_GRACE).await;
                            peer.close("bad token");
                        });
                    }
                }
            }
        });
        info!(peer_id = %self.id, "control channel installed");
    }

    fn attach_pane(self: &Arc<Self>, dc: Arc<RTCDataChannel>, pane_id: u32, size: Winsize) {
        let Some(ctx) = self.ctx.upgrade() else {
            close_channel(&dc);
            return;
        };
        let Some(pane) = ctx.panes.get(pane_id) else {
            warn!(peer_id = %self.id, pane_id, "attach to unknown pane");
            self.send_nack(0, "unknown pane");
            let (message_id, time) = self.reply_ids();
            let frame = protocol::encode_nack(message_id, time, 0, "unknown pane");
            nack_and_close(dc, frame);
            return;
        };
        if let Err(err) = pane.resize(size) {
            warn!(peer_id = %self.id, pane_id, error = %err, "resize on attach failed");
        }
        self.bind_pane_channel(dc, pane);
    }

    fn open_pane(self: &Arc<Self>, dc: Arc<RTCDataChannel>, argv: Vec<String>) {
        let Some(ctx) = self.ctx.upgrade() else {
            close_channel(&dc);
            return;
        };
        let size = self.default_size();
        match ctx.panes.create(&argv, size, Default::default()) {
            Ok(pane) => self.bind_pane_channel(dc, pane),
            Err(err) => {
                warn!(peer_id = %self.id, error = %err, "pane spawn for channel failed");
                self.send_nack(0, &err.to_string());
                close_channel(&dc);
            }
        }
    }

    fn bind_pane_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>, pane: Arc<crate::pane::Pane>) {
        let sink = DcSink::new(dc.clone(), dc.label());
        let dc_id = match pane.bind(sink) {
            Ok(dc_id) => dc_id,
            Err(err) => {
                warn!(peer_id = %self.id, pane_id = pane.id(), error = %err, "bind failed");
                self.send_nack(0, &err.to_string());
                close_channel(&dc);
                return;
            }
        };

        let pane_for_input = pane.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let pane = pane_for_input.clone();
            Box::pin(async move {
                if let Err(err) = pane.write(&msg.data) {
                    warn!(pane_id = pane.id(), error = %err, "peer input dropped");
                }
            })
        }));

        let peer_id = self.id.clone();
        dc.on_close(Box::new(move || {
            let pane = pane.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                debug!(peer_id = %peer_id, pane_id = pane.id(), dc_id, "pane channel closed");
                pane.unbind(dc_id);
            })
        }));
    }
}

fn close_channel(dc: &Arc<RTCDataChannel>) {
    let dc = dc.clone();
    tokio::spawn(async move {
        let _ = dc.close().await;
    });
}

fn nack_and_close(dc: Arc<RTCDataChannel>, frame: Vec<u8>) {
    tokio::spawn(async move {
        let _ = dc.send(&Bytes::from(frame)).await;
        let _ = dc.close().await;
    });
}

/// Outbound wrapper over one data channel: sends enqueue onto an
/// unbounded queue drained by a writer task, so pane broadcasts never
/// block on the transport.
pub struct DcSink {
    label: String,
    dc: Arc<RTCDataChannel>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl DcSink {
    pub fn new(dc: Arc<RTCDataChannel>, label: &str) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let ready = Arc::new(Notify::new());
        let open_signal = ready.clone();
        dc.on_open(Box::new(move || {
            let notify = open_signal.clone();
            Box::pin(async move {
                notify.notify_one();
            })
        }));

        let dc_writer = dc.clone();
        tokio::spawn(async move {
            while dc_writer.ready_state() != RTCDataChannelState::Open {
                if dc_writer.ready_state() == RTCDataChannelState::Closed {
                    return;
                }
                tokio::select! {
                    _ = ready.notified() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            while let Some(bytes) = rx.recv().await {
                if let Err(err) = dc_writer.send(&Bytes::from(bytes)).await {
                    debug!(label = %dc_writer.label(), error = %err, "channel writer stopped");
                    break;
                }
            }
        });

        Arc::new(Self {
            label: label.to_string(),
            dc,
            tx,
        })
    }
}

impl ChannelSink for DcSink {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| AgentError::Transport(format!("channel {} is closed", self.label)))
    }

    fn close(&self) {
        close_channel(&self.dc);
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Process-wide peer table; peers remove themselves on close.
#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<std::collections::HashMap<String, Arc<Peer>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: Arc<Peer>) {
        self.peers
            .lock()
            .unwrap()
            .insert(peer.id().to_string(), peer);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.lock().unwrap().get(id).cloned()
    }

    /// Drops the table entry without touching the peer; `Peer::close`
    /// calls this on its way down.
    pub fn forget(&self, id: &str) {
        self.peers.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().unwrap().is_empty()
    }

    pub fn shutdown_all(&self) {
        let drained: Vec<Arc<Peer>> = {
            let mut peers = self.peers.lock().unwrap();
            peers.drain().map(|(_, peer)| peer).collect()
        };
        for peer in drained {
            peer.close("agent shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_SDP: &str = "v=0\r\no=- 4242 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    #[test]
    fn sdp_envelope_roundtrips_through_base64() {
        let desc = RTCSessionDescription::offer(MINIMAL_SDP.into()).unwrap();
        let encoded = encode_description(&desc);
        let decoded = decode_offer(&encoded).unwrap();
        assert_eq!(decoded.sdp, desc.sdp);
    }

    #[test]
    fn decode_rejects_answers_posing_as_offers() {
        let payload = serde_json::json!({"type": "answer", "sdp": MINIMAL_SDP});
        let encoded = BASE64.encode(payload.to_string());
        assert!(decode_offer(&encoded).is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_offer("!!not-base64!!").is_err());
        let encoded = BASE64.encode("not json");
        assert!(decode_offer(&encoded).is_err());
    }

    #[tokio::test]
    async fn candidate_queue_drains_then_signals_completion() {
        let queue = CandidateQueue::new();
        queue.push("a".into());
        queue.push("b".into());
        queue.finish();
        assert_eq!(queue.next(Duration::from_millis(10)).await.as_deref(), Some("a"));
        assert_eq!(queue.next(Duration::from_millis(10)).await.as_deref(), Some("b"));
        assert_eq!(queue.next(Duration::from_millis(10)).await, None);
    }

    #[tokio::test]
    async fn candidate_queue_times_out_while_gathering() {
        let queue = CandidateQueue::new();
        let waited = queue.next(Duration::from_millis(30)).await;
        assert_eq!(waited, None);
    }
}
