//! Signalling over the agent's local Unix socket (and, when configured,
//! the same router on TCP): offer/answer exchange plus trickled ICE
//! candidates for the `accept` helper.

use axum::Router;
use axum::extract::{Json, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::agent::AgentContext;
use crate::errors::{AgentError, Result};
use crate::peer::{ENVELOPE_VERSION, Peer, SdpEnvelope};

/// How long one `GET /offer/{id}` poll parks before reporting an empty
/// queue; matches the bounded gather timeout.
const CANDIDATE_POLL: Duration = Duration::from_secs(5);

pub fn router(ctx: Arc<AgentContext>) -> Router {
    Router::new()
        .route("/offer/", post(post_offer))
        .route("/offer/{id}", get(get_candidate).put(put_candidate))
        .route("/status", get(get_status))
        .with_state(ctx)
}

async fn post_offer(
    State(ctx): State<Arc<AgentContext>>,
    Json(envelope): Json<SdpEnvelope>,
) -> Response {
    match Peer::connect(&ctx, &envelope).await {
        Ok((peer, answer)) => {
            ctx.peers.insert(peer.clone());
            info!(peer_id = %peer.id(), "offer accepted");
            Json(json!({
                "id": peer.id(),
                "ice_servers": ctx.ice_server_urls(),
                "fingerprint": ctx.certificate.fingerprint(),
                "version": ENVELOPE_VERSION,
                "answer": answer,
            }))
            .into_response()
        }
        Err(err @ AgentError::Protocol(_)) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        Err(err) => {
            warn!(error = %err, "offer handling failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn put_candidate(
    State(ctx): State<Arc<AgentContext>>,
    Path(id): Path<String>,
    body: String,
) -> Response {
    let Some(peer) = ctx.peers.get(&id) else {
        return (StatusCode::NOT_FOUND, "unknown peer").into_response();
    };
    let candidate: RTCIceCandidateInit = match serde_json::from_str(&body) {
        Ok(candidate) => candidate,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("bad candidate: {err}")).into_response();
        }
    };
    match peer.add_remote_candidate(candidate).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

async fn get_candidate(
    State(ctx): State<Arc<AgentContext>>,
    Path(id): Path<String>,
) -> Response {
    let Some(peer) = ctx.peers.get(&id) else {
        return (StatusCode::NOT_FOUND, "unknown peer").into_response();
    };
    match peer.candidates.next(CANDIDATE_POLL).await {
        Some(candidate) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            candidate,
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_status(State(ctx): State<Arc<AgentContext>>) -> String {
    ctx.status_text()
}

/// Serves the router on the agent's Unix socket; a stale socket file
/// from a dead agent is swept first.
pub async fn serve_unix(
    ctx: Arc<AgentContext>,
    path: &FsPath,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)
        .map_err(|err| AgentError::Config(format!("bind {}: {err}", path.display())))?;
    info!(socket = %path.display(), "signalling socket listening");
    Ok(spawn_server(ctx, listener, shutdown))
}

pub async fn serve_tcp(
    ctx: Arc<AgentContext>,
    address: &str,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|err| AgentError::Config(format!("bind {address}: {err}")))?;
    info!(address, "signalling http listening");
    Ok(spawn_server(ctx, listener, shutdown))
}

fn spawn_server<L>(
    ctx: Arc<AgentContext>,
    listener: L,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    L: axum::serve::Listener,
    L::Addr: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    let app = router(ctx);
    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        if let Err(err) = serve.await {
            warn!(error = %err, "signalling server ended");
        }
    })
}

/// Minimal HTTP/1.1 client over the agent's Unix socket, used by the
/// `accept` and `status` commands.
pub mod client {
    use http_body_util::{BodyExt, Full};
    use hyper::body::Bytes;
    use hyper::{Method, Request, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::path::Path;
    use tokio::net::UnixStream;

    use crate::errors::{AgentError, Result};

    pub async fn request(
        socket: &Path,
        method: Method,
        uri: &str,
        body: Option<String>,
    ) -> Result<(StatusCode, String)> {
        let stream = UnixStream::connect(socket).await.map_err(|err| {
            AgentError::Transport(format!("connect {}: {err}", socket.display()))
        })?;
        let io = TokioIo::new(stream);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|err| AgentError::Transport(format!("http handshake: {err}")))?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(hyper::header::HOST, "boardwalk")
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|err| AgentError::Transport(format!("build request: {err}")))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|err| AgentError::Transport(format!("send request: {err}")))?;
        let status = response.status();
        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|err| AgentError::Transport(format!("read response: {err}")))?;
        let text = String::from_utf8_lossy(&collected.to_bytes()).into_owned();
        Ok((status, text))
    }
}
