use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::protocol::{self, HubFrame, ProtocolError};
use super::{
    HubChannel, HubError, HubInvocation, HubRequest, HubSession, HubTransport, TransportSignal,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<DashMap<String, oneshot::Sender<Result<(), String>>>>;

#[derive(Debug, thiserror::Error)]
enum ConnectError {
    #[error("invalid hub url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported url scheme {0}")]
    Scheme(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,
}

#[derive(Debug, Clone)]
pub struct SignalRConfig {
    /// Base hub URL; the `message` hub path is appended to it.
    pub hub_url: String,
    /// Delay before each reconnect attempt. Reconnecting stops once they are
    /// used up.
    pub reconnect_delays: Vec<Duration>,
    pub handshake_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub event_buffer: usize,
}

impl SignalRConfig {
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
            reconnect_delays: default_reconnect_delays(),
            handshake_timeout: Duration::from_secs(15),
            keep_alive_interval: Duration::from_secs(15),
            event_buffer: 64,
        }
    }
}

pub fn default_reconnect_delays() -> Vec<Duration> {
    [0, 2_000, 10_000, 30_000]
        .into_iter()
        .map(Duration::from_millis)
        .collect()
}

/// [`HubTransport`] speaking the JSON hub protocol over a websocket, with
/// automatic reconnect.
pub struct SignalRTransport {
    config: Arc<SignalRConfig>,
}

impl SignalRTransport {
    pub fn new(config: SignalRConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl HubTransport for SignalRTransport {
    fn open(&self, request: HubRequest) -> HubSession {
        let (signal_tx, signal_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();

        tokio::spawn(run(
            self.config.clone(),
            request,
            signal_tx,
            outgoing_rx,
            pending.clone(),
            connected.clone(),
            stop.clone(),
        ));

        HubSession {
            signals: signal_rx,
            channel: Arc::new(SignalRChannel {
                outgoing: outgoing_tx,
                pending,
                connected,
                stop,
                next_invocation: AtomicU64::new(0),
            }),
        }
    }
}

struct Outgoing {
    invocation_id: String,
    record: String,
}

struct SignalRChannel {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    stop: CancellationToken,
    next_invocation: AtomicU64,
}

#[async_trait]
impl HubChannel for SignalRChannel {
    async fn invoke(&self, invocation: HubInvocation) -> Result<(), HubError> {
        if self.stop.is_cancelled() {
            return Err(HubError::ConnectionClosed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HubError::SendFailed("hub is not connected".into()));
        }

        let invocation_id = self
            .next_invocation
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let record = protocol::encode_invocation(&invocation_id, &invocation)
            .map_err(|e| HubError::SendFailed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(invocation_id.clone(), tx);

        if self
            .outgoing
            .send(Outgoing {
                invocation_id: invocation_id.clone(),
                record,
            })
            .is_err()
        {
            self.pending.remove(&invocation_id);
            return Err(HubError::ConnectionClosed);
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(HubError::SendFailed(error)),
            Err(_) => Err(HubError::SendFailed("connection lost before completion".into())),
        }
    }

    async fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for SignalRChannel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn hub_endpoint(config: &SignalRConfig, request: &HubRequest) -> Result<Url, ConnectError> {
    let mut url = Url::parse(&format!("{}message", config.hub_url))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConnectError::Scheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectError::Scheme(scheme.to_string()))?;
    url.query_pairs_mut()
        .append_pair("user", &request.peer_username)
        .append_pair("access_token", &(request.token)());
    Ok(url)
}

/// Connects and completes the protocol handshake. Returns any records that
/// arrived in the same message as the handshake response.
async fn connect(
    config: &SignalRConfig,
    request: &HubRequest,
) -> Result<(WsStream, Vec<String>), ConnectError> {
    let url = hub_endpoint(config, request)?;
    debug!(peer = %request.peer_username, "connecting to hub");

    let (mut ws, _) = connect_async(url.as_str()).await?;
    ws.send(WsMessage::Text(protocol::handshake_request().into()))
        .await?;

    let handshake = async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(text.as_str().to_string()),
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(ConnectError::ClosedDuringHandshake)
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ConnectError::WebSocket(e)),
            }
        }
    };
    let text = tokio::time::timeout(config.handshake_timeout, handshake)
        .await
        .map_err(|_| ConnectError::HandshakeTimeout)??;

    let mut records = protocol::split_records(&text);
    let response = records.next().ok_or(ConnectError::ClosedDuringHandshake)?;
    protocol::parse_handshake_response(response)?;
    let leftover = records.map(str::to_string).collect();

    Ok((ws, leftover))
}

enum PumpEnd {
    Stopped,
    Lost {
        reason: String,
        allow_reconnect: bool,
    },
}

fn fail_pending(pending: &Pending, reason: &str) {
    let ids: Vec<String> = pending.iter().map(|r| r.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(reason.to_string()));
        }
    }
}

async fn run(
    config: Arc<SignalRConfig>,
    request: HubRequest,
    signals: mpsc::Sender<TransportSignal>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let peer = request.peer_username.clone();
    let mut attempt: usize = 0;

    loop {
        let result = tokio::select! {
            _ = stop.cancelled() => break,
            _ = signals.closed() => break,
            r = connect(&config, &request) => r,
        };

        match result {
            Ok((ws, leftover)) => {
                attempt = 0;
                connected.store(true, Ordering::SeqCst);
                info!(%peer, "hub connected");
                if signals.send(TransportSignal::Connected).await.is_err() {
                    break;
                }

                let end = pump(
                    &config,
                    ws,
                    leftover,
                    &signals,
                    &mut outgoing,
                    &pending,
                    &stop,
                )
                .await;
                connected.store(false, Ordering::SeqCst);

                match end {
                    PumpEnd::Stopped => break,
                    PumpEnd::Lost {
                        reason,
                        allow_reconnect,
                    } => {
                        warn!(%peer, %reason, "hub connection lost");
                        fail_pending(&pending, &reason);
                        let _ = signals
                            .send(TransportSignal::Disconnected { reason })
                            .await;
                        if !allow_reconnect {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "hub connect failed");
                let _ = signals
                    .send(TransportSignal::Disconnected {
                        reason: e.to_string(),
                    })
                    .await;
            }
        }

        let Some(delay) = config.reconnect_delays.get(attempt).copied() else {
            warn!(%peer, "reconnect attempts exhausted");
            break;
        };
        attempt += 1;
        if signals
            .send(TransportSignal::Reconnecting {
                attempt: attempt as u32,
            })
            .await
            .is_err()
        {
            break;
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    connected.store(false, Ordering::SeqCst);
    fail_pending(&pending, "hub stopped");
    debug!(%peer, "hub transport finished");
}

async fn pump(
    config: &SignalRConfig,
    ws: WsStream,
    leftover: Vec<String>,
    signals: &mpsc::Sender<TransportSignal>,
    outgoing: &mut mpsc::UnboundedReceiver<Outgoing>,
    pending: &Pending,
    stop: &CancellationToken,
) -> PumpEnd {
    let (mut sink, mut stream) = ws.split();

    for record in &leftover {
        if let Some(end) = handle_record(record, signals, pending).await {
            return end;
        }
    }

    let mut keep_alive = tokio::time::interval(config.keep_alive_interval);
    keep_alive.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return PumpEnd::Stopped;
            }
            out = outgoing.recv() => {
                let Some(out) = out else {
                    return PumpEnd::Stopped;
                };
                // Calls failed by an earlier disconnect are not replayed.
                if !pending.contains_key(&out.invocation_id) {
                    continue;
                }
                if let Err(e) = sink.send(WsMessage::Text(out.record.into())).await {
                    return lost(e.to_string());
                }
            }
            _ = keep_alive.tick() => {
                if let Err(e) = sink.send(WsMessage::Text(protocol::encode_ping().into())).await {
                    return lost(e.to_string());
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    for record in protocol::split_records(text.as_str()) {
                        if let Some(end) = handle_record(record, signals, pending).await {
                            return end;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return lost("server closed the connection".into());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return lost(e.to_string()),
            }
        }
    }
}

fn lost(reason: String) -> PumpEnd {
    PumpEnd::Lost {
        reason,
        allow_reconnect: true,
    }
}

async fn handle_record(
    record: &str,
    signals: &mpsc::Sender<TransportSignal>,
    pending: &Pending,
) -> Option<PumpEnd> {
    let frame = match protocol::parse_frame(record) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "skipping malformed hub record");
            return None;
        }
    };

    match frame {
        HubFrame::Invocation {
            target, arguments, ..
        } => match protocol::decode_event(&target, arguments) {
            Ok(event) => {
                if signals.send(TransportSignal::Event(event)).await.is_err() {
                    return Some(PumpEnd::Stopped);
                }
            }
            Err(e) => warn!(%target, error = %e, "ignoring hub invocation"),
        },
        HubFrame::Completion {
            invocation_id,
            error,
        } => {
            if let Some((_, tx)) = pending.remove(&invocation_id) {
                let _ = tx.send(error.map_or(Ok(()), Err));
            }
        }
        HubFrame::Ping => {}
        HubFrame::Close {
            error,
            allow_reconnect,
        } => {
            return Some(PumpEnd::Lost {
                reason: error.unwrap_or_else(|| "server closed the hub".into()),
                allow_reconnect,
            });
        }
        HubFrame::Other(kind) => debug!(kind, "ignoring hub record"),
    }
    None
}
