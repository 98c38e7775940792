//! Agent-side tunnel: the WebSocket link to the relay.
//!
//! One read loop dispatches incoming frames. Request bytes are reassembled
//! per stream until the terminal frame, then handed to an independent task
//! so a slow backend never blocks the loop. Response frames from those
//! tasks are serialised through a shared, mutex-guarded sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls, connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use burrow_protocol::auth;
use burrow_protocol::frame::{self, Frame, FrameType};

use crate::config::AgentConfig;
use crate::handler::{error_response, RequestHandler};
use crate::proxy::ProxyDialer;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// The agent's connection to the relay.
pub struct Tunnel {
    sink: SharedSink,
    stream: Mutex<Option<SplitStream<WsStream>>>,
    handler: Arc<RequestHandler>,
    ping_interval: Duration,
    done: CancellationToken,
    close_once: AtomicBool,
}

impl Tunnel {
    /// Establish the WebSocket connection to the relay, optionally routing
    /// through the proxy dialer.
    pub async fn connect(cfg: &AgentConfig, dialer: Option<&ProxyDialer>) -> Result<Arc<Self>> {
        let token = auth::generate_token(&cfg.auth.shared_secret);
        let url = format!("{}?token={}", cfg.relay.url, token);

        info!(url = %cfg.relay.url, proxied = dialer.is_some(), "connecting to relay");
        let ws = match dialer {
            Some(dialer) => {
                let relay = url::Url::parse(&cfg.relay.url).context("parsing relay url")?;
                let host = relay.host_str().context("relay url has no host")?;
                let port = relay
                    .port_or_known_default()
                    .context("relay url has no port")?;
                let tcp = dialer
                    .dial(&format!("{host}:{port}"))
                    .await
                    .context("dialling relay via proxy")?;
                let (ws, _) = client_async_tls(url.as_str(), tcp)
                    .await
                    .context("websocket handshake with relay")?;
                ws
            }
            None => {
                let (ws, _) = connect_async(url.as_str())
                    .await
                    .context("dialling relay")?;
                ws
            }
        };
        info!("connected to relay");

        let (sink, stream) = ws.split();
        Ok(Arc::new(Self {
            sink: Arc::new(Mutex::new(sink)),
            stream: Mutex::new(Some(stream)),
            handler: Arc::new(RequestHandler::new(&cfg.backend.target_url)?),
            ping_interval: cfg.tunnel.ping_interval(),
            done: CancellationToken::new(),
            close_once: AtomicBool::new(false),
        }))
    }

    /// Process frames from the relay until the link dies. Returns the read
    /// error, or `Ok` on clean shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let mut stream = self
            .stream
            .lock()
            .await
            .take()
            .context("tunnel already running")?;

        let ping_task = tokio::spawn({
            let tunnel = self.clone();
            async move { tunnel.ping_loop().await }
        });

        let result = self.read_loop(&mut stream).await;
        ping_task.abort();
        self.close().await;
        result
    }

    /// Shut down the link. Idempotent.
    pub async fn close(&self) {
        if self.close_once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.done.cancel();
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
        info!("agent tunnel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    async fn read_loop(&self, stream: &mut SplitStream<WsStream>) -> Result<()> {
        // partial request data per stream
        let mut streams: HashMap<u32, Vec<u8>> = HashMap::new();

        loop {
            let msg = tokio::select! {
                _ = self.done.cancelled() => return Ok(()),
                msg = stream.next() => msg,
            };

            let data = match msg {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(_))) | None => {
                    info!("relay closed the tunnel");
                    return Ok(());
                }
                Some(Ok(Message::Text(_))) => {
                    anyhow::bail!("text message on tunnel socket");
                }
                Some(Ok(_)) => continue, // websocket-level ping/pong
                Some(Err(err)) => {
                    if self.done.is_cancelled() {
                        return Ok(());
                    }
                    return Err(err).context("reading frame");
                }
            };

            let frame = frame::unmarshal(&data).context("decoding frame")?;
            match frame.frame_type {
                FrameType::Ping => {
                    self.send_frame(&Frame::control(FrameType::Pong))
                        .await
                        .context("sending pong")?;
                }
                FrameType::Pong => {}
                FrameType::HttpRequest | FrameType::BodyChunk => {
                    streams
                        .entry(frame.stream_id)
                        .or_default()
                        .extend_from_slice(&frame.payload);
                }
                FrameType::StreamClose => {
                    if let Some(data) = streams.remove(&frame.stream_id) {
                        self.spawn_request(frame.stream_id, data);
                    }
                }
                other => {
                    warn!(frame_type = ?other, stream = frame.stream_id,
                        "unexpected frame type from relay");
                }
            }
        }
    }

    /// Dispatch request handling on its own task so slow backends never
    /// block the read loop.
    fn spawn_request(&self, stream_id: u32, data: Vec<u8>) {
        let handler = self.handler.clone();
        let sink = self.sink.clone();
        let done = self.done.clone();

        tokio::spawn(async move {
            let response = match handler.handle(&data).await {
                Ok(response) => response,
                Err(err) => {
                    error!(stream = stream_id, %err, "failed to handle request");
                    error_response(502, &format!("backend error: {err}"))
                }
            };

            let mut frames = frame::chunk_payload(stream_id, FrameType::HttpResponse, &response);
            frames.push(Frame::stream_close(stream_id));

            for frame in &frames {
                if done.is_cancelled() {
                    return;
                }
                if let Err(err) = send_on(&sink, frame).await {
                    // the relay's request timeout covers the unanswered stream
                    error!(stream = stream_id, %err, "failed to send response frame");
                    return;
                }
            }
        });
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        send_on(&self.sink, frame).await
    }

    async fn ping_loop(&self) {
        loop {
            tokio::select! {
                _ = self.done.cancelled() => return,
                _ = tokio::time::sleep(self.ping_interval) => {
                    if let Err(err) = self.send_frame(&Frame::control(FrameType::Ping)).await {
                        error!(%err, "agent ping failed");
                        self.close().await;
                        return;
                    }
                }
            }
        }
    }
}

async fn send_on(sink: &SharedSink, frame: &Frame) -> Result<()> {
    let data = frame::marshal(frame)?;
    let mut sink = sink.lock().await;
    sink.send(Message::Binary(data))
        .await
        .context("websocket send")
}
