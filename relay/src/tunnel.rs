//! Relay-side tunnel link: one agent WebSocket, many multiplexed streams.
//!
//! Each link owns a read task and a ping task. All writes pass through a
//! single mutex, so a frame is always emitted as one whole message. Response
//! frames are routed to per-stream bounded sinks registered by the request
//! handler; a sink is closed exactly once, on `StreamClose`, on request
//! timeout, or on link teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use burrow_protocol::frame::{self, Frame, FrameType};

/// Capacity of each per-stream response sink.
pub const STREAM_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] frame::FrameError),
    #[error("websocket send failed: {0}")]
    Transport(#[from] axum::Error),
}

/// A single agent connection on the relay side.
pub struct Tunnel {
    id: String,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    streams: RwLock<HashMap<u32, mpsc::Sender<Frame>>>,
    done: CancellationToken,
    close_once: AtomicBool,
    ping_interval: Duration,
}

impl Tunnel {
    /// Wrap an upgraded agent socket and start its read and ping tasks.
    pub fn spawn(id: String, socket: WebSocket, ping_interval: Duration) -> Arc<Self> {
        let (sink, stream) = socket.split();
        let tunnel = Arc::new(Self {
            id,
            sink: Mutex::new(sink),
            streams: RwLock::new(HashMap::new()),
            done: CancellationToken::new(),
            close_once: AtomicBool::new(false),
            ping_interval,
        });

        tokio::spawn({
            let tunnel = tunnel.clone();
            async move { tunnel.read_loop(stream).await }
        });
        tokio::spawn({
            let tunnel = tunnel.clone();
            async move { tunnel.ping_loop().await }
        });

        tunnel
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Completes once the tunnel has shut down.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    /// Send a frame without registering a response sink.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), TunnelError> {
        if self.done.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let data = frame::marshal(frame)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(data))
            .await
            .map_err(TunnelError::Transport)
    }

    /// Send the opening frame of a stream, registering its response sink
    /// first. Registration-before-write guarantees no response frame can
    /// arrive before the sink exists.
    pub async fn send_request(&self, frame: &Frame) -> Result<mpsc::Receiver<Frame>, TunnelError> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.streams.write().await.insert(frame.stream_id, tx);

        if let Err(err) = self.send_frame(frame).await {
            self.remove_stream(frame.stream_id).await;
            return Err(err);
        }
        Ok(rx)
    }

    /// Drop a stream's sink. Idempotent.
    pub async fn remove_stream(&self, stream_id: u32) {
        self.streams.write().await.remove(&stream_id);
    }

    /// Shut the tunnel down: close the socket and every open stream sink.
    /// Idempotent; later calls are no-ops.
    pub async fn close(&self) {
        if self.close_once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.done.cancel();
        self.streams.write().await.clear();
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
        info!(id = %self.id, "tunnel closed");
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WebSocket>) {
        loop {
            let msg = tokio::select! {
                _ = self.done.cancelled() => break,
                msg = stream.next() => msg,
            };
            match msg {
                Some(Ok(Message::Binary(data))) => match frame::unmarshal(&data) {
                    Ok(frame) => self.dispatch(frame).await,
                    Err(err) => {
                        // the link cannot resynchronise after a framing error
                        error!(id = %self.id, %err, "tunnel read error");
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!(id = %self.id, "agent disconnected");
                    break;
                }
                Some(Ok(Message::Text(_))) => {
                    error!(id = %self.id, "text message on tunnel socket");
                    break;
                }
                Some(Ok(_)) => {} // websocket-level ping/pong, handled by the transport
                Some(Err(err)) => {
                    if !self.done.is_cancelled() {
                        error!(id = %self.id, %err, "tunnel read error");
                    }
                    break;
                }
            }
        }
        self.close().await;
    }

    async fn dispatch(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::Pong => {}
            FrameType::Ping => {
                if let Err(err) = self.send_frame(&Frame::control(FrameType::Pong)).await {
                    warn!(id = %self.id, %err, "failed to answer ping");
                }
            }
            FrameType::HttpResponse | FrameType::BodyChunk | FrameType::StreamClose => {
                let stream_id = frame.stream_id;
                let is_close = frame.frame_type == FrameType::StreamClose;
                let sender = self.streams.read().await.get(&stream_id).cloned();
                let Some(tx) = sender else { return };

                // the sink is bounded; wait for room, but give up if the
                // tunnel shuts down underneath us
                tokio::select! {
                    result = tx.send(frame) => {
                        if result.is_err() {
                            // receiver gone (request timed out); drop late frames
                            self.remove_stream(stream_id).await;
                            return;
                        }
                    }
                    _ = self.done.cancelled() => return,
                }
                if is_close {
                    self.remove_stream(stream_id).await;
                }
            }
            other => {
                warn!(id = %self.id, frame_type = ?other, stream = frame.stream_id,
                    "unexpected frame type from agent");
            }
        }
    }

    async fn ping_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.done.cancelled() => return,
                _ = tokio::time::sleep(self.ping_interval) => {
                    if let Err(err) = self.send_frame(&Frame::control(FrameType::Ping)).await {
                        error!(id = %self.id, %err, "tunnel ping failed");
                        self.close().await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::testutil::{recv_frame, send_client_frame, ws_pair};

    const LONG_PING: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (server, _client) = ws_pair().await;
        let tunnel = Tunnel::spawn("t1".into(), server, LONG_PING);

        tunnel.close().await;
        tunnel.close().await;
        assert!(tunnel.is_closed());

        let err = tunnel
            .send_frame(&Frame::control(FrameType::Ping))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Closed));
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let (server, mut client) = ws_pair().await;
        let tunnel = Tunnel::spawn("t1".into(), server, LONG_PING);

        let request = Frame {
            frame_type: FrameType::HttpRequest,
            stream_id: 7,
            payload: b"request".to_vec(),
        };
        let mut rx = tunnel.send_request(&request).await.unwrap();

        // the agent side sees the request frame
        let seen = recv_frame(&mut client).await;
        assert_eq!(seen, request);

        // and answers with a response plus stream close
        send_client_frame(
            &mut client,
            &Frame {
                frame_type: FrameType::HttpResponse,
                stream_id: 7,
                payload: b"response".to_vec(),
            },
        )
        .await;
        send_client_frame(&mut client, &Frame::stream_close(7)).await;

        let first = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.frame_type, FrameType::HttpResponse);
        assert_eq!(first.payload, b"response");

        let second = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.frame_type, FrameType::StreamClose);

        // the sink is closed after the terminal frame
        let end = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_frames_for_unknown_stream_dropped() {
        let (server, mut client) = ws_pair().await;
        let tunnel = Tunnel::spawn("t1".into(), server, LONG_PING);

        send_client_frame(
            &mut client,
            &Frame {
                frame_type: FrameType::HttpResponse,
                stream_id: 999,
                payload: b"orphan".to_vec(),
            },
        )
        .await;

        // link survives: a registered stream still works afterwards
        let mut rx = tunnel
            .send_request(&Frame {
                frame_type: FrameType::HttpRequest,
                stream_id: 1,
                payload: vec![],
            })
            .await
            .unwrap();
        recv_frame(&mut client).await;
        send_client_frame(&mut client, &Frame::stream_close(1)).await;
        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.frame_type, FrameType::StreamClose);
    }

    #[tokio::test]
    async fn test_answers_agent_ping_with_pong() {
        let (server, mut client) = ws_pair().await;
        let _tunnel = Tunnel::spawn("t1".into(), server, LONG_PING);

        send_client_frame(&mut client, &Frame::control(FrameType::Ping)).await;
        let reply = recv_frame(&mut client).await;
        assert_eq!(reply.frame_type, FrameType::Pong);
        assert_eq!(reply.stream_id, 0);
    }

    #[tokio::test]
    async fn test_emits_keepalive_pings() {
        let (server, mut client) = ws_pair().await;
        let _tunnel = Tunnel::spawn("t1".into(), server, Duration::from_millis(50));

        let frame = recv_frame(&mut client).await;
        assert_eq!(frame.frame_type, FrameType::Ping);
        assert_eq!(frame.stream_id, 0);
    }

    #[tokio::test]
    async fn test_agent_disconnect_closes_tunnel() {
        let (server, client) = ws_pair().await;
        let tunnel = Tunnel::spawn("t1".into(), server, LONG_PING);

        drop(client);
        timeout(Duration::from_secs(2), tunnel.closed())
            .await
            .unwrap();
        assert!(tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_close_ends_open_stream_sinks() {
        let (server, mut client) = ws_pair().await;
        let tunnel = Tunnel::spawn("t1".into(), server, LONG_PING);

        let mut rx = tunnel
            .send_request(&Frame {
                frame_type: FrameType::HttpRequest,
                stream_id: 3,
                payload: vec![],
            })
            .await
            .unwrap();
        recv_frame(&mut client).await;

        tunnel.close().await;
        let end = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(end.is_none());
    }
}
