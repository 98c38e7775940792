//! Forwards public HTTP requests through an agent tunnel.
//!
//! One handler invocation is one stream: the request is serialised, framed,
//! and written to a pooled tunnel; response frames are collected from the
//! stream's sink until a terminal condition (stream close, sink closed, or
//! the configured timeout).

use std::collections::HashMap;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{error, warn};

use burrow_protocol::frame::{self, Frame, FrameType};
use burrow_protocol::message::{TunnelledRequest, TunnelledResponse};

use crate::server::SharedState;
use crate::tunnel::Tunnel;

pub async fn forward_handler(State(state): State<SharedState>, request: Request) -> Response {
    let tunnel = match state.pool.get().await {
        Ok(tunnel) => tunnel,
        Err(err) => {
            warn!(%err, "no agent available");
            return (StatusCode::BAD_GATEWAY, "no backend agents connected").into_response();
        }
    };

    let tunnelled = match build_tunnelled_request(request).await {
        Ok(tunnelled) => tunnelled,
        Err(response) => return response,
    };

    let payload = match serde_json::to_vec(&tunnelled) {
        Ok(payload) => payload,
        Err(err) => {
            error!(%err, "failed to serialise request");
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };

    let stream_id = frame::next_stream_id();
    let frames = frame::chunk_payload(stream_id, FrameType::HttpRequest, &payload);

    let mut rx = match send_request_frames(&tunnel, stream_id, frames).await {
        Ok(rx) => rx,
        Err(response) => return response,
    };

    let deadline = state.config.tunnel.request_timeout();
    match tokio::time::timeout(deadline, collect_response(&mut rx)).await {
        Ok(outcome) => write_response(outcome),
        Err(_) => {
            warn!(stream = stream_id, "request timed out waiting for response");
            tunnel.remove_stream(stream_id).await;
            (StatusCode::GATEWAY_TIMEOUT, "request timed out").into_response()
        }
    }
}

/// Convert an incoming request into its tunnelled form: method, path+query,
/// first value of each header, and the full body.
async fn build_tunnelled_request(request: Request) -> Result<TunnelledRequest, Response> {
    let (parts, body) = request.into_parts();

    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let mut headers = HashMap::new();
    for key in parts.headers.keys() {
        if let Some(value) = parts.headers.get(key) {
            if let Ok(value) = value.to_str() {
                headers.insert(key.as_str().to_string(), value.to_string());
            }
        }
    }

    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body.to_vec(),
        Err(err) => {
            error!(%err, "failed to read request body");
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response());
        }
    };

    Ok(TunnelledRequest {
        method: parts.method.to_string(),
        url,
        headers,
        body,
    })
}

/// Emit the request frames followed by a stream close. The first frame
/// registers the response sink; any failure cleans it up again.
async fn send_request_frames(
    tunnel: &Tunnel,
    stream_id: u32,
    frames: Vec<Frame>,
) -> Result<mpsc::Receiver<Frame>, Response> {
    let mut frames = frames.into_iter();
    let first = frames.next().expect("chunk_payload yields at least one frame");

    let rx = match tunnel.send_request(&first).await {
        Ok(rx) => rx,
        Err(err) => {
            error!(%err, "failed to send request");
            return Err((StatusCode::BAD_GATEWAY, "tunnel error").into_response());
        }
    };

    for frame in frames {
        if let Err(err) = tunnel.send_frame(&frame).await {
            error!(%err, "failed to send body chunk");
            tunnel.remove_stream(stream_id).await;
            return Err((StatusCode::BAD_GATEWAY, "tunnel error").into_response());
        }
    }

    if let Err(err) = tunnel.send_frame(&Frame::stream_close(stream_id)).await {
        error!(%err, "failed to send stream close");
        tunnel.remove_stream(stream_id).await;
        return Err((StatusCode::BAD_GATEWAY, "tunnel error").into_response());
    }

    Ok(rx)
}

enum CollectOutcome {
    /// A `StreamClose` frame terminated the stream.
    Completed(Vec<u8>),
    /// The sink closed without a terminal frame.
    SinkClosed(Vec<u8>),
}

async fn collect_response(rx: &mut mpsc::Receiver<Frame>) -> CollectOutcome {
    let mut data = Vec::new();
    while let Some(frame) = rx.recv().await {
        match frame.frame_type {
            FrameType::HttpResponse | FrameType::BodyChunk => {
                data.extend_from_slice(&frame.payload);
            }
            FrameType::StreamClose => return CollectOutcome::Completed(data),
            _ => {}
        }
    }
    CollectOutcome::SinkClosed(data)
}

fn write_response(outcome: CollectOutcome) -> Response {
    let data = match outcome {
        CollectOutcome::Completed(data) => data,
        CollectOutcome::SinkClosed(data) => {
            if data.is_empty() {
                return (StatusCode::BAD_GATEWAY, "tunnel closed").into_response();
            }
            // data arrived but the link died before the terminal frame;
            // emit what we have
            data
        }
    };

    if data.is_empty() {
        return (StatusCode::BAD_GATEWAY, "empty response from backend").into_response();
    }

    let tunnelled: TunnelledResponse = match serde_json::from_slice(&data) {
        Ok(tunnelled) => tunnelled,
        Err(err) => {
            error!(%err, "failed to deserialise response");
            return (StatusCode::BAD_GATEWAY, "invalid response from backend").into_response();
        }
    };

    let status =
        StatusCode::from_u16(tunnelled.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(tunnelled.body));
    *response.status_mut() = status;
    for (key, value) in &tunnelled.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(key.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}
