//! Shared fixtures for relay unit tests.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use burrow_protocol::frame::{self, Frame};

pub(crate) type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a real WebSocket pair over loopback: the server half as an axum
/// socket, the client half as a tungstenite stream.
pub(crate) async fn ws_pair() -> (WebSocket, ClientWs) {
    let (tx, mut rx) = mpsc::channel::<WebSocket>(1);
    let app = Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade| {
            let tx = tx.clone();
            async move {
                ws.on_upgrade(move |socket| async move {
                    let _ = tx.send(socket).await;
                })
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let server = rx.recv().await.unwrap();
    (server, client)
}

/// Send a protocol frame from the client (agent) half.
pub(crate) async fn send_client_frame(client: &mut ClientWs, frame: &Frame) {
    let data = frame::marshal(frame).unwrap();
    client.send(WsMessage::Binary(data)).await.unwrap();
}

/// Read the next protocol frame arriving at the client (agent) half.
pub(crate) async fn recv_frame(client: &mut ClientWs) -> Frame {
    loop {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        if let WsMessage::Binary(data) = msg {
            return frame::unmarshal(&data).unwrap();
        }
    }
}
