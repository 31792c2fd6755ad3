//! WebSocket transport
//!
//! This file implements the client-facing WebSocket server. Responsibilities:
//! - Accept TCP/WebSocket connections and read the handshake query
//! - Establish each connection with the `Gateway` (replay or recovery)
//! - Run one writer task per connection that sends the opening frames, then
//!   the live frames queued on the connection's channel
//! - Parse inbound JSON frames and forward publishes to the gateway

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::transport::gateway::{DeliveryCursor, Established, Gateway};
use crate::transport::handshake::ConnectParams;
use crate::transport::message::{ClientMessage, ServerMessage, encode_frame};
use crate::utils::RelayError;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

pub async fn start_websocket_server(addr: String, gateway: Arc<Gateway>) -> Result<(), RelayError> {
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, gateway).await
}

/// Accepts connections on an already bound listener until it fails.
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>) -> Result<(), RelayError> {
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };
        let gateway = gateway.clone();
        spawn(handle_connection(stream, peer, gateway));
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, gateway: Arc<Gateway>) {
    let mut query: Option<String> = None;
    let capture_query = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        query = request.uri().query().map(str::to_string);
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, capture_query).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake error");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let params = ConnectParams::from_query(query.as_deref());
    let Some(mut established) = gateway.establish(params).await else {
        warn!(%peer, "Connection limit reached; rejecting");
        let refusal = ServerMessage::Error {
            message: "server is at capacity".to_string(),
        };
        if let Some(frame) = encode_frame(&refusal) {
            let _ = ws_sender.send(frame).await;
        }
        let _ = ws_sender.close().await;
        return;
    };
    let opening = established.opening_frames();
    let Established {
        client,
        meta,
        receiver,
        ..
    } = established;
    let client_id = client.id.clone();

    info!(
        connection_id = %client_id,
        %peer,
        recovered = meta.recovered,
        offset = meta.last_known_offset,
        backlog = opening.len() - 1,
        "Connection established"
    );

    let cleanup_called = Arc::new(AtomicBool::new(false));

    let do_cleanup = {
        let gateway = gateway.clone();
        let client_id = client_id.clone();
        let session_id = client.session_id.clone();
        let cleanup_called = cleanup_called.clone();

        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                gateway.disconnect(&client_id, &session_id);
            }
        }
    };

    {
        let client_id = client_id.clone();
        let do_cleanup = do_cleanup.clone();
        let cursor = DeliveryCursor::after_backlog(meta.last_known_offset, &opening);

        spawn(async move {
            if let Err(e) = send_loop(&mut ws_sender, opening, cursor, receiver).await {
                debug!(connection_id = %client_id, error = %e, "Failed to send to client");
            }
            do_cleanup();
            debug!(connection_id = %client_id, "Send loop closed");
        });
    }

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage::Publish {
                    content,
                    dedup_token,
                }) => {
                    gateway
                        .handle_publish(&client, &dedup_token, &content)
                        .await;
                }
                Err(err) => {
                    warn!(
                        connection_id = %client_id,
                        "Invalid client message: {err} | {}",
                        text.chars().take(100).collect::<String>()
                    );
                    client.send(ServerMessage::Error {
                        message: format!("invalid message: {err}"),
                    });
                }
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    do_cleanup();
    info!(connection_id = %client_id, "Client disconnected");
}

/// Writes the opening frames, then live frames until the channel closes.
async fn send_loop(
    ws_sender: &mut WsSink,
    opening: Vec<ServerMessage>,
    cursor: DeliveryCursor,
    mut receiver: UnboundedReceiver<ServerMessage>,
) -> Result<(), tungstenite::Error> {
    for frame in &opening {
        if let Some(msg) = encode_frame(frame) {
            ws_sender.feed(msg).await?;
        }
    }
    ws_sender.flush().await?;

    while let Some(frame) = receiver.recv().await {
        if !cursor.admit(&frame) {
            continue;
        }
        if let Some(msg) = encode_frame(&frame) {
            ws_sender.send(msg).await?;
        }
    }

    let _ = ws_sender.close().await;
    Ok(())
}
