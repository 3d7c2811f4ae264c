//! WebSocket transport for the public feed
//!
//! Each opened connection runs in its own task which owns the socket.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{FeedConnection, FeedPeer, FeedTransport, TransportCommand, TransportEvent};
use crate::error::BookSyncError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Timeout for WebSocket connection attempts
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for the server's close frame after sending ours
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Transport opening one WebSocket per connection
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    endpoint: String,
}

impl WebSocketTransport {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
        }
    }
}

impl FeedTransport for WebSocketTransport {
    fn open(&mut self) -> FeedConnection {
        let (connection, peer) = FeedConnection::channel();
        tokio::spawn(run_connection(self.endpoint.clone(), peer));
        connection
    }
}

async fn run_connection(endpoint: String, mut peer: FeedPeer) {
    info!(url = %endpoint, "Connecting to feed WebSocket");

    let connect = timeout(CONNECTION_TIMEOUT, connect_async(endpoint.as_str()));
    tokio::pin!(connect);

    let mut stream: WsStream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(Ok((stream, response))) => {
                    info!(status = ?response.status(), "WebSocket connected");
                    break stream;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to connect");
                    peer.emit(TransportEvent::Error(BookSyncError::from(e).to_string()));
                    return;
                }
                Err(_) => {
                    warn!("Connection attempt timed out");
                    peer.emit(TransportEvent::Error(BookSyncError::ConnectionTimeout.to_string()));
                    return;
                }
            },
            command = peer.commands.recv() => match command {
                Some(TransportCommand::Send(_)) => {
                    warn!("Dropping outbound message issued before the connection opened");
                }
                Some(TransportCommand::Close) | None => {
                    debug!("Close requested while connecting");
                    peer.emit(TransportEvent::Closed);
                    return;
                }
            },
        }
    };

    peer.emit(TransportEvent::Open);

    loop {
        tokio::select! {
            command = peer.commands.recv() => match command {
                Some(TransportCommand::Send(text)) => {
                    if let Err(e) = stream.send(Message::Text(text)).await {
                        error!(error = %e, "Failed to send message");
                        peer.emit(TransportEvent::Error(e.to_string()));
                        return;
                    }
                }
                Some(TransportCommand::Close) | None => {
                    close(&mut stream).await;
                    peer.emit(TransportEvent::Closed);
                    return;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    debug!(len = text.len(), "Received text message");
                    peer.emit(TransportEvent::Message(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    peer.emit(TransportEvent::Message(String::from_utf8_lossy(&data).into_owned()));
                }
                Some(Ok(Message::Ping(data))) => {
                    debug!("Received ping, sending pong");
                    let _ = stream.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    warn!(frame = ?frame, "Received close frame");
                    peer.emit(TransportEvent::Closed);
                    return;
                }
                Some(Err(e)) => {
                    error!(error = %e, "WebSocket error");
                    peer.emit(TransportEvent::Error(e.to_string()));
                    return;
                }
                None => {
                    warn!("WebSocket stream ended");
                    peer.emit(TransportEvent::Closed);
                    return;
                }
            },
        }
    }
}

/// Send our close frame and discard whatever arrives until the server answers
async fn close(stream: &mut WsStream) {
    if let Err(e) = stream.close(None).await {
        debug!(error = %e, "Close frame not sent");
        return;
    }

    let drained = timeout(CLOSE_DRAIN_TIMEOUT, async {
        while let Some(Ok(message)) = stream.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;

    if drained.is_err() {
        debug!("Server did not answer the close handshake in time");
    }
}
