//! Async WebSocket client for the live minute-aggregate feed.
//!
//! This module is organized by concern:
//! - [`connection`] - Connection lifecycle, routing and reconnection
//! - [`handler`] - Incoming frame parsing
//! - [`reconnect`] - Backoff policy between reconnection attempts

pub mod connection;
mod handler;
mod reconnect;

use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use tungstenite::Message;

use crate::Result;
use crate::models::FeedRequest;

pub use connection::{ConnectionCommand, ConnectionManager, FeedEvent, FeedHandle};
pub use handler::parse_feed_text;
pub use reconnect::{Backoff, ReconnectPolicy};

/// Write half of a feed WebSocket connection.
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Read half of a feed WebSocket connection.
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Establishes a WebSocket connection to the given URL.
///
/// # Errors
///
/// Returns a [`PulseError`](crate::PulseError) if the connection or TLS handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _) = connect_async(url).await?;
    info!("WebSocket handshake completed");

    Ok(ws_stream.split())
}

/// Serializes and sends one control message.
async fn send_request(write: &mut WsWriter, request: &FeedRequest) -> Result<()> {
    let json = serde_json::to_string(request)?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Authenticates the connection with the provider API key.
///
/// # Errors
///
/// Returns a [`PulseError`](crate::PulseError) if sending the message fails.
pub async fn authenticate(write: &mut WsWriter, api_key: &str) -> Result<()> {
    send_request(write, &FeedRequest::auth(api_key)).await?;
    debug!("Sent auth request");

    Ok(())
}

/// Subscribes to minute aggregates for `symbols`.
///
/// # Errors
///
/// Returns a [`PulseError`](crate::PulseError) if sending the subscription message fails.
pub async fn subscribe(write: &mut WsWriter, symbols: &[String]) -> Result<()> {
    if symbols.is_empty() {
        return Ok(());
    }
    let request = FeedRequest::subscribe(symbols);
    debug!(params = ?request.params, "Sending subscribe request");
    send_request(write, &request).await?;
    info!(?symbols, "Subscribed to minute aggregates");

    Ok(())
}

/// Unsubscribes from minute aggregates for `symbols`.
///
/// # Errors
///
/// Returns a [`PulseError`](crate::PulseError) if sending the unsubscribe message fails.
pub async fn unsubscribe(write: &mut WsWriter, symbols: &[String]) -> Result<()> {
    if symbols.is_empty() {
        return Ok(());
    }
    send_request(write, &FeedRequest::unsubscribe(symbols)).await?;
    info!(?symbols, "Unsubscribed from minute aggregates");

    Ok(())
}

/// Sends a heartbeat to keep the connection alive.
///
/// # Errors
///
/// Returns a [`PulseError`](crate::PulseError) if sending the message fails.
pub async fn ping(write: &mut WsWriter) -> Result<()> {
    send_request(write, &FeedRequest::ping()).await?;
    debug!("Sent ping");

    Ok(())
}
