//! WebSocket client helpers.
//!
//! Protocol clients own their read loop; this module only opens the socket
//! and converts close frames into [`ConnectionError`]s.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::{SplitSink, SplitStream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use courier_core::ConnectionError;

pub use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// A client WebSocket stream.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
/// Write half of a [`WsStream`].
pub type WsSink = SplitSink<WsStream, Message>;
/// Read half of a [`WsStream`].
pub type WsSource = SplitStream<WsStream>;

/// Opens a WebSocket connection, giving up after `timeout`.
pub async fn connect(url: &str, timeout: Duration) -> Result<(WsSink, WsSource), ConnectionError> {
    debug!(%url, "Opening WebSocket");
    let connecting = tokio::time::timeout(timeout, connect_async(url));
    match connecting.await {
        Ok(Ok((stream, _response))) => Ok(stream.split()),
        Ok(Err(e)) => Err(ConnectionError::ConnectFailed {
            url: url.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(ConnectionError::Timeout(format!("connecting to {url}"))),
    }
}

/// Converts an optional close frame into a [`ConnectionError::Closed`].
pub fn closed(frame: Option<&CloseFrame>) -> ConnectionError {
    match frame {
        Some(frame) => ConnectionError::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_string(),
        },
        None => ConnectionError::Closed {
            code: 0,
            reason: "connection closed".into(),
        },
    }
}
