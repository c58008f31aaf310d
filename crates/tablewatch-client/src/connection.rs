//! Socket dialing and framing helpers.

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::Message as Frame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use tablewatch_proto::Message;

use crate::config::ClientConfig;
use crate::error::Error;

/// WebSocket stream type used by the socket task.
pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Socket connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket open; nothing has asked for one yet or it was lost.
    Disconnected,
    /// Dialing or waiting out a reconnect delay.
    Connecting,
    /// Socket open.
    Connected,
    /// Client shut down.
    Closed,
}

/// Open the realtime socket.
pub(crate) async fn dial(config: &ClientConfig) -> Result<WsStream, Error> {
    let url = config.websocket_url()?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Connection(format!("failed to build socket request: {}", e)))?;

    let api_key = HeaderValue::from_str(config.api_key.trim())
        .map_err(|e| Error::Configuration(format!("API key is not a valid header value: {}", e)))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key.trim()))
        .map_err(|e| Error::Configuration(format!("API key is not a valid header value: {}", e)))?;
    request.headers_mut().insert("apikey", api_key);
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let host = url.host_str().unwrap_or_default().to_string();
    tracing::debug!(host = %host, "dialing realtime socket");

    let connect = tokio_tungstenite::connect_async(request);
    match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(Ok((stream, response))) => {
            tracing::debug!(host = %host, status = %response.status(), "realtime socket open");
            Ok(stream)
        }
        Ok(Err(tokio_tungstenite::tungstenite::Error::Http(response))) => {
            let status = response.status();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            match status.as_u16() {
                401 | 403 => Err(Error::Unauthorized(format!(
                    "server refused credentials ({})",
                    status
                ))),
                _ if body.is_empty() => Err(Error::Connection(format!(
                    "socket upgrade failed with HTTP {}",
                    status
                ))),
                _ => Err(Error::Connection(format!(
                    "socket upgrade failed with HTTP {}: {}",
                    status, body
                ))),
            }
        }
        Ok(Err(e)) => Err(Error::Connection(format!("failed to connect to {}: {}", host, e))),
        Err(_) => Err(Error::Timeout),
    }
}

/// Encode and send a message as a text frame.
pub(crate) async fn send_message(ws: &mut WsStream, message: &Message) -> Result<(), Error> {
    let text = message.encode()?;
    ws.send(Frame::Text(text.into()))
        .await
        .map_err(|e| Error::Connection(format!("failed to send {}: {}", message.event, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_connection_state() {
        assert_eq!(ConnectionState::Disconnected, ConnectionState::Disconnected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop a listener to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig::new(format!("http://127.0.0.1:{}", port), "key")
            .with_connect_timeout(Duration::from_secs(2));
        let err = dial(&config).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_dial_rejects_bad_header() {
        let config = ClientConfig::new("http://127.0.0.1:1", "bad\nkey");
        let err = dial(&config).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
