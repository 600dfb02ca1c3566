//! WebSocket links over tokio-tungstenite.

use super::{Connector, Endpoint, Frame, Link, LinkSink, LinkStream};
use crate::error::EngineError;
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        protocol::Message as WsMessage,
    },
};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` and `wss://` links.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

fn build_ws_request(
    endpoint: &Endpoint,
) -> Result<tungstenite::handshake::client::Request, EngineError> {
    let mut request = endpoint
        .address
        .as_str()
        .into_client_request()
        .map_err(|e| EngineError::Connect(format!("invalid address {}: {}", endpoint.address, e)))?;

    for (name, value) in &endpoint.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| EngineError::Connect(format!("invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| EngineError::Connect(format!("invalid value for header {}: {}", name, e)))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, EngineError> {
        let request = build_ws_request(endpoint)?;
        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| EngineError::Connect(e.to_string()))?;
        debug!(address = %endpoint.address, status = %response.status(), "websocket connected");

        let (sink, stream) = ws_stream.split();
        Ok(Link {
            sink: Box::new(WsSink { inner: sink }),
            stream: Box::new(WsSource { inner: stream }),
        })
    }
}

struct WsSink {
    inner: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl LinkSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), EngineError> {
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| EngineError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            debug!(error = %e, "websocket close returned an error");
        }
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl LinkStream for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, EngineError>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(m) => m,
                Err(e) => return Some(Err(EngineError::Link(e.to_string()))),
            };
            match message {
                WsMessage::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                WsMessage::Binary(bytes) => return Some(Ok(Frame::Binary(bytes.to_vec()))),
                WsMessage::Close(frame) => {
                    if let Some(frame) = frame {
                        warn!(code = %frame.code, reason = %frame.reason, "websocket closed by peer");
                    } else {
                        warn!("websocket closed by peer");
                    }
                    return None;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            }
        }
    }
}
