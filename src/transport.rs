//! Delivery of serialized payloads to the observer.

use std::future::Future;

use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::error::Error;

/// Connection lifecycle reported by a transport after it is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// Outbound half of the observer connection
pub trait Transport: Send {
    /// Send one text payload
    fn send(&mut self, payload: String) -> impl Future<Output = Result<(), Error>> + Send;

    /// Close the connection gracefully
    fn close(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Accept `host:port[/path]` as well as full `ws://` / `wss://` URLs
pub fn endpoint_url(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{}", endpoint)
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket client transport
pub struct WebSocketTransport {
    sink: WsSink,
    url: String,
}

impl WebSocketTransport {
    /// Connect to `endpoint`. Inbound traffic is read by a background task that
    /// logs text messages and reports close or error on the returned channel.
    pub async fn connect(
        endpoint: &str,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), Error> {
        let url = endpoint_url(endpoint);
        tracing::info!("Connecting to {}", url);

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to {}: {}", url, e)))?;
        tracing::info!("Connected to {}", url);

        let (sink, mut source) = stream.split();
        let (events_tx, events_rx) = mpsc::channel(4);

        tokio::spawn(async move {
            let event = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received from observer: {}", text);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => TransportEvent::Closed {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.into_owned(),
                            },
                            None => TransportEvent::Closed {
                                code: None,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break TransportEvent::Error(e.to_string()),
                    None => {
                        break TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        }
                    }
                }
            };
            let _ = events_tx.send(event).await;
        });

        Ok((Self { sink, url }, events_rx))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    async fn send(&mut self, payload: String) -> Result<(), Error> {
        self.sink
            .send(Message::Text(payload))
            .await
            .map_err(|e| Error::Transport(format!("send to {} failed: {}", self.url, e)))
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.sink
            .close()
            .await
            .map_err(|e| Error::Transport(format!("close of {} failed: {}", self.url, e)))
    }
}
