//! Feed listener owning the WebSocket connection
//!
//! Connects, subscribes to the depth channel, and forwards every decoded diff
//! batch into a bounded channel. A full channel blocks the read loop instead
//! of dropping batches. A close initiated by our own shutdown is a normal
//! termination; everything else is a fatal stream error.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::messages::{DiffBatch, StreamMessage, SubscribeRequest};
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsResult = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>;

/// Listener for one combined-stream connection
pub struct FeedListener {
    stream: Option<WsStream>,
    endpoint: String,
    channel: String,
    next_id: u64,
    closing: bool,
}

impl FeedListener {
    pub fn new(endpoint: &str, channel: &str) -> Self {
        Self {
            stream: None,
            endpoint: endpoint.to_string(),
            channel: channel.to_string(),
            next_id: 0,
            closing: false,
        }
    }

    /// Connect and subscribe to the depth channel
    pub async fn connect(&mut self) -> Result<()> {
        let url = format!("{}/stream", self.endpoint);
        info!(url = %url, "Connecting to depth feed");

        let (mut ws_stream, response) = connect_async(&url)
            .await
            .map_err(|e| Error::Connection(format!("failed to connect to {url}: {e}")))?;
        info!(status = ?response.status(), "Feed connected");

        self.next_id += 1;
        let request = SubscribeRequest::new(self.next_id, &self.channel);
        let payload = serde_json::to_string(&request)?;
        ws_stream
            .send(Message::Text(payload))
            .await
            .map_err(|e| Error::Connection(format!("failed to send subscription: {e}")))?;
        info!(channel = %self.channel, "Subscribed to depth channel");

        self.stream = Some(ws_stream);
        Ok(())
    }

    /// Read frames until shutdown, a close request, or a fatal error.
    ///
    /// Decoded batches go out through `batch_tx` with backpressure. `close_rx`
    /// lets the service request a protocol-level clean close during shutdown.
    pub async fn run(
        &mut self,
        batch_tx: mpsc::Sender<DiffBatch>,
        mut close_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| Error::Connection("not connected".to_string()))?;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.send_close(&mut stream).await;
                    return Ok(());
                }
                _ = close_rx.recv(), if !self.closing => {
                    self.send_close(&mut stream).await;
                    // Keep reading; the peer acknowledges with a close frame.
                }
                frame = stream.next() => {
                    if self.handle_frame(&mut stream, frame, &batch_tx).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `Ok(true)` when the connection terminated normally
    async fn handle_frame<S>(
        &mut self,
        stream: &mut WebSocketStream<S>,
        frame: Option<WsResult>,
        batch_tx: &mpsc::Sender<DiffBatch>,
    ) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match frame {
            Some(Ok(Message::Text(text))) => {
                let msg: StreamMessage = serde_json::from_str(&text)?;
                if let Some(batch) = msg.data {
                    debug!(
                        first = batch.first_update_id,
                        last = batch.final_update_id,
                        "Diff batch received"
                    );
                    if batch_tx.send(batch).await.is_err() {
                        return Err(Error::ChannelClosed("diff-batch"));
                    }
                }
                Ok(false)
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = stream.send(Message::Pong(data)).await;
                Ok(false)
            }
            Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => Ok(false),
            Some(Ok(Message::Close(frame))) => {
                if self.closing {
                    info!("Feed closed cleanly");
                    Ok(true)
                } else {
                    Err(Error::StreamRead(format!(
                        "connection closed by peer: {frame:?}"
                    )))
                }
            }
            Some(Err(e)) => {
                if self.closing {
                    // The peer may drop the socket instead of answering our
                    // close frame; shutdown was already requested.
                    Ok(true)
                } else {
                    Err(Error::StreamRead(e.to_string()))
                }
            }
            None => {
                if self.closing {
                    Ok(true)
                } else {
                    Err(Error::StreamRead("stream ended".to_string()))
                }
            }
        }
    }

    /// Best-effort protocol-level clean close
    async fn send_close<S>(&mut self, stream: &mut WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.closing = true;
        if let Err(e) = stream.close(None).await {
            warn!(error = %e, "Failed to send close frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client, server) = tokio::io::duplex(4096);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (client, server)
    }

    fn listener() -> FeedListener {
        FeedListener::new("ws://unused", "btcusdt@depth@100ms")
    }

    #[tokio::test]
    async fn test_peer_close_is_fatal() {
        let (mut client, mut server) = ws_pair().await;
        server.close(None).await.unwrap();

        let mut listener = listener();
        let (batch_tx, _batch_rx) = mpsc::channel(8);

        let frame = client.next().await;
        let result = listener.handle_frame(&mut client, frame, &batch_tx).await;
        assert!(matches!(result, Err(Error::StreamRead(_))));
    }

    #[tokio::test]
    async fn test_close_after_own_close_request_is_normal() {
        let (mut client, mut server) = ws_pair().await;

        let mut listener = listener();
        listener.send_close(&mut client).await;

        // The peer reads our close frame; its protocol layer answers it.
        assert!(matches!(server.next().await, Some(Ok(Message::Close(_)))));
        let _ = server.next().await;

        let (batch_tx, _batch_rx) = mpsc::channel(8);
        let frame = client.next().await;
        let done = listener
            .handle_frame(&mut client, frame, &batch_tx)
            .await
            .unwrap();
        assert!(done);
    }

    #[tokio::test]
    async fn test_stream_end_without_close_request_is_fatal() {
        let (mut client, server) = ws_pair().await;
        drop(server);

        let mut listener = listener();
        let (batch_tx, _batch_rx) = mpsc::channel(8);

        let frame = client.next().await;
        let result = listener.handle_frame(&mut client, frame, &batch_tx).await;
        assert!(matches!(result, Err(Error::StreamRead(_))));
    }

    #[tokio::test]
    async fn test_text_frames_forward_diff_batches() {
        let (mut client, mut server) = ws_pair().await;
        let payload = r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","E":1700000000000,"U":10,"u":12,"b":[["100.1","1.5"]],"a":[["100.2","0.7"]]}}"#;
        server
            .send(Message::Text(payload.to_string()))
            .await
            .unwrap();

        let mut listener = listener();
        let (batch_tx, mut batch_rx) = mpsc::channel(8);

        let frame = client.next().await;
        let done = listener
            .handle_frame(&mut client, frame, &batch_tx)
            .await
            .unwrap();
        assert!(!done);

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.first_update_id, 10);
        assert_eq!(batch.final_update_id, 12);
        assert_eq!(batch.bids.len(), 1);
        assert_eq!(batch.asks.len(), 1);
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let (mut client, mut server) = ws_pair().await;
        server.send(Message::Ping(vec![1, 2, 3])).await.unwrap();

        let mut listener = listener();
        let (batch_tx, _batch_rx) = mpsc::channel(8);

        let frame = client.next().await;
        let done = listener
            .handle_frame(&mut client, frame, &batch_tx)
            .await
            .unwrap();
        assert!(!done);

        assert!(matches!(
            server.next().await,
            Some(Ok(Message::Pong(data))) if data == vec![1, 2, 3]
        ));
    }
}
