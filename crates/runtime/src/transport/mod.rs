//! Message-framed transports to the engine process.
//!
//! A transport is an ordered, bidirectional, message-framed byte channel. It
//! knows nothing about message semantics, only frame boundaries:
//!
//! - [`Transport::send`] writes one complete frame; frames are never split or
//!   merged.
//! - Inbound frames are forwarded, in arrival order, into the `message_rx`
//!   channel of [`TransportParts`]. The channel closing is the close signal
//!   and fires exactly once, whether the peer closed, the stream errored, or
//!   close was requested locally.
//!
//! Two framings are provided: [`PipeTransport`] (little-endian u32 length
//! prefix + JSON bytes, over any `AsyncRead`/`AsyncWrite` pair, typically the
//! child process stdio) and [`WebSocketTransport`] (message-oriented frames
//! over a socket handshake).

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{Error, Result};


/// Sender half of a transport. Object safe; writes one frame per call.
pub trait Transport: Send {
    /// Writes one complete frame. Must not be called after the transport has
    /// closed; such sends fail.
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>>;
}

/// Receiver half of a transport. Runs the read loop until the stream ends.
pub trait TransportReceiver: Send {
    /// Reads frames until EOF or error, forwarding each parsed message in
    /// arrival order. Returns `Ok(())` on clean peer close.
    fn run(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// The three pieces a connection needs: a boxed sender, a boxed receiver to
/// drive, and the channel on which inbound messages arrive. The channel
/// closes exactly once, when the read loop exits for any reason.
pub struct TransportParts {
    pub sender: Box<dyn Transport>,
    pub receiver: Box<dyn TransportReceiver>,
    pub message_rx: mpsc::UnboundedReceiver<Value>,
}

/// Length-prefixed JSON framing over a byte pipe.
///
/// Frame layout: `[length: u32 little-endian][JSON bytes]`.
pub struct PipeTransport<W, R> {
    sender: PipeTransportSender<W>,
    receiver: PipeTransportReceiver<R>,
}

impl<W, R> PipeTransport<W, R>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Creates a pipe transport over the given writer/reader pair. Returns
    /// the transport and the channel on which inbound messages arrive.
    pub fn new(writer: W, reader: R) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let transport = Self {
            sender: PipeTransportSender { writer },
            receiver: PipeTransportReceiver { reader, message_tx },
        };
        (transport, message_rx)
    }

    /// Splits into sender and receiver halves.
    pub fn into_parts(self) -> (PipeTransportSender<W>, PipeTransportReceiver<R>) {
        (self.sender, self.receiver)
    }

    /// Boxes the halves into [`TransportParts`] for a connection.
    pub fn into_transport_parts(self, message_rx: mpsc::UnboundedReceiver<Value>) -> TransportParts {
        TransportParts {
            sender: Box::new(self.sender),
            receiver: Box::new(self.receiver),
            message_rx,
        }
    }

    /// Runs the read loop without splitting. Convenience for tests and
    /// single-task callers.
    pub async fn run(&mut self) -> Result<()> {
        self.receiver.run_loop().await
    }
}

/// Writing half of a [`PipeTransport`].
pub struct PipeTransportSender<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> PipeTransportSender<W> {
    /// Writes one length-prefixed frame.
    pub async fn send(&mut self, message: Value) -> Result<()> {
        self.write_frame(message).await
    }

    async fn write_frame(&mut self, message: Value) -> Result<()> {
        let payload = serde_json::to_vec(&message)?;
        let length = payload.len() as u32;
        self.writer
            .write_all(&length.to_le_bytes())
            .await
            .map_err(|e| Error::TransportError(format!("Failed to write length prefix: {e}")))?;
        self.writer
            .write_all(&payload)
            .await
            .map_err(|e| Error::TransportError(format!("Failed to write frame body: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::TransportError(format!("Failed to flush frame: {e}")))?;
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> Transport for PipeTransportSender<W> {
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.write_frame(message))
    }
}

/// Reading half of a [`PipeTransport`].
pub struct PipeTransportReceiver<R> {
    reader: R,
    message_tx: mpsc::UnboundedSender<Value>,
}

impl<R: AsyncRead + Unpin + Send> PipeTransportReceiver<R> {
    /// Reads frames until EOF, error, or the consumer drops the message
    /// channel.
    pub async fn run(&mut self) -> Result<()> {
        self.run_loop().await
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            let mut len_buf = [0u8; 4];
            // A clean peer close lands exactly on a frame boundary; EOF in
            // the middle of a prefix is a framing error.
            let n = self
                .reader
                .read(&mut len_buf[..1])
                .await
                .map_err(|e| Error::TransportError(format!("Failed to read length prefix: {e}")))?;
            if n == 0 {
                return Ok(());
            }
            self.reader
                .read_exact(&mut len_buf[1..])
                .await
                .map_err(|e| Error::TransportError(format!("Failed to read length prefix: {e}")))?;

            let length = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; length];
            self.reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| Error::TransportError(format!("Failed to read frame body: {e}")))?;

            let message: Value = serde_json::from_slice(&payload)
                .map_err(|e| Error::TransportError(format!("Failed to parse frame: {e}")))?;

            if self.message_tx.send(message).is_err() {
                // Consumer is gone; stop reading.
                return Ok(());
            }
        }
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> TransportReceiver for PipeTransportReceiver<R> {
    fn run(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.run_loop())
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Message-oriented transport over a WebSocket connection.
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Connects to the endpoint the engine announced and returns transport
    /// parts ready for a connection.
    pub async fn connect(url: &str) -> Result<TransportParts> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::TransportError(format!("WebSocket connect failed: {e}")))?;
        let (sink, stream) = stream.split();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        Ok(TransportParts {
            sender: Box::new(WebSocketTransportSender { sink }),
            receiver: Box::new(WebSocketTransportReceiver { stream, message_tx }),
            message_rx,
        })
    }
}

/// Writing half of a [`WebSocketTransport`].
pub struct WebSocketTransportSender {
    sink: SplitSink<WsStream, WsMessage>,
}

impl Transport for WebSocketTransportSender {
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let text = serde_json::to_string(&message)?;
            self.sink
                .send(WsMessage::Text(text))
                .await
                .map_err(|e| Error::TransportError(format!("WebSocket send failed: {e}")))
        })
    }
}

/// Reading half of a [`WebSocketTransport`].
pub struct WebSocketTransportReceiver {
    stream: SplitStream<WsStream>,
    message_tx: mpsc::UnboundedSender<Value>,
}

impl TransportReceiver for WebSocketTransportReceiver {
    fn run(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            while let Some(frame) = self.stream.next().await {
                let frame = frame
                    .map_err(|e| Error::TransportError(format!("WebSocket read failed: {e}")))?;
                let message: Value = match frame {
                    WsMessage::Text(text) => serde_json::from_str(&text)
                        .map_err(|e| Error::TransportError(format!("Failed to parse frame: {e}")))?,
                    WsMessage::Binary(data) => serde_json::from_slice(&data)
                        .map_err(|e| Error::TransportError(format!("Failed to parse frame: {e}")))?,
                    WsMessage::Close(_) => return Ok(()),
                    // Ping/pong are handled by the library.
                    _ => continue,
                };
                if self.message_tx.send(message).is_err() {
                    return Ok(());
                }
            }
            Ok(())
        })
    }
}
