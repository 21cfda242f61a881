use crate::error::{ComfoError, Result};
use crate::types::UnitDescriptor;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Size of the big-endian length prefix in front of every frame
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Upper bound for a single frame body
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Reassembles length-prefixed frames from arbitrary read boundaries
///
/// A frame is only handed out once its whole body has been buffered.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the socket
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Take the next complete frame body, if one is buffered
    ///
    /// An oversized length prefix is an error: the stream cannot resync after it.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > MAX_FRAME_LEN {
            return Err(ComfoError::Decode(format!(
                "frame of {} bytes exceeds limit of {}",
                len, MAX_FRAME_LEN
            )));
        }

        let total = LENGTH_PREFIX_LEN + len;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Prefix a frame body with its length
pub fn encode_frame(body: &[u8]) -> Result<Bytes> {
    if body.len() > MAX_FRAME_LEN {
        return Err(ComfoError::Decode(format!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame.freeze())
}

/// Lazy sequence of frame bodies received on a connection
///
/// Ends once the link is gone; the last item carries the reason.
pub struct Frames {
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
}

impl Frames {
    /// Receive the next frame
    pub async fn next_frame(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await
    }
}

impl Stream for Frames {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Framed TCP link to a ventilation unit
pub struct Connection {
    peer: String,
    out_tx: Option<mpsc::UnboundedSender<Bytes>>,
    frames: Option<Frames>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl Connection {
    /// Open a TCP connection to the unit
    pub async fn connect(unit: &UnitDescriptor, connect_timeout: Duration) -> Result<Self> {
        let address = unit.socket_address();
        tracing::info!("Connecting to {}", address);

        let stream = match timeout(connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ComfoError::Connect(format!("{}: {}", address, e))),
            Err(_) => {
                return Err(ComfoError::Connect(format!(
                    "{}: no answer within {:?}",
                    address, connect_timeout
                )))
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not disable Nagle on {}: {}", address, e);
        }

        Ok(Self::from_stream(stream, address))
    }

    /// Run the framing tasks over an already connected stream
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = peer.into();
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Result<Bytes>>();

        // Forward outgoing frames to the socket
        let writer_peer = peer.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    tracing::error!("Failed to send frame to {}: {}", writer_peer, e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Read the socket and surface complete frames
        let reader_peer = peer.clone();
        let reader = tokio::spawn(async move {
            let mut buffer = FrameBuffer::new();
            loop {
                match read_half.read_buf(buffer.buffer_mut()).await {
                    Ok(0) => {
                        tracing::info!("Connection to {} closed by peer", reader_peer);
                        let _ = frames_tx.send(Err(ComfoError::ConnectionClosed));
                        break;
                    }
                    Ok(n) => {
                        tracing::trace!(bytes = n, buffered = buffer.buffered(), "Read from {}", reader_peer);
                        loop {
                            match buffer.next_frame() {
                                Ok(Some(frame)) => {
                                    if frames_tx.send(Ok(frame)).is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::error!("Unrecoverable framing error from {}: {}", reader_peer, e);
                                    let _ = frames_tx.send(Err(e));
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("Read error from {}: {}", reader_peer, e);
                        let _ = frames_tx.send(Err(e.into()));
                        break;
                    }
                }
            }
        });

        Self {
            peer,
            out_tx: Some(out_tx),
            frames: Some(Frames { rx: frames_rx }),
            reader,
            writer: Some(writer),
        }
    }

    /// Peer address this connection talks to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a frame body for sending
    pub fn send(&self, body: &[u8]) -> Result<()> {
        let frame = encode_frame(body)?;
        self.out_tx
            .as_ref()
            .ok_or(ComfoError::ConnectionClosed)?
            .send(frame)
            .map_err(|_| ComfoError::ConnectionClosed)
    }

    /// Take the incoming frame sequence
    ///
    /// Can only be taken once per connection.
    pub fn frames(&mut self) -> Result<Frames> {
        self.frames.take().ok_or_else(|| {
            ComfoError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "frame sequence already taken",
            ))
        })
    }

    /// Whether either direction of the link has stopped
    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
            || self.out_tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Flush queued frames and shut the link down
    pub async fn close(mut self) {
        tracing::debug!("Closing connection to {}", self.peer);
        self.out_tx.take();
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            let _ = timeout(CLOSE_GRACE, writer).await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = &self.writer {
            writer.abort();
        }
    }
}
