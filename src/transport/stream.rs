//! Channel over any async byte stream pair.
//!
//! # Architecture
//!
//! ```text
//! send() ─► mpsc::UnboundedSender<Bytes> ─► Writer Task ─► AsyncWrite
//!
//! AsyncRead ─► Reader Task ─► FrameBuffer ─► MsgPack ─► EventHub ─► subscribers
//! ```
//!
//! Both tasks are spawned on construction, so a `StreamChannel` must be
//! created from inside a tokio runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::frame_buffer::{encode_frame, FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
use crate::channel::{Channel, ChannelEvent, EventHub, Subscription};
use crate::codec::MsgPackCodec;
use crate::error::TransportError;

/// Default read buffer size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum frames to batch in a single write pass.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for a [`StreamChannel`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Largest accepted inbound frame payload.
    pub max_frame_size: u32,
    /// Size of the reader's scratch buffer.
    pub read_buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Framed MsgPack channel over a reader/writer pair.
///
/// Starts connected. `disconnect()` closes the write half once queued frames
/// are flushed; it cannot be reopened. EOF on the read half marks the
/// channel disconnected and ends every subscription.
pub struct StreamChannel {
    hub: Arc<EventHub>,
    writer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    connected: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamChannel {
    /// Create a channel with default configuration.
    pub fn new<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_config(reader, writer, StreamConfig::default())
    }

    pub fn with_config<R, W>(reader: R, writer: W, config: StreamConfig) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let hub = Arc::new(EventHub::new());
        let connected = Arc::new(AtomicBool::new(true));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(rx, writer, hub.clone(), connected.clone()));

        let reader_task = tokio::spawn(reader_loop(
            reader,
            FrameBuffer::with_max_frame_size(config.max_frame_size),
            config.read_buffer_size,
            hub.clone(),
            connected.clone(),
        ));

        Arc::new(Self {
            hub,
            writer: Mutex::new(Some(tx)),
            connected,
            reader_task: Mutex::new(Some(reader_task)),
        })
    }

    /// Channel over this process's stdin/stdout.
    ///
    /// This is the child side of [`fork`](super::fork). Nothing else may
    /// write to stdout; send logs to stderr.
    pub fn stdio() -> Arc<Self> {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Channel for StreamChannel {
    fn send(&self, message: Value) -> Result<(), TransportError> {
        let payload = MsgPackCodec::encode(&message).map_err(TransportError::from)?;
        let frame = encode_frame(&payload).map_err(TransportError::from)?;

        let writer = self.writer.lock();
        let tx = writer.as_ref().ok_or(TransportError::ChannelClosed)?;
        tx.send(frame).map_err(|_| TransportError::ChannelClosed)
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn connect(&self) {
        if self.writer.lock().is_some() {
            self.connected.store(true, Ordering::Release);
        } else {
            tracing::debug!("stream channel cannot reconnect after disconnect");
        }
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        // Dropping the sender lets the writer task flush and shut down.
        self.writer.lock().take();
    }

    fn destroy(&self) {
        self.disconnect();
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.hub.close();
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: W,
    hub: Arc<EventHub>,
    connected: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            connected.store(false, Ordering::Release);
            let error = TransportError::from(e);
            tracing::warn!(%error, "stream write failed");
            hub.emit(ChannelEvent::Error(error));
            return;
        }
    }

    // All senders gone: clean shutdown of the write half.
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "stream shutdown failed");
    }
}

async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for frame in batch {
        writer.write_all(frame).await?;
    }
    writer.flush().await
}

async fn reader_loop<R>(
    mut reader: R,
    mut frames: FrameBuffer,
    read_buffer_size: usize,
    hub: Arc<EventHub>,
    connected: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; read_buffer_size];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                hub.emit(ChannelEvent::Error(e.into()));
                break;
            }
        };

        let payloads = match frames.push(&buf[..n]) {
            Ok(payloads) => payloads,
            Err(e) => {
                hub.emit(ChannelEvent::Error(e.into()));
                break;
            }
        };

        for payload in payloads {
            match MsgPackCodec::decode::<Value>(&payload) {
                Ok(value) => {
                    hub.emit(ChannelEvent::Message(value));
                }
                Err(e) => {
                    hub.emit(ChannelEvent::Error(TransportError::Codec(e.to_string())));
                }
            }
        }
    }

    if !frames.is_empty() {
        let error = TransportError::Protocol(format!(
            "stream ended inside a frame, {} bytes dropped",
            frames.len()
        ));
        tracing::warn!(%error, "stream channel truncated");
        hub.emit(ChannelEvent::Error(error));
    }

    tracing::debug!("stream channel read half closed");
    connected.store(false, Ordering::Release);
    hub.close();
}
