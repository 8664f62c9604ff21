//! Stdio multiplexer.
//!
//! [`Mux`] carries any number of logical channels over one byte stream
//! (typically a child process's stdin/stdout). Channel state lives in an
//! arena keyed by channel ID; one task reads frames and dispatches them,
//! one task writes queued frames.
//!
//! Channel 0 is the control channel and exists on both ends from the start.
//! The [`Role::Initiator`] (the side that spawned the hop) allocates odd IDs,
//! the [`Role::Acceptor`] allocates even IDs.
//!
//! Each channel has its own send window: a writer may have at most
//! [`INITIAL_WINDOW`] unconsumed bytes in flight, and the reader grants more
//! as it consumes data. A stalled channel therefore never blocks the others.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, trace, warn};

use crate::frame::{read_frame, write_frame, Frame, FrameKind};
use crate::{channels, decode_message, encode_message, DecodeError};

/// ID of the control channel.
pub const CONTROL_CHANNEL: u32 = 0;

/// Bytes a writer may have in flight per channel before the reader acks.
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Largest data frame the mux emits.
const MAX_CHUNK: usize = 32 * 1024;

/// Frames queued for the writer task.
const OUTBOUND_QUEUE: usize = 64;

/// Which end of the hop this mux sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that spawned the peer process.
    Initiator,
    /// The spawned side.
    Acceptor,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        }
    }
}

/// Multiplexer errors.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("transport closed")]
    TransportClosed,

    #[error("channel {0} closed")]
    ChannelClosed(u32),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct Slot {
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    window: Arc<Semaphore>,
}

struct Shared {
    outbound: mpsc::Sender<Frame>,
    slots: Mutex<HashMap<u32, Slot>>,
    next_id: AtomicU32,
    closed: watch::Sender<bool>,
    /// Set once the write loop has flushed and closed the writer.
    flushed: watch::Sender<bool>,
}

impl Shared {
    fn register(&self, id: u32) -> (mpsc::UnboundedReceiver<Vec<u8>>, Arc<Semaphore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let window = Arc::new(Semaphore::new(INITIAL_WINDOW as usize));
        self.slots.lock().insert(
            id,
            Slot {
                inbound: tx,
                window: window.clone(),
            },
        );
        (rx, window)
    }

    /// Drop local channel state. Returns true if the channel was still open.
    fn release(&self, id: u32) -> bool {
        match self.slots.lock().remove(&id) {
            Some(slot) => {
                slot.window.close();
                true
            }
            None => false,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn shutdown(&self) {
        self.closed.send_replace(true);
        let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            slot.window.close();
        }
    }
}

fn make_channel(shared: &Arc<Shared>, id: u32, kind: String) -> Channel {
    let (inbound, window) = shared.register(id);
    Channel {
        kind,
        reader: ChannelReader {
            id,
            inbound,
            shared: shared.clone(),
        },
        writer: ChannelWriter {
            id,
            window,
            shared: shared.clone(),
        },
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// A multiplexed session over one byte stream.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Mux {
    shared: Arc<Shared>,
    incoming: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Channel>>>,
}

impl Mux {
    /// Start multiplexing over `reader`/`writer`.
    ///
    /// Returns the session handle and the control channel. Must be called
    /// from within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, role: Role) -> (Mux, Channel)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, frames) = mpsc::channel(OUTBOUND_QUEUE);
        let (closed, _) = watch::channel(false);
        let (flushed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            outbound,
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(role.first_id()),
            closed,
            flushed,
        });

        let control = make_channel(&shared, CONTROL_CHANNEL, channels::CONTROL.to_string());
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(writer, frames, shared.clone()));
        tokio::spawn(read_loop(reader, shared.clone(), incoming_tx));

        let mux = Mux {
            shared,
            incoming: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
        };
        (mux, control)
    }

    /// Open a new channel of the given kind.
    pub async fn open(&self, kind: &str) -> Result<Channel, MuxError> {
        if self.shared.is_closed() {
            return Err(MuxError::TransportClosed);
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let channel = make_channel(&self.shared, id, kind.to_string());
        self.shared
            .outbound
            .send(Frame::open(id, kind))
            .await
            .map_err(|_| MuxError::TransportClosed)?;

        debug!(channel = id, kind = %kind, "opened channel");
        Ok(channel)
    }

    /// Wait for the peer to open a channel.
    ///
    /// Returns `None` once the transport is closed.
    pub async fn accept(&self) -> Option<Channel> {
        self.incoming.lock().await.recv().await
    }

    /// Resolve once the transport is closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        wait_closed(&mut rx).await;
    }

    /// Whether the transport is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close the transport. Pending reads end and writes fail.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Close the transport and wait until frames queued before the close
    /// have been written out.
    pub async fn finish(&self) {
        let mut flushed = self.shared.flushed.subscribe();
        self.shared.shutdown();
        wait_closed(&mut flushed).await;
    }

    /// Number of channels currently open on this end.
    pub fn open_channels(&self) -> usize {
        self.shared.slots.lock().len()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
) {
    let mut closed = shared.closed.subscribe();

    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!(error = %e, "transport write failed");
                    shared.shutdown();
                    break;
                }
            }
            _ = wait_closed(&mut closed) => {
                // flush what was queued before the close
                while let Ok(frame) = frames.try_recv() {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    shared.flushed.send_replace(true);
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    shared: Arc<Shared>,
    incoming: mpsc::UnboundedSender<Channel>,
) {
    let mut closed = shared.closed.subscribe();

    loop {
        let result = tokio::select! {
            result = read_frame(&mut reader) => result,
            _ = wait_closed(&mut closed) => break,
        };

        match result {
            Ok(Some(frame)) => dispatch(&shared, &incoming, frame),
            Ok(None) => {
                debug!("transport reached end of stream");
                break;
            }
            Err(e) => {
                warn!(error = %e, "transport failed");
                break;
            }
        }
    }

    shared.shutdown();
}

fn dispatch(shared: &Arc<Shared>, incoming: &mpsc::UnboundedSender<Channel>, frame: Frame) {
    match frame.kind {
        FrameKind::Open => {
            let channel = make_channel(shared, frame.channel, frame.label());
            debug!(channel = frame.channel, kind = %channel.kind, "peer opened channel");
            // if nobody accepts, dropping the channel closes it again
            let _ = incoming.send(channel);
        }
        FrameKind::Data => {
            let slots = shared.slots.lock();
            match slots.get(&frame.channel) {
                Some(slot) => {
                    let _ = slot.inbound.send(frame.payload);
                }
                None => trace!(channel = frame.channel, "dropping data for unknown channel"),
            }
        }
        FrameKind::Close => {
            if shared.release(frame.channel) {
                debug!(channel = frame.channel, "peer closed channel");
            }
        }
        FrameKind::Window => {
            if let Some(increment) = frame.window_increment() {
                if let Some(slot) = shared.slots.lock().get(&frame.channel) {
                    slot.window.add_permits(increment as usize);
                }
            }
        }
    }
}

/// One logical channel.
pub struct Channel {
    kind: String,
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl Channel {
    /// Channel ID.
    pub fn id(&self) -> u32 {
        self.writer.id
    }

    /// Channel kind announced when it was opened.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Read the next chunk. `None` once the channel is closed.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.reader.read().await
    }

    /// Write bytes, waiting for send window as needed.
    pub async fn write(&self, data: &[u8]) -> Result<(), MuxError> {
        self.writer.write(data).await
    }

    /// Close the channel on both ends.
    pub async fn close(&self) {
        self.writer.close().await
    }

    /// Split into independently owned halves.
    ///
    /// Dropping the writer half closes the channel.
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Receiving half of a channel.
pub struct ChannelReader {
    id: u32,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
}

impl ChannelReader {
    /// Read the next chunk and grant the peer the consumed window back.
    ///
    /// Cancel safe: a chunk is either returned or left queued.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        let chunk = self.inbound.recv().await?;
        if !chunk.is_empty() && !self.shared.is_closed() {
            enqueue(&self.shared, Frame::window(self.id, chunk.len() as u32));
        }
        Some(chunk)
    }
}

/// Queue a frame without waiting; overflow is handed to a task.
fn enqueue(shared: &Shared, frame: Frame) {
    if let Err(TrySendError::Full(frame)) = shared.outbound.try_send(frame) {
        let outbound = shared.outbound.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = outbound.send(frame).await;
            });
        }
    }
}

/// Sending half of a channel.
pub struct ChannelWriter {
    id: u32,
    window: Arc<Semaphore>,
    shared: Arc<Shared>,
}

impl ChannelWriter {
    /// Write bytes in window-sized chunks.
    pub async fn write(&self, data: &[u8]) -> Result<(), MuxError> {
        for chunk in data.chunks(MAX_CHUNK) {
            let permit = self
                .window
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| self.closed_error())?;
            permit.forget();

            self.shared
                .outbound
                .send(Frame::data(self.id, chunk.to_vec()))
                .await
                .map_err(|_| MuxError::TransportClosed)?;
        }
        Ok(())
    }

    /// Close the channel. Idempotent.
    pub async fn close(&self) {
        if self.shared.release(self.id) {
            let _ = self.shared.outbound.send(Frame::close(self.id)).await;
        }
    }

    fn closed_error(&self) -> MuxError {
        if self.shared.is_closed() {
            MuxError::TransportClosed
        } else {
            MuxError::ChannelClosed(self.id)
        }
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        if self.shared.release(self.id) {
            enqueue(&self.shared, Frame::close(self.id));
        }
    }
}

/// Typed, length-prefixed JSON messages over a channel.
pub struct MessageChannel {
    channel: Channel,
    buf: Vec<u8>,
}

impl MessageChannel {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            buf: Vec::new(),
        }
    }

    /// Send one message.
    pub async fn send<T: Serialize>(&self, msg: &T) -> Result<(), MuxError> {
        let data = encode_message(msg)?;
        self.channel.write(&data).await
    }

    /// Receive one message. `Ok(None)` on a clean close.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, MuxError> {
        loop {
            if let Some((msg, used)) = decode_message::<T>(&self.buf)? {
                self.buf.drain(..used);
                return Ok(Some(msg));
            }

            match self.channel.read().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None if self.buf.is_empty() => return Ok(None),
                None => return Err(DecodeError::Truncated.into()),
            }
        }
    }

    /// Close the underlying channel.
    pub async fn close(&self) {
        self.channel.close().await
    }

    /// Channel ID.
    pub fn id(&self) -> u32 {
        self.channel.id()
    }
}

/// Bridge a channel to a byte stream pair until either side ends.
///
/// Data read from the channel goes to `output`; data read from `input` goes
/// to the channel. The channel is closed on return.
pub async fn bridge<R, W>(channel: Channel, mut input: R, mut output: W) -> Result<(), MuxError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut rx, tx) = channel.split();

    let inbound = async {
        while let Some(chunk) = rx.read().await {
            output.write_all(&chunk).await?;
            output.flush().await?;
        }
        Ok::<(), MuxError>(())
    };

    let outbound = async {
        let mut buf = vec![0u8; MAX_CHUNK];
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), MuxError>(());
            }
            tx.write(&buf[..n]).await?;
        }
    };

    let result = tokio::select! {
        r = inbound => r,
        r = outbound => r,
    };
    tx.close().await;
    result
}

/// Relay two channels into each other until either side closes.
pub async fn relay(a: Channel, b: Channel) {
    let (a_id, b_id) = (a.id(), b.id());
    let (mut a_rx, a_tx) = a.split();
    let (mut b_rx, b_tx) = b.split();

    let forward = async {
        while let Some(chunk) = a_rx.read().await {
            if b_tx.write(&chunk).await.is_err() {
                break;
            }
        }
    };
    let backward = async {
        while let Some(chunk) = b_rx.read().await {
            if a_tx.write(&chunk).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = forward => {}
        _ = backward => {}
    }

    a_tx.close().await;
    b_tx.close().await;
    trace!(a = a_id, b = b_id, "relay finished");
}
