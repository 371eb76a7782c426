//! Serial port handles and the channel that owns them.

use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_core::Stream;
use futures_util::{StreamExt, stream};
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_serial::SerialStream;

use super::config::SerialConfig;
use super::decoder::read_chunks;
use crate::channel::Transcript;
use crate::error::{Result, TransportError};
use crate::registry::{ChannelRegistry, PortDescriptor};

/// Anything that can stand in for an open serial port.
pub trait DeviceStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DeviceStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed, type-erased open port.
pub type BoxedStream = Box<dyn DeviceStream>;

/// Opens physical ports. Injected so sessions can run against fakes.
pub trait PortOpener: Send + Sync {
    /// Open `port`. Must return [`TransportError::AlreadyOpen`] when the
    /// platform rejects the open because the port is in use.
    fn open(
        &self,
        port: &PortDescriptor,
        config: &SerialConfig,
    ) -> std::result::Result<BoxedStream, TransportError>;
}

/// Opens real serial ports through `tokio-serial`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOpener;

impl PortOpener for SystemOpener {
    fn open(
        &self,
        port: &PortDescriptor,
        config: &SerialConfig,
    ) -> std::result::Result<BoxedStream, TransportError> {
        let builder = config.port_builder(port.path());
        match SerialStream::open(&builder) {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) if is_busy(&e) => Err(TransportError::AlreadyOpen {
                port: port.to_string(),
            }),
            Err(source) => Err(TransportError::OpenFailed {
                port: port.to_string(),
                source,
            }),
        }
    }
}

/// Platforms report a port held elsewhere in different words.
fn is_busy(err: &tokio_serial::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("busy") || msg.contains("already open") || msg.contains("access is denied")
}

/// Lifecycle of a handle's read side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// The read loop is running.
    Open,
    /// The device side reached EOF.
    Eof,
    /// The read loop hit an I/O error.
    Failed(String),
    /// The handle was closed locally.
    Closed,
}

impl LinkState {
    /// Whether the read loop is still delivering text.
    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Open)
    }

    /// The transport error this state represents, if it is terminal.
    pub fn to_error(&self) -> Option<TransportError> {
        match self {
            LinkState::Open => None,
            LinkState::Eof => Some(TransportError::Disconnected),
            LinkState::Failed(msg) => Some(TransportError::ReadFailed(msg.clone())),
            LinkState::Closed => Some(TransportError::Closed),
        }
    }
}

/// Reference to one open port.
///
/// Clones share the same port. A background task decodes everything the
/// device prints into the handle's [`Transcript`]; it is the only writer
/// to that transcript and runs until [`close`](Self::close).
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    port: PortDescriptor,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    transcript: Arc<Transcript>,
    link: Arc<watch::Sender<LinkState>>,
    chunks: broadcast::Receiver<String>,
    reader: Mutex<Option<JoinHandle<()>>>,
    claimed: AtomicBool,
}

/// Decoded chunks buffered for each [`ChannelHandle::read`] stream.
const CHUNK_BACKLOG: usize = 64;

impl Drop for HandleInner {
    fn drop(&mut self) {
        let reader = self.reader.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = reader.take() {
            task.abort();
        }
    }
}

impl ChannelHandle {
    /// Wrap an open stream and start its read loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(port: PortDescriptor, stream: BoxedStream, transcript_capacity: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let transcript = Arc::new(Transcript::new(transcript_capacity));
        let (link, _) = watch::channel(LinkState::Open);
        let link = Arc::new(link);
        let (chunk_tx, chunks) = broadcast::channel(CHUNK_BACKLOG);

        let task = tokio::spawn(read_loop(
            port.clone(),
            read_half,
            transcript.clone(),
            link.clone(),
            chunk_tx,
        ));

        Self {
            inner: Arc::new(HandleInner {
                port,
                writer: tokio::sync::Mutex::new(Some(write_half)),
                transcript,
                link,
                chunks,
                reader: Mutex::new(Some(task)),
                claimed: AtomicBool::new(false),
            }),
        }
    }

    /// The port this handle is open on.
    pub fn port(&self) -> &PortDescriptor {
        &self.inner.port
    }

    /// The transcript fed by this handle's read loop.
    pub fn transcript(&self) -> Arc<Transcript> {
        self.inner.transcript.clone()
    }

    /// Decoded chunks as they arrive, from now until the read side stops.
    ///
    /// Text printed before the call is only in the transcript, and a stream
    /// that falls behind skips chunks rather than stalling the read loop.
    pub fn read(&self) -> impl Stream<Item = String> + Send + 'static {
        let port = self.inner.port.clone();
        stream::unfold(self.inner.chunks.resubscribe(), move |mut rx| {
            let port = port.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(chunk) => return Some((chunk, rx)),
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("{}: reader skipped {} chunks", port, skipped);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        })
    }

    /// Current read-side state.
    pub fn link_state(&self) -> LinkState {
        self.inner.link.borrow().clone()
    }

    /// Subscribe to read-side state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.inner.link.subscribe()
    }

    /// Open and still delivering text.
    pub fn is_readable(&self) -> bool {
        self.inner.link.borrow().is_open()
    }

    /// Whether both handles refer to the same open port.
    pub fn same_handle(&self, other: &ChannelHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Write raw bytes and flush.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(data).await.map_err(TransportError::Write)?;
        writer.flush().await.map_err(TransportError::Write)?;
        trace!("wrote {} bytes to {}", data.len(), self.inner.port);
        Ok(())
    }

    /// Close the port. Idempotent.
    ///
    /// Cancels the read loop and wakes every pending wait.
    pub async fn close(&self) {
        let first = self.inner.link.send_if_modified(|state| {
            if state.is_open() {
                *state = LinkState::Closed;
                true
            } else {
                false
            }
        });

        let task = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("shutdown of {} failed: {}", self.inner.port, e);
            }
            if first {
                info!("closed serial port {}", self.inner.port);
            }
        }
        self.release();
    }

    /// Claim exclusive use of this handle. Fails if someone else holds it.
    pub(crate) fn try_claim(&self) -> bool {
        self.inner
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give up the claim without closing the port.
    pub(crate) fn release(&self) {
        self.inner.claimed.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("port", &self.inner.port)
            .field("link", &*self.inner.link.borrow())
            .field("claimed", &self.inner.claimed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Decode everything the device prints into the transcript, in arrival order.
async fn read_loop(
    port: PortDescriptor,
    reader: ReadHalf<BoxedStream>,
    transcript: Arc<Transcript>,
    link: Arc<watch::Sender<LinkState>>,
    chunks: broadcast::Sender<String>,
) {
    let mut incoming = pin!(read_chunks(reader));
    let mut closed = link.subscribe();

    let end = loop {
        tokio::select! {
            _ = closed.wait_for(|state| !state.is_open()) => return,
            next = incoming.next() => match next {
                Some(Ok(text)) => {
                    trace!("{}: read {} bytes", port, text.len());
                    transcript.append(&text);
                    // No live readers is fine; the transcript has it
                    let _ = chunks.send(text);
                }
                Some(Err(e)) => {
                    warn!("read from {} failed: {}", port, e);
                    break LinkState::Failed(e.to_string());
                }
                None => {
                    debug!("{} reached EOF", port);
                    break LinkState::Eof;
                }
            }
        }
    };

    link.send_if_modified(|state| {
        if state.is_open() {
            *state = end;
            true
        } else {
            false
        }
    });
}

/// Transport channel: owns at most one open handle at a time.
///
/// Opening goes through the injected [`PortOpener`]. A port that is already
/// open is never reopened; it is adopted. Dropping the channel without
/// closing releases the claim but leaves the port open and adoptable.
pub struct SerialChannel {
    registry: Arc<ChannelRegistry>,
    opener: Arc<dyn PortOpener>,
    config: SerialConfig,
    transcript_capacity: usize,
    handle: Option<ChannelHandle>,
}

impl SerialChannel {
    /// Create a channel that opens ports with `opener`.
    pub fn new(
        registry: Arc<ChannelRegistry>,
        opener: Arc<dyn PortOpener>,
        config: SerialConfig,
        transcript_capacity: usize,
    ) -> Self {
        Self {
            registry,
            opener,
            config,
            transcript_capacity,
            handle: None,
        }
    }

    /// Open `port`, or the registry's selection when `None`.
    ///
    /// If this channel already holds a readable handle for the requested
    /// port (or any port, when none is requested) that handle is returned
    /// as-is.
    pub async fn open(&mut self, port: Option<&PortDescriptor>) -> Result<ChannelHandle> {
        if let Some(handle) = &self.handle {
            if handle.is_readable() && port.is_none_or(|p| p == handle.port()) {
                debug!("reusing open handle on {}", handle.port());
                return Ok(handle.clone());
            }
            self.close().await;
        }

        let port = match port {
            Some(port) => port.clone(),
            None => self
                .registry
                .selected()
                .ok_or(TransportError::NoChannelSelected)?,
        };

        let handle = match self.opener.open(&port, &self.config) {
            Ok(stream) => {
                let handle = ChannelHandle::start(port.clone(), stream, self.transcript_capacity);
                handle.try_claim();
                self.registry.attach(&handle);
                info!("opened serial port {} at {} baud", port, self.config.baud_rate);
                handle
            }
            Err(TransportError::AlreadyOpen { .. }) => {
                let handle = self
                    .registry
                    .find_adoptable(&port)
                    .ok_or_else(|| TransportError::Busy {
                        port: port.to_string(),
                    })?;
                if handle.port() != &port {
                    warn!("{} is busy, adopting open handle on {}", port, handle.port());
                } else {
                    info!("adopted already-open serial port {}", port);
                }
                handle
            }
            Err(e) => return Err(e.into()),
        };

        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// The currently held handle, if any.
    pub fn handle(&self) -> Option<&ChannelHandle> {
        self.handle.as_ref()
    }

    /// Write raw bytes to the open handle.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        match &self.handle {
            Some(handle) => handle.write(data).await,
            None => Err(TransportError::Closed.into()),
        }
    }

    /// Close the held handle, if any. Idempotent.
    pub async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close().await;
            self.registry.detach(&handle);
        }
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }
}
