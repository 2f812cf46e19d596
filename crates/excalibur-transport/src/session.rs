//! Stream multiplexing over one framed connection
//!
//! A session owns the connection. Two tasks drive it: a writer draining an
//! outbound frame channel, and a reader dispatching inbound frames to
//! streams. Every logical stream is exposed as one half of an in-memory
//! duplex pipe, so callers use plain `AsyncRead`/`AsyncWrite`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{Frame, FrameCodec, FrameKind, Result, TransportError};

/// Byte stream carried through the tunnel
pub type TunnelStream = DuplexStream;

const OUTBOUND_BUFFER: usize = 256;
const STREAM_BUFFER: usize = 64;
const DIAL_BUFFER: usize = 64;
const PIPE_CAPACITY: usize = 64 * 1024;
const READ_CHUNK: usize = 32 * 1024;

/// Which end of the tunnel this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Hub side; allocates odd stream ids
    Hub,
    /// Agent side; allocates even stream ids
    Agent,
}

impl Role {
    fn first_stream_id(self) -> u64 {
        match self {
            Self::Hub => 1,
            Self::Agent => 2,
        }
    }
}

/// Keepalive behaviour
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Send a ping this often; `None` disables pinging
    pub ping_interval: Option<Duration>,
    /// Close the session when nothing arrives for this long
    pub idle_timeout: Duration,
}

impl SessionConfig {
    /// Pinging side: ping every `interval`, give up after `interval + timeout`
    pub fn pinging(interval: Duration, timeout: Duration) -> Self {
        Self {
            ping_interval: Some(interval),
            idle_timeout: interval + timeout,
        }
    }

    /// Passive side: answer pings, give up after `idle_timeout` of silence
    pub fn passive(idle_timeout: Duration) -> Self {
        Self {
            ping_interval: None,
            idle_timeout,
        }
    }
}

struct Shared {
    next_id: AtomicU64,
    outbound: mpsc::Sender<Frame>,
    streams: DashMap<u64, mpsc::Sender<Bytes>>,
    pending: DashMap<u64, oneshot::Sender<std::result::Result<(), String>>>,
    closed: CancellationToken,
}

impl Shared {
    fn shutdown(&self) {
        self.closed.cancel();
        self.streams.clear();
        self.pending.clear();
    }
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Ask the peer to connect to `target` and return the resulting stream
    pub async fn open(&self, target: &str, timeout: Duration) -> Result<TunnelStream> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
        let (ack_tx, ack_rx) = oneshot::channel();
        shared.streams.insert(id, data_tx);
        shared.pending.insert(id, ack_tx);

        let forget = || {
            shared.streams.remove(&id);
            shared.pending.remove(&id);
        };

        if shared.outbound.send(Frame::dial(id, target)).await.is_err() {
            forget();
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(stream = id, target = %target, "Stream opened");
                Ok(spawn_stream(Arc::clone(shared), id, data_rx))
            }
            Ok(Ok(Err(reason))) => {
                forget();
                Err(TransportError::DialFailed {
                    target: target.to_string(),
                    reason,
                })
            }
            Ok(Err(_)) => {
                forget();
                Err(TransportError::Closed)
            }
            Err(_) => {
                forget();
                let _ = shared.outbound.try_send(Frame::close(id));
                Err(TransportError::DialFailed {
                    target: target.to_string(),
                    reason: format!("no answer within {:?}", timeout),
                })
            }
        }
    }

    /// Close the session and every stream on it
    pub fn close(&self) {
        self.shared.shutdown();
    }

    /// Whether the session has shut down
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the session has shut down
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Number of open streams
    pub fn stream_count(&self) -> usize {
        self.shared.streams.len()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("streams", &self.stream_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A stream the peer asked this side to open
pub struct DialRequest {
    stream_id: u64,
    target: String,
    shared: Arc<Shared>,
}

impl DialRequest {
    /// Stream id chosen by the peer
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// `host:port` the peer wants reached
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Confirm the dial and return the stream
    pub async fn accept(self) -> Result<TunnelStream> {
        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
        self.shared.streams.insert(self.stream_id, data_tx);
        if self
            .shared
            .outbound
            .send(Frame::dial_ack(self.stream_id, None))
            .await
            .is_err()
        {
            self.shared.streams.remove(&self.stream_id);
            return Err(TransportError::Closed);
        }
        Ok(spawn_stream(self.shared, self.stream_id, data_rx))
    }

    /// Refuse the dial with `reason`
    pub async fn reject(self, reason: &str) {
        let _ = self
            .shared
            .outbound
            .send(Frame::dial_ack(self.stream_id, Some(reason)))
            .await;
    }
}

/// A running session
pub struct Session {
    /// Handle for opening and closing streams
    pub handle: SessionHandle,
    /// Dials requested by the peer
    pub dials: mpsc::Receiver<DialRequest>,
    /// Completes when the session ends, with the reason it ended
    pub task: JoinHandle<Result<()>>,
}

/// Start multiplexing over `framed`
///
/// The session ends when the peer disconnects, the keepalive expires, the
/// handle is closed or `stop` fires.
pub fn spawn_session<T>(
    framed: Framed<T, FrameCodec>,
    role: Role,
    config: SessionConfig,
    stop: CancellationToken,
) -> Session
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (dial_tx, dials) = mpsc::channel(DIAL_BUFFER);
    let shared = Arc::new(Shared {
        next_id: AtomicU64::new(role.first_stream_id()),
        outbound,
        streams: DashMap::new(),
        pending: DashMap::new(),
        closed: stop.child_token(),
    });

    let (sink, stream) = framed.split();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, shared.closed.clone()));
    let reader_shared = Arc::clone(&shared);
    let task = tokio::spawn(async move {
        let result = read_loop(stream, &reader_shared, dial_tx, config).await;
        reader_shared.shutdown();
        let _ = writer.await;
        result
    });

    Session {
        handle: SessionHandle { shared },
        dials,
        task,
    }
}

async fn write_loop<S>(mut sink: S, mut outbound: mpsc::Receiver<Frame>, closed: CancellationToken)
where
    S: futures::Sink<Frame, Error = TransportError> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "Tunnel write failed");
            break;
        }
    }
    closed.cancel();
    let _ = sink.close().await;
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn read_loop<S>(
    mut frames: S,
    shared: &Arc<Shared>,
    dial_tx: mpsc::Sender<DialRequest>,
    config: SessionConfig,
) -> Result<()>
where
    S: futures::Stream<Item = Result<Frame>> + Unpin,
{
    let mut ping = config.ping_interval.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut last_seen = Instant::now();

    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => return Ok(()),
            _ = tokio::time::sleep_until(last_seen + config.idle_timeout) => {
                return Err(TransportError::IdleTimeout(config.idle_timeout));
            }
            _ = tick(&mut ping) => {
                let _ = shared.outbound.try_send(Frame::ping());
                continue;
            }
            frame = frames.next() => match frame {
                Some(frame) => frame?,
                None => return Ok(()),
            },
        };
        last_seen = Instant::now();
        dispatch(shared, &dial_tx, frame).await;
    }
}

async fn dispatch(shared: &Arc<Shared>, dial_tx: &mpsc::Sender<DialRequest>, frame: Frame) {
    let id = frame.stream_id;
    match frame.kind {
        FrameKind::Data => {
            // Clone the sender so no map guard is held across the await
            let Some(tx) = shared.streams.get(&id).map(|s| s.clone()) else {
                trace!(stream = id, "Data for unknown stream");
                return;
            };
            if tx.send(frame.payload).await.is_err() {
                shared.streams.remove(&id);
            }
        }
        FrameKind::Close => {
            shared.streams.remove(&id);
            if let Some((_, ack)) = shared.pending.remove(&id) {
                let _ = ack.send(Err("closed by peer".to_string()));
            }
        }
        FrameKind::Dial => {
            let target = String::from_utf8_lossy(&frame.payload).into_owned();
            let request = DialRequest {
                stream_id: id,
                target,
                shared: Arc::clone(shared),
            };
            if let Err(mpsc::error::SendError(request)) = dial_tx.send(request).await {
                request.reject("dialing is not supported by this peer").await;
            }
        }
        FrameKind::DialAck => {
            if let Some((_, ack)) = shared.pending.remove(&id) {
                let result = if frame.payload.is_empty() {
                    Ok(())
                } else {
                    Err(String::from_utf8_lossy(&frame.payload).into_owned())
                };
                let _ = ack.send(result);
            }
        }
        FrameKind::Ping => {
            let _ = shared.outbound.send(Frame::pong()).await;
        }
        FrameKind::Pong => {}
        FrameKind::Hello => warn!("Unexpected hello on an established session"),
    }
}

fn spawn_stream(shared: Arc<Shared>, id: u64, inbound: mpsc::Receiver<Bytes>) -> TunnelStream {
    let (user, local) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(pump(shared, id, local, inbound));
    user
}

/// Move bytes between the local pipe end and the tunnel for one stream
async fn pump(shared: Arc<Shared>, id: u64, local: DuplexStream, mut inbound: mpsc::Receiver<Bytes>) {
    let (mut rd, mut wr) = tokio::io::split(local);
    let outbound = shared.outbound.clone();
    let closed = shared.closed.clone();

    let upstream = async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            let read = tokio::select! {
                _ = closed.cancelled() => return,
                read = rd.read_buf(&mut buf) => read,
            };
            match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if outbound.send(Frame::data(id, buf.split().freeze())).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = outbound.send(Frame::close(id)).await;
    };

    let downstream = async move {
        while let Some(chunk) = inbound.recv().await {
            if wr.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    };

    tokio::join!(upstream, downstream);
    shared.streams.remove(&id);
    trace!(stream = id, "Stream finished");
}
