//! Point-to-point angle stream over loopback TCP.
//!
//! The tracking process hosts ([`AngleHost`]), the stimulus process
//! connects ([`AngleReceiver`]). Neither side reconnects on its own: a
//! failed accept, connect, send or read marks the side disconnected,
//! emits [`ConnectionEvent::Lost`] and waits for an explicit new attempt.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use futures::{FutureExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::protocol::{
    decode_sample, sample_stream, send_sample, shutdown, AngleSample, SampleStream,
};

const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(SocketAddr),
    Lost,
}

/// Fan-out of connection state changes to any number of listeners.
#[derive(Default)]
pub struct ConnectionNotifier {
    subscribers: Vec<Sender<ConnectionEvent>>,
}

impl ConnectionNotifier {
    pub fn subscribe(&mut self) -> Receiver<ConnectionEvent> {
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        self.subscribers.push(tx);
        rx
    }

    /// Never blocks. Full subscribers miss the event, dropped ones are
    /// forgotten.
    pub fn notify(&mut self, event: ConnectionEvent) {
        self.subscribers.retain(|tx| match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(?event, "connection subscriber is full");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscribers(&self) -> usize {
        self.subscribers.len()
    }
}

/// Both ends are called from synchronous loops, so each owns a
/// current-thread runtime and drives its socket only inside `block_on`.
fn io_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build channel runtime")
}

/// What a non-blocking poll of the read side found.
enum Polled {
    Frame(AngleSample),
    Empty,
    Closed(Option<anyhow::Error>),
}

/// Polls the stream once without waiting. Must run inside `block_on`
/// after [`refresh_readiness`].
fn poll_sample(stream: &mut SampleStream) -> Polled {
    match stream.next().now_or_never() {
        None => Polled::Empty,
        Some(None) => Polled::Closed(None),
        Some(Some(Ok(frame))) => match decode_sample(&frame) {
            Ok(sample) => Polled::Frame(sample),
            Err(e) => Polled::Closed(Some(e)),
        },
        Some(Some(Err(e))) => Polled::Closed(Some(e.into())),
    }
}

/// current-thread ランタイムは block_on 中しかリアクタを回さないので、
/// 一度 yield して読み込み可能状態を最新にする
async fn refresh_readiness() {
    tokio::task::yield_now().await;
}

/// Listening side, owned by the tracking process.
pub struct AngleHost {
    listener: TcpListener,
    stream: Option<SampleStream>,
    peer: Option<SocketAddr>,
    notifier: ConnectionNotifier,
    // ソケットより後に drop する
    runtime: Runtime,
}

impl AngleHost {
    /// Binds without waiting for a peer.
    pub fn bind(addr: &str) -> Result<Self> {
        let runtime = io_runtime()?;
        let listener = runtime
            .block_on(TcpListener::bind(addr))
            .with_context(|| format!("failed to bind {}", addr))?;
        info!(addr = %listener.local_addr()?, "angle host listening");
        Ok(Self {
            listener,
            stream: None,
            peer: None,
            notifier: ConnectionNotifier::default(),
            runtime,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn subscribe(&mut self) -> Receiver<ConnectionEvent> {
        self.notifier.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Waits up to `timeout` for one peer. Only called on an explicit
    /// request; a timeout counts as a failed attempt and emits `Lost`.
    pub fn accept_within(&mut self, timeout: Duration) -> Result<bool> {
        if self.stream.is_some() {
            return Ok(true);
        }
        let accepted = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, self.listener.accept()).await });
        match accepted {
            Ok(Ok((socket, peer))) => {
                socket.set_nodelay(true)?;
                self.stream = Some(sample_stream(socket));
                self.peer = Some(peer);
                info!(%peer, "downstream connected");
                self.notifier.notify(ConnectionEvent::Connected(peer));
                Ok(true)
            }
            Ok(Err(e)) => {
                self.notifier.notify(ConnectionEvent::Lost);
                Err(e).context("accept failed")
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "no downstream peer connected");
                self.notifier.notify(ConnectionEvent::Lost);
                Ok(false)
            }
        }
    }

    /// Sends one sample. `Ok(false)` when there is no peer; an error means
    /// the connection was just lost and has been cleared.
    pub fn send(&mut self, sample: &AngleSample) -> Result<bool> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };
        let result = self.runtime.block_on(async {
            if peer_closed(stream).await {
                anyhow::bail!("peer closed the connection");
            }
            match tokio::time::timeout(WRITE_TIMEOUT, send_sample(stream, sample)).await {
                Ok(sent) => sent,
                Err(_) => anyhow::bail!("write timed out after {:?}", WRITE_TIMEOUT),
            }
        });
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                self.drop_connection();
                Err(e).context("angle send failed")
            }
        }
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        warn!(peer = ?self.peer.take(), "downstream connection lost");
        self.notifier.notify(ConnectionEvent::Lost);
    }

    /// Deliberate close; not reported as a loss.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = self.runtime.block_on(shutdown(&mut stream)) {
                debug!(error = %e, "shutdown of downstream connection failed");
            }
            info!(peer = ?self.peer.take(), "downstream connection closed");
        }
    }
}

/// An orderly shutdown by the peer only shows up on read. The host never
/// expects data, so anything readable other than EOF is discarded.
async fn peer_closed(stream: &mut SampleStream) -> bool {
    refresh_readiness().await;
    loop {
        match poll_sample(stream) {
            Polled::Empty => return false,
            Polled::Frame(_) => continue,
            Polled::Closed(_) => return true,
        }
    }
}

/// Connecting side, owned by the stimulus process.
pub struct AngleReceiver {
    addr: String,
    connect_timeout: Duration,
    stream: Option<SampleStream>,
    notifier: ConnectionNotifier,
    runtime: Runtime,
}

impl AngleReceiver {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            addr: addr.into(),
            connect_timeout,
            stream: None,
            notifier: ConnectionNotifier::default(),
            runtime: io_runtime()?,
        })
    }

    pub fn subscribe(&mut self) -> Receiver<ConnectionEvent> {
        self.notifier.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// One connection attempt. Returns whether a connection is open.
    pub fn open_connection(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        match self.runtime.block_on(self.connect()) {
            Ok((stream, peer)) => {
                self.stream = Some(stream);
                info!(%peer, "connected to tracker");
                self.notifier.notify(ConnectionEvent::Connected(peer));
                true
            }
            Err(e) => {
                warn!(addr = %self.addr, error = %format!("{:#}", e), "connection failed");
                self.notifier.notify(ConnectionEvent::Lost);
                false
            }
        }
    }

    async fn connect(&self) -> Result<(SampleStream, SocketAddr)> {
        let socket = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .with_context(|| format!("timed out connecting to {}", self.addr))?
            .with_context(|| format!("failed to connect to {}", self.addr))?;
        socket.set_nodelay(true)?;
        let peer = socket.peer_addr()?;
        Ok((sample_stream(socket), peer))
    }

    /// Drains everything received so far without blocking.
    pub fn read_data(&mut self) -> Vec<AngleSample> {
        let mut samples = Vec::new();
        let Some(stream) = self.stream.as_mut() else {
            return samples;
        };

        let closed = self.runtime.block_on(async {
            refresh_readiness().await;
            loop {
                match poll_sample(stream) {
                    Polled::Frame(sample) => samples.push(sample),
                    Polled::Empty => return None,
                    Polled::Closed(reason) => return Some(reason),
                }
            }
        });

        if let Some(reason) = closed {
            if let Some(e) = reason {
                warn!(error = %format!("{:#}", e), "angle stream failed");
            }
            self.stream = None;
            warn!("connection to tracker lost");
            self.notifier.notify(ConnectionEvent::Lost);
        }
        samples
    }

    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = self.runtime.block_on(shutdown(&mut stream)) {
                debug!(error = %e, "shutdown of tracker connection failed");
            }
        }
    }
}
