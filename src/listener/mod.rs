//! Ingestion listener
//!
//! Accepts msgpack batches of `[metric_name, [timestamp, value]]` entries,
//! either as length-prefixed frames over TCP or one batch per UDP datagram,
//! and hands every entry to the ingestion queue. A full queue never blocks
//! the listener for longer than the configured send timeout; entries that
//! cannot be queued in time are dropped and counted.

mod batch;
mod frame;

pub use batch::{AccessFilter, decode_batch, encode_batch};
pub use frame::{read_frame, write_frame};

use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::config::{ListenConfig, ListenProtocol};
use crate::constants::listener::{BIND_RETRY, UDP_BUFFER};
use crate::liveness::{Liveness, LivenessError};
use crate::metrics::IngestMetrics;
use crate::series::Datapoint;

/// One decoded datapoint on its way to the workers
#[derive(Debug, Clone, PartialEq)]
pub struct IngestItem {
    pub metric: String,
    pub datapoint: Datapoint,
}

impl IngestItem {
    #[must_use]
    pub fn new(metric: impl Into<String>, datapoint: Datapoint) -> Self {
        Self {
            metric: metric.into(),
            datapoint,
        }
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("undecodable batch: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("ingestion queue closed")]
    QueueClosed,

    #[error(transparent)]
    Stopped(#[from] LivenessError),
}

/// Network front end of the ingestion service
#[derive(Debug, Clone)]
pub struct Listener {
    config: ListenConfig,
    filter: AccessFilter,
    queue: flume::Sender<IngestItem>,
    metrics: IngestMetrics,
}

impl Listener {
    #[must_use]
    pub fn new(
        config: ListenConfig,
        queue: flume::Sender<IngestItem>,
        metrics: IngestMetrics,
    ) -> Self {
        let filter = AccessFilter::new(&config.access_key);
        Self {
            config,
            filter,
            queue,
            metrics,
        }
    }

    /// Bind the configured socket and serve until stopped
    ///
    /// Bind and accept failures are logged and retried after a backoff.
    pub async fn run(&self, liveness: &Liveness) -> Result<(), ListenerError> {
        let addr = (self.config.host.as_str(), self.config.port.get());
        loop {
            liveness.check()?;
            let bound = match self.config.protocol {
                ListenProtocol::Tcp => match TcpListener::bind(addr).await {
                    Ok(listener) => self.serve_tcp(listener, liveness).await,
                    Err(e) => Err(e.into()),
                },
                ListenProtocol::Udp => match UdpSocket::bind(addr).await {
                    Ok(socket) => self.serve_udp(socket, liveness).await,
                    Err(e) => Err(e.into()),
                },
            };
            match bound {
                Ok(()) => return Ok(()),
                Err(e @ (ListenerError::QueueClosed | ListenerError::Stopped(_))) => return Err(e),
                Err(e) => {
                    warn!(
                        "Listener on {}:{} failed: {}, retrying in {:?}",
                        self.config.host, self.config.port, e, BIND_RETRY
                    );
                    liveness.sleep(BIND_RETRY).await?;
                }
            }
        }
    }

    /// Serve length-prefixed batches on an already bound listener
    ///
    /// Returns `Ok` on shutdown and an error if accepting fails.
    pub async fn serve_tcp(
        &self,
        listener: TcpListener,
        liveness: &Liveness,
    ) -> Result<(), ListenerError> {
        info!("Listening for batches over TCP on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                () = liveness.cancelled() => return Ok(()),
            };
            debug!("Connection from {}", peer);
            let this = self.clone();
            tokio::spawn(async move {
                match this.handle_connection(stream).await {
                    Ok(()) => debug!("Connection from {} closed", peer),
                    Err(e) => info!("Dropping connection from {}: {}", peer, e),
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), ListenerError> {
        while let Some(frame) = read_frame(&mut stream, self.config.max_frame_bytes).await? {
            let items = decode_batch(&frame).inspect_err(|_| self.metrics.record_decode_error(1))?;
            self.forward(items).await?;
        }
        Ok(())
    }

    /// Serve one batch per datagram on an already bound socket
    pub async fn serve_udp(
        &self,
        socket: UdpSocket,
        liveness: &Liveness,
    ) -> Result<(), ListenerError> {
        info!("Listening for batches over UDP on {}", socket.local_addr()?);
        let mut buf = vec![0u8; UDP_BUFFER];
        loop {
            let (len, peer) = tokio::select! {
                received = socket.recv_from(&mut buf) => received?,
                () = liveness.cancelled() => return Ok(()),
            };
            if len > self.config.max_datagram_bytes {
                self.metrics.record_decode_error(1);
                warn!(
                    "Ignoring {} byte datagram from {} (limit {})",
                    len, peer, self.config.max_datagram_bytes
                );
                continue;
            }
            match decode_batch(&buf[..len]) {
                Ok(items) => self.forward(items).await?,
                Err(e) => {
                    self.metrics.record_decode_error(1);
                    info!("Ignoring datagram from {}: {}", peer, e);
                }
            }
        }
    }

    /// Filter a batch and push it onto the queue
    ///
    /// The whole batch shares one send deadline; once it has passed, items
    /// only go in if the queue has room right away.
    async fn forward(&self, items: Vec<IngestItem>) -> Result<(), ListenerError> {
        self.metrics.record_received(items.len() as u64);
        let deadline = tokio::time::Instant::now() + self.send_timeout();
        let mut dropped = 0u64;
        for item in items {
            let Some(item) = self.filter.apply(item) else {
                self.metrics.record_filtered(1);
                continue;
            };
            match tokio::time::timeout_at(deadline, self.queue.send_async(item)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(ListenerError::QueueClosed),
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            self.metrics.record_dropped(dropped);
            warn!(
                "Ingestion queue full, dropped {} datapoints ({} total)",
                dropped,
                self.metrics.snapshot().dropped
            );
        }
        Ok(())
    }

    fn send_timeout(&self) -> Duration {
        self.config.queue_send_timeout
    }
}
