//! Flowgre ingest pipelines
//!
//! Ingest receives `NetFlow` from the network. [`record`] persists every
//! valid v9 packet for later replay and [`proxy`] copies each valid packet
//! to a fixed set of targets. Both start the same way: a listener moves
//! datagrams off the socket into a bounded queue and a validator passes on
//! v9 packets, counting the rest.
//!
//! Only the listener watches for shutdown. Every later stage runs until its
//! input channel closes, so whatever was received before the signal is
//! still processed.
//!
//! ## Metrics
//!
//! `packets_received`: Datagrams read off the socket
//! `bytes_received`: Bytes read off the socket
//! `packets_invalid`: Datagrams dropped for not being `NetFlow` v9
//!

use std::time::Duration;

use bytes::Bytes;
use flowgre_payload::netflow::is_valid_netflow;
use flowgre_signal::Watcher;
use metrics::counter;
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    time::{self, Instant, timeout},
};
use tracing::{debug, info, trace, warn};

use crate::transport::RECV_BUFFER_BYTES;

pub mod proxy;
pub mod record;

/// Capacity of every queue between ingest stages
pub const QUEUE_CAPACITY: usize = 1024;

/// Longest a listener blocks on one read
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Time between validator count reports
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Silence after which the validator warns
pub const IDLE_WARNING: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
/// Errors produced by the ingest pipelines.
pub enum Error {
    /// See [`crate::ingest::record::Error`] for details.
    #[error(transparent)]
    Record(#[from] record::Error),
    /// See [`crate::ingest::proxy::Error`] for details.
    #[error(transparent)]
    Proxy(#[from] proxy::Error),
}

/// Packets seen by a validator
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    /// `NetFlow` v9 packets passed on
    pub valid: u64,
    /// Packets dropped
    pub invalid: u64,
}

/// Read datagrams into `sender` until the shutdown signal or the next stage
/// goes away.
pub(crate) async fn listen(
    socket: UdpSocket,
    sender: mpsc::Sender<Bytes>,
    shutdown: Watcher,
    metric_labels: Vec<(String, String)>,
) {
    let mut buf = vec![0; RECV_BUFFER_BYTES];

    let shutdown_wait = shutdown.recv();
    tokio::pin!(shutdown_wait);
    loop {
        tokio::select! {
            read = timeout(READ_TIMEOUT, socket.recv_from(&mut buf)) => {
                let (bytes, peer) = match read {
                    Err(_) => {
                        trace!("no packet within {READ_TIMEOUT:?}");
                        continue;
                    }
                    Ok(Err(err)) => {
                        warn!("Error reading packet: {err}");
                        continue;
                    }
                    Ok(Ok(read)) => read,
                };
                counter!("packets_received", &metric_labels).increment(1);
                counter!("bytes_received", &metric_labels).increment(bytes as u64);
                debug!("Packet received from {peer} with size of {bytes}");
                if sender.send(Bytes::copy_from_slice(&buf[..bytes])).await.is_err() {
                    debug!("validator gone, listener stopping");
                    return;
                }
            }
            () = &mut shutdown_wait => {
                info!("Listener exiting due to signal");
                return;
            }
        }
    }
}

/// Pass v9 packets from `receiver` to `sender` until `receiver` closes.
pub(crate) async fn validate(
    mut receiver: mpsc::Receiver<Bytes>,
    sender: mpsc::Sender<Bytes>,
    metric_labels: Vec<(String, String)>,
) -> Counts {
    let mut counts = Counts::default();
    let mut report = time::interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
    let mut last_packet = Instant::now();
    let mut downstream_open = true;

    loop {
        tokio::select! {
            payload = receiver.recv() => {
                let Some(payload) = payload else { break };
                last_packet = Instant::now();
                match is_valid_netflow(&payload) {
                    Ok(true) => {
                        counts.valid += 1;
                        if downstream_open && sender.send(payload).await.is_err() {
                            warn!("downstream stage gone, discarding valid packets");
                            downstream_open = false;
                        }
                    }
                    Ok(false) => {
                        counts.invalid += 1;
                        counter!("packets_invalid", &metric_labels).increment(1);
                    }
                    Err(err) => {
                        counts.invalid += 1;
                        counter!("packets_invalid", &metric_labels).increment(1);
                        debug!("Skipping packet due to issue parsing: {err}");
                    }
                }
            }
            _ = report.tick() => {
                info!("Netflow v9 Packets: {} Ignored Packets: {}", counts.valid, counts.invalid);
                let idle = last_packet.elapsed();
                if idle >= IDLE_WARNING {
                    warn!("No packets received in the last {}s", idle.as_secs());
                }
            }
        }
    }

    info!(
        "Validator finished, Netflow v9 Packets: {} Ignored Packets: {}",
        counts.valid, counts.invalid
    );
    counts
}
