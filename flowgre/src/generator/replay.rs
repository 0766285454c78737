//! The replay generator.
//!
//! Resends packets persisted by [`crate::ingest::record`]. A blocking reader
//! scans the store in key order into a bounded channel, optionally looping
//! over the whole keyspace, and a pool of workers drains the channel, each
//! pacing its sends by a fixed delay. Payloads go out as recorded unless
//! timestamp refresh is asked for.
//!
//! Without looping the run completes once the reader has sent every payload
//! and the workers have drained the channel.
//!
//! ## Metrics
//!
//! `bytes_written`: Bytes written successfully
//! `packets_sent`: Packets written successfully
//! `request_failure`: Number of failed writes, each stops the worker
//!

use std::{
    net::SocketAddr,
    ops::ControlFlow,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::{Bytes, BytesMut};
use flowgre_payload::netflow::{Header, VERSION};
use flowgre_signal::Watcher;
use metrics::counter;
use rand::{SeedableRng, rngs::SmallRng};
use tokio::{
    net::UdpSocket,
    sync::{Mutex, mpsc},
    task::JoinSet,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::join_workers;
use crate::{
    stats::{self, Snapshot, WorkerStat},
    store::{self, Store},
    transport,
};

/// Capacity of the reader to worker channel
pub const QUEUE_CAPACITY: usize = 1024;

/// Byte range of `UnixSecs` within a v9 header
const UNIX_SECS: std::ops::Range<usize> = 8..12;

#[derive(thiserror::Error, Debug)]
/// Errors produced by the replay generator.
pub enum Error {
    /// Socket setup or a send failed
    #[error(transparent)]
    Transport(#[from] transport::Error),
    /// Reading the store failed
    #[error(transparent)]
    Store(#[from] store::Error),
    /// Failed to register a shutdown watcher
    #[error("Failed to register shutdown watcher: {0}")]
    Registration(#[from] flowgre_signal::RegisterError),
    /// A pipeline task failed
    #[error("Replay task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// At least one worker is needed
    #[error("replay needs at least one worker")]
    NoWorkers,
    /// Pacing needs a non-zero delay
    #[error("replay delay must be at least 1ms")]
    ZeroDelay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Configuration of the replay generator.
pub struct Config {
    /// Collector address
    pub target: SocketAddr,
    /// Number of sender workers
    pub workers: u16,
    /// Time between sends, per worker
    pub delay: Duration,
    /// Start over from the first key after the last
    pub looping: bool,
    /// Stamp the current time into each v9 header before sending
    pub update_timestamps: bool,
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Fails if there are no workers or the delay is zero.
    pub fn valid(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::NoWorkers);
        }
        if self.delay < Duration::from_millis(1) {
            return Err(Error::ZeroDelay);
        }
        Ok(())
    }
}

/// Overwrite the header's `UnixSecs` with `unix_secs`. Payloads that are not
/// v9, or too short to hold a header, come back untouched.
#[must_use]
pub fn refresh_timestamp(payload: Bytes, unix_secs: u32) -> Bytes {
    if payload.len() < Header::LEN || payload[..2] != VERSION.to_be_bytes() {
        return payload;
    }
    let mut buf = BytesMut::from(&payload[..]);
    buf[UNIX_SECS].copy_from_slice(&unix_secs.to_be_bytes());
    buf.freeze()
}

fn now_unix_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Scan `store` into `sender` until done, the workers are gone or the
/// signal fires. Returns the number of payloads read.
fn read_store<S>(
    mut store: S,
    looping: bool,
    sender: &mpsc::Sender<Bytes>,
    shutdown: &mut Watcher,
) -> Result<u64, Error>
where
    S: Store,
{
    info!("Reading {} payloads from store", store.len());
    let mut count = 0u64;
    loop {
        let mut stopped = false;
        store.scan(&mut |_key, value| {
            // Ok(true) on the first observation, Err on later ones
            if !matches!(shutdown.try_recv(), Ok(false)) {
                info!("Store reader exiting due to signal");
                stopped = true;
                return ControlFlow::Break(());
            }
            if sender.blocking_send(Bytes::copy_from_slice(value)).is_err() {
                debug!("replay workers gone, store reader stopping");
                stopped = true;
                return ControlFlow::Break(());
            }
            count += 1;
            ControlFlow::Continue(())
        })?;

        if stopped || !looping {
            break;
        }
        if store.is_empty() {
            warn!("store is empty, nothing to loop over");
            break;
        }
    }
    info!("Read {count} payloads from the store");
    Ok(count)
}

#[derive(Debug)]
struct Worker {
    target: SocketAddr,
    delay: Duration,
    update_timestamps: bool,
    socket: UdpSocket,
    queue: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    stat: WorkerStat,
    stats: mpsc::Sender<WorkerStat>,
    metric_labels: Vec<(String, String)>,
}

impl Worker {
    async fn spin(mut self, shutdown: Watcher) -> Result<(), transport::Error> {
        let res = self.pump(shutdown).await;
        if self.stats.send(self.stat).await.is_err() {
            debug!("stats collector gone, dropping report");
        }
        res
    }

    async fn pump(&mut self, shutdown: Watcher) -> Result<(), transport::Error> {
        let worker_id = self.stat.worker_id;
        info!(
            "Worker [{worker_id:2}] Slinging packets at {} with delay of {:?}",
            self.target, self.delay
        );
        let mut pace = time::interval(self.delay);
        pace.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            let queue = Arc::clone(&self.queue);
            let next = async {
                pace.tick().await;
                queue.lock().await.recv().await
            };
            let payload = tokio::select! {
                payload = next => payload,
                () = &mut shutdown_wait => {
                    info!("Worker [{worker_id:2}] exiting due to signal");
                    return Ok(());
                }
            };
            let Some(mut payload) = payload else {
                debug!("Worker [{worker_id:2}] queue drained");
                return Ok(());
            };

            if self.update_timestamps {
                payload = refresh_timestamp(payload, now_unix_secs());
            }
            debug!("Worker [{worker_id:2}] sending packet with length: {}", payload.len());
            match transport::send_packet(&self.socket, self.target, &payload).await {
                Ok(bytes) => {
                    counter!("bytes_written", &self.metric_labels).increment(bytes as u64);
                    counter!("packets_sent", &self.metric_labels).increment(1);
                    self.stat.bytes_sent += bytes as u64;
                    self.stat.packets_sent += 1;
                    self.stat.cycles += 1;
                }
                Err(err) => {
                    let mut error_labels = self.metric_labels.clone();
                    error_labels.push(("error".to_string(), err.to_string()));
                    counter!("request_failure", &error_labels).increment(1);
                    return Err(err);
                }
            }
        }
    }
}

/// Replay the contents of `store` until it is exhausted or `shutdown`
/// fires, returning the final stats.
///
/// # Errors
///
/// Fails before sending if the configuration is invalid or a socket cannot
/// be bound. Worker send failures are logged and do not fail the run.
pub async fn run<S>(config: Config, store: S, shutdown: Watcher) -> Result<Snapshot, Error>
where
    S: Store + 'static,
{
    config.valid()?;
    let metric_labels = vec![
        ("component".to_string(), "generator".to_string()),
        ("component_name".to_string(), "replay".to_string()),
    ];

    let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
    let queue = Arc::new(Mutex::new(receiver));
    let (stats_sender, collector) = stats::channel(usize::from(config.workers));
    let collector = tokio::spawn(collector.run());

    let mut rng = SmallRng::from_rng(&mut rand::rng());
    let mut workers = Vec::with_capacity(usize::from(config.workers));
    for worker_id in 1..=u32::from(config.workers) {
        let socket = transport::bind_sender(&mut rng, config.target, None).await?;
        workers.push(Worker {
            target: config.target,
            delay: config.delay,
            update_timestamps: config.update_timestamps,
            socket,
            queue: Arc::clone(&queue),
            stat: WorkerStat {
                worker_id,
                ..WorkerStat::default()
            },
            stats: stats_sender.clone(),
            metric_labels: metric_labels.clone(),
        });
    }
    drop(queue);
    drop(stats_sender);

    let mut reader_shutdown = shutdown.register()?;
    let looping = config.looping;
    let reader = tokio::task::spawn_blocking(move || {
        read_store(store, looping, &sender, &mut reader_shutdown)
    });

    let mut join_set = JoinSet::new();
    for worker in workers {
        join_set.spawn(worker.spin(shutdown.register()?));
    }
    drop(shutdown);

    join_workers("replay", &mut join_set).await;
    // with every worker gone the reader's sends fail and it stops
    let read = reader.await??;
    let snapshot = collector.await?;
    info!(
        "replay finished, {read} payloads read and {} packets sent",
        snapshot.totals.packets_sent
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::{net::UdpSocket, time::timeout};

    use super::{Config, Error, refresh_timestamp, run};
    use crate::store::{MemoryStore, Store, sequence_key};

    fn config(target: std::net::SocketAddr, workers: u16, looping: bool) -> Config {
        Config {
            target,
            workers,
            delay: Duration::from_millis(1),
            looping,
            update_timestamps: false,
        }
    }

    fn payload(n: u8) -> Vec<u8> {
        let mut buf = vec![0, 9, 0, 1];
        buf.extend_from_slice(&[n; 16]);
        buf
    }

    #[test]
    fn timestamp_refresh_touches_only_unix_secs() {
        let original = Bytes::from(payload(3));
        let refreshed = refresh_timestamp(original.clone(), 0x0A0B_0C0D);
        assert_eq!(&refreshed[8..12], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&refreshed[..8], &original[..8]);
        assert_eq!(&refreshed[12..], &original[12..]);
    }

    #[test]
    fn timestamp_refresh_skips_other_payloads() {
        let ipfix = Bytes::from(vec![0, 10, 0, 20, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(refresh_timestamp(ipfix.clone(), 1), ipfix);
        let short = Bytes::from_static(&[0, 9, 0, 1]);
        assert_eq!(refresh_timestamp(short.clone(), 1), short);
    }

    #[tokio::test]
    async fn replays_every_payload_in_key_order_then_completes() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.expect("binds");
        let mut store = MemoryStore::default();
        for n in 1..=20u8 {
            store.put(&sequence_key(u32::from(n)), &payload(n)).expect("put");
        }

        let (watcher, _broadcaster) = flowgre_signal::signal();
        let target = collector.local_addr().expect("bound");
        let snapshot = timeout(Duration::from_secs(10), run(config(target, 1, false), store, watcher))
            .await
            .expect("replay completes without looping")
            .expect("replay succeeds");
        assert_eq!(snapshot.totals.packets_sent, 20);

        let mut buf = [0u8; 64];
        for n in 1..=20u8 {
            let (len, _) = timeout(Duration::from_secs(1), collector.recv_from(&mut buf))
                .await
                .expect("datagram arrives")
                .expect("receives");
            assert_eq!(&buf[..len], payload(n).as_slice());
        }
    }

    #[tokio::test]
    async fn looping_runs_until_signaled() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.expect("binds");
        let mut store = MemoryStore::default();
        for n in 1..=3u8 {
            store.put(&sequence_key(u32::from(n)), &payload(n)).expect("put");
        }

        let (watcher, broadcaster) = flowgre_signal::signal();
        let target = collector.local_addr().expect("bound");
        let handle = tokio::spawn(run(config(target, 2, true), store, watcher));

        let mut buf = [0u8; 64];
        for _ in 0..10 {
            timeout(Duration::from_secs(1), collector.recv_from(&mut buf))
                .await
                .expect("datagram arrives")
                .expect("receives");
        }
        timeout(Duration::from_secs(5), broadcaster.signal_and_wait())
            .await
            .expect("pipeline drained");
        let snapshot = handle.await.expect("run panicked").expect("run succeeds");
        assert!(snapshot.totals.packets_sent >= 10);
        assert_eq!(snapshot.workers.len(), 2);
    }

    #[tokio::test]
    async fn empty_store_completes_immediately() {
        let (watcher, _broadcaster) = flowgre_signal::signal();
        let target = "127.0.0.1:9".parse().expect("valid");
        let snapshot = timeout(
            Duration::from_secs(5),
            run(config(target, 1, true), MemoryStore::default(), watcher),
        )
        .await
        .expect("completes")
        .expect("succeeds");
        assert_eq!(snapshot.totals.packets_sent, 0);
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let (watcher, _broadcaster) = flowgre_signal::signal();
        let target = "127.0.0.1:9".parse().expect("valid");
        assert!(matches!(
            run(config(target, 0, false), MemoryStore::default(), watcher).await,
            Err(Error::NoWorkers)
        ));
    }
}
