//! The record pipeline.
//!
//! Listener, validator and persister joined by bounded queues. The
//! persister writes each valid packet under the next big-endian `u32`
//! counter, starting from 1, so a replay scan returns packets in arrival
//! order.
//!
//! ## Metrics
//!
//! `packets_persisted`: Packets written to the store
//! `request_failure`: Packets the store failed to write
//!

use std::net::SocketAddr;

use bytes::Bytes;
use flowgre_signal::Watcher;
use metrics::counter;
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{error, info};

use super::{Counts, QUEUE_CAPACITY, listen, validate};
use crate::{
    store::{self, Store, sequence_key},
    transport,
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by the record pipeline.
pub enum Error {
    /// The listen socket could not be bound
    #[error(transparent)]
    Transport(#[from] transport::Error),
    /// The store failed to flush
    #[error(transparent)]
    Store(#[from] store::Error),
    /// Failed to register a shutdown watcher
    #[error("Failed to register shutdown watcher: {0}")]
    Registration(#[from] flowgre_signal::RegisterError),
    /// A pipeline task failed
    #[error("Record task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of a finished recording
#[derive(Debug)]
pub struct Recording<S> {
    /// The store, flushed
    pub store: S,
    /// Validator counts
    pub counts: Counts,
    /// Packets written to the store
    pub persisted: u64,
}

#[derive(Debug)]
/// The record pipeline, bound and ready to run.
pub struct Record {
    socket: UdpSocket,
    addr: SocketAddr,
    metric_labels: Vec<(String, String)>,
}

impl Record {
    /// Bind the listen socket.
    ///
    /// # Errors
    ///
    /// Fails if `addr` cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = transport::bind(addr).await?;
        let addr = socket.local_addr().unwrap_or(addr);
        Ok(Self {
            socket,
            addr,
            metric_labels: vec![
                ("component".to_string(), "ingest".to_string()),
                ("component_name".to_string(), "record".to_string()),
            ],
        })
    }

    /// Address the pipeline listens on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Record into `store` until `shutdown` fires and every received packet
    /// is persisted.
    ///
    /// # Errors
    ///
    /// Fails if a pipeline task dies or the store cannot be flushed.
    pub async fn run<S>(self, store: S, shutdown: Watcher) -> Result<Recording<S>, Error>
    where
        S: Store + 'static,
    {
        info!("Listening on {} recording to store", self.addr);
        let (ingest_sender, ingest_receiver) = mpsc::channel(QUEUE_CAPACITY);
        let (persist_sender, persist_receiver) = mpsc::channel(QUEUE_CAPACITY);

        let listener = tokio::spawn(listen(
            self.socket,
            ingest_sender,
            shutdown.register()?,
            self.metric_labels.clone(),
        ));
        drop(shutdown);
        let validator = tokio::spawn(validate(
            ingest_receiver,
            persist_sender,
            self.metric_labels.clone(),
        ));
        let labels = self.metric_labels;
        let persister =
            tokio::task::spawn_blocking(move || persist(store, persist_receiver, labels));

        listener.await?;
        let counts = validator.await?;
        let (store, persisted) = persister.await??;
        info!("Recorded {persisted} packets");
        Ok(Recording {
            store,
            counts,
            persisted,
        })
    }
}

/// Write every payload from `receiver` under consecutive keys until the
/// channel closes, returning the flushed store and the number written.
fn persist<S>(
    mut store: S,
    mut receiver: mpsc::Receiver<Bytes>,
    metric_labels: Vec<(String, String)>,
) -> Result<(S, u64), store::Error>
where
    S: Store,
{
    let mut next_key: u32 = 1;
    let mut persisted = 0u64;
    while let Some(payload) = receiver.blocking_recv() {
        match store.put(&sequence_key(next_key), &payload) {
            Ok(()) => {
                counter!("packets_persisted", &metric_labels).increment(1);
                persisted += 1;
                let Some(key) = next_key.checked_add(1) else {
                    error!("record key space exhausted, stopping persistence");
                    break;
                };
                next_key = key;
            }
            Err(err) => {
                counter!("request_failure", &metric_labels).increment(1);
                error!("Error writing to store: {err}");
            }
        }
    }
    store.flush()?;
    Ok((store, persisted))
}

#[cfg(test)]
mod tests {
    use std::{ops::ControlFlow, time::Duration};

    use bytes::Bytes;
    use flowgre_payload::{Ipv4Cidr, Schema};
    use tokio::{net::UdpSocket, sync::mpsc, time::timeout};

    use super::{Record, persist};
    use crate::{
        generator::barrage,
        store::{self, FileStore, MemoryStore, Store, sequence_key},
    };

    /// Fails the put calls whose 1-based position is in `failing`.
    #[derive(Debug)]
    struct FailingStore {
        inner: MemoryStore,
        failing: Vec<usize>,
        calls: usize,
    }

    impl Store for FailingStore {
        fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), store::Error> {
            self.calls += 1;
            if self.failing.contains(&self.calls) {
                return Err(store::Error::Io {
                    path: "failing".into(),
                    source: Box::new(std::io::Error::other("disk full")),
                });
            }
            self.inner.put(key, value)
        }

        fn scan(
            &mut self,
            visitor: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
        ) -> Result<(), store::Error> {
            self.inner.scan(visitor)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn flush(&mut self) -> Result<(), store::Error> {
            self.inner.flush()
        }
    }

    #[test]
    fn failed_puts_leave_no_gap_in_keys() {
        let (sender, receiver) = mpsc::channel(8);
        for n in 1..=5u8 {
            sender.try_send(Bytes::from(vec![0, 9, n])).expect("queue has room");
        }
        drop(sender);
        let store = FailingStore {
            inner: MemoryStore::new(),
            failing: vec![2, 4],
            calls: 0,
        };

        let (mut store, persisted) = persist(store, receiver, Vec::new()).expect("persist");
        assert_eq!(persisted, 3);
        assert_eq!(store.len(), 3);

        let mut entries = Vec::new();
        store
            .scan(&mut |key, value| {
                entries.push((key.to_vec(), value.to_vec()));
                ControlFlow::Continue(())
            })
            .expect("scan");
        assert_eq!(
            entries,
            vec![
                (sequence_key(1).to_vec(), vec![0, 9, 1]),
                (sequence_key(2).to_vec(), vec![0, 9, 3]),
                (sequence_key(3).to_vec(), vec![0, 9, 5]),
            ]
        );
    }

    #[tokio::test]
    async fn persists_valid_packets_in_arrival_order() {
        let record = Record::bind("127.0.0.1:0".parse().expect("valid"))
            .await
            .expect("binds");
        let addr = record.local_addr();
        let (watcher, broadcaster) = flowgre_signal::signal();
        let handle = tokio::spawn(record.run(MemoryStore::new(), watcher));

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("binds");
        let payloads: [&[u8]; 4] = [&[0, 9, 0, 1, 1], &[0, 5, 0, 0], &[0, 9, 0, 1, 2], &[0, 9, 0, 1, 3]];
        for payload in payloads {
            client.send_to(payload, addr).await.expect("sends");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        timeout(Duration::from_secs(6), broadcaster.signal_and_wait())
            .await
            .expect("pipeline drained");

        let mut recording = handle.await.expect("record panicked").expect("record succeeds");
        assert_eq!(recording.counts.valid, 3);
        assert_eq!(recording.counts.invalid, 1);
        assert_eq!(recording.persisted, 3);

        let mut entries = Vec::new();
        recording
            .store
            .scan(&mut |key, value| {
                entries.push((key.to_vec(), value.last().copied()));
                ControlFlow::Continue(())
            })
            .expect("scan");
        assert_eq!(
            entries,
            vec![
                (sequence_key(1).to_vec(), Some(1)),
                (sequence_key(2).to_vec(), Some(2)),
                (sequence_key(3).to_vec(), Some(3)),
            ]
        );
    }

    #[tokio::test]
    async fn taken_address_fails_at_startup() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.expect("binds");
        let addr = taken.local_addr().expect("bound");
        assert!(Record::bind(addr).await.is_err());
    }

    #[tokio::test]
    async fn recording_a_barrage_stores_every_packet_sent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("store opens");
        let record = Record::bind("127.0.0.1:0".parse().expect("valid"))
            .await
            .expect("binds");
        let (record_watcher, record_broadcaster) = flowgre_signal::signal();
        let target = record.local_addr();
        let recording = tokio::spawn(record.run(store, record_watcher));

        let range: Ipv4Cidr = "10.0.0.0/8".parse().expect("valid cidr");
        let config = barrage::Config {
            seed: [3; 32],
            target,
            workers: 2,
            delay: Duration::from_millis(20),
            schema: Schema::Https,
            src_range: range,
            dst_range: range,
            web: None,
        };
        let (barrage_watcher, barrage_broadcaster) = flowgre_signal::signal();
        let barrage = tokio::spawn(barrage::run(config, barrage_watcher));
        tokio::time::sleep(Duration::from_secs(1)).await;
        barrage_broadcaster.signal_and_wait().await;
        let snapshot = barrage.await.expect("barrage panicked").expect("barrage succeeds");

        // let the tail of the barrage land before stopping the recorder
        tokio::time::sleep(Duration::from_millis(300)).await;
        timeout(Duration::from_secs(6), record_broadcaster.signal_and_wait())
            .await
            .expect("record drained");
        let recording = recording.await.expect("record panicked").expect("record succeeds");

        assert!(snapshot.totals.packets_sent > 2);
        assert_eq!(recording.counts.invalid, 0);
        assert_eq!(recording.persisted, snapshot.totals.packets_sent);
        assert_eq!(recording.store.len() as u64, snapshot.totals.packets_sent);

        drop(recording);
        let reopened = FileStore::open(dir.path()).expect("store reopens");
        assert_eq!(reopened.len() as u64, snapshot.totals.packets_sent);
    }
}
