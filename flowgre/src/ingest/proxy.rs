//! The proxy pipeline.
//!
//! Listener and validator as in [`crate::ingest`], then a replicator that
//! copies every valid packet into one bounded queue per target, and one
//! sender per target draining its queue. A full target queue blocks the
//! replicator, so a slow target slows every target.
//!
//! ## Metrics
//!
//! `bytes_written`: Bytes forwarded successfully, per target
//! `packets_sent`: Packets forwarded successfully, per target
//! `request_failure`: Forwards that failed, the packet is skipped
//!

use std::net::SocketAddr;

use bytes::Bytes;
use flowgre_signal::Watcher;
use metrics::counter;
use rand::{SeedableRng, rngs::SmallRng};
use tokio::{net::UdpSocket, sync::mpsc, task::JoinSet};
use tracing::{debug, error, info, warn};

use super::{Counts, QUEUE_CAPACITY, listen, validate};
use crate::transport;

/// Most targets a proxy forwards to
pub const MAX_TARGETS: usize = 10;

#[derive(thiserror::Error, Debug)]
/// Errors produced by the proxy pipeline.
pub enum Error {
    /// A socket could not be bound
    #[error(transparent)]
    Transport(#[from] transport::Error),
    /// Failed to register a shutdown watcher
    #[error("Failed to register shutdown watcher: {0}")]
    Registration(#[from] flowgre_signal::RegisterError),
    /// A pipeline task failed
    #[error("Proxy task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// Target count outside 1 to [`MAX_TARGETS`]
    #[error("proxy needs between 1 and {MAX_TARGETS} targets, got {0}")]
    TargetCount(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Configuration of the proxy pipeline.
pub struct Config {
    /// Address to listen on
    pub listen: SocketAddr,
    /// Addresses every valid packet is copied to
    pub targets: Vec<SocketAddr>,
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Fails unless there are between 1 and [`MAX_TARGETS`] targets.
    pub fn valid(&self) -> Result<(), Error> {
        if self.targets.is_empty() || self.targets.len() > MAX_TARGETS {
            return Err(Error::TargetCount(self.targets.len()));
        }
        Ok(())
    }
}

/// Result of a finished proxy run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Validator counts
    pub counts: Counts,
    /// Packets forwarded, per target in configuration order
    pub forwarded: Vec<u64>,
}

#[derive(Debug)]
struct Target {
    addr: SocketAddr,
    socket: UdpSocket,
}

#[derive(Debug)]
/// The proxy pipeline, bound and ready to run.
pub struct Proxy {
    socket: UdpSocket,
    addr: SocketAddr,
    targets: Vec<Target>,
    metric_labels: Vec<(String, String)>,
}

impl Proxy {
    /// Bind the listen socket and one sending socket per target.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or any socket cannot be bound.
    pub async fn bind(config: Config) -> Result<Self, Error> {
        config.valid()?;
        let socket = transport::bind(config.listen).await?;
        let addr = socket.local_addr().unwrap_or(config.listen);

        let mut rng = SmallRng::from_rng(&mut rand::rng());
        let mut targets = Vec::with_capacity(config.targets.len());
        for target in config.targets {
            targets.push(Target {
                addr: target,
                socket: transport::bind_sender(&mut rng, target, None).await?,
            });
        }

        Ok(Self {
            socket,
            addr,
            targets,
            metric_labels: vec![
                ("component".to_string(), "ingest".to_string()),
                ("component_name".to_string(), "proxy".to_string()),
            ],
        })
    }

    /// Address the pipeline listens on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Forward until `shutdown` fires and every received packet has been
    /// sent on.
    ///
    /// # Errors
    ///
    /// Fails if a pipeline task dies.
    pub async fn run(self, shutdown: Watcher) -> Result<Summary, Error> {
        let target_list = self
            .targets
            .iter()
            .map(|t| t.addr.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        info!("Listening on {} proxying to {target_list}", self.addr);

        let (ingest_sender, ingest_receiver) = mpsc::channel(QUEUE_CAPACITY);
        let (valid_sender, valid_receiver) = mpsc::channel(QUEUE_CAPACITY);

        let listener = tokio::spawn(listen(
            self.socket,
            ingest_sender,
            shutdown.register()?,
            self.metric_labels.clone(),
        ));
        drop(shutdown);
        let validator = tokio::spawn(validate(
            ingest_receiver,
            valid_sender,
            self.metric_labels.clone(),
        ));

        let mut queues = Vec::with_capacity(self.targets.len());
        let mut senders = JoinSet::new();
        for (index, target) in self.targets.into_iter().enumerate() {
            let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
            queues.push(sender);
            let mut labels = self.metric_labels.clone();
            labels.push(("target".to_string(), target.addr.to_string()));
            senders.spawn(async move { (index, forward(target, receiver, labels).await) });
        }
        let replicator = tokio::spawn(replicate(valid_receiver, queues));

        listener.await?;
        let counts = validator.await?;
        replicator.await?;

        let mut forwarded = vec![0; senders.len()];
        while let Some(res) = senders.join_next().await {
            let (index, sent) = res?;
            forwarded[index] = sent;
        }
        info!("Proxy finished, forwarded {forwarded:?}");
        Ok(Summary { counts, forwarded })
    }
}

/// Copy every payload to every open target queue until `receiver` closes.
async fn replicate(mut receiver: mpsc::Receiver<Bytes>, mut targets: Vec<mpsc::Sender<Bytes>>) {
    while let Some(payload) = receiver.recv().await {
        let mut index = 0;
        while index < targets.len() {
            if targets[index].send(payload.clone()).await.is_err() {
                warn!("target sender gone, dropping it from the fan out");
                targets.swap_remove(index);
            } else {
                index += 1;
            }
        }
        if targets.is_empty() {
            error!("no targets left, replicator stopping");
            return;
        }
    }
    debug!("replicator drained");
}

/// Send everything from `receiver` to `target`, returning the number of
/// packets sent.
async fn forward(target: Target, mut receiver: mpsc::Receiver<Bytes>, metric_labels: Vec<(String, String)>) -> u64 {
    let mut sent = 0;
    while let Some(payload) = receiver.recv().await {
        match transport::send_packet(&target.socket, target.addr, &payload).await {
            Ok(bytes) => {
                counter!("bytes_written", &metric_labels).increment(bytes as u64);
                counter!("packets_sent", &metric_labels).increment(1);
                sent += 1;
            }
            Err(err) => {
                counter!("request_failure", &metric_labels).increment(1);
                warn!("Skipping packet: {err}");
            }
        }
    }
    debug!("sender for {} drained after {sent} packets", target.addr);
    sent
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{net::UdpSocket, time::timeout};

    use super::{Config, Error, MAX_TARGETS, Proxy};

    #[test]
    fn target_count_is_bounded() {
        let listen = "127.0.0.1:0".parse().expect("valid");
        let target = "127.0.0.1:9995".parse().expect("valid");
        let none = Config {
            listen,
            targets: Vec::new(),
        };
        assert!(matches!(none.valid(), Err(Error::TargetCount(0))));
        let too_many = Config {
            listen,
            targets: vec![target; MAX_TARGETS + 1],
        };
        assert!(matches!(too_many.valid(), Err(Error::TargetCount(11))));
        let max = Config {
            listen,
            targets: vec![target; MAX_TARGETS],
        };
        assert!(max.valid().is_ok());
    }

    #[tokio::test]
    async fn every_target_gets_identical_ordered_copies() {
        let first = UdpSocket::bind("127.0.0.1:0").await.expect("binds");
        let second = UdpSocket::bind("127.0.0.1:0").await.expect("binds");
        let config = Config {
            listen: "127.0.0.1:0".parse().expect("valid"),
            targets: vec![
                first.local_addr().expect("bound"),
                second.local_addr().expect("bound"),
            ],
        };
        let proxy = Proxy::bind(config).await.expect("binds");
        let addr = proxy.local_addr();
        let (watcher, broadcaster) = flowgre_signal::signal();
        let handle = tokio::spawn(proxy.run(watcher));

        let source = UdpSocket::bind("127.0.0.1:0").await.expect("binds");
        let mut sent = Vec::new();
        for n in 0..25u8 {
            let payload = vec![0, 9, 0, 1, n, n.wrapping_mul(3)];
            source.send_to(&payload, addr).await.expect("sends");
            sent.push(payload);
        }
        source.send_to(&[0, 5, 0, 0], addr).await.expect("sends");

        for target in [&first, &second] {
            let mut buf = [0u8; 64];
            for expected in &sent {
                let (len, _) = timeout(Duration::from_secs(2), target.recv_from(&mut buf))
                    .await
                    .expect("copy arrives")
                    .expect("receives");
                assert_eq!(&buf[..len], expected.as_slice());
            }
        }

        timeout(Duration::from_secs(6), broadcaster.signal_and_wait())
            .await
            .expect("proxy drained");
        let summary = handle.await.expect("proxy panicked").expect("proxy succeeds");
        assert_eq!(summary.counts.valid, 25);
        assert_eq!(summary.counts.invalid, 1);
        assert_eq!(summary.forwarded, vec![25, 25]);
    }
}
