//! The barrage generator.
//!
//! Runs a fixed number of virtual exporters against one collector. Each
//! worker binds its own socket, draws a random `SourceID` and sends its
//! template before pacing data packets on a fixed tick. Every
//! [`REFRESH_INTERVAL`] a worker resends the template and reports its
//! counters to the stats collector.
//!
//! ## Metrics
//!
//! `bytes_written`: Bytes written successfully
//! `packets_sent`: Packets written successfully
//! `request_failure`: Number of failed writes, each stops the worker
//!

use std::{collections::HashSet, net::SocketAddr, ops::Range, time::Duration};

use flowgre_payload::{
    Exporter, Ipv4Cidr, Schema, Serialize,
    netflow::{self, MAX_DATAGRAM_BYTES},
};
use flowgre_signal::Watcher;
use metrics::counter;
use rand::{
    Rng, SeedableRng,
    rngs::{SmallRng, StdRng},
};
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    task::JoinSet,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info};

use super::{REFRESH_INTERVAL, join_workers};
use crate::{
    stats::{self, Snapshot, WorkerStat},
    transport, web,
};

/// Flow records in every data packet.
///
/// Varying this per cycle has broken sequence consistency at collectors
/// before, it stays fixed until that is understood.
pub const FLOWS_PER_CYCLE: u16 = 100;

/// Range `SourceID`s are drawn from
pub const SOURCE_ID_RANGE: Range<u32> = 100..10_000;

#[derive(thiserror::Error, Debug)]
/// Errors produced by the barrage generator.
pub enum Error {
    /// Payload generation failed
    #[error("Payload generation failed: {0}")]
    Payload(#[from] flowgre_payload::Error),
    /// Socket setup or a send failed
    #[error(transparent)]
    Transport(#[from] transport::Error),
    /// The dashboard could not start
    #[error(transparent)]
    Web(#[from] web::Error),
    /// Failed to register a shutdown watcher
    #[error("Failed to register shutdown watcher: {0}")]
    Registration(#[from] flowgre_signal::RegisterError),
    /// The stats collector task failed
    #[error("Stats collector failed: {0}")]
    Collector(#[from] tokio::task::JoinError),
    /// At least one worker is needed
    #[error("barrage needs at least one worker")]
    NoWorkers,
    /// Every worker needs its own `SourceID`
    #[error("barrage supports at most {max} workers, got {0}", max = SOURCE_ID_RANGE.len())]
    TooManyWorkers(u16),
    /// Pacing needs a non-zero delay
    #[error("barrage delay must be at least 1ms")]
    ZeroDelay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Configuration of the barrage generator.
pub struct Config {
    /// The seed for random operations against this target
    pub seed: [u8; 32],
    /// Collector address
    pub target: SocketAddr,
    /// Number of virtual exporters
    pub workers: u16,
    /// Time between data packets, per worker
    pub delay: Duration,
    /// Schema of generated records
    pub schema: Schema,
    /// Range source addresses are drawn from
    pub src_range: Ipv4Cidr,
    /// Range destination addresses are drawn from
    pub dst_range: Ipv4Cidr,
    /// Dashboard listen address, if the dashboard is wanted
    pub web: Option<SocketAddr>,
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Fails if there are no workers, more workers than distinct
    /// `SourceID`s, a zero delay or an invalid payload configuration.
    pub fn valid(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::NoWorkers);
        }
        if usize::from(self.workers) > SOURCE_ID_RANGE.len() {
            return Err(Error::TooManyWorkers(self.workers));
        }
        if self.delay < Duration::from_millis(1) {
            return Err(Error::ZeroDelay);
        }
        self.payload().valid()?;
        Ok(())
    }

    fn payload(&self) -> netflow::Config {
        netflow::Config {
            schema: self.schema,
            flows_per_packet: FLOWS_PER_CYCLE,
            src_range: self.src_range,
            dst_range: self.dst_range,
        }
    }
}

#[derive(Debug)]
struct Worker {
    target: SocketAddr,
    delay: Duration,
    socket: UdpSocket,
    exporter: Exporter,
    rng: SmallRng,
    stat: WorkerStat,
    stats: mpsc::Sender<WorkerStat>,
    metric_labels: Vec<(String, String)>,
}

impl Worker {
    async fn send(&mut self, buf: &[u8]) -> Result<(), Error> {
        match transport::send_packet(&self.socket, self.target, buf).await {
            Ok(bytes) => {
                counter!("bytes_written", &self.metric_labels).increment(bytes as u64);
                counter!("packets_sent", &self.metric_labels).increment(1);
                self.stat.bytes_sent += bytes as u64;
                self.stat.packets_sent += 1;
                Ok(())
            }
            Err(err) => {
                let mut error_labels = self.metric_labels.clone();
                error_labels.push(("error".to_string(), err.to_string()));
                counter!("request_failure", &error_labels).increment(1);
                Err(err.into())
            }
        }
    }

    async fn send_template(&mut self) -> Result<(), Error> {
        let packet = self.exporter.template().to_bytes();
        self.send(&packet).await?;
        self.stat.flows_sent += 1;
        Ok(())
    }

    async fn send_data(&mut self, buf: &mut Vec<u8>) -> Result<(), Error> {
        buf.clear();
        self.exporter
            .to_bytes(&mut self.rng, MAX_DATAGRAM_BYTES, buf)?;
        self.send(buf).await?;
        self.stat.flows_sent += self.exporter.data_points_generated().unwrap_or(0);
        self.stat.cycles += 1;
        Ok(())
    }

    async fn report(&self) {
        if self.stats.send(self.stat).await.is_err() {
            debug!("stats collector gone, dropping report");
        }
    }

    async fn spin(mut self, shutdown: Watcher) -> Result<(), Error> {
        let res = self.pump(shutdown).await;
        // last word to the collector, even on failure
        self.report().await;
        res
    }

    async fn pump(&mut self, shutdown: Watcher) -> Result<(), Error> {
        let worker_id = self.stat.worker_id;
        self.send_template().await?;
        info!(
            "Worker [{worker_id:2}] Slinging packets at {} with Source ID: {:5} and delay of {:?}",
            self.target, self.stat.source_id, self.delay
        );

        let mut pace = time::interval(self.delay);
        pace.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut refresh = time::interval_at(Instant::now() + REFRESH_INTERVAL, REFRESH_INTERVAL);
        let mut buf = Vec::with_capacity(MAX_DATAGRAM_BYTES);

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                _ = pace.tick() => self.send_data(&mut buf).await?,
                _ = refresh.tick() => {
                    self.send_template().await?;
                    self.report().await;
                }
                () = &mut shutdown_wait => {
                    info!("Worker [{worker_id:2}] exiting due to signal");
                    return Ok(());
                }
            }
        }
    }
}

/// Run the barrage until `shutdown` fires, returning the final stats.
///
/// # Errors
///
/// Fails before any packet is sent if the configuration is invalid or a
/// socket cannot be bound. Failures of individual workers are logged and do
/// not fail the run.
pub async fn run(config: Config, shutdown: Watcher) -> Result<Snapshot, Error> {
    config.valid()?;
    let mut rng = StdRng::from_seed(config.seed);
    let metric_labels = vec![
        ("component".to_string(), "generator".to_string()),
        ("component_name".to_string(), "barrage".to_string()),
    ];

    let (stats_sender, collector) = stats::channel(usize::from(config.workers));
    let snapshots = collector.subscribe();
    let collector = tokio::spawn(collector.run());

    let mut workers = Vec::with_capacity(usize::from(config.workers));
    let mut source_ids = HashSet::with_capacity(usize::from(config.workers));
    for worker_id in 1..=u32::from(config.workers) {
        // valid() bounds workers by the range, so a free ID always exists
        let source_id = loop {
            let source_id = rng.random_range(SOURCE_ID_RANGE);
            if source_ids.insert(source_id) {
                break source_id;
            }
        };
        let mut worker_rng = SmallRng::from_rng(&mut rng);
        let socket = transport::bind_sender(&mut worker_rng, config.target, None).await?;
        workers.push(Worker {
            target: config.target,
            delay: config.delay,
            socket,
            exporter: Exporter::new(config.payload(), source_id)?,
            rng: worker_rng,
            stat: WorkerStat {
                worker_id,
                source_id,
                ..WorkerStat::default()
            },
            stats: stats_sender.clone(),
            metric_labels: metric_labels.clone(),
        });
    }

    let web = match config.web {
        Some(addr) => {
            let server = web::Server::bind(addr, snapshots, config.clone(), shutdown.register()?).await?;
            Some(tokio::spawn(server.run()))
        }
        None => None,
    };

    let mut join_set = JoinSet::new();
    for worker in workers {
        join_set.spawn(worker.spin(shutdown.register()?));
    }
    drop(stats_sender);
    drop(shutdown);

    join_workers("barrage", &mut join_set).await;
    let snapshot = collector.await?;

    if let Some(web) = web {
        // every worker is gone, nothing left to show
        web.abort();
        if let Ok(Err(err)) = web.await {
            error!("dashboard failed: {err}");
        }
    }
    info!("barrage finished, {} packets sent", snapshot.totals.packets_sent);
    Ok(snapshot)
}
