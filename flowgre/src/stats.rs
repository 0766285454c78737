//! Aggregation of per-worker counters.
//!
//! Workers report cumulative [`WorkerStat`] snapshots over a bounded
//! channel. The [`Collector`] keeps the latest snapshot per worker and
//! derives totals by summing the map, so repeated reports from one worker
//! never double count. Readers observe the current [`Snapshot`] through a
//! `watch` channel.
//!
//! The collector stops once every sender has been dropped. Dropping the
//! senders is how a pipeline closes the stats channel.

use std::collections::BTreeMap;

use byte_unit::{Byte, UnitType};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Cumulative counters reported by one sender worker
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerStat {
    /// Worker index within its pipeline
    #[serde(rename = "WorkerID")]
    pub worker_id: u32,
    /// `SourceID` the worker exports as
    #[serde(rename = "SourceID")]
    pub source_id: u32,
    /// Flow records sent
    pub flows_sent: u64,
    /// Send cycles completed
    pub cycles: u64,
    /// Bytes written to the socket
    pub bytes_sent: u64,
    /// Datagrams written to the socket
    pub packets_sent: u64,
}

/// Sums across every worker
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatTotals {
    /// Flow records sent
    pub flows_sent: u64,
    /// Send cycles completed
    pub cycles: u64,
    /// Bytes written to sockets
    pub bytes_sent: u64,
    /// Datagrams written to sockets
    pub packets_sent: u64,
}

impl StatTotals {
    fn sum<'a>(stats: impl Iterator<Item = &'a WorkerStat>) -> Self {
        stats.fold(Self::default(), |acc, stat| Self {
            flows_sent: acc.flows_sent + stat.flows_sent,
            cycles: acc.cycles + stat.cycles,
            bytes_sent: acc.bytes_sent + stat.bytes_sent,
            packets_sent: acc.packets_sent + stat.packets_sent,
        })
    }
}

/// The collector's view at one instant
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Latest report per worker, keyed by worker ID
    pub workers: BTreeMap<u32, WorkerStat>,
    /// Sum over `workers`
    pub totals: StatTotals,
}

impl Snapshot {
    fn record(&mut self, stat: WorkerStat) {
        self.workers.insert(stat.worker_id, stat);
        self.totals = StatTotals::sum(self.workers.values());
    }
}

/// Render a byte count the way the periodic stats log does, e.g.
/// `1.50 KiB`.
#[must_use]
pub fn human_bytes(bytes: u64) -> String {
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
    format!("{adjusted:.2}")
}

/// Create the stats channel for a pipeline of `workers` senders.
#[must_use]
pub fn channel(workers: usize) -> (mpsc::Sender<WorkerStat>, Collector) {
    let (sender, receiver) = mpsc::channel(workers + 20);
    let (state, _) = watch::channel(Snapshot::default());
    (sender, Collector { receiver, state })
}

#[derive(Debug)]
/// Single owner of the per-worker map and its totals.
pub struct Collector {
    receiver: mpsc::Receiver<WorkerStat>,
    state: watch::Sender<Snapshot>,
}

impl Collector {
    /// A read-only handle on the current snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.subscribe()
    }

    /// Run until every sender is dropped, returning the final snapshot.
    pub async fn run(mut self) -> Snapshot {
        debug!("stats collector running");
        while let Some(stat) = self.receiver.recv().await {
            info!(
                worker_id = stat.worker_id,
                source_id = stat.source_id,
                "flows sent: {} cycles: {} bytes sent: {} packets sent: {}",
                stat.flows_sent,
                stat.cycles,
                human_bytes(stat.bytes_sent),
                stat.packets_sent,
            );
            self.state.send_modify(|snapshot| snapshot.record(stat));
        }

        let snapshot = self.state.borrow().clone();
        info!(
            "totals, flows sent: {} cycles: {} bytes sent: {} packets sent: {}",
            snapshot.totals.flows_sent,
            snapshot.totals.cycles,
            human_bytes(snapshot.totals.bytes_sent),
            snapshot.totals.packets_sent,
        );
        snapshot
    }
}
