//! Flowgre generators
//!
//! A generator pushes `NetFlow` v9 datagrams at a collector. [`single`]
//! sends a fixed handful and exits, [`barrage`] runs many virtual
//! exporters at a steady pace, and [`replay`] resends packets captured by
//! [`crate::ingest::record`].
//!
//! Every sender worker owns its socket and, where it generates packets, its
//! own [`flowgre_payload::Exporter`]. A failed send stops that worker only.

use std::time::Duration;

use tracing::error;

pub mod barrage;
pub mod replay;
pub mod single;

/// Time between a worker's template resends and stats reports
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
/// Errors produced by the generators.
pub enum Error {
    /// See [`crate::generator::barrage::Error`] for details.
    #[error(transparent)]
    Barrage(#[from] barrage::Error),
    /// See [`crate::generator::replay::Error`] for details.
    #[error(transparent)]
    Replay(#[from] replay::Error),
    /// See [`crate::generator::single::Error`] for details.
    #[error(transparent)]
    Single(#[from] single::Error),
}

/// Drain `workers`, logging each failure. One worker failing never stops
/// the others.
pub(crate) async fn join_workers<E>(name: &str, workers: &mut tokio::task::JoinSet<Result<(), E>>)
where
    E: std::fmt::Display + 'static,
{
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("{name} worker failed: {err}"),
            Err(err) => error!("{name} worker panicked: {err}"),
        }
    }
}
