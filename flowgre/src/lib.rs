//! The flowgre `NetFlow` v9 traffic tool.
//!
//! This library supports the flowgre binary found elsewhere in this project.
//! Every mode is a small pipeline of tokio tasks joined by bounded channels
//! and stopped by one shared [`flowgre_signal::Watcher`]:
//!
//! * [`generator::single`] sends a handful of packets and exits.
//! * [`generator::barrage`] runs many virtual exporters at a fixed pace.
//! * [`ingest::record`] persists every valid packet it receives.
//! * [`generator::replay`] resends recorded packets.
//! * [`ingest::proxy`] copies every valid packet to up to ten targets.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod generator;
pub mod ingest;
pub mod stats;
pub mod store;
pub mod transport;
pub mod web;
