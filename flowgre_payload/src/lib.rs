//! The flowgre payloads
//!
//! This library holds the `NetFlow` v9 codec used by every flowgre
//! pipeline, the flow schemas it generates, CIDR sampling for synthetic
//! addresses and a partial IPFIX codec.

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
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

use std::io::{self, Write};

use rand::Rng;

pub mod cidr;
pub mod ipfix;
pub mod netflow;

pub use cidr::Ipv4Cidr;
pub use netflow::{Exporter, FlowTracker, Netflow, Schema, TemplateCache};

/// Errors related to encoding and decoding flow packets
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// IO operation failed
    #[error("IO operation failed: {0}")]
    Io(#[from] io::Error),
    /// Buffer ended before a complete structure could be read
    #[error("{what} needs {needed} bytes but only {remaining} remain")]
    Truncated {
        /// The structure being decoded
        what: &'static str,
        /// Bytes required to decode it
        needed: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },
    /// Packet carried a version this codec does not speak
    #[error("unexpected version {found}, expected {expected}")]
    Version {
        /// Version the codec expects
        expected: u16,
        /// Version found on the wire
        found: u16,
    },
    /// A flow set declared a length that cannot be right
    #[error("flow set {flow_set_id} declares invalid length {length}")]
    FlowSetLength {
        /// ID of the offending flow set
        flow_set_id: u16,
        /// Declared length
        length: u16,
    },
    /// Data flow set references a template that has not been seen
    #[error("no template registered for flow set {0}")]
    UnknownTemplate(u16),
    /// Data flow set references a template whose fields match no schema
    #[error("template {0} does not describe a supported flow schema")]
    UnsupportedTemplate(u16),
    /// A flow set ID in the reserved range 1..=255 appeared
    #[error("flow set id {0} is reserved")]
    ReservedFlowSet(u16),
    /// Packet would not fit in the space allotted to it
    #[error("packet of {needed} bytes exceeds the {max_bytes} byte limit")]
    TooLarge {
        /// Smallest size the packet could take
        needed: usize,
        /// Limit imposed by the caller
        max_bytes: usize,
    },
}

/// To serialize into bytes
pub trait Serialize {
    /// Write bytes into writer, subject to `max_bytes` limitations.
    ///
    /// # Errors
    ///
    /// Implementations fail when the payload cannot fit in `max_bytes` or
    /// the writer refuses the bytes.
    fn to_bytes<W, R>(&mut self, rng: R, max_bytes: usize, writer: &mut W) -> Result<(), Error>
    where
        R: Rng + Sized,
        W: Write;

    /// Reports data points count for the most recently generated content.
    ///
    /// Call this immediately after `to_bytes`, the value is overwritten by
    /// the next call. `None` means the serializer does not track data
    /// points.
    fn data_points_generated(&self) -> Option<u64> {
        None
    }
}
