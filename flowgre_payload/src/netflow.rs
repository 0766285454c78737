//! `NetFlow` v9 payload.
//!
//! [`Exporter`] plays one virtual exporter: it owns a [`FlowTracker`] and a
//! `SourceID` and builds template, data and combined packets from a
//! [`Schema`].
//!
//! `FlowCount` in the header counts records. A template-only packet
//! carries one, a data packet of N records carries N, and a combined
//! packet carries N + 1.

use std::io::Write;

use rand::Rng;

use crate::{Error, Serialize, cidr::Ipv4Cidr};

pub mod field;
mod packet;
mod schema;
mod tracker;

pub use packet::{
    DataFlowSet, Field, Header, MIN_DATA_FLOW_SET_ID, Netflow, SizeReport, TEMPLATE_FLOW_SET_ID,
    Template, TemplateCache, TemplateFlowSet, VERSION, is_valid_netflow, padding_for,
};
pub use schema::{FlowRecord, GenericFlow, HttpsFlow, Schema, UnknownSchema};
pub use tracker::{FlowTracker, UPTIME_BIAS_MILLIS};

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

/// Configuration for `NetFlow` v9 payload generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Schema of generated records
    pub schema: Schema,
    /// Records per data packet produced through [`Serialize`]
    pub flows_per_packet: u16,
    /// Range source addresses are drawn from
    pub src_range: Ipv4Cidr,
    /// Range destination addresses are drawn from
    pub dst_range: Ipv4Cidr,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Fails if `flows_per_packet` is zero or a packet of that many
    /// records cannot fit in one UDP datagram.
    pub fn valid(&self) -> Result<(), Error> {
        let needed = data_packet_len(self.schema, usize::from(self.flows_per_packet.max(1)));
        if self.flows_per_packet == 0 || needed > MAX_DATAGRAM_BYTES {
            return Err(Error::TooLarge {
                needed,
                max_bytes: MAX_DATAGRAM_BYTES,
            });
        }
        Ok(())
    }
}

/// Size of a data-only packet of `records` records.
fn data_packet_len(schema: Schema, records: usize) -> usize {
    let unpadded = 4 + records * schema.record_len();
    Header::LEN + unpadded + padding_for(unpadded)
}

#[derive(Debug)]
/// `NetFlow` v9 payload generator for one virtual exporter
pub struct Exporter {
    config: Config,
    source_id: u32,
    tracker: FlowTracker,
    data_points: Option<u64>,
}

impl Exporter {
    /// Create an exporter with a fresh tracker.
    ///
    /// # Errors
    ///
    /// Fails if `config` is not valid, see [`Config::valid`].
    pub fn new(config: Config, source_id: u32) -> Result<Self, Error> {
        config.valid()?;
        Ok(Self {
            config,
            source_id,
            tracker: FlowTracker::new(),
            data_points: None,
        })
    }

    /// `SourceID` stamped on every header.
    #[must_use]
    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    /// The exporter configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sequence of the most recent packet.
    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.tracker.sequence()
    }

    /// A packet announcing the schema's template.
    pub fn template(&mut self) -> Netflow {
        Netflow {
            header: Header::generate(1, self.source_id, &mut self.tracker),
            template_flow_sets: vec![self.template_flow_set()],
            data_flow_sets: Vec::new(),
        }
    }

    /// A packet of `count` data records.
    ///
    /// # Errors
    ///
    /// Fails if the records cannot fit in one data flow set.
    pub fn data<R>(&mut self, rng: &mut R, count: u16) -> Result<Netflow, Error>
    where
        R: Rng + ?Sized,
    {
        let data = self.data_flow_set(rng, count)?;
        Ok(Netflow {
            header: Header::generate(count, self.source_id, &mut self.tracker),
            template_flow_sets: Vec::new(),
            data_flow_sets: vec![data],
        })
    }

    /// A packet carrying the template followed by `count` data records.
    ///
    /// # Errors
    ///
    /// Fails if the records cannot fit in one data flow set, or `count + 1`
    /// overflows the header's flow count.
    pub fn combined<R>(&mut self, rng: &mut R, count: u16) -> Result<Netflow, Error>
    where
        R: Rng + ?Sized,
    {
        let flow_count = count.checked_add(1).ok_or(Error::TooLarge {
            needed: usize::from(count) + 1,
            max_bytes: usize::from(u16::MAX),
        })?;
        let data = self.data_flow_set(rng, count)?;
        Ok(Netflow {
            header: Header::generate(flow_count, self.source_id, &mut self.tracker),
            template_flow_sets: vec![self.template_flow_set()],
            data_flow_sets: vec![data],
        })
    }

    fn template_flow_set(&self) -> TemplateFlowSet {
        TemplateFlowSet::new(vec![self.config.schema.template()])
    }

    fn data_flow_set<R>(&self, rng: &mut R, count: u16) -> Result<DataFlowSet, Error>
    where
        R: Rng + ?Sized,
    {
        let schema = self.config.schema;
        let uptime = self.tracker.uptime_millis(std::time::Instant::now());
        let records = (0..count)
            .map(|_| schema.generate(rng, &self.config.src_range, &self.config.dst_range, uptime))
            .collect();
        DataFlowSet::new(schema.template_id(), records)
    }
}

impl Serialize for Exporter {
    /// Write one data packet of `flows_per_packet` records, or fewer if
    /// that many would overrun `max_bytes`.
    fn to_bytes<W, R>(&mut self, mut rng: R, max_bytes: usize, writer: &mut W) -> Result<(), Error>
    where
        R: Rng + Sized,
        W: Write,
    {
        let record_len = self.config.schema.record_len();
        // header, flow set header and worst case padding
        let budget = max_bytes.saturating_sub(Header::LEN + 4 + 3) / record_len;
        let count = usize::from(self.config.flows_per_packet).min(budget);
        if count == 0 {
            self.data_points = None;
            return Err(Error::TooLarge {
                needed: data_packet_len(self.config.schema, 1),
                max_bytes,
            });
        }

        let packet = self.data(&mut rng, count as u16)?;
        packet.write_to(writer)?;
        self.data_points = Some(count as u64);
        Ok(())
    }

    fn data_points_generated(&self) -> Option<u64> {
        self.data_points
    }
}
