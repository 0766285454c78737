//! The closed set of flow schemas flowgre can generate and parse.
//!
//! A schema fixes a template ID, the ordered template fields and the
//! fixed-width record layout that goes with them. Parsing maps a template
//! back onto a schema by comparing field lists.

use std::{
    fmt,
    io::{self, Write},
    net::Ipv4Addr,
    str::FromStr,
};

use bytes::Buf;
use rand::Rng;
use serde::{Deserialize, Serialize as SerdeSerialize};

use super::{Field, Template, field};
use crate::cidr::Ipv4Cidr;

const TCP: u8 = 6;
const UDP: u8 = 17;
const HTTPS_PORT: u16 = 443;

const WELL_KNOWN_PORTS: [u16; 12] = [
    21,   // ftp
    22,   // ssh
    53,   // dns
    80,   // http
    HTTPS_PORT,
    123,  // ntp
    161,  // snmp
    993,  // imaps
    3306, // mysql
    8080, // http alt
    6681, // p2p
    6682, // bittorrent
];

const HTTPS_FIELDS: [Field; 14] = [
    Field::new(field::IN_BYTES, 4),
    Field::new(field::OUT_BYTES, 4),
    Field::new(field::IN_PKTS, 4),
    Field::new(field::OUT_PKTS, 4),
    Field::new(field::IPV4_SRC_ADDR, 4),
    Field::new(field::IPV4_DST_ADDR, 4),
    Field::new(field::L4_SRC_PORT, 2),
    Field::new(field::L4_DST_PORT, 2),
    Field::new(field::PROTOCOL, 1),
    Field::new(field::TCP_FLAGS, 1),
    Field::new(field::FIRST_SWITCHED, 4),
    Field::new(field::LAST_SWITCHED, 4),
    Field::new(field::ENGINE_TYPE, 1),
    Field::new(field::ENGINE_ID, 1),
];

const GENERIC_FIELDS: [Field; 15] = [
    Field::new(field::IN_BYTES, 4),
    Field::new(field::IN_PKTS, 4),
    Field::new(field::PROTOCOL, 1),
    Field::new(field::SRC_TOS, 1),
    Field::new(field::TCP_FLAGS, 1),
    Field::new(field::L4_SRC_PORT, 2),
    Field::new(field::IPV4_SRC_ADDR, 4),
    Field::new(field::SRC_MASK, 1),
    Field::new(field::INPUT_SNMP, 2),
    Field::new(field::L4_DST_PORT, 2),
    Field::new(field::IPV4_DST_ADDR, 4),
    Field::new(field::DST_MASK, 1),
    Field::new(field::OUTPUT_SNMP, 2),
    Field::new(field::FIRST_SWITCHED, 4),
    Field::new(field::LAST_SWITCHED, 4),
];

/// Returned when a schema name is not recognized
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown flow schema '{0}', expected 'https' or 'generic'")]
pub struct UnknownSchema(String);

/// Flow schemas understood by the codec
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, SerdeSerialize)]
#[serde(rename_all = "snake_case")]
pub enum Schema {
    /// TCP flows to port 443 with in and out counters
    #[default]
    Https,
    /// TCP and UDP flows to well-known ports with interface and mask data
    Generic,
}

impl Schema {
    /// Every schema, in template ID order.
    pub const ALL: [Schema; 2] = [Schema::Https, Schema::Generic];

    /// Template ID announced for this schema.
    #[must_use]
    pub const fn template_id(self) -> u16 {
        match self {
            Schema::Https => 256,
            Schema::Generic => 257,
        }
    }

    /// Ordered template fields.
    #[must_use]
    pub fn fields(self) -> &'static [Field] {
        match self {
            Schema::Https => &HTTPS_FIELDS,
            Schema::Generic => &GENERIC_FIELDS,
        }
    }

    /// The template describing this schema.
    #[must_use]
    pub fn template(self) -> Template {
        Template::new(self.template_id(), self.fields().to_vec())
    }

    /// Encoded size of one record in bytes.
    #[must_use]
    pub fn record_len(self) -> usize {
        self.fields().iter().map(|f| usize::from(f.length)).sum()
    }

    /// Find the schema whose fields match `fields` exactly.
    #[must_use]
    pub fn from_fields(fields: &[Field]) -> Option<Self> {
        Self::ALL.into_iter().find(|schema| schema.fields() == fields)
    }

    /// Generate one random record. `uptime` is the exporter uptime in
    /// milliseconds the flow timestamps are derived from.
    pub fn generate<R>(self, rng: &mut R, src: &Ipv4Cidr, dst: &Ipv4Cidr, uptime: u32) -> FlowRecord
    where
        R: Rng + ?Sized,
    {
        match self {
            Schema::Https => FlowRecord::Https(HttpsFlow {
                in_bytes: rng.random_range(0..10_000),
                out_bytes: rng.random_range(0..10_000),
                in_pkts: rng.random_range(0..10_000),
                out_pkts: rng.random_range(0..10_000),
                ipv4_src_addr: src.sample(rng),
                ipv4_dst_addr: dst.sample(rng),
                l4_src_port: rng.random_range(0..10_000),
                l4_dst_port: HTTPS_PORT,
                protocol: TCP,
                tcp_flags: rng.random_range(0..32),
                first_switched: uptime.wrapping_sub(100),
                last_switched: uptime.wrapping_sub(10),
                engine_type: 0,
                engine_id: 0,
            }),
            Schema::Generic => {
                let protocol = if rng.random() { TCP } else { UDP };
                let tcp_flags = if protocol == TCP {
                    rng.random_range(0..32)
                } else {
                    0
                };
                let port_idx = rng.random_range(0..WELL_KNOWN_PORTS.len());
                FlowRecord::Generic(GenericFlow {
                    in_bytes: rng.random_range(0..10_000),
                    in_pkts: rng.random_range(0..10_000),
                    protocol,
                    src_tos: rng.random(),
                    tcp_flags,
                    l4_src_port: rng.random_range(0..10_000),
                    ipv4_src_addr: src.sample(rng),
                    src_mask: src.prefix_len(),
                    input_snmp: rng.random_range(1..=254),
                    l4_dst_port: WELL_KNOWN_PORTS[port_idx],
                    ipv4_dst_addr: dst.sample(rng),
                    dst_mask: dst.prefix_len(),
                    output_snmp: rng.random_range(1..=254),
                    first_switched: uptime.wrapping_sub(100),
                    last_switched: uptime.wrapping_sub(10),
                })
            }
        }
    }

    /// Decode one record. The caller guarantees `buf` holds at least
    /// [`Schema::record_len`] bytes.
    pub(crate) fn decode<B>(self, buf: &mut B) -> FlowRecord
    where
        B: Buf,
    {
        match self {
            Schema::Https => FlowRecord::Https(HttpsFlow {
                in_bytes: buf.get_u32(),
                out_bytes: buf.get_u32(),
                in_pkts: buf.get_u32(),
                out_pkts: buf.get_u32(),
                ipv4_src_addr: Ipv4Addr::from(buf.get_u32()),
                ipv4_dst_addr: Ipv4Addr::from(buf.get_u32()),
                l4_src_port: buf.get_u16(),
                l4_dst_port: buf.get_u16(),
                protocol: buf.get_u8(),
                tcp_flags: buf.get_u8(),
                first_switched: buf.get_u32(),
                last_switched: buf.get_u32(),
                engine_type: buf.get_u8(),
                engine_id: buf.get_u8(),
            }),
            Schema::Generic => FlowRecord::Generic(GenericFlow {
                in_bytes: buf.get_u32(),
                in_pkts: buf.get_u32(),
                protocol: buf.get_u8(),
                src_tos: buf.get_u8(),
                tcp_flags: buf.get_u8(),
                l4_src_port: buf.get_u16(),
                ipv4_src_addr: Ipv4Addr::from(buf.get_u32()),
                src_mask: buf.get_u8(),
                input_snmp: buf.get_u16(),
                l4_dst_port: buf.get_u16(),
                ipv4_dst_addr: Ipv4Addr::from(buf.get_u32()),
                dst_mask: buf.get_u8(),
                output_snmp: buf.get_u16(),
                first_switched: buf.get_u32(),
                last_switched: buf.get_u32(),
            }),
        }
    }
}

impl FromStr for Schema {
    type Err = UnknownSchema;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "https" => Ok(Schema::Https),
            "generic" => Ok(Schema::Generic),
            _ => Err(UnknownSchema(s.to_string())),
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Https => f.write_str("https"),
            Schema::Generic => f.write_str("generic"),
        }
    }
}

/// Record of the [`Schema::Https`] template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct HttpsFlow {
    pub in_bytes: u32,
    pub out_bytes: u32,
    pub in_pkts: u32,
    pub out_pkts: u32,
    pub ipv4_src_addr: Ipv4Addr,
    pub ipv4_dst_addr: Ipv4Addr,
    pub l4_src_port: u16,
    pub l4_dst_port: u16,
    pub protocol: u8,
    pub tcp_flags: u8,
    pub first_switched: u32,
    pub last_switched: u32,
    pub engine_type: u8,
    pub engine_id: u8,
}

/// Record of the [`Schema::Generic`] template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct GenericFlow {
    pub in_bytes: u32,
    pub in_pkts: u32,
    pub protocol: u8,
    pub src_tos: u8,
    pub tcp_flags: u8,
    pub l4_src_port: u16,
    pub ipv4_src_addr: Ipv4Addr,
    pub src_mask: u8,
    pub input_snmp: u16,
    pub l4_dst_port: u16,
    pub ipv4_dst_addr: Ipv4Addr,
    pub dst_mask: u8,
    pub output_snmp: u16,
    pub first_switched: u32,
    pub last_switched: u32,
}

/// One data record, tagged by the schema that lays it out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowRecord {
    /// See [`HttpsFlow`]
    Https(HttpsFlow),
    /// See [`GenericFlow`]
    Generic(GenericFlow),
}

impl FlowRecord {
    /// Schema this record belongs to.
    #[must_use]
    pub fn schema(&self) -> Schema {
        match self {
            FlowRecord::Https(_) => Schema::Https,
            FlowRecord::Generic(_) => Schema::Generic,
        }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schema().record_len()
    }

    /// Always false, records have a fixed non-zero width.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// IPv4 source address of the flow.
    #[must_use]
    pub fn source_addr(&self) -> Ipv4Addr {
        match self {
            FlowRecord::Https(flow) => flow.ipv4_src_addr,
            FlowRecord::Generic(flow) => flow.ipv4_src_addr,
        }
    }

    /// IPv4 destination address of the flow.
    #[must_use]
    pub fn destination_addr(&self) -> Ipv4Addr {
        match self {
            FlowRecord::Https(flow) => flow.ipv4_dst_addr,
            FlowRecord::Generic(flow) => flow.ipv4_dst_addr,
        }
    }

    /// Write the record's fields in template order, big-endian.
    ///
    /// # Errors
    ///
    /// Fails only if `writer` does.
    pub fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        match self {
            FlowRecord::Https(flow) => {
                writer.write_all(&flow.in_bytes.to_be_bytes())?;
                writer.write_all(&flow.out_bytes.to_be_bytes())?;
                writer.write_all(&flow.in_pkts.to_be_bytes())?;
                writer.write_all(&flow.out_pkts.to_be_bytes())?;
                writer.write_all(&flow.ipv4_src_addr.octets())?;
                writer.write_all(&flow.ipv4_dst_addr.octets())?;
                writer.write_all(&flow.l4_src_port.to_be_bytes())?;
                writer.write_all(&flow.l4_dst_port.to_be_bytes())?;
                writer.write_all(&[flow.protocol, flow.tcp_flags])?;
                writer.write_all(&flow.first_switched.to_be_bytes())?;
                writer.write_all(&flow.last_switched.to_be_bytes())?;
                writer.write_all(&[flow.engine_type, flow.engine_id])?;
            }
            FlowRecord::Generic(flow) => {
                writer.write_all(&flow.in_bytes.to_be_bytes())?;
                writer.write_all(&flow.in_pkts.to_be_bytes())?;
                writer.write_all(&[flow.protocol, flow.src_tos, flow.tcp_flags])?;
                writer.write_all(&flow.l4_src_port.to_be_bytes())?;
                writer.write_all(&flow.ipv4_src_addr.octets())?;
                writer.write_all(&[flow.src_mask])?;
                writer.write_all(&flow.input_snmp.to_be_bytes())?;
                writer.write_all(&flow.l4_dst_port.to_be_bytes())?;
                writer.write_all(&flow.ipv4_dst_addr.octets())?;
                writer.write_all(&[flow.dst_mask])?;
                writer.write_all(&flow.output_snmp.to_be_bytes())?;
                writer.write_all(&flow.first_switched.to_be_bytes())?;
                writer.write_all(&flow.last_switched.to_be_bytes())?;
            }
        }
        Ok(())
    }
}
