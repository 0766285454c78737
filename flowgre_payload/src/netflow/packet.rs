//! `NetFlow` v9 packet structures and their wire encoding.
//!
//! Everything is big-endian. A packet is a 20 byte header followed by
//! template flow sets and then data flow sets. Data flow sets are zero
//! padded to a 32-bit boundary.

use std::{
    fmt,
    io::{self, Write},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use bytes::{Buf, Bytes};
use rustc_hash::FxHashMap;
use tracing::debug;

use super::{FlowRecord, FlowTracker, Schema};
use crate::Error;

/// `NetFlow` version carried in every header
pub const VERSION: u16 = 9;

/// Flow set ID reserved for template flow sets
pub const TEMPLATE_FLOW_SET_ID: u16 = 0;

/// Smallest ID a template, and so a data flow set, may use
pub const MIN_DATA_FLOW_SET_ID: u16 = 256;

/// Flow set ID and length, shared by template and data flow sets
const FLOW_SET_HEADER_LEN: usize = 4;

fn ensure<B>(buf: &B, what: &'static str, needed: usize) -> Result<(), Error>
where
    B: Buf,
{
    if buf.remaining() < needed {
        return Err(Error::Truncated {
            what,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Whether `buf` starts with the `NetFlow` v9 version number.
///
/// Only the first two bytes are inspected.
///
/// # Errors
///
/// Returns [`Error::Truncated`] when fewer than two bytes are present.
pub fn is_valid_netflow(buf: &[u8]) -> Result<bool, Error> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo]) == VERSION),
        _ => Err(Error::Truncated {
            what: "version",
            needed: 2,
            remaining: buf.len(),
        }),
    }
}

/// `NetFlow` v9 packet header (20 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Always 9
    pub version: u16,
    /// Number of records in the packet, template records included
    pub flow_count: u16,
    /// Milliseconds since the exporter started
    pub sys_uptime: u32,
    /// Seconds since the Unix epoch
    pub unix_secs: u32,
    /// Per exporter packet sequence
    pub flow_sequence: u32,
    /// Identity of the virtual exporter
    pub source_id: u32,
}

impl Header {
    /// Encoded size in bytes.
    pub const LEN: usize = 20;

    /// Build a header for a packet of `flow_count` records, advancing the
    /// tracker's sequence.
    pub fn generate(flow_count: u16, source_id: u32, tracker: &mut FlowTracker) -> Self {
        let unix_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        Self {
            version: VERSION,
            flow_count,
            sys_uptime: tracker.uptime_millis(Instant::now()),
            unix_secs,
            flow_sequence: tracker.next_sequence(),
            source_id,
        }
    }

    /// Write the header fields in wire order.
    ///
    /// # Errors
    ///
    /// Fails only if `writer` does.
    pub fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        writer.write_all(&self.version.to_be_bytes())?;
        writer.write_all(&self.flow_count.to_be_bytes())?;
        writer.write_all(&self.sys_uptime.to_be_bytes())?;
        writer.write_all(&self.unix_secs.to_be_bytes())?;
        writer.write_all(&self.flow_sequence.to_be_bytes())?;
        writer.write_all(&self.source_id.to_be_bytes())?;
        Ok(())
    }

    fn decode<B>(buf: &mut B) -> Result<Self, Error>
    where
        B: Buf,
    {
        ensure(buf, "header", Self::LEN)?;
        Ok(Self {
            version: buf.get_u16(),
            flow_count: buf.get_u16(),
            sys_uptime: buf.get_u32(),
            unix_secs: buf.get_u32(),
            flow_sequence: buf.get_u32(),
            source_id: buf.get_u32(),
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Version: {} Count: {} SysUptime: {} UnixSecs: {} Sequence: {} SourceID: {}",
            self.version,
            self.flow_count,
            self.sys_uptime,
            self.unix_secs,
            self.flow_sequence,
            self.source_id
        )
    }
}

/// A template field: type code and width in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Field {
    /// Field type code, see [`super::field`]
    pub field_type: u16,
    /// Width of the field in data records
    pub length: u16,
}

impl Field {
    /// Create a field.
    #[must_use]
    pub const fn new(field_type: u16, length: u16) -> Self {
        Self { field_type, length }
    }
}

/// An ordered list of fields announced under a template ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    /// ID data flow sets use to refer to this template, at least 256
    pub template_id: u16,
    /// Fields in record order
    pub fields: Vec<Field>,
}

impl Template {
    /// Create a template.
    #[must_use]
    pub fn new(template_id: u16, fields: Vec<Field>) -> Self {
        Self {
            template_id,
            fields,
        }
    }

    /// Number of fields, as written on the wire.
    #[must_use]
    pub fn field_count(&self) -> u16 {
        self.fields.len() as u16
    }

    /// Encoded size: ID, count and four bytes per field.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        4 + 4 * self.fields.len()
    }

    /// Width of one data record described by this template.
    #[must_use]
    pub fn record_len(&self) -> usize {
        self.fields.iter().map(|f| usize::from(f.length)).sum()
    }

    fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        writer.write_all(&self.template_id.to_be_bytes())?;
        writer.write_all(&self.field_count().to_be_bytes())?;
        for field in &self.fields {
            writer.write_all(&field.field_type.to_be_bytes())?;
            writer.write_all(&field.length.to_be_bytes())?;
        }
        Ok(())
    }

    fn decode<B>(buf: &mut B) -> Result<Self, Error>
    where
        B: Buf,
    {
        ensure(buf, "template header", 4)?;
        let template_id = buf.get_u16();
        let field_count = usize::from(buf.get_u16());
        ensure(buf, "template fields", 4 * field_count)?;
        let fields = (0..field_count)
            .map(|_| Field::new(buf.get_u16(), buf.get_u16()))
            .collect();
        Ok(Self {
            template_id,
            fields,
        })
    }
}

/// Flow set carrying template definitions, flow set ID 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFlowSet {
    /// Encoded size of the whole flow set
    pub length: u16,
    /// Templates in wire order
    pub templates: Vec<Template>,
}

impl TemplateFlowSet {
    /// Build a template flow set, computing its length from the templates.
    #[must_use]
    pub fn new(templates: Vec<Template>) -> Self {
        let length = FLOW_SET_HEADER_LEN + templates.iter().map(Template::encoded_len).sum::<usize>();
        Self {
            length: length as u16,
            templates,
        }
    }

    /// Always [`TEMPLATE_FLOW_SET_ID`].
    #[must_use]
    pub fn flow_set_id(&self) -> u16 {
        TEMPLATE_FLOW_SET_ID
    }

    fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        writer.write_all(&TEMPLATE_FLOW_SET_ID.to_be_bytes())?;
        writer.write_all(&self.length.to_be_bytes())?;
        for template in &self.templates {
            template.write_to(writer)?;
        }
        Ok(())
    }

    /// Decode the flow set body, the bytes following ID and length.
    fn decode(length: u16, mut body: &[u8]) -> Result<Self, Error> {
        let mut templates = Vec::new();
        // anything shorter than a template header is padding
        while body.remaining() >= 4 {
            templates.push(Template::decode(&mut body)?);
        }
        Ok(Self { length, templates })
    }
}

/// Flow set carrying records for one template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFlowSet {
    /// Template ID the records are laid out by
    pub flow_set_id: u16,
    /// Encoded size including padding
    pub length: u16,
    /// Records in wire order
    pub records: Vec<FlowRecord>,
    /// Zero bytes appended to reach a 32-bit boundary
    pub padding: u8,
}

impl DataFlowSet {
    /// Build a data flow set, computing length and padding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooLarge`] if the encoded set would not fit the
    /// 16-bit length field.
    pub fn new(flow_set_id: u16, records: Vec<FlowRecord>) -> Result<Self, Error> {
        let unpadded = FLOW_SET_HEADER_LEN + records.iter().map(FlowRecord::len).sum::<usize>();
        let padding = padding_for(unpadded);
        let length = u16::try_from(unpadded + padding).map_err(|_| Error::TooLarge {
            needed: unpadded + padding,
            max_bytes: usize::from(u16::MAX),
        })?;
        Ok(Self {
            flow_set_id,
            length,
            records,
            padding: padding as u8,
        })
    }

    fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        writer.write_all(&self.flow_set_id.to_be_bytes())?;
        writer.write_all(&self.length.to_be_bytes())?;
        for record in &self.records {
            record.write_to(writer)?;
        }
        for _ in 0..self.padding {
            writer.write_all(&[0])?;
        }
        Ok(())
    }

    fn decode(flow_set_id: u16, length: u16, mut body: &[u8], schema: Schema) -> Self {
        let record_len = schema.record_len();
        let count = body.len() / record_len;
        let records = (0..count).map(|_| schema.decode(&mut body)).collect();
        Self {
            flow_set_id,
            length,
            records,
            padding: body.remaining() as u8,
        }
    }
}

/// Zero bytes needed after `unpadded` bytes to reach a 32-bit boundary.
#[must_use]
pub fn padding_for(unpadded: usize) -> usize {
    (4 - unpadded % 4) % 4
}

/// Templates known to a parser, keyed by template ID.
///
/// A template whose fields match no [`Schema`] is remembered as
/// unsupported so that data referencing it fails with a precise error.
#[derive(Debug, Default, Clone)]
pub struct TemplateCache {
    templates: FxHashMap<u16, Option<Schema>>,
}

impl TemplateCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache that already knows every built-in schema.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut cache = Self::new();
        for schema in Schema::ALL {
            cache.register(&schema.template());
        }
        cache
    }

    /// Remember `template`, returning the schema it maps to, if any.
    pub fn register(&mut self, template: &Template) -> Option<Schema> {
        let schema = Schema::from_fields(&template.fields);
        match schema {
            Some(schema) => debug!("registered template {} as {schema}", template.template_id),
            None => debug!(
                "registered template {} with {} fields, no matching schema",
                template.template_id,
                template.fields.len()
            ),
        }
        self.templates.insert(template.template_id, schema);
        schema
    }

    /// Schema for data flow sets with ID `flow_set_id`.
    ///
    /// # Errors
    ///
    /// Fails when the template is unknown or maps to no schema.
    pub fn schema(&self, flow_set_id: u16) -> Result<Schema, Error> {
        match self.templates.get(&flow_set_id) {
            Some(Some(schema)) => Ok(*schema),
            Some(None) => Err(Error::UnsupportedTemplate(flow_set_id)),
            None => Err(Error::UnknownTemplate(flow_set_id)),
        }
    }

    /// Number of templates remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether no templates are remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Byte sizes of each section of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeReport {
    /// Header bytes
    pub header: usize,
    /// Bytes across all template flow sets
    pub template: usize,
    /// Bytes across all data flow sets, padding included
    pub data: usize,
}

impl fmt::Display for SizeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Header Size: {} bytes, Template Size: {} bytes, Data Size: {} bytes",
            self.header, self.template, self.data
        )
    }
}

/// A complete `NetFlow` v9 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netflow {
    /// Packet header
    pub header: Header,
    /// Template flow sets, written before any data
    pub template_flow_sets: Vec<TemplateFlowSet>,
    /// Data flow sets
    pub data_flow_sets: Vec<DataFlowSet>,
}

impl Netflow {
    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        let report = self.size_report();
        report.header + report.template + report.data
    }

    /// Always false, a packet has at least a header.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Byte sizes per section.
    #[must_use]
    pub fn size_report(&self) -> SizeReport {
        SizeReport {
            header: Header::LEN,
            template: self
                .template_flow_sets
                .iter()
                .map(|t| usize::from(t.length))
                .sum(),
            data: self
                .data_flow_sets
                .iter()
                .map(|d| usize::from(d.length))
                .sum(),
        }
    }

    /// Write the packet in wire order.
    ///
    /// # Errors
    ///
    /// Fails only if `writer` does.
    pub fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        self.header.write_to(writer)?;
        for template in &self.template_flow_sets {
            template.write_to(writer)?;
        }
        for data in &self.data_flow_sets {
            data.write_to(writer)?;
        }
        Ok(())
    }

    /// Encode the packet into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.len());
        // writes into a Vec cannot fail
        let _ = self.write_to(&mut buf);
        Bytes::from(buf)
    }

    /// Parse a packet using only the built-in templates plus any
    /// templates the packet itself carries.
    ///
    /// # Errors
    ///
    /// See [`Netflow::parse_with`].
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        Self::parse_with(buf, &mut TemplateCache::with_builtin())
    }

    /// Parse a packet, resolving data flow sets through `cache`. Templates
    /// found in the packet are added to `cache` as they are read, so a
    /// template flow set must precede the data that uses it.
    ///
    /// # Errors
    ///
    /// Fails on truncated input, a version other than 9, a flow set
    /// length that runs past the buffer, a reserved flow set ID or data
    /// for a template that is unknown or unsupported.
    pub fn parse_with(mut buf: &[u8], cache: &mut TemplateCache) -> Result<Self, Error> {
        let header = Header::decode(&mut buf)?;
        if header.version != VERSION {
            return Err(Error::Version {
                expected: VERSION,
                found: header.version,
            });
        }

        let mut template_flow_sets = Vec::new();
        let mut data_flow_sets = Vec::new();
        while buf.has_remaining() {
            ensure(&buf, "flow set header", FLOW_SET_HEADER_LEN)?;
            let flow_set_id = buf.get_u16();
            let length = buf.get_u16();
            let body_len = usize::from(length)
                .checked_sub(FLOW_SET_HEADER_LEN)
                .filter(|body_len| *body_len <= buf.remaining())
                .ok_or(Error::FlowSetLength {
                    flow_set_id,
                    length,
                })?;
            let (body, rest) = buf.split_at(body_len);
            buf = rest;

            match flow_set_id {
                TEMPLATE_FLOW_SET_ID => {
                    let flow_set = TemplateFlowSet::decode(length, body)?;
                    if let Some(reserved) = flow_set
                        .templates
                        .iter()
                        .find(|template| template.template_id < MIN_DATA_FLOW_SET_ID)
                    {
                        return Err(Error::ReservedFlowSet(reserved.template_id));
                    }
                    for template in &flow_set.templates {
                        cache.register(template);
                    }
                    template_flow_sets.push(flow_set);
                }
                id if id < MIN_DATA_FLOW_SET_ID => return Err(Error::ReservedFlowSet(id)),
                id => {
                    let schema = cache.schema(id)?;
                    data_flow_sets.push(DataFlowSet::decode(id, length, body, schema));
                }
            }
        }

        Ok(Self {
            header,
            template_flow_sets,
            data_flow_sets,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        DataFlowSet, Field, Header, Netflow, Template, TemplateCache, TemplateFlowSet,
        is_valid_netflow, padding_for,
    };
    use crate::{Error, netflow::Schema};

    fn header(flow_count: u16) -> Header {
        Header {
            version: 9,
            flow_count,
            sys_uptime: 1_000,
            unix_secs: 1_700_000_000,
            flow_sequence: 1,
            source_id: 618,
        }
    }

    #[test]
    fn header_wire_layout() {
        let packet = Netflow {
            header: Header {
                version: 9,
                flow_count: 2,
                sys_uptime: 0x0102_0304,
                unix_secs: 0x0506_0708,
                flow_sequence: 0x090a_0b0c,
                source_id: 0x0d0e_0f10,
            },
            template_flow_sets: Vec::new(),
            data_flow_sets: Vec::new(),
        };
        assert_eq!(
            packet.to_bytes().as_ref(),
            &[
                0, 9, 0, 2, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16
            ]
        );
    }

    #[test]
    fn template_flow_set_length_counts_every_field() {
        let set = TemplateFlowSet::new(vec![Schema::Https.template()]);
        assert_eq!(set.length, 4 + 4 + 4 * 14);
        let both = TemplateFlowSet::new(vec![Schema::Https.template(), Schema::Generic.template()]);
        assert_eq!(both.length, 4 + (4 + 4 * 14) + (4 + 4 * 15));
    }

    #[test]
    fn template_wire_layout() {
        let packet = Netflow {
            header: header(1),
            template_flow_sets: vec![TemplateFlowSet::new(vec![Template::new(
                300,
                vec![Field::new(8, 4), Field::new(7, 2)],
            )])],
            data_flow_sets: Vec::new(),
        };
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 20 + 16);
        assert_eq!(&bytes[20..], &[0, 0, 0, 16, 1, 44, 0, 2, 0, 8, 0, 4, 0, 7, 0, 2]);
    }

    #[test]
    fn data_flow_set_is_padded() {
        assert_eq!(padding_for(44), 0);
        assert_eq!(padding_for(41), 3);
        assert_eq!(padding_for(42), 2);
        assert_eq!(padding_for(43), 1);
    }

    #[test]
    fn version_check_reads_two_bytes() {
        assert!(is_valid_netflow(&[0, 9]).expect("two bytes"));
        assert!(!is_valid_netflow(&[0, 10, 1, 2]).expect("four bytes"));
        assert!(!is_valid_netflow(&[0, 5]).expect("two bytes"));
        assert!(matches!(is_valid_netflow(&[9]), Err(Error::Truncated { .. })));
        assert!(matches!(is_valid_netflow(&[]), Err(Error::Truncated { .. })));
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let mut bytes = Netflow {
            header: header(0),
            template_flow_sets: Vec::new(),
            data_flow_sets: Vec::new(),
        }
        .to_bytes()
        .to_vec();
        bytes[1] = 5;
        assert!(matches!(
            Netflow::parse(&bytes),
            Err(Error::Version { found: 5, .. })
        ));
    }

    #[test]
    fn parse_rejects_short_header() {
        assert!(matches!(
            Netflow::parse(&[0, 9, 0, 1]),
            Err(Error::Truncated { what: "header", .. })
        ));
    }

    #[test]
    fn parse_rejects_overlong_flow_set() {
        let mut bytes = Netflow {
            header: header(0),
            template_flow_sets: Vec::new(),
            data_flow_sets: Vec::new(),
        }
        .to_bytes()
        .to_vec();
        bytes.extend_from_slice(&[1, 0, 0, 200, 0, 0, 0, 0]);
        assert!(matches!(
            Netflow::parse(&bytes),
            Err(Error::FlowSetLength { flow_set_id: 256, length: 200 })
        ));
    }

    #[test]
    fn parse_rejects_unknown_template() {
        let mut bytes = Netflow {
            header: header(0),
            template_flow_sets: Vec::new(),
            data_flow_sets: Vec::new(),
        }
        .to_bytes()
        .to_vec();
        bytes.extend_from_slice(&[1, 244, 0, 8, 0, 0, 0, 0]);
        assert!(matches!(Netflow::parse(&bytes), Err(Error::UnknownTemplate(500))));
        assert!(matches!(
            Netflow::parse_with(&bytes, &mut TemplateCache::new()),
            Err(Error::UnknownTemplate(500))
        ));
    }

    #[test]
    fn parse_rejects_unsupported_template() {
        let packet = Netflow {
            header: header(1),
            template_flow_sets: vec![TemplateFlowSet::new(vec![Template::new(
                400,
                vec![Field::new(8, 4)],
            )])],
            data_flow_sets: Vec::new(),
        };
        let mut bytes = packet.to_bytes().to_vec();
        bytes.extend_from_slice(&[1, 144, 0, 8, 10, 0, 0, 1]);
        assert!(matches!(Netflow::parse(&bytes), Err(Error::UnsupportedTemplate(400))));
    }

    #[test]
    fn parse_uses_cached_templates_across_packets() {
        let template = Netflow {
            header: header(1),
            template_flow_sets: vec![TemplateFlowSet::new(vec![Template::new(
                999,
                Schema::Generic.fields().to_vec(),
            )])],
            data_flow_sets: Vec::new(),
        };
        let mut cache = TemplateCache::new();
        Netflow::parse_with(&template.to_bytes(), &mut cache).expect("template parses");
        assert_eq!(cache.schema(999).expect("registered"), Schema::Generic);

        let data = Netflow {
            header: header(0),
            template_flow_sets: Vec::new(),
            data_flow_sets: vec![DataFlowSet::new(999, Vec::new()).expect("fits")],
        };
        let parsed = Netflow::parse_with(&data.to_bytes(), &mut cache).expect("data parses");
        assert_eq!(parsed, data);
    }

    #[test]
    fn parse_rejects_reserved_flow_set() {
        let mut bytes = Netflow {
            header: header(0),
            template_flow_sets: Vec::new(),
            data_flow_sets: Vec::new(),
        }
        .to_bytes()
        .to_vec();
        bytes.extend_from_slice(&[0, 1, 0, 4]);
        assert!(matches!(Netflow::parse(&bytes), Err(Error::ReservedFlowSet(1))));
    }

    #[test]
    fn parse_rejects_template_with_reserved_id() {
        let packet = Netflow {
            header: header(2),
            template_flow_sets: vec![TemplateFlowSet::new(vec![
                Template::new(300, Schema::Https.fields().to_vec()),
                Template::new(255, Schema::Https.fields().to_vec()),
            ])],
            data_flow_sets: Vec::new(),
        };
        let mut cache = TemplateCache::new();
        assert!(matches!(
            Netflow::parse_with(&packet.to_bytes(), &mut cache),
            Err(Error::ReservedFlowSet(255))
        ));
        // nothing from a rejected flow set is remembered
        assert!(cache.is_empty());
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Netflow::parse(&bytes);
            let _ = is_valid_netflow(&bytes);
        }
    }
}
