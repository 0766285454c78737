//! Partial IPFIX (RFC 7011) codec.
//!
//! Only the message header and template records are modelled. Nothing in
//! flowgre routes traffic through IPFIX yet.

use std::io::{self, Write};

use bytes::Buf;

use crate::Error;

/// IPFIX version number
pub const VERSION: u16 = 10;

/// High bit of a field specifier's ID, set when an enterprise number follows
pub const ENTERPRISE_BIT: u16 = 0x8000;

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

/// IPFIX message header (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Always 10 for IPFIX
    pub version: u16,
    /// Total message length including this header
    pub length: u16,
    /// Seconds since the Unix epoch at export
    pub export_time: u32,
    /// Running count of data records sent
    pub sequence_number: u32,
    /// Exporter's observation domain
    pub observation_domain_id: u32,
}

impl Header {
    /// Encoded size in bytes.
    pub const LEN: usize = 16;

    /// Whether the header carries IPFIX values: version 10 and a length
    /// that covers at least the header itself.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.version == VERSION && usize::from(self.length) >= Self::LEN
    }

    /// Write the header in wire order.
    ///
    /// # Errors
    ///
    /// Fails only if `writer` does.
    pub fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        writer.write_all(&self.version.to_be_bytes())?;
        writer.write_all(&self.length.to_be_bytes())?;
        writer.write_all(&self.export_time.to_be_bytes())?;
        writer.write_all(&self.sequence_number.to_be_bytes())?;
        writer.write_all(&self.observation_domain_id.to_be_bytes())?;
        Ok(())
    }

    /// Decode a header from the front of `buf`. The values are not
    /// checked, see [`Header::is_valid`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Truncated`] if fewer than 16 bytes remain.
    pub fn decode<B>(buf: &mut B) -> Result<Self, Error>
    where
        B: Buf,
    {
        ensure(buf, "ipfix header", Self::LEN)?;
        Ok(Self {
            version: buf.get_u16(),
            length: buf.get_u16(),
            export_time: buf.get_u32(),
            sequence_number: buf.get_u32(),
            observation_domain_id: buf.get_u32(),
        })
    }
}

/// Field specifier inside a template record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateField {
    /// Information element ID, without the enterprise bit
    pub field_id: u16,
    /// Width in bytes, 65535 for variable length
    pub field_length: u16,
    /// IANA private enterprise number for vendor elements
    pub enterprise_id: Option<u32>,
}

impl TemplateField {
    fn encoded_len(&self) -> usize {
        if self.enterprise_id.is_some() { 8 } else { 4 }
    }
}

/// IPFIX template record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRecord {
    /// Template ID. 0 marks a scope template
    pub template_id: u16,
    /// Scope field count, only on the wire when `template_id` is 0
    pub scope_field_count: u16,
    /// Field specifiers in record order
    pub fields: Vec<TemplateField>,
}

impl TemplateRecord {
    fn is_scoped(&self) -> bool {
        self.template_id == 0
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let head = if self.is_scoped() { 6 } else { 4 };
        head + self.fields.iter().map(TemplateField::encoded_len).sum::<usize>()
    }

    /// Write the record in wire order.
    ///
    /// # Errors
    ///
    /// Fails only if `writer` does.
    pub fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        writer.write_all(&self.template_id.to_be_bytes())?;
        writer.write_all(&(self.fields.len() as u16).to_be_bytes())?;
        if self.is_scoped() {
            writer.write_all(&self.scope_field_count.to_be_bytes())?;
        }
        for field in &self.fields {
            match field.enterprise_id {
                Some(enterprise_id) => {
                    writer.write_all(&(field.field_id | ENTERPRISE_BIT).to_be_bytes())?;
                    writer.write_all(&field.field_length.to_be_bytes())?;
                    writer.write_all(&enterprise_id.to_be_bytes())?;
                }
                None => {
                    writer.write_all(&field.field_id.to_be_bytes())?;
                    writer.write_all(&field.field_length.to_be_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Decode one template record from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Truncated`] if the record runs past the buffer.
    pub fn decode<B>(buf: &mut B) -> Result<Self, Error>
    where
        B: Buf,
    {
        ensure(buf, "ipfix template header", 4)?;
        let template_id = buf.get_u16();
        let field_count = buf.get_u16();
        let scope_field_count = if template_id == 0 {
            ensure(buf, "ipfix scope field count", 2)?;
            buf.get_u16()
        } else {
            0
        };

        let mut fields = Vec::with_capacity(usize::from(field_count));
        for _ in 0..field_count {
            ensure(buf, "ipfix field specifier", 4)?;
            let raw_id = buf.get_u16();
            let field_length = buf.get_u16();
            let enterprise_id = if raw_id & ENTERPRISE_BIT == 0 {
                None
            } else {
                ensure(buf, "ipfix enterprise number", 4)?;
                Some(buf.get_u32())
            };
            fields.push(TemplateField {
                field_id: raw_id & !ENTERPRISE_BIT,
                field_length,
                enterprise_id,
            });
        }

        Ok(Self {
            template_id,
            scope_field_count,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{Header, TemplateField, TemplateRecord};
    use crate::Error;

    #[test]
    fn header_validity() {
        let mut header = Header {
            version: 10,
            length: 16,
            export_time: 1_700_000_000,
            sequence_number: 1,
            observation_domain_id: 42,
        };
        assert!(header.is_valid());
        header.length = 15;
        assert!(!header.is_valid());
        header.length = 100;
        header.version = 9;
        assert!(!header.is_valid());
    }

    #[test]
    fn header_wire_layout() {
        let header = Header {
            version: 10,
            length: 32,
            export_time: 0x0102_0304,
            sequence_number: 5,
            observation_domain_id: 6,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).expect("vec write");
        assert_eq!(buf, [0, 10, 0, 32, 1, 2, 3, 4, 0, 0, 0, 5, 0, 0, 0, 6]);
        assert_eq!(Header::decode(&mut buf.as_slice()).expect("decodes"), header);
    }

    #[test]
    fn short_header_is_an_error() {
        let buf = [0u8, 10, 0, 16];
        assert!(matches!(
            Header::decode(&mut &buf[..]),
            Err(Error::Truncated { needed: 16, remaining: 4, .. })
        ));
    }

    #[test]
    fn enterprise_field_carries_its_number() {
        let record = TemplateRecord {
            template_id: 256,
            scope_field_count: 0,
            fields: vec![
                TemplateField {
                    field_id: 8,
                    field_length: 4,
                    enterprise_id: None,
                },
                TemplateField {
                    field_id: 1,
                    field_length: 65_535,
                    enterprise_id: Some(29_305),
                },
            ],
        };
        let mut buf = Vec::new();
        record.write_to(&mut buf).expect("vec write");
        assert_eq!(buf.len(), record.encoded_len());
        assert_eq!(&buf[8..10], &[0x80, 0x01]);
        assert_eq!(TemplateRecord::decode(&mut buf.as_slice()).expect("decodes"), record);
    }

    #[test]
    fn scope_template_reads_scope_count() {
        let buf = [0u8, 0, 0, 1, 0, 1, 0, 10, 0, 4];
        let record = TemplateRecord::decode(&mut &buf[..]).expect("decodes");
        assert_eq!(record.scope_field_count, 1);
        assert_eq!(record.fields.len(), 1);
        assert_eq!(record.fields[0].field_id, 10);
    }

    #[test]
    fn truncated_enterprise_number_is_an_error() {
        let buf = [1u8, 0, 0, 1, 0x80, 5, 0, 4, 0, 0];
        assert!(matches!(
            TemplateRecord::decode(&mut &buf[..]),
            Err(Error::Truncated { what: "ipfix enterprise number", .. })
        ));
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = Header::decode(&mut bytes.as_slice());
            let _ = TemplateRecord::decode(&mut bytes.as_slice());
        }
    }
}
