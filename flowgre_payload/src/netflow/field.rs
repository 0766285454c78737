//! `NetFlow` v9 field type codes used by the flowgre schemas.
//!
//! Values follow the field type table of RFC 3954, section 8.

/// Incoming counter of bytes for the flow
pub const IN_BYTES: u16 = 1;
/// Incoming counter of packets for the flow
pub const IN_PKTS: u16 = 2;
/// IP protocol byte
pub const PROTOCOL: u16 = 4;
/// Type of service byte on the incoming interface
pub const SRC_TOS: u16 = 5;
/// Cumulative OR of TCP flags seen in the flow
pub const TCP_FLAGS: u16 = 6;
/// Transport source port
pub const L4_SRC_PORT: u16 = 7;
/// IPv4 source address
pub const IPV4_SRC_ADDR: u16 = 8;
/// Source address prefix mask bits
pub const SRC_MASK: u16 = 9;
/// Input interface index
pub const INPUT_SNMP: u16 = 10;
/// Transport destination port
pub const L4_DST_PORT: u16 = 11;
/// IPv4 destination address
pub const IPV4_DST_ADDR: u16 = 12;
/// Destination address prefix mask bits
pub const DST_MASK: u16 = 13;
/// Output interface index
pub const OUTPUT_SNMP: u16 = 14;
/// System uptime at which the last packet of the flow was switched
pub const LAST_SWITCHED: u16 = 21;
/// System uptime at which the first packet of the flow was switched
pub const FIRST_SWITCHED: u16 = 22;
/// Outgoing counter of bytes for the flow
pub const OUT_BYTES: u16 = 23;
/// Outgoing counter of packets for the flow
pub const OUT_PKTS: u16 = 24;
/// Type of flow switching engine
pub const ENGINE_TYPE: u16 = 38;
/// ID number of the flow switching engine
pub const ENGINE_ID: u16 = 39;
