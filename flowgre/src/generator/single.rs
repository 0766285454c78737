//! The single generator.
//!
//! Sends one template packet and then `count` data packets from a single
//! virtual exporter, logging the section sizes of each. Useful for poking
//! at a collector by hand.

use std::{fmt::Write as _, net::SocketAddr};

use flowgre_payload::{Exporter, Ipv4Cidr, Netflow, Schema, netflow};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tokio::net::UdpSocket;
use tracing::info;

use super::barrage::SOURCE_ID_RANGE;
use crate::transport;

/// Flow records in every data packet
pub const FLOWS_PER_PACKET: u16 = 10;

#[derive(thiserror::Error, Debug)]
/// Errors produced by the single generator.
pub enum Error {
    /// Payload generation failed
    #[error("Payload generation failed: {0}")]
    Payload(#[from] flowgre_payload::Error),
    /// Socket setup or a send failed
    #[error(transparent)]
    Transport(#[from] transport::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Configuration of the single generator.
pub struct Config {
    /// Collector address
    pub target: SocketAddr,
    /// Fixed source port, random when `None`
    pub src_port: Option<u16>,
    /// Number of data packets after the template
    pub count: u32,
    /// Log a hex dump of every packet
    pub hexdump: bool,
    /// Schema of generated records
    pub schema: Schema,
    /// Range source addresses are drawn from
    pub src_range: Ipv4Cidr,
    /// Range destination addresses are drawn from
    pub dst_range: Ipv4Cidr,
}

/// What a run sent
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// `SourceID` the packets carried
    pub source_id: u32,
    /// Datagrams sent, the template included
    pub packets_sent: u64,
    /// Bytes sent
    pub bytes_sent: u64,
}

/// Render `buf` as a canonical hex dump: offset, sixteen bytes in two
/// groups of eight, then the printable ASCII.
#[must_use]
pub fn hex_dump(buf: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in buf.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", line * 16);
        for i in 0..16 {
            if i == 8 {
                out.push(' ');
            }
            match chunk.get(i) {
                Some(byte) => {
                    let _ = write!(out, " {byte:02x}");
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                char::from(b)
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}

async fn send(
    socket: &UdpSocket,
    config: &Config,
    kind: &str,
    packet: &Netflow,
    report: &mut Report,
) -> Result<(), Error> {
    let buf = packet.to_bytes();
    info!("Sending {kind} flow, {}", packet.size_report());
    if config.hexdump {
        info!("\n{}", hex_dump(&buf));
    }
    let bytes = transport::send_packet(socket, config.target, &buf).await?;
    info!("Wrote {bytes} bytes to {}", config.target);
    report.packets_sent += 1;
    report.bytes_sent += bytes as u64;
    Ok(())
}

/// Send the template and then `count` data packets.
///
/// # Errors
///
/// Fails if the socket cannot be bound or any send fails.
pub async fn run(config: Config) -> Result<Report, Error> {
    let mut rng = SmallRng::from_rng(&mut rand::rng());
    let source_id = rng.random_range(SOURCE_ID_RANGE);
    let mut exporter = Exporter::new(
        netflow::Config {
            schema: config.schema,
            flows_per_packet: FLOWS_PER_PACKET,
            src_range: config.src_range,
            dst_range: config.dst_range,
        },
        source_id,
    )?;
    let socket = transport::bind_sender(&mut rng, config.target, config.src_port).await?;

    let mut report = Report {
        source_id,
        ..Report::default()
    };
    let template = exporter.template();
    send(&socket, &config, "template", &template, &mut report).await?;
    for _ in 0..config.count {
        let data = exporter.data(&mut rng, FLOWS_PER_PACKET)?;
        send(&socket, &config, "data", &data, &mut report).await?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use flowgre_payload::{Netflow, Schema, TemplateCache};
    use tokio::{net::UdpSocket, time::timeout};

    use super::{Config, FLOWS_PER_PACKET, hex_dump, run};

    #[test]
    fn hex_dump_matches_canonical_layout() {
        let dump = hex_dump(b"flowgre netflow v9 generator");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "00000000  66 6c 6f 77 67 72 65 20  6e 65 74 66 6c 6f 77 20  |flowgre netflow |"
        );
        assert!(lines[1].starts_with("00000010  76 39 20 67"));
        assert!(lines[1].ends_with("|v9 generator|"));
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn hex_dump_masks_unprintable_bytes() {
        let dump = hex_dump(&[0, 9, b'A', 0xff]);
        assert!(dump.ends_with("|..A.|\n"));
    }

    #[tokio::test]
    async fn sends_template_then_count_data_packets() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.expect("binds");
        let config = Config {
            target: collector.local_addr().expect("bound"),
            src_port: None,
            count: 3,
            hexdump: true,
            schema: Schema::Generic,
            src_range: "10.1.0.0/16".parse().expect("valid cidr"),
            dst_range: "10.2.0.0/16".parse().expect("valid cidr"),
        };
        let report = run(config).await.expect("single run succeeds");
        assert_eq!(report.packets_sent, 4);

        let mut cache = TemplateCache::new();
        let mut buf = vec![0; 65_536];
        let mut bytes = 0u64;
        for n in 0..4 {
            let (len, _) = timeout(Duration::from_secs(1), collector.recv_from(&mut buf))
                .await
                .expect("datagram arrives")
                .expect("receives");
            bytes += len as u64;
            let packet = Netflow::parse_with(&buf[..len], &mut cache).expect("valid netflow");
            assert_eq!(packet.header.source_id, report.source_id);
            if n == 0 {
                assert_eq!(packet.template_flow_sets.len(), 1);
                assert!(packet.data_flow_sets.is_empty());
            } else {
                assert_eq!(packet.data_flow_sets[0].records.len(), usize::from(FLOWS_PER_PACKET));
                assert_eq!(packet.data_flow_sets[0].flow_set_id, 257);
            }
        }
        assert_eq!(report.bytes_sent, bytes);
    }
}
