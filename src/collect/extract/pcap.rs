//! Pcap extractor: pulls MySQL COM_QUERY payloads out of captured traffic.

use std::io::Read;

use anyhow::{bail, Context, Result};
use etherparse::{SlicedPacket, TransportSlice};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Encoding;
use crate::query::Query;

use super::wrap_reader;

/// MySQL client command byte for a plain-text query packet.
const COM_QUERY: u8 = 0x03;

/// How to reconstruct the top-level packet, from the pcap link type.
#[derive(Debug, Clone, Copy)]
enum LinkKind {
    Ethernet,
    Ip,
}

pub struct PcapExtractor {
    reader: PcapReader<Box<dyn Read + Send>>,
    link: LinkKind,
}

impl PcapExtractor {
    pub fn new(path: &str, encoding: Encoding) -> Result<Self> {
        let file = std::fs::File::open(path).with_context(|| format!("opening {path}"))?;
        let reader = wrap_reader(encoding, file)?;
        let reader = PcapReader::new(reader).context("reading pcap header")?;

        let link = match reader.header().datalink {
            DataLink::ETHERNET => LinkKind::Ethernet,
            DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => LinkKind::Ip,
            other => bail!("unsupported pcap link type: {other:?}"),
        };

        Ok(Self { reader, link })
    }

    /// Streams COM_QUERY records until EOF, error, or cancellation. Blocking.
    pub fn run(
        mut self,
        cancel: &CancellationToken,
        out: tokio::sync::mpsc::Sender<Query>,
    ) -> Result<()> {
        let mut emitted: u64 = 0;

        while let Some(packet) = self.reader.next_packet() {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let packet = packet.context("reading pcap packet")?;

            // Truncated captures cannot carry a complete query payload.
            if (packet.data.len() as u32) < packet.orig_len {
                continue;
            }

            let Some(payload) = tcp_payload(self.link, &packet.data) else {
                continue;
            };

            // MySQL packet header is 4 bytes; the command byte follows.
            if payload.len() < 5 || payload[4] != COM_QUERY {
                continue;
            }

            let query = Query {
                raw: payload[5..].to_vec(),
                timestamp: packet.timestamp.as_secs(),
                ..Default::default()
            };

            if out.blocking_send(query).is_err() {
                return Ok(());
            }
            emitted += 1;
        }

        debug!(emitted, "pcap extraction finished");
        Ok(())
    }
}

/// Dissects a captured frame down to its TCP payload, if any.
fn tcp_payload(link: LinkKind, data: &[u8]) -> Option<&[u8]> {
    let sliced = match link {
        LinkKind::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkKind::Ip => SlicedPacket::from_ip(data).ok()?,
    };

    match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(tcp.payload()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds an Ethernet/IPv4/TCP frame carrying `payload`.
    fn tcp_frame(payload: &[u8]) -> Vec<u8> {
        let builder = etherparse::PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(33060, 3306, 1000, 64_000);

        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    fn mysql_com_query(sql: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(sql.len() + 5);
        let body_len = (sql.len() + 1) as u32;
        payload.extend_from_slice(&body_len.to_le_bytes()[..3]);
        payload.push(0); // sequence id
        payload.push(COM_QUERY);
        payload.extend_from_slice(sql);
        payload
    }

    #[test]
    fn test_tcp_payload_extraction() {
        let frame = tcp_frame(b"hello");
        let payload = tcp_payload(LinkKind::Ethernet, &frame).unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_com_query_detection() {
        let payload = mysql_com_query(b"select 1");
        assert_eq!(payload[4], COM_QUERY);
        assert_eq!(&payload[5..], b"select 1");
    }

    #[test]
    fn test_non_tcp_frame_has_no_payload() {
        let builder = etherparse::PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(5353, 5353);
        let mut frame = Vec::new();
        builder.write(&mut frame, b"dns").unwrap();

        assert!(tcp_payload(LinkKind::Ethernet, &frame).is_none());
    }
}
