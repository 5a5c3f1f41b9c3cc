// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire codec for multicast datagrams, unicast stream frames and
//! acknowledgements.
//!
//! All integers are big-endian.
//!
//! Multicast datagram:
//!
//! ```text
//!  0: publisher context id (u32)
//!  4: payload length (u16) - bytes following this header
//!  6: publisher backchannel IPv4 address (u32, 0 = datagram source)
//! 10: publisher backchannel TCP port (u16)
//! 12: packet records, repeated:
//!       pid (u64), length (u16), payload[length]
//! ```
//!
//! Unicast stream frames (publisher -> subscriber retransmissions):
//!
//! ```text
//!  0: kind (u8) = FRAME_KIND_PACKET
//!  1: pid (u64)
//!  9: length (u16)
//! 11: payload[length]
//! ```
//!
//! Acknowledgement (subscriber -> publisher):
//!
//! ```text
//!  0: kind (u8) = FRAME_KIND_ACK
//!  1: subscriber context id (u32)
//!  5: highest contiguous pid acknowledged (u64)
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{Error, Result};

/// Multicast header length in bytes.
pub const HEADER_LEN: usize = 12;

/// Per-record prefix length (pid + length).
pub const RECORD_PREFIX_LEN: usize = 10;

/// Stream frame kind: packet retransmission.
pub const FRAME_KIND_PACKET: u8 = 0x01;

/// Stream frame kind: acknowledgement.
pub const FRAME_KIND_ACK: u8 = 0x02;

/// Encoded acknowledgement length.
pub const ACK_LEN: usize = 13;

/// Packet stream frame prefix length (kind + pid + length).
pub const FRAME_PREFIX_LEN: usize = 1 + RECORD_PREFIX_LEN;

/// Length field value for `len`, rejecting lengths a u16 prefix cannot carry.
fn length_prefix(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::MalformedPacket("length exceeds u16 prefix"))
}

fn be_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn be_u64(buf: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    u64::from_be_bytes(raw)
}

/// Fixed header at the start of every multicast datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastHeader {
    pub context_id: u32,
    pub payload_len: u16,
    pub listen_ip: Ipv4Addr,
    pub listen_port: u16,
}

impl MulticastHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.context_id.to_be_bytes());
        out.extend_from_slice(&self.payload_len.to_be_bytes());
        out.extend_from_slice(&u32::from(self.listen_ip).to_be_bytes());
        out.extend_from_slice(&self.listen_port.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::MalformedPacket("datagram shorter than header"));
        }
        Ok(Self {
            context_id: be_u32(&buf[0..4]),
            payload_len: be_u16(&buf[4..6]),
            listen_ip: Ipv4Addr::from(be_u32(&buf[6..10])),
            listen_port: be_u16(&buf[10..12]),
        })
    }

    /// Address of the publisher's backchannel listener.
    ///
    /// An unspecified listen address falls back to the datagram source IP.
    #[must_use]
    pub fn backchannel_addr(&self, from: SocketAddr) -> SocketAddr {
        let ip = if self.listen_ip.is_unspecified() {
            match from {
                SocketAddr::V4(v4) => *v4.ip(),
                SocketAddr::V6(_) => Ipv4Addr::LOCALHOST,
            }
        } else {
            self.listen_ip
        };
        SocketAddr::V4(SocketAddrV4::new(ip, self.listen_port))
    }
}

/// One packet carried inside a datagram or stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRecord<'a> {
    pub pid: u64,
    pub payload: &'a [u8],
}

/// Append a packet record (no frame kind) to `out`.
///
/// Payloads longer than `u16::MAX` are rejected and `out` is left untouched.
pub fn encode_record(pid: u64, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let len = length_prefix(payload.len())?;
    out.extend_from_slice(&pid.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Iterator over the packet records of a datagram body.
#[derive(Debug, Clone)]
pub struct Records<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<PacketRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < RECORD_PREFIX_LEN {
            self.rest = &[];
            return Some(Err(Error::MalformedPacket("truncated record prefix")));
        }
        let pid = be_u64(&self.rest[0..8]);
        let len = be_u16(&self.rest[8..10]) as usize;
        let end = RECORD_PREFIX_LEN + len;
        if self.rest.len() < end {
            self.rest = &[];
            return Some(Err(Error::MalformedPacket("record payload exceeds datagram")));
        }
        let payload = &self.rest[RECORD_PREFIX_LEN..end];
        self.rest = &self.rest[end..];
        Some(Ok(PacketRecord { pid, payload }))
    }
}

/// Decoded multicast datagram.
#[derive(Debug, Clone)]
pub struct Datagram<'a> {
    pub header: MulticastHeader,
    body: &'a [u8],
}

impl<'a> Datagram<'a> {
    /// Decode a datagram received by context `own_context_id`.
    ///
    /// Datagrams sent by the same context yield `Error::SelfLoopback`.
    pub fn decode(buf: &'a [u8], own_context_id: u32) -> Result<Self> {
        let header = MulticastHeader::decode(buf)?;
        if header.context_id == own_context_id {
            return Err(Error::SelfLoopback);
        }
        let body = &buf[HEADER_LEN..];
        if body.len() != header.payload_len as usize {
            return Err(Error::MalformedPacket("payload length mismatch"));
        }
        Ok(Self { header, body })
    }

    pub fn records(&self) -> Records<'a> {
        Records { rest: self.body }
    }
}

/// Build a complete multicast datagram. Used by publishers and tests.
///
/// Fails with `MalformedPacket` when the records do not fit the u16 length
/// field of the header.
pub fn encode_datagram(
    context_id: u32,
    backchannel: SocketAddrV4,
    packets: &[(u64, &[u8])],
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for (pid, payload) in packets {
        encode_record(*pid, payload, &mut body)?;
    }
    let payload_len = length_prefix(body.len())?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    MulticastHeader {
        context_id,
        payload_len,
        listen_ip: *backchannel.ip(),
        listen_port: backchannel.port(),
    }
    .encode(&mut out);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Append a packet stream frame to `out`.
pub fn encode_packet_frame(pid: u64, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    length_prefix(payload.len())?;
    out.push(FRAME_KIND_PACKET);
    encode_record(pid, payload, out)
}

/// Drain every complete packet frame from a connection's receive buffer.
///
/// Incomplete trailing bytes stay in `buffer`. An unknown frame kind makes the
/// stream undecodable and is reported as `MalformedPacket`.
pub fn drain_packet_frames(buffer: &mut Vec<u8>) -> Result<Vec<(u64, Vec<u8>)>> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while buffer.len() - offset >= FRAME_PREFIX_LEN {
        let frame = &buffer[offset..];
        if frame[0] != FRAME_KIND_PACKET {
            buffer.drain(..offset);
            return Err(Error::MalformedPacket("unknown stream frame kind"));
        }
        let pid = be_u64(&frame[1..9]);
        let len = be_u16(&frame[9..11]) as usize;
        if frame.len() < FRAME_PREFIX_LEN + len {
            break;
        }
        frames.push((pid, frame[FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + len].to_vec()));
        offset += FRAME_PREFIX_LEN + len;
    }

    buffer.drain(..offset);
    Ok(frames)
}

/// Coalesced acknowledgement for one publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMessage {
    /// Acknowledging subscriber.
    pub context_id: u32,
    /// Highest contiguous pid acknowledged.
    pub pid: u64,
}

impl AckMessage {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(FRAME_KIND_ACK);
        out.extend_from_slice(&self.context_id.to_be_bytes());
        out.extend_from_slice(&self.pid.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ACK_LEN {
            return Err(Error::MalformedPacket("acknowledgement too short"));
        }
        if buf[0] != FRAME_KIND_ACK {
            return Err(Error::MalformedPacket("not an acknowledgement frame"));
        }
        Ok(Self {
            context_id: be_u32(&buf[1..5]),
            pid: be_u64(&buf[5..13]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backchannel() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 4724)
    }

    #[test]
    fn test_datagram_records() {
        let buf = encode_datagram(0xABCD, backchannel(), &[(1, b"2:1:3"), (2, b"2:2:3")]).unwrap();
        let datagram = Datagram::decode(&buf, 1).expect("decodes");
        assert_eq!(datagram.header.context_id, 0xABCD);
        assert_eq!(datagram.header.listen_port, 4724);

        let records: Vec<_> = datagram.records().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pid, 1);
        assert_eq!(records[1].payload, b"2:2:3");
    }

    #[test]
    fn test_own_datagram_is_loopback() {
        let buf = encode_datagram(77, backchannel(), &[(1, b"x")]).unwrap();
        assert!(matches!(Datagram::decode(&buf, 77), Err(Error::SelfLoopback)));
    }

    #[test]
    fn test_truncated_datagrams_rejected() {
        assert!(matches!(
            Datagram::decode(&[0u8; 5], 1),
            Err(Error::MalformedPacket(_))
        ));

        let mut buf = encode_datagram(9, backchannel(), &[(1, b"abcdef")]).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(matches!(
            Datagram::decode(&buf, 1),
            Err(Error::MalformedPacket("payload length mismatch"))
        ));
    }

    #[test]
    fn test_record_overrun_reported_once() {
        let mut body = Vec::new();
        encode_record(1, b"ok", &mut body).unwrap();
        body.extend_from_slice(&5u64.to_be_bytes());
        body.extend_from_slice(&100u16.to_be_bytes());
        let mut records = Records { rest: &body };
        assert!(records.next().unwrap().is_ok());
        assert!(records.next().unwrap().is_err());
        assert!(records.next().is_none());
    }

    #[test]
    fn test_backchannel_falls_back_to_source() {
        let header = MulticastHeader {
            context_id: 1,
            payload_len: 0,
            listen_ip: Ipv4Addr::UNSPECIFIED,
            listen_port: 5000,
        };
        let from: SocketAddr = "192.168.0.9:4723".parse().unwrap();
        assert_eq!(
            header.backchannel_addr(from),
            "192.168.0.9:5000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_stream_frames_keep_partial_tail() {
        let mut stream = Vec::new();
        encode_packet_frame(4, b"one", &mut stream).unwrap();
        encode_packet_frame(5, b"two", &mut stream).unwrap();
        let split = stream.len() - 2;
        let tail = stream.split_off(split);

        let frames = drain_packet_frames(&mut stream).unwrap();
        assert_eq!(frames, vec![(4, b"one".to_vec())]);
        assert!(!stream.is_empty());

        stream.extend_from_slice(&tail);
        let frames = drain_packet_frames(&mut stream).unwrap();
        assert_eq!(frames, vec![(5, b"two".to_vec())]);
        assert!(stream.is_empty());
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let big = vec![0u8; usize::from(u16::MAX) + 1];

        let mut out = vec![0xEE];
        assert!(matches!(
            encode_packet_frame(1, &big, &mut out),
            Err(Error::MalformedPacket(_))
        ));
        assert!(matches!(
            encode_record(1, &big, &mut out),
            Err(Error::MalformedPacket(_))
        ));
        assert_eq!(out, vec![0xEE]);

        // Each record fits, the datagram body does not.
        let half = vec![0u8; 40_000];
        assert!(matches!(
            encode_datagram(1, backchannel(), &[(1, &half), (2, &half)]),
            Err(Error::MalformedPacket(_))
        ));
        assert!(encode_datagram(1, backchannel(), &[(1, &half)]).is_ok());
    }

    #[test]
    fn test_unknown_stream_frame_kind() {
        let mut stream = vec![0x7F; FRAME_PREFIX_LEN];
        assert!(drain_packet_frames(&mut stream).is_err());
    }

    #[test]
    fn test_ack_layout() {
        let mut out = Vec::new();
        AckMessage {
            context_id: 0x0102_0304,
            pid: 9,
        }
        .encode(&mut out);
        assert_eq!(out.len(), ACK_LEN);
        assert_eq!(out[0], FRAME_KIND_ACK);
        assert_eq!(&out[1..5], &[1, 2, 3, 4]);
        assert_eq!(AckMessage::decode(&out).unwrap().pid, 9);
    }
}
