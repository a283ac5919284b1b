//! Data-plane framing.
//!
//! TCP samples travel as length-delimited frames on a dedicated data
//! connection; UDP samples put one frame header in every datagram. All
//! integers are big-endian.

use crate::error::{ProbeError, Result};
use common::{TCP_FRAME_HEADER_BYTES, UDP_HEADER_BYTES};

/// UDP datagram types.
pub const DGRAM_DATA: u8 = 0;
pub const DGRAM_PING: u8 = 1;
pub const DGRAM_PONG: u8 = 2;
pub const DGRAM_END: u8 = 3;

/// Header of a TCP data frame: `{sample_id: u32, payload_len: u32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFrameHeader {
    pub sample_id: u32,
    pub payload_len: u32,
}

impl TcpFrameHeader {
    pub fn encode(&self) -> [u8; TCP_FRAME_HEADER_BYTES] {
        let mut buf = [0u8; TCP_FRAME_HEADER_BYTES];
        buf[0..4].copy_from_slice(&self.sample_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; TCP_FRAME_HEADER_BYTES]) -> Self {
        Self {
            sample_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            payload_len: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Header of a UDP datagram: `{type: u8, sample_id: u32, seq: u64}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub kind: u8,
    pub sample_id: u32,
    pub seq: u64,
}

impl UdpHeader {
    pub fn encode(&self) -> [u8; UDP_HEADER_BYTES] {
        let mut buf = [0u8; UDP_HEADER_BYTES];
        buf[0] = self.kind;
        buf[1..5].copy_from_slice(&self.sample_id.to_be_bytes());
        buf[5..13].copy_from_slice(&self.seq.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < UDP_HEADER_BYTES {
            return None;
        }
        Some(Self {
            kind: buf[0],
            sample_id: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            seq: u64::from_be_bytes([
                buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11], buf[12],
            ]),
        })
    }
}

/// Payload length for a TCP chunk of `chunk_bytes` (header included).
/// Chunks smaller than header-plus-one are rejected.
pub fn tcp_payload_len(chunk_bytes: usize) -> Result<usize> {
    if chunk_bytes <= TCP_FRAME_HEADER_BYTES {
        return Err(ProbeError::Config(format!(
            "chunk of {} bytes cannot carry a payload (header is {} bytes)",
            chunk_bytes, TCP_FRAME_HEADER_BYTES
        )));
    }
    Ok(chunk_bytes - TCP_FRAME_HEADER_BYTES)
}

/// Datagram size for a UDP chunk: the requested chunk clamped into
/// `[header+1, mtu]`.
pub fn udp_datagram_len(chunk_bytes: usize, mtu: usize) -> usize {
    chunk_bytes.clamp(UDP_HEADER_BYTES + 1, mtu.max(UDP_HEADER_BYTES + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_header_round_trip() {
        let hdr = TcpFrameHeader {
            sample_id: 0x01020304,
            payload_len: 8192,
        };
        let buf = hdr.encode();
        assert_eq!(buf[0..4], [1, 2, 3, 4]);
        assert_eq!(TcpFrameHeader::decode(&buf), hdr);
    }

    #[test]
    fn test_udp_header_round_trip() {
        let hdr = UdpHeader {
            kind: DGRAM_DATA,
            sample_id: 7,
            seq: u64::MAX - 1,
        };
        let buf = hdr.encode();
        assert_eq!(UdpHeader::decode(&buf), Some(hdr));
        assert_eq!(UdpHeader::decode(&buf[..12]), None);
    }

    #[test]
    fn test_tcp_payload_len_bounds() {
        assert!(tcp_payload_len(8).is_err());
        assert!(tcp_payload_len(0).is_err());
        assert_eq!(tcp_payload_len(9).unwrap(), 1);
        assert_eq!(tcp_payload_len(16384).unwrap(), 16376);
    }

    #[test]
    fn test_udp_datagram_clamp() {
        assert_eq!(udp_datagram_len(1200, 1472), 1200);
        assert_eq!(udp_datagram_len(9000, 1472), 1472);
        assert_eq!(udp_datagram_len(4, 1472), UDP_HEADER_BYTES + 1);
    }
}
