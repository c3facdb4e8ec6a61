//! RTP (Real-time Transport Protocol) packet handling
//!
//! Fixed 12-byte RFC 3550 header: no CSRC list, no header extension.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{MediaEngineError, MediaEngineResult};
use bytes::{BufMut, Bytes, BytesMut};

/// RTP protocol version carried in every header
pub const RTP_VERSION: u8 = 2;

/// Serialized header length
pub const RTP_HEADER_LEN: usize = 12;

/// RTP header as defined in RFC 3550
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (2 bits, always 2 here)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// CSRC count (4 bits, always 0 here)
    pub csrc_count: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Sequence number (16 bits)
    pub sequence_number: u16,
    /// Timestamp in media clock ticks (32 bits)
    pub timestamp: u32,
    /// SSRC (Synchronization Source) identifier (32 bits)
    pub ssrc: u32,
}

/// Complete RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,
    /// Payload data
    pub payload: Bytes,
}

impl RtpHeader {
    /// Header for one media packet; `payload_type` is truncated to 7 bits
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        RtpHeader {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence_number,
            timestamp,
            ssrc,
        }
    }

    /// Builder-style marker setter
    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Serialize to the 12-byte wire layout. Field values wider than their
    /// bit width are masked, never rejected.
    pub fn serialize(&self) -> [u8; RTP_HEADER_LEN] {
        let mut buf = [0u8; RTP_HEADER_LEN];

        // V(2) P(1) X(1) CC(4)
        buf[0] = ((self.version & 0x03) << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrc_count & 0x0F);
        // M(1) PT(7)
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);
        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        buf
    }

    /// Parse the fixed header, returning it with the bytes that follow.
    ///
    /// CSRC entries and extension headers are skipped over so the remainder
    /// is always the payload.
    pub fn parse(data: &[u8]) -> MediaEngineResult<(Self, &[u8])> {
        if data.len() < RTP_HEADER_LEN {
            return Err(MediaEngineError::RtpParseError(format!(
                "RTP header too short: {} bytes",
                data.len()
            )));
        }

        let version = (data[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(MediaEngineError::RtpParseError(format!(
                "Invalid RTP version: {}",
                version
            )));
        }

        let header = RtpHeader {
            version,
            padding: (data[0] & 0x20) != 0,
            extension: (data[0] & 0x10) != 0,
            csrc_count: data[0] & 0x0F,
            marker: (data[1] & 0x80) != 0,
            payload_type: data[1] & 0x7F,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        };

        let offset = header_length(data)?;
        Ok((header, &data[offset..]))
    }
}

/// Length of the RTP header at the start of `data`, including CSRCs and
/// extension. Used by SRTP to find where encryption starts.
pub fn header_length(data: &[u8]) -> MediaEngineResult<usize> {
    if data.len() < RTP_HEADER_LEN {
        return Err(MediaEngineError::RtpParseError(format!(
            "RTP header too short: {} bytes",
            data.len()
        )));
    }

    let mut length = RTP_HEADER_LEN + (data[0] & 0x0F) as usize * 4;

    if data[0] & 0x10 != 0 {
        if data.len() < length + 4 {
            return Err(MediaEngineError::RtpParseError(
                "Incomplete extension header".to_string(),
            ));
        }
        let words = u16::from_be_bytes([data[length + 2], data[length + 3]]) as usize;
        length += 4 + words * 4;
    }

    if data.len() < length {
        return Err(MediaEngineError::RtpParseError(format!(
            "RTP header declares {} bytes but packet has {}",
            length,
            data.len()
        )));
    }

    Ok(length)
}

impl RtpPacket {
    /// Parse RTP packet from bytes
    pub fn parse(data: &[u8]) -> MediaEngineResult<Self> {
        let (header, payload_data) = RtpHeader::parse(data)?;

        let payload = if header.padding {
            let padding_len = *payload_data.last().ok_or_else(|| {
                MediaEngineError::RtpParseError(
                    "Packet has padding flag but no payload".to_string(),
                )
            })? as usize;
            if padding_len == 0 || padding_len > payload_data.len() {
                return Err(MediaEngineError::RtpParseError(format!(
                    "Invalid padding length: {}",
                    padding_len
                )));
            }
            Bytes::copy_from_slice(&payload_data[..payload_data.len() - padding_len])
        } else {
            Bytes::copy_from_slice(payload_data)
        };

        Ok(RtpPacket { header, payload })
    }

    /// Serialize RTP packet to bytes
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_slice(&self.header.serialize());
        buf.put_slice(&self.payload);
        buf
    }

    /// Size on the wire before protection
    pub fn size(&self) -> usize {
        RTP_HEADER_LEN + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_header_parse_minimal() {
        let data = [
            0x80, 0x60, // V=2, P=0, X=0, CC=0, M=0, PT=96
            0x00, 0x01, // Sequence number = 1
            0x00, 0x00, 0x00, 0x01, // Timestamp = 1
            0x00, 0x00, 0x00, 0x01, // SSRC = 1
        ];

        let (header, remaining) = RtpHeader::parse(&data).unwrap();
        assert_eq!(header.version, 2);
        assert!(!header.padding);
        assert!(!header.extension);
        assert_eq!(header.csrc_count, 0);
        assert!(!header.marker);
        assert_eq!(header.payload_type, 96);
        assert_eq!(header.sequence_number, 1);
        assert_eq!(header.timestamp, 1);
        assert_eq!(header.ssrc, 1);
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_rtp_header_layout() {
        let header = RtpHeader::new(96, 0xABCD, 90_000, 0x1000).with_marker(true);

        assert_eq!(
            header.serialize(),
            [0x80, 0xE0, 0xAB, 0xCD, 0x00, 0x01, 0x5F, 0x90, 0x00, 0x00, 0x10, 0x00]
        );
    }

    #[test]
    fn test_rtp_header_masks_wide_fields() {
        let mut header = RtpHeader::new(0xFF, 7, 0, 0);
        assert_eq!(header.payload_type, 0x7F);

        header.csrc_count = 0x1F;
        header.version = 0x06;
        let bytes = header.serialize();
        assert_eq!(bytes[0], 0x80 | 0x0F);
        assert_eq!(bytes[1], 0x7F);
    }

    #[test]
    fn test_rtp_header_round_trip() {
        for &(marker, pt, seq, ts, ssrc) in &[
            (false, 0u8, 0u16, 0u32, 0u32),
            (true, 96, 65535, u32::MAX, u32::MAX),
            (true, 127, 10, 90_000, 0x1000),
        ] {
            let header = RtpHeader::new(pt, seq, ts, ssrc).with_marker(marker);
            let bytes = header.serialize();
            let (parsed, rest) = RtpHeader::parse(&bytes).unwrap();
            assert_eq!(parsed, header);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn test_rtp_header_rejects_short_and_wrong_version() {
        assert!(RtpHeader::parse(&[0x80; 11]).is_err());

        let mut bytes = RtpHeader::new(96, 1, 1, 1).serialize();
        bytes[0] = 0x40;
        assert!(matches!(
            RtpHeader::parse(&bytes),
            Err(MediaEngineError::RtpParseError(_))
        ));
    }

    #[test]
    fn test_rtp_packet_serialize() {
        let packet = RtpPacket {
            header: RtpHeader::new(96, 1, 1, 1),
            payload: Bytes::from("test payload"),
        };

        let serialized = packet.serialize();
        assert_eq!(serialized.len(), packet.size());

        let parsed = RtpPacket::parse(&serialized).unwrap();
        assert_eq!(packet, parsed);
    }

    #[test]
    fn test_header_length_with_csrc_and_extension() {
        let mut data = vec![0x80 | 0x10 | 0x01, 96, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1];
        data.extend_from_slice(&[0, 0, 0, 9]); // one CSRC
        data.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01]); // extension, one word
        data.extend_from_slice(&[1, 2, 3, 4]);
        data.extend_from_slice(b"payload");

        assert_eq!(header_length(&data).unwrap(), 24);
        let (_, payload) = RtpHeader::parse(&data).unwrap();
        assert_eq!(payload, b"payload");
    }
}
