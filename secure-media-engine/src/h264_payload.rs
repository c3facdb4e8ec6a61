//! H.264 frame fragmentation into RTP packets
//!
//! Every packet payload starts with a 2-byte fragmentation indicator (an
//! FU-A indicator byte followed by an FU header) and carries at most
//! `max_payload_size` bytes of the encoded frame after it. The receiver side
//! ([`FrameAssembler`]) uses the same four constants, which are agreed out of
//! band and not self-describing on the wire.
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
use crate::rtp_handler::{RtpHeader, RtpPacket, RTP_HEADER_LEN};
use crate::stream::MediaStream;
use bytes::{BufMut, Bytes, BytesMut};

/// Length of the fragmentation indicator prepended to each payload
pub const H264_FU_HEADER_LEN: usize = 2;

/// Frame bytes per packet when nothing else is configured
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1400;

/// FU indicator 0x1c (F=0, NRI=0, type 28) with FU header S=1, E=1, type 9
pub const FRAGMENT_WHOLE: u16 = 0x1cc9;
/// FU header S=1: first packet of a multi-packet frame
pub const FRAGMENT_START: u16 = 0x1c89;
/// FU header S=0, E=0: any packet between first and last
pub const FRAGMENT_CONTINUATION: u16 = 0x1c09;
/// FU header E=1: last packet of a multi-packet frame
pub const FRAGMENT_END: u16 = 0x1c49;

/// Position of a packet inside its frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentIndicator {
    /// Frame fits in a single packet
    Whole,
    /// First packet
    Start,
    /// Neither first nor last
    Continuation,
    /// Last packet
    End,
}

impl FragmentIndicator {
    /// Wire value
    pub fn value(self) -> u16 {
        match self {
            FragmentIndicator::Whole => FRAGMENT_WHOLE,
            FragmentIndicator::Start => FRAGMENT_START,
            FragmentIndicator::Continuation => FRAGMENT_CONTINUATION,
            FragmentIndicator::End => FRAGMENT_END,
        }
    }

    /// Decode a wire value
    pub fn from_value(value: u16) -> Option<Self> {
        match value {
            FRAGMENT_WHOLE => Some(FragmentIndicator::Whole),
            FRAGMENT_START => Some(FragmentIndicator::Start),
            FRAGMENT_CONTINUATION => Some(FragmentIndicator::Continuation),
            FRAGMENT_END => Some(FragmentIndicator::End),
            _ => None,
        }
    }

    /// Read the indicator at the start of a packet payload
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() < H264_FU_HEADER_LEN {
            return None;
        }
        Self::from_value(u16::from_be_bytes([payload[0], payload[1]]))
    }

    /// Indicator for chunk `index` of `count`
    pub fn for_position(index: usize, count: usize) -> Self {
        match (index == 0, index + 1 == count) {
            (true, true) => FragmentIndicator::Whole,
            (true, false) => FragmentIndicator::Start,
            (false, true) => FragmentIndicator::End,
            (false, false) => FragmentIndicator::Continuation,
        }
    }

    /// Whether this packet closes its frame
    pub fn is_last(self) -> bool {
        matches!(self, FragmentIndicator::Whole | FragmentIndicator::End)
    }
}

/// Encoded frame handed over by the encoder
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Encoded bytes (one access unit)
    pub data: Bytes,
    /// Presentation timestamp in media clock ticks
    pub timestamp: u32,
}

impl EncodedFrame {
    /// Create a frame
    pub fn new(data: impl Into<Bytes>, timestamp: u32) -> Self {
        EncodedFrame {
            data: data.into(),
            timestamp,
        }
    }
}

/// Splits encoded frames into RTP packets
#[derive(Debug, Clone, Copy)]
pub struct H264Fragmenter {
    /// Frame bytes per packet, excluding RTP header and indicator
    max_payload_size: usize,
}

impl H264Fragmenter {
    /// Create a fragmenter carrying at most `max_payload_size` frame bytes per packet
    pub fn new(max_payload_size: usize) -> MediaEngineResult<Self> {
        if max_payload_size == 0 {
            return Err(MediaEngineError::ConfigError(
                "max payload size must be greater than zero".to_string(),
            ));
        }
        Ok(H264Fragmenter { max_payload_size })
    }

    /// Create a fragmenter whose packets (header + indicator + chunk) fit `mtu`
    pub fn for_mtu(mtu: usize) -> MediaEngineResult<Self> {
        let overhead = RTP_HEADER_LEN + H264_FU_HEADER_LEN;
        if mtu <= overhead {
            return Err(MediaEngineError::ConfigError(format!(
                "MTU {} leaves no room for payload after {} header bytes",
                mtu, overhead
            )));
        }
        Self::new(mtu - overhead)
    }

    /// Frame bytes per packet
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Number of packets a frame of `frame_len` bytes turns into
    pub fn packet_count(&self, frame_len: usize) -> usize {
        frame_len.div_ceil(self.max_payload_size)
    }

    /// Fragment one frame.
    ///
    /// Packets come back in transmission order, each with the next sequence
    /// number of `stream` and the frame's timestamp. An empty frame yields no
    /// packets and consumes no sequence numbers.
    pub fn fragment(
        &self,
        frame: &[u8],
        timestamp: u32,
        stream: &mut MediaStream,
    ) -> Vec<RtpPacket> {
        let count = self.packet_count(frame.len());
        let mut packets = Vec::with_capacity(count);

        for (index, chunk) in frame.chunks(self.max_payload_size).enumerate() {
            let indicator = FragmentIndicator::for_position(index, count);

            let header = RtpHeader::new(
                stream.payload_type(),
                stream.next_sequence(),
                timestamp,
                stream.ssrc(),
            )
            .with_marker(indicator.is_last());

            let mut payload = BytesMut::with_capacity(H264_FU_HEADER_LEN + chunk.len());
            payload.put_u16(indicator.value());
            payload.put_slice(chunk);

            packets.push(RtpPacket {
                header,
                payload: payload.freeze(),
            });
        }

        packets
    }
}

impl Default for H264Fragmenter {
    fn default() -> Self {
        H264Fragmenter {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Reassembles frames from in-order packets produced by [`H264Fragmenter`]
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: BytesMut,
    timestamp: Option<u32>,
    last_sequence: Option<u16>,
}

impl FrameAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet; returns the frame once its last packet arrives.
    ///
    /// A packet that does not continue the frame in progress (wrong
    /// indicator, sequence gap, changed timestamp) discards the partial frame
    /// and is reported as [`MediaEngineError::InvalidFrame`].
    pub fn push(&mut self, packet: &RtpPacket) -> MediaEngineResult<Option<EncodedFrame>> {
        let indicator = FragmentIndicator::from_payload(&packet.payload).ok_or_else(|| {
            self.reset();
            MediaEngineError::InvalidFrame("missing or unknown fragmentation indicator".to_string())
        })?;
        let chunk = &packet.payload[H264_FU_HEADER_LEN..];
        let seq = packet.header.sequence_number;

        match indicator {
            FragmentIndicator::Whole | FragmentIndicator::Start => {
                if self.timestamp.is_some() {
                    self.reset();
                    return Err(MediaEngineError::InvalidFrame(format!(
                        "new frame started at seq {} before the previous one ended",
                        seq
                    )));
                }
                self.timestamp = Some(packet.header.timestamp);
            }
            FragmentIndicator::Continuation | FragmentIndicator::End => {
                let expected = self.last_sequence.map(|s| s.wrapping_add(1));
                if self.timestamp.is_none() || expected != Some(seq) {
                    self.reset();
                    return Err(MediaEngineError::InvalidFrame(format!(
                        "fragment seq {} does not continue a frame",
                        seq
                    )));
                }
                if self.timestamp != Some(packet.header.timestamp) {
                    self.reset();
                    return Err(MediaEngineError::InvalidFrame(format!(
                        "timestamp changed inside a frame at seq {}",
                        seq
                    )));
                }
            }
        }

        self.buffer.put_slice(chunk);
        self.last_sequence = Some(seq);

        if !indicator.is_last() {
            return Ok(None);
        }

        let frame = EncodedFrame {
            data: self.buffer.split().freeze(),
            timestamp: packet.header.timestamp,
        };
        self.timestamp = None;
        Ok(Some(frame))
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.timestamp = None;
    }
}
