//! Outbound media stream context
//!
//! One per session: the SSRC, the sequence counter and the send statistics.
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


use crate::h264_payload::DEFAULT_MAX_PAYLOAD_SIZE;

/// Dynamic payload type for H.264 (a=rtpmap:96 H264/90000)
pub const H264_PAYLOAD_TYPE: u8 = 96;

/// Video media clock rate
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Stream configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Payload type
    pub payload_type: u8,
    /// Media clock rate in Hz
    pub clock_rate: u32,
    /// Frame bytes per packet
    pub max_payload_size: usize,
    /// Fixed SSRC; random when `None`
    pub ssrc: Option<u32>,
    /// First sequence number; random when `None`
    pub initial_sequence: Option<u16>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            payload_type: H264_PAYLOAD_TYPE,
            clock_rate: VIDEO_CLOCK_RATE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            ssrc: None,
            initial_sequence: None,
        }
    }
}

/// Stream statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// Frames handed to the stream
    pub frames_sent: u64,
    /// Packets written to the socket
    pub packets_sent: u64,
    /// Protected bytes written to the socket
    pub bytes_sent: u64,
    /// Packets whose write failed (sequence numbers still consumed)
    pub send_failures: u64,
}

/// Per-session outbound stream state.
///
/// The sequence counter is only advanced through [`MediaStream::next_sequence`],
/// so every packet built for this stream gets the next number exactly once.
#[derive(Debug)]
pub struct MediaStream {
    ssrc: u32,
    payload_type: u8,
    clock_rate: u32,
    next_sequence: u16,
    /// Statistics
    pub stats: StreamStats,
}

impl MediaStream {
    /// Create a stream, drawing SSRC and initial sequence from `rand` when unset
    pub fn new(config: &StreamConfig) -> Self {
        MediaStream {
            ssrc: config.ssrc.unwrap_or_else(rand::random),
            payload_type: config.payload_type & 0x7F,
            clock_rate: config.clock_rate,
            next_sequence: config.initial_sequence.unwrap_or_else(rand::random),
            stats: StreamStats::default(),
        }
    }

    /// Create a stream with explicit identifiers
    pub fn with_identifiers(payload_type: u8, ssrc: u32, initial_sequence: u16) -> Self {
        MediaStream::new(&StreamConfig {
            payload_type,
            ssrc: Some(ssrc),
            initial_sequence: Some(initial_sequence),
            ..StreamConfig::default()
        })
    }

    /// Allocate the next sequence number (wraps 65535 -> 0)
    pub fn next_sequence(&mut self) -> u16 {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        seq
    }

    /// Sequence number the next packet will carry
    pub fn peek_sequence(&self) -> u16 {
        self.next_sequence
    }

    /// Synchronization source of this stream
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Payload type written into every header
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Media clock rate in Hz
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }
}
