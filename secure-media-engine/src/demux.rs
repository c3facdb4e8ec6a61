//! Datagram demultiplexing on a shared UDP port (RFC 7983)
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


/// Protocol a datagram belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    /// First byte 0..=3
    Stun,
    /// First byte 20..=63
    Dtls,
    /// First byte 128..=191 (RTP and RTCP)
    Rtp,
    /// Anything else, including empty datagrams
    Unknown,
}

/// Classify a datagram by its first byte
pub fn classify(datagram: &[u8]) -> DatagramKind {
    match datagram.first() {
        Some(0..=3) => DatagramKind::Stun,
        Some(20..=63) => DatagramKind::Dtls,
        Some(128..=191) => DatagramKind::Rtp,
        _ => DatagramKind::Unknown,
    }
}

/// Whether a datagram starts with an epoch-0 DTLS ClientHello record.
///
/// Record header: content type (1), version (2), epoch (2), sequence (6),
/// length (2); the handshake message type follows at offset 13.
pub fn is_client_hello(datagram: &[u8]) -> bool {
    datagram.len() > 13 && datagram[0] == 22 && datagram[3..5] == [0, 0] && datagram[13] == 1
}
