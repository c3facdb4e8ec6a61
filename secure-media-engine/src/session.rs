//! Per-peer secure media session
//!
//! Ties one DTLS handshake to the outbound stream it keys: once the
//! handshake reaches `Established`, the server write key is installed as the
//! outbound SRTP context and frames can be sent.
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


use crate::dtls::{DtlsHandshake, HandshakeState};
use crate::error::{MediaEngineError, MediaEngineResult};
use crate::h264_payload::{EncodedFrame, H264Fragmenter};
use crate::key_material::Role;
use crate::rtp_handler::RtpPacket;
use crate::srtp_pipeline::SrtpContext;
use crate::stream::{MediaStream, StreamConfig};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// One peer: handshake, stream state and, once keyed, the outbound SRTP context
#[derive(Debug)]
pub struct Session {
    /// Session ID (for logs)
    id: Uuid,
    handshake: DtlsHandshake,
    stream: MediaStream,
    fragmenter: H264Fragmenter,
    outbound: Option<SrtpContext>,
    created_at: Instant,
}

impl Session {
    /// Wrap a fresh handshake
    pub fn new(handshake: DtlsHandshake, config: &StreamConfig) -> MediaEngineResult<Self> {
        Ok(Session {
            id: Uuid::new_v4(),
            handshake,
            stream: MediaStream::new(config),
            fragmenter: H264Fragmenter::new(config.max_payload_size)?,
            outbound: None,
            created_at: Instant::now(),
        })
    }

    /// Session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Peer address
    pub fn peer(&self) -> SocketAddr {
        self.handshake.peer()
    }

    /// Handshake state
    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// Whether frames can be sent
    pub fn is_established(&self) -> bool {
        self.outbound.is_some()
    }

    /// When the session was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Outbound stream
    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    /// Outbound stream, mutable
    pub fn stream_mut(&mut self) -> &mut MediaStream {
        &mut self.stream
    }

    /// Feed a DTLS datagram from the peer. Installs the SRTP context the
    /// moment the handshake completes.
    pub fn handle_dtls(&mut self, datagram: &[u8]) -> MediaEngineResult<HandshakeState> {
        let state = self.handshake.handle_datagram(datagram)?;

        if state == HandshakeState::Established && self.outbound.is_none() {
            if let Err(e) = self.install_keys() {
                self.handshake.fail();
                return Err(e);
            }
        }

        Ok(self.handshake.state())
    }

    /// Next DTLS datagram for the peer
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.handshake.poll_transmit()
    }

    /// All queued DTLS datagrams for the peer
    pub fn drain_transmit(&mut self) -> Vec<Vec<u8>> {
        self.handshake.drain_transmit()
    }

    /// Fail the session if its handshake ran out of time
    pub fn check_timeout(&mut self, now: Instant) -> MediaEngineResult<()> {
        self.handshake.check_timeout(now)
    }

    /// Fragment a frame into packets on this session's stream
    pub fn packetize(&mut self, frame: &EncodedFrame) -> Vec<RtpPacket> {
        self.fragmenter
            .fragment(&frame.data, frame.timestamp, &mut self.stream)
    }

    /// Apply SRTP to one packet
    pub fn protect(&mut self, packet: &RtpPacket) -> MediaEngineResult<Vec<u8>> {
        let state = self.handshake.state();
        let context = self
            .outbound
            .as_mut()
            .ok_or_else(|| MediaEngineError::InvalidSessionState {
                state: state.to_string(),
            })?;
        context.protect_packet(packet)
    }

    fn install_keys(&mut self) -> MediaEngineResult<()> {
        let keys = self.handshake.keying_material().ok_or_else(|| {
            MediaEngineError::KeyDerivationFailed("handshake established without keys".to_string())
        })?;
        self.outbound = Some(SrtpContext::new(keys.local_write(Role::Server))?);

        info!(
            session_id = %self.id,
            peer = %self.peer(),
            ssrc = self.stream.ssrc(),
            "SRTP outbound context installed"
        );
        Ok(())
    }
}
