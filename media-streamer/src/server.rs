//! UDP streaming server
//!
//! One task owns the socket and the peer registry. Every datagram is
//! classified by its first byte: STUN requests are answered, DTLS records
//! drive the peer's handshake, inbound RTP is ignored. Frames arriving on the
//! frame channel are sent to every established session.
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


use crate::error::{StreamerError, StreamerResult};
use secure_media_engine::{
    classify, is_client_hello, BindingResponder, DatagramKind, DtlsServer, DtlsServerConfig,
    EncodedFrame, HandshakeState, Session, SrtpSender, StreamConfig,
};
use srtpcast_config::StreamerConfig;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Largest datagram the server reads
const RECV_BUFFER_SIZE: usize = 2048;

/// Frames buffered between the source and the server loop
const FRAME_CHANNEL_CAPACITY: usize = 16;

/// How often handshake timeouts are checked
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(250);

/// Streamer settings
#[derive(Debug, Clone)]
pub struct StreamerSettings {
    /// UDP address to bind
    pub listen_addr: SocketAddr,
    /// DTLS identity and handshake limits
    pub dtls: DtlsServerConfig,
    /// RTP stream parameters for each new session
    pub stream: StreamConfig,
    /// ICE password; STUN binding requests are answered when set
    pub ice_password: Option<String>,
    /// Maximum number of peers, pending or established
    pub max_sessions: usize,
}

impl From<&StreamerConfig> for StreamerSettings {
    fn from(config: &StreamerConfig) -> Self {
        StreamerSettings {
            listen_addr: config.listen_addr,
            dtls: DtlsServerConfig {
                certificate_path: config.certificate_path.clone(),
                private_key_path: config.private_key_path.clone(),
                mtu: config.dtls_mtu,
                handshake_timeout: config.handshake_timeout(),
            },
            stream: StreamConfig {
                payload_type: config.payload_type,
                clock_rate: config.clock_rate,
                max_payload_size: config.max_payload_size,
                ssrc: None,
                initial_sequence: None,
            },
            ice_password: config.ice_password.clone(),
            max_sessions: config.max_sessions,
        }
    }
}

/// Counters reported when the server stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamerStats {
    /// Datagrams read from the socket
    pub datagrams_received: u64,
    /// Datagrams discarded without a reply
    pub datagrams_dropped: u64,
    /// STUN binding responses sent
    pub stun_responses: u64,
    /// Peers that got a session
    pub sessions_accepted: u64,
    /// Sessions that completed the handshake
    pub sessions_established: u64,
    /// Sessions removed after a failure, timeout or eviction
    pub sessions_failed: u64,
    /// Frames taken from the frame channel
    pub frames_received: u64,
    /// SRTP packets written
    pub packets_sent: u64,
    /// SRTP packets that failed to protect or write
    pub send_failures: u64,
}

/// DTLS-SRTP streaming server
pub struct MediaStreamer {
    socket: Arc<UdpSocket>,
    dtls: DtlsServer,
    stun: Option<BindingResponder>,
    sender: SrtpSender<UdpSocket>,
    stream_config: StreamConfig,
    max_sessions: usize,
    sessions: HashMap<SocketAddr, Session>,
    frames_tx: mpsc::Sender<EncodedFrame>,
    frames_rx: mpsc::Receiver<EncodedFrame>,
    stats: StreamerStats,
}

impl MediaStreamer {
    /// Bind the socket and build the DTLS context
    pub async fn bind(settings: StreamerSettings) -> StreamerResult<Self> {
        if settings.max_sessions == 0 {
            return Err(StreamerError::ConfigError(
                "max_sessions must be greater than zero".to_string(),
            ));
        }

        let dtls = DtlsServer::new(&settings.dtls)?;
        let socket = UdpSocket::bind(settings.listen_addr).await.map_err(|e| {
            StreamerError::NetworkError(format!("Failed to bind {}: {}", settings.listen_addr, e))
        })?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| StreamerError::NetworkError(e.to_string()))?;
        let socket = Arc::new(socket);
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        info!(
            listen_addr = %local_addr,
            max_sessions = settings.max_sessions,
            stun = settings.ice_password.is_some(),
            "Media streamer bound"
        );

        Ok(MediaStreamer {
            sender: SrtpSender::new(Arc::clone(&socket)),
            socket,
            dtls,
            stun: settings.ice_password.map(BindingResponder::new),
            stream_config: settings.stream,
            max_sessions: settings.max_sessions,
            sessions: HashMap::new(),
            frames_tx,
            frames_rx,
            stats: StreamerStats::default(),
        })
    }

    /// Bound socket address
    pub fn local_addr(&self) -> StreamerResult<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| StreamerError::NetworkError(e.to_string()))
    }

    /// SHA-256 certificate fingerprint to advertise to clients
    pub fn fingerprint(&self) -> &str {
        self.dtls.fingerprint()
    }

    /// Channel for encoded frames; every frame goes to all established sessions
    pub fn frame_sender(&self) -> mpsc::Sender<EncodedFrame> {
        self.frames_tx.clone()
    }

    /// Number of tracked peers
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(mut self, shutdown: F) -> StreamerResult<StreamerStats>
    where
        F: Future<Output = ()>,
    {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(sessions = self.sessions.len(), "Media streamer shutting down");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    // e.g. ICMP port unreachable reported on a later read
                    Err(e) => warn!(error = %e, "Socket receive failed"),
                },
                Some(frame) = self.frames_rx.recv() => self.broadcast(frame).await,
                _ = housekeeping.tick() => self.expire_handshakes(Instant::now()),
            }
        }

        Ok(self.stats)
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        self.stats.datagrams_received += 1;

        match classify(datagram) {
            DatagramKind::Stun => self.handle_stun(datagram, from).await,
            DatagramKind::Dtls => self.handle_dtls(datagram, from).await,
            DatagramKind::Rtp => {
                trace!(peer = %from, len = datagram.len(), "Ignoring inbound RTP/RTCP");
            }
            DatagramKind::Unknown => {
                self.stats.datagrams_dropped += 1;
                debug!(peer = %from, len = datagram.len(), "Dropping unclassified datagram");
            }
        }
    }

    async fn handle_stun(&mut self, datagram: &[u8], from: SocketAddr) {
        let Some(responder) = &self.stun else {
            self.stats.datagrams_dropped += 1;
            debug!(peer = %from, "STUN disabled, dropping request");
            return;
        };

        match responder.respond(datagram, from) {
            Ok(response) => match self.socket.send_to(&response, from).await {
                Ok(_) => self.stats.stun_responses += 1,
                Err(e) => warn!(peer = %from, error = %e, "Failed to send STUN response"),
            },
            Err(e) => {
                self.stats.datagrams_dropped += 1;
                debug!(peer = %from, error = %e, "Rejected STUN message");
            }
        }
    }

    async fn handle_dtls(&mut self, datagram: &[u8], from: SocketAddr) {
        // a peer restarting from the same address starts over
        let restarted = self
            .sessions
            .get(&from)
            .map_or(false, |s| s.is_established() && is_client_hello(datagram));
        if restarted {
            if let Some(old) = self.sessions.remove(&from) {
                info!(session_id = %old.id(), peer = %from, "Peer restarted handshake, replacing session");
            }
        }

        if !self.sessions.contains_key(&from) {
            if !is_client_hello(datagram) {
                self.stats.datagrams_dropped += 1;
                debug!(peer = %from, "DTLS record from unknown peer is not a ClientHello, dropping");
                return;
            }
            if !self.accept_peer(from) {
                return;
            }
        }
        let Some(session) = self.sessions.get_mut(&from) else {
            return;
        };

        let session_id = session.id();
        let was_established = session.is_established();
        let result = session.handle_dtls(datagram);
        let outgoing = session.drain_transmit();

        for record in outgoing {
            if let Err(e) = self.socket.send_to(&record, from).await {
                warn!(session_id = %session_id, peer = %from, error = %e, "Failed to send DTLS record");
            }
        }

        match result {
            Ok(HandshakeState::Established) if !was_established => {
                self.stats.sessions_established += 1;
                info!(session_id = %session_id, peer = %from, "Session established");
            }
            Ok(state) => trace!(session_id = %session_id, peer = %from, %state, "DTLS record handled"),
            Err(e) => {
                self.stats.sessions_failed += 1;
                warn!(session_id = %session_id, peer = %from, error = %e, "Handshake failed, dropping session");
                self.sessions.remove(&from);
            }
        }
    }

    /// Register a new peer; false when the datagram should be dropped.
    ///
    /// At the session limit the oldest peer that has not yet returned a valid
    /// cookie makes room; peers with a verified address are never evicted.
    fn accept_peer(&mut self, from: SocketAddr) -> bool {
        if self.sessions.len() >= self.max_sessions && !self.evict_unverified() {
            self.stats.datagrams_dropped += 1;
            warn!(peer = %from, max_sessions = self.max_sessions, "Session limit reached, dropping datagram");
            return false;
        }

        let session = self
            .dtls
            .accept(from, Instant::now())
            .and_then(|handshake| Session::new(handshake, &self.stream_config));

        match session {
            Ok(session) => {
                self.stats.sessions_accepted += 1;
                info!(session_id = %session.id(), peer = %from, "New DTLS peer");
                self.sessions.insert(from, session);
                true
            }
            Err(e) => {
                error!(peer = %from, error = %e, "Failed to create session");
                false
            }
        }
    }

    fn evict_unverified(&mut self) -> bool {
        let oldest = self
            .sessions
            .iter()
            .filter(|(_, s)| matches!(s.state(), HandshakeState::Listening | HandshakeState::CookieSent))
            .min_by_key(|(_, s)| s.created_at())
            .map(|(peer, _)| *peer);

        match oldest.and_then(|peer| self.sessions.remove(&peer)) {
            Some(session) => {
                self.stats.sessions_failed += 1;
                info!(session_id = %session.id(), peer = %session.peer(), "Evicting unverified peer at session limit");
                true
            }
            None => false,
        }
    }

    async fn broadcast(&mut self, frame: EncodedFrame) {
        self.stats.frames_received += 1;

        for session in self.sessions.values_mut().filter(|s| s.is_established()) {
            match self.sender.send_frame(session, &frame).await {
                Ok(report) => {
                    self.stats.packets_sent += report.packets_sent as u64;
                    self.stats.send_failures += report.send_failures as u64;
                }
                Err(e) => warn!(session_id = %session.id(), error = %e, "Frame not sent"),
            }
        }
    }

    fn expire_handshakes(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (peer, session) in self.sessions.iter_mut() {
            if let Err(e) = session.check_timeout(now) {
                warn!(session_id = %session.id(), peer = %peer, error = %e, "Dropping session");
                expired.push(*peer);
            }
        }

        for peer in expired {
            self.stats.sessions_failed += 1;
            self.sessions.remove(&peer);
        }
    }
}
