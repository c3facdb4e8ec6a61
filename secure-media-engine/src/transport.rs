//! Protected transport sender
//!
//! Every media packet leaves through [`SrtpSender`], which applies the
//! session's SRTP context before the datagram reaches the socket.
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
use crate::h264_payload::EncodedFrame;
use crate::rtp_handler::RtpPacket;
use crate::session::Session;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

/// Something that can write one datagram to a peer
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send `datagram` to `peer`, returning the bytes written
    async fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl DatagramTransport for UdpSocket {
    async fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, datagram, peer).await
    }
}

/// Outcome of sending one frame
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    /// Packets the frame was split into
    pub packets: usize,
    /// Packets written
    pub packets_sent: usize,
    /// Packets that failed to protect or write
    pub send_failures: usize,
    /// Protected bytes written
    pub bytes_sent: usize,
}

/// Protects and writes packets for established sessions
pub struct SrtpSender<T: DatagramTransport + ?Sized> {
    transport: Arc<T>,
}

impl<T: DatagramTransport + ?Sized> SrtpSender<T> {
    /// Sender over `transport`
    pub fn new(transport: Arc<T>) -> Self {
        SrtpSender { transport }
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Protect one packet with the session's outbound context and write it.
    ///
    /// Fails with `InvalidSessionState` before the session is established;
    /// unprotected media is never written.
    pub async fn send(&self, session: &mut Session, packet: &RtpPacket) -> MediaEngineResult<usize> {
        let protected = session.protect(packet)?;
        let peer = session.peer();

        let result = match self.transport.send_to(&protected, peer).await {
            Ok(n) if n == protected.len() => Ok(n),
            Ok(n) => Err(MediaEngineError::SendFailed(format!(
                "short write to {}: {} of {} bytes",
                peer,
                n,
                protected.len()
            ))),
            Err(e) => Err(MediaEngineError::SendFailed(format!("{}: {}", peer, e))),
        };

        let stats = &mut session.stream_mut().stats;
        match &result {
            Ok(n) => {
                stats.packets_sent += 1;
                stats.bytes_sent += *n as u64;
            }
            Err(_) => stats.send_failures += 1,
        }
        result
    }

    /// Fragment `frame` and send every packet.
    ///
    /// A packet that fails is logged and counted, and the rest of the frame
    /// still goes out; its sequence number stays consumed. An empty frame is
    /// a no-op.
    pub async fn send_frame(
        &self,
        session: &mut Session,
        frame: &EncodedFrame,
    ) -> MediaEngineResult<SendReport> {
        if !session.is_established() {
            return Err(MediaEngineError::InvalidSessionState {
                state: session.state().to_string(),
            });
        }

        let mut report = SendReport::default();
        if frame.data.is_empty() {
            return Ok(report);
        }

        let packets = session.packetize(frame);
        report.packets = packets.len();
        session.stream_mut().stats.frames_sent += 1;

        for packet in &packets {
            match self.send(session, packet).await {
                Ok(n) => {
                    report.packets_sent += 1;
                    report.bytes_sent += n;
                }
                Err(e) => {
                    report.send_failures += 1;
                    warn!(
                        session_id = %session.id(),
                        seq = packet.header.sequence_number,
                        error = %e,
                        "Failed to send packet"
                    );
                }
            }
        }

        trace!(
            session_id = %session.id(),
            timestamp = frame.timestamp,
            packets = report.packets,
            "Frame sent"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtls::{DtlsServer, DtlsServerConfig};
    use crate::stream::StreamConfig;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    #[async_trait]
    impl DatagramTransport for RecordingTransport {
        async fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<usize> {
            self.sent.lock().unwrap().push((datagram.to_vec(), peer));
            Ok(datagram.len())
        }
    }

    fn pending_session() -> Session {
        let server = DtlsServer::new(&DtlsServerConfig::default()).unwrap();
        let handshake = server
            .accept("127.0.0.1:6000".parse().unwrap(), Instant::now())
            .unwrap();
        Session::new(handshake, &StreamConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_send_refused_before_established() {
        let transport = Arc::new(RecordingTransport::default());
        let sender = SrtpSender::new(Arc::clone(&transport));
        let mut session = pending_session();
        let seq = session.stream().peek_sequence();

        let frame = EncodedFrame::new(vec![1u8; 3000], 0);
        assert!(matches!(
            sender.send_frame(&mut session, &frame).await,
            Err(MediaEngineError::InvalidSessionState { .. })
        ));

        let packet = session.packetize(&EncodedFrame::new(vec![1u8; 10], 0)).remove(0);
        assert!(sender.send(&mut session, &packet).await.is_err());

        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(session.stream().stats.packets_sent, 0);
        // refused frame consumed nothing; the explicit packetize consumed one
        assert_eq!(session.stream().peek_sequence(), seq.wrapping_add(1));
    }

    #[tokio::test]
    async fn test_udp_socket_transport() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let n = DatagramTransport::send_to(&a, b"ping", b.local_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(n, 4);

        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
