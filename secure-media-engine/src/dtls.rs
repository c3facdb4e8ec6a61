//! DTLS (Datagram Transport Layer Security) handshake manager
//!
//! Server side of a DTLS 1.2 handshake (RFC 6347) with the use_srtp
//! extension (RFC 5764), built on OpenSSL. The handshake is sans-IO: the
//! owner feeds inbound datagrams with [`DtlsHandshake::handle_datagram`] and
//! writes whatever [`DtlsHandshake::poll_transmit`] hands back to the peer.
//!
//! ```text
//! Listening --ClientHello--> CookieSent --ClientHello+cookie--> Verifying --Finished--> Established
//!     \__________________________\_________________________________\____> Failed
//! ```
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


use crate::cookie::CookieSecret;
use crate::error::{MediaEngineError, MediaEngineResult};
use crate::key_material::{SrtpKeyingMaterial, DTLS_SRTP_EXPORTER_LABEL, SRTP_KEYING_MATERIAL_LEN};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslStream,
    SslVerifyMode,
};
use openssl::x509::{X509NameBuilder, X509};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cipher list offered to clients
pub const DTLS_CIPHER_LIST: &str = "ALL:!ADH:!LOW:!EXP:!MD5:@STRENGTH";

/// The only SRTP protection profile negotiated
pub const SRTP_PROTECTION_PROFILE: &str = "SRTP_AES128_CM_SHA1_80";

/// Default DTLS record MTU
pub const DEFAULT_DTLS_MTU: u32 = 1200;

/// Default time allowed for a handshake to reach `Established`
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer for records arriving after the handshake
const POST_HANDSHAKE_READ_LEN: usize = 2048;

const SELF_SIGNED_COMMON_NAME: &str = "srtpcast";
const SELF_SIGNED_VALIDITY_DAYS: u32 = 30;

/// Handshake state (one per peer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the first ClientHello
    Listening,
    /// HelloVerifyRequest sent, waiting for the cookie to come back
    CookieSent,
    /// Cookie accepted, key exchange in progress
    Verifying,
    /// Handshake complete, keying material exported
    Established,
    /// Terminal; the session is discarded
    Failed,
}

impl HandshakeState {
    /// Whether the state can no longer change
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Established | HandshakeState::Failed)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Listening => "listening",
            HandshakeState::CookieSent => "cookie_sent",
            HandshakeState::Verifying => "verifying",
            HandshakeState::Established => "established",
            HandshakeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// In-memory datagram pipe between OpenSSL and the socket owner.
///
/// Reads pop whole datagrams and report `WouldBlock` when none are queued,
/// which OpenSSL turns into `WANT_READ`. Every write is one outbound datagram.
#[derive(Debug, Default)]
pub struct DatagramChannel {
    incoming: VecDeque<Vec<u8>>,
    outgoing: VecDeque<Vec<u8>>,
}

impl DatagramChannel {
    /// Queue a datagram received from the peer
    pub fn push_incoming(&mut self, datagram: &[u8]) {
        self.incoming.push_back(datagram.to_vec());
    }

    /// Next datagram to send to the peer
    pub fn pop_outgoing(&mut self) -> Option<Vec<u8>> {
        self.outgoing.pop_front()
    }
}

impl Read for DatagramChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.incoming.pop_front() {
            Some(datagram) => {
                // datagram semantics: excess bytes are dropped
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }
}

impl Write for DatagramChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Per-connection data the cookie callbacks read
struct PeerInfo {
    addr: SocketAddr,
    cookie_issued: AtomicBool,
    cookie_verified: AtomicBool,
}

/// DTLS server settings
#[derive(Debug, Clone)]
pub struct DtlsServerConfig {
    /// PEM certificate; a self-signed one is generated when unset
    pub certificate_path: Option<PathBuf>,
    /// PEM private key matching `certificate_path`
    pub private_key_path: Option<PathBuf>,
    /// Record MTU
    pub mtu: u32,
    /// Time allowed to reach `Established`
    pub handshake_timeout: Duration,
}

impl Default for DtlsServerConfig {
    fn default() -> Self {
        DtlsServerConfig {
            certificate_path: None,
            private_key_path: None,
            mtu: DEFAULT_DTLS_MTU,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Shared DTLS server context; hands out one [`DtlsHandshake`] per peer
pub struct DtlsServer {
    context: SslContext,
    peer_index: Index<Ssl, PeerInfo>,
    fingerprint: String,
    mtu: u32,
    handshake_timeout: Duration,
}

impl DtlsServer {
    /// Build the context with a fresh cookie secret
    pub fn new(config: &DtlsServerConfig) -> MediaEngineResult<Self> {
        Self::with_cookie_secret(config, CookieSecret::generate())
    }

    /// Build the context with the given cookie secret
    pub fn with_cookie_secret(
        config: &DtlsServerConfig,
        secret: CookieSecret,
    ) -> MediaEngineResult<Self> {
        let (certificate, private_key) = match (&config.certificate_path, &config.private_key_path) {
            (Some(cert), Some(key)) => load_identity(cert, key)?,
            (None, None) => {
                info!("No certificate configured, generating a self-signed one");
                self_signed_identity().map_err(context_error)?
            }
            _ => {
                return Err(MediaEngineError::ConfigError(
                    "certificate and private key must be configured together".to_string(),
                ))
            }
        };

        let fingerprint = sha256_fingerprint(&certificate).map_err(context_error)?;
        let peer_index = Ssl::new_ex_index::<PeerInfo>().map_err(context_error)?;
        let context = build_context(&certificate, &private_key, peer_index, Arc::new(secret))
            .map_err(context_error)?;

        info!(fingerprint = %fingerprint, mtu = config.mtu, "DTLS server context ready");

        Ok(DtlsServer {
            context,
            peer_index,
            fingerprint,
            mtu: config.mtu,
            handshake_timeout: config.handshake_timeout,
        })
    }

    /// SHA-256 fingerprint of the server certificate, `AB:CD:..` form
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Configured handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Start a handshake with `peer`; the clock starts at `now`
    pub fn accept(&self, peer: SocketAddr, now: Instant) -> MediaEngineResult<DtlsHandshake> {
        let mut ssl = Ssl::new(&self.context)?;
        ssl.set_ex_data(
            self.peer_index,
            PeerInfo {
                addr: peer,
                cookie_issued: AtomicBool::new(false),
                cookie_verified: AtomicBool::new(false),
            },
        );
        ssl.set_mtu(self.mtu)?;
        ssl.set_accept_state();

        let stream = SslStream::new(ssl, DatagramChannel::default())?;

        debug!(peer = %peer, "DTLS handshake created");

        Ok(DtlsHandshake {
            peer,
            state: HandshakeState::Listening,
            stream,
            peer_index: self.peer_index,
            started: now,
            timeout: self.handshake_timeout,
            keying_material: None,
        })
    }
}

impl fmt::Debug for DtlsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsServer")
            .field("fingerprint", &self.fingerprint)
            .field("mtu", &self.mtu)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

fn context_error(err: ErrorStack) -> MediaEngineError {
    MediaEngineError::ConfigError(format!("DTLS context: {}", err))
}

fn build_context(
    certificate: &X509,
    private_key: &PKey<Private>,
    peer_index: Index<Ssl, PeerInfo>,
    secret: Arc<CookieSecret>,
) -> Result<SslContext, ErrorStack> {
    let mut builder = SslContextBuilder::new(SslMethod::dtls())?;
    builder.set_cipher_list(DTLS_CIPHER_LIST)?;
    builder.set_tlsext_use_srtp(SRTP_PROTECTION_PROFILE)?;
    builder.set_certificate(certificate)?;
    builder.set_private_key(private_key)?;
    builder.check_private_key()?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_options(SslOptions::COOKIE_EXCHANGE | SslOptions::NO_QUERY_MTU);

    let issue_secret = Arc::clone(&secret);
    builder.set_cookie_generate_cb(move |ssl, out| {
        let info = ssl.ex_data(peer_index).ok_or_else(ErrorStack::get)?;
        let cookie = issue_secret.issue(&info.addr).ok_or_else(ErrorStack::get)?;
        if out.len() < cookie.len() {
            return Err(ErrorStack::get());
        }
        out[..cookie.len()].copy_from_slice(&cookie);
        info.cookie_issued.store(true, Ordering::Relaxed);
        Ok(cookie.len())
    });

    builder.set_cookie_verify_cb(move |ssl, cookie| {
        let info = match ssl.ex_data(peer_index) {
            Some(info) => info,
            None => return false,
        };
        let valid = secret.verify(&info.addr, cookie);
        if valid {
            info.cookie_verified.store(true, Ordering::Relaxed);
        } else {
            warn!(peer = %info.addr, "DTLS cookie mismatch");
        }
        valid
    });

    Ok(builder.build())
}

fn load_identity(cert_path: &Path, key_path: &Path) -> MediaEngineResult<(X509, PKey<Private>)> {
    let read = |path: &Path| {
        std::fs::read(path).map_err(|e| {
            MediaEngineError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })
    };

    let certificate = X509::from_pem(&read(cert_path)?).map_err(|e| {
        MediaEngineError::ConfigError(format!("invalid certificate {}: {}", cert_path.display(), e))
    })?;
    let private_key = PKey::private_key_from_pem(&read(key_path)?).map_err(|e| {
        MediaEngineError::ConfigError(format!("invalid private key {}: {}", key_path.display(), e))
    })?;

    info!(certificate = %cert_path.display(), "Loaded DTLS certificate");
    Ok((certificate, private_key))
}

/// Self-signed ECDSA P-256 certificate, as WebRTC endpoints use
fn self_signed_identity() -> Result<(X509, PKey<Private>), ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let private_key = PKey::from_ec_key(EcKey::generate(&group)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, SELF_SIGNED_COMMON_NAME)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

    let serial = serial.to_asn1_integer()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(SELF_SIGNED_VALIDITY_DAYS)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&private_key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.sign(&private_key, MessageDigest::sha256())?;

    Ok((builder.build(), private_key))
}

fn sha256_fingerprint(certificate: &X509) -> Result<String, ErrorStack> {
    let digest = certificate.digest(MessageDigest::sha256())?;
    Ok(digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Server-side handshake with one peer
pub struct DtlsHandshake {
    peer: SocketAddr,
    state: HandshakeState,
    stream: SslStream<DatagramChannel>,
    peer_index: Index<Ssl, PeerInfo>,
    started: Instant,
    timeout: Duration,
    keying_material: Option<SrtpKeyingMaterial>,
}

impl DtlsHandshake {
    /// Peer address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Exported keys, once `Established`
    pub fn keying_material(&self) -> Option<&SrtpKeyingMaterial> {
        self.keying_material.as_ref()
    }

    /// Feed one datagram received from the peer and advance the handshake.
    ///
    /// After `Established`, records still go through OpenSSL so a repeated
    /// client Finished makes it resend the final flight; application data is
    /// discarded. Any OpenSSL failure moves the handshake to `Failed` for good.
    pub fn handle_datagram(&mut self, datagram: &[u8]) -> MediaEngineResult<HandshakeState> {
        match self.state {
            HandshakeState::Established => return self.handle_established(datagram),
            HandshakeState::Failed => {
                return Err(MediaEngineError::InvalidSessionState {
                    state: self.state.to_string(),
                })
            }
            _ => {}
        }

        self.stream.get_mut().push_incoming(datagram);

        match self.stream.do_handshake() {
            Ok(()) => self.complete(),
            Err(e) if e.code() == ErrorCode::WANT_READ => {
                self.track_cookie_phase();
                Ok(self.state)
            }
            Err(e) => {
                self.track_cookie_phase();
                let reason = match e.ssl_error() {
                    Some(stack) => stack.to_string(),
                    None => e.to_string(),
                };
                self.fail();
                Err(MediaEngineError::HandshakeFailed(reason))
            }
        }
    }

    /// Next datagram to send to the peer
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.stream.get_mut().pop_outgoing()
    }

    /// All queued outbound datagrams
    pub fn drain_transmit(&mut self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.poll_transmit()).collect()
    }

    /// Whether the handshake ran out of time without completing
    pub fn is_timed_out(&self, now: Instant) -> bool {
        !self.state.is_terminal() && now.saturating_duration_since(self.started) >= self.timeout
    }

    /// Fail the handshake if it timed out
    pub fn check_timeout(&mut self, now: Instant) -> MediaEngineResult<()> {
        if !self.is_timed_out(now) {
            return Ok(());
        }
        let elapsed_ms = now.saturating_duration_since(self.started).as_millis();
        self.fail();
        Err(MediaEngineError::HandshakeTimeout { elapsed_ms })
    }

    /// Move to `Failed`
    pub fn fail(&mut self) {
        if self.state != HandshakeState::Failed {
            warn!(peer = %self.peer, state = %self.state, "DTLS handshake failed");
            self.state = HandshakeState::Failed;
        }
    }

    fn handle_established(&mut self, datagram: &[u8]) -> MediaEngineResult<HandshakeState> {
        self.stream.get_mut().push_incoming(datagram);

        let mut scratch = [0u8; POST_HANDSHAKE_READ_LEN];
        loop {
            match self.stream.ssl_read(&mut scratch) {
                Ok(n) => debug!(peer = %self.peer, len = n, "Discarding DTLS application data"),
                Err(e) if e.code() == ErrorCode::WANT_READ => return Ok(self.state),
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                    debug!(peer = %self.peer, "Peer sent close_notify");
                    return Ok(self.state);
                }
                Err(e) => {
                    let reason = match e.ssl_error() {
                        Some(stack) => stack.to_string(),
                        None => e.to_string(),
                    };
                    self.fail();
                    return Err(MediaEngineError::HandshakeFailed(reason));
                }
            }
        }
    }

    fn track_cookie_phase(&mut self) {
        let next = match self.stream.ssl().ex_data(self.peer_index) {
            Some(info) if info.cookie_verified.load(Ordering::Relaxed) => HandshakeState::Verifying,
            Some(info) if info.cookie_issued.load(Ordering::Relaxed) => HandshakeState::CookieSent,
            _ => HandshakeState::Listening,
        };
        if next != self.state {
            debug!(peer = %self.peer, from = %self.state, to = %next, "DTLS state change");
            self.state = next;
        }
    }

    fn complete(&mut self) -> MediaEngineResult<HandshakeState> {
        let ssl = self.stream.ssl();

        let profile = ssl.selected_srtp_profile().map(|p| p.name());
        if profile != Some(SRTP_PROTECTION_PROFILE) {
            self.fail();
            return Err(MediaEngineError::HandshakeFailed(format!(
                "peer negotiated SRTP profile {:?}, expected {}",
                profile, SRTP_PROTECTION_PROFILE
            )));
        }

        let mut material = [0u8; SRTP_KEYING_MATERIAL_LEN];
        if let Err(e) = ssl.export_keying_material(&mut material, DTLS_SRTP_EXPORTER_LABEL, None) {
            self.fail();
            return Err(MediaEngineError::KeyDerivationFailed(e.to_string()));
        }

        match SrtpKeyingMaterial::derive(&material) {
            Ok(keys) => self.keying_material = Some(keys),
            Err(e) => {
                self.fail();
                return Err(e);
            }
        }

        self.state = HandshakeState::Established;
        info!(peer = %self.peer, "DTLS handshake established");
        Ok(self.state)
    }
}

impl fmt::Debug for DtlsHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsHandshake")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("started", &self.started)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> DtlsServer {
        DtlsServer::new(&DtlsServerConfig::default()).unwrap()
    }

    #[test]
    fn test_self_signed_fingerprint_format() {
        let server = server();
        let parts: Vec<&str> = server.fingerprint().split(':').collect();

        assert_eq!(parts.len(), 32);
        assert!(parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())));
    }

    #[test]
    fn test_certificate_without_key_rejected() {
        let config = DtlsServerConfig {
            certificate_path: Some(PathBuf::from("/nonexistent/cert.pem")),
            ..DtlsServerConfig::default()
        };
        assert!(matches!(
            DtlsServer::new(&config),
            Err(MediaEngineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_new_handshake_is_listening() {
        let server = server();
        let mut handshake = server.accept("127.0.0.1:4000".parse().unwrap(), Instant::now()).unwrap();

        assert_eq!(handshake.state(), HandshakeState::Listening);
        assert!(handshake.keying_material().is_none());
        assert!(handshake.poll_transmit().is_none());
    }

    #[test]
    fn test_failed_handshake_is_never_resumed() {
        let server = server();
        let mut handshake = server.accept("127.0.0.1:4000".parse().unwrap(), Instant::now()).unwrap();

        handshake.fail();
        assert_eq!(handshake.state(), HandshakeState::Failed);
        assert!(matches!(
            handshake.handle_datagram(&[22, 0xfe, 0xfd]),
            Err(MediaEngineError::InvalidSessionState { .. })
        ));
    }

    #[test]
    fn test_timeout() {
        let server = server();
        let start = Instant::now();
        let mut handshake = server.accept("127.0.0.1:4000".parse().unwrap(), start).unwrap();

        assert!(!handshake.is_timed_out(start + Duration::from_secs(9)));
        assert!(handshake.check_timeout(start + Duration::from_secs(9)).is_ok());

        let later = start + DEFAULT_HANDSHAKE_TIMEOUT;
        assert!(matches!(
            handshake.check_timeout(later),
            Err(MediaEngineError::HandshakeTimeout { elapsed_ms: 10_000 })
        ));
        assert_eq!(handshake.state(), HandshakeState::Failed);
        assert!(!handshake.is_timed_out(later));
    }

    #[test]
    fn test_datagram_channel_would_block() {
        let mut channel = DatagramChannel::default();
        let mut buf = [0u8; 4];

        assert_eq!(
            channel.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        channel.push_incoming(b"abcdef");
        assert_eq!(channel.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");

        channel.write_all(b"out").unwrap();
        assert_eq!(channel.pop_outgoing().unwrap(), b"out");
        assert!(channel.pop_outgoing().is_none());
    }
}
