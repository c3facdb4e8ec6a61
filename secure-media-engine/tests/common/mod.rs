//! Shared helpers: an OpenSSL DTLS client driven over in-memory datagrams

#![allow(dead_code)]

use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslStream,
    SslVerifyMode,
};
use secure_media_engine::dtls::SRTP_PROTECTION_PROFILE;
use secure_media_engine::key_material::{DTLS_SRTP_EXPORTER_LABEL, SRTP_KEYING_MATERIAL_LEN};
use secure_media_engine::{
    DatagramChannel, DtlsHandshake, HandshakeState, MediaEngineResult, Session,
};

pub type Client = SslStream<DatagramChannel>;

/// Server side of the handshake, as a handshake alone or inside a session
pub trait ServerSide {
    fn feed(&mut self, datagram: &[u8]) -> MediaEngineResult<HandshakeState>;
    fn transmit(&mut self) -> Vec<Vec<u8>>;
    fn current(&self) -> HandshakeState;
}

impl ServerSide for DtlsHandshake {
    fn feed(&mut self, datagram: &[u8]) -> MediaEngineResult<HandshakeState> {
        self.handle_datagram(datagram)
    }
    fn transmit(&mut self) -> Vec<Vec<u8>> {
        self.drain_transmit()
    }
    fn current(&self) -> HandshakeState {
        self.state()
    }
}

impl ServerSide for Session {
    fn feed(&mut self, datagram: &[u8]) -> MediaEngineResult<HandshakeState> {
        self.handle_dtls(datagram)
    }
    fn transmit(&mut self) -> Vec<Vec<u8>> {
        self.drain_transmit()
    }
    fn current(&self) -> HandshakeState {
        self.state()
    }
}

pub fn client_context(srtp_profile: &str) -> SslContext {
    let mut builder = SslContextBuilder::new(SslMethod::dtls()).unwrap();
    builder.set_tlsext_use_srtp(srtp_profile).unwrap();
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_options(SslOptions::NO_QUERY_MTU);
    builder.build()
}

pub fn client(context: &SslContext) -> Client {
    let mut ssl = Ssl::new(context).unwrap();
    ssl.set_mtu(1200).unwrap();
    ssl.set_connect_state();
    SslStream::new(ssl, DatagramChannel::default()).unwrap()
}

pub fn default_client() -> Client {
    client(&client_context(SRTP_PROTECTION_PROFILE))
}

/// Advance the client once; true when its handshake is complete
pub fn step_client(client: &mut Client) -> bool {
    match client.do_handshake() {
        Ok(()) => true,
        Err(e) if e.code() == ErrorCode::WANT_READ => false,
        Err(e) => panic!("client handshake failed: {}", e),
    }
}

/// Client datagrams waiting to go to the server
pub fn client_flight(client: &mut Client) -> Vec<Vec<u8>> {
    std::iter::from_fn(|| client.get_mut().pop_outgoing()).collect()
}

/// Exchange flights until both sides are quiet or the server fails.
/// Returns every server state observed and whether the client finished.
pub fn try_handshake<S: ServerSide>(
    server: &mut S,
    client: &mut Client,
) -> MediaEngineResult<(Vec<HandshakeState>, bool)> {
    let mut states = vec![server.current()];
    let mut client_done = false;

    for _ in 0..16 {
        if !client_done {
            client_done = step_client(client);
        }

        for datagram in client_flight(client) {
            let state = server.feed(&datagram)?;
            if states.last() != Some(&state) {
                states.push(state);
            }
        }

        let replies = server.transmit();
        let quiet = replies.is_empty();
        for datagram in replies {
            client.get_mut().push_incoming(&datagram);
        }

        if client_done && quiet && server.current() == HandshakeState::Established {
            break;
        }
    }

    Ok((states, client_done))
}

/// Run the handshake to completion, returning every server state observed
pub fn run_handshake<S: ServerSide>(server: &mut S, client: &mut Client) -> Vec<HandshakeState> {
    let (states, client_done) = try_handshake(server, client).expect("server handshake");
    assert!(client_done, "client did not finish the handshake");
    states
}

/// Keying material as the client sees it
pub fn client_export(client: &Client) -> Vec<u8> {
    let mut material = vec![0u8; SRTP_KEYING_MATERIAL_LEN];
    client
        .ssl()
        .export_keying_material(&mut material, DTLS_SRTP_EXPORTER_LABEL, None)
        .unwrap();
    material
}
