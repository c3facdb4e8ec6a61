//! DTLS handshake tests against an OpenSSL client over in-memory datagrams

mod common;

use common::*;
use secure_media_engine::{
    DtlsHandshake, DtlsServer, DtlsServerConfig, HandshakeState, MediaEngineError,
    SrtpKeyingMaterial,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

fn peer(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn server() -> DtlsServer {
    DtlsServer::new(&DtlsServerConfig::default()).unwrap()
}

#[test]
fn test_handshake_walks_every_state() {
    let server = server();
    let mut handshake = server.accept(peer("10.0.0.2:50000"), Instant::now()).unwrap();
    let mut client = default_client();

    let states = run_handshake(&mut handshake, &mut client);

    assert_eq!(
        states,
        vec![
            HandshakeState::Listening,
            HandshakeState::CookieSent,
            HandshakeState::Verifying,
            HandshakeState::Established,
        ]
    );
}

#[test]
fn test_both_sides_export_same_keys() {
    let server = server();
    let mut handshake = server.accept(peer("10.0.0.2:50000"), Instant::now()).unwrap();
    let mut client = default_client();

    run_handshake(&mut handshake, &mut client);

    let client_keys = SrtpKeyingMaterial::derive(&client_export(&client)).unwrap();
    assert_eq!(handshake.keying_material(), Some(&client_keys));
    assert_eq!(
        client.ssl().selected_srtp_profile().map(|p| p.name()),
        Some("SRTP_AES128_CM_SHA1_80")
    );
}

#[test]
fn test_independent_handshakes_get_independent_keys() {
    let server = server();
    let mut first = server.accept(peer("10.0.0.2:50000"), Instant::now()).unwrap();
    let mut second = server.accept(peer("10.0.0.3:50000"), Instant::now()).unwrap();

    run_handshake(&mut first, &mut default_client());
    run_handshake(&mut second, &mut default_client());

    assert_ne!(first.keying_material(), second.keying_material());
}

/// Byte range of the cookie inside a datagram holding one ClientHello
fn cookie_range(datagram: &[u8]) -> std::ops::Range<usize> {
    // record header (13) + handshake header (12) + version (2) + random (32)
    let session_id_len = datagram[59] as usize;
    let cookie_len_at = 60 + session_id_len;
    let cookie_len = datagram[cookie_len_at] as usize;
    cookie_len_at + 1..cookie_len_at + 1 + cookie_len
}

/// Run the cookie exchange; returns the ClientHello that carries the cookie
fn hello_with_cookie(handshake: &mut DtlsHandshake, client: &mut Client) -> Vec<u8> {
    step_client(client);
    for datagram in client_flight(client) {
        handshake.handle_datagram(&datagram).unwrap();
    }
    assert_eq!(handshake.state(), HandshakeState::CookieSent);
    for datagram in handshake.drain_transmit() {
        client.get_mut().push_incoming(&datagram);
    }

    step_client(client);
    let mut flight = client_flight(client);
    assert_eq!(flight.len(), 1);
    flight.remove(0)
}

#[test]
fn test_cookie_replayed_from_other_address_fails() {
    let server = server();
    let mut at_a = server.accept(peer("10.0.0.2:50000"), Instant::now()).unwrap();
    let mut at_b = server.accept(peer("10.0.0.9:50000"), Instant::now()).unwrap();
    let mut client_a = default_client();
    let mut client_b = default_client();

    let hello_a = hello_with_cookie(&mut at_a, &mut client_a);
    let mut hello_b = hello_with_cookie(&mut at_b, &mut client_b);

    let cookie_a = hello_a[cookie_range(&hello_a)].to_vec();
    let range_b = cookie_range(&hello_b);
    assert_eq!(cookie_a.len(), range_b.len());
    assert_ne!(&hello_b[range_b.clone()], cookie_a.as_slice());

    // B presents the cookie issued to A
    hello_b[range_b].copy_from_slice(&cookie_a);
    assert!(matches!(
        at_b.handle_datagram(&hello_b),
        Err(MediaEngineError::HandshakeFailed(_))
    ));
    assert_eq!(at_b.state(), HandshakeState::Failed);

    // the cookie is accepted at the address it was issued for
    at_a.handle_datagram(&hello_a).unwrap();
    assert_eq!(at_a.state(), HandshakeState::Verifying);
}

#[test]
fn test_lost_final_flight_is_resent() {
    let server = server();
    let mut handshake = server.accept(peer("10.0.0.2:50000"), Instant::now()).unwrap();
    let mut client = default_client();

    for _ in 0..16 {
        assert!(!step_client(&mut client));
        for datagram in client_flight(&mut client) {
            handshake.handle_datagram(&datagram).unwrap();
        }
        let replies = handshake.drain_transmit();
        if handshake.state() == HandshakeState::Established {
            // ChangeCipherSpec + Finished never reach the client
            assert!(!replies.is_empty());
            break;
        }
        for datagram in replies {
            client.get_mut().push_incoming(&datagram);
        }
    }
    assert_eq!(handshake.state(), HandshakeState::Established);
    assert!(!step_client(&mut client));

    // the client resends its last flight once its 1 s timer fires
    std::thread::sleep(Duration::from_millis(1200));
    assert!(!step_client(&mut client));
    let repeated = client_flight(&mut client);
    assert!(!repeated.is_empty());

    for datagram in &repeated {
        assert_eq!(
            handshake.handle_datagram(datagram).unwrap(),
            HandshakeState::Established
        );
    }
    let resent = handshake.drain_transmit();
    assert!(!resent.is_empty());
    for datagram in resent {
        client.get_mut().push_incoming(&datagram);
    }

    assert!(step_client(&mut client));
    let client_keys = SrtpKeyingMaterial::derive(&client_export(&client)).unwrap();
    assert_eq!(handshake.keying_material(), Some(&client_keys));
}

#[test]
fn test_missing_srtp_profile_fails_handshake() {
    let server = server();
    let mut handshake = server.accept(peer("10.0.0.2:50000"), Instant::now()).unwrap();
    let mut client = client(&client_context("SRTP_AES128_CM_SHA1_32"));

    let result = try_handshake(&mut handshake, &mut client);

    assert!(matches!(result, Err(MediaEngineError::HandshakeFailed(_))));
    assert_eq!(handshake.state(), HandshakeState::Failed);
    assert!(handshake.keying_material().is_none());
}

#[test]
fn test_stalled_handshake_times_out() {
    let config = DtlsServerConfig {
        handshake_timeout: Duration::from_secs(2),
        ..DtlsServerConfig::default()
    };
    let server = DtlsServer::new(&config).unwrap();
    let start = Instant::now();
    let mut handshake = server.accept(peer("10.0.0.2:50000"), start).unwrap();
    let mut client = default_client();

    step_client(&mut client);
    for datagram in client_flight(&mut client) {
        handshake.handle_datagram(&datagram).unwrap();
    }
    assert_eq!(handshake.state(), HandshakeState::CookieSent);

    assert!(handshake.check_timeout(start + Duration::from_secs(1)).is_ok());
    assert!(matches!(
        handshake.check_timeout(start + Duration::from_secs(3)),
        Err(MediaEngineError::HandshakeTimeout { .. })
    ));
    assert_eq!(handshake.state(), HandshakeState::Failed);
}

#[test]
fn test_pem_identity_is_loaded() {
    use openssl::ec::{EcGroup, EcKey};
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::pkey::PKey;
    use openssl::x509::{X509NameBuilder, X509};

    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "pem-test").unwrap();
    let name = name.build();
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&openssl::asn1::Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let dir = tempfile::TempDir::new().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
    std::fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();

    let config = DtlsServerConfig {
        certificate_path: Some(cert_path),
        private_key_path: Some(key_path),
        ..DtlsServerConfig::default()
    };
    let server = DtlsServer::new(&config).unwrap();

    let expected: Vec<String> = cert
        .digest(MessageDigest::sha256())
        .unwrap()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect();
    assert_eq!(server.fingerprint(), expected.join(":"));

    let mut handshake = server.accept(peer("10.0.0.2:50000"), Instant::now()).unwrap();
    run_handshake(&mut handshake, &mut default_client());
    assert_eq!(handshake.state(), HandshakeState::Established);
}
