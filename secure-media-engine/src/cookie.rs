//! DTLS HelloVerifyRequest cookies
//!
//! A cookie is HMAC-SHA256 over the client's IP address and port, keyed by a
//! secret drawn once per process. A client can only echo back a cookie it
//! received at the address it claims.
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


use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

type HmacSha256 = Hmac<Sha256>;

/// Cookie length on the wire
pub const COOKIE_LEN: usize = 32;

/// Secret the cookies are keyed with
#[derive(Clone)]
pub struct CookieSecret {
    key: [u8; 32],
}

impl CookieSecret {
    /// Draw a fresh random secret
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        CookieSecret { key }
    }

    /// Use a fixed secret
    pub fn from_bytes(key: [u8; 32]) -> Self {
        CookieSecret { key }
    }

    /// Cookie for `peer`
    pub fn issue(&self, peer: &SocketAddr) -> Option<[u8; COOKIE_LEN]> {
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&self.mac_for(peer)?.finalize().into_bytes());
        Some(cookie)
    }

    /// Whether `cookie` was issued for `peer`. Comparison is constant time.
    pub fn verify(&self, peer: &SocketAddr, cookie: &[u8]) -> bool {
        match self.mac_for(peer) {
            Some(mac) => mac.verify_slice(cookie).is_ok(),
            None => false,
        }
    }

    fn mac_for(&self, peer: &SocketAddr) -> Option<HmacSha256> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key).ok()?;
        match peer.ip() {
            IpAddr::V4(ip) => mac.update(&ip.octets()),
            IpAddr::V6(ip) => mac.update(&ip.octets()),
        }
        mac.update(&peer.port().to_be_bytes());
        Some(mac)
    }
}

impl fmt::Debug for CookieSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CookieSecret(<redacted>)")
    }
}
