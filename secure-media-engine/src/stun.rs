//! STUN (RFC 5389) binding responder for ICE-lite
//!
//! Only what an ICE-lite media server needs: parse Binding requests, check
//! their MESSAGE-INTEGRITY against the local ICE password, and answer with a
//! Binding success carrying XOR-MAPPED-ADDRESS, MESSAGE-INTEGRITY and
//! FINGERPRINT.
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
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

/// STUN header length
pub const STUN_HEADER_LEN: usize = 20;

/// Fixed magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// XOR applied to the CRC-32 in FINGERPRINT
pub const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// Binding request
pub const BINDING_REQUEST: u16 = 0x0001;
/// Binding success response
pub const BINDING_SUCCESS: u16 = 0x0101;

/// USERNAME attribute
pub const ATTR_USERNAME: u16 = 0x0006;
/// MESSAGE-INTEGRITY attribute
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
/// XOR-MAPPED-ADDRESS attribute
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
/// FINGERPRINT attribute
pub const ATTR_FINGERPRINT: u16 = 0x8028;

const ATTR_HEADER_LEN: usize = 4;
const MESSAGE_INTEGRITY_LEN: usize = 20;
const FINGERPRINT_LEN: usize = 4;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// CRC-32 of `bytes` XOR 0x5354554E
pub fn fingerprint(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes) ^ FINGERPRINT_XOR
}

fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> MediaEngineResult<[u8; MESSAGE_INTEGRITY_LEN]> {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key)
        .map_err(|e| MediaEngineError::StunError(format!("HMAC init: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; MESSAGE_INTEGRITY_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// One attribute as found on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAttribute {
    /// Attribute type
    pub kind: u16,
    /// Value without padding
    pub value: Bytes,
    /// Offset of the attribute header within the message
    offset: usize,
}

/// Parsed STUN message
#[derive(Debug, Clone)]
pub struct StunMessage {
    /// Message type (method and class)
    pub message_type: u16,
    /// 96-bit transaction id
    pub transaction_id: [u8; 12],
    /// Attributes in wire order
    pub attributes: Vec<StunAttribute>,
    raw: Bytes,
}

impl StunMessage {
    /// Parse a complete STUN message
    pub fn parse(data: &[u8]) -> MediaEngineResult<Self> {
        if data.len() < STUN_HEADER_LEN {
            return Err(MediaEngineError::StunError(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }
        if data[0] & 0xC0 != 0 {
            return Err(MediaEngineError::StunError(
                "first two bits must be zero".to_string(),
            ));
        }

        let message_type = u16::from_be_bytes([data[0], data[1]]);
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        if cookie != MAGIC_COOKIE {
            return Err(MediaEngineError::StunError(format!(
                "bad magic cookie {:#010x}",
                cookie
            )));
        }
        if length % 4 != 0 || STUN_HEADER_LEN + length != data.len() {
            return Err(MediaEngineError::StunError(format!(
                "length field {} does not match {} byte datagram",
                length,
                data.len()
            )));
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let mut attributes = Vec::new();
        let mut offset = STUN_HEADER_LEN;
        while offset < data.len() {
            if offset + ATTR_HEADER_LEN > data.len() {
                return Err(MediaEngineError::StunError("truncated attribute header".to_string()));
            }
            let kind = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let start = offset + ATTR_HEADER_LEN;
            if start + len > data.len() {
                return Err(MediaEngineError::StunError(format!(
                    "attribute {:#06x} overruns message",
                    kind
                )));
            }
            attributes.push(StunAttribute {
                kind,
                value: Bytes::copy_from_slice(&data[start..start + len]),
                offset,
            });
            offset = start + padded(len);
        }

        Ok(StunMessage {
            message_type,
            transaction_id,
            attributes,
            raw: Bytes::copy_from_slice(data),
        })
    }

    /// First attribute of the given type
    pub fn attribute(&self, kind: u16) -> Option<&StunAttribute> {
        self.attributes.iter().find(|a| a.kind == kind)
    }

    /// USERNAME, if present and valid UTF-8
    pub fn username(&self) -> Option<&str> {
        self.attribute(ATTR_USERNAME)
            .and_then(|a| std::str::from_utf8(&a.value).ok())
    }

    /// Decoded XOR-MAPPED-ADDRESS
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        let value = &self.attribute(ATTR_XOR_MAPPED_ADDRESS)?.value;
        if value.len() < 4 {
            return None;
        }
        let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
        let mask = xor_mask(&self.transaction_id);

        let ip = match (value[1], value.len()) {
            (FAMILY_IPV4, 8) => {
                let mut octets = [0u8; 4];
                for (i, o) in octets.iter_mut().enumerate() {
                    *o = value[4 + i] ^ mask[i];
                }
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            (FAMILY_IPV6, 20) => {
                let mut octets = [0u8; 16];
                for (i, o) in octets.iter_mut().enumerate() {
                    *o = value[4 + i] ^ mask[i];
                }
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };
        Some(SocketAddr::new(ip, port))
    }

    /// Check MESSAGE-INTEGRITY with `password`.
    ///
    /// `Ok(false)` when the message carries none.
    pub fn verify_integrity(&self, password: &str) -> MediaEngineResult<bool> {
        let attr = match self.attribute(ATTR_MESSAGE_INTEGRITY) {
            Some(attr) => attr,
            None => return Ok(false),
        };
        if attr.value.len() != MESSAGE_INTEGRITY_LEN {
            return Err(MediaEngineError::StunError(
                "MESSAGE-INTEGRITY has wrong length".to_string(),
            ));
        }

        // length field as if MESSAGE-INTEGRITY were the last attribute
        let covered_len = (attr.offset + ATTR_HEADER_LEN + MESSAGE_INTEGRITY_LEN - STUN_HEADER_LEN) as u16;
        let mut mac = <HmacSha1 as Mac>::new_from_slice(password.as_bytes())
            .map_err(|e| MediaEngineError::StunError(format!("HMAC init: {}", e)))?;
        mac.update(&self.raw[..2]);
        mac.update(&covered_len.to_be_bytes());
        mac.update(&self.raw[4..attr.offset]);

        if mac.verify_slice(&attr.value).is_err() {
            return Err(MediaEngineError::StunError(
                "MESSAGE-INTEGRITY mismatch".to_string(),
            ));
        }
        Ok(true)
    }

    /// Check FINGERPRINT. `Ok(false)` when the message carries none.
    pub fn verify_fingerprint(&self) -> MediaEngineResult<bool> {
        let attr = match self.attribute(ATTR_FINGERPRINT) {
            Some(attr) => attr,
            None => return Ok(false),
        };
        if attr.value.len() != FINGERPRINT_LEN {
            return Err(MediaEngineError::StunError(
                "FINGERPRINT has wrong length".to_string(),
            ));
        }
        let expected = u32::from_be_bytes([attr.value[0], attr.value[1], attr.value[2], attr.value[3]]);
        if fingerprint(&self.raw[..attr.offset]) != expected {
            return Err(MediaEngineError::StunError("FINGERPRINT mismatch".to_string()));
        }
        Ok(true)
    }
}

/// Magic cookie followed by the transaction id
fn xor_mask(transaction_id: &[u8; 12]) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(transaction_id);
    mask
}

/// Incrementally builds a STUN message, keeping the length field current
#[derive(Debug)]
pub struct StunMessageBuilder {
    buf: BytesMut,
    transaction_id: [u8; 12],
}

impl StunMessageBuilder {
    /// Start a message
    pub fn new(message_type: u16, transaction_id: [u8; 12]) -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u16(message_type);
        buf.put_u16(0);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&transaction_id);
        StunMessageBuilder {
            buf,
            transaction_id,
        }
    }

    /// Append an attribute, zero-padded to 4 bytes
    pub fn attribute(mut self, kind: u16, value: &[u8]) -> Self {
        self.buf.put_u16(kind);
        self.buf.put_u16(value.len() as u16);
        self.buf.put_slice(value);
        self.buf.put_bytes(0, padded(value.len()) - value.len());
        self.set_len(self.buf.len() - STUN_HEADER_LEN);
        self
    }

    /// Append XOR-MAPPED-ADDRESS for `addr`
    pub fn xor_mapped_address(self, addr: SocketAddr) -> Self {
        let mask = xor_mask(&self.transaction_id);
        let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;

        let mut value = Vec::with_capacity(20);
        value.push(0);
        match addr.ip() {
            IpAddr::V4(ip) => {
                value.push(FAMILY_IPV4);
                value.extend_from_slice(&port.to_be_bytes());
                value.extend(ip.octets().iter().zip(mask.iter()).map(|(a, m)| a ^ m));
            }
            IpAddr::V6(ip) => {
                value.push(FAMILY_IPV6);
                value.extend_from_slice(&port.to_be_bytes());
                value.extend(ip.octets().iter().zip(mask.iter()).map(|(a, m)| a ^ m));
            }
        }
        self.attribute(ATTR_XOR_MAPPED_ADDRESS, &value)
    }

    /// Append MESSAGE-INTEGRITY keyed by `password`
    pub fn message_integrity(mut self, password: &str) -> MediaEngineResult<Self> {
        let len = self.buf.len() - STUN_HEADER_LEN;
        self.set_len(len + ATTR_HEADER_LEN + MESSAGE_INTEGRITY_LEN);
        let hmac = hmac_sha1(password.as_bytes(), &[&self.buf[..]])?;
        Ok(self.attribute(ATTR_MESSAGE_INTEGRITY, &hmac))
    }

    /// Append FINGERPRINT; must come last
    pub fn fingerprint(mut self) -> Self {
        let len = self.buf.len() - STUN_HEADER_LEN;
        self.set_len(len + ATTR_HEADER_LEN + FINGERPRINT_LEN);
        let crc = fingerprint(&self.buf);
        self.attribute(ATTR_FINGERPRINT, &crc.to_be_bytes())
    }

    /// Finished datagram
    pub fn build(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    fn set_len(&mut self, len: usize) {
        self.buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    }
}

/// Answers Binding requests on behalf of an ICE-lite agent
#[derive(Clone)]
pub struct BindingResponder {
    password: String,
}

impl BindingResponder {
    /// Responder keyed by the local ICE password
    pub fn new(password: impl Into<String>) -> Self {
        BindingResponder {
            password: password.into(),
        }
    }

    /// Build the Binding success for a request received from `source`.
    ///
    /// Requests that are not Binding requests, or whose integrity or
    /// fingerprint do not check out, are rejected with `StunError`.
    pub fn respond(&self, request: &[u8], source: SocketAddr) -> MediaEngineResult<Vec<u8>> {
        let message = StunMessage::parse(request)?;
        if message.message_type != BINDING_REQUEST {
            return Err(MediaEngineError::StunError(format!(
                "unsupported message type {:#06x}",
                message.message_type
            )));
        }

        message.verify_fingerprint()?;
        let authenticated = message.verify_integrity(&self.password)?;

        debug!(
            peer = %source,
            username = message.username().unwrap_or(""),
            authenticated,
            "STUN binding request"
        );

        Ok(StunMessageBuilder::new(BINDING_SUCCESS, message.transaction_id)
            .xor_mapped_address(source)
            .message_integrity(&self.password)?
            .fingerprint()
            .build())
    }
}

impl std::fmt::Debug for BindingResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingResponder")
            .field("password", &"<redacted>")
            .finish()
    }
}
