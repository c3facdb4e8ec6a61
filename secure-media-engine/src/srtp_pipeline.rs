//! SRTP (Secure Real-time Transport Protocol) pipeline
//!
//! Implements RFC 3711 with the AES_CM_128_HMAC_SHA1_80 transform: AES-128
//! in counter mode for the payload, HMAC-SHA1 over header, ciphertext and
//! rollover counter, truncated to 80 bits. Session keys come from the master
//! key and salt through the AES-CM key derivation with a derivation rate of 0.
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
use crate::key_material::{SrtpMasterKey, SRTP_MASTER_KEY_LEN, SRTP_MASTER_SALT_LEN};
use crate::rtp_handler::{header_length, RtpHeader, RtpPacket, RTP_HEADER_LEN};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::HashMap;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Truncated HMAC-SHA1 tag length (the "_80" in the profile name)
pub const SRTP_AUTH_TAG_LEN: usize = 10;

/// Session authentication key length
pub const SRTP_AUTH_KEY_LEN: usize = 20;

/// Packets tracked behind the highest accepted index
pub const SRTP_REPLAY_WINDOW: u64 = 64;

const LABEL_CIPHER_KEY: u8 = 0x00;
const LABEL_AUTH_KEY: u8 = 0x01;
const LABEL_SALT: u8 = 0x02;

/// Keys derived from one master key and salt
#[derive(Clone)]
pub struct SessionKeys {
    cipher_key: [u8; SRTP_MASTER_KEY_LEN],
    cipher_salt: [u8; SRTP_MASTER_SALT_LEN],
    auth_key: [u8; SRTP_AUTH_KEY_LEN],
}

impl SessionKeys {
    /// Run the SRTP key derivation for `master`
    pub fn derive(master: &SrtpMasterKey) -> MediaEngineResult<Self> {
        let mut keys = SessionKeys {
            cipher_key: [0u8; SRTP_MASTER_KEY_LEN],
            cipher_salt: [0u8; SRTP_MASTER_SALT_LEN],
            auth_key: [0u8; SRTP_AUTH_KEY_LEN],
        };
        kdf(master, LABEL_CIPHER_KEY, &mut keys.cipher_key)?;
        kdf(master, LABEL_AUTH_KEY, &mut keys.auth_key)?;
        kdf(master, LABEL_SALT, &mut keys.cipher_salt)?;
        Ok(keys)
    }
}

/// AES-CM PRF: keystream under the master key with IV = (salt ^ label << 48) << 16
fn kdf(master: &SrtpMasterKey, label: u8, out: &mut [u8]) -> MediaEngineResult<()> {
    let mut iv = [0u8; 16];
    iv[..SRTP_MASTER_SALT_LEN].copy_from_slice(&master.salt);
    iv[7] ^= label;

    let mut cipher = Aes128Ctr::new_from_slices(&master.key, &iv)
        .map_err(|e| MediaEngineError::KeyDerivationFailed(format!("AES-CM init: {}", e)))?;
    out.fill(0);
    cipher.apply_keystream(out);
    Ok(())
}

/// Counter block for one packet: salt ^ (SSRC << 64) ^ (index << 16)
fn packet_iv(salt: &[u8; SRTP_MASTER_SALT_LEN], ssrc: u32, index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..SRTP_MASTER_SALT_LEN].copy_from_slice(salt);

    for (b, s) in iv[4..8].iter_mut().zip(ssrc.to_be_bytes()) {
        *b ^= s;
    }
    // 48-bit index occupies bytes 8..14
    for (b, s) in iv[8..14].iter_mut().zip(&index.to_be_bytes()[2..]) {
        *b ^= s;
    }
    iv
}

/// Guess the rollover counter for `seq` given the highest index seen so far
/// (RFC 3711 section 3.3.1)
fn estimate_index(highest: u64, seq: u16) -> u64 {
    let roc = (highest >> 16) as u32;
    let s_l = highest as u16;

    let v = if s_l < 0x8000 {
        if seq > s_l && seq - s_l > 0x8000 {
            roc.saturating_sub(1)
        } else {
            roc
        }
    } else if seq < s_l - 0x8000 {
        roc.wrapping_add(1)
    } else {
        roc
    };

    ((v as u64) << 16) | seq as u64
}

/// Highest index plus a bitmap of the 64 indices behind it
#[derive(Debug, Clone, Copy)]
struct ReplayWindow {
    highest: u64,
    bitmap: u64,
}

impl ReplayWindow {
    fn new(index: u64) -> Self {
        ReplayWindow {
            highest: index,
            bitmap: 1,
        }
    }

    fn check(&self, index: u64) -> MediaEngineResult<()> {
        if index > self.highest {
            return Ok(());
        }
        let delta = self.highest - index;
        if delta >= SRTP_REPLAY_WINDOW {
            return Err(MediaEngineError::SrtpError(format!(
                "packet index {} is {} behind the replay window",
                index, delta
            )));
        }
        if self.bitmap & (1u64 << delta) != 0 {
            return Err(MediaEngineError::SrtpError(format!(
                "replayed packet index {}",
                index
            )));
        }
        Ok(())
    }

    fn accept(&mut self, index: u64) {
        if index > self.highest {
            let shift = index - self.highest;
            self.bitmap = if shift >= SRTP_REPLAY_WINDOW {
                0
            } else {
                self.bitmap << shift
            };
            self.bitmap |= 1;
            self.highest = index;
        } else {
            self.bitmap |= 1u64 << (self.highest - index);
        }
    }
}

/// SRTP context for one master key.
///
/// Tracks the rollover counter of every SSRC it protects and a replay window
/// for every SSRC it unprotects, so one context serves one direction of a
/// session.
pub struct SrtpContext {
    keys: SessionKeys,
    /// Highest index sent, per SSRC
    outbound: HashMap<u32, u64>,
    /// Replay state, per SSRC
    inbound: HashMap<u32, ReplayWindow>,
}

impl SrtpContext {
    /// Derive session keys from `master` and start with empty counters
    pub fn new(master: &SrtpMasterKey) -> MediaEngineResult<Self> {
        Ok(SrtpContext {
            keys: SessionKeys::derive(master)?,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
        })
    }

    /// Rollover counter currently used for outbound `ssrc`
    pub fn rollover_counter(&self, ssrc: u32) -> Option<u32> {
        self.outbound.get(&ssrc).map(|highest| (highest >> 16) as u32)
    }

    /// Encrypt and authenticate a serialized RTP packet
    pub fn protect(&mut self, rtp: &[u8]) -> MediaEngineResult<Vec<u8>> {
        let (header, _) = RtpHeader::parse(rtp)?;
        let payload_offset = header_length(rtp)?;

        let index = match self.outbound.get(&header.ssrc) {
            Some(&highest) => estimate_index(highest, header.sequence_number),
            None => header.sequence_number as u64,
        };
        let highest = self.outbound.entry(header.ssrc).or_insert(index);
        if index > *highest {
            *highest = index;
        }

        let mut out = Vec::with_capacity(rtp.len() + SRTP_AUTH_TAG_LEN);
        out.extend_from_slice(rtp);
        self.apply_keystream(header.ssrc, index, &mut out[payload_offset..])?;

        let tag = self.auth_tag(&out, (index >> 16) as u32)?;
        out.extend_from_slice(&tag[..SRTP_AUTH_TAG_LEN]);
        Ok(out)
    }

    /// Serialize and protect an RTP packet
    pub fn protect_packet(&mut self, packet: &RtpPacket) -> MediaEngineResult<Vec<u8>> {
        self.protect(&packet.serialize())
    }

    /// Verify, replay-check and decrypt an SRTP packet, returning plain RTP
    pub fn unprotect(&mut self, srtp: &[u8]) -> MediaEngineResult<Vec<u8>> {
        if srtp.len() < RTP_HEADER_LEN + SRTP_AUTH_TAG_LEN {
            return Err(MediaEngineError::SrtpError(format!(
                "SRTP packet too short: {} bytes",
                srtp.len()
            )));
        }

        let (authenticated, tag) = srtp.split_at(srtp.len() - SRTP_AUTH_TAG_LEN);
        let (header, _) = RtpHeader::parse(authenticated)?;
        let payload_offset = header_length(authenticated)?;

        let window = self.inbound.get(&header.ssrc).copied();
        let index = match window {
            Some(w) => estimate_index(w.highest, header.sequence_number),
            None => header.sequence_number as u64,
        };
        if let Some(w) = window {
            w.check(index)?;
        }

        let mut mac = self.mac()?;
        mac.update(authenticated);
        mac.update(&((index >> 16) as u32).to_be_bytes());
        mac.verify_truncated_left(tag)
            .map_err(|_| MediaEngineError::SrtpError("authentication tag mismatch".to_string()))?;

        let mut out = authenticated.to_vec();
        self.apply_keystream(header.ssrc, index, &mut out[payload_offset..])?;

        match self.inbound.get_mut(&header.ssrc) {
            Some(w) => w.accept(index),
            None => {
                self.inbound.insert(header.ssrc, ReplayWindow::new(index));
            }
        }

        Ok(out)
    }

    /// Unprotect and parse
    pub fn unprotect_packet(&mut self, srtp: &[u8]) -> MediaEngineResult<RtpPacket> {
        let rtp = self.unprotect(srtp)?;
        RtpPacket::parse(&rtp)
    }

    fn apply_keystream(&self, ssrc: u32, index: u64, data: &mut [u8]) -> MediaEngineResult<()> {
        let iv = packet_iv(&self.keys.cipher_salt, ssrc, index);
        let mut cipher = Aes128Ctr::new_from_slices(&self.keys.cipher_key, &iv)
            .map_err(|e| MediaEngineError::SrtpError(format!("AES-CM init: {}", e)))?;
        cipher.apply_keystream(data);
        Ok(())
    }

    fn mac(&self) -> MediaEngineResult<HmacSha1> {
        <HmacSha1 as Mac>::new_from_slice(&self.keys.auth_key)
            .map_err(|e| MediaEngineError::SrtpError(format!("HMAC init: {}", e)))
    }

    fn auth_tag(&self, authenticated: &[u8], roc: u32) -> MediaEngineResult<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(authenticated);
        mac.update(&roc.to_be_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl std::fmt::Debug for SrtpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpContext")
            .field("outbound_ssrcs", &self.outbound.len())
            .field("inbound_ssrcs", &self.inbound.len())
            .finish()
    }
}
