//! SRTP keying material exported from a completed DTLS handshake
//!
//! The exporter label `EXTRACTOR-dtls_srtp` yields 60 bytes for
//! SRTP_AES128_CM_SHA1_80, laid out as RFC 5764 section 4.2 describes:
//! client write key, server write key, client write salt, server write salt.
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
use std::fmt;

/// Exporter label for DTLS-SRTP
pub const DTLS_SRTP_EXPORTER_LABEL: &str = "EXTRACTOR-dtls_srtp";

/// Master key length for AES-128
pub const SRTP_MASTER_KEY_LEN: usize = 16;

/// Master salt length
pub const SRTP_MASTER_SALT_LEN: usize = 14;

/// Total exported length: two keys and two salts
pub const SRTP_KEYING_MATERIAL_LEN: usize = 2 * (SRTP_MASTER_KEY_LEN + SRTP_MASTER_SALT_LEN);

/// Which end of the DTLS handshake we were
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the ClientHello
    Client,
    /// Answered it
    Server,
}

/// One direction's master key and salt
#[derive(Clone, PartialEq, Eq)]
pub struct SrtpMasterKey {
    /// Master key
    pub key: [u8; SRTP_MASTER_KEY_LEN],
    /// Master salt
    pub salt: [u8; SRTP_MASTER_SALT_LEN],
}

impl fmt::Debug for SrtpMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtpMasterKey")
            .field("key", &"<redacted>")
            .field("salt", &"<redacted>")
            .finish()
    }
}

/// Both directions of exported keying material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpKeyingMaterial {
    /// Protects packets sent by the DTLS client
    pub client: SrtpMasterKey,
    /// Protects packets sent by the DTLS server
    pub server: SrtpMasterKey,
}

impl SrtpKeyingMaterial {
    /// Split exported material into the two directions.
    ///
    /// Anything but exactly 60 bytes is rejected with
    /// [`MediaEngineError::InvalidLength`].
    pub fn derive(material: &[u8]) -> MediaEngineResult<Self> {
        if material.len() != SRTP_KEYING_MATERIAL_LEN {
            return Err(MediaEngineError::InvalidLength {
                expected: SRTP_KEYING_MATERIAL_LEN,
                actual: material.len(),
            });
        }

        let (keys, salts) = material.split_at(2 * SRTP_MASTER_KEY_LEN);
        let (client_key, server_key) = keys.split_at(SRTP_MASTER_KEY_LEN);
        let (client_salt, server_salt) = salts.split_at(SRTP_MASTER_SALT_LEN);

        Ok(SrtpKeyingMaterial {
            client: master_key(client_key, client_salt)?,
            server: master_key(server_key, server_salt)?,
        })
    }

    /// Key we protect outbound packets with
    pub fn local_write(&self, role: Role) -> &SrtpMasterKey {
        match role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }

    /// Key the peer protects its packets with
    pub fn remote_write(&self, role: Role) -> &SrtpMasterKey {
        match role {
            Role::Client => &self.server,
            Role::Server => &self.client,
        }
    }
}

fn master_key(key: &[u8], salt: &[u8]) -> MediaEngineResult<SrtpMasterKey> {
    let key = key
        .try_into()
        .map_err(|_| MediaEngineError::KeyDerivationFailed("master key slice".to_string()))?;
    let salt = salt
        .try_into()
        .map_err(|_| MediaEngineError::KeyDerivationFailed("master salt slice".to_string()))?;
    Ok(SrtpMasterKey { key, salt })
}
