//! Error types for the secure media engine
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


use thiserror::Error;

/// Result type for media engine operations
pub type MediaEngineResult<T> = Result<T, MediaEngineError>;

/// Errors that can occur in the media engine
#[derive(Error, Debug)]
pub enum MediaEngineError {
    /// DTLS handshake failed (protocol, crypto or cookie mismatch); fatal to the session
    #[error("DTLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// DTLS handshake made no progress within the allowed time
    #[error("DTLS handshake timed out after {elapsed_ms} ms")]
    HandshakeTimeout { elapsed_ms: u128 },

    /// Keying material could not be exported or split
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Exported secret has the wrong size
    #[error("Invalid keying material length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// One datagram could not be written; the stream continues
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Fragment sequence does not form a frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Operation needs a session in another state
    #[error("Invalid session state: {state}")]
    InvalidSessionState { state: String },

    /// SRTP protection/unprotection error
    #[error("SRTP error: {0}")]
    SrtpError(String),

    /// RTP packet parsing error
    #[error("RTP packet parse error: {0}")]
    RtpParseError(String),

    /// STUN message error
    #[error("STUN error: {0}")]
    StunError(String),

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for MediaEngineError {
    fn from(err: std::io::Error) -> Self {
        MediaEngineError::NetworkError(err.to_string())
    }
}

impl From<openssl::error::ErrorStack> for MediaEngineError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        MediaEngineError::HandshakeFailed(err.to_string())
    }
}
