//! Secure media engine for one-way H.264 streaming over DTLS-SRTP
//!
//! This crate provides the per-peer pieces of a secured RTP video sender:
//! - DTLS handshake with address-bound cookies and SRTP key export
//! - SRTP (AES_CM_128_HMAC_SHA1_80) protection
//! - RTP header construction and H.264 frame fragmentation
//! - STUN binding responses for ICE-lite and RFC 7983 demultiplexing
//!
//! # Flow
//!
//! A [`DtlsServer`] hands out one [`DtlsHandshake`] per peer. A [`Session`]
//! wraps it and, once established, installs the server write key as its
//! outbound [`SrtpContext`]. [`SrtpSender::send_frame`] fragments each
//! encoded frame and writes the protected packets to the peer.
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


pub mod cookie;
pub mod demux;
pub mod dtls;
pub mod error;
pub mod h264_payload;
pub mod key_material;
pub mod rtp_handler;
pub mod session;
pub mod srtp_pipeline;
pub mod stream;
pub mod stun;
pub mod transport;

// Re-export main types
pub use cookie::CookieSecret;
pub use demux::{classify, is_client_hello, DatagramKind};
pub use dtls::{DatagramChannel, DtlsHandshake, DtlsServer, DtlsServerConfig, HandshakeState};
pub use error::{MediaEngineError, MediaEngineResult};
pub use h264_payload::{EncodedFrame, FragmentIndicator, FrameAssembler, H264Fragmenter};
pub use key_material::{Role, SrtpKeyingMaterial, SrtpMasterKey};
pub use rtp_handler::{RtpHeader, RtpPacket};
pub use session::Session;
pub use srtp_pipeline::SrtpContext;
pub use stream::{MediaStream, StreamConfig, StreamStats};
pub use stun::{BindingResponder, StunMessage, StunMessageBuilder};
pub use transport::{DatagramTransport, SendReport, SrtpSender};
