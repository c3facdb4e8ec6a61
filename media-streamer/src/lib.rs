//! DTLS-SRTP media streamer
//!
//! Binds one UDP port, answers ICE-lite connectivity checks, runs a DTLS
//! handshake per peer and streams encoded H.264 frames to every peer whose
//! SRTP keys are in place.
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


pub mod error;
pub mod server;
pub mod source;

pub use error::{StreamerError, StreamerResult};
pub use server::{MediaStreamer, StreamerSettings, StreamerStats};
pub use source::{pump, AnnexBFileSource, FrameSource};
