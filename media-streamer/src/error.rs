//! Error types for the media streamer
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


use secure_media_engine::MediaEngineError;
use thiserror::Error;

/// Media streamer error
#[derive(Debug, Error)]
pub enum StreamerError {
    /// Session, handshake or packet error from the engine
    #[error(transparent)]
    Engine(#[from] MediaEngineError),

    /// Socket could not be bound or read
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Frame source could not be opened or read
    #[error("Frame source error: {0}")]
    SourceError(String),

    /// Invalid streamer settings
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for streamer operations
pub type StreamerResult<T> = Result<T, StreamerError>;
