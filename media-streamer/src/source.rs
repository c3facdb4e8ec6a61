//! Encoded frame sources
//!
//! The streamer does not encode video itself. A [`FrameSource`] hands it
//! complete H.264 access units with their RTP timestamps; [`pump`] forwards
//! them into the streamer's frame channel.
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


use crate::error::{StreamerError, StreamerResult};
use async_trait::async_trait;
use bytes::Bytes;
use secure_media_engine::EncodedFrame;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info};

const NAL_SEI: u8 = 6;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_AUD: u8 = 9;

/// Produces encoded frames with their RTP timestamps
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the source is exhausted
    async fn next_frame(&mut self) -> StreamerResult<Option<EncodedFrame>>;
}

/// Replays an H.264 Annex-B elementary stream at a fixed frame rate
pub struct AnnexBFileSource {
    units: Vec<Bytes>,
    position: usize,
    timestamp: u32,
    ticks_per_frame: u32,
    looping: bool,
    pacer: Interval,
}

impl AnnexBFileSource {
    /// Read and split an Annex-B file
    pub async fn open(path: &Path, clock_rate: u32, frame_rate: u32) -> StreamerResult<Self> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            StreamerError::SourceError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let source = Self::from_bytes(Bytes::from(data), clock_rate, frame_rate)?;
        info!(
            path = %path.display(),
            access_units = source.units.len(),
            "Frame source opened"
        );
        Ok(source)
    }

    /// Source over an in-memory Annex-B stream. The first timestamp is random.
    pub fn from_bytes(data: Bytes, clock_rate: u32, frame_rate: u32) -> StreamerResult<Self> {
        if clock_rate == 0 || frame_rate == 0 {
            return Err(StreamerError::ConfigError(
                "clock_rate and frame_rate must be greater than zero".to_string(),
            ));
        }

        let units = split_access_units(&data);
        if units.is_empty() {
            return Err(StreamerError::SourceError(
                "no H.264 access units found".to_string(),
            ));
        }

        let mut pacer = interval(Duration::from_secs_f64(1.0 / frame_rate as f64));
        pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(AnnexBFileSource {
            units,
            position: 0,
            timestamp: rand::random(),
            ticks_per_frame: clock_rate / frame_rate,
            looping: false,
            pacer,
        })
    }

    /// Restart from the first access unit at end of stream
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Number of access units in the stream
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the stream holds no access units
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[async_trait]
impl FrameSource for AnnexBFileSource {
    async fn next_frame(&mut self) -> StreamerResult<Option<EncodedFrame>> {
        if self.position == self.units.len() {
            if !self.looping {
                return Ok(None);
            }
            debug!("Frame source wrapped around");
            self.position = 0;
        }

        self.pacer.tick().await;

        let frame = EncodedFrame::new(self.units[self.position].clone(), self.timestamp);
        self.position += 1;
        self.timestamp = self.timestamp.wrapping_add(self.ticks_per_frame);
        Ok(Some(frame))
    }
}

/// Forward frames from `source` into `frames` until the source ends or the
/// receiver is dropped. Returns the number of frames forwarded.
pub async fn pump<S: FrameSource>(
    mut source: S,
    frames: mpsc::Sender<EncodedFrame>,
) -> StreamerResult<u64> {
    let mut forwarded = 0u64;
    while let Some(frame) = source.next_frame().await? {
        if frames.send(frame).await.is_err() {
            debug!("Frame channel closed, stopping source");
            break;
        }
        forwarded += 1;
    }
    Ok(forwarded)
}

/// Split an Annex-B stream into access units.
///
/// Start codes are kept, so each unit is sent exactly as the encoder wrote
/// it. A new unit begins at an access unit delimiter, or at SPS/PPS/SEI or a
/// first slice (first_mb_in_slice == 0) once the current unit holds a slice.
pub fn split_access_units(data: &[u8]) -> Vec<Bytes> {
    let mut units = Vec::new();
    let mut unit_start: Option<usize> = None;
    let mut has_slice = false;

    for (start, payload) in nal_units(data) {
        let Some(&header) = data.get(payload) else {
            continue;
        };
        let nal_type = header & 0x1f;
        let is_slice = nal_type == 1 || nal_type == 5;
        let first_slice = is_slice && data.get(payload + 1).map_or(false, |b| b & 0x80 != 0);

        let boundary = nal_type == NAL_AUD
            || (has_slice && matches!(nal_type, NAL_SEI | NAL_SPS | NAL_PPS))
            || (has_slice && first_slice);

        match unit_start {
            Some(begin) if boundary => {
                units.push(Bytes::copy_from_slice(&data[begin..start]));
                unit_start = Some(start);
                has_slice = false;
            }
            None => unit_start = Some(start),
            _ => {}
        }
        has_slice |= is_slice;
    }

    if let Some(begin) = unit_start {
        units.push(Bytes::copy_from_slice(&data[begin..]));
    }
    units.retain(|unit| !unit.is_empty());
    units
}

/// (start code offset, NAL header offset) for every NAL unit in `data`
fn nal_units(data: &[u8]) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            found.push((start, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80];
    const IDR: &[u8] = &[0, 0, 1, 0x65, 0x88, 0x84, 0x00];
    const SLICE: &[u8] = &[0, 0, 0, 1, 0x41, 0x9a, 0x02];
    // second slice of the same picture (first_mb_in_slice != 0)
    const SLICE_CONT: &[u8] = &[0, 0, 1, 0x41, 0x1a, 0x02];

    fn stream(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn test_split_groups_parameter_sets_with_idr() {
        let data = stream(&[SPS, PPS, IDR, SLICE, SLICE_CONT, SLICE]);
        let units = split_access_units(&data);

        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], &stream(&[SPS, PPS, IDR])[..]);
        assert_eq!(&units[1][..], &stream(&[SLICE, SLICE_CONT])[..]);
        assert_eq!(&units[2][..], SLICE);
    }

    #[test]
    fn test_split_on_access_unit_delimiter() {
        let aud: &[u8] = &[0, 0, 0, 1, 0x09, 0xf0];
        let data = stream(&[aud, SLICE_CONT, aud, SLICE_CONT]);
        let units = split_access_units(&data);

        assert_eq!(units.len(), 2);
        assert_eq!(&units[0][..], &stream(&[aud, SLICE_CONT])[..]);
    }

    #[test]
    fn test_split_without_start_code() {
        assert!(split_access_units(&[0x65, 0x88, 0x84]).is_empty());
        assert!(split_access_units(&[]).is_empty());
    }

    #[test]
    fn test_empty_stream_rejected() {
        let result = AnnexBFileSource::from_bytes(Bytes::from_static(&[1, 2, 3]), 90_000, 30);
        assert!(matches!(result, Err(StreamerError::SourceError(_))));
    }

    #[tokio::test]
    async fn test_timestamps_advance_per_frame() {
        let data = Bytes::from(stream(&[SPS, PPS, IDR, SLICE, SLICE]));
        let mut source = AnnexBFileSource::from_bytes(data, 90_000, 1000).unwrap();

        let first = source.next_frame().await.unwrap().unwrap();
        let second = source.next_frame().await.unwrap().unwrap();
        let third = source.next_frame().await.unwrap().unwrap();

        assert_eq!(second.timestamp, first.timestamp.wrapping_add(90));
        assert_eq!(third.timestamp, first.timestamp.wrapping_add(180));
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_looping_source_restarts() {
        let data = Bytes::from(stream(&[SPS, PPS, IDR]));
        let mut source = AnnexBFileSource::from_bytes(data, 90_000, 1000)
            .unwrap()
            .looping(true);
        assert_eq!(source.len(), 1);

        let first = source.next_frame().await.unwrap().unwrap();
        let again = source.next_frame().await.unwrap().unwrap();

        assert_eq!(first.data, again.data);
        assert_eq!(again.timestamp, first.timestamp.wrapping_add(90));
    }

    #[tokio::test]
    async fn test_pump_forwards_until_exhausted() {
        let data = Bytes::from(stream(&[SPS, PPS, IDR, SLICE]));
        let source = AnnexBFileSource::from_bytes(data, 90_000, 1000).unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let forwarded = pump(source, tx).await.unwrap();

        assert_eq!(forwarded, 2);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
