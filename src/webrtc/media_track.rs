//! Local media tracks
//!
//! The media-capture API is an external collaborator: something (a camera
//! pipeline, a file reader, a test) produces encoded samples. `MediaCapture`
//! is the seam the call driver uses; `SampleMediaCapture` is the webrtc-rs
//! backed implementation that hands out sample tracks and lets the producer
//! push frames into them.

use super::WebRTCError;
use crate::call::MediaMode;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local track ready to be attached to a peer connection
#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub track: Arc<TrackLocalStaticSample>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl LocalTrack {
    pub fn audio(stream_id: &str) -> Self {
        Self::new(
            TrackKind::Audio,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            stream_id,
        )
    }

    pub fn video(stream_id: &str) -> Self {
        Self::new(
            TrackKind::Video,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
            stream_id,
        )
    }

    fn new(kind: TrackKind, codec: RTCRtpCodecCapability, stream_id: &str) -> Self {
        let prefix = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        let id = format!("{}-{}", prefix, uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(codec, id.clone(), stream_id.to_string()));
        Self { id, kind, track }
    }
}

/// Source of local camera/microphone tracks
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Open the devices needed for `mode`. Fails when access is denied or a
    /// device is missing.
    async fn acquire(&self, mode: MediaMode) -> Result<Vec<LocalTrack>, WebRTCError>;

    /// Mute or unmute the outgoing audio
    fn set_muted(&self, muted: bool);

    /// Stop the given tracks only. Used for acquisitions that finished after
    /// the call they were meant for went away.
    fn release(&self, tracks: &[LocalTrack]);

    /// Stop every capturing track and reset the mute state
    fn stop(&self);
}

/// Sample-fed capture: tracks are created on `acquire` and capture until
/// released or stopped. The producer pushes encoded frames with
/// `write_sample`.
pub struct SampleMediaCapture {
    stream_id: String,
    video_available: bool,
    muted: AtomicBool,
    tracks: Mutex<Vec<LocalTrack>>,
}

impl SampleMediaCapture {
    pub fn new(video_available: bool) -> Self {
        Self {
            stream_id: format!("call-{}", uuid::Uuid::new_v4()),
            video_available,
            muted: AtomicBool::new(false),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.lock().clone()
    }

    /// Push one encoded frame to every capturing track of `kind`. Audio is
    /// silently dropped while muted.
    pub async fn write_sample(&self, kind: TrackKind, data: Bytes, duration: Duration) -> Result<(), WebRTCError> {
        if kind == TrackKind::Audio && self.is_muted() {
            return Ok(());
        }
        let targets: Vec<_> = self
            .tracks
            .lock()
            .iter()
            .filter(|t| t.kind == kind)
            .map(|t| t.track.clone())
            .collect();
        if targets.is_empty() {
            return Err(WebRTCError::MediaError(format!("No {:?} track is capturing", kind)));
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        for track in targets {
            track
                .write_sample(&sample)
                .await
                .map_err(|e| WebRTCError::MediaError(format!("Failed to write sample: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaCapture for SampleMediaCapture {
    async fn acquire(&self, mode: MediaMode) -> Result<Vec<LocalTrack>, WebRTCError> {
        if !mode.is_audio_only() && !self.video_available {
            return Err(WebRTCError::MediaError("No camera available".to_string()));
        }
        let mut tracks = vec![LocalTrack::audio(&self.stream_id)];
        if !mode.is_audio_only() {
            tracks.push(LocalTrack::video(&self.stream_id));
        }
        info!("Capturing {} local tracks ({:?})", tracks.len(), mode);
        self.tracks.lock().extend(tracks.iter().cloned());
        Ok(tracks)
    }

    fn set_muted(&self, muted: bool) {
        debug!("Local audio {}", if muted { "muted" } else { "unmuted" });
        self.muted.store(muted, Ordering::Relaxed);
    }

    fn release(&self, tracks: &[LocalTrack]) {
        let mut live = self.tracks.lock();
        let before = live.len();
        live.retain(|t| !tracks.iter().any(|r| r.id == t.id));
        debug!("Released {} local tracks, {} still capturing", before - live.len(), live.len());
    }

    fn stop(&self) {
        self.muted.store(false, Ordering::Relaxed);
        let mut tracks = self.tracks.lock();
        if !tracks.is_empty() {
            debug!("Stopping {} local tracks", tracks.len());
            tracks.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_audio_only_capture_has_one_track() {
        let capture = SampleMediaCapture::new(false);
        let tracks = capture.acquire(MediaMode::AudioOnly).await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].kind, TrackKind::Audio);
        assert!(tracks[0].id.starts_with("audio-"));
    }

    #[tokio::test]
    async fn test_video_needs_a_camera() {
        let capture = SampleMediaCapture::new(false);
        assert!(matches!(
            capture.acquire(MediaMode::AudioVideo).await,
            Err(WebRTCError::MediaError(_))
        ));

        let capture = SampleMediaCapture::new(true);
        let tracks = capture.acquire(MediaMode::AudioVideo).await.unwrap();
        assert_eq!(tracks.iter().filter(|t| t.kind == TrackKind::Video).count(), 1);
    }

    #[tokio::test]
    async fn test_muted_audio_is_dropped() {
        let capture = SampleMediaCapture::new(true);
        capture.acquire(MediaMode::AudioOnly).await.unwrap();
        capture.set_muted(true);
        let res = capture
            .write_sample(TrackKind::Audio, Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
            .await;
        assert!(res.is_ok());

        capture.stop();
        assert!(capture.tracks().is_empty());
        assert!(!capture.is_muted());
        assert!(capture
            .write_sample(TrackKind::Audio, Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_release_leaves_other_tracks_capturing() {
        let capture = SampleMediaCapture::new(true);
        let old = capture.acquire(MediaMode::AudioVideo).await.unwrap();
        let current = capture.acquire(MediaMode::AudioOnly).await.unwrap();
        assert_eq!(capture.tracks().len(), 3);

        capture.release(&old);
        let ids: Vec<_> = capture.tracks().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![current[0].id.clone()]);
        assert!(capture
            .write_sample(TrackKind::Video, Bytes::from_static(&[0u8; 4]), Duration::from_millis(33))
            .await
            .is_err());
    }
}
