//! The top-level player: resolves a source (MPD URL or local file), owns
//! the media stream manager, and runs the pipeline tick loop that drives
//! downloads, concatenation, bitrate adaptation and MPD refreshes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adaptation::{DelayIssue, SetEvent};
use crate::error::{Result, StreamingError};
use crate::geometry::SourceType;
use crate::http::{ReqwestTransport, Transport};
use crate::media::MediaPacket;
use crate::mpd;
use crate::stream_manager::{MediaStreamManager, StreamHandle};
use crate::SetContext;

const TICK_INTERVAL: Duration = Duration::from_millis(20);
const ABR_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_BUFFERING_TIME_MS: u64 = 4000;
/// Headroom below the estimated bandwidth before picking a bitrate.
const BANDWIDTH_USAGE: f64 = 0.95;

/// Events surfaced to the embedding application.
pub enum PlayerEvent {
    StreamsCreated,
    DownloadIssue(DelayIssue),
    Error(StreamingError),
    Info(String),
    Warning(String),
}

pub type EventCallback = Arc<dyn Fn(PlayerEvent) + Send + Sync>;

/// EWMA bandwidth estimator over completed segment downloads.
struct BandwidthEstimator {
    ewma: f64,
    initialized: bool,
    alpha: f64,
}

impl BandwidthEstimator {
    fn new(alpha: f64) -> BandwidthEstimator {
        BandwidthEstimator {
            ewma: 0.0,
            initialized: false,
            alpha,
        }
    }

    fn record(&mut self, bits_per_second: f64) {
        if bits_per_second <= 0.0 {
            return;
        }
        self.ewma = if self.initialized {
            self.alpha * bits_per_second + (1.0 - self.alpha) * self.ewma
        } else {
            self.initialized = true;
            bits_per_second
        };
    }

    /// Estimated bandwidth in bits per second; optimistic before the first
    /// sample.
    fn estimate(&self) -> f64 {
        if self.initialized {
            self.ewma
        } else {
            50_000_000.0
        }
    }
}

pub struct OmafPlayer {
    manager: Arc<Mutex<MediaStreamManager>>,
    callback: EventCallback,
    cancellation: Arc<CancellationToken>,
    transport: Arc<dyn Transport>,
    mpd_url: Option<String>,
    minimum_update_period_ms: Option<u64>,
}

impl OmafPlayer {
    /// Opens an MPD URL: fetches and parses the manifest and builds the
    /// adaptation-set registry.
    pub async fn open_url(url: &str, callback: EventCallback) -> Result<OmafPlayer> {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new());
        Self::open_url_with_transport(url, callback, transport).await
    }

    pub async fn open_url_with_transport(
        url: &str,
        callback: EventCallback,
        transport: Arc<dyn Transport>,
    ) -> Result<OmafPlayer> {
        let (status, bytes) = transport
            .get(url, None)
            .await
            .map_err(StreamingError::NetworkAccessFailed)?;
        if !(200..300).contains(&status) {
            return Err(StreamingError::NetworkAccessFailed(format!(
                "MPD fetch returned {}",
                status
            )));
        }
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|_| StreamingError::InvalidData("MPD is not valid utf-8".into()))?;
        let mpd = mpd::parser::parse_mpd(&text)?;
        let base_url = url.rsplit_once('/').map(|(base, _)| base).unwrap_or("");
        let context = SetContext::from_mpd(
            &mpd,
            base_url.to_string(),
            Arc::clone(&transport),
            DEFAULT_BUFFERING_TIME_MS,
        );
        let manager = MediaStreamManager::from_mpd(&mpd, context)?;
        info!(
            "presentation opened: {} adaptation sets, {} viewpoints",
            mpd.adaptation_sets.len(),
            manager.viewpoint_count()
        );
        Ok(OmafPlayer {
            manager: Arc::new(Mutex::new(manager)),
            callback,
            cancellation: Arc::new(CancellationToken::new()),
            transport,
            mpd_url: Some(url.to_string()),
            minimum_update_period_ms: mpd
                .is_dynamic()
                .then_some(mpd.minimum_update_period_ms)
                .flatten(),
        })
    }

    /// Opens a local ISOBMFF file.
    pub fn open_file(path: &str, callback: EventCallback) -> Result<OmafPlayer> {
        let data = std::fs::read(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => StreamingError::FileNotFound,
            _ => StreamingError::FileOpenFailed,
        })?;
        let manager = MediaStreamManager::from_file(data.into())?;
        info!("local file opened: {}", path);
        Ok(OmafPlayer {
            manager: Arc::new(Mutex::new(manager)),
            callback,
            cancellation: Arc::new(CancellationToken::new()),
            transport: Arc::new(ReqwestTransport::new()),
            mpd_url: None,
            minimum_update_period_ms: None,
        })
    }

    /// Starts downloads and the pipeline tick loop.
    pub fn start(&self) {
        {
            let mut manager = self.manager.lock().unwrap();
            manager.start(Utc::now());
        }
        if self.mpd_url.is_none() {
            // local playback has nothing to tick
            return;
        }
        let manager = Arc::clone(&self.manager);
        let callback = Arc::clone(&self.callback);
        let cancellation = Arc::clone(&self.cancellation);
        let transport = Arc::clone(&self.transport);
        let mpd_url = self.mpd_url.clone();
        let update_period = self.minimum_update_period_ms;

        tokio::spawn(async move {
            let mut estimator = BandwidthEstimator::new(0.25);
            let mut last_abr = std::time::Instant::now();
            let mut last_mpd_refresh = std::time::Instant::now();
            let mut was_errored = false;
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => {
                        debug!("pipeline tick loop stopped");
                        break;
                    }
                    _ = tokio::time::sleep(TICK_INTERVAL) => {}
                }

                let mut bandwidth_samples = Vec::new();
                {
                    let mut manager = manager.lock().unwrap();
                    let events = manager.process_downloads();
                    for event in events {
                        match event {
                            SetEvent::StreamsCreated { .. } => {
                                callback(PlayerEvent::StreamsCreated);
                            }
                            SetEvent::SegmentDownloaded {
                                set_id,
                                speed_factor,
                                ..
                            } => {
                                if speed_factor > 0.0 {
                                    if let Some(set) =
                                        manager.sets().iter().find(|s| s.id() == set_id)
                                    {
                                        bandwidth_samples.push(
                                            set.current_bandwidth() as f64 * speed_factor as f64,
                                        );
                                    }
                                }
                            }
                            SetEvent::DelayIssue(issue) => {
                                callback(PlayerEvent::DownloadIssue(issue));
                            }
                            SetEvent::Error { error, .. } => {
                                callback(PlayerEvent::Error(error));
                            }
                        }
                    }
                    for sample in bandwidth_samples.drain(..) {
                        estimator.record(sample);
                    }
                    // surfaced once, on the transition into the failed
                    // state: no representation was left to fall back to
                    let errored = manager.is_error();
                    if errored && !was_errored {
                        callback(PlayerEvent::Error(StreamingError::OperationFailed(
                            "presentation has a failed stream with no fallback".to_string(),
                        )));
                    }
                    was_errored = errored;
                    if last_abr.elapsed() >= ABR_INTERVAL {
                        last_abr = std::time::Instant::now();
                        let budget = (estimator.estimate() * BANDWIDTH_USAGE) as u32;
                        manager.select_bitrate(budget);
                    }
                }

                // dynamic presentations refresh the manifest periodically
                if let (Some(url), Some(period_ms)) = (&mpd_url, update_period) {
                    if last_mpd_refresh.elapsed().as_millis() as u64 >= period_ms.max(1000) {
                        last_mpd_refresh = std::time::Instant::now();
                        match transport.get(url, None).await {
                            Ok((status, bytes)) if (200..300).contains(&status) => {
                                if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                                    match mpd::parser::parse_mpd(&text) {
                                        Ok(updated) => {
                                            manager.lock().unwrap().update_mpd(&updated);
                                            callback(PlayerEvent::Info(
                                                "MPD refreshed".to_string(),
                                            ));
                                        }
                                        Err(err) => callback(PlayerEvent::Warning(format!(
                                            "MPD parse error: {err}"
                                        ))),
                                    }
                                }
                            }
                            Ok((status, _)) => callback(PlayerEvent::Warning(format!(
                                "MPD refresh returned {status}"
                            ))),
                            Err(err) => callback(PlayerEvent::Warning(format!(
                                "MPD refresh failed: {err}"
                            ))),
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancellation.cancel();
        self.manager.lock().unwrap().stop();
    }

    pub fn pause(&self) {
        self.manager.lock().unwrap().pause();
    }

    /// Target download cache depth in milliseconds.
    pub fn set_buffering_time(&self, buffering_time_ms: u64) {
        self.manager
            .lock()
            .unwrap()
            .set_buffering_time(buffering_time_ms);
    }

    /// Restart from the beginning when the presentation runs out, with
    /// monotone timestamps.
    pub fn set_looping(&self) {
        self.manager.lock().unwrap().set_looping();
    }

    pub fn resume(&self) {
        self.manager.lock().unwrap().resume();
    }

    pub fn seek_to_ms(&self, target_ms: u64) -> Result<u64> {
        self.manager.lock().unwrap().seek_to_ms(target_ms)
    }

    /// Head-tracker feedback: updates tile prioritization.
    pub fn set_viewport(
        &self,
        longitude: f64,
        latitude: f64,
        horizontal_fov: f64,
        vertical_fov: f64,
    ) {
        self.manager
            .lock()
            .unwrap()
            .set_viewport(longitude, latitude, horizontal_fov, vertical_fov);
    }

    pub fn set_quality_levels(&self, foreground: u8, margin: u8, background: u8) {
        self.manager
            .lock()
            .unwrap()
            .set_quality_levels(foreground, margin, background);
    }

    pub fn switch_viewpoint(&self, viewpoint: usize) -> Result<()> {
        self.manager.lock().unwrap().switch_viewpoint(viewpoint)
    }

    pub fn viewpoint_count(&self) -> usize {
        self.manager.lock().unwrap().viewpoint_count()
    }

    pub fn is_buffering(&self) -> bool {
        self.manager.lock().unwrap().is_buffering()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.manager.lock().unwrap().is_end_of_stream()
    }

    pub fn is_error(&self) -> bool {
        self.manager.lock().unwrap().is_error()
    }

    // Decoder/renderer-side pull surface.

    pub fn read_video_frames(&self, now_us: u64) -> Vec<MediaPacket> {
        self.manager.lock().unwrap().read_video_frames(now_us)
    }

    pub fn read_audio_frames(&self) -> Vec<MediaPacket> {
        self.manager.lock().unwrap().read_audio_frames()
    }

    pub fn read_metadata(&self, now_us: u64) -> Vec<MediaPacket> {
        self.manager.lock().unwrap().read_metadata(now_us)
    }

    pub fn video_streams(&self) -> Vec<StreamHandle> {
        self.manager.lock().unwrap().video_streams()
    }

    pub fn audio_streams(&self) -> Vec<StreamHandle> {
        self.manager.lock().unwrap().audio_streams()
    }

    pub fn metadata_streams(&self) -> Vec<StreamHandle> {
        self.manager.lock().unwrap().metadata_streams()
    }

    pub fn video_source_types(&self) -> Vec<SourceType> {
        self.manager.lock().unwrap().video_source_types()
    }
}

impl Drop for OmafPlayer {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimator_warms_up_to_samples() {
        let mut estimator = BandwidthEstimator::new(0.25);
        assert_eq!(estimator.estimate(), 50_000_000.0);
        estimator.record(4_000_000.0);
        assert_eq!(estimator.estimate(), 4_000_000.0);
        estimator.record(8_000_000.0);
        // ewma moves a quarter of the way
        assert_eq!(estimator.estimate(), 5_000_000.0);
    }
}
