//! Frame producer interface and the built-in blank-clip producer.
//!
//! A [`FrameProducer`] computes frames asynchronously and may complete them in any
//! order. Every requested frame is answered with exactly one `FrameReady` or
//! `FrameFailed` signal unless the producer was cancelled first.

use crate::config::ProducerConfig;
use crate::signal::SignalSink;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Error type for opening a script in a frame producer
#[derive(Debug, Error)]
pub enum ProducerError {
    /// The script text is empty
    #[error("Script '{0}' is empty")]
    EmptyScript(String),

    /// The script could not be evaluated
    #[error("Failed to evaluate script '{name}': {reason}")]
    Evaluation { name: String, reason: String },

    /// The producer configuration is unusable
    #[error("Invalid producer configuration: {0}")]
    InvalidConfig(String),
}

/// Chroma subsampling of a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsampling {
    Yuv420,
    Yuv422,
    Yuv444,
    Gray,
}

impl Subsampling {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "420" | "yuv420" => Some(Subsampling::Yuv420),
            "422" | "yuv422" => Some(Subsampling::Yuv422),
            "444" | "yuv444" => Some(Subsampling::Yuv444),
            "gray" | "grey" | "400" => Some(Subsampling::Gray),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsampling::Yuv420 => "420",
            Subsampling::Yuv422 => "422",
            Subsampling::Yuv444 => "444",
            Subsampling::Gray => "gray",
        }
    }
}

impl std::fmt::Display for Subsampling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format of the clip a script evaluates to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipInfo {
    pub width: u32,
    pub height: u32,
    pub fps_num: u64,
    pub fps_den: u64,
    pub bits_per_sample: u32,
    pub subsampling: Subsampling,
    pub num_frames: u64,
}

impl ClipInfo {
    pub fn fps(&self) -> f64 {
        if self.fps_den == 0 {
            0.0
        } else {
            self.fps_num as f64 / self.fps_den as f64
        }
    }

    /// Size of one planar frame in bytes.
    pub fn frame_size_bytes(&self) -> usize {
        let w = self.width as usize;
        let h = self.height as usize;
        let luma = w * h;
        let chroma = match self.subsampling {
            Subsampling::Yuv420 => 2 * (w.div_ceil(2) * h.div_ceil(2)),
            Subsampling::Yuv422 => 2 * (w.div_ceil(2) * h),
            Subsampling::Yuv444 => 2 * luma,
            Subsampling::Gray => 0,
        };
        let bytes_per_sample = (self.bits_per_sample as usize).div_ceil(8).max(1);
        (luma + chroma) * bytes_per_sample
    }

    pub fn from_config(cfg: &ProducerConfig) -> Result<Self, ProducerError> {
        let subsampling = Subsampling::parse(&cfg.subsampling).ok_or_else(|| {
            ProducerError::InvalidConfig(format!("unknown subsampling '{}'", cfg.subsampling))
        })?;
        if cfg.width == 0 || cfg.height == 0 {
            return Err(ProducerError::InvalidConfig(
                "clip width/height must be non-zero".to_string(),
            ));
        }
        if cfg.fps_num == 0 || cfg.fps_den == 0 {
            return Err(ProducerError::InvalidConfig(
                "clip fps numerator/denominator must be non-zero".to_string(),
            ));
        }
        if !(8..=32).contains(&cfg.bits_per_sample) {
            return Err(ProducerError::InvalidConfig(format!(
                "unsupported bit depth {}",
                cfg.bits_per_sample
            )));
        }
        Ok(Self {
            width: cfg.width,
            height: cfg.height,
            fps_num: cfg.fps_num,
            fps_den: cfg.fps_den,
            bits_per_sample: cfg.bits_per_sample,
            subsampling,
            num_frames: cfg.num_frames,
        })
    }
}

/// One computed frame: planar sample data in output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub number: u64,
    pub data: Vec<u8>,
}

/// Load snapshot mirrored into job progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub frames_in_queue: usize,
    pub frames_in_process: usize,
    pub max_threads: usize,
}

/// A script opened for frame production.
pub trait FrameProducer: Send {
    fn clip_info(&self) -> &ClipInfo;

    /// Start computing `frame`; the result arrives on `sink`.
    fn request_frame(&mut self, frame: u64, sink: SignalSink);

    /// Drop all outstanding requests; no further signals are sent for them.
    fn cancel(&mut self);

    fn stats(&self) -> ProducerStats;
}

/// Opens scripts into frame producers.
pub trait FrameProducerFactory: Send + Sync {
    fn open(&self, script: &str, script_name: &str)
        -> Result<Box<dyn FrameProducer>, ProducerError>;
}

/// Factory for [`BlankClipProducer`], used when no script engine is linked.
#[derive(Debug, Clone)]
pub struct BlankClipFactory {
    clip: ClipInfo,
    max_threads: usize,
    frame_delay: Duration,
}

impl BlankClipFactory {
    pub fn new(clip: ClipInfo, max_threads: usize, frame_delay: Duration) -> Self {
        Self {
            clip,
            max_threads: max_threads.max(1),
            frame_delay,
        }
    }

    pub fn from_config(cfg: &ProducerConfig, max_threads: usize) -> Result<Self, ProducerError> {
        Ok(Self::new(
            ClipInfo::from_config(cfg)?,
            max_threads,
            Duration::from_millis(cfg.frame_delay_ms),
        ))
    }
}

impl FrameProducerFactory for BlankClipFactory {
    fn open(
        &self,
        script: &str,
        script_name: &str,
    ) -> Result<Box<dyn FrameProducer>, ProducerError> {
        if script.trim().is_empty() {
            return Err(ProducerError::EmptyScript(script_name.to_string()));
        }
        Ok(Box::new(BlankClipProducer::new(
            self.clip.clone(),
            self.max_threads,
            self.frame_delay,
        )))
    }
}

/// Produces constant frames on a bounded worker pool.
///
/// Every sample of frame `n` has the value `n % 251`, which keeps frames
/// distinguishable on the output stream.
pub struct BlankClipProducer {
    clip: ClipInfo,
    max_threads: usize,
    frame_delay: Duration,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    queued: Arc<AtomicUsize>,
    processing: Arc<AtomicUsize>,
}

impl BlankClipProducer {
    pub fn new(clip: ClipInfo, max_threads: usize, frame_delay: Duration) -> Self {
        let max_threads = max_threads.max(1);
        Self {
            clip,
            max_threads,
            frame_delay,
            permits: Arc::new(Semaphore::new(max_threads)),
            cancel: CancellationToken::new(),
            queued: Arc::new(AtomicUsize::new(0)),
            processing: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FrameProducer for BlankClipProducer {
    fn clip_info(&self) -> &ClipInfo {
        &self.clip
    }

    fn request_frame(&mut self, frame: u64, sink: SignalSink) {
        if frame >= self.clip.num_frames {
            sink.frame_failed(
                frame,
                format!("frame {} is outside the clip (0..{})", frame, self.clip.num_frames),
            );
            return;
        }

        let permits = self.permits.clone();
        let cancel = self.cancel.clone();
        let queued = self.queued.clone();
        let processing = self.processing.clone();
        let delay = self.frame_delay;
        let size = self.clip.frame_size_bytes();

        queued.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            queued.fetch_sub(1, Ordering::SeqCst);
            let Some(permit) = permit else {
                return;
            };

            processing.fetch_add(1, Ordering::SeqCst);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let result = if cancel.is_cancelled() {
                None
            } else {
                let value = (frame % 251) as u8;
                Some(tokio::task::spawn_blocking(move || vec![value; size]).await)
            };
            processing.fetch_sub(1, Ordering::SeqCst);
            drop(permit);

            if cancel.is_cancelled() {
                return;
            }
            match result {
                Some(Ok(data)) => sink.frame_ready(Frame {
                    number: frame,
                    data,
                }),
                Some(Err(e)) => sink.frame_failed(frame, format!("frame worker panicked: {}", e)),
                None => {}
            }
        });
    }

    fn cancel(&mut self) {
        self.cancel.cancel();
    }

    fn stats(&self) -> ProducerStats {
        ProducerStats {
            frames_in_queue: self.queued.load(Ordering::SeqCst),
            frames_in_process: self.processing.load(Ordering::SeqCst),
            max_threads: self.max_threads,
        }
    }
}

impl Drop for BlankClipProducer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
