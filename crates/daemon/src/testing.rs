//! Deterministic collaborators shared by unit tests.

use crate::concurrency::EncodingPlan;
use crate::frames::{ClipInfo, FrameProducer, FrameProducerFactory, ProducerError, ProducerStats, Subsampling};
use crate::job::JobEnvironment;
use crate::signal::{signal_channel, JobSignal, SignalSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub use crate::encode::process::testing::{FakeProcess, RecordingLauncher};

/// Two-byte gray frames, 25 fps.
pub fn tiny_clip(num_frames: u64) -> ClipInfo {
    ClipInfo {
        width: 2,
        height: 1,
        fps_num: 25,
        fps_den: 1,
        bits_per_sample: 8,
        subsampling: Subsampling::Gray,
        num_frames,
    }
}

/// Shared state of a producer that only records requests.
#[derive(Debug)]
pub struct ManualState {
    pub clip: ClipInfo,
    requested: Mutex<Vec<u64>>,
    cancelled: AtomicBool,
}

impl ManualState {
    pub fn new(clip: ClipInfo) -> Self {
        Self {
            clip,
            requested: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn requested(&self) -> Vec<u64> {
        self.requested.lock().unwrap().clone()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Factory whose producers never compute anything; tests deliver frames by hand.
pub struct ManualFactory(pub Arc<ManualState>);

struct ManualProducer(Arc<ManualState>);

impl FrameProducerFactory for ManualFactory {
    fn open(
        &self,
        script: &str,
        script_name: &str,
    ) -> Result<Box<dyn FrameProducer>, ProducerError> {
        if script.is_empty() {
            return Err(ProducerError::EmptyScript(script_name.to_string()));
        }
        Ok(Box::new(ManualProducer(self.0.clone())))
    }
}

impl FrameProducer for ManualProducer {
    fn clip_info(&self) -> &ClipInfo {
        &self.0.clip
    }

    fn request_frame(&mut self, frame: u64, _sink: SignalSink) {
        self.0.requested.lock().unwrap().push(frame);
    }

    fn cancel(&mut self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
    }

    fn stats(&self) -> ProducerStats {
        ProducerStats::default()
    }
}

pub struct TestEnv {
    pub env: JobEnvironment,
    pub launcher: Arc<RecordingLauncher>,
    pub producer: Arc<ManualState>,
    pub signals: mpsc::UnboundedReceiver<JobSignal>,
}

/// Environment over a 100-frame manual clip and a recording launcher.
pub fn test_env(plan: EncodingPlan) -> TestEnv {
    let producer = Arc::new(ManualState::new(tiny_clip(100)));
    let launcher = Arc::new(RecordingLauncher::new());
    let (tx, rx) = signal_channel();
    let env = JobEnvironment::new(
        Arc::new(ManualFactory(producer.clone())),
        launcher.clone(),
        tx,
        plan,
    );
    TestEnv {
        env,
        launcher,
        producer,
        signals: rx,
    }
}
