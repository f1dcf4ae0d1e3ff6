//! Continuous live-frame detection bound to a pluggable local model.
//!
//! The loop is advisory: detections are published for an overlay and never
//! persisted. It moves through
//! `Unloaded → Loading → Ready → Running → Stopped`.
//!
//! # Scheduling
//!
//! At most one `detect` call is pending at any time. The next request is
//! issued only after the previous one completes and only while the loop is
//! `Running` and the frame source is active. The single-flight guard is an
//! explicit flag held for the duration of each call and released on drop,
//! including for calls abandoned by [`FrameDetectionLoop::stop`].
//!
//! # Publication
//!
//! Each completed cycle replaces the published set wholesale through a
//! `watch` channel. Publication happens under the same lock as `stop`, and
//! every run carries a generation number; a completion from a stopped or
//! superseded run is discarded. Once `stop` returns, nothing more is
//! published until the next `start`.
//!
//! A failed detection is logged and published as an empty set. It never
//! stops the loop.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use partscan_core::models::Detection;

use crate::config::DetectionConfig;
use crate::logging::Logger;

const COMPONENT: &str = "detection";

/// A live frame handed to the detection model.
pub type Frame = image::RgbImage;

/// Latest published detection set.
pub type DetectionSet = Arc<Vec<Detection>>;

/// On-device detector. Loading may take seconds (weights fetch, warm-up).
#[async_trait]
pub trait DetectionModel: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> anyhow::Result<()>;

    async fn detect(&self, frame: &Frame) -> anyhow::Result<Vec<Detection>>;
}

/// Producer of live frames, e.g. a camera stream.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// `false` once the source has been closed.
    fn is_active(&self) -> bool;

    /// Next frame, or `None` when no frame is ready yet.
    async fn next_frame(&self) -> Option<Frame>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Unloaded,
    Loading,
    Ready,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoopError {
    /// Non-fatal: retry later or keep the start action disabled.
    #[error("detection model is not ready (state: {state:?})")]
    ModelNotReady { state: LoopState },
}

struct Shared {
    state: LoopState,
    generation: u64,
    task: Option<JoinHandle<()>>,
    state_tx: watch::Sender<LoopState>,
}

impl Shared {
    fn set_state(&mut self, state: LoopState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds the single-flight flag for one `detect` call.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct FrameDetectionLoop {
    model: Arc<dyn DetectionModel>,
    config: DetectionConfig,
    logger: Arc<dyn Logger>,
    shared: Arc<Mutex<Shared>>,
    in_flight: Arc<AtomicBool>,
    published: Arc<watch::Sender<DetectionSet>>,
}

impl FrameDetectionLoop {
    pub fn new(
        model: Arc<dyn DetectionModel>,
        config: DetectionConfig,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LoopState::Unloaded);
        let (published, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            model,
            config,
            logger,
            shared: Arc::new(Mutex::new(Shared {
                state: LoopState::Unloaded,
                generation: 0,
                task: None,
                state_tx,
            })),
            in_flight: Arc::new(AtomicBool::new(false)),
            published: Arc::new(published),
        }
    }

    pub fn state(&self) -> LoopState {
        lock(&self.shared).state
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            self.state(),
            LoopState::Ready | LoopState::Running | LoopState::Stopped
        )
    }

    /// True while a `detect` call is pending.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Currently published detections.
    pub fn detections(&self) -> DetectionSet {
        self.published.borrow().clone()
    }

    /// Observe every published detection set.
    pub fn subscribe(&self) -> watch::Receiver<DetectionSet> {
        self.published.subscribe()
    }

    /// Resolve once loading has finished, successfully or not.
    pub async fn wait_until_loaded(&self) -> LoopState {
        let mut rx = lock(&self.shared).state_tx.subscribe();
        let state = match rx.wait_for(|s| *s != LoopState::Loading).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Begin loading the model in the background if it is not loaded yet.
    pub fn preload(&self) {
        {
            let mut shared = lock(&self.shared);
            if shared.state != LoopState::Unloaded {
                return;
            }
            shared.set_state(LoopState::Loading);
        }

        let model = self.model.clone();
        let shared = self.shared.clone();
        let logger = self.logger.clone();
        self.logger
            .info(COMPONENT, &format!("loading detection model {}", model.name()));

        tokio::spawn(async move {
            let result = model.load().await;
            let mut shared = lock(&shared);
            if shared.state != LoopState::Loading {
                return;
            }
            match result {
                Ok(()) => {
                    logger.info(COMPONENT, &format!("detection model {} ready", model.name()));
                    shared.set_state(LoopState::Ready);
                }
                Err(e) => {
                    logger.error(
                        COMPONENT,
                        &format!("failed to load detection model {}: {}", model.name(), e),
                    );
                    shared.set_state(LoopState::Unloaded);
                }
            }
        });
    }

    /// Start detecting frames from `source`.
    ///
    /// Before the model is ready this kicks off loading (if needed) and
    /// returns [`LoopError::ModelNotReady`]. Starting a running loop is a no-op.
    pub fn start(&self, source: Arc<dyn FrameSource>) -> Result<(), LoopError> {
        let mut shared = lock(&self.shared);
        let state = shared.state;
        match state {
            LoopState::Unloaded => {
                drop(shared);
                self.preload();
                return Err(LoopError::ModelNotReady {
                    state: self.state(),
                });
            }
            LoopState::Loading => {
                return Err(LoopError::ModelNotReady {
                    state: LoopState::Loading,
                });
            }
            LoopState::Running => {
                self.logger.warn(COMPONENT, "detection loop already running");
                return Ok(());
            }
            LoopState::Ready | LoopState::Stopped => {}
        }

        shared.generation += 1;
        shared.set_state(LoopState::Running);

        let run = Run {
            generation: shared.generation,
            model: self.model.clone(),
            source,
            shared: self.shared.clone(),
            in_flight: self.in_flight.clone(),
            published: self.published.clone(),
            config: self.config.clone(),
            logger: self.logger.clone(),
        };
        shared.task = Some(tokio::spawn(run.drive()));
        self.logger.info(COMPONENT, "detection loop started");
        Ok(())
    }

    /// Stop the loop and clear published detections.
    ///
    /// Any pending completion is discarded; no detection set is published
    /// after this returns. Outside `Running`/`Ready` this only clears.
    pub fn stop(&self) {
        let mut shared = lock(&self.shared);
        if matches!(shared.state, LoopState::Running | LoopState::Ready) {
            shared.generation += 1;
            shared.set_state(LoopState::Stopped);
        }
        if let Some(task) = shared.task.take() {
            task.abort();
        }
        self.published.send_replace(Arc::new(Vec::new()));
        self.logger.info(COMPONENT, "detection loop stopped");
    }
}

impl Drop for FrameDetectionLoop {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.shared).task.take() {
            task.abort();
        }
    }
}

/// Everything one run of the loop needs, moved into its task.
struct Run {
    generation: u64,
    model: Arc<dyn DetectionModel>,
    source: Arc<dyn FrameSource>,
    shared: Arc<Mutex<Shared>>,
    in_flight: Arc<AtomicBool>,
    published: Arc<watch::Sender<DetectionSet>>,
    config: DetectionConfig,
    logger: Arc<dyn Logger>,
}

impl Run {
    async fn drive(self) {
        let backoff = Duration::from_millis(self.config.idle_backoff_ms.max(1));

        loop {
            if !self.is_current() {
                return;
            }
            if !self.source.is_active() {
                self.finish_on_inactive_source();
                return;
            }

            let Some(frame) = self.source.next_frame().await else {
                tokio::time::sleep(backoff).await;
                continue;
            };
            if !self.is_current() {
                return;
            }

            // a call abandoned by an earlier run may still be unwinding
            let Some(guard) = InFlight::acquire(&self.in_flight) else {
                tokio::time::sleep(backoff).await;
                continue;
            };
            let result = self.model.detect(&frame).await;
            drop(guard);

            let detections = match result {
                Ok(raw) => filter_detections(raw, &self.config),
                Err(e) => {
                    self.logger
                        .warn(COMPONENT, &format!("detection failed, skipping cycle: {}", e));
                    Vec::new()
                }
            };

            if !publish(&self.shared, self.generation, &self.published, detections) {
                return;
            }
        }
    }

    fn is_current(&self) -> bool {
        let shared = lock(&self.shared);
        shared.state == LoopState::Running && shared.generation == self.generation
    }

    fn finish_on_inactive_source(&self) {
        let mut shared = lock(&self.shared);
        if shared.state == LoopState::Running && shared.generation == self.generation {
            shared.generation += 1;
            shared.set_state(LoopState::Stopped);
            shared.task = None;
            self.published.send_replace(Arc::new(Vec::new()));
            self.logger
                .info(COMPONENT, "frame source closed, detection loop stopped");
        }
    }
}

/// Replace the published set if `generation` is still the running one.
/// Returns `false` when the result was discarded.
fn publish(
    shared: &Mutex<Shared>,
    generation: u64,
    published: &watch::Sender<DetectionSet>,
    detections: Vec<Detection>,
) -> bool {
    let shared = lock(shared);
    if shared.state != LoopState::Running || shared.generation != generation {
        return false;
    }
    published.send_replace(Arc::new(detections));
    true
}

/// Drop low-confidence hits, order by confidence, cap the count.
fn filter_detections(raw: Vec<Detection>, config: &DetectionConfig) -> Vec<Detection> {
    let mut kept: Vec<Detection> = raw
        .into_iter()
        .filter(|d| d.confidence.is_finite())
        .map(|mut d| {
            d.confidence = d.confidence.clamp(0.0, 1.0);
            d
        })
        .filter(|d| d.confidence >= config.min_confidence)
        .collect();
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    kept.truncate(config.max_detections);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{NoopLogger, RecordingLogger};
    use partscan_core::models::BoundingBox;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use tracing::Level;

    fn detection(label: &str, confidence: f32) -> Detection {
        Detection {
            label: label.to_string(),
            confidence,
            bounding_box: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
            },
        }
    }

    /// Detector that sleeps per call and tracks peak concurrency.
    struct SlowModel {
        delay: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        fail_first: bool,
        load_fails: bool,
    }

    impl SlowModel {
        fn new(delay_ms: u64) -> Self {
            Self {
                delay: Duration::from_millis(delay_ms),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                fail_first: false,
                load_fails: false,
            }
        }
    }

    #[async_trait]
    impl DetectionModel for SlowModel {
        fn name(&self) -> &str {
            "slow"
        }

        async fn load(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.load_fails {
                anyhow::bail!("weights missing");
            }
            Ok(())
        }

        async fn detect(&self, _frame: &Frame) -> anyhow::Result<Vec<Detection>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                anyhow::bail!("transient inference error");
            }
            Ok(vec![detection("resistor", 0.9), detection("noise", 0.1)])
        }
    }

    /// Detector whose calls block until released.
    struct GatedModel {
        gate: Notify,
        entered: Notify,
    }

    #[async_trait]
    impl DetectionModel for GatedModel {
        fn name(&self) -> &str {
            "gated"
        }
        async fn load(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn detect(&self, _frame: &Frame) -> anyhow::Result<Vec<Detection>> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(vec![detection("late", 0.99)])
        }
    }

    /// Source that yields a fresh frame immediately until closed.
    struct TestSource {
        active: AtomicBool,
        frames_left: AtomicUsize,
    }

    impl TestSource {
        fn endless() -> Arc<Self> {
            Arc::new(Self {
                active: AtomicBool::new(true),
                frames_left: AtomicUsize::new(usize::MAX),
            })
        }

        fn limited(frames: usize) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicBool::new(true),
                frames_left: AtomicUsize::new(frames),
            })
        }
    }

    #[async_trait]
    impl FrameSource for TestSource {
        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst) && self.frames_left.load(Ordering::SeqCst) > 0
        }
        async fn next_frame(&self) -> Option<Frame> {
            tokio::task::yield_now().await;
            self.frames_left.fetch_sub(1, Ordering::SeqCst);
            Some(Frame::new(4, 4))
        }
    }

    fn config() -> DetectionConfig {
        DetectionConfig {
            min_confidence: 0.5,
            max_detections: 10,
            idle_backoff_ms: 1,
        }
    }

    async fn ready_loop(model: Arc<dyn DetectionModel>) -> FrameDetectionLoop {
        let dl = FrameDetectionLoop::new(model, config(), Arc::new(NoopLogger));
        dl.preload();
        assert_eq!(dl.wait_until_loaded().await, LoopState::Ready);
        dl
    }

    #[tokio::test]
    async fn test_start_before_ready_is_rejected_and_triggers_loading() {
        let dl = FrameDetectionLoop::new(
            Arc::new(SlowModel::new(1)),
            config(),
            Arc::new(NoopLogger),
        );
        assert_eq!(dl.state(), LoopState::Unloaded);

        let err = dl.start(TestSource::endless()).unwrap_err();
        assert_eq!(
            err,
            LoopError::ModelNotReady {
                state: LoopState::Loading
            }
        );
        assert!(matches!(
            dl.start(TestSource::endless()),
            Err(LoopError::ModelNotReady { .. })
        ));

        assert_eq!(dl.wait_until_loaded().await, LoopState::Ready);
        assert!(dl.is_ready());
        dl.start(TestSource::endless()).unwrap();
        assert_eq!(dl.state(), LoopState::Running);
        dl.stop();
    }

    #[tokio::test]
    async fn test_failed_load_returns_to_unloaded() {
        let mut model = SlowModel::new(1);
        model.load_fails = true;
        let logger = RecordingLogger::new();
        let dl = FrameDetectionLoop::new(Arc::new(model), config(), logger.clone());
        dl.preload();
        assert_eq!(dl.wait_until_loaded().await, LoopState::Unloaded);
        assert_eq!(logger.count_matching(Level::ERROR, "weights missing"), 1);
    }

    #[tokio::test]
    async fn test_single_flight_under_fast_source() {
        let model = Arc::new(SlowModel::new(5));
        let dl = ready_loop(model.clone()).await;
        dl.start(TestSource::endless()).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        dl.stop();

        assert!(model.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(model.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publishes_filtered_sets() {
        let dl = ready_loop(Arc::new(SlowModel::new(1))).await;
        let mut rx = dl.subscribe();
        dl.start(TestSource::endless()).unwrap();

        rx.changed().await.unwrap();
        let set = rx.borrow_and_update().clone();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].label, "resistor");
        dl.stop();
    }

    #[tokio::test]
    async fn test_stop_clears_published_set() {
        let dl = ready_loop(Arc::new(SlowModel::new(1))).await;
        let mut rx = dl.subscribe();
        dl.start(TestSource::endless()).unwrap();

        rx.wait_for(|set| !set.is_empty()).await.unwrap();
        assert!(!dl.detections().is_empty());

        dl.stop();
        assert!(dl.detections().is_empty());
        assert!(rx.borrow_and_update().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dl.detections().is_empty());
        assert_eq!(dl.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_completion() {
        let model = Arc::new(GatedModel {
            gate: Notify::new(),
            entered: Notify::new(),
        });
        let dl = ready_loop(model.clone()).await;
        dl.start(TestSource::endless()).unwrap();

        model.entered.notified().await;
        assert!(dl.is_in_flight());
        dl.stop();
        let mut rx = dl.subscribe();
        assert!(dl.detections().is_empty());

        model.gate.notify_waiters();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!rx.has_changed().unwrap());
        assert!(dl.detections().is_empty());
        assert_eq!(dl.state(), LoopState::Stopped);
        assert!(!dl.is_in_flight());
    }

    #[test]
    fn test_publish_rejects_stale_generation() {
        let (state_tx, _) = watch::channel(LoopState::Running);
        let shared = Mutex::new(Shared {
            state: LoopState::Running,
            generation: 3,
            task: None,
            state_tx,
        });
        let (published, rx) = watch::channel(Arc::new(Vec::new()));

        assert!(!publish(&shared, 2, &published, vec![detection("old", 0.9)]));
        assert!(rx.borrow().is_empty());
        assert!(publish(&shared, 3, &published, vec![detection("new", 0.9)]));
        assert_eq!(rx.borrow()[0].label, "new");
    }

    #[tokio::test]
    async fn test_detection_failure_does_not_stop_loop() {
        let mut model = SlowModel::new(1);
        model.fail_first = true;
        let logger = RecordingLogger::new();
        let dl = FrameDetectionLoop::new(Arc::new(model), config(), logger.clone());
        dl.preload();
        dl.wait_until_loaded().await;

        let mut rx = dl.subscribe();
        dl.start(TestSource::endless()).unwrap();

        // first cycle publishes an empty set, a later one publishes the hit
        let mut saw_hit = false;
        for _ in 0..10 {
            rx.changed().await.unwrap();
            if !rx.borrow_and_update().is_empty() {
                saw_hit = true;
                break;
            }
        }
        assert!(saw_hit);
        assert_eq!(dl.state(), LoopState::Running);
        assert_eq!(logger.count_matching(Level::WARN, "transient inference error"), 1);
        dl.stop();
    }

    #[tokio::test]
    async fn test_inactive_source_stops_loop() {
        let dl = ready_loop(Arc::new(SlowModel::new(1))).await;
        dl.start(TestSource::limited(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dl.state(), LoopState::Stopped);
        assert!(dl.detections().is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let dl = ready_loop(Arc::new(SlowModel::new(1))).await;
        dl.start(TestSource::endless()).unwrap();
        dl.stop();
        assert_eq!(dl.state(), LoopState::Stopped);
        dl.start(TestSource::endless()).unwrap();
        assert_eq!(dl.state(), LoopState::Running);
        dl.stop();
    }

    #[test]
    fn test_filter_detections() {
        let cfg = DetectionConfig {
            min_confidence: 0.3,
            max_detections: 2,
            idle_backoff_ms: 1,
        };
        let out = filter_detections(
            vec![
                detection("a", 0.4),
                detection("b", 1.7),
                detection("c", 0.2),
                detection("d", f32::NAN),
                detection("e", 0.8),
            ],
            &cfg,
        );
        let labels: Vec<_> = out.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["b", "e"]);
        assert_eq!(out[0].confidence, 1.0);
    }
}
