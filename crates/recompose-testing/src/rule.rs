use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use recompose_core::{
    ComposeError, Composer, Composition, Diagnostic, Recomposer, RecomposerConfig,
    RuntimeScheduler,
};

use crate::applier::{AppliedOp, RecordingApplier};

const FRAME_INTERVAL_NANOS: u64 = 16_000_000;
const MAX_PUMPED_FRAMES: usize = 100;

/// Scheduler that only counts frame requests. Tests decide when frames run.
#[derive(Debug, Default)]
pub struct TestScheduler {
    requests: AtomicUsize,
}

impl TestScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Requests since the last call.
    pub fn take_requests(&self) -> usize {
        self.requests.swap(0, Ordering::SeqCst)
    }
}

impl RuntimeScheduler for TestScheduler {
    fn schedule_frame(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Headless harness for exercising a composition in tests.
///
/// Owns a [`Recomposer`] driven by a [`TestScheduler`] and a single
/// composition over a [`RecordingApplier`]. Frames only run when the test
/// calls [`advance_frame`](Self::advance_frame) or
/// [`pump_until_idle`](Self::pump_until_idle).
pub struct ComposeTestRule {
    scheduler: Arc<TestScheduler>,
    recomposer: Recomposer,
    composition: Composition<RecordingApplier>,
    frame_time: Cell<u64>,
}

impl ComposeTestRule {
    pub fn new() -> Self {
        Self::with_config(RecomposerConfig::default())
    }

    pub fn with_config(config: RecomposerConfig) -> Self {
        let scheduler = TestScheduler::new();
        let recomposer = Recomposer::with_config(scheduler.clone(), config);
        let composition = recomposer.create_composition(RecordingApplier::new());
        Self {
            scheduler,
            recomposer,
            composition,
            frame_time: Cell::new(0),
        }
    }

    /// Install `content` and compose it.
    pub fn set_content(&self, content: impl Fn() + 'static) -> Result<(), ComposeError> {
        self.composition.set_content(content)
    }

    pub fn set_content_with(
        &self,
        content: impl Fn(&Composer) + 'static,
    ) -> Result<(), ComposeError> {
        self.composition.set_content_with(content)
    }

    /// Run one frame at `frame_time_nanos`.
    pub fn advance_frame(&self, frame_time_nanos: u64) -> Result<(), ComposeError> {
        self.frame_time.set(frame_time_nanos);
        self.recomposer.run_frame(frame_time_nanos)
    }

    /// Run frames, one interval apart, until the recomposer is idle. Returns
    /// how many ran.
    ///
    /// # Panics
    /// Panics when work keeps arriving after many frames, which usually
    /// means a composable writes state it reads on every pass.
    pub fn pump_until_idle(&self) -> Result<usize, ComposeError> {
        let mut frames = 0;
        while self.recomposer.has_pending_work() {
            assert!(
                frames < MAX_PUMPED_FRAMES,
                "pump_until_idle: still busy after {MAX_PUMPED_FRAMES} frames"
            );
            let time = self.frame_time.get() + FRAME_INTERVAL_NANOS;
            self.advance_frame(time)?;
            frames += 1;
        }
        Ok(frames)
    }

    pub fn scheduler(&self) -> &TestScheduler {
        &self.scheduler
    }

    pub fn recomposer(&self) -> &Recomposer {
        &self.recomposer
    }

    pub fn composition(&self) -> &Composition<RecordingApplier> {
        &self.composition
    }

    pub fn with_applier<R>(&self, f: impl FnOnce(&mut RecordingApplier) -> R) -> R {
        self.composition.with_applier(f)
    }

    /// Applier operations since the last call.
    pub fn take_ops(&self) -> Vec<AppliedOp> {
        self.with_applier(RecordingApplier::take_ops)
    }

    /// [`take_ops`](Self::take_ops) rendered as strings, for compact
    /// assertions.
    pub fn take_op_strings(&self) -> Vec<String> {
        self.take_ops().iter().map(ToString::to_string).collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.with_applier(RecordingApplier::texts)
    }

    pub fn dump_tree(&self) -> String {
        self.with_applier(|applier| applier.dump())
    }

    pub fn dump_slots(&self) -> String {
        self.composition.dump_slots()
    }

    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        self.composition.take_diagnostics()
    }

    pub fn dispose(&self) -> Result<(), ComposeError> {
        self.composition.dispose()
    }
}

impl Default for ComposeTestRule {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f` against a fresh [`ComposeTestRule`].
pub fn run_test_composition<R>(f: impl FnOnce(&ComposeTestRule) -> R) -> R {
    let rule = ComposeTestRule::new();
    f(&rule)
}
