//! Standard runtime services backed by Rust's `std` library.
//!
//! [`StdScheduler`] records frame requests and wakes a thread blocked in
//! [`StdScheduler::wait_for_frame`]. [`StdRuntime`] bundles it with a
//! [`Recomposer`] and a monotonic [`StdClock`], so a host thread can drive
//! frames with a plain loop:
//!
//! ```no_run
//! # use recompose_runtime_std::StdRuntime;
//! # use std::time::Duration;
//! let runtime = StdRuntime::new();
//! // ... create compositions through runtime.recomposer() ...
//! while runtime.wait_and_run_frame(Duration::from_millis(16)).is_ok() {}
//! ```

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use recompose_core::{
    Applier, Clock, ComposeError, Composition, FrameClock, Recomposer, RecomposerConfig,
    RuntimeScheduler, UiDispatcher,
};

type FrameWaker = Arc<dyn Fn() + Send + Sync + 'static>;

/// Scheduler that delegates work to Rust's threading primitives.
pub struct StdScheduler {
    frame_requested: Mutex<bool>,
    frame_signal: Condvar,
    frame_waker: RwLock<Option<FrameWaker>>,
}

impl StdScheduler {
    pub fn new() -> Self {
        Self {
            frame_requested: Mutex::new(false),
            frame_signal: Condvar::new(),
            frame_waker: RwLock::new(None),
        }
    }

    /// Returns whether a frame has been requested since the last call.
    pub fn take_frame_request(&self) -> bool {
        let mut requested = self
            .frame_requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *requested, false)
    }

    /// Block until a frame is requested or `timeout` elapses. Consumes the
    /// request and returns whether there was one.
    pub fn wait_for_frame(&self, timeout: Duration) -> bool {
        let requested = self
            .frame_requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (mut requested, _) = self
            .frame_signal
            .wait_timeout_while(requested, timeout, |requested| !*requested)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *requested, false)
    }

    /// Registers a waker invoked whenever a new frame is scheduled, for hosts
    /// with their own event loop.
    pub fn set_frame_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *self
            .frame_waker
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(waker));
    }

    pub fn clear_frame_waker(&self) {
        *self
            .frame_waker
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn wake(&self) {
        let waker = self
            .frame_waker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(waker) = waker {
            waker();
        }
    }
}

impl Default for StdScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StdScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let requested = *self
            .frame_requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("StdScheduler")
            .field("frame_requested", &requested)
            .finish()
    }
}

impl RuntimeScheduler for StdScheduler {
    fn schedule_frame(&self) {
        *self
            .frame_requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.frame_signal.notify_all();
        self.wake();
    }
}

/// Clock implementation backed by [`std::time`].
#[derive(Debug, Default, Clone)]
pub struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        Instant::now()
    }

    fn elapsed_millis(&self, since: Self::Instant) -> u64 {
        u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn elapsed_nanos(&self, since: Self::Instant) -> u64 {
        u64::try_from(since.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl StdClock {
    pub fn elapsed(&self, since: Instant) -> Duration {
        since.elapsed()
    }
}

/// A recomposer driven by [`StdScheduler`] and timed by [`StdClock`].
///
/// Lives on the thread that composes. Other threads reach it through
/// [`dispatcher`](Self::dispatcher) and by writing state, both of which wake
/// a thread waiting in [`wait_and_run_frame`](Self::wait_and_run_frame).
pub struct StdRuntime {
    scheduler: Arc<StdScheduler>,
    clock: StdClock,
    started: Instant,
    recomposer: Recomposer,
}

impl StdRuntime {
    pub fn new() -> Self {
        Self::with_config(RecomposerConfig::default())
    }

    pub fn with_config(config: RecomposerConfig) -> Self {
        let scheduler = Arc::new(StdScheduler::new());
        let recomposer = Recomposer::with_config(scheduler.clone(), config);
        let clock = StdClock;
        Self {
            scheduler,
            started: clock.now(),
            clock,
            recomposer,
        }
    }

    pub fn recomposer(&self) -> &Recomposer {
        &self.recomposer
    }

    pub fn create_composition<A: Applier + 'static>(&self, applier: A) -> Composition<A> {
        self.recomposer.create_composition(applier)
    }

    pub fn scheduler(&self) -> Arc<StdScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn clock(&self) -> &StdClock {
        &self.clock
    }

    pub fn frame_clock(&self) -> FrameClock {
        self.recomposer.context().frame_clock()
    }

    pub fn dispatcher(&self) -> UiDispatcher {
        self.recomposer.context().dispatcher()
    }

    /// Nanoseconds since the runtime was created.
    pub fn frame_time_nanos(&self) -> u64 {
        self.clock.elapsed_nanos(self.started)
    }

    pub fn take_frame_request(&self) -> bool {
        self.scheduler.take_frame_request()
    }

    /// Run one frame now, timed by the clock.
    pub fn run_frame(&self) -> Result<(), ComposeError> {
        let nanos = self.frame_time_nanos();
        log::trace!("running frame at {nanos}ns");
        self.recomposer.run_frame(nanos)
    }

    /// Wait up to `timeout` for a frame request and run the frame if one
    /// came. Returns whether a frame ran.
    pub fn wait_and_run_frame(&self, timeout: Duration) -> Result<bool, ComposeError> {
        if !self.scheduler.wait_for_frame(timeout) {
            return Ok(false);
        }
        self.run_frame().map(|()| true)
    }

    /// Run frames until the recomposer has nothing left to do, at most
    /// `max_frames` of them. Returns how many ran.
    pub fn run_until_idle(&self, max_frames: usize) -> Result<usize, ComposeError> {
        let mut frames = 0;
        while self.recomposer.has_pending_work() {
            if frames == max_frames {
                log::warn!("still busy after {max_frames} frame(s)");
                break;
            }
            self.scheduler.take_frame_request();
            self.run_frame()?;
            frames += 1;
        }
        Ok(frames)
    }

    pub fn shut_down(&self) {
        self.recomposer.cancel();
    }
}

impl fmt::Debug for StdRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdRuntime")
            .field("scheduler", &self.scheduler)
            .field("state", &self.recomposer.state())
            .finish()
    }
}

impl Default for StdRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/std_runtime_tests.rs"]
mod tests;
