//! Host services the runtime delegates to.
//!
//! The recomposer never spins its own thread or timer. It asks the host for
//! frames through [`RuntimeScheduler`] and reads time through [`Clock`], which
//! keeps the core usable on hosts with their own event loop.

/// Requests frames on behalf of the runtime.
///
/// Apply observers call [`RuntimeScheduler::schedule_frame`] from whichever
/// thread committed a snapshot, so implementations must be thread safe.
pub trait RuntimeScheduler: Send + Sync {
    /// Ask the host to call back into the recomposer for a new frame.
    fn schedule_frame(&self);
}

/// Scheduler for hosts that drive frames themselves and ignore requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScheduler;

impl RuntimeScheduler for NoopScheduler {
    fn schedule_frame(&self) {}
}

/// Provides timing information for the runtime.
pub trait Clock: Send + Sync {
    /// Instant type produced by this clock implementation.
    type Instant: Copy + Send + Sync;

    fn now(&self) -> Self::Instant;

    /// Milliseconds elapsed since `since`.
    fn elapsed_millis(&self, since: Self::Instant) -> u64;

    /// Nanoseconds elapsed since `since`, used as the frame time.
    fn elapsed_nanos(&self, since: Self::Instant) -> u64 {
        self.elapsed_millis(since).saturating_mul(1_000_000)
    }
}
