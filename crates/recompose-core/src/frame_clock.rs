use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::runtime::{ContextHandle, FrameCallbackId};

/// Frame timing source backed by a scheduler context.
///
/// Callbacks run at the start of the next [`Recomposer::run_frame`](crate::Recomposer::run_frame),
/// before any recomposition, with that frame's time.
#[derive(Clone)]
pub struct FrameClock {
    context: ContextHandle,
}

impl FrameClock {
    pub fn new(context: ContextHandle) -> Self {
        Self { context }
    }

    pub fn with_frame_nanos(&self, callback: impl FnOnce(u64) + 'static) -> FrameCallbackRegistration {
        let id = self.context.register_frame_callback(callback);
        FrameCallbackRegistration {
            context: self.context.clone(),
            id,
        }
    }

    pub fn with_frame_millis(&self, callback: impl FnOnce(u64) + 'static) -> FrameCallbackRegistration {
        self.with_frame_nanos(move |nanos| callback(nanos / 1_000_000))
    }

    /// Resolves with the time of the next frame.
    pub fn next_frame(&self) -> NextFrame {
        NextFrame {
            clock: self.clone(),
            state: Rc::default(),
        }
    }
}

/// Keeps a frame callback registered; dropping it unregisters the callback.
#[must_use = "the frame callback is cancelled when the registration is dropped"]
pub struct FrameCallbackRegistration {
    context: ContextHandle,
    id: Option<FrameCallbackId>,
}

impl FrameCallbackRegistration {
    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }

    pub fn cancel(mut self) {
        self.unregister();
    }

    fn unregister(&mut self) {
        if let Some(id) = self.id.take() {
            self.context.cancel_frame_callback(id);
        }
    }
}

impl Drop for FrameCallbackRegistration {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[derive(Default)]
struct NextFrameState {
    registration: Option<FrameCallbackRegistration>,
    time: Option<u64>,
    waker: Option<Waker>,
}

pub struct NextFrame {
    clock: FrameClock,
    state: Rc<RefCell<NextFrameState>>,
}

impl Future for NextFrame {
    type Output = u64;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u64> {
        let mut state = self.state.borrow_mut();
        if let Some(time) = state.time {
            return Poll::Ready(time);
        }
        state.waker = Some(cx.waker().clone());
        if state.registration.is_none() {
            drop(state);
            let weak = Rc::downgrade(&self.state);
            let registration = self.clock.with_frame_nanos(move |time| {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                let waker = {
                    let mut state = state.borrow_mut();
                    state.time = Some(time);
                    // Already fired; nothing left to unregister.
                    if let Some(mut registration) = state.registration.take() {
                        registration.id = None;
                    }
                    state.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
            });
            self.state.borrow_mut().registration = Some(registration);
        }
        Poll::Pending
    }
}
