//! Scheduler context shared by a recomposer and its compositions.
//!
//! Owns everything a frame needs besides the compositions themselves: the
//! host scheduler, the inbox of state objects changed by applied snapshots,
//! frame callbacks, the UI task queue with its async executor, and the
//! cancellation flag. It is created with a recomposer and dropped with it.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use crate::collections::map::HashSet;
use crate::frame_clock::FrameClock;
use crate::platform::RuntimeScheduler;
use crate::snapshot::{self, ObserverHandle};
use crate::state::StateObjectId;

pub type FrameCallbackId = u64;

type StateInbox = Arc<Mutex<Vec<StateObjectId>>>;
type PostedTasks = Arc<Mutex<VecDeque<Box<dyn FnOnce() + Send>>>>;

/// Bound on executor sweeps per frame, so tasks that keep re-queueing
/// themselves cannot stall the frame.
const MAX_TASK_SWEEPS: usize = 16;

struct FrameCallbackEntry {
    id: FrameCallbackId,
    callback: Box<dyn FnOnce(u64)>,
}

struct TaskEntry {
    id: u64,
    future: Pin<Box<dyn Future<Output = ()>>>,
}

struct ContextInner {
    scheduler: Arc<dyn RuntimeScheduler>,
    needs_frame: Cell<bool>,
    changed_states: StateInbox,
    observers: RefCell<Vec<ObserverHandle>>,
    frame_callbacks: RefCell<VecDeque<FrameCallbackEntry>>,
    next_frame_callback_id: Cell<FrameCallbackId>,
    local_tasks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    posted_tasks: PostedTasks,
    tasks: RefCell<Vec<TaskEntry>>,
    cancelled_tasks: RefCell<HashSet<u64>>,
    next_task_id: Cell<u64>,
    task_waker: Waker,
    cancelled: Arc<AtomicBool>,
}

impl ContextInner {
    fn schedule(&self) {
        self.needs_frame.set(true);
        self.scheduler.schedule_frame();
    }

    fn register_frame_callback(&self, callback: Box<dyn FnOnce(u64)>) -> FrameCallbackId {
        let id = self.next_frame_callback_id.get();
        self.next_frame_callback_id.set(id + 1);
        self.frame_callbacks
            .borrow_mut()
            .push_back(FrameCallbackEntry { id, callback });
        self.schedule();
        id
    }

    fn cancel_frame_callback(&self, id: FrameCallbackId) {
        let mut callbacks = self.frame_callbacks.borrow_mut();
        if let Some(index) = callbacks.iter().position(|entry| entry.id == id) {
            callbacks.remove(index);
        }
    }

    fn enqueue_ui_task(&self, task: Box<dyn FnOnce()>) {
        self.local_tasks.borrow_mut().push_back(task);
        self.schedule();
    }

    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()>>>) -> u64 {
        let id = self.next_task_id.get();
        self.next_task_id.set(id + 1);
        self.tasks.borrow_mut().push(TaskEntry { id, future });
        self.schedule();
        id
    }

    fn cancel_task(&self, id: u64) {
        let mut tasks = self.tasks.borrow_mut();
        let before = tasks.len();
        tasks.retain(|entry| entry.id != id);
        if tasks.len() == before {
            // The task may be mid-poll, outside of the list.
            self.cancelled_tasks.borrow_mut().insert(id);
        }
    }

    fn poll_tasks(&self) -> bool {
        let mut cx = Context::from_waker(&self.task_waker);
        let tasks = std::mem::take(&mut *self.tasks.borrow_mut());
        let mut pending = Vec::with_capacity(tasks.len());
        let mut progressed = false;
        for mut entry in tasks {
            if self.cancelled_tasks.borrow_mut().remove(&entry.id) {
                continue;
            }
            match entry.future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => progressed = true,
                Poll::Pending => pending.push(entry),
            }
        }
        let mut cancelled = self.cancelled_tasks.borrow_mut();
        pending.retain(|entry| !cancelled.remove(&entry.id));
        drop(cancelled);
        self.tasks.borrow_mut().extend(pending);
        progressed
    }

    fn run_local_tasks(&self) -> bool {
        let mut executed = false;
        loop {
            let posted = self
                .posted_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            if let Some(task) = posted {
                executed = true;
                task();
                continue;
            }
            let local = self.local_tasks.borrow_mut().pop_front();
            match local {
                Some(task) => {
                    executed = true;
                    task();
                }
                None => return executed,
            }
        }
    }

    fn has_pending_tasks(&self) -> bool {
        !self.local_tasks.borrow().is_empty()
            || !self
                .posted_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }
}

/// Owner handle of the scheduler context. Clones share the same context.
#[derive(Clone)]
pub struct SchedulerContext {
    inner: Rc<ContextInner>,
}

impl SchedulerContext {
    /// Create a context and start listening for applied snapshots.
    pub fn new(scheduler: Arc<dyn RuntimeScheduler>) -> Self {
        let changed_states = StateInbox::default();
        let waker = futures_task::waker(Arc::new(TaskWaker {
            scheduler: Arc::clone(&scheduler),
        }));
        let inner = Rc::new(ContextInner {
            scheduler: Arc::clone(&scheduler),
            needs_frame: Cell::new(false),
            changed_states: Arc::clone(&changed_states),
            observers: RefCell::new(Vec::new()),
            frame_callbacks: RefCell::new(VecDeque::new()),
            next_frame_callback_id: Cell::new(1),
            local_tasks: RefCell::new(VecDeque::new()),
            posted_tasks: PostedTasks::default(),
            tasks: RefCell::new(Vec::new()),
            cancelled_tasks: RefCell::new(HashSet::default()),
            next_task_id: Cell::new(1),
            task_waker: waker,
            cancelled: Arc::new(AtomicBool::new(false)),
        });

        let apply_scheduler = Arc::clone(&scheduler);
        let apply = snapshot::register_apply_observer(move |objects, _| {
            changed_states
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(objects.iter().map(|object| object.object_id()));
            apply_scheduler.schedule_frame();
        });
        let write_scheduler = Arc::clone(&scheduler);
        let global_write =
            snapshot::register_global_write_observer(move |_| write_scheduler.schedule_frame());
        inner.observers.borrow_mut().extend([apply, global_write]);

        Self { inner }
    }

    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn scheduler(&self) -> Arc<dyn RuntimeScheduler> {
        Arc::clone(&self.inner.scheduler)
    }

    /// Ask the host for a frame.
    pub fn request_frame(&self) {
        self.inner.schedule();
    }

    pub fn needs_frame(&self) -> bool {
        self.inner.needs_frame.get()
    }

    pub(crate) fn frame_handled(&self) {
        self.inner.needs_frame.set(false);
    }

    pub fn frame_clock(&self) -> FrameClock {
        FrameClock::new(self.handle())
    }

    /// Drain state objects changed by applied snapshots since the last call.
    pub fn take_changed_states(&self) -> Vec<StateObjectId> {
        std::mem::take(
            &mut *self
                .inner
                .changed_states
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn has_changed_states(&self) -> bool {
        !self
            .inner
            .changed_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn register_frame_callback(&self, callback: impl FnOnce(u64) + 'static) -> FrameCallbackId {
        self.inner.register_frame_callback(Box::new(callback))
    }

    pub fn cancel_frame_callback(&self, id: FrameCallbackId) {
        self.inner.cancel_frame_callback(id);
    }

    pub fn has_frame_callbacks(&self) -> bool {
        !self.inner.frame_callbacks.borrow().is_empty()
    }

    /// Run every callback registered before this call with `frame_time_nanos`.
    /// Callbacks registered while draining wait for the next frame.
    pub fn drain_frame_callbacks(&self, frame_time_nanos: u64) {
        let callbacks = std::mem::take(&mut *self.inner.frame_callbacks.borrow_mut());
        for entry in callbacks {
            (entry.callback)(frame_time_nanos);
        }
    }

    /// Queue a closure for the UI thread. It may capture `Rc`/`RefCell` state.
    pub fn enqueue_ui_task(&self, task: impl FnOnce() + 'static) {
        self.inner.enqueue_ui_task(Box::new(task));
    }

    pub fn spawn_ui(&self, future: impl Future<Output = ()> + 'static) -> TaskHandle {
        let id = self.inner.spawn(Box::pin(future));
        TaskHandle {
            id,
            context: self.handle(),
        }
    }

    /// Handle other threads use to post work to this context.
    pub fn dispatcher(&self) -> UiDispatcher {
        UiDispatcher {
            tasks: Arc::clone(&self.inner.posted_tasks),
            scheduler: Arc::clone(&self.inner.scheduler),
        }
    }

    /// Run queued UI tasks and poll spawned futures until they stop making
    /// progress. Returns whether anything ran.
    pub fn run_ui_tasks(&self) -> bool {
        let mut executed = false;
        for _ in 0..MAX_TASK_SWEEPS {
            let ran = self.inner.run_local_tasks();
            let polled = self.inner.poll_tasks();
            if !ran && !polled {
                break;
            }
            executed = true;
        }
        executed
    }

    pub fn has_pending_tasks(&self) -> bool {
        self.inner.has_pending_tasks()
    }

    pub fn active_task_count(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.cancelled)
    }

    /// Stop listening for snapshot applies and drop queued work.
    pub(crate) fn shut_down(&self) {
        self.inner.observers.borrow_mut().clear();
        self.inner.frame_callbacks.borrow_mut().clear();
        self.inner.local_tasks.borrow_mut().clear();
        self.inner.tasks.borrow_mut().clear();
        self.inner
            .posted_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.take_changed_states();
    }
}

/// Weak handle to a [`SchedulerContext`], held by effects and clocks.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Weak<ContextInner>,
}

impl ContextHandle {
    pub fn upgrade(&self) -> Option<SchedulerContext> {
        self.inner.upgrade().map(|inner| SchedulerContext { inner })
    }

    pub fn request_frame(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.schedule();
        }
    }

    pub fn register_frame_callback(
        &self,
        callback: impl FnOnce(u64) + 'static,
    ) -> Option<FrameCallbackId> {
        self.inner
            .upgrade()
            .map(|inner| inner.register_frame_callback(Box::new(callback)))
    }

    pub fn cancel_frame_callback(&self, id: FrameCallbackId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel_frame_callback(id);
        }
    }

    pub fn enqueue_ui_task(&self, task: impl FnOnce() + 'static) {
        if let Some(inner) = self.inner.upgrade() {
            inner.enqueue_ui_task(Box::new(task));
        }
    }

    pub fn spawn_ui(&self, future: impl Future<Output = ()> + 'static) -> Option<TaskHandle> {
        let inner = self.inner.upgrade()?;
        let id = inner.spawn(Box::pin(future));
        Some(TaskHandle {
            id,
            context: self.clone(),
        })
    }
}

/// A future spawned on the UI executor.
pub struct TaskHandle {
    id: u64,
    context: ContextHandle,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(self) {
        if let Some(inner) = self.context.inner.upgrade() {
            inner.cancel_task(self.id);
        }
    }
}

/// Thread-safe handle for posting work to the UI thread.
#[derive(Clone)]
pub struct UiDispatcher {
    tasks: PostedTasks,
    scheduler: Arc<dyn RuntimeScheduler>,
}

impl UiDispatcher {
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Box::new(task));
        self.scheduler.schedule_frame();
    }
}

struct TaskWaker {
    scheduler: Arc<dyn RuntimeScheduler>,
}

impl futures_task::ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.scheduler.schedule_frame();
    }
}

#[cfg(test)]
#[path = "tests/runtime_tests.rs"]
mod tests;
