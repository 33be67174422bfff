//! Effects: work tied to a composable's presence in the composition rather
//! than to a single pass.
//!
//! Effects never run during composition. A keyed effect (re)starts in the
//! side-effect phase of the pass that inserted it or changed its keys, and is
//! torn down when its keys change or its group is forgotten.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::hash::Hash;
use std::panic::Location;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use crate::composer::Composer;
use crate::composer_context::with_current_composer;
use crate::frame_clock::FrameClock;
use crate::remember::RememberObserver;
use crate::runtime::{ContextHandle, TaskHandle};
use crate::{hash_key, location_key, Key};

/// What a disposable effect leaves behind to undo itself.
#[must_use = "return the result from the effect so its dispose callback is kept"]
pub struct DisposableEffectResult {
    dispose: Option<Box<dyn FnOnce()>>,
}

impl DisposableEffectResult {
    pub fn new(dispose: impl FnOnce() + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn none() -> Self {
        Self { dispose: None }
    }
}

/// Receiver of a disposable effect, mirroring the `onDispose` builder.
pub struct DisposableEffectScope {
    _private: (),
}

impl DisposableEffectScope {
    pub fn on_dispose(&self, dispose: impl FnOnce() + 'static) -> DisposableEffectResult {
        DisposableEffectResult::new(dispose)
    }
}

#[derive(Default)]
struct DisposableEffectState {
    key: Cell<Option<Key>>,
    dispose: RefCell<Option<Box<dyn FnOnce()>>>,
    left: Cell<bool>,
}

impl DisposableEffectState {
    fn dispose_current(&self) {
        let dispose = self.dispose.borrow_mut().take();
        if let Some(dispose) = dispose {
            dispose();
        }
    }
}

impl RememberObserver for DisposableEffectState {
    fn on_forgotten(&self) {
        self.left.set(true);
        self.dispose_current();
    }

    fn on_abandoned(&self) {
        self.left.set(true);
    }
}

/// Scope handed to a launched effect. Its tasks stop when the effect is
/// cancelled.
#[derive(Clone)]
pub struct LaunchedEffectScope {
    context: ContextHandle,
    active: Arc<AtomicBool>,
}

impl LaunchedEffectScope {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn frame_clock(&self) -> FrameClock {
        FrameClock::new(self.context.clone())
    }

    /// Run `task` on the UI thread on the next frame, unless the effect was
    /// cancelled meanwhile.
    pub fn post_ui(&self, task: impl FnOnce() + 'static) {
        if !self.is_active() {
            return;
        }
        let active = Arc::clone(&self.active);
        self.context.enqueue_ui_task(move || {
            if active.load(Ordering::SeqCst) {
                task();
            }
        });
    }

    /// Run `work` on a background thread and hand its result to `on_ui` on
    /// the UI thread. `on_ui` is skipped once the effect is cancelled; `work`
    /// should poll its [`CancelToken`] and return early.
    pub fn launch_background<T, Work, Ui>(&self, work: Work, on_ui: Ui)
    where
        T: Send + 'static,
        Work: FnOnce(CancelToken) -> T + Send + 'static,
        Ui: FnOnce(T) + 'static,
    {
        if !self.is_active() {
            return;
        }
        let slot = Arc::new(Mutex::new(BackgroundSlot::<T> {
            value: None,
            waker: None,
        }));
        let token = CancelToken {
            active: Arc::clone(&self.active),
        };
        let sender = Arc::clone(&slot);
        std::thread::spawn(move || {
            let value = work(token.clone());
            if token.is_cancelled() {
                return;
            }
            let waker = {
                let mut slot = sender.lock().unwrap_or_else(PoisonError::into_inner);
                slot.value = Some(value);
                slot.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        let active = Arc::clone(&self.active);
        let delivery = async move {
            let value = BackgroundResult { slot }.await;
            if active.load(Ordering::SeqCst) {
                on_ui(value);
            }
        };
        // Cancelled with the effect: the launching task's handle does not
        // cover this one, so it checks the flag itself.
        let _ = self.context.spawn_ui(delivery);
    }
}

/// Cooperative cancellation flag for background work.
#[derive(Clone)]
pub struct CancelToken {
    active: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        !self.active.load(Ordering::SeqCst)
    }
}

struct BackgroundSlot<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

struct BackgroundResult<T> {
    slot: Arc<Mutex<BackgroundSlot<T>>>,
}

impl<T> Future for BackgroundResult<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[derive(Default)]
struct LaunchedEffectState {
    key: Cell<Option<Key>>,
    running: RefCell<Option<(TaskHandle, Arc<AtomicBool>)>>,
    left: Cell<bool>,
}

impl LaunchedEffectState {
    fn cancel_current(&self) {
        let running = self.running.borrow_mut().take();
        if let Some((task, active)) = running {
            active.store(false, Ordering::SeqCst);
            task.cancel();
        }
    }
}

impl RememberObserver for LaunchedEffectState {
    fn on_forgotten(&self) {
        self.left.set(true);
        self.cancel_current();
    }

    fn on_abandoned(&self) {
        self.left.set(true);
    }
}

impl Composer {
    /// Run `effect` after the pass that inserts this call or changes `keys`.
    /// The returned dispose callback runs before the next start and when the
    /// call leaves the composition.
    ///
    /// `keys` are compared through [`hash_key`], so keys that hash alike
    /// count as unchanged.
    #[track_caller]
    pub fn disposable_effect<K: Hash + ?Sized>(
        &self,
        keys: &K,
        effect: impl FnOnce(DisposableEffectScope) -> DisposableEffectResult + 'static,
    ) {
        let caller = Location::caller();
        let group = location_key(caller.file(), caller.line(), caller.column());
        self.disposable_effect_in(group, hash_key(keys), effect);
    }

    fn disposable_effect_in(
        &self,
        group: Key,
        key: Key,
        effect: impl FnOnce(DisposableEffectScope) -> DisposableEffectResult + 'static,
    ) {
        self.group(group, |composer| {
            let state = composer.remember_observer(DisposableEffectState::default);
            if state.key.get() == Some(key) {
                return;
            }
            state.key.set(Some(key));
            composer.side_effect(move || {
                if state.left.get() {
                    return;
                }
                state.dispose_current();
                let result = effect(DisposableEffectScope { _private: () });
                *state.dispose.borrow_mut() = result.dispose;
            });
        });
    }

    /// Spawn the future built by `effect` on the UI executor after the pass
    /// that inserts this call or changes `keys`. The task is cancelled when
    /// `keys` change or the call leaves the composition. Keys compare by
    /// [`hash_key`] as in [`disposable_effect`](Self::disposable_effect).
    #[track_caller]
    pub fn launched_effect<K, F, Fut>(&self, keys: &K, effect: F)
    where
        K: Hash + ?Sized,
        F: FnOnce(LaunchedEffectScope) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let caller = Location::caller();
        let group = location_key(caller.file(), caller.line(), caller.column());
        self.launched_effect_in(group, hash_key(keys), effect);
    }

    fn launched_effect_in<F, Fut>(&self, group: Key, key: Key, effect: F)
    where
        F: FnOnce(LaunchedEffectScope) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.group(group, |composer| {
            let state = composer.remember_observer(LaunchedEffectState::default);
            if state.key.get() == Some(key) {
                return;
            }
            state.key.set(Some(key));
            let context = composer.context().handle();
            composer.side_effect(move || {
                if state.left.get() {
                    return;
                }
                state.cancel_current();
                let active = Arc::new(AtomicBool::new(true));
                let scope = LaunchedEffectScope {
                    context: context.clone(),
                    active: Arc::clone(&active),
                };
                match context.spawn_ui(effect(scope)) {
                    Some(task) => *state.running.borrow_mut() = Some((task, active)),
                    None => log::debug!("launched effect dropped: scheduler context is gone"),
                }
            });
        });
    }
}

/// [`Composer::disposable_effect`] on the current composer.
#[track_caller]
pub fn disposable_effect<K: Hash + ?Sized>(
    keys: &K,
    effect: impl FnOnce(DisposableEffectScope) -> DisposableEffectResult + 'static,
) {
    let caller = Location::caller();
    let group = location_key(caller.file(), caller.line(), caller.column());
    let key = hash_key(keys);
    with_current_composer(|composer| composer.disposable_effect_in(group, key, effect));
}

/// [`Composer::launched_effect`] on the current composer.
#[track_caller]
pub fn launched_effect<K, F, Fut>(keys: &K, effect: F)
where
    K: Hash + ?Sized,
    F: FnOnce(LaunchedEffectScope) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    let caller = Location::caller();
    let group = location_key(caller.file(), caller.line(), caller.column());
    let key = hash_key(keys);
    with_current_composer(|composer| composer.launched_effect_in(group, key, effect));
}

/// [`Composer::side_effect`] on the current composer.
pub fn side_effect(effect: impl FnOnce() + 'static) {
    with_current_composer(|composer| composer.side_effect(effect));
}

/// Value remembered across passes of the current composable.
pub fn remember<T: 'static>(calc: impl FnOnce() -> T) -> crate::Owned<T> {
    with_current_composer(|composer| composer.remember(calc))
}

/// Frame clock of the composition currently composing.
pub fn frame_clock() -> FrameClock {
    with_current_composer(|composer| composer.context().frame_clock())
}

/// Invalidate the scope of the composable currently running.
pub fn invalidate_current_scope() {
    with_current_composer(|composer| composer.invalidate());
}
