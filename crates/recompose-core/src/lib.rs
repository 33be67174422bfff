#![doc = r"Positional memoization, snapshot state and recomposition runtime."]
#![allow(clippy::missing_const_for_thread_local)]

pub extern crate self as recompose_core;

pub mod arena;
pub mod changes;
pub mod collections;
mod composer;
pub mod composer_context;
mod composition;
mod effects;
mod error;
pub mod frame_clock;
pub mod gap_buffer;
mod local;
pub mod owned;
pub mod platform;
mod recomposer;
mod remember;
pub mod runtime;
mod scope;
pub mod slot_table;
pub mod snapshot;
pub mod snapshot_state_observer;
mod state;
#[cfg(test)]
mod test_support;

use std::hash::{Hash, Hasher};

pub use arena::{ArenaId, GenerationalArena};
pub use changes::{
    apply_changes, Applier, Change, ChangeList, Diagnostic, EditLog, MemoryApplier, Node,
    NodeUpdate, ROOT_NODE_ID,
};
pub use composer::{Composer, NodeUpdater};
pub use composer_context::{try_with_current_composer, with_current_composer};
pub use composition::{ApplyErrorHandler, Composition, LogApplyErrors};
pub use effects::{
    disposable_effect, frame_clock, invalidate_current_scope, launched_effect, remember,
    side_effect, CancelToken, DisposableEffectResult, DisposableEffectScope, LaunchedEffectScope,
};
pub use error::{ComposeError, NodeError, SnapshotError};
pub use frame_clock::{FrameCallbackRegistration, FrameClock};
pub use local::{composition_local_of, composition_local_provider, CompositionLocal, ProvidedValue};
pub use owned::Owned;
pub use platform::{Clock, NoopScheduler, RuntimeScheduler};
pub use recomposer::{CompositionId, Recomposer, RecomposerConfig, RecomposerState};
pub use remember::{RememberEvents, RememberObserver};
pub use runtime::{ContextHandle, SchedulerContext, TaskHandle, UiDispatcher};
pub use scope::{RecomposeScope, ScopeId};
pub use slot_table::{CheckpointToken, Primitive};
pub use snapshot::ConflictMode;
pub use snapshot_state_observer::SnapshotStateObserver;
pub use state::{
    derived_state_of, mutable_state_of, mutable_state_with_policy, ApplyView, DerivedState,
    MergingPolicy, MutableState, MutationPolicy, NeverEqualPolicy, ReferentialEqualityPolicy,
    StateObject, StateObjectId, StructuralEqualityPolicy,
};

pub type Key = u64;
pub type NodeId = usize;

/// Group key of a call site. Stable across runs of the same binary.
pub fn location_key(file: &str, line: u32, column: u32) -> Key {
    let mut hasher = collections::hasher::new();
    file.hash(&mut hasher);
    line.hash(&mut hasher);
    column.hash(&mut hasher);
    hasher.finish()
}

/// Object key of a value passed to [`Composer::key`] or an effect.
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> Key {
    let mut hasher = collections::hasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Run `block` in a mutable snapshot and apply it, so recomposition sees all
/// of its writes at once. Event handlers should wrap their state writes in
/// it.
pub fn run_in_mutable_snapshot<T>(block: impl FnOnce() -> T) -> Result<T, SnapshotError> {
    snapshot::with_mutable_snapshot(block)
}
