use std::fmt;

use crate::state::StateObjectId;
use crate::NodeId;

/// Failure reported by an [`Applier`](crate::Applier) while applying a change list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    Missing { id: NodeId },
    TypeMismatch { id: NodeId, expected: &'static str },
    IndexOutOfBounds { index: usize, len: usize },
    NoCurrentParent,
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Missing { id } => write!(f, "node {id} missing"),
            NodeError::TypeMismatch { id, expected } => {
                write!(f, "node {id} type mismatch; expected {expected}")
            }
            NodeError::IndexOutOfBounds { index, len } => {
                write!(f, "child index {index} out of bounds for {len} children")
            }
            NodeError::NoCurrentParent => f.write_str("applier has no current parent node"),
        }
    }
}

impl std::error::Error for NodeError {}

/// Failure reported by the snapshot system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// Another snapshot committed a conflicting write and the snapshot runs in
    /// strict mode. The caller may retry in a fresh snapshot.
    Conflict { objects: Vec<StateObjectId> },
    /// The snapshot was disposed before the operation.
    Disposed,
    /// The snapshot was already applied.
    AlreadyApplied,
    /// A write was attempted inside a read-only snapshot.
    ReadOnly,
    /// A nested snapshot was applied after its parent closed.
    ParentClosed,
}

impl SnapshotError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SnapshotError::Conflict { .. })
    }
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Conflict { objects } => {
                write!(f, "snapshot apply conflicted on {} state object(s)", objects.len())
            }
            SnapshotError::Disposed => f.write_str("snapshot has been disposed"),
            SnapshotError::AlreadyApplied => f.write_str("snapshot has already been applied"),
            SnapshotError::ReadOnly => f.write_str("cannot write state in a read-only snapshot"),
            SnapshotError::ParentClosed => f.write_str("parent snapshot is no longer active"),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Errors surfaced by composition and recomposer entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeError {
    /// A composable body panicked. The table was closed well formed and the
    /// failing scope will be re-inserted on its next run.
    ComposablePanicked { message: String },
    /// A checkpoint token no longer matches the composer it is resumed on.
    SuspensionMismatch { reason: String },
    /// The applier rejected a change.
    Apply(NodeError),
    /// The composition was disposed.
    Disposed,
    /// The recomposer was cancelled.
    Cancelled,
    Snapshot(SnapshotError),
}

impl fmt::Display for ComposeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComposeError::ComposablePanicked { message } => {
                write!(f, "composable panicked: {message}")
            }
            ComposeError::SuspensionMismatch { reason } => {
                write!(f, "composer resumed at a mismatched group: {reason}")
            }
            ComposeError::Apply(err) => write!(f, "applying changes failed: {err}"),
            ComposeError::Disposed => f.write_str("composition has been disposed"),
            ComposeError::Cancelled => f.write_str("recomposer has been cancelled"),
            ComposeError::Snapshot(err) => write!(f, "snapshot error: {err}"),
        }
    }
}

impl std::error::Error for ComposeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ComposeError::Apply(err) => Some(err),
            ComposeError::Snapshot(err) => Some(err),
            _ => None,
        }
    }
}

impl From<NodeError> for ComposeError {
    fn from(err: NodeError) -> Self {
        ComposeError::Apply(err)
    }
}

impl From<SnapshotError> for ComposeError {
    fn from(err: SnapshotError) -> Self {
        ComposeError::Snapshot(err)
    }
}
