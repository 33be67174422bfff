//! Testing utilities and harness for Recompose.

mod applier;
mod rule;

pub use applier::{container, leaf, AppliedOp, RecordingApplier, TestNode};
pub use rule::{run_test_composition, ComposeTestRule, TestScheduler};

pub mod prelude {
    pub use crate::applier::{container, leaf, AppliedOp, RecordingApplier, TestNode};
    pub use crate::rule::{run_test_composition, ComposeTestRule, TestScheduler};
}

#[cfg(test)]
#[path = "tests/testing_tests.rs"]
mod tests;
