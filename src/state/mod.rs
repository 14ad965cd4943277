//! Pure state logic for the merge train engine.
//!
//! This module contains the functional core: the explicit car state machine.
//! All I/O and effects are handled elsewhere.

pub mod transitions;

// Re-export commonly used types and functions
pub use transitions::{CarEvent, TransitionError, next_state};
