//! The data model for recovery.
//!
//! [`change`] is the base, then [`state`] and [`progress`] are built
//! on top of that.

pub mod change;
pub mod progress;
pub mod state;

// Re-export so you can get the whole model at once.

pub use change::*;
pub use progress::*;
pub use state::*;
