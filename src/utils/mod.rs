//! Utility helpers: generational arenas and frame timing.

pub mod allocator;
pub mod logging;

pub use allocator::{Arena, GenerationalId};
pub use logging::{warn_if_frame_budget_exceeded, ScopedTimer};
