//! Process launching module
//!
//! Resolves executables on an augmented search path and spawns them under a
//! native PTY or with plain pipes. Uses portable-pty for the terminal backend.

mod launcher;
mod resolve;
mod signal;

pub use launcher::*;
pub use resolve::*;
pub use signal::*;
