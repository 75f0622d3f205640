//! Session management module
//!
//! Sessions own a replayable output buffer fed by a stream bridge, an input
//! route while their process is alive, and a lifecycle driven by the reaper.
//! The registry is the entry point for everything else.

mod bridge;
mod buffer;
mod reaper;
mod registry;
mod replay;
#[allow(clippy::module_inception)]
mod session;

pub use buffer::*;
pub use registry::*;
pub use replay::*;
pub use session::*;
