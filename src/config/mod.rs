//! Configuration module
//!
//! Handles loading bridge settings and tool presets.

mod settings;

pub use settings::*;
