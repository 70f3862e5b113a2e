//! Text helpers shared by storage validation and CLI output.
//!
//! - **Labels**: control-character stripping and validation for source and tag names
//! - **Width**: Unicode-aware truncation for terminal tables

mod text;

pub use text::{sanitize_label, strip_control_chars, truncate_to_width};
