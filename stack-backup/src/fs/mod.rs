//! File system helpers for in-process tree captures.

pub mod walker;
