//! stack-backup
//!
//! Scheduled backup engine for a single-host container stack: dumps the
//! databases, volumes, encryption key and repository tree into one
//! timestamped archive, verifies it, and thins old archives by tier.

pub mod archive;
pub mod checksum;
pub mod collector;
pub mod config;
pub mod fs;
pub mod report;
pub mod retention;
pub mod runner;
pub mod shutdown;
pub mod targets;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
