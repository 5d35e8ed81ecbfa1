//! On-disk persistence: undelivered message backups and window diagnostics

mod backup;
mod debug_dump;

pub use backup::*;
pub use debug_dump::*;
