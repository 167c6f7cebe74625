pub mod backup;
pub mod cleanup;
pub mod evict;
pub mod memory;
pub mod stats;

pub use backup::BackupCommand;
pub use cleanup::CleanupCommand;
pub use evict::EvictCommand;
pub use memory::MemoryCommand;
pub use stats::StatsCommand;
