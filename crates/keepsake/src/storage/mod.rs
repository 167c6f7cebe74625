pub mod backup;
pub mod codec;
pub mod filter;
pub mod lance;
pub mod persistence;
pub mod queue;
pub mod tiers;

pub use backup::{BackupManager, BackupStore, InMemoryBackupStore};
pub use codec::PayloadCodec;
pub use filter::RecordFilter;
pub use lance::LanceStore;
pub use persistence::{DeadLetter, LoadedRecords, RecordPersistence};
pub use queue::EvictionPriorityQueue;
pub use tiers::{ConditionalRemoval, RecordCursor, StoreStats, TierStats, TieredMemoryStore};
