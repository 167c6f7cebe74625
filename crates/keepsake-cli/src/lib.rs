pub mod commands;
pub mod error;
pub mod output;

pub use commands::{BackupCommand, CleanupCommand, EvictCommand, MemoryCommand, StatsCommand};
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, format_timestamp, parse_id, print_json, truncate_string};
