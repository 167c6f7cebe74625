use clap::Parser;
use keepsake::MemoryService;

use crate::error::CliResult;
use crate::output::{OutputFormat, print_json};

#[derive(Parser)]
pub struct CleanupCommand {
    #[clap(
        long,
        default_value = "30",
        help = "Remove records neither created nor accessed in this many days"
    )]
    pub days: i64,
}

impl CleanupCommand {
    pub async fn execute(&self, service: &MemoryService, format: OutputFormat) -> CliResult<()> {
        if self.days < 0 {
            return Err("--days must not be negative".into());
        }

        let removed = service.cleanup_old_memories(self.days).await?;

        match format {
            OutputFormat::Json => print_json(&serde_json::json!({
                "removed": removed,
                "retention_days": self.days,
            }))?,
            OutputFormat::Table => {
                println!("Removed {removed} records older than {} days", self.days);
                if removed > 0 {
                    println!("Each one was backed up first; see `keepsake-cli backup list`.");
                }
            }
        }
        Ok(())
    }
}
