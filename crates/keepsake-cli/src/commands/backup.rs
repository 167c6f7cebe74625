use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use keepsake::MemoryService;

use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, parse_id, print_json, truncate_string};

#[derive(Parser)]
pub struct BackupCommand {
    #[clap(subcommand)]
    pub command: BackupSubcommand,
}

#[derive(Subcommand)]
pub enum BackupSubcommand {
    #[clap(about = "List backups, newest first")]
    List {
        #[clap(long, short, default_value = "20", help = "Maximum number of backups")]
        limit: usize,
    },

    #[clap(about = "Restore a backed-up record")]
    Restore {
        #[clap(help = "Backup ID (UUID format)")]
        id: String,
    },

    #[clap(about = "Drop backups older than the configured TTL")]
    Purge,
}

impl BackupCommand {
    pub async fn execute(&self, service: &MemoryService, format: OutputFormat) -> CliResult<()> {
        match &self.command {
            BackupSubcommand::List { limit } => Self::list(service, *limit, format).await,
            BackupSubcommand::Restore { id } => Self::restore(service, id, format).await,
            BackupSubcommand::Purge => Self::purge(service, format).await,
        }
    }

    async fn list(service: &MemoryService, limit: usize, format: OutputFormat) -> CliResult<()> {
        let mut backups = service.list_backups().await?;
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = backups.len();
        backups.truncate(limit);

        match format {
            OutputFormat::Json => print_json(&backups)?,
            OutputFormat::Table => {
                if backups.is_empty() {
                    println!("No backups found.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Backup", "Record", "Reason", "Tier", "Content", "Taken"]);

                for backup in &backups {
                    table.add_row([
                        backup.backup_id.to_string(),
                        truncate_string(&backup.original_id.to_string(), 8),
                        backup.reason.as_str().to_string(),
                        backup.record.tier.to_string(),
                        truncate_string(&backup.record.content, 40),
                        format_timestamp(&backup.created_at),
                    ]);
                }

                println!("{table}");
                println!("\nShowing {} of {} backups", backups.len(), total);
            }
        }

        Ok(())
    }

    async fn restore(service: &MemoryService, id: &str, format: OutputFormat) -> CliResult<()> {
        let backup_id = parse_id(id)?;
        let record_id = service.restore_backup(backup_id).await?;

        match format {
            OutputFormat::Json => print_json(&serde_json::json!({
                "backup_id": backup_id.to_string(),
                "record_id": record_id.to_string(),
            }))?,
            OutputFormat::Table => println!("Restored record {record_id} from backup {backup_id}"),
        }
        Ok(())
    }

    async fn purge(service: &MemoryService, format: OutputFormat) -> CliResult<()> {
        let purged = service.purge_backups().await?;

        match format {
            OutputFormat::Json => print_json(&serde_json::json!({ "purged": purged }))?,
            OutputFormat::Table => println!(
                "Purged {purged} backups older than {} days",
                service.config().backup.ttl_days
            ),
        }
        Ok(())
    }
}
