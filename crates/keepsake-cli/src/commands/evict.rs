use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use keepsake::MemoryService;
use keepsake::eviction::{DeferredReason, EvictionOutcome, KeptReason};

use crate::error::CliResult;
use crate::output::{OutputFormat, print_json, truncate_string};

#[derive(Parser)]
pub struct EvictCommand {
    #[clap(long, help = "List every candidate, not just the summary")]
    pub verbose: bool,
}

impl EvictCommand {
    pub async fn execute(&self, service: &MemoryService, format: OutputFormat) -> CliResult<()> {
        let report = service.run_eviction_cycle().await;

        if matches!(format, OutputFormat::Json) {
            print_json(&report)?;
            return Ok(());
        }

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(["Tier", "Before", "After", "Capacity", "Threshold", "Status"]);
        for tier in &report.tiers {
            table.add_row([
                tier.tier.to_string(),
                tier.count_before.to_string(),
                tier.count_after.to_string(),
                tier.capacity.to_string(),
                format!("{:.3}", tier.factors.threshold),
                tier.factors.status.as_str().to_string(),
            ]);
        }
        println!("Eviction cycle #{}", report.cycle);
        println!("{table}");

        println!(
            "\nRescored {}, deleted {}, kept {}, deferred {}",
            report.rescored,
            report.deleted(),
            report.kept(),
            report.deferred()
        );
        println!(
            "Purged {} expired backups, flushed {} rows",
            report.backups_purged, report.rows_flushed
        );

        if self.verbose && !report.candidates.is_empty() {
            let mut candidates = Table::new();
            candidates
                .load_preset(UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(["Record", "Tier", "Score", "Forced", "Outcome"]);
            for candidate in &report.candidates {
                candidates.add_row([
                    truncate_string(&candidate.record_id.to_string(), 8),
                    candidate.tier.to_string(),
                    format!("{:.3}", candidate.score),
                    candidate.forced.to_string(),
                    describe(&candidate.outcome),
                ]);
            }
            println!("\n{candidates}");
        }

        Ok(())
    }
}

fn describe(outcome: &EvictionOutcome) -> String {
    match outcome {
        EvictionOutcome::Deleted { backup_id } => format!("deleted (backup {backup_id})"),
        EvictionOutcome::Kept { reason } => {
            let reason = match reason {
                KeptReason::Denied => "denied",
                KeptReason::Reaccessed => "reaccessed",
                KeptReason::Protected => "protected",
                KeptReason::Gone => "already gone",
            };
            format!("kept ({reason})")
        }
        EvictionOutcome::Deferred { reason } => {
            let reason = match reason {
                DeferredReason::ConfirmationPending => "awaiting confirmation",
                DeferredReason::BackupFailed => "backup failed",
            };
            format!("deferred ({reason})")
        }
    }
}
