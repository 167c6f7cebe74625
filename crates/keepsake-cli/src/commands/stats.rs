use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use keepsake::MemoryService;

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct StatsCommand {
    #[clap(long, help = "Include the retention factors behind each threshold")]
    pub factors: bool,
}

impl StatsCommand {
    pub async fn execute(&self, service: &MemoryService, format: OutputFormat) -> CliResult<()> {
        let stats = service.get_memory_stats().await;
        let factors = service.retention_factors().await;

        match format {
            OutputFormat::Json => {
                let tiers: Vec<_> = stats
                    .tiers
                    .iter()
                    .zip(&factors)
                    .map(|(tier, factors)| {
                        serde_json::json!({
                            "tier": tier.tier,
                            "count": tier.count,
                            "capacity": tier.capacity,
                            "fill_ratio": tier.fill_ratio(),
                            "mean_score": tier.mean_score,
                            "protected": tier.protected,
                            "pending": tier.pending,
                            "threshold": factors.threshold,
                            "status": factors.status.as_str(),
                            "factors": factors,
                        })
                    })
                    .collect();
                let output = serde_json::json!({
                    "total": stats.total,
                    "dead_letters": stats.dead_letters,
                    "tiers": tiers,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Keepsake Statistics");
                println!("===================\n");

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header([
                        "Tier",
                        "Count",
                        "Capacity",
                        "Fill",
                        "Mean Score",
                        "Protected",
                        "Pending",
                        "Threshold",
                        "Status",
                    ]);

                for (tier, factors) in stats.tiers.iter().zip(&factors) {
                    table.add_row([
                        tier.tier.to_string(),
                        tier.count.to_string(),
                        tier.capacity.to_string(),
                        format!("{:.0}%", tier.fill_ratio() * 100.0),
                        format!("{:.2}", tier.mean_score),
                        tier.protected.to_string(),
                        tier.pending.to_string(),
                        format!("{:.3}", factors.threshold),
                        factors.status.as_str().to_string(),
                    ]);
                }

                println!("{table}\n");

                if self.factors {
                    let mut table = Table::new();
                    table
                        .load_preset(UTF8_FULL_CONDENSED)
                        .set_content_arrangement(ContentArrangement::Dynamic)
                        .set_header(["Tier", "Base", "Load", "Activity", "Pressure", "Retention"]);
                    for (tier, factors) in stats.tiers.iter().zip(&factors) {
                        table.add_row([
                            tier.tier.to_string(),
                            format!("{:+.3}", factors.base),
                            format!("{:+.3}", factors.load),
                            format!("{:+.3}", factors.activity),
                            format!("{:+.3}", factors.pressure),
                            format!("{:.3}", factors.retention),
                        ]);
                    }
                    println!("{table}\n");
                }

                println!("Total: {} records", stats.total);
                if stats.dead_letters > 0 {
                    println!("Quarantined rows: {}", stats.dead_letters);
                }
            }
        }

        Ok(())
    }
}
