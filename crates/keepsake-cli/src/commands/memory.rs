use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use keepsake::MemoryService;
use keepsake::memory::{MemoryKind, MemoryRecord, RecordMetadata, TierName};
use keepsake::storage::RecordFilter;

use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, parse_id, print_json, truncate_string};

#[derive(Parser)]
pub struct MemoryCommand {
    #[clap(subcommand)]
    pub command: MemorySubcommand,
}

#[derive(Subcommand)]
pub enum MemorySubcommand {
    #[clap(about = "List records, newest first")]
    List(ListArgs),

    #[clap(about = "Show record details")]
    Show(ShowArgs),

    #[clap(about = "Search records by relevance")]
    Search(SearchArgs),

    #[clap(about = "Back up and delete a record")]
    Delete(IdArgs),

    #[clap(about = "Exempt a record from eviction")]
    Protect(IdArgs),

    #[clap(about = "Make a record evictable again")]
    Unprotect(IdArgs),

    #[clap(about = "Manually add a record")]
    Add(AddArgs),
}

#[derive(Parser)]
pub struct ListArgs {
    #[clap(
        long,
        short,
        default_value = "20",
        help = "Maximum number of records to display"
    )]
    pub limit: usize,

    #[clap(long, short, help = "Only records in this tier")]
    pub tier: Option<String>,

    #[clap(
        long,
        short,
        help = "Filter by kind (episodic, semantic, procedural, dialogue)"
    )]
    pub kind: Option<String>,

    #[clap(long, help = "Only records carrying this tag")]
    pub tag: Option<String>,

    #[clap(long, help = "Only records with this data type")]
    pub data_type: Option<String>,

    #[clap(long, help = "Only records created in the last N days")]
    pub days: Option<i64>,

    #[clap(long, help = "Only records scoring at least this much")]
    pub min_score: Option<f32>,
}

#[derive(Parser)]
pub struct ShowArgs {
    #[clap(help = "Record ID (UUID format)")]
    pub id: String,
}

#[derive(Parser)]
pub struct IdArgs {
    #[clap(help = "Record ID (UUID format)")]
    pub id: String,
}

#[derive(Parser)]
pub struct SearchArgs {
    #[clap(help = "Query text")]
    pub query: String,

    #[clap(long, short, default_value = "5", help = "Maximum number of results")]
    pub limit: usize,

    #[clap(long, short, help = "Only search this tier")]
    pub tier: Option<String>,
}

#[derive(Parser)]
pub struct AddArgs {
    #[clap(help = "Record content")]
    pub text: String,

    #[clap(
        long,
        default_value = "semantic",
        help = "Kind (episodic, semantic, procedural, dialogue)"
    )]
    pub kind: String,

    #[clap(long, help = "Tag to attach (repeatable)")]
    pub tag: Vec<String>,

    #[clap(long, help = "Data type label")]
    pub data_type: Option<String>,

    #[clap(long, help = "Store in this tier instead of classifying")]
    pub tier: Option<String>,

    #[clap(long, help = "Importance in [0, 1]")]
    pub importance: Option<f32>,

    #[clap(long, help = "Exempt from eviction")]
    pub protected: bool,
}

impl MemoryCommand {
    pub async fn execute(&self, service: &MemoryService, format: OutputFormat) -> CliResult<()> {
        match &self.command {
            MemorySubcommand::List(args) => Self::list(service, args, format).await,
            MemorySubcommand::Show(args) => Self::show(service, args, format).await,
            MemorySubcommand::Search(args) => Self::search(service, args, format).await,
            MemorySubcommand::Delete(args) => Self::delete(service, args, format).await,
            MemorySubcommand::Protect(args) => Self::protect(service, args, true, format).await,
            MemorySubcommand::Unprotect(args) => Self::protect(service, args, false, format).await,
            MemorySubcommand::Add(args) => Self::add(service, args, format).await,
        }
    }

    async fn list(service: &MemoryService, args: &ListArgs, format: OutputFormat) -> CliResult<()> {
        let mut filter = RecordFilter::new();
        if let Some(tier) = &args.tier {
            filter = filter.in_tier(known_tier(service, tier)?);
        }
        if let Some(kind) = &args.kind {
            filter = filter.with_kinds(vec![parse_kind(kind)?]);
        }
        if let Some(tag) = &args.tag {
            filter = filter.with_tag(tag.clone());
        }
        if let Some(data_type) = &args.data_type {
            filter = filter.with_data_type(data_type.clone());
        }
        if let Some(days) = args.days {
            filter = filter.since(Utc::now() - Duration::days(days));
        }
        if let Some(min_score) = args.min_score {
            filter = filter.with_min_score(min_score);
        }

        let mut records = service.query(&filter).await;
        let total = records.len();
        records.truncate(args.limit);

        match format {
            OutputFormat::Json => print_json(&records)?,
            OutputFormat::Table => {
                if records.is_empty() {
                    println!("No records found.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["ID", "Content", "Kind", "Score", "Tier", "Accesses", "Created"]);

                for record in &records {
                    table.add_row([
                        truncate_string(&record.id.to_string(), 8),
                        truncate_string(&record.content, 50),
                        record.metadata.kind.as_str().to_string(),
                        score_label(record),
                        record.tier.to_string(),
                        record.access_count.to_string(),
                        format_timestamp(&record.created_at),
                    ]);
                }

                println!("{table}");
                println!("\nShowing {} of {} records", records.len(), total);
            }
        }

        Ok(())
    }

    async fn show(service: &MemoryService, args: &ShowArgs, format: OutputFormat) -> CliResult<()> {
        let id = parse_id(&args.id)?;
        let record = service
            .get(id)
            .await
            .ok_or_else(|| format!("Record not found: {}", args.id))?;

        match format {
            OutputFormat::Json => print_json(&record)?,
            OutputFormat::Table => {
                println!("Record {}", record.id);
                println!("{}", "=".repeat(44));
                println!("Tier:          {}", record.tier);
                println!("Kind:          {}", record.metadata.kind.as_str());
                if !record.metadata.data_type.is_empty() {
                    println!("Data type:     {}", record.metadata.data_type);
                }
                if !record.metadata.tags.is_empty() {
                    let tags: Vec<&str> = record.metadata.tags.iter().map(String::as_str).collect();
                    println!("Tags:          {}", tags.join(", "));
                }
                println!("Score:         {}", score_label(&record));
                if let Some(breakdown) = &record.score_breakdown {
                    println!(
                        "  type {:.2} | access {:.2} | context {:.2} | relational {:.2} ({})",
                        breakdown.type_weight,
                        breakdown.access_frequency,
                        breakdown.context_relevance,
                        breakdown.relational_weight,
                        breakdown.profile.as_str()
                    );
                }
                println!("Protected:     {}", record.is_protected());
                if let Some(pending) = &record.pending_confirmation {
                    println!(
                        "Pending:       deletion awaiting confirmation until {}",
                        format_timestamp(&pending.deadline)
                    );
                }
                println!("Accesses:      {}", record.access_count);
                println!("Created:       {}", format_timestamp(&record.created_at));
                println!("Last access:   {}", format_timestamp(&record.last_accessed_at));
                if !record.metadata.related_ids.is_empty() {
                    println!("Related:       {}", record.metadata.related_ids.len());
                }
                println!("Checksum ok:   {}", record.verify_checksum());
                println!("\n{}", record.content);
            }
        }

        Ok(())
    }

    async fn search(
        service: &MemoryService,
        args: &SearchArgs,
        format: OutputFormat,
    ) -> CliResult<()> {
        let mut filter = RecordFilter::new();
        if let Some(tier) = &args.tier {
            filter = filter.in_tier(known_tier(service, tier)?);
        }

        let results = service
            .retrieve_relevant_memories(&args.query, args.limit, &filter)
            .await?;

        match format {
            OutputFormat::Json => {
                let output: Vec<_> = results
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "id": r.record.id.to_string(),
                            "content": &r.record.content,
                            "tier": r.record.tier,
                            "keyword_score": r.keyword_score,
                            "similarity": r.similarity_score,
                            "relevance": r.relevance,
                            "recency": r.recency,
                            "score": r.final_score,
                        })
                    })
                    .collect();
                print_json(&output)?;
            }
            OutputFormat::Table => {
                if results.is_empty() {
                    println!("No relevant records found.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["ID", "Content", "Tier", "Keyword", "Vector", "Score"]);

                for result in &results {
                    table.add_row([
                        truncate_string(&result.record.id.to_string(), 8),
                        truncate_string(&result.record.content, 50),
                        result.record.tier.to_string(),
                        format!("{:.2}", result.keyword_score),
                        result
                            .similarity_score
                            .map(|s| format!("{s:.2}"))
                            .unwrap_or_else(|| "-".to_string()),
                        format!("{:.3}", result.final_score),
                    ]);
                }
                println!("{table}");
            }
        }

        Ok(())
    }

    async fn delete(service: &MemoryService, args: &IdArgs, format: OutputFormat) -> CliResult<()> {
        let id = parse_id(&args.id)?;
        let backup_id = service.delete(id).await?;

        match format {
            OutputFormat::Json => print_json(&serde_json::json!({
                "deleted": id.to_string(),
                "backup_id": backup_id.to_string(),
            }))?,
            OutputFormat::Table => {
                println!("Deleted record {id}");
                println!("Restore with: keepsake-cli backup restore {backup_id}");
            }
        }
        Ok(())
    }

    async fn protect(
        service: &MemoryService,
        args: &IdArgs,
        protected: bool,
        format: OutputFormat,
    ) -> CliResult<()> {
        let id = parse_id(&args.id)?;
        service.set_protected(id, protected).await?;

        match format {
            OutputFormat::Json => print_json(&serde_json::json!({
                "id": id.to_string(),
                "protected": protected,
            }))?,
            OutputFormat::Table => {
                let state = if protected { "protected" } else { "unprotected" };
                println!("Record {id} is now {state}");
            }
        }
        Ok(())
    }

    async fn add(service: &MemoryService, args: &AddArgs, format: OutputFormat) -> CliResult<()> {
        let mut metadata = RecordMetadata::new(parse_kind(&args.kind)?);
        for tag in &args.tag {
            metadata = metadata.with_tag(tag.clone());
        }
        if let Some(data_type) = &args.data_type {
            metadata = metadata.with_data_type(data_type.clone());
        }
        if let Some(tier) = &args.tier {
            metadata = metadata.with_tier_hint(known_tier(service, tier)?);
        }
        if let Some(importance) = args.importance {
            metadata = metadata.with_importance(importance);
        }
        if args.protected {
            metadata = metadata.protected();
        }

        let id = service.store_experience(args.text.clone(), metadata).await?;
        let tier = service
            .get(id)
            .await
            .map(|r| r.tier.to_string())
            .unwrap_or_default();

        match format {
            OutputFormat::Json => print_json(&serde_json::json!({
                "id": id.to_string(),
                "tier": tier,
            }))?,
            OutputFormat::Table => println!("Stored record {id} in tier '{tier}'"),
        }
        Ok(())
    }
}

fn parse_kind(value: &str) -> CliResult<MemoryKind> {
    MemoryKind::parse(value).ok_or_else(|| {
        format!("Unknown kind: {value}. Use episodic, semantic, procedural, or dialogue.").into()
    })
}

fn known_tier(service: &MemoryService, name: &str) -> CliResult<TierName> {
    let tier = TierName::new(name);
    if service.config().has_tier(&tier) {
        Ok(tier)
    } else {
        let known: Vec<String> = service
            .config()
            .tiers
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        Err(format!("Unknown tier '{name}' (configured: {})", known.join(", ")).into())
    }
}

fn score_label(record: &MemoryRecord) -> String {
    match record.scored_at {
        Some(_) => format!("{:.2}", record.value_score),
        None => "unscored".to_string(),
    }
}
