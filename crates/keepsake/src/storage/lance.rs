use std::path::Path;
use std::sync::Arc;

use arrow_array::{Array, RecordBatch, RecordBatchIterator, StringArray, TimestampMicrosecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::Table;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use uuid::Uuid;

use crate::error::{KeepsakeError, Result};
use crate::memory::backup::BackupSnapshot;
use crate::memory::types::MemoryRecord;
use crate::storage::backup::BackupStore;
use crate::storage::codec::PayloadCodec;
use crate::storage::persistence::{DeadLetter, LoadedRecords, RecordPersistence, decode_record};

pub const RECORDS_TABLE: &str = "records";
pub const BACKUPS_TABLE: &str = "backups";
pub const DEAD_LETTERS_TABLE: &str = "dead_letters";

/// Keeps `IN (...)` predicates to a manageable size
const DELETE_CHUNK: usize = 500;

/// One row of the records table before it is turned into Arrow columns
#[derive(Debug, Clone)]
struct RecordRow {
    id: String,
    tier: String,
    created_at: i64,
    tags: String,
    data_type: String,
    checksum: String,
    payload: String,
}

impl RecordRow {
    fn from_record(record: &MemoryRecord, codec: &PayloadCodec) -> Result<Self> {
        let json = serde_json::to_string(record)
            .map_err(|e| KeepsakeError::Serialization(format!("Failed to encode record: {e}")))?;
        let payload = codec.encode(&json)?;
        Ok(Self {
            id: record.id.to_string(),
            tier: record.tier.to_string(),
            created_at: record.created_at.timestamp_micros(),
            tags: record
                .metadata
                .tags
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
            data_type: record.metadata.data_type.clone(),
            checksum: record.checksum.clone(),
            payload,
        })
    }
}

/// LanceDB-backed persistence for records, backups and quarantined rows.
///
/// Record and backup payloads pass through a `PayloadCodec`; dead letters keep
/// the stored text as found.
pub struct LanceStore {
    connection: Connection,
    records_table: Table,
    backups_table: Table,
    dead_letters_table: Table,
    codec: PayloadCodec,
}

impl LanceStore {
    /// Connect to the database at `path`, creating missing tables
    pub async fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            KeepsakeError::Storage(format!(
                "Failed to create data directory {}: {}",
                path.display(),
                e
            ))
        })?;

        let uri = path
            .to_str()
            .ok_or_else(|| KeepsakeError::Storage("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| KeepsakeError::Storage(format!("Failed to connect to LanceDB: {e}")))?;

        let records_table =
            Self::open_or_create(&connection, RECORDS_TABLE, Self::records_schema()).await?;
        let backups_table =
            Self::open_or_create(&connection, BACKUPS_TABLE, Self::backups_schema()).await?;
        let dead_letters_table =
            Self::open_or_create(&connection, DEAD_LETTERS_TABLE, Self::dead_letters_schema())
                .await?;

        Ok(Self {
            connection,
            records_table,
            backups_table,
            dead_letters_table,
            codec: PayloadCodec::default(),
        })
    }

    /// Encode payloads with `codec` from now on
    pub fn with_codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        table_exists(&self.connection, name).await
    }

    async fn open_or_create(
        connection: &Connection,
        name: &str,
        schema: Arc<Schema>,
    ) -> Result<Table> {
        if table_exists(connection, name).await? {
            tracing::debug!("Opening existing {} table", name);
            return connection
                .open_table(name)
                .execute()
                .await
                .map_err(|e| KeepsakeError::Storage(format!("Failed to open {name} table: {e}")));
        }

        tracing::info!("Creating {} table", name);
        create_empty_table(connection, name, schema).await
    }

    fn records_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("tier", DataType::Utf8, false),
            Field::new(
                "created_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new("tags", DataType::Utf8, false),
            Field::new("data_type", DataType::Utf8, false),
            Field::new("checksum", DataType::Utf8, false),
            Field::new("payload", DataType::Utf8, false),
        ]))
    }

    fn backups_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("backup_id", DataType::Utf8, false),
            Field::new("original_id", DataType::Utf8, false),
            Field::new(
                "created_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
            Field::new("reason", DataType::Utf8, false),
            Field::new("payload", DataType::Utf8, false),
        ]))
    }

    fn dead_letters_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("tier", DataType::Utf8, false),
            Field::new("payload", DataType::Utf8, false),
            Field::new("error", DataType::Utf8, false),
            Field::new(
                "quarantined_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
        ]))
    }

    fn rows_to_batch(rows: &[RecordRow]) -> Result<RecordBatch> {
        let column = |f: fn(&RecordRow) -> &str| -> Arc<dyn Array> {
            Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<&str>>()))
        };
        let created_at: Vec<i64> = rows.iter().map(|r| r.created_at).collect();

        RecordBatch::try_new(
            Self::records_schema(),
            vec![
                column(|r| r.id.as_str()),
                column(|r| r.tier.as_str()),
                Arc::new(TimestampMicrosecondArray::from(created_at).with_timezone("UTC")),
                column(|r| r.tags.as_str()),
                column(|r| r.data_type.as_str()),
                column(|r| r.checksum.as_str()),
                column(|r| r.payload.as_str()),
            ],
        )
        .map_err(|e| KeepsakeError::Storage(format!("Failed to create RecordBatch: {e}")))
    }

    fn backups_to_batch(&self, snapshots: &[BackupSnapshot]) -> Result<RecordBatch> {
        let backup_ids: Vec<String> = snapshots.iter().map(|s| s.backup_id.to_string()).collect();
        let original_ids: Vec<String> =
            snapshots.iter().map(|s| s.original_id.to_string()).collect();
        let created_at: Vec<i64> = snapshots
            .iter()
            .map(|s| s.created_at.timestamp_micros())
            .collect();
        let reasons: Vec<&str> = snapshots.iter().map(|s| s.reason.as_str()).collect();
        let payloads = snapshots
            .iter()
            .map(|s| {
                let json = serde_json::to_string(s).map_err(|e| {
                    KeepsakeError::Serialization(format!("Failed to encode backup: {e}"))
                })?;
                self.codec.encode(&json)
            })
            .collect::<Result<Vec<String>>>()?;

        RecordBatch::try_new(
            Self::backups_schema(),
            vec![
                Arc::new(StringArray::from(backup_ids)),
                Arc::new(StringArray::from(original_ids)),
                Arc::new(TimestampMicrosecondArray::from(created_at).with_timezone("UTC")),
                Arc::new(StringArray::from(reasons)),
                Arc::new(StringArray::from(payloads)),
            ],
        )
        .map_err(|e| KeepsakeError::Storage(format!("Failed to create RecordBatch: {e}")))
    }

    fn dead_letters_to_batch(letters: &[DeadLetter]) -> Result<RecordBatch> {
        let ids: Vec<&str> = letters.iter().map(|l| l.id.as_str()).collect();
        let tiers: Vec<&str> = letters.iter().map(|l| l.tier.as_str()).collect();
        let payloads: Vec<&str> = letters.iter().map(|l| l.payload.as_str()).collect();
        let errors: Vec<&str> = letters.iter().map(|l| l.error.as_str()).collect();
        let quarantined_at: Vec<i64> = letters
            .iter()
            .map(|l| l.quarantined_at.timestamp_micros())
            .collect();

        RecordBatch::try_new(
            Self::dead_letters_schema(),
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(tiers)),
                Arc::new(StringArray::from(payloads)),
                Arc::new(StringArray::from(errors)),
                Arc::new(TimestampMicrosecondArray::from(quarantined_at).with_timezone("UTC")),
            ],
        )
        .map_err(|e| KeepsakeError::Storage(format!("Failed to create RecordBatch: {e}")))
    }

    async fn append(table: &Table, batch: RecordBatch, what: &str) -> Result<()> {
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| KeepsakeError::Storage(format!("Failed to insert {what}: {e}")))?;
        Ok(())
    }

    async fn delete_ids(table: &Table, column: &str, ids: &[String]) -> Result<()> {
        for chunk in ids.chunks(DELETE_CHUNK) {
            let predicate = format!("{column} IN ({})", in_list(chunk));
            table
                .delete(&predicate)
                .await
                .map_err(|e| KeepsakeError::Storage(format!("Failed to delete rows: {e}")))?;
        }
        Ok(())
    }

    async fn collect(table: &Table, predicate: Option<String>) -> Result<Vec<RecordBatch>> {
        let mut query = table.query();
        if let Some(predicate) = predicate {
            query = query.only_if(predicate);
        }
        let stream = query
            .execute()
            .await
            .map_err(|e| KeepsakeError::Storage(format!("Failed to query table: {e}")))?;

        stream
            .try_collect()
            .await
            .map_err(|e| KeepsakeError::Storage(format!("Failed to collect query results: {e}")))
    }

    fn decode_backups(&self, batches: &[RecordBatch]) -> Result<Vec<BackupSnapshot>> {
        let mut snapshots = Vec::new();
        for batch in batches {
            let backup_ids = string_column(batch, "backup_id")?;
            let payloads = string_column(batch, "payload")?;
            for row in 0..batch.num_rows() {
                let json = match self.codec.decode(backup_ids.value(row), payloads.value(row)) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("Skipping unreadable backup row: {}", e);
                        continue;
                    }
                };
                match serde_json::from_str::<BackupSnapshot>(&json) {
                    Ok(snapshot) => snapshots.push(snapshot),
                    Err(e) => tracing::warn!("Skipping unreadable backup row: {}", e),
                }
            }
        }
        Ok(snapshots)
    }

    /// Write a raw row, bypassing encoding; lets tests plant corrupt data
    #[cfg(test)]
    async fn insert_raw_record(&self, id: &str, tier: &str, checksum: &str, payload: &str) -> Result<()> {
        let row = RecordRow {
            id: id.to_string(),
            tier: tier.to_string(),
            created_at: Utc::now().timestamp_micros(),
            tags: String::new(),
            data_type: String::new(),
            checksum: checksum.to_string(),
            payload: payload.to_string(),
        };
        Self::append(&self.records_table, Self::rows_to_batch(&[row])?, "record").await
    }
}

#[async_trait]
impl RecordPersistence for LanceStore {
    async fn load_records(&self) -> Result<LoadedRecords> {
        let batches = Self::collect(&self.records_table, None).await?;
        let mut loaded = LoadedRecords::default();

        for batch in &batches {
            let ids = string_column(batch, "id")?;
            let tiers = string_column(batch, "tier")?;
            let checksums = string_column(batch, "checksum")?;
            let payloads = string_column(batch, "payload")?;

            for row in 0..batch.num_rows() {
                let id = ids.value(row);
                let payload = payloads.value(row);
                let decoded = self
                    .codec
                    .decode(id, payload)
                    .and_then(|json| decode_record(id, &json, checksums.value(row)));
                match decoded {
                    Ok(record) => loaded.records.push(record),
                    Err(e) => loaded
                        .corrupt
                        .push(DeadLetter::new(id, tiers.value(row), payload, &e)),
                }
            }
        }

        Ok(loaded)
    }

    async fn upsert_records(&self, records: &[MemoryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let rows = records
            .iter()
            .map(|record| RecordRow::from_record(record, &self.codec))
            .collect::<Result<Vec<_>>>()?;

        // Replace and insert in one commit so a crash cannot drop existing rows
        let batch = Self::rows_to_batch(&rows)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        let mut merge = self.records_table.merge_insert(&["id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(batches))
            .await
            .map_err(|e| KeepsakeError::Storage(format!("Failed to upsert records: {e}")))?;
        Ok(())
    }

    async fn delete_records(&self, ids: &[Uuid]) -> Result<()> {
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        Self::delete_ids(&self.records_table, "id", &ids).await
    }

    async fn quarantine(&self, letters: &[DeadLetter]) -> Result<()> {
        if letters.is_empty() {
            return Ok(());
        }
        Self::append(
            &self.dead_letters_table,
            Self::dead_letters_to_batch(letters)?,
            "dead letters",
        )
        .await?;

        let ids: Vec<String> = letters.iter().map(|l| l.id.clone()).collect();
        Self::delete_ids(&self.records_table, "id", &ids).await
    }

    async fn dead_letter_count(&self) -> Result<usize> {
        self.dead_letters_table
            .count_rows(None)
            .await
            .map_err(|e| KeepsakeError::Storage(format!("Failed to count dead letters: {e}")))
    }
}

#[async_trait]
impl BackupStore for LanceStore {
    async fn write_backup(&self, snapshot: &BackupSnapshot) -> Result<()> {
        let batch = self.backups_to_batch(std::slice::from_ref(snapshot))?;
        Self::append(&self.backups_table, batch, "backup").await
    }

    async fn read_backup(&self, backup_id: Uuid) -> Result<Option<BackupSnapshot>> {
        let batches = Self::collect(
            &self.backups_table,
            Some(format!("backup_id = {}", sql_string(&backup_id.to_string()))),
        )
        .await?;
        Ok(self.decode_backups(&batches)?.into_iter().next())
    }

    async fn list_backups(&self) -> Result<Vec<BackupSnapshot>> {
        let batches = Self::collect(&self.backups_table, None).await?;
        let mut snapshots = self.decode_backups(&batches)?;
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    async fn remove_backup(&self, backup_id: Uuid) -> Result<bool> {
        let predicate = format!("backup_id = {}", sql_string(&backup_id.to_string()));
        let existing = self
            .backups_table
            .count_rows(Some(predicate.clone()))
            .await
            .map_err(|e| KeepsakeError::Storage(format!("Failed to count backups: {e}")))?;
        if existing == 0 {
            return Ok(false);
        }
        self.backups_table
            .delete(&predicate)
            .await
            .map_err(|e| KeepsakeError::Storage(format!("Failed to delete backup: {e}")))?;
        Ok(true)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<String> = self
            .list_backups()
            .await?
            .into_iter()
            .filter(|s| s.is_older_than(cutoff))
            .map(|s| s.backup_id.to_string())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        Self::delete_ids(&self.backups_table, "backup_id", &expired).await?;
        Ok(expired.len())
    }
}

pub(crate) async fn table_exists(connection: &Connection, name: &str) -> Result<bool> {
    let names = connection
        .table_names()
        .execute()
        .await
        .map_err(|e| KeepsakeError::Storage(format!("Failed to list tables: {e}")))?;

    Ok(names.contains(&name.to_string()))
}

pub(crate) async fn create_empty_table(
    connection: &Connection,
    name: &str,
    schema: Arc<Schema>,
) -> Result<Table> {
    let batch = RecordBatch::new_empty(schema.clone());
    let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

    connection
        .create_table(name, Box::new(batches))
        .execute()
        .await
        .map_err(|e| KeepsakeError::Storage(format!("Failed to create {name} table: {e}")))
}

/// Look up a Utf8 column by name
pub(crate) fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| KeepsakeError::Storage(format!("Failed to get {name} column")))
}

/// Quote a string literal for a LanceDB predicate
pub(crate) fn sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn in_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| sql_string(v))
        .collect::<Vec<_>>()
        .join(", ")
}
