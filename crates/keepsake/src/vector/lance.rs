use std::path::Path;
use std::sync::Arc;

use arrow_array::types::Float32Type;
use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use uuid::Uuid;

use crate::error::{KeepsakeError, Result};
use crate::storage::lance::{create_empty_table, sql_string, string_column, table_exists};
use crate::vector::{VectorIndex, VectorMatch};

pub const VECTORS_TABLE: &str = "vectors";

/// Vector index stored next to the records in the same LanceDB directory
pub struct LanceVectorIndex {
    table: Table,
    dimension: usize,
}

impl LanceVectorIndex {
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| KeepsakeError::Storage("Invalid path encoding".to_string()))?;
        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| KeepsakeError::Storage(format!("Failed to connect to LanceDB: {e}")))?;
        Self::with_connection(&connection, dimension).await
    }

    /// Open or create the vectors table on an existing connection
    pub async fn with_connection(connection: &Connection, dimension: usize) -> Result<Self> {
        let table = if table_exists(connection, VECTORS_TABLE).await? {
            connection
                .open_table(VECTORS_TABLE)
                .execute()
                .await
                .map_err(|e| KeepsakeError::Storage(format!("Failed to open vectors table: {e}")))?
        } else {
            tracing::info!("Creating {} table ({} dimensions)", VECTORS_TABLE, dimension);
            create_empty_table(connection, VECTORS_TABLE, Self::schema(dimension)).await?
        };

        Ok(Self { table, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn schema(dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension as i32,
                ),
                false,
            ),
            Field::new("metadata", DataType::Utf8, false),
        ]))
    }

    fn unavailable(context: &str, e: impl std::fmt::Display) -> KeepsakeError {
        KeepsakeError::VectorIndexUnavailable(format!("{context}: {e}"))
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    fn name(&self) -> &str {
        "lance"
    }

    async fn upsert(&self, id: Uuid, vector: Vec<f32>, metadata: serde_json::Value) -> Result<String> {
        if vector.len() != self.dimension {
            return Err(KeepsakeError::VectorIndexUnavailable(format!(
                "Expected {} dimensions, got {}",
                self.dimension,
                vector.len()
            )));
        }

        let id_str = id.to_string();
        self.remove(id).await?;

        let vectors: Vec<Option<Vec<Option<f32>>>> =
            vec![Some(vector.into_iter().map(Some).collect())];
        let schema = Self::schema(self.dimension);
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![id_str.as_str()])),
                Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
                    vectors,
                    self.dimension as i32,
                )),
                Arc::new(StringArray::from(vec![metadata.to_string()])),
            ],
        )
        .map_err(|e| Self::unavailable("Failed to create RecordBatch", e))?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| Self::unavailable("Failed to insert vector", e))?;

        Ok(id_str)
    }

    async fn query(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorMatch>> {
        let rows = self
            .table
            .count_rows(None)
            .await
            .map_err(|e| Self::unavailable("Failed to count vectors", e))?;
        if rows == 0 || limit == 0 {
            return Ok(Vec::new());
        }

        let stream = self
            .table
            .query()
            .nearest_to(vector)
            .map_err(|e| Self::unavailable("Failed to create vector query", e))?
            .distance_type(DistanceType::Cosine)
            .limit(limit)
            .execute()
            .await
            .map_err(|e| Self::unavailable("Failed to execute search", e))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| Self::unavailable("Failed to collect search results", e))?;

        let mut matches = Vec::new();
        for batch in &batches {
            let ids = string_column(batch, "id")?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| {
                    KeepsakeError::VectorIndexUnavailable("Missing _distance column".to_string())
                })?;

            for row in 0..batch.num_rows() {
                let Ok(id) = Uuid::parse_str(ids.value(row)) else {
                    tracing::warn!("Skipping vector row with invalid id '{}'", ids.value(row));
                    continue;
                };
                matches.push(VectorMatch {
                    id,
                    similarity: (1.0 - distances.value(row)).clamp(0.0, 1.0),
                });
            }
        }

        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(matches)
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.table
            .delete(&format!("id = {}", sql_string(&id.to_string())))
            .await
            .map_err(|e| Self::unavailable("Failed to delete vector", e))?;
        Ok(())
    }
}
