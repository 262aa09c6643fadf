use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, Float32Array, Int32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::Table;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use tokio::sync::Mutex;
use tracing::debug;

use super::filter::escape_sql;
use super::{
    AssignmentStore, MemoryStore, RecordFilter, next_version, paginate, tier_page_order,
};
use crate::error::{Result, StrataError};
use crate::memory::types::{MemoryRecord, Tier, TierAssignment};

const MEMORIES_TABLE: &str = "memories";
const ASSIGNMENTS_TABLE: &str = "tier_assignments";

/// LanceDB-backed store holding the `memories` table and the
/// `tier_assignments` side-table.
///
/// Writes from this process are serialized through `write_lock`; assignment
/// updates additionally carry `version = n` in their predicate so a writer in
/// another process cannot be silently overwritten.
pub struct LanceStore {
    connection: Connection,
    memories_table: Table,
    assignments_table: Table,
    write_lock: Mutex<()>,
}

impl LanceStore {
    /// Connect to the database at `path`, creating missing tables
    pub async fn open(path: &Path) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| StrataError::StoreUnavailable("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| StrataError::StoreUnavailable(format!("Failed to connect to LanceDB: {e}")))?;

        let memories_table =
            Self::open_or_create(&connection, MEMORIES_TABLE, Self::memories_schema()).await?;
        let assignments_table =
            Self::open_or_create(&connection, ASSIGNMENTS_TABLE, Self::assignments_schema())
                .await?;

        Ok(Self {
            connection,
            memories_table,
            assignments_table,
            write_lock: Mutex::new(()),
        })
    }

    async fn open_or_create(
        connection: &Connection,
        name: &str,
        schema: Arc<Schema>,
    ) -> Result<Table> {
        let names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| StrataError::StoreUnavailable(format!("Failed to list tables: {e}")))?;

        if names.iter().any(|n| n == name) {
            return connection
                .open_table(name)
                .execute()
                .await
                .map_err(|e| StrataError::StoreUnavailable(format!("Failed to open {name}: {e}")));
        }

        debug!(table = name, "Creating table");
        let batch = RecordBatch::new_empty(schema.clone());
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        connection
            .create_table(name, Box::new(batches))
            .execute()
            .await
            .map_err(|e| StrataError::StoreUnavailable(format!("Failed to create {name}: {e}")))
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| StrataError::StoreUnavailable(format!("Failed to list tables: {e}")))?;

        Ok(names.iter().any(|n| n == name))
    }

    fn timestamp_type() -> DataType {
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
    }

    fn memories_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("weight", DataType::Float32, false),
            Field::new("created_at", Self::timestamp_type(), false),
            Field::new("last_accessed", Self::timestamp_type(), false),
            Field::new("access_count", DataType::Int32, false),
        ]))
    }

    fn assignments_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("memory_id", DataType::Utf8, false),
            Field::new("tier", DataType::Utf8, false),
            Field::new("weight", DataType::Float32, false),
            Field::new("created_at", Self::timestamp_type(), false),
            Field::new("last_accessed", Self::timestamp_type(), false),
            Field::new("access_count", DataType::Int32, false),
            Field::new("promotion_score", DataType::Float32, false),
            Field::new("metadata", DataType::Utf8, false),
            Field::new("version", DataType::Int64, false),
        ]))
    }

    /// Convert records to an Arrow RecordBatch
    fn records_to_batch(records: &[MemoryRecord]) -> Result<RecordBatch> {
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let weights: Vec<f32> = records.iter().map(|r| r.weight).collect();
        let created_at: Vec<i64> = records
            .iter()
            .map(|r| r.created_at.timestamp_micros())
            .collect();
        let last_accessed: Vec<i64> = records
            .iter()
            .map(|r| r.last_accessed.timestamp_micros())
            .collect();
        let access_counts: Vec<i32> = records
            .iter()
            .map(|r| to_i32(r.access_count))
            .collect();

        RecordBatch::try_new(
            Self::memories_schema(),
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(Float32Array::from(weights)),
                Arc::new(TimestampMicrosecondArray::from(created_at).with_timezone("UTC")),
                Arc::new(TimestampMicrosecondArray::from(last_accessed).with_timezone("UTC")),
                Arc::new(Int32Array::from(access_counts)),
            ],
        )
        .map_err(|e| StrataError::StoreUnavailable(format!("Failed to create RecordBatch: {e}")))
    }

    fn batch_to_records(batch: &RecordBatch) -> Result<Vec<MemoryRecord>> {
        let ids = column::<StringArray>(batch, "id")?;
        let weights = column::<Float32Array>(batch, "weight")?;
        let created_at = column::<TimestampMicrosecondArray>(batch, "created_at")?;
        let last_accessed = column::<TimestampMicrosecondArray>(batch, "last_accessed")?;
        let access_counts = column::<Int32Array>(batch, "access_count")?;

        (0..batch.num_rows())
            .map(|row| {
                Ok(MemoryRecord {
                    id: ids.value(row).to_string(),
                    weight: weights.value(row),
                    created_at: from_micros(created_at.value(row))?,
                    last_accessed: from_micros(last_accessed.value(row))?,
                    access_count: u32::try_from(access_counts.value(row)).unwrap_or(0),
                    tier: None,
                })
            })
            .collect()
    }

    /// Convert one assignment to a single-row RecordBatch
    fn assignment_to_batch(assignment: &TierAssignment) -> Result<RecordBatch> {
        let metadata = serde_json::to_string(&assignment.metadata).map_err(|e| {
            StrataError::Serialization(format!("Failed to encode assignment metadata: {e}"))
        })?;

        RecordBatch::try_new(
            Self::assignments_schema(),
            vec![
                Arc::new(StringArray::from(vec![assignment.memory_id.as_str()])),
                Arc::new(StringArray::from(vec![assignment.tier.as_str()])),
                Arc::new(Float32Array::from(vec![assignment.weight])),
                Arc::new(
                    TimestampMicrosecondArray::from(vec![assignment.created_at.timestamp_micros()])
                        .with_timezone("UTC"),
                ),
                Arc::new(
                    TimestampMicrosecondArray::from(vec![
                        assignment.last_accessed.timestamp_micros(),
                    ])
                    .with_timezone("UTC"),
                ),
                Arc::new(Int32Array::from(vec![to_i32(assignment.access_count)])),
                Arc::new(Float32Array::from(vec![assignment.promotion_score])),
                Arc::new(StringArray::from(vec![metadata.as_str()])),
                Arc::new(Int64Array::from(vec![to_i64(assignment.version)])),
            ],
        )
        .map_err(|e| StrataError::StoreUnavailable(format!("Failed to create RecordBatch: {e}")))
    }

    fn batch_to_assignments(batch: &RecordBatch) -> Result<Vec<TierAssignment>> {
        let memory_ids = column::<StringArray>(batch, "memory_id")?;
        let tiers = column::<StringArray>(batch, "tier")?;
        let weights = column::<Float32Array>(batch, "weight")?;
        let created_at = column::<TimestampMicrosecondArray>(batch, "created_at")?;
        let last_accessed = column::<TimestampMicrosecondArray>(batch, "last_accessed")?;
        let access_counts = column::<Int32Array>(batch, "access_count")?;
        let scores = column::<Float32Array>(batch, "promotion_score")?;
        let metadata = column::<StringArray>(batch, "metadata")?;
        let versions = column::<Int64Array>(batch, "version")?;

        (0..batch.num_rows())
            .map(|row| {
                let metadata: BTreeMap<String, String> =
                    serde_json::from_str(metadata.value(row)).map_err(|e| {
                        StrataError::Serialization(format!(
                            "Failed to decode assignment metadata: {e}"
                        ))
                    })?;

                Ok(TierAssignment {
                    memory_id: memory_ids.value(row).to_string(),
                    tier: Tier::new(tiers.value(row)),
                    weight: weights.value(row),
                    created_at: from_micros(created_at.value(row))?,
                    last_accessed: from_micros(last_accessed.value(row))?,
                    access_count: u32::try_from(access_counts.value(row)).unwrap_or(0),
                    promotion_score: scores.value(row),
                    metadata,
                    version: u64::try_from(versions.value(row)).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn collect(table: &Table, predicate: Option<String>) -> Result<Vec<RecordBatch>> {
        let mut query = table.query();
        if let Some(predicate) = predicate {
            query = query.only_if(predicate);
        }

        let stream = query
            .execute()
            .await
            .map_err(|e| StrataError::StoreUnavailable(format!("Failed to query table: {e}")))?;

        stream.try_collect().await.map_err(|e| {
            StrataError::StoreUnavailable(format!("Failed to collect query results: {e}"))
        })
    }

    async fn insert_batch(table: &Table, schema: Arc<Schema>, batch: RecordBatch) -> Result<()> {
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| StrataError::StoreUnavailable(format!("Failed to insert rows: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for LanceStore {
    async fn get(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let predicate = format!("id = '{}'", escape_sql(id));
        let batches = Self::collect(&self.memories_table, Some(predicate)).await?;

        for batch in &batches {
            if let Some(record) = Self::batch_to_records(batch)?.into_iter().next() {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn put(&self, record: &MemoryRecord) -> Result<()> {
        let batch = Self::records_to_batch(std::slice::from_ref(record))?;
        let _guard = self.write_lock.lock().await;

        self.memories_table
            .delete(&format!("id = '{}'", escape_sql(&record.id)))
            .await
            .map_err(|e| StrataError::StoreUnavailable(format!("Failed to replace record: {e}")))?;

        Self::insert_batch(&self.memories_table, Self::memories_schema(), batch).await
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<MemoryRecord>> {
        let batches = Self::collect(&self.memories_table, filter.to_sql_clause()).await?;

        let mut records = Vec::new();
        for batch in &batches {
            records.extend(Self::batch_to_records(batch)?);
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(paginate(records, filter.limit, filter.offset))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let exists = self.get(id).await?.is_some();
        if exists {
            self.memories_table
                .delete(&format!("id = '{}'", escape_sql(id)))
                .await
                .map_err(|e| StrataError::StoreUnavailable(format!("Failed to delete record: {e}")))?;
        }
        Ok(exists)
    }
}

#[async_trait]
impl AssignmentStore for LanceStore {
    async fn get_assignment(&self, memory_id: &str) -> Result<Option<TierAssignment>> {
        let predicate = format!("memory_id = '{}'", escape_sql(memory_id));
        let batches = Self::collect(&self.assignments_table, Some(predicate)).await?;

        for batch in &batches {
            if let Some(row) = Self::batch_to_assignments(batch)?.into_iter().next() {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    async fn compare_and_swap(
        &self,
        assignment: &TierAssignment,
        expected: Option<u64>,
    ) -> Result<bool> {
        let mut row = assignment.clone();
        row.version = next_version(expected);

        let _guard = self.write_lock.lock().await;
        let current = self.get_assignment(&assignment.memory_id).await?;

        match (current, expected) {
            (None, None) => {
                let batch = Self::assignment_to_batch(&row)?;
                Self::insert_batch(&self.assignments_table, Self::assignments_schema(), batch)
                    .await?;
                Ok(true)
            }
            (Some(current), Some(version)) if current.version == version => {
                let metadata = serde_json::to_string(&row.metadata).map_err(|e| {
                    StrataError::Serialization(format!("Failed to encode assignment metadata: {e}"))
                })?;

                let result = self
                    .assignments_table
                    .update()
                    .only_if(format!(
                        "memory_id = '{}' AND version = {}",
                        escape_sql(&row.memory_id),
                        to_i64(version)
                    ))
                    .column("tier", format!("'{}'", escape_sql(row.tier.as_str())))
                    .column("weight", format!("{}", row.weight))
                    .column("created_at", format!("{}", row.created_at.timestamp_micros()))
                    .column(
                        "last_accessed",
                        format!("{}", row.last_accessed.timestamp_micros()),
                    )
                    .column("access_count", format!("{}", to_i32(row.access_count)))
                    .column("promotion_score", format!("{}", row.promotion_score))
                    .column("metadata", format!("'{}'", escape_sql(&metadata)))
                    .column("version", format!("{}", to_i64(row.version)))
                    .execute()
                    .await
                    .map_err(|e| {
                        StrataError::StoreUnavailable(format!("Failed to update assignment: {e}"))
                    })?;

                Ok(result.rows_updated > 0)
            }
            _ => Ok(false),
        }
    }

    async fn delete_assignment(&self, memory_id: &str, expected: Option<u64>) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let Some(current) = self.get_assignment(memory_id).await? else {
            return Ok(false);
        };
        if expected.is_some_and(|v| v != current.version) {
            return Ok(false);
        }

        self.assignments_table
            .delete(&format!("memory_id = '{}'", escape_sql(memory_id)))
            .await
            .map_err(|e| StrataError::StoreUnavailable(format!("Failed to delete assignment: {e}")))?;
        Ok(true)
    }

    async fn list_by_tier(
        &self,
        tier: &Tier,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TierAssignment>> {
        let rows = self.scan_tier(tier).await?;
        Ok(paginate(rows, Some(limit), offset))
    }

    async fn scan_tier(&self, tier: &Tier) -> Result<Vec<TierAssignment>> {
        let predicate = format!("tier = '{}'", escape_sql(tier.as_str()));
        let batches = Self::collect(&self.assignments_table, Some(predicate)).await?;

        let mut rows = Vec::new();
        for batch in &batches {
            rows.extend(Self::batch_to_assignments(batch)?);
        }
        rows.sort_by(tier_page_order);
        Ok(rows)
    }

    async fn count_by_tier(&self, tier: &Tier) -> Result<usize> {
        self.assignments_table
            .count_rows(Some(format!("tier = '{}'", escape_sql(tier.as_str()))))
            .await
            .map_err(|e| StrataError::StoreUnavailable(format!("Failed to count rows: {e}")))
    }
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| StrataError::StoreUnavailable(format!("Failed to get {name} column")))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| StrataError::StoreUnavailable(format!("Invalid timestamp: {micros}")))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
