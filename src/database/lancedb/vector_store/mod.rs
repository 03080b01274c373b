
use arrow::array::{
    Array, BooleanArray, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::database::{IndexedDocument, ScoreOrder, ScoredDocument, VectorIndex};
use crate::records::{Document, DocumentMetadata};
use crate::{RecallError, Result};

/// Table holding the documents of a collection
pub const TABLE_NAME: &str = "documents";

/// A collection backed by a LanceDB database directory.
///
/// The table is created on the first upsert, once the vector dimension is known.
pub struct LanceIndex {
    name: String,
    connection: Connection,
    table: RwLock<Option<OpenTable>>,
    order: ScoreOrder,
}

#[derive(Clone)]
struct OpenTable {
    table: Table,
    dimension: usize,
}

impl LanceIndex {
    /// Connect to the database at `path`, opening the documents table if it exists.
    #[inline]
    pub async fn open(name: &str, path: &Path, order: ScoreOrder) -> Result<Self> {
        debug!("Opening LanceDB collection '{}' at {:?}", name, path);

        let uri = path.to_string_lossy();
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| RecallError::Database(format!("Failed to connect to LanceDB: {}", e)))?;

        let table_names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| RecallError::Database(format!("Failed to list tables: {}", e)))?;

        let table = if table_names.iter().any(|t| t == TABLE_NAME) {
            let table = connection
                .open_table(TABLE_NAME)
                .execute()
                .await
                .map_err(|e| RecallError::Database(format!("Failed to open table: {}", e)))?;
            let dimension = detect_vector_dimension(&table).await?;
            debug!("Detected vector dimension {} for '{}'", dimension, name);
            Some(OpenTable { table, dimension })
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            connection,
            table: RwLock::new(table),
            order,
        })
    }

    /// Dimension of stored vectors, if any have been written
    #[inline]
    pub async fn dimension(&self) -> Option<usize> {
        self.table.read().await.as_ref().map(|t| t.dimension)
    }

    async fn current(&self) -> Option<Table> {
        self.table.read().await.as_ref().map(|t| t.table.clone())
    }

    /// The table to write `dimension`-sized vectors into, created on first use.
    async fn writable_table(&self, dimension: usize) -> Result<Table> {
        if let Some(open) = self.table.read().await.as_ref() {
            return check_dimension(open, dimension);
        }

        let mut guard = self.table.write().await;
        if let Some(open) = guard.as_ref() {
            return check_dimension(open, dimension);
        }

        info!(
            "Creating table '{}' in collection '{}' with {} dimensions",
            TABLE_NAME, self.name, dimension
        );
        let table = self
            .connection
            .create_empty_table(TABLE_NAME, create_schema(dimension)?)
            .execute()
            .await
            .map_err(|e| RecallError::Database(format!("Failed to create table: {}", e)))?;

        *guard = Some(OpenTable {
            table: table.clone(),
            dimension,
        });
        Ok(table)
    }
}

fn check_dimension(open: &OpenTable, dimension: usize) -> Result<Table> {
    if open.dimension == dimension {
        Ok(open.table.clone())
    } else {
        Err(RecallError::Database(format!(
            "Vector dimension {} does not match collection dimension {}",
            dimension, open.dimension
        )))
    }
}

async fn detect_vector_dimension(table: &Table) -> Result<usize> {
    let schema = table
        .schema()
        .await
        .map_err(|e| RecallError::Database(format!("Failed to get table schema: {}", e)))?;

    schema
        .fields()
        .iter()
        .find(|field| field.name() == "vector")
        .and_then(|field| match field.data_type() {
            DataType::FixedSizeList(_, size) => usize::try_from(*size).ok(),
            _ => None,
        })
        .ok_or_else(|| {
            RecallError::Database("Could not find vector column or determine dimension".to_string())
        })
}

fn create_schema(dimension: usize) -> Result<Arc<Schema>> {
    let size = i32::try_from(dimension)
        .map_err(|_| RecallError::Database(format!("Vector dimension {dimension} is too large")))?;

    Ok(Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, false)), size),
            false,
        ),
        Field::new("content", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("chat_time", DataType::Utf8, true),
        Field::new("sender", DataType::Utf8, true),
        Field::new("msg_type", DataType::Utf8, true),
        Field::new("room", DataType::Utf8, true),
        Field::new("is_sender", DataType::Boolean, false),
        Field::new("msg_content_preview", DataType::Utf8, false),
        Field::new("indexed_at", DataType::Utf8, false),
    ])))
}

fn create_record_batch(records: &[IndexedDocument], dimension: usize) -> Result<RecordBatch> {
    let len = records.len();
    let indexed_at = Utc::now().to_rfc3339();

    let mut flat_values = Vec::with_capacity(len * dimension);
    for record in records {
        if record.vector.len() != dimension {
            return Err(RecallError::Database(format!(
                "Record {} has {} dimensions, expected {}",
                record.id,
                record.vector.len(),
                dimension
            )));
        }
        flat_values.extend_from_slice(&record.vector);
    }

    let schema = create_schema(dimension)?;
    let size = i32::try_from(dimension)
        .map_err(|_| RecallError::Database(format!("Vector dimension {dimension} is too large")))?;
    let field = Arc::new(Field::new("item", DataType::Float32, false));
    let vector_array =
        FixedSizeListArray::try_new(field, size, Arc::new(Float32Array::from(flat_values)), None)
            .map_err(|e| RecallError::Database(format!("Failed to create vector array: {}", e)))?;

    let metadata = || records.iter().map(|r| &r.document.metadata);
    let arrays: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.id.as_str()))),
        Arc::new(vector_array),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.document.content.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(metadata().map(|m| m.source.as_str()))),
        Arc::new(StringArray::from_iter(metadata().map(|m| m.chat_time.as_deref()))),
        Arc::new(StringArray::from_iter(metadata().map(|m| m.sender.as_deref()))),
        Arc::new(StringArray::from_iter(metadata().map(|m| m.msg_type.as_deref()))),
        Arc::new(StringArray::from_iter(metadata().map(|m| m.room.as_deref()))),
        Arc::new(BooleanArray::from_iter(metadata().map(|m| Some(m.is_sender)))),
        Arc::new(StringArray::from_iter_values(
            metadata().map(|m| m.msg_content_preview.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            std::iter::repeat_n(indexed_at.as_str(), len),
        )),
    ];

    RecordBatch::try_new(schema, arrays)
        .map_err(|e| RecallError::Database(format!("Failed to create record batch: {}", e)))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| RecallError::Database(format!("Missing {name} column")))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| RecallError::Database(format!("Invalid {name} column type")))
}

fn optional_value(column: &StringArray, row: usize) -> Option<String> {
    (!column.is_null(row)).then(|| column.value(row).to_string())
}

/// Decode rows into documents, pairing each with its `_distance` when present.
fn parse_batch(batch: &RecordBatch) -> Result<Vec<(Document, Option<f32>)>> {
    let contents = string_column(batch, "content")?;
    let sources = string_column(batch, "source")?;
    let chat_times = string_column(batch, "chat_time")?;
    let senders = string_column(batch, "sender")?;
    let msg_types = string_column(batch, "msg_type")?;
    let rooms = string_column(batch, "room")?;
    let previews = string_column(batch, "msg_content_preview")?;
    let is_sender = batch
        .column_by_name("is_sender")
        .ok_or_else(|| RecallError::Database("Missing is_sender column".to_string()))?
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| RecallError::Database("Invalid is_sender column type".to_string()))?;
    let distances = batch
        .column_by_name("_distance")
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

    let rows = (0..batch.num_rows())
        .map(|row| {
            let document = Document {
                content: contents.value(row).to_string(),
                metadata: DocumentMetadata {
                    source: sources.value(row).to_string(),
                    chat_time: optional_value(chat_times, row),
                    sender: optional_value(senders, row),
                    msg_type: optional_value(msg_types, row),
                    room: optional_value(rooms, row),
                    is_sender: !is_sender.is_null(row) && is_sender.value(row),
                    msg_content_preview: previews.value(row).to_string(),
                },
            };
            let distance = distances.and_then(|d| (!d.is_null(row)).then(|| d.value(row)));
            (document, distance)
        })
        .collect();

    Ok(rows)
}

async fn collect_rows(
    mut results: lancedb::arrow::SendableRecordBatchStream,
) -> Result<Vec<(Document, Option<f32>)>> {
    let mut rows = Vec::new();

    while let Some(batch) = results
        .try_next()
        .await
        .map_err(|e| RecallError::Database(format!("Failed to read result stream: {}", e)))?
    {
        rows.extend(parse_batch(&batch)?);
    }

    Ok(rows)
}

/// Search rows must carry `_distance`.
fn scored_row(
    order: ScoreOrder,
    document: Document,
    distance: Option<f32>,
) -> Result<ScoredDocument> {
    let distance = distance
        .ok_or_else(|| RecallError::Database("search result missing _distance".to_string()))?;
    Ok(ScoredDocument {
        document,
        score: order.from_distance(distance),
    })
}

#[async_trait]
impl VectorIndex for LanceIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn score_order(&self) -> ScoreOrder {
        self.order
    }

    async fn upsert(&self, records: &[IndexedDocument]) -> Result<()> {
        let Some(first) = records.first() else {
            debug!("No documents to store");
            return Ok(());
        };

        let dimension = first.vector.len();
        let table = self.writable_table(dimension).await?;
        let record_batch = create_record_batch(records, dimension)?;

        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| RecallError::Database(format!("Failed to insert documents: {}", e)))?;

        debug!(
            "Stored {} documents in collection '{}'",
            records.len(),
            self.name
        );
        Ok(())
    }

    async fn knn_search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredDocument>> {
        let Some(table) = self.current().await else {
            return Ok(Vec::new());
        };
        debug!("Searching '{}' for {} nearest documents", self.name, k);

        let results = table
            .vector_search(vector)
            .map_err(|e| RecallError::Database(format!("Failed to create vector search: {}", e)))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .limit(k)
            .execute()
            .await
            .map_err(|e| RecallError::Database(format!("Failed to execute search: {}", e)))?;

        let order = self.order;
        collect_rows(results)
            .await?
            .into_iter()
            .map(|(document, distance)| scored_row(order, document, distance))
            .collect()
    }

    async fn count(&self) -> Result<usize> {
        let Some(table) = self.current().await else {
            return Ok(0);
        };

        table
            .count_rows(None)
            .await
            .map_err(|e| RecallError::Database(format!("Failed to count rows: {}", e)))
    }

    async fn sample(&self, limit: usize) -> Result<Vec<Document>> {
        let Some(table) = self.current().await else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let results = table
            .query()
            .limit(limit)
            .execute()
            .await
            .map_err(|e| RecallError::Database(format!("Failed to scan table: {}", e)))?;

        Ok(collect_rows(results)
            .await?
            .into_iter()
            .map(|(document, _)| document)
            .collect())
    }
}
