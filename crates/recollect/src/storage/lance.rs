//! LanceDB-backed graph store
//!
//! Every node label and relationship type gets its own table, named after
//! the label or type in [`super::schema`]:
//!
//! | table            | rows                                                  |
//! |------------------|-------------------------------------------------------|
//! | `Memory`         | one per memory node, with embedding and source fields |
//! | `Entity`         | entity name and mention count                         |
//! | `Author`         | one per author name                                   |
//! | `Source`         | one per source node                                   |
//! | `Storage`        | the aggregate counters                                |
//! | `MENTIONS`       | memory -> entity, with `count`                        |
//! | `MENTIONED_WITH` | entity -- entity, with `coMentionCount`               |
//! | `AUTHORED_BY`    | memory -> author                                      |
//! | `SOURCED_FROM`   | memory -> source                                      |
//! | `NEXT_IN_SERIES` | memory -> memory                                      |
//! | `RELATED_TO`     | memory -- memory, with `connection_strength`          |
//!
//! Relationship rows are `head -> tail`; undirected ones are stored once with
//! `head <= tail`. LanceDB has no multi-table transactions, so writes are
//! serialised through a single mutex and rows are replaced with merge-inserts,
//! never deleted and re-added.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow_array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::index::Index;
use lancedb::index::vector::IvfPqIndexBuilder;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::schema::{
    AUTHOR_LABEL, AUTHORED_BY, CO_MENTION_COUNT, CONNECTION_STRENGTH, ENTITY_LABEL, MEMORY_LABEL,
    MENTIONED_WITH, MENTIONS, MENTIONS_COUNT, NEXT_IN_SERIES, NodeRef, RELATED_TO, SOURCE_LABEL,
    SOURCED_FROM, STORAGE_LABEL, ordered_pair, sql_escape, sql_in_list, traversal_score,
    unordered_pairs,
};
use super::{EntityRecord, GraphMemoryStore, ScoredMemory, StoreStats};
use crate::error::{RecollectError, Result};
use crate::memory::relevance::TimeRelevance;
use crate::memory::source::{Source, SourceType};
use crate::memory::types::{EMBEDDING_DIMENSION, FeedbackType, Memory, normalize_entity, now_ms};

const HEAD: &str = "head";
const TAIL: &str = "tail";

const MEMORY_COUNT_KEY: &str = "memory_count";

/// Rows needed before an IVF-PQ index can be trained
pub const DEFAULT_INDEX_THRESHOLD: usize = 256;

const MAX_PARTITIONS: u32 = 256;

/// Candidates re-ranked with exact distances per requested result
const REFINE_FACTOR: u32 = 10;

fn storage_err(context: &str, e: impl std::fmt::Display) -> RecollectError {
    RecollectError::Storage(format!("{context}: {e}"))
}

/// One relationship row: `head -> tail` with its integer property
#[derive(Debug, Clone, PartialEq)]
struct Link {
    head: String,
    tail: String,
    weight: i64,
}

impl Link {
    fn new(head: impl Into<String>, tail: impl Into<String>, weight: i64) -> Self {
        Self {
            head: head.into(),
            tail: tail.into(),
            weight,
        }
    }

    fn other(&self, key: &str) -> &str {
        if self.head == key { &self.tail } else { &self.head }
    }
}

/// A relationship table and the name of its property column, if any.
/// Relationships without a property read back with a weight of 1.
struct EdgeTable {
    table: Table,
    property: Option<&'static str>,
}

/// Graph store persisted in a LanceDB directory
pub struct LanceGraphStore {
    connection: Connection,
    memories: Table,
    entities: Table,
    authors: Table,
    sources: Table,
    storage: Table,
    mentions: EdgeTable,
    co_mentions: EdgeTable,
    authored_by: EdgeTable,
    sourced_from: EdgeTable,
    series: EdgeTable,
    related: EdgeTable,
    writes: Mutex<()>,
    index_threshold: usize,
    indexed: AtomicBool,
}

impl LanceGraphStore {
    /// Open the store at `path`, creating missing tables
    pub async fn open(path: &Path) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| RecollectError::Storage("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| storage_err("Failed to connect to LanceDB", e))?;

        let existing = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| storage_err("Failed to list tables", e))?;

        let open = |name: &'static str, schema: SchemaRef| {
            Self::open_or_create(&connection, name, schema, &existing)
        };
        let edges = |name: &'static str, property: Option<&'static str>| {
            Self::open_edges(&connection, name, property, &existing)
        };

        let memories = open(MEMORY_LABEL, Self::memories_schema()).await?;
        let indexed = memories
            .list_indices()
            .await
            .map_err(|e| storage_err("Failed to list indices", e))?
            .iter()
            .any(|index| index.columns.iter().any(|c| c == "embedding"));

        let store = Self {
            memories,
            entities: open(ENTITY_LABEL, Self::counter_schema()).await?,
            authors: open(AUTHOR_LABEL, Self::authors_schema()).await?,
            sources: open(SOURCE_LABEL, Self::sources_schema()).await?,
            storage: open(STORAGE_LABEL, Self::counter_schema()).await?,
            mentions: edges(MENTIONS, Some(MENTIONS_COUNT)).await?,
            co_mentions: edges(MENTIONED_WITH, Some(CO_MENTION_COUNT)).await?,
            authored_by: edges(AUTHORED_BY, None).await?,
            sourced_from: edges(SOURCED_FROM, None).await?,
            series: edges(NEXT_IN_SERIES, None).await?,
            related: edges(RELATED_TO, Some(CONNECTION_STRENGTH)).await?,
            connection,
            writes: Mutex::new(()),
            index_threshold: DEFAULT_INDEX_THRESHOLD,
            indexed: AtomicBool::new(indexed),
        };

        info!("Opened graph store at {}", path.display());
        Ok(store)
    }

    /// Row count at which the vector index gets built (at least 256)
    pub fn with_index_threshold(mut self, threshold: usize) -> Self {
        self.index_threshold = threshold.max(DEFAULT_INDEX_THRESHOLD);
        self
    }

    async fn open_or_create(
        connection: &Connection,
        name: &str,
        schema: SchemaRef,
        existing: &[String],
    ) -> Result<Table> {
        if existing.iter().any(|t| t == name) {
            return connection
                .open_table(name)
                .execute()
                .await
                .map_err(|e| storage_err(&format!("Failed to open {name} table"), e));
        }

        let batches = RecordBatchIterator::new(
            vec![Ok(RecordBatch::new_empty(schema.clone()))],
            schema,
        );
        connection
            .create_table(name, Box::new(batches))
            .execute()
            .await
            .map_err(|e| storage_err(&format!("Failed to create {name} table"), e))
    }

    async fn open_edges(
        connection: &Connection,
        name: &str,
        property: Option<&'static str>,
        existing: &[String],
    ) -> Result<EdgeTable> {
        let table =
            Self::open_or_create(connection, name, Self::edge_schema(property), existing).await?;
        Ok(EdgeTable { table, property })
    }

    fn embedding_type() -> DataType {
        DataType::FixedSizeList(
            Arc::new(Field::new("item", DataType::Float32, true)),
            EMBEDDING_DIMENSION as i32,
        )
    }

    fn memories_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("memory", DataType::Utf8, false),
            Field::new("topic", DataType::Utf8, true),
            Field::new("time_relevance", DataType::Utf8, false),
            Field::new("truthfulness", DataType::Float32, false),
            Field::new("memory_time_point", DataType::Int64, false),
            Field::new("source_type", DataType::Utf8, false),
            Field::new("full_source", DataType::Utf8, true),
            Field::new("source_key", DataType::Utf8, true),
            Field::new("authors", DataType::Utf8, false),
            Field::new("publisher", DataType::Utf8, true),
            Field::new("embedding", Self::embedding_type(), true),
            Field::new("creation_time", DataType::Int64, false),
            Field::new("last_access", DataType::Int64, false),
            Field::new("total_access_count", DataType::Int64, false),
            Field::new("positive_access_count", DataType::Int64, false),
            Field::new("negative_access_count", DataType::Int64, false),
        ]))
    }

    fn sources_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("source_type", DataType::Utf8, false),
            Field::new("full_source", DataType::Utf8, true),
            Field::new("authors", DataType::Utf8, false),
            Field::new("publisher", DataType::Utf8, true),
        ]))
    }

    fn authors_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("name", DataType::Utf8, false)]))
    }

    fn counter_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("value", DataType::Int64, false),
        ]))
    }

    fn edge_schema(property: Option<&str>) -> SchemaRef {
        let mut fields = vec![
            Field::new(HEAD, DataType::Utf8, false),
            Field::new(TAIL, DataType::Utf8, false),
        ];
        if let Some(property) = property {
            fields.push(Field::new(property, DataType::Int64, false));
        }
        Arc::new(Schema::new(fields))
    }

    fn all_tables(&self) -> [&Table; 11] {
        [
            &self.memories,
            &self.entities,
            &self.authors,
            &self.sources,
            &self.storage,
            &self.mentions.table,
            &self.co_mentions.table,
            &self.authored_by.table,
            &self.sourced_from.table,
            &self.series.table,
            &self.related.table,
        ]
    }

    // ---- row conversion -------------------------------------------------

    fn memories_to_batch(memories: &[Memory]) -> Result<RecordBatch> {
        let embeddings: Vec<Option<Vec<Option<f32>>>> = memories
            .iter()
            .map(|m| {
                (m.embedding.len() == EMBEDDING_DIMENSION)
                    .then(|| m.embedding.iter().map(|&v| Some(v)).collect())
            })
            .collect();

        let authors: Vec<String> = memories
            .iter()
            .map(|m| serde_json::to_string(&m.source.authors))
            .collect::<std::result::Result<_, _>>()?;

        RecordBatch::try_new(
            Self::memories_schema(),
            vec![
                Arc::new(StringArray::from_iter_values(memories.iter().map(|m| &m.id))),
                Arc::new(StringArray::from_iter_values(memories.iter().map(|m| &m.memory))),
                Arc::new(StringArray::from_iter(memories.iter().map(|m| m.topic.as_deref()))),
                Arc::new(StringArray::from_iter_values(
                    memories.iter().map(|m| m.time_relevance.as_str()),
                )),
                Arc::new(Float32Array::from_iter_values(memories.iter().map(|m| m.truthfulness))),
                Arc::new(Int64Array::from_iter_values(
                    memories.iter().map(|m| m.memory_time_point),
                )),
                Arc::new(StringArray::from_iter_values(
                    memories.iter().map(|m| m.source.source_type.as_str()),
                )),
                Arc::new(StringArray::from_iter(
                    memories.iter().map(|m| m.source.full_source.as_deref()),
                )),
                Arc::new(StringArray::from_iter(
                    memories.iter().map(|m| m.source.source.as_deref()),
                )),
                Arc::new(StringArray::from_iter_values(authors)),
                Arc::new(StringArray::from_iter(
                    memories.iter().map(|m| m.source.publisher.as_deref()),
                )),
                Arc::new(FixedSizeListArray::from_iter_primitive::<
                    arrow_array::types::Float32Type,
                    _,
                    _,
                >(embeddings, EMBEDDING_DIMENSION as i32)),
                Arc::new(Int64Array::from_iter_values(memories.iter().map(|m| m.creation_time))),
                Arc::new(Int64Array::from_iter_values(memories.iter().map(|m| m.last_access))),
                Arc::new(Int64Array::from_iter_values(
                    memories.iter().map(|m| m.total_access_count as i64),
                )),
                Arc::new(Int64Array::from_iter_values(
                    memories.iter().map(|m| m.positive_access_count as i64),
                )),
                Arc::new(Int64Array::from_iter_values(
                    memories.iter().map(|m| m.negative_access_count as i64),
                )),
            ],
        )
        .map_err(|e| storage_err("Failed to create memory RecordBatch", e))
    }

    fn batch_to_memories(batch: &RecordBatch) -> Result<Vec<Memory>> {
        let ids = string_column(batch, "id")?;
        let texts = string_column(batch, "memory")?;
        let topics = string_column(batch, "topic")?;
        let relevances = string_column(batch, "time_relevance")?;
        let truthfulness = column::<Float32Array>(batch, "truthfulness")?;
        let time_points = column::<Int64Array>(batch, "memory_time_point")?;
        let source_types = string_column(batch, "source_type")?;
        let full_sources = string_column(batch, "full_source")?;
        let source_keys = string_column(batch, "source_key")?;
        let authors = string_column(batch, "authors")?;
        let publishers = string_column(batch, "publisher")?;
        let embeddings = column::<FixedSizeListArray>(batch, "embedding")?;
        let created = column::<Int64Array>(batch, "creation_time")?;
        let accessed = column::<Int64Array>(batch, "last_access")?;
        let totals = column::<Int64Array>(batch, "total_access_count")?;
        let positives = column::<Int64Array>(batch, "positive_access_count")?;
        let negatives = column::<Int64Array>(batch, "negative_access_count")?;

        let mut memories = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let embedding = if embeddings.is_null(row) {
                Vec::new()
            } else {
                let values = embeddings.value(row);
                let floats = values
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .ok_or_else(|| {
                        RecollectError::Storage("Failed to get embedding values".to_string())
                    })?;
                floats.values().to_vec()
            };

            let source = Source {
                source_type: SourceType::parse(source_types.value(row)),
                full_source: optional(full_sources, row),
                source: optional(source_keys, row),
                authors: serde_json::from_str(authors.value(row))?,
                publisher: optional(publishers, row),
            };

            memories.push(Memory {
                id: ids.value(row).to_string(),
                memory: texts.value(row).to_string(),
                entities: Default::default(),
                topic: optional(topics, row),
                time_relevance: TimeRelevance::parse(relevances.value(row)),
                truthfulness: truthfulness.value(row),
                memory_time_point: time_points.value(row),
                source,
                embedding,
                creation_time: created.value(row),
                last_access: accessed.value(row),
                total_access_count: totals.value(row).max(0) as u64,
                positive_access_count: positives.value(row).max(0) as u64,
                negative_access_count: negatives.value(row).max(0) as u64,
            });
        }
        Ok(memories)
    }

    fn links_to_batch(edges: &EdgeTable, links: &[Link]) -> Result<RecordBatch> {
        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(links.iter().map(|l| &l.head))),
            Arc::new(StringArray::from_iter_values(links.iter().map(|l| &l.tail))),
        ];
        if edges.property.is_some() {
            columns.push(Arc::new(Int64Array::from_iter_values(
                links.iter().map(|l| l.weight),
            )));
        }
        RecordBatch::try_new(Self::edge_schema(edges.property), columns)
            .map_err(|e| storage_err("Failed to create edge RecordBatch", e))
    }

    fn counters_to_batch(counters: &[(String, i64)]) -> Result<RecordBatch> {
        RecordBatch::try_new(
            Self::counter_schema(),
            vec![
                Arc::new(StringArray::from_iter_values(counters.iter().map(|(k, _)| k))),
                Arc::new(Int64Array::from_iter_values(counters.iter().map(|(_, v)| *v))),
            ],
        )
        .map_err(|e| storage_err("Failed to create counter RecordBatch", e))
    }

    fn source_to_batch(key: &str, source: &Source) -> Result<RecordBatch> {
        let authors = serde_json::to_string(&source.authors)?;
        RecordBatch::try_new(
            Self::sources_schema(),
            vec![
                Arc::new(StringArray::from(vec![key])),
                Arc::new(StringArray::from(vec![source.source_type.as_str()])),
                Arc::new(StringArray::from(vec![source.full_source.as_deref()])),
                Arc::new(StringArray::from(vec![authors.as_str()])),
                Arc::new(StringArray::from(vec![source.publisher.as_deref()])),
            ],
        )
        .map_err(|e| storage_err("Failed to create source RecordBatch", e))
    }

    fn authors_to_batch(names: &[&String]) -> Result<RecordBatch> {
        RecordBatch::try_new(
            Self::authors_schema(),
            vec![Arc::new(StringArray::from_iter_values(names.iter()))],
        )
        .map_err(|e| storage_err("Failed to create author RecordBatch", e))
    }

    // ---- table primitives -----------------------------------------------

    async fn fetch(table: &Table, filter: Option<String>) -> Result<Vec<RecordBatch>> {
        let mut query = table.query();
        if let Some(filter) = filter {
            query = query.only_if(filter);
        }
        let stream = query
            .execute()
            .await
            .map_err(|e| storage_err("Failed to execute query", e))?;
        stream
            .try_collect()
            .await
            .map_err(|e| storage_err("Failed to collect query results", e))
    }

    /// Merge `batch` into `table` keyed on `on`. Matching rows are replaced
    /// in place when `replace` is set and left alone otherwise; new keys are
    /// inserted. Each merge commits as a single table version.
    async fn merge(table: &Table, on: &[&str], batch: RecordBatch, replace: bool) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let mut merge = table.merge_insert(on);
        if replace {
            merge.when_matched_update_all(None);
        }
        merge.when_not_matched_insert_all();
        merge
            .execute(Box::new(batches))
            .await
            .map_err(|e| storage_err("Failed to merge rows", e))?;
        Ok(())
    }

    async fn delete_where(table: &Table, filter: &str) -> Result<()> {
        table
            .delete(filter)
            .await
            .map_err(|e| storage_err("Failed to delete rows", e))?;
        Ok(())
    }

    async fn fetch_memories(&self, filter: String) -> Result<Vec<Memory>> {
        let mut memories = Vec::new();
        for batch in Self::fetch(&self.memories, Some(filter)).await? {
            memories.extend(Self::batch_to_memories(&batch)?);
        }
        self.attach_entities(&mut memories).await?;
        Ok(memories)
    }

    async fn attach_entities(&self, memories: &mut [Memory]) -> Result<()> {
        if memories.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = memories.iter().map(|m| m.id.as_str()).collect();
        let mut by_memory: HashMap<String, Vec<Link>> = HashMap::new();
        for link in self.links(&self.mentions, sql_in_list(HEAD, &ids)).await? {
            by_memory.entry(link.head.clone()).or_default().push(link);
        }
        for memory in memories.iter_mut() {
            if let Some(links) = by_memory.remove(&memory.id) {
                memory.entities = links
                    .into_iter()
                    .map(|l| (l.tail, l.weight.max(1) as u32))
                    .collect();
            }
        }
        Ok(())
    }

    async fn links(&self, edges: &EdgeTable, filter: String) -> Result<Vec<Link>> {
        let mut links = Vec::new();
        for batch in Self::fetch(&edges.table, Some(filter)).await? {
            let heads = string_column(&batch, HEAD)?;
            let tails = string_column(&batch, TAIL)?;
            let weights = match edges.property {
                Some(property) => Some(column::<Int64Array>(&batch, property)?),
                None => None,
            };
            for row in 0..batch.num_rows() {
                let weight = weights.map_or(1, |w| w.value(row));
                links.push(Link::new(heads.value(row), tails.value(row), weight));
            }
        }
        Ok(links)
    }

    /// Links touching any of `keys` from either end
    async fn links_touching(&self, edges: &EdgeTable, keys: &[&str]) -> Result<Vec<Link>> {
        let filter = format!("{} OR {}", sql_in_list(HEAD, keys), sql_in_list(TAIL, keys));
        self.links(edges, filter).await
    }

    /// Upsert one row per `(head, tail)` pair
    async fn put_links(&self, edges: &EdgeTable, links: &[Link]) -> Result<()> {
        if links.is_empty() {
            return Ok(());
        }
        let batch = Self::links_to_batch(edges, links)?;
        Self::merge(&edges.table, &[HEAD, TAIL], batch, edges.property.is_some()).await
    }

    async fn counters(&self, table: &Table, keys: &[&str]) -> Result<HashMap<String, i64>> {
        let mut values = HashMap::new();
        for batch in Self::fetch(table, Some(sql_in_list("key", keys))).await? {
            let k = string_column(&batch, "key")?;
            let v = column::<Int64Array>(&batch, "value")?;
            for row in 0..batch.num_rows() {
                values.insert(k.value(row).to_string(), v.value(row));
            }
        }
        Ok(values)
    }

    async fn put_counters(&self, table: &Table, counters: &[(String, i64)]) -> Result<()> {
        if counters.is_empty() {
            return Ok(());
        }
        Self::merge(table, &["key"], Self::counters_to_batch(counters)?, true).await
    }

    /// Add `delta` to each counter, starting from zero
    async fn bump_counters(&self, table: &Table, keys: &[String], delta: i64) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let current = self.counters(table, &refs).await?;
        let mut totals: HashMap<&str, i64> = HashMap::new();
        for &key in &refs {
            *totals.entry(key).or_insert(current.get(key).copied().unwrap_or(0)) += delta;
        }
        let updated: Vec<(String, i64)> = totals
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.put_counters(table, &updated).await
    }

    /// Increment undirected edges stored with `head <= tail`
    async fn bump_pairs(&self, edges: &EdgeTable, pairs: &[(String, String)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let keys: BTreeSet<&str> = pairs
            .iter()
            .flat_map(|(a, b)| [a.as_str(), b.as_str()])
            .collect();
        let keys: Vec<&str> = keys.into_iter().collect();
        let filter = format!("{} AND {}", sql_in_list(HEAD, &keys), sql_in_list(TAIL, &keys));
        let existing: HashMap<(String, String), i64> = self
            .links(edges, filter)
            .await?
            .into_iter()
            .map(|l| ((l.head, l.tail), l.weight))
            .collect();

        let mut totals: HashMap<(String, String), i64> = HashMap::new();
        for (a, b) in pairs {
            let (a, b) = ordered_pair(a, b);
            let key = (a.to_string(), b.to_string());
            let start = existing.get(&key).copied().unwrap_or(0);
            *totals.entry(key).or_insert(start) += 1;
        }
        let links: Vec<Link> = totals
            .into_iter()
            .map(|((a, b), w)| Link::new(a, b, w))
            .collect();
        self.put_links(edges, &links).await
    }

    async fn existing_ids(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut found = HashSet::new();
        for batch in Self::fetch(&self.memories, Some(sql_in_list("id", ids))).await? {
            let col = string_column(&batch, "id")?;
            for row in 0..batch.num_rows() {
                found.insert(col.value(row).to_string());
            }
        }
        let mut seen = HashSet::new();
        Ok(ids
            .iter()
            .filter(|id| found.contains(*id) && seen.insert(id.as_str()))
            .cloned()
            .collect())
    }

    // ---- writes ---------------------------------------------------------

    async fn upsert_memory(&self, memory: &Memory) -> Result<()> {
        let id_filter = format!("id = '{}'", sql_escape(&memory.id));
        let mut previous = None;
        for batch in Self::fetch(&self.memories, Some(id_filter)).await? {
            previous = previous.or(Self::batch_to_memories(&batch)?.into_iter().next());
        }

        let mut stored = memory.clone();
        match &previous {
            Some(existing) => {
                stored.creation_time = existing.creation_time;
                stored.last_access = existing.last_access;
                stored.total_access_count = existing.total_access_count;
                stored.positive_access_count = existing.positive_access_count;
                stored.negative_access_count = existing.negative_access_count;
            }
            None => {
                self.bump_counters(&self.storage, &[MEMORY_COUNT_KEY.to_string()], 1)
                    .await?;
            }
        }
        let batch = Self::memories_to_batch(std::slice::from_ref(&stored))?;
        Self::merge(&self.memories, &["id"], batch, true).await?;

        if let Some(key) = &memory.source.source {
            let batch = Self::source_to_batch(key, &memory.source)?;
            Self::merge(&self.sources, &["key"], batch, false).await?;
            self.put_links(&self.sourced_from, &[Link::new(&memory.id, key, 1)])
                .await?;
        }

        let authors: BTreeSet<&String> = memory.source.authors.iter().collect();
        if !authors.is_empty() {
            let names: Vec<&String> = authors.into_iter().collect();
            Self::merge(&self.authors, &["name"], Self::authors_to_batch(&names)?, false).await?;
            let authored: Vec<Link> = names
                .iter()
                .map(|author| Link::new(&memory.id, *author, 1))
                .collect();
            self.put_links(&self.authored_by, &authored).await?;
        }

        self.link_mentions(&memory.id, &memory.entities).await
    }

    /// Upsert mention edges, updating entity and co-mention counts for new ones
    async fn link_mentions(
        &self,
        memory_id: &str,
        entities: &BTreeMap<String, u32>,
    ) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let known: HashSet<String> = self
            .links(&self.mentions, format!("{HEAD} = '{}'", sql_escape(memory_id)))
            .await?
            .into_iter()
            .map(|l| l.tail)
            .collect();

        let edges: Vec<Link> = entities
            .iter()
            .map(|(entity, count)| Link::new(memory_id, entity, i64::from(*count)))
            .collect();
        self.put_links(&self.mentions, &edges).await?;

        let created: Vec<String> = entities
            .keys()
            .filter(|e| !known.contains(*e))
            .cloned()
            .collect();
        self.bump_counters(&self.entities, &created, 1).await?;

        let names: Vec<&String> = entities.keys().collect();
        let pairs: Vec<(String, String)> = unordered_pairs(&names)
            .into_iter()
            .filter(|(a, b)| created.contains(a) || created.contains(b))
            .collect();
        self.bump_pairs(&self.co_mentions, &pairs).await
    }

    async fn maybe_build_index(&self) -> Result<()> {
        if self.indexed.load(Ordering::Relaxed) {
            return Ok(());
        }
        let rows = self
            .memories
            .count_rows(Some("embedding IS NOT NULL".to_string()))
            .await
            .map_err(|e| storage_err("Failed to count rows", e))?;

        if rows < self.index_threshold {
            return Ok(());
        }

        let partitions = ((rows as f64).sqrt() as u32).clamp(1, MAX_PARTITIONS);
        let ivf_pq = IvfPqIndexBuilder::default()
            .distance_type(DistanceType::Cosine)
            .num_partitions(partitions)
            .num_sub_vectors(16);

        self.memories
            .create_index(&["embedding"], Index::IvfPq(ivf_pq))
            .execute()
            .await
            .map_err(|e| storage_err("Failed to create vector index", e))?;

        self.indexed.store(true, Ordering::Relaxed);
        info!("Built vector index over {rows} memories");
        Ok(())
    }

    /// Whether vector queries go through the IVF-PQ index
    pub fn is_indexed(&self) -> bool {
        self.indexed.load(Ordering::Relaxed)
    }

    // ---- traversal ------------------------------------------------------

    /// Every neighbour of the nodes in `frontier`
    async fn expand(&self, frontier: &[NodeRef]) -> Result<BTreeSet<NodeRef>> {
        let mut memories = Vec::new();
        let mut entities = Vec::new();
        let mut authors = Vec::new();
        let mut sources = Vec::new();
        for node in frontier {
            match node {
                NodeRef::Memory(k) => memories.push(k.as_str()),
                NodeRef::Entity(k) => entities.push(k.as_str()),
                NodeRef::Author(k) => authors.push(k.as_str()),
                NodeRef::Source(k) => sources.push(k.as_str()),
            }
        }

        let mut out = BTreeSet::new();

        if !memories.is_empty() {
            let heads = sql_in_list(HEAD, &memories);
            for link in self.links(&self.mentions, heads.clone()).await? {
                out.insert(NodeRef::Entity(link.tail));
            }
            for link in self.links(&self.authored_by, heads.clone()).await? {
                out.insert(NodeRef::Author(link.tail));
            }
            for link in self.links(&self.sourced_from, heads).await? {
                out.insert(NodeRef::Source(link.tail));
            }
            for edges in [&self.series, &self.related] {
                for link in self.links_touching(edges, &memories).await? {
                    for key in &memories {
                        if link.head == *key || link.tail == *key {
                            out.insert(NodeRef::Memory(link.other(key).to_string()));
                        }
                    }
                }
            }
        }

        if !entities.is_empty() {
            for link in self.links(&self.mentions, sql_in_list(TAIL, &entities)).await? {
                out.insert(NodeRef::Memory(link.head));
            }
            for link in self.links_touching(&self.co_mentions, &entities).await? {
                for key in &entities {
                    if link.head == *key || link.tail == *key {
                        out.insert(NodeRef::Entity(link.other(key).to_string()));
                    }
                }
            }
        }

        if !authors.is_empty() {
            for link in self.links(&self.authored_by, sql_in_list(TAIL, &authors)).await? {
                out.insert(NodeRef::Memory(link.head));
            }
        }

        if !sources.is_empty() {
            for link in self.links(&self.sourced_from, sql_in_list(TAIL, &sources)).await? {
                out.insert(NodeRef::Memory(link.head));
            }
        }

        Ok(out)
    }

    /// Fetch `ids` and return them in the given order
    async fn memories_in_order(&self, ids: &[String]) -> Result<Vec<Memory>> {
        let mut by_id: HashMap<String, Memory> = self
            .fetch_memories(sql_in_list("id", ids))
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }
}

fn column<'a, A: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a A> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<A>())
        .ok_or_else(|| RecollectError::Storage(format!("Failed to get {name} column")))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    column::<StringArray>(batch, name)
}

fn optional(array: &StringArray, row: usize) -> Option<String> {
    (!array.is_null(row)).then(|| array.value(row).to_string())
}

async fn count_rows(table: &Table) -> Result<usize> {
    table
        .count_rows(None)
        .await
        .map_err(|e| storage_err(&format!("Failed to count {} rows", table.name()), e))
}

#[async_trait]
impl GraphMemoryStore for LanceGraphStore {
    async fn is_connected(&self) -> bool {
        self.connection.table_names().execute().await.is_ok()
    }

    async fn reset_database(&self, confirm: bool) -> Result<bool> {
        if !confirm {
            return Ok(false);
        }
        let _guard = self.writes.lock().await;
        for table in self.all_tables() {
            debug!("Clearing table {}", table.name());
            Self::delete_where(table, "true").await?;
        }
        // the old index covers no rows; it is retrained once the table refills
        self.indexed.store(false, Ordering::Relaxed);
        self.put_counters(&self.storage, &[(MEMORY_COUNT_KEY.to_string(), 0)])
            .await?;
        info!("Graph store reset");
        Ok(true)
    }

    async fn add_memory_batch(&self, memories: &[Memory]) -> Result<Vec<String>> {
        let _guard = self.writes.lock().await;
        for memory in memories {
            self.upsert_memory(memory).await?;
        }
        self.maybe_build_index().await?;
        debug!("Upserted {} memories", memories.len());
        Ok(memories.iter().map(|m| m.id.clone()).collect())
    }

    async fn add_memory_series(&self, memories: &[Memory]) -> Result<Vec<String>> {
        let _guard = self.writes.lock().await;
        for memory in memories {
            self.upsert_memory(memory).await?;
        }
        let links: Vec<Link> = memories
            .windows(2)
            .filter(|w| w[0].id != w[1].id)
            .map(|w| Link::new(&w[0].id, &w[1].id, 1))
            .collect();
        if !links.is_empty() {
            // a memory has at most one successor and one predecessor; edges
            // kept by this series are never removed
            let heads: Vec<&str> = links.iter().map(|l| l.head.as_str()).collect();
            let tails: Vec<&str> = links.iter().map(|l| l.tail.as_str()).collect();
            let kept: Vec<String> = links
                .iter()
                .map(|l| {
                    format!(
                        "({HEAD} = '{}' AND {TAIL} = '{}')",
                        sql_escape(&l.head),
                        sql_escape(&l.tail)
                    )
                })
                .collect();
            let stale = format!(
                "({} OR {}) AND NOT ({})",
                sql_in_list(HEAD, &heads),
                sql_in_list(TAIL, &tails),
                kept.join(" OR ")
            );
            Self::delete_where(&self.series.table, &stale).await?;
            self.put_links(&self.series, &links).await?;
        }
        self.maybe_build_index().await?;
        Ok(memories.iter().map(|m| m.id.clone()).collect())
    }

    async fn query_memories_by_id(&self, ids: &[String]) -> Result<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_memories(sql_in_list("id", ids)).await
    }

    async fn query_memories_by_entities(
        &self,
        entities: &[String],
        limit: usize,
    ) -> Result<HashMap<String, Vec<ScoredMemory>>> {
        let mut queried: Vec<String> = entities.iter().map(|e| normalize_entity(e)).collect();
        queried.retain(|e| !e.is_empty());
        queried.sort();
        queried.dedup();
        if queried.is_empty() {
            return Ok(HashMap::new());
        }

        let mut mentioned: HashMap<String, HashSet<String>> = HashMap::new();
        for link in self.links(&self.mentions, sql_in_list(TAIL, &queried)).await? {
            mentioned.entry(link.head).or_default().insert(link.tail);
        }

        let ids: Vec<String> = mentioned.keys().cloned().collect();
        let memories: HashMap<String, Memory> = self
            .query_memories_by_id(&ids)
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        let mut results = HashMap::new();
        for entity in &queried {
            let mut scored: Vec<(usize, &Memory)> = mentioned
                .iter()
                .filter(|(_, names)| names.contains(entity))
                .filter_map(|(id, names)| memories.get(id).map(|m| (names.len() - 1, m)))
                .collect();

            scored.sort_by(|(da, ma), (db, mb)| {
                db.cmp(da)
                    .then(mb.last_access.cmp(&ma.last_access))
                    .then(ma.id.cmp(&mb.id))
            });
            scored.truncate(limit);

            if !scored.is_empty() {
                results.insert(
                    entity.clone(),
                    scored
                        .into_iter()
                        .map(|(d, m)| ScoredMemory::new(m.clone(), d as f32))
                        .collect(),
                );
            }
        }
        Ok(results)
    }

    async fn query_memories_by_vector(
        &self,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredMemory>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let mut query = self
            .memories
            .query()
            .nearest_to(vector)
            .map_err(|e| storage_err("Failed to create vector query", e))?
            .distance_type(DistanceType::Cosine)
            .only_if("embedding IS NOT NULL")
            .limit(top_k);
        if self.is_indexed() {
            // probe every partition and re-rank the quantized candidates exactly
            query = query
                .nprobes(MAX_PARTITIONS as usize)
                .refine_factor(REFINE_FACTOR);
        }
        let stream = query
            .execute()
            .await
            .map_err(|e| storage_err("Failed to execute search", e))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| storage_err("Failed to collect search results", e))?;

        let mut results = Vec::new();
        for batch in &batches {
            let distances = column::<Float32Array>(batch, "_distance")?;
            for (row, memory) in Self::batch_to_memories(batch)?.into_iter().enumerate() {
                results.push(ScoredMemory::new(memory, 1.0 - distances.value(row)));
            }
        }

        let mut memories: Vec<Memory> = results.iter().map(|r| r.memory.clone()).collect();
        self.attach_entities(&mut memories).await?;
        for (result, memory) in results.iter_mut().zip(memories) {
            result.memory = memory;
        }
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(results)
    }

    async fn connect_memories(&self, ids: &[String]) -> Result<bool> {
        let _guard = self.writes.lock().await;
        let known = self.existing_ids(ids).await?;
        let pairs = unordered_pairs(&known);
        self.bump_pairs(&self.related, &pairs).await?;
        Ok(!pairs.is_empty())
    }

    async fn query_related_memories(&self, id: &str, top_k: usize) -> Result<Vec<ScoredMemory>> {
        let mut links = self.links_touching(&self.related, &[id]).await?;
        links.sort_by(|x, y| y.weight.cmp(&x.weight).then(x.other(id).cmp(y.other(id))));
        links.truncate(top_k);

        let ids: Vec<String> = links.iter().map(|l| l.other(id).to_string()).collect();
        let strengths: HashMap<&str, i64> =
            links.iter().map(|l| (l.other(id), l.weight)).collect();

        Ok(self
            .memories_in_order(&ids)
            .await?
            .into_iter()
            .map(|m| {
                let strength = strengths.get(m.id.as_str()).copied().unwrap_or(0);
                ScoredMemory::new(m, strength as f32)
            })
            .collect())
    }

    async fn update_memory_access(
        &self,
        ids: &[String],
        feedback: FeedbackType,
    ) -> Result<Vec<String>> {
        let _guard = self.writes.lock().await;
        let known = self.existing_ids(ids).await?;
        if known.is_empty() {
            return Ok(known);
        }

        let mut update = self
            .memories
            .update()
            .only_if(sql_in_list("id", &known))
            .column("total_access_count", "total_access_count + 1")
            .column("last_access", format!("{}", now_ms()));
        match feedback {
            FeedbackType::Positive => {
                update = update.column("positive_access_count", "positive_access_count + 1");
            }
            FeedbackType::Negative => {
                update = update.column("negative_access_count", "negative_access_count + 1");
            }
            FeedbackType::Neutral => {}
        }
        update
            .execute()
            .await
            .map_err(|e| storage_err("Failed to update access", e))?;

        Ok(known)
    }

    async fn apply_entity_feedback(
        &self,
        memory_id: &str,
        entities: &[String],
        feedback: FeedbackType,
    ) -> Result<bool> {
        let _guard = self.writes.lock().await;
        if self.existing_ids(&[memory_id.to_string()]).await?.is_empty() {
            return Ok(false);
        }

        let mut names: Vec<String> = entities
            .iter()
            .map(|e| normalize_entity(e))
            .filter(|e| !e.is_empty())
            .collect();
        names.sort();
        names.dedup();
        let current: HashMap<String, i64> = self
            .links(&self.mentions, format!("{HEAD} = '{}'", sql_escape(memory_id)))
            .await?
            .into_iter()
            .map(|l| (l.tail, l.weight))
            .collect();

        match feedback {
            FeedbackType::Neutral => {}
            FeedbackType::Positive => {
                let mut strengthened = Vec::new();
                let mut created = Vec::new();
                for name in &names {
                    match current.get(name) {
                        Some(count) => strengthened.push(Link::new(memory_id, name, count + 1)),
                        None => created.push(name.clone()),
                    }
                }
                let mut edges = strengthened;
                edges.extend(created.iter().map(|n| Link::new(memory_id, n, 1)));
                self.put_links(&self.mentions, &edges).await?;
                self.bump_counters(&self.entities, &created, 1).await?;

                let mut pairs = Vec::new();
                for (i, name) in created.iter().enumerate() {
                    for other in current.keys().chain(&created[..i]) {
                        pairs.push((name.clone(), other.clone()));
                    }
                }
                self.bump_pairs(&self.co_mentions, &pairs).await?;
            }
            FeedbackType::Negative => {
                let weakened: Vec<Link> = names
                    .iter()
                    .filter_map(|n| current.get(n).map(|c| Link::new(memory_id, n, (c - 1).max(1))))
                    .collect();
                self.put_links(&self.mentions, &weakened).await?;
            }
        }
        Ok(true)
    }

    async fn query_memory_series(
        &self,
        origin_id: &str,
        previous_n: usize,
        next_n: usize,
    ) -> Result<Vec<Memory>> {
        if self.existing_ids(&[origin_id.to_string()]).await?.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen: HashSet<String> = HashSet::from([origin_id.to_string()]);

        let mut before = Vec::new();
        let mut cursor = origin_id.to_string();
        while before.len() < previous_n {
            let prev = self
                .links(&self.series, format!("{TAIL} = '{}'", sql_escape(&cursor)))
                .await?;
            let Some(link) = prev.into_iter().next() else {
                break;
            };
            if !seen.insert(link.head.clone()) {
                break;
            }
            before.push(link.head.clone());
            cursor = link.head;
        }
        before.reverse();

        let mut after = Vec::new();
        let mut cursor = origin_id.to_string();
        while after.len() < next_n {
            let next = self
                .links(&self.series, format!("{HEAD} = '{}'", sql_escape(&cursor)))
                .await?;
            let Some(link) = next.into_iter().next() else {
                break;
            };
            if !seen.insert(link.tail.clone()) {
                break;
            }
            after.push(link.tail.clone());
            cursor = link.tail;
        }

        let mut window = before;
        window.push(origin_id.to_string());
        window.extend(after);
        self.memories_in_order(&window).await
    }

    async fn deep_relationship_traversal(
        &self,
        origin_id: &str,
        max_depth: usize,
        stop_k: usize,
        blacklist: &[String],
    ) -> Result<Vec<ScoredMemory>> {
        if stop_k == 0 || self.existing_ids(&[origin_id.to_string()]).await?.is_empty() {
            return Ok(Vec::new());
        }

        let blocked: HashSet<NodeRef> = blacklist.iter().cloned().map(NodeRef::Memory).collect();
        let origin = NodeRef::Memory(origin_id.to_string());
        let mut visited: HashSet<NodeRef> = HashSet::from([origin.clone()]);
        let mut frontier = vec![origin];
        let mut found: Vec<(String, usize)> = Vec::new();

        'levels: for depth in 1..=max_depth {
            let mut next_level = Vec::new();
            for node in self.expand(&frontier).await? {
                if blocked.contains(&node) || !visited.insert(node.clone()) {
                    continue;
                }
                if let NodeRef::Memory(id) = &node {
                    found.push((id.clone(), depth));
                    if found.len() >= stop_k {
                        break 'levels;
                    }
                }
                next_level.push(node);
            }
            if next_level.is_empty() {
                break;
            }
            frontier = next_level;
        }

        let depths: HashMap<String, usize> = found.iter().cloned().collect();
        let ids: Vec<String> = found.into_iter().map(|(id, _)| id).collect();
        Ok(self
            .memories_in_order(&ids)
            .await?
            .into_iter()
            .map(|m| {
                let depth = depths.get(&m.id).copied().unwrap_or(max_depth);
                ScoredMemory::new(m, traversal_score(depth))
            })
            .collect())
    }

    async fn get_entity(&self, name: &str) -> Result<Option<EntityRecord>> {
        let name = normalize_entity(name);
        let counts = self.counters(&self.entities, &[name.as_str()]).await?;
        let Some(&mention_count) = counts.get(&name) else {
            return Ok(None);
        };

        let mut co_mentions: Vec<(String, u64)> = self
            .links_touching(&self.co_mentions, &[name.as_str()])
            .await?
            .iter()
            .map(|l| (l.other(&name).to_string(), l.weight.max(0) as u64))
            .collect();
        co_mentions.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        Ok(Some(EntityRecord {
            name,
            mention_count: mention_count.max(0) as u64,
            co_mentions,
        }))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let memories = self
            .counters(&self.storage, &[MEMORY_COUNT_KEY])
            .await?
            .get(MEMORY_COUNT_KEY)
            .copied()
            .unwrap_or(0);

        Ok(StoreStats {
            memories: memories.max(0) as u64,
            entities: count_rows(&self.entities).await? as u64,
            sources: count_rows(&self.sources).await? as u64,
            authors: count_rows(&self.authors).await? as u64,
        })
    }
}
