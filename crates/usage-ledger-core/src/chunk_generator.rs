//! Single-pass chunking of an ordered active-resource stream.
//!
//! Rows arrive ordered by `(space_guid, resource_id)`. The generator holds at
//! most one in-progress chunk plus a bounded buffer of finished chunks that
//! are handed to a [`ChunkSink`] in batches. Aggregates are tracked as a side
//! effect of the same pass.
//!
//! ```text
//! row ──► same space? ──no──► flush current, index = 0
//!              │
//!              ▼
//!         append item ──► len == limit? ──yes──► flush, index += 1
//!
//! flush ──► pending buffer ──► len >= insert batch? ──yes──► sink.insert_chunks
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::active_resources::{ActiveResourceRow, UsageItem};
use crate::error::Result;

/// Maximum items per chunk.
pub const CHUNK_LIMIT: usize = 50;

/// Finished chunks buffered before a bulk insert.
pub const INSERT_BATCH_SIZE: usize = 1000;

/// A finished chunk waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChunk {
    pub organization_guid: String,
    pub organization_name: Option<String>,
    pub space_guid: String,
    pub space_name: Option<String>,
    pub chunk_index: i64,
    pub item_count: usize,
    /// JSON array of [`UsageItem`] records, in stream order.
    pub items: String,
}

/// Destination for bulk chunk inserts.
pub trait ChunkSink {
    fn insert_chunks(&mut self, chunks: &[PendingChunk]) -> Result<()>;
}

impl ChunkSink for Vec<PendingChunk> {
    fn insert_chunks(&mut self, chunks: &[PendingChunk]) -> Result<()> {
        self.extend_from_slice(chunks);
        Ok(())
    }
}

/// Aggregates produced by one generation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTotals {
    /// Sum of per-row instance contributions.
    pub instance_count: i64,
    /// Rows that landed in a chunk.
    pub resource_count: u64,
    pub chunk_count: u64,
    pub organization_count: u64,
    pub space_count: u64,
    /// Distinct parents (apps), zero for sources without parents.
    pub parent_count: u64,
    /// Rows dropped for having no space or no organization.
    pub skipped_rows: u64,
}

#[derive(Debug)]
struct CurrentSpace {
    space_guid: String,
    space_name: Option<String>,
    organization_guid: String,
    organization_name: Option<String>,
    chunk_index: i64,
    items: Vec<UsageItem>,
}

/// Accumulator for one generation run.
#[derive(Debug)]
pub struct ChunkGenerator<'s, S: ChunkSink> {
    sink: &'s mut S,
    chunk_limit: usize,
    insert_batch_size: usize,

    instance_count: i64,
    resource_count: u64,
    chunk_count: u64,
    skipped_rows: u64,
    organization_guids: HashSet<String>,
    space_guids: HashSet<String>,
    parent_guids: HashSet<String>,

    current: Option<CurrentSpace>,
    pending: Vec<PendingChunk>,
}

impl<'s, S: ChunkSink> ChunkGenerator<'s, S> {
    pub fn new(sink: &'s mut S, chunk_limit: usize, insert_batch_size: usize) -> Self {
        Self {
            sink,
            chunk_limit: chunk_limit.max(1),
            insert_batch_size: insert_batch_size.max(1),
            instance_count: 0,
            resource_count: 0,
            chunk_count: 0,
            skipped_rows: 0,
            organization_guids: HashSet::new(),
            space_guids: HashSet::new(),
            parent_guids: HashSet::new(),
            current: None,
            pending: Vec::new(),
        }
    }

    /// Feed the next row of the ordered stream.
    pub fn push(&mut self, row: ActiveResourceRow) -> Result<()> {
        let (Some(space_guid), Some(organization_guid)) = (row.space_guid, row.organization_guid) else {
            self.skipped_rows += 1;
            return Ok(());
        };

        let same_space = self
            .current
            .as_ref()
            .is_some_and(|c| c.space_guid == space_guid);
        if !same_space {
            self.flush_current()?;
            self.current = Some(CurrentSpace {
                space_guid: space_guid.clone(),
                space_name: row.space_name,
                organization_guid: organization_guid.clone(),
                organization_name: row.organization_name,
                chunk_index: 0,
                items: Vec::with_capacity(self.chunk_limit),
            });
        }

        self.organization_guids.insert(organization_guid);
        self.space_guids.insert(space_guid);
        if let Some(parent) = row.parent_guid {
            self.parent_guids.insert(parent);
        }
        self.instance_count += row.instance_count;
        self.resource_count += 1;

        let full = match self.current.as_mut() {
            Some(current) => {
                current.items.push(row.item);
                current.items.len() >= self.chunk_limit
            }
            None => false,
        };
        if full {
            self.flush_current()?;
            if let Some(current) = self.current.as_mut() {
                current.chunk_index += 1;
            }
        }
        Ok(())
    }

    /// Flush everything still buffered and return the aggregates.
    pub fn finish(mut self) -> Result<GenerationTotals> {
        self.flush_current()?;
        self.flush_pending()?;
        Ok(GenerationTotals {
            instance_count: self.instance_count,
            resource_count: self.resource_count,
            chunk_count: self.chunk_count,
            organization_count: self.organization_guids.len() as u64,
            space_count: self.space_guids.len() as u64,
            parent_count: self.parent_guids.len() as u64,
            skipped_rows: self.skipped_rows,
        })
    }

    fn flush_current(&mut self) -> Result<()> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        if current.items.is_empty() {
            return Ok(());
        }

        let items = std::mem::take(&mut current.items);
        let chunk = PendingChunk {
            organization_guid: current.organization_guid.clone(),
            organization_name: current.organization_name.clone(),
            space_guid: current.space_guid.clone(),
            space_name: current.space_name.clone(),
            chunk_index: current.chunk_index,
            item_count: items.len(),
            items: serde_json::to_string(&items)?,
        };
        self.pending.push(chunk);
        self.chunk_count += 1;

        if self.pending.len() >= self.insert_batch_size {
            self.flush_pending()?;
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.sink.insert_chunks(&self.pending)?;
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active_resources::ProcessUsageItem;

    fn row(space: Option<&str>, app: &str, id: i64) -> ActiveResourceRow {
        ActiveResourceRow {
            resource_id: id,
            resource_guid: format!("proc-{id}"),
            parent_guid: Some(app.to_string()),
            space_guid: space.map(str::to_string),
            space_name: space.map(|s| format!("{s}-name")),
            organization_guid: Some("org-1".to_string()),
            organization_name: Some("org-1-name".to_string()),
            instance_count: 2,
            item: UsageItem::Process(ProcessUsageItem {
                app_guid: app.to_string(),
                app_name: format!("{app}-name"),
                process_guid: format!("proc-{id}"),
                process_type: "web".to_string(),
                instance_count: Some(2),
                memory_in_mb_per_instance: Some(128),
                buildpack_guid: None,
                buildpack_name: None,
            }),
        }
    }

    fn run(rows: Vec<ActiveResourceRow>, limit: usize, batch: usize) -> (GenerationTotals, Vec<PendingChunk>) {
        let mut sink = Vec::new();
        let mut generator = ChunkGenerator::new(&mut sink, limit, batch);
        for r in rows {
            generator.push(r).unwrap();
        }
        let totals = generator.finish().unwrap();
        (totals, sink)
    }

    #[test]
    fn empty_stream_produces_nothing() {
        let (totals, chunks) = run(Vec::new(), CHUNK_LIMIT, INSERT_BATCH_SIZE);
        assert_eq!(totals, GenerationTotals::default());
        assert!(chunks.is_empty());
    }

    #[test]
    fn fifty_one_rows_make_two_chunks() {
        let rows = (0..51).map(|i| row(Some("S1"), &format!("app-{}", i % 7), i)).collect();
        let (totals, chunks) = run(rows, CHUNK_LIMIT, INSERT_BATCH_SIZE);

        assert_eq!(totals.chunk_count, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].item_count, 50);
        assert_eq!(chunks[1].chunk_index, 1);
        assert_eq!(chunks[1].item_count, 1);
        assert_eq!(totals.parent_count, 7);
        assert_eq!(totals.instance_count, 102);
        assert_eq!(totals.space_count, 1);
        assert_eq!(totals.organization_count, 1);
    }

    #[test]
    fn exact_multiple_has_no_trailing_chunk() {
        let rows = (0..100).map(|i| row(Some("S1"), "app", i)).collect();
        let (totals, chunks) = run(rows, CHUNK_LIMIT, INSERT_BATCH_SIZE);
        assert_eq!(totals.chunk_count, 2);
        assert!(chunks.iter().all(|c| c.item_count == 50));
    }

    #[test]
    fn space_change_resets_index() {
        let mut rows: Vec<_> = (0..3).map(|i| row(Some("A"), "app-a", i)).collect();
        rows.extend((3..5).map(|i| row(Some("B"), "app-b", i)));
        let (_, chunks) = run(rows, 2, INSERT_BATCH_SIZE);

        let keys: Vec<(&str, i64, usize)> = chunks
            .iter()
            .map(|c| (c.space_guid.as_str(), c.chunk_index, c.item_count))
            .collect();
        assert_eq!(keys, [("A", 0, 2), ("A", 1, 1), ("B", 0, 2)]);
    }

    #[test]
    fn null_space_rows_are_skipped_entirely() {
        let rows = vec![
            row(None, "ghost-app", 1),
            row(Some("S1"), "app", 2),
            row(None, "ghost-app", 3),
        ];
        let (totals, chunks) = run(rows, CHUNK_LIMIT, INSERT_BATCH_SIZE);
        assert_eq!(totals.resource_count, 1);
        assert_eq!(totals.parent_count, 1);
        assert_eq!(totals.instance_count, 2);
        assert_eq!(totals.skipped_rows, 2);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn rows_without_an_organization_are_skipped() {
        let mut orphan = row(Some("S1"), "orphan-app", 1);
        orphan.organization_guid = None;
        let rows = vec![orphan, row(Some("S1"), "app", 2)];

        let (totals, chunks) = run(rows, CHUNK_LIMIT, INSERT_BATCH_SIZE);
        assert_eq!(totals.skipped_rows, 1);
        assert_eq!(totals.resource_count, 1);
        assert_eq!(totals.parent_count, 1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].organization_guid, "org-1");
        assert_eq!(chunks[0].item_count, 1);
    }

    #[test]
    fn pending_buffer_flushes_in_batches() {
        struct CountingSink {
            calls: Vec<usize>,
        }
        impl ChunkSink for CountingSink {
            fn insert_chunks(&mut self, chunks: &[PendingChunk]) -> Result<()> {
                self.calls.push(chunks.len());
                Ok(())
            }
        }

        let mut sink = CountingSink { calls: Vec::new() };
        let mut generator = ChunkGenerator::new(&mut sink, 1, 3);
        for i in 0..7 {
            generator.push(row(Some("S1"), "app", i)).unwrap();
        }
        let totals = generator.finish().unwrap();
        assert_eq!(totals.chunk_count, 7);
        assert_eq!(sink.calls, vec![3, 3, 1]);
    }

    #[test]
    fn items_serialize_as_flat_records() {
        let (_, chunks) = run(vec![row(Some("S1"), "app-1", 9)], CHUNK_LIMIT, INSERT_BATCH_SIZE);
        let items: Vec<serde_json::Value> = serde_json::from_str(&chunks[0].items).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["process_guid"], "proc-9");
        assert_eq!(items[0]["memory_in_mb_per_instance"], 128);
        assert_eq!(chunks[0].organization_guid, "org-1");
        assert_eq!(chunks[0].space_name.as_deref(), Some("S1-name"));
    }

    #[test]
    fn sink_error_propagates() {
        struct FailingSink;
        impl ChunkSink for FailingSink {
            fn insert_chunks(&mut self, _chunks: &[PendingChunk]) -> Result<()> {
                Err(crate::Error::Runtime("disk full".to_string()))
            }
        }

        let mut sink = FailingSink;
        let mut generator = ChunkGenerator::new(&mut sink, 1, 1);
        assert!(generator.push(row(Some("S1"), "app", 1)).is_err());
    }
}
