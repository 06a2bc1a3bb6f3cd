//! Property-based tests for the chunk generator.
//!
//! Covers chunk counts, per-space index contiguity, item conservation,
//! aggregate counts, and null-space skipping.

use std::collections::{BTreeMap, HashSet};

use proptest::prelude::*;

use usage_ledger_core::active_resources::{ActiveResourceRow, ProcessUsageItem, UsageItem};
use usage_ledger_core::chunk_generator::{ChunkGenerator, PendingChunk};

// =============================================================================
// Strategies
// =============================================================================

/// Per-space row counts for up to 5 spaces.
fn arb_space_sizes() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0usize..160, 1..5)
}

fn arb_chunk_limit() -> impl Strategy<Value = usize> {
    prop_oneof![Just(50usize), 1usize..20]
}

fn row(space: Option<usize>, id: i64, app: usize, instances: i64) -> ActiveResourceRow {
    let space_guid = space.map(|s| format!("space-{s:02}"));
    ActiveResourceRow {
        resource_id: id,
        resource_guid: format!("proc-{id}"),
        parent_guid: Some(format!("app-{app}")),
        space_guid: space_guid.clone(),
        space_name: space_guid,
        organization_guid: space.map(|s| format!("org-{}", s % 2)),
        organization_name: None,
        instance_count: instances,
        item: UsageItem::Process(ProcessUsageItem {
            app_guid: format!("app-{app}"),
            app_name: "app".to_string(),
            process_guid: format!("proc-{id}"),
            process_type: "web".to_string(),
            instance_count: Some(instances),
            memory_in_mb_per_instance: Some(128),
            buildpack_guid: None,
            buildpack_name: None,
        }),
    }
}

/// Rows ordered by (space, id), as the active-resource sources deliver them.
fn ordered_rows(sizes: &[usize]) -> Vec<ActiveResourceRow> {
    let mut rows = Vec::new();
    let mut id = 0i64;
    for (space, &count) in sizes.iter().enumerate() {
        for n in 0..count {
            id += 1;
            rows.push(row(Some(space), id, n % 4, 1 + (n as i64 % 3)));
        }
    }
    rows
}

fn generate(rows: Vec<ActiveResourceRow>, limit: usize, batch: usize) -> (Vec<PendingChunk>, usage_ledger_core::chunk_generator::GenerationTotals) {
    let mut sink: Vec<PendingChunk> = Vec::new();
    let mut generator = ChunkGenerator::new(&mut sink, limit, batch);
    for r in rows {
        generator.push(r).unwrap();
    }
    let totals = generator.finish().unwrap();
    (sink, totals)
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn chunk_count_is_ceiling_per_space(sizes in arb_space_sizes(), limit in arb_chunk_limit(), batch in 1usize..10) {
        let (chunks, totals) = generate(ordered_rows(&sizes), limit, batch);
        let expected: usize = sizes.iter().map(|n| n.div_ceil(limit)).sum();
        prop_assert_eq!(chunks.len(), expected);
        prop_assert_eq!(totals.chunk_count, expected as u64);
    }

    #[test]
    fn indices_are_contiguous_and_only_last_is_short(sizes in arb_space_sizes(), limit in arb_chunk_limit()) {
        let (chunks, _) = generate(ordered_rows(&sizes), limit, 1000);
        let mut per_space: BTreeMap<String, Vec<&PendingChunk>> = BTreeMap::new();
        for chunk in &chunks {
            per_space.entry(chunk.space_guid.clone()).or_default().push(chunk);
        }
        for (_, space_chunks) in per_space {
            let indices: Vec<i64> = space_chunks.iter().map(|c| c.chunk_index).collect();
            let expected: Vec<i64> = (0..space_chunks.len() as i64).collect();
            prop_assert_eq!(indices, expected);
            for chunk in &space_chunks[..space_chunks.len() - 1] {
                prop_assert_eq!(chunk.item_count, limit);
            }
            let last = space_chunks[space_chunks.len() - 1];
            prop_assert!(last.item_count >= 1 && last.item_count <= limit);
        }
    }

    #[test]
    fn every_item_lands_in_exactly_one_chunk(sizes in arb_space_sizes(), limit in arb_chunk_limit()) {
        let rows = ordered_rows(&sizes);
        let expected: Vec<String> = rows.iter().map(|r| r.resource_guid.clone()).collect();
        let (chunks, totals) = generate(rows, limit, 3);

        let mut seen = Vec::new();
        for chunk in &chunks {
            let items: Vec<UsageItem> = serde_json::from_str(&chunk.items).unwrap();
            prop_assert_eq!(items.len(), chunk.item_count);
            for item in items {
                let UsageItem::Process(p) = item else {
                    return Err(TestCaseError::fail("expected process item"));
                };
                seen.push(p.process_guid);
            }
        }
        prop_assert_eq!(seen, expected);
        prop_assert_eq!(totals.resource_count, sizes.iter().sum::<usize>() as u64);
    }

    #[test]
    fn aggregates_match_distinct_keys(sizes in arb_space_sizes()) {
        let rows = ordered_rows(&sizes);
        let spaces: HashSet<_> = rows.iter().filter_map(|r| r.space_guid.clone()).collect();
        let orgs: HashSet<_> = rows.iter().filter_map(|r| r.organization_guid.clone()).collect();
        let apps: HashSet<_> = rows.iter().filter_map(|r| r.parent_guid.clone()).collect();
        let instances: i64 = rows.iter().map(|r| r.instance_count).sum();

        let (_, totals) = generate(rows, 50, 1000);
        prop_assert_eq!(totals.space_count, spaces.len() as u64);
        prop_assert_eq!(totals.organization_count, orgs.len() as u64);
        prop_assert_eq!(totals.parent_count, apps.len() as u64);
        prop_assert_eq!(totals.instance_count, instances);
    }

    #[test]
    fn null_space_rows_are_ignored(sizes in arb_space_sizes(), nulls in 1usize..20) {
        let mut rows: Vec<ActiveResourceRow> = (0..nulls)
            .map(|n| row(None, -(n as i64) - 1, 99, 5))
            .collect();
        rows.extend(ordered_rows(&sizes));

        let (with_nulls_chunks, with_nulls) = generate(rows, 50, 1000);
        let (plain_chunks, plain) = generate(ordered_rows(&sizes), 50, 1000);

        prop_assert_eq!(with_nulls.skipped_rows, nulls as u64);
        prop_assert_eq!(with_nulls.resource_count, plain.resource_count);
        prop_assert_eq!(with_nulls.instance_count, plain.instance_count);
        prop_assert_eq!(with_nulls.parent_count, plain.parent_count);
        prop_assert_eq!(with_nulls_chunks, plain_chunks);
    }
}
