//! `heapgraph mark`

use super::progress::BarListener;
use anyhow::{Context, Result};
use heapgraph::config::ParserConfig;
use heapgraph::{mark_gc_roots, CancellationToken, HeapIndex, MarkOptions, Monitor};
use serde::Serialize;
use std::path::Path;
use std::time::Instant;

#[derive(Serialize)]
struct MarkSummary {
    objects: usize,
    gc_roots: usize,
    reachable: usize,
    unreachable: usize,
    threads: usize,
    elapsed_ms: u128,
}

pub fn run(prefix: &Path, config: &ParserConfig, json: bool) -> Result<()> {
    let index = HeapIndex::open(prefix)
        .with_context(|| format!("Failed to open index {}", prefix.display()))?;
    let options = MarkOptions::from(&config.marker);
    let listener = BarListener::new();
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let bits = mark_gc_roots(&index, &options, Monitor::new(&listener, &cancel))?;
    let reachable = bits.count_marked();
    let summary = MarkSummary {
        objects: index.object_count(),
        gc_roots: index.gc_root_ids().len(),
        reachable,
        unreachable: index.object_count() - reachable,
        threads: options.threads,
        elapsed_ms: started.elapsed().as_millis(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{} of {} objects reachable from {} GC roots, {} unreachable ({} ms, {} threads)",
            summary.reachable,
            summary.objects,
            summary.gc_roots,
            summary.unreachable,
            summary.elapsed_ms,
            summary.threads.max(1)
        );
    }
    Ok(())
}
