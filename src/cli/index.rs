//! `heapgraph index`

use super::progress::BarListener;
use anyhow::{Context, Result};
use heapgraph::config::ParserConfig;
use heapgraph::index::default_prefix;
use heapgraph::{build_index_with, CancellationToken, HeapError, IndexStorage};
use std::path::{Path, PathBuf};

pub fn run(dump: &Path, prefix: Option<PathBuf>, config: &ParserConfig, json: bool) -> Result<()> {
    let prefix = prefix.unwrap_or_else(|| default_prefix(dump));
    let listener = BarListener::new();
    let cancel = CancellationToken::new();

    let (index, report) = match build_index_with(
        dump,
        config,
        IndexStorage::Disk { prefix },
        &listener,
        &cancel,
    ) {
        Ok(built) => built,
        Err(HeapError::MultipleDumps(dumps)) => {
            eprintln!("{} contains {} heap dumps:", dump.display(), dumps.len());
            for d in &dumps {
                eprintln!("  {}  {}", d.runtime_id(), d.description);
            }
            anyhow::bail!("select a dump with --dump <index>");
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to index {}", dump.display())),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(index.info())?);
        return Ok(());
    }

    let warnings = report.warnings().count();
    println!(
        "Indexed {} objects ({} classes, {} GC roots) from {}",
        report.object_count,
        index.classes().count(),
        index.gc_root_ids().len(),
        dump.display()
    );
    for file in &report.files {
        println!("  {}", file.display());
    }
    if let Some(threads) = &report.threads_report {
        println!("Thread stacks: {}", threads.display());
    }
    if warnings > 0 {
        println!("{} warning(s):", warnings);
        for warning in report.warnings() {
            println!("  {}", warning.text);
        }
    }
    Ok(())
}
