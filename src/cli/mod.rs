//! CLI command definitions and handlers

mod index;
mod mark;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use heapgraph::config::{load_config, ParserConfig};
use heapgraph::Strictness;
use std::path::{Path, PathBuf};

/// Parse and validate a marker thread count (0-256)
fn parse_threads(s: &str) -> Result<usize, String> {
    let n: usize = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", s))?;
    if n > 256 {
        Err("threads cannot exceed 256".to_string())
    } else {
        Ok(n)
    }
}

/// heapgraph - index HPROF heap dumps and mark reachable objects
#[derive(Parser, Debug)]
#[command(name = "heapgraph")]
#[command(
    version,
    about = "Index HPROF heap dumps into a persisted object graph and mark reachable objects",
    after_help = "\
Examples:
  heapgraph index app.hprof                     Build app.*.index next to the dump
  heapgraph index app.hprof --strictness warn   Continue past recoverable format errors
  heapgraph index multi.hprof --dump 1          Index the second dump of a multi-dump file
  heapgraph mark app.                           Count objects reachable from GC roots"
)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", value_parser = ["error", "warn", "info", "debug", "trace"])]
    pub log_level: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse a heap dump and persist its index files
    Index {
        /// Path to the .hprof file
        dump: PathBuf,

        /// Handling of recoverable format errors: stop, warn, permissive
        #[arg(long, env = "HEAPGRAPH_STRICTNESS")]
        strictness: Option<Strictness>,

        /// Dump to index in a file with several heap dumps (0-based)
        #[arg(long = "dump")]
        dump_index: Option<usize>,

        /// Index file prefix (default: dump path without extension plus '.')
        #[arg(long)]
        prefix: Option<PathBuf>,

        /// Skip the <prefix>threads stack report
        #[arg(long)]
        no_threads_report: bool,
    },

    /// Mark objects reachable from the GC roots of an existing index
    Mark {
        /// Index prefix, e.g. 'app.' for app.idx.index
        prefix: PathBuf,

        /// Marker threads (0 or 1 = single-threaded; default: configured or all cores)
        #[arg(long, value_parser = parse_threads)]
        threads: Option<usize>,

        /// Keep each marker thread within an id window sized from free memory
        #[arg(long)]
        locality: bool,
    },
}

/// Configuration from the directory holding `path`
fn config_near(path: &Path) -> ParserConfig {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    load_config(dir)
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Index {
            dump,
            strictness,
            dump_index,
            prefix,
            no_threads_report,
        } => {
            let mut config = config_near(&dump);
            if let Some(strictness) = strictness {
                config.strictness = strictness;
            }
            if dump_index.is_some() {
                config.dump_index = dump_index;
            }
            if no_threads_report {
                config.write_threads_report = false;
            }
            index::run(&dump, prefix, &config, cli.json)
        }
        Commands::Mark {
            prefix,
            threads,
            locality,
        } => {
            let mut config = config_near(&prefix);
            if threads.is_some() {
                config.marker.threads = threads;
            }
            if locality {
                config.marker.locality = true;
            }
            mark::run(&prefix, &config, cli.json)
        }
    }
}
