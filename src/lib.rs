//! heapgraph - HPROF heap dump indexing and reachability marking
//!
//! Parses a JVM heap dump in two passes into dense object ids, class
//! records, GC roots and an outbound reference index, persists everything
//! next to the dump, and marks objects reachable from a root set.
//!
//! ```no_run
//! use heapgraph::{build_index, mark_gc_roots, CancellationToken, LogListener, MarkOptions, Monitor, ParserConfig};
//!
//! let cancel = CancellationToken::new();
//! let (index, report) = build_index("heap.hprof".as_ref(), &ParserConfig::default(), &LogListener, &cancel)?;
//! for warning in report.warnings() {
//!     eprintln!("{}", warning.text);
//! }
//! let live = mark_gc_roots(&index, &MarkOptions::default(), Monitor::new(&LogListener, &cancel))?;
//! println!("{} live objects", live.count_marked());
//! # Ok::<(), heapgraph::HeapError>(())
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod hprof;
pub mod index;
pub mod marker;
pub mod model;
pub mod progress;
pub mod snapshot;

pub use builder::{build_index, build_index_with, BuildReport};
pub use config::{MarkerConfig, ParserConfig, Strictness};
pub use error::{DumpDescriptor, FormatViolation, HeapError, HeapResult};
pub use index::{Adjacency, AdjacencyList, IndexStorage};
pub use marker::{mark_gc_roots, ExcludedReferences, MarkOptions, ObjectMarker, ReachabilitySet};
pub use model::{ObjectId, NamedReference};
pub use progress::{CancellationToken, LogListener, Monitor, NullListener, ProgressListener, Severity};
pub use snapshot::{HeapIndex, SnapshotInfo};
