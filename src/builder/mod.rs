//! Index builder: consumes pass 1 events, finalizes the id space and runs pass 2
//!
//! ```text
//! pass 1 (hprof::pass1)   -> IndexBuilder      addresses, classes, roots
//! finalize                -> FinalizedBuild    sorted ids, sizes, fake classes
//! pass 2 (hprof::pass2)   -> FinalizedBuild    outbound lists, object -> class
//! commit                  -> HeapIndex         index files renamed into place
//! ```

pub mod finalize;
pub mod layout;

pub use finalize::FinalizedBuild;
pub use layout::HeapLayout;

use crate::config::ParserConfig;
use crate::hprof::pass1::{Pass1Handler, Pass1Parser};
use crate::hprof::pass2::Pass2Parser;
use crate::hprof::strictness::Policy;
use crate::hprof::threads::threads_report_path;
use crate::index::{default_prefix, AddressKeyed, IdentifierBuilder, IndexStorage, PendingFiles};
use crate::model::{ClassRecord, FieldType, RawGcRoot};
use crate::progress::{BuildMessage, CancellationToken, MessageLog, ProgressListener};
use crate::snapshot::HeapIndex;
use crate::HeapResult;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

/// Pass 1 state, keyed by address until identifiers are frozen
#[derive(Debug)]
pub struct IndexBuilder {
    pub(crate) id_size: usize,
    pub(crate) ref_size: usize,
    pub(crate) creation_ms: Option<i64>,
    pub(crate) identifiers: IdentifierBuilder,
    pub(crate) classes: AddressKeyed<ClassRecord>,
    pub(crate) classes_by_name: FxHashMap<String, Vec<u64>>,
    pub(crate) gc_roots: AddressKeyed<Vec<RawGcRoot>>,
    /// thread address -> object address -> roots
    pub(crate) thread_locals: AddressKeyed<AddressKeyed<Vec<RawGcRoot>>>,
    pub(crate) required_array_classes: BTreeSet<u64>,
    pub(crate) required_primitive_arrays: BTreeSet<u8>,
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self {
            id_size: 8,
            ref_size: 8,
            creation_ms: None,
            identifiers: IdentifierBuilder::new(),
            classes: AddressKeyed::new(),
            classes_by_name: FxHashMap::default(),
            gc_roots: AddressKeyed::new(),
            thread_locals: AddressKeyed::new(),
            required_array_classes: BTreeSet::new(),
            required_primitive_arrays: BTreeSet::new(),
        }
    }

    pub fn object_count(&self) -> usize {
        self.identifiers.len()
    }

    pub(crate) fn register_class(&mut self, class: ClassRecord) {
        let position = class.file_position.unwrap_or(0);
        self.identifiers.add(class.address, position);
        self.classes_by_name
            .entry(class.name.clone())
            .or_default()
            .push(class.address);
        self.classes.insert(class.address, class);
    }

    pub(crate) fn class_named(&self, name: &str) -> Option<&[u64]> {
        self.classes_by_name.get(name).map(Vec::as_slice)
    }
}

impl Pass1Handler for IndexBuilder {
    fn set_identifier_size(&mut self, id_size: usize) {
        self.id_size = id_size;
        self.ref_size = id_size;
    }

    fn set_reference_size(&mut self, ref_size: usize) {
        self.ref_size = ref_size;
    }

    fn set_creation_date(&mut self, millis: i64) {
        self.creation_ms = Some(millis);
    }

    fn add_gc_root(&mut self, root: RawGcRoot) {
        if root.context_address != 0 {
            // thread locals are roots only while their thread is alive
            self.thread_locals
                .entry_or_default(root.context_address)
                .entry_or_default(root.address)
                .push(root);
            return;
        }
        self.gc_roots.entry_or_default(root.address).push(root);
    }

    fn add_class(&mut self, class: ClassRecord) {
        self.register_class(class);
    }

    fn report_instance(&mut self, address: u64, position: u64) {
        self.identifiers.add(address, position);
    }

    fn has_class(&self, address: u64) -> bool {
        self.classes.contains(address)
    }

    fn has_class_named(&self, name: &str) -> bool {
        self.classes_by_name.contains_key(name)
    }

    fn report_required_object_array(&mut self, class_address: u64) {
        self.required_array_classes.insert(class_address);
    }

    fn report_required_primitive_array(&mut self, element_type: FieldType) {
        self.required_primitive_arrays.insert(element_type.tag());
    }
}

/// Outcome of a successful build besides the index itself
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// Info and warning messages, in emission order
    pub messages: Vec<BuildMessage>,
    pub object_count: usize,
    pub dump_count: usize,
    /// Index files written, empty for in-memory builds
    pub files: Vec<PathBuf>,
    pub threads_report: Option<PathBuf>,
}

impl BuildReport {
    pub fn warnings(&self) -> impl Iterator<Item = &BuildMessage> {
        self.messages
            .iter()
            .filter(|m| m.severity == crate::progress::Severity::Warning)
    }
}

/// Build the index of `dump` next to it, named `<dump stem>.<suffix>`
pub fn build_index(
    dump: &Path,
    config: &ParserConfig,
    listener: &dyn ProgressListener,
    cancel: &CancellationToken,
) -> HeapResult<(HeapIndex, BuildReport)> {
    let storage = IndexStorage::Disk {
        prefix: default_prefix(dump),
    };
    build_index_with(dump, config, storage, listener, cancel)
}

/// Build the index of `dump` into `storage`.
///
/// Nothing is left on disk unless the whole build succeeds.
pub fn build_index_with(
    dump: &Path,
    config: &ParserConfig,
    storage: IndexStorage,
    listener: &dyn ProgressListener,
    cancel: &CancellationToken,
) -> HeapResult<(HeapIndex, BuildReport)> {
    let started = Instant::now();
    let log = MessageLog::new();
    let policy = Policy::new(config.strictness, listener, &log);
    let mut pending = PendingFiles::new();

    let file_size = std::fs::metadata(dump)?.len();
    info!(
        "Indexing {} ({} bytes, strictness {})",
        dump.display(),
        file_size,
        config.strictness
    );

    let mut builder = IndexBuilder::new();
    let outcome = Pass1Parser::new(&mut builder, &policy, listener, cancel).read(
        File::open(dump)?,
        file_size,
        config.dump_index,
    )?;
    cancel.check()?;

    let threads_report = match &storage {
        IndexStorage::Disk { prefix } if config.write_threads_report && outcome.threads.has_stacks() => {
            let target = threads_report_path(prefix);
            let tmp = pending.stage(target.clone());
            match outcome.threads.write_report(&tmp) {
                Ok(()) => {
                    policy.info(format!("Wrote threads call stacks to {}", target.display()));
                    Some(target)
                }
                Err(e) => {
                    pending.discard(&target);
                    policy.warn(format!("Error writing threads information: {}", e));
                    None
                }
            }
        }
        _ => None,
    };
    drop(outcome.threads);

    let mut finalized = builder.finalize(&policy, &storage, &mut pending)?;
    policy.info(format!(
        "Heap {} contains {} objects",
        dump.display(),
        finalized.object_count()
    ));
    cancel.check()?;

    Pass2Parser::new(&mut finalized, &policy, listener, cancel).read(File::open(dump)?)?;
    cancel.check()?;

    let info = finalized.snapshot_info(dump, &storage, config.dump_index, outcome.dump_count, &outcome.header);
    let index = finalized.commit(info, &storage, &mut pending)?;
    let files = pending.commit()?;

    info!(
        "Indexed {} objects in {:.2?}",
        index.object_count(),
        started.elapsed()
    );

    let report = BuildReport {
        messages: log.into_messages(),
        object_count: index.object_count(),
        dump_count: outcome.dump_count,
        files,
        threads_report,
    };
    Ok((index, report))
}
