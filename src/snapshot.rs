//! The built, read-only heap index

use crate::builder::HeapLayout;
use crate::hprof::object_reader::ObjectReader;
use crate::index::{
    decode_size, index_path, prefixed_path, Adjacency, IdKeyed, IndexKind, IntIndex, LongIndex,
    One2ManyIndex, META_SUFFIX,
};
use crate::model::{ClassRecord, GcRootInfo, NamedReference, ObjectId};
use crate::{HeapError, HeapResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Facts about the dump an index was built from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    /// Index file prefix; `None` for in-memory indices
    pub prefix: Option<PathBuf>,
    pub version: String,
    pub id_size: usize,
    pub ref_size: usize,
    pub compressed_refs: bool,
    pub object_align: u64,
    pub creation_ms: Option<i64>,
    pub object_count: usize,
    pub dump_index: Option<usize>,
    pub dump_count: usize,
}

/// Everything besides the fixed-width and adjacency files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub info: SnapshotInfo,
    pub layout: HeapLayout,
    pub class_of_class: ObjectId,
    /// In id order
    pub classes: Vec<ClassRecord>,
    /// Global roots in id order
    pub gc_roots: Vec<(ObjectId, Vec<GcRootInfo>)>,
    /// thread id -> (local object id -> roots), both in id order
    pub thread_locals: Vec<(ObjectId, Vec<(ObjectId, Vec<GcRootInfo>)>)>,
}

impl IndexMeta {
    pub fn encode(&self) -> HeapResult<Vec<u8>> {
        bitcode::serialize(self).map_err(|e| HeapError::Metadata(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> HeapResult<Self> {
        bitcode::deserialize(bytes).map_err(|e| HeapError::Metadata(e.to_string()))
    }
}

/// The six persisted indices
pub struct IndexFiles {
    pub identifiers: LongIndex,
    pub object_to_class: IntIndex,
    pub positions: LongIndex,
    pub array_sizes: IntIndex,
    pub outbound: One2ManyIndex,
    pub inbound: One2ManyIndex,
}

impl IndexFiles {
    pub fn open_paths(path_of: impl Fn(IndexKind) -> PathBuf) -> HeapResult<Self> {
        Ok(Self {
            identifiers: LongIndex::open(&path_of(IndexKind::Identifiers), IndexKind::Identifiers)?,
            object_to_class: IntIndex::open(
                &path_of(IndexKind::ObjectToClass),
                IndexKind::ObjectToClass,
            )?,
            positions: LongIndex::open(
                &path_of(IndexKind::ObjectToPosition),
                IndexKind::ObjectToPosition,
            )?,
            array_sizes: IntIndex::open(&path_of(IndexKind::ArrayToSize), IndexKind::ArrayToSize)?,
            outbound: One2ManyIndex::open(&path_of(IndexKind::Outbound), IndexKind::Outbound)?,
            inbound: One2ManyIndex::open(&path_of(IndexKind::Inbound), IndexKind::Inbound)?,
        })
    }

    pub fn open(prefix: &Path) -> HeapResult<Self> {
        Self::open_paths(|kind| index_path(prefix, kind))
    }
}

/// Random access to objects, classes, roots and adjacency of one heap dump
pub struct HeapIndex {
    info: SnapshotInfo,
    layout: HeapLayout,
    class_of_class: ObjectId,
    files: IndexFiles,
    classes: IdKeyed<ClassRecord>,
    gc_roots: Vec<(ObjectId, Vec<GcRootInfo>)>,
    thread_locals: Vec<(ObjectId, Vec<(ObjectId, Vec<GcRootInfo>)>)>,
    reader: Mutex<Option<ObjectReader>>,
}

impl HeapIndex {
    pub fn from_parts(meta: IndexMeta, files: IndexFiles) -> HeapResult<Self> {
        let count = files.identifiers.len();
        let consistent = [
            files.object_to_class.len(),
            files.positions.len(),
            files.array_sizes.len(),
            files.outbound.len(),
            files.inbound.len(),
        ]
        .iter()
        .all(|n| *n == count);
        if !consistent || meta.info.object_count != count {
            return Err(HeapError::CorruptIndex {
                path: meta.info.prefix.clone().unwrap_or_default(),
                reason: format!("index files disagree on the object count {}", count),
            });
        }

        Ok(Self {
            classes: meta
                .classes
                .into_iter()
                .map(|c| (c.object_id, c))
                .collect(),
            info: meta.info,
            layout: meta.layout,
            class_of_class: meta.class_of_class,
            files,
            gc_roots: meta.gc_roots,
            thread_locals: meta.thread_locals,
            reader: Mutex::new(None),
        })
    }

    /// Re-open an index persisted under `prefix`
    pub fn open(prefix: &Path) -> HeapResult<Self> {
        let meta = IndexMeta::decode(&std::fs::read(prefixed_path(prefix, META_SUFFIX))?)?;
        let files = IndexFiles::open(prefix)?;
        let index = Self::from_parts(meta, files)?;
        info!(
            "Opened index {} ({} objects)",
            prefix.display(),
            index.object_count()
        );
        Ok(index)
    }

    pub fn info(&self) -> &SnapshotInfo {
        &self.info
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn object_count(&self) -> usize {
        self.files.identifiers.len()
    }

    fn check_id(&self, id: ObjectId) -> HeapResult<usize> {
        let index = id as usize;
        if index < self.object_count() {
            Ok(index)
        } else {
            Err(HeapError::InvalidObjectId {
                id,
                count: self.object_count(),
            })
        }
    }

    pub fn address_of(&self, id: ObjectId) -> HeapResult<u64> {
        let index = self.check_id(id)?;
        Ok(self.files.identifiers.get(index).unwrap_or_default())
    }

    pub fn id_of(&self, address: u64) -> Option<ObjectId> {
        let identifiers = &self.files.identifiers;
        crate::index::binary_search_by_index(identifiers.len(), address, |i| {
            identifiers.get(i).unwrap_or_default()
        })
        .map(|i| i as ObjectId)
    }

    pub fn class_id_of(&self, id: ObjectId) -> HeapResult<ObjectId> {
        let index = self.check_id(id)?;
        Ok(self.files.object_to_class.get(index).unwrap_or_default())
    }

    pub fn class_of(&self, id: ObjectId) -> HeapResult<Option<&ClassRecord>> {
        Ok(self.classes.get(self.class_id_of(id)?))
    }

    /// The class record if `id` is a class object
    pub fn class(&self, id: ObjectId) -> Option<&ClassRecord> {
        self.classes.get(id)
    }

    pub fn is_class(&self, id: ObjectId) -> bool {
        self.classes.contains(id)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassRecord> {
        self.classes.values()
    }

    pub fn classes_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ClassRecord> + 'a {
        self.classes.values().filter(move |c| c.name == name)
    }

    pub fn class_of_class_id(&self) -> ObjectId {
        self.class_of_class
    }

    /// Record position in the dump; `None` for synthesized entities
    pub fn file_position(&self, id: ObjectId) -> HeapResult<Option<u64>> {
        let index = self.check_id(id)?;
        Ok(self.files.positions.get(index).filter(|p| *p != 0))
    }

    /// Heap size of any object: arrays from the size index, class objects from
    /// their statics, instances from their class
    pub fn heap_size(&self, id: ObjectId) -> HeapResult<u64> {
        let index = self.check_id(id)?;
        if let Some(class) = self.classes.get(id) {
            return Ok(class.class_size);
        }
        let array_size = self.files.array_sizes.get(index).unwrap_or_default();
        if array_size != 0 {
            return Ok(decode_size(array_size));
        }
        Ok(self.class_of(id)?.map(|c| c.instance_size).unwrap_or(0))
    }

    pub fn outbound(&self, id: ObjectId) -> HeapResult<Vec<ObjectId>> {
        let index = self.check_id(id)?;
        Ok(self.files.outbound.get(index))
    }

    pub fn inbound(&self, id: ObjectId) -> HeapResult<Vec<ObjectId>> {
        let index = self.check_id(id)?;
        Ok(self.files.inbound.get(index))
    }

    /// Outbound adjacency for the marker
    pub fn outbound_index(&self) -> &One2ManyIndex {
        &self.files.outbound
    }

    pub fn inbound_index(&self) -> &One2ManyIndex {
        &self.files.inbound
    }

    /// Ids of all global GC roots, ascending
    pub fn gc_root_ids(&self) -> Vec<ObjectId> {
        self.gc_roots.iter().map(|(id, _)| *id).collect()
    }

    pub fn gc_root_info(&self, id: ObjectId) -> Option<&[GcRootInfo]> {
        self.gc_roots
            .binary_search_by_key(&id, |(root, _)| *root)
            .ok()
            .map(|i| self.gc_roots[i].1.as_slice())
    }

    /// Thread ids that hold local-variable roots
    pub fn threads_with_locals(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.thread_locals.iter().map(|(thread, _)| *thread)
    }

    /// Local roots of thread `thread_id`, by local object id
    pub fn thread_locals(&self, thread_id: ObjectId) -> Option<&[(ObjectId, Vec<GcRootInfo>)]> {
        self.thread_locals
            .binary_search_by_key(&thread_id, |(thread, _)| *thread)
            .ok()
            .map(|i| self.thread_locals[i].1.as_slice())
    }

    /// Outbound references of `id` with the field, slot or pseudo name they
    /// come from. Instances and arrays are re-read from the dump.
    pub fn named_references(&self, id: ObjectId) -> HeapResult<Vec<NamedReference>> {
        let class_id = self.class_id_of(id)?;
        let mut refs = vec![NamedReference::new("<class>", self.address_of(class_id)?)];

        if let Some(class) = self.classes.get(id) {
            if class.has_super_class() {
                refs.push(NamedReference::new("<super>", class.super_address));
            }
            refs.push(NamedReference::new("<classloader>", class.loader_address));
            refs.extend(class.statics.iter().filter_map(|s| {
                s.value
                    .as_reference()
                    .map(|address| NamedReference::new(s.name.clone(), address))
            }));
            return Ok(refs);
        }

        let Some(position) = self.file_position(id)? else {
            return Ok(refs);
        };

        let mut reader = self.reader.lock();
        if reader.is_none() {
            *reader = Some(ObjectReader::open(&self.info.path, self.info.id_size)?);
        }
        if let Some(reader) = reader.as_mut() {
            let lookup = |address: u64| self.id_of(address).and_then(|i| self.classes.get(i));
            refs.extend(reader.named_references(position, lookup, self.classes.len())?);
        }
        Ok(refs)
    }
}

impl Adjacency for HeapIndex {
    fn object_count(&self) -> usize {
        self.files.outbound.len()
    }

    fn for_each_outbound<F: FnMut(ObjectId)>(&self, id: ObjectId, f: F) {
        self.files.outbound.for_each(id as usize, f);
    }

    fn footprint_bytes(&self) -> u64 {
        self.files.outbound.footprint_bytes()
    }
}
