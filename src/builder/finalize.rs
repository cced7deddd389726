//! Finalize: freeze the id space, synthesize missing classes, size classes and
//! map roots to ids. The result collects pass 2 output and commits the index.

use super::layout::{infer_alignment, HeapLayout};
use super::IndexBuilder;
use crate::hprof::strictness::Policy;
use crate::hprof::HprofHeader;
use crate::index::writer::{derive_inbound, encode_ints, encode_longs, write_ints, write_longs};
use crate::index::{
    encode_size, index_path, prefixed_path, Identifiers, IdKeyed, IndexKind, IndexStorage,
    IntIndex, LongIndex, One2ManyIndex, OutboundWriter, PendingFiles, META_SUFFIX,
};
use crate::model::{
    ClassRecord, FieldType, GcRootInfo, GcRootKind, ObjectId, RawGcRoot, JAVA_LANG_CLASS,
    JAVA_LANG_CLASSLOADER, UNKNOWN_ARRAY_CLASS,
};
use crate::snapshot::{HeapIndex, IndexFiles, IndexMeta, SnapshotInfo};
use crate::{HeapError, HeapResult};
use rustc_hash::FxHashMap;
use std::path::Path;
use tracing::debug;

/// Roots of one thread: local object id -> roots
pub type ThreadLocals = Vec<(ObjectId, Vec<GcRootInfo>)>;

/// Frozen id space plus the per-object tables pass 2 fills in
pub struct FinalizedBuild {
    pub(crate) identifiers: Identifiers,
    pub(crate) positions: Vec<u64>,
    pub(crate) layout: HeapLayout,
    pub(crate) id_size: usize,
    pub(crate) creation_ms: Option<i64>,
    pub(crate) classes: IdKeyed<ClassRecord>,
    pub(crate) class_of_class: ObjectId,
    /// Classes named after each primitive array type, by type tag
    pub(crate) primitive_classes: FxHashMap<u8, Vec<ObjectId>>,
    object_to_class: Vec<u32>,
    array_sizes: Vec<u32>,
    outbound: OutboundWriter,
    gc_roots: Vec<(ObjectId, Vec<GcRootInfo>)>,
    thread_locals: Vec<(ObjectId, ThreadLocals)>,
    /// thread address -> sorted addresses of its locals, appended to the thread's references
    pub(crate) thread_local_addresses: FxHashMap<u64, Vec<u64>>,
}

/// Lowest address above 0 that is neither an object nor an already chosen class
fn probe_free_address(builder: &IndexBuilder, taken: &[ClassRecord], start: u64) -> u64 {
    let mut next = start.max(1);
    while builder.identifiers.contains(next)
        || builder.classes.contains(next)
        || taken.iter().any(|c| c.address == next)
    {
        next += 1;
    }
    next
}

impl IndexBuilder {
    /// The single class named `name`; `None` if absent
    fn unique_class(&self, name: &str) -> HeapResult<Option<u64>> {
        match self.class_named(name) {
            None | Some([]) => Ok(None),
            Some([address]) => Ok(Some(*address)),
            Some(_) => Err(HeapError::AmbiguousClass(name.to_string())),
        }
    }

    /// Classes the dump references but never declares
    fn synthesize_classes(&mut self, policy: &Policy) -> HeapResult<()> {
        let mut fakes: Vec<ClassRecord> = Vec::new();

        for &address in &self.required_array_classes {
            if self.classes.contains(address) {
                continue;
            }
            if self.identifiers.contains(address) {
                return Err(HeapError::ExpectedClassSegment(address));
            }
            fakes.push(ClassRecord::synthesized(address, UNKNOWN_ARRAY_CLASS));
        }

        let mut next = 1u64;
        let needed = self
            .required_primitive_arrays
            .iter()
            .filter_map(|tag| FieldType::primitive_from_tag(*tag))
            .map(FieldType::array_class_name)
            .chain([JAVA_LANG_CLASS, JAVA_LANG_CLASSLOADER]);
        let needed: Vec<&'static str> = needed.collect();
        for name in needed {
            if self.unique_class(name)?.is_some() {
                continue;
            }
            next = probe_free_address(self, &fakes, next);
            fakes.push(ClassRecord::synthesized(next, name));
            next += 1;
        }

        for fake in fakes {
            policy.info(format!(
                "Added fake class {} at address 0x{:x}",
                fake.name, fake.address
            ));
            self.register_class(fake);
        }
        Ok(())
    }

    /// Fix the id space and derive everything pass 2 depends on
    pub fn finalize(
        mut self,
        policy: &Policy,
        storage: &IndexStorage,
        pending: &mut PendingFiles,
    ) -> HeapResult<FinalizedBuild> {
        // address 0 is the system class loader
        self.identifiers.add(0, 0);
        let duplicates = self.identifiers.sort();
        if duplicates > 0 {
            policy.warn(format!(
                "Found {} duplicate object addresses; keeping the first record of each",
                duplicates
            ));
        }

        let object_align = infer_alignment(self.identifiers.addresses());
        let layout = HeapLayout::new(self.id_size, self.ref_size, object_align);
        debug!(
            "Layout: pointer {} bytes, references {} bytes, alignment {}",
            layout.pointer_size, layout.ref_size, layout.object_align
        );

        self.synthesize_classes(policy)?;
        self.identifiers.sort();

        for class in self.classes.values_mut() {
            if !self.identifiers.contains(class.loader_address) {
                debug!(
                    "Class {} has unknown loader 0x{:x}; using the system class loader",
                    class.name, class.loader_address
                );
                class.loader_address = 0;
            }
        }

        let class_of_class_address = self.unique_class(JAVA_LANG_CLASS)?.unwrap_or(0);
        let loader_class_address = self.unique_class(JAVA_LANG_CLASSLOADER)?.unwrap_or(0);

        // sizes need the whole hierarchy by address
        let class_count = self.classes.len();
        let sizes: Vec<(u64, u64, u64)> = self
            .classes
            .iter()
            .map(|(address, class)| {
                let instance = layout.instance_size(class, |a| self.classes.get(a), class_count);
                (address, instance, layout.class_size(class))
            })
            .collect();
        for (address, instance_size, class_size) in sizes {
            if let Some(class) = self.classes.get_mut(address) {
                class.instance_size = instance_size;
                class.class_size = class_size;
            }
        }

        // system classes without any other root must survive
        for class in self.classes.values() {
            if class.loader_address == 0
                && !class.is_array_type()
                && !self.gc_roots.contains(class.address)
            {
                self.gc_roots.insert(
                    class.address,
                    vec![RawGcRoot {
                        address: class.address,
                        context_address: 0,
                        kind: GcRootKind::SystemClass,
                        frame: None,
                    }],
                );
            }
        }

        let primitive_names: Vec<(u8, Vec<u64>)> = FieldType::PRIMITIVES
            .iter()
            .map(|t| {
                let addresses = self
                    .class_named(t.array_class_name())
                    .map(<[u64]>::to_vec)
                    .unwrap_or_default();
                (t.tag(), addresses)
            })
            .collect();

        let IndexBuilder {
            id_size,
            creation_ms,
            identifiers,
            classes,
            gc_roots,
            thread_locals,
            ..
        } = self;

        let (identifiers, positions) = identifiers.freeze();
        let object_count = identifiers.len();
        let (mut classes, _) = classes.into_id_keyed(&identifiers);

        let class_of_class = identifiers.id_of(class_of_class_address).unwrap_or(0);
        let loader_class = identifiers.id_of(loader_class_address).unwrap_or(0);

        let primitive_classes = primitive_names
            .into_iter()
            .map(|(tag, addresses)| {
                let ids = addresses
                    .into_iter()
                    .filter_map(|a| identifiers.id_of(a))
                    .collect();
                (tag, ids)
            })
            .collect();

        let outbound = match storage {
            IndexStorage::Disk { prefix } => OutboundWriter::spilled(
                object_count,
                pending.scratch(prefixed_path(prefix, "outbound.spill")),
            )?,
            IndexStorage::Memory => OutboundWriter::in_memory(object_count),
        };

        let mut finalized = FinalizedBuild {
            identifiers,
            positions,
            layout,
            id_size,
            creation_ms,
            classes: IdKeyed::new(),
            class_of_class,
            primitive_classes,
            object_to_class: vec![0; object_count],
            array_sizes: vec![0; object_count],
            outbound,
            gc_roots: Vec::new(),
            thread_locals: Vec::new(),
            thread_local_addresses: FxHashMap::default(),
        };

        finalized.link_classes(&mut classes, class_of_class_address)?;
        finalized.classes = classes;

        // the system class loader at address 0
        let loader_refs = [loader_class_address];
        let loader_size = finalized
            .classes
            .get(loader_class)
            .map(|c| c.instance_size)
            .unwrap_or(0);
        finalized.add_object(0, loader_class, &loader_refs, loader_size, false)?;

        finalized.map_roots(gc_roots, thread_locals);
        Ok(finalized)
    }
}

impl FinalizedBuild {
    pub fn object_count(&self) -> usize {
        self.identifiers.len()
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    /// Resolve super and loader ids, link subclasses and log class objects
    fn link_classes(
        &mut self,
        classes: &mut IdKeyed<ClassRecord>,
        class_of_class_address: u64,
    ) -> HeapResult<()> {
        let mut subclass_links = Vec::new();
        for id in classes.sorted_ids() {
            let Some(class) = classes.get_mut(id) else {
                continue;
            };
            class.object_id = id;
            class.super_id = if class.has_super_class() {
                self.identifiers.id_of(class.super_address)
            } else {
                None
            };
            class.loader_id = self.identifiers.id_of(class.loader_address).unwrap_or(0);
            if let Some(super_id) = class.super_id {
                subclass_links.push((super_id, id));
            }
        }

        for (super_id, id) in subclass_links {
            if let Some(parent) = classes.get_mut(super_id) {
                parent.subclasses.push(id);
            }
        }

        let mut class_object_sizes = 0u64;
        let mut class_object_count = 0u64;
        for id in classes.sorted_ids() {
            let Some(class) = classes.get(id) else {
                continue;
            };
            let refs = class.references(class_of_class_address);
            self.log_references(id, &refs)?;
            self.object_to_class[id as usize] = self.class_of_class;
            class_object_sizes += class.class_size;
            class_object_count += 1;
        }

        if let Some(class_of_class) = classes.get_mut(self.class_of_class) {
            class_of_class.instance_count += class_object_count;
            class_of_class.instances_heap_size += class_object_sizes;
        }
        Ok(())
    }

    fn map_roots(
        &mut self,
        gc_roots: crate::index::AddressKeyed<Vec<RawGcRoot>>,
        thread_locals: crate::index::AddressKeyed<crate::index::AddressKeyed<Vec<RawGcRoot>>>,
    ) {
        let (roots, unresolved) = gc_roots.into_id_keyed(&self.identifiers);
        if !unresolved.is_empty() {
            debug!("Dropped {} GC roots without an object", unresolved.len());
        }
        self.gc_roots = roots
            .into_sorted_vec()
            .into_iter()
            .map(|(id, raw)| {
                let infos = raw
                    .into_iter()
                    .map(|r| GcRootInfo {
                        object_id: id,
                        address: r.address,
                        kind: r.kind,
                        context_id: None,
                        context_address: 0,
                        frame: r.frame,
                    })
                    .collect();
                (id, infos)
            })
            .collect();

        let (threads, dropped) = thread_locals.into_id_keyed(&self.identifiers);
        if !dropped.is_empty() {
            debug!("Dropped locals of {} threads without an object", dropped.len());
        }
        for (thread_id, locals) in threads.into_sorted_vec() {
            let thread_address = self.identifiers.address_of(thread_id).unwrap_or(0);
            let (locals, _) = locals.into_id_keyed(&self.identifiers);
            let locals: ThreadLocals = locals
                .into_sorted_vec()
                .into_iter()
                .map(|(object_id, raw)| {
                    let infos = raw
                        .into_iter()
                        .map(|r| GcRootInfo {
                            object_id,
                            address: r.address,
                            kind: r.kind,
                            context_id: Some(thread_id),
                            context_address: thread_address,
                            frame: r.frame,
                        })
                        .collect();
                    (object_id, infos)
                })
                .collect();

            let addresses = locals
                .iter()
                .filter_map(|(id, _)| self.identifiers.address_of(*id))
                .collect();
            self.thread_local_addresses.insert(thread_address, addresses);
            self.thread_locals.push((thread_id, locals));
        }
    }

    /// Store the outbound list of `id`. The first reference (the class) stays
    /// first; the rest are resolved, sorted and de-duplicated. Addresses that are
    /// not objects are dropped.
    pub(crate) fn log_references(&mut self, id: ObjectId, refs: &[u64]) -> HeapResult<()> {
        let mut ids = Vec::with_capacity(refs.len());
        if let Some((first, rest)) = refs.split_first() {
            ids.extend(self.identifiers.id_of(*first));
            let mut others: Vec<ObjectId> = rest
                .iter()
                .filter_map(|a| self.identifiers.id_of(*a))
                .collect();
            others.sort_unstable();
            others.dedup();
            ids.extend(others);
        }
        self.outbound.log(id, &ids)
    }

    /// Record an instance or array read in pass 2
    pub(crate) fn add_object(
        &mut self,
        id: ObjectId,
        class_id: ObjectId,
        refs: &[u64],
        heap_size: u64,
        is_array: bool,
    ) -> HeapResult<()> {
        self.log_references(id, refs)?;
        self.object_to_class[id as usize] = class_id;
        if let Some(class) = self.classes.get_mut(class_id) {
            class.add_instance(heap_size);
        }
        if is_array {
            self.array_sizes[id as usize] = encode_size(heap_size);
        }
        Ok(())
    }

    /// The class of primitive arrays of `element_type`, if the dump has one
    pub(crate) fn primitive_array_class(&self, element_type: FieldType) -> HeapResult<Option<ObjectId>> {
        match self.primitive_classes.get(&element_type.tag()).map(Vec::as_slice) {
            Some([id]) => Ok(Some(*id)),
            Some([_, _, ..]) => Err(HeapError::AmbiguousClass(
                element_type.array_class_name().to_string(),
            )),
            _ => Ok(None),
        }
    }

    pub fn snapshot_info(
        &self,
        dump: &Path,
        storage: &IndexStorage,
        dump_index: Option<usize>,
        dump_count: usize,
        header: &HprofHeader,
    ) -> SnapshotInfo {
        SnapshotInfo {
            path: dump.to_path_buf(),
            prefix: match storage {
                IndexStorage::Disk { prefix } => Some(prefix.clone()),
                IndexStorage::Memory => None,
            },
            version: header.version.label().to_string(),
            id_size: self.id_size,
            ref_size: self.layout.ref_size as usize,
            compressed_refs: self.layout.ref_size < self.layout.pointer_size,
            object_align: self.layout.object_align,
            creation_ms: self.creation_ms,
            object_count: self.object_count(),
            dump_index,
            dump_count,
        }
    }

    /// Write every index into `storage` and open the result. Disk files stay
    /// staged in `pending` until the caller commits them.
    pub fn commit(
        self,
        info: SnapshotInfo,
        storage: &IndexStorage,
        pending: &mut PendingFiles,
    ) -> HeapResult<HeapIndex> {
        let FinalizedBuild {
            identifiers,
            positions,
            layout,
            classes,
            class_of_class,
            object_to_class,
            array_sizes,
            outbound,
            gc_roots,
            thread_locals,
            ..
        } = self;

        let meta = IndexMeta {
            info,
            layout,
            class_of_class,
            classes: classes.into_sorted_vec().into_iter().map(|(_, c)| c).collect(),
            gc_roots,
            thread_locals,
        };
        let outbound = outbound.finish()?;

        let files = match storage {
            IndexStorage::Disk { prefix } => {
                let mut staged = FxHashMap::default();
                for kind in IndexKind::ALL {
                    staged.insert(kind, pending.stage(index_path(prefix, kind)));
                }
                let path = |kind: IndexKind| staged[&kind].as_path();

                write_longs(path(IndexKind::Identifiers), IndexKind::Identifiers, identifiers.as_slice())?;
                write_ints(path(IndexKind::ObjectToClass), IndexKind::ObjectToClass, &object_to_class)?;
                write_longs(path(IndexKind::ObjectToPosition), IndexKind::ObjectToPosition, &positions)?;
                write_ints(path(IndexKind::ArrayToSize), IndexKind::ArrayToSize, &array_sizes)?;
                outbound.write_file(IndexKind::Outbound, path(IndexKind::Outbound))?;
                drop(outbound);

                let written = One2ManyIndex::open(path(IndexKind::Outbound), IndexKind::Outbound)?;
                derive_inbound(&written).write_file(IndexKind::Inbound, path(IndexKind::Inbound))?;

                let meta_path = pending.stage(prefixed_path(prefix, META_SUFFIX));
                std::fs::write(&meta_path, meta.encode()?)?;

                // mappings stay valid across the rename on commit
                IndexFiles::open_paths(|kind| staged[&kind].clone())?
            }
            IndexStorage::Memory => {
                let outbound = One2ManyIndex::from_bytes(
                    outbound.to_bytes(IndexKind::Outbound)?,
                    IndexKind::Outbound,
                )?;
                let inbound = One2ManyIndex::from_bytes(
                    derive_inbound(&outbound).to_bytes(IndexKind::Inbound)?,
                    IndexKind::Inbound,
                )?;
                IndexFiles {
                    identifiers: LongIndex::from_bytes(
                        encode_longs(IndexKind::Identifiers, identifiers.as_slice()),
                        IndexKind::Identifiers,
                    )?,
                    object_to_class: IntIndex::from_bytes(
                        encode_ints(IndexKind::ObjectToClass, &object_to_class),
                        IndexKind::ObjectToClass,
                    )?,
                    positions: LongIndex::from_bytes(
                        encode_longs(IndexKind::ObjectToPosition, &positions),
                        IndexKind::ObjectToPosition,
                    )?,
                    array_sizes: IntIndex::from_bytes(
                        encode_ints(IndexKind::ArrayToSize, &array_sizes),
                        IndexKind::ArrayToSize,
                    )?,
                    outbound,
                    inbound,
                }
            }
        };

        HeapIndex::from_parts(meta, files)
    }
}
