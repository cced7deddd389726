//! First pass: discover objects, classes and GC roots

use super::reader::PositionReader;
use super::strictness::Policy;
use super::threads::{JavaLocal, StackFrame, StackTrace, ThreadStacks};
use super::{read_header, record, sub_record, HprofHeader};
use crate::model::{
    normalize_class_name, ClassRecord, FieldDescriptor, FieldType, GcRootKind, RawGcRoot,
    StaticField,
};
use crate::progress::{CancellationToken, ProgressListener};
use crate::{DumpDescriptor, FormatViolation, HeapError, HeapResult};
use chrono::DateTime;
use rustc_hash::FxHashMap;
use std::io::{Read, Seek};
use tracing::debug;

/// Receives pass 1 events
pub trait Pass1Handler {
    fn set_identifier_size(&mut self, id_size: usize);

    /// Called once when object arrays reveal compressed references
    fn set_reference_size(&mut self, ref_size: usize);

    fn set_creation_date(&mut self, millis: i64);

    fn add_gc_root(&mut self, root: RawGcRoot);

    /// `class.file_position` is set to the CLASS_DUMP sub-record
    fn add_class(&mut self, class: ClassRecord);

    /// Any instance or array at `position`
    fn report_instance(&mut self, address: u64, position: u64);

    fn has_class(&self, address: u64) -> bool;

    fn has_class_named(&self, name: &str) -> bool;

    fn report_required_object_array(&mut self, class_address: u64);

    fn report_required_primitive_array(&mut self, element_type: FieldType);
}

/// What pass 1 learned besides the handler events
#[derive(Debug)]
pub struct Pass1Outcome {
    pub header: HprofHeader,
    /// Number of heap dumps in the file
    pub dump_count: usize,
    pub threads: ThreadStacks,
}

/// Which dump of a multi-dump file to read
fn dump_matches(current: usize, selection: Option<usize>) -> bool {
    current == selection.unwrap_or(0)
}

fn dump_descriptor(index: usize, created_at_ms: i64) -> DumpDescriptor {
    let created = DateTime::from_timestamp_millis(created_at_ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| format!("{} ms", created_at_ms));
    DumpDescriptor {
        index,
        created_at_ms,
        description: format!("Heap dump created at {}", created),
    }
}

pub struct Pass1Parser<'a, H: Pass1Handler> {
    handler: &'a mut H,
    policy: &'a Policy<'a>,
    listener: &'a dyn ProgressListener,
    cancel: &'a CancellationToken,
    id_size: usize,
    strings: FxHashMap<u64, String>,
    threads: ThreadStacks,
    work_done: u64,
    found_compressed: bool,
    previous_array_start: u64,
    previous_array_uncompressed_end: u64,
}

impl<'a, H: Pass1Handler> Pass1Parser<'a, H> {
    pub fn new(
        handler: &'a mut H,
        policy: &'a Policy<'a>,
        listener: &'a dyn ProgressListener,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            handler,
            policy,
            listener,
            cancel,
            id_size: 8,
            strings: FxHashMap::default(),
            threads: ThreadStacks::default(),
            work_done: 0,
            found_compressed: false,
            previous_array_start: 0,
            previous_array_uncompressed_end: 0,
        }
    }

    /// Scan `input` (of `file_size` bytes), reading the heap dump chosen by `selection`.
    ///
    /// The string pool is dropped when this returns.
    pub fn read<R: Read + Seek>(
        mut self,
        input: R,
        file_size: u64,
        selection: Option<usize>,
    ) -> HeapResult<Pass1Outcome> {
        let mut reader = PositionReader::new(input);
        self.listener.begin_task("Scanning heap dump", file_size / 1000);

        let header = read_header(&mut reader)?;
        self.id_size = header.id_size;
        self.handler.set_identifier_size(header.id_size);
        debug!("{} with {}-byte identifiers", header.version, header.id_size);

        let mut current_dump = 0usize;
        let mut dumps: Vec<DumpDescriptor> = Vec::new();
        let mut found_dump = false;
        let mut previous_time_offset = 0u64;
        let mut time_wrap = 0u64;

        let mut position = reader.position();
        while position < file_size {
            self.tick(position)?;

            let tag = reader.read_u8()?;
            let time_offset = reader.read_u32()? as u64;
            if time_offset < previous_time_offset {
                time_wrap += 1 << 32;
            }
            previous_time_offset = time_offset;

            let declared = reader.read_u32()? as u64;
            let length = self.checked_length(file_size, position, tag, declared)?;
            let record_end = reader.position() + length;

            match tag {
                record::STRING_IN_UTF8 => {
                    if length < self.id_size as u64 {
                        return Err(HeapError::IllegalRecordLength {
                            length: length as i64,
                            offset: position,
                            tag,
                        });
                    }
                    self.read_string(&mut reader, length)?;
                }
                record::LOAD_CLASS => self.read_load_class(&mut reader)?,
                record::STACK_FRAME => self.read_stack_frame(&mut reader)?,
                record::STACK_TRACE => self.read_stack_trace(&mut reader)?,
                record::HEAP_DUMP | record::HEAP_DUMP_SEGMENT => {
                    let dump_time =
                        header.timestamp_ms + ((time_wrap + time_offset) / 1000) as i64;
                    if dump_matches(current_dump, selection) {
                        if !found_dump {
                            self.handler.set_creation_date(dump_time);
                            found_dump = true;
                        }
                        self.read_dump_segments(&mut reader, length)?;
                    } else {
                        reader.skip(length)?;
                    }
                    if dumps.len() < current_dump + 1 {
                        dumps.push(dump_descriptor(current_dump, dump_time));
                    }
                    if tag == record::HEAP_DUMP {
                        current_dump += 1;
                    }
                }
                record::HEAP_DUMP_END => {
                    current_dump += 1;
                    reader.skip(length)?;
                }
                record::UNLOAD_CLASS
                | record::ALLOC_SITES
                | record::HEAP_SUMMARY
                | record::START_THREAD
                | record::END_THREAD
                | record::CPU_SAMPLES
                | record::CONTROL_SETTINGS => reader.skip(length)?,
                _ => {
                    self.policy.violation(FormatViolation::UnexpectedRecord {
                        tag,
                        offset: position,
                        length,
                    })?;
                    reader.skip(length)?;
                }
            }

            // Fixed-shape records may declare trailing bytes we did not consume
            if reader.position() < record_end {
                reader.seek_to(record_end)?;
            }
            position = reader.position();
        }

        if !found_dump {
            return Err(HeapError::DumpNotFound {
                found: current_dump,
                requested: selection.unwrap_or(0),
            });
        }

        if current_dump > 1 {
            match selection {
                None => return Err(HeapError::MultipleDumps(dumps)),
                Some(index) => self.policy.info(format!(
                    "Found {} heap dumps, using dump #{}",
                    current_dump, index
                )),
            }
        }

        self.listener.done();
        Ok(Pass1Outcome {
            header,
            dump_count: current_dump,
            threads: self.threads,
        })
    }

    /// Check cancellation and report progress once per 1000-byte bucket
    fn tick(&mut self, position: u64) -> HeapResult<()> {
        let work = position / 1000;
        if work > self.work_done {
            self.cancel.check()?;
            self.listener.worked(work - self.work_done);
            self.work_done = work;
        }
        Ok(())
    }

    /// Apply the overflow guess and the overrun policy to a record length
    fn checked_length(&self, file_size: u64, position: u64, tag: u8, declared: u64) -> HeapResult<u64> {
        let available = file_size.saturating_sub(position + record::HEADER_LEN);
        let is_heap_dump = tag == record::HEAP_DUMP || tag == record::HEAP_DUMP_SEGMENT;

        // Lengths are 32 bits; a larger dump segment must have wrapped
        if is_heap_dump && !self.policy.strictness().is_stop() && available > u32::MAX as u64 {
            if declared != available {
                self.policy.warn(format!(
                    "Heap dump record at byte {} declares {} bytes; assuming an overflowed length and reading the remaining {} bytes",
                    position, declared, available
                ));
            }
            return Ok(available);
        }

        if declared > available {
            self.policy.violation(FormatViolation::RecordOverrun {
                offset: position,
                length: declared,
                available,
            })?;
            return Ok(available);
        }
        Ok(declared)
    }

    fn string_constant(&self, id: u64) -> String {
        if id == 0 {
            return String::new();
        }
        self.strings
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("unresolved-name@0x{:x}", id))
    }

    fn read_string<R: Read + Seek>(&mut self, reader: &mut PositionReader<R>, length: u64) -> HeapResult<()> {
        let id = reader.read_id(self.id_size)?;
        let bytes = reader.read_bytes((length - self.id_size as u64) as usize)?;
        self.strings.insert(id, String::from_utf8_lossy(&bytes).into_owned());
        Ok(())
    }

    fn read_load_class<R: Read + Seek>(&mut self, reader: &mut PositionReader<R>) -> HeapResult<()> {
        let class_serial = reader.read_u32()?;
        let address = reader.read_id(self.id_size)?;
        reader.skip(4)?;
        let name_id = reader.read_id(self.id_size)?;
        let name = self.string_constant(name_id).replace('/', ".");
        self.threads.add_loaded_class(class_serial, address, name);
        Ok(())
    }

    fn read_stack_frame<R: Read + Seek>(&mut self, reader: &mut PositionReader<R>) -> HeapResult<()> {
        let frame_id = reader.read_id(self.id_size)?;
        let method = reader.read_id(self.id_size)?;
        let signature = reader.read_id(self.id_size)?;
        let source_file = reader.read_id(self.id_size)?;
        let class_serial = reader.read_u32()?;
        let line = reader.read_i32()?;
        let frame = StackFrame {
            method: self.string_constant(method),
            signature: self.string_constant(signature),
            source_file: self.string_constant(source_file),
            class_serial,
            line,
        };
        self.threads.add_frame(frame_id, frame);
        Ok(())
    }

    fn read_stack_trace<R: Read + Seek>(&mut self, reader: &mut PositionReader<R>) -> HeapResult<()> {
        let serial = reader.read_u32()?;
        let thread_serial = reader.read_u32()?;
        let frame_count = reader.read_u32()?;
        let frame_ids = (0..frame_count)
            .map(|_| reader.read_id(self.id_size))
            .collect::<Result<Vec<_>, _>>()?;
        self.threads.add_trace(
            serial,
            StackTrace {
                thread_serial,
                frame_ids,
            },
        );
        Ok(())
    }

    fn read_dump_segments<R: Read + Seek>(
        &mut self,
        reader: &mut PositionReader<R>,
        length: u64,
    ) -> HeapResult<()> {
        let start = reader.position();
        let end = start + length;
        let mut position = start;

        while position < end {
            self.tick(position)?;

            let tag = reader.read_u8()?;
            match tag {
                sub_record::ROOT_UNKNOWN => self.read_gc(reader, GcRootKind::Unknown, 0)?,
                sub_record::ROOT_THREAD_OBJECT => self.read_gc_thread_object(reader)?,
                // Globals share the native stack kind; the trailing id is the JNI handle
                sub_record::ROOT_JNI_GLOBAL => {
                    self.read_gc(reader, GcRootKind::NativeStack, self.id_size as u64)?
                }
                sub_record::ROOT_JNI_LOCAL => {
                    self.read_gc_with_thread_context(reader, GcRootKind::NativeLocal, true)?
                }
                sub_record::ROOT_JAVA_FRAME => {
                    self.read_gc_with_thread_context(reader, GcRootKind::JavaLocal, true)?
                }
                sub_record::ROOT_NATIVE_STACK => {
                    self.read_gc_with_thread_context(reader, GcRootKind::NativeStack, false)?
                }
                sub_record::ROOT_STICKY_CLASS => self.read_gc(reader, GcRootKind::SystemClass, 0)?,
                sub_record::ROOT_THREAD_BLOCK => self.read_gc(reader, GcRootKind::ThreadBlock, 4)?,
                sub_record::ROOT_MONITOR_USED => self.read_gc(reader, GcRootKind::BusyMonitor, 0)?,
                sub_record::CLASS_DUMP => self.read_class_dump(reader, position)?,
                sub_record::INSTANCE_DUMP => self.read_instance_dump(reader, position)?,
                sub_record::OBJECT_ARRAY_DUMP => self.read_object_array_dump(reader, position)?,
                sub_record::PRIMITIVE_ARRAY_DUMP => {
                    self.read_primitive_array_dump(reader, position)?
                }
                _ => return Err(HeapError::InvalidSubRecord { tag, offset: position }),
            }

            position = reader.position();
        }

        if position != end {
            self.policy.violation(FormatViolation::SegmentEndMismatch {
                start,
                length,
                actual: position,
                expected: end,
            })?;
        }
        Ok(())
    }

    fn read_gc<R: Read + Seek>(
        &mut self,
        reader: &mut PositionReader<R>,
        kind: GcRootKind,
        skip: u64,
    ) -> HeapResult<()> {
        let address = reader.read_id(self.id_size)?;
        self.handler.add_gc_root(RawGcRoot {
            address,
            context_address: 0,
            kind,
            frame: None,
        });
        reader.skip(skip)?;
        Ok(())
    }

    fn read_gc_thread_object<R: Read + Seek>(&mut self, reader: &mut PositionReader<R>) -> HeapResult<()> {
        let address = reader.read_id(self.id_size)?;
        let thread_serial = reader.read_u32()?;
        self.threads.add_thread_object(thread_serial, address);
        self.handler.add_gc_root(RawGcRoot {
            address,
            context_address: 0,
            kind: GcRootKind::ThreadObject,
            frame: None,
        });
        reader.skip(4)?;
        Ok(())
    }

    fn read_gc_with_thread_context<R: Read + Seek>(
        &mut self,
        reader: &mut PositionReader<R>,
        kind: GcRootKind,
        has_frame: bool,
    ) -> HeapResult<()> {
        let address = reader.read_id(self.id_size)?;
        let thread_serial = reader.read_u32()?;
        let frame = if has_frame {
            Some(reader.read_i32()?)
        } else {
            None
        };

        let context_address = self.threads.thread_address(thread_serial).unwrap_or(0);
        self.handler.add_gc_root(RawGcRoot {
            address,
            context_address,
            kind,
            frame,
        });

        if let Some(frame) = frame {
            self.threads.add_local(thread_serial, JavaLocal { address, frame, kind });
        }
        Ok(())
    }

    fn read_class_dump<R: Read + Seek>(
        &mut self,
        reader: &mut PositionReader<R>,
        position: u64,
    ) -> HeapResult<()> {
        let id_size = self.id_size;
        let address = reader.read_id(id_size)?;
        reader.skip(4)?; // stack trace serial
        let super_address = reader.read_id(id_size)?;
        let loader_address = reader.read_id(id_size)?;

        // signers, protection domain, two reserved ids, instance size
        reader.skip(id_size as u64 * 4 + 4)?;

        let constant_pool_size = reader.read_u16()?;
        for _ in 0..constant_pool_size {
            reader.skip(2)?;
            reader.skip_tagged_value(id_size)?;
        }

        let static_count = reader.read_u16()?;
        let mut statics = Vec::with_capacity(static_count as usize);
        for _ in 0..static_count {
            let name = self.string_constant(reader.read_id(id_size)?);
            let value = reader.read_tagged_value(id_size)?;
            statics.push(StaticField { name, value });
        }

        let field_count = reader.read_u16()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let name = self.string_constant(reader.read_id(id_size)?);
            let field_type = reader.read_field_type()?;
            fields.push(FieldDescriptor::new(name, field_type));
        }

        let name = match self.threads.loaded_class_name(address) {
            Some(name) => normalize_class_name(name),
            None => format!("unknown-name@0x{:x}", address),
        };

        let class = ClassRecord::new(address, name, super_address, loader_address, statics, fields)
            .with_position(position);
        self.handler.add_class(class);
        Ok(())
    }

    fn read_instance_dump<R: Read + Seek>(
        &mut self,
        reader: &mut PositionReader<R>,
        position: u64,
    ) -> HeapResult<()> {
        let address = reader.read_id(self.id_size)?;
        reader.skip(self.id_size as u64 + 4)?;
        let payload = reader.read_u32()? as u64;
        reader.skip(payload)?;
        self.handler.report_instance(address, position);
        Ok(())
    }

    fn read_object_array_dump<R: Read + Seek>(
        &mut self,
        reader: &mut PositionReader<R>,
        position: u64,
    ) -> HeapResult<()> {
        let address = reader.read_id(self.id_size)?;
        if !self.found_compressed
            && self.id_size == 8
            && address > self.previous_array_start
            && address < self.previous_array_uncompressed_end
        {
            self.policy.info(format!(
                "Detected compressed references, because with uncompressed 64-bit references the array at 0x{:x} would overlap the array at 0x{:x}",
                address, self.previous_array_start
            ));
            self.handler.set_reference_size(4);
            self.found_compressed = true;
        }

        reader.skip(4)?;
        let size = reader.read_u32()? as u64;
        let class_address = reader.read_id(self.id_size)?;
        if !self.handler.has_class(class_address) {
            self.handler.report_required_object_array(class_address);
        }
        reader.skip(size * self.id_size as u64)?;
        self.handler.report_instance(address, position);

        self.previous_array_start = address;
        self.previous_array_uncompressed_end = address.saturating_add(16 + size * 8);
        Ok(())
    }

    fn read_primitive_array_dump<R: Read + Seek>(
        &mut self,
        reader: &mut PositionReader<R>,
        position: u64,
    ) -> HeapResult<()> {
        let address = reader.read_id(self.id_size)?;
        reader.skip(4)?;
        let size = reader.read_u32()? as u64;
        let tag = reader.read_u8()?;
        let element_type = FieldType::primitive_from_tag(tag)
            .ok_or(HeapError::IllegalPrimitiveType { tag, offset: position })?;

        if !self.handler.has_class_named(element_type.array_class_name()) {
            self.handler.report_required_primitive_array(element_type);
        }
        reader.skip(size * element_type.size(self.id_size) as u64)?;
        self.handler.report_instance(address, position);
        Ok(())
    }
}
