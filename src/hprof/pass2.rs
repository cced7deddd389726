//! Second pass: extract outbound references of every instance and array

use super::object_reader::walk_instance_fields;
use super::reader::PositionReader;
use super::strictness::Policy;
use super::sub_record;
use crate::builder::FinalizedBuild;
use crate::model::{FieldType, ObjectId};
use crate::progress::{CancellationToken, ProgressListener};
use crate::{FormatViolation, HeapError, HeapResult};
use std::io::{Read, Seek};
use tracing::debug;

const CHECK_INTERVAL: usize = 1000;

pub struct Pass2Parser<'a> {
    build: &'a mut FinalizedBuild,
    policy: &'a Policy<'a>,
    listener: &'a dyn ProgressListener,
    cancel: &'a CancellationToken,
    refs: Vec<u64>,
}

impl<'a> Pass2Parser<'a> {
    pub fn new(
        build: &'a mut FinalizedBuild,
        policy: &'a Policy<'a>,
        listener: &'a dyn ProgressListener,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            build,
            policy,
            listener,
            cancel,
            refs: Vec::new(),
        }
    }

    /// Visit every recorded instance and array in file order
    pub fn read<R: Read + Seek>(mut self, input: R) -> HeapResult<()> {
        let mut order: Vec<(u64, ObjectId)> = self
            .build
            .positions
            .iter()
            .enumerate()
            .filter(|(id, position)| **position != 0 && !self.build.classes.contains(*id as ObjectId))
            .map(|(id, position)| (*position, id as ObjectId))
            .collect();
        order.sort_unstable();

        let mut reader = PositionReader::new(input);
        self.listener
            .begin_task("Extracting objects", (order.len() / CHECK_INTERVAL) as u64);
        debug!("Pass 2 over {} objects", order.len());

        for (n, (position, id)) in order.into_iter().enumerate() {
            if n % CHECK_INTERVAL == 0 {
                self.cancel.check()?;
                if n > 0 {
                    self.listener.worked(1);
                }
            }

            reader.seek_to(position)?;
            let tag = reader.read_u8()?;
            match tag {
                sub_record::INSTANCE_DUMP => self.read_instance(&mut reader, id, position)?,
                sub_record::OBJECT_ARRAY_DUMP => self.read_object_array(&mut reader, id, position)?,
                sub_record::PRIMITIVE_ARRAY_DUMP => {
                    self.read_primitive_array(&mut reader, id, position)?
                }
                _ => return Err(HeapError::InvalidSubRecord { tag, offset: position }),
            }
        }

        self.listener.done();
        Ok(())
    }

    fn class_id(&self, class_address: u64, position: u64) -> HeapResult<ObjectId> {
        self.build
            .identifiers
            .id_of(class_address)
            .filter(|id| self.build.classes.contains(*id))
            .ok_or(HeapError::MissingClass {
                class_address,
                offset: position,
            })
    }

    fn read_instance<R: Read + Seek>(
        &mut self,
        reader: &mut PositionReader<R>,
        id: ObjectId,
        position: u64,
    ) -> HeapResult<()> {
        let id_size = self.build.id_size;
        let address = reader.read_id(id_size)?;
        reader.skip(4)?;
        let class_address = reader.read_id(id_size)?;
        let length = reader.read_u32()? as usize;
        let payload = reader.read_bytes(length)?;
        let class_id = self.class_id(class_address, position)?;

        self.refs.clear();
        self.refs.push(class_address);

        let build = &*self.build;
        let class_count = build.classes.len();
        let lookup = |a: u64| build.identifiers.id_of(a).and_then(|i| build.classes.get(i));
        let Some(class) = build.classes.get(class_id) else {
            return Err(HeapError::MissingClass {
                class_address,
                offset: position,
            });
        };
        let refs = &mut self.refs;
        let required = walk_instance_fields(&payload, class, lookup, id_size, class_count, |_, value| {
            if let Some(reference) = value.as_reference() {
                refs.push(reference);
            }
        });
        let heap_size = class.instance_size;

        if required != length as u64 {
            self.policy.violation(FormatViolation::InstanceSizeMismatch {
                offset: position,
                declared: length as u64,
                read: required,
            })?;
        }

        if let Some(locals) = self.build.thread_local_addresses.get(&address) {
            self.refs.extend_from_slice(locals);
        }
        self.build.add_object(id, class_id, &self.refs, heap_size, false)
    }

    fn read_object_array<R: Read + Seek>(
        &mut self,
        reader: &mut PositionReader<R>,
        id: ObjectId,
        position: u64,
    ) -> HeapResult<()> {
        let id_size = self.build.id_size;
        reader.read_id(id_size)?;
        reader.skip(4)?;
        let length = reader.read_u32()?;
        let class_address = reader.read_id(id_size)?;
        let class_id = self.class_id(class_address, position)?;

        self.refs.clear();
        self.refs.push(class_address);
        for _ in 0..length {
            let element = reader.read_id(id_size)?;
            if element != 0 {
                self.refs.push(element);
            }
        }

        let heap_size = self.build.layout.object_array_size(length as u64);
        self.build.add_object(id, class_id, &self.refs, heap_size, true)
    }

    fn read_primitive_array<R: Read + Seek>(
        &mut self,
        reader: &mut PositionReader<R>,
        id: ObjectId,
        position: u64,
    ) -> HeapResult<()> {
        let id_size = self.build.id_size;
        reader.read_id(id_size)?;
        reader.skip(4)?;
        let length = reader.read_u32()?;
        let tag = reader.read_u8()?;
        let element_type = FieldType::primitive_from_tag(tag)
            .ok_or(HeapError::IllegalPrimitiveType { tag, offset: position })?;

        let class_id = self
            .build
            .primitive_array_class(element_type)?
            .ok_or(HeapError::MissingClass {
                class_address: 0,
                offset: position,
            })?;
        let class_address = self.build.identifiers.address_of(class_id).unwrap_or(0);

        let heap_size = self
            .build
            .layout
            .primitive_array_size(element_type, length as u64);
        self.build
            .add_object(id, class_id, &[class_address], heap_size, true)
    }
}
