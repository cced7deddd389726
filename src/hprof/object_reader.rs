//! Random-access reads of single objects from the dump

use super::reader::PositionReader;
use super::sub_record;
use crate::model::{ClassRecord, FieldDescriptor, FieldType, FieldValue, NamedReference};
use crate::{HeapError, HeapResult};
use std::fs::File;
use std::path::Path;

/// Decode one big-endian value from the start of `bytes`
pub(crate) fn decode_value(bytes: &[u8], field_type: FieldType, id_size: usize) -> FieldValue {
    let be = |n: usize| bytes[..n].iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
    match field_type {
        FieldType::Object => FieldValue::Object(be(id_size)),
        FieldType::Boolean => FieldValue::Boolean(bytes[0] != 0),
        FieldType::Char => FieldValue::Char(be(2) as u16),
        FieldType::Float => FieldValue::Float(f32::from_bits(be(4) as u32)),
        FieldType::Double => FieldValue::Double(f64::from_bits(be(8))),
        FieldType::Byte => FieldValue::Byte(bytes[0] as i8),
        FieldType::Short => FieldValue::Short(be(2) as i16),
        FieldType::Int => FieldValue::Int(be(4) as i32),
        FieldType::Long => FieldValue::Long(be(8) as i64),
    }
}

/// Walk an instance payload. Fields are laid out from `class` up through its
/// super classes; `f` sees every field that fits in `payload`. Returns the
/// number of bytes the class layout requires.
pub(crate) fn walk_instance_fields<'a>(
    payload: &[u8],
    class: &'a ClassRecord,
    lookup: impl Fn(u64) -> Option<&'a ClassRecord>,
    id_size: usize,
    max_depth: usize,
    mut f: impl FnMut(&'a FieldDescriptor, FieldValue),
) -> u64 {
    let mut offset = 0usize;
    let mut current = Some(class);
    let mut depth = 0usize;
    while let Some(level) = current {
        for field in &level.fields {
            let size = field.field_type.size(id_size);
            if offset + size <= payload.len() {
                f(field, decode_value(&payload[offset..], field.field_type, id_size));
            }
            offset += size;
        }
        depth += 1;
        if depth > max_depth || !level.has_super_class() {
            break;
        }
        current = lookup(level.super_address);
    }
    offset as u64
}

/// Re-reads objects at their recorded dump positions
pub struct ObjectReader {
    reader: PositionReader<File>,
    id_size: usize,
}

impl ObjectReader {
    pub fn open(dump: &Path, id_size: usize) -> HeapResult<Self> {
        let file = File::open(dump)?;
        Ok(Self {
            reader: PositionReader::with_capacity(64 * 1024, file),
            id_size,
        })
    }

    /// Field or slot references of the instance or array at `position`.
    /// The class reference is not included.
    pub fn named_references<'a>(
        &mut self,
        position: u64,
        lookup: impl Fn(u64) -> Option<&'a ClassRecord>,
        max_depth: usize,
    ) -> HeapResult<Vec<NamedReference>> {
        let id_size = self.id_size;
        let reader = &mut self.reader;
        reader.seek_to(position)?;
        let tag = reader.read_u8()?;
        let mut refs = Vec::new();

        match tag {
            sub_record::INSTANCE_DUMP => {
                reader.read_id(id_size)?;
                reader.skip(4)?;
                let class_address = reader.read_id(id_size)?;
                let length = reader.read_u32()? as usize;
                let payload = reader.read_bytes(length)?;
                let class = lookup(class_address).ok_or(HeapError::MissingClass {
                    class_address,
                    offset: position,
                })?;
                walk_instance_fields(&payload, class, &lookup, id_size, max_depth, |field, value| {
                    if let Some(address) = value.as_reference() {
                        refs.push(NamedReference::new(field.name.clone(), address));
                    }
                });
            }
            sub_record::OBJECT_ARRAY_DUMP => {
                reader.read_id(id_size)?;
                reader.skip(4)?;
                let length = reader.read_u32()?;
                reader.read_id(id_size)?;
                for i in 0..length {
                    let address = reader.read_id(id_size)?;
                    if address != 0 {
                        refs.push(NamedReference::new(format!("[{}]", i), address));
                    }
                }
            }
            sub_record::PRIMITIVE_ARRAY_DUMP => {}
            _ => return Err(HeapError::InvalidSubRecord { tag, offset: position }),
        }
        Ok(refs)
    }
}
