//! Object layout: alignment inference and heap size computation

use crate::model::{ClassRecord, FieldType};
use serde::{Deserialize, Serialize};

pub const MIN_ALIGNMENT: u64 = 8;
pub const MAX_ALIGNMENT: u64 = 256;

#[inline]
pub fn align_up(n: u64, x: u64) -> u64 {
    let r = n % x;
    if r == 0 {
        n
    } else {
        n + x - r
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// Object alignment: the GCD of gaps between consecutive sorted addresses,
/// clamped to `[8, 256]`. Address 0 and the first gap from 0 are ignored.
pub fn infer_alignment(sorted_addresses: impl IntoIterator<Item = u64>) -> u64 {
    let mut previous = 0u64;
    let mut align = 0u64;
    for address in sorted_addresses {
        if address == 0 {
            continue;
        }
        let gap = address - previous;
        previous = address;
        if gap == address {
            continue;
        }
        align = if align == 0 { gap } else { gcd(align, gap) };
        if align <= MIN_ALIGNMENT {
            break;
        }
    }
    align.clamp(MIN_ALIGNMENT, MAX_ALIGNMENT)
}

/// Header and reference widths of the dumped VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapLayout {
    /// Uncompressed pointer width in object headers
    pub pointer_size: u64,
    /// Reference width in the heap, 4 with compressed references
    pub ref_size: u64,
    pub object_align: u64,
}

impl HeapLayout {
    pub fn new(pointer_size: usize, ref_size: usize, object_align: u64) -> Self {
        Self {
            pointer_size: pointer_size as u64,
            ref_size: ref_size as u64,
            object_align,
        }
    }

    /// Object header: mark word plus class pointer
    pub fn header_size(&self) -> u64 {
        self.pointer_size + self.ref_size
    }

    pub fn field_size(&self, field_type: FieldType) -> u64 {
        match field_type {
            FieldType::Object => self.ref_size,
            t => t.size(0) as u64,
        }
    }

    fn own_fields_size(&self, class: &ClassRecord) -> u64 {
        class
            .fields
            .iter()
            .map(|f| self.field_size(f.field_type))
            .sum()
    }

    /// Unaligned instance size of `class`. Each level of the hierarchy adds its
    /// own fields on top of its super class and rounds to the reference width;
    /// the header sits at the root. A super class missing from the dump counts
    /// as the root.
    pub fn hierarchy_size<'a>(
        &self,
        class: &'a ClassRecord,
        lookup: impl Fn(u64) -> Option<&'a ClassRecord>,
        max_depth: usize,
    ) -> u64 {
        let mut chain = vec![class];
        let mut current = class;
        while current.has_super_class() && chain.len() <= max_depth {
            match lookup(current.super_address) {
                Some(parent) => {
                    chain.push(parent);
                    current = parent;
                }
                None => break,
            }
        }

        chain.iter().rev().fold(self.header_size(), |size, level| {
            align_up(self.own_fields_size(level) + size, self.ref_size)
        })
    }

    /// Heap size of one instance; array classes report the reference width
    pub fn instance_size<'a>(
        &self,
        class: &'a ClassRecord,
        lookup: impl Fn(u64) -> Option<&'a ClassRecord>,
        max_depth: usize,
    ) -> u64 {
        if class.is_array_type() {
            self.ref_size
        } else {
            align_up(self.hierarchy_size(class, lookup, max_depth), self.object_align)
        }
    }

    /// Heap size of the class object: its static fields, aligned
    pub fn class_size(&self, class: &ClassRecord) -> u64 {
        let statics: u64 = class
            .statics
            .iter()
            .map(|s| self.field_size(s.value.field_type()))
            .sum();
        align_up(statics, self.object_align)
    }

    pub fn object_array_size(&self, length: u64) -> u64 {
        align_up(
            self.header_size() + 4 + length * self.ref_size,
            self.object_align,
        )
    }

    pub fn primitive_array_size(&self, element_type: FieldType, length: u64) -> u64 {
        align_up(
            align_up(self.header_size() + 4, self.ref_size)
                + length * self.field_size(element_type),
            self.object_align,
        )
    }
}
