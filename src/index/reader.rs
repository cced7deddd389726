//! Random-access index readers over mapped files or owned bytes

use super::adjacency::Adjacency;
use super::{decode_header, read_u32, read_u64, Backing, IndexKind, HEADER_SIZE};
use crate::model::ObjectId;
use crate::{HeapError, HeapResult};
use memmap2::MmapOptions;
use std::fs::File;
use std::path::Path;

fn map_file(path: &Path) -> HeapResult<Backing> {
    let file = File::open(path)?;
    // SAFETY: We only create a read-only mapping of a file we successfully opened.
    // Index files are never modified after commit.
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    Ok(Backing::Mapped(mmap))
}

fn corrupt(source: &Path, reason: String) -> HeapError {
    HeapError::CorruptIndex {
        path: source.to_path_buf(),
        reason,
    }
}

fn check_fixed(bytes: &[u8], kind: IndexKind, source: &Path) -> HeapResult<usize> {
    let count = decode_header(bytes, kind, source)?;
    let expected = count
        .checked_mul(kind.width() as usize)
        .and_then(|n| n.checked_add(HEADER_SIZE))
        .ok_or_else(|| corrupt(source, "entry region size overflow".into()))?;
    if expected != bytes.len() {
        return Err(corrupt(
            source,
            format!("expected {} bytes for {} entries, found {}", expected, count, bytes.len()),
        ));
    }
    Ok(count)
}

/// Fixed-width u32 values by id
pub struct IntIndex {
    backing: Backing,
    count: usize,
}

impl IntIndex {
    pub fn open(path: &Path, kind: IndexKind) -> HeapResult<Self> {
        let backing = map_file(path)?;
        let count = check_fixed(&backing, kind, path)?;
        Ok(Self { backing, count })
    }

    pub fn from_bytes(bytes: Vec<u8>, kind: IndexKind) -> HeapResult<Self> {
        let count = check_fixed(&bytes, kind, Path::new("<memory>"))?;
        Ok(Self {
            backing: Backing::Owned(bytes),
            count,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<u32> {
        (index < self.count).then(|| read_u32(&self.backing, HEADER_SIZE + index * 4))
    }
}

/// Fixed-width u64 values by id
pub struct LongIndex {
    backing: Backing,
    count: usize,
}

impl LongIndex {
    pub fn open(path: &Path, kind: IndexKind) -> HeapResult<Self> {
        let backing = map_file(path)?;
        let count = check_fixed(&backing, kind, path)?;
        Ok(Self { backing, count })
    }

    pub fn from_bytes(bytes: Vec<u8>, kind: IndexKind) -> HeapResult<Self> {
        let count = check_fixed(&bytes, kind, Path::new("<memory>"))?;
        Ok(Self {
            backing: Backing::Owned(bytes),
            count,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<u64> {
        (index < self.count).then(|| read_u64(&self.backing, HEADER_SIZE + index * 8))
    }
}

/// Variable fan-out id lists
pub struct One2ManyIndex {
    backing: Backing,
    count: usize,
    lengths_offset: usize,
    body_offset: usize,
}

impl One2ManyIndex {
    pub fn open(path: &Path, kind: IndexKind) -> HeapResult<Self> {
        let backing = map_file(path)?;
        Self::validate(backing, kind, path)
    }

    pub fn from_bytes(bytes: Vec<u8>, kind: IndexKind) -> HeapResult<Self> {
        Self::validate(Backing::Owned(bytes), kind, Path::new("<memory>"))
    }

    fn validate(backing: Backing, kind: IndexKind, source: &Path) -> HeapResult<Self> {
        let count = decode_header(&backing, kind, source)?;
        let lengths_offset = count
            .checked_mul(8)
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or_else(|| corrupt(source, "offset table size overflow".into()))?;
        let body_offset = count
            .checked_mul(4)
            .and_then(|n| n.checked_add(lengths_offset))
            .ok_or_else(|| corrupt(source, "length table size overflow".into()))?;
        if body_offset > backing.len() {
            return Err(corrupt(
                source,
                format!("tables end at {} but size is {}", body_offset, backing.len()),
            ));
        }

        let index = Self {
            backing,
            count,
            lengths_offset,
            body_offset,
        };
        let body_len = (index.backing.len() - body_offset) as u64;
        for id in 0..count {
            let (start, len) = index.entry(id);
            if start + len as u64 * 4 > body_len {
                return Err(corrupt(
                    source,
                    format!("list of id {} ends beyond the body ({} bytes)", id, body_len),
                ));
            }
        }
        Ok(index)
    }

    #[inline]
    fn entry(&self, index: usize) -> (u64, u32) {
        let start = read_u64(&self.backing, HEADER_SIZE + index * 8);
        let len = read_u32(&self.backing, self.lengths_offset + index * 4);
        (start, len)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.backing.is_mapped()
    }

    pub fn fan_out(&self, index: usize) -> usize {
        if index >= self.count {
            return 0;
        }
        self.entry(index).1 as usize
    }

    pub fn get(&self, index: usize) -> Vec<ObjectId> {
        let mut out = Vec::with_capacity(self.fan_out(index));
        self.for_each(index, |id| out.push(id));
        out
    }

    #[inline]
    pub fn for_each<F: FnMut(ObjectId)>(&self, index: usize, mut f: F) {
        if index >= self.count {
            return;
        }
        let (start, len) = self.entry(index);
        let base = self.body_offset + start as usize;
        for i in 0..len as usize {
            f(read_u32(&self.backing, base + i * 4));
        }
    }
}

impl Adjacency for One2ManyIndex {
    fn object_count(&self) -> usize {
        self.count
    }

    fn for_each_outbound<F: FnMut(ObjectId)>(&self, id: ObjectId, f: F) {
        self.for_each(id as usize, f);
    }

    fn footprint_bytes(&self) -> u64 {
        self.backing.len() as u64
    }
}
