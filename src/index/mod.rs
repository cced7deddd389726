//! Persisted index files
//!
//! Every index is a little-endian file with a 16 byte header:
//!
//! ```text
//! 0..4   magic "HGIX"
//! 4..6   format version
//! 6      index kind
//! 7      value width in bytes (0 for one-to-many)
//! 8..16  entry count
//! ```
//!
//! Fixed-width indices follow with `count * width` bytes. One-to-many indices
//! follow with `count` u64 body offsets, `count` u32 lengths, then a body of u32 ids.

pub mod adjacency;
pub mod identifiers;
pub mod keyed;
pub mod reader;
pub mod writer;

pub use adjacency::{Adjacency, AdjacencyList};
pub use identifiers::{IdentifierBuilder, Identifiers};
pub use keyed::{AddressKeyed, IdKeyed};
pub use reader::{IntIndex, LongIndex, One2ManyIndex};
pub use writer::{OutboundWriter, PendingFiles};

use crate::{HeapError, HeapResult};
use memmap2::Mmap;
use std::ops::Deref;
use std::path::{Path, PathBuf};

pub const MAGIC: &[u8; 4] = b"HGIX";
pub const VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 16;

/// File name suffix of the bitcode metadata file
pub const META_SUFFIX: &str = "meta.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IndexKind {
    /// id -> address, sorted by address
    Identifiers = 1,
    /// id -> class id
    ObjectToClass = 2,
    /// id -> position of the record in the dump
    ObjectToPosition = 3,
    /// id -> encoded array heap size
    ArrayToSize = 4,
    Outbound = 5,
    Inbound = 6,
}

impl IndexKind {
    pub const ALL: [IndexKind; 6] = [
        IndexKind::Identifiers,
        IndexKind::ObjectToClass,
        IndexKind::ObjectToPosition,
        IndexKind::ArrayToSize,
        IndexKind::Outbound,
        IndexKind::Inbound,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            IndexKind::Identifiers => "idx.index",
            IndexKind::ObjectToClass => "o2c.index",
            IndexKind::ObjectToPosition => "o2hprof.index",
            IndexKind::ArrayToSize => "a2size.index",
            IndexKind::Outbound => "outbound.index",
            IndexKind::Inbound => "inbound.index",
        }
    }

    /// Value width in bytes; 0 for one-to-many indices
    pub fn width(self) -> u8 {
        match self {
            IndexKind::Identifiers | IndexKind::ObjectToPosition => 8,
            IndexKind::ObjectToClass | IndexKind::ArrayToSize => 4,
            IndexKind::Outbound | IndexKind::Inbound => 0,
        }
    }
}

/// Where a build keeps its indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStorage {
    /// Files named `<prefix><suffix>`
    Disk { prefix: PathBuf },
    /// Owned buffers with the same layout
    Memory,
}

/// `<prefix><suffix>`, e.g. `heap.idx.index` for prefix `heap.`
pub fn prefixed_path(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn index_path(prefix: &Path, kind: IndexKind) -> PathBuf {
    prefixed_path(prefix, kind.suffix())
}

/// Default prefix for a dump: `dir/heap.hprof` -> `dir/heap.`
pub fn default_prefix(dump: &Path) -> PathBuf {
    let stem = dump
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    let mut name = stem;
    name.push(".");
    dump.with_file_name(name)
}

/// Bytes of an index, either mapped from disk or owned
pub enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Backing {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Backing::Mapped(mmap) => mmap,
            Backing::Owned(bytes) => bytes,
        }
    }
}

impl Backing {
    pub fn is_mapped(&self) -> bool {
        matches!(self, Backing::Mapped(_))
    }
}

pub(crate) fn encode_header(kind: IndexKind, count: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = kind as u8;
    header[7] = kind.width();
    header[8..16].copy_from_slice(&count.to_le_bytes());
    header
}

/// Validate a header and return the entry count
pub(crate) fn decode_header(bytes: &[u8], kind: IndexKind, source: &Path) -> HeapResult<usize> {
    let corrupt = |reason: String| HeapError::CorruptIndex {
        path: source.to_path_buf(),
        reason,
    };

    if bytes.len() < HEADER_SIZE {
        return Err(corrupt(format!(
            "size {} is smaller than header size {}",
            bytes.len(),
            HEADER_SIZE
        )));
    }
    if &bytes[0..4] != MAGIC {
        return Err(corrupt("bad magic".into()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(corrupt(format!("unsupported version {}", version)));
    }
    if bytes[6] != kind as u8 || bytes[7] != kind.width() {
        return Err(corrupt(format!(
            "expected {:?} index, found kind {} width {}",
            kind, bytes[6], bytes[7]
        )));
    }
    let count = read_u64(bytes, 8);
    usize::try_from(count).map_err(|_| corrupt(format!("entry count {} too large", count)))
}

#[inline]
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

#[inline]
pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

const SIZE_FLAG: u32 = 0x8000_0000;

/// Encode an array heap size in 32 bits. Sizes of 2^31 and above are stored
/// divided by 8 with the high bit set; object sizes are multiples of 8.
pub fn encode_size(size: u64) -> u32 {
    if size < SIZE_FLAG as u64 {
        size as u32
    } else {
        let scaled = (size / 8).min((SIZE_FLAG - 1) as u64) as u32;
        SIZE_FLAG | scaled
    }
}

pub fn decode_size(encoded: u32) -> u64 {
    if encoded & SIZE_FLAG == 0 {
        encoded as u64
    } else {
        ((encoded & !SIZE_FLAG) as u64) * 8
    }
}

/// Index of `target` in a sorted sequence of `len` values read through `get`
pub fn binary_search_by_index(len: usize, target: u64, get: impl Fn(usize) -> u64) -> Option<usize> {
    let (mut low, mut high) = (0usize, len);
    while low < high {
        let mid = low + (high - low) / 2;
        let value = get(mid);
        if value < target {
            low = mid + 1;
        } else if value > target {
            high = mid;
        } else {
            return Some(mid);
        }
    }
    None
}
