//! Index writers and the commit guard

use super::adjacency::Adjacency;
use super::{encode_header, IndexKind, HEADER_SIZE};
use crate::model::ObjectId;
use crate::HeapResult;
use memmap2::MmapOptions;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Files written under a temporary name and renamed together on commit.
///
/// Dropping an uncommitted set deletes every temporary file, so a failed or
/// cancelled build leaves nothing behind.
#[derive(Debug, Default)]
pub struct PendingFiles {
    staged: Vec<(PathBuf, PathBuf)>,
    scratch: Vec<PathBuf>,
    committed: bool,
}

impl PendingFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `target` and return the temporary path to write instead
    pub fn stage(&mut self, target: PathBuf) -> PathBuf {
        let tmp = tmp_path(&target);
        self.staged.push((tmp.clone(), target));
        tmp
    }

    /// Drop a staged file, deleting its temporary copy
    pub fn discard(&mut self, target: &Path) {
        if let Some(pos) = self.staged.iter().position(|(_, t)| t == target) {
            let (tmp, _) = self.staged.remove(pos);
            remove_quietly(&tmp);
        }
    }

    /// Register a scratch file that is always deleted
    pub fn scratch(&mut self, path: PathBuf) -> PathBuf {
        self.scratch.push(path.clone());
        path
    }

    /// Rename every staged file into place.
    ///
    /// If a rename fails, the targets renamed so far are removed again.
    pub fn commit(mut self) -> HeapResult<Vec<PathBuf>> {
        let mut committed: Vec<PathBuf> = Vec::with_capacity(self.staged.len());
        for (tmp, target) in &self.staged {
            if let Err(e) = std::fs::rename(tmp, target) {
                warn!("Failed to commit {}: {}", target.display(), e);
                for path in &committed {
                    remove_quietly(path);
                }
                return Err(e.into());
            }
            committed.push(target.clone());
        }
        self.committed = true;
        debug!("Committed {} index files", committed.len());
        Ok(committed)
    }
}

impl Drop for PendingFiles {
    fn drop(&mut self) {
        for path in &self.scratch {
            remove_quietly(path);
        }
        if !self.committed {
            for (tmp, _) in &self.staged {
                remove_quietly(tmp);
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn fill_ints(bytes: &mut [u8], kind: IndexKind, values: &[u32]) {
    bytes[..HEADER_SIZE].copy_from_slice(&encode_header(kind, values.len() as u64));
    for (chunk, value) in bytes[HEADER_SIZE..].chunks_exact_mut(4).zip(values) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
}

fn fill_longs(bytes: &mut [u8], kind: IndexKind, values: &[u64]) {
    bytes[..HEADER_SIZE].copy_from_slice(&encode_header(kind, values.len() as u64));
    for (chunk, value) in bytes[HEADER_SIZE..].chunks_exact_mut(8).zip(values) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
}

pub fn encode_ints(kind: IndexKind, values: &[u32]) -> Vec<u8> {
    let mut bytes = vec![0u8; HEADER_SIZE + values.len() * 4];
    fill_ints(&mut bytes, kind, values);
    bytes
}

pub fn encode_longs(kind: IndexKind, values: &[u64]) -> Vec<u8> {
    let mut bytes = vec![0u8; HEADER_SIZE + values.len() * 8];
    fill_longs(&mut bytes, kind, values);
    bytes
}

fn write_mapped(path: &Path, total_size: usize, fill: impl FnOnce(&mut [u8])) -> HeapResult<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(total_size as u64)?;

    // SAFETY: We just created the file and set its length to total_size.
    // The mutable mapping is the only reference to this file and does not
    // outlive this function.
    let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    fill(&mut mmap[..]);
    mmap.flush()?;
    Ok(())
}

pub fn write_ints(path: &Path, kind: IndexKind, values: &[u32]) -> HeapResult<()> {
    write_mapped(path, HEADER_SIZE + values.len() * 4, |bytes| {
        fill_ints(bytes, kind, values)
    })
}

pub fn write_longs(path: &Path, kind: IndexKind, values: &[u64]) -> HeapResult<()> {
    write_mapped(path, HEADER_SIZE + values.len() * 8, |bytes| {
        fill_longs(bytes, kind, values)
    })
}

enum BodySink {
    Memory(Vec<u8>),
    Spill { writer: BufWriter<File>, path: PathBuf },
}

/// Appends id lists in any id order; offsets and lengths are kept per id
pub struct OutboundWriter {
    starts: Vec<u64>,
    lengths: Vec<u32>,
    body: BodySink,
    body_len: u64,
}

impl OutboundWriter {
    pub fn in_memory(object_count: usize) -> Self {
        Self {
            starts: vec![0; object_count],
            lengths: vec![0; object_count],
            body: BodySink::Memory(Vec::new()),
            body_len: 0,
        }
    }

    /// Spill list bodies to `path` while offsets stay in memory
    pub fn spilled(object_count: usize, path: PathBuf) -> HeapResult<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            starts: vec![0; object_count],
            lengths: vec![0; object_count],
            body: BodySink::Spill {
                writer: BufWriter::with_capacity(1 << 20, file),
                path,
            },
            body_len: 0,
        })
    }

    pub fn object_count(&self) -> usize {
        self.starts.len()
    }

    /// Store the list of `id`, replacing any earlier one
    pub fn log(&mut self, id: ObjectId, targets: &[ObjectId]) -> HeapResult<()> {
        let index = id as usize;
        self.starts[index] = self.body_len;
        self.lengths[index] = targets.len() as u32;
        match &mut self.body {
            BodySink::Memory(bytes) => {
                for target in targets {
                    bytes.extend_from_slice(&target.to_le_bytes());
                }
            }
            BodySink::Spill { writer, .. } => {
                for target in targets {
                    writer.write_all(&target.to_le_bytes())?;
                }
            }
        }
        self.body_len += targets.len() as u64 * 4;
        Ok(())
    }

    pub fn finish(self) -> HeapResult<One2ManyParts> {
        let body = match self.body {
            BodySink::Memory(bytes) => PartsBody::Memory(bytes),
            BodySink::Spill { writer, path } => {
                writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                PartsBody::File(path)
            }
        };
        Ok(One2ManyParts {
            starts: self.starts,
            lengths: self.lengths,
            body,
        })
    }
}

enum PartsBody {
    Memory(Vec<u8>),
    File(PathBuf),
}

/// A complete one-to-many index ready to be serialized
pub struct One2ManyParts {
    starts: Vec<u64>,
    lengths: Vec<u32>,
    body: PartsBody,
}

impl One2ManyParts {
    pub fn object_count(&self) -> usize {
        self.starts.len()
    }

    pub fn write_to<W: Write>(&self, kind: IndexKind, out: &mut W) -> HeapResult<()> {
        out.write_all(&encode_header(kind, self.starts.len() as u64))?;
        for start in &self.starts {
            out.write_all(&start.to_le_bytes())?;
        }
        for length in &self.lengths {
            out.write_all(&length.to_le_bytes())?;
        }
        match &self.body {
            PartsBody::Memory(bytes) => out.write_all(bytes)?,
            PartsBody::File(path) => {
                let mut file = File::open(path)?;
                io::copy(&mut file, out)?;
            }
        }
        Ok(())
    }

    pub fn write_file(&self, kind: IndexKind, path: &Path) -> HeapResult<()> {
        let mut out = BufWriter::with_capacity(1 << 20, File::create(path)?);
        self.write_to(kind, &mut out)?;
        out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(())
    }

    pub fn to_bytes(&self, kind: IndexKind) -> HeapResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.write_to(kind, &mut bytes)?;
        Ok(bytes)
    }
}

/// Referrers of every object, derived from the outbound lists.
///
/// Each list is in ascending referrer order without duplicates.
pub fn derive_inbound<A: Adjacency>(outbound: &A) -> One2ManyParts {
    let count = outbound.object_count();
    let mut counts = vec![0u64; count];
    for source in 0..count as ObjectId {
        outbound.for_each_outbound(source, |target| {
            if let Some(c) = counts.get_mut(target as usize) {
                *c += 1;
            }
        });
    }

    let mut offsets = Vec::with_capacity(count);
    let mut total = 0u64;
    for c in &counts {
        offsets.push(total);
        total += c;
    }
    drop(counts);

    let mut slots = vec![0 as ObjectId; total as usize];
    let mut fill = offsets.clone();
    for source in 0..count as ObjectId {
        outbound.for_each_outbound(source, |target| {
            let t = target as usize;
            if t >= count {
                return;
            }
            let next = fill[t] as usize;
            // repeated edge from the same source
            if fill[t] > offsets[t] && slots[next - 1] == source {
                return;
            }
            slots[next] = source;
            fill[t] += 1;
        });
    }

    let lengths = fill
        .iter()
        .zip(&offsets)
        .map(|(end, start)| (end - start) as u32)
        .collect();
    let starts = offsets.iter().map(|o| o * 4).collect();
    let mut body = Vec::with_capacity(slots.len() * 4);
    for slot in slots {
        body.extend_from_slice(&slot.to_le_bytes());
    }

    One2ManyParts {
        starts,
        lengths,
        body: PartsBody::Memory(body),
    }
}
