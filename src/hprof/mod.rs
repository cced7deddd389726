//! HPROF binary heap dump decoding
//!
//! Pass 1 ([`pass1`]) scans the whole file once and reports objects, classes
//! and roots to a [`pass1::Pass1Handler`]. Pass 2 ([`pass2`]) revisits the
//! recorded object positions to extract outbound references once ids are fixed.

pub mod object_reader;
pub mod pass1;
pub mod pass2;
pub mod reader;
pub mod strictness;
pub mod threads;

use crate::{HeapError, HeapResult};
use reader::PositionReader;
use std::fmt;
use std::io::{Read, Seek};

/// Top-level record tags
pub mod record {
    pub const STRING_IN_UTF8: u8 = 0x01;
    pub const LOAD_CLASS: u8 = 0x02;
    pub const UNLOAD_CLASS: u8 = 0x03;
    pub const STACK_FRAME: u8 = 0x04;
    pub const STACK_TRACE: u8 = 0x05;
    pub const ALLOC_SITES: u8 = 0x06;
    pub const HEAP_SUMMARY: u8 = 0x07;
    pub const START_THREAD: u8 = 0x0a;
    pub const END_THREAD: u8 = 0x0b;
    pub const HEAP_DUMP: u8 = 0x0c;
    pub const CPU_SAMPLES: u8 = 0x0d;
    pub const CONTROL_SETTINGS: u8 = 0x0e;
    pub const HEAP_DUMP_SEGMENT: u8 = 0x1c;
    pub const HEAP_DUMP_END: u8 = 0x2c;

    /// Tag (1) + time offset (4) + length (4)
    pub const HEADER_LEN: u64 = 9;
}

/// Heap dump sub-record tags
pub mod sub_record {
    pub const ROOT_UNKNOWN: u8 = 0xff;
    pub const ROOT_JNI_GLOBAL: u8 = 0x01;
    pub const ROOT_JNI_LOCAL: u8 = 0x02;
    pub const ROOT_JAVA_FRAME: u8 = 0x03;
    pub const ROOT_NATIVE_STACK: u8 = 0x04;
    pub const ROOT_STICKY_CLASS: u8 = 0x05;
    pub const ROOT_THREAD_BLOCK: u8 = 0x06;
    pub const ROOT_MONITOR_USED: u8 = 0x07;
    pub const ROOT_THREAD_OBJECT: u8 = 0x08;
    pub const CLASS_DUMP: u8 = 0x20;
    pub const INSTANCE_DUMP: u8 = 0x21;
    pub const OBJECT_ARRAY_DUMP: u8 = 0x22;
    pub const PRIMITIVE_ARRAY_DUMP: u8 = 0x23;
}

/// HPROF format version from the header token
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Version {
    V1_0_1,
    V1_0_2,
    V1_0_3,
}

impl Version {
    pub const ALL: [Version; 3] = [Version::V1_0_1, Version::V1_0_2, Version::V1_0_3];

    pub fn label(self) -> &'static str {
        match self {
            Version::V1_0_1 => "JAVA PROFILE 1.0.1",
            Version::V1_0_2 => "JAVA PROFILE 1.0.2",
            Version::V1_0_3 => "JAVA PROFILE 1.0.3",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fixed file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HprofHeader {
    pub version: Version,
    /// Identifier width in bytes, 4 or 8
    pub id_size: usize,
    /// Milliseconds since the epoch
    pub timestamp_ms: i64,
}

const MAX_VERSION_LEN: usize = 32;

/// Read the version token, identifier size and timestamp
pub fn read_header<R: Read + Seek>(reader: &mut PositionReader<R>) -> HeapResult<HprofHeader> {
    let (token, consumed) = {
        let buf = reader.peek()?;
        let window = &buf[..buf.len().min(MAX_VERSION_LEN)];
        let nul = memchr::memchr(0, window).ok_or_else(|| {
            HeapError::InvalidHeader("missing NUL-terminated version string".into())
        })?;
        (String::from_utf8_lossy(&window[..nul]).into_owned(), nul + 1)
    };
    reader.consume(consumed);

    let version = Version::ALL
        .into_iter()
        .find(|v| v.label() == token)
        .ok_or_else(|| HeapError::InvalidHeader(format!("unknown version '{}'", token)))?;

    let id_size = reader.read_u32()?;
    if id_size != 4 && id_size != 8 {
        return Err(HeapError::UnsupportedIdentifierSize(id_size));
    }
    let timestamp_ms = reader.read_u64()? as i64;

    Ok(HprofHeader {
        version,
        id_size: id_size as usize,
        timestamp_ms,
    })
}
