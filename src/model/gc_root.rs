//! Garbage collection roots

use super::ObjectId;
use serde::{Deserialize, Serialize};

/// Why an object is kept alive outside the object graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GcRootKind {
    Unknown,
    SystemClass,
    NativeLocal,
    ThreadBlock,
    BusyMonitor,
    JavaLocal,
    NativeStack,
    ThreadObject,
}

impl GcRootKind {
    pub fn name(self) -> &'static str {
        match self {
            GcRootKind::Unknown => "Unknown",
            GcRootKind::SystemClass => "System Class",
            GcRootKind::NativeLocal => "JNI Local",
            GcRootKind::ThreadBlock => "Thread Block",
            GcRootKind::BusyMonitor => "Busy Monitor",
            GcRootKind::JavaLocal => "Java Local",
            GcRootKind::NativeStack => "Native Stack",
            GcRootKind::ThreadObject => "Thread",
        }
    }
}

/// A root observed in the dump, keyed by addresses until identifiers are frozen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGcRoot {
    pub address: u64,
    /// Owning thread object address, 0 for global roots
    pub context_address: u64,
    pub kind: GcRootKind,
    /// Frame number in the owning thread's stack trace, when the record carries one
    pub frame: Option<i32>,
}

/// A root resolved to object ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcRootInfo {
    pub object_id: ObjectId,
    pub address: u64,
    pub kind: GcRootKind,
    pub context_id: Option<ObjectId>,
    pub context_address: u64,
    pub frame: Option<i32>,
}
