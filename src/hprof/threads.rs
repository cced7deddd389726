//! Stack traces and thread locals collected during pass 1

use crate::model::GcRootKind;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StackFrame {
    pub method: String,
    pub signature: String,
    pub source_file: String,
    pub class_serial: u32,
    /// `> 0` line, `0`/`-1` unknown, `-2` compiled, `-3` native
    pub line: i32,
}

#[derive(Debug, Clone)]
pub struct StackTrace {
    pub thread_serial: u32,
    pub frame_ids: Vec<u64>,
}

/// A root held by a thread's stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JavaLocal {
    pub address: u64,
    pub frame: i32,
    pub kind: GcRootKind,
}

/// Thread and stack bookkeeping. Resolves names eagerly so the string pool can go.
#[derive(Debug, Default)]
pub struct ThreadStacks {
    frames: FxHashMap<u64, StackFrame>,
    traces: BTreeMap<u32, StackTrace>,
    thread_objects: FxHashMap<u32, u64>,
    locals: FxHashMap<u32, Vec<JavaLocal>>,
    class_serials: FxHashMap<u32, u64>,
    class_names: FxHashMap<u64, String>,
}

impl ThreadStacks {
    pub fn add_frame(&mut self, frame_id: u64, frame: StackFrame) {
        self.frames.insert(frame_id, frame);
    }

    pub fn add_trace(&mut self, serial: u32, trace: StackTrace) {
        self.traces.insert(serial, trace);
    }

    pub fn add_loaded_class(&mut self, class_serial: u32, address: u64, name: String) {
        self.class_serials.insert(class_serial, address);
        self.class_names.insert(address, name);
    }

    /// Name from LOAD_CLASS, with slashes already replaced
    pub fn loaded_class_name(&self, address: u64) -> Option<&str> {
        self.class_names.get(&address).map(String::as_str)
    }

    pub fn add_thread_object(&mut self, thread_serial: u32, address: u64) {
        self.thread_objects.insert(thread_serial, address);
    }

    pub fn thread_address(&self, thread_serial: u32) -> Option<u64> {
        self.thread_objects.get(&thread_serial).copied()
    }

    pub fn add_local(&mut self, thread_serial: u32, local: JavaLocal) {
        self.locals.entry(thread_serial).or_default().push(local);
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    fn format_frame(&self, frame: &StackFrame) -> String {
        let class_name = self
            .class_serials
            .get(&frame.class_serial)
            .and_then(|address| self.class_names.get(address))
            .map(String::as_str)
            .unwrap_or("<UNKNOWN CLASS>");

        let location = match frame.line {
            line if line > 0 => format!("({}:{})", frame.source_file, line),
            0 | -1 => "(Unknown Source)".to_string(),
            -2 => "(Compiled method)".to_string(),
            -3 => "(Native Method)".to_string(),
            _ => String::new(),
        };

        format!(
            "  at {}.{}{} {}",
            class_name, frame.method, frame.signature, location
        )
    }

    /// Text report of every thread with a known thread object
    pub fn render(&self) -> String {
        let mut out = String::new();
        for trace in self.traces.values() {
            let Some(thread) = self.thread_address(trace.thread_serial) else {
                continue;
            };
            let _ = writeln!(out, "Thread 0x{:x}", thread);
            for frame_id in &trace.frame_ids {
                match self.frames.get(frame_id) {
                    Some(frame) => {
                        let _ = writeln!(out, "{}", self.format_frame(frame));
                    }
                    None => {
                        let _ = writeln!(out, "  at <unknown frame 0x{:x}>", frame_id);
                    }
                }
            }
            let _ = writeln!(out, "  locals:");
            if let Some(locals) = self.locals.get(&trace.thread_serial) {
                for local in locals {
                    let _ = writeln!(
                        out,
                        "    objectId=0x{:x}, line={}",
                        local.address, local.frame
                    );
                }
            }
            let _ = writeln!(out);
        }
        out
    }

    /// One empty trace is always present in dumps without stack information
    pub fn has_stacks(&self) -> bool {
        self.traces.len() > 1
    }

    pub fn write_report(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.render())
    }
}

/// `<prefix>threads` next to the other index files
pub fn threads_report_path(prefix: &Path) -> PathBuf {
    crate::index::prefixed_path(prefix, "threads")
}
