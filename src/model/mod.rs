//! Heap model: type tags, classes and GC roots

pub mod class;
pub mod gc_root;
pub mod types;

pub use class::{
    normalize_class_name, ClassRecord, FieldDescriptor, FieldValue, StaticField, JAVA_LANG_CLASS,
    JAVA_LANG_CLASSLOADER, UNKNOWN_ARRAY_CLASS,
};
pub use gc_root::{GcRootInfo, GcRootKind, RawGcRoot};
pub use types::FieldType;

/// Dense object identifier: the rank of an object's address in the sorted identifier table
pub type ObjectId = u32;

/// A named outbound reference of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedReference {
    /// Field name, `<class>`, `<super>`, `<classloader>` or `[i]` for array slots
    pub name: String,
    pub address: u64,
}

impl NamedReference {
    pub fn new(name: impl Into<String>, address: u64) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}
