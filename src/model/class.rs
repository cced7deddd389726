//! Class records captured from CLASS_DUMP sub-records

use super::types::FieldType;
use super::ObjectId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Name of the class every class object is an instance of
pub const JAVA_LANG_CLASS: &str = "java.lang.Class";

/// Name of the class of the synthetic system class loader at address 0
pub const JAVA_LANG_CLASSLOADER: &str = "java.lang.ClassLoader";

/// Name given to synthesized object-array classes
pub const UNKNOWN_ARRAY_CLASS: &str = "unknown-class[]";

/// Instance field layout entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// A decoded basic value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Object(u64),
    Boolean(bool),
    Char(u16),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Object(_) => FieldType::Object,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::Char(_) => FieldType::Char,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Byte(_) => FieldType::Byte,
            FieldValue::Short(_) => FieldType::Short,
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Long(_) => FieldType::Long,
        }
    }

    /// Referenced address, if this is a non-null reference
    pub fn as_reference(&self) -> Option<u64> {
        match *self {
            FieldValue::Object(address) if address != 0 => Some(address),
            _ => None,
        }
    }
}

/// Static field with its resolved value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticField {
    pub name: String,
    pub value: FieldValue,
}

/// A class declared in the dump (or synthesized when the dump lacks it)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassRecord {
    pub address: u64,
    pub name: String,
    pub super_address: u64,
    pub loader_address: u64,
    pub fields: Vec<FieldDescriptor>,
    pub statics: Vec<StaticField>,
    /// Position of the CLASS_DUMP sub-record; `None` for synthesized classes
    pub file_position: Option<u64>,

    // Derived during finalize
    pub object_id: ObjectId,
    pub super_id: Option<ObjectId>,
    pub loader_id: ObjectId,
    /// Heap size of one instance (reference width for array classes)
    pub instance_size: u64,
    /// Heap size of the class object itself
    pub class_size: u64,
    pub subclasses: Vec<ObjectId>,
    pub instance_count: u64,
    pub instances_heap_size: u64,
}

impl ClassRecord {
    pub fn new(
        address: u64,
        name: impl Into<String>,
        super_address: u64,
        loader_address: u64,
        statics: Vec<StaticField>,
        fields: Vec<FieldDescriptor>,
    ) -> Self {
        Self {
            address,
            name: name.into(),
            super_address,
            loader_address,
            fields,
            statics,
            file_position: None,
            object_id: 0,
            super_id: None,
            loader_id: 0,
            instance_size: 0,
            class_size: 0,
            subclasses: Vec::new(),
            instance_count: 0,
            instances_heap_size: 0,
        }
    }

    /// Synthesized placeholder without fields or statics
    pub fn synthesized(address: u64, name: impl Into<String>) -> Self {
        Self::new(address, name, 0, 0, Vec::new(), Vec::new())
    }

    pub fn with_position(mut self, position: u64) -> Self {
        self.file_position = Some(position);
        self
    }

    pub fn is_array_type(&self) -> bool {
        self.name.ends_with("[]")
    }

    pub fn has_super_class(&self) -> bool {
        self.super_address != 0
    }

    pub fn is_synthesized(&self) -> bool {
        self.file_position.is_none()
    }

    pub fn add_instance(&mut self, heap_size: u64) {
        self.instance_count += 1;
        self.instances_heap_size += heap_size;
    }

    /// Outbound references of the class object: its class, super class,
    /// loader, then every non-null static reference.
    pub fn references(&self, class_of_class: u64) -> Vec<u64> {
        let mut refs = Vec::with_capacity(3 + self.statics.len());
        refs.push(class_of_class);
        if self.super_address != 0 {
            refs.push(self.super_address);
        }
        refs.push(self.loader_address);
        refs.extend(self.statics.iter().filter_map(|s| s.value.as_reference()));
        refs
    }
}

/// Normalize a JVM-internal class name to the dotted display form.
///
/// `[[Ljava/lang/String;` becomes `java.lang.String[][]`, `[[I` becomes `int[][]`.
pub fn normalize_class_name(raw: &str) -> String {
    static OBJ_ARRAY: OnceLock<Regex> = OnceLock::new();
    static PRIMITIVE_ARRAY: OnceLock<Regex> = OnceLock::new();

    let name = raw.replace('/', ".");
    if !name.starts_with('[') {
        return name;
    }

    let obj_array = OBJ_ARRAY.get_or_init(|| Regex::new(r"^(\[+)L(.*);$").expect("valid regex"));
    if let Some(caps) = obj_array.captures(&name) {
        let dims = caps[1].len();
        return format!("{}{}", &caps[2], "[]".repeat(dims));
    }

    let primitive_array =
        PRIMITIVE_ARRAY.get_or_init(|| Regex::new(r"^(\[+)(.)$").expect("valid regex"));
    if let Some(caps) = primitive_array.captures(&name) {
        let extra_dims = caps[1].len() - 1;
        let base = caps[2]
            .chars()
            .next()
            .and_then(FieldType::from_signature)
            .map(|t| t.array_class_name())
            .unwrap_or("unknown[]");
        return format!("{}{}", base, "[]".repeat(extra_dims));
    }

    name
}
