//! Test-only HPROF writer and sample dumps
#![allow(dead_code)]

use std::path::{Path, PathBuf};

pub const TIMESTAMP_MS: u64 = 1_700_000_000_000;

pub mod tag {
    pub const BOOLEAN: u8 = 4;
    pub const OBJECT: u8 = 2;
    pub const BYTE: u8 = 8;
    pub const INT: u8 = 10;
    pub const LONG: u8 = 11;
}

fn put_id(out: &mut Vec<u8>, id_size: usize, value: u64) {
    if id_size == 4 {
        out.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        out.extend_from_slice(&value.to_be_bytes());
    }
}

/// Builds an HPROF byte stream record by record
pub struct HprofWriter {
    bytes: Vec<u8>,
    id_size: usize,
    time_offset: u32,
}

impl HprofWriter {
    pub fn new(id_size: usize) -> Self {
        let mut bytes = b"JAVA PROFILE 1.0.2\0".to_vec();
        bytes.extend_from_slice(&(id_size as u32).to_be_bytes());
        bytes.extend_from_slice(&TIMESTAMP_MS.to_be_bytes());
        Self {
            bytes,
            id_size,
            time_offset: 0,
        }
    }

    pub fn id_size(&self) -> usize {
        self.id_size
    }

    /// Raw record with an explicit declared length
    pub fn record_with_length(&mut self, tag: u8, declared: u32, body: &[u8]) -> &mut Self {
        self.bytes.push(tag);
        self.bytes.extend_from_slice(&self.time_offset.to_be_bytes());
        self.bytes.extend_from_slice(&declared.to_be_bytes());
        self.bytes.extend_from_slice(body);
        self
    }

    pub fn record(&mut self, tag: u8, body: &[u8]) -> &mut Self {
        self.record_with_length(tag, body.len() as u32, body)
    }

    pub fn advance_time_us(&mut self, micros: u32) -> &mut Self {
        self.time_offset += micros;
        self
    }

    /// Time offset of the following records, which may run backwards
    pub fn set_time_us(&mut self, micros: u32) -> &mut Self {
        self.time_offset = micros;
        self
    }

    pub fn string(&mut self, id: u64, text: &str) -> &mut Self {
        let mut body = Vec::new();
        put_id(&mut body, self.id_size, id);
        body.extend_from_slice(text.as_bytes());
        self.record(0x01, &body)
    }

    pub fn load_class(&mut self, serial: u32, address: u64, name_id: u64) -> &mut Self {
        let mut body = Vec::new();
        body.extend_from_slice(&serial.to_be_bytes());
        put_id(&mut body, self.id_size, address);
        body.extend_from_slice(&0u32.to_be_bytes());
        put_id(&mut body, self.id_size, name_id);
        self.record(0x02, &body)
    }

    /// String plus LOAD_CLASS in one go; the name id is derived from the address
    pub fn named_class(&mut self, serial: u32, address: u64, name: &str) -> &mut Self {
        let name_id = 0x9000_0000 + address;
        self.string(name_id, name);
        self.load_class(serial, address, name_id)
    }

    pub fn stack_frame(&mut self, frame_id: u64, method_id: u64, signature_id: u64, class_serial: u32, line: i32) -> &mut Self {
        let mut body = Vec::new();
        put_id(&mut body, self.id_size, frame_id);
        put_id(&mut body, self.id_size, method_id);
        put_id(&mut body, self.id_size, signature_id);
        put_id(&mut body, self.id_size, 0);
        body.extend_from_slice(&class_serial.to_be_bytes());
        body.extend_from_slice(&line.to_be_bytes());
        self.record(0x04, &body)
    }

    pub fn stack_trace(&mut self, serial: u32, thread_serial: u32, frames: &[u64]) -> &mut Self {
        let mut body = Vec::new();
        body.extend_from_slice(&serial.to_be_bytes());
        body.extend_from_slice(&thread_serial.to_be_bytes());
        body.extend_from_slice(&(frames.len() as u32).to_be_bytes());
        for frame in frames {
            put_id(&mut body, self.id_size, *frame);
        }
        self.record(0x05, &body)
    }

    pub fn heap_dump(&mut self, segment: &Segment) -> &mut Self {
        self.record(0x0c, &segment.bytes)
    }

    pub fn heap_dump_segment(&mut self, segment: &Segment) -> &mut Self {
        self.record(0x1c, &segment.bytes)
    }

    pub fn heap_dump_end(&mut self) -> &mut Self {
        self.record(0x2c, &[])
    }

    pub fn segment(&self) -> Segment {
        Segment {
            bytes: Vec::new(),
            id_size: self.id_size,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn write_to(&self, path: &Path) -> PathBuf {
        std::fs::write(path, &self.bytes).expect("write dump");
        path.to_path_buf()
    }
}

/// Heap dump sub-records
pub struct Segment {
    bytes: Vec<u8>,
    id_size: usize,
}

pub enum Value {
    Object(u64),
    Int(i32),
}

impl Segment {
    fn id(&mut self, value: u64) {
        put_id(&mut self.bytes, self.id_size, value);
    }

    fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn root_unknown(&mut self, address: u64) -> &mut Self {
        self.bytes.push(0xff);
        self.id(address);
        self
    }

    pub fn root_sticky_class(&mut self, address: u64) -> &mut Self {
        self.bytes.push(0x05);
        self.id(address);
        self
    }

    pub fn root_jni_global(&mut self, address: u64) -> &mut Self {
        self.bytes.push(0x01);
        self.id(address);
        self.id(0xdead);
        self
    }

    pub fn root_thread_object(&mut self, address: u64, thread_serial: u32) -> &mut Self {
        self.bytes.push(0x08);
        self.id(address);
        self.u32(thread_serial);
        self.u32(0);
        self
    }

    pub fn root_java_frame(&mut self, address: u64, thread_serial: u32, frame: i32) -> &mut Self {
        self.bytes.push(0x03);
        self.id(address);
        self.u32(thread_serial);
        self.u32(frame as u32);
        self
    }

    /// CLASS_DUMP with statics `(name id, value)` and fields `(name id, type tag)`
    pub fn class_dump(
        &mut self,
        address: u64,
        super_address: u64,
        loader_address: u64,
        statics: &[(u64, Value)],
        fields: &[(u64, u8)],
    ) -> &mut Self {
        self.bytes.push(0x20);
        self.id(address);
        self.u32(0);
        self.id(super_address);
        self.id(loader_address);
        for _ in 0..4 {
            self.id(0);
        }
        self.u32(0);
        self.bytes.extend_from_slice(&0u16.to_be_bytes());

        self.bytes.extend_from_slice(&(statics.len() as u16).to_be_bytes());
        for (name, value) in statics {
            self.id(*name);
            match value {
                Value::Object(address) => {
                    self.bytes.push(tag::OBJECT);
                    self.id(*address);
                }
                Value::Int(v) => {
                    self.bytes.push(tag::INT);
                    self.u32(*v as u32);
                }
            }
        }

        self.bytes.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (name, field_type) in fields {
            self.id(*name);
            self.bytes.push(*field_type);
        }
        self
    }

    /// INSTANCE_DUMP; `values` in layout order, subclass fields first
    pub fn instance(&mut self, address: u64, class_address: u64, values: &[Value]) -> &mut Self {
        let mut payload = Vec::new();
        for value in values {
            match value {
                Value::Object(a) => put_id(&mut payload, self.id_size, *a),
                Value::Int(v) => payload.extend_from_slice(&v.to_be_bytes()),
            }
        }
        self.raw_instance(address, class_address, &payload)
    }

    pub fn raw_instance(&mut self, address: u64, class_address: u64, payload: &[u8]) -> &mut Self {
        self.bytes.push(0x21);
        self.id(address);
        self.u32(0);
        self.id(class_address);
        self.u32(payload.len() as u32);
        self.bytes.extend_from_slice(payload);
        self
    }

    pub fn object_array(&mut self, address: u64, class_address: u64, elements: &[u64]) -> &mut Self {
        self.bytes.push(0x22);
        self.id(address);
        self.u32(0);
        self.u32(elements.len() as u32);
        self.id(class_address);
        for element in elements {
            self.id(*element);
        }
        self
    }

    pub fn primitive_array(&mut self, address: u64, type_tag: u8, length: u32, element_size: usize) -> &mut Self {
        self.bytes.push(0x23);
        self.id(address);
        self.u32(0);
        self.u32(length);
        self.bytes.push(type_tag);
        self.bytes
            .extend(std::iter::repeat(0u8).take(length as usize * element_size));
        self
    }
}

// Addresses of the sample heap
pub const OBJECT_CLASS: u64 = 0x1000;
pub const NODE_CLASS: u64 = 0x1010;
pub const REF_CLASS: u64 = 0x1020;
pub const OBJECT_ARRAY_CLASS: u64 = 0x1030;
pub const N1: u64 = 0x2000;
pub const N2: u64 = 0x2010;
pub const N3: u64 = 0x2020;
pub const REF: u64 = 0x2030;
pub const N4: u64 = 0x2040;
pub const N5: u64 = 0x2050;
pub const ARRAY: u64 = 0x2060;
pub const BYTES: u64 = 0x2080;

// Field name ids
pub const NEXT: u64 = 0x501;
pub const VALUE: u64 = 0x502;
pub const REFERENT: u64 = 0x503;
pub const INSTANCES: u64 = 0x504;

/// Declared classes and strings of the sample heap
pub fn sample_classes(writer: &mut HprofWriter) {
    writer
        .string(NEXT, "next")
        .string(VALUE, "value")
        .string(REFERENT, "referent")
        .string(INSTANCES, "instances")
        .named_class(1, OBJECT_CLASS, "java/lang/Object")
        .named_class(2, NODE_CLASS, "com/example/Node")
        .named_class(3, REF_CLASS, "java/lang/ref/Reference")
        .named_class(4, OBJECT_ARRAY_CLASS, "[Ljava/lang/Object;");
}

/// Class dumps of the sample heap
pub fn sample_class_dumps(segment: &mut Segment) {
    segment
        .class_dump(OBJECT_CLASS, 0, 0, &[], &[])
        .class_dump(
            NODE_CLASS,
            OBJECT_CLASS,
            0,
            &[(INSTANCES, Value::Int(3))],
            &[(NEXT, tag::OBJECT), (VALUE, tag::INT)],
        )
        .class_dump(REF_CLASS, OBJECT_CLASS, 0, &[], &[(REFERENT, tag::OBJECT), (NEXT, tag::OBJECT)])
        .class_dump(OBJECT_ARRAY_CLASS, OBJECT_CLASS, 0, &[], &[]);
}

/// A small heap:
///
/// ```text
/// ARRAY (root) -> [N1, null, REF]
/// N1 -> N2       N3 -> N1 (garbage)
/// REF.referent -> N4, REF.next -> N5
/// BYTES: byte[5], unreferenced, its class is never declared
/// ```
pub fn sample_dump(id_size: usize) -> HprofWriter {
    let mut writer = HprofWriter::new(id_size);
    sample_classes(&mut writer);

    let mut segment = writer.segment();
    sample_class_dumps(&mut segment);
    segment
        .instance(N1, NODE_CLASS, &[Value::Object(N2), Value::Int(1)])
        .instance(N2, NODE_CLASS, &[Value::Object(0), Value::Int(2)])
        .instance(N3, NODE_CLASS, &[Value::Object(N1), Value::Int(3)])
        .instance(REF, REF_CLASS, &[Value::Object(N4), Value::Object(N5)])
        .instance(N4, NODE_CLASS, &[Value::Object(0), Value::Int(4)])
        .instance(N5, NODE_CLASS, &[Value::Object(0), Value::Int(5)])
        .object_array(ARRAY, OBJECT_ARRAY_CLASS, &[N1, 0, REF])
        .primitive_array(BYTES, tag::BYTE, 5, 1)
        .root_unknown(ARRAY);
    writer.heap_dump(&segment);
    writer
}

/// Write `writer` as `heap.hprof` in `dir`
pub fn write_dump(dir: &Path, writer: &HprofWriter) -> PathBuf {
    writer.write_to(&dir.join("heap.hprof"))
}

/// File names in `dir`, sorted
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
