//! Strictness modes, dump selection and failure cleanup

mod common;

use common::*;
use heapgraph::{
    build_index, CancellationToken, FormatViolation, HeapError, NullListener, ParserConfig,
    ProgressListener, Strictness,
};
use std::path::{Path, PathBuf};

/// Sample dump whose heap dump record declares 100 bytes more than the file holds
fn overrun_dump(dir: &Path) -> (PathBuf, u64) {
    let mut writer = HprofWriter::new(8);
    sample_classes(&mut writer);
    let mut segment = writer.segment();
    sample_class_dumps(&mut segment);
    segment
        .instance(N1, NODE_CLASS, &[Value::Object(0), Value::Int(1)])
        .root_unknown(N1);
    let offset = writer.bytes().len() as u64;
    writer.record_with_length(0x0c, segment.len() as u32 + 100, segment.as_bytes());
    (write_dump(dir, &writer), offset)
}

fn build_with(dump: &Path, config: &ParserConfig) -> heapgraph::HeapResult<heapgraph::BuildReport> {
    build_index(dump, config, &NullListener, &CancellationToken::new()).map(|(_, report)| report)
}

#[test]
fn test_overrun_stops_under_stop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (dump, offset) = overrun_dump(dir.path());

    let err = build_with(&dump, &ParserConfig::default()).unwrap_err();
    match err {
        HeapError::Stopped {
            source: FormatViolation::RecordOverrun {
                offset: at,
                length,
                available,
            },
        } => {
            assert_eq!(at, offset);
            assert_eq!(length, available + 100);
        }
        other => panic!("expected a stopped overrun, got {:?}", other),
    }
    assert_eq!(file_names(dir.path()), vec!["heap.hprof"]);
}

#[test]
fn test_overrun_warns_under_warn() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (dump, offset) = overrun_dump(dir.path());

    let config = ParserConfig::default().with_strictness(Strictness::Warn);
    let report = build_with(&dump, &config).expect("warn continues");
    let warnings: Vec<_> = report.warnings().collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].text.contains(&format!("byte {}", offset)));
    // loader, Class and ClassLoader fakes, four classes, one instance
    assert_eq!(report.object_count, 8);
}

#[test]
fn test_overrun_completes_under_permissive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (dump, _) = overrun_dump(dir.path());

    let config = ParserConfig::default().with_strictness(Strictness::Permissive);
    let report = build_with(&dump, &config).expect("permissive continues");
    assert_eq!(report.object_count, 8);
}

fn three_dumps() -> HprofWriter {
    let mut writer = HprofWriter::new(8);
    sample_classes(&mut writer);
    for dump in 0..3u64 {
        let mut segment = writer.segment();
        sample_class_dumps(&mut segment);
        for i in 0..=dump {
            let address = N1 + i * 0x10;
            segment
                .instance(address, NODE_CLASS, &[Value::Object(0), Value::Int(i as i32)])
                .root_unknown(address);
        }
        writer.advance_time_us(2_000_000).heap_dump(&segment);
    }
    writer
}

#[test]
fn test_multiple_dumps_need_a_selection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = write_dump(dir.path(), &three_dumps());

    let err = build_with(&dump, &ParserConfig::default()).unwrap_err();
    let dumps = err.available_dumps().expect("dump descriptors").to_vec();
    assert_eq!(dumps.len(), 3);
    assert_eq!(
        dumps.iter().map(|d| d.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(dumps[0].created_at_ms < dumps[1].created_at_ms);
    assert_eq!(dumps[1].created_at_ms, TIMESTAMP_MS as i64 + 4_000);
    assert_eq!(file_names(dir.path()), vec!["heap.hprof"]);
}

#[test]
fn test_selected_dump_is_indexed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = write_dump(dir.path(), &three_dumps());

    let config = ParserConfig::default().with_dump_index(Some(1));
    let (index, report) =
        build_index(&dump, &config, &NullListener, &CancellationToken::new()).expect("dump #1");
    // loader, two fakes, four classes, two instances
    assert_eq!(index.object_count(), 9);
    assert_eq!(report.dump_count, 3);
    assert_eq!(index.info().dump_index, Some(1));
    assert_eq!(index.info().creation_ms, Some(TIMESTAMP_MS as i64 + 4_000));
    assert!(index.id_of(N1 + 0x10).is_some());
    assert!(index.id_of(N1 + 0x20).is_none());
}

#[test]
fn test_missing_dump_index() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = write_dump(dir.path(), &three_dumps());

    let config = ParserConfig::default().with_dump_index(Some(5));
    let err = build_with(&dump, &config).unwrap_err();
    assert!(matches!(
        err,
        HeapError::DumpNotFound {
            found: 3,
            requested: 5
        }
    ));
}

/// Two dumps, each split into a class segment and an object segment
fn two_segmented_dumps() -> HprofWriter {
    let mut writer = HprofWriter::new(8);
    sample_classes(&mut writer);
    for dump in 0..2u64 {
        let mut classes = writer.segment();
        sample_class_dumps(&mut classes);
        let address = N1 + dump * 0x10;
        let mut objects = writer.segment();
        objects
            .instance(address, NODE_CLASS, &[Value::Object(0), Value::Int(dump as i32)])
            .root_unknown(address);
        writer
            .advance_time_us(1_000_000)
            .heap_dump_segment(&classes)
            .heap_dump_segment(&objects)
            .heap_dump_end();
    }
    writer
}

#[test]
fn test_segmented_dumps_end_at_heap_dump_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = write_dump(dir.path(), &two_segmented_dumps());

    let err = build_with(&dump, &ParserConfig::default()).unwrap_err();
    let dumps = err.available_dumps().expect("dump descriptors");
    assert_eq!(dumps.len(), 2);
    assert_eq!(dumps[1].created_at_ms, TIMESTAMP_MS as i64 + 2_000);

    let config = ParserConfig::default().with_dump_index(Some(1));
    let (index, report) =
        build_index(&dump, &config, &NullListener, &CancellationToken::new()).expect("dump #1");
    assert_eq!(report.dump_count, 2);
    // loader, two fakes, four classes, one instance
    assert_eq!(index.object_count(), 8);
    assert!(index.id_of(N1).is_none());
    let n2 = index.id_of(N2).expect("instance from the second segment");
    assert!(index.gc_root_ids().contains(&n2));
}

/// Sample heap whose dump record declares two bytes less than its sub-records use
fn short_segment_dump(dir: &Path) -> PathBuf {
    let mut writer = HprofWriter::new(8);
    sample_classes(&mut writer);
    let mut segment = writer.segment();
    sample_class_dumps(&mut segment);
    segment
        .instance(N1, NODE_CLASS, &[Value::Object(0), Value::Int(1)])
        .root_unknown(N1);
    writer.record_with_length(0x0c, segment.len() as u32 - 2, segment.as_bytes());
    write_dump(dir, &writer)
}

#[test]
fn test_segment_end_mismatch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = short_segment_dump(dir.path());

    match build_with(&dump, &ParserConfig::default()) {
        Err(HeapError::Stopped {
            source:
                FormatViolation::SegmentEndMismatch {
                    actual, expected, ..
                },
        }) => assert_eq!(actual, expected + 2),
        other => panic!("expected a segment end mismatch, got {:?}", other.map(|r| r.object_count)),
    }
    assert_eq!(file_names(dir.path()), vec!["heap.hprof"]);

    for strictness in [Strictness::Warn, Strictness::Permissive] {
        let config = ParserConfig::default().with_strictness(strictness);
        let report = build_with(&dump, &config).expect("lenient build continues");
        assert_eq!(report.object_count, 8);
        assert_eq!(report.warnings().count(), 1);
    }
}

#[test]
fn test_instance_payload_size_mismatch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut writer = HprofWriter::new(8);
    sample_classes(&mut writer);
    let mut segment = writer.segment();
    sample_class_dumps(&mut segment);
    // Node needs 12 bytes: a reference and an int
    segment.raw_instance(N1, NODE_CLASS, &[0u8; 20]).root_unknown(N1);
    writer.heap_dump(&segment);
    let dump = write_dump(dir.path(), &writer);

    assert!(matches!(
        build_with(&dump, &ParserConfig::default()),
        Err(HeapError::Stopped {
            source: FormatViolation::InstanceSizeMismatch {
                declared: 20,
                read: 12,
                ..
            }
        })
    ));
    assert_eq!(file_names(dir.path()), vec!["heap.hprof"]);

    let config = ParserConfig::default().with_strictness(Strictness::Warn);
    let report = build_with(&dump, &config).expect("warn continues");
    assert_eq!(report.object_count, 8);
    let warnings: Vec<_> = report.warnings().collect();
    assert_eq!(warnings.len(), 1);
}

#[test]
fn test_object_array_class_that_is_an_instance_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut writer = HprofWriter::new(8);
    sample_classes(&mut writer);
    let mut segment = writer.segment();
    sample_class_dumps(&mut segment);
    segment
        .instance(N1, NODE_CLASS, &[Value::Object(0), Value::Int(1)])
        .object_array(0x3000, N1, &[]);
    writer.heap_dump(&segment);
    let dump = write_dump(dir.path(), &writer);

    let config = ParserConfig::default().with_strictness(Strictness::Permissive);
    assert!(matches!(
        build_with(&dump, &config),
        Err(HeapError::ExpectedClassSegment(N1))
    ));
}

/// Requests cancellation once the second pass starts
struct CancelOnTask {
    task: &'static str,
    cancel: CancellationToken,
}

impl ProgressListener for CancelOnTask {
    fn begin_task(&self, name: &str, _total_work: u64) {
        if name == self.task {
            self.cancel.cancel();
        }
    }
}

#[test]
fn test_cancelled_build_leaves_no_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut writer = sample_dump(8);
    writer.stack_trace(1, 0, &[]).stack_trace(2, 3, &[]);
    let dump = write_dump(dir.path(), &writer);

    let cancel = CancellationToken::new();
    let listener = CancelOnTask {
        task: "Extracting objects",
        cancel: cancel.clone(),
    };
    let Err(err) = build_index(&dump, &ParserConfig::default(), &listener, &cancel) else {
        panic!("cancelled build succeeded");
    };
    assert!(err.is_cancelled());
    assert_eq!(file_names(dir.path()), vec!["heap.hprof"]);
}

#[test]
fn test_illegal_primitive_array_type_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut writer = HprofWriter::new(8);
    let mut segment = writer.segment();
    // OBJECT is not a primitive element type
    segment.primitive_array(0x2000, tag::OBJECT, 0, 0);
    writer.heap_dump(&segment);
    let dump = write_dump(dir.path(), &writer);

    let config = ParserConfig::default().with_strictness(Strictness::Permissive);
    let err = build_with(&dump, &config).unwrap_err();
    assert!(matches!(err, HeapError::IllegalPrimitiveType { tag: 2, .. }));
}

#[test]
fn test_unsupported_sub_record_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut writer = HprofWriter::new(8);
    writer.record(0x0c, &[0x42, 0, 0, 0]);
    let dump = write_dump(dir.path(), &writer);

    let config = ParserConfig::default().with_strictness(Strictness::Warn);
    let err = build_with(&dump, &config).unwrap_err();
    assert!(matches!(err, HeapError::InvalidSubRecord { tag: 0x42, .. }));
}

#[test]
fn test_unknown_record_is_skipped_when_lenient() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut writer = sample_dump(8);
    writer.record(0x7e, &[1, 2, 3]);
    let dump = write_dump(dir.path(), &writer);

    assert!(matches!(
        build_with(&dump, &ParserConfig::default()),
        Err(HeapError::Stopped {
            source: FormatViolation::UnexpectedRecord { tag: 0x7e, .. }
        })
    ));

    let config = ParserConfig::default().with_strictness(Strictness::Warn);
    let report = build_with(&dump, &config).expect("warn skips the record");
    assert_eq!(report.warnings().count(), 1);
    assert_eq!(report.object_count, 16);
}

#[test]
fn test_bad_header() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = dir.path().join("heap.hprof");
    std::fs::write(&dump, b"NOT A HEAP DUMP\0\0\0\0\0\0\0\0\0\0\0\0").expect("write");

    let err = build_with(&dump, &ParserConfig::default()).unwrap_err();
    assert!(matches!(err, HeapError::InvalidHeader(_)));
}

#[test]
fn test_unsupported_identifier_size() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = dir.path().join("heap.hprof");
    let mut bytes = b"JAVA PROFILE 1.0.2\0".to_vec();
    bytes.extend_from_slice(&2u32.to_be_bytes());
    bytes.extend_from_slice(&TIMESTAMP_MS.to_be_bytes());
    std::fs::write(&dump, bytes).expect("write");

    let err = build_with(&dump, &ParserConfig::default()).unwrap_err();
    assert!(matches!(err, HeapError::UnsupportedIdentifierSize(2)));
}
