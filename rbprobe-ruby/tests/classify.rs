//! 値の分類と表示のテスト
//!
//! 合成ヒープ上のオブジェクトを `classify` と `ObjectPrinter` で読みます。

mod common;

use common::*;
use num_bigint::BigInt;
use rbprobe_ruby::{classify, HashTable, ObjectPrinter, RubyObject, RubyType, Runtime, Storage};

#[test]
fn test_immediates_classify_without_reading_memory() {
    let session = RubyProcess::new().session();
    let rt = Runtime::new(&session);
    let before = mock(&session).reads();

    assert_eq!(classify(&rt, QFALSE, 3), RubyObject::False);
    assert_eq!(classify(&rt, QNIL, 3), RubyObject::Nil);
    assert_eq!(classify(&rt, QTRUE, 3), RubyObject::True);
    assert_eq!(classify(&rt, QUNDEF, 3), RubyObject::Undef);
    assert_eq!(classify(&rt, (42 << 1) | 1, 3), RubyObject::Fixnum(42));
    assert_eq!(classify(&rt, ((-7i64 << 1) | 1) as u64, 3), RubyObject::Fixnum(-7));

    assert_eq!(mock(&session).reads(), before);
}

#[test]
fn test_fixnum_display() {
    let session = RubyProcess::new().session();
    let rt = Runtime::new(&session);
    assert_eq!(classify(&rt, (30 << 1) | 1, 0).to_string(), "<T_FIXNUM> 30");
    assert_eq!(classify(&rt, QNIL, 0).to_string(), "<T_NIL>");
}

#[test]
fn test_flonum() {
    let session = RubyProcess::new().session();
    let rt = Runtime::new(&session);
    // 1.5 のflonum表現
    let raw = (1.5f64.to_bits().rotate_left(3) & !0x01) | 0x02;

    assert_eq!(classify(&rt, raw, 0), RubyObject::Float { address: None, value: 1.5 });
    assert_eq!(classify(&rt, raw, 0).to_string(), "<T_FLOAT> 1.5");
}

#[test]
fn test_embedded_and_heap_strings() {
    let mut process = RubyProcess::new();
    let short = process.string("Alice");
    let long = process.string("a string that does not fit in the slot");
    let session = process.session();
    let rt = Runtime::new(&session);

    match classify(&rt, short, 1) {
        RubyObject::String {
            storage, length, bytes, ..
        } => {
            assert_eq!(storage, Storage::Embedded);
            assert_eq!(length, 5);
            assert_eq!(bytes, b"Alice");
        }
        other => panic!("expected a string, got {:?}", other),
    }
    assert_eq!(
        classify(&rt, short, 1).to_string(),
        format!("<T_STRING@0x{:x} embedded length=5> 'Alice'", short)
    );

    match classify(&rt, long, 1) {
        RubyObject::String {
            storage, length, bytes, ..
        } => {
            assert_eq!(storage, Storage::Heap);
            assert_eq!(length, 38);
            assert_eq!(bytes, b"a string that does not fit in the slot");
        }
        other => panic!("expected a string, got {:?}", other),
    }
}

#[test]
fn test_hash_depth_controls_decoding() {
    let mut process = RubyProcess::new();
    let name = process.symbol("name");
    let age = process.symbol("age");
    let active = process.symbol("active");
    let alice = process.string("Alice");
    let hash = process.hash(&[(name, alice), (age, (30 << 1) | 1), (active, QTRUE)]);
    let session = process.session();
    let rt = Runtime::new(&session);

    let shallow = classify(&rt, hash, 1);
    let RubyObject::Hash { table, entries, .. } = &shallow else {
        panic!("expected a hash, got {:?}", shallow);
    };
    assert_eq!(*table, HashTable::Ar { size: 3, bound: 3 });
    assert_eq!(entries.len(), 3);
    assert_eq!(
        entries[0].1,
        RubyObject::Shallow {
            address: alice,
            tag: RubyType::String
        }
    );
    assert_eq!(entries[1].1, RubyObject::Fixnum(30));
    assert_eq!(entries[2].1, RubyObject::True);
    assert_eq!(entries[0].0.to_string(), "<T_SYMBOL> :name");

    let deep = classify(&rt, hash, 2);
    let RubyObject::Hash { entries, .. } = &deep else {
        panic!("expected a hash, got {:?}", deep);
    };
    assert!(matches!(&entries[0].1, RubyObject::String { bytes, .. } if bytes == b"Alice"));
    assert!(shallow.is_truncation_of(&deep));
}

#[test]
fn test_st_table_skips_deleted_entries() {
    let mut process = RubyProcess::new();
    let one = process.string("one");
    let three = process.string("three");
    let hash = process.st_hash(&[
        Some(((1 << 1) | 1, one)),
        None,
        Some(((3 << 1) | 1, three)),
    ]);
    let session = process.session();
    let rt = Runtime::new(&session);

    let object = classify(&rt, hash, 2);
    let RubyObject::Hash { table, entries, .. } = &object else {
        panic!("expected a hash, got {:?}", object);
    };
    assert_eq!(*table, HashTable::St { entries: 2 });
    let keys: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(keys, vec![RubyObject::Fixnum(1), RubyObject::Fixnum(3)]);
    assert_eq!(object.to_string(), format!("<T_HASH@0x{:x} ST-Table entries=2>", hash));
}

#[test]
fn test_embedded_and_heap_arrays() {
    let mut process = RubyProcess::new();
    let small = process.array(&[(1 << 1) | 1, QNIL]);
    let items: Vec<u64> = (0..6).map(|i| (i << 1) | 1).collect();
    let large = process.array(&items);
    let session = process.session();
    let rt = Runtime::new(&session);

    match classify(&rt, small, 1) {
        RubyObject::Array {
            storage, length, items, ..
        } => {
            assert_eq!(storage, Storage::Embedded);
            assert_eq!(length, 2);
            assert_eq!(items, vec![RubyObject::Fixnum(1), RubyObject::Nil]);
        }
        other => panic!("expected an array, got {:?}", other),
    }
    match classify(&rt, large, 1) {
        RubyObject::Array {
            storage, length, items, ..
        } => {
            assert_eq!(storage, Storage::Heap);
            assert_eq!(length, 6);
            assert_eq!(items[5], RubyObject::Fixnum(5));
        }
        other => panic!("expected an array, got {:?}", other),
    }
}

#[test]
fn test_struct_members() {
    let mut process = RubyProcess::new();
    let embedded = process.structure(&[QTRUE, QFALSE]);
    let members: Vec<u64> = (10..15).map(|i| (i << 1) | 1).collect();
    let heap = process.structure(&members);
    let session = process.session();
    let rt = Runtime::new(&session);

    match classify(&rt, embedded, 1) {
        RubyObject::Struct {
            storage, members, ..
        } => {
            assert_eq!(storage, Storage::Embedded);
            assert_eq!(members, vec![RubyObject::True, RubyObject::False]);
        }
        other => panic!("expected a struct, got {:?}", other),
    }
    match classify(&rt, heap, 1) {
        RubyObject::Struct {
            storage, length, members, ..
        } => {
            assert_eq!(storage, Storage::Heap);
            assert_eq!(length, 5);
            assert_eq!(members[0], RubyObject::Fixnum(10));
        }
        other => panic!("expected a struct, got {:?}", other),
    }
}

#[test]
fn test_heap_bignum_sign_and_magnitude() {
    let mut process = RubyProcess::new();
    let positive: BigInt = "123456789012345678901234567890".parse().unwrap();
    let negative = -positive.clone();
    let p = process.bignum(&positive);
    let n = process.bignum(&negative);
    let session = process.session();
    let rt = Runtime::new(&session);

    match classify(&rt, p, 1) {
        RubyObject::Bignum { storage, value, .. } => {
            assert_eq!(storage, Storage::Heap);
            assert_eq!(value, positive);
        }
        other => panic!("expected a bignum, got {:?}", other),
    }
    match classify(&rt, n, 1) {
        RubyObject::Bignum { storage, value, .. } => {
            assert_eq!(storage, Storage::Heap);
            assert_eq!(value, negative);
        }
        other => panic!("expected a bignum, got {:?}", other),
    }
}

#[test]
fn test_heap_float() {
    let mut process = RubyProcess::new();
    let float = process.float(1.0e300);
    let session = process.session();
    let rt = Runtime::new(&session);

    assert_eq!(
        classify(&rt, float, 1),
        RubyObject::Float {
            address: Some(float),
            value: 1.0e300
        }
    );
}

#[test]
fn test_dynamic_symbol_reads_fstr() {
    let mut process = RubyProcess::new();
    let symbol = process.dynamic_symbol("dynamic_name");
    let session = process.session();
    let rt = Runtime::new(&session);

    match classify(&rt, symbol, 1) {
        RubyObject::Symbol { address, name, .. } => {
            assert_eq!(address, Some(symbol));
            assert_eq!(name.as_deref(), Some("dynamic_name"));
        }
        other => panic!("expected a symbol, got {:?}", other),
    }
}

#[test]
fn test_typed_data_reports_struct_name() {
    let mut process = RubyProcess::new();
    let fiber = process.fiber(FIBER_SUSPENDED);
    let session = process.session();
    let rt = Runtime::new(&session);

    let object = classify(&rt, fiber.value, 1);
    assert_eq!(
        object,
        RubyObject::Data {
            address: fiber.value,
            type_ptr: Some(FIBER_DATA_TYPE),
            data_ptr: fiber.ptr,
            type_name: Some("fiber".to_string()),
        }
    );
}

#[test]
fn test_plain_object_uses_class_path() {
    let mut process = RubyProcess::new();
    let klass = process.class("MyApp::Worker");
    let object = process.object(klass);
    let session = process.session();
    let rt = Runtime::new(&session);

    assert_eq!(
        classify(&rt, object, 1).to_string(),
        format!("<T_OBJECT@0x{:x}> MyApp::Worker", object)
    );
}

#[test]
fn test_unreadable_object_becomes_error() {
    let session = RubyProcess::new().session();
    let rt = Runtime::new(&session);

    let object = classify(&rt, 0x3_0000_0000, 1);
    assert!(matches!(object, RubyObject::Error { address: 0x3_0000_0000, .. }));
}

#[test]
fn test_classification_is_idempotent() {
    let mut process = RubyProcess::new();
    let inner = process.array(&[QTRUE]);
    let key = process.symbol("list");
    let hash = process.hash(&[(key, inner)]);
    let session = process.session();
    let rt = Runtime::new(&session);

    for depth in 0..4 {
        assert_eq!(classify(&rt, hash, depth), classify(&rt, hash, depth));
    }
}

#[test]
fn test_depth_is_monotonic() {
    let mut process = RubyProcess::new();
    let leaf = process.string("leaf");
    let middle = process.array(&[leaf, QNIL]);
    let outer = process.array(&[middle, (9 << 1) | 1]);
    let session = process.session();
    let rt = Runtime::new(&session);

    for depth in 0..4 {
        let shallow = classify(&rt, outer, depth);
        let deep = classify(&rt, outer, depth + 1);
        assert!(shallow.is_truncation_of(&deep), "depth {} is not a truncation of {}", depth, depth + 1);
    }
}

#[test]
fn test_printer_layout() {
    let mut process = RubyProcess::new();
    let name = process.symbol("name");
    let alice = process.string("Alice");
    let hash = process.hash(&[(name, alice)]);
    let session = process.session();
    let rt = Runtime::new(&session);

    let mut out = Vec::new();
    ObjectPrinter::new(1, false).print(&rt, hash, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let expected = format!(
        "<T_HASH@0x{:x} AR-Table size=1 bound=1>\n  [   0] K: <T_SYMBOL> :name\n         V: <T_STRING@0x{:x} embedded length=5> 'Alice'\n",
        hash, alice
    );
    assert_eq!(text, expected);
}

#[test]
fn test_printer_marks_elided_children() {
    let mut process = RubyProcess::new();
    let inner = process.array(&[QTRUE]);
    let outer = process.array(&[inner]);
    let session = process.session();
    let rt = Runtime::new(&session);

    let mut out = Vec::new();
    ObjectPrinter::new(1, false).print(&rt, outer, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1], format!("  [   0] I: <T_ARRAY@0x{:x} embedded length=1>", inner));
    assert_eq!(lines[2], "    ...");
}
