//! 統合テスト用の合成Ruby 3.4プロセス
//!
//! `MockBackend` に型表・VM・objspace・ヒープページを登録し、
//! オブジェクトやファイバ、VMフレームを組み立てるビルダーを提供します。
//!
//! メモリ配置:
//! - 0x1000   グローバル変数
//! - 0x2000   VM・スレッド・objspace・ページヘッダ
//! - 0x3000   rb_data_type_t
//! - 0x10_0000 ヒープページ（ページごとに 0x1_0000 間隔）
//! - 0x40_0000 ヒープ外のオブジェクト（クラス、シンボル表）
//! - 0x50_0000 関数シンボル（メモリなし）
//! - 0x7f_0000 メインスレッドのマシンスタック
//! - 0x80_0000 mallocした領域
//! - 0xa0_0000 ファイバのマシンスタック

#![allow(dead_code)]

use num_bigint::{BigInt, Sign};
use rbprobe_core::{Debugger, Field, MockBackend, RegisterSnapshot, Session, Type, TypeHandle};
use rbprobe_ruby::RubyState;
use std::collections::HashMap;
use std::rc::Rc;

// 型タグ
pub const T_OBJECT: u64 = 0x01;
pub const T_CLASS: u64 = 0x02;
pub const T_FLOAT: u64 = 0x04;
pub const T_STRING: u64 = 0x05;
pub const T_ARRAY: u64 = 0x07;
pub const T_HASH: u64 = 0x08;
pub const T_STRUCT: u64 = 0x09;
pub const T_BIGNUM: u64 = 0x0a;
pub const T_DATA: u64 = 0x0c;
pub const T_SYMBOL: u64 = 0x14;
pub const T_IMEMO: u64 = 0x1a;

pub const QFALSE: u64 = 0x00;
pub const QNIL: u64 = 0x04;
pub const QTRUE: u64 = 0x14;
pub const QUNDEF: u64 = 0x24;

const FL_USHIFT: u64 = 12;

const fn user(n: u64) -> u64 {
    1 << (FL_USHIFT + n)
}

const RSTRING_NOEMBED: u64 = user(1);
const RARRAY_EMBED_FLAG: u64 = user(1);
const RARRAY_EMBED_LEN_SHIFT: u64 = FL_USHIFT + 3;
const RHASH_ST_TABLE_FLAG: u64 = user(3);
const RHASH_AR_SIZE_SHIFT: u64 = FL_USHIFT + 4;
const RHASH_AR_BOUND_SHIFT: u64 = FL_USHIFT + 8;
const RSTRUCT_EMBED_LEN_SHIFT: u64 = FL_USHIFT + 1;
const BIGNUM_SIGN_BIT: u64 = user(1);
const IMEMO_ISEQ: u64 = 7;

// フレームマジック
pub const VM_FRAME_MAGIC_METHOD: u64 = 0x1111_0001;
pub const VM_FRAME_MAGIC_BLOCK: u64 = 0x2222_0001;
pub const VM_FRAME_MAGIC_TOP: u64 = 0x4444_0001;
pub const VM_FRAME_MAGIC_CFUNC: u64 = 0x5555_0001;
pub const VM_FRAME_MAGIC_DUMMY: u64 = 0x7999_0001;

// ファイバの状態
pub const FIBER_CREATED: u64 = 0;
pub const FIBER_RESUMED: u64 = 1;
pub const FIBER_SUSPENDED: u64 = 2;
pub const FIBER_TERMINATED: u64 = 3;

/// ヒープページのスロットサイズ（3.4のサイズプールに合わせて2種類）
pub const PAGE_SLOT_SIZES: [u64; 4] = [40, 40, 160, 40];
pub const SLOTS_PER_PAGE: u64 = 16;
const PAGE_BASE: u64 = 0x10_0000;
const PAGE_STRIDE: u64 = 0x1_0000;

const GLOBALS: u64 = 0x1000;
pub const VM_PTR_GLOBAL: u64 = GLOBALS;
const SYMBOLS_GLOBAL: u64 = GLOBALS + 0x200;
const SIGNAL_BUFF_GLOBAL: u64 = GLOBALS + 0x300;
const CLASS_GLOBALS: u64 = GLOBALS + 0x400;

const VM: u64 = 0x2000;
const THREAD: u64 = 0x2100;
const OBJSPACE: u64 = 0x2200;
const SORTED_PAGES: u64 = 0x2300;
const PAGE_HEADERS: u64 = 0x2400;
const PAGE_HEADER_SIZE: u64 = 0x40;

pub const FIBER_DATA_TYPE: u64 = 0x3000;
pub const MUTEX_DATA_TYPE: u64 = 0x3100;

const OFFHEAP: u64 = 0x40_0000;
const MALLOC: u64 = 0x80_0000;
const REGION_SIZE: usize = 0x10_0000;
pub const MAIN_STACK: u64 = 0x7f_0000;
const FIBER_STACKS: u64 = 0xa0_0000;
pub const FIBER_STACK_SIZE: u64 = 0x1_0000;

// 関数シンボル
pub const FN_MAIN: u64 = 0x50_0000;
pub const FN_RB_VM_EXEC: u64 = 0x50_0100;
pub const FN_VM_EXEC_CORE: u64 = 0x50_0200;
pub const FN_RB_ARY_EACH: u64 = 0x50_0300;
pub const FN_COROUTINE_TRANSFER: u64 = 0x50_0400;
pub const FN_FIBER_ENTRY: u64 = 0x50_0500;
pub const FN_VM_CALL_CFUNC: u64 = 0x50_0600;
const FN_SIZE: u64 = 0x100;

const VM_STACK_WORDS: u64 = 256;
const CFP_SIZE: u64 = 56;
/// 1フレームあたりの環境領域（ワード）
const ENV_WORDS: u64 = 16;
const ISEQ_WORDS: u64 = 32;
const ID_ENTRY_UNIT: u64 = 512;
const FIRST_SERIAL: u64 = 200;

fn value_type() -> Type {
    Type::u64_type().with_name("VALUE")
}

fn id_type() -> Type {
    Type::u64_type().with_name("ID")
}

fn size_type() -> Type {
    Type::u64_type().with_name("size_t")
}

fn u32_type() -> Type {
    Type::base("unsigned int", 4, false, false)
}

fn i32_type() -> Type {
    Type::base("int", 4, true, false)
}

fn u16_type() -> Type {
    Type::base("unsigned short", 2, false, false)
}

fn char_type() -> Type {
    Type::base("char", 1, true, false)
}

fn named_ptr(name: &str) -> Type {
    Type::pointer_to(TypeHandle::named(name), name)
}

fn void_ptr() -> Type {
    Type::void().pointer()
}

fn anonymous(size: u64, fields: Vec<Field>) -> Type {
    Type::structure("", size, fields)
}

/// Ruby 3.4相当の型表を登録する
fn register_types(mock: &MockBackend) {
    let value = value_type();
    mock.add_type(value.clone());
    mock.add_type(id_type());
    mock.add_type(u32_type().with_name("BDIGIT"));

    let rbasic = Type::structure(
        "struct RBasic",
        16,
        vec![Field::new("flags", 0, value.clone()), Field::new("klass", 8, value.clone())],
    );
    mock.add_type(rbasic.clone());
    let basic = || Field::new("basic", 0, rbasic.clone());

    // RString（3.3以降: lenが最上位）
    let string_as = Type::union(
        "",
        16,
        vec![
            Field::new(
                "heap",
                0,
                anonymous(16, vec![Field::new("ptr", 0, char_type().pointer()), Field::new("aux", 8, value.clone())]),
            ),
            Field::new("embed", 0, anonymous(1, vec![Field::new("ary", 0, Type::array_of(char_type(), Some(1)))])),
        ],
    );
    mock.add_type(Type::structure(
        "struct RString",
        40,
        vec![basic(), Field::new("len", 16, Type::i64_type()), Field::new("as", 24, string_as)],
    ));

    let array_as = Type::union(
        "",
        24,
        vec![
            Field::new(
                "heap",
                0,
                anonymous(
                    24,
                    vec![
                        Field::new("len", 0, Type::i64_type()),
                        Field::new("aux", 8, value.clone()),
                        Field::new("ptr", 16, value.pointer()),
                    ],
                ),
            ),
            Field::new("ary", 0, Type::array_of(value.clone(), Some(1))),
        ],
    );
    mock.add_type(Type::structure("struct RArray", 40, vec![basic(), Field::new("as", 16, array_as)]));

    let struct_as = Type::union(
        "",
        24,
        vec![
            Field::new(
                "heap",
                0,
                anonymous(16, vec![Field::new("len", 0, Type::i64_type()), Field::new("ptr", 8, value.pointer())]),
            ),
            Field::new("ary", 0, Type::array_of(value.clone(), Some(3))),
        ],
    );
    mock.add_type(Type::structure("struct RStruct", 40, vec![basic(), Field::new("as", 16, struct_as)]));

    let bdigit = u32_type().with_name("BDIGIT");
    let bignum_as = Type::union(
        "",
        24,
        vec![
            Field::new(
                "heap",
                0,
                anonymous(16, vec![Field::new("len", 0, size_type()), Field::new("digits", 8, bdigit.pointer())]),
            ),
            Field::new("ary", 0, Type::array_of(bdigit, Some(6))),
        ],
    );
    mock.add_type(Type::structure("struct RBignum", 40, vec![basic(), Field::new("as", 16, bignum_as)]));

    // RHash（3.3以降: ar/stテーブルは直後に埋め込み）
    mock.add_type(Type::structure("struct RHash", 24, vec![basic(), Field::new("ifnone", 16, value.clone())]));
    let pair = Type::structure(
        "ar_table_pair",
        16,
        vec![Field::new("key", 0, value.clone()), Field::new("val", 8, value.clone())],
    );
    mock.add_type(Type::structure(
        "struct ar_table_struct",
        136,
        vec![
            Field::new("ar_hint", 0, Type::u64_type()),
            Field::new("pairs", 8, Type::array_of(pair, Some(8))),
        ],
    ));
    let st_entry = Type::structure(
        "st_table_entry",
        24,
        vec![
            Field::new("hash", 0, Type::u64_type()),
            Field::new("key", 8, value.clone()),
            Field::new("record", 16, value.clone()),
        ],
    );
    mock.add_type(st_entry.clone());
    mock.add_type(Type::structure(
        "struct st_table",
        56,
        vec![
            Field::new("type", 8, void_ptr()),
            Field::new("num_entries", 16, size_type()),
            Field::new("bins", 24, void_ptr()),
            Field::new("entries_start", 32, size_type()),
            Field::new("entries_bound", 40, size_type()),
            Field::new("entries", 48, st_entry.pointer()),
        ],
    ));

    mock.add_type(Type::structure(
        "struct RSymbol",
        40,
        vec![
            basic(),
            Field::new("hashval", 16, Type::u64_type()),
            Field::new("fstr", 24, value.clone()),
            Field::new("id", 32, id_type()),
        ],
    ));
    mock.add_type(Type::structure(
        "struct RFloat",
        24,
        vec![basic(), Field::new("float_value", 16, Type::base("double", 8, true, true))],
    ));
    mock.add_type(Type::structure(
        "rb_data_type_t",
        72,
        vec![Field::new("wrap_struct_name", 0, char_type().pointer())],
    ));
    mock.add_type(Type::structure(
        "struct RTypedData",
        40,
        vec![
            basic(),
            Field::new("type", 16, named_ptr("rb_data_type_t")),
            Field::new("typed_flag", 24, value.clone()),
            Field::new("data", 32, void_ptr()),
        ],
    ));
    mock.add_type(Type::structure(
        "struct RObject",
        40,
        vec![basic(), Field::new("ary", 16, Type::array_of(value.clone(), Some(3)))],
    ));
    mock.add_type(Type::structure(
        "struct RClass",
        32,
        vec![basic(), Field::new("super", 16, value.clone()), Field::new("m_tbl", 24, void_ptr())],
    ));
    mock.add_type(Type::structure(
        "rb_classext_t",
        56,
        vec![
            Field::new("iv_ptr", 0, void_ptr()),
            Field::new("const_tbl", 8, void_ptr()),
            Field::new("classpath", 40, value.clone()),
        ],
    ));

    // VM・スレッド・実行コンテキスト
    mock.add_type(Type::structure(
        "struct rb_vm_tag",
        24,
        vec![
            Field::new("tag", 0, value.clone()),
            Field::new("retval", 8, value.clone()),
            Field::new("state", 16, i32_type()),
        ],
    ));
    mock.add_type(Type::structure(
        "rb_execution_context_t",
        64,
        vec![
            Field::new("vm_stack", 0, value.pointer()),
            Field::new("vm_stack_size", 8, size_type()),
            Field::new("cfp", 16, named_ptr("rb_control_frame_t")),
            Field::new("tag", 24, named_ptr("struct rb_vm_tag")),
            Field::new("interrupt_flag", 32, u32_type()),
            Field::new("interrupt_mask", 36, u32_type()),
            Field::new("errinfo", 40, value.clone()),
            Field::new("storage", 48, value.clone()),
            Field::new("fiber_ptr", 56, named_ptr("struct rb_fiber_struct")),
        ],
    ));
    mock.add_type(Type::structure(
        "rb_thread_t",
        32,
        vec![
            Field::new("self", 0, value.clone()),
            Field::new("ec", 24, named_ptr("rb_execution_context_t")),
        ],
    ));
    mock.add_type(Type::structure(
        "rb_vm_t",
        24,
        vec![
            Field::new("ractor", 0, anonymous(16, vec![Field::new("main_thread", 0, named_ptr("rb_thread_t"))])),
            Field::new("gc", 16, anonymous(8, vec![Field::new("objspace", 0, named_ptr("rb_objspace_t"))])),
        ],
    ));

    // objspace とヒープページ
    mock.add_type(Type::structure(
        "struct heap_page",
        PAGE_HEADER_SIZE,
        vec![
            Field::new("slot_size", 0, u16_type()),
            Field::new("total_slots", 2, u16_type()),
            Field::new("free_slots", 4, u16_type()),
            Field::new("start", 40, Type::u64_type().with_name("uintptr_t")),
        ],
    ));
    let sorted = Type::structure(
        "rb_darray_heap_page",
        16,
        vec![
            Field::new(
                "meta",
                0,
                anonymous(16, vec![Field::new("length", 0, size_type()), Field::new("capa", 8, size_type())]),
            ),
            Field::new("data", 16, Type::array_of(named_ptr("struct heap_page"), None)),
        ],
    );
    mock.add_type(sorted.clone());
    mock.add_type(Type::structure(
        "rb_objspace_t",
        32,
        vec![Field::new(
            "heap_pages",
            0,
            anonymous(
                16,
                vec![
                    Field::new("sorted", 0, sorted.pointer()),
                    Field::new("allocated_pages", 8, size_type()),
                ],
            ),
        )],
    ));

    // ファイバ
    mock.add_type(Type::structure(
        "rb_context_t",
        80,
        vec![
            Field::new("type", 0, u32_type()),
            Field::new("self", 8, value.clone()),
            Field::new("saved_ec", 16, TypeHandle::named("rb_execution_context_t")),
        ],
    ));
    mock.add_type(Type::structure(
        "struct rb_fiber_struct",
        176,
        vec![
            Field::new("cont", 0, TypeHandle::named("rb_context_t")),
            Field::new("prev", 80, named_ptr("struct rb_fiber_struct")),
            Field::bits(
                "status",
                96,
                0,
                2,
                Type::enumeration(
                    "enum fiber_status",
                    4,
                    vec![
                        ("FIBER_CREATED".to_string(), 0),
                        ("FIBER_RESUMED".to_string(), 1),
                        ("FIBER_SUSPENDED".to_string(), 2),
                        ("FIBER_TERMINATED".to_string(), 3),
                    ],
                ),
            ),
            Field::new(
                "stack",
                104,
                anonymous(
                    48,
                    vec![
                        Field::new("base", 0, void_ptr()),
                        Field::new("current", 8, void_ptr()),
                        Field::new("size", 16, size_type()),
                    ],
                ),
            ),
            Field::new(
                "context",
                152,
                anonymous(16, vec![Field::new("stack_pointer", 0, void_ptr()), Field::new("argument", 8, void_ptr())]),
            ),
        ],
    ));

    // VMフレーム
    mock.add_type(Type::structure(
        "rb_control_frame_t",
        CFP_SIZE,
        vec![
            Field::new("pc", 0, value.pointer()),
            Field::new("sp", 8, value.pointer()),
            Field::new("iseq", 16, named_ptr("rb_iseq_t")),
            Field::new("self", 24, value.clone()),
            Field::new("ep", 32, value.pointer()),
            Field::new("block_code", 40, void_ptr()),
            Field::new("jit_return", 48, void_ptr()),
        ],
    ));
    mock.add_type(Type::structure(
        "rb_iseq_t",
        40,
        vec![
            Field::new("flags", 0, value.clone()),
            Field::new("wrapper", 8, value.clone()),
            Field::new("body", 16, named_ptr("struct rb_iseq_constant_body")),
        ],
    ));
    let insn_info = Type::structure(
        "struct iseq_insn_info_entry",
        12,
        vec![Field::new("line_no", 0, i32_type()), Field::new("node_id", 4, i32_type())],
    );
    mock.add_type(insn_info.clone());
    mock.add_type(Type::structure(
        "struct rb_iseq_constant_body",
        96,
        vec![
            Field::new("type", 0, u32_type()),
            Field::new("iseq_size", 4, u32_type()),
            Field::new("iseq_encoded", 8, value.pointer()),
            Field::new(
                "location",
                16,
                anonymous(
                    48,
                    vec![
                        Field::new("pathobj", 0, value.clone()),
                        Field::new("base_label", 8, value.clone()),
                        Field::new("label", 16, value.clone()),
                        Field::new("first_lineno", 24, i32_type()),
                    ],
                ),
            ),
            Field::new(
                "insns_info",
                64,
                anonymous(
                    32,
                    vec![
                        Field::new("body", 0, insn_info.pointer()),
                        Field::new("positions", 8, u32_type().pointer()),
                        Field::new("size", 16, u32_type()),
                    ],
                ),
            ),
        ],
    ));
    mock.add_type(Type::structure(
        "struct rb_method_definition_struct",
        48,
        vec![
            Field::new("type", 0, u32_type()),
            Field::new(
                "body",
                8,
                Type::union(
                    "",
                    24,
                    vec![Field::new(
                        "cfunc",
                        0,
                        anonymous(24, vec![Field::new("func", 0, void_ptr()), Field::new("argc", 16, i32_type())]),
                    )],
                ),
            ),
            Field::new("original_id", 32, id_type()),
        ],
    ));
    mock.add_type(Type::structure(
        "rb_callable_method_entry_t",
        40,
        vec![
            Field::new("flags", 0, value.clone()),
            Field::new("defined_class", 8, value.clone()),
            Field::new("def", 16, named_ptr("struct rb_method_definition_struct")),
            Field::new("called_id", 24, id_type()),
            Field::new("owner", 32, value.clone()),
        ],
    ));

    mock.add_type(symbols_type());
    mock.add_type(signal_buff_type());
}

fn symbols_type() -> Type {
    Type::structure(
        "rb_symbols_t",
        32,
        vec![
            Field::new("last_id", 0, u32_type()),
            Field::new("str_sym", 8, void_ptr()),
            Field::new("ids", 16, value_type()),
        ],
    )
}

fn signal_buff_type() -> Type {
    Type::structure(
        "rb_signal_buff_t",
        264,
        vec![
            Field::new("cnt", 0, Type::array_of(u32_type(), Some(65))),
            Field::new("size", 260, u32_type()),
        ],
    )
}

/// よく使うクラス
#[derive(Debug, Clone, Copy)]
pub struct Classes {
    pub object: u64,
    pub string: u64,
    pub array: u64,
    pub hash: u64,
    pub runtime_error: u64,
}

/// VMフレームの指定（外側から順に並べる）
#[derive(Debug, Clone)]
pub enum Frame {
    Iseq {
        magic: u64,
        path: String,
        label: String,
        first_lineno: i32,
        /// (命令位置, 行番号)
        lines: Vec<(u32, i32)>,
        /// `iseq_encoded` からのワード数
        pc: u64,
        locals: Vec<u64>,
    },
    Cfunc {
        method: String,
        func: u64,
    },
}

impl Frame {
    pub fn top(path: &str, lines: &[(u32, i32)], pc: u64) -> Self {
        Frame::Iseq {
            magic: VM_FRAME_MAGIC_TOP,
            path: path.to_string(),
            label: "<main>".to_string(),
            first_lineno: 1,
            lines: lines.to_vec(),
            pc,
            locals: Vec::new(),
        }
    }

    pub fn method(path: &str, label: &str, first_lineno: i32, lines: &[(u32, i32)], pc: u64) -> Self {
        Frame::Iseq {
            magic: VM_FRAME_MAGIC_METHOD,
            path: path.to_string(),
            label: label.to_string(),
            first_lineno,
            lines: lines.to_vec(),
            pc,
            locals: Vec::new(),
        }
    }

    pub fn cfunc(method: &str, func: u64) -> Self {
        Frame::Cfunc {
            method: method.to_string(),
            func,
        }
    }

    pub fn with_locals(mut self, values: &[u64]) -> Self {
        if let Frame::Iseq { locals, .. } = &mut self {
            *locals = values.to_vec();
        }
        self
    }
}

/// 組み立てたVMスタック
#[derive(Debug, Clone, Copy)]
pub struct VmStack {
    pub vm_stack: u64,
    pub size: u64,
    /// 最も内側のフレーム
    pub cfp: u64,
}

/// 組み立てたファイバ
#[derive(Debug, Clone, Copy)]
pub struct FiberParts {
    pub value: u64,
    pub ptr: u64,
    pub ec: u64,
    pub stack_pointer: u64,
    pub stack_base: u64,
    /// 保存された rip
    pub rip: u64,
}

/// 合成ヒープのビルダー
pub struct RubyProcess {
    mock: MockBackend,
    used: [u64; 4],
    offheap: u64,
    malloc: u64,
    fiber_stacks: u64,
    next_serial: u64,
    symbol_entry: u64,
    interned: HashMap<String, u64>,
    main_ec: u64,
    pub classes: Classes,
}

impl RubyProcess {
    /// 型表・VM・空のヒープだけのプロセス
    pub fn new() -> Self {
        let mock = MockBackend::new();
        register_types(&mock);

        mock.map(GLOBALS, 0x1000);
        mock.map(VM, 0x1000);
        mock.map(FIBER_DATA_TYPE, 0x1000);
        mock.map(OFFHEAP, REGION_SIZE);
        mock.map(MALLOC, REGION_SIZE);
        mock.map(MAIN_STACK, 0x1000);

        for (name, value) in [
            ("RUBY_T_OBJECT", T_OBJECT),
            ("RUBY_T_CLASS", T_CLASS),
            ("RUBY_T_STRING", T_STRING),
            ("RUBY_T_ARRAY", T_ARRAY),
            ("RUBY_T_HASH", T_HASH),
            ("RUBY_T_DATA", T_DATA),
            ("RUBY_T_IMEMO", T_IMEMO),
            ("RUBY_T_MASK", 0x1f),
        ] {
            mock.add_enum("ruby_value_type", name, value as i64);
        }
        mock.add_enum("ruby_special_consts", "RUBY_Qnil", QNIL as i64);
        mock.add_enum("ruby_special_consts", "RUBY_Qtrue", QTRUE as i64);
        mock.add_enum("ruby_special_consts", "RUBY_Qundef", QUNDEF as i64);
        mock.add_enum("ruby_fl_ushift", "RUBY_FL_USHIFT", FL_USHIFT as i64);

        for (name, address) in [
            ("main", FN_MAIN),
            ("rb_vm_exec", FN_RB_VM_EXEC),
            ("vm_exec_core", FN_VM_EXEC_CORE),
            ("rb_ary_each", FN_RB_ARY_EACH),
            ("coroutine_transfer", FN_COROUTINE_TRANSFER),
            ("fiber_entry", FN_FIBER_ENTRY),
            ("vm_call_cfunc_with_frame", FN_VM_CALL_CFUNC),
        ] {
            mock.add_symbol(name, address, FN_SIZE);
        }

        // VM -> スレッド、objspace
        let session_types = |name: &str| Type::pointer_to(TypeHandle::named(name), name);
        mock.add_global("ruby_current_vm_ptr", VM_PTR_GLOBAL, Some(session_types("rb_vm_t")));
        mock.write_u64(VM_PTR_GLOBAL, VM);
        mock.write_u64(VM, THREAD);
        mock.write_u64(VM + 16, OBJSPACE);
        mock.write_u64(OBJSPACE, SORTED_PAGES);
        mock.write_u64(OBJSPACE + 8, PAGE_SLOT_SIZES.len() as u64);

        // ページ
        mock.write_u64(SORTED_PAGES, PAGE_SLOT_SIZES.len() as u64);
        mock.write_u64(SORTED_PAGES + 8, PAGE_SLOT_SIZES.len() as u64);
        for (i, slot_size) in PAGE_SLOT_SIZES.iter().enumerate() {
            let header = PAGE_HEADERS + i as u64 * PAGE_HEADER_SIZE;
            let start = PAGE_BASE + i as u64 * PAGE_STRIDE;
            mock.write_u64(SORTED_PAGES + 16 + i as u64 * 8, header);
            mock.write_bytes(header, &(*slot_size as u16).to_le_bytes());
            mock.write_bytes(header + 2, &(SLOTS_PER_PAGE as u16).to_le_bytes());
            mock.write_u64(header + 40, start);
            mock.map(start, (SLOTS_PER_PAGE * slot_size) as usize);
        }

        // rb_data_type_t
        mock.add_global("fiber_data_type", FIBER_DATA_TYPE, Some(session_types("rb_data_type_t")));
        mock.write_u64(FIBER_DATA_TYPE, FIBER_DATA_TYPE + 0x80);
        mock.write_bytes(FIBER_DATA_TYPE + 0x80, b"fiber\0");
        mock.write_u64(MUTEX_DATA_TYPE, MUTEX_DATA_TYPE + 0x80);
        mock.write_bytes(MUTEX_DATA_TYPE + 0x80, b"mutex\0");

        let mut process = Self {
            mock,
            used: [0; 4],
            offheap: OFFHEAP,
            malloc: MALLOC,
            fiber_stacks: FIBER_STACKS,
            next_serial: FIRST_SERIAL,
            symbol_entry: 0,
            interned: HashMap::new(),
            main_ec: 0,
            classes: Classes {
                object: 0,
                string: 0,
                array: 0,
                hash: 0,
                runtime_error: 0,
            },
        };
        process.init_classes();
        process.init_symbols();
        process
    }

    /// メインスレッドのECとVMスタック、ネイティブスタックを持つプロセス
    ///
    /// ネイティブ: rb_ary_each <- vm_call_cfunc_with_frame <- vm_exec_core <- rb_vm_exec <- main
    /// VM: Array#each (cfunc) <- process (app.rb:12) <- <main> (app.rb:2)
    pub fn standard() -> Self {
        let mut process = Self::new();
        let frames = vec![
            Frame::top("app.rb", &[(0, 1), (4, 2), (9, 3)], 6),
            Frame::method("app.rb", "process", 10, &[(0, 10), (3, 11), (7, 12)], 9),
            Frame::cfunc("each", FN_RB_ARY_EACH),
        ];
        let stack = process.vm_stack(&frames);
        let ec = process.execution_context(stack);
        process.mock.write_u64(THREAD + 24, ec);
        process.main_ec = ec;

        // フレームポインタチェーン
        let chain = [
            (MAIN_STACK + 0x100, FN_VM_CALL_CFUNC + 0x10),
            (MAIN_STACK + 0x200, FN_VM_EXEC_CORE + 0x10),
            (MAIN_STACK + 0x300, FN_RB_VM_EXEC + 0x10),
            (MAIN_STACK + 0x400, FN_MAIN + 0x10),
        ];
        for (i, (fp, ret)) in chain.iter().enumerate() {
            let next = chain.get(i + 1).map(|(fp, _)| *fp).unwrap_or(MAIN_STACK + 0x500);
            process.mock.write_u64(*fp, next);
            process.mock.write_u64(fp + 8, *ret);
        }
        process.mock.set_registers(RegisterSnapshot {
            rip: FN_RB_ARY_EACH + 0x10,
            rsp: MAIN_STACK + 0xf0,
            rbp: MAIN_STACK + 0x100,
            ..Default::default()
        });
        process
    }

    fn init_classes(&mut self) {
        let classes = [
            ("rb_cObject", "Object"),
            ("rb_cString", "String"),
            ("rb_cArray", "Array"),
            ("rb_cHash", "Hash"),
            ("rb_eRuntimeError", "RuntimeError"),
        ];
        let mut addresses = Vec::new();
        for (i, (global, _)) in classes.iter().enumerate() {
            let klass = self.alloc_offheap(96);
            self.write_header(klass, T_CLASS, 0);
            let address = CLASS_GLOBALS + i as u64 * 8;
            self.mock.add_global(global, address, Some(value_type()));
            self.mock.write_u64(address, klass);
            addresses.push(klass);
        }
        self.classes = Classes {
            object: addresses[0],
            string: addresses[1],
            array: addresses[2],
            hash: addresses[3],
            runtime_error: addresses[4],
        };
    }

    fn init_symbols(&mut self) {
        // ids: [entry0]、entry0 は512シリアル分（シンボルと文字列の2スロットずつ）
        let buffer = self.malloc(ID_ENTRY_UNIT * 2 * 8);
        let entry_header = self.alloc_offheap(40);
        let entry = self.heap_array_at(entry_header, buffer, ID_ENTRY_UNIT * 2);
        let ids_buffer = self.malloc(8);
        self.mock.write_u64(ids_buffer, entry);
        let ids_header = self.alloc_offheap(40);
        let ids = self.heap_array_at(ids_header, ids_buffer, 1);

        self.mock.add_global("ruby_global_symbols", SYMBOLS_GLOBAL, Some(symbols_type()));
        self.mock.write_u64(SYMBOLS_GLOBAL + 16, ids);
        self.symbol_entry = buffer;
    }

    // メモリ確保

    fn alloc_offheap(&mut self, size: u64) -> u64 {
        let address = self.offheap;
        self.offheap += (size + 7) & !7;
        address
    }

    /// mallocした領域（ゼロ埋め）
    pub fn malloc(&mut self, size: u64) -> u64 {
        let address = self.malloc;
        self.malloc += ((size + 15) & !15).max(16);
        address
    }

    /// `size` バイトが入る最小のスロットを確保する
    pub fn alloc_slot(&mut self, size: u64) -> u64 {
        let page = (0..PAGE_SLOT_SIZES.len())
            .filter(|&i| PAGE_SLOT_SIZES[i] >= size && self.used[i] < SLOTS_PER_PAGE)
            .min_by_key(|&i| (PAGE_SLOT_SIZES[i], i))
            .unwrap_or_else(|| panic!("synthetic heap is full for {} byte objects", size));
        let slot = self.used[page];
        self.used[page] += 1;
        PAGE_BASE + page as u64 * PAGE_STRIDE + slot * PAGE_SLOT_SIZES[page]
    }

    fn write_header(&self, address: u64, flags: u64, klass: u64) {
        self.mock.write_u64(address, flags);
        self.mock.write_u64(address + 8, klass);
    }

    /// ページヘッダへのポインタを壊す（ヘッダが読めないページ）
    pub fn corrupt_page_header(&self, index: usize) {
        self.mock.write_u64(SORTED_PAGES + 16 + index as u64 * 8, 0xdead_0000);
    }

    /// ページ本体の先頭アドレス
    pub fn page_start(index: usize) -> u64 {
        PAGE_BASE + index as u64 * PAGE_STRIDE
    }

    pub fn mock(&self) -> &MockBackend {
        &self.mock
    }

    // オブジェクト

    fn string_at(&mut self, address: u64, text: &[u8]) -> u64 {
        let len = text.len() as u64;
        if len < 16 {
            self.write_header(address, T_STRING, self.classes.string);
            self.mock.write_u64(address + 16, len);
            self.mock.write_bytes(address + 24, text);
        } else {
            let buffer = self.malloc(len + 1);
            self.mock.write_bytes(buffer, text);
            self.write_header(address, T_STRING | RSTRING_NOEMBED, self.classes.string);
            self.mock.write_u64(address + 16, len);
            self.mock.write_u64(address + 24, buffer);
        }
        address
    }

    /// 文字列（15バイトまでは埋め込み）
    pub fn string(&mut self, text: &str) -> u64 {
        let address = self.alloc_slot(40);
        self.string_at(address, text.as_bytes())
    }

    /// ヒープ外の文字列（ヒープスキャンに現れない）
    pub fn frozen_string(&mut self, text: &str) -> u64 {
        let address = self.alloc_offheap(40);
        self.string_at(address, text.as_bytes())
    }

    fn heap_array_at(&mut self, address: u64, buffer: u64, len: u64) -> u64 {
        self.write_header(address, T_ARRAY, self.classes.array);
        self.mock.write_u64(address + 16, len);
        self.mock.write_u64(address + 32, buffer);
        address
    }

    /// 配列（3要素までは埋め込み）
    pub fn array(&mut self, items: &[u64]) -> u64 {
        let address = self.alloc_slot(40);
        let len = items.len() as u64;
        if len <= 3 {
            self.write_header(address, T_ARRAY | RARRAY_EMBED_FLAG | (len << RARRAY_EMBED_LEN_SHIFT), self.classes.array);
            for (i, item) in items.iter().enumerate() {
                self.mock.write_u64(address + 16 + i as u64 * 8, *item);
            }
            return address;
        }
        let buffer = self.malloc(len * 8);
        for (i, item) in items.iter().enumerate() {
            self.mock.write_u64(buffer + i as u64 * 8, *item);
        }
        self.heap_array_at(address, buffer, len)
    }

    /// ARテーブルのハッシュ（8ペアまで）
    pub fn hash(&mut self, pairs: &[(u64, u64)]) -> u64 {
        assert!(pairs.len() <= 8, "AR tables hold at most 8 pairs");
        let address = self.alloc_slot(160);
        let n = pairs.len() as u64;
        self.write_header(
            address,
            T_HASH | (n << RHASH_AR_SIZE_SHIFT) | (n << RHASH_AR_BOUND_SHIFT),
            self.classes.hash,
        );
        self.mock.write_u64(address + 16, QNIL);
        for (i, (key, value)) in pairs.iter().enumerate() {
            let pair = address + 24 + 8 + i as u64 * 16;
            self.mock.write_u64(pair, *key);
            self.mock.write_u64(pair + 8, *value);
        }
        address
    }

    /// STテーブルのハッシュ（`None` のキーは削除済みエントリ）
    pub fn st_hash(&mut self, entries: &[Option<(u64, u64)>]) -> u64 {
        let address = self.alloc_slot(160);
        self.write_header(address, T_HASH | RHASH_ST_TABLE_FLAG, self.classes.hash);
        self.mock.write_u64(address + 16, QNIL);

        let buffer = self.malloc(entries.len() as u64 * 24);
        for (i, entry) in entries.iter().enumerate() {
            let slot = buffer + i as u64 * 24;
            let (key, value) = entry.unwrap_or((QUNDEF, QNIL));
            self.mock.write_u64(slot, i as u64);
            self.mock.write_u64(slot + 8, key);
            self.mock.write_u64(slot + 16, value);
        }
        let st = address + 24;
        let live = entries.iter().filter(|e| e.is_some()).count() as u64;
        self.mock.write_u64(st + 16, live);
        self.mock.write_u64(st + 32, 0);
        self.mock.write_u64(st + 40, entries.len() as u64);
        self.mock.write_u64(st + 48, buffer);
        address
    }

    /// Struct（3メンバまでは埋め込み）
    pub fn structure(&mut self, members: &[u64]) -> u64 {
        let address = self.alloc_slot(40);
        let len = members.len() as u64;
        if (1..=3).contains(&len) {
            self.write_header(address, T_STRUCT | (len << RSTRUCT_EMBED_LEN_SHIFT), self.classes.object);
            for (i, member) in members.iter().enumerate() {
                self.mock.write_u64(address + 16 + i as u64 * 8, *member);
            }
            return address;
        }
        let buffer = self.malloc(len * 8);
        for (i, member) in members.iter().enumerate() {
            self.mock.write_u64(buffer + i as u64 * 8, *member);
        }
        self.write_header(address, T_STRUCT, self.classes.object);
        self.mock.write_u64(address + 16, len);
        self.mock.write_u64(address + 24, buffer);
        address
    }

    /// 桁をmallocした領域に置く多倍長整数
    pub fn bignum(&mut self, value: &BigInt) -> u64 {
        let address = self.alloc_slot(40);
        let (sign, mut digits) = value.to_u32_digits();
        if digits.is_empty() {
            digits.push(0);
        }
        let buffer = self.malloc(digits.len() as u64 * 4);
        for (i, digit) in digits.iter().enumerate() {
            self.mock.write_u32(buffer + i as u64 * 4, *digit);
        }
        let sign_bit = if sign == Sign::Minus { 0 } else { BIGNUM_SIGN_BIT };
        self.write_header(address, T_BIGNUM | sign_bit, self.classes.object);
        self.mock.write_u64(address + 16, digits.len() as u64);
        self.mock.write_u64(address + 24, buffer);
        address
    }

    /// ヒープ上のFloat
    pub fn float(&mut self, value: f64) -> u64 {
        let address = self.alloc_slot(40);
        self.write_header(address, T_FLOAT, self.classes.object);
        self.mock.write_u64(address + 16, value.to_bits());
        address
    }

    /// 動的シンボル
    pub fn dynamic_symbol(&mut self, name: &str) -> u64 {
        let fstr = self.frozen_string(name);
        let address = self.alloc_slot(40);
        self.write_header(address, T_SYMBOL, 0);
        self.mock.write_u64(address + 24, fstr);
        self.mock.write_u64(address + 32, 0x9990);
        address
    }

    /// `klass` のインスタンス
    pub fn object(&mut self, klass: u64) -> u64 {
        let address = self.alloc_slot(40);
        self.write_header(address, T_OBJECT, klass);
        address
    }

    /// 名前付きのクラス（`classpath` を持つ）
    pub fn class(&mut self, path: &str) -> u64 {
        let classpath = self.frozen_string(path);
        let klass = self.alloc_offheap(96);
        self.write_header(klass, T_CLASS, 0);
        self.mock.write_u64(klass + 32 + 40, classpath);
        klass
    }

    /// 型付きデータ
    pub fn typed_data(&mut self, type_ptr: u64, data: u64) -> u64 {
        let address = self.alloc_slot(40);
        self.write_header(address, T_DATA, self.classes.object);
        self.mock.write_u64(address + 16, type_ptr);
        self.mock.write_u64(address + 24, 1);
        self.mock.write_u64(address + 32, data);
        address
    }

    /// IDを割り当てて名前を登録する
    pub fn intern(&mut self, name: &str) -> u64 {
        if let Some(id) = self.interned.get(name) {
            return *id;
        }
        let serial = self.next_serial;
        self.next_serial += 1;
        let fstr = self.frozen_string(name);
        self.mock
            .write_u64(self.symbol_entry + (serial % ID_ENTRY_UNIT) * 2 * 8, fstr);
        self.mock.write_u32(SYMBOLS_GLOBAL, serial as u32);
        let id = serial << 4;
        self.interned.insert(name.to_string(), id);
        id
    }

    /// 即値のシンボル
    pub fn symbol(&mut self, name: &str) -> u64 {
        (self.intern(name) << 8) | 0x0c
    }

    // VM

    fn iseq(&mut self, path: &str, label: &str, first_lineno: i32, lines: &[(u32, i32)]) -> (u64, u64) {
        let pathobj = self.frozen_string(path);
        let label = self.frozen_string(label);
        let encoded = self.malloc(ISEQ_WORDS * 8);
        let positions = self.malloc(lines.len() as u64 * 4);
        let entries = self.malloc(lines.len() as u64 * 12);
        for (i, (position, line)) in lines.iter().enumerate() {
            self.mock.write_u32(positions + i as u64 * 4, *position);
            self.mock.write_u32(entries + i as u64 * 12, *line as u32);
        }

        let body = self.malloc(96);
        self.mock.write_u32(body + 4, ISEQ_WORDS as u32);
        self.mock.write_u64(body + 8, encoded);
        self.mock.write_u64(body + 16, pathobj);
        self.mock.write_u64(body + 32, label);
        self.mock.write_u32(body + 40, first_lineno as u32);
        self.mock.write_u64(body + 64, entries);
        self.mock.write_u64(body + 72, positions);
        self.mock.write_u32(body + 80, lines.len() as u32);

        let iseq = self.alloc_offheap(40);
        self.mock.write_u64(iseq, T_IMEMO | (IMEMO_ISEQ << FL_USHIFT));
        self.mock.write_u64(iseq + 16, body);
        (iseq, encoded)
    }

    fn method_entry(&mut self, method: &str, func: u64) -> u64 {
        let id = self.intern(method);
        let def = self.malloc(48);
        self.mock.write_u64(def + 8, func);
        self.mock.write_u64(def + 32, id);
        let me = self.malloc(40);
        self.mock.write_u64(me + 16, def);
        self.mock.write_u64(me + 24, id);
        me
    }

    /// VMスタックを組み立てる（`frames` は外側から順）
    ///
    /// 末尾の番兵フレーム（DUMMY）はウォーカの範囲外に置きます。
    pub fn vm_stack(&mut self, frames: &[Frame]) -> VmStack {
        let vm_stack = self.malloc(VM_STACK_WORDS * 8);
        let end = vm_stack + VM_STACK_WORDS * 8 - CFP_SIZE;
        let dummy_ep = vm_stack + 8 * 2;
        self.mock.write_u64(dummy_ep, VM_FRAME_MAGIC_DUMMY);
        self.mock.write_u64(end + 8, dummy_ep + 8);
        self.mock.write_u64(end + 32, dummy_ep);

        let mut cfp = end;
        for (i, frame) in frames.iter().enumerate() {
            cfp = end - CFP_SIZE * (i as u64 + 1);
            let ep = vm_stack + 8 * (ENV_WORDS * (i as u64 + 1) + 2);
            self.mock.write_u64(cfp + 24, QNIL);
            self.mock.write_u64(cfp + 32, ep);
            match frame {
                Frame::Iseq {
                    magic,
                    path,
                    label,
                    first_lineno,
                    lines,
                    pc,
                    locals,
                } => {
                    let (iseq, encoded) = self.iseq(path, label, *first_lineno, lines);
                    self.mock.write_u64(ep, *magic);
                    for (j, local) in locals.iter().enumerate() {
                        self.mock.write_u64(ep + 8 * (j as u64 + 1), *local);
                    }
                    self.mock.write_u64(cfp, encoded + pc * 8);
                    self.mock.write_u64(cfp + 8, ep + 8 * (locals.len() as u64 + 1));
                    self.mock.write_u64(cfp + 16, iseq);
                }
                Frame::Cfunc { method, func } => {
                    let me = self.method_entry(method, *func);
                    self.mock.write_u64(ep, VM_FRAME_MAGIC_CFUNC);
                    self.mock.write_u64(ep - 16, me);
                    self.mock.write_u64(cfp + 8, ep + 8);
                }
            }
        }
        VmStack {
            vm_stack,
            size: VM_STACK_WORDS,
            cfp,
        }
    }

    fn write_context(&self, ec: u64, stack: VmStack) {
        self.mock.write_u64(ec, stack.vm_stack);
        self.mock.write_u64(ec + 8, stack.size);
        self.mock.write_u64(ec + 16, stack.cfp);
        self.mock.write_u64(ec + 40, QNIL);
        self.mock.write_u64(ec + 48, QNIL);
    }

    /// mallocした `rb_execution_context_t`
    pub fn execution_context(&mut self, stack: VmStack) -> u64 {
        let ec = self.malloc(64);
        self.write_context(ec, stack);
        ec
    }

    /// メインスレッドのEC（`standard` で作ったもの）
    pub fn main_ec(&self) -> u64 {
        self.main_ec
    }

    pub fn set_errinfo(&self, ec: u64, errinfo: u64) {
        self.mock.write_u64(ec + 40, errinfo);
    }

    pub fn set_storage(&self, ec: u64, storage: u64) {
        self.mock.write_u64(ec + 48, storage);
    }

    pub fn set_interrupts(&self, ec: u64, flag: u32, mask: u32) {
        self.mock.write_u32(ec + 32, flag);
        self.mock.write_u32(ec + 36, mask);
    }

    /// ensure中のタグ（`retval` 付き）
    pub fn set_tag(&mut self, ec: u64, retval: u64, state: u32) {
        let tag = self.malloc(24);
        self.mock.write_u64(tag + 8, retval);
        self.mock.write_u32(tag + 16, state);
        self.mock.write_u64(ec + 24, tag);
    }

    pub fn set_signal_buff_size(&self, size: u32) {
        self.mock.add_global("signal_buff", SIGNAL_BUFF_GLOBAL, Some(signal_buff_type()));
        self.mock.write_u32(SIGNAL_BUFF_GLOBAL + 260, size);
    }

    /// ファイバを作る
    ///
    /// CREATED以外は保存レジスタとマシンスタック（coroutine_transfer <- fiber_entry）、
    /// `worker.rb` の1フレームを持ちます。
    pub fn fiber(&mut self, status: u64) -> FiberParts {
        let ptr = self.malloc(176);
        let ec = ptr + 16;
        let value = self.typed_data(FIBER_DATA_TYPE, ptr);
        self.mock.write_u32(ptr + 96, status as u32);

        let stack_base = self.fiber_stacks;
        self.fiber_stacks += FIBER_STACK_SIZE;
        self.mock.map(stack_base, FIBER_STACK_SIZE as usize);
        self.mock.write_u64(ptr + 104, stack_base);
        self.mock.write_u64(ptr + 104 + 16, FIBER_STACK_SIZE);

        if status == FIBER_CREATED {
            return FiberParts {
                value,
                ptr,
                ec,
                stack_pointer: 0,
                stack_base,
                rip: 0,
            };
        }

        let stack = self.vm_stack(&[Frame::method("worker.rb", "work", 3, &[(0, 3), (2, 5)], 4)]);
        self.write_context(ec, stack);

        let stack_pointer = stack_base + 0xf000;
        let rbp = stack_base + 0xf100;
        let rip = FN_COROUTINE_TRANSFER + 0x20;
        for (i, word) in [0x15u64, 0x14, 0x13, 0x12, 0x0b, rbp, rip].iter().enumerate() {
            self.mock.write_u64(stack_pointer + i as u64 * 8, *word);
        }
        self.mock.write_u64(rbp, stack_base + 0xf200);
        self.mock.write_u64(rbp + 8, FN_FIBER_ENTRY + 0x10);
        self.mock.write_u64(ptr + 152, stack_pointer);

        FiberParts {
            value,
            ptr,
            ec,
            stack_pointer,
            stack_base,
            rip,
        }
    }

    /// セッションを作る
    pub fn session(self) -> Session {
        Session::new(Box::new(self.mock))
    }

    /// Rubyコマンドを登録したデバッガを作る
    pub fn debugger(self) -> (Debugger, Rc<RubyState>) {
        let mut debugger = Debugger::new(Box::new(self.mock)).expect("debugger");
        let state = rbprobe_ruby::install(&mut debugger).expect("install ruby commands");
        (debugger, state)
    }
}

impl Default for RubyProcess {
    fn default() -> Self {
        Self::new()
    }
}

/// セッションのモックを取り出す（構築後にメモリを書き換える）
pub fn mock(session: &Session) -> &MockBackend {
    session.native_as::<MockBackend>().expect("mock backend")
}

/// コマンドを実行して出力を返す
pub fn run(debugger: &Debugger, line: &str) -> String {
    let mut out = Vec::new();
    debugger.run_line(line, &mut out);
    String::from_utf8(out).expect("utf-8 output")
}
