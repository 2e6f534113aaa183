//! 値の分類
//!
//! 生の `VALUE` を調べて `RubyObject` に変換します。即値はメモリを読まずに判定し、
//! ヒープオブジェクトは `RBasic.flags` の型タグで振り分けます。
//! コンテナは深さ `depth` まで子を展開し、それより深いオブジェクトは `Shallow` になります。

use crate::constants::RubyType;
use crate::rarray::RArray;
use crate::rbignum::RBignum;
use crate::rhash::RHash;
use crate::rstring::{self, RString, MAX_STRING_BYTES};
use crate::rstruct::RStruct;
use crate::runtime::Runtime;
use crate::{rclass, rfloat, rsymbol, Result};
use num_bigint::BigInt;
use rbprobe_core::DebuggerError;
use std::fmt;

/// 展開する子の数の上限
pub const MAX_CHILDREN: usize = 1024;

/// 埋め込みかヒープか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Embedded,
    Heap,
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Storage::Embedded => "embedded",
            Storage::Heap => "heap",
        })
    }
}

/// ハッシュテーブルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashTable {
    Ar { size: u64, bound: u64 },
    St { entries: u64 },
}

impl HashTable {
    pub fn len(&self) -> u64 {
        match self {
            HashTable::Ar { size, .. } => *size,
            HashTable::St { entries } => *entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 分類結果
#[derive(Debug, Clone, PartialEq)]
pub enum RubyObject {
    False,
    Nil,
    True,
    Undef,
    Fixnum(i64),
    /// flonumなら `address` はNone
    Float {
        address: Option<u64>,
        value: f64,
    },
    /// 即値のシンボルなら `address` はNone
    Symbol {
        address: Option<u64>,
        id: u64,
        name: Option<String>,
    },
    String {
        address: u64,
        storage: Storage,
        length: u64,
        bytes: Vec<u8>,
    },
    Array {
        address: u64,
        storage: Storage,
        length: u64,
        items: Vec<RubyObject>,
    },
    Hash {
        address: u64,
        table: HashTable,
        entries: Vec<(RubyObject, RubyObject)>,
    },
    Struct {
        address: u64,
        storage: Storage,
        length: u64,
        members: Vec<RubyObject>,
    },
    Bignum {
        address: u64,
        storage: Storage,
        length: u64,
        value: BigInt,
    },
    /// T_DATA（型付きなら `type_ptr` と型名がある）
    Data {
        address: u64,
        type_ptr: Option<u64>,
        data_ptr: u64,
        type_name: Option<String>,
    },
    /// 型はわかるが中身はデコードしないオブジェクト
    Basic {
        address: u64,
        tag: RubyType,
        class_name: String,
    },
    /// 深さの上限を超えたオブジェクト
    Shallow {
        address: u64,
        tag: RubyType,
    },
    /// 未知の型タグ
    Unknown {
        address: u64,
        flags: u64,
    },
    /// メモリが読めなかった
    Error {
        address: u64,
        reason: String,
    },
}

impl RubyObject {
    /// ヒープオブジェクトならそのアドレス
    pub fn address(&self) -> Option<u64> {
        match self {
            RubyObject::False
            | RubyObject::Nil
            | RubyObject::True
            | RubyObject::Undef
            | RubyObject::Fixnum(_) => None,
            RubyObject::Float { address, .. } | RubyObject::Symbol { address, .. } => *address,
            RubyObject::String { address, .. }
            | RubyObject::Array { address, .. }
            | RubyObject::Hash { address, .. }
            | RubyObject::Struct { address, .. }
            | RubyObject::Bignum { address, .. }
            | RubyObject::Data { address, .. }
            | RubyObject::Basic { address, .. }
            | RubyObject::Shallow { address, .. }
            | RubyObject::Unknown { address, .. }
            | RubyObject::Error { address, .. } => Some(*address),
        }
    }

    /// 型（未知の型とエラーはNone）
    pub fn tag(&self) -> Option<RubyType> {
        Some(match self {
            RubyObject::False => RubyType::False,
            RubyObject::Nil => RubyType::Nil,
            RubyObject::True => RubyType::True,
            RubyObject::Undef => RubyType::Undef,
            RubyObject::Fixnum(_) => RubyType::Fixnum,
            RubyObject::Float { .. } => RubyType::Float,
            RubyObject::Symbol { .. } => RubyType::Symbol,
            RubyObject::String { .. } => RubyType::String,
            RubyObject::Array { .. } => RubyType::Array,
            RubyObject::Hash { .. } => RubyType::Hash,
            RubyObject::Struct { .. } => RubyType::Struct,
            RubyObject::Bignum { .. } => RubyType::Bignum,
            RubyObject::Data { .. } => RubyType::Data,
            RubyObject::Basic { tag, .. } | RubyObject::Shallow { tag, .. } => *tag,
            RubyObject::Unknown { .. } | RubyObject::Error { .. } => return None,
        })
    }

    /// 子を持つ型で、子が1つ以上あるか
    pub fn has_children(&self) -> bool {
        match self {
            RubyObject::Array { length, .. } | RubyObject::Struct { length, .. } => *length > 0,
            RubyObject::Hash { table, .. } => !table.is_empty(),
            _ => false,
        }
    }

    /// `self` が `deeper` を浅く切り詰めたものか
    ///
    /// 同じ値であるか、`self` が同じアドレス・型の `Shallow` であるか、
    /// 同じヘッダを持つコンテナで子が再帰的に切り詰めになっていれば真です。
    pub fn is_truncation_of(&self, deeper: &RubyObject) -> bool {
        if self == deeper {
            return true;
        }
        match (self, deeper) {
            (RubyObject::Shallow { address, tag }, other) => {
                other.address() == Some(*address) && other.tag() == Some(*tag)
            }
            (
                RubyObject::Array {
                    address: a1,
                    storage: s1,
                    length: l1,
                    items: i1,
                },
                RubyObject::Array {
                    address: a2,
                    storage: s2,
                    length: l2,
                    items: i2,
                },
            ) => (a1, s1, l1) == (a2, s2, l2) && all_truncated(i1, i2),
            (
                RubyObject::Struct {
                    address: a1,
                    storage: s1,
                    length: l1,
                    members: m1,
                },
                RubyObject::Struct {
                    address: a2,
                    storage: s2,
                    length: l2,
                    members: m2,
                },
            ) => (a1, s1, l1) == (a2, s2, l2) && all_truncated(m1, m2),
            (
                RubyObject::Hash {
                    address: a1,
                    table: t1,
                    entries: e1,
                },
                RubyObject::Hash {
                    address: a2,
                    table: t2,
                    entries: e2,
                },
            ) => {
                (a1, t1) == (a2, t2)
                    && e1.len() == e2.len()
                    && e1
                        .iter()
                        .zip(e2)
                        .all(|((k1, v1), (k2, v2))| k1.is_truncation_of(k2) && v1.is_truncation_of(v2))
            }
            _ => false,
        }
    }
}

fn all_truncated(shallow: &[RubyObject], deep: &[RubyObject]) -> bool {
    shallow.len() == deep.len() && shallow.iter().zip(deep).all(|(s, d)| s.is_truncation_of(d))
}

/// 見出し行（`<T_STRING@0x... embedded length=5> 'Alice'` など）
impl fmt::Display for RubyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RubyObject::False => f.write_str("<T_FALSE>"),
            RubyObject::Nil => f.write_str("<T_NIL>"),
            RubyObject::True => f.write_str("<T_TRUE>"),
            RubyObject::Undef => f.write_str("<T_UNDEF>"),
            RubyObject::Fixnum(n) => write!(f, "<T_FIXNUM> {}", n),
            RubyObject::Float { address: None, value } => write!(f, "<T_FLOAT> {:?}", value),
            RubyObject::Float {
                address: Some(address),
                value,
            } => write!(f, "<T_FLOAT@0x{:x}> {:?}", address, value),
            RubyObject::Symbol { address, id, name } => {
                match address {
                    Some(address) => write!(f, "<T_SYMBOL@0x{:x}> ", address)?,
                    None => f.write_str("<T_SYMBOL> ")?,
                }
                f.write_str(&rsymbol::display_name(*id, name.as_deref()))
            }
            RubyObject::String {
                address,
                storage,
                length,
                bytes,
            } => {
                write!(f, "<T_STRING@0x{:x} {} length={}> {}", address, storage, length, rstring::quote(bytes))?;
                if (bytes.len() as u64) < *length {
                    f.write_str("...")?;
                }
                Ok(())
            }
            RubyObject::Array {
                address,
                storage,
                length,
                ..
            } => write!(f, "<T_ARRAY@0x{:x} {} length={}>", address, storage, length),
            RubyObject::Hash { address, table, .. } => match table {
                HashTable::Ar { size, bound } => {
                    write!(f, "<T_HASH@0x{:x} AR-Table size={} bound={}>", address, size, bound)
                }
                HashTable::St { entries } => write!(f, "<T_HASH@0x{:x} ST-Table entries={}>", address, entries),
            },
            RubyObject::Struct {
                address,
                storage,
                length,
                ..
            } => write!(f, "<T_STRUCT@0x{:x} {} length={}>", address, storage, length),
            RubyObject::Bignum {
                address,
                storage,
                length,
                value,
            } => write!(f, "<T_BIGNUM@0x{:x} {} length={}> {}", address, storage, length, value),
            RubyObject::Data {
                address,
                type_ptr,
                data_ptr,
                type_name,
            } => {
                write!(f, "<T_DATA@0x{:x}", address)?;
                match (type_ptr, type_name) {
                    (Some(_), Some(name)) => write!(f, " {}", name)?,
                    (Some(ty), None) => write!(f, " type=0x{:x}", ty)?,
                    (None, _) => f.write_str(" untyped")?,
                }
                write!(f, " data=0x{:x}>", data_ptr)
            }
            RubyObject::Basic {
                address,
                tag,
                class_name,
            } => write!(f, "<{}@0x{:x}> {}", tag, address, class_name),
            RubyObject::Shallow { address, tag } => write!(f, "<{}@0x{:x}>", tag, address),
            RubyObject::Unknown { address, flags } => {
                write!(f, "<unknown@0x{:x} flags=0x{:x}>", address, flags)
            }
            RubyObject::Error { address, reason } => write!(f, "<error@0x{:x}: {}>", address, reason),
        }
    }
}

/// 値を分類する
///
/// 失敗しても `Error` を返すので、呼び出し側は一括処理の途中で止まりません。
pub fn classify(rt: &Runtime<'_>, raw: u64, depth: usize) -> RubyObject {
    let c = rt.constants();
    if raw == c.qfalse {
        return RubyObject::False;
    }
    if raw == c.qnil {
        return RubyObject::Nil;
    }
    if raw == c.qtrue {
        return RubyObject::True;
    }
    if raw == c.qundef {
        return RubyObject::Undef;
    }
    if raw & c.fixnum_flag != 0 {
        return RubyObject::Fixnum((raw as i64) >> 1);
    }
    if raw & c.flonum_mask == c.flonum_flag {
        return RubyObject::Float {
            address: None,
            value: rfloat::flonum_value(raw),
        };
    }
    if rt.is_static_symbol(raw) {
        let id = rsymbol::static_id(rt, raw);
        return RubyObject::Symbol {
            address: None,
            id,
            name: rsymbol::id_to_name(rt, id),
        };
    }
    if c.is_special_const(raw) {
        return RubyObject::Unknown { address: raw, flags: 0 };
    }

    match classify_heap(rt, raw, depth) {
        Ok(object) => object,
        Err(e) => {
            tracing::debug!(address = format_args!("0x{:x}", raw), "classification failed: {:#}", e);
            let reason = match e.downcast_ref::<DebuggerError>() {
                Some(err @ DebuggerError::MemoryAccess { .. }) => err.to_string(),
                _ => format!("{:#}", e),
            };
            RubyObject::Error { address: raw, reason }
        }
    }
}

fn classify_heap(rt: &Runtime<'_>, address: u64, depth: usize) -> Result<RubyObject> {
    let flags = rt.flags(address)?;
    let Some(tag) = rt.constants().type_of_tag(rt.constants().tag_of(flags)) else {
        return Ok(RubyObject::Unknown { address, flags });
    };

    if depth == 0 {
        return Ok(RubyObject::Shallow { address, tag });
    }
    let child_depth = depth - 1;
    let child = |raw: u64| classify(rt, raw, child_depth);

    Ok(match tag {
        RubyType::String => {
            let s = RString::new(rt, address)?;
            RubyObject::String {
                address,
                storage: s.storage(),
                length: s.length()?,
                bytes: s.read_bytes(MAX_STRING_BYTES)?,
            }
        }
        RubyType::Array => {
            let a = RArray::new(rt, address)?;
            RubyObject::Array {
                address,
                storage: a.storage(),
                length: a.length()?,
                items: a.items(MAX_CHILDREN)?.into_iter().map(child).collect(),
            }
        }
        RubyType::Hash => {
            let h = RHash::new(rt, address)?;
            RubyObject::Hash {
                address,
                table: h.table()?,
                entries: h
                    .pairs(MAX_CHILDREN)?
                    .into_iter()
                    .map(|(k, v)| (child(k), child(v)))
                    .collect(),
            }
        }
        RubyType::Struct => {
            let s = RStruct::new(rt, address)?;
            RubyObject::Struct {
                address,
                storage: s.storage(),
                length: s.length()?,
                members: s.members(MAX_CHILDREN)?.into_iter().map(child).collect(),
            }
        }
        RubyType::Bignum => {
            let b = RBignum::new(rt, address)?;
            RubyObject::Bignum {
                address,
                storage: b.storage(),
                length: b.length()?,
                value: b.value()?,
            }
        }
        RubyType::Float => RubyObject::Float {
            address: Some(address),
            value: rfloat::heap_value(rt, address)?,
        },
        RubyType::Symbol => {
            let symbol = rsymbol::dynamic_symbol(rt, address)?;
            RubyObject::Symbol {
                address: Some(address),
                id: symbol.id,
                name: symbol.name,
            }
        }
        RubyType::Data => typed_data(rt, address)?,
        tag => RubyObject::Basic {
            address,
            tag,
            class_name: rt
                .klass(address)
                .map(|klass| rclass::class_name(rt, klass))
                .unwrap_or_else(|_| "?".to_string()),
        },
    })
}

/// T_DATA（`RTypedData` なら型ポインタと `wrap_struct_name`）
fn typed_data(rt: &Runtime<'_>, address: u64) -> Result<RubyObject> {
    let data = rt.object(address, "struct RTypedData")?;
    let typed_flag = data.field("typed_flag")?.as_u64()?;
    let data_ptr = data.field("data")?.as_u64()?;
    if typed_flag & 1 == 0 {
        return Ok(RubyObject::Data {
            address,
            type_ptr: None,
            data_ptr,
            type_name: None,
        });
    }

    let type_ptr = data.field("type")?.as_u64()?;
    let type_name = rt
        .object(type_ptr, "rb_data_type_t")
        .and_then(|ty| ty.field("wrap_struct_name"))
        .and_then(|name| name.read_c_string(256))
        .ok();
    Ok(RubyObject::Data {
        address,
        type_ptr: Some(type_ptr),
        data_ptr,
        type_name,
    })
}
