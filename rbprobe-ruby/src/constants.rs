//! ランタイム定数
//!
//! 型タグやフラグのビット配置はRubyのバージョンごとに変わるため、デバッグ対象の
//! 列挙型（`ruby_value_type`、`ruby_fl_type` など）から読み込みます。
//! 列挙子がシンボル情報に無い場合だけ既定値を使います。
//! 読み込みはセッションの列挙子キャッシュを通るので、2回目以降は高速です。

use rbprobe_core::Session;
use std::fmt;

/// ヒープオブジェクトの型タグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RubyType {
    None,
    Object,
    Class,
    Module,
    Float,
    String,
    Regexp,
    Array,
    Hash,
    Struct,
    Bignum,
    File,
    Data,
    Match,
    Complex,
    Rational,
    Nil,
    True,
    False,
    Symbol,
    Fixnum,
    Undef,
    IMemo,
    Node,
    IClass,
    Zombie,
    Moved,
}

impl RubyType {
    pub const ALL: [RubyType; 27] = [
        RubyType::None,
        RubyType::Object,
        RubyType::Class,
        RubyType::Module,
        RubyType::Float,
        RubyType::String,
        RubyType::Regexp,
        RubyType::Array,
        RubyType::Hash,
        RubyType::Struct,
        RubyType::Bignum,
        RubyType::File,
        RubyType::Data,
        RubyType::Match,
        RubyType::Complex,
        RubyType::Rational,
        RubyType::Nil,
        RubyType::True,
        RubyType::False,
        RubyType::Symbol,
        RubyType::Fixnum,
        RubyType::Undef,
        RubyType::IMemo,
        RubyType::Node,
        RubyType::IClass,
        RubyType::Zombie,
        RubyType::Moved,
    ];

    /// `T_STRING` 形式の名前
    pub fn name(&self) -> &'static str {
        match self {
            RubyType::None => "T_NONE",
            RubyType::Object => "T_OBJECT",
            RubyType::Class => "T_CLASS",
            RubyType::Module => "T_MODULE",
            RubyType::Float => "T_FLOAT",
            RubyType::String => "T_STRING",
            RubyType::Regexp => "T_REGEXP",
            RubyType::Array => "T_ARRAY",
            RubyType::Hash => "T_HASH",
            RubyType::Struct => "T_STRUCT",
            RubyType::Bignum => "T_BIGNUM",
            RubyType::File => "T_FILE",
            RubyType::Data => "T_DATA",
            RubyType::Match => "T_MATCH",
            RubyType::Complex => "T_COMPLEX",
            RubyType::Rational => "T_RATIONAL",
            RubyType::Nil => "T_NIL",
            RubyType::True => "T_TRUE",
            RubyType::False => "T_FALSE",
            RubyType::Symbol => "T_SYMBOL",
            RubyType::Fixnum => "T_FIXNUM",
            RubyType::Undef => "T_UNDEF",
            RubyType::IMemo => "T_IMEMO",
            RubyType::Node => "T_NODE",
            RubyType::IClass => "T_ICLASS",
            RubyType::Zombie => "T_ZOMBIE",
            RubyType::Moved => "T_MOVED",
        }
    }

    /// 列挙子名（`RUBY_T_STRING`）
    fn enumerator(&self) -> String {
        format!("RUBY_{}", self.name())
    }

    /// 列挙子が見つからないときの値
    fn default_tag(&self) -> u64 {
        match self {
            RubyType::None => 0x00,
            RubyType::Object => 0x01,
            RubyType::Class => 0x02,
            RubyType::Module => 0x03,
            RubyType::Float => 0x04,
            RubyType::String => 0x05,
            RubyType::Regexp => 0x06,
            RubyType::Array => 0x07,
            RubyType::Hash => 0x08,
            RubyType::Struct => 0x09,
            RubyType::Bignum => 0x0a,
            RubyType::File => 0x0b,
            RubyType::Data => 0x0c,
            RubyType::Match => 0x0d,
            RubyType::Complex => 0x0e,
            RubyType::Rational => 0x0f,
            RubyType::Nil => 0x11,
            RubyType::True => 0x12,
            RubyType::False => 0x13,
            RubyType::Symbol => 0x14,
            RubyType::Fixnum => 0x15,
            RubyType::Undef => 0x16,
            RubyType::IMemo => 0x1a,
            RubyType::Node => 0x1b,
            RubyType::IClass => 0x1c,
            RubyType::Zombie => 0x1d,
            RubyType::Moved => 0x1e,
        }
    }
}

impl fmt::Display for RubyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// デバッグ対象から読み込んだ定数
#[derive(Debug, Clone)]
pub struct RubyConstants {
    // ruby_special_consts
    pub qfalse: u64,
    pub qtrue: u64,
    pub qnil: u64,
    pub qundef: u64,
    pub immediate_mask: u64,
    pub fixnum_flag: u64,
    pub flonum_mask: u64,
    pub flonum_flag: u64,
    pub symbol_flag: u64,
    pub special_shift: u64,

    pub t_mask: u64,
    pub fl_ushift: u64,
    tags: Vec<(RubyType, u64)>,

    pub string_noembed: u64,
    pub array_embed_flag: u64,
    pub array_embed_len_mask: u64,
    pub array_embed_len_shift: u64,
    pub hash_st_table_flag: u64,
    pub hash_ar_size_mask: u64,
    pub hash_ar_size_shift: u64,
    pub hash_ar_bound_mask: u64,
    pub hash_ar_bound_shift: u64,
    pub struct_embed_len_mask: u64,
    pub struct_embed_len_shift: u64,
    pub bignum_sign_bit: u64,
    pub bignum_embed_flag: u64,
    pub bignum_embed_len_mask: u64,
    pub bignum_embed_len_shift: u64,

    // シンボルID
    pub id_scope_shift: u64,
    pub last_op_id: u64,

    // T_IMEMO
    pub imemo_mask: u64,
    pub imemo_ifunc: u64,
}

impl RubyConstants {
    /// セッションから定数を読み込む
    pub fn load(session: &Session) -> Self {
        let get = |enum_name: &str, member: &str, default: u64| lookup(session, enum_name, member, default);

        let fl_ushift = get("ruby_fl_ushift", "RUBY_FL_USHIFT", 12);
        let user = |n: u64| 1u64 << (fl_ushift + n);
        let users = |from: u64, to: u64| (from..=to).fold(0, |acc, n| acc | user(n));

        let tags = RubyType::ALL
            .iter()
            .map(|t| (*t, get("ruby_value_type", &t.enumerator(), t.default_tag())))
            .collect();

        Self {
            qfalse: get("ruby_special_consts", "RUBY_Qfalse", 0x00),
            qtrue: get("ruby_special_consts", "RUBY_Qtrue", 0x14),
            qnil: get("ruby_special_consts", "RUBY_Qnil", 0x04),
            qundef: get("ruby_special_consts", "RUBY_Qundef", 0x24),
            immediate_mask: get("ruby_special_consts", "RUBY_IMMEDIATE_MASK", 0x07),
            fixnum_flag: get("ruby_special_consts", "RUBY_FIXNUM_FLAG", 0x01),
            flonum_mask: get("ruby_special_consts", "RUBY_FLONUM_MASK", 0x03),
            flonum_flag: get("ruby_special_consts", "RUBY_FLONUM_FLAG", 0x02),
            symbol_flag: get("ruby_special_consts", "RUBY_SYMBOL_FLAG", 0x0c),
            special_shift: get("ruby_special_consts", "RUBY_SPECIAL_SHIFT", 8),

            t_mask: get("ruby_value_type", "RUBY_T_MASK", 0x1f),
            fl_ushift,
            tags,

            string_noembed: get("ruby_rstring_flags", "RSTRING_NOEMBED", user(1)),
            array_embed_flag: get("ruby_rarray_flags", "RARRAY_EMBED_FLAG", user(1)),
            array_embed_len_mask: get("ruby_rarray_flags", "RARRAY_EMBED_LEN_MASK", users(3, 9)),
            array_embed_len_shift: get("ruby_rarray_consts", "RARRAY_EMBED_LEN_SHIFT", fl_ushift + 3),
            hash_st_table_flag: get("ruby_rhash_flags", "RHASH_ST_TABLE_FLAG", user(3)),
            hash_ar_size_mask: get("ruby_rhash_flags", "RHASH_AR_TABLE_SIZE_MASK", users(4, 7)),
            hash_ar_size_shift: get("ruby_rhash_flags", "RHASH_AR_TABLE_SIZE_SHIFT", fl_ushift + 4),
            hash_ar_bound_mask: get("ruby_rhash_flags", "RHASH_AR_TABLE_BOUND_MASK", users(8, 11)),
            hash_ar_bound_shift: get("ruby_rhash_flags", "RHASH_AR_TABLE_BOUND_SHIFT", fl_ushift + 8),
            struct_embed_len_mask: get("ruby_rstruct_flags", "RSTRUCT_EMBED_LEN_MASK", users(1, 7)),
            struct_embed_len_shift: get("ruby_rstruct_flags", "RSTRUCT_EMBED_LEN_SHIFT", fl_ushift + 1),
            bignum_sign_bit: get("ruby_rbignum_flags", "BIGNUM_SIGN_BIT", user(1)),
            bignum_embed_flag: get("ruby_rbignum_flags", "BIGNUM_EMBED_FLAG", user(2)),
            bignum_embed_len_mask: get("ruby_rbignum_flags", "BIGNUM_EMBED_LEN_MASK", users(3, 9)),
            bignum_embed_len_shift: get("ruby_rbignum_flags", "BIGNUM_EMBED_LEN_SHIFT", fl_ushift + 3),

            id_scope_shift: get("ruby_id_types", "RUBY_ID_SCOPE_SHIFT", 4),
            last_op_id: get("ruby_method_ids", "tLAST_OP_ID", 163),

            imemo_mask: get("imemo_type", "IMEMO_MASK", 0x0f),
            imemo_ifunc: get("imemo_type", "imemo_ifunc", 4),
        }
    }

    /// 型の値
    pub fn tag(&self, ty: RubyType) -> u64 {
        self.tags
            .iter()
            .find(|(t, _)| *t == ty)
            .map(|(_, v)| *v)
            .unwrap_or_else(|| ty.default_tag())
    }

    /// 値から型を引く
    pub fn type_of_tag(&self, tag: u64) -> Option<RubyType> {
        self.tags.iter().find(|(_, v)| *v == tag).map(|(t, _)| *t)
    }

    /// フラグから型タグを取り出す
    pub fn tag_of(&self, flags: u64) -> u64 {
        flags & self.t_mask
    }

    /// 即値（false/nilを含む特殊定数）か
    pub fn is_special_const(&self, value: u64) -> bool {
        value & self.immediate_mask != 0 || value & !self.qnil == 0
    }

    /// 値が nil/false 以外の即値でないヒープ参照か
    pub fn is_heap_pointer(&self, value: u64) -> bool {
        !self.is_special_const(value)
    }

    /// 型名（`T_STRING`、`RUBY_T_STRING`、`string`）か数値から型タグを得る
    pub fn parse_type_filter(&self, text: &str) -> Option<u64> {
        let text = text.trim();
        if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16).ok();
        }
        if let Ok(n) = text.parse::<u64>() {
            return Some(n);
        }

        let upper = text.to_ascii_uppercase();
        let name = upper.strip_prefix("RUBY_").unwrap_or(&upper);
        let name = name.strip_prefix("T_").unwrap_or(name);
        RubyType::ALL
            .iter()
            .find(|t| &t.name()[2..] == name)
            .map(|t| self.tag(*t))
    }
}

/// 列挙子を探す（列挙型名付き、名前のみ、既定値の順）
fn lookup(session: &Session, enum_name: &str, member: &str, default: u64) -> u64 {
    session
        .enum_value(Some(enum_name), member)
        .or_else(|| session.enum_value(None, member))
        .map(|v| v as u64)
        .unwrap_or(default)
}
