//! デバッグ対象の型モデル
//!
//! バックエンドに依存しない型表現です。ポインタ・配列・フィールドの参照先は
//! `TypeHandle` として遅延解決するので、自己参照する構造体も表現できます。

use std::fmt;
use std::rc::Rc;

/// バックエンド固有の型参照（DWARFではDIE参照）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef(pub u64);

/// 遅延解決される型への参照
#[derive(Debug, Clone)]
pub enum TypeHandle {
    /// 解決済み
    Resolved(Type),
    /// バックエンドに解決を依頼する
    Deferred(TypeRef),
    /// 名前で `Session::lookup_type` する
    Named(String),
}

impl TypeHandle {
    /// 名前参照を作る
    pub fn named(name: impl Into<String>) -> Self {
        TypeHandle::Named(name.into())
    }
}

impl From<Type> for TypeHandle {
    fn from(ty: Type) -> Self {
        TypeHandle::Resolved(ty)
    }
}

/// 構造体・unionのフィールド
#[derive(Debug, Clone)]
pub struct Field {
    /// フィールド名（無名メンバは空文字列）
    pub name: String,
    /// バイトオフセット
    pub offset: u64,
    /// ビットフィールドの場合の (ビットオフセット, ビット幅)
    pub bit_field: Option<(u64, u64)>,
    pub ty: TypeHandle,
}

impl Field {
    pub fn new(name: impl Into<String>, offset: u64, ty: impl Into<TypeHandle>) -> Self {
        Self {
            name: name.into(),
            offset,
            bit_field: None,
            ty: ty.into(),
        }
    }

    /// ビットフィールドを作る
    pub fn bits(name: impl Into<String>, offset: u64, bit_offset: u64, bit_size: u64, ty: impl Into<TypeHandle>) -> Self {
        Self {
            bit_field: Some((bit_offset, bit_size)),
            ..Self::new(name, offset, ty)
        }
    }
}

/// 型の種別
#[derive(Debug, Clone)]
pub enum TypeKind {
    Void,
    Base { signed: bool, float: bool },
    Pointer { pointee: TypeHandle },
    Array { element: TypeHandle, length: Option<u64> },
    Struct { fields: Vec<Field> },
    Union { fields: Vec<Field> },
    Enum { members: Vec<(String, i64)> },
    Function,
}

#[derive(Debug)]
struct TypeData {
    name: String,
    size: u64,
    kind: TypeKind,
}

/// 型（名前・サイズ・レイアウト）
#[derive(Clone)]
pub struct Type(Rc<TypeData>);

impl Type {
    fn new(name: impl Into<String>, size: u64, kind: TypeKind) -> Self {
        Type(Rc::new(TypeData {
            name: name.into(),
            size,
            kind,
        }))
    }

    pub fn void() -> Self {
        Self::new("void", 0, TypeKind::Void)
    }

    /// 基本型
    pub fn base(name: impl Into<String>, size: u64, signed: bool, float: bool) -> Self {
        Self::new(name, size, TypeKind::Base { signed, float })
    }

    /// `unsigned long` 相当の64ビット符号なし整数
    pub fn u64_type() -> Self {
        Self::base("unsigned long", 8, false, false)
    }

    /// `long` 相当の64ビット符号付き整数
    pub fn i64_type() -> Self {
        Self::base("long", 8, true, false)
    }

    /// 名前参照先へのポインタ型
    pub fn pointer_to(pointee: impl Into<TypeHandle>, pointee_name: &str) -> Self {
        Self::new(format!("{} *", pointee_name), 8, TypeKind::Pointer { pointee: pointee.into() })
    }

    /// 配列型（要素型は解決済みであること）
    pub fn array_of(element: Type, length: Option<u64>) -> Self {
        let size = element.size() * length.unwrap_or(0);
        let name = match length {
            Some(n) => format!("{} [{}]", element.name(), n),
            None => format!("{} []", element.name()),
        };
        Self::new(
            name,
            size,
            TypeKind::Array {
                element: TypeHandle::Resolved(element),
                length,
            },
        )
    }

    pub fn structure(name: impl Into<String>, size: u64, fields: Vec<Field>) -> Self {
        Self::new(name, size, TypeKind::Struct { fields })
    }

    pub fn union(name: impl Into<String>, size: u64, fields: Vec<Field>) -> Self {
        Self::new(name, size, TypeKind::Union { fields })
    }

    pub fn enumeration(name: impl Into<String>, size: u64, members: Vec<(String, i64)>) -> Self {
        Self::new(name, size, TypeKind::Enum { members })
    }

    pub fn function(name: impl Into<String>) -> Self {
        Self::new(name, 1, TypeKind::Function)
    }

    /// この型へのポインタ型
    pub fn pointer(&self) -> Self {
        Self::pointer_to(TypeHandle::Resolved(self.clone()), self.name())
    }

    /// 同じレイアウトで名前だけ変えた型（typedef用）
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.0.size, self.0.kind.clone())
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn size(&self) -> u64 {
        self.0.size
    }

    pub fn kind(&self) -> &TypeKind {
        &self.0.kind
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.0.kind, TypeKind::Pointer { .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(self.0.kind, TypeKind::Array { .. })
    }

    /// 整数・ポインタ・列挙など、1つの数値として扱える型か
    pub fn is_scalar(&self) -> bool {
        matches!(
            self.0.kind,
            TypeKind::Base { .. } | TypeKind::Pointer { .. } | TypeKind::Enum { .. }
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.0.kind, TypeKind::Base { signed: true, .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(self.0.kind, TypeKind::Base { float: true, .. })
    }

    /// 構造体・unionのフィールド一覧
    pub fn fields(&self) -> &[Field] {
        match &self.0.kind {
            TypeKind::Struct { fields } | TypeKind::Union { fields } => fields,
            _ => &[],
        }
    }

    /// 名前でフィールドを探す（無名メンバの中は探さない）
    pub fn direct_field(&self, name: &str) -> Option<&Field> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// 列挙子の値
    pub fn enum_member(&self, name: &str) -> Option<i64> {
        match &self.0.kind {
            TypeKind::Enum { members } => members.iter().find(|(n, _)| n == name).map(|(_, v)| *v),
            _ => None,
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({}, {} bytes)", self.0.name, self.0.size)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// C言語の基本型名に対応する組み込み型
pub fn builtin_type(name: &str) -> Option<Type> {
    let (size, signed, float) = match name {
        "char" | "signed char" => (1, true, false),
        "unsigned char" | "uint8_t" | "_Bool" | "bool" => (1, false, false),
        "short" | "short int" | "int16_t" => (2, true, false),
        "unsigned short" | "unsigned short int" | "uint16_t" => (2, false, false),
        "int" | "int32_t" => (4, true, false),
        "unsigned int" | "unsigned" | "uint32_t" => (4, false, false),
        "long" | "long int" | "long long" | "long long int" | "int64_t" | "ssize_t" | "intptr_t" => (8, true, false),
        "unsigned long" | "long unsigned int" | "unsigned long long" | "long long unsigned int" | "uint64_t"
        | "size_t" | "uintptr_t" => (8, false, false),
        "float" => (4, true, true),
        "double" => (8, true, true),
        "void" => return Some(Type::void()),
        _ => return None,
    };
    Some(Type::base(name, size, signed, float))
}
