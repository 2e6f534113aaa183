//! DWARF由来のデバッグ情報
//!
//! プロセスとコアの両バックエンドが共有します。DWARFの型情報を `Type` に変換し、
//! ロードバイアスを加算して実行時アドレスで答えます。

use super::{GlobalSymbol, SymbolInfo};
use crate::types::{Field, Type, TypeHandle, TypeRef};
use crate::Result;
use rbprobe_dwarf::{DieRef, DwarfIndex, DwarfLoader, LineInfoProvider, SymbolResolver, TypeInfo};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

/// バイナリ1つ分のデバッグ情報
pub struct DebugInfo {
    loader: DwarfLoader,
    index: DwarfIndex,
    symbols: SymbolResolver,
    lines: Option<LineInfoProvider>,
    /// ロードバイアス（非PIEなら0）
    bias: u64,
    converted: RefCell<HashMap<DieRef, Type>>,
}

impl DebugInfo {
    /// バイナリを読み込む。バイアスは `bias_for` でマッピングから求める
    pub fn load(binary: &Path, bias_for: impl FnOnce(&Path) -> Option<u64>) -> Result<Self> {
        let loader = DwarfLoader::load(binary)?;
        if !loader.has_debug_info() {
            tracing::warn!(binary = %binary.display(), "binary has no DWARF debug info");
        }
        let index = DwarfIndex::build(&loader)?;
        let symbols = SymbolResolver::new(&loader)?;
        let lines = match LineInfoProvider::new(&loader) {
            Ok(lines) => Some(lines),
            Err(e) => {
                tracing::debug!("line table unavailable: {}", e);
                None
            }
        };

        let bias = if loader.is_pie() {
            bias_for(binary).unwrap_or_else(|| {
                tracing::warn!(binary = %binary.display(), "no mapping found for binary; assuming load bias 0");
                0
            })
        } else {
            0
        };
        tracing::debug!(binary = %binary.display(), bias = format_args!("0x{:x}", bias), "loaded debug info");

        Ok(Self {
            loader,
            index,
            symbols,
            lines,
            bias,
            converted: RefCell::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        self.loader.path()
    }

    pub fn bias(&self) -> u64 {
        self.bias
    }

    /// 名前で型を検索する
    pub fn lookup_type(&self, name: &str) -> Option<Type> {
        let die = self.index.find_type(name)?;
        match self.convert(die) {
            Ok(ty) => Some(ty),
            Err(e) => {
                tracing::debug!(name, "failed to convert type: {}", e);
                None
            }
        }
    }

    /// 型参照を解決する
    pub fn resolve_type(&self, type_ref: TypeRef) -> Result<Type> {
        self.convert(DieRef::from_raw(type_ref.0))
    }

    /// グローバル変数（型付き）またはELFシンボル（型なし）
    pub fn lookup_global(&self, name: &str) -> Option<GlobalSymbol> {
        if let Some(var) = self.index.variable(name) {
            let ty = var.type_ref.and_then(|die| self.convert(die).ok());
            return Some(GlobalSymbol {
                address: var.address.wrapping_add(self.bias),
                ty,
            });
        }
        self.symbols.resolve(name).map(|address| GlobalSymbol {
            address: address.wrapping_add(self.bias),
            ty: None,
        })
    }

    pub fn enum_value(&self, enum_name: Option<&str>, member: &str) -> Option<i64> {
        self.index.enumerator(enum_name, member)
    }

    /// 実行時アドレスからシンボルとソース位置を解決する
    pub fn symbol_at(&self, addr: u64) -> Option<SymbolInfo> {
        let file_addr = addr.checked_sub(self.bias)?;
        let symbol = self.symbols.reverse_resolve(file_addr)?;
        let location = self
            .lines
            .as_ref()
            .and_then(|lines| lines.lookup(file_addr).ok().flatten())
            .map(|info| info.to_string());

        Some(SymbolInfo {
            name: symbol.display_name().to_string(),
            start: symbol.address.wrapping_add(self.bias),
            location,
        })
    }

    /// DIEを `Type` に変換する（typedef・修飾子は剥がし、typedef名を表示名に残す）
    fn convert(&self, die: DieRef) -> Result<Type> {
        if let Some(ty) = self.converted.borrow().get(&die) {
            return Ok(ty.clone());
        }

        let deferred = |target: Option<DieRef>| match target {
            Some(die) => TypeHandle::Deferred(TypeRef(die.to_raw())),
            None => TypeHandle::Resolved(Type::void()),
        };

        let ty = match self.index.type_info(die)? {
            TypeInfo::Base { name, size, signed, float } => Type::base(name, size, signed, float),
            TypeInfo::Pointer { pointee, .. } => {
                let pointee_name = match pointee {
                    Some(target) => self.type_name(target),
                    None => "void".to_string(),
                };
                Type::pointer_to(deferred(pointee), &pointee_name)
            }
            TypeInfo::Array { element, length } => {
                // 配列は要素サイズが必要なので要素型を先に解決する
                let element = match element {
                    Some(element) => self.convert(element)?,
                    None => Type::void(),
                };
                Type::array_of(element, length)
            }
            TypeInfo::Struct { name, size, fields } => Type::structure(
                format!("struct {}", name.as_deref().unwrap_or("<anonymous>")),
                size,
                self.convert_fields(fields),
            ),
            TypeInfo::Union { name, size, fields } => Type::union(
                format!("union {}", name.as_deref().unwrap_or("<anonymous>")),
                size,
                self.convert_fields(fields),
            ),
            TypeInfo::Enum { name, size, variants } => Type::enumeration(
                format!("enum {}", name.as_deref().unwrap_or("<anonymous>")),
                size,
                variants.into_iter().map(|v| (v.name, v.value)).collect(),
            ),
            TypeInfo::Typedef { name, target } => match target {
                Some(target) => self.convert(target)?.with_name(name),
                None => Type::void().with_name(name),
            },
            TypeInfo::Qualified { target } => match target {
                Some(target) => self.convert(target)?,
                None => Type::void(),
            },
            TypeInfo::Function => Type::function("function"),
            TypeInfo::Unknown => Type::void(),
        };

        self.converted.borrow_mut().insert(die, ty.clone());
        Ok(ty)
    }

    fn convert_fields(&self, fields: Vec<rbprobe_dwarf::FieldInfo>) -> Vec<Field> {
        fields
            .into_iter()
            .map(|f| Field {
                name: f.name,
                offset: f.offset,
                bit_field: f.bit_field.map(|b| (b.bit_offset, b.bit_size)),
                ty: match f.type_ref {
                    Some(die) => TypeHandle::Deferred(TypeRef(die.to_raw())),
                    None => TypeHandle::Resolved(Type::void()),
                },
            })
            .collect()
    }

    /// ポインタ表示名用に参照先の名前だけを求める（構造体の中身は展開しない）
    fn type_name(&self, die: DieRef) -> String {
        match self.index.type_info(die) {
            Ok(TypeInfo::Base { name, .. }) | Ok(TypeInfo::Typedef { name, .. }) => name,
            Ok(TypeInfo::Struct { name, .. }) => format!("struct {}", name.as_deref().unwrap_or("<anonymous>")),
            Ok(TypeInfo::Union { name, .. }) => format!("union {}", name.as_deref().unwrap_or("<anonymous>")),
            Ok(TypeInfo::Enum { name, .. }) => format!("enum {}", name.as_deref().unwrap_or("<anonymous>")),
            Ok(TypeInfo::Pointer { pointee: Some(target), .. }) => format!("{} *", self.type_name(target)),
            Ok(TypeInfo::Qualified { target: Some(target) }) => self.type_name(target),
            Ok(TypeInfo::Function) => "function".to_string(),
            _ => "void".to_string(),
        }
    }
}
