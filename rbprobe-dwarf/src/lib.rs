//! rbprobe DWARF デバッグ情報解析
//!
//! このクレートは、ELFファイルとDWARFデバッグ情報の解析機能を提供します。
//! シンボル名の解決、型・列挙子・グローバル変数の索引、アドレスからソース行への変換を行います。

pub mod loader;
pub mod symbols;
pub mod lines;
pub mod type_info;
pub mod index;

pub use loader::DwarfLoader;
pub use symbols::{Symbol, SymbolResolver};
pub use lines::{LineInfo, LineInfoProvider};
pub use type_info::{BitField, FieldInfo, TypeInfo, TypeInfoExtractor, VariantInfo};
pub use index::{DwarfIndex, GlobalVariable};

/// DWARFセクションのリーダー型
pub type DwarfSlice = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;

/// DIEへの参照（コンパイル単位のインデックスとユニット内オフセット）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DieRef {
    pub unit: usize,
    pub offset: usize,
}

impl DieRef {
    /// 1つの整数にまとめる
    pub fn to_raw(self) -> u64 {
        ((self.unit as u64) << 40) | (self.offset as u64 & 0xff_ffff_ffff)
    }

    /// `to_raw` の逆変換
    pub fn from_raw(raw: u64) -> Self {
        Self {
            unit: (raw >> 40) as usize,
            offset: (raw & 0xff_ffff_ffff) as usize,
        }
    }
}
