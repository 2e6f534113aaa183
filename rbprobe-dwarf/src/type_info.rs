//! DWARF型情報の抽出
//!
//! DWARF DIEから型情報（構造体フィールド、列挙子、配列長など）を1段だけ抽出します。
//! 参照先の型は `DieRef` として返すので、自己参照する構造体でも無限再帰しません。

use crate::{DieRef, Result};
use gimli::Reader;

/// 型情報
#[derive(Debug, Clone, PartialEq)]
pub enum TypeInfo {
    /// 基本型
    Base {
        name: String,
        size: u64,
        signed: bool,
        float: bool,
    },
    /// ポインタ型
    Pointer {
        pointee: Option<DieRef>,
        size: u64,
    },
    /// 配列型
    Array {
        element: Option<DieRef>,
        /// 長さ（フレキシブル配列メンバはNone）
        length: Option<u64>,
    },
    /// 構造体型
    Struct {
        name: Option<String>,
        size: u64,
        fields: Vec<FieldInfo>,
    },
    /// Union型
    Union {
        name: Option<String>,
        size: u64,
        fields: Vec<FieldInfo>,
    },
    /// 列挙型
    Enum {
        name: Option<String>,
        size: u64,
        variants: Vec<VariantInfo>,
    },
    /// typedef
    Typedef {
        name: String,
        target: Option<DieRef>,
    },
    /// const / volatile / restrict / atomic
    Qualified {
        target: Option<DieRef>,
    },
    /// 関数型
    Function,
    /// 不明な型
    Unknown,
}

/// ビットフィールド情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    /// `FieldInfo::offset` からのビットオフセット（LSB基準）
    pub bit_offset: u64,
    /// ビット幅
    pub bit_size: u64,
}

/// フィールド情報
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    /// フィールド名（無名のunion/structメンバは空文字列）
    pub name: String,
    /// オフセット（バイト）
    pub offset: u64,
    /// ビットフィールドの場合のビット位置
    pub bit_field: Option<BitField>,
    /// フィールドの型
    pub type_ref: Option<DieRef>,
}

/// 列挙子
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantInfo {
    /// 列挙子名
    pub name: String,
    /// 値
    pub value: i64,
}

/// 型情報抽出器
pub struct TypeInfoExtractor<'a, R: Reader> {
    dwarf: &'a gimli::Dwarf<R>,
    units: &'a [gimli::Unit<R>],
}

impl<'a, R: Reader<Offset = usize>> TypeInfoExtractor<'a, R> {
    /// 新しい型情報抽出器を作成する
    pub fn new(dwarf: &'a gimli::Dwarf<R>, units: &'a [gimli::Unit<R>]) -> Self {
        Self { dwarf, units }
    }

    /// 型DIEから型情報を抽出する
    pub fn extract(&self, die: DieRef) -> Result<TypeInfo> {
        let unit = self
            .units
            .get(die.unit)
            .ok_or_else(|| anyhow::anyhow!("Invalid DWARF unit index {}", die.unit))?;
        let mut entries = unit.entries_at_offset(gimli::UnitOffset(die.offset))?;

        match entries.next_dfs()? {
            Some((_, entry)) => self.extract_from_entry(die.unit, unit, entry),
            None => Ok(TypeInfo::Unknown),
        }
    }

    /// DIEエントリから型情報を抽出する
    fn extract_from_entry(
        &self,
        unit_index: usize,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<TypeInfo> {
        let target = self.type_ref(unit_index, entry);

        let info = match entry.tag() {
            gimli::DW_TAG_base_type => {
                let encoding = match entry.attr_value(gimli::DW_AT_encoding)? {
                    Some(gimli::AttributeValue::Encoding(encoding)) => Some(encoding),
                    _ => None,
                };
                TypeInfo::Base {
                    name: self.name(unit, entry).unwrap_or_else(|| "<unknown>".to_string()),
                    size: byte_size(entry).unwrap_or(0),
                    signed: matches!(
                        encoding,
                        Some(gimli::DW_ATE_signed) | Some(gimli::DW_ATE_signed_char)
                    ),
                    float: encoding == Some(gimli::DW_ATE_float),
                }
            }
            gimli::DW_TAG_pointer_type | gimli::DW_TAG_reference_type => TypeInfo::Pointer {
                pointee: target,
                size: byte_size(entry).unwrap_or(8),
            },
            gimli::DW_TAG_array_type => TypeInfo::Array {
                element: target,
                length: self.array_length(unit, entry)?,
            },
            gimli::DW_TAG_structure_type => TypeInfo::Struct {
                name: self.name(unit, entry),
                size: byte_size(entry).unwrap_or(0),
                fields: self.extract_fields(unit_index, unit, entry)?,
            },
            gimli::DW_TAG_union_type => TypeInfo::Union {
                name: self.name(unit, entry),
                size: byte_size(entry).unwrap_or(0),
                fields: self.extract_fields(unit_index, unit, entry)?,
            },
            gimli::DW_TAG_enumeration_type => TypeInfo::Enum {
                name: self.name(unit, entry),
                size: byte_size(entry).unwrap_or(4),
                variants: self.extract_variants(unit, entry)?,
            },
            gimli::DW_TAG_typedef => TypeInfo::Typedef {
                name: self.name(unit, entry).unwrap_or_default(),
                target,
            },
            gimli::DW_TAG_const_type
            | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_restrict_type
            | gimli::DW_TAG_atomic_type => TypeInfo::Qualified { target },
            gimli::DW_TAG_subroutine_type => TypeInfo::Function,
            _ => TypeInfo::Unknown,
        };

        Ok(info)
    }

    /// フィールドを抽出する
    fn extract_fields(
        &self,
        unit_index: usize,
        unit: &gimli::Unit<R>,
        parent_entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Vec<FieldInfo>> {
        let mut fields = Vec::new();
        let mut tree = unit.entries_tree(Some(parent_entry.offset()))?;
        let root = tree.root()?;

        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_member {
                continue;
            }

            let name = self.name(unit, entry).unwrap_or_default();
            let type_ref = self.type_ref(unit_index, entry);
            let bit_size = entry.attr_value(gimli::DW_AT_bit_size)?.and_then(|v| v.udata_value());
            let data_bit_offset = entry
                .attr_value(gimli::DW_AT_data_bit_offset)?
                .and_then(|v| v.udata_value());

            let (offset, bit_field) = match (bit_size, data_bit_offset) {
                // DWARF4以降: 構造体先頭からのビット位置
                (Some(bit_size), Some(bits)) => (
                    bits / 8,
                    Some(BitField {
                        bit_offset: bits % 8,
                        bit_size,
                    }),
                ),
                // DWARF2/3: 格納単位のMSBからのビット位置
                (Some(bit_size), None) => {
                    let base = self.data_member_location(unit, entry)?.unwrap_or(0);
                    let storage = byte_size(entry).unwrap_or(4);
                    let msb_offset = entry
                        .attr_value(gimli::DW_AT_bit_offset)?
                        .and_then(|v| v.udata_value())
                        .unwrap_or(0);
                    let lsb_offset = (storage * 8).saturating_sub(msb_offset + bit_size);
                    (
                        base,
                        Some(BitField {
                            bit_offset: lsb_offset,
                            bit_size,
                        }),
                    )
                }
                _ => (self.data_member_location(unit, entry)?.unwrap_or(0), None),
            };

            fields.push(FieldInfo {
                name,
                offset,
                bit_field,
                type_ref,
            });
        }

        Ok(fields)
    }

    /// 列挙子を抽出する
    fn extract_variants(
        &self,
        unit: &gimli::Unit<R>,
        parent_entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Vec<VariantInfo>> {
        let mut variants = Vec::new();
        let mut tree = unit.entries_tree(Some(parent_entry.offset()))?;
        let root = tree.root()?;

        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_enumerator {
                continue;
            }
            if let (Some(name), Some(value)) = (self.name(unit, entry), const_value(entry)) {
                variants.push(VariantInfo { name, value });
            }
        }

        Ok(variants)
    }

    /// 配列長をDW_TAG_subrange_typeから取得する
    fn array_length(
        &self,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Option<u64>> {
        let mut tree = unit.entries_tree(Some(entry.offset()))?;
        let root = tree.root()?;

        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_subrange_type {
                continue;
            }
            if let Some(count) = entry.attr_value(gimli::DW_AT_count)?.and_then(|v| v.udata_value()) {
                return Ok(Some(count));
            }
            return Ok(match entry.attr_value(gimli::DW_AT_upper_bound)? {
                Some(gimli::AttributeValue::Sdata(bound)) if bound >= 0 => Some(bound as u64 + 1),
                Some(gimli::AttributeValue::Sdata(_)) => None,
                Some(value) => value.udata_value().map(|bound| bound.wrapping_add(1)),
                None => None,
            });
        }

        Ok(None)
    }

    /// 名前を取得する（DW_FORM_strp等の間接参照にも対応）
    pub fn name(&self, unit: &gimli::Unit<R>, entry: &gimli::DebuggingInformationEntry<R>) -> Option<String> {
        let attr = entry.attr_value(gimli::DW_AT_name).ok()??;
        let name = self.dwarf.attr_string(unit, attr).ok()?;
        let name = name.to_string_lossy().ok()?.into_owned();
        Some(name)
    }

    /// 型参照を取得する
    pub fn type_ref(
        &self,
        unit_index: usize,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Option<DieRef> {
        match entry.attr_value(gimli::DW_AT_type).ok()?? {
            gimli::AttributeValue::UnitRef(offset) => Some(DieRef {
                unit: unit_index,
                offset: offset.0,
            }),
            gimli::AttributeValue::DebugInfoRef(offset) => {
                // 別のユニットへの参照
                self.units.iter().enumerate().find_map(|(index, candidate)| {
                    offset.to_unit_offset(&candidate.header).map(|unit_offset| DieRef {
                        unit: index,
                        offset: unit_offset.0,
                    })
                })
            }
            _ => None,
        }
    }

    /// データメンバのロケーション（オフセット）を取得する
    fn data_member_location(
        &self,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Option<u64>> {
        let Some(attr) = entry.attr_value(gimli::DW_AT_data_member_location)? else {
            return Ok(None);
        };

        if let Some(offset) = attr.udata_value() {
            return Ok(Some(offset));
        }

        // 古いDWARFでは DW_OP_plus_uconst 式で表現される
        if let gimli::AttributeValue::Exprloc(expr) = attr {
            let mut ops = expr.operations(unit.encoding());
            if let Some(gimli::Operation::PlusConstant { value }) = ops.next()? {
                return Ok(Some(value));
            }
        }

        Ok(None)
    }
}

/// バイトサイズを取得する
fn byte_size<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>) -> Option<u64> {
    entry.attr_value(gimli::DW_AT_byte_size).ok()??.udata_value()
}

/// 列挙子の値を取得する
///
/// DW_FORM_dataN は符号なしとして扱い、負の値は DW_FORM_sdata で表現されている前提
pub(crate) fn const_value<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>) -> Option<i64> {
    match entry.attr_value(gimli::DW_AT_const_value).ok()?? {
        gimli::AttributeValue::Sdata(value) => Some(value),
        other => other.udata_value().map(|value| value as i64),
    }
}
