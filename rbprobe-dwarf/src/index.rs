//! DWARF名前索引
//!
//! 全コンパイル単位を一度だけ走査し、型名・列挙子・グローバル変数からDIEへの索引を作ります。
//! 型の中身は必要になったときに `TypeInfoExtractor` で1段ずつ取り出します。

use crate::type_info::const_value;
use crate::{DieRef, DwarfLoader, DwarfSlice, Result, TypeInfo, TypeInfoExtractor};
use std::collections::HashMap;

/// グローバル変数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalVariable {
    pub name: String,
    /// ファイル内アドレス（ロードバイアス未適用）
    pub address: u64,
    pub type_ref: Option<DieRef>,
}

/// 索引に登録された型DIE
#[derive(Debug, Clone, Copy)]
struct TypeEntry {
    die: DieRef,
    declaration: bool,
}

/// DWARF名前索引
pub struct DwarfIndex {
    dwarf: gimli::Dwarf<DwarfSlice>,
    units: Vec<gimli::Unit<DwarfSlice>>,
    /// "struct RBasic", "VALUE", "enum ruby_value_type" など -> DIE
    types: HashMap<String, TypeEntry>,
    /// 列挙子名 -> 値（C言語と同じくグローバル名前空間）
    enumerators: HashMap<String, i64>,
    /// (列挙型名, 列挙子名) -> 値
    enum_members: HashMap<(String, String), i64>,
    /// グローバル変数
    variables: HashMap<String, GlobalVariable>,
}

impl DwarfIndex {
    /// ローダーから索引を構築する
    pub fn build(loader: &DwarfLoader) -> Result<Self> {
        let dwarf = loader.build_dwarf()?;

        let mut units = Vec::new();
        let mut headers = dwarf.units();
        while let Some(header) = headers.next()? {
            units.push(dwarf.unit(header)?);
        }

        let mut index = Self {
            dwarf,
            units,
            types: HashMap::new(),
            enumerators: HashMap::new(),
            enum_members: HashMap::new(),
            variables: HashMap::new(),
        };
        index.scan_units()?;

        tracing::debug!(
            units = index.units.len(),
            types = index.types.len(),
            enumerators = index.enumerators.len(),
            variables = index.variables.len(),
            "built DWARF index"
        );

        Ok(index)
    }

    /// 全ユニットを走査して索引を埋める
    fn scan_units(&mut self) -> Result<()> {
        let mut types = HashMap::new();
        let mut enumerators = HashMap::new();
        let mut enum_members = HashMap::new();
        let mut variables = HashMap::new();
        let extractor = TypeInfoExtractor::new(&self.dwarf, &self.units);

        for (unit_index, unit) in self.units.iter().enumerate() {
            let mut entries = unit.entries();
            let mut depth: isize = 0;
            // 現在処理中の列挙型（深さ, 名前）
            let mut current_enum: Option<(isize, Option<String>)> = None;

            while let Some((delta, entry)) = entries.next_dfs()? {
                depth += delta;

                if matches!(current_enum, Some((enum_depth, _)) if depth <= enum_depth) {
                    current_enum = None;
                }

                let die = DieRef {
                    unit: unit_index,
                    offset: entry.offset().0,
                };
                let declaration = matches!(
                    entry.attr_value(gimli::DW_AT_declaration)?,
                    Some(gimli::AttributeValue::Flag(true))
                );

                match entry.tag() {
                    gimli::DW_TAG_structure_type
                    | gimli::DW_TAG_union_type
                    | gimli::DW_TAG_enumeration_type
                    | gimli::DW_TAG_typedef
                    | gimli::DW_TAG_base_type => {
                        let name = extractor.name(unit, entry);

                        if entry.tag() == gimli::DW_TAG_enumeration_type {
                            current_enum = Some((depth, name.clone()));
                        }

                        let Some(name) = name else { continue };
                        let key = match entry.tag() {
                            gimli::DW_TAG_structure_type => format!("struct {}", name),
                            gimli::DW_TAG_union_type => format!("union {}", name),
                            gimli::DW_TAG_enumeration_type => format!("enum {}", name),
                            _ => name,
                        };

                        // 宣言のみのDIEは定義で上書きする
                        let replace = match types.get(&key) {
                            None => true,
                            Some(TypeEntry { declaration: existing, .. }) => *existing && !declaration,
                        };
                        if replace {
                            types.insert(key, TypeEntry { die, declaration });
                        }
                    }
                    gimli::DW_TAG_enumerator => {
                        let Some((enum_depth, enum_name)) = &current_enum else { continue };
                        if depth != *enum_depth + 1 {
                            continue;
                        }
                        if let (Some(name), Some(value)) = (extractor.name(unit, entry), const_value(entry)) {
                            if let Some(enum_name) = enum_name {
                                enum_members.insert((enum_name.clone(), name.clone()), value);
                            }
                            enumerators.entry(name).or_insert(value);
                        }
                    }
                    gimli::DW_TAG_variable => {
                        if let Some(variable) = self.extract_variable(&extractor, unit_index, unit, entry)? {
                            variables.entry(variable.name.clone()).or_insert(variable);
                        }
                    }
                    _ => {}
                }
            }
        }

        self.types = types;
        self.enumerators = enumerators;
        self.enum_members = enum_members;
        self.variables = variables;
        Ok(())
    }

    /// 静的アドレスを持つ変数DIEを取り出す
    ///
    /// 定義DIEは名前と型を DW_AT_specification 先の宣言DIEに持つことがある
    fn extract_variable(
        &self,
        extractor: &TypeInfoExtractor<'_, DwarfSlice>,
        unit_index: usize,
        unit: &gimli::Unit<DwarfSlice>,
        entry: &gimli::DebuggingInformationEntry<DwarfSlice>,
    ) -> Result<Option<GlobalVariable>> {
        let Some(gimli::AttributeValue::Exprloc(expr)) = entry.attr_value(gimli::DW_AT_location)? else {
            return Ok(None);
        };
        let mut ops = expr.operations(unit.encoding());
        let address = match ops.next() {
            Ok(Some(gimli::Operation::Address { address })) => address,
            _ => return Ok(None),
        };

        let mut name = extractor.name(unit, entry);
        let mut type_ref = extractor.type_ref(unit_index, entry);

        if name.is_none() || type_ref.is_none() {
            if let Some(gimli::AttributeValue::UnitRef(spec)) = entry.attr_value(gimli::DW_AT_specification)? {
                let mut spec_entries = unit.entries_at_offset(spec)?;
                if let Some((_, spec_entry)) = spec_entries.next_dfs()? {
                    name = name.or_else(|| extractor.name(unit, spec_entry));
                    type_ref = type_ref.or_else(|| extractor.type_ref(unit_index, spec_entry));
                }
            }
        }

        Ok(name.map(|name| GlobalVariable {
            name,
            address,
            type_ref,
        }))
    }

    /// 型名からDIEを検索する
    ///
    /// "struct X" のように種別付きの名前と、typedef/基本型の素の名前を受け付けます。
    pub fn find_type(&self, name: &str) -> Option<DieRef> {
        let name = name.trim();
        if let Some(entry) = self.types.get(name) {
            return Some(entry.die);
        }
        // 種別なしで構造体を指定された場合
        ["struct ", "union ", "enum "]
            .iter()
            .find_map(|prefix| self.types.get(&format!("{}{}", prefix, name)))
            .map(|entry| entry.die)
    }

    /// DIEの型情報を1段だけ取り出す
    pub fn type_info(&self, die: DieRef) -> Result<TypeInfo> {
        TypeInfoExtractor::new(&self.dwarf, &self.units).extract(die)
    }

    /// 列挙子の値を取得する（列挙型名を省略するとグローバル名前空間から探す）
    pub fn enumerator(&self, enum_name: Option<&str>, member: &str) -> Option<i64> {
        match enum_name {
            Some(enum_name) => {
                let enum_name = enum_name.trim_start_matches("enum ").to_string();
                self.enum_members.get(&(enum_name, member.to_string())).copied()
            }
            None => self.enumerators.get(member).copied(),
        }
    }

    /// グローバル変数を取得する
    pub fn variable(&self, name: &str) -> Option<&GlobalVariable> {
        self.variables.get(name)
    }

    /// コンパイル単位の数
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }
}
