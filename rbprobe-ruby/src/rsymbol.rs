//! シンボルのデコード
//!
//! 即値のシンボルは `VALUE >> RUBY_SPECIAL_SHIFT` がIDです。名前はグローバルの
//! シンボル表 `ruby_global_symbols.ids`（512件ごとの配列の配列）から引きます。
//! ヒープ上の `T_SYMBOL`（動的シンボル）は `RSymbol.fstr` に名前を持ちます。

use crate::rarray::RArray;
use crate::rstring::RString;
use crate::runtime::Runtime;
use crate::Result;

/// `ids` の1エントリあたりのシリアル数
const ID_ENTRY_UNIT: u64 = 512;
/// シリアルごとのスロット数（シンボルと文字列）
const ID_ENTRY_SIZE: u64 = 2;

/// 即値のシンボルのID
pub fn static_id(rt: &Runtime<'_>, raw: u64) -> u64 {
    raw >> rt.constants().special_shift
}

/// IDからシンボル名を引く（キャッシュ付き）
pub fn id_to_name(rt: &Runtime<'_>, id: u64) -> Option<String> {
    rt.cached_symbol_name(id, || match lookup_name(rt, id) {
        Ok(name) => name,
        Err(e) => {
            tracing::debug!(id, "symbol lookup failed: {:#}", e);
            None
        }
    })
}

fn lookup_name(rt: &Runtime<'_>, id: u64) -> Result<Option<String>> {
    let c = rt.constants();
    let serial = if id > c.last_op_id { id >> c.id_scope_shift } else { id };

    let symbols = rt
        .global("ruby_global_symbols")
        .ok_or_else(|| anyhow::anyhow!("ruby_global_symbols is not available"))?;
    let last_id = if symbols.has_field("last_id") {
        symbols.field("last_id")?.as_u64()?
    } else {
        symbols.field("next_id")?.as_u64()?.saturating_sub(1)
    };
    if serial == 0 || serial > last_id {
        return Ok(None);
    }

    let ids = RArray::new(rt, symbols.field("ids")?.as_u64()?)?;
    let entry = RArray::new(rt, ids.get(serial / ID_ENTRY_UNIT)?)?;
    let name = entry.get((serial % ID_ENTRY_UNIT) * ID_ENTRY_SIZE)?;
    if !rt.is_type(name, crate::constants::RubyType::String) {
        return Ok(None);
    }
    Ok(Some(RString::new(rt, name)?.to_string_lossy()?))
}

/// 動的シンボル（`struct RSymbol`）
pub struct DynamicSymbol {
    pub id: u64,
    pub name: Option<String>,
}

/// ヒープ上のシンボルを読む
pub fn dynamic_symbol(rt: &Runtime<'_>, address: u64) -> Result<DynamicSymbol> {
    let rsymbol = rt.object(address, "struct RSymbol")?;
    let id = rsymbol.field("id")?.as_u64()?;
    let fstr = rsymbol.field("fstr")?.as_u64()?;
    let name = if rt.is_type(fstr, crate::constants::RubyType::String) {
        RString::new(rt, fstr)?.to_string_lossy().ok()
    } else {
        None
    };
    Ok(DynamicSymbol { id, name })
}

/// `:name`、名前が引けなければ `:id_0x..`
pub fn display_name(id: u64, name: Option<&str>) -> String {
    match name {
        Some(name) => format!(":{}", name),
        None => format!(":id_0x{:x}", id),
    }
}
